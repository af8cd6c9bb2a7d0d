//! The build graph: files (nodes) and builds (edges), cross-referenced by
//! compact ids into two arenas that live for the process lifetime.

use crate::densemap::{self, DenseMap};
use crate::fs::{FileSystem, MTime};
use std::collections::HashMap;
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(usize);

impl densemap::Index for FileId {
    fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for FileId {
    fn from(u: usize) -> FileId {
        FileId(u)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BuildId(usize);

impl densemap::Index for BuildId {
    fn index(&self) -> usize {
        self.0
    }
}

impl From<usize> for BuildId {
    fn from(u: usize) -> BuildId {
        BuildId(u)
    }
}

/// A file path participating in the graph.
#[derive(Debug)]
pub struct File {
    /// Canonical path, forward slashes.
    pub name: String,
    /// Which separators were originally backslashes; see canon.
    pub slash_bits: u64,
    /// The build that produces this file, if any.  At most one; a second
    /// producer is a manifest error.
    pub input: Option<BuildId>,
    /// Builds that consume this file, for readiness propagation.
    pub dependents: Vec<BuildId>,
}

/// Where an edge was declared, for diagnostics.
#[derive(Debug, Clone)]
pub struct FileLoc {
    pub filename: Rc<PathBuf>,
    pub line: usize,
}

impl std::fmt::Display for FileLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.filename.display(), self.line)
    }
}

#[derive(Debug, Clone, Hash)]
pub struct RspFile {
    pub path: PathBuf,
    pub content: String,
}

/// How discovered dependencies are communicated by the rule's command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepsStyle {
    #[default]
    None,
    /// A Makefile-syntax depfile written by the command.
    Gcc,
    /// `/showIncludes` lines in the command's own output.
    Msvc,
}

/// A single rule invocation: produces outputs from inputs by running one
/// command.  Phony edges have no command.
///
/// Inputs are stored in one Vec segmented as
///   [explicit..][implicit..][order-only..][validation..]
/// with counts marking the boundaries; dependencies discovered via depfiles
/// or the deps log are kept separately because they change between builds.
#[derive(Debug)]
pub struct Build {
    pub location: FileLoc,

    /// User-facing description, if the rule provided one.
    pub desc: Option<String>,
    /// Fully-evaluated command line, or None for phony edges.
    pub cmdline: Option<String>,
    /// Path to the depfile the command writes, when deps = gcc.
    pub depfile: Option<String>,
    /// Response file written before running, removed after success.
    pub rspfile: Option<RspFile>,
    pub deps_style: DepsStyle,
    /// Prefix marking include lines in output, when deps = msvc.
    pub msvc_deps_prefix: Option<String>,
    /// Dyndep file whose contents extend this edge mid-build.
    pub dyndep: Option<FileId>,
    /// Set once the dyndep file has been loaded and applied.
    pub dyndep_loaded: bool,
    /// Pool name; empty string is the default unbounded pool.
    pub pool: String,
    pub generator: bool,
    pub restat: bool,

    ins: Vec<FileId>,
    explicit_ins: usize,
    implicit_ins: usize,
    order_only_ins: usize,
    discovered_ins: Vec<FileId>,

    outs: Vec<FileId>,
    explicit_outs: usize,
}

impl Build {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        location: FileLoc,
        ins: Vec<FileId>,
        explicit_ins: usize,
        implicit_ins: usize,
        order_only_ins: usize,
        outs: Vec<FileId>,
        explicit_outs: usize,
    ) -> Self {
        Build {
            location,
            desc: None,
            cmdline: None,
            depfile: None,
            rspfile: None,
            deps_style: DepsStyle::default(),
            msvc_deps_prefix: None,
            dyndep: None,
            dyndep_loaded: false,
            pool: String::new(),
            generator: false,
            restat: false,
            ins,
            explicit_ins,
            implicit_ins,
            order_only_ins,
            discovered_ins: Vec::new(),
            outs,
            explicit_outs,
        }
    }

    pub fn is_phony(&self) -> bool {
        self.cmdline.is_none()
    }

    pub fn explicit_ins(&self) -> &[FileId] {
        &self.ins[0..self.explicit_ins]
    }

    /// Inputs whose freshness makes this build dirty: explicit, implicit, and
    /// discovered, but not order-only and not validations.
    pub fn dirtying_ins(&self) -> impl Iterator<Item = FileId> + '_ {
        self.ins[0..self.explicit_ins + self.implicit_ins]
            .iter()
            .chain(self.discovered_ins.iter())
            .copied()
    }

    /// Inputs that must be brought up to date before this build may run:
    /// everything except validations.
    pub fn depend_ins(&self) -> impl Iterator<Item = FileId> + '_ {
        let n = self.explicit_ins + self.implicit_ins + self.order_only_ins;
        self.ins[0..n]
            .iter()
            .chain(self.discovered_ins.iter())
            .copied()
    }

    pub fn order_only_ins(&self) -> &[FileId] {
        let start = self.explicit_ins + self.implicit_ins;
        &self.ins[start..start + self.order_only_ins]
    }

    /// Targets that must be built whenever this build runs, but that do not
    /// feed it.
    pub fn validation_ins(&self) -> &[FileId] {
        &self.ins[self.explicit_ins + self.implicit_ins + self.order_only_ins..]
    }

    pub fn discovered_ins(&self) -> &[FileId] {
        &self.discovered_ins
    }

    pub fn outs(&self) -> &[FileId] {
        &self.outs
    }

    pub fn explicit_outs(&self) -> &[FileId] {
        &self.outs[0..self.explicit_outs]
    }

    /// Extend the implicit input section, as directed by a dyndep file.
    fn add_implicit_ins(&mut self, new_ins: &[FileId]) {
        let at = self.explicit_ins + self.implicit_ins;
        for (i, &id) in new_ins.iter().enumerate() {
            self.ins.insert(at + i, id);
        }
        self.implicit_ins += new_ins.len();
    }
}

/// The set of files and builds, keyed by canonicalized path.
#[derive(Debug, Default)]
pub struct Graph {
    pub files: DenseMap<FileId, File>,
    pub builds: DenseMap<BuildId, Build>,
    by_name: HashMap<String, FileId>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    /// Look up a file by canonical name, adding it if unknown.
    pub fn file_id(&mut self, name: impl Into<String>, slash_bits: u64) -> FileId {
        let name = name.into();
        match self.by_name.get(&name) {
            Some(&id) => id,
            None => {
                let id = self.files.push(File {
                    name: name.clone(),
                    slash_bits,
                    input: None,
                    dependents: Vec::new(),
                });
                self.by_name.insert(name, id);
                id
            }
        }
    }

    pub fn lookup_file_id(&self, name: &str) -> Option<FileId> {
        self.by_name.get(name).copied()
    }

    pub fn file(&self, id: FileId) -> &File {
        self.files.get(id)
    }

    pub fn build(&self, id: BuildId) -> &Build {
        self.builds.get(id)
    }

    pub fn build_mut(&mut self, id: BuildId) -> &mut Build {
        self.builds.get_mut(id)
    }

    /// Add a new build, linking its outputs and inputs.
    pub fn add_build(&mut self, build: Build) -> anyhow::Result<BuildId> {
        let id = self.builds.next_id();
        for &out in build.outs() {
            let file = self.files.get_mut(out);
            if let Some(prev) = file.input {
                anyhow::bail!(
                    "multiple rules generate {} (first declared at {})",
                    file.name,
                    self.builds.get(prev).location
                );
            }
            file.input = Some(id);
        }
        for in_id in build.depend_ins() {
            let dependents = &mut self.files.get_mut(in_id).dependents;
            if !dependents.contains(&id) {
                dependents.push(id);
            }
        }
        self.builds.push(build);
        Ok(id)
    }

    /// Replace a build's discovered dependencies, filtering out files that
    /// are already static inputs.  Returns whether anything changed.
    pub fn update_discovered(&mut self, id: BuildId, mut deps: Vec<FileId>) -> bool {
        let build = self.builds.get(id);
        deps.retain(|dep| !build.ins.contains(dep));
        if deps == build.discovered_ins {
            return false;
        }
        for &dep in &deps {
            let dependents = &mut self.files.get_mut(dep).dependents;
            if !dependents.contains(&id) {
                dependents.push(id);
            }
        }
        self.builds.get_mut(id).discovered_ins = deps;
        true
    }

    /// Attach dyndep-discovered implicit inputs to a build.
    pub fn add_dyndep_ins(&mut self, id: BuildId, new_ins: &[FileId]) {
        for &in_id in new_ins {
            let dependents = &mut self.files.get_mut(in_id).dependents;
            if !dependents.contains(&id) {
                dependents.push(id);
            }
        }
        self.builds.get_mut(id).add_implicit_ins(new_ins);
    }

    /// Attach dyndep-discovered implicit outputs to a build.
    pub fn add_dyndep_outs(&mut self, id: BuildId, new_outs: &[FileId]) -> anyhow::Result<()> {
        for &out in new_outs {
            let file = self.files.get_mut(out);
            if let Some(prev) = file.input {
                if prev != id {
                    anyhow::bail!(
                        "multiple rules generate {} (first declared at {})",
                        file.name,
                        self.builds.get(prev).location
                    );
                }
                continue;
            }
            file.input = Some(id);
            self.builds.get_mut(id).outs.push(out);
        }
        Ok(())
    }
}

/// Per-file state accumulated during a single build: cached stat results.
pub struct FileState(DenseMap<FileId, Option<MTime>>);

impl FileState {
    pub fn new(graph: &Graph) -> Self {
        FileState(DenseMap::new_sized(graph.files.next_id(), None))
    }

    pub fn get(&self, id: FileId) -> Option<MTime> {
        self.0.lookup_or(id, None)
    }

    pub fn set(&mut self, id: FileId, mtime: MTime) {
        self.0.set_grow(id, Some(mtime), None);
    }

    /// stat() the file and update the cache.
    pub fn restat(
        &mut self,
        id: FileId,
        fs: &dyn FileSystem,
        path: &str,
    ) -> std::io::Result<MTime> {
        let mtime = fs.stat(path)?;
        self.set(id, mtime);
        Ok(mtime)
    }
}
