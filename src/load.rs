//! Loads the graph from manifest files: drives the parser statement by
//! statement, resolving variable scopes, rules, and pools, and interning
//! paths into the graph.

use crate::{
    build_log,
    canon::canon_path_fast,
    deps_log,
    eval::{Env, EvalString, Vars},
    graph::{Build, DepsStyle, FileId, FileLoc, Graph, RspFile},
    parse::{self, Statement},
    scanner::{self, ParseError},
    smallmap::SmallMap,
    trace,
};
use anyhow::anyhow;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A rule's unexpanded bindings, as declared in its block.
type Rule = SmallMap<String, EvalString<String>>;

/// Quote a path for inclusion in a shell command, as done when expanding
/// `$in` and `$out` inside `command` and `rspfile_content`.
fn shell_escape(s: &str) -> Cow<str> {
    if !s.is_empty()
        && s.bytes().all(|c| {
            matches!(c, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9'
                | b'_' | b'-' | b'+' | b'.' | b'/' | b',' | b'@' | b'=' | b':')
        })
    {
        return Cow::Borrowed(s);
    }
    if cfg!(windows) {
        Cow::Owned(format!("\"{}\"", s.replace('"', "\\\"")))
    } else {
        Cow::Owned(format!("'{}'", s.replace('\'', "'\\''")))
    }
}

/// The `$in`/`$out`/`$in_newline` bindings synthesized for one edge.
struct ImplicitVars {
    in_plain: String,
    in_escaped: String,
    in_newline: String,
    out_plain: String,
    out_escaped: String,
}

impl ImplicitVars {
    fn new(graph: &Graph, ins: &[FileId], outs: &[FileId]) -> Self {
        let name = |&id: &FileId| graph.file(id).name.as_str();
        let join = |ids: &[FileId], sep: &str, escape: bool| {
            ids.iter()
                .map(name)
                .map(|s| {
                    if escape {
                        shell_escape(s).into_owned()
                    } else {
                        s.to_owned()
                    }
                })
                .collect::<Vec<_>>()
                .join(sep)
        };
        ImplicitVars {
            in_plain: join(ins, " ", false),
            in_escaped: join(ins, " ", true),
            in_newline: join(ins, "\n", false),
            out_plain: join(outs, " ", false),
            out_escaped: join(outs, " ", true),
        }
    }
}

/// Edge-scope view of ImplicitVars; command-like bindings see the
/// shell-escaped spellings.
struct EdgeScope<'a> {
    vars: &'a ImplicitVars,
    escaped: bool,
}

impl Env for EdgeScope<'_> {
    fn get_var(&self, var: &str) -> Option<Cow<str>> {
        let v = self.vars;
        match var {
            "in" => Some(if self.escaped { &v.in_escaped } else { &v.in_plain }),
            "out" => Some(if self.escaped { &v.out_escaped } else { &v.out_plain }),
            "in_newline" => Some(&v.in_newline),
            _ => None,
        }
        .map(|s| Cow::Borrowed(s.as_str()))
    }
}

/// Evaluate and canonicalize a list of path expressions, interning each into
/// the graph.
fn intern_paths(
    graph: &mut Graph,
    envs: &[&dyn Env],
    evals: Vec<EvalString<&str>>,
) -> Vec<FileId> {
    evals
        .into_iter()
        .map(|eval| {
            let mut path = eval.evaluate(envs);
            let slash_bits = canon_path_fast(&mut path);
            graph.file_id(path, slash_bits)
        })
        .collect()
}

#[derive(Debug)]
pub struct Loader {
    pub graph: Graph,
    pub default: Vec<FileId>,
    rules: SmallMap<String, Rule>,
    pools: SmallMap<String, usize>,
    vars: Vars,
}

impl Loader {
    pub fn new() -> Self {
        let mut loader = Loader {
            graph: Graph::new(),
            default: Vec::new(),
            rules: SmallMap::default(),
            pools: SmallMap::default(),
            vars: Vars::default(),
        };
        // The one built-in rule and the one built-in pool.
        loader.rules.insert("phony".to_owned(), Rule::default());
        loader.pools.insert("console".to_owned(), 1);
        loader
    }

    /// Canonicalize a path and intern it into the graph.
    pub fn path(&mut self, mut path: String) -> FileId {
        let slash_bits = canon_path_fast(&mut path);
        self.graph.file_id(path, slash_bits)
    }

    /// Read and parse a manifest file already interned in the graph.
    pub fn read_file(&mut self, id: FileId) -> anyhow::Result<()> {
        let path = PathBuf::from(self.graph.file(id).name.clone());
        let bytes = scanner::read_file_with_nul(&path)
            .map_err(|err| anyhow!("read {}: {}", path.display(), err))?;
        self.parse(path, &bytes)
    }

    /// Parse one manifest buffer, recursing into include/subninja.
    pub fn parse(&mut self, path: PathBuf, bytes: &[u8]) -> anyhow::Result<()> {
        let filename = Rc::new(path);
        let mut parser = parse::Parser::new(bytes);
        loop {
            let stmt = match parser
                .read()
                .map_err(|err| anyhow!(parser.format_parse_error(&filename, err)))?
            {
                None => break,
                Some(stmt) => stmt,
            };
            let result = match stmt {
                Statement::VarDef(def) => {
                    let val = def.value.evaluate(&[&self.vars]);
                    self.vars.insert(def.name.to_owned(), val);
                    Ok(())
                }
                Statement::Rule(rule) => self.add_rule(rule),
                Statement::Pool(pool) => self.add_pool(pool),
                Statement::Default(def) => self.add_default(def),
                Statement::Build(build) => self.add_build(&filename, build),
                Statement::Include(path) => {
                    let id = self.path(path.evaluate(&[&self.vars]));
                    self.read_file(id)?;
                    Ok(())
                }
                Statement::Subninja(path) => {
                    let id = self.path(path.evaluate(&[&self.vars]));
                    // A subninja sees the enclosing scope but its own
                    // definitions do not leak back out.
                    let saved_vars = self.vars.clone();
                    let saved_rules = self.rules.clone();
                    let result = self.read_file(id);
                    self.vars = saved_vars;
                    self.rules = saved_rules;
                    result?;
                    Ok(())
                }
            };
            result.map_err(|err| anyhow!(parser.format_parse_error(&filename, err)))?;
        }
        Ok(())
    }

    fn add_rule(&mut self, rule: parse::Rule) -> Result<(), ParseError> {
        if self.rules.contains_key(rule.name) {
            return Err(ParseError {
                msg: format!("duplicate rule '{}'", rule.name),
                ofs: rule.ofs,
            });
        }
        let mut vars = Rule::default();
        for (name, val) in rule.vars.into_iter() {
            vars.insert(name.to_owned(), val.into_owned());
        }
        self.rules.insert(rule.name.to_owned(), vars);
        Ok(())
    }

    fn add_pool(&mut self, pool: parse::Pool) -> Result<(), ParseError> {
        if self.pools.contains_key(pool.name) {
            return Err(ParseError {
                msg: format!("duplicate pool '{}'", pool.name),
                ofs: pool.ofs,
            });
        }
        self.pools.insert(pool.name.to_owned(), pool.depth);
        Ok(())
    }

    fn add_default(&mut self, default: parse::Default) -> Result<(), ParseError> {
        for file in default.files {
            let name = crate::canon::canon_path(file.evaluate(&[&self.vars]));
            match self.graph.lookup_file_id(&name) {
                Some(id) => self.default.push(id),
                None => {
                    return Err(ParseError {
                        msg: format!("unknown target '{}'", name),
                        ofs: default.ofs,
                    })
                }
            }
        }
        Ok(())
    }

    fn add_build(&mut self, filename: &Rc<PathBuf>, stmt: parse::Build) -> Result<(), ParseError> {
        let parse::Build {
            rule,
            line,
            ofs,
            outs,
            explicit_outs,
            ins,
            explicit_ins,
            implicit_ins,
            order_only_ins,
            vars,
            ..
        } = stmt;

        let rule_vars = match self.rules.get(rule) {
            Some(rule_vars) => rule_vars,
            None => {
                return Err(ParseError {
                    msg: format!("unknown rule '{}'", rule),
                    ofs,
                })
            }
        };
        let is_phony = rule == "phony";

        // Evaluate the edge's own bindings, in order, each seeing the ones
        // before it plus the file scope.
        let mut build_vars = SmallMap::<&str, String>::default();
        for (name, val) in vars.iter() {
            let val = val.evaluate(&[&build_vars, &self.vars]);
            build_vars.insert(name, val);
        }

        // Paths on the build line are evaluated in the same scope.
        let path_envs: [&dyn Env; 2] = [&build_vars, &self.vars];
        let out_ids = intern_paths(&mut self.graph, &path_envs, outs);
        let mut in_ids = intern_paths(&mut self.graph, &path_envs, ins);
        let mut implicit_ins = implicit_ins;

        if out_ids.is_empty() {
            return Err(ParseError {
                msg: "expected output path".to_owned(),
                ofs,
            });
        }

        let implicit_vars = ImplicitVars::new(
            &self.graph,
            &in_ids[..explicit_ins],
            &out_ids[..explicit_outs],
        );
        let escaped = EdgeScope {
            vars: &implicit_vars,
            escaped: true,
        };
        let plain = EdgeScope {
            vars: &implicit_vars,
            escaped: false,
        };
        let lookup = |key: &str, escape: bool| -> Option<String> {
            if let Some(val) = build_vars.get(key) {
                return Some(val.clone());
            }
            let scope: &dyn Env = if escape { &escaped } else { &plain };
            rule_vars
                .get(key)
                .map(|val| val.evaluate(&[&build_vars, scope, rule_vars, &self.vars]))
        };

        let cmdline = if is_phony {
            None
        } else {
            match lookup("command", true) {
                Some(command) if !command.is_empty() => Some(command),
                _ => {
                    return Err(ParseError {
                        msg: format!("rule '{}' has no command", rule),
                        ofs,
                    })
                }
            }
        };

        let deps_style = match lookup("deps", false).as_deref() {
            None | Some("") => DepsStyle::None,
            Some("gcc") => DepsStyle::Gcc,
            Some("msvc") => DepsStyle::Msvc,
            Some(other) => {
                return Err(ParseError {
                    msg: format!("unknown deps style '{}'", other),
                    ofs,
                })
            }
        };

        let rspfile = match (lookup("rspfile", false), lookup("rspfile_content", true)) {
            (None, None) => None,
            (Some(path), Some(content)) => Some(RspFile {
                path: PathBuf::from(path),
                content,
            }),
            _ => {
                return Err(ParseError {
                    msg: "rspfile and rspfile_content need each other".to_owned(),
                    ofs,
                })
            }
        };

        let pool = lookup("pool", false).unwrap_or_default();
        if !pool.is_empty() && !self.pools.contains_key(pool.as_str()) {
            return Err(ParseError {
                msg: format!("unknown pool '{}'", pool),
                ofs,
            });
        }

        let dyndep = match lookup("dyndep", false) {
            None => None,
            Some(path) => {
                let mut path = path;
                let slash_bits = canon_path_fast(&mut path);
                let id = self.graph.file_id(path, slash_bits);
                // The dyndep file gates this edge, so make sure it is an
                // input; an implicit one if not otherwise listed.
                let gating = explicit_ins + implicit_ins + order_only_ins;
                if !in_ids[..gating].contains(&id) {
                    in_ids.insert(explicit_ins + implicit_ins, id);
                    implicit_ins += 1;
                }
                Some(id)
            }
        };

        let truthy = |key: &str| lookup(key, false).map_or(false, |val| !val.is_empty());
        let restat = truthy("restat");
        let generator = truthy("generator");
        let desc = lookup("description", false).filter(|desc| !desc.is_empty());
        let depfile = lookup("depfile", false).filter(|path| !path.is_empty());
        let msvc_deps_prefix = lookup("msvc_deps_prefix", false);

        let mut build = Build::new(
            FileLoc {
                filename: filename.clone(),
                line,
            },
            in_ids,
            explicit_ins,
            implicit_ins,
            order_only_ins,
            out_ids,
            explicit_outs,
        );
        build.cmdline = cmdline;
        build.desc = desc;
        build.depfile = depfile;
        build.rspfile = rspfile;
        build.deps_style = deps_style;
        build.msvc_deps_prefix = msvc_deps_prefix;
        build.dyndep = dyndep;
        build.pool = pool;
        build.restat = restat;
        build.generator = generator;

        self.graph
            .add_build(build)
            .map_err(|err| ParseError {
                msg: err.to_string(),
                ofs,
            })?;
        Ok(())
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything loaded at startup: the graph plus the opened logs.
pub struct State {
    pub graph: Graph,
    pub build_log: build_log::Writer,
    pub deps_log: deps_log::Writer,
    pub default: Vec<FileId>,
    pub pools: SmallMap<String, usize>,
    /// Value of the top-level `builddir` binding, where logs live.
    pub build_dir: Option<String>,
}

/// Path to a file kept in the build directory (`builddir` binding), if set.
fn build_dir_path(build_dir: Option<&String>, name: &str) -> PathBuf {
    match build_dir {
        Some(dir) => Path::new(dir).join(name),
        None => PathBuf::from(name),
    }
}

/// Load the manifest and the logs beside it.
pub fn read(build_filename: &str) -> anyhow::Result<State> {
    let mut loader = Loader::new();
    trace::scope("loader.read_file", || {
        let id = loader.path(build_filename.to_owned());
        loader.read_file(id)
    })?;
    let mut graph = loader.graph;

    let build_dir = loader.vars.get("builddir").cloned();
    if let Some(dir) = &build_dir {
        std::fs::create_dir_all(dir).map_err(|err| anyhow!("builddir {}: {}", dir, err))?;
    }

    let build_log = trace::scope("build_log.open", || {
        build_log::open(&build_dir_path(build_dir.as_ref(), ".ninja_log"))
    })?;
    let deps_log = trace::scope("deps_log.open", || {
        deps_log::open(&mut graph, &build_dir_path(build_dir.as_ref(), ".ninja_deps"))
    })?;
    for warning in build_log.warnings.iter().chain(&deps_log.warnings) {
        println!("kiln: warning: {}", warning);
    }

    // Attach recorded deps to the edges that asked for them.
    let attach: Vec<(crate::graph::BuildId, Vec<FileId>)> = deps_log
        .deps
        .iter()
        .filter_map(|(&out, entry)| {
            let bid = graph.file(out).input?;
            let build = graph.build(bid);
            if build.deps_style != DepsStyle::None || build.depfile.is_some() {
                Some((bid, entry.ins.clone()))
            } else {
                None
            }
        })
        .collect();
    for (bid, ins) in attach {
        graph.update_discovered(bid, ins);
    }

    Ok(State {
        graph,
        build_log,
        deps_log,
        default: loader.default,
        pools: loader.pools,
        build_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(text: &str) -> anyhow::Result<Loader> {
        let mut loader = Loader::new();
        let mut bytes = text.as_bytes().to_vec();
        bytes.push(0);
        loader.parse(PathBuf::from("build.ninja"), &bytes)?;
        Ok(loader)
    }

    fn must_load(text: &str) -> Loader {
        load(text).unwrap()
    }

    const TOUCH: &str = "rule touch\n  command = touch $out\n";

    #[test]
    fn basic_build_statement() {
        let loader = must_load(&format!("{}build out: touch in1 in2\n", TOUCH));
        let out = loader.graph.lookup_file_id("out").unwrap();
        let bid = loader.graph.file(out).input.unwrap();
        let build = loader.graph.build(bid);
        assert_eq!(build.cmdline.as_deref(), Some("touch out"));
        assert_eq!(build.explicit_ins().len(), 2);
    }

    #[test]
    fn in_and_out_expansion() {
        let loader = must_load(
            "rule cat\n  command = cat $in > $out\nbuild out: cat a b\n",
        );
        let out = loader.graph.lookup_file_id("out").unwrap();
        let build = loader.graph.build(loader.graph.file(out).input.unwrap());
        assert_eq!(build.cmdline.as_deref(), Some("cat a b > out"));
    }

    #[test]
    fn in_with_spaces_is_shell_quoted() {
        let loader = must_load(
            "rule cat\n  command = cat $in > $out\nbuild out: cat has$ space\n",
        );
        let out = loader.graph.lookup_file_id("out").unwrap();
        let build = loader.graph.build(loader.graph.file(out).input.unwrap());
        assert_eq!(build.cmdline.as_deref(), Some("cat 'has space' > out"));
    }

    #[test]
    fn edge_vars_override_rule_and_file_scope() {
        let loader = must_load(
            "flags = -O1
rule cc
  command = cc $flags $in -o $out
build a.o: cc a.c
build b.o: cc b.c
  flags = -O2
",
        );
        let cmd = |name: &str| {
            let id = loader.graph.lookup_file_id(name).unwrap();
            let build = loader.graph.build(loader.graph.file(id).input.unwrap());
            build.cmdline.clone().unwrap()
        };
        assert_eq!(cmd("a.o"), "cc -O1 a.c -o a.o");
        assert_eq!(cmd("b.o"), "cc -O2 b.c -o b.o");
    }

    #[test]
    fn paths_are_canonicalized() {
        let loader = must_load(&format!("{}build ./out: touch foo/../in\n", TOUCH));
        assert!(loader.graph.lookup_file_id("out").is_some());
        assert!(loader.graph.lookup_file_id("in").is_some());
        assert!(loader.graph.lookup_file_id("./out").is_none());
    }

    #[test]
    fn phony_has_no_command() {
        let loader = must_load("build all: phony a b\n");
        let all = loader.graph.lookup_file_id("all").unwrap();
        let build = loader.graph.build(loader.graph.file(all).input.unwrap());
        assert!(build.is_phony());
    }

    #[test]
    fn rule_attributes() {
        let loader = must_load(
            "rule cc
  command = cc $in -o $out
  depfile = $out.d
  deps = gcc
  restat = 1
  description = CC $out
build a.o: cc a.c
",
        );
        let id = loader.graph.lookup_file_id("a.o").unwrap();
        let build = loader.graph.build(loader.graph.file(id).input.unwrap());
        assert_eq!(build.depfile.as_deref(), Some("a.o.d"));
        assert_eq!(build.deps_style, DepsStyle::Gcc);
        assert!(build.restat);
        assert_eq!(build.desc.as_deref(), Some("CC a.o"));
    }

    #[test]
    fn dyndep_becomes_implicit_input() {
        let loader = must_load(&format!("{}build out: touch in\n  dyndep = out.dd\n", TOUCH));
        let out = loader.graph.lookup_file_id("out").unwrap();
        let dd = loader.graph.lookup_file_id("out.dd").unwrap();
        let build = loader.graph.build(loader.graph.file(out).input.unwrap());
        assert_eq!(build.dyndep, Some(dd));
        assert!(build.depend_ins().any(|id| id == dd));
    }

    #[test]
    fn duplicate_rule_is_an_error() {
        let err = load(&format!("{}{}", TOUCH, TOUCH)).unwrap_err();
        assert!(err.to_string().contains("duplicate rule 'touch'"), "{}", err);
    }

    #[test]
    fn unknown_rule_is_an_error() {
        let err = load("build out: nonesuch in\n").unwrap_err();
        assert!(err.to_string().contains("unknown rule 'nonesuch'"), "{}", err);
        assert!(err.to_string().contains("build.ninja:1"), "{}", err);
    }

    #[test]
    fn duplicate_output_is_an_error() {
        let err = load(&format!("{}build out: touch a\nbuild out: touch b\n", TOUCH)).unwrap_err();
        assert!(
            err.to_string().contains("multiple rules generate out"),
            "{}",
            err
        );
    }

    #[test]
    fn unknown_default_is_an_error() {
        let err = load("default out\n").unwrap_err();
        assert!(err.to_string().contains("unknown target 'out'"), "{}", err);
    }

    #[test]
    fn unknown_pool_is_an_error() {
        let err = load(&format!("{}build out: touch in\n  pool = heavy\n", TOUCH)).unwrap_err();
        assert!(err.to_string().contains("unknown pool 'heavy'"), "{}", err);
    }

    #[test]
    fn console_pool_is_predefined() {
        must_load(&format!("{}build out: touch in\n  pool = console\n", TOUCH));
    }

    #[test]
    fn include_shares_scope_subninja_does_not() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("inc.ninja"), "from_inc = 1\n").unwrap();
        std::fs::write(
            dir.path().join("sub.ninja"),
            "sub_only = 1\nrule subrule\n  command = true\n",
        )
        .unwrap();
        let top = format!(
            "include {inc}
subninja {sub}
{touch}build out: touch in
",
            inc = dir.path().join("inc.ninja").display(),
            sub = dir.path().join("sub.ninja").display(),
            touch = TOUCH,
        );
        let loader = must_load(&top);
        assert_eq!(loader.vars.get("from_inc").map(String::as_str), Some("1"));
        assert_eq!(loader.vars.get("sub_only"), None);
        assert!(!loader.rules.contains_key("subrule"));
    }
}
