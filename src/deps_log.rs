//! The deps log records header dependencies discovered while running
//! commands (from depfiles or /showIncludes output), so later builds know
//! them without rerunning the compiler.
//!
//! The on-disk format is binary, little-endian, and append-only: a magic
//! header, then size-prefixed records.  The high bit of the size marks a
//! deps record; otherwise the record defines the next path id:
//!
//!   path record:  [u32 size][path bytes, nul-padded to 4][u32 checksum]
//!   deps record:  [u32 size|FLAG][u32 out_id][u32 mtime_lo][u32 mtime_hi]
//!                 [u32 in_id]...
//!
//! Path ids are assigned in file order; the checksum is the bitwise-not of
//! the id so a torn path record is detectable.  A later deps record for the
//! same output shadows the earlier one.

use crate::graph::{FileId, Graph};
use anyhow::{anyhow, bail};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8] = b"# ninjadeps\n";
const VERSION: u32 = 4;
const DEPS_RECORD_FLAG: u32 = 0x8000_0000;
/// Cap on a single record; anything larger is corruption.
const MAX_RECORD_SIZE: u32 = 1 << 19;

const COMPACT_MIN_RECORDS: usize = 1000;

/// One output's recorded dependencies.
#[derive(Debug, Clone, PartialEq)]
pub struct Deps {
    /// The output's mtime when the deps were recorded; a record older than
    /// the output on disk is stale.
    pub mtime: i64,
    pub ins: Vec<FileId>,
}

pub struct Writer {
    /// Log id -> graph file, in definition order.
    fileids: Vec<FileId>,
    /// Graph file -> log id.
    db_ids: HashMap<FileId, usize>,
    /// Latest deps record per output.
    pub deps: HashMap<FileId, Deps>,
    w: BufWriter<File>,
    path: PathBuf,
    records: usize,
    dead_records: usize,
    /// Repairs performed during load, to surface to the user.
    pub warnings: Vec<String>,
}

fn u32_at(buf: &[u8], ofs: usize) -> u32 {
    u32::from_le_bytes(buf[ofs..ofs + 4].try_into().unwrap())
}

fn create_empty(path: &Path) -> anyhow::Result<BufWriter<File>> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    w.write_all(&VERSION.to_le_bytes())?;
    w.flush()?;
    Ok(w)
}

/// Open a deps log, replaying its records into memory.  An unreadable or
/// mismatched log is deleted and recreated; the build then proceeds as if no
/// deps were known.  A truncated tail is dropped.
pub fn open(graph: &mut Graph, path: &Path) -> anyhow::Result<Writer> {
    let buf = match std::fs::read(path) {
        Ok(buf) => buf,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(anyhow!("read {}: {}", path.display(), err)),
    };

    let mut fileids: Vec<FileId> = Vec::new();
    let mut db_ids: HashMap<FileId, usize> = HashMap::new();
    let mut deps: HashMap<FileId, Deps> = HashMap::new();
    let mut records = 0;
    let mut dead_records = 0;
    let mut warnings = Vec::new();

    let make_writer = |w, fileids, db_ids, deps, records, dead_records, warnings| Writer {
        fileids,
        db_ids,
        deps,
        w,
        path: path.to_owned(),
        records,
        dead_records,
        warnings,
    };

    let header_len = MAGIC.len() + 4;
    if buf.is_empty() {
        let w = create_empty(path)?;
        return Ok(make_writer(w, fileids, db_ids, deps, 0, 0, warnings));
    }
    if buf.len() < header_len
        || &buf[..MAGIC.len()] != MAGIC
        || u32_at(&buf, MAGIC.len()) != VERSION
    {
        warnings.push(format!(
            "{}: unrecognized deps log, starting over",
            path.display()
        ));
        let w = create_empty(path)?;
        return Ok(make_writer(w, fileids, db_ids, deps, 0, 0, warnings));
    }

    let mut ofs = header_len;
    let truncate_at = loop {
        if ofs == buf.len() {
            break None;
        }
        if ofs + 4 > buf.len() {
            break Some(ofs);
        }
        let size_word = u32_at(&buf, ofs);
        let is_deps = size_word & DEPS_RECORD_FLAG != 0;
        let size = (size_word & !DEPS_RECORD_FLAG) as usize;
        if size as u32 > MAX_RECORD_SIZE || size % 4 != 0 || ofs + 4 + size > buf.len() {
            break Some(ofs);
        }
        let payload = &buf[ofs + 4..ofs + 4 + size];
        if is_deps {
            if size < 12 {
                break Some(ofs);
            }
            let out_id = u32_at(payload, 0) as usize;
            let mtime = ((u32_at(payload, 8) as u64) << 32 | u32_at(payload, 4) as u64) as i64;
            let mut ins = Vec::with_capacity(size / 4 - 3);
            let mut bad_id = false;
            for i in (12..size).step_by(4) {
                let in_id = u32_at(payload, i) as usize;
                if in_id >= fileids.len() {
                    bad_id = true;
                    break;
                }
                ins.push(fileids[in_id]);
            }
            if bad_id || out_id >= fileids.len() {
                break Some(ofs);
            }
            let out = fileids[out_id];
            if deps.insert(out, Deps { mtime, ins }).is_some() {
                dead_records += 1;
            }
        } else {
            if size < 8 {
                break Some(ofs);
            }
            let checksum = u32_at(payload, size - 4);
            let id = fileids.len();
            if checksum != !(id as u32) {
                break Some(ofs);
            }
            let mut path_bytes = &payload[..size - 4];
            while let [rest @ .., 0] = path_bytes {
                path_bytes = rest;
            }
            let name = String::from_utf8_lossy(path_bytes).into_owned();
            let file_id = graph.file_id(name, 0);
            db_ids.insert(file_id, id);
            fileids.push(file_id);
        }
        records += 1;
        ofs += 4 + size;
    };

    if let Some(good_len) = truncate_at {
        warnings.push(format!(
            "{}: premature end of file; recovering",
            path.display()
        ));
        let file = std::fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(good_len as u64)?;
    }

    let file = std::fs::OpenOptions::new().append(true).open(path)?;
    let mut writer = make_writer(
        BufWriter::new(file),
        fileids,
        db_ids,
        deps,
        records,
        dead_records,
        warnings,
    );
    if writer.needs_recompaction() {
        writer.recompact(graph)?;
    }
    Ok(writer)
}

impl Writer {
    pub fn lookup(&self, out: FileId) -> Option<&Deps> {
        self.deps.get(&out)
    }

    fn write_path_record(&mut self, graph: &Graph, id: FileId) -> anyhow::Result<usize> {
        if let Some(&db_id) = self.db_ids.get(&id) {
            return Ok(db_id);
        }
        let name = graph.file(id).name.as_bytes();
        let pad = (4 - name.len() % 4) % 4;
        let size = name.len() + pad + 4;
        if size as u32 > MAX_RECORD_SIZE {
            bail!("path too long for deps log: {}", graph.file(id).name);
        }
        let db_id = self.fileids.len();
        self.w.write_all(&(size as u32).to_le_bytes())?;
        self.w.write_all(name)?;
        self.w.write_all(&[0u8; 3][..pad])?;
        self.w.write_all(&(!(db_id as u32)).to_le_bytes())?;
        self.db_ids.insert(id, db_id);
        self.fileids.push(id);
        self.records += 1;
        Ok(db_id)
    }

    /// Record an output's discovered deps, shadowing any earlier record.
    /// Returns false when the stored entry was already identical.
    pub fn write_deps(
        &mut self,
        graph: &Graph,
        out: FileId,
        mtime: i64,
        ins: &[FileId],
    ) -> anyhow::Result<bool> {
        if let Some(existing) = self.deps.get(&out) {
            if existing.mtime == mtime && existing.ins == ins {
                return Ok(false);
            }
        }

        let out_id = self.write_path_record(graph, out)?;
        let mut in_ids = Vec::with_capacity(ins.len());
        for &in_id in ins {
            in_ids.push(self.write_path_record(graph, in_id)?);
        }

        let size = 12 + 4 * in_ids.len();
        if size as u32 > MAX_RECORD_SIZE {
            bail!("too many deps for {}", graph.file(out).name);
        }
        self.w
            .write_all(&(size as u32 | DEPS_RECORD_FLAG).to_le_bytes())?;
        self.w.write_all(&(out_id as u32).to_le_bytes())?;
        let mtime = mtime as u64;
        self.w.write_all(&(mtime as u32).to_le_bytes())?;
        self.w.write_all(&((mtime >> 32) as u32).to_le_bytes())?;
        for in_id in in_ids {
            self.w.write_all(&(in_id as u32).to_le_bytes())?;
        }
        self.w.flush()?;

        self.records += 1;
        if self
            .deps
            .insert(
                out,
                Deps {
                    mtime: mtime as i64,
                    ins: ins.to_vec(),
                },
            )
            .is_some()
        {
            self.dead_records += 1;
        }
        Ok(true)
    }

    fn needs_recompaction(&self) -> bool {
        self.records > COMPACT_MIN_RECORDS && self.dead_records * 3 > self.records
    }

    /// Rewrite the log with fresh, compact ids and only the live records.
    pub fn recompact(&mut self, graph: &Graph) -> anyhow::Result<()> {
        let deps = std::mem::take(&mut self.deps);
        self.fileids.clear();
        self.db_ids.clear();
        self.records = 0;
        self.dead_records = 0;
        self.w = create_empty(&self.path)?;
        for (&out, entry) in &deps {
            let out_id = self.write_path_record(graph, out)?;
            let mut in_ids = Vec::with_capacity(entry.ins.len());
            for &in_id in &entry.ins {
                in_ids.push(self.write_path_record(graph, in_id)?);
            }
            let size = 12 + 4 * in_ids.len();
            self.w
                .write_all(&(size as u32 | DEPS_RECORD_FLAG).to_le_bytes())?;
            self.w.write_all(&(out_id as u32).to_le_bytes())?;
            let mtime = entry.mtime as u64;
            self.w.write_all(&(mtime as u32).to_le_bytes())?;
            self.w.write_all(&((mtime >> 32) as u32).to_le_bytes())?;
            for in_id in in_ids {
                self.w.write_all(&(in_id as u32).to_le_bytes())?;
            }
            self.records += 1;
        }
        self.w.flush()?;
        self.deps = deps;
        Ok(())
    }
}
