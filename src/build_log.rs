//! The build log records, for every output ever built, the time the command
//! ran, the output's mtime, and a hash of the command; it is what lets a
//! second build decide an edge is already up to date.
//!
//! The on-disk format is a text file, one tab-separated record per line:
//!   start_ms <TAB> end_ms <TAB> mtime <TAB> command_hash <TAB> output_path
//! appended to as edges finish.  Rewritten records shadow earlier ones, so a
//! long-lived log accumulates dead lines and is recompacted by rewriting only
//! the live records.

use crate::hash::BuildHash;
use anyhow::anyhow;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const VERSION: u32 = 1;

/// Recompaction kicks in when the log has grown well past its live content.
const COMPACT_MIN_RECORDS: usize = 1000;
const COMPACT_RATIO: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    /// Start/end of the command, milliseconds from the start of its build.
    pub start_ms: u32,
    pub end_ms: u32,
    /// The output's mtime when recorded, nanoseconds since the epoch.
    pub mtime: i64,
    pub command_hash: BuildHash,
}

fn header() -> String {
    format!("# ninja log v{}\n", VERSION)
}

fn format_entry(out: &str, entry: &Entry) -> String {
    format!(
        "{}\t{}\t{}\t{}\t{}\n",
        entry.start_ms, entry.end_ms, entry.mtime, entry.command_hash.0, out
    )
}

fn parse_entry(line: &str) -> Option<(&str, Entry)> {
    let mut fields = line.splitn(5, '\t');
    let start_ms = fields.next()?.parse().ok()?;
    let end_ms = fields.next()?.parse().ok()?;
    let mtime = fields.next()?.parse().ok()?;
    let command_hash = BuildHash(fields.next()?.parse().ok()?);
    let out = fields.next()?;
    if out.is_empty() {
        return None;
    }
    Some((
        out,
        Entry {
            start_ms,
            end_ms,
            mtime,
            command_hash,
        },
    ))
}

/// An opened build log: the replayed entries plus a file handle for appends.
pub struct Writer {
    entries: HashMap<String, Entry>,
    w: BufWriter<File>,
    path: PathBuf,
    /// Records present in the on-disk file, live or shadowed.
    records: usize,
    /// Repairs performed during load, to surface to the user.
    pub warnings: Vec<String>,
}

/// Open a build log, replaying any existing content.  A missing file starts
/// an empty log; a stale version or corrupt tail is repaired, never fatal.
pub fn open(path: &Path) -> anyhow::Result<Writer> {
    let mut entries = HashMap::new();
    let mut records = 0;
    let mut repair = false;
    let mut warnings = Vec::new();

    match std::fs::read_to_string(path) {
        Ok(text) => {
            let mut lines = text.split_inclusive('\n');
            match lines.next() {
                Some(first) if first == header() => {
                    for line in lines {
                        let Some(line) = line.strip_suffix('\n') else {
                            // Unterminated final line: a crashed append.
                            repair = true;
                            break;
                        };
                        let line = line.strip_suffix('\r').unwrap_or(line);
                        match parse_entry(line) {
                            Some((out, entry)) => {
                                entries.insert(out.to_owned(), entry);
                                records += 1;
                            }
                            None => {
                                // Stop at the last good record.
                                repair = true;
                                break;
                            }
                        }
                    }
                    if repair {
                        warnings.push(format!(
                            "{}: truncating corrupt build log",
                            path.display()
                        ));
                    }
                }
                _ => {
                    // Unrecognized or stale version: drop the old contents.
                    entries.clear();
                    repair = true;
                    warnings.push(format!(
                        "{}: unrecognized build log, starting over",
                        path.display()
                    ));
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(anyhow!("read {}: {}", path.display(), err)),
    }

    let mut writer = if repair || records == 0 {
        // (Re)write the file from the live entries; this also stamps the
        // header on a brand new log.
        rewrite(path, &entries)?
    } else {
        let file = std::fs::OpenOptions::new().append(true).open(path)?;
        Writer {
            entries,
            w: BufWriter::new(file),
            path: path.to_owned(),
            records,
            warnings: Vec::new(),
        }
    };
    writer.warnings = warnings;
    if writer.needs_recompaction() {
        writer.recompact()?;
    }
    Ok(writer)
}

fn rewrite(path: &Path, entries: &HashMap<String, Entry>) -> anyhow::Result<Writer> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    w.write_all(header().as_bytes())?;
    for (out, entry) in entries {
        w.write_all(format_entry(out, entry).as_bytes())?;
    }
    w.flush()?;
    Ok(Writer {
        entries: entries.clone(),
        w,
        path: path.to_owned(),
        records: entries.len(),
        warnings: Vec::new(),
    })
}

impl Writer {
    pub fn lookup(&self, out: &str) -> Option<&Entry> {
        self.entries.get(out)
    }

    /// Append a record.  Flushed immediately so a later crash can lose at
    /// most the in-flight line.
    pub fn record(&mut self, out: &str, entry: Entry) -> std::io::Result<()> {
        self.w.write_all(format_entry(out, &entry).as_bytes())?;
        self.w.flush()?;
        self.entries.insert(out.to_owned(), entry);
        self.records += 1;
        Ok(())
    }

    fn needs_recompaction(&self) -> bool {
        self.records > COMPACT_MIN_RECORDS && self.records > self.entries.len() * COMPACT_RATIO
    }

    /// Rewrite the file with only the live records.
    pub fn recompact(&mut self) -> anyhow::Result<()> {
        let mut fresh = rewrite(&self.path, &self.entries)?;
        fresh.warnings = std::mem::take(&mut self.warnings);
        *self = fresh;
        Ok(())
    }
}
