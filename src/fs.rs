//! The disk interface used by the build driver: stat, read, write, remove,
//! mkdir.  A trait so tests can substitute an in-memory filesystem; command
//! execution is not behind it, only metadata and small-file I/O.

use std::io;
use std::time::UNIX_EPOCH;

/// MTime info gathered for a file.  This also models "file is absent"; not an
/// Option<> because dedicated variants read better at the call sites, and the
/// ordering (Missing sorts before any Stamp) is used when comparing outputs
/// against inputs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MTime {
    Missing,
    /// Nanoseconds since the epoch.
    Stamp(i64),
}

pub trait FileSystem {
    /// stat() an on-disk path, producing its MTime.
    fn stat(&self, path: &str) -> io::Result<MTime>;
    fn read(&self, path: &str) -> io::Result<Vec<u8>>;
    fn write(&self, path: &str, content: &[u8]) -> io::Result<()>;
    /// Remove a file; Ok(false) when it did not exist.
    fn remove_file(&self, path: &str) -> io::Result<bool>;
    /// Create a directory and any missing parents.
    fn create_dirs(&self, path: &str) -> io::Result<()>;
}

pub struct RealFileSystem {}

impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem {}
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn mtime_nanos(meta: &std::fs::Metadata) -> i64 {
    match meta.modified() {
        Ok(time) => match time.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i64,
            // Pre-epoch mtimes clamp to zero; still "present".
            Err(_) => 0,
        },
        Err(_) => 0,
    }
}

impl FileSystem for RealFileSystem {
    fn stat(&self, path: &str) -> io::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => Ok(MTime::Stamp(mtime_nanos(&meta))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(err),
        }
    }

    fn read(&self, path: &str) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write(&self, path: &str, content: &[u8]) -> io::Result<()> {
        std::fs::write(path, content)
    }

    fn remove_file(&self, path: &str) -> io::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn create_dirs(&self, path: &str) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }
}
