//! Command hashing: the build log records a 64-bit hash of each edge's
//! evaluated command so that changing a rule reruns its edges.  The hash must
//! be stable across runs, so it can't lean on std's hasher; FNV-1a is plenty
//! for distinguishing command lines and is trivially portable.

use crate::graph::RspFile;

/// Hash identifying one version of a build's command; compared against the
/// build log to decide whether the edge is out of date.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BuildHash(pub u64);

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Separates fields so that e.g. ("ab","c") and ("a","bc") hash differently.
const UNIT_SEPARATOR: u8 = 0x1F;

struct Fnv1a(u64);

impl Fnv1a {
    fn new() -> Self {
        Fnv1a(FNV_OFFSET)
    }

    fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn write_separator(&mut self) {
        self.write(&[UNIT_SEPARATOR]);
    }
}

/// Hash a build's evaluated command line, plus the response file it writes,
/// if any.  Any byte change in either produces a different hash.
pub fn hash_command(cmdline: &str, rspfile: Option<&RspFile>) -> BuildHash {
    let mut hasher = Fnv1a::new();
    hasher.write(cmdline.as_bytes());
    if let Some(rspfile) = rspfile {
        hasher.write_separator();
        hasher.write(rspfile.content.as_bytes());
    }
    BuildHash(hasher.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn stable_across_calls() {
        assert_eq!(hash_command("cc -c foo.c", None), hash_command("cc -c foo.c", None));
    }

    #[test]
    fn sensitive_to_any_byte() {
        assert_ne!(hash_command("cc -c foo.c", None), hash_command("cc -c foo.d", None));
        assert_ne!(hash_command("ab", None), hash_command("a", None));
    }

    #[test]
    fn rspfile_content_contributes() {
        let rsp = RspFile {
            path: PathBuf::from("out.rsp"),
            content: "foo.o bar.o".to_owned(),
        };
        let rsp2 = RspFile {
            content: "foo.o baz.o".to_owned(),
            ..rsp.clone()
        };
        assert_ne!(hash_command("link", Some(&rsp)), hash_command("link", Some(&rsp2)));
        assert_ne!(hash_command("link", Some(&rsp)), hash_command("link", None));
    }

    #[test]
    fn known_value_is_pinned() {
        // The hash is persisted in build logs, so lock the function down.
        assert_eq!(hash_command("", None), BuildHash(FNV_OFFSET));
    }
}
