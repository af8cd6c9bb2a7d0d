//! Lexical path canonicalization.
//!
//! Collapses "./", "..", and duplicate separators without touching the disk.
//! Paths like these show up after variable expansion in particular.  Paths are
//! byte-identity keys for the graph, so canonicalization is what makes
//! "foo/./bar" and "foo/bar" the same node.
//!
//! On Windows both separators are accepted and the output uses forward
//! slashes; a 64-bit mask records which output separators were originally
//! backslashes so the spelling can be re-derived where it matters.

fn is_separator(c: u8) -> bool {
    c == b'/' || (cfg!(windows) && c == b'\\')
}

/// Canonicalize a path in place, returning the slash-bit mask.  Bit N of the
/// mask is set when the Nth separator of the canonical output was written as
/// a backslash in the input (always zero on non-Windows platforms).
pub fn canon_path_fast(path: &mut String) -> u64 {
    if path.is_empty() {
        return 0;
    }
    // Safety: we only overwrite bytes with ASCII or with whole byte runs
    // copied from later in the same buffer, and truncate at a boundary
    // following such a write, so the contents remain valid UTF-8.
    let bytes = unsafe { path.as_mut_vec() };
    let len = bytes.len();

    // Start offsets (and separator ordinals) of components we may pop back
    // to when a ".." shows up.
    let mut comps = [(0usize, 0u32); 64];
    let mut ncomps = 0;

    let mut src = 0;
    let mut dst = 0;
    let mut seps: u32 = 0;
    let mut bits: u64 = 0;

    if is_separator(bytes[0]) {
        if bytes[0] == b'\\' {
            bits |= 1;
        }
        bytes[0] = b'/';
        src = 1;
        dst = 1;
        seps = 1;
    }

    while src < len {
        let c = bytes[src];
        if is_separator(c) {
            // Duplicate separator, drop it.
            src += 1;
            continue;
        }
        if c == b'.' {
            if src + 1 == len {
                // Trailing ".", trim.
                break;
            }
            let c1 = bytes[src + 1];
            if is_separator(c1) {
                // "./", skip.
                src += 2;
                continue;
            }
            if c1 == b'.' && (src + 2 == len || is_separator(bytes[src + 2])) {
                // ".." component: back up if we can, otherwise keep it.
                if ncomps > 0 {
                    ncomps -= 1;
                    let (comp_dst, comp_seps) = comps[ncomps];
                    dst = comp_dst;
                    seps = comp_seps;
                    if seps < 64 {
                        bits &= (1u64 << seps) - 1;
                    }
                } else {
                    bytes[dst] = b'.';
                    bytes[dst + 1] = b'.';
                    dst += 2;
                    if src + 2 < len {
                        if bytes[src + 2] == b'\\' && seps < 64 {
                            bits |= 1 << seps;
                        }
                        bytes[dst] = b'/';
                        dst += 1;
                        seps += 1;
                    }
                }
                src += 3;
                continue;
            }
            // A component that merely starts with dots falls through.
        }

        // Ordinary component: mark it poppable, then copy it along with its
        // trailing separator.
        if ncomps == comps.len() {
            panic!("too many path components");
        }
        comps[ncomps] = (dst, seps);
        ncomps += 1;

        while src < len && !is_separator(bytes[src]) {
            bytes[dst] = bytes[src];
            dst += 1;
            src += 1;
        }
        if src < len {
            if bytes[src] == b'\\' && seps < 64 {
                bits |= 1 << seps;
            }
            bytes[dst] = b'/';
            dst += 1;
            src += 1;
            seps += 1;
        }
    }

    if dst == 0 {
        bytes.clear();
        bytes.extend_from_slice(b".");
    } else {
        bytes.truncate(dst);
    }
    bits
}

/// Allocating convenience wrapper over `canon_path_fast`.
pub fn canon_path(path: impl Into<String>) -> String {
    let mut path = path.into();
    canon_path_fast(&mut path);
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop() {
        assert_eq!(canon_path("foo"), "foo");
        assert_eq!(canon_path("foo/bar"), "foo/bar");
    }

    #[test]
    fn dot() {
        assert_eq!(canon_path("./foo"), "foo");
        assert_eq!(canon_path("foo/."), "foo/");
        assert_eq!(canon_path("foo/./bar"), "foo/bar");
        assert_eq!(canon_path("./"), ".");
        assert_eq!(canon_path("./."), ".");
        assert_eq!(canon_path("././"), ".");
        assert_eq!(canon_path("././."), ".");
        assert_eq!(canon_path("."), ".");
    }

    #[test]
    fn not_dot() {
        // Components that merely start with dots are ordinary names.
        assert_eq!(canon_path("t/.hidden"), "t/.hidden");
        assert_eq!(canon_path("t/.._lib.c.o"), "t/.._lib.c.o");
    }

    #[test]
    fn slash() {
        assert_eq!(canon_path("/foo"), "/foo");
        assert_eq!(canon_path("foo//bar"), "foo/bar");
    }

    #[test]
    fn parent() {
        assert_eq!(canon_path("foo/../bar"), "bar");
        assert_eq!(canon_path("/foo/../bar"), "/bar");
        assert_eq!(canon_path("../foo"), "../foo");
        assert_eq!(canon_path("../foo/../bar"), "../bar");
        assert_eq!(canon_path("../../bar"), "../../bar");
        assert_eq!(canon_path("./../foo"), "../foo");
        assert_eq!(canon_path("foo/.."), ".");
        assert_eq!(canon_path("foo/../"), ".");
        assert_eq!(canon_path("foo/../../"), "../");
        assert_eq!(canon_path("foo/../../bar"), "../bar");
    }

    #[test]
    fn idempotent() {
        for p in [
            "foo/./bar", "a//b", "../x/../y", "/foo/../bar", "a/b/c/../../d",
        ] {
            let once = canon_path(p);
            assert_eq!(canon_path(once.clone()), once);
        }
    }

    #[cfg(windows)]
    #[test]
    fn backslashes_normalize_with_bits() {
        let mut p = "a\\b/c".to_string();
        let bits = canon_path_fast(&mut p);
        assert_eq!(p, "a/b/c");
        assert_eq!(bits, 0b01);

        let mut p = "a\\b\\c".to_string();
        let bits = canon_path_fast(&mut p);
        assert_eq!(p, "a/b/c");
        assert_eq!(bits, 0b11);
    }

    #[cfg(not(windows))]
    #[test]
    fn backslash_is_not_a_separator() {
        assert_eq!(canon_path("a\\b/c"), "a\\b/c");
        let mut p = "a/b".to_string();
        assert_eq!(canon_path_fast(&mut p), 0);
    }
}
