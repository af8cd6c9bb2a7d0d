//! Parsing of the Makefile subset found in `.d` files emitted by compilers:
//! one or more targets, a colon, and prerequisites spanning escaped newlines.
//! Variable assignments, pattern rules, and recipes never appear in practice
//! and are not handled.

use crate::{
    scanner::{ParseResult, Scanner},
    smallmap::SmallMap,
};

/// Skip spaces and backslashed line continuations, tolerating CRLF.
fn skip_spaces(scanner: &mut Scanner) -> ParseResult<()> {
    loop {
        match scanner.read() {
            ' ' => {}
            '\\' => match scanner.read() {
                '\n' => {}
                '\r' if scanner.peek() == '\n' => {
                    scanner.next();
                }
                '\0' => return scanner.parse_error("unterminated escape"),
                _ => return scanner.parse_error("invalid backslash escape"),
            },
            _ => {
                scanner.back();
                break;
            }
        }
    }
    Ok(())
}

/// Read one path from the input, decoding `\ ` and `$$` escapes.
/// Note: a colon is a valid path character because of Windows drive letters,
/// so a target path comes back with its trailing colon attached.
fn read_path(scanner: &mut Scanner) -> ParseResult<Option<String>> {
    skip_spaces(scanner)?;
    let mut path = String::new();
    loop {
        match scanner.read() {
            '\0' | ' ' | '\n' => {
                scanner.back();
                break;
            }
            '\r' if scanner.peek() == '\n' => {
                scanner.back();
                break;
            }
            '\\' => match scanner.peek() {
                '\n' | '\r' => {
                    scanner.back();
                    break;
                }
                ' ' => {
                    path.push(' ');
                    scanner.next();
                }
                '\0' => return scanner.parse_error("unterminated escape"),
                // An unrecognized escape is an ordinary backslash, as in
                // Windows paths like C:\odd\path.c.
                _ => path.push('\\'),
            },
            '$' => {
                if scanner.peek() == '$' {
                    scanner.next();
                }
                path.push('$');
            }
            c => path.push(c),
        }
    }
    if path.is_empty() {
        return Ok(None);
    }
    Ok(Some(path))
}

/// Parse a `.d` file into a map of target to prerequisites.
pub fn parse(scanner: &mut Scanner) -> ParseResult<SmallMap<String, Vec<String>>> {
    let mut result = SmallMap::default();
    loop {
        while matches!(scanner.peek(), ' ' | '\n' | '\r') {
            scanner.next();
        }
        let first = match read_path(scanner)? {
            None => {
                if scanner.peek() == ':' {
                    return scanner.parse_error("expected target");
                }
                break;
            }
            Some(p) => p,
        };

        // Collect targets until the colon, which may be glued to a target.
        let mut targets = Vec::new();
        let mut path = first;
        loop {
            match path.strip_suffix(':') {
                Some(stripped) => {
                    targets.push(stripped.to_owned());
                    break;
                }
                None => targets.push(path),
            }
            skip_spaces(scanner)?;
            if scanner.skip(':') {
                break;
            }
            path = match read_path(scanner)? {
                None => return scanner.parse_error("expected ':'"),
                Some(p) => p,
            };
        }

        let mut deps = Vec::new();
        while let Some(p) = read_path(scanner)? {
            deps.push(p);
        }
        for target in targets {
            result.insert(target, deps.clone());
        }
    }
    scanner.expect('\0')?;

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn try_parse(buf: &mut Vec<u8>) -> Result<SmallMap<String, Vec<String>>, String> {
        buf.push(0);
        let mut scanner = Scanner::new(buf);
        parse(&mut scanner).map_err(|err| scanner.format_parse_error(Path::new("test"), err))
    }

    fn must_parse(buf: &mut Vec<u8>) -> SmallMap<String, Vec<String>> {
        match try_parse(buf) {
            Err(err) => {
                println!("{}", err);
                panic!("failed parse");
            }
            Ok(d) => d,
        }
    }

    fn deps_map<const N: usize>(entries: [(&str, Vec<&str>); N]) -> SmallMap<String, Vec<String>> {
        let mut map = SmallMap::default();
        for (target, deps) in entries {
            map.insert(
                target.to_owned(),
                deps.into_iter().map(str::to_owned).collect(),
            );
        }
        map
    }

    fn test_for_crlf(input: &str, test: fn(String)) {
        test(input.to_string());
        test(input.replace('\n', "\r\n"));
    }

    #[test]
    fn parse_simple() {
        test_for_crlf(
            "build/browse.o: src/browse.cc src/browse.h build/browse_py.h\n",
            |text| {
                let mut file = text.into_bytes();
                let deps = must_parse(&mut file);
                assert_eq!(
                    deps,
                    deps_map([(
                        "build/browse.o",
                        vec!["src/browse.cc", "src/browse.h", "build/browse_py.h"]
                    )])
                );
            },
        );
    }

    #[test]
    fn parse_space_suffix() {
        test_for_crlf("build/browse.o: src/browse.cc   \n", |text| {
            let mut file = text.into_bytes();
            let deps = must_parse(&mut file);
            assert_eq!(deps, deps_map([("build/browse.o", vec!["src/browse.cc"])]));
        });
    }

    #[test]
    fn parse_multiline() {
        test_for_crlf("build/browse.o: src/browse.cc\\\n  build/browse_py.h", |text| {
            let mut file = text.into_bytes();
            let deps = must_parse(&mut file);
            assert_eq!(
                deps,
                deps_map([("build/browse.o", vec!["src/browse.cc", "build/browse_py.h"])])
            );
        });
    }

    #[test]
    fn parse_escaped_space_in_path() {
        let mut file = b"out.o: has\\ space.h plain.h".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(deps, deps_map([("out.o", vec!["has space.h", "plain.h"])]));
    }

    #[test]
    fn parse_dollar_escape() {
        let mut file = b"out.o: weird$$name.h".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(deps, deps_map([("out.o", vec!["weird$name.h"])]));
    }

    #[test]
    fn parse_without_final_newline() {
        let mut file = b"build/browse.o: src/browse.cc".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(deps, deps_map([("build/browse.o", vec!["src/browse.cc"])]));
    }

    #[test]
    fn parse_spaces_before_colon() {
        let mut file = b"build/browse.o   : src/browse.cc".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(deps, deps_map([("build/browse.o", vec!["src/browse.cc"])]));
    }

    #[test]
    fn parse_windows_dep_path() {
        let mut file = b"odd/path.o: C:/odd\\path.c".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(deps, deps_map([("odd/path.o", vec!["C:/odd\\path.c"])]));
    }

    #[test]
    fn parse_multiple_rules() {
        let mut file = b"
out/a.o: src/a.c \\
  src/b.c

out/b.o :
"
        .to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            deps_map([("out/a.o", vec!["src/a.c", "src/b.c"]), ("out/b.o", vec![])])
        );
    }

    #[test]
    fn parse_multiple_targets_share_deps() {
        let mut file = b"a.o b.o: x.h y.h".to_vec();
        let deps = must_parse(&mut file);
        assert_eq!(
            deps,
            deps_map([("a.o", vec!["x.h", "y.h"]), ("b.o", vec!["x.h", "y.h"])])
        );
    }

    #[test]
    fn parse_missing_colon() {
        let mut file = b"foo bar".to_vec();
        let err = try_parse(&mut file).unwrap_err();
        assert!(
            err.starts_with("parse error: expected ':'"),
            "expected parse error, got {:?}",
            err
        );
    }

    #[test]
    fn parse_unterminated_escape() {
        let mut file = b"foo.o: bar\\".to_vec();
        let err = try_parse(&mut file).unwrap_err();
        assert!(
            err.starts_with("parse error: unterminated escape"),
            "expected parse error, got {:?}",
            err
        );
    }
}
