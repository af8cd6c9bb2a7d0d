//! Dyndep files: a build statement may defer part of its dependency
//! information to a file produced mid-build (`dyndep = foo.dd`).  Once that
//! file exists the driver loads it, extending the declaring edge with
//! implicit inputs and outputs before the edge is allowed to run.
//!
//! The file format is manifest syntax with a version header and one `build`
//! statement per extended edge, using the pseudo-rule `dyndep`:
//!
//!   ninja_dyndep_version = 1
//!   build out | extra_out: dyndep | extra_in
//!     restat = 1

use crate::{
    canon::canon_path_fast,
    graph::{BuildId, FileId, Graph},
    parse::{Parser, Statement},
    scanner::{self, ParseError},
};
use anyhow::anyhow;
use std::path::PathBuf;

/// Load a dyndep file and apply it to the edges that reference it.
/// Returns the builds that were extended; each referencing edge must appear
/// exactly once in the file.
pub fn load(graph: &mut Graph, dd_id: FileId) -> anyhow::Result<Vec<BuildId>> {
    let path = PathBuf::from(graph.file(dd_id).name.clone());
    let bytes = scanner::read_file_with_nul(&path)
        .map_err(|err| anyhow!("loading '{}': {}", path.display(), err))?;

    let mut parser = Parser::new(&bytes);
    let mut affected = Vec::new();
    let mut saw_version = false;

    loop {
        let stmt = match parser
            .read()
            .map_err(|err| anyhow!(parser.format_parse_error(&path, err)))?
        {
            None => break,
            Some(stmt) => stmt,
        };
        let result = apply_statement(graph, dd_id, stmt, &mut saw_version, &mut affected);
        result.map_err(|err| anyhow!(parser.format_parse_error(&path, err)))?;
    }

    if !saw_version {
        return Err(anyhow!(
            "{}: expected 'ninja_dyndep_version = ...'",
            path.display()
        ));
    }
    Ok(affected)
}

fn apply_statement(
    graph: &mut Graph,
    dd_id: FileId,
    stmt: Statement,
    saw_version: &mut bool,
    affected: &mut Vec<BuildId>,
) -> Result<(), ParseError> {
    let err_at = |ofs: usize, msg: String| Err(ParseError { msg, ofs });
    match stmt {
        Statement::VarDef(def) if !*saw_version => {
            if def.name != "ninja_dyndep_version" {
                return Err(ParseError {
                    msg: "expected 'ninja_dyndep_version = ...'".to_owned(),
                    ofs: 0,
                });
            }
            let version = def.value.evaluate(&[]);
            if version != "1" && !version.starts_with("1.") {
                return Err(ParseError {
                    msg: format!("unsupported dyndep version '{}'", version),
                    ofs: 0,
                });
            }
            *saw_version = true;
            Ok(())
        }
        Statement::Build(build) if *saw_version => {
            if build.rule != "dyndep" {
                return err_at(build.ofs, format!("expected rule 'dyndep', got '{}'", build.rule));
            }
            if build.explicit_outs != 1 {
                return err_at(build.ofs, "expected exactly one explicit output".to_owned());
            }
            if build.explicit_ins != 0 || build.order_only_ins != 0 || build.validation_ins != 0 {
                return err_at(
                    build.ofs,
                    "dyndep inputs must be implicit (after '|')".to_owned(),
                );
            }

            let out = intern(graph, &build.outs[0]);
            let bid = match graph.file(out).input {
                Some(bid) if graph.build(bid).dyndep == Some(dd_id) => bid,
                Some(_) => {
                    return err_at(
                        build.ofs,
                        format!(
                            "output '{}' does not use this dyndep file",
                            graph.file(out).name
                        ),
                    )
                }
                None => {
                    return err_at(
                        build.ofs,
                        format!("unknown output '{}'", graph.file(out).name),
                    )
                }
            };
            if graph.build(bid).dyndep_loaded {
                return err_at(
                    build.ofs,
                    format!("multiple statements for output '{}'", graph.file(out).name),
                );
            }

            let extra_outs: Vec<FileId> = build.outs[1..]
                .iter()
                .map(|eval| intern(graph, eval))
                .collect();
            let extra_ins: Vec<FileId> = build
                .ins
                .iter()
                .map(|eval| intern(graph, eval))
                .collect();

            graph
                .add_dyndep_outs(bid, &extra_outs)
                .map_err(|err| ParseError {
                    msg: err.to_string(),
                    ofs: build.ofs,
                })?;
            graph.add_dyndep_ins(bid, &extra_ins);

            for (name, val) in build.vars.iter() {
                match *name {
                    "restat" => {
                        if !val.evaluate(&[]).is_empty() {
                            graph.build_mut(bid).restat = true;
                        }
                    }
                    other => {
                        return err_at(build.ofs, format!("unexpected variable '{}'", other))
                    }
                }
            }

            graph.build_mut(bid).dyndep_loaded = true;
            affected.push(bid);
            Ok(())
        }
        _ => Err(ParseError {
            msg: if *saw_version {
                "unexpected statement in dyndep file".to_owned()
            } else {
                "expected 'ninja_dyndep_version = ...'".to_owned()
            },
            ofs: 0,
        }),
    }
}

/// Evaluate (against no scope) and intern one path from a dyndep statement.
fn intern(graph: &mut Graph, eval: &crate::eval::EvalString<&str>) -> FileId {
    let mut path = eval.evaluate(&[]);
    let slash_bits = canon_path_fast(&mut path);
    graph.file_id(path, slash_bits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Build, FileLoc};
    use std::rc::Rc;

    fn test_graph() -> (Graph, BuildId, FileId) {
        let mut graph = Graph::new();
        let src = graph.file_id("in.c", 0);
        let out = graph.file_id("out.o", 0);
        let dd = graph.file_id("out.dd", 0);
        let loc = FileLoc {
            filename: Rc::new(PathBuf::from("build.ninja")),
            line: 1,
        };
        let mut build = Build::new(loc, vec![src, dd], 1, 1, 0, vec![out], 1);
        build.cmdline = Some("compile".to_owned());
        build.dyndep = Some(dd);
        let bid = graph.add_build(build).unwrap();
        (graph, bid, dd)
    }

    fn write_dd(contents: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dd");
        std::fs::write(&path, contents).unwrap();
        (dir, path.display().to_string())
    }

    fn load_dd(contents: &str) -> anyhow::Result<(Graph, BuildId, Vec<BuildId>)> {
        let (_dir, dd_path) = write_dd(contents);
        let (mut graph, bid, dd) = test_graph();
        // Point the graph's dyndep file at the real temp path.
        graph.files.get_mut(dd).name = dd_path;
        let affected = load(&mut graph, dd)?;
        Ok((graph, bid, affected))
    }

    #[test]
    fn applies_ins_outs_and_restat() {
        let (graph, bid, affected) = load_dd(
            "ninja_dyndep_version = 1
build out.o | extra.o: dyndep | hidden.h
  restat = 1
",
        )
        .unwrap();
        assert_eq!(affected, vec![bid]);
        let build = graph.build(bid);
        assert!(build.dyndep_loaded);
        assert!(build.restat);
        let extra = graph.lookup_file_id("extra.o").unwrap();
        assert_eq!(graph.file(extra).input, Some(bid));
        let hidden = graph.lookup_file_id("hidden.h").unwrap();
        assert!(build.depend_ins().any(|id| id == hidden));
    }

    #[test]
    fn missing_version_is_fatal() {
        let err = load_dd("build out.o: dyndep\n").unwrap_err();
        assert!(
            err.to_string().contains("ninja_dyndep_version"),
            "{}",
            err
        );
    }

    #[test]
    fn unknown_output_is_fatal() {
        let err = load_dd("ninja_dyndep_version = 1\nbuild other.o: dyndep\n").unwrap_err();
        assert!(err.to_string().contains("unknown output 'other.o'"), "{}", err);
    }

    #[test]
    fn duplicate_entry_is_fatal() {
        let err = load_dd(
            "ninja_dyndep_version = 1
build out.o: dyndep
build out.o: dyndep
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("multiple statements"), "{}", err);
    }

    #[test]
    fn unexpected_variable_is_fatal() {
        let err = load_dd(
            "ninja_dyndep_version = 1
build out.o: dyndep
  generator = 1
",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unexpected variable"), "{}", err);
    }
}
