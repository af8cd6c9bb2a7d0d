//! End-to-end tests: each test builds a scratch directory with a manifest
//! and sources, runs the compiled kiln binary in it, and inspects the exit
//! status, the captured output, and the files left behind.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// A scratch directory holding one build.  Dropping it cleans up.
struct BuildDir {
    root: tempfile::TempDir,
}

impl BuildDir {
    fn with_manifest(manifest: &str) -> BuildDir {
        let root = tempfile::tempdir().expect("create scratch dir");
        let dir = BuildDir { root };
        dir.file("build.ninja", manifest);
        dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.path().join(name)
    }

    fn file(&self, name: &str, contents: &str) -> &Self {
        std::fs::write(self.path(name), contents).expect("write file");
        self
    }

    fn contents(&self, name: &str) -> String {
        String::from_utf8_lossy(&std::fs::read(self.path(name)).expect("read file")).into_owned()
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// Rewrite a file with its own contents; with nanosecond timestamps
    /// this reliably bumps the mtime.
    fn touch(&self, name: &str) {
        let data = std::fs::read(self.path(name)).unwrap_or_default();
        std::fs::write(self.path(name), data).expect("touch file");
    }

    /// A Command for the kiln binary, cwd'd into the scratch dir, with the
    /// host environment scrubbed of anything that changes kiln's behavior.
    fn command(&self, args: &[&str]) -> Command {
        // Integration-test executables live one level below the crate's own
        // binaries in the target directory.
        let bin = std::env::current_exe()
            .expect("test exe")
            .parent()
            .and_then(Path::parent)
            .expect("target dir")
            .join("kiln");
        let mut cmd = Command::new(bin);
        cmd.args(args)
            .current_dir(self.root.path())
            .env_remove("NINJA_STATUS")
            .env_remove("MAKEFLAGS");
        cmd
    }

    /// Run kiln; the caller inspects status and output itself.
    fn kiln(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("spawn kiln")
    }

    /// Run kiln and demand success, handing back its stdout.
    fn build(&self, args: &[&str]) -> String {
        let out = self.kiln(args);
        assert!(
            out.status.success(),
            "kiln {:?} exited {:?}\n--- stdout\n{}--- stderr\n{}",
            args,
            out.status.code(),
            text(&out),
            String::from_utf8_lossy(&out.stderr),
        );
        text(&out)
    }

    /// Run a shell command in the scratch dir, for test setup that isn't
    /// kiln itself.
    #[cfg(unix)]
    fn sh(&self, script: &str) {
        let status = Command::new("sh")
            .arg("-c")
            .arg(script)
            .current_dir(self.root.path())
            .status()
            .expect("spawn sh");
        assert!(status.success(), "setup failed: {script}");
    }
}

fn text(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

const TOUCH_RULE: &str = "
rule touch
  command = touch $out
";

#[test]
fn empty_file() {
    let dir = BuildDir::with_manifest("");
    let out = dir.kiln(&[]);
    assert!(!out.status.success());
    assert!(
        text(&out).contains("no path specified and no default"),
        "{}",
        text(&out)
    );
}

#[test]
fn basic_build() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build out: touch in
",
    );
    dir.file("in", "");
    dir.build(&["out"]);
    assert!(dir.exists("out"));
}

#[cfg(unix)]
#[test]
fn hello_world_cat() {
    let dir = BuildDir::with_manifest(
        "
rule cat
  command = cat $in > $out
build out: cat a b
",
    );
    dir.file("a", "x").file("b", "y");

    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("ran 1 task"), "{stdout}");
    assert_eq!(dir.contents("out"), "xy");
    assert!(dir.exists(".ninja_log"));

    // A second invocation finds nothing to do.
    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("no work to do"), "{stdout}");
}

#[test]
fn create_subdir() {
    // An output in a directory that doesn't exist yet.
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build subdir/out: touch in
",
    );
    dir.file("in", "");
    dir.build(&["subdir/out"]);
    assert!(dir.exists("subdir/out"));
}

#[cfg(unix)]
#[test]
fn changed_command_reruns() {
    let manifest = |flag: &str| {
        format!(
            "
rule gen
  command = echo {flag} > $out
build out: gen in
"
        )
    };
    let dir = BuildDir::with_manifest(&manifest("one"));
    dir.file("in", "");
    dir.build(&["out"]);

    // Same command: up to date.
    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("no work to do"), "{stdout}");

    // Different command: the recorded hash no longer matches.
    dir.file("build.ninja", &manifest("two"));
    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("ran 1 task"), "{stdout}");
}

#[cfg(unix)]
#[test]
fn restat_skips_downstream() {
    let dir = BuildDir::with_manifest(
        "
rule sync
  command = cmp -s src out || cp src out
  restat = 1
build out: sync src trigger
rule cat
  command = cat $in > $out
build final: cat out
",
    );
    dir.file("src", "payload").file("trigger", "");

    let stdout = dir.build(&["final"]);
    assert!(stdout.contains("ran 2 tasks"), "{stdout}");

    // Touch only the trigger: the restat edge reruns without modifying its
    // output, so the downstream edge is skipped.
    dir.touch("trigger");
    let stdout = dir.build(&["final"]);
    assert!(stdout.contains("ran 1 task"), "{stdout}");

    // Change the source: the copy happens and downstream follows.
    dir.file("src", "new payload");
    let stdout = dir.build(&["final"]);
    assert!(stdout.contains("ran 2 tasks"), "{stdout}");
}

#[cfg(unix)]
#[test]
fn depfile_deps_are_recorded_and_used() {
    let dir = BuildDir::with_manifest(
        "
rule cc
  command = touch $out && echo \"$out: hdr\" > $out.d
  depfile = $out.d
  deps = gcc
build out: cc src
",
    );
    dir.file("src", "").file("hdr", "");

    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("ran 1 task"), "{stdout}");
    assert!(dir.exists(".ninja_deps"));
    // The depfile was folded into the deps log and removed.
    assert!(!dir.exists("out.d"));

    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("no work to do"), "{stdout}");

    // Touching the discovered header dirties the edge.
    dir.touch("hdr");
    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("ran 1 task"), "{stdout}");
}

#[cfg(unix)]
#[test]
fn failed_outputs_are_removed() {
    let dir = BuildDir::with_manifest(
        "
rule bad
  command = echo partial > $out && false
build out: bad in
",
    );
    dir.file("in", "");
    let out = dir.kiln(&["out"]);
    assert_eq!(out.status.code(), Some(1));
    // The half-written output must not survive to poison the next build.
    assert!(!dir.exists("out"));
}

#[cfg(unix)]
#[test]
fn keep_going_runs_independent_work() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
rule bad
  command = false
build bad1: bad in
build bad2: bad in
build good: touch in
",
    );
    dir.file("in", "");
    // -k 0 tolerates any number of failures; unrelated edges still run.
    let out = dir.kiln(&["-k", "0", "bad1", "bad2", "good"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(dir.exists("good"));
}

#[cfg(unix)]
#[test]
fn failure_threshold_stops_launches() {
    // With -j1 -k1 the first failure must prevent the second edge from
    // ever starting.
    let dir = BuildDir::with_manifest(
        "
rule bad
  command = false
rule touch
  command = touch $out
build b1: bad in
build later: touch in
",
    );
    dir.file("in", "");
    let out = dir.kiln(&["-j", "1", "-k", "1", "b1", "later"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!dir.exists("later"));
}

#[test]
fn phony_cascade() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build a: touch in
build b: touch in
build c: touch in
build all: phony a b c
",
    );
    dir.file("in", "");
    let stdout = dir.build(&["all"]);
    assert!(stdout.contains("ran 3 tasks"), "{stdout}");
    assert!(dir.exists("a") && dir.exists("b") && dir.exists("c"));
    // The phony target itself never becomes a file.
    assert!(!dir.exists("all"));

    // All inputs clean means the phony target is clean.
    let stdout = dir.build(&["all"]);
    assert!(stdout.contains("no work to do"), "{stdout}");
}

#[test]
fn order_only_inputs_do_not_dirty() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build out: touch in || oo
",
    );
    dir.file("in", "").file("oo", "");
    dir.build(&["out"]);

    // A newer order-only input does not trigger a rebuild.
    dir.touch("oo");
    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("no work to do"), "{stdout}");

    // A newer real input does.
    dir.touch("in");
    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("ran 1 task"), "{stdout}");
}

#[cfg(unix)]
#[test]
fn validation_runs_alongside() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build out: touch in |@ vout
build vout: touch vin
",
    );
    dir.file("in", "").file("vin", "");
    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("ran 2 tasks"), "{stdout}");
    assert!(dir.exists("vout"));
}

#[cfg(unix)]
#[test]
fn dyndep_discovers_outputs() {
    let dir = BuildDir::with_manifest(
        "
rule gen_dd
  command = printf 'ninja_dyndep_version = 1\\nbuild out | out2: dyndep\\n' > $out
build dd: gen_dd
rule write2
  command = touch out out2
build out: write2 src
  dyndep = dd
",
    );
    dir.file("src", "");
    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("ran 2 tasks"), "{stdout}");
    assert!(dir.exists("out2"));

    let stdout = dir.build(&["out"]);
    assert!(stdout.contains("no work to do"), "{stdout}");
}

#[cfg(unix)]
#[test]
fn dyndep_cycle_is_fatal() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
rule gen_dd
  command = printf 'ninja_dyndep_version = 1\\nbuild out: dyndep | loop\\n' > $out
build dd: gen_dd
build loop: touch out
build out: touch src
  dyndep = dd
",
    );
    dir.file("src", "");
    let out = dir.kiln(&["out"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(text(&out).contains("dependency cycle"), "{}", text(&out));
    // Nothing in the new cycle ran.
    assert!(!dir.exists("out"));
}

#[test]
fn static_cycle_is_fatal() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build a: touch b
build b: touch a
",
    );
    let out = dir.kiln(&["a"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(text(&out).contains("dependency cycle"), "{}", text(&out));
}

#[test]
fn duplicate_output_is_manifest_error() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build out: touch a
build out: touch b
",
    );
    let out = dir.kiln(&["out"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(
        text(&out).contains("multiple rules generate out"),
        "{}",
        text(&out)
    );
}

#[test]
fn unknown_rule_is_manifest_error() {
    let dir = BuildDir::with_manifest("build out: nonesuch in\n");
    let out = dir.kiln(&["out"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(
        text(&out).contains("unknown rule 'nonesuch'"),
        "{}",
        text(&out)
    );
}

#[test]
fn unknown_target_fails() {
    let dir = BuildDir::with_manifest(TOUCH_RULE);
    let out = dir.kiln(&["nonesuch"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(
        text(&out).contains("unknown target 'nonesuch'"),
        "{}",
        text(&out)
    );
}

#[test]
fn missing_source_is_reported() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build out: touch absent
",
    );
    let out = dir.kiln(&["out"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(
        text(&out).contains("'absent', needed by 'out', missing"),
        "{}",
        text(&out)
    );
}

#[test]
fn default_targets_are_used() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build a: touch in
build b: touch in
default a
",
    );
    dir.file("in", "");
    dir.build(&[]);
    assert!(dir.exists("a"));
    assert!(!dir.exists("b"));
}

#[test]
fn dry_run_runs_nothing() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
build out: touch in
",
    );
    dir.file("in", "");
    let stdout = dir.build(&["-n", "out"]);
    assert!(stdout.contains("ran 1 task"), "{stdout}");
    assert!(!dir.exists("out"));
}

#[cfg(unix)]
#[test]
fn rspfile_is_written_and_cleaned_up() {
    let dir = BuildDir::with_manifest(
        "
rule resp
  command = cp $out.rsp $out
  rspfile = $out.rsp
  rspfile_content = payload for $out
build out: resp in
",
    );
    dir.file("in", "");
    dir.build(&["out"]);
    assert_eq!(dir.contents("out"), "payload for out");
    // The response file is deleted once the command succeeds.
    assert!(!dir.exists("out.rsp"));
}

#[cfg(unix)]
#[test]
fn pool_depth_serializes_edges() {
    let dir = BuildDir::with_manifest(
        "
pool serial
  depth = 1
rule slow
  command = echo start >> log && sleep 0.2 && echo end >> log && touch $out
  pool = serial
build a: slow in
build b: slow in
",
    );
    dir.file("in", "");
    dir.build(&["-j", "4", "a", "b"]);
    // Depth 1 means the two commands never overlapped.
    assert_eq!(dir.contents("log"), "start\nend\nstart\nend\n");
}

#[cfg(unix)]
#[test]
fn console_pool_edge_runs() {
    let dir = BuildDir::with_manifest(
        "
rule announce
  command = touch $out
  pool = console
build out: announce in
",
    );
    dir.file("in", "");
    dir.build(&["out"]);
    assert!(dir.exists("out"));
}

#[cfg(unix)]
#[test]
fn ninja_status_prefixes_output() {
    let dir = BuildDir::with_manifest(
        "
rule touch
  command = touch $out
  description = TOUCH $out
build out: touch in
",
    );
    dir.file("in", "");
    let out = {
        let mut cmd = dir.command(&["out"]);
        cmd.env("NINJA_STATUS", "<%s/%t> ");
        cmd.output().expect("spawn kiln")
    };
    assert!(out.status.success());
    assert!(text(&out).contains("<1/1> TOUCH out"), "{}", text(&out));
}

#[test]
fn builddir_holds_logs() {
    let dir = BuildDir::with_manifest(
        "
builddir = state
rule touch
  command = touch $out
build out: touch in
",
    );
    dir.file("in", "");
    dir.build(&["out"]);
    assert!(dir.exists("state/.ninja_log"));
    assert!(!dir.exists(".ninja_log"));
}

#[cfg(unix)]
#[test]
fn include_and_subninja() {
    let dir = BuildDir::with_manifest(
        "
include rules.ninja
subninja sub.ninja
build out: touch in
",
    );
    dir.file(
        "rules.ninja",
        "
rule touch
  command = touch $out
",
    );
    dir.file(
        "sub.ninja",
        "
rule subtouch
  command = touch $out
build subout: subtouch in
",
    );
    dir.file("in", "");
    let stdout = dir.build(&["out", "subout"]);
    assert!(stdout.contains("ran 2 tasks"), "{stdout}");
}

#[cfg(unix)]
#[test]
fn generator_regenerates_manifest() {
    // The manifest is itself produced by a generator edge, as when a
    // meta-build tool owns build.ninja.
    let dir = BuildDir::with_manifest("");
    dir.file(
        "configure.sh",
        "printf 'rule configure\\n  command = sh ./configure.sh\\n  generator = 1\\n\
build build.ninja: configure configure.sh\\n\
rule touch\\n  command = touch $out\\nbuild stamp: touch\\n' > build.ninja
",
    );
    dir.sh("sh ./configure.sh");

    let stdout = dir.build(&["stamp"]);
    assert!(stdout.contains("ran 1 task"), "{stdout}");

    let stdout = dir.build(&["stamp"]);
    assert!(stdout.contains("no work to do"), "{stdout}");

    // A newer generator input rewrites the manifest before the (empty)
    // main build.
    dir.touch("configure.sh");
    let before = std::fs::metadata(dir.path("build.ninja"))
        .and_then(|meta| meta.modified())
        .expect("manifest mtime");
    let stdout = dir.build(&["stamp"]);
    assert!(stdout.contains("no work to do"), "{stdout}");
    let after = std::fs::metadata(dir.path("build.ninja"))
        .and_then(|meta| meta.modified())
        .expect("manifest mtime");
    assert!(after > before, "manifest was not regenerated");
}

#[cfg(unix)]
#[test]
fn command_output_printed_once() {
    let dir = BuildDir::with_manifest(
        "
rule loud
  command = echo message from child && touch $out
  description = LOUD $out
build out: loud in
",
    );
    dir.file("in", "");
    let stdout = dir.build(&["out"]);
    assert_eq!(
        stdout.matches("message from child").count(),
        1,
        "{stdout}"
    );
}
