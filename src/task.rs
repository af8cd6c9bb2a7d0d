//! Runs build tasks, potentially in parallel.
//! Unaware of the build graph, pools, etc.; just command execution, plus the
//! ingestion of dependency information the command leaves behind (a depfile,
//! or /showIncludes lines in its output).
//!
//! Each running task gets one thread that blocks on its child process and
//! reports back over a channel; the driver stays single-threaded.

use crate::{
    depfile,
    graph::{BuildId, DepsStyle, RspFile},
    process::{self, Termination},
    scanner::{self, Scanner},
};
use anyhow::anyhow;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

/// The prefix cl.exe prints for `/showIncludes` output in an English locale;
/// `msvc_deps_prefix` overrides it for others.
pub const DEFAULT_MSVC_DEPS_PREFIX: &str = "Note: including file:";

pub struct FinishedTask {
    /// A (faked) "thread id", used to put different finished builds in
    /// different tracks in a performance trace.
    pub tid: usize,
    pub buildid: BuildId,
    pub span: (Instant, Instant),
    pub result: TaskResult,
}

/// The result of executing a build step.
pub struct TaskResult {
    pub termination: Termination,
    /// Console output, delivered in one piece on completion.
    pub output: Vec<u8>,
    pub discovered_deps: Option<Vec<String>>,
}

/// Everything the runner needs to execute one edge's command.
pub struct TaskSpec {
    pub cmdline: String,
    /// First declared output, used to pick the right depfile entry.
    pub first_output: String,
    pub depfile: Option<String>,
    pub rspfile: Option<RspFile>,
    pub deps_style: DepsStyle,
    pub msvc_deps_prefix: Option<String>,
    pub use_console: bool,
}

/// Reads dependencies from a depfile the command wrote, verifying it names
/// the output we ran it for.
fn read_depfile(path: &Path, first_output: &str) -> anyhow::Result<Vec<String>> {
    let bytes = scanner::read_file_with_nul(path)
        .map_err(|err| anyhow!("read {}: {}", path.display(), err))?;
    let mut scanner = Scanner::new(&bytes);
    let parsed = depfile::parse(&mut scanner)
        .map_err(|err| anyhow!(scanner.format_parse_error(path, err)))?;
    let mut deps: Option<Vec<String>> = None;
    for (target, target_deps) in parsed.into_iter() {
        if crate::canon::canon_path(target) == first_output {
            deps = Some(target_deps);
            break;
        }
    }
    deps.ok_or_else(|| {
        anyhow!(
            "expected depfile {} to mention {}",
            path.display(),
            first_output
        )
    })
}

/// Split /showIncludes lines out of captured output: lines starting with the
/// prefix become dependencies, everything else is kept for the user.
fn parse_showincludes(prefix: &str, output: &[u8]) -> (Vec<u8>, Vec<String>) {
    let mut kept = Vec::with_capacity(output.len());
    let mut deps = Vec::new();
    let mut seen = HashSet::new();
    for line in output.split_inclusive(|&b| b == b'\n') {
        let text = line.strip_suffix(b"\n").unwrap_or(line);
        let text = text.strip_suffix(b"\r").unwrap_or(text);
        let dep = std::str::from_utf8(text)
            .ok()
            .and_then(|text| text.strip_prefix(prefix));
        match dep {
            Some(dep) if !dep.trim().is_empty() => {
                let dep = dep.trim().to_owned();
                if seen.insert(dep.clone()) {
                    deps.push(dep);
                }
            }
            _ => kept.extend_from_slice(line),
        }
    }
    (kept, deps)
}

fn write_rspfile(rspfile: &RspFile) -> anyhow::Result<()> {
    if let Some(parent) = rspfile.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&rspfile.path, &rspfile.content)?;
    Ok(())
}

/// Executes a build task as a subprocess.
/// Returns an Err() only when we failed outside of the process itself.
fn run_task(spec: &TaskSpec, spawned: &mut dyn FnMut(i32)) -> anyhow::Result<TaskResult> {
    if let Some(rspfile) = &spec.rspfile {
        write_rspfile(rspfile)?;
    }

    let (termination, mut output) =
        process::run_command(&spec.cmdline, spec.use_console, spawned)?;

    let mut discovered_deps = None;
    if termination == Termination::Success {
        if let Some(depfile) = &spec.depfile {
            let path = Path::new(depfile);
            discovered_deps = Some(read_depfile(path, &spec.first_output)?);
            // The deps now live in the deps log; drop the file.
            let _ = std::fs::remove_file(path);
        } else if spec.deps_style == DepsStyle::Msvc {
            let prefix = spec
                .msvc_deps_prefix
                .as_deref()
                .unwrap_or(DEFAULT_MSVC_DEPS_PREFIX);
            let (kept, deps) = parse_showincludes(prefix, &output);
            output = kept;
            discovered_deps = Some(deps);
        }
        if let Some(rspfile) = &spec.rspfile {
            let _ = std::fs::remove_file(&rspfile.path);
        }
    }

    Ok(TaskResult {
        termination,
        output,
        discovered_deps,
    })
}

/// Tracks faked "thread ids" -- integers assigned to build tasks to track
/// parallelism in perf trace output.
#[derive(Default)]
struct ThreadIds {
    /// An entry is true when claimed, false or nonexistent otherwise.
    slots: Vec<bool>,
}

impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                let idx = self.slots.len();
                self.slots.push(true);
                idx
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

pub struct Runner {
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    running: usize,
    tids: ThreadIds,
    parallelism: usize,
    /// Pids of running children, keyed by tid, for cancellation.
    pids: Arc<Mutex<HashMap<usize, i32>>>,
}

impl Runner {
    pub fn new(parallelism: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::default(),
            parallelism,
            pids: Default::default(),
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.parallelism
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn start(&mut self, id: BuildId, spec: TaskSpec) {
        let tid = self.tids.claim();
        let tx = self.finished_send.clone();
        let pids = self.pids.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = {
                let mut register = |pid: i32| {
                    pids.lock().unwrap().insert(tid, pid);
                };
                run_task(&spec, &mut register).unwrap_or_else(|err| TaskResult {
                    termination: Termination::Failure,
                    output: err.to_string().into_bytes(),
                    discovered_deps: None,
                })
            };
            pids.lock().unwrap().remove(&tid);
            let finish = Instant::now();

            let task = FinishedTask {
                tid,
                buildid: id,
                span: (start, finish),
                result,
            };
            // The send only fails if the receiver is gone, e.g. shutdown.
            let _ = tx.send(task);
        });
        self.running += 1;
    }

    /// Wait up to `timeout` for a task to complete; None on timeout, so the
    /// caller can notice signals between completions.
    pub fn wait(&mut self, timeout: Duration) -> Option<FinishedTask> {
        match self.finished_recv.recv_timeout(timeout) {
            Ok(task) => {
                self.tids.release(task.tid);
                self.running -= 1;
                Some(task)
            }
            Err(_) => None,
        }
    }

    /// Forward a cancellation signal to every running child.
    pub fn kill_all(&self, sig: i32) {
        for (_tid, &pid) in self.pids.lock().unwrap().iter() {
            process::kill_child(pid, sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn showincludes_lines_become_deps() {
        let output = b"foo.c\nNote: including file: a.h\nNote: including file:   b/c.h\nwarning: x\n";
        let (kept, deps) = parse_showincludes(DEFAULT_MSVC_DEPS_PREFIX, output);
        assert_eq!(kept, b"foo.c\nwarning: x\n");
        assert_eq!(deps, vec!["a.h".to_owned(), "b/c.h".to_owned()]);
    }

    #[test]
    fn showincludes_deduplicates() {
        let output = b"Note: including file: a.h\nNote: including file: a.h\n";
        let (kept, deps) = parse_showincludes(DEFAULT_MSVC_DEPS_PREFIX, output);
        assert!(kept.is_empty());
        assert_eq!(deps, vec!["a.h".to_owned()]);
    }

    #[test]
    fn depfile_must_mention_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.d");
        std::fs::write(&path, "other.o: a.h\n").unwrap();
        let err = read_depfile(&path, "out.o").unwrap_err();
        assert!(err.to_string().contains("to mention out.o"), "{}", err);
    }

    #[test]
    fn depfile_entry_selected_by_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.d");
        std::fs::write(&path, "./out.o: a.h b.h\n").unwrap();
        let deps = read_depfile(&path, "out.o").unwrap();
        assert_eq!(deps, vec!["a.h".to_owned(), "b.h".to_owned()]);
    }

    #[cfg(unix)]
    #[test]
    fn command_output_is_captured() {
        let spec = TaskSpec {
            cmdline: "echo hello; echo oops >&2".to_owned(),
            first_output: "out".to_owned(),
            depfile: None,
            rspfile: None,
            deps_style: DepsStyle::None,
            msvc_deps_prefix: None,
            use_console: false,
        };
        let result = run_task(&spec, &mut |_| {}).unwrap();
        assert_eq!(result.termination, Termination::Success);
        // stdout and stderr are merged into one stream.
        let text = String::from_utf8(result.output).unwrap();
        assert!(text.contains("hello"), "{:?}", text);
        assert!(text.contains("oops"), "{:?}", text);
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_reports_failure() {
        let spec = TaskSpec {
            cmdline: "exit 3".to_owned(),
            first_output: "out".to_owned(),
            depfile: None,
            rspfile: None,
            deps_style: DepsStyle::None,
            msvc_deps_prefix: None,
            use_console: false,
        };
        let result = run_task(&spec, &mut |_| {}).unwrap();
        assert_eq!(result.termination, Termination::Failure);
    }
}
