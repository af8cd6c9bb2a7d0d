//! Build progress tracking and reporting, for display to the user.

use crate::{
    graph::Build, graph::BuildId, process::Termination, task::TaskResult, terminal,
    work::BuildState, work::StateCounts,
};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// Compute the message to display on the console for a given build.
pub fn build_message(build: &Build) -> &str {
    build
        .desc
        .as_ref()
        .filter(|desc| !desc.is_empty())
        .or(build.cmdline.as_ref())
        .map(String::as_str)
        .unwrap_or("phony")
}

/// One directive of a NINJA_STATUS-style progress format string.
#[derive(Debug, PartialEq)]
enum StatusChunk {
    Literal(String),
    /// %s: started edges.
    Started,
    /// %f: finished edges.
    Finished,
    /// %t: total edges in the plan.
    Total,
    /// %r: currently running edges.
    Running,
    /// %u: not-yet-started edges.
    Remaining,
    /// %p: percentage of started edges.
    Percent,
    /// %e: elapsed seconds.
    Elapsed,
}

/// Parsed NINJA_STATUS format, rendered in front of build messages.
pub struct StatusFormat(Vec<StatusChunk>);

impl StatusFormat {
    pub fn from_env() -> Self {
        let fmt = std::env::var("NINJA_STATUS").unwrap_or_else(|_| "[%f/%t] ".to_owned());
        Self::parse(&fmt)
    }

    fn parse(fmt: &str) -> Self {
        let mut chunks = Vec::new();
        let mut literal = String::new();
        let mut chars = fmt.chars();
        while let Some(c) = chars.next() {
            if c != '%' {
                literal.push(c);
                continue;
            }
            let directive = match chars.next() {
                Some('s') => Some(StatusChunk::Started),
                Some('f') => Some(StatusChunk::Finished),
                Some('t') => Some(StatusChunk::Total),
                Some('r') => Some(StatusChunk::Running),
                Some('u') => Some(StatusChunk::Remaining),
                Some('p') => Some(StatusChunk::Percent),
                Some('e') => Some(StatusChunk::Elapsed),
                Some('%') => {
                    literal.push('%');
                    None
                }
                // Unknown directives pass through untouched.
                Some(other) => {
                    literal.push('%');
                    literal.push(other);
                    None
                }
                None => {
                    literal.push('%');
                    None
                }
            };
            if let Some(directive) = directive {
                if !literal.is_empty() {
                    chunks.push(StatusChunk::Literal(std::mem::take(&mut literal)));
                }
                chunks.push(directive);
            }
        }
        if !literal.is_empty() {
            chunks.push(StatusChunk::Literal(literal));
        }
        StatusFormat(chunks)
    }

    pub fn render(&self, counts: &StateCounts, running: usize, start: Instant) -> String {
        let total = counts.total();
        let finished = counts.get(BuildState::Done) + counts.get(BuildState::Failed);
        let started = finished + running;
        let mut out = String::new();
        for chunk in &self.0 {
            match chunk {
                StatusChunk::Literal(s) => out.push_str(s),
                StatusChunk::Started => out.push_str(&started.to_string()),
                StatusChunk::Finished => out.push_str(&finished.to_string()),
                StatusChunk::Total => out.push_str(&total.to_string()),
                StatusChunk::Running => out.push_str(&running.to_string()),
                StatusChunk::Remaining => {
                    out.push_str(&total.saturating_sub(started).to_string())
                }
                StatusChunk::Percent => {
                    let pct = if total == 0 { 0 } else { started * 100 / total };
                    out.push_str(&format!("{:3}%", pct));
                }
                StatusChunk::Elapsed => {
                    out.push_str(&format!("{:.3}", start.elapsed().as_secs_f64()))
                }
            }
        }
        out
    }
}

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as build tasks progress through build states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a task starts.
    fn task_started(&mut self, id: BuildId, build: &Build);

    /// Called when a task completes; the task's full output arrives here.
    fn task_finished(&mut self, id: BuildId, build: &Build, result: &TaskResult);

    /// Log a line of output without corrupting the progress display.
    /// The line persists beyond further progress updates, so failures stay
    /// visible even when more work runs after them.
    fn log(&mut self, msg: &str);
}

/// Progress implementation that prints nothing, for tests and dry runs with
/// -quiet semantics.
#[derive(Default)]
pub struct NoProgress {}

impl Progress for NoProgress {
    fn update(&mut self, _counts: &StateCounts) {}
    fn task_started(&mut self, _id: BuildId, _build: &Build) {}
    fn task_finished(&mut self, _id: BuildId, _build: &Build, _result: &TaskResult) {}
    fn log(&mut self, _msg: &str) {}
}

/// Progress implementation for a "dumb" console, without any overprinting:
/// one status-prefixed line as each task starts.
pub struct DumbConsoleProgress {
    /// Whether to print command lines of started programs.
    verbose: bool,
    status: StatusFormat,
    start: Instant,
    counts: StateCounts,
    running: usize,
    /// The id of the last command printed, to avoid printing it twice when
    /// we have two updates from the same command in a row.
    last_started: Option<BuildId>,
}

impl DumbConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            status: StatusFormat::from_env(),
            start: Instant::now(),
            counts: StateCounts::default(),
            running: 0,
            last_started: None,
        }
    }
}

impl Progress for DumbConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        self.counts = counts.clone();
    }

    fn task_started(&mut self, id: BuildId, build: &Build) {
        self.running += 1;
        let msg = if self.verbose {
            build.cmdline.as_deref().unwrap_or("phony")
        } else {
            build_message(build)
        };
        self.log(&format!(
            "{}{}",
            self.status.render(&self.counts, self.running, self.start),
            msg
        ));
        self.last_started = Some(id);
    }

    fn task_finished(&mut self, id: BuildId, build: &Build, result: &TaskResult) {
        self.running = self.running.saturating_sub(1);
        match result.termination {
            Termination::Success => {
                if result.output.is_empty() || self.last_started == Some(id) {
                    // Output is empty, or we just printed the command;
                    // don't print it again.
                } else {
                    self.log(build_message(build))
                }
            }
            Termination::Interrupted => self.log(&format!("interrupted: {}", build_message(build))),
            Termination::Failure => self.log(&format!("failed: {}", build_message(build))),
        };
        if !result.output.is_empty() {
            let _ = std::io::stdout().write_all(&result.output);
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Progress implementation for a "fancy" console, with a progress bar.
/// Each time it prints it clears from the cursor to the end of the console,
/// prints the status text, and then moves the cursor back up to the start
/// position.  This means on errors etc. we can clear any status by clearing
/// the console too.
pub struct FancyConsoleProgress {
    state: Arc<Mutex<FancyState>>,
}

/// Screen updates happen after this duration passes, to reduce the amount
/// of printing in the case of rapid updates and the flicker that causes.
const UPDATE_DELAY: Duration = Duration::from_millis(50);

impl FancyConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        let dirty_cond = Arc::new(Condvar::new());
        let state = Arc::new(Mutex::new(FancyState {
            done: false,
            dirty: false,
            dirty_cond: dirty_cond.clone(),
            status: StatusFormat::from_env(),
            start: Instant::now(),
            counts: StateCounts::default(),
            tasks: VecDeque::new(),
            verbose,
        }));

        // Thread to debounce status updates: waits a bit after any dirtying
        // change, then redraws.  The timeout also refreshes the elapsed
        // times shown for long-running tasks.
        std::thread::spawn({
            let state = state.clone();
            move || loop {
                {
                    let (state, _) = dirty_cond
                        .wait_timeout_while(
                            state.lock().unwrap(),
                            Duration::from_millis(500),
                            |state| !state.dirty,
                        )
                        .unwrap();
                    if state.done {
                        break;
                    }
                }

                // Let more updates arrive before printing.
                std::thread::sleep(UPDATE_DELAY);

                state.lock().unwrap().print_progress();
            }
        });

        FancyConsoleProgress { state }
    }
}

impl Progress for FancyConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        self.state.lock().unwrap().update(counts);
    }

    fn task_started(&mut self, id: BuildId, build: &Build) {
        self.state.lock().unwrap().task_started(id, build);
    }

    fn task_finished(&mut self, id: BuildId, build: &Build, result: &TaskResult) {
        self.state.lock().unwrap().task_finished(id, build, result);
    }

    fn log(&mut self, msg: &str) {
        self.state.lock().unwrap().log(msg);
    }
}

impl Drop for FancyConsoleProgress {
    fn drop(&mut self) {
        self.state.lock().unwrap().cleanup();
    }
}

/// Currently running build task, as tracked for progress updates.
struct Task {
    id: BuildId,
    /// When the task started running.
    start: Instant,
    /// Build status message for the task.
    message: String,
}

struct FancyState {
    done: bool,
    dirty: bool,
    dirty_cond: Arc<Condvar>,

    status: StatusFormat,
    start: Instant,
    /// Counts of tasks in each state.
    counts: StateCounts,
    /// Build tasks that are currently executing, oldest first.
    tasks: VecDeque<Task>,
    /// Whether to print command lines of started programs.
    verbose: bool,
}

impl FancyState {
    fn dirty(&mut self) {
        self.dirty = true;
        self.dirty_cond.notify_one();
    }

    fn update(&mut self, counts: &StateCounts) {
        self.counts = counts.clone();
        self.dirty();
    }

    fn task_started(&mut self, id: BuildId, build: &Build) {
        if self.verbose {
            let cmdline = build.cmdline.clone().unwrap_or_else(|| "phony".to_owned());
            self.log(&cmdline);
        }
        self.tasks.push_back(Task {
            id,
            start: Instant::now(),
            message: build_message(build).to_string(),
        });
        self.dirty();
    }

    fn task_finished(&mut self, id: BuildId, build: &Build, result: &TaskResult) {
        if let Some(pos) = self.tasks.iter().position(|t| t.id == id) {
            self.tasks.remove(pos);
        }
        match result.termination {
            Termination::Success => {
                if result.output.is_empty() {
                    // Common case: don't show anything.
                } else {
                    self.log(build_message(build))
                }
            }
            Termination::Interrupted => self.log(&format!("interrupted: {}", build_message(build))),
            Termination::Failure => self.log(&format!("failed: {}", build_message(build))),
        };
        if !result.output.is_empty() {
            self.clear_progress();
            let _ = std::io::stdout().write_all(&result.output);
        }
        self.dirty();
    }

    fn log(&mut self, msg: &str) {
        self.clear_progress();
        println!("{}", msg);
        self.dirty();
    }

    fn cleanup(&mut self) {
        self.clear_progress();
        self.done = true;
        self.dirty(); // let the redraw thread quit
    }

    fn clear_progress(&self) {
        // The user may have typed on the current line; \r first, then clear
        // everything below.
        let _ = std::io::stdout().write_all(b"\r\x1b[J");
    }

    fn print_progress(&mut self) {
        self.clear_progress();
        let mut progress_line = format!(
            "[{}] {}",
            progress_bar(&self.counts, 40),
            self.status.render(&self.counts, self.tasks.len(), self.start)
        );
        let failed = self.counts.get(BuildState::Failed);
        if failed > 0 {
            progress_line.push_str(&format!("{} failed", failed));
        }
        println!("{}", progress_line);
        let mut lines = 1;

        let max_cols = terminal::get_cols().unwrap_or(80);
        let max_tasks = 8;
        let now = Instant::now();
        for task in self.tasks.iter().take(max_tasks) {
            let delta = now.duration_since(task.start).as_secs() as usize;
            println!("{}", task_message(&task.message, delta, max_cols));
            lines += 1;
        }

        if self.tasks.len() > max_tasks {
            println!("...and {} more", self.tasks.len() - max_tasks);
            lines += 1;
        }

        // Move cursor up to the first printed line, for overprinting.
        print!("\x1b[{}A", lines);
        self.dirty = false;
    }
}

/// Format a task's status message to optionally include how long it has been
/// running and to fit within a maximum number of terminal columns.
fn task_message(message: &str, seconds: usize, max_cols: usize) -> String {
    let time_note = if seconds > 2 {
        format!(" ({}s)", seconds)
    } else {
        "".into()
    };
    let mut out = message.to_owned();
    if out.len() + time_note.len() >= max_cols {
        out.truncate(max_cols - time_note.len() - 3);
        out.push_str("...");
    }
    out.push_str(&time_note);
    out
}

/// Render a StateCounts as an ASCII progress bar.
fn progress_bar(counts: &StateCounts, bar_size: usize) -> String {
    let mut bar = String::with_capacity(bar_size);
    let mut sum: usize = 0;
    let total = counts.total();
    if total == 0 {
        return " ".repeat(bar_size);
    }
    for (count, ch) in [
        (
            counts.get(BuildState::Done) + counts.get(BuildState::Failed),
            '=',
        ),
        (
            counts.get(BuildState::Ready) + counts.get(BuildState::Running),
            '-',
        ),
        (counts.get(BuildState::Want), ' '),
    ] {
        sum += count;
        let mut target_size = sum * bar_size / total;
        if count > 0 && target_size == bar.len() && target_size < bar_size {
            // Always give a non-zero count at least one tick.
            target_size += 1;
        }
        while bar.len() < target_size {
            bar.push(ch);
        }
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_rendering() {
        let mut counts = StateCounts::default();

        // Don't crash when showing progress before having any tasks.
        assert_eq!(progress_bar(&counts, 10), "          ");

        counts.add(BuildState::Want, 100);
        assert_eq!(progress_bar(&counts, 10), "          ");

        // Half want -> ready.
        counts.add(BuildState::Want, -50);
        counts.add(BuildState::Ready, 50);
        assert_eq!(progress_bar(&counts, 10), "-----     ");

        // One ready -> done.
        counts.add(BuildState::Ready, -1);
        counts.add(BuildState::Done, 1);
        assert_eq!(progress_bar(&counts, 10), "=----     ");

        // All but one want -> ready.
        counts.add(BuildState::Want, -49);
        counts.add(BuildState::Ready, 49);
        assert_eq!(progress_bar(&counts, 10), "=-------- ");

        // All want -> ready.
        counts.add(BuildState::Want, -1);
        counts.add(BuildState::Ready, 1);
        assert_eq!(progress_bar(&counts, 10), "=---------");
    }

    #[test]
    fn task_rendering() {
        assert_eq!(task_message("building foo.o", 0, 80), "building foo.o");
        assert_eq!(task_message("building foo.o", 0, 10), "buildin...");
        assert_eq!(task_message("building foo.o", 0, 5), "bu...");
    }

    #[test]
    fn task_rendering_with_time() {
        assert_eq!(task_message("building foo.o", 5, 80), "building foo.o (5s)");
        assert_eq!(task_message("building foo.o", 5, 10), "bu... (5s)");
    }

    fn counts_with(done: usize, want: usize) -> StateCounts {
        let mut counts = StateCounts::default();
        counts.add(BuildState::Done, done as isize);
        counts.add(BuildState::Want, want as isize);
        counts
    }

    #[test]
    fn status_format_default_style() {
        let fmt = StatusFormat::parse("[%f/%t] ");
        let rendered = fmt.render(&counts_with(1, 2), 0, Instant::now());
        assert_eq!(rendered, "[1/3] ");
    }

    #[test]
    fn status_format_directives() {
        let fmt = StatusFormat::parse("%s started %r running %u left %%");
        let rendered = fmt.render(&counts_with(2, 3), 1, Instant::now());
        assert_eq!(rendered, "3 started 1 running 2 left %");
    }

    #[test]
    fn status_format_percent() {
        let fmt = StatusFormat::parse("%p");
        assert_eq!(fmt.render(&counts_with(1, 1), 0, Instant::now()), " 50%");
    }
}
