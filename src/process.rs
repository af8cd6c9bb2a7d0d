//! Child process execution, implemented per-platform.

#[cfg(unix)]
pub use crate::process_posix::{kill_child, run_command};
#[cfg(windows)]
pub use crate::process_win::{kill_child, run_command};

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    /// Ended due to an interrupt (e.g. ctrl-c); the whole build should stop.
    Interrupted,
    Failure,
}
