//! Runs a command via posix_spawn, with stdout and stderr merged into one
//! pipe.  Rust's std::process can't express the merged pipe, so this speaks
//! libc directly.
//!
//! Non-console children are placed in their own process group so the driver
//! can signal a whole command's process tree on cancellation.  Console
//! children inherit our stdio and stay in our group, so terminal-generated
//! signals reach them on their own.

use crate::process::Termination;
use std::io::Read;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::os::unix::process::ExitStatusExt;

extern "C" {
    static environ: *const *mut libc::c_char;
}

/// Check a -1-on-error syscall return, reading errno.
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret < 0 {
        anyhow::bail!("{}: {}", func, std::io::Error::last_os_error());
    }
    Ok(())
}

/// Check a posix_spawn-family return, which is the error number itself.
fn check_spawn(func: &str, err: libc::c_int) -> anyhow::Result<()> {
    if err != 0 {
        anyhow::bail!("{}: {}", func, std::io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Wraps libc::posix_spawn_file_actions_t, in particular to implement Drop.
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_spawn(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

/// Wraps libc::posix_spawnattr_t, likewise for Drop.
struct PosixSpawnAttr(libc::posix_spawnattr_t);

impl PosixSpawnAttr {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut attr: libc::posix_spawnattr_t = std::mem::zeroed();
            check_spawn("posix_spawnattr_init", libc::posix_spawnattr_init(&mut attr))?;
            Ok(Self(attr))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawnattr_t {
        &mut self.0
    }

    /// Put the child in a fresh process group of its own.
    fn set_new_pgroup(&mut self) -> anyhow::Result<()> {
        unsafe {
            check_spawn(
                "posix_spawnattr_setpgroup",
                libc::posix_spawnattr_setpgroup(&mut self.0, 0),
            )?;
            check_spawn(
                "posix_spawnattr_setflags",
                libc::posix_spawnattr_setflags(
                    &mut self.0,
                    libc::POSIX_SPAWN_SETPGROUP as libc::c_short,
                ),
            )
        }
    }
}

impl Drop for PosixSpawnAttr {
    fn drop(&mut self) {
        unsafe { libc::posix_spawnattr_destroy(&mut self.0) };
    }
}

/// Run `cmdline` under /bin/sh, returning its termination and captured
/// output.  `spawned` is called with the child's pid as soon as it exists,
/// so the caller can signal it later.
pub fn run_command(
    cmdline: &str,
    use_console: bool,
    spawned: &mut dyn FnMut(libc::pid_t),
) -> anyhow::Result<(Termination, Vec<u8>)> {
    let mut pipe_read: Option<std::fs::File> = None;
    let pid = unsafe {
        let mut actions = PosixSpawnFileActions::new()?;
        let mut attr = PosixSpawnAttr::new()?;
        let mut pipe: [libc::c_int; 2] = std::mem::zeroed();

        if !use_console {
            check_posix("pipe", libc::pipe(&mut pipe as *mut i32))?;
            // stdout/stderr => pipe
            actions.adddup2(pipe[1], 1)?;
            actions.adddup2(pipe[1], 2)?;
            // close pipe fds in the child
            actions.addclose(pipe[0])?;
            actions.addclose(pipe[1])?;
            attr.set_new_pgroup()?;
        }

        let path = c"/bin/sh".as_ptr();
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv: [*const libc::c_char; 4] = [
            path,
            c"-c".as_ptr(),
            cmdline_nul.as_ptr(),
            std::ptr::null(),
        ];

        let mut pid: libc::pid_t = 0;
        check_spawn(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                path,
                actions.as_ptr(),
                attr.as_ptr(),
                argv.as_ptr() as *const *mut libc::c_char,
                environ,
            ),
        )?;

        if !use_console {
            check_posix("close", libc::close(pipe[1]))?;
            pipe_read = Some(std::fs::File::from_raw_fd(pipe[0]));
        }
        pid
    };
    spawned(pid);

    let mut output = Vec::new();
    if let Some(mut pipe) = pipe_read {
        pipe.read_to_end(&mut output)?;
    }

    let status = unsafe {
        let mut status: i32 = 0;
        check_posix("waitpid", libc::waitpid(pid, &mut status, 0))?;
        std::process::ExitStatus::from_raw(status)
    };

    let mut termination = Termination::Success;
    if !status.success() {
        termination = Termination::Failure;
        if let Some(sig) = status.signal() {
            match sig {
                libc::SIGINT | libc::SIGTERM | libc::SIGHUP => {
                    write!(output, "interrupted")?;
                    termination = Termination::Interrupted;
                }
                _ => write!(output, "signal {}", sig)?,
            }
        }
    }

    Ok((termination, output))
}

/// Send a signal to a child's process group.
pub fn kill_child(pid: libc::pid_t, sig: i32) {
    unsafe {
        libc::kill(-pid, sig);
    }
}
