//! Runs a command via CreateProcess, with stdout and stderr merged into one
//! anonymous pipe.  `cmd /c` is avoided because it caps the command line at
//! 8k; the string is handed to CreateProcess unchanged, which std's process
//! API can't do.

use crate::process::Termination;
use std::io::Read;
use std::os::windows::io::FromRawHandle;
use windows_sys::Win32::Foundation::{
    CloseHandle, SetHandleInformation, HANDLE, HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::Threading::{
    CreateProcessA, GetExitCodeProcess, OpenProcess, TerminateProcess, WaitForSingleObject,
    CREATE_NEW_PROCESS_GROUP, INFINITE, PROCESS_INFORMATION, PROCESS_TERMINATE, STARTF_USESTDHANDLES,
    STARTUPINFOA,
};

/// NTSTATUS for a process killed by ctrl-c.
const STATUS_CONTROL_C_EXIT: u32 = 0xC000013A;

fn last_error(func: &str) -> anyhow::Error {
    anyhow::anyhow!("{}: {}", func, std::io::Error::last_os_error())
}

pub fn run_command(
    cmdline: &str,
    use_console: bool,
    spawned: &mut dyn FnMut(i32),
) -> anyhow::Result<(Termination, Vec<u8>)> {
    let mut pipe_read: HANDLE = INVALID_HANDLE_VALUE;
    let mut pipe_write: HANDLE = INVALID_HANDLE_VALUE;

    unsafe {
        if !use_console {
            let mut sa = SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: std::ptr::null_mut(),
                bInheritHandle: 1,
            };
            if CreatePipe(&mut pipe_read, &mut pipe_write, &mut sa, 0) == 0 {
                return Err(last_error("CreatePipe"));
            }
            // Only the write end goes to the child.
            if SetHandleInformation(pipe_read, HANDLE_FLAG_INHERIT, 0) == 0 {
                return Err(last_error("SetHandleInformation"));
            }
        }

        let mut startup_info: STARTUPINFOA = std::mem::zeroed();
        startup_info.cb = std::mem::size_of::<STARTUPINFOA>() as u32;
        if !use_console {
            startup_info.dwFlags = STARTF_USESTDHANDLES;
            startup_info.hStdInput = INVALID_HANDLE_VALUE;
            startup_info.hStdOutput = pipe_write;
            startup_info.hStdError = pipe_write;
        }

        let process_flags = if use_console { 0 } else { CREATE_NEW_PROCESS_GROUP };
        let mut process_info: PROCESS_INFORMATION = std::mem::zeroed();
        let mut cmdline_nul = cmdline.to_string();
        cmdline_nul.push('\0');

        let created = CreateProcessA(
            std::ptr::null(),
            cmdline_nul.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            /*inherit handles=*/ 1,
            process_flags,
            std::ptr::null(),
            std::ptr::null(),
            &startup_info,
            &mut process_info,
        );
        if created == 0 {
            if !use_console {
                CloseHandle(pipe_read);
                CloseHandle(pipe_write);
            }
            return Err(last_error("CreateProcessA"));
        }
        CloseHandle(process_info.hThread);
        spawned(process_info.dwProcessId as i32);

        let mut output = Vec::new();
        if !use_console {
            CloseHandle(pipe_write);
            let mut file = std::fs::File::from_raw_handle(pipe_read as _);
            // A broken pipe just means the child is done writing.
            let _ = file.read_to_end(&mut output);
        }

        WaitForSingleObject(process_info.hProcess, INFINITE);
        let mut exit_code: u32 = 0;
        GetExitCodeProcess(process_info.hProcess, &mut exit_code);
        CloseHandle(process_info.hProcess);

        let termination = match exit_code {
            0 => Termination::Success,
            STATUS_CONTROL_C_EXIT => Termination::Interrupted,
            _ => Termination::Failure,
        };
        Ok((termination, output))
    }
}

/// Terminate a child process by id; process groups don't compose with
/// signals here, so just kill the immediate child.
pub fn kill_child(pid: i32, _sig: i32) {
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid as u32);
        if handle != 0 {
            TerminateProcess(handle, 1);
            CloseHandle(handle);
        }
    }
}
