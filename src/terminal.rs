//! Terminal capability probing: whether to use the overprinting progress
//! display, and how wide the screen is.

fn env_truthy(name: &str) -> bool {
    std::env::var(name).map_or(false, |v| !v.is_empty() && v != "0")
}

/// Whether stdout supports the fancy overprinting progress display.
/// CLICOLOR_FORCE overrides the tty check, TERM=dumb disables it.
pub fn use_fancy() -> bool {
    if env_truthy("CLICOLOR_FORCE") {
        return true;
    }
    if std::env::var("TERM").map_or(false, |term| term == "dumb") {
        return false;
    }
    stdout_is_terminal()
}

#[cfg(unix)]
fn stdout_is_terminal() -> bool {
    unsafe { libc::isatty(/* stdout */ 1) == 1 }
}

#[cfg(unix)]
pub fn get_cols() -> Option<usize> {
    unsafe {
        let mut winsize = std::mem::zeroed::<libc::winsize>();
        if libc::ioctl(0, libc::TIOCGWINSZ, &mut winsize) < 0 {
            return None;
        }
        if winsize.ws_col < 10 {
            // Ignore nonsense widths rather than rendering garbage.
            return None;
        }
        Some(winsize.ws_col as usize)
    }
}

#[cfg(windows)]
fn stdout_is_terminal() -> bool {
    use windows_sys::Win32::System::Console::{GetConsoleMode, GetStdHandle, STD_OUTPUT_HANDLE};
    unsafe {
        let handle = GetStdHandle(STD_OUTPUT_HANDLE);
        let mut mode = 0;
        // GetConsoleMode itself fails when not attached to a console.
        GetConsoleMode(handle, &mut mode) != 0
    }
}

#[cfg(windows)]
pub fn get_cols() -> Option<usize> {
    use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
    use windows_sys::Win32::System::Console::{
        GetConsoleScreenBufferInfo, GetStdHandle, CONSOLE_SCREEN_BUFFER_INFO, STD_OUTPUT_HANDLE,
    };
    unsafe {
        let console = GetStdHandle(STD_OUTPUT_HANDLE);
        if console == INVALID_HANDLE_VALUE {
            return None;
        }
        let mut csbi = std::mem::zeroed::<CONSOLE_SCREEN_BUFFER_INFO>();
        if GetConsoleScreenBufferInfo(console, &mut csbi) == 0 {
            return None;
        }
        if csbi.dwSize.X < 10 {
            return None;
        }
        Some(csbi.dwSize.X as usize)
    }
}
