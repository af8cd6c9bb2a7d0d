//! Cancellation signals (SIGINT/SIGTERM/SIGHUP).
//!
//! Handlers only set a flag; the driver polls it between subprocess
//! completions, stops launching, forwards the signal to running children,
//! and drains.  This keeps log writes and final output intact.

use std::sync::atomic::{AtomicI32, Ordering};

static CAUGHT: AtomicI32 = AtomicI32::new(0);

#[cfg(unix)]
extern "C" fn handler(sig: libc::c_int) {
    CAUGHT.store(sig, Ordering::Relaxed);
    // SA_RESETHAND restores the default, so a second ctrl-c kills us.
}

#[cfg(unix)]
pub fn register() {
    // Safety: registering a signal handler is libc unsafe code.
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_RESETHAND;
        for sig in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            libc::sigaction(sig, &sa, std::ptr::null_mut());
        }
    }
}

#[cfg(not(unix))]
pub fn register() {
    // Ctrl-c on Windows surfaces through child termination status instead.
}

/// The signal received, if any.
pub fn caught() -> Option<i32> {
    match CAUGHT.load(Ordering::Relaxed) {
        0 => None,
        sig => Some(sig),
    }
}

pub fn was_interrupted() -> bool {
    caught().is_some()
}
