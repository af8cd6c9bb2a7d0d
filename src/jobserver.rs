//! GNU make jobserver client: when a parent build tool advertises a token
//! pipe in MAKEFLAGS, concurrency is capped by the tokens we can acquire
//! from it, so nested builds share one global job limit.
//!
//! Every client owns one implicit token, so the first job never needs an
//! acquire.  Acquisition is strictly non-blocking; a failed acquire just
//! leaves the edge queued until a running job finishes or a token frees up.

#[cfg(unix)]
mod imp {
    use std::os::fd::RawFd;

    pub struct Client {
        read_fd: RawFd,
        write_fd: RawFd,
        /// Token bytes currently held, returned verbatim on release.
        held: Vec<u8>,
    }

    /// Parse `--jobserver-auth=fifo:PATH`, `--jobserver-auth=R,W`, or the
    /// older `--jobserver-fds=R,W` out of MAKEFLAGS.
    fn parse_makeflags(makeflags: &str) -> Option<String> {
        for word in makeflags.split_ascii_whitespace() {
            for flag in ["--jobserver-auth=", "--jobserver-fds="] {
                if let Some(value) = word.strip_prefix(flag) {
                    return Some(value.to_owned());
                }
            }
        }
        None
    }

    fn dup_nonblocking(fd: RawFd) -> Option<RawFd> {
        // Dup so the O_NONBLOCK tweak doesn't disturb the fd we share with
        // the parent and sibling processes.
        unsafe {
            let dup = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 3);
            if dup < 0 {
                return None;
            }
            let flags = libc::fcntl(dup, libc::F_GETFL);
            if flags < 0 || libc::fcntl(dup, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                libc::close(dup);
                return None;
            }
            Some(dup)
        }
    }

    impl Client {
        /// Build a client from the environment; None when no jobserver is
        /// advertised or its descriptors are unusable.
        pub fn from_env() -> Option<Client> {
            let makeflags = std::env::var("MAKEFLAGS").ok()?;
            let auth = parse_makeflags(&makeflags)?;

            if let Some(path) = auth.strip_prefix("fifo:") {
                let path = std::ffi::CString::new(path).ok()?;
                let fd = unsafe {
                    libc::open(
                        path.as_ptr(),
                        libc::O_RDWR | libc::O_NONBLOCK | libc::O_CLOEXEC,
                    )
                };
                if fd < 0 {
                    return None;
                }
                return Some(Client {
                    read_fd: fd,
                    write_fd: fd,
                    held: Vec::new(),
                });
            }

            let (read_str, write_str) = auth.split_once(',')?;
            let read_fd: RawFd = read_str.parse().ok()?;
            let write_fd: RawFd = write_str.parse().ok()?;
            Some(Client {
                read_fd: dup_nonblocking(read_fd)?,
                write_fd,
                held: Vec::new(),
            })
        }

        /// Try to take one token; false when none are available right now.
        pub fn try_acquire(&mut self) -> bool {
            let mut token = 0u8;
            let n = unsafe {
                libc::read(self.read_fd, &mut token as *mut u8 as *mut libc::c_void, 1)
            };
            if n == 1 {
                self.held.push(token);
                true
            } else {
                false
            }
        }

        /// Return one previously-acquired token.
        pub fn release(&mut self) {
            if let Some(token) = self.held.pop() {
                unsafe {
                    libc::write(
                        self.write_fd,
                        &token as *const u8 as *const libc::c_void,
                        1,
                    );
                }
            }
        }

        pub fn held(&self) -> usize {
            self.held.len()
        }
    }

    impl Drop for Client {
        fn drop(&mut self) {
            while !self.held.is_empty() {
                self.release();
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    /// The named-semaphore flavor of the protocol is not implemented; builds
    /// fall back to their own -j limit.
    pub struct Client {}

    impl Client {
        pub fn from_env() -> Option<Client> {
            None
        }
        pub fn try_acquire(&mut self) -> bool {
            false
        }
        pub fn release(&mut self) {}
        pub fn held(&self) -> usize {
            0
        }
    }
}

pub use imp::Client;

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    // One test body so the MAKEFLAGS mutations can't race each other.
    #[test]
    fn fifo_tokens_round_trip() {
        // Absent MAKEFLAGS degrades gracefully.
        std::env::remove_var("MAKEFLAGS");
        assert!(Client::from_env().is_none());

        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("jobserver");
        let cpath = std::ffi::CString::new(fifo.to_str().unwrap()).unwrap();
        unsafe {
            assert_eq!(libc::mkfifo(cpath.as_ptr(), 0o600), 0);
        }
        std::env::set_var(
            "MAKEFLAGS",
            format!("-j3 --jobserver-auth=fifo:{}", fifo.display()),
        );
        let mut client = Client::from_env().expect("fifo jobserver");
        std::env::remove_var("MAKEFLAGS");

        // Empty pipe: nothing to acquire.
        assert!(!client.try_acquire());

        // Seed two tokens, acquire both, and a third fails.
        unsafe {
            let fd = libc::open(cpath.as_ptr(), libc::O_WRONLY | libc::O_NONBLOCK);
            assert!(fd >= 0);
            assert_eq!(libc::write(fd, b"++".as_ptr() as *const _, 2), 2);
            libc::close(fd);
        }
        assert!(client.try_acquire());
        assert!(client.try_acquire());
        assert_eq!(client.held(), 2);
        assert!(!client.try_acquire());

        // Release puts a token back for the next acquirer.
        client.release();
        assert_eq!(client.held(), 1);
        assert!(client.try_acquire());
    }
}
