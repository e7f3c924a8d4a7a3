//! Platform multiplexer backends
//!
//! epoll, kqueue and poll(2) are mutually exclusive compile-time backends
//! behind the [`Multiplexer`] trait. Exactly one implementation is selected
//! per target OS as [`SysPoller`]. All backends are level-triggered:
//! spurious wakeups are harmless because listener machines re-check
//! readiness and return "not done" on `EAGAIN`.

#[cfg(windows)]
compile_error!("xianwei requires a unix multiplexer (epoll, kqueue or poll); IOCP is not supported");

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
mod poll;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::EpollPoller as SysPoller;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::KqueuePoller as SysPoller;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub(crate) use poll::PollPoller as SysPoller;

/// I/O interest for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READ: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITE: Interest = Interest {
        readable: false,
        writable: true,
    };

    /// Union of two interests.
    #[inline]
    pub fn or(self, other: Interest) -> Interest {
        Interest {
            readable: self.readable || other.readable,
            writable: self.writable || other.writable,
        }
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}

/// One readiness event reported by a backend.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

/// The one interface every backend implements.
pub(crate) trait Multiplexer: Sized {
    /// Create the backend instance.
    fn new() -> io::Result<Self>;

    /// Start watching `fd` with the given interest, replacing any previous
    /// registration.
    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Stop watching `fd`. Tolerates descriptors already closed by the OS.
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block until readiness or `timeout` (None = block indefinitely).
    /// Appends events to `out` and returns the number reported. `EINTR`
    /// reports zero events rather than an error.
    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<usize>;
}

/// Clamp a timeout to whole milliseconds for backends taking int timeouts,
/// rounding up so short sleeps do not busy-spin.
#[allow(dead_code)]
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_millis();
            if ms == 0 && d.as_nanos() > 0 {
                1
            } else {
                ms.min(i32::MAX as u128) as i32
            }
        }
    }
}
