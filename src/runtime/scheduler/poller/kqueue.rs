//! kqueue backend (macOS / BSD)

use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use hashbrown::HashMap;

use super::{Interest, Multiplexer, PollEvent};

const MAX_EVENTS: usize = 64;

/// kqueue multiplexer. Read and write interest are separate filters.
#[derive(Debug)]
pub(crate) struct KqueuePoller {
    kq: RawFd,
    registered: HashMap<RawFd, Interest>,
}

fn kevent_change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: ptr::null_mut(),
    }
}

impl KqueuePoller {
    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as i32,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // Filters for closed FDs vanish on their own.
            if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF)
            {
                return Err(err);
            }
        }
        Ok(())
    }
}

impl Multiplexer for KqueuePoller {
    fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(Self {
            kq,
            registered: HashMap::new(),
        })
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut changes = Vec::with_capacity(2);
        let read_flags = if interest.readable {
            libc::EV_ADD
        } else {
            libc::EV_DELETE
        };
        let write_flags = if interest.writable {
            libc::EV_ADD
        } else {
            libc::EV_DELETE
        };
        let prev = self.registered.get(&fd).copied().unwrap_or_default();
        if interest.readable || prev.readable {
            changes.push(kevent_change(fd, libc::EVFILT_READ, read_flags));
        }
        if interest.writable || prev.writable {
            changes.push(kevent_change(fd, libc::EVFILT_WRITE, write_flags));
        }
        self.apply(&changes)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        if let Some(prev) = self.registered.remove(&fd) {
            let mut changes = Vec::with_capacity(2);
            if prev.readable {
                changes.push(kevent_change(fd, libc::EVFILT_READ, libc::EV_DELETE));
            }
            if prev.writable {
                changes.push(kevent_change(fd, libc::EVFILT_WRITE, libc::EV_DELETE));
            }
            self.apply(&changes)?;
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        let mut events: [libc::kevent; MAX_EVENTS] =
            unsafe { std::mem::zeroed() };

        let ts;
        let ts_ptr = match timeout {
            None => ptr::null(),
            Some(d) => {
                ts = libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                };
                &ts as *const libc::timespec
            }
        };

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                ts_ptr,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        for event in events.iter().take(n as usize) {
            out.push(PollEvent {
                fd: event.ident as RawFd,
                readable: event.filter == libc::EVFILT_READ,
                writable: event.filter == libc::EVFILT_WRITE,
                error: event.flags & libc::EV_ERROR != 0,
                hangup: event.flags & libc::EV_EOF != 0,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
