//! poll(2) fallback backend (other unix)

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use hashbrown::HashMap;

use super::{timeout_ms, Interest, Multiplexer, PollEvent};

/// Portable poll(2) multiplexer. Rebuilds the pollfd array on every wait
/// call; fine for the small descriptor counts a single loop watches.
#[derive(Debug)]
pub(crate) struct PollPoller {
    registered: HashMap<RawFd, Interest>,
}

impl Multiplexer for PollPoller {
    fn new() -> io::Result<Self> {
        Ok(Self {
            registered: HashMap::new(),
        })
    }

    fn register(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.registered.remove(&fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        let mut fds: Vec<libc::pollfd> = self
            .registered
            .iter()
            .map(|(&fd, &interest)| {
                let mut events = 0i16;
                if interest.readable {
                    events |= libc::POLLIN;
                }
                if interest.writable {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();

        let n = unsafe {
            libc::poll(
                fds.as_mut_ptr(),
                fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }

        let mut reported = 0;
        for pfd in &fds {
            if pfd.revents == 0 {
                continue;
            }
            reported += 1;
            out.push(PollEvent {
                fd: pfd.fd,
                readable: pfd.revents & libc::POLLIN != 0,
                writable: pfd.revents & libc::POLLOUT != 0,
                error: pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                hangup: pfd.revents & libc::POLLHUP != 0,
            });
        }
        Ok(reported)
    }
}
