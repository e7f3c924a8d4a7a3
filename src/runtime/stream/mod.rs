//! 非阻塞流抽象
//!
//! A [`Stream`] wraps an OS descriptor that the event loop can watch. Streams
//! are reference-counted handles shared between fibers and the listeners the
//! loop keeps for them; closing a stream fires a close event at every
//! attached listener before the descriptor is released.

mod listener;

pub use listener::{
    AcceptHandler, AcceptMachine, ConnectMachine, ListenerEvent, Machine, MachineCx,
    MachineStatus, ReadMachine, ReadMode, WriteMachine,
};

use std::cell::{Ref, RefCell, RefMut};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::runtime::errors::{RuntimeError, RuntimeResult};

/// Identifier for one listener registration on the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// What a stream may be used for. Checked before wait registration so a
/// fiber cannot park on an operation the descriptor will never complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamFlags(u8);

impl StreamFlags {
    pub const READABLE: Self = Self(0b0000_0001);
    pub const WRITABLE: Self = Self(0b0000_0010);
    pub const LISTENING: Self = Self(0b0000_0100);
    pub const DATAGRAM: Self = Self(0b0000_1000);
    pub const CLOSED: Self = Self(0b0001_0000);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for StreamFlags {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An OS descriptor owned by the runtime.
#[derive(Debug)]
pub struct Stream {
    pub(crate) fd: RawFd,
    pub(crate) flags: StreamFlags,
    /// Listeners currently attached; unregistered in place on close.
    pub(crate) listeners: SmallVec<[ListenerId; 2]>,
}

impl Stream {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.flags.contains(StreamFlags::CLOSED)
    }

    /// Validate that the stream supports `role` and is still open.
    pub(crate) fn check_role(&self, role: StreamFlags) -> RuntimeResult<()> {
        if self.is_closed() {
            return Err(RuntimeError::StreamClosed);
        }
        if !self.flags.contains(role) {
            return Err(RuntimeError::InvalidStreamRole);
        }
        Ok(())
    }
}

/// Shared handle to a [`Stream`]. Identity-compared, like fiber handles.
#[derive(Debug, Clone)]
pub struct StreamHandle(Rc<RefCell<Stream>>);

impl StreamHandle {
    /// Wrap an already-open descriptor. The descriptor is switched to
    /// non-blocking mode and the runtime takes ownership of closing it.
    pub fn from_raw_fd(fd: RawFd, flags: StreamFlags) -> RuntimeResult<Self> {
        set_nonblocking(fd)?;
        set_cloexec(fd)?;
        Ok(Self(Rc::new(RefCell::new(Stream {
            fd,
            flags,
            listeners: SmallVec::new(),
        }))))
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.0.borrow().fd
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_closed()
    }

    #[inline]
    pub fn flags(&self) -> StreamFlags {
        self.0.borrow().flags
    }

    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    #[inline]
    pub(crate) fn borrow(&self) -> Ref<'_, Stream> {
        self.0.borrow()
    }

    #[inline]
    pub(crate) fn borrow_mut(&self) -> RefMut<'_, Stream> {
        self.0.borrow_mut()
    }
}

/// A connected pair of unidirectional pipes, read end first.
pub fn pipe() -> RuntimeResult<(StreamHandle, StreamHandle)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let read = StreamHandle::from_raw_fd(fds[0], StreamFlags::READABLE)?;
    let write = StreamHandle::from_raw_fd(fds[1], StreamFlags::WRITABLE)?;
    Ok((read, write))
}

/// A connected pair of bidirectional local sockets.
pub fn socketpair() -> RuntimeResult<(StreamHandle, StreamHandle)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let role = StreamFlags::READABLE | StreamFlags::WRITABLE;
    let a = StreamHandle::from_raw_fd(fds[0], role)?;
    let b = StreamHandle::from_raw_fd(fds[1], role)?;
    Ok((a, b))
}

/// Bind a TCP listening socket. Accepted connections are served through
/// the accept machinery on the event loop.
pub fn tcp_listen(addr: &str) -> RuntimeResult<StreamHandle> {
    let listener = std::net::TcpListener::bind(addr)?;
    let fd = {
        use std::os::unix::io::IntoRawFd;
        listener.into_raw_fd()
    };
    StreamHandle::from_raw_fd(fd, StreamFlags::LISTENING | StreamFlags::READABLE)
}

/// Begin a non-blocking TCP connect. The returned stream is not yet
/// connected; wait for writability on the loop and then check the socket
/// error before using it.
pub fn tcp_connect_start(addr: &str) -> RuntimeResult<StreamHandle> {
    use std::net::SocketAddr;
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| RuntimeError::MalformedPayload(format!("bad address: {e}")))?;

    let (domain, sockaddr, len) = sockaddr_of(&addr);
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error().into());
    }
    if let Err(e) = set_nonblocking(fd).and_then(|_| set_cloexec(fd)) {
        close_fd(fd);
        return Err(e.into());
    }
    let rc = unsafe { libc::connect(fd, &sockaddr as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            close_fd(fd);
            return Err(err.into());
        }
    }
    StreamHandle::from_raw_fd(fd, StreamFlags::READABLE | StreamFlags::WRITABLE)
}

fn sockaddr_of(addr: &std::net::SocketAddr) -> (libc::c_int, libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        std::net::SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                ..unsafe { std::mem::zeroed() }
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (
                libc::AF_INET,
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        std::net::SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                ..unsafe { std::mem::zeroed() }
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (
                libc::AF_INET6,
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub(crate) fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
