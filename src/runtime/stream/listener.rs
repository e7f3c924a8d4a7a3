//! Stream listeners and their state machines.
//!
//! Every wait on a stream is a listener: a registration that pairs the
//! stream, the waiting fiber and a [`Machine`] that reacts to readiness
//! events. A machine keeps its own progress (bytes read so far, write
//! cursor) across events and reports [`MachineStatus::Done`] when the
//! operation has either resumed or cancelled its fiber.

use std::io;
use std::os::unix::io::RawFd;

use tracing::warn;

use crate::runtime::fiber::{FiberBody, FiberHandle, Signal};
use crate::runtime::gc::Marker;
use crate::runtime::scheduler::EventLoop;
use crate::runtime::stream::{set_cloexec, set_nonblocking, StreamFlags, StreamHandle};
use crate::runtime::value::Value;

/// Readiness notification delivered to a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerEvent {
    /// First event after registration; lets the machine try the operation
    /// immediately in case the descriptor is already ready.
    Init,
    Read,
    Write,
    Err,
    Hup,
    /// The stream was closed while the listener was attached.
    Close,
    /// The waiting fiber was cancelled. The machine must not resume it.
    Cancel,
    /// Listener is being torn down; last event a machine ever sees.
    Deinit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    /// Keep the listener registered.
    Pending,
    /// Unregister; the machine has settled its fiber.
    Done,
}

/// Context handed to a machine for each event.
pub struct MachineCx<'a> {
    pub(crate) ev: &'a mut EventLoop,
    pub(crate) fiber: FiberHandle,
    pub(crate) stream: StreamHandle,
}

impl MachineCx<'_> {
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.stream.fd()
    }

    /// Resume the waiting fiber with `value` on the next drain.
    #[inline]
    pub fn resume(&mut self, value: Value) {
        self.ev.schedule(&self.fiber, value);
    }

    /// Cancel the waiting fiber with an error payload.
    #[inline]
    pub fn cancel(&mut self, message: impl Into<String>) {
        self.ev
            .schedule_signal(&self.fiber, Value::str(message.into()), Signal::Error);
    }
}

/// One asynchronous stream operation.
pub trait Machine {
    fn on_event(&mut self, cx: &mut MachineCx<'_>, event: ListenerEvent) -> MachineStatus;

    /// Report values the machine keeps alive, for heap tracing.
    fn trace(&self, _marker: &mut dyn Marker) {}
}

/// How much a read operation wants before resuming its fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Resume as soon as any bytes arrive, up to the limit.
    Some(usize),
    /// Accumulate exactly this many bytes across events; a short result
    /// means end of stream arrived first.
    Chunk(usize),
}

/// Reads from a stream, accumulating across readiness events.
pub struct ReadMachine {
    mode: ReadMode,
    buf: Vec<u8>,
}

impl ReadMachine {
    pub fn new(mode: ReadMode) -> Self {
        Self {
            mode,
            buf: Vec::new(),
        }
    }

    /// Resume with what has accumulated, or nil when the stream ended
    /// before anything arrived.
    fn finish(&mut self, cx: &mut MachineCx<'_>) -> MachineStatus {
        if self.buf.is_empty() {
            cx.resume(Value::Nil);
        } else {
            cx.resume(Value::bytes(std::mem::take(&mut self.buf)));
        }
        MachineStatus::Done
    }
}

impl Machine for ReadMachine {
    fn on_event(&mut self, cx: &mut MachineCx<'_>, event: ListenerEvent) -> MachineStatus {
        match event {
            ListenerEvent::Init | ListenerEvent::Read | ListenerEvent::Hup => {}
            ListenerEvent::Close => return self.finish(cx),
            ListenerEvent::Err => {
                cx.cancel("stream error");
                return MachineStatus::Done;
            }
            ListenerEvent::Cancel | ListenerEvent::Deinit => return MachineStatus::Done,
            ListenerEvent::Write => return MachineStatus::Pending,
        }

        let want = match self.mode {
            ReadMode::Some(n) => n,
            ReadMode::Chunk(n) => n - self.buf.len(),
        };
        if want == 0 {
            // A zero-length request must not consume anything.
            return self.finish(cx);
        }
        let mut chunk = vec![0u8; want];
        loop {
            match read_fd(cx.fd(), &mut chunk) {
                Ok(0) => return self.finish(cx),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    match self.mode {
                        ReadMode::Some(_) => return self.finish(cx),
                        ReadMode::Chunk(total) => {
                            if self.buf.len() >= total {
                                return self.finish(cx);
                            }
                            chunk.resize(total - self.buf.len(), 0);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return MachineStatus::Pending;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    cx.cancel(e.to_string());
                    return MachineStatus::Done;
                }
            }
        }
    }
}

/// Writes a byte buffer to a stream, advancing a cursor across events.
pub struct WriteMachine {
    data: Value,
    cursor: usize,
}

impl WriteMachine {
    /// `data` must be a bytes or string value.
    pub fn new(data: Value) -> Self {
        Self { data, cursor: 0 }
    }

    fn bytes(&self) -> &[u8] {
        match &self.data {
            Value::Bytes(b) => b,
            Value::Str(s) => s.as_bytes(),
            _ => &[],
        }
    }
}

impl Machine for WriteMachine {
    fn on_event(&mut self, cx: &mut MachineCx<'_>, event: ListenerEvent) -> MachineStatus {
        match event {
            ListenerEvent::Init | ListenerEvent::Write => {}
            ListenerEvent::Close => {
                cx.cancel("stream is closed");
                return MachineStatus::Done;
            }
            ListenerEvent::Err | ListenerEvent::Hup => {
                cx.cancel("stream error");
                return MachineStatus::Done;
            }
            ListenerEvent::Cancel | ListenerEvent::Deinit => return MachineStatus::Done,
            ListenerEvent::Read => return MachineStatus::Pending,
        }

        loop {
            let remaining = &self.bytes()[self.cursor..];
            if remaining.is_empty() {
                cx.resume(Value::Nil);
                return MachineStatus::Done;
            }
            match write_fd(cx.fd(), remaining) {
                Ok(n) => self.cursor += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return MachineStatus::Pending;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    cx.cancel(e.to_string());
                    return MachineStatus::Done;
                }
            }
        }
    }

    fn trace(&self, marker: &mut dyn Marker) {
        marker.mark(&self.data);
    }
}

/// Handler invoked per accepted connection in looping mode.
pub type AcceptHandler = Box<dyn FnMut(StreamHandle) -> Box<dyn FiberBody>>;

/// Accepts connections on a listening stream.
///
/// In one-shot mode the waiting fiber resumes with the first connection.
/// In looping mode each connection spawns a worker fiber from the handler
/// and the listener stays registered until the stream closes.
pub struct AcceptMachine {
    handler: Option<AcceptHandler>,
}

impl AcceptMachine {
    pub fn once() -> Self {
        Self { handler: None }
    }

    pub fn looping(handler: AcceptHandler) -> Self {
        Self {
            handler: Some(handler),
        }
    }
}

impl Machine for AcceptMachine {
    fn on_event(&mut self, cx: &mut MachineCx<'_>, event: ListenerEvent) -> MachineStatus {
        match event {
            ListenerEvent::Init | ListenerEvent::Read => {}
            ListenerEvent::Close => {
                cx.resume(Value::Nil);
                return MachineStatus::Done;
            }
            ListenerEvent::Err | ListenerEvent::Hup => {
                cx.cancel("listener error");
                return MachineStatus::Done;
            }
            ListenerEvent::Cancel | ListenerEvent::Deinit => return MachineStatus::Done,
            ListenerEvent::Write => return MachineStatus::Pending,
        }

        loop {
            let fd = unsafe { libc::accept(cx.fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd < 0 {
                let err = io::Error::last_os_error();
                return match err.kind() {
                    io::ErrorKind::WouldBlock => MachineStatus::Pending,
                    io::ErrorKind::Interrupted => continue,
                    _ => {
                        cx.cancel(err.to_string());
                        MachineStatus::Done
                    }
                };
            }
            if let Err(e) = set_nonblocking(fd).and_then(|_| set_cloexec(fd)) {
                unsafe { libc::close(fd) };
                warn!(error = %e, "failed to prepare accepted socket");
                continue;
            }
            let conn = match StreamHandle::from_raw_fd(
                fd,
                StreamFlags::READABLE | StreamFlags::WRITABLE,
            ) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "failed to wrap accepted socket");
                    continue;
                }
            };
            match &mut self.handler {
                None => {
                    cx.resume(Value::Stream(conn));
                    return MachineStatus::Done;
                }
                Some(handler) => {
                    let body = handler(conn.clone());
                    let worker = cx.ev.spawn_boxed(body);
                    cx.ev.schedule(&worker, Value::Stream(conn));
                }
            }
        }
    }
}

/// Completes a non-blocking connect by waiting for writability and then
/// checking the socket error.
pub struct ConnectMachine;

impl Machine for ConnectMachine {
    fn on_event(&mut self, cx: &mut MachineCx<'_>, event: ListenerEvent) -> MachineStatus {
        match event {
            ListenerEvent::Init => return MachineStatus::Pending,
            ListenerEvent::Write | ListenerEvent::Err | ListenerEvent::Hup => {}
            ListenerEvent::Close => {
                cx.cancel("stream is closed");
                return MachineStatus::Done;
            }
            ListenerEvent::Cancel | ListenerEvent::Deinit => return MachineStatus::Done,
            ListenerEvent::Read => return MachineStatus::Pending,
        }

        match socket_error(cx.fd()) {
            Ok(0) => {
                let stream = cx.stream.clone();
                cx.resume(Value::Stream(stream));
            }
            Ok(errno) => {
                cx.cancel(io::Error::from_raw_os_error(errno).to_string());
            }
            Err(e) => {
                cx.cancel(e.to_string());
            }
        }
        MachineStatus::Done
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(err)
    }
}
