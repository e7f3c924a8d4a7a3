//! 背压感知通道
//!
//! Channels move values between fibers with backpressure. A channel has a
//! fixed capacity; givers that overrun it are parked until a taker frees
//! room, takers on an empty channel are parked until a value arrives.
//! Hand-off is direct: a give that finds a parked taker schedules that taker
//! with the value instead of touching the buffer.
//!
//! Two flavors share one handle type. Local channels are single-thread
//! (`Rc`-backed) and wake fibers by scheduling them on the owning loop.
//! Threaded channels are `Arc`-backed, carry [`PackedValue`]s, and wake
//! remote fibers by posting callbacks to the parked fiber's home loop.
//!
//! Parked entries are never removed eagerly. Each entry snapshots the
//! fiber's generation at park time; whoever pops the entry later compares
//! against the live generation and silently skips entries that lost a
//! select or were cancelled in the meantime.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::runtime::errors::{RuntimeError, RuntimeResult};
use crate::runtime::fiber::{FiberHandle, FiberId, Signal};
use crate::runtime::scheduler::{EventLoop, WakeSender};
use crate::runtime::value::{PackedValue, Value};


/// Hard cap on buffered items. Exceeding it means a producer loop ran away
/// with nothing draining; treat it as a runtime bug rather than blocking.
pub const CHANNEL_MAX: usize = 0x00FF_FFFF;

/// How a parked fiber expects its wake-up payload to be shaped.
///
/// `Blocking` waits get the bare result (the value for takes, nil for
/// gives). `Choice` waits come from `select` and get a tagged tuple naming
/// the clause that completed, e.g. `("take" chan value)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    Blocking,
    Choice,
}

/// Result of a give against a channel.
#[derive(Debug)]
pub(crate) enum PushOutcome {
    /// The value was handed to a taker or buffered within capacity.
    Delivered,
    /// The value was accepted but the giver must park until room frees.
    Parked,
}

/// Result of a take against a channel.
#[derive(Debug)]
pub(crate) enum PopOutcome {
    Item(Value),
    /// Nothing available; the taker was parked.
    Parked,
    /// Channel closed and drained.
    Closed,
}

/// Immediate probe used by select's first pass. Never parks.
#[derive(Debug)]
pub(crate) enum Immediate {
    Ready(Value),
    Closed,
    Blocked,
}

/// Like [`Immediate`] but for gives; hands the value back when blocked.
#[derive(Debug)]
pub(crate) enum GiveNow {
    Given,
    Closed,
    Blocked(Value),
}

/// A backpressure-aware channel handle.
#[derive(Clone)]
pub struct Channel(ChannelImpl);

#[derive(Clone)]
enum ChannelImpl {
    Local(Rc<RefCell<LocalCore>>),
    Threaded(Arc<ThreadedChannel>),
}

struct LocalCore {
    items: VecDeque<Value>,
    capacity: usize,
    closed: bool,
    read_pending: VecDeque<LocalWaiter>,
    write_pending: VecDeque<LocalWaiter>,
}

struct LocalWaiter {
    fiber: FiberHandle,
    generation: u64,
    mode: WaitMode,
    /// Select gives keep their value here until a taker claims it; plain
    /// gives buffer the value up front and leave this empty.
    value: Option<Value>,
}

impl LocalWaiter {
    fn stale(&self) -> bool {
        self.generation != self.fiber.generation() || self.fiber.is_finished()
    }
}

/// Shared core of a thread-safe channel.
pub struct ThreadedChannel {
    state: Mutex<ThreadedCore>,
}

impl fmt::Debug for ThreadedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<threaded-channel {:p}>", self)
    }
}

struct ThreadedCore {
    items: VecDeque<PackedValue>,
    capacity: usize,
    closed: bool,
    read_pending: VecDeque<RemoteWaiter>,
    write_pending: VecDeque<RemoteWaiter>,
}

/// A fiber parked on a threaded channel, addressed by loop rather than by
/// handle so the entry can cross threads. Staleness is judged on the home
/// loop when the wake callback runs.
struct RemoteWaiter {
    wake: WakeSender,
    fiber: FiberId,
    generation: u64,
    mode: WaitMode,
}

impl Channel {
    /// A single-thread channel with the given buffer capacity.
    pub fn local(capacity: usize) -> Self {
        Channel(ChannelImpl::Local(Rc::new(RefCell::new(LocalCore {
            items: VecDeque::new(),
            capacity,
            closed: false,
            read_pending: VecDeque::new(),
            write_pending: VecDeque::new(),
        }))))
    }

    /// A thread-safe channel with the given buffer capacity.
    pub fn threaded(capacity: usize) -> Self {
        Channel(ChannelImpl::Threaded(Arc::new(ThreadedChannel {
            state: Mutex::new(ThreadedCore {
                items: VecDeque::new(),
                capacity,
                closed: false,
                read_pending: VecDeque::new(),
                write_pending: VecDeque::new(),
            }),
        })))
    }

    pub(crate) fn from_threaded(core: Arc<ThreadedChannel>) -> Self {
        Channel(ChannelImpl::Threaded(core))
    }

    pub(crate) fn threaded_core(&self) -> Option<Arc<ThreadedChannel>> {
        match &self.0 {
            ChannelImpl::Threaded(arc) => Some(arc.clone()),
            ChannelImpl::Local(_) => None,
        }
    }

    #[inline]
    pub fn is_threaded(&self) -> bool {
        matches!(self.0, ChannelImpl::Threaded(_))
    }

    /// Buffered item count.
    pub fn count(&self) -> usize {
        match &self.0 {
            ChannelImpl::Local(core) => core.borrow().items.len(),
            ChannelImpl::Threaded(arc) => arc.state.lock().items.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        match &self.0 {
            ChannelImpl::Local(core) => core.borrow().capacity,
            ChannelImpl::Threaded(arc) => arc.state.lock().capacity,
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.0 {
            ChannelImpl::Local(core) => core.borrow().closed,
            ChannelImpl::Threaded(arc) => arc.state.lock().closed,
        }
    }

    /// Identity comparison; channels have no structural equality.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.0, &other.0) {
            (ChannelImpl::Local(a), ChannelImpl::Local(b)) => Rc::ptr_eq(a, b),
            (ChannelImpl::Threaded(a), ChannelImpl::Threaded(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Blocking give. `Parked` means the value was buffered over capacity
    /// and `fiber` must suspend until a taker frees room.
    pub(crate) fn give(
        &self,
        ev: &mut EventLoop,
        fiber: &FiberHandle,
        value: Value,
    ) -> RuntimeResult<PushOutcome> {
        match self.give_now(ev, value)? {
            GiveNow::Given => Ok(PushOutcome::Delivered),
            GiveNow::Closed => Err(RuntimeError::ChannelClosed),
            GiveNow::Blocked(value) => {
                self.buffer_and_park(ev, fiber, value, WaitMode::Blocking)?;
                Ok(PushOutcome::Parked)
            }
        }
    }

    /// Non-blocking give used for supervisor notifications. Ignores
    /// capacity; a closed channel silently drops the value.
    pub(crate) fn give_noblock(&self, ev: &mut EventLoop, value: Value) -> RuntimeResult<()> {
        match self.give_now(ev, value)? {
            GiveNow::Given => Ok(()),
            GiveNow::Closed => {
                debug!("dropped notification to closed channel");
                Ok(())
            }
            GiveNow::Blocked(value) => match &self.0 {
                ChannelImpl::Local(core) => {
                    let mut core = core.borrow_mut();
                    assert!(core.items.len() < CHANNEL_MAX, "channel overflow");
                    core.items.push_back(value);
                    Ok(())
                }
                ChannelImpl::Threaded(arc) => {
                    let packed = value.pack()?;
                    let mut core = arc.state.lock();
                    assert!(core.items.len() < CHANNEL_MAX, "channel overflow");
                    core.items.push_back(packed);
                    Ok(())
                }
            },
        }
    }

    /// Probe-and-give. Succeeds only when the value can be handed to a
    /// taker or buffered within capacity; otherwise the value comes back.
    pub(crate) fn give_now(&self, ev: &mut EventLoop, value: Value) -> RuntimeResult<GiveNow> {
        match &self.0 {
            ChannelImpl::Local(core) => {
                let mut core = core.borrow_mut();
                if core.closed {
                    return Ok(GiveNow::Closed);
                }
                while let Some(r) = core.read_pending.pop_front() {
                    if r.stale() {
                        continue;
                    }
                    let payload = reader_payload(r.mode, self, value);
                    ev.schedule(&r.fiber, payload);
                    return Ok(GiveNow::Given);
                }
                if core.items.len() < core.capacity {
                    core.items.push_back(value);
                    return Ok(GiveNow::Given);
                }
                Ok(GiveNow::Blocked(value))
            }
            ChannelImpl::Threaded(arc) => {
                let packed = value.pack()?;
                let mut core = arc.state.lock();
                if core.closed {
                    return Ok(GiveNow::Closed);
                }
                if let Some(r) = core.read_pending.pop_front() {
                    drop(core);
                    if r.wake.loop_id() == ev.id() {
                        // The taker lives on this loop; skip the wake pipe.
                        deliver_packed(ev, arc, r, packed);
                    } else {
                        post_delivery(arc, r, packed);
                    }
                    return Ok(GiveNow::Given);
                }
                if core.items.len() < core.capacity {
                    core.items.push_back(packed);
                    return Ok(GiveNow::Given);
                }
                drop(core);
                // Hand the original value back; it was packable, so
                // unpacking cannot fail here.
                Ok(GiveNow::Blocked(packed.unpack()?))
            }
        }
    }

    /// Buffer the value and park the giver for backpressure. Select gives
    /// on local channels keep the value in the parked entry instead so a
    /// losing clause delivers nothing.
    pub(crate) fn buffer_and_park(
        &self,
        ev: &mut EventLoop,
        fiber: &FiberHandle,
        value: Value,
        mode: WaitMode,
    ) -> RuntimeResult<()> {
        match &self.0 {
            ChannelImpl::Local(core) => {
                let mut core = core.borrow_mut();
                let held = match mode {
                    WaitMode::Blocking => {
                        assert!(core.items.len() < CHANNEL_MAX, "channel overflow");
                        core.items.push_back(value);
                        None
                    }
                    WaitMode::Choice => Some(value),
                };
                core.write_pending.push_back(LocalWaiter {
                    fiber: fiber.clone(),
                    generation: fiber.generation(),
                    mode,
                    value: held,
                });
            }
            ChannelImpl::Threaded(arc) => {
                let packed = value.pack()?;
                let (wake, id, generation) = ev.remote_park(fiber);
                let mut core = arc.state.lock();
                assert!(core.items.len() < CHANNEL_MAX, "channel overflow");
                core.items.push_back(packed);
                core.write_pending.push_back(RemoteWaiter {
                    wake,
                    fiber: id,
                    generation,
                    mode,
                });
            }
        }
        Ok(())
    }

    /// Blocking take.
    pub(crate) fn take(
        &self,
        ev: &mut EventLoop,
        fiber: &FiberHandle,
    ) -> RuntimeResult<PopOutcome> {
        match self.take_now(ev)? {
            Immediate::Ready(v) => Ok(PopOutcome::Item(v)),
            Immediate::Closed => Ok(PopOutcome::Closed),
            Immediate::Blocked => {
                self.park_reader(ev, fiber, WaitMode::Blocking);
                Ok(PopOutcome::Parked)
            }
        }
    }

    /// Probe-and-take. Pops a buffered value or claims one from a parked
    /// select give; never parks.
    pub(crate) fn take_now(&self, ev: &mut EventLoop) -> RuntimeResult<Immediate> {
        match &self.0 {
            ChannelImpl::Local(core) => {
                let mut core = core.borrow_mut();
                if let Some(v) = core.items.pop_front() {
                    wake_one_local_writer(ev, &mut core, self);
                    return Ok(Immediate::Ready(v));
                }
                // Rendezvous with a select give that held its value back.
                while let Some(mut w) = core.write_pending.pop_front() {
                    if w.stale() {
                        continue;
                    }
                    match w.value.take() {
                        Some(v) => {
                            ev.schedule(&w.fiber, writer_payload(w.mode, self));
                            return Ok(Immediate::Ready(v));
                        }
                        None => {
                            // A live blocking giver always has a buffered
                            // item; put it back rather than lose it.
                            core.write_pending.push_front(w);
                            break;
                        }
                    }
                }
                if core.closed {
                    Ok(Immediate::Closed)
                } else {
                    Ok(Immediate::Blocked)
                }
            }
            ChannelImpl::Threaded(arc) => {
                let mut core = arc.state.lock();
                if let Some(p) = core.items.pop_front() {
                    wake_one_remote_writer(arc, &mut core);
                    drop(core);
                    return Ok(Immediate::Ready(p.unpack()?));
                }
                if core.closed {
                    Ok(Immediate::Closed)
                } else {
                    Ok(Immediate::Blocked)
                }
            }
        }
    }

    /// Park `fiber` as a taker.
    pub(crate) fn park_reader(&self, ev: &mut EventLoop, fiber: &FiberHandle, mode: WaitMode) {
        match &self.0 {
            ChannelImpl::Local(core) => {
                core.borrow_mut().read_pending.push_back(LocalWaiter {
                    fiber: fiber.clone(),
                    generation: fiber.generation(),
                    mode,
                    value: None,
                });
            }
            ChannelImpl::Threaded(arc) => {
                let (wake, id, generation) = ev.remote_park(fiber);
                arc.state.lock().read_pending.push_back(RemoteWaiter {
                    wake,
                    fiber: id,
                    generation,
                    mode,
                });
            }
        }
    }

    /// Close the channel. Idempotent. Buffered items stay takeable; every
    /// parked fiber wakes with nil, or a `("close" chan)` tuple for select
    /// waits.
    pub fn close(&self, ev: &mut EventLoop) {
        match &self.0 {
            ChannelImpl::Local(core) => {
                let (readers, writers) = {
                    let mut core = core.borrow_mut();
                    if core.closed {
                        return;
                    }
                    core.closed = true;
                    (
                        std::mem::take(&mut core.read_pending),
                        std::mem::take(&mut core.write_pending),
                    )
                };
                for w in readers.into_iter().chain(writers) {
                    if w.stale() {
                        continue;
                    }
                    ev.schedule(&w.fiber, closed_payload(w.mode, self));
                }
            }
            ChannelImpl::Threaded(arc) => {
                let (readers, writers) = {
                    let mut core = arc.state.lock();
                    if core.closed {
                        return;
                    }
                    core.closed = true;
                    (
                        std::mem::take(&mut core.read_pending),
                        std::mem::take(&mut core.write_pending),
                    )
                };
                for w in readers.into_iter().chain(writers) {
                    let arc2 = arc.clone();
                    let RemoteWaiter {
                        wake,
                        fiber,
                        generation,
                        mode,
                    } = w;
                    wake.post(move |ev| {
                        if let Some(f) = ev.unpark(fiber, generation) {
                            let chan = Channel::from_threaded(arc2);
                            ev.schedule(&f, closed_payload(mode, &chan));
                        }
                    });
                }
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            ChannelImpl::Local(core) => write!(f, "<channel {:p}>", Rc::as_ptr(core)),
            ChannelImpl::Threaded(arc) => write!(f, "<channel/threaded {:p}>", Arc::as_ptr(arc)),
        }
    }
}

/// Wake the next live parked giver after a take freed buffer room.
fn wake_one_local_writer(ev: &mut EventLoop, core: &mut LocalCore, chan: &Channel) {
    while let Some(w) = core.write_pending.pop_front() {
        if w.stale() {
            continue;
        }
        if let Some(v) = w.value {
            // Select give: its value enters the buffer only now.
            core.items.push_back(v);
        }
        ev.schedule(&w.fiber, writer_payload(w.mode, chan));
        return;
    }
}

/// Threaded analog of [`wake_one_local_writer`]. Staleness can only be
/// judged on the fiber's home loop, so the callback retries there when the
/// entry turns out dead.
fn wake_one_remote_writer(arc: &Arc<ThreadedChannel>, core: &mut ThreadedCore) {
    if let Some(w) = core.write_pending.pop_front() {
        let arc2 = arc.clone();
        let RemoteWaiter {
            wake,
            fiber,
            generation,
            mode,
        } = w;
        wake.post(move |ev| match ev.unpark(fiber, generation) {
            Some(f) => {
                let chan = Channel::from_threaded(arc2);
                ev.schedule(&f, writer_payload(mode, &chan));
            }
            None => {
                let mut core = arc2.state.lock();
                wake_one_remote_writer(&arc2, &mut core);
            }
        });
    }
}

/// Deliver a packed value to a remote taker, re-offering on its home loop
/// if the taker went stale in flight.
fn post_delivery(arc: &Arc<ThreadedChannel>, waiter: RemoteWaiter, packed: PackedValue) {
    let arc2 = arc.clone();
    let wake = waiter.wake.clone();
    wake.post(move |ev| deliver_packed(ev, &arc2, waiter, packed));
}

/// Complete a packed delivery on the taker's home loop.
fn deliver_packed(
    ev: &mut EventLoop,
    arc: &Arc<ThreadedChannel>,
    waiter: RemoteWaiter,
    packed: PackedValue,
) {
    let RemoteWaiter {
        fiber,
        generation,
        mode,
        ..
    } = waiter;
    match ev.unpark(fiber, generation) {
        Some(f) => {
            let chan = Channel::from_threaded(arc.clone());
            match packed.unpack() {
                Ok(v) => ev.schedule(&f, reader_payload(mode, &chan, v)),
                Err(e) => ev.schedule_signal(&f, Value::str(e.to_string()), Signal::Error),
            }
        }
        None => offer_packed(arc, packed),
    }
}

/// Re-offer a value whose intended taker went stale: hand it to the next
/// parked taker, or return it to the buffer.
fn offer_packed(arc: &Arc<ThreadedChannel>, packed: PackedValue) {
    let mut core = arc.state.lock();
    if let Some(r) = core.read_pending.pop_front() {
        drop(core);
        post_delivery(arc, r, packed);
    } else {
        core.items.push_back(packed);
    }
}

fn reader_payload(mode: WaitMode, chan: &Channel, value: Value) -> Value {
    match mode {
        WaitMode::Blocking => value,
        WaitMode::Choice => Value::tuple(vec![
            Value::str("take"),
            Value::Channel(chan.clone()),
            value,
        ]),
    }
}

fn writer_payload(mode: WaitMode, chan: &Channel) -> Value {
    match mode {
        WaitMode::Blocking => Value::Nil,
        WaitMode::Choice => Value::tuple(vec![Value::str("give"), Value::Channel(chan.clone())]),
    }
}

fn closed_payload(mode: WaitMode, chan: &Channel) -> Value {
    match mode {
        WaitMode::Blocking => Value::Nil,
        WaitMode::Choice => Value::tuple(vec![Value::str("close"), Value::Channel(chan.clone())]),
    }
}

/// Tuple returned to a select when a take clause wins immediately.
pub(crate) fn take_ready_payload(chan: &Channel, value: Value) -> Value {
    reader_payload(WaitMode::Choice, chan, value)
}

/// Tuple returned to a select when a give clause wins immediately.
pub(crate) fn give_ready_payload(chan: &Channel) -> Value {
    writer_payload(WaitMode::Choice, chan)
}

/// Tuple returned to a select when a clause's channel is closed.
pub(crate) fn close_ready_payload(chan: &Channel) -> Value {
    closed_payload(WaitMode::Choice, chan)
}
