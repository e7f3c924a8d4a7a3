//! Fibers: suspendable, resumable units of execution
//!
//! A fiber owns a resumable body (an explicit state machine), a status, a
//! signal mask and a generation counter. The event loop is the only caller
//! that advances fibers; everything else (channels, streams, timers) merely
//! registers a fiber as waiting and schedules it later.
//!
//! The signal mask records which of the signals raised *inside* this fiber
//! are caught at its resume boundary: a caught signal is returned to the
//! resumer as an ordinary result, an uncaught one propagates further up the
//! resume chain.

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::runtime::channel::Channel;
use crate::runtime::scheduler::OpCtx;
use crate::runtime::stream::ListenerId;
use crate::runtime::value::Value;

#[cfg(test)]
mod tests;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique fiber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(pub u64);

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}", self.0)
    }
}

/// The reason a fiber stopped running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Normal completion.
    Ok,
    /// Error raised (or injected by cancellation).
    Error,
    /// Debugger breakpoint / single step.
    Debug,
    /// Cooperative yield.
    Yield,
    /// User-defined signal 0..=9. User 8 and 9 are reserved.
    User(u8),
}

impl Signal {
    /// Reserved: the fiber is suspended awaiting the event loop.
    pub const EVENT: Signal = Signal::User(9);
    /// Reserved: the fiber was interrupted by the embedding host.
    pub const INTERRUPT: Signal = Signal::User(8);

    /// Bit index in a [`SignalMask`].
    #[inline]
    pub fn index(self) -> u32 {
        match self {
            Signal::Ok => 0,
            Signal::Error => 1,
            Signal::Debug => 2,
            Signal::Yield => 3,
            Signal::User(n) => 4 + u32::from(n.min(9)),
        }
    }

    /// Mask bit for this signal.
    #[inline]
    pub fn bit(self) -> SignalMask {
        1 << self.index()
    }

    /// Signal name, used for supervisor events and traces.
    pub fn name(self) -> &'static str {
        match self {
            Signal::Ok => "ok",
            Signal::Error => "error",
            Signal::Debug => "debug",
            Signal::Yield => "yield",
            Signal::User(0) => "user0",
            Signal::User(1) => "user1",
            Signal::User(2) => "user2",
            Signal::User(3) => "user3",
            Signal::User(4) => "user4",
            Signal::User(5) => "user5",
            Signal::User(6) => "user6",
            Signal::User(7) => "user7",
            Signal::User(8) => "interrupt",
            _ => "event",
        }
    }
}

/// Bitmask over signal indices. Bit set = signal caught at the resume
/// boundary of the fiber carrying the mask.
pub type SignalMask = u32;

/// Catch nothing (all signals propagate).
pub const MASK_NONE: SignalMask = 0;
/// Catch errors only.
pub const MASK_ERROR: SignalMask = 1 << 1;
/// Catch everything a fiber can raise.
pub const MASK_ALL: SignalMask = !0;

/// Build a mask catching the given signals.
pub fn mask_of(signals: &[Signal]) -> SignalMask {
    signals.iter().fold(0, |m, s| m | s.bit())
}

/// Fiber status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Created, never resumed.
    New,
    /// Currently executing.
    Alive,
    /// Completed normally.
    Dead,
    /// Terminated by an error signal.
    Error,
    /// Suspended by the debugger.
    Debug,
    /// Suspended by a yield.
    Pending,
    /// Suspended by a user signal; `User(9)` is event-suspended and
    /// `User(8)` interrupted, by convention.
    User(u8),
}

impl FiberStatus {
    /// A finished fiber can never run again.
    #[inline]
    pub fn is_finished(self) -> bool {
        matches!(self, FiberStatus::Dead | FiberStatus::Error)
    }

    /// Whether `continue` may legally be called in this status.
    #[inline]
    pub fn is_resumable(self) -> bool {
        !matches!(
            self,
            FiberStatus::Alive | FiberStatus::Dead | FiberStatus::Error
        )
    }

    /// Human-readable name for traces.
    pub fn as_str(self) -> &'static str {
        match self {
            FiberStatus::New => "new",
            FiberStatus::Alive => "alive",
            FiberStatus::Dead => "dead",
            FiberStatus::Error => "error",
            FiberStatus::Debug => "debug",
            FiberStatus::Pending => "pending",
            FiberStatus::User(8) => "interrupted",
            FiberStatus::User(9) => "suspended",
            FiberStatus::User(_) => "user",
        }
    }

    /// The status a fiber enters when it raises `sig` and suspends.
    pub(crate) fn for_signal(sig: Signal) -> FiberStatus {
        match sig {
            Signal::Ok => FiberStatus::Dead,
            Signal::Error => FiberStatus::Error,
            Signal::Debug => FiberStatus::Debug,
            Signal::Yield => FiberStatus::Pending,
            Signal::User(n) => FiberStatus::User(n),
        }
    }
}

/// Outcome of driving a fiber body one step.
#[derive(Debug)]
pub enum Step {
    /// The body finished with a final value.
    Done(Value),
    /// The body raised an error.
    Fail(Value),
    /// The body suspended, raising `Signal` with a payload. For
    /// [`Signal::EVENT`] a wait must have been registered through the
    /// context first.
    Suspend(Signal, Value),
}

/// A resumable fiber body: an explicit state machine advanced once per
/// resume. `input` is the value the fiber was resumed with (nil on first
/// resume).
pub trait FiberBody {
    fn resume(&mut self, cx: &mut OpCtx<'_>, input: Value) -> Step;
}

impl<F> FiberBody for F
where
    F: FnMut(&mut OpCtx<'_>, Value) -> Step,
{
    fn resume(&mut self, cx: &mut OpCtx<'_>, input: Value) -> Step {
        self(cx, input)
    }
}

impl FiberBody for Box<dyn FiberBody> {
    fn resume(&mut self, cx: &mut OpCtx<'_>, input: Value) -> Step {
        (**self).resume(cx, input)
    }
}

/// What a suspended fiber is currently waiting on. At most one registration
/// at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum Wait {
    #[default]
    None,
    /// A listener attached to a stream.
    Listener(ListenerId),
    /// Parked in the loop's cross-thread registry (threaded channel wait or
    /// worker offload), holding an extra reference on the loop.
    Parked,
}

/// The fiber itself. Access goes through [`FiberHandle`].
pub struct Fiber {
    pub(crate) id: FiberId,
    pub(crate) status: FiberStatus,
    pub(crate) mask: SignalMask,
    /// Bumped on every (re)schedule; pending wakeups snapshot it and are
    /// discarded lazily on mismatch.
    pub(crate) generation: u64,
    /// Dedup flag: at most one outstanding task per fiber.
    pub(crate) scheduled: bool,
    /// Root fibers are owned by the scheduler and may not be resumed by
    /// other fibers.
    pub(crate) root: bool,
    /// Single-step request for the next resume (`step`).
    pub(crate) single_step: bool,
    pub(crate) wait: Wait,
    /// Unmasked signals are forwarded here instead of the embedding caller.
    pub(crate) supervisor: Option<Channel>,
    /// Nested fiber currently being resumed by this one.
    pub(crate) child: Option<FiberHandle>,
    /// Last value this fiber produced or was resumed with.
    pub(crate) last_value: Value,
    /// Set by cancelling a running fiber; consumed at its next suspension
    /// point.
    pub(crate) cancel_pending: Option<Value>,
    /// Taken while the body executes.
    pub(crate) body: Option<Box<dyn FiberBody>>,
}

/// Shared handle to a fiber.
#[derive(Clone)]
pub struct FiberHandle(Rc<RefCell<Fiber>>);

impl FiberHandle {
    /// Create a fiber from a body with the given signal mask.
    pub fn new(body: impl FiberBody + 'static, mask: SignalMask) -> Self {
        FiberHandle(Rc::new(RefCell::new(Fiber {
            id: FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed)),
            status: FiberStatus::New,
            mask,
            generation: 0,
            scheduled: false,
            root: false,
            single_step: false,
            wait: Wait::None,
            supervisor: None,
            child: None,
            last_value: Value::Nil,
            cancel_pending: None,
            body: Some(Box::new(body)),
        })))
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.0.borrow().id
    }

    #[inline]
    pub fn status(&self) -> FiberStatus {
        self.0.borrow().status
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.0.borrow().generation
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    /// Whether this fiber's mask catches `sig`.
    #[inline]
    pub fn catches(&self, sig: Signal) -> bool {
        self.0.borrow().mask & sig.bit() != 0
    }

    /// The supervisor channel, if any.
    pub fn supervisor(&self) -> Option<Channel> {
        self.0.borrow().supervisor.clone()
    }

    /// Install a supervisor channel.
    pub fn set_supervisor(&self, chan: Channel) {
        self.0.borrow_mut().supervisor = Some(chan);
    }

    /// Last value produced by (or delivered to) the fiber.
    pub fn last_value(&self) -> Value {
        self.0.borrow().last_value.clone()
    }

    /// Identity comparison.
    #[inline]
    pub fn ptr_eq(&self, other: &FiberHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Weak reference for registries that must not keep the fiber alive.
    #[inline]
    pub(crate) fn downgrade(&self) -> Weak<RefCell<Fiber>> {
        Rc::downgrade(&self.0)
    }

    #[inline]
    pub(crate) fn from_rc(rc: Rc<RefCell<Fiber>>) -> Self {
        FiberHandle(rc)
    }

    #[inline]
    pub(crate) fn borrow(&self) -> Ref<'_, Fiber> {
        self.0.borrow()
    }

    #[inline]
    pub(crate) fn borrow_mut(&self) -> RefMut<'_, Fiber> {
        self.0.borrow_mut()
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(fib) => write!(f, "<{}:{}>", fib.id, fib.status.as_str()),
            Err(_) => write!(f, "<fiber:borrowed>"),
        }
    }
}
