//! 事件循环与纤程调度
//!
//! One [`EventLoop`] per thread drives everything: it resumes scheduled
//! fibers, expires timeouts, polls the OS for stream readiness and runs the
//! listener machines attached to streams. The loop is explicit; nothing in
//! this crate touches thread-local state, and a handle to the loop is
//! threaded through every operation that can suspend.
//!
//! Fibers are scheduled at most once at a time. [`EventLoop::schedule`]
//! refuses a fiber that is already queued, and every successful schedule
//! bumps the fiber's generation so parked entries left behind on channels
//! or in the timeout heap turn stale and get skipped lazily when popped.
//!
//! Other threads reach a loop through a [`WakeSender`]: a callback posted
//! from anywhere is queued under a mutex and a byte on a self-pipe makes
//! the sleeping poller return and run it.

pub(crate) mod poller;
pub mod queue;
pub mod timeout;
pub mod worker;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Weak;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::cell::RefCell;
use tracing::{debug, error, trace, warn};

use crate::runtime::channel::{
    close_ready_payload, give_ready_payload, take_ready_payload, Channel, GiveNow, Immediate,
    PopOutcome, PushOutcome, WaitMode,
};
use crate::runtime::errors::{RuntimeError, RuntimeResult};
use crate::runtime::fiber::{
    Fiber, FiberBody, FiberHandle, FiberId, FiberStatus, Signal, SignalMask, Step, Wait,
};
use crate::runtime::gc::{HeapStats, Marker};
use crate::runtime::stream::{
    ConnectMachine, ListenerEvent, ListenerId, Machine, MachineCx, MachineStatus, ReadMachine,
    ReadMode, StreamFlags, StreamHandle, WriteMachine,
};
use crate::runtime::value::Value;

use poller::{Interest, Multiplexer, PollEvent, SysPoller};
use queue::{Task, TaskQueue};
use timeout::TimeoutHeap;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Tunables for one event loop.
#[derive(Debug, Clone)]
pub struct EventLoopConfig {
    /// Initial capacity of the run queue.
    pub task_queue_capacity: usize,
    /// Capacity of the readiness event buffer.
    pub poll_batch: usize,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            task_queue_capacity: 64,
            poll_batch: 64,
        }
    }
}

/// Counters kept by the loop, exposed for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct LoopStats {
    pub turns: u64,
    pub fibers_resumed: u64,
    pub timeouts_fired: u64,
    pub stream_events: u64,
    pub posts_run: u64,
}

/// What one call to [`EventLoop::run_once`] did.
#[derive(Debug)]
pub enum LoopTurn {
    /// Work was performed and more may be pending.
    Ran,
    /// Nothing scheduled, no timeouts, no listeners, no outside references.
    Idle,
    /// A fiber raised the interrupt signal; control returns to the caller
    /// with the fiber that did it.
    Interrupted(FiberHandle),
}

/// State shared with [`WakeSender`]s on other threads.
pub(crate) struct WakeShared {
    loop_id: u64,
    read_fd: RawFd,
    write_fd: RawFd,
    posts: Mutex<VecDeque<Posted>>,
    /// Outside interest in this loop: parked cross-thread waits, offloaded
    /// work, interruptors. Non-zero keeps the loop from going idle.
    extra_refs: AtomicUsize,
}

type Posted = Box<dyn FnOnce(&mut EventLoop) + Send>;

impl WakeShared {
    fn new(loop_id: u64) -> io::Result<Arc<Self>> {
        let mut fds = [0 as RawFd; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            crate::runtime::stream::set_nonblocking(fd)?;
            crate::runtime::stream::set_cloexec(fd)?;
        }
        Ok(Arc::new(Self {
            loop_id,
            read_fd: fds[0],
            write_fd: fds[1],
            posts: Mutex::new(VecDeque::new()),
            extra_refs: AtomicUsize::new(0),
        }))
    }

    fn ring(&self) {
        // A full pipe already guarantees a pending wake.
        let byte = [1u8];
        unsafe {
            libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for WakeShared {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Sendable address of an event loop. Cloneable and usable from any thread;
/// each posted callback runs on the loop's own thread during its next turn.
#[derive(Clone)]
pub struct WakeSender(Arc<WakeShared>);

impl WakeSender {
    /// Queue `f` to run on the loop and wake it if it is sleeping in poll.
    pub fn post(&self, f: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.0.posts.lock().push_back(Box::new(f));
        self.0.ring();
    }

    /// The id of the loop this sender addresses.
    pub fn loop_id(&self) -> u64 {
        self.0.loop_id
    }
}

impl std::fmt::Debug for WakeSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WakeSender(loop {})", self.0.loop_id)
    }
}

/// Keeps a loop alive and lets another thread interrupt a running fiber.
pub struct Interruptor {
    wake: WakeSender,
    fiber: FiberId,
}

impl Interruptor {
    /// Request that the fiber stop at its next suspension point. The loop
    /// returns [`LoopTurn::Interrupted`] when the request lands.
    pub fn interrupt(&self) {
        let id = self.fiber;
        self.wake.post(move |ev| {
            if let Some(f) = ev.root_by_id(id) {
                ev.schedule_signal(&f, Value::Nil, Signal::INTERRUPT);
            }
        });
    }
}

impl Drop for Interruptor {
    fn drop(&mut self) {
        self.wake.0.extra_refs.fetch_sub(1, Ordering::AcqRel);
        self.wake.0.ring();
    }
}

/// One listener registration: a stream, the fiber waiting on it, the poll
/// interest, and the machine that reacts to events.
struct Listener {
    stream: StreamHandle,
    fiber: FiberHandle,
    interest: Interest,
    machine: Box<dyn Machine>,
}

/// A single-threaded event loop and fiber scheduler.
pub struct EventLoop {
    id: u64,
    config: EventLoopConfig,
    stats: LoopStats,
    heap: HeapStats,
    tasks: TaskQueue,
    timeouts: TimeoutHeap,
    poller: SysPoller,
    wake: Arc<WakeShared>,
    listeners: HashMap<ListenerId, Listener>,
    next_listener_id: u64,
    /// Streams with at least one registered listener, by descriptor.
    streams: HashMap<RawFd, StreamHandle>,
    /// Fibers parked for cross-thread wakes, addressable by id.
    parked: HashMap<FiberId, FiberHandle>,
    /// Root fibers this loop has resumed, for interruptors.
    roots: HashMap<FiberId, Weak<RefCell<Fiber>>>,
    events: Vec<PollEvent>,
}

impl EventLoop {
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(EventLoopConfig::default())
    }

    pub fn with_config(config: EventLoopConfig) -> RuntimeResult<Self> {
        let id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let wake = WakeShared::new(id)?;
        let mut poller = SysPoller::new()?;
        poller.register(wake.read_fd, Interest::READ)?;
        let poll_batch = config.poll_batch;
        debug!(loop_id = id, "event loop created");
        Ok(Self {
            id,
            tasks: TaskQueue::with_capacity(config.task_queue_capacity),
            config,
            stats: LoopStats::default(),
            heap: HeapStats::default(),
            timeouts: TimeoutHeap::new(),
            poller,
            wake,
            listeners: HashMap::new(),
            next_listener_id: 1,
            streams: HashMap::new(),
            parked: HashMap::new(),
            roots: HashMap::new(),
            events: Vec::with_capacity(poll_batch),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Allocation counters for in-flight listener state, for collector pacing.
    #[inline]
    pub fn heap_stats(&self) -> &HeapStats {
        &self.heap
    }

    /// A sendable handle for posting work to this loop from other threads.
    pub fn waker(&self) -> WakeSender {
        WakeSender(self.wake.clone())
    }

    /// Create a fiber from a body. The fiber is not scheduled.
    pub fn spawn(&mut self, body: impl FiberBody + 'static) -> FiberHandle {
        self.spawn_boxed(Box::new(body))
    }

    pub fn spawn_boxed(&mut self, body: Box<dyn FiberBody>) -> FiberHandle {
        FiberHandle::new(body, crate::runtime::fiber::MASK_NONE)
    }

    /// Create a fiber that catches the given signals when run as a child.
    pub fn spawn_masked(
        &mut self,
        body: impl FiberBody + 'static,
        mask: SignalMask,
    ) -> FiberHandle {
        FiberHandle::new(body, mask)
    }

    /// An interruptor for `fiber`, usable from any thread. Holding one
    /// keeps the loop alive.
    pub fn interruptor(&mut self, fiber: &FiberHandle) -> Interruptor {
        self.wake.extra_refs.fetch_add(1, Ordering::AcqRel);
        self.roots
            .insert(fiber.id(), fiber.downgrade());
        Interruptor {
            wake: self.waker(),
            fiber: fiber.id(),
        }
    }

    fn root_by_id(&mut self, id: FiberId) -> Option<FiberHandle> {
        let weak = self.roots.get(&id)?;
        match weak.upgrade() {
            Some(rc) => Some(FiberHandle::from_rc(rc)),
            None => {
                self.roots.remove(&id);
                None
            }
        }
    }

    // ---- scheduling ----------------------------------------------------

    /// Schedule `fiber` to resume with `value`. A fiber already queued or
    /// finished is left alone, so duplicated wake sources cannot double
    /// resume it.
    pub fn schedule(&mut self, fiber: &FiberHandle, value: Value) {
        self.schedule_signal(fiber, value, Signal::Ok);
    }

    /// Schedule with an explicit resume signal. `Signal::Error` turns the
    /// resume into a cancellation.
    pub fn schedule_signal(&mut self, fiber: &FiberHandle, value: Value, signal: Signal) {
        {
            let f = fiber.borrow();
            if f.scheduled || f.status.is_finished() {
                trace!(fiber = ?f.id, "schedule skipped");
                return;
            }
        }
        // A wake from one source invalidates whatever the fiber was
        // waiting on; a listener left registered would fire later and
        // resume the fiber into a different suspension point.
        self.clear_wait(fiber);
        {
            let mut f = fiber.borrow_mut();
            f.scheduled = true;
            f.generation += 1;
        }
        self.tasks.push(Task {
            fiber: fiber.clone(),
            value,
            signal,
        });
    }

    /// Cancel a suspended or scheduled fiber: it resumes by raising `error`
    /// at its suspension point. Any listener it is waiting on is torn down
    /// first.
    pub fn cancel(&mut self, fiber: &FiberHandle, error: Value) {
        self.schedule_signal(fiber, error, Signal::Error);
    }

    /// Tear down the wait a fiber is parked on, if any.
    fn clear_wait(&mut self, fiber: &FiberHandle) {
        let wait = std::mem::take(&mut fiber.borrow_mut().wait);
        match wait {
            Wait::Listener(id) => {
                self.fire_listener_event(id, ListenerEvent::Cancel);
                self.unregister_listener(id);
            }
            Wait::Parked => {
                if self.parked.remove(&fiber.id()).is_some() {
                    self.wake.extra_refs.fetch_sub(1, Ordering::AcqRel);
                }
            }
            Wait::None => {}
        }
    }

    /// Park registration for cross-thread waits. Idempotent per fiber.
    pub(crate) fn remote_park(&mut self, fiber: &FiberHandle) -> (WakeSender, FiberId, u64) {
        let id = fiber.id();
        if self.parked.insert(id, fiber.clone()).is_none() {
            self.wake.extra_refs.fetch_add(1, Ordering::AcqRel);
        }
        (self.waker(), id, fiber.generation())
    }

    /// Resolve a cross-thread wake. Returns the fiber only when it is still
    /// parked under the same generation it was parked with.
    pub(crate) fn unpark(&mut self, id: FiberId, generation: u64) -> Option<FiberHandle> {
        let fiber = self.parked.get(&id)?.clone();
        if fiber.generation() != generation || fiber.is_finished() {
            if fiber.is_finished() {
                self.parked.remove(&id);
                self.wake.extra_refs.fetch_sub(1, Ordering::AcqRel);
            }
            return None;
        }
        self.parked.remove(&id);
        self.wake.extra_refs.fetch_sub(1, Ordering::AcqRel);
        Some(fiber)
    }

    // ---- continuation protocol -----------------------------------------

    /// Resume a fiber with a value, running it until it suspends or
    /// finishes. Returns the signal it raised and the payload.
    ///
    /// Root fibers driven by the loop cannot be resumed by hand.
    pub fn continue_fiber(
        &mut self,
        fiber: &FiberHandle,
        input: Value,
    ) -> RuntimeResult<(Signal, Value)> {
        self.continue_signal(fiber, input, Signal::Ok)
    }

    /// Resume raising a signal into the fiber. `Signal::Error` cancels:
    /// the fiber does not run, it transitions straight to the error state
    /// with `input` as payload.
    pub fn continue_signal(
        &mut self,
        fiber: &FiberHandle,
        input: Value,
        sig: Signal,
    ) -> RuntimeResult<(Signal, Value)> {
        if fiber.borrow().root {
            return Err(RuntimeError::CannotResumeRoot);
        }
        self.resume_inner(fiber, fiber, input, sig)
    }

    /// Run one fiber as a loop-owned root.
    fn resume_root(
        &mut self,
        fiber: &FiberHandle,
        input: Value,
        sig: Signal,
    ) -> RuntimeResult<(Signal, Value)> {
        {
            let mut f = fiber.borrow_mut();
            if !f.root {
                f.root = true;
            }
        }
        self.roots.entry(fiber.id()).or_insert_with(|| fiber.downgrade());
        self.resume_inner(fiber, fiber, input, sig)
    }

    /// Core of the continuation protocol. `root` is the fiber the loop
    /// reschedules when a descendant suspends on an event.
    fn resume_inner(
        &mut self,
        root: &FiberHandle,
        fiber: &FiberHandle,
        input: Value,
        sig: Signal,
    ) -> RuntimeResult<(Signal, Value)> {
        // Delegate to a running child first; its result may resume us.
        let child = fiber.borrow().child.clone();
        if let Some(child) = child {
            let (csig, cval) = self.resume_inner(root, &child, input, sig)?;
            return self.absorb_child(root, fiber, &child, csig, cval);
        }

        if sig == Signal::Error {
            // Cancellation: the fiber never runs again.
            let mut f = fiber.borrow_mut();
            f.status = FiberStatus::Error;
            f.last_value = input.clone();
            f.body = None;
            return Ok((Signal::Error, input));
        }

        {
            let f = fiber.borrow();
            if !f.status.is_resumable() {
                return Err(RuntimeError::NotResumable(f.status));
            }
        }

        let mut body = match fiber.borrow_mut().body.take() {
            Some(b) => Some(b),
            None => return Err(RuntimeError::NoBody),
        };
        fiber.borrow_mut().status = FiberStatus::Alive;
        self.stats.fibers_resumed += 1;

        let step = {
            let mut cx = OpCtx {
                ev: self,
                root: root.clone(),
                fiber: fiber.clone(),
                resumed: sig,
            };
            body.as_mut().unwrap().resume(&mut cx, input)
        };

        let mut f = fiber.borrow_mut();
        match step {
            Step::Done(v) => {
                f.status = FiberStatus::Dead;
                f.last_value = v.clone();
                Ok((Signal::Ok, v))
            }
            Step::Fail(v) => {
                f.status = FiberStatus::Error;
                f.last_value = v.clone();
                Ok((Signal::Error, v))
            }
            Step::Suspend(sig, v) => {
                f.body = body;
                f.status = FiberStatus::for_signal(sig);
                f.last_value = v.clone();
                if let Some(error) = f.cancel_pending.take() {
                    // Cancelled while running; take effect at this
                    // suspension point.
                    drop(f);
                    return self.resume_inner(root, fiber, error, Signal::Error);
                }
                if f.single_step && sig != Signal::Debug {
                    f.status = FiberStatus::Debug;
                    drop(f);
                    return Ok((Signal::Debug, v));
                }
                Ok((sig, v))
            }
        }
    }

    /// Fold a child's completion or signal into its parent.
    fn absorb_child(
        &mut self,
        root: &FiberHandle,
        parent: &FiberHandle,
        child: &FiberHandle,
        csig: Signal,
        cval: Value,
    ) -> RuntimeResult<(Signal, Value)> {
        if csig == Signal::EVENT {
            // Child suspended on an event; the whole stack stays pending
            // and the wake-up re-enters through the root.
            return Ok((csig, cval));
        }
        match csig {
            Signal::Ok => {
                parent.borrow_mut().child = None;
                self.resume_inner(root, parent, cval, Signal::Ok)
            }
            _ if child.catches(csig) => {
                parent.borrow_mut().child = None;
                let caught = Value::tuple(vec![Value::str(csig.name()), cval]);
                self.resume_inner(root, parent, caught, Signal::Ok)
            }
            _ => {
                // Uncaught: propagate up, leaving the chain intact so the
                // environment can inspect it.
                parent.borrow_mut().status = FiberStatus::for_signal(csig);
                Ok((csig, cval))
            }
        }
    }

    /// Route a root fiber's signal after a loop-driven resume. Event
    /// suspensions are silent; everything else goes to the supervisor when
    /// one is installed, otherwise to the log.
    fn settle_root(&mut self, fiber: &FiberHandle, sig: Signal, value: Value) {
        if sig == Signal::EVENT {
            return;
        }
        if sig == Signal::Ok && !fiber.is_finished() {
            return;
        }
        if let Some(chan) = fiber.supervisor() {
            let msg = Value::tuple(vec![
                Value::str(fiber.status().as_str()),
                Value::Fiber(fiber.clone()),
            ]);
            if let Err(e) = chan.give_noblock(self, msg) {
                warn!(error = %e, "failed to notify supervisor");
            }
            return;
        }
        match sig {
            Signal::Ok => {
                trace!(fiber = %fiber.id(), "fiber completed");
            }
            _ if fiber.catches(sig) => {
                debug!(fiber = %fiber.id(), signal = sig.name(), "signal handled");
            }
            Signal::Error => {
                error!(fiber = %fiber.id(), payload = %value, "fiber error");
            }
            _ => {
                warn!(fiber = %fiber.id(), signal = sig.name(), payload = %value, "unhandled signal");
            }
        }
    }

    // ---- timeouts ------------------------------------------------------

    /// Wake `fiber` after `delay` unless it gets scheduled first.
    pub fn add_timeout(&mut self, fiber: &FiberHandle, delay: Duration) {
        self.timeouts
            .push(Instant::now() + delay, fiber.clone(), None, false);
    }

    /// Cancel `watched` with a timeout error if it has not finished when
    /// the deadline passes. `fiber` is the waiter to wake.
    pub fn add_deadline(&mut self, fiber: &FiberHandle, watched: &FiberHandle, delay: Duration) {
        self.timeouts
            .push(Instant::now() + delay, fiber.clone(), Some(watched.clone()), true);
    }

    // ---- listeners -----------------------------------------------------

    /// Attach a machine to a stream on behalf of a waiting fiber. The
    /// machine gets an `Init` event immediately so an already-ready
    /// descriptor completes without a poll round trip.
    pub(crate) fn register_listener(
        &mut self,
        stream: &StreamHandle,
        fiber: &FiberHandle,
        interest: Interest,
        machine: Box<dyn Machine>,
    ) -> RuntimeResult<ListenerId> {
        {
            let f = fiber.borrow();
            if !matches!(f.wait, Wait::None) {
                return Err(RuntimeError::AlreadyWaiting);
            }
        }
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;

        let fd = stream.fd();
        let combined = self.interest_for(fd).or(interest);
        self.poller.register(fd, combined)?;
        self.streams.insert(fd, stream.clone());
        stream.borrow_mut().listeners.push(id);
        fiber.borrow_mut().wait = Wait::Listener(id);

        self.listeners.insert(
            id,
            Listener {
                stream: stream.clone(),
                fiber: fiber.clone(),
                interest,
                machine,
            },
        );
        self.heap.allocate(std::mem::size_of::<Listener>());
        trace!(listener = id.0, fd, "listener registered");
        self.fire_listener_event(id, ListenerEvent::Init);
        Ok(id)
    }

    /// Deliver one event to a listener's machine, unregistering it when the
    /// machine reports done.
    fn fire_listener_event(&mut self, id: ListenerId, event: ListenerEvent) {
        let (mut machine, fiber, stream) = match self.listeners.get_mut(&id) {
            Some(l) => {
                // Take the machine out so it can borrow the loop.
                let machine = std::mem::replace(&mut l.machine, Box::new(NoopMachine));
                (machine, l.fiber.clone(), l.stream.clone())
            }
            None => return,
        };
        let status = {
            let mut cx = MachineCx {
                ev: self,
                fiber,
                stream,
            };
            machine.on_event(&mut cx, event)
        };
        match status {
            MachineStatus::Pending => {
                if let Some(l) = self.listeners.get_mut(&id) {
                    l.machine = machine;
                }
            }
            MachineStatus::Done => {
                self.unregister_listener(id);
            }
        }
    }

    /// Tear down one listener and drop the descriptor registration when it
    /// was the last interest on the stream.
    pub(crate) fn unregister_listener(&mut self, id: ListenerId) {
        let Some(listener) = self.listeners.remove(&id) else {
            return;
        };
        let fd = listener.stream.fd();
        {
            let mut s = listener.stream.borrow_mut();
            s.listeners.retain(|l| *l != id);
        }
        {
            let mut f = listener.fiber.borrow_mut();
            if f.wait == Wait::Listener(id) {
                f.wait = Wait::None;
            }
        }
        let remaining = self.interest_for(fd);
        if remaining.is_empty() {
            self.streams.remove(&fd);
            // The descriptor may already be closed; both are fine.
            if let Err(e) = self.poller.unregister(fd) {
                debug!(fd, error = %e, "unregister after close");
            }
        } else if let Err(e) = self.poller.register(fd, remaining) {
            warn!(fd, error = %e, "failed to narrow poll interest");
        }
        self.heap.release(std::mem::size_of::<Listener>());
        trace!(listener = id.0, fd, "listener unregistered");
    }

    /// Union of interests of all listeners still attached to `fd`.
    fn interest_for(&self, fd: RawFd) -> Interest {
        self.listeners
            .values()
            .filter(|l| l.stream.fd() == fd)
            .fold(Interest::default(), |acc, l| acc.or(l.interest))
    }

    /// Close a stream: every attached listener sees a close event, then the
    /// descriptor is released.
    pub fn close_stream(&mut self, stream: &StreamHandle) {
        let ids: Vec<ListenerId> = {
            let mut s = stream.borrow_mut();
            if s.is_closed() {
                return;
            }
            s.flags.insert(StreamFlags::CLOSED);
            s.listeners.iter().copied().collect()
        };
        for id in ids {
            self.fire_listener_event(id, ListenerEvent::Close);
            self.unregister_listener(id);
        }
        let fd = stream.fd();
        self.streams.remove(&fd);
        let _ = self.poller.unregister(fd);
        crate::runtime::stream::close_fd(fd);
    }

    // ---- garbage collection support ------------------------------------

    /// Mark every value the loop keeps alive: queued tasks, timeout
    /// waiters, listener fibers and machine state, parked fibers.
    pub fn mark_pending(&self, marker: &mut dyn Marker) {
        for task in self.tasks.iter() {
            marker.mark(&task.value);
            marker.mark(&Value::Fiber(task.fiber.clone()));
        }
        for entry in self.timeouts.iter() {
            marker.mark(&Value::Fiber(entry.fiber.clone()));
            if let Some(w) = &entry.watched {
                marker.mark(&Value::Fiber(w.clone()));
            }
        }
        for listener in self.listeners.values() {
            marker.mark(&Value::Fiber(listener.fiber.clone()));
            marker.mark(&Value::Stream(listener.stream.clone()));
            listener.machine.trace(marker);
        }
        for fiber in self.parked.values() {
            marker.mark(&Value::Fiber(fiber.clone()));
        }
    }

    // ---- the loop ------------------------------------------------------

    /// Run until there is nothing left to do. Returns the interrupted
    /// fiber if one raised the interrupt signal.
    pub fn run(&mut self) -> RuntimeResult<Option<FiberHandle>> {
        loop {
            match self.run_once()? {
                LoopTurn::Ran => {}
                LoopTurn::Idle => return Ok(None),
                LoopTurn::Interrupted(f) => return Ok(Some(f)),
            }
        }
    }

    /// Schedule `fiber` as a root and run the loop to completion.
    pub fn run_fiber(&mut self, fiber: &FiberHandle, input: Value) -> RuntimeResult<Value> {
        fiber.borrow_mut().root = true;
        self.roots.entry(fiber.id()).or_insert_with(|| fiber.downgrade());
        self.schedule(fiber, input);
        self.run()?;
        Ok(fiber.last_value())
    }

    /// One turn: expire timeouts, drain the run queue, then poll.
    pub fn run_once(&mut self) -> RuntimeResult<LoopTurn> {
        self.stats.turns += 1;

        // 1. Timeouts that have come due.
        let now = Instant::now();
        while let Some(entry) = self.timeouts.pop_due(now) {
            self.stats.timeouts_fired += 1;
            match entry.watched {
                Some(watched) if entry.is_error => {
                    if !watched.is_finished() {
                        self.cancel(&watched, Value::str("deadline expired"));
                    }
                }
                _ if entry.is_error => {
                    self.cancel(&entry.fiber, Value::str("timeout"));
                }
                _ => {
                    self.schedule(&entry.fiber, Value::Nil);
                }
            }
        }

        // 2. Drain scheduled fibers. New schedules run in the same turn.
        while let Some(task) = self.tasks.pop() {
            let Task {
                fiber,
                value,
                signal,
            } = task;
            fiber.borrow_mut().scheduled = false;
            if signal == Signal::INTERRUPT {
                fiber.borrow_mut().status = FiberStatus::for_signal(Signal::INTERRUPT);
                return Ok(LoopTurn::Interrupted(fiber));
            }
            let (sig, value) = self.resume_root(&fiber, value, signal)?;
            self.settle_root(&fiber, sig, value);
        }

        // 3. Idle detection: nothing queued, nothing timed, nothing
        // listening and no outside references.
        let outside = self.wake.extra_refs.load(Ordering::Acquire);
        if self.tasks.is_empty()
            && self.timeouts.is_empty()
            && self.listeners.is_empty()
            && outside == 0
        {
            return Ok(LoopTurn::Idle);
        }

        // 4. Sleep in the poller until readiness, a timeout, or a wake.
        let timeout = if !self.tasks.is_empty() {
            Some(Duration::ZERO)
        } else {
            self.timeouts
                .next_deadline()
                .map(|d| d.saturating_duration_since(Instant::now()))
        };
        let mut events = std::mem::take(&mut self.events);
        events.clear();
        let poll_result = self.poller.wait(timeout, &mut events);
        // Level-triggered backends re-report anything past the cap on the
        // next turn.
        events.truncate(self.config.poll_batch);
        for event in events.iter().copied() {
            if event.fd == self.wake.read_fd {
                self.drain_posts();
                continue;
            }
            self.stats.stream_events += 1;
            self.dispatch_stream_event(event);
        }
        self.events = events;
        poll_result?;

        Ok(LoopTurn::Ran)
    }

    /// Run callbacks posted from other threads.
    fn drain_posts(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.wake.read_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
        loop {
            let post = self.wake.posts.lock().pop_front();
            match post {
                Some(f) => {
                    self.stats.posts_run += 1;
                    f(self);
                }
                None => break,
            }
        }
    }

    /// Deliver readiness to every listener on the descriptor, errors and
    /// hangups first.
    fn dispatch_stream_event(&mut self, event: PollEvent) {
        let ids: Vec<ListenerId> = match self.streams.get(&event.fd) {
            Some(stream) => stream.borrow().listeners.iter().copied().collect(),
            None => return,
        };
        for id in ids {
            let interest = match self.listeners.get(&id) {
                Some(l) => l.interest,
                None => continue,
            };
            if event.error {
                self.fire_listener_event(id, ListenerEvent::Err);
                continue;
            }
            if event.hangup {
                self.fire_listener_event(id, ListenerEvent::Hup);
                continue;
            }
            if event.readable && interest.readable {
                self.fire_listener_event(id, ListenerEvent::Read);
            }
            if event.writable && interest.writable {
                self.fire_listener_event(id, ListenerEvent::Write);
            }
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Let machines observe teardown.
        let ids: Vec<ListenerId> = self.listeners.keys().copied().collect();
        for id in ids {
            self.fire_listener_event(id, ListenerEvent::Deinit);
            self.unregister_listener(id);
        }
    }
}

/// Machine placeholder used while the real machine is borrowed out during
/// event delivery.
struct NoopMachine;

impl Machine for NoopMachine {
    fn on_event(&mut self, _cx: &mut MachineCx<'_>, _event: ListenerEvent) -> MachineStatus {
        MachineStatus::Pending
    }
}

/// Operation context handed to a fiber body on every resume.
///
/// The body calls exactly one suspending operation (or finishes) per
/// resume; each operation arranges its own wake-up and returns the `Step`
/// the body should yield.
pub struct OpCtx<'a> {
    pub ev: &'a mut EventLoop,
    /// The loop-owned root of the current fiber stack. Wake-ups always
    /// reschedule the root; intermediate parents resume through it.
    pub(crate) root: FiberHandle,
    pub(crate) fiber: FiberHandle,
    /// The signal this resume was entered with.
    pub resumed: Signal,
}

impl OpCtx<'_> {
    /// The fiber this body belongs to.
    #[inline]
    pub fn fiber(&self) -> &FiberHandle {
        &self.fiber
    }

    fn suspend_event(&self) -> Step {
        Step::Suspend(Signal::EVENT, Value::Nil)
    }

    fn complete(&mut self, value: Value) -> Step {
        self.ev.schedule(&self.root, value);
        self.suspend_event()
    }

    /// Suspend until `delay` has passed; resumes with nil.
    pub fn sleep(&mut self, delay: Duration) -> Step {
        self.ev.add_timeout(&self.root, delay);
        self.suspend_event()
    }

    /// Suspend until someone schedules this fiber explicitly.
    pub fn await_resume(&mut self) -> Step {
        self.suspend_event()
    }

    /// Cancel `fiber` with a timeout error unless it finishes within
    /// `delay`. Pair with [`OpCtx::resume_fiber`].
    pub fn with_deadline(&mut self, fiber: &FiberHandle, delay: Duration) {
        let root = self.root.clone();
        self.ev.add_deadline(&root, fiber, delay);
    }

    /// Give a value to a channel, parking for backpressure if needed.
    /// Resumes with nil once the value is accepted.
    pub fn give(&mut self, chan: &Channel, value: Value) -> Step {
        match chan.give(self.ev, &self.root, value) {
            Ok(PushOutcome::Delivered) => self.complete(Value::Nil),
            Ok(PushOutcome::Parked) => {
                self.root.borrow_mut().wait = Wait::Parked;
                self.suspend_event()
            }
            Err(e) => Step::Fail(Value::str(e.to_string())),
        }
    }

    /// Take a value from a channel, parking if it is empty. Resumes with
    /// the value, or nil when the channel is closed and drained.
    pub fn take(&mut self, chan: &Channel) -> Step {
        match chan.take(self.ev, &self.root) {
            Ok(PopOutcome::Item(v)) => self.complete(v),
            Ok(PopOutcome::Closed) => self.complete(Value::Nil),
            Ok(PopOutcome::Parked) => {
                self.root.borrow_mut().wait = Wait::Parked;
                self.suspend_event()
            }
            Err(e) => Step::Fail(Value::str(e.to_string())),
        }
    }

    /// Wait on several channel operations at once; exactly one completes.
    /// Clauses are checked in order; the result is a tagged tuple,
    /// `("take" chan value)`, `("give" chan)` or `("close" chan)`.
    pub fn select(&mut self, clauses: Vec<SelectClause>) -> Step {
        self.select_inner(clauses, false)
    }

    /// Like [`OpCtx::select`] but immediacy checks are tried in random
    /// order, so a hot channel cannot starve the others.
    pub fn rselect(&mut self, clauses: Vec<SelectClause>) -> Step {
        self.select_inner(clauses, true)
    }

    fn select_inner(&mut self, mut clauses: Vec<SelectClause>, randomize: bool) -> Step {
        let mut order: Vec<usize> = (0..clauses.len()).collect();
        if randomize {
            // Fisher-Yates.
            let mut rng = rand::rng();
            for i in (1..order.len()).rev() {
                let j = rand::Rng::random_range(&mut rng, 0..=i);
                order.swap(i, j);
            }
        }

        // Pass 1: complete the first clause that is ready right now.
        for &i in &order {
            let ready = match &mut clauses[i] {
                SelectClause::Take(chan) => {
                    let chan = chan.clone();
                    match chan.take_now(self.ev) {
                        Ok(Immediate::Ready(v)) => Some(take_ready_payload(&chan, v)),
                        Ok(Immediate::Closed) => Some(close_ready_payload(&chan)),
                        Ok(Immediate::Blocked) => None,
                        Err(e) => return Step::Fail(Value::str(e.to_string())),
                    }
                }
                SelectClause::Give(chan, value) => {
                    let chan = chan.clone();
                    let v = std::mem::take(value);
                    match chan.give_now(self.ev, v) {
                        Ok(GiveNow::Given) => Some(give_ready_payload(&chan)),
                        Ok(GiveNow::Closed) => Some(close_ready_payload(&chan)),
                        Ok(GiveNow::Blocked(v)) => {
                            // Hand the value back for pass 2.
                            *value = v;
                            None
                        }
                        Err(e) => return Step::Fail(Value::str(e.to_string())),
                    }
                }
            };
            if let Some(payload) = ready {
                return self.complete(payload);
            }
        }

        // Pass 2: park on every clause; the first channel to move wins and
        // the rest turn stale via the generation bump.
        for clause in clauses {
            match clause {
                SelectClause::Take(chan) => {
                    chan.park_reader(self.ev, &self.root, WaitMode::Choice);
                }
                SelectClause::Give(chan, value) => {
                    if let Err(e) =
                        chan.buffer_and_park(self.ev, &self.root, value, WaitMode::Choice)
                    {
                        return Step::Fail(Value::str(e.to_string()));
                    }
                }
            }
        }
        self.root.borrow_mut().wait = Wait::Parked;
        self.suspend_event()
    }

    /// Close a channel, waking everything parked on it.
    pub fn close_channel(&mut self, chan: &Channel) {
        chan.close(self.ev);
    }

    /// Read up to `n` bytes from a stream. Resumes with a bytes value, or
    /// nil at end of stream.
    pub fn read(&mut self, stream: &StreamHandle, n: usize) -> Step {
        self.read_mode(stream, ReadMode::Some(n))
    }

    /// Read exactly `n` bytes, accumulating across events. A short result
    /// means end of stream arrived first.
    pub fn chunk(&mut self, stream: &StreamHandle, n: usize) -> Step {
        self.read_mode(stream, ReadMode::Chunk(n))
    }

    fn read_mode(&mut self, stream: &StreamHandle, mode: ReadMode) -> Step {
        if let Err(e) = stream.borrow().check_role(StreamFlags::READABLE) {
            return Step::Fail(Value::str(e.to_string()));
        }
        let root = self.root.clone();
        match self.ev.register_listener(
            stream,
            &root,
            Interest::READ,
            Box::new(ReadMachine::new(mode)),
        ) {
            Ok(_) => self.suspend_event(),
            Err(e) => Step::Fail(Value::str(e.to_string())),
        }
    }

    /// Write all of `data` (a bytes or string value) to a stream. Resumes
    /// with nil when the final byte is accepted by the OS.
    pub fn write(&mut self, stream: &StreamHandle, data: Value) -> Step {
        if let Err(e) = stream.borrow().check_role(StreamFlags::WRITABLE) {
            return Step::Fail(Value::str(e.to_string()));
        }
        if !matches!(data, Value::Bytes(_) | Value::Str(_)) {
            return Step::Fail(Value::str(format!(
                "cannot write value of type {}",
                data.type_name()
            )));
        }
        let root = self.root.clone();
        match self.ev.register_listener(
            stream,
            &root,
            Interest::WRITE,
            Box::new(WriteMachine::new(data)),
        ) {
            Ok(_) => self.suspend_event(),
            Err(e) => Step::Fail(Value::str(e.to_string())),
        }
    }

    /// Accept one connection from a listening stream. Resumes with the new
    /// stream, or nil if the listener closes first.
    pub fn accept(&mut self, stream: &StreamHandle) -> Step {
        if let Err(e) = stream.borrow().check_role(StreamFlags::LISTENING) {
            return Step::Fail(Value::str(e.to_string()));
        }
        let root = self.root.clone();
        match self.ev.register_listener(
            stream,
            &root,
            Interest::READ,
            Box::new(crate::runtime::stream::AcceptMachine::once()),
        ) {
            Ok(_) => self.suspend_event(),
            Err(e) => Step::Fail(Value::str(e.to_string())),
        }
    }

    /// Serve a listening stream: every accepted connection spawns a worker
    /// fiber from `handler`. Suspends until the listener closes or errors.
    pub fn accept_loop(
        &mut self,
        stream: &StreamHandle,
        handler: crate::runtime::stream::AcceptHandler,
    ) -> Step {
        if let Err(e) = stream.borrow().check_role(StreamFlags::LISTENING) {
            return Step::Fail(Value::str(e.to_string()));
        }
        let root = self.root.clone();
        match self.ev.register_listener(
            stream,
            &root,
            Interest::READ,
            Box::new(crate::runtime::stream::AcceptMachine::looping(handler)),
        ) {
            Ok(_) => self.suspend_event(),
            Err(e) => Step::Fail(Value::str(e.to_string())),
        }
    }

    /// Finish a non-blocking connect started with
    /// [`tcp_connect_start`](crate::runtime::stream::tcp_connect_start).
    /// Resumes with the connected stream.
    pub fn connect(&mut self, stream: &StreamHandle) -> Step {
        if let Err(e) = stream.borrow().check_role(StreamFlags::WRITABLE) {
            return Step::Fail(Value::str(e.to_string()));
        }
        let root = self.root.clone();
        match self
            .ev
            .register_listener(stream, &root, Interest::WRITE, Box::new(ConnectMachine))
        {
            Ok(_) => self.suspend_event(),
            Err(e) => Step::Fail(Value::str(e.to_string())),
        }
    }

    /// Run blocking work on a plain thread; resume with its result.
    pub fn offload(
        &mut self,
        work: impl FnOnce() -> worker::WorkResult + Send + 'static,
    ) -> Step {
        worker::offload(self.ev, &self.root, work);
        self.suspend_event()
    }

    /// Resume a child fiber from inside this one. If the child suspends on
    /// an event, this fiber stays pending until the child settles.
    pub fn resume_fiber(&mut self, child: &FiberHandle, input: Value) -> Step {
        {
            let c = child.borrow();
            if c.root {
                return Step::Fail(Value::str("cannot resume a root fiber"));
            }
            if !c.status.is_resumable() {
                return Step::Fail(Value::str(format!(
                    "cannot resume fiber with status {}",
                    c.status.as_str()
                )));
            }
        }
        let root = self.root.clone();
        let parent = self.fiber.clone();
        match self.ev.resume_inner(&root, child, input, Signal::Ok) {
            Ok((sig, value)) => {
                if sig == Signal::EVENT {
                    // Child parked on an event; adopt it so its wake-up
                    // resumes through us.
                    parent.borrow_mut().child = Some(child.clone());
                    return Step::Suspend(Signal::EVENT, value);
                }
                match self.ev.absorb_result(child, sig, value) {
                    AbsorbedChild::Value(v) => self.complete(v),
                    AbsorbedChild::Propagate(sig, v) => {
                        // Leave the chain visible for inspection.
                        parent.borrow_mut().child = Some(child.clone());
                        Step::Suspend(sig, v)
                    }
                }
            }
            Err(e) => Step::Fail(Value::str(e.to_string())),
        }
    }
}

/// One arm of a select.
pub enum SelectClause {
    Take(Channel),
    Give(Channel, Value),
}

pub(crate) enum AbsorbedChild {
    /// The child settled; resume the caller with this value.
    Value(Value),
    /// The child raised a signal the caller does not catch.
    Propagate(Signal, Value),
}

impl EventLoop {
    /// Immediate variant of [`EventLoop::absorb_child`], for a child that
    /// settled without suspending.
    pub(crate) fn absorb_result(
        &mut self,
        child: &FiberHandle,
        sig: Signal,
        value: Value,
    ) -> AbsorbedChild {
        match sig {
            Signal::Ok => AbsorbedChild::Value(value),
            _ if child.catches(sig) => AbsorbedChild::Value(Value::tuple(vec![
                Value::str(sig.name()),
                value,
            ])),
            _ => AbsorbedChild::Propagate(sig, value),
        }
    }

    /// Resume one step of a fiber for debugging: the fiber runs until its
    /// next suspension and then lands in the debug state.
    pub fn step(&mut self, fiber: &FiberHandle, input: Value) -> RuntimeResult<(Signal, Value)> {
        fiber.borrow_mut().single_step = true;
        let out = self.continue_fiber(fiber, input);
        fiber.borrow_mut().single_step = false;
        out
    }
}
