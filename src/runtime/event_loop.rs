//! Single-threaded cooperative event loop with a bounded registration table.
//!
//! One loop per thread. The capacity declared at construction is a hard
//! budget: every live registration (timer, socket notifier, or user-space
//! wakeup) occupies one slot, and allocation past the budget fails
//! synchronously with [`CapacityError`]. This makes the worst-case kernel
//! registration count of a worker exactly computable from its session budget.
//!
//! # Architecture
//!
//! The loop is a `poll → dispatch → check exit` cycle over the `polling`
//! crate's OS reactor:
//!
//! 1. compute the next deadline from the timer heap;
//! 2. block in [`Poller::wait`] up to that deadline;
//! 3. drain the remote-op queue (user-space readiness raised from any
//!    thread), then fired timers in deadline order (ties FIFO by registration
//!    order), then fd events in the order the OS reports them;
//! 4. invoke the collected handlers with no internal borrows held, so a
//!    handler may freely register, deregister, or request exit.
//!
//! Slots carry a generation counter; a stale wake or heap entry whose
//! generation no longer matches its slot is skipped. This is what makes
//! dropping a [`Registration`] from inside a handler safe while later events
//! for the old slot are still queued.
//!
//! Socket notifications are level-triggered ([`PollMode::Level`]), matching
//! the epoll/kqueue default the rest of the stack assumes.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use polling::{Event, Events, PollMode, Poller};

use crate::error::{CapacityError, RegisterError};

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Readiness bit: the descriptor is readable.
pub const READABLE: u8 = 0b01;
/// Readiness bit: the descriptor is writable.
pub const WRITABLE: u8 = 0b10;

/// Whether a timer registration fires once or repeatedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    SingleShot,
    Interval,
}

type Handler = Rc<dyn Fn(u8)>;

// =============================================================================
// Registration table
// =============================================================================

enum EntryKind {
    Timer { period: Option<Duration> },
    Fd { fd: RawFd },
    Wake,
}

struct Entry {
    gen: u64,
    kind: EntryKind,
    handler: Handler,
}

/// Heap key: (deadline, arm sequence, slot, generation). Deadline order,
/// ties broken by arm order.
type TimerKey = (Instant, u64, usize, u64);

struct LoopState {
    slots: Vec<Option<Entry>>,
    free: Vec<usize>,
    timers: BinaryHeap<Reverse<TimerKey>>,
    next_seq: u64,
    next_gen: u64,
}

impl LoopState {
    fn live(&self, key: usize, gen: u64) -> bool {
        matches!(self.slots.get(key), Some(Some(e)) if e.gen == gen)
    }

    fn alloc(&mut self, kind: EntryKind, handler: Handler) -> Result<(usize, u64), CapacityError> {
        let key = self.free.pop().ok_or(CapacityError {
            capacity: self.slots.len(),
        })?;
        self.next_gen += 1;
        let gen = self.next_gen;
        self.slots[key] = Some(Entry { gen, kind, handler });
        Ok((key, gen))
    }
}

// =============================================================================
// Cross-thread wake path
// =============================================================================

/// A readiness raise arriving from another thread. Ops carry the slot
/// generation they were issued against and are discarded on a mismatch, which
/// is what makes a token outliving its registration harmless.
enum RemoteOp {
    Readiness { key: usize, gen: u64, readiness: u8 },
}

/// Multi-producer op queue the loop drains after every poll.
///
/// [`SetReadiness::set_readiness`] pushes here and then calls
/// [`Poller::notify`]. The notify is sticky: an op pushed while the loop is
/// dispatching (rather than blocking) still forces the next `wait` to return
/// immediately, so no raise is ever lost.
///
/// Lock-free in normal builds. Loom has no model for `SegQueue`, so under
/// `--cfg loom` this runs on a locked deque instead and the wake-protocol
/// models below exercise that build.
#[cfg(not(loom))]
struct RemoteOps(crossbeam_queue::SegQueue<RemoteOp>);

#[cfg(not(loom))]
impl RemoteOps {
    fn new() -> Self {
        Self(crossbeam_queue::SegQueue::new())
    }

    fn push(&self, op: RemoteOp) {
        self.0.push(op);
    }

    fn pop(&self) -> Option<RemoteOp> {
        self.0.pop()
    }
}

#[cfg(loom)]
struct RemoteOps(loom::sync::Mutex<std::collections::VecDeque<RemoteOp>>);

#[cfg(loom)]
impl RemoteOps {
    fn new() -> Self {
        Self(loom::sync::Mutex::new(std::collections::VecDeque::new()))
    }

    fn push(&self, op: RemoteOp) {
        self.0.lock().unwrap().push_back(op);
    }

    fn pop(&self) -> Option<RemoteOp> {
        self.0.lock().unwrap().pop_front()
    }
}

struct LoopShared {
    poller: Poller,
    remote: RemoteOps,
    exit_requested: AtomicBool,
    exit_code: AtomicI32,
}

/// User-space wakeup source for one loop registration.
///
/// Setting readiness from any thread queues a wake for the associated
/// registration and interrupts the owning loop's current poll. The handler
/// runs on the loop thread with the readiness byte that was set. The paired
/// [`Registration`] guard returned by [`EventLoop::make_set_readiness`] is the
/// sole deregistration point; a token whose registration is gone sets
/// readiness into the void.
pub struct SetReadiness {
    key: usize,
    gen: u64,
    shared: Arc<LoopShared>,
}

impl SetReadiness {
    /// Raises readiness on the registration. Safe from any thread.
    pub fn set_readiness(&self, readiness: u8) -> io::Result<()> {
        self.shared.remote.push(RemoteOp::Readiness {
            key: self.key,
            gen: self.gen,
            readiness,
        });
        self.shared.poller.notify()
    }
}

// =============================================================================
// Registration guard
// =============================================================================

/// A live slot in a loop's registration table. Dropping the guard
/// deregisters: timers disarm, descriptors are removed from the OS reactor,
/// and late wakes for the slot become no-ops.
#[derive(Debug)]
pub struct Registration {
    key: usize,
    gen: u64,
    owner: Weak<EventLoop>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(l) = self.owner.upgrade() {
            l.deregister(self.key, self.gen);
        }
    }
}

// =============================================================================
// EventLoop
// =============================================================================

thread_local! {
    static CURRENT: RefCell<Weak<EventLoop>> = RefCell::new(Weak::new());
}

/// The per-thread reactor. See the module docs for the dispatch model.
pub struct EventLoop {
    state: RefCell<LoopState>,
    shared: Arc<LoopShared>,
    events: RefCell<Events>,
    running: Cell<bool>,
}

impl EventLoop {
    /// Creates a loop with a fixed registration budget and installs it as the
    /// thread-current loop. Fails only on OS resource exhaustion.
    ///
    /// # Panics
    ///
    /// Panics if the thread already owns a live event loop.
    pub fn new(capacity: usize) -> io::Result<Rc<EventLoop>> {
        let poller = Poller::new()?;
        let l = Rc::new(EventLoop {
            state: RefCell::new(LoopState {
                slots: (0..capacity).map(|_| None).collect(),
                free: (0..capacity).rev().collect(),
                timers: BinaryHeap::new(),
                next_seq: 0,
                next_gen: 0,
            }),
            shared: Arc::new(LoopShared {
                poller,
                remote: RemoteOps::new(),
                exit_requested: AtomicBool::new(false),
                exit_code: AtomicI32::new(0),
            }),
            events: RefCell::new(Events::new()),
            running: Cell::new(false),
        });
        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            assert!(
                cur.upgrade().is_none(),
                "a thread can own at most one event loop"
            );
            *cur = Rc::downgrade(&l);
        });
        Ok(l)
    }

    /// The loop owned by the calling thread, if one exists.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT.with(|c| c.borrow().upgrade())
    }

    /// The registration budget declared at construction.
    pub fn capacity(&self) -> usize {
        self.state.borrow().slots.len()
    }

    /// Number of currently outstanding registrations.
    pub fn registrations(&self) -> usize {
        let st = self.state.borrow();
        st.slots.len() - st.free.len()
    }

    /// Arms a timer. Single-shot timers fire once and disarm; interval timers
    /// re-arm with the same period until the registration is dropped. Either
    /// way the slot stays occupied until the guard goes away.
    pub fn register_timer(
        self: &Rc<Self>,
        timeout: Duration,
        kind: TimerKind,
        handler: impl Fn() + 'static,
    ) -> Result<Registration, CapacityError> {
        let mut st = self.state.borrow_mut();
        let period = match kind {
            TimerKind::SingleShot => None,
            TimerKind::Interval => Some(timeout),
        };
        let h: Handler = Rc::new(move |_| handler());
        let (key, gen) = st.alloc(EntryKind::Timer { period }, h)?;
        st.next_seq += 1;
        let seq = st.next_seq;
        st.timers
            .push(Reverse((Instant::now() + timeout, seq, key, gen)));
        Ok(self.guard(key, gen))
    }

    /// Subscribes to readiness changes on `fd`, level-triggered. `interest`
    /// is a bitmask of [`READABLE`] and [`WRITABLE`]; the handler receives
    /// the ready subset on each dispatch.
    ///
    /// The descriptor must stay open for the life of the registration.
    pub fn register_fd(
        self: &Rc<Self>,
        fd: RawFd,
        interest: u8,
        handler: impl Fn(u8) + 'static,
    ) -> Result<Registration, RegisterError> {
        let mut st = self.state.borrow_mut();
        let (key, gen) = st.alloc(EntryKind::Fd { fd }, Rc::new(handler))?;

        let ev = Event::new(key, interest & READABLE != 0, interest & WRITABLE != 0);
        // Safety: caller guarantees fd is valid and open for the registration
        // lifetime; drop of the guard removes it before close.
        let res = unsafe { self.shared.poller.add_with_mode(fd, ev, PollMode::Level) };
        if let Err(e) = res {
            st.slots[key] = None;
            st.free.push(key);
            return Err(e.into());
        }
        Ok(self.guard(key, gen))
    }

    /// Creates a user-space wakeup pair. The token may travel to any thread;
    /// the handler runs on this loop's thread whenever readiness is raised.
    pub fn make_set_readiness(
        self: &Rc<Self>,
        handler: impl Fn(u8) + 'static,
    ) -> Result<(SetReadiness, Registration), CapacityError> {
        let mut st = self.state.borrow_mut();
        let (key, gen) = st.alloc(EntryKind::Wake, Rc::new(handler))?;
        let token = SetReadiness {
            key,
            gen,
            shared: self.shared.clone(),
        };
        Ok((token, self.guard(key, gen)))
    }

    /// Requests return from [`exec`](Self::exec) with `code` once the events
    /// ready in the current iteration have been dispatched. Callable from any
    /// handler; also effective before `exec` starts.
    pub fn exit(&self, code: i32) {
        self.shared.exit_code.store(code, Ordering::Release);
        self.shared.exit_requested.store(true, Ordering::Release);
        let _ = self.shared.poller.notify();
    }

    /// Runs the loop until [`exit`](Self::exit) is called and returns the
    /// exit code. Re-entry is forbidden.
    pub fn exec(self: &Rc<Self>) -> i32 {
        assert!(!self.running.replace(true), "EventLoop::exec re-entered");

        loop {
            if self.shared.exit_requested.load(Ordering::Acquire) {
                break;
            }

            let timeout = self.next_timeout();
            {
                let mut events = self.events.borrow_mut();
                events.clear();
                match self.shared.poller.wait(&mut events, timeout) {
                    Ok(_) => {}
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        // The poller is unusable; surface loudly rather than
                        // spin. A dead reactor means the thread is done.
                        panic!("event loop poll failed: {}", e);
                    }
                }
            }

            for (key, gen, readiness) in self.collect_ready() {
                // Re-check liveness per dispatch: an earlier handler in this
                // batch may have dropped the registration.
                let handler = {
                    let st = self.state.borrow();
                    if st.live(key, gen) {
                        Some(st.slots[key].as_ref().unwrap().handler.clone())
                    } else {
                        None
                    }
                };
                if let Some(h) = handler {
                    h(readiness);
                }
            }
        }

        self.running.set(false);
        self.shared.exit_requested.store(false, Ordering::Release);
        self.shared.exit_code.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // internals
    // -------------------------------------------------------------------------

    fn guard(self: &Rc<Self>, key: usize, gen: u64) -> Registration {
        Registration {
            key,
            gen,
            owner: Rc::downgrade(self),
        }
    }

    /// Time until the earliest armed timer, discarding stale heap entries.
    /// `None` means block until an fd event or a notify.
    fn next_timeout(&self) -> Option<Duration> {
        let mut st = self.state.borrow_mut();
        loop {
            let &Reverse((deadline, _, key, gen)) = st.timers.peek()?;
            if !st.live(key, gen) {
                st.timers.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(Instant::now()));
        }
    }

    /// Drains remote wakes, fired timers, and fd events into a dispatch list,
    /// releasing all borrows before any handler runs.
    fn collect_ready(&self) -> Vec<(usize, u64, u8)> {
        let mut ready = Vec::new();
        let mut st = self.state.borrow_mut();

        while let Some(op) = self.shared.remote.pop() {
            let RemoteOp::Readiness { key, gen, readiness } = op;
            if st.live(key, gen) {
                ready.push((key, gen, readiness));
            }
        }

        let now = Instant::now();
        while let Some(&Reverse((deadline, seq, key, gen))) = st.timers.peek() {
            if deadline > now {
                break;
            }
            st.timers.pop();
            if !st.live(key, gen) {
                continue;
            }
            let period = match &st.slots[key] {
                Some(Entry {
                    kind: EntryKind::Timer { period },
                    ..
                }) => *period,
                _ => None,
            };
            if let Some(p) = period {
                st.timers.push(Reverse((now + p, seq, key, gen)));
            }
            ready.push((key, gen, 0));
        }

        for ev in self.events.borrow().iter() {
            let key = ev.key;
            let mut readiness = 0;
            if ev.readable {
                readiness |= READABLE;
            }
            if ev.writable {
                readiness |= WRITABLE;
            }
            if let Some(Some(e)) = st.slots.get(key) {
                if matches!(e.kind, EntryKind::Fd { .. }) {
                    ready.push((key, e.gen, readiness));
                }
            }
        }

        ready
    }

    fn deregister(&self, key: usize, gen: u64) {
        let mut st = self.state.borrow_mut();
        if !st.live(key, gen) {
            return;
        }
        let entry = st.slots[key].take().unwrap();
        st.free.push(key);
        if let EntryKind::Fd { fd } = entry.kind {
            // The fd may already be closed by the owner; that's fine.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            let _ = self.shared.poller.delete(borrowed);
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        CURRENT.with(|c| {
            let mut cur = c.borrow_mut();
            if std::ptr::eq(cur.as_ptr(), self) {
                *cur = Weak::new();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn exit_returns_code() {
        let l = EventLoop::new(4).unwrap();
        let l2 = l.clone();
        let _t = l
            .register_timer(Duration::from_millis(1), TimerKind::SingleShot, move || {
                l2.exit(7);
            })
            .unwrap();
        assert_eq!(l.exec(), 7);
    }

    #[test]
    fn capacity_exhaustion_fails_synchronously_and_frees_on_drop() {
        let l = EventLoop::new(8).unwrap();
        let mut regs = Vec::new();
        for _ in 0..8 {
            regs.push(
                l.register_timer(Duration::from_secs(60), TimerKind::SingleShot, || {})
                    .unwrap(),
            );
        }
        let err = l
            .register_timer(Duration::from_secs(60), TimerKind::SingleShot, || {})
            .unwrap_err();
        assert_eq!(err, CapacityError { capacity: 8 });
        assert_eq!(l.registrations(), 8);

        // Dropping any prior registration permits a new one.
        regs.pop();
        let _r = l
            .register_timer(Duration::from_secs(60), TimerKind::SingleShot, || {})
            .unwrap();
        assert_eq!(l.registrations(), 8);
    }

    #[test]
    fn timers_fire_in_deadline_order_ties_fifo() {
        let l = EventLoop::new(8).unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let _a = l
            .register_timer(Duration::from_millis(2), TimerKind::SingleShot, move || {
                o.borrow_mut().push("a");
            })
            .unwrap();
        let o = order.clone();
        let _b = l
            .register_timer(Duration::from_millis(2), TimerKind::SingleShot, move || {
                o.borrow_mut().push("b");
            })
            .unwrap();
        let o = order.clone();
        let l2 = l.clone();
        let _c = l
            .register_timer(Duration::from_millis(10), TimerKind::SingleShot, move || {
                o.borrow_mut().push("c");
                l2.exit(0);
            })
            .unwrap();

        l.exec();
        assert_eq!(*order.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn interval_timer_rearms_until_dropped() {
        let l = EventLoop::new(8).unwrap();
        let hits = Rc::new(Cell::new(0u32));

        let h = hits.clone();
        let l2 = l.clone();
        let _t = l
            .register_timer(Duration::from_millis(1), TimerKind::Interval, move || {
                h.set(h.get() + 1);
                if h.get() == 3 {
                    l2.exit(0);
                }
            })
            .unwrap();

        l.exec();
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn set_readiness_wakes_from_another_thread() {
        let l = EventLoop::new(4).unwrap();
        let (tx, rx) = mpsc::channel();

        let l2 = l.clone();
        let (token, _reg) = l
            .make_set_readiness(move |readiness| {
                tx.send(readiness).unwrap();
                l2.exit(0);
            })
            .unwrap();

        let t = thread::spawn(move || {
            token.set_readiness(READABLE).unwrap();
        });
        l.exec();
        t.join().unwrap();
        assert_eq!(rx.try_recv().unwrap(), READABLE);
    }

    #[test]
    fn fd_registration_reports_readable() {
        let l = EventLoop::new(4).unwrap();
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let got = Rc::new(Cell::new(0u8));
        let g = got.clone();
        let l2 = l.clone();
        let _reg = l
            .register_fd(b.as_raw_fd(), READABLE, move |readiness| {
                g.set(readiness);
                l2.exit(0);
            })
            .unwrap();

        a.write_all(b"x").unwrap();
        l.exec();
        assert_eq!(got.get() & READABLE, READABLE);
    }

    #[test]
    fn dropping_registration_inside_handler_suppresses_stale_dispatch() {
        // Two timers due in the same poll; the first handler drops the
        // second's registration, which must then not fire.
        let l = EventLoop::new(8).unwrap();
        let fired = Rc::new(Cell::new(false));

        let f = fired.clone();
        let victim = l
            .register_timer(Duration::from_millis(2), TimerKind::SingleShot, move || {
                f.set(true);
            })
            .unwrap();

        let slot: Rc<RefCell<Option<Registration>>> = Rc::new(RefCell::new(Some(victim)));
        let s = slot.clone();
        let _killer = l
            .register_timer(Duration::from_millis(1), TimerKind::SingleShot, move || {
                s.borrow_mut().take();
            })
            .unwrap();

        let l2 = l.clone();
        let _end = l
            .register_timer(Duration::from_millis(20), TimerKind::SingleShot, move || {
                l2.exit(0);
            })
            .unwrap();

        l.exec();
        assert!(!fired.get());
    }

    #[test]
    fn current_tracks_thread_loop() {
        assert!(EventLoop::current().is_none());
        let l = EventLoop::new(1).unwrap();
        assert!(Rc::ptr_eq(&EventLoop::current().unwrap(), &l));
        drop(l);
        assert!(EventLoop::current().is_none());
    }
}
