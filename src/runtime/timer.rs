//! Timers bound to the creating thread's event loop.
//!
//! A [`Timer`] wraps one loop timer registration and re-broadcasts fires on
//! its [`timeout`](Timer::timeout) signal. Starting consumes one slot of the
//! loop's registration budget; stopping (or dropping the timer) releases it.
//! There is no separate timer pool: the bound is the loop capacity declared
//! at construction.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::event_loop::{EventLoop, Registration, TimerKind};
use crate::error::CapacityError;
use crate::signal::Signal;

/// A single-shot or repeating timer. Belongs to the thread that created it.
pub struct Timer {
    owner: Weak<EventLoop>,
    interval: Cell<Duration>,
    single_shot: Cell<bool>,
    registration: RefCell<Option<Registration>>,
    /// Fires on the loop thread each time the timer expires.
    pub timeout: Signal,
}

impl Timer {
    /// Creates an inactive timer bound to the calling thread's loop.
    ///
    /// # Panics
    ///
    /// Panics if the thread has no current [`EventLoop`].
    pub fn new() -> Rc<Timer> {
        let owner = EventLoop::current().expect("Timer requires an event loop on the current thread");
        Rc::new(Timer {
            owner: Rc::downgrade(&owner),
            interval: Cell::new(Duration::ZERO),
            single_shot: Cell::new(false),
            registration: RefCell::new(None),
            timeout: Signal::new(),
        })
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval.set(interval);
    }

    pub fn set_single_shot(&self, single_shot: bool) {
        self.single_shot.set(single_shot);
    }

    pub fn is_active(&self) -> bool {
        self.registration.borrow().is_some()
    }

    /// Arms the timer with the configured interval. Restarting an active
    /// timer re-arms it from now.
    pub fn start(self: &Rc<Self>) -> Result<(), CapacityError> {
        self.stop();

        let l = self
            .owner
            .upgrade()
            .expect("Timer started after its event loop was dropped");
        let kind = if self.single_shot.get() {
            TimerKind::SingleShot
        } else {
            TimerKind::Interval
        };

        let this = Rc::downgrade(self);
        let registration = l.register_timer(self.interval.get(), kind, move || {
            if let Some(t) = this.upgrade() {
                t.fired();
            }
        })?;
        *self.registration.borrow_mut() = Some(registration);
        Ok(())
    }

    /// Disarms the timer and releases its loop registration.
    pub fn stop(&self) {
        self.registration.borrow_mut().take();
    }

    fn fired(&self) {
        if self.single_shot.get() {
            // Release the slot before user code runs, so a handler may
            // restart the timer (or start another) without tripping the
            // budget.
            self.registration.borrow_mut().take();
        }
        self.timeout.emit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shot_fires_once_and_releases_slot() {
        let l = EventLoop::new(4).unwrap();
        let t = Timer::new();
        t.set_single_shot(true);
        t.set_interval(Duration::from_millis(1));

        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let _conn = t.timeout.connect(move || h.set(h.get() + 1));

        t.start().unwrap();
        assert!(t.is_active());

        let l2 = l.clone();
        let _end = l
            .register_timer(Duration::from_millis(20), TimerKind::SingleShot, move || {
                l2.exit(0);
            })
            .unwrap();

        l.exec();
        assert_eq!(hits.get(), 1);
        assert!(!t.is_active());
        drop(_end);
        assert_eq!(l.registrations(), 0);
    }

    #[test]
    fn interval_fires_until_stopped() {
        let l = EventLoop::new(4).unwrap();
        let t = Timer::new();
        t.set_interval(Duration::from_millis(1));

        let hits = Rc::new(Cell::new(0u32));
        let h = hits.clone();
        let t2 = t.clone();
        let l2 = l.clone();
        let _conn = t.timeout.connect(move || {
            h.set(h.get() + 1);
            if h.get() == 3 {
                t2.stop();
                l2.exit(0);
            }
        });

        t.start().unwrap();
        l.exec();
        assert_eq!(hits.get(), 3);
        assert!(!t.is_active());
    }

    #[test]
    fn stop_before_fire_suppresses_timeout() {
        let l = EventLoop::new(4).unwrap();
        let t = Timer::new();
        t.set_single_shot(true);
        t.set_interval(Duration::from_millis(5));

        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let _conn = t.timeout.connect(move || f.set(true));
        t.start().unwrap();
        t.stop();

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
    fn start_surfaces_capacity_error() {
        let _l = EventLoop::new(0).unwrap();
        let t = Timer::new();
        t.set_interval(Duration::from_millis(1));
        assert_eq!(t.start().unwrap_err(), CapacityError { capacity: 0 });
    }
}
