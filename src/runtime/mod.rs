//! The per-thread runtime substrate: event loop, deferred calls, timers, and
//! process signal fan-out.
//!
//! Everything here follows one scheduling model: single-threaded cooperative
//! reactors, one per thread. A callback runs to completion before the next
//! event dispatches; the only operation a foreign thread may perform against
//! a loop is raising readiness on a [`SetReadiness`] token (which is also how
//! [`defer`] delivers cross-thread calls).

pub mod defer;
pub mod event_loop;
pub mod process_quit;
pub mod timer;

pub use defer::{delete_later, DeferCall};
pub use event_loop::{EventLoop, Registration, SetReadiness, TimerKind, READABLE, WRITABLE};
pub use process_quit::ProcessQuit;
pub use timer::Timer;
