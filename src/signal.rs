//! Single-threaded broadcast channels.
//!
//! [`Signal`] is the notification primitive the control plane is wired with:
//! the domain map's `changed`, process quit/hup, and timer `timeout` are all
//! signals. A signal belongs to the thread that created it; connections are
//! scoped and disconnect when the [`Connection`] guard is dropped.
//!
//! Emission snapshots the subscriber list first, so a callback may connect or
//! disconnect (including its own connection) without invalidating the
//! in-progress emit. Connections made during an emit are observed from the
//! next emit on.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

type Slot = (u64, Rc<dyn Fn()>);

#[derive(Default)]
struct Slots {
    next_id: u64,
    subscribers: Vec<Slot>,
}

/// A broadcast channel carrying no payload, bound to its creating thread.
#[derive(Default)]
pub struct Signal {
    shared: Rc<RefCell<Slots>>,
}

/// Scoped subscription to a [`Signal`]. Dropping it disconnects.
pub struct Connection {
    shared: Weak<RefCell<Slots>>,
    id: u64,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `f` to this signal. The returned guard keeps the
    /// subscription alive.
    pub fn connect(&self, f: impl Fn() + 'static) -> Connection {
        let mut slots = self.shared.borrow_mut();
        let id = slots.next_id;
        slots.next_id += 1;
        slots.subscribers.push((id, Rc::new(f)));
        Connection {
            shared: Rc::downgrade(&self.shared),
            id,
        }
    }

    /// Invokes every connected subscriber, in connection order.
    pub fn emit(&self) {
        let snapshot: Vec<Rc<dyn Fn()>> = self
            .shared
            .borrow()
            .subscribers
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for f in snapshot {
            f();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.borrow().subscribers.len()
    }
}

impl Connection {
    /// Explicit disconnect; equivalent to dropping the guard.
    pub fn disconnect(self) {}
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared
                .borrow_mut()
                .subscribers
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn emit_reaches_all_subscribers_in_order() {
        let sig = Signal::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = order.clone();
        let _a = sig.connect(move || o.borrow_mut().push("a"));
        let o = order.clone();
        let _b = sig.connect(move || o.borrow_mut().push("b"));

        sig.emit();
        assert_eq!(*order.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn dropping_connection_disconnects() {
        let sig = Signal::new();
        let hits = Rc::new(Cell::new(0));

        let h = hits.clone();
        let conn = sig.connect(move || h.set(h.get() + 1));
        sig.emit();
        drop(conn);
        sig.emit();

        assert_eq!(hits.get(), 1);
        assert_eq!(sig.subscriber_count(), 0);
    }

    #[test]
    fn disconnect_during_emit_is_safe() {
        let sig = Signal::new();
        let conn: Rc<RefCell<Option<Connection>>> = Rc::new(RefCell::new(None));
        let hits = Rc::new(Cell::new(0));

        let c = conn.clone();
        let h = hits.clone();
        *conn.borrow_mut() = Some(sig.connect(move || {
            h.set(h.get() + 1);
            // Drop our own connection mid-emit.
            c.borrow_mut().take();
        }));

        sig.emit();
        sig.emit();
        assert_eq!(hits.get(), 1);
    }
}
