//! OS termination and reload signals, serialized onto an event loop.
//!
//! [`ProcessQuit`] wires SIGINT and SIGTERM to its `quit` signal (fired
//! exactly once) and SIGHUP to its `hup` signal (fired per delivery). The OS
//! handler side is `signal-hook`'s self-pipe: the handler performs only an
//! async-signal-safe write; the pipe's read end is a regular fd registration
//! on the owning loop, so dispatch happens in a normal callback frame on the
//! loop thread.
//!
//! [`cleanup`](ProcessQuit::cleanup) detaches the OS hooks so that a
//! subsequent signal terminates the process by default. This is the intended
//! "second ctrl-C exits hard" behavior.

use std::cell::Cell;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::low_level::pipe;
use signal_hook::SigId;

use super::event_loop::{EventLoop, Registration, READABLE};
use crate::signal::Signal;

/// A signal pipe pair: signal-hook writes to `write`, the loop polls `read`.
struct SignalPipe {
    read: UnixStream,
    // Kept open for the lifetime of the raw-fd signal registration.
    write: UnixStream,
}

impl SignalPipe {
    fn new() -> io::Result<SignalPipe> {
        let (read, write) = UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;
        Ok(SignalPipe { read, write })
    }
}

/// Drains a nonblocking self-pipe after a readable wake.
fn drain(stream: &UnixStream) {
    let mut stream = stream;
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

/// Process signal fan-out owned by the supervisor's loop.
pub struct ProcessQuit {
    /// Fired once, on the first SIGINT or SIGTERM.
    pub quit: Signal,
    /// Fired on every SIGHUP.
    pub hup: Signal,
    quit_pipe: SignalPipe,
    hup_pipe: SignalPipe,
    sig_ids: Vec<SigId>,
    quit_fired: Cell<bool>,
    _registrations: Vec<Registration>,
}

impl ProcessQuit {
    /// Installs the signal hooks and registers both pipes with `l`. The
    /// returned instance must stay alive for the hooks to be observed; drop
    /// detaches everything.
    pub fn new(l: &Rc<EventLoop>) -> io::Result<Rc<ProcessQuit>> {
        let quit_pipe = SignalPipe::new()?;
        let hup_pipe = SignalPipe::new()?;

        let sig_ids = vec![
            pipe::register_raw(SIGINT, quit_pipe.write.as_raw_fd())?,
            pipe::register_raw(SIGTERM, quit_pipe.write.as_raw_fd())?,
            pipe::register_raw(SIGHUP, hup_pipe.write.as_raw_fd())?,
        ];

        let pq = Rc::new_cyclic(|weak: &Weak<ProcessQuit>| {
            let this = weak.clone();
            let on_quit = move |_| {
                if let Some(pq) = this.upgrade() {
                    drain(&pq.quit_pipe.read);
                    if !pq.quit_fired.replace(true) {
                        pq.quit.emit();
                    }
                }
            };
            let this = weak.clone();
            let on_hup = move |_| {
                if let Some(pq) = this.upgrade() {
                    drain(&pq.hup_pipe.read);
                    pq.hup.emit();
                }
            };

            // The supervisor loop's budget reserves slots for these two; a
            // refusal here would be a construction-order bug.
            let registrations = vec![
                l.register_fd(quit_pipe.read.as_raw_fd(), READABLE, on_quit)
                    .expect("supervisor loop cannot register quit pipe"),
                l.register_fd(hup_pipe.read.as_raw_fd(), READABLE, on_hup)
                    .expect("supervisor loop cannot register hup pipe"),
            ];

            ProcessQuit {
                quit: Signal::new(),
                hup: Signal::new(),
                quit_pipe,
                hup_pipe,
                sig_ids,
                quit_fired: Cell::new(false),
                _registrations: registrations,
            }
        });
        Ok(pq)
    }

    /// Detaches the OS signal hooks. After this, the default dispositions
    /// apply: the next SIGINT/SIGTERM terminates the process.
    pub fn cleanup(&self) {
        for id in &self.sig_ids {
            signal_hook::low_level::unregister(*id);
        }
    }
}

impl Drop for ProcessQuit {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signal_hook::low_level::raise;
    use std::sync::Mutex;

    // Raised signals are process-wide; every test touching them serializes
    // through this.
    static SIGNAL_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn hup_fires_per_delivery_and_quit_fires_once() {
        let _guard = SIGNAL_LOCK.lock().unwrap();

        let l = EventLoop::new(8).unwrap();
        let pq = ProcessQuit::new(&l).unwrap();

        let hups = Rc::new(Cell::new(0u32));
        let quits = Rc::new(Cell::new(0u32));

        let h = hups.clone();
        let _hc = pq.hup.connect(move || h.set(h.get() + 1));
        let q = quits.clone();
        let l2 = l.clone();
        let _qc = pq.quit.connect(move || {
            q.set(q.get() + 1);
            l2.exit(0);
        });

        raise(SIGHUP).unwrap();
        // Two quit-class signals; the channel must fire once.
        raise(SIGINT).unwrap();
        raise(SIGINT).unwrap();

        assert_eq!(l.exec(), 0);
        assert_eq!(hups.get(), 1);
        assert_eq!(quits.get(), 1);
    }
}
