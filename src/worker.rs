//! Worker threads: one event loop plus one proxy engine each.
//!
//! The supervisor never touches an engine directly. Every control transition
//! (initial start, stop, routes-changed) is a deferred call posted onto the
//! worker's own loop, so all engine access happens in the worker's callback
//! frames. The only synchronization between supervisor and worker is the
//! start handshake (mutex + condvar) and the mutex guarding the worker link
//! the deferred calls go through.
//!
//! Worker lifecycle: spawn → handshake (engine started, or failed and the
//! thread is already joined) → running → stop posted → engine dropped, loop
//! exits, deferred-call manager cleaned up → joined on handle drop.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{debug, error};

use crate::domainmap::DomainView;
use crate::error::WorkerStartError;
use crate::runtime::defer::{self, DeferCall};
use crate::runtime::event_loop::EventLoop;

// Registration budget per worker. Enough timers for sessions and zroutes
// plus an extra 100 for misc, and enough socket notifiers for zroutes plus
// an extra 100 for misc.
pub const TIMERS_PER_SESSION: usize = 10;
pub const TIMERS_PER_ZROUTE: usize = 10;
pub const SOCKETNOTIFIERS_PER_ZROUTE: usize = 10;
pub const ZROUTES_MAX: usize = 100;

/// Loop capacity for a worker with the given per-worker session budget.
pub fn worker_registrations_max(sessions_max: usize) -> usize {
    let timers_max = (sessions_max * TIMERS_PER_SESSION) + (ZROUTES_MAX * TIMERS_PER_ZROUTE) + 100;
    let socket_notifiers_max = (SOCKETNOTIFIERS_PER_ZROUTE * ZROUTES_MAX) + 100;
    timers_max + socket_notifiers_max
}

// =============================================================================
// Engine contract
// =============================================================================

/// The proxy engine, as the core sees it. Constructed on the worker thread
/// via [`EngineFactory`], started there, and stopped by drop. All calls
/// arrive on the worker thread.
pub trait Engine: Send {
    /// Brings the engine up with the worker's configuration. Returning false
    /// fails the worker's start handshake.
    fn start(&mut self, config: &WorkerConfig) -> bool;

    /// The domain map changed; refresh any derived caches.
    fn routes_changed(&mut self);
}

/// Creates one engine per worker. Shared by the supervisor across workers.
pub trait EngineFactory: Send + Sync {
    fn create(&self, domains: DomainView) -> Box<dyn Engine>;
}

impl<F> EngineFactory for F
where
    F: Fn(DomainView) -> Box<dyn Engine> + Send + Sync,
{
    fn create(&self, domains: DomainView) -> Box<dyn Engine> {
        self(domains)
    }
}

// =============================================================================
// Worker configuration
// =============================================================================

/// Value record handed to each worker's engine.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// 0-based worker id.
    pub id: usize,
    pub client_id: String,
    /// This worker's share of the session budget.
    pub sessions_max: usize,
    pub ipc_file_mode: Option<u32>,
    pub debug: bool,
    pub quiet_check: bool,

    pub server_in_specs: Vec<String>,
    pub server_in_stream_specs: Vec<String>,
    pub server_out_specs: Vec<String>,
    pub client_out_specs: Vec<String>,
    pub client_out_stream_specs: Vec<String>,
    pub client_in_specs: Vec<String>,

    pub inspect_spec: Option<String>,
    pub accept_spec: Option<String>,
    pub retry_in_spec: Option<String>,
    pub ws_control_init_specs: Vec<String>,
    pub ws_control_stream_specs: Vec<String>,
    pub stats_spec: Option<String>,
    pub command_spec: Option<String>,
    pub intreq_in_specs: Vec<String>,
    pub intreq_in_stream_specs: Vec<String>,
    pub intreq_out_specs: Vec<String>,
}

fn suffix_spec(s: &str, id: usize) -> String {
    if s.starts_with("ipc:") {
        format!("{}-{}", s, id)
    } else {
        s.to_string()
    }
}

fn suffix_specs(l: &[String], id: usize) -> Vec<String> {
    if l.len() == 1 && l[0].starts_with("ipc:") {
        vec![format!("{}-{}", l[0], id)]
    } else {
        l.to_vec()
    }
}

impl WorkerConfig {
    /// Specializes this configuration for worker `id` out of `count`. With
    /// more than one worker, IPC-scheme specs are suffixed `-<id>` so each
    /// worker opens a disjoint namespace, and the client id is suffixed the
    /// same way.
    pub fn for_worker(&self, id: usize, count: usize) -> WorkerConfig {
        let mut c = self.clone();
        c.id = id;
        if count > 1 {
            c.client_id = format!("{}-{}", c.client_id, id);
            for spec in [
                &mut c.inspect_spec,
                &mut c.accept_spec,
                &mut c.retry_in_spec,
                &mut c.stats_spec,
                &mut c.command_spec,
            ]
            .into_iter()
            .flatten()
            {
                *spec = suffix_spec(spec, id);
            }
            for list in [
                &mut c.ws_control_init_specs,
                &mut c.ws_control_stream_specs,
                &mut c.intreq_in_specs,
                &mut c.intreq_in_stream_specs,
                &mut c.intreq_out_specs,
            ] {
                *list = suffix_specs(list, id);
            }
        }
        c
    }
}

// =============================================================================
// Worker thread
// =============================================================================

enum Startup {
    Pending,
    Ok,
    Failed,
}

/// Worker-thread-owned state reachable by the supervisor's control posts.
struct WorkerLink {
    defer: DeferCall,
    engine: Option<Box<dyn Engine>>,
}

struct Shared {
    state: Mutex<WorkerState>,
    cond: Condvar,
}

struct WorkerState {
    startup: Startup,
    link: Option<WorkerLink>,
}

/// If the worker thread unwinds before completing the handshake, fail it so
/// the supervisor does not wait forever.
struct StartupGuard(Arc<Shared>);

impl Drop for StartupGuard {
    fn drop(&mut self) {
        let mut st = self.0.state.lock().unwrap();
        if matches!(st.startup, Startup::Pending) {
            st.startup = Startup::Failed;
            st.link = None;
            self.0.cond.notify_one();
        }
    }
}

/// Owns a worker's OS thread. Drop stops the worker and joins it.
pub struct WorkerHandle {
    id: usize,
    shared: Arc<Shared>,
    thread: Option<thread::JoinHandle<()>>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle").field("id", &self.id).finish()
    }
}

impl WorkerHandle {
    /// Spawns the worker and blocks until its engine reports started or
    /// failed. On failure the thread has already been joined.
    pub fn spawn(
        config: WorkerConfig,
        domains: DomainView,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<WorkerHandle, WorkerStartError> {
        let id = config.id;
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkerState {
                startup: Startup::Pending,
                link: None,
            }),
            cond: Condvar::new(),
        });

        let thread = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("relayd-worker-{}", id))
                .spawn(move || run(shared, config, domains, factory))
                .map_err(|e| {
                    error!("failed to spawn worker {}: {}", id, e);
                    WorkerStartError { id }
                })?
        };

        let ok = {
            let mut st = shared.state.lock().unwrap();
            while matches!(st.startup, Startup::Pending) {
                st = shared.cond.wait(st).unwrap();
            }
            matches!(st.startup, Startup::Ok)
        };

        if !ok {
            let _ = thread.join();
            return Err(WorkerStartError { id });
        }

        Ok(WorkerHandle {
            id,
            shared,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Posts a deferred stop: the worker drops its engine (which stops it)
    /// and exits its loop. No-op if the worker is already stopping.
    pub fn stop(&self) {
        let st = self.shared.state.lock().unwrap();
        if let Some(link) = st.link.as_ref() {
            let shared = self.shared.clone();
            let id = self.id;
            link.defer.defer(move || {
                // NOTE: runs on the worker thread
                let mut st = shared.state.lock().unwrap();
                if let Some(mut link) = st.link.take() {
                    link.engine.take();
                }
                drop(st);
                debug!("worker {}: stopped", id);
                if let Some(l) = EventLoop::current() {
                    l.exit(0);
                }
            });
        }
    }

    /// Posts a deferred `routes_changed` to the engine.
    pub fn routes_changed(&self) {
        let st = self.shared.state.lock().unwrap();
        if let Some(link) = st.link.as_ref() {
            let shared = self.shared.clone();
            link.defer.defer(move || {
                // NOTE: runs on the worker thread
                let mut st = shared.state.lock().unwrap();
                if let Some(engine) = st.link.as_mut().and_then(|l| l.engine.as_mut()) {
                    engine.routes_changed();
                }
            });
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Worker thread body.
fn run(
    shared: Arc<Shared>,
    config: WorkerConfig,
    domains: DomainView,
    factory: Arc<dyn EngineFactory>,
) {
    let _guard = StartupGuard(shared.clone());
    let id = config.id;

    let l = match EventLoop::new(worker_registrations_max(config.sessions_max)) {
        Ok(l) => l,
        Err(e) => {
            error!("worker {}: failed to create event loop: {}", id, e);
            return;
        }
    };

    {
        let mut st = shared.state.lock().unwrap();
        st.link = Some(WorkerLink {
            defer: DeferCall::new(),
            engine: None,
        });

        let shared2 = shared.clone();
        st.link.as_ref().unwrap().defer.defer(move || {
            // NOTE: runs on the worker thread, inside the loop
            let mut engine = factory.create(domains);
            let ok = engine.start(&config);

            let mut st = shared2.state.lock().unwrap();
            if ok {
                debug!("worker {}: started", config.id);
                if let Some(link) = st.link.as_mut() {
                    link.engine = Some(engine);
                }
                st.startup = Startup::Ok;
                shared2.cond.notify_one();
            } else {
                st.link = None;
                st.startup = Startup::Failed;
                shared2.cond.notify_one();
                drop(st);
                if let Some(l) = EventLoop::current() {
                    l.exit(0);
                }
            }
        });
    }

    l.exec();

    // Deinit after all loop activity has completed.
    defer::cleanup();
}
