//! Core runtime substrate for the relayd realtime proxy.
//!
//! This crate is the part of the proxy that is about threads, loops, and
//! control flow rather than HTTP: a supervisor owning the domain map and the
//! OS-signal fan-out, a pool of worker threads each owning one bounded event
//! loop and one proxy engine, and the cross-thread deferred-call scheduler
//! that carries every control transition between them.
//!
//! The proxy engine itself is a collaborator, not a resident: implement
//! [`worker::Engine`] and [`worker::EngineFactory`] and hand the factory to
//! [`app::run`] from your binary's `main`.
//!
//! ```no_run
//! use std::sync::Arc;
//! use relayd_core::domainmap::DomainView;
//! use relayd_core::worker::{Engine, EngineFactory, WorkerConfig};
//!
//! struct MyEngine;
//!
//! impl Engine for MyEngine {
//!     fn start(&mut self, _config: &WorkerConfig) -> bool {
//!         true
//!     }
//!     fn routes_changed(&mut self) {}
//! }
//!
//! fn main() {
//!     let factory = Arc::new(|_domains: DomainView| {
//!         Box::new(MyEngine) as Box<dyn Engine>
//!     });
//!     std::process::exit(relayd_core::app::run(std::env::args(), factory));
//! }
//! ```

pub mod app;
pub mod domainmap;
pub mod error;
pub mod logger;
pub mod runtime;
pub mod settings;
pub mod signal;
pub mod worker;

pub use domainmap::{DomainMap, DomainView};
pub use error::{CapacityError, RegisterError, SetupError, WorkerStartError};
pub use runtime::{delete_later, DeferCall, EventLoop, ProcessQuit, Timer};
pub use settings::Settings;
pub use worker::{Engine, EngineFactory, WorkerConfig, WorkerHandle};
