//! Error types used by the runtime substrate and the supervisor.
//!
//! Two layers of failure exist here: registration-time refusals from the
//! bounded event loop (capacity, OS errors), and setup-time failures in the
//! supervisor path (configuration, worker start). Everything else surfaces
//! through the broadcast channels of the component that owns the failing
//! resource.

use std::io;

use thiserror::Error;

/// The event loop refused a registration because the table declared at
/// construction is full.
///
/// This is reported synchronously to the caller; the loop itself keeps
/// running and the table is left untouched. After startup this is an
/// unrecoverable budget violation and the owning worker treats it as fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event loop registration budget exhausted (capacity {capacity})")]
pub struct CapacityError {
    /// The declared registration capacity of the refusing loop.
    pub capacity: usize,
}

/// Failure to register a file descriptor with the event loop.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum RegisterError {
    /// The registration table is full.
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    /// The OS reactor rejected the descriptor.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A worker thread failed its start handshake: the engine reported an error
/// before reporting started. The thread has already been joined when this is
/// returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("worker {id} failed to start")]
pub struct WorkerStartError {
    /// 0-based id of the worker that failed.
    pub id: usize,
}

/// Failures on the supervisor's startup path. Any of these exits the process
/// with code 1 before (or while) workers spawn.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SetupError {
    /// Missing or malformed config file, or missing required spec groups.
    #[error("configuration error: {0}")]
    Config(String),
    /// A worker failed its start handshake.
    #[error(transparent)]
    WorkerStart(#[from] WorkerStartError),
    /// An OS-level failure while wiring the control plane.
    #[error(transparent)]
    Io(#[from] io::Error),
}
