//! Error types for the qproc crate.

use thiserror::Error;

use crate::config::ConfigError;

/// Faults surfaced by the state-vector engine.
///
/// Every variant is fatal for the call that produced it: a half-applied gate is
/// not rolled back and the affected states are left in an unspecified state.
/// Contract violations (bad lane index, zero probability, ...) are not errors;
/// they panic at the call site.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QprocError {
    /// No compute unit has room for another chunk.
    #[error("out of device memory: cannot place a chunk of {requested} bytes")]
    OutOfDeviceMemory {
        /// Size of the chunk that could not be placed.
        requested: usize,
    },

    /// A device's temporary host memory store is exhausted.
    #[error("host memory store of device {device} exhausted: requested {requested} bytes, {remaining} remaining")]
    HostMemoryExhausted {
        /// Device owning the store.
        device: usize,
        /// Requested size in bytes.
        requested: usize,
        /// Bytes still available.
        remaining: usize,
    },

    /// A job failed while running on a device worker.
    #[error("device {device} fault: {message}")]
    DeviceFault {
        /// Device the job ran on.
        device: usize,
        /// Panic payload or failure description.
        message: String,
    },

    /// The worker thread for a device is gone.
    #[error("worker for device {0} terminated")]
    WorkerTerminated(usize),

    /// Thread pool construction failed.
    #[error("thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    /// The processor was used before `initialize`.
    #[error("qubit processor is not initialized")]
    NotInitialized,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for engine operations.
pub type QprocResult<T> = Result<T, QprocError>;
