//! `arvak-qproc` — chunked multi-worker state-vector engine.
//!
//! Holds the amplitudes of an `n`-lane quantum register in power-of-two
//! chunks and applies one- and multi-controlled single-lane gates,
//! probability queries, measurement collapse and tensor products by
//! splitting the index space across workers:
//!
//! - **CPU backend**: chunks live in host memory and every call runs on a
//!   `rayon` pool before it returns.
//! - **Device backend**: chunks are spread round-robin over device memory
//!   units, each served by its own worker thread with an in-order job queue.
//!   Calls return once their jobs are queued; results are read back through
//!   a double-buffered transfer pipeline.
//!
//! Lanes are little-endian: lane `k` is bit `k` of a state index.
//!
//! # Quick start
//!
//! ```rust
//! use arvak_qproc::{Matrix2x2, ProcessorConfig, QubitProcessor};
//!
//! let mut proc = QubitProcessor::<f64>::with_config(ProcessorConfig::cpu()).unwrap();
//! let mut qs = proc.initialize_qubit_states(2).unwrap();
//!
//! // Bell pair: H on lane 0, then X on lane 1 controlled by lane 0.
//! proc.apply_gate(&Matrix2x2::hadamard(), &mut qs, 0).unwrap();
//! proc.apply_controlled_gate(&Matrix2x2::pauli_x(), &mut qs, &[0], 1).unwrap();
//!
//! let p1 = proc.calc_probability(&qs, 1).unwrap();
//! assert!((p1 - 0.5).abs() < 1e-12);
//! ```
//!
//! # Errors
//!
//! Memory exhaustion and device faults surface as [`QprocError`]. Contract
//! violations such as an out-of-range lane or a zero observation probability
//! panic.

pub mod bitperm;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod kernel;
pub mod matrix;
pub mod pool;
pub mod precision;
pub mod processor;
pub mod registry;
pub mod state;
pub mod transfer;

pub use config::{BackendKind, ConfigError, DeviceConfig, ProcessorConfig, TransferConfig};
pub use error::{QprocError, QprocResult};
pub use matrix::Matrix2x2;
pub use precision::{Precision, Real};
pub use processor::{ProcessorState, QubitProcessor, States, StatesKind};
pub use registry::{Simulator, StatesHandle};
pub use state::QubitStates;
