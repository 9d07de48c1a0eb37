//! Shared helpers for integration tests.

#![allow(dead_code)]

use arvak_qproc::{Precision, ProcessorConfig, QubitProcessor, QubitStates, Real};
use num_complex::Complex64;
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once; `RUST_LOG` controls the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// CPU backend with several workers and small chunks.
pub fn cpu(precision: Precision) -> ProcessorConfig {
    ProcessorConfig::cpu()
        .with_precision(precision)
        .with_workers(3)
        .with_max_po2_per_chunk(3)
}

/// Three devices, small chunks and tiny staging buffers so reads go through
/// many pipeline rounds.
pub fn devices(precision: Precision) -> ProcessorConfig {
    let mut config = ProcessorConfig::devices(3, 1 << 20)
        .with_precision(precision)
        .with_max_po2_per_chunk(3);
    config.transfer.max_context_bytes = 512;
    config
}

/// Both backends at `precision`.
pub fn backends(precision: Precision) -> Vec<ProcessorConfig> {
    vec![cpu(precision), devices(precision)]
}

/// Tolerance for comparisons at precision `R`.
pub fn eps<R: Real>() -> f64 {
    match R::PRECISION {
        Precision::F32 => 1e-5,
        Precision::F64 => 1e-10,
    }
}

/// Full state vector widened to f64.
pub fn amplitudes<R: Real>(
    proc: &mut QubitProcessor<R>,
    qs: &QubitStates<R>,
) -> Vec<Complex64> {
    proc.get_amplitudes(&[qs], 0, qs.n_states())
        .unwrap()
        .into_iter()
        .map(|a| Complex64::new(a.re.as_f64(), a.im.as_f64()))
        .collect()
}

/// Largest component-wise distance between two state vectors.
pub fn max_distance(a: &[Complex64], b: &[Complex64]) -> f64 {
    assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).norm())
        .fold(0.0, f64::max)
}
