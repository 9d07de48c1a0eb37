//! Numeric precision of state-vector components.

use num_traits::Float;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Width of the real and imaginary parts of each amplitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// 32-bit float components.
    F32,
    /// 64-bit float components.
    #[default]
    F64,
}

impl Precision {
    /// Bytes taken by one complex amplitude.
    pub const fn complex_size(self) -> usize {
        match self {
            Precision::F32 => 8,
            Precision::F64 => 16,
        }
    }
}

/// Real scalar type the engine is instantiated for.
///
/// All kernels are written once against this trait and instantiated for
/// `f32` and `f64`.
pub trait Real: Float + Send + Sync + Debug + Default + 'static {
    /// Precision tag for this type.
    const PRECISION: Precision;

    /// Convert from `f64`, rounding if needed.
    fn from_f64(value: f64) -> Self;

    /// Widen to `f64`.
    fn as_f64(self) -> f64;
}

impl Real for f32 {
    const PRECISION: Precision = Precision::F32;

    #[allow(clippy::cast_possible_truncation)]
    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn as_f64(self) -> f64 {
        f64::from(self)
    }
}

impl Real for f64 {
    const PRECISION: Precision = Precision::F64;

    fn from_f64(value: f64) -> Self {
        value
    }

    fn as_f64(self) -> f64 {
        self
    }
}
