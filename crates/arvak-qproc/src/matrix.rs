//! 2x2 complex matrices applied by the gate kernels.

use num_complex::{Complex, Complex64};

use crate::precision::Real;

/// A single-qubit operator in row-major order: `[[a, b], [c, d]]`.
///
/// Matrices are supplied per gate call and never retained by the engine.
/// Unitarity is the caller's responsibility.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Matrix2x2 {
    /// Elements in row-major order.
    pub data: [Complex64; 4],
}

impl Matrix2x2 {
    /// Create a matrix from its rows.
    pub fn new(rows: [[Complex64; 2]; 2]) -> Self {
        Self {
            data: [rows[0][0], rows[0][1], rows[1][0], rows[1][1]],
        }
    }

    /// Create a matrix with real entries.
    pub fn from_real(rows: [[f64; 2]; 2]) -> Self {
        Self::new([
            [Complex64::new(rows[0][0], 0.0), Complex64::new(rows[0][1], 0.0)],
            [Complex64::new(rows[1][0], 0.0), Complex64::new(rows[1][1], 0.0)],
        ])
    }

    /// Identity.
    pub fn identity() -> Self {
        Self::from_real([[1.0, 0.0], [0.0, 1.0]])
    }

    /// Hadamard.
    pub fn hadamard() -> Self {
        let s = std::f64::consts::FRAC_1_SQRT_2;
        Self::from_real([[s, s], [s, -s]])
    }

    /// Pauli-X.
    pub fn pauli_x() -> Self {
        Self::from_real([[0.0, 1.0], [1.0, 0.0]])
    }

    /// Pauli-Y.
    pub fn pauli_y() -> Self {
        let zero = Complex64::new(0.0, 0.0);
        Self::new([
            [zero, Complex64::new(0.0, -1.0)],
            [Complex64::new(0.0, 1.0), zero],
        ])
    }

    /// Pauli-Z.
    pub fn pauli_z() -> Self {
        Self::from_real([[1.0, 0.0], [0.0, -1.0]])
    }

    /// Phase gate `diag(1, e^{iθ})`.
    pub fn phase(theta: f64) -> Self {
        let zero = Complex64::new(0.0, 0.0);
        Self::new([
            [Complex64::new(1.0, 0.0), zero],
            [zero, Complex64::from_polar(1.0, theta)],
        ])
    }

    /// Rotation about X.
    pub fn rx(theta: f64) -> Self {
        let c = Complex64::new((theta / 2.0).cos(), 0.0);
        let s = Complex64::new(0.0, -(theta / 2.0).sin());
        Self::new([[c, s], [s, c]])
    }

    /// Rotation about Y.
    pub fn ry(theta: f64) -> Self {
        let c = (theta / 2.0).cos();
        let s = (theta / 2.0).sin();
        Self::from_real([[c, -s], [s, c]])
    }

    /// Conjugate transpose.
    pub fn adjoint(&self) -> Self {
        let [a, b, c, d] = self.data;
        Self {
            data: [a.conj(), c.conj(), b.conj(), d.conj()],
        }
    }

    /// Convert into kernel precision.
    pub fn cast<R: Real>(&self) -> [Complex<R>; 4] {
        self.data
            .map(|z| Complex::new(R::from_f64(z.re), R::from_f64(z.im)))
    }
}

impl Default for Matrix2x2 {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for Matrix2x2 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self::Output {
        let [a, b, c, d] = self.data;
        let [e, f, g, h] = rhs.data;
        Self {
            data: [a * e + b * g, a * f + b * h, c * e + d * g, c * f + d * h],
        }
    }
}
