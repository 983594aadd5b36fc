//! The `BlockOperator` seam shared by the fluid block, the Schur operator
//! and the block preconditioner, plus sparse kernels used by all of them.

use rayon::prelude::*;
use sprs::CsMat;

use crate::types::IbError;

/// Time-step dependent constants of the linearized fluid operator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatorCoefficients {
    pub dt: f64,
    pub density: f64,
    pub viscosity: f64,
}

impl OperatorCoefficients {
    /// `ρ / Δt`, the mass term of the backward-Euler momentum operator.
    pub fn reaction(&self) -> f64 {
        self.density / self.dt
    }

    pub fn validate(&self) -> Result<(), IbError> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(IbError::ConfigurationError(format!(
                "operator time step must be positive, got {}",
                self.dt
            )));
        }
        if !(self.density > 0.0 && self.viscosity >= 0.0) {
            return Err(IbError::ConfigurationError(format!(
                "invalid fluid coefficients rho={} mu={}",
                self.density, self.viscosity
            )));
        }
        Ok(())
    }
}

/// A square linear operator with an approximate inverse.
///
/// `apply_forward` computes `y = A x`; `apply_inverse_approx` computes
/// `y ≈ A⁻¹ x` with whatever strategy the implementor was built with.
/// Both overwrite `y`.
pub trait BlockOperator {
    fn dim(&self) -> usize;
    fn apply_forward(&self, x: &[f64], y: &mut [f64]) -> Result<(), IbError>;
    fn apply_inverse_approx(&self, x: &[f64], y: &mut [f64]) -> Result<(), IbError>;
    fn set_coefficients(&mut self, coeffs: OperatorCoefficients) -> Result<(), IbError>;
}

pub(crate) fn check_dims(op: &str, n: usize, x: &[f64], y: &[f64]) -> Result<(), IbError> {
    if x.len() != n || y.len() != n {
        return Err(IbError::LayoutMismatch(format!(
            "{op}: operator of dimension {n} applied to lengths {} -> {}",
            x.len(),
            y.len()
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────
//  Sparse kernels (CSR)
// ─────────────────────────────────────────────────────────────

/// y = A x for CSR `a`, rows in parallel.
pub fn spmv(a: &CsMat<f64>, x: &[f64], y: &mut [f64]) {
    debug_assert!(a.is_csr());
    let indptr = a.indptr();
    let ip = indptr.raw_storage();
    let (indices, data) = (a.indices(), a.data());
    y.par_iter_mut().enumerate().for_each(|(row, yi)| {
        let mut s = 0.0;
        for nz in ip[row]..ip[row + 1] {
            s += data[nz] * x[indices[nz]];
        }
        *yi = s;
    });
}

/// y += alpha · A x for CSR `a`.
pub fn spmv_add(a: &CsMat<f64>, alpha: f64, x: &[f64], y: &mut [f64]) {
    debug_assert!(a.is_csr());
    let indptr = a.indptr();
    let ip = indptr.raw_storage();
    let (indices, data) = (a.indices(), a.data());
    y.par_iter_mut().enumerate().for_each(|(row, yi)| {
        let mut s = 0.0;
        for nz in ip[row]..ip[row + 1] {
            s += data[nz] * x[indices[nz]];
        }
        *yi += alpha * s;
    });
}

/// Diagonal of a CSR matrix (zero where absent).
pub fn diagonal(a: &CsMat<f64>) -> Vec<f64> {
    let indptr = a.indptr();
    let ip = indptr.raw_storage();
    (0..a.rows())
        .map(|row| {
            (ip[row]..ip[row + 1])
                .find(|&nz| a.indices()[nz] == row)
                .map_or(0.0, |nz| a.data()[nz])
        })
        .collect()
}
