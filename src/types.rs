//! Shared types: the error taxonomy, small enums used across modules, and
//! the factorization wrappers (sparse LDLᵀ and dense LU).

use ndarray::Array2;
use sprs::{CsMatView, FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};
use thiserror::Error;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Unified error type for all fallible operations in the crate.
///
/// Every public entry point returns `Result<T, IbError>`. Failure decisions
/// inside a solve are reached collectively, so all workers observe the same
/// variant.
#[derive(Debug, Error)]
pub enum IbError {
    /// Invalid tolerance, iteration bound or strategy supplied at setup.
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The Krylov solve of a Newton step did not reach its tolerance,
    /// even after one restart.
    #[error("linear solve failed after {iterations} iterations (residual {residual:.3e}, target {target:.3e})")]
    LinearSolveFailure {
        iterations: usize,
        residual: f64,
        target: f64,
    },

    /// Residual growth exceeded the safeguard ratio and step damping ran out.
    #[error("nonlinear divergence at iteration {iteration}: residual {residual:.3e} > {ratio} x {previous:.3e}")]
    NonlinearDivergence {
        iteration: usize,
        residual: f64,
        previous: f64,
        ratio: f64,
    },

    /// A non-finite value appeared in a residual or state.
    #[error("numerical instability: non-finite value in {0}")]
    NumericalInstability(&'static str),

    /// The nonlinear iteration budget was exhausted.
    #[error("maximum nonlinear iterations ({iterations}) reached, residual {residual:.3e}")]
    MaxIterationsReached { iterations: usize, residual: f64 },

    /// Composite vector or DOF map inconsistency.
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),

    /// Field storage does not match the grid it is used with.
    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    /// `new_time < current_time`, or non-finite times.
    #[error("invalid time interval [{current}, {new}]")]
    InvalidTimeInterval { current: f64, new: f64 },

    /// Sparse factorization failure (singular pivot etc.).
    #[error("linear algebra error: {0}")]
    Linalg(#[from] sprs::errors::LinalgError),

    /// Snapshot (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IbError {
    /// Short stable name, used in log lines and reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigurationError(_) => "ConfigurationError",
            Self::LinearSolveFailure { .. } => "LinearSolveFailure",
            Self::NonlinearDivergence { .. } => "NonlinearDivergence",
            Self::NumericalInstability(_) => "NumericalInstability",
            Self::MaxIterationsReached { .. } => "MaxIterationsReached",
            Self::LayoutMismatch(_) => "LayoutMismatch",
            Self::GridMismatch(_) => "GridMismatch",
            Self::InvalidTimeInterval { .. } => "InvalidTimeInterval",
            Self::Linalg(_) => "Linalg",
            Self::Serialization(_) => "Serialization",
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Small shared enums
// ─────────────────────────────────────────────────────────────

/// Velocity component / coordinate direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub fn index(self) -> usize {
        match self {
            Self::X => 0,
            Self::Y => 1,
        }
    }
}

/// The four walls of the rectangular domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WallSide {
    Left,
    Right,
    Bottom,
    Top,
}

impl WallSide {
    pub const ALL: [WallSide; 4] = [Self::Left, Self::Right, Self::Bottom, Self::Top];
}

// ─────────────────────────────────────────────────────────────
//  Sparse LDLᵀ
// ─────────────────────────────────────────────────────────────

/// Numeric LDLᵀ factorization of a symmetric sparse matrix.
///
/// `Definite` validates D > 0 (SPD input such as a coarse AMG level).
/// `QuasiDefinite` accepts mixed-sign D, which is what the regularized
/// saddle-point matrix `[A G; Gᵀ −δI]` produces.
pub enum Factorization {
    Definite(LdlNumeric<f64, usize>),
    QuasiDefinite(LdlNumeric<f64, usize>),
}

impl std::fmt::Debug for Factorization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Definite(_) => write!(f, "Factorization::Definite(...)"),
            Self::QuasiDefinite(_) => write!(f, "Factorization::QuasiDefinite(...)"),
        }
    }
}

impl Factorization {
    fn symbolic_numeric(
        a: CsMatView<f64>,
    ) -> Result<LdlNumeric<f64, usize>, sprs::errors::LinalgError> {
        Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(a)
    }

    /// Factor an SPD matrix, rejecting any non-positive pivot.
    pub fn definite(a: CsMatView<f64>) -> Result<Self, sprs::errors::LinalgError> {
        let ldl = Self::symbolic_numeric(a)?;
        for (i, &di) in ldl.d().iter().enumerate() {
            if di <= 0.0 {
                return Err(sprs::errors::LinalgError::SingularMatrix(
                    sprs::errors::SingularMatrixInfo {
                        index: i,
                        reason: "D <= 0 in definite factorization (not SPD)",
                    },
                ));
            }
        }
        Ok(Self::Definite(ldl))
    }

    /// Factor a symmetric quasi-definite matrix.
    pub fn quasi_definite(a: CsMatView<f64>) -> Result<Self, sprs::errors::LinalgError> {
        let ldl = Self::symbolic_numeric(a)?;
        if let Some(i) = ldl.d().iter().position(|d| !d.is_finite() || *d == 0.0) {
            return Err(sprs::errors::LinalgError::SingularMatrix(
                sprs::errors::SingularMatrixInfo {
                    index: i,
                    reason: "zero or non-finite pivot in quasi-definite factorization",
                },
            ));
        }
        Ok(Self::QuasiDefinite(ldl))
    }

    /// Solve A x = rhs using the stored factorization.
    pub fn solve(&self, rhs: &[f64]) -> Vec<f64> {
        match self {
            Self::Definite(ldl) | Self::QuasiDefinite(ldl) => ldl.solve(rhs),
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            Self::Definite(ldl) | Self::QuasiDefinite(ldl) => ldl.d().len(),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Dense LU (partial pivoting)
// ─────────────────────────────────────────────────────────────

/// Dense LU factorization with partial pivoting, kept so that repeated
/// solves against the same small matrix (the assembled Schur complement)
/// cost O(n²) each.
#[derive(Debug, Clone)]
pub struct DenseLu {
    lu: Array2<f64>,
    perm: Vec<usize>,
}

impl DenseLu {
    pub fn factor(a: &Array2<f64>) -> Result<Self, IbError> {
        let n = a.nrows();
        if a.ncols() != n {
            return Err(IbError::LayoutMismatch(format!(
                "dense LU needs a square matrix, got {}x{}",
                n,
                a.ncols()
            )));
        }
        let mut m = a.clone();
        let mut perm: Vec<usize> = (0..n).collect();
        let scale = m.iter().fold(0.0_f64, |acc, v| acc.max(v.abs())).max(1.0);

        for col in 0..n {
            let mut max_row = col;
            let mut max_val = m[[col, col]].abs();
            for row in (col + 1)..n {
                let v = m[[row, col]].abs();
                if v > max_val {
                    max_val = v;
                    max_row = row;
                }
            }
            if !max_val.is_finite() || max_val <= 1e-14 * scale {
                return Err(IbError::Linalg(sprs::errors::LinalgError::SingularMatrix(
                    sprs::errors::SingularMatrixInfo {
                        index: col,
                        reason: "zero pivot in dense LU",
                    },
                )));
            }
            if max_row != col {
                for j in 0..n {
                    m.swap([col, j], [max_row, j]);
                }
                perm.swap(col, max_row);
            }
            let pivot = m[[col, col]];
            for row in (col + 1)..n {
                let factor = m[[row, col]] / pivot;
                m[[row, col]] = factor;
                for j in (col + 1)..n {
                    m[[row, j]] -= factor * m[[col, j]];
                }
            }
        }
        Ok(Self { lu: m, perm })
    }

    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.perm.len();
        let mut x: Vec<f64> = self.perm.iter().map(|&p| b[p]).collect();
        for i in 0..n {
            let mut s = x[i];
            for j in 0..i {
                s -= self.lu[[i, j]] * x[j];
            }
            x[i] = s;
        }
        for i in (0..n).rev() {
            let mut s = x[i];
            for j in (i + 1)..n {
                s -= self.lu[[i, j]] * x[j];
            }
            x[i] = s / self.lu[[i, i]];
        }
        x
    }
}
