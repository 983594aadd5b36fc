//! Reduced structure-only system of the block preconditioner.
//!
//! `S_L y = y − Δt · J(X̄) · [L̃⁻¹ (S(X̄) K y, 0)]_u`
//!
//! `S_L` is rebuilt for each linearization point.

use std::sync::Arc;

use log::{debug, warn};
use ndarray::Array2;

use crate::config::{SchurSolverKind, SolverConfig};
use crate::krylov::{fgmres, KrylovSettings};
use crate::operator::{check_dims, BlockOperator, OperatorCoefficients};
use crate::residual::{markers_from_slice, CompositeResidualEvaluator, Linearization};
use crate::stokes::FluidBlock;
use crate::types::{DenseLu, IbError};

/// Matrix-free action of `S_L`.
pub struct SchurOperator<'a> {
    evaluator: &'a CompositeResidualEvaluator<'a>,
    lin: &'a Linearization,
    fluid: Arc<FluidBlock>,
    dt: f64,
}

impl<'a> SchurOperator<'a> {
    pub fn new(
        evaluator: &'a CompositeResidualEvaluator<'a>,
        lin: &'a Linearization,
        fluid: Arc<FluidBlock>,
    ) -> Result<Self, IbError> {
        evaluator.map().ensure_same(fluid.map(), "Schur fluid block")?;
        let dt = fluid.coefficients().dt;
        Ok(Self { evaluator, lin, fluid, dt })
    }

    /// Number of Lagrangian unknowns, `2 × markers`.
    pub fn dim(&self) -> usize {
        2 * self.lin.coupling_positions.nrows()
    }

    pub fn apply(&self, y: &[f64], out: &mut [f64]) -> Result<(), IbError> {
        check_dims("Schur forward", self.dim(), y, out)?;
        if y.is_empty() {
            return Ok(());
        }
        let map = self.evaluator.map();
        let nf = map.num_fluid();
        let dy = markers_from_slice(y)?;
        let mut rhs = vec![0.0; nf];
        self.evaluator.spread_stiffness(self.lin, &dy, &mut rhs);
        let mut sol = vec![0.0; nf];
        self.fluid.apply_inverse_approx(&rhs, &mut sol)?;
        let w = self.evaluator.interpolate_direction(self.lin, &sol);
        for (k, o) in out.chunks_exact_mut(2).enumerate() {
            o[0] = y[2 * k] - self.dt * w[[k, 0]];
            o[1] = y[2 * k + 1] - self.dt * w[[k, 1]];
        }
        Ok(())
    }

    /// Column-by-column assembly, `dim()` fluid solves.
    pub fn assemble(&self) -> Result<Array2<f64>, IbError> {
        let n = self.dim();
        let mut s = Array2::zeros((n, n));
        let mut e = vec![0.0; n];
        let mut col = vec![0.0; n];
        for c in 0..n {
            e[c] = 1.0;
            self.apply(&e, &mut col)?;
            e[c] = 0.0;
            for r in 0..n {
                s[[r, c]] = col[r];
            }
        }
        Ok(s)
    }
}

enum Strategy {
    Identity,
    Dense(DenseLu),
    Krylov(KrylovSettings),
}

/// Solves `S_L y = r` for the Lagrangian block.
pub struct LagrangianSchurSolver<'a> {
    op: SchurOperator<'a>,
    kind: SchurSolverKind,
    dense_threshold: usize,
    krylov: KrylovSettings,
    strategy: Strategy,
}

impl<'a> LagrangianSchurSolver<'a> {
    pub fn new(op: SchurOperator<'a>, config: &SolverConfig) -> Result<Self, IbError> {
        let krylov = KrylovSettings {
            restart: config.schur_max_iterations,
            max_iterations: config.schur_max_iterations,
            rtol: config.schur_rtol,
            atol: 0.0,
        };
        let mut solver = Self {
            op,
            kind: config.schur_solver,
            dense_threshold: config.schur_dense_threshold,
            krylov,
            strategy: Strategy::Identity,
        };
        solver.strategy = solver.build_strategy()?;
        Ok(solver)
    }

    fn build_strategy(&self) -> Result<Strategy, IbError> {
        let n = self.op.dim();
        if n == 0 {
            return Ok(Strategy::Identity);
        }
        let dense = match self.kind {
            SchurSolverKind::Dense => true,
            SchurSolverKind::Krylov => false,
            SchurSolverKind::Auto => n <= self.dense_threshold,
        };
        if dense {
            let s = self.op.assemble()?;
            debug!("schur: dense {n}x{n}");
            Ok(Strategy::Dense(DenseLu::factor(&s)?))
        } else {
            debug!("schur: krylov on {n} unknowns");
            Ok(Strategy::Krylov(self.krylov))
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self.strategy, Strategy::Identity)
    }

    /// Swap in a rebuilt fluid block and refresh the strategy.
    pub fn rebind(&mut self, fluid: Arc<FluidBlock>) -> Result<(), IbError> {
        self.op.evaluator.map().ensure_same(fluid.map(), "Schur fluid block")?;
        self.op.dt = fluid.coefficients().dt;
        self.op.fluid = fluid;
        self.strategy = self.build_strategy()?;
        Ok(())
    }
}

impl BlockOperator for LagrangianSchurSolver<'_> {
    fn dim(&self) -> usize {
        self.op.dim()
    }

    fn apply_forward(&self, x: &[f64], y: &mut [f64]) -> Result<(), IbError> {
        self.op.apply(x, y)
    }

    fn apply_inverse_approx(&self, r: &[f64], y: &mut [f64]) -> Result<(), IbError> {
        check_dims("Schur inverse", self.dim(), r, y)?;
        match &self.strategy {
            Strategy::Identity => {
                y.copy_from_slice(r);
                Ok(())
            }
            Strategy::Dense(lu) => {
                y.copy_from_slice(&lu.solve(r));
                Ok(())
            }
            Strategy::Krylov(settings) => {
                // The marker block is replicated on every worker.
                let dot = |a: &[f64], b: &[f64]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f64>();
                y.iter_mut().for_each(|v| *v = 0.0);
                let outcome = fgmres(
                    |x, out| self.op.apply(x, out),
                    |x, out| {
                        out.copy_from_slice(x);
                        Ok(())
                    },
                    dot,
                    r,
                    y,
                    settings,
                )?;
                if !outcome.converged() {
                    warn!(
                        "schur krylov stopped after {} iterations ({:?}), residual {:.3e}",
                        outcome.iterations, outcome.status, outcome.residual
                    );
                }
                Ok(())
            }
        }
    }

    fn set_coefficients(&mut self, coeffs: OperatorCoefficients) -> Result<(), IbError> {
        if coeffs == self.op.fluid.coefficients() {
            return Ok(());
        }
        let fluid = Arc::new(self.op.fluid.rebuilt(coeffs)?);
        self.rebind(fluid)
    }
}
