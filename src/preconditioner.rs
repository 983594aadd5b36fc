//! Block preconditioner for the linearized coupled system.
//!
//! For `r = (r_v, r_X)`:
//!
//! 1. `v* = L̃⁻¹ r_v`
//! 2. `r̂ = r_X + Δt J v*_u` (fluid-only: `r̂ = Δt J v*_u`)
//! 3. `y = S_L⁻¹ r̂`
//! 4. `v = L̃⁻¹ (r_v + S K y)`, or `v = v* + L̃⁻¹ (S K y)` fluid-only
//! 5. optional sweeps `v ← v + L̃⁻¹ (r_v − (M v)_v)`
//!
//! The kernel-derivative terms of the Jacobian are left out, so this is an
//! approximate inverse even when both inner solves are exact.

use std::sync::Arc;

use crate::config::SolveMode;
use crate::operator::{check_dims, BlockOperator, OperatorCoefficients};
use crate::residual::{markers_from_slice, CompositeResidualEvaluator, Linearization};
use crate::schur::LagrangianSchurSolver;
use crate::stokes::FluidBlock;
use crate::types::IbError;

pub struct BlockPreconditioner<'a> {
    evaluator: &'a CompositeResidualEvaluator<'a>,
    lin: &'a Linearization,
    fluid: Arc<FluidBlock>,
    schur: LagrangianSchurSolver<'a>,
    sweeps: usize,
}

impl<'a> BlockPreconditioner<'a> {
    pub fn new(
        evaluator: &'a CompositeResidualEvaluator<'a>,
        lin: &'a Linearization,
        fluid: Arc<FluidBlock>,
        schur: LagrangianSchurSolver<'a>,
        sweeps: usize,
    ) -> Result<Self, IbError> {
        let map = evaluator.map();
        map.ensure_same(fluid.map(), "preconditioner fluid block")?;
        map.ensure_same(lin.state.map(), "preconditioner linearization")?;
        Ok(Self {
            evaluator,
            lin,
            fluid,
            schur,
            sweeps,
        })
    }

    fn num_markers(&self) -> usize {
        self.lin.coupling_positions.nrows()
    }

    /// Fluid rows of the approximate coupled operator:
    /// `L v − S K X` (positions) or `L v − Δt S K J v` (fluid-only).
    fn fluid_rows(&self, v: &[f64], x_block: &[f64], out: &mut [f64]) -> Result<(), IbError> {
        self.fluid.apply_forward(v, out)?;
        if self.num_markers() == 0 {
            return Ok(());
        }
        let n_vel = self.evaluator.map().num_velocity();
        let mut coupling = vec![0.0; n_vel];
        let dx = match self.evaluator.mode() {
            SolveMode::PositionAndFluid => markers_from_slice(x_block)?,
            SolveMode::FluidOnly => {
                self.evaluator.interpolate_direction(self.lin, v) * self.evaluator.dt()
            }
        };
        self.evaluator.spread_stiffness(self.lin, &dx, &mut coupling);
        for (o, c) in out[..n_vel].iter_mut().zip(&coupling) {
            *o -= c;
        }
        Ok(())
    }
}

impl BlockOperator for BlockPreconditioner<'_> {
    fn dim(&self) -> usize {
        self.evaluator.map().len()
    }

    /// The coupled operator without kernel-derivative terms.
    fn apply_forward(&self, x: &[f64], y: &mut [f64]) -> Result<(), IbError> {
        check_dims("block forward", self.dim(), x, y)?;
        let nf = self.evaluator.map().num_fluid();
        let (x_v, x_x) = x.split_at(nf);
        let (y_v, y_x) = y.split_at_mut(nf);
        self.fluid_rows(x_v, x_x, y_v)?;
        if !y_x.is_empty() {
            let dt = self.evaluator.dt();
            let w = self.evaluator.interpolate_direction(self.lin, x_v);
            for (k, o) in y_x.chunks_exact_mut(2).enumerate() {
                o[0] = x_x[2 * k] - dt * w[[k, 0]];
                o[1] = x_x[2 * k + 1] - dt * w[[k, 1]];
            }
        }
        Ok(())
    }

    fn apply_inverse_approx(&self, r: &[f64], z: &mut [f64]) -> Result<(), IbError> {
        check_dims("block inverse", self.dim(), r, z)?;
        let map = self.evaluator.map();
        let nf = map.num_fluid();
        let n_vel = map.num_velocity();
        let dt = self.evaluator.dt();
        let mode = self.evaluator.mode();
        let (r_v, r_x) = r.split_at(nf);
        let (z_v, z_x) = z.split_at_mut(nf);

        // 1. fluid solve ignoring the structure
        let mut v_star = vec![0.0; nf];
        self.fluid.apply_inverse_approx(r_v, &mut v_star)?;

        let n_l = 2 * self.num_markers();
        let mut y = vec![0.0; n_l];
        if n_l > 0 {
            // 2-3. Schur correction
            let w = self.evaluator.interpolate_direction(self.lin, &v_star);
            let mut r_hat = vec![0.0; n_l];
            for k in 0..self.num_markers() {
                for d in 0..2 {
                    let base = match mode {
                        SolveMode::PositionAndFluid => r_x[2 * k + d],
                        SolveMode::FluidOnly => 0.0,
                    };
                    r_hat[2 * k + d] = base + dt * w[[k, d]];
                }
            }
            self.schur.apply_inverse_approx(&r_hat, &mut y)?;

            // 4. fluid correction
            let dy = markers_from_slice(&y)?;
            let mut rhs = vec![0.0; nf];
            self.evaluator.spread_stiffness(self.lin, &dy, &mut rhs[..n_vel]);
            match mode {
                SolveMode::PositionAndFluid => {
                    for (a, b) in rhs.iter_mut().zip(r_v) {
                        *a += b;
                    }
                    self.fluid.apply_inverse_approx(&rhs, z_v)?;
                }
                SolveMode::FluidOnly => {
                    self.fluid.apply_inverse_approx(&rhs, z_v)?;
                    for (a, b) in z_v.iter_mut().zip(&v_star) {
                        *a += b;
                    }
                }
            }
        } else {
            z_v.copy_from_slice(&v_star);
        }
        z_x.copy_from_slice(&y[..z_x.len()]);

        // 5. extra fluid sweeps against the coupled fluid rows
        let mut mv = vec![0.0; nf];
        let mut corr = vec![0.0; nf];
        for _ in 0..self.sweeps {
            self.fluid_rows(z_v, &y, &mut mv)?;
            for (m, rv) in mv.iter_mut().zip(r_v) {
                *m = rv - *m;
            }
            self.fluid.apply_inverse_approx(&mv, &mut corr)?;
            for (a, c) in z_v.iter_mut().zip(&corr) {
                *a += c;
            }
        }
        Ok(())
    }

    fn set_coefficients(&mut self, coeffs: OperatorCoefficients) -> Result<(), IbError> {
        if coeffs == self.fluid.coefficients() {
            return Ok(());
        }
        self.fluid = Arc::new(self.fluid.rebuilt(coeffs)?);
        self.schur.rebind(Arc::clone(&self.fluid))
    }
}
