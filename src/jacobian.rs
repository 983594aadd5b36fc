//! Matrix-free directional derivative of the composite residual.

use std::cell::RefCell;

use log::trace;

use crate::comm;
use crate::config::{JacobianMode, SolveMode};
use crate::dof::CompositeVector;
use crate::operator::BlockOperator;
use crate::residual::{markers_from_slice, CompositeResidualEvaluator, Linearization};
use crate::stokes::FluidBlock;
use crate::types::IbError;

/// `J(x̄)·v` at a fixed linearization point.
///
/// The analytic path composes the assembled Stokes block with the coupling
/// terms, including the kernel-derivative terms of spreading and
/// interpolation when positions are unknowns. The finite-difference path
/// differences the residual itself.
pub struct JacobianAction<'a> {
    evaluator: &'a CompositeResidualEvaluator<'a>,
    fluid: &'a FluidBlock,
    lin: &'a Linearization,
    mode: JacobianMode,
    scratch: RefCell<(CompositeVector, CompositeVector)>,
}

impl<'a> JacobianAction<'a> {
    pub fn new(
        evaluator: &'a CompositeResidualEvaluator<'a>,
        fluid: &'a FluidBlock,
        lin: &'a Linearization,
        mode: JacobianMode,
    ) -> Result<Self, IbError> {
        let map = evaluator.map();
        map.ensure_same(fluid.map(), "fluid block")?;
        map.ensure_same(lin.state.map(), "linearization")?;
        Ok(Self {
            evaluator,
            fluid,
            lin,
            mode,
            scratch: RefCell::new((
                CompositeVector::zeros(map),
                CompositeVector::zeros(map),
            )),
        })
    }

    pub fn dim(&self) -> usize {
        self.evaluator.map().len()
    }

    /// `out = J v`. Both slices use the composite layout.
    pub fn apply(&self, v: &[f64], out: &mut [f64]) -> Result<(), IbError> {
        let n = self.dim();
        if v.len() != n || out.len() != n {
            return Err(IbError::LayoutMismatch(format!(
                "Jacobian of dimension {n} applied to lengths {} -> {}",
                v.len(),
                out.len()
            )));
        }
        match self.mode {
            JacobianMode::Analytic => self.apply_analytic(v, out),
            JacobianMode::FiniteDifference { step } => self.apply_fd(step, v, out),
        }
    }

    fn apply_analytic(&self, v: &[f64], out: &mut [f64]) -> Result<(), IbError> {
        let map = self.evaluator.map();
        let nf = map.num_fluid();
        let n_vel = map.num_velocity();
        let dt = self.evaluator.dt();
        let (v_fluid, v_x) = v.split_at(nf);
        let (out_fluid, out_x) = out.split_at_mut(nf);
        self.fluid.apply_forward(v_fluid, out_fluid)?;

        if map.num_markers() == 0 {
            return Ok(());
        }
        let mut coupling = vec![0.0; n_vel];
        match map.mode() {
            SolveMode::PositionAndFluid => {
                let dx = markers_from_slice(v_x)?;
                self.evaluator.spread_stiffness(self.lin, &dx, &mut coupling);
                self.evaluator.spread_motion(self.lin, &dx, &mut coupling);

                let du = self.evaluator.interpolate_direction(self.lin, v_fluid);
                let dmove = self.evaluator.interpolate_motion(self.lin, &dx);
                for k in 0..dx.nrows() {
                    for d in 0..2 {
                        out_x[2 * k + d] = dx[[k, d]] - dt * (du[[k, d]] + dmove[[k, d]]);
                    }
                }
            }
            SolveMode::FluidOnly => {
                let dx = self.evaluator.interpolate_direction(self.lin, v_fluid) * dt;
                self.evaluator.spread_stiffness(self.lin, &dx, &mut coupling);
            }
        }
        for (o, c) in out_fluid[..n_vel].iter_mut().zip(&coupling) {
            *o -= c;
        }
        Ok(())
    }

    fn apply_fd(&self, step: f64, v: &[f64], out: &mut [f64]) -> Result<(), IbError> {
        let comm = self.evaluator.context().comm;
        let owned = self.evaluator.map().owned_range();
        let v_norm = comm::norm(comm, &owned, v);
        if v_norm == 0.0 {
            out.iter_mut().for_each(|o| *o = 0.0);
            return Ok(());
        }
        let x_norm = self.lin.state.norm(comm);
        let h = step * (1.0 + x_norm) / v_norm;
        trace!("fd jacobian step h={h:.3e}");

        let mut scratch = self.scratch.borrow_mut();
        let (xp, rp) = &mut *scratch;
        for ((p, x), d) in xp
            .as_mut_slice()
            .iter_mut()
            .zip(self.lin.state.as_slice())
            .zip(v)
        {
            *p = x + h * d;
        }
        self.evaluator.evaluate(xp, rp)?;
        for ((o, a), b) in out
            .iter_mut()
            .zip(rp.as_slice())
            .zip(self.lin.residual.as_slice())
        {
            *o = (a - b) / h;
        }
        Ok(())
    }
}
