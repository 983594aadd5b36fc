//! Residual of the coupled implicit step.
//!
//! ```text
//! R_u = ρ/Δt (u − uⁿ) − μ Δ_h u + G p − f_body(t_new) − S(X_s) F(X_f)
//! R_p = −D u
//! R_X = X − Xⁿ − Δt J(X) u                      (positions as unknowns)
//! ```
//!
//! With positions as unknowns `X_s = X_f = X`. In the fluid-only
//! formulation `X_s = Xⁿ` and `X_f = Xⁿ + Δt J(Xⁿ) u`.

use std::cell::RefCell;
use std::sync::Arc;

use ndarray::Array2;

use crate::boundary::{BodyForce, BoundaryConditionProvider};
use crate::comm::Communicator;
use crate::config::{FluidParameters, SolveMode};
use crate::dof::{CompositeVector, DofIndexMap};
use crate::fields::{fill_u_ghosts, fill_v_ghosts, EulerianState, GhostFill};
use crate::interaction::InterpolationSpreadOperator;
use crate::structure::StructureModel;
use crate::types::{Axis, IbError};

/// Everything held fixed while one step is solved.
pub struct StepContext<'a> {
    pub map: Arc<DofIndexMap>,
    pub comm: &'a dyn Communicator,
    pub boundary: &'a dyn BoundaryConditionProvider,
    pub body_force: Option<&'a dyn BodyForce>,
    pub structure: &'a dyn StructureModel,
    pub interaction: &'a dyn InterpolationSpreadOperator,
    pub fluid: FluidParameters,
    pub new_time: f64,
    pub dt: f64,
    /// Fluid state at the start of the step.
    pub previous: &'a EulerianState,
    /// Marker positions at the start of the step.
    pub previous_positions: &'a Array2<f64>,
}

/// Cached data of one linearization point `x̄`. Never mutated once built.
#[derive(Debug, Clone)]
pub struct Linearization {
    pub state: CompositeVector,
    pub residual: CompositeVector,
    /// Ghost-filled velocity of `x̄`.
    pub u: Array2<f64>,
    pub v: Array2<f64>,
    /// Where spreading and interpolation act (`X̄`, or `Xⁿ` fluid-only).
    pub coupling_positions: Array2<f64>,
    /// Where forces are evaluated (`X̄`, or `X_f(ū)` fluid-only).
    pub force_positions: Array2<f64>,
    pub forces: Array2<f64>,
}

pub(crate) fn markers_from_slice(s: &[f64]) -> Result<Array2<f64>, IbError> {
    Array2::from_shape_vec((s.len() / 2, 2), s.to_vec())
        .map_err(|e| IbError::LayoutMismatch(format!("marker block: {e}")))
}

/// Evaluates `R(x)` for trial composite states.
pub struct CompositeResidualEvaluator<'a> {
    ctx: StepContext<'a>,
    /// `f_body(t_new)` on the velocity unknowns.
    body: Vec<f64>,
    trial: RefCell<EulerianState>,
    direction: RefCell<EulerianState>,
}

impl<'a> CompositeResidualEvaluator<'a> {
    pub fn new(ctx: StepContext<'a>) -> Result<Self, IbError> {
        let grid = ctx.map.grid().clone();
        ctx.previous.check_layout(&grid)?;
        if ctx.previous_positions.nrows() != ctx.map.num_markers() {
            return Err(IbError::LayoutMismatch(format!(
                "DOF map has {} markers, previous state has {}",
                ctx.map.num_markers(),
                ctx.previous_positions.nrows()
            )));
        }
        if !(ctx.dt.is_finite() && ctx.dt > 0.0) {
            return Err(IbError::ConfigurationError(format!(
                "residual needs a positive time step, got {}",
                ctx.dt
            )));
        }

        let mut body = vec![0.0; ctx.map.num_velocity()];
        if let Some(f) = ctx.body_force {
            for j in 0..grid.ny {
                for i in 1..grid.nx {
                    if let Some(idx) = ctx.map.u_index(i, j) {
                        let [x, y] = grid.u_position(i as isize, j as isize);
                        body[idx] = f.force(Axis::X, x, y, ctx.new_time);
                    }
                }
            }
            for j in 1..grid.ny {
                for i in 0..grid.nx {
                    if let Some(idx) = ctx.map.v_index(i, j) {
                        let [x, y] = grid.v_position(i as isize, j as isize);
                        body[idx] = f.force(Axis::Y, x, y, ctx.new_time);
                    }
                }
            }
        }

        Ok(Self {
            body,
            trial: RefCell::new(EulerianState::zeros(&grid)),
            direction: RefCell::new(EulerianState::zeros(&grid)),
            ctx,
        })
    }

    pub fn map(&self) -> &Arc<DofIndexMap> {
        &self.ctx.map
    }

    pub fn context(&self) -> &StepContext<'a> {
        &self.ctx
    }

    pub fn mode(&self) -> SolveMode {
        self.ctx.map.mode()
    }

    pub fn dt(&self) -> f64 {
        self.ctx.dt
    }

    /// Scatter the fluid unknowns of `x` into `state` and fill its velocity
    /// ghosts with boundary data at `t_new`.
    fn load_trial(&self, x: &[f64], state: &mut EulerianState) -> Result<(), IbError> {
        self.ctx.map.scatter_fluid(x, state)?;
        let grid = &self.ctx.map.grid().clone();
        let fill = GhostFill::Boundary { t: self.ctx.new_time };
        fill_u_ghosts(grid, self.ctx.boundary, fill, &mut state.u);
        fill_v_ghosts(grid, self.ctx.boundary, fill, &mut state.v);
        Ok(())
    }

    /// Marker positions implied by `x`: the marker block itself, or
    /// `Xⁿ + Δt J(Xⁿ) u` in the fluid-only formulation.
    fn positions_of(&self, x: &[f64], state: &EulerianState) -> Result<Array2<f64>, IbError> {
        match self.mode() {
            SolveMode::PositionAndFluid => markers_from_slice(&x[self.ctx.map.structure_range()]),
            SolveMode::FluidOnly => {
                let xn = self.ctx.previous_positions;
                let vel = self
                    .ctx
                    .interaction
                    .interpolate(self.ctx.map.grid(), &state.u, &state.v, xn);
                Ok(xn + &(vel * self.ctx.dt))
            }
        }
    }

    /// Positions to commit once `x` is accepted.
    pub fn committed_positions(&self, x: &CompositeVector) -> Result<Array2<f64>, IbError> {
        x.map().ensure_same(&self.ctx.map, "committed state")?;
        let mut state = self.trial.borrow_mut();
        self.load_trial(x.as_slice(), &mut state)?;
        self.positions_of(x.as_slice(), &state)
    }

    /// `out = R(x)`.
    pub fn evaluate(&self, x: &CompositeVector, out: &mut CompositeVector) -> Result<(), IbError> {
        x.map().ensure_same(&self.ctx.map, "trial state")?;
        out.map().ensure_same(&self.ctx.map, "residual vector")?;
        if !x.all_finite(self.ctx.comm) {
            return Err(IbError::NumericalInstability("trial state"));
        }

        let mut state = self.trial.borrow_mut();
        self.load_trial(x.as_slice(), &mut state)?;
        let r = out.as_mut_slice();
        r.iter_mut().for_each(|v| *v = 0.0);
        self.fluid_residual(&state, r);

        let positions = self.positions_of(x.as_slice(), &state)?;
        if positions.nrows() > 0 {
            let coupling = match self.mode() {
                SolveMode::PositionAndFluid => &positions,
                SolveMode::FluidOnly => self.ctx.previous_positions,
            };
            let forces = self.ctx.structure.force(&positions);
            let mut spread = vec![0.0; self.ctx.map.num_velocity()];
            self.ctx
                .interaction
                .spread(&self.ctx.map, &forces, coupling, &mut spread);
            for (ri, si) in r.iter_mut().zip(&spread) {
                *ri -= si;
            }

            if self.mode() == SolveMode::PositionAndFluid {
                let vel = self.ctx.interaction.interpolate(
                    self.ctx.map.grid(),
                    &state.u,
                    &state.v,
                    &positions,
                );
                let s = self.ctx.map.structure_range().start;
                let xn = self.ctx.previous_positions;
                for k in 0..positions.nrows() {
                    for d in 0..2 {
                        r[s + 2 * k + d] =
                            positions[[k, d]] - xn[[k, d]] - self.ctx.dt * vel[[k, d]];
                    }
                }
            }
        }

        if !out.all_finite(self.ctx.comm) {
            return Err(IbError::NumericalInstability("residual"));
        }
        Ok(())
    }

    /// Momentum and mass rows, matrix-free on the ghost-filled trial state.
    fn fluid_residual(&self, state: &EulerianState, r: &mut [f64]) {
        let map = &self.ctx.map;
        let grid = map.grid();
        let g = grid.ghost_width;
        let (nx, ny) = (grid.nx, grid.ny);
        let rho_dt = self.ctx.fluid.density / self.ctx.dt;
        let mu = self.ctx.fluid.viscosity;
        let (idx2, idy2) = (1.0 / (grid.dx * grid.dx), 1.0 / (grid.dy * grid.dy));
        let (u, v, p) = (&state.u, &state.v, &state.p);
        let (un, vn) = (&self.ctx.previous.u, &self.ctx.previous.v);

        for j in 0..ny {
            for i in 1..nx {
                let Some(idx) = map.u_index(i, j) else { continue };
                let (a, b) = (i + g, j + g);
                let c = u[[a, b]];
                let lap = (u[[a + 1, b]] - 2.0 * c + u[[a - 1, b]]) * idx2
                    + (u[[a, b + 1]] - 2.0 * c + u[[a, b - 1]]) * idy2;
                let grad = (p[[a, b]] - p[[a - 1, b]]) / grid.dx;
                r[idx] = rho_dt * (c - un[[a, b]]) - mu * lap + grad - self.body[idx];
            }
        }
        for j in 1..ny {
            for i in 0..nx {
                let Some(idx) = map.v_index(i, j) else { continue };
                let (a, b) = (i + g, j + g);
                let c = v[[a, b]];
                let lap = (v[[a + 1, b]] - 2.0 * c + v[[a - 1, b]]) * idx2
                    + (v[[a, b + 1]] - 2.0 * c + v[[a, b - 1]]) * idy2;
                let grad = (p[[a, b]] - p[[a, b - 1]]) / grid.dy;
                r[idx] = rho_dt * (c - vn[[a, b]]) - mu * lap + grad - self.body[idx];
            }
        }
        for j in 0..ny {
            for i in 0..nx {
                let Some(idx) = map.p_index(i, j) else { continue };
                let (a, b) = (i + g, j + g);
                let div = (u[[a + 1, b]] - u[[a, b]]) / grid.dx
                    + (v[[a, b + 1]] - v[[a, b]]) / grid.dy;
                r[idx] = -div;
            }
        }
    }

    /// Cache everything the Jacobian and preconditioner need at `x̄`.
    pub fn linearize(
        &self,
        x: &CompositeVector,
        residual: &CompositeVector,
    ) -> Result<Linearization, IbError> {
        x.map().ensure_same(&self.ctx.map, "linearization point")?;
        residual.map().ensure_same(&self.ctx.map, "linearization residual")?;
        let mut state = self.trial.borrow_mut();
        self.load_trial(x.as_slice(), &mut state)?;
        let force_positions = self.positions_of(x.as_slice(), &state)?;
        let coupling_positions = match self.mode() {
            SolveMode::PositionAndFluid => force_positions.clone(),
            SolveMode::FluidOnly => self.ctx.previous_positions.clone(),
        };
        let forces = self.ctx.structure.force(&force_positions);
        Ok(Linearization {
            state: x.clone(),
            residual: residual.clone(),
            u: state.u.clone(),
            v: state.v.clone(),
            coupling_positions,
            force_positions,
            forces,
        })
    }

    // ─────────────────────────────────────────────────────────
    //  Linearized coupling pieces
    // ─────────────────────────────────────────────────────────

    /// `J(X̄) δu` for a direction given as a fluid-layout slice. Ghosts are
    /// filled homogeneously, which is exact because the fill is affine.
    pub fn interpolate_direction(&self, lin: &Linearization, fluid: &[f64]) -> Array2<f64> {
        let map = &self.ctx.map;
        let grid = map.grid();
        let mut dir = self.direction.borrow_mut();
        dir.u.fill(0.0);
        dir.v.fill(0.0);
        map.scatter_fluid_arrays(fluid, &mut dir.u, Axis::X);
        map.scatter_fluid_arrays(fluid, &mut dir.v, Axis::Y);
        fill_u_ghosts(grid, self.ctx.boundary, GhostFill::Homogeneous, &mut dir.u);
        fill_v_ghosts(grid, self.ctx.boundary, GhostFill::Homogeneous, &mut dir.v);
        self.ctx
            .interaction
            .interpolate(grid, &dir.u, &dir.v, &lin.coupling_positions)
    }

    /// `out += S(X̄) K δX` on the velocity rows.
    pub fn spread_stiffness(&self, lin: &Linearization, dx: &Array2<f64>, out: &mut [f64]) {
        if dx.nrows() == 0 {
            return;
        }
        let df = self.ctx.structure.apply_stiffness(&lin.force_positions, dx);
        self.ctx
            .interaction
            .spread(&self.ctx.map, &df, &lin.coupling_positions, out);
    }

    /// `out += ∂S/∂X[δX] F(X̄)` (positions as unknowns only).
    pub fn spread_motion(&self, lin: &Linearization, dx: &Array2<f64>, out: &mut [f64]) {
        self.ctx.interaction.spread_derivative(
            &self.ctx.map,
            &lin.forces,
            &lin.coupling_positions,
            dx,
            out,
        );
    }

    /// `∂J/∂X[δX] ū` (positions as unknowns only).
    pub fn interpolate_motion(&self, lin: &Linearization, dx: &Array2<f64>) -> Array2<f64> {
        self.ctx.interaction.interpolate_derivative(
            self.ctx.map.grid(),
            &lin.u,
            &lin.v,
            &lin.coupling_positions,
            dx,
        )
    }
}
