//! Eulerian velocity/pressure storage on the MAC grid and ghost filling.

use ndarray::Array2;

use crate::boundary::{BoundaryConditionProvider, TangentialCondition};
use crate::grid::CartesianGrid;
use crate::types::{Axis, IbError, WallSide};

/// Read/write access to face velocities and cell pressures, each stored
/// with `grid().ghost_width` ghost layers.
pub trait VelocityPressureFieldAccessor {
    fn grid(&self) -> &CartesianGrid;
    fn velocity(&self, axis: Axis) -> &Array2<f64>;
    fn velocity_mut(&mut self, axis: Axis) -> &mut Array2<f64>;
    fn pressure(&self) -> &Array2<f64>;
    fn pressure_mut(&mut self) -> &mut Array2<f64>;
}

/// Fluid state of one time level.
#[derive(Debug, Clone, PartialEq)]
pub struct EulerianState {
    pub grid: CartesianGrid,
    pub u: Array2<f64>,
    pub v: Array2<f64>,
    pub p: Array2<f64>,
}

impl EulerianState {
    pub fn zeros(grid: &CartesianGrid) -> Self {
        Self {
            grid: grid.clone(),
            u: Array2::zeros(grid.u_shape()),
            v: Array2::zeros(grid.v_shape()),
            p: Array2::zeros(grid.p_shape()),
        }
    }

    /// Sample `fu`, `fv`, `fp` at every non-ghost location.
    pub fn from_fn<FU, FV, FP>(grid: &CartesianGrid, fu: FU, fv: FV, fp: FP) -> Self
    where
        FU: Fn(f64, f64) -> f64,
        FV: Fn(f64, f64) -> f64,
        FP: Fn(f64, f64) -> f64,
    {
        let mut s = Self::zeros(grid);
        let g = grid.ghost_width;
        for j in 0..grid.ny {
            for i in 0..=grid.nx {
                let [x, y] = grid.u_position(i as isize, j as isize);
                s.u[[i + g, j + g]] = fu(x, y);
            }
        }
        for j in 0..=grid.ny {
            for i in 0..grid.nx {
                let [x, y] = grid.v_position(i as isize, j as isize);
                s.v[[i + g, j + g]] = fv(x, y);
            }
        }
        for j in 0..grid.ny {
            for i in 0..grid.nx {
                let [x, y] = grid.cell_center(i as isize, j as isize);
                s.p[[i + g, j + g]] = fp(x, y);
            }
        }
        s
    }

    /// Fail with `GridMismatch` unless the arrays fit `grid`.
    pub fn check_layout(&self, grid: &CartesianGrid) -> Result<(), IbError> {
        if !self.grid.same_topology(grid) || self.grid.ghost_width != grid.ghost_width {
            return Err(IbError::GridMismatch(format!(
                "state grid {}x{} does not match provider grid {}x{}",
                self.grid.nx, self.grid.ny, grid.nx, grid.ny
            )));
        }
        let shapes = [
            ("u", self.u.dim(), grid.u_shape()),
            ("v", self.v.dim(), grid.v_shape()),
            ("p", self.p.dim(), grid.p_shape()),
        ];
        for (name, got, want) in shapes {
            if got != want {
                return Err(IbError::GridMismatch(format!(
                    "{name} has shape {got:?}, expected {want:?}"
                )));
            }
        }
        Ok(())
    }
}

impl VelocityPressureFieldAccessor for EulerianState {
    fn grid(&self) -> &CartesianGrid {
        &self.grid
    }

    fn velocity(&self, axis: Axis) -> &Array2<f64> {
        match axis {
            Axis::X => &self.u,
            Axis::Y => &self.v,
        }
    }

    fn velocity_mut(&mut self, axis: Axis) -> &mut Array2<f64> {
        match axis {
            Axis::X => &mut self.u,
            Axis::Y => &mut self.v,
        }
    }

    fn pressure(&self) -> &Array2<f64> {
        &self.p
    }

    fn pressure_mut(&mut self) -> &mut Array2<f64> {
        &mut self.p
    }
}

// ─────────────────────────────────────────────────────────────
//  Ghost filling
// ─────────────────────────────────────────────────────────────

/// Which boundary data the ghost layers are filled from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GhostFill {
    /// Wall values from the boundary provider at time `t`.
    Boundary { t: f64 },
    /// Zero wall data with the same condition kinds. Used for directions
    /// (Jacobian actions), where the fill must be linear.
    Homogeneous,
}

struct WallData<'a> {
    bc: &'a dyn BoundaryConditionProvider,
    fill: GhostFill,
}

impl WallData<'_> {
    fn value(&self, side: WallSide, axis: Axis, x: f64, y: f64) -> f64 {
        match self.fill {
            GhostFill::Boundary { t } => self.bc.wall_velocity(side, axis, x, y, t),
            GhostFill::Homogeneous => 0.0,
        }
    }

    fn tangential(&self, side: WallSide) -> TangentialCondition {
        self.bc.tangential_condition(side)
    }
}

/// Fill the x-face ghost layers and the wall-normal boundary faces.
///
/// Normal faces on the left/right walls take the prescribed values; the
/// ghosts beyond them are odd reflections about the wall. Ghost rows below
/// and above the domain use `2·u_b − u_in` (Dirichlet) or `u_in` (Neumann).
pub fn fill_u_ghosts(
    grid: &CartesianGrid,
    bc: &dyn BoundaryConditionProvider,
    fill: GhostFill,
    u: &mut Array2<f64>,
) {
    let wall = WallData { bc, fill };
    let (nx, ny, g) = (grid.nx as isize, grid.ny as isize, grid.ghost_width as isize);
    let at = |i: isize, j: isize| [(i + g) as usize, (j + g) as usize];
    let [x0, y0] = grid.origin;
    let [x1, y1] = grid.upper();

    for j in 0..ny {
        let y = grid.u_position(0, j)[1];
        u[at(0, j)] = wall.value(WallSide::Left, Axis::X, x0, y);
        u[at(nx, j)] = wall.value(WallSide::Right, Axis::X, x1, y);
        for k in 1..=g {
            let kk = k.min(nx);
            u[at(-k, j)] = 2.0 * u[at(0, j)] - u[at(kk, j)];
            u[at(nx + k, j)] = 2.0 * u[at(nx, j)] - u[at(nx - kk, j)];
        }
    }

    let bottom = wall.tangential(WallSide::Bottom);
    let top = wall.tangential(WallSide::Top);
    for i in -g..=(nx + g) {
        let x = grid.u_position(i, 0)[0];
        let ub = wall.value(WallSide::Bottom, Axis::X, x, y0);
        let ut = wall.value(WallSide::Top, Axis::X, x, y1);
        for k in 1..=g {
            let kk = (k - 1).min(ny - 1);
            let inner_b = u[at(i, kk)];
            let inner_t = u[at(i, ny - 1 - kk)];
            u[at(i, -k)] = match bottom {
                TangentialCondition::Dirichlet => 2.0 * ub - inner_b,
                TangentialCondition::Neumann => inner_b,
            };
            u[at(i, ny - 1 + k)] = match top {
                TangentialCondition::Dirichlet => 2.0 * ut - inner_t,
                TangentialCondition::Neumann => inner_t,
            };
        }
    }
}

/// Counterpart of [`fill_u_ghosts`] for y-faces.
pub fn fill_v_ghosts(
    grid: &CartesianGrid,
    bc: &dyn BoundaryConditionProvider,
    fill: GhostFill,
    v: &mut Array2<f64>,
) {
    let wall = WallData { bc, fill };
    let (nx, ny, g) = (grid.nx as isize, grid.ny as isize, grid.ghost_width as isize);
    let at = |i: isize, j: isize| [(i + g) as usize, (j + g) as usize];
    let [x0, y0] = grid.origin;
    let [x1, y1] = grid.upper();

    for i in 0..nx {
        let x = grid.v_position(i, 0)[0];
        v[at(i, 0)] = wall.value(WallSide::Bottom, Axis::Y, x, y0);
        v[at(i, ny)] = wall.value(WallSide::Top, Axis::Y, x, y1);
        for k in 1..=g {
            let kk = k.min(ny);
            v[at(i, -k)] = 2.0 * v[at(i, 0)] - v[at(i, kk)];
            v[at(i, ny + k)] = 2.0 * v[at(i, ny)] - v[at(i, ny - kk)];
        }
    }

    let left = wall.tangential(WallSide::Left);
    let right = wall.tangential(WallSide::Right);
    for j in -g..=(ny + g) {
        let y = grid.v_position(0, j)[1];
        let vl = wall.value(WallSide::Left, Axis::Y, x0, y);
        let vr = wall.value(WallSide::Right, Axis::Y, x1, y);
        for k in 1..=g {
            let kk = (k - 1).min(nx - 1);
            let inner_l = v[at(kk, j)];
            let inner_r = v[at(nx - 1 - kk, j)];
            v[at(-k, j)] = match left {
                TangentialCondition::Dirichlet => 2.0 * vl - inner_l,
                TangentialCondition::Neumann => inner_l,
            };
            v[at(nx - 1 + k, j)] = match right {
                TangentialCondition::Dirichlet => 2.0 * vr - inner_r,
                TangentialCondition::Neumann => inner_r,
            };
        }
    }
}

/// Even reflection of cell-centred pressure into the ghost layers.
pub fn fill_p_ghosts(grid: &CartesianGrid, p: &mut Array2<f64>) {
    let (nx, ny, g) = (grid.nx as isize, grid.ny as isize, grid.ghost_width as isize);
    let at = |i: isize, j: isize| [(i + g) as usize, (j + g) as usize];
    for j in 0..ny {
        for k in 1..=g {
            let kk = (k - 1).min(nx - 1);
            p[at(-k, j)] = p[at(kk, j)];
            p[at(nx - 1 + k, j)] = p[at(nx - 1 - kk, j)];
        }
    }
    for i in -g..(nx + g) {
        for k in 1..=g {
            let kk = (k - 1).min(ny - 1);
            p[at(i, -k)] = p[at(i, kk)];
            p[at(i, ny - 1 + k)] = p[at(i, ny - 1 - kk)];
        }
    }
}

/// Fill every ghost layer of `state` from `bc`.
pub fn fill_ghosts(
    state: &mut dyn VelocityPressureFieldAccessor,
    bc: &dyn BoundaryConditionProvider,
    fill: GhostFill,
) {
    let grid = state.grid().clone();
    fill_u_ghosts(&grid, bc, fill, state.velocity_mut(Axis::X));
    fill_v_ghosts(&grid, bc, fill, state.velocity_mut(Axis::Y));
    fill_p_ghosts(&grid, state.pressure_mut());
}
