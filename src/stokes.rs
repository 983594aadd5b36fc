//! Unsteady Stokes operators on the MAC grid and the fluid block solver.
//!
//! With `A = ρ/Δt − μΔ_h` on interior faces and `G` the pressure gradient,
//! the backward-Euler Stokes step is the symmetric saddle-point system
//!
//! ```text
//! [ A   G ] [u]   [r_u]
//! [ Gᵀ  0 ] [p] = [r_p]
//! ```
//!
//! where the mass row `Gᵀu` equals `−Du` restricted to the unknown faces.

use std::sync::Arc;

use log::debug;
use sprs::{CsMat, TriMat};

use crate::amg::{AmgHierarchy, AmgParameters};
use crate::boundary::{BoundaryConditionProvider, TangentialCondition};
use crate::comm::Communicator;
use crate::config::FluidSolverKind;
use crate::dof::{remove_mean, DofIndexMap};
use crate::operator::{check_dims, spmv, spmv_add, BlockOperator, OperatorCoefficients};
use crate::types::{Factorization, IbError, WallSide};

/// Tangential condition on each wall, in `WallSide::ALL` order.
pub type TangentialKinds = [TangentialCondition; 4];

pub fn tangential_kinds(bc: &dyn BoundaryConditionProvider) -> TangentialKinds {
    WallSide::ALL.map(|s| bc.tangential_condition(s))
}

fn ghost_shift(kind: TangentialCondition) -> f64 {
    match kind {
        TangentialCondition::Dirichlet => 1.0,
        TangentialCondition::Neumann => -1.0,
    }
}

// ─────────────────────────────────────────────────────────────
//  Assembly
// ─────────────────────────────────────────────────────────────

/// Assembled sparse pieces of the Stokes operator (all CSR).
#[derive(Debug, Clone)]
pub struct StokesOperators {
    /// Velocity Helmholtz `ρ/Δt − μΔ_h`, `n_vel × n_vel`.
    pub helmholtz: CsMat<f64>,
    /// Gradient, `n_vel × n_p`.
    pub gradient: CsMat<f64>,
    /// `Gᵀ`, the negative discrete divergence on unknown faces.
    pub gradient_t: CsMat<f64>,
    /// Neumann pressure Laplacian `GᵀG`, `n_p × n_p`.
    pub poisson: CsMat<f64>,
    /// Full saddle-point matrix `[A G; Gᵀ 0]`.
    pub saddle: CsMat<f64>,
}

impl StokesOperators {
    pub fn assemble(
        map: &DofIndexMap,
        tangential: &TangentialKinds,
        coeffs: &OperatorCoefficients,
    ) -> Self {
        let grid = map.grid();
        let (nx, ny) = (grid.nx, grid.ny);
        let mu = coeffs.viscosity;
        let (cx, cy) = (mu / (grid.dx * grid.dx), mu / (grid.dy * grid.dy));
        let diag0 = coeffs.reaction() + 2.0 * cx + 2.0 * cy;
        let n_vel = map.num_velocity();
        let n_p = map.pressure_range().len();
        let p0 = map.pressure_range().start;
        let [left, right, bottom, top] = *tangential;

        let mut a = TriMat::new((n_vel, n_vel));
        let mut g = TriMat::new((n_vel, n_p));

        // x-faces
        for j in 0..ny {
            for i in 1..nx {
                let Some(row) = map.u_index(i, j) else { continue };
                let mut diag = diag0;
                for nb in [map.u_index(i - 1, j), map.u_index(i + 1, j)].into_iter().flatten() {
                    a.add_triplet(row, nb, -cx);
                }
                match j.checked_sub(1).and_then(|jm| map.u_index(i, jm)) {
                    Some(nb) => a.add_triplet(row, nb, -cy),
                    None => diag += ghost_shift(bottom) * cy,
                }
                match map.u_index(i, j + 1) {
                    Some(nb) => a.add_triplet(row, nb, -cy),
                    None => diag += ghost_shift(top) * cy,
                }
                a.add_triplet(row, row, diag);
                if let (Some(pr), Some(pl)) = (map.p_index(i, j), map.p_index(i - 1, j)) {
                    g.add_triplet(row, pr - p0, 1.0 / grid.dx);
                    g.add_triplet(row, pl - p0, -1.0 / grid.dx);
                }
            }
        }
        // y-faces
        for j in 1..ny {
            for i in 0..nx {
                let Some(row) = map.v_index(i, j) else { continue };
                let mut diag = diag0;
                for nb in [map.v_index(i, j - 1), map.v_index(i, j + 1)].into_iter().flatten() {
                    a.add_triplet(row, nb, -cy);
                }
                match i.checked_sub(1).and_then(|im| map.v_index(im, j)) {
                    Some(nb) => a.add_triplet(row, nb, -cx),
                    None => diag += ghost_shift(left) * cx,
                }
                match map.v_index(i + 1, j) {
                    Some(nb) => a.add_triplet(row, nb, -cx),
                    None => diag += ghost_shift(right) * cx,
                }
                a.add_triplet(row, row, diag);
                if let (Some(pt), Some(pb)) = (map.p_index(i, j), map.p_index(i, j - 1)) {
                    g.add_triplet(row, pt - p0, 1.0 / grid.dy);
                    g.add_triplet(row, pb - p0, -1.0 / grid.dy);
                }
            }
        }

        let helmholtz: CsMat<f64> = a.to_csr();
        let gradient: CsMat<f64> = g.to_csr();
        let gradient_t: CsMat<f64> = gradient.transpose_view().to_csr();
        let poisson: CsMat<f64> = &gradient_t * &gradient;

        let n = n_vel + n_p;
        let mut s = TriMat::new((n, n));
        for (v, (i, j)) in helmholtz.iter() {
            s.add_triplet(i, j, *v);
        }
        for (v, (i, j)) in gradient.iter() {
            s.add_triplet(i, n_vel + j, *v);
            s.add_triplet(n_vel + j, i, *v);
        }
        Self {
            helmholtz,
            gradient,
            gradient_t,
            poisson,
            saddle: s.to_csr(),
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Fluid block
// ─────────────────────────────────────────────────────────────

enum FluidSolver {
    Direct(Factorization),
    Multigrid {
        velocity: AmgHierarchy,
        pressure: AmgHierarchy,
    },
}

impl std::fmt::Debug for FluidSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct(fact) => write!(f, "FluidSolver::Direct({fact:?})"),
            Self::Multigrid { velocity, pressure } => write!(
                f,
                "FluidSolver::Multigrid(velocity levels={}, pressure levels={})",
                velocity.num_levels(),
                pressure.num_levels()
            ),
        }
    }
}

/// The fluid sub-block `L` over `(u, p)` with its approximate inverse `L̃⁻¹`.
///
/// Vectors are fluid-length slices laid out like the first
/// `map.num_fluid()` entries of a composite vector.
#[derive(Debug)]
pub struct FluidBlock {
    map: Arc<DofIndexMap>,
    comm: Arc<dyn Communicator>,
    tangential: TangentialKinds,
    kind: FluidSolverKind,
    cycles: usize,
    coeffs: OperatorCoefficients,
    ops: StokesOperators,
    solver: FluidSolver,
}

impl FluidBlock {
    pub fn new(
        map: Arc<DofIndexMap>,
        comm: Arc<dyn Communicator>,
        tangential: TangentialKinds,
        coeffs: OperatorCoefficients,
        kind: FluidSolverKind,
        cycles: usize,
    ) -> Result<Self, IbError> {
        coeffs.validate()?;
        let ops = StokesOperators::assemble(&map, &tangential, &coeffs);
        let solver = Self::build_solver(&ops, &coeffs, kind, cycles)?;
        debug!(
            "fluid block {}x{}: {} unknowns, solver {:?}",
            map.grid().nx,
            map.grid().ny,
            map.num_fluid(),
            kind
        );
        Ok(Self {
            map,
            comm,
            tangential,
            kind,
            cycles,
            coeffs,
            ops,
            solver,
        })
    }

    /// Regularization of the pressure block so that LDLᵀ without pivoting
    /// sees a quasi-definite matrix.
    fn regularization(coeffs: &OperatorCoefficients) -> f64 {
        1e-8 / (coeffs.reaction() + coeffs.viscosity)
    }

    fn build_solver(
        ops: &StokesOperators,
        coeffs: &OperatorCoefficients,
        kind: FluidSolverKind,
        cycles: usize,
    ) -> Result<FluidSolver, IbError> {
        match kind {
            FluidSolverKind::Direct => {
                let n_vel = ops.helmholtz.rows();
                let n = ops.saddle.rows();
                let delta = Self::regularization(coeffs);
                let mut t = TriMat::new((n, n));
                for (v, (i, j)) in ops.saddle.iter() {
                    t.add_triplet(i, j, *v);
                }
                for k in n_vel..n {
                    t.add_triplet(k, k, -delta);
                }
                let m: CsMat<f64> = t.to_csc();
                Ok(FluidSolver::Direct(Factorization::quasi_definite(m.view())?))
            }
            FluidSolverKind::Multigrid => {
                let params = AmgParameters {
                    cycles,
                    ..AmgParameters::default()
                };
                let velocity = AmgHierarchy::new(ops.helmholtz.clone(), params)?;
                // GᵀG is singular (constants); a shift far below its first
                // non-zero eigenvalue makes every level SPD.
                let poisson = &ops.poisson;
                let max_diag = crate::operator::diagonal(poisson)
                    .into_iter()
                    .fold(0.0_f64, f64::max);
                let shift = 1e-8 * max_diag.max(1.0);
                let mut t = TriMat::new((poisson.rows(), poisson.cols()));
                for (v, (i, j)) in poisson.iter() {
                    t.add_triplet(i, j, *v);
                }
                for k in 0..poisson.rows() {
                    t.add_triplet(k, k, shift);
                }
                let pressure = AmgHierarchy::new(t.to_csr(), params)?;
                Ok(FluidSolver::Multigrid { velocity, pressure })
            }
        }
    }

    pub fn map(&self) -> &Arc<DofIndexMap> {
        &self.map
    }

    pub fn coefficients(&self) -> OperatorCoefficients {
        self.coeffs
    }

    pub fn kind(&self) -> FluidSolverKind {
        self.kind
    }

    /// A fresh block with the same topology and strategy but new
    /// coefficients.
    pub fn rebuilt(&self, coeffs: OperatorCoefficients) -> Result<Self, IbError> {
        Self::new(
            Arc::clone(&self.map),
            Arc::clone(&self.comm),
            self.tangential,
            coeffs,
            self.kind,
            self.cycles,
        )
    }

    /// Owned part of the pressure block, relative to its start.
    fn owned_pressure(&self) -> std::ops::Range<usize> {
        let r = self.map.pressure_range();
        let owned = self.map.owned_range();
        (owned.start.clamp(r.start, r.end) - r.start)..(owned.end.clamp(r.start, r.end) - r.start)
    }

    fn velocity_solve(&self, b: &[f64], x: &mut [f64]) {
        if let FluidSolver::Multigrid { velocity, .. } = &self.solver {
            velocity.apply(b, x);
        }
    }
}

impl BlockOperator for FluidBlock {
    fn dim(&self) -> usize {
        self.map.num_fluid()
    }

    fn apply_forward(&self, x: &[f64], y: &mut [f64]) -> Result<(), IbError> {
        check_dims("fluid forward", self.dim(), x, y)?;
        spmv(&self.ops.saddle, x, y);
        Ok(())
    }

    fn apply_inverse_approx(&self, r: &[f64], z: &mut [f64]) -> Result<(), IbError> {
        check_dims("fluid inverse", self.dim(), r, z)?;
        let n_vel = self.map.num_velocity();
        let owned_p = self.owned_pressure();
        match &self.solver {
            FluidSolver::Direct(fact) => {
                let mut rhs = r.to_vec();
                remove_mean(&mut rhs[n_vel..], owned_p.clone(), self.comm.as_ref());
                let sol = fact.solve(&rhs);
                z.copy_from_slice(&sol);
            }
            FluidSolver::Multigrid { pressure, .. } => {
                let coeffs = self.coeffs;
                let (r_u, r_p) = r.split_at(n_vel);
                let (z_u, z_p) = z.split_at_mut(n_vel);

                // u* = A⁻¹ r_u,  q = r_p − Gᵀ u*
                let mut u_star = vec![0.0; n_vel];
                self.velocity_solve(r_u, &mut u_star);
                let mut q = r_p.to_vec();
                spmv_add(&self.ops.gradient_t, -1.0, &u_star, &mut q);
                remove_mean(&mut q, owned_p.clone(), self.comm.as_ref());

                // p = −(ρ/Δt (GᵀG)⁻¹ + μ) q
                let mut phi = vec![0.0; q.len()];
                pressure.apply(&q, &mut phi);
                for ((pi, phii), qi) in z_p.iter_mut().zip(&phi).zip(&q) {
                    *pi = -(coeffs.reaction() * phii + coeffs.viscosity * qi);
                }

                // u = A⁻¹ (r_u − G p)
                let mut rhs_u = r_u.to_vec();
                spmv_add(&self.ops.gradient, -1.0, z_p, &mut rhs_u);
                self.velocity_solve(&rhs_u, z_u);
            }
        }
        remove_mean(&mut z[n_vel..], owned_p, self.comm.as_ref());
        Ok(())
    }

    fn set_coefficients(&mut self, coeffs: OperatorCoefficients) -> Result<(), IbError> {
        if coeffs == self.coeffs {
            return Ok(());
        }
        coeffs.validate()?;
        let ops = StokesOperators::assemble(&self.map, &self.tangential, &coeffs);
        self.solver = Self::build_solver(&ops, &coeffs, self.kind, self.cycles)?;
        self.ops = ops;
        self.coeffs = coeffs;
        Ok(())
    }
}
