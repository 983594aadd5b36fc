//! Solver configuration, validation and the restart snapshot.

use serde::{Deserialize, Serialize};

use crate::types::IbError;

/// How the Newton Jacobian-vector product is formed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum JacobianMode {
    /// Linearized operators: assembled Stokes block plus coupling and
    /// kernel-derivative terms.
    Analytic,
    /// `(F(x + h v) − F(x)) / h` with `h = step · (1 + ‖x‖) / ‖v‖`.
    FiniteDifference { step: f64 },
}

/// Approximate inverse used for the fluid sub-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FluidSolverKind {
    /// Projection preconditioner with AMG V-cycles for the velocity
    /// Helmholtz and pressure Poisson pieces.
    Multigrid,
    /// Sparse LDLᵀ of the regularized saddle-point matrix.
    Direct,
}

/// Strategy for the reduced structure-only solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchurSolverKind {
    /// Dense when the marker system is at most `schur_dense_threshold`
    /// unknowns, Krylov otherwise.
    Auto,
    Dense,
    Krylov,
}

/// Which unknowns the nonlinear system carries. Fixed for a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SolveMode {
    /// Unknowns are `(u, p, X)`.
    PositionAndFluid,
    /// Unknowns are `(u, p)`; positions follow from `X = Xⁿ + Δt J(Xⁿ) u`.
    FluidOnly,
}

/// Configuration consumed by the nonlinear solver and the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub nonlinear_rtol: f64,
    pub nonlinear_atol: f64,
    /// Zero is allowed: the solver then only evaluates the initial residual.
    pub max_nonlinear_iterations: usize,
    pub max_linear_iterations: usize,
    pub krylov_restart: usize,
    pub linear_rtol: f64,
    pub linear_atol: f64,
    pub jacobian: JacobianMode,
    /// Extra fluid correction sweeps after the Schur correction.
    pub preconditioner_sweeps: usize,
    /// A step is rejected when `‖R_new‖ > ratio · ‖R_old‖`.
    pub divergence_safeguard_ratio: f64,
    pub max_step_halvings: usize,
    pub fluid_solver: FluidSolverKind,
    /// V-cycles per AMG application.
    pub multigrid_cycles: usize,
    pub schur_solver: SchurSolverKind,
    pub schur_dense_threshold: usize,
    pub schur_max_iterations: usize,
    pub schur_rtol: f64,
    pub num_cycles: usize,
    pub solve_mode: SolveMode,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            nonlinear_rtol: 1e-8,
            nonlinear_atol: 1e-12,
            max_nonlinear_iterations: 20,
            max_linear_iterations: 200,
            krylov_restart: 50,
            linear_rtol: 1e-6,
            linear_atol: 1e-14,
            jacobian: JacobianMode::Analytic,
            preconditioner_sweeps: 0,
            divergence_safeguard_ratio: 2.0,
            max_step_halvings: 4,
            fluid_solver: FluidSolverKind::Direct,
            multigrid_cycles: 2,
            schur_solver: SchurSolverKind::Auto,
            schur_dense_threshold: 400,
            schur_max_iterations: 100,
            schur_rtol: 1e-10,
            num_cycles: 1,
            solve_mode: SolveMode::PositionAndFluid,
        }
    }
}

impl SolverConfig {
    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.nonlinear_rtol = rtol;
        self.nonlinear_atol = atol;
        self
    }

    pub fn with_linear_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.linear_rtol = rtol;
        self.linear_atol = atol;
        self
    }

    pub fn with_max_nonlinear_iterations(mut self, n: usize) -> Self {
        self.max_nonlinear_iterations = n;
        self
    }

    pub fn with_jacobian(mut self, jacobian: JacobianMode) -> Self {
        self.jacobian = jacobian;
        self
    }

    pub fn with_fluid_solver(mut self, kind: FluidSolverKind) -> Self {
        self.fluid_solver = kind;
        self
    }

    pub fn with_schur_solver(mut self, kind: SchurSolverKind) -> Self {
        self.schur_solver = kind;
        self
    }

    pub fn with_solve_mode(mut self, mode: SolveMode) -> Self {
        self.solve_mode = mode;
        self
    }

    pub fn with_num_cycles(mut self, n: usize) -> Self {
        self.num_cycles = n;
        self
    }

    pub fn with_preconditioner_sweeps(mut self, n: usize) -> Self {
        self.preconditioner_sweeps = n;
        self
    }

    /// Reject bounds that would make a solve meaningless. Called before any
    /// operator is built.
    pub fn validate(&self) -> Result<(), IbError> {
        fn positive_finite(name: &str, v: f64) -> Result<(), IbError> {
            if !(v.is_finite() && v > 0.0) {
                return Err(IbError::ConfigurationError(format!(
                    "{name} must be positive and finite, got {v}"
                )));
            }
            Ok(())
        }
        fn non_negative_finite(name: &str, v: f64) -> Result<(), IbError> {
            if !(v.is_finite() && v >= 0.0) {
                return Err(IbError::ConfigurationError(format!(
                    "{name} must be non-negative and finite, got {v}"
                )));
            }
            Ok(())
        }

        non_negative_finite("nonlinear_rtol", self.nonlinear_rtol)?;
        non_negative_finite("nonlinear_atol", self.nonlinear_atol)?;
        if self.nonlinear_rtol == 0.0 && self.nonlinear_atol == 0.0 {
            return Err(IbError::ConfigurationError(
                "nonlinear_rtol and nonlinear_atol cannot both be zero".into(),
            ));
        }
        if self.nonlinear_rtol >= 1.0 {
            return Err(IbError::ConfigurationError(format!(
                "nonlinear_rtol must be < 1, got {}",
                self.nonlinear_rtol
            )));
        }
        positive_finite("linear_rtol", self.linear_rtol)?;
        if self.linear_rtol >= 1.0 {
            return Err(IbError::ConfigurationError(format!(
                "linear_rtol must be < 1, got {}",
                self.linear_rtol
            )));
        }
        non_negative_finite("linear_atol", self.linear_atol)?;
        if self.max_linear_iterations == 0 {
            return Err(IbError::ConfigurationError(
                "max_linear_iterations must be at least 1".into(),
            ));
        }
        if self.krylov_restart == 0 {
            return Err(IbError::ConfigurationError(
                "krylov_restart must be at least 1".into(),
            ));
        }
        if let JacobianMode::FiniteDifference { step } = self.jacobian {
            positive_finite("finite-difference step", step)?;
        }
        let ratio = self.divergence_safeguard_ratio;
        if !(ratio.is_finite() && ratio >= 1.0) {
            return Err(IbError::ConfigurationError(format!(
                "divergence_safeguard_ratio must be >= 1, got {ratio}"
            )));
        }
        if self.fluid_solver == FluidSolverKind::Multigrid && self.multigrid_cycles == 0 {
            return Err(IbError::ConfigurationError(
                "multigrid_cycles must be at least 1".into(),
            ));
        }
        if self.schur_max_iterations == 0 {
            return Err(IbError::ConfigurationError(
                "schur_max_iterations must be at least 1".into(),
            ));
        }
        positive_finite("schur_rtol", self.schur_rtol)?;
        if self.num_cycles == 0 {
            return Err(IbError::ConfigurationError(
                "num_cycles must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Fluid parameters
// ─────────────────────────────────────────────────────────────

/// Physical constants of the unsteady Stokes fluid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FluidParameters {
    pub density: f64,
    pub viscosity: f64,
}

impl Default for FluidParameters {
    fn default() -> Self {
        Self { density: 1.0, viscosity: 1.0 }
    }
}

impl FluidParameters {
    pub fn validate(&self) -> Result<(), IbError> {
        if !(self.density.is_finite() && self.density > 0.0) {
            return Err(IbError::ConfigurationError(format!(
                "density must be positive, got {}",
                self.density
            )));
        }
        if !(self.viscosity.is_finite() && self.viscosity >= 0.0) {
            return Err(IbError::ConfigurationError(format!(
                "viscosity must be non-negative, got {}",
                self.viscosity
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Restart snapshot
// ─────────────────────────────────────────────────────────────

/// Everything the coordinator needs to resume with identical solver
/// behaviour. Field data is checkpointed elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub format_version: u32,
    pub solver: SolverConfig,
    pub fluid: FluidParameters,
    /// Simulation time of the last committed step.
    pub time: f64,
    pub steps_taken: u64,
}

impl ConfigSnapshot {
    pub const FORMAT_VERSION: u32 = 1;

    pub fn to_json(&self) -> Result<String, IbError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, IbError> {
        let snap: Self = serde_json::from_str(s)?;
        if snap.format_version != Self::FORMAT_VERSION {
            return Err(IbError::ConfigurationError(format!(
                "unsupported snapshot format version {}",
                snap.format_version
            )));
        }
        snap.solver.validate()?;
        snap.fluid.validate()?;
        Ok(snap)
    }
}
