//! **ibimplicit**: implicit immersed-boundary timestepping for an elastic
//! structure in an unsteady Stokes fluid.
//!
//! Each step solves the fully coupled backward-Euler system for face
//! velocities, cell pressures and (optionally) marker positions with a
//! Newton–Krylov method:
//!
//! 1. **Residual** (`residual`): matrix-free MAC Stokes stencil, force
//!    spreading and the marker kinematic rows.
//! 2. **Jacobian** (`jacobian`): analytic linearization or finite
//!    differences of the residual.
//! 3. **Preconditioner** (`preconditioner`, `schur`, `stokes`, `amg`): a
//!    block factorization with a fluid solve (sparse LDLᵀ or AMG projection)
//!    and a reduced Lagrangian Schur solve.
//! 4. **Nonlinear driver** (`newton`, `krylov`): damped Newton around
//!    flexible GMRES.
//! 5. **Coordinator** (`integrator`): owns the state, runs the
//!    preprocess / integrate / postprocess cycle and commits atomically.

pub mod types;
pub mod config;
pub mod comm;
pub mod grid;
pub mod boundary;
pub mod fields;
pub mod dof;
pub mod structure;
pub mod interaction;
pub mod operator;
pub mod amg;
pub mod stokes;
pub mod residual;
pub mod jacobian;
pub mod krylov;
pub mod schur;
pub mod preconditioner;
pub mod newton;
pub mod registry;
pub mod integrator;

pub use config::{
    ConfigSnapshot, FluidParameters, FluidSolverKind, JacobianMode, SchurSolverKind, SolveMode,
    SolverConfig,
};
pub use integrator::{StepReport, TimestepCoordinator};
pub use newton::{NewtonReport, NewtonState};
pub use types::IbError;
