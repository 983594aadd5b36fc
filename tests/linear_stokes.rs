//! Stokes-only steps: no markers, so the coupled residual is affine and one
//! Newton update with an accurate linear solve must land on the solution.
//!
//! The problem is a lid-driven cavity with a smooth body force:
//!
//!     lid:   u(x, 1) = sin²(πx)
//!     force: f = (sin(πy) + x, ½ cos(πx))
//!
//! Both the coordinator path and a hand-assembled solver are exercised, and
//! the converged residual is re-evaluated independently.

use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::Array2;

use ibimplicit::boundary::{FnBodyForce, WallBoundary};
use ibimplicit::comm::SerialCommunicator;
use ibimplicit::config::{FluidParameters, FluidSolverKind, SolveMode, SolverConfig};
use ibimplicit::dof::{CompositeVector, DofIndexMap};
use ibimplicit::fields::EulerianState;
use ibimplicit::grid::{CartesianGrid, StaticHierarchy};
use ibimplicit::interaction::KernelInteraction;
use ibimplicit::newton::{NewtonState, NonlinearCoupledSolver};
use ibimplicit::operator::OperatorCoefficients;
use ibimplicit::residual::{CompositeResidualEvaluator, StepContext};
use ibimplicit::stokes::{tangential_kinds, FluidBlock};
use ibimplicit::structure::{LagrangianState, SpringNetwork};
use ibimplicit::types::Axis;
use ibimplicit::TimestepCoordinator;

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

const DT: f64 = 0.01;

fn forcing(axis: Axis, x: f64, y: f64, _t: f64) -> f64 {
    match axis {
        Axis::X => (PI * y).sin() + x,
        Axis::Y => 0.5 * (PI * x).cos(),
    }
}

fn cavity() -> WallBoundary {
    WallBoundary::lid_driven(|x, _t| (PI * x).sin().powi(2))
}

fn tight_config() -> SolverConfig {
    SolverConfig::default()
        .with_tolerances(1e-8, 1e-10)
        .with_linear_tolerances(1e-12, 1e-14)
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[test]
fn stokes_step_converges_in_one_newton_iteration() {
    let grid = CartesianGrid::unit_square(16).unwrap();
    let mut coord = TimestepCoordinator::new(
        tight_config(),
        FluidParameters::default(),
        StaticHierarchy::new(grid.clone()),
        EulerianState::zeros(&grid),
        LagrangianState::empty(),
        SpringNetwork::new(),
        cavity(),
    )
    .unwrap()
    .with_body_force(FnBodyForce(forcing));

    let reports = coord.advance(0.0, DT).unwrap();
    assert_eq!(reports.len(), 1);
    let newton = reports[0].newton.as_ref().unwrap();
    eprintln!(
        "stokes step: {} iteration(s), residual {:.3e} -> {:.3e}, krylov {:?}",
        newton.iterations,
        newton.initial_residual(),
        newton.final_residual(),
        newton.linear_iterations
    );

    assert_eq!(newton.state, NewtonState::Converged);
    assert_eq!(newton.iterations, 1, "affine problem must take exactly one Newton step");
    assert!(newton.initial_residual() > 1.0);
    assert!(newton.final_residual() <= 1e-8 * newton.initial_residual());
    assert_eq!(coord.time(), DT);
    assert_eq!(coord.steps_taken(), 1);

    // Lid motion drags the top row in +x.
    let g = grid.ghost_width;
    let top_mid = coord.eulerian().u[[grid.nx / 2 + g, grid.ny - 1 + g]];
    assert!(top_mid > 0.0, "fluid under the lid should move with it, got {top_mid}");
}

#[test]
fn converged_residual_is_small_in_absolute_and_relative_terms() {
    let grid = CartesianGrid::unit_square(12).unwrap();
    let comm = SerialCommunicator;
    let map = Arc::new(DofIndexMap::new(&grid, 0, SolveMode::PositionAndFluid, &comm));
    let boundary = cavity();
    let structure = SpringNetwork::new();
    let interaction = KernelInteraction;
    let force = FnBodyForce(forcing);
    let fluid = FluidParameters::default();
    let previous = EulerianState::from_fn(&grid, |_, y| 0.1 * y, |_, _| 0.0, |_, _| 0.0);
    let previous_positions = Array2::zeros((0, 2));

    let ctx = StepContext {
        map: Arc::clone(&map),
        comm: &comm,
        boundary: &boundary,
        body_force: Some(&force),
        structure: &structure,
        interaction: &interaction,
        fluid,
        new_time: DT,
        dt: DT,
        previous: &previous,
        previous_positions: &previous_positions,
    };
    let evaluator = CompositeResidualEvaluator::new(ctx).unwrap();
    let coeffs = OperatorCoefficients {
        dt: DT,
        density: fluid.density,
        viscosity: fluid.viscosity,
    };
    let block = Arc::new(
        FluidBlock::new(
            Arc::clone(&map),
            Arc::new(SerialCommunicator),
            tangential_kinds(&boundary),
            coeffs,
            FluidSolverKind::Direct,
            1,
        )
        .unwrap(),
    );

    let config = tight_config();
    let mut solver = NonlinearCoupledSolver::new(&config, &evaluator, block).unwrap();
    let initial = map
        .gather(&previous, &LagrangianState::empty())
        .unwrap();
    let (x, report) = solver.solve(&initial).unwrap();
    assert_eq!(solver.state(), NewtonState::Converged);
    assert_eq!(report.iterations, 1);

    let mut r = CompositeVector::zeros(&map);
    evaluator.evaluate(&x, &mut r).unwrap();
    let norm = r.norm(&comm);
    let initial_norm = report.initial_residual();
    eprintln!("independent residual {norm:.3e} (initial {initial_norm:.3e})");

    assert!(norm <= 1e-6, "absolute residual {norm:.3e} too large");
    assert!(
        norm <= 1e-8 * initial_norm,
        "relative residual {:.3e} too large",
        norm / initial_norm
    );
    approx::assert_relative_eq!(norm, report.final_residual(), epsilon = 1e-9);
}

#[test]
fn converged_pressure_has_zero_mean() {
    let grid = CartesianGrid::unit_square(10).unwrap();
    let mut coord = TimestepCoordinator::new(
        tight_config(),
        FluidParameters::default(),
        StaticHierarchy::new(grid.clone()),
        EulerianState::zeros(&grid),
        LagrangianState::empty(),
        SpringNetwork::new(),
        cavity(),
    )
    .unwrap()
    .with_body_force(FnBodyForce(forcing));
    coord.advance(0.0, DT).unwrap();

    let g = grid.ghost_width;
    let p = &coord.eulerian().p;
    let mut sum = 0.0;
    let mut scale: f64 = 0.0;
    for j in 0..grid.ny {
        for i in 0..grid.nx {
            sum += p[[i + g, j + g]];
            scale = scale.max(p[[i + g, j + g]].abs());
        }
    }
    let mean = sum / (grid.nx * grid.ny) as f64;
    eprintln!("pressure mean {mean:.3e}, max |p| {scale:.3e}");
    assert!(scale > 0.0);
    assert!(mean.abs() <= 1e-10 * scale.max(1.0));
}
