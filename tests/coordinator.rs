//! Timestep coordinator lifecycle: zero-length steps, failure atomicity,
//! Newton recovery paths, configuration validation, restart snapshots,
//! regridding and cooperating workers.

use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use ndarray::Array2;

use ibimplicit::boundary::{BodyForce, FnBodyForce, WallBoundary};
use ibimplicit::comm::Communicator;
use ibimplicit::config::{
    ConfigSnapshot, FluidParameters, FluidSolverKind, JacobianMode, SolveMode, SolverConfig,
};
use ibimplicit::dof::DofIndexMap;
use ibimplicit::fields::EulerianState;
use ibimplicit::grid::{CartesianGrid, StaticHierarchy};
use ibimplicit::interaction::{InterpolationSpreadOperator, KernelInteraction};
use ibimplicit::newton::NewtonState;
use ibimplicit::structure::{LagrangianState, SpringNetwork, StructureModel};
use ibimplicit::types::Axis;
use ibimplicit::{IbError, TimestepCoordinator};

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

const DT: f64 = 0.01;

fn ring(n: usize, radius: f64) -> Array2<f64> {
    let mut x = Array2::zeros((n, 2));
    for k in 0..n {
        let th = 2.0 * PI * k as f64 / n as f64;
        x[[k, 0]] = 0.5 + radius * th.cos();
        x[[k, 1]] = 0.5 + radius * th.sin();
    }
    x
}

fn tethered_ring(n: usize) -> SpringNetwork {
    let anchors = ring(n, 0.2);
    let mut net = SpringNetwork::closed_ring(n, 10.0, 0.1);
    for k in 0..n {
        net = net.with_tether(k, [anchors[[k, 0]], anchors[[k, 1]]], 4.0);
    }
    net
}

fn cavity() -> WallBoundary {
    WallBoundary::lid_driven(|x, _t| (PI * x).sin().powi(2))
}

fn swirl(grid: &CartesianGrid) -> EulerianState {
    EulerianState::from_fn(
        grid,
        |x, y| 0.2 * (PI * x).sin() * (PI * y).cos(),
        |x, y| -0.2 * (PI * x).cos() * (PI * y).sin(),
        |x, _| x - 0.5,
    )
}

fn coordinator(config: SolverConfig, n: usize, markers: usize) -> TimestepCoordinator {
    let _ = env_logger::builder().is_test(true).try_init();
    let grid = CartesianGrid::unit_square(n).unwrap();
    let mut structure = LagrangianState::new(ring(markers, 0.2)).unwrap();
    if markers > 0 {
        structure = structure.with_velocities();
    }
    TimestepCoordinator::new(
        config,
        FluidParameters::default(),
        StaticHierarchy::new(grid.clone()),
        swirl(&grid),
        structure,
        tethered_ring(markers),
        cavity(),
    )
    .unwrap()
}

/// Body force that turns into NaN after a fixed number of evaluations.
struct PoisonedForce {
    calls: AtomicUsize,
    healthy: usize,
}

impl BodyForce for PoisonedForce {
    fn force(&self, component: Axis, x: f64, _y: f64, _t: f64) -> f64 {
        if self.calls.fetch_add(1, Ordering::SeqCst) >= self.healthy {
            return f64::NAN;
        }
        match component {
            Axis::X => x,
            Axis::Y => 0.0,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Zero-length and failing steps
// ─────────────────────────────────────────────────────────────

#[test]
fn zero_length_step_leaves_state_untouched() {
    let mut coord = coordinator(SolverConfig::default(), 12, 6).with_time(0.5);
    let fluid_before = coord.eulerian().clone();
    let markers_before = coord.lagrangian().clone();

    let report = coord.integrate(0.5, 0.5, 0).unwrap();
    assert!(report.skipped);
    assert!(report.newton.is_none());
    assert_eq!(coord.eulerian(), &fluid_before);
    assert_eq!(coord.lagrangian(), &markers_before);
    assert_eq!(coord.time(), 0.5);

    coord.advance(0.5, 0.5).unwrap();
    assert_eq!(coord.eulerian(), &fluid_before);
    assert_eq!(coord.lagrangian(), &markers_before);
    assert_eq!(coord.steps_taken(), 0);
}

#[test]
fn zero_iteration_budget_reports_max_iterations_and_keeps_state() {
    let config = SolverConfig::default().with_max_nonlinear_iterations(0);
    let mut coord = coordinator(config, 12, 6);
    let fluid_before = coord.eulerian().clone();
    let markers_before = coord.lagrangian().clone();

    let err = coord.integrate(0.0, DT, 0).unwrap_err();
    eprintln!("zero budget: {err}");
    assert!(
        matches!(err, IbError::MaxIterationsReached { iterations: 0, .. }),
        "unexpected error {err:?}"
    );
    assert_eq!(err.kind(), "MaxIterationsReached");
    assert_eq!(coord.eulerian(), &fluid_before);
    assert_eq!(coord.lagrangian(), &markers_before);
    assert_eq!(coord.time(), 0.0);

    let report = coord.last_report().unwrap();
    assert_eq!(report.state, NewtonState::MaxIterationsReached);
    assert_eq!(report.residual_history.len(), 1);
    assert!(report.initial_residual() > 0.0);
}

#[test]
fn backwards_interval_is_rejected() {
    let mut coord = coordinator(SolverConfig::default(), 8, 0);
    let err = coord.integrate(1.0, 0.5, 0).unwrap_err();
    assert!(matches!(err, IbError::InvalidTimeInterval { .. }));
    let err = coord.advance(0.0, f64::NAN).unwrap_err();
    assert!(matches!(err, IbError::InvalidTimeInterval { .. }));
}

/// Two-cycle coordinator whose body force breaks during the second cycle.
fn poisoned_coordinator() -> TimestepCoordinator {
    let n = 8;
    let grid = CartesianGrid::unit_square(n).unwrap();
    let faces = (n - 1) * n + n * (n - 1);
    let config = SolverConfig::default().with_num_cycles(2);
    TimestepCoordinator::new(
        config,
        FluidParameters::default(),
        StaticHierarchy::new(grid.clone()),
        swirl(&grid),
        LagrangianState::empty(),
        SpringNetwork::new(),
        cavity(),
    )
    .unwrap()
    .with_body_force(PoisonedForce {
        calls: AtomicUsize::new(0),
        healthy: faces,
    })
}

#[test]
fn advance_rolls_back_when_a_later_cycle_fails() {
    let mut coord = poisoned_coordinator();
    let fluid_before = coord.eulerian().clone();

    let err = coord.advance(0.0, DT).unwrap_err();
    eprintln!("second cycle: {err}");
    assert!(matches!(err, IbError::NumericalInstability(_)), "unexpected error {err:?}");
    assert_eq!(coord.eulerian(), &fluid_before);
    assert_eq!(coord.time(), 0.0);
    assert_eq!(coord.steps_taken(), 0);
}

#[test]
fn postprocess_after_a_failed_cycle_keeps_the_clock_and_state() {
    let mut coord = coordinator(SolverConfig::default(), 12, 6);
    coord.advance(0.0, DT).unwrap();
    let velocities = coord.lagrangian().velocities.clone().unwrap();
    assert!(velocities.iter().any(|v| v.abs() > 0.0));

    let mut snap = coord.config_snapshot();
    snap.solver.max_nonlinear_iterations = 0;
    coord.restore_config(snap).unwrap();
    let fluid_before = coord.eulerian().clone();
    let markers_before = coord.lagrangian().clone();

    coord.preprocess_integrate(DT, 2.0 * DT, 1).unwrap();
    let err = coord.integrate(DT, 2.0 * DT, 0).unwrap_err();
    assert!(matches!(err, IbError::MaxIterationsReached { .. }), "unexpected error {err:?}");
    let err = coord.postprocess_integrate(DT, 2.0 * DT, false, 1).unwrap_err();
    eprintln!("postprocess after failure: {err}");
    assert!(matches!(err, IbError::ConfigurationError(_)), "unexpected error {err:?}");

    assert_eq!(coord.time(), DT);
    assert_eq!(coord.steps_taken(), 1);
    assert_eq!(coord.eulerian(), &fluid_before);
    assert_eq!(coord.lagrangian(), &markers_before);
    assert_eq!(coord.lagrangian().velocities.as_ref(), Some(&velocities));

    // The failure belongs to that step only.
    let mut snap = coord.config_snapshot();
    snap.solver.max_nonlinear_iterations = 20;
    coord.restore_config(snap).unwrap();
    coord.advance(DT, 2.0 * DT).unwrap();
    assert_eq!(coord.time(), 2.0 * DT);
    assert_eq!(coord.steps_taken(), 2);
}

#[test]
fn postprocess_rolls_back_past_a_successful_first_cycle() {
    let mut coord = poisoned_coordinator();
    let fluid_before = coord.eulerian().clone();

    coord.preprocess_integrate(0.0, DT, 2).unwrap();
    coord.integrate(0.0, DT, 0).unwrap();
    assert_ne!(coord.eulerian(), &fluid_before);
    let err = coord.integrate(0.0, DT, 1).unwrap_err();
    assert!(matches!(err, IbError::NumericalInstability(_)), "unexpected error {err:?}");

    assert!(coord.postprocess_integrate(0.0, DT, false, 2).is_err());
    assert_eq!(coord.eulerian(), &fluid_before);
    assert_eq!(coord.time(), 0.0);
    assert_eq!(coord.steps_taken(), 0);
}

#[test]
fn coupled_step_moves_markers_and_records_velocities() {
    let mut coord = coordinator(SolverConfig::default(), 16, 12);
    let before = coord.lagrangian().positions.clone();
    let reports = coord.advance(0.0, DT).unwrap();
    let newton = reports[0].newton.as_ref().unwrap();
    eprintln!(
        "coupled step: {} iterations, residual {:.3e} -> {:.3e}",
        newton.iterations,
        newton.initial_residual(),
        newton.final_residual()
    );
    assert_eq!(newton.state, NewtonState::Converged);
    assert!(newton.iterations >= 1);

    let after = &coord.lagrangian().positions;
    let moved = after - &before;
    let velocities = coord.lagrangian().velocities.as_ref().unwrap();
    for (v, d) in velocities.iter().zip(moved.iter()) {
        approx::assert_relative_eq!(*v, *d / DT, epsilon = 1e-12, max_relative = 1e-10);
    }
    assert!(moved.iter().any(|d| d.abs() > 0.0), "markers in a moving fluid should move");
    assert_eq!(coord.time(), DT);
}

#[test]
fn fluid_only_mode_advances_markers_with_interpolated_velocity() {
    let config = SolverConfig::default().with_solve_mode(SolveMode::FluidOnly);
    let mut coord = coordinator(config, 16, 12);
    assert_eq!(coord.dof_map().unwrap().num_structure(), 0);
    let before = coord.lagrangian().positions.clone();
    coord.advance(0.0, DT).unwrap();
    let moved = &coord.lagrangian().positions - &before;
    assert!(moved.iter().any(|d| d.abs() > 0.0));
    assert!(moved.iter().all(|d| d.abs() < 0.1));
}

// ─────────────────────────────────────────────────────────────
//  Newton recovery paths
// ─────────────────────────────────────────────────────────────

/// Stiff tethers whose reported stiffness omits the tether term, so the
/// Newton direction badly overshoots.
struct LaggedTethers {
    anchors: Array2<f64>,
    stiffness: f64,
}

impl StructureModel for LaggedTethers {
    fn force(&self, x: &Array2<f64>) -> Array2<f64> {
        (&self.anchors - x) * self.stiffness
    }

    fn apply_stiffness(&self, x: &Array2<f64>, _dx: &Array2<f64>) -> Array2<f64> {
        Array2::zeros(x.raw_dim())
    }

    fn validate(&self, num_markers: usize) -> Result<(), IbError> {
        if self.anchors.nrows() != num_markers {
            return Err(IbError::ConfigurationError(format!(
                "{} anchors for {num_markers} markers",
                self.anchors.nrows()
            )));
        }
        Ok(())
    }
}

fn lagged_coordinator(config: SolverConfig) -> TimestepCoordinator {
    let grid = CartesianGrid::unit_square(16).unwrap();
    let structure = LaggedTethers {
        anchors: ring(8, 0.2001),
        stiffness: 1e5,
    };
    TimestepCoordinator::new(
        config,
        FluidParameters::default(),
        StaticHierarchy::new(grid.clone()),
        swirl(&grid),
        LagrangianState::new(ring(8, 0.2)).unwrap().with_velocities(),
        structure,
        cavity(),
    )
    .unwrap()
}

#[test]
fn growing_residual_is_halved_then_reported_as_divergence() {
    let config = SolverConfig {
        divergence_safeguard_ratio: 1.0,
        max_step_halvings: 1,
        ..SolverConfig::default()
    };
    let mut coord = lagged_coordinator(config);
    let fluid_before = coord.eulerian().clone();
    let markers_before = coord.lagrangian().clone();

    let err = coord.advance(0.0, DT).unwrap_err();
    eprintln!("lagged stiffness: {err}");
    match err {
        IbError::NonlinearDivergence { iteration, residual, previous, ratio } => {
            assert_eq!(iteration, 1);
            assert_eq!(ratio, 1.0);
            assert!(residual > previous, "{residual:.3e} should exceed {previous:.3e}");
        }
        other => panic!("expected NonlinearDivergence, got {other:?}"),
    }

    let report = coord.last_report().unwrap();
    assert_eq!(report.state, NewtonState::Diverged);
    assert_eq!(report.rejected_steps, 2, "full step and one halving");
    assert!(report.step_lengths.is_empty());
    assert_eq!(report.iterations, 0);
    assert_eq!(coord.eulerian(), &fluid_before);
    assert_eq!(coord.lagrangian(), &markers_before);
    assert_eq!(coord.time(), 0.0);
}

#[test]
fn unconverged_krylov_solve_is_retried_once_then_reported() {
    let config = SolverConfig {
        max_linear_iterations: 2,
        linear_rtol: 1e-12,
        fluid_solver: FluidSolverKind::Multigrid,
        multigrid_cycles: 1,
        ..SolverConfig::default()
    };
    let mut coord = coordinator(config, 16, 8);
    let fluid_before = coord.eulerian().clone();
    let markers_before = coord.lagrangian().clone();

    let err = coord.advance(0.0, DT).unwrap_err();
    eprintln!("starved krylov: {err}");
    match err {
        IbError::LinearSolveFailure { iterations, residual, target } => {
            assert!(iterations > 2 && iterations <= 4, "both attempts run: {iterations}");
            assert!(residual > target);
        }
        other => panic!("expected LinearSolveFailure, got {other:?}"),
    }

    let report = coord.last_report().unwrap();
    assert_eq!(report.state, NewtonState::Failed);
    assert!(report.state.is_terminal());
    assert!(report.linear_iterations.is_empty());
    assert_eq!(coord.eulerian(), &fluid_before);
    assert_eq!(coord.lagrangian(), &markers_before);
    assert_eq!(coord.steps_taken(), 0);
}

// ─────────────────────────────────────────────────────────────
//  Configuration
// ─────────────────────────────────────────────────────────────

#[test]
fn configuration_validation_rejects_bad_bounds() {
    let bad = [
        SolverConfig::default().with_tolerances(-1.0, 1e-12),
        SolverConfig::default().with_tolerances(0.0, 0.0),
        SolverConfig::default().with_tolerances(1.5, 1e-12),
        SolverConfig::default().with_linear_tolerances(0.0, 1e-14),
        SolverConfig::default().with_jacobian(JacobianMode::FiniteDifference { step: 0.0 }),
        SolverConfig::default().with_num_cycles(0),
        SolverConfig {
            krylov_restart: 0,
            ..SolverConfig::default()
        },
        SolverConfig {
            divergence_safeguard_ratio: 0.5,
            ..SolverConfig::default()
        },
        SolverConfig {
            multigrid_cycles: 0,
            ..SolverConfig::default().with_fluid_solver(FluidSolverKind::Multigrid)
        },
    ];
    for config in bad {
        let err = config.validate().unwrap_err();
        assert!(matches!(err, IbError::ConfigurationError(_)), "{config:?} gave {err:?}");
    }
    assert!(SolverConfig::default().validate().is_ok());
    assert!(SolverConfig::default().with_max_nonlinear_iterations(0).validate().is_ok());

    let grid = CartesianGrid::unit_square(8).unwrap();
    let result = TimestepCoordinator::new(
        SolverConfig::default().with_tolerances(-1.0, 0.0),
        FluidParameters::default(),
        StaticHierarchy::new(grid.clone()),
        EulerianState::zeros(&grid),
        LagrangianState::empty(),
        SpringNetwork::new(),
        WallBoundary::no_slip(),
    );
    assert!(matches!(result, Err(IbError::ConfigurationError(_))));

    let result = TimestepCoordinator::new(
        SolverConfig::default(),
        FluidParameters { density: 0.0, viscosity: 1.0 },
        StaticHierarchy::new(grid.clone()),
        EulerianState::zeros(&grid),
        LagrangianState::empty(),
        SpringNetwork::new(),
        WallBoundary::no_slip(),
    );
    assert!(matches!(result, Err(IbError::ConfigurationError(_))));
}

#[test]
fn structure_referring_to_missing_markers_is_rejected() {
    let grid = CartesianGrid::unit_square(8).unwrap();
    let build = |net: SpringNetwork| {
        TimestepCoordinator::new(
            SolverConfig::default(),
            FluidParameters::default(),
            StaticHierarchy::new(grid.clone()),
            swirl(&grid),
            LagrangianState::new(ring(3, 0.2)).unwrap(),
            net,
            cavity(),
        )
    };
    for net in [
        SpringNetwork::closed_ring(6, 10.0, 0.1),
        SpringNetwork::new().with_tether(3, [0.5, 0.5], 1.0),
        SpringNetwork::new().with_spring(1, 1, 1.0, 0.0),
    ] {
        let err = build(net).err().expect("invalid network accepted");
        eprintln!("{err}");
        assert!(matches!(err, IbError::ConfigurationError(_)), "unexpected error {err:?}");
    }
    assert!(build(SpringNetwork::closed_ring(3, 10.0, 0.1)).is_ok());
}

#[test]
fn state_on_a_different_grid_is_rejected() {
    let grid = CartesianGrid::unit_square(8).unwrap();
    let other = CartesianGrid::unit_square(10).unwrap();
    let result = TimestepCoordinator::new(
        SolverConfig::default(),
        FluidParameters::default(),
        StaticHierarchy::new(grid),
        EulerianState::zeros(&other),
        LagrangianState::empty(),
        SpringNetwork::new(),
        WallBoundary::no_slip(),
    );
    assert!(matches!(result, Err(IbError::GridMismatch(_))));
}

#[test]
fn snapshot_round_trips_through_json() {
    let config = SolverConfig::default()
        .with_tolerances(1e-9, 1e-13)
        .with_jacobian(JacobianMode::FiniteDifference { step: 1e-7 })
        .with_fluid_solver(FluidSolverKind::Multigrid)
        .with_num_cycles(2);
    let mut coord = coordinator(config, 8, 0).with_time(1.25);
    let snap = coord.config_snapshot();
    let json = snap.to_json().unwrap();
    eprintln!("{json}");
    let back = ConfigSnapshot::from_json(&json).unwrap();
    assert_eq!(back, snap);
    assert_eq!(back.time, 1.25);
    assert_eq!(back.format_version, ConfigSnapshot::FORMAT_VERSION);

    let mut restored = coordinator(SolverConfig::default(), 8, 0);
    restored.restore_config(back).unwrap();
    assert_eq!(restored.config(), coord.config());
    assert_eq!(restored.time(), 1.25);
    assert_eq!(restored.get_number_of_cycles(), 2);

    // Unknown format versions are refused.
    let mut future = coord.config_snapshot();
    future.format_version = 99;
    let err = ConfigSnapshot::from_json(&future.to_json().unwrap()).unwrap_err();
    assert!(matches!(err, IbError::ConfigurationError(_)));
    let err = ConfigSnapshot::from_json("{ not json").unwrap_err();
    assert!(matches!(err, IbError::Serialization(_)));

    coord.restore_config(coord.config_snapshot()).unwrap();
}

#[test]
fn restoring_a_snapshot_from_another_mode_is_rejected() {
    let fluid_only = coordinator(
        SolverConfig::default().with_solve_mode(SolveMode::FluidOnly),
        8,
        0,
    );
    let mut coupled = coordinator(SolverConfig::default(), 8, 0);
    let err = coupled.restore_config(fluid_only.config_snapshot()).unwrap_err();
    assert!(matches!(err, IbError::ConfigurationError(_)));
    assert_eq!(coupled.config().solve_mode, SolveMode::PositionAndFluid);
}

// ─────────────────────────────────────────────────────────────
//  Regridding
// ─────────────────────────────────────────────────────────────

#[test]
fn regrid_rebuilds_the_dof_map() {
    let mut coord = coordinator(SolverConfig::default(), 8, 4);
    let first = coord.dof_map().unwrap();
    assert_eq!(coord.registry().rebuild_count(), 1);

    // Same topology: the map is reused.
    coord.preprocess_integrate(0.0, DT, 1).unwrap();
    let again = coord.dof_map().unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(coord.registry().rebuild_count(), 1);

    let fine = CartesianGrid::unit_square(12).unwrap();
    coord.hierarchy_mut().regrid(fine.clone());
    coord.replace_fluid_state(swirl(&fine)).unwrap();
    coord.preprocess_integrate(0.0, DT, 1).unwrap();
    let rebuilt = coord.dof_map().unwrap();
    assert!(!Arc::ptr_eq(&first, &rebuilt));
    assert_eq!(coord.registry().rebuild_count(), 2);
    assert_eq!(rebuilt.grid().nx, 12);
    assert_eq!(rebuilt.len(), 11 * 12 + 12 * 11 + 12 * 12 + 2 * 4);

    // Stale fluid data on the old grid is refused.
    let coarse = CartesianGrid::unit_square(8).unwrap();
    assert!(matches!(
        coord.replace_fluid_state(swirl(&coarse)),
        Err(IbError::GridMismatch(_))
    ));

    coord.integrate(0.0, DT, 0).unwrap();
    coord.postprocess_integrate(0.0, DT, false, 1).unwrap();
    assert_eq!(coord.time(), DT);
}

#[test]
fn sub_cycles_reuse_the_step_start_state() {
    let config = SolverConfig::default()
        .with_tolerances(1e-8, 1e-9)
        .with_num_cycles(3);
    let mut coord = coordinator(config, 10, 0);
    let reports = coord.advance(0.0, DT).unwrap();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| !r.skipped));
    // Later cycles start from the committed iterate of the same step, so
    // they have (almost) nothing left to do.
    let first = reports[0].newton.as_ref().unwrap().initial_residual();
    let last = reports[2].newton.as_ref().unwrap().initial_residual();
    assert!(last < 1e-4 * first, "cycle 2 restarted from scratch: {last:.3e} vs {first:.3e}");

    let err = coord.integrate(DT, 2.0 * DT, 1).unwrap_err();
    assert!(matches!(err, IbError::ConfigurationError(_)));
}

#[test]
fn body_force_closure_is_accepted() {
    let mut coord = coordinator(SolverConfig::default(), 8, 0)
        .with_body_force(FnBodyForce(|axis: Axis, _x: f64, y: f64, _t: f64| match axis {
            Axis::X => y,
            Axis::Y => 0.0,
        }));
    coord.advance(0.0, DT).unwrap();
    assert_eq!(coord.steps_taken(), 1);
}

// ─────────────────────────────────────────────────────────────
//  Pluggable collaborators
// ─────────────────────────────────────────────────────────────

/// Kernel interaction that counts force spreads.
struct CountingKernel {
    spreads: Arc<AtomicUsize>,
}

impl InterpolationSpreadOperator for CountingKernel {
    fn interpolate(
        &self,
        grid: &CartesianGrid,
        u: &Array2<f64>,
        v: &Array2<f64>,
        x: &Array2<f64>,
    ) -> Array2<f64> {
        KernelInteraction.interpolate(grid, u, v, x)
    }

    fn spread(&self, map: &DofIndexMap, forces: &Array2<f64>, x: &Array2<f64>, out: &mut [f64]) {
        self.spreads.fetch_add(1, Ordering::SeqCst);
        KernelInteraction.spread(map, forces, x, out)
    }

    fn interpolate_derivative(
        &self,
        grid: &CartesianGrid,
        u: &Array2<f64>,
        v: &Array2<f64>,
        x: &Array2<f64>,
        dx: &Array2<f64>,
    ) -> Array2<f64> {
        KernelInteraction.interpolate_derivative(grid, u, v, x, dx)
    }

    fn spread_derivative(
        &self,
        map: &DofIndexMap,
        forces: &Array2<f64>,
        x: &Array2<f64>,
        dx: &Array2<f64>,
        out: &mut [f64],
    ) {
        KernelInteraction.spread_derivative(map, forces, x, dx, out)
    }
}

#[test]
fn custom_interaction_is_used_for_spreading() {
    let spreads = Arc::new(AtomicUsize::new(0));
    let mut custom = coordinator(SolverConfig::default(), 12, 6).with_interaction(CountingKernel {
        spreads: Arc::clone(&spreads),
    });
    let mut stock = coordinator(SolverConfig::default(), 12, 6);
    custom.advance(0.0, DT).unwrap();
    stock.advance(0.0, DT).unwrap();

    eprintln!("spreads: {}", spreads.load(Ordering::SeqCst));
    assert!(spreads.load(Ordering::SeqCst) > 0);
    assert_eq!(custom.eulerian(), stock.eulerian());
    assert_eq!(custom.lagrangian(), stock.lagrangian());
}

/// Shared-memory reductions between two worker threads.
#[derive(Debug)]
struct Exchange {
    slots: Mutex<[f64; 2]>,
    barrier: Barrier,
}

#[derive(Debug)]
struct ThreadWorker {
    rank: usize,
    exchange: Arc<Exchange>,
}

impl ThreadWorker {
    fn reduce(&self, local: f64, op: fn(f64, f64) -> f64) -> f64 {
        self.exchange.slots.lock().unwrap()[self.rank] = local;
        self.exchange.barrier.wait();
        let [a, b] = *self.exchange.slots.lock().unwrap();
        self.exchange.barrier.wait();
        op(a, b)
    }
}

impl Communicator for ThreadWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        2
    }

    fn sum(&self, local: f64) -> f64 {
        self.reduce(local, |a, b| a + b)
    }

    fn max(&self, local: f64) -> f64 {
        self.reduce(local, f64::max)
    }

    fn all(&self, local: bool) -> bool {
        self.reduce(if local { 1.0 } else { 0.0 }, f64::min) == 1.0
    }

    fn barrier(&self) {
        self.exchange.barrier.wait();
    }
}

#[test]
fn two_workers_agree_with_the_serial_step() {
    let exchange = Arc::new(Exchange {
        slots: Mutex::new([0.0; 2]),
        barrier: Barrier::new(2),
    });
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|rank| {
                let exchange = Arc::clone(&exchange);
                scope.spawn(move || {
                    let comm = Arc::new(ThreadWorker { rank, exchange });
                    let mut coord =
                        coordinator(SolverConfig::default(), 12, 6).with_communicator(comm);
                    let owned = coord.dof_map().unwrap().owned_range();
                    let reports = coord.advance(0.0, DT).unwrap();
                    let iterations = reports[0].newton.as_ref().unwrap().iterations;
                    (owned, iterations, coord.eulerian().clone(), coord.lagrangian().clone())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut serial = coordinator(SolverConfig::default(), 12, 6);
    let total = serial.dof_map().unwrap().len();
    let serial_its = serial.advance(0.0, DT).unwrap()[0].newton.as_ref().unwrap().iterations;

    let (r0, its0, fluid0, markers0) = &results[0];
    let (r1, its1, fluid1, markers1) = &results[1];
    eprintln!("owned {r0:?} and {r1:?} of {total}; newton its {its0}/{its1}/{serial_its}");
    assert_eq!(r0.start, 0);
    assert_eq!(r0.end, r1.start);
    assert_eq!(r1.end, total);

    // Both workers see identical reductions, so they stay bit-identical.
    assert_eq!(its0, its1);
    assert_eq!(fluid0, fluid1);
    assert_eq!(markers0, markers1);

    // Partial sums only reorder floating-point additions.
    for (a, b) in fluid0.u.iter().zip(serial.eulerian().u.iter()) {
        approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
    }
    for (a, b) in fluid0.v.iter().zip(serial.eulerian().v.iter()) {
        approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
    }
    for (a, b) in markers0.positions.iter().zip(serial.lagrangian().positions.iter()) {
        approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-11);
    }
}
