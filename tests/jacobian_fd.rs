//! Analytic Jacobian-vector products against finite differences of the
//! residual.
//!
//! A ring of eight markers joined by springs (one marker also tethered)
//! sits inside a lid-driven cavity with a smooth, non-trivial fluid state.
//! For a fixed direction `v`
//!
//!     J v  ≈  [ R(x + εv) − R(x) ] / ε
//!
//! must hold to O(ε) for ε = 1e-3, 1e-4, 1e-5, in both solve modes. The
//! finite-difference `JacobianMode` is checked against the analytic one.

use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::Array2;

use ibimplicit::boundary::{FnBodyForce, WallBoundary};
use ibimplicit::comm::{self, SerialCommunicator};
use ibimplicit::config::{FluidParameters, FluidSolverKind, JacobianMode, SolveMode};
use ibimplicit::dof::{CompositeVector, DofIndexMap};
use ibimplicit::fields::EulerianState;
use ibimplicit::grid::CartesianGrid;
use ibimplicit::interaction::KernelInteraction;
use ibimplicit::jacobian::JacobianAction;
use ibimplicit::operator::OperatorCoefficients;
use ibimplicit::residual::{CompositeResidualEvaluator, StepContext};
use ibimplicit::stokes::{tangential_kinds, FluidBlock};
use ibimplicit::structure::{LagrangianState, SpringNetwork};
use ibimplicit::types::Axis;

// ─────────────────────────────────────────────────────────────
//  Helpers: a small coupled problem
// ─────────────────────────────────────────────────────────────

const N: usize = 16;
const MARKERS: usize = 8;
const DT: f64 = 0.01;

fn ring(radius: f64, wobble: f64) -> Array2<f64> {
    let mut x = Array2::zeros((MARKERS, 2));
    for k in 0..MARKERS {
        let th = 2.0 * PI * k as f64 / MARKERS as f64;
        let r = radius * (1.0 + wobble * (3.0 * th).sin());
        x[[k, 0]] = 0.5 + r * th.cos();
        x[[k, 1]] = 0.5 + r * th.sin();
    }
    x
}

fn structure() -> SpringNetwork {
    let anchor = ring(0.2, 0.0);
    SpringNetwork::closed_ring(MARKERS, 5.0, 0.1)
        .with_tether(0, [anchor[[0, 0]], anchor[[0, 1]]], 2.0)
}

fn forcing(axis: Axis, x: f64, y: f64, _t: f64) -> f64 {
    match axis {
        Axis::X => (PI * x).sin() * (PI * y).cos(),
        Axis::Y => -0.5 * x * y,
    }
}

/// Deterministic test direction; marker entries scaled to grid size.
fn test_direction(map: &DofIndexMap) -> Vec<f64> {
    let dx = map.grid().dx;
    let s = map.structure_range();
    (0..map.len())
        .map(|i| {
            let v = ((i * 7919) % 101) as f64 / 101.0 - 0.5;
            if s.contains(&i) { v * dx } else { v }
        })
        .collect()
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

struct Errors {
    jv_norm: f64,
    fd: Vec<(f64, f64)>,
    fd_mode: f64,
}

fn jacobian_errors(mode: SolveMode) -> Errors {
    let grid = CartesianGrid::unit_square(N).unwrap();
    let comm = SerialCommunicator;
    let map = Arc::new(DofIndexMap::new(&grid, MARKERS, mode, &comm));
    let boundary = WallBoundary::lid_driven(|x, _t| (PI * x).sin());
    let structure = structure();
    let interaction = KernelInteraction;
    let force = FnBodyForce(forcing);
    let fluid = FluidParameters { density: 1.0, viscosity: 0.5 };

    let previous = EulerianState::from_fn(
        &grid,
        |x, y| 0.3 * (PI * x).sin() * (PI * y).cos(),
        |x, y| -0.3 * (PI * x).cos() * (PI * y).sin(),
        |_, _| 0.0,
    );
    let previous_positions = ring(0.2, 0.0);
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
    let block = FluidBlock::new(
        Arc::clone(&map),
        Arc::new(SerialCommunicator),
        tangential_kinds(&boundary),
        coeffs,
        FluidSolverKind::Direct,
        1,
    )
    .unwrap();

    // Linearization point: a different smooth flow and a deformed ring.
    let bar = EulerianState::from_fn(
        &grid,
        |x, y| 0.8 * (2.0 * PI * x).sin() * (PI * y).sin() + 0.2 * y,
        |x, y| 0.5 * (PI * x).sin() * (2.0 * PI * y).cos(),
        |x, y| x - y,
    );
    let markers = LagrangianState::new(ring(0.2, 0.15)).unwrap();
    let x = map.gather(&bar, &markers).unwrap();
    let mut r0 = CompositeVector::zeros(&map);
    evaluator.evaluate(&x, &mut r0).unwrap();
    let lin = evaluator.linearize(&x, &r0).unwrap();

    let v = test_direction(&map);
    let mut jv = vec![0.0; map.len()];
    JacobianAction::new(&evaluator, &block, &lin, JacobianMode::Analytic)
        .unwrap()
        .apply(&v, &mut jv)
        .unwrap();

    let mut fd = Vec::new();
    let mut rp = CompositeVector::zeros(&map);
    for eps in [1e-3, 1e-4, 1e-5] {
        let mut xp = x.clone();
        for (a, b) in xp.as_mut_slice().iter_mut().zip(&v) {
            *a += eps * b;
        }
        evaluator.evaluate(&xp, &mut rp).unwrap();
        let diff: Vec<f64> = rp
            .as_slice()
            .iter()
            .zip(r0.as_slice())
            .zip(&jv)
            .map(|((a, b), j)| (a - b) / eps - j)
            .collect();
        fd.push((eps, norm(&diff)));
    }

    let mut jv_fd = vec![0.0; map.len()];
    JacobianAction::new(&evaluator, &block, &lin, JacobianMode::FiniteDifference { step: 1e-7 })
        .unwrap()
        .apply(&v, &mut jv_fd)
        .unwrap();
    let diff: Vec<f64> = jv_fd.iter().zip(&jv).map(|(a, b)| a - b).collect();

    Errors {
        jv_norm: norm(&jv),
        fd,
        fd_mode: norm(&diff),
    }
}

fn report(label: &str, e: &Errors) {
    eprintln!("──────────────────────────────────────────────");
    eprintln!("Jacobian check ({label}), |Jv| = {:.3e}", e.jv_norm);
    for (eps, err) in &e.fd {
        eprintln!("  eps = {eps:.0e}: |Jv - fd| = {err:.3e}  (rel {:.3e})", err / e.jv_norm);
    }
    eprintln!("  FiniteDifference mode: rel {:.3e}", e.fd_mode / e.jv_norm);
    eprintln!("──────────────────────────────────────────────");
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[test]
fn analytic_jacobian_matches_fd_with_position_unknowns() {
    let e = jacobian_errors(SolveMode::PositionAndFluid);
    report("positions and fluid", &e);
    assert!(e.jv_norm > 0.0);
    for &(eps, err) in &e.fd {
        assert!(
            err / e.jv_norm <= 10.0 * eps,
            "error {err:.3e} at eps {eps:.0e} is not O(eps)"
        );
    }
    // Truncation dominates here, so the error must shrink with eps.
    for w in e.fd.windows(2) {
        assert!(
            w[1].1 < 0.5 * w[0].1,
            "fd error did not decrease: {:.3e} -> {:.3e}",
            w[0].1,
            w[1].1
        );
    }
}

#[test]
fn analytic_jacobian_matches_fd_fluid_only() {
    let e = jacobian_errors(SolveMode::FluidOnly);
    report("fluid only", &e);
    assert!(e.jv_norm > 0.0);
    for &(eps, err) in &e.fd {
        assert!(
            err / e.jv_norm <= 10.0 * eps,
            "error {err:.3e} at eps {eps:.0e} is not O(eps)"
        );
    }
}

#[test]
fn finite_difference_mode_agrees_with_analytic() {
    for mode in [SolveMode::PositionAndFluid, SolveMode::FluidOnly] {
        let e = jacobian_errors(mode);
        let rel = e.fd_mode / e.jv_norm;
        assert!(rel < 1e-5, "{mode:?}: FD Jacobian off by {rel:.3e}");
    }
}

#[test]
fn zero_direction_gives_zero_action() {
    let grid = CartesianGrid::unit_square(8).unwrap();
    let comm = SerialCommunicator;
    let map = Arc::new(DofIndexMap::new(&grid, 0, SolveMode::PositionAndFluid, &comm));
    let boundary = WallBoundary::no_slip();
    let structure = SpringNetwork::new();
    let interaction = KernelInteraction;
    let previous = EulerianState::zeros(&grid);
    let previous_positions = Array2::zeros((0, 2));
    let ctx = StepContext {
        map: Arc::clone(&map),
        comm: &comm,
        boundary: &boundary,
        body_force: None,
        structure: &structure,
        interaction: &interaction,
        fluid: FluidParameters::default(),
        new_time: DT,
        dt: DT,
        previous: &previous,
        previous_positions: &previous_positions,
    };
    let evaluator = CompositeResidualEvaluator::new(ctx).unwrap();
    let block = FluidBlock::new(
        Arc::clone(&map),
        Arc::new(SerialCommunicator),
        tangential_kinds(&boundary),
        OperatorCoefficients { dt: DT, density: 1.0, viscosity: 1.0 },
        FluidSolverKind::Direct,
        1,
    )
    .unwrap();
    let x = CompositeVector::zeros(&map);
    let mut r = CompositeVector::zeros(&map);
    evaluator.evaluate(&x, &mut r).unwrap();
    let lin = evaluator.linearize(&x, &r).unwrap();
    let mode = JacobianMode::FiniteDifference { step: 1e-7 };
    let jac = JacobianAction::new(&evaluator, &block, &lin, mode).unwrap();

    let v = vec![0.0; map.len()];
    let mut out = vec![1.0; map.len()];
    jac.apply(&v, &mut out).unwrap();
    assert!(out.iter().all(|&o| o == 0.0));
    assert_eq!(comm::norm(&comm, &map.owned_range(), &out), 0.0);
}
