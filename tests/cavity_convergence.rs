//! Second-order spatial convergence on a manufactured lid-driven cavity.
//!
//! Stream function
//!
//!     ψ(x, y) = sin²(πx) · g(y),   g(y) = 3y² − 5y⁴ + 2y⁵
//!
//! gives u = ψ_y, v = −ψ_x, which vanishes on the side and bottom walls and
//! reduces to u(x, 1) = g'(1) sin²(πx) = −4 sin²(πx) on the lid. With
//! p = 0 the body force f = −μΔu makes it a steady Stokes solution, so one
//! backward-Euler step started from the exact field stays on it up to the
//! discretization error.
//!
//! A single tethered marker sits at the interior stagnation point
//! (½, y*), g'(y*) = 0, and must stay put.

use std::f64::consts::PI;

use ndarray::Array2;

use ibimplicit::boundary::{FnBodyForce, WallBoundary};
use ibimplicit::config::{FluidParameters, SolverConfig};
use ibimplicit::fields::EulerianState;
use ibimplicit::grid::{CartesianGrid, StaticHierarchy};
use ibimplicit::structure::{LagrangianState, SpringNetwork};
use ibimplicit::types::Axis;
use ibimplicit::TimestepCoordinator;

// ─────────────────────────────────────────────────────────────
//  Manufactured solution
// ─────────────────────────────────────────────────────────────

const MU: f64 = 1.0;
const DT: f64 = 1e-3;
/// ρ/Δt = 0.1 keeps the step close to steady Stokes.
const RHO: f64 = 1e-4;

fn s0(x: f64) -> f64 {
    (PI * x).sin().powi(2)
}
fn s1(x: f64) -> f64 {
    PI * (2.0 * PI * x).sin()
}
fn s2(x: f64) -> f64 {
    2.0 * PI * PI * (2.0 * PI * x).cos()
}
fn s3(x: f64) -> f64 {
    -4.0 * PI.powi(3) * (2.0 * PI * x).sin()
}

fn g0(y: f64) -> f64 {
    3.0 * y * y - 5.0 * y.powi(4) + 2.0 * y.powi(5)
}
fn g1(y: f64) -> f64 {
    6.0 * y - 20.0 * y.powi(3) + 10.0 * y.powi(4)
}
fn g2(y: f64) -> f64 {
    6.0 - 60.0 * y * y + 40.0 * y.powi(3)
}
fn g3(y: f64) -> f64 {
    -120.0 * y + 120.0 * y * y
}

fn exact_u(x: f64, y: f64) -> f64 {
    s0(x) * g1(y)
}

fn exact_v(x: f64, y: f64) -> f64 {
    -s1(x) * g0(y)
}

/// `f = −μΔu` with `Δu = S''g' + Sg'''` and `Δv = −(S'''g + S'g'')`.
fn forcing(axis: Axis, x: f64, y: f64, _t: f64) -> f64 {
    match axis {
        Axis::X => -MU * (s2(x) * g1(y) + s0(x) * g3(y)),
        Axis::Y => MU * (s3(x) * g0(y) + s1(x) * g2(y)),
    }
}

/// Interior root of `g'`, where the exact velocity vanishes on `x = ½`.
fn stagnation_height() -> f64 {
    let mut y = 0.67;
    for _ in 0..50 {
        let g2y = g2(y);
        y -= g1(y) / g2y;
    }
    y
}

// ─────────────────────────────────────────────────────────────
//  Solve and measure
// ─────────────────────────────────────────────────────────────

struct Outcome {
    rms_error: f64,
    marker_shift: f64,
    iterations: usize,
}

fn solve(n: usize) -> Outcome {
    let grid = CartesianGrid::unit_square(n).unwrap();
    let ys = stagnation_height();
    let markers = Array2::from_shape_vec((1, 2), vec![0.5, ys]).unwrap();
    let config = SolverConfig::default()
        .with_tolerances(1e-10, 1e-9)
        .with_max_nonlinear_iterations(20);

    let mut coord = TimestepCoordinator::new(
        config,
        FluidParameters { density: RHO, viscosity: MU },
        StaticHierarchy::new(grid.clone()),
        EulerianState::from_fn(&grid, exact_u, exact_v, |_, _| 0.0),
        LagrangianState::new(markers.clone()).unwrap(),
        SpringNetwork::new().with_tether(0, [0.5, ys], 10.0),
        WallBoundary::lid_driven(|x, _t| g1(1.0) * s0(x)),
    )
    .unwrap()
    .with_body_force(FnBodyForce(forcing));

    let reports = coord.advance(0.0, DT).unwrap();
    let iterations = reports[0].newton.as_ref().map_or(0, |r| r.iterations);

    let g = grid.ghost_width;
    let state = coord.eulerian();
    let mut sum = 0.0;
    let mut count = 0usize;
    for j in 0..grid.ny {
        for i in 1..grid.nx {
            let [x, y] = grid.u_position(i as isize, j as isize);
            let e = state.u[[i + g, j + g]] - exact_u(x, y);
            sum += e * e;
            count += 1;
        }
    }
    for j in 1..grid.ny {
        for i in 0..grid.nx {
            let [x, y] = grid.v_position(i as isize, j as isize);
            let e = state.v[[i + g, j + g]] - exact_v(x, y);
            sum += e * e;
            count += 1;
        }
    }
    let shift = &coord.lagrangian().positions - &markers;
    Outcome {
        rms_error: (sum / count as f64).sqrt(),
        marker_shift: shift.iter().fold(0.0_f64, |m, d| m.max(d.abs())),
        iterations,
    }
}

// ─────────────────────────────────────────────────────────────
//  Tests
// ─────────────────────────────────────────────────────────────

#[test]
fn stagnation_point_is_a_root() {
    let ys = stagnation_height();
    assert!(ys > 0.6 && ys < 0.7);
    approx::assert_abs_diff_eq!(g1(ys), 0.0, epsilon = 1e-12);
    approx::assert_abs_diff_eq!(exact_u(0.5, ys), 0.0, epsilon = 1e-12);
    approx::assert_abs_diff_eq!(exact_v(0.5, ys), 0.0, epsilon = 1e-12);
}

#[test]
fn velocity_error_is_second_order() {
    let coarse = solve(16);
    let fine = solve(32);
    let ratio = coarse.rms_error / fine.rms_error;
    eprintln!("──────────────────────────────────────────────");
    eprintln!(
        "n=16: rms {:.3e}, marker shift {:.3e}, {} newton its",
        coarse.rms_error, coarse.marker_shift, coarse.iterations
    );
    eprintln!(
        "n=32: rms {:.3e}, marker shift {:.3e}, {} newton its",
        fine.rms_error, fine.marker_shift, fine.iterations
    );
    eprintln!("ratio {ratio:.3}");
    eprintln!("──────────────────────────────────────────────");

    assert!(coarse.rms_error > 0.0);
    assert!(ratio > 3.0 && ratio < 5.0, "expected ~4x error reduction, got {ratio:.3}");
    assert!(coarse.marker_shift < 1e-5, "marker drifted by {:.3e}", coarse.marker_shift);
    assert!(fine.marker_shift < 1e-5, "marker drifted by {:.3e}", fine.marker_shift);
    assert!(coarse.iterations <= 20 && fine.iterations <= 20);
}
