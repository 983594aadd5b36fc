//! Eulerian–Lagrangian coupling: velocity interpolation to markers and force
//! spreading to faces with a regularized delta kernel.

use ndarray::Array2;
use rayon::prelude::*;

use crate::dof::DofIndexMap;
use crate::grid::CartesianGrid;
use crate::types::Axis;

/// Maps quantities between markers and grid faces.
///
/// `interpolate` reads ghost-filled face arrays; `spread` accumulates into
/// the velocity unknowns of a composite-layout slice and ignores faces
/// that are not unknowns. The `_derivative` variants give the first-order
/// change caused by moving the markers by `dx` with the Eulerian data held
/// fixed.
pub trait InterpolationSpreadOperator: Send + Sync {
    fn interpolate(
        &self,
        grid: &CartesianGrid,
        u: &Array2<f64>,
        v: &Array2<f64>,
        x: &Array2<f64>,
    ) -> Array2<f64>;

    fn spread(&self, map: &DofIndexMap, forces: &Array2<f64>, x: &Array2<f64>, out: &mut [f64]);

    fn interpolate_derivative(
        &self,
        grid: &CartesianGrid,
        u: &Array2<f64>,
        v: &Array2<f64>,
        x: &Array2<f64>,
        dx: &Array2<f64>,
    ) -> Array2<f64>;

    fn spread_derivative(
        &self,
        map: &DofIndexMap,
        forces: &Array2<f64>,
        x: &Array2<f64>,
        dx: &Array2<f64>,
        out: &mut [f64],
    );
}

// ─────────────────────────────────────────────────────────────
//  Cosine kernel
// ─────────────────────────────────────────────────────────────

/// 1D four-point cosine kernel, `φ(r) = ¼(1 + cos(πr/2))` on `|r| < 2`.
pub fn cosine_kernel(r: f64) -> f64 {
    if r.abs() >= 2.0 {
        0.0
    } else {
        0.25 * (1.0 + (std::f64::consts::FRAC_PI_2 * r).cos())
    }
}

pub fn cosine_kernel_derivative(r: f64) -> f64 {
    if r.abs() >= 2.0 {
        0.0
    } else {
        -std::f64::consts::PI / 8.0 * (std::f64::consts::FRAC_PI_2 * r).sin()
    }
}

/// Tensor-product weights of one marker on one face family.
struct Stencil {
    i0: isize,
    j0: isize,
    wx: [f64; 4],
    wy: [f64; 4],
    dwx: [f64; 4],
    dwy: [f64; 4],
}

impl Stencil {
    fn new(grid: &CartesianGrid, axis: Axis, pos: [f64; 2]) -> Self {
        // Face offsets: x-faces sit on cell edges in x and centres in y.
        let (ox, oy) = match axis {
            Axis::X => (0.0, 0.5),
            Axis::Y => (0.5, 0.0),
        };
        let sx = (pos[0] - grid.origin[0]) / grid.dx - ox;
        let sy = (pos[1] - grid.origin[1]) / grid.dy - oy;
        let i0 = sx.floor() as isize - 1;
        let j0 = sy.floor() as isize - 1;
        let mut st = Self {
            i0,
            j0,
            wx: [0.0; 4],
            wy: [0.0; 4],
            dwx: [0.0; 4],
            dwy: [0.0; 4],
        };
        for m in 0..4 {
            let rx = sx - (i0 + m as isize) as f64;
            let ry = sy - (j0 + m as isize) as f64;
            st.wx[m] = cosine_kernel(rx);
            st.wy[m] = cosine_kernel(ry);
            st.dwx[m] = cosine_kernel_derivative(rx) / grid.dx;
            st.dwy[m] = cosine_kernel_derivative(ry) / grid.dy;
        }
        st
    }

    /// `(i, j, w, ∂w/∂X, ∂w/∂Y)` for every stencil point.
    fn points(&self) -> impl Iterator<Item = (isize, isize, f64, f64, f64)> + '_ {
        (0..4).flat_map(move |b| {
            (0..4).map(move |a| {
                (
                    self.i0 + a as isize,
                    self.j0 + b as isize,
                    self.wx[a] * self.wy[b],
                    self.dwx[a] * self.wy[b],
                    self.wx[a] * self.dwy[b],
                )
            })
        })
    }
}

fn ghosted(arr: &Array2<f64>, g: usize, i: isize, j: isize) -> Option<f64> {
    let (ii, jj) = (i + g as isize, j + g as isize);
    if ii < 0 || jj < 0 {
        return None;
    }
    arr.get([ii as usize, jj as usize]).copied()
}

fn marker(x: &Array2<f64>, k: usize) -> [f64; 2] {
    [x[[k, 0]], x[[k, 1]]]
}

fn to_array(rows: Vec<[f64; 2]>) -> Array2<f64> {
    let mut out = Array2::zeros((rows.len(), 2));
    for (k, r) in rows.iter().enumerate() {
        out[[k, 0]] = r[0];
        out[[k, 1]] = r[1];
    }
    out
}

/// Cosine-kernel interaction on a uniform MAC grid.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelInteraction;

impl InterpolationSpreadOperator for KernelInteraction {
    fn interpolate(
        &self,
        grid: &CartesianGrid,
        u: &Array2<f64>,
        v: &Array2<f64>,
        x: &Array2<f64>,
    ) -> Array2<f64> {
        let g = grid.ghost_width;
        let rows: Vec<[f64; 2]> = (0..x.nrows())
            .into_par_iter()
            .map(|k| {
                let pos = marker(x, k);
                let mut out = [0.0; 2];
                for (c, (axis, arr)) in [(Axis::X, u), (Axis::Y, v)].into_iter().enumerate() {
                    let st = Stencil::new(grid, axis, pos);
                    for (i, j, w, _, _) in st.points() {
                        if let Some(val) = ghosted(arr, g, i, j) {
                            out[c] += w * val;
                        }
                    }
                }
                out
            })
            .collect();
        to_array(rows)
    }

    fn spread(&self, map: &DofIndexMap, forces: &Array2<f64>, x: &Array2<f64>, out: &mut [f64]) {
        let grid = map.grid();
        let inv_vol = 1.0 / grid.cell_volume();
        for k in 0..x.nrows() {
            let pos = marker(x, k);
            for (c, axis) in [Axis::X, Axis::Y].into_iter().enumerate() {
                let fk = forces[[k, c]] * inv_vol;
                let st = Stencil::new(grid, axis, pos);
                for (i, j, w, _, _) in st.points() {
                    if let Some(idx) = map.face_index(axis, i, j) {
                        out[idx] += w * fk;
                    }
                }
            }
        }
    }

    fn interpolate_derivative(
        &self,
        grid: &CartesianGrid,
        u: &Array2<f64>,
        v: &Array2<f64>,
        x: &Array2<f64>,
        dx: &Array2<f64>,
    ) -> Array2<f64> {
        let g = grid.ghost_width;
        let rows: Vec<[f64; 2]> = (0..x.nrows())
            .into_par_iter()
            .map(|k| {
                let pos = marker(x, k);
                let d = marker(dx, k);
                let mut out = [0.0; 2];
                for (c, (axis, arr)) in [(Axis::X, u), (Axis::Y, v)].into_iter().enumerate() {
                    let st = Stencil::new(grid, axis, pos);
                    for (i, j, _, wx, wy) in st.points() {
                        if let Some(val) = ghosted(arr, g, i, j) {
                            out[c] += (wx * d[0] + wy * d[1]) * val;
                        }
                    }
                }
                out
            })
            .collect();
        to_array(rows)
    }

    fn spread_derivative(
        &self,
        map: &DofIndexMap,
        forces: &Array2<f64>,
        x: &Array2<f64>,
        dx: &Array2<f64>,
        out: &mut [f64],
    ) {
        let grid = map.grid();
        let inv_vol = 1.0 / grid.cell_volume();
        for k in 0..x.nrows() {
            let pos = marker(x, k);
            let d = marker(dx, k);
            for (c, axis) in [Axis::X, Axis::Y].into_iter().enumerate() {
                let fk = forces[[k, c]] * inv_vol;
                let st = Stencil::new(grid, axis, pos);
                for (i, j, _, wx, wy) in st.points() {
                    if let Some(idx) = map.face_index(axis, i, j) {
                        out[idx] += (wx * d[0] + wy * d[1]) * fk;
                    }
                }
            }
        }
    }
}
