//! Global unknown numbering and the composite vector built on it.
//!
//! Layout of a composite vector:
//!
//! ```text
//! [ u interior faces | v interior faces | p cells | X markers (x0,y0,x1,y1,…) ]
//! ```
//!
//! Interior x-faces are `i ∈ 1..nx`, `j ∈ 0..ny`; the faces on the left and
//! right walls carry prescribed data and are not unknowns. Likewise for
//! y-faces. The marker block exists only when positions are unknowns.

use std::ops::Range;
use std::sync::Arc;

use ndarray::Array2;

use crate::comm::{self, Communicator};
use crate::config::SolveMode;
use crate::fields::VelocityPressureFieldAccessor;
use crate::grid::CartesianGrid;
use crate::structure::StructureStateAccessor;
use crate::types::{Axis, IbError};

/// Immutable numbering of every unknown in one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct DofIndexMap {
    grid: CartesianGrid,
    num_markers: usize,
    mode: SolveMode,
    n_u: usize,
    n_v: usize,
    n_p: usize,
    n_x: usize,
    /// Contiguous ownership range per worker.
    partition: Vec<Range<usize>>,
    rank: usize,
}

impl DofIndexMap {
    pub fn new(
        grid: &CartesianGrid,
        num_markers: usize,
        mode: SolveMode,
        comm: &dyn Communicator,
    ) -> Self {
        let n_u = (grid.nx - 1) * grid.ny;
        let n_v = grid.nx * (grid.ny - 1);
        let n_p = grid.nx * grid.ny;
        let n_x = match mode {
            SolveMode::PositionAndFluid => 2 * num_markers,
            SolveMode::FluidOnly => 0,
        };
        let total = n_u + n_v + n_p + n_x;
        let workers = comm.size().max(1);
        let partition = (0..workers)
            .map(|r| (r * total / workers)..((r + 1) * total / workers))
            .collect();
        Self {
            grid: grid.clone(),
            num_markers,
            mode,
            n_u,
            n_v,
            n_p,
            n_x,
            partition,
            rank: comm.rank(),
        }
    }

    pub fn grid(&self) -> &CartesianGrid {
        &self.grid
    }

    pub fn mode(&self) -> SolveMode {
        self.mode
    }

    pub fn num_markers(&self) -> usize {
        self.num_markers
    }

    pub fn len(&self) -> usize {
        self.n_u + self.n_v + self.n_p + self.n_x
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_velocity(&self) -> usize {
        self.n_u + self.n_v
    }

    /// Velocity plus pressure unknowns.
    pub fn num_fluid(&self) -> usize {
        self.n_u + self.n_v + self.n_p
    }

    pub fn num_structure(&self) -> usize {
        self.n_x
    }

    pub fn velocity_range(&self, axis: Axis) -> Range<usize> {
        match axis {
            Axis::X => 0..self.n_u,
            Axis::Y => self.n_u..self.n_u + self.n_v,
        }
    }

    pub fn pressure_range(&self) -> Range<usize> {
        let s = self.n_u + self.n_v;
        s..s + self.n_p
    }

    pub fn fluid_range(&self) -> Range<usize> {
        0..self.num_fluid()
    }

    pub fn structure_range(&self) -> Range<usize> {
        let s = self.num_fluid();
        s..s + self.n_x
    }

    /// Range owned by this worker.
    pub fn owned_range(&self) -> Range<usize> {
        self.partition[self.rank].clone()
    }

    pub fn partition(&self) -> &[Range<usize>] {
        &self.partition
    }

    /// Global index of interior x-face `(i, j)`, `1 ≤ i < nx`.
    pub fn u_index(&self, i: usize, j: usize) -> Option<usize> {
        if i == 0 || i >= self.grid.nx || j >= self.grid.ny {
            return None;
        }
        Some((i - 1) + (self.grid.nx - 1) * j)
    }

    /// Global index of interior y-face `(i, j)`, `1 ≤ j < ny`.
    pub fn v_index(&self, i: usize, j: usize) -> Option<usize> {
        if i >= self.grid.nx || j == 0 || j >= self.grid.ny {
            return None;
        }
        Some(self.n_u + i + self.grid.nx * (j - 1))
    }

    /// Signed-index variant used by kernel stencils that may leave the domain.
    pub fn face_index(&self, axis: Axis, i: isize, j: isize) -> Option<usize> {
        if i < 0 || j < 0 {
            return None;
        }
        match axis {
            Axis::X => self.u_index(i as usize, j as usize),
            Axis::Y => self.v_index(i as usize, j as usize),
        }
    }

    pub fn p_index(&self, i: usize, j: usize) -> Option<usize> {
        if i >= self.grid.nx || j >= self.grid.ny {
            return None;
        }
        Some(self.n_u + self.n_v + i + self.grid.nx * j)
    }

    /// Global index of coordinate `d` of marker `k`.
    pub fn marker_index(&self, k: usize, d: usize) -> Option<usize> {
        if self.n_x == 0 || k >= self.num_markers || d > 1 {
            return None;
        }
        Some(self.num_fluid() + 2 * k + d)
    }

    /// Copy the unknowns out of the field and structure states.
    pub fn gather(
        self: &Arc<Self>,
        fluid: &dyn VelocityPressureFieldAccessor,
        structure: &dyn StructureStateAccessor,
    ) -> Result<CompositeVector, IbError> {
        self.check_grid(fluid.grid())?;
        let mut out = CompositeVector::zeros(self);
        self.gather_fluid(fluid, out.as_mut_slice());
        if self.mode == SolveMode::PositionAndFluid {
            let x = structure.positions();
            self.check_markers(x.nrows())?;
            let s = self.num_fluid();
            for k in 0..self.num_markers {
                out.data[s + 2 * k] = x[[k, 0]];
                out.data[s + 2 * k + 1] = x[[k, 1]];
            }
        }
        Ok(out)
    }

    /// Write the fluid unknowns of `x` into the field arrays. Ghost layers
    /// and wall-normal faces are left for the caller to refill.
    pub fn scatter_fluid(
        &self,
        x: &[f64],
        fluid: &mut dyn VelocityPressureFieldAccessor,
    ) -> Result<(), IbError> {
        self.check_grid(fluid.grid())?;
        self.scatter_fluid_arrays(x, fluid.velocity_mut(Axis::X), Axis::X);
        self.scatter_fluid_arrays(x, fluid.velocity_mut(Axis::Y), Axis::Y);
        let g = self.grid.ghost_width;
        let p = fluid.pressure_mut();
        for j in 0..self.grid.ny {
            for i in 0..self.grid.nx {
                if let Some(idx) = self.p_index(i, j) {
                    p[[i + g, j + g]] = x[idx];
                }
            }
        }
        Ok(())
    }

    /// Write the marker block of `x` into the structure state.
    pub fn scatter_structure(
        &self,
        x: &[f64],
        structure: &mut dyn StructureStateAccessor,
    ) -> Result<(), IbError> {
        if self.mode != SolveMode::PositionAndFluid {
            return Ok(());
        }
        self.check_markers(structure.positions().nrows())?;
        let s = self.num_fluid();
        let pos = structure.positions_mut();
        for k in 0..self.num_markers {
            pos[[k, 0]] = x[s + 2 * k];
            pos[[k, 1]] = x[s + 2 * k + 1];
        }
        Ok(())
    }

    /// Write velocity unknowns into a ghosted face array of the given axis.
    pub fn scatter_fluid_arrays(&self, x: &[f64], arr: &mut Array2<f64>, axis: Axis) {
        let g = self.grid.ghost_width;
        let (nx, ny) = (self.grid.nx, self.grid.ny);
        match axis {
            Axis::X => {
                for j in 0..ny {
                    for i in 1..nx {
                        if let Some(idx) = self.u_index(i, j) {
                            arr[[i + g, j + g]] = x[idx];
                        }
                    }
                }
            }
            Axis::Y => {
                for j in 1..ny {
                    for i in 0..nx {
                        if let Some(idx) = self.v_index(i, j) {
                            arr[[i + g, j + g]] = x[idx];
                        }
                    }
                }
            }
        }
    }

    /// Read velocity unknowns from a ghosted face array.
    pub fn gather_face_array(&self, arr: &Array2<f64>, axis: Axis, out: &mut [f64]) {
        let g = self.grid.ghost_width;
        let (nx, ny) = (self.grid.nx, self.grid.ny);
        match axis {
            Axis::X => {
                for j in 0..ny {
                    for i in 1..nx {
                        if let Some(idx) = self.u_index(i, j) {
                            out[idx] = arr[[i + g, j + g]];
                        }
                    }
                }
            }
            Axis::Y => {
                for j in 1..ny {
                    for i in 0..nx {
                        if let Some(idx) = self.v_index(i, j) {
                            out[idx] = arr[[i + g, j + g]];
                        }
                    }
                }
            }
        }
    }

    fn gather_fluid(&self, fluid: &dyn VelocityPressureFieldAccessor, out: &mut [f64]) {
        self.gather_face_array(fluid.velocity(Axis::X), Axis::X, out);
        self.gather_face_array(fluid.velocity(Axis::Y), Axis::Y, out);
        let g = self.grid.ghost_width;
        let p = fluid.pressure();
        for j in 0..self.grid.ny {
            for i in 0..self.grid.nx {
                if let Some(idx) = self.p_index(i, j) {
                    out[idx] = p[[i + g, j + g]];
                }
            }
        }
    }

    fn check_grid(&self, grid: &CartesianGrid) -> Result<(), IbError> {
        if !self.grid.same_topology(grid) || self.grid.ghost_width != grid.ghost_width {
            return Err(IbError::GridMismatch(format!(
                "DOF map built for {}x{}, field is {}x{}",
                self.grid.nx, self.grid.ny, grid.nx, grid.ny
            )));
        }
        Ok(())
    }

    fn check_markers(&self, n: usize) -> Result<(), IbError> {
        if n != self.num_markers {
            return Err(IbError::LayoutMismatch(format!(
                "DOF map has {} markers, structure has {n}",
                self.num_markers
            )));
        }
        Ok(())
    }

    /// Fail unless `other` is the very same map instance.
    pub fn ensure_same(self: &Arc<Self>, other: &Arc<Self>, what: &str) -> Result<(), IbError> {
        if !Arc::ptr_eq(self, other) {
            return Err(IbError::LayoutMismatch(format!(
                "{what} was built against a different DOF map"
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Composite vector
// ─────────────────────────────────────────────────────────────

/// Fixed-length vector laid out by a particular [`DofIndexMap`].
#[derive(Debug, Clone)]
pub struct CompositeVector {
    data: Vec<f64>,
    map: Arc<DofIndexMap>,
}

impl CompositeVector {
    pub fn zeros(map: &Arc<DofIndexMap>) -> Self {
        Self {
            data: vec![0.0; map.len()],
            map: Arc::clone(map),
        }
    }

    pub fn from_vec(map: &Arc<DofIndexMap>, data: Vec<f64>) -> Result<Self, IbError> {
        if data.len() != map.len() {
            return Err(IbError::LayoutMismatch(format!(
                "vector of length {} for a map of {} unknowns",
                data.len(),
                map.len()
            )));
        }
        Ok(Self {
            data,
            map: Arc::clone(map),
        })
    }

    pub fn map(&self) -> &Arc<DofIndexMap> {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn fluid(&self) -> &[f64] {
        &self.data[self.map.fluid_range()]
    }

    pub fn structure(&self) -> &[f64] {
        &self.data[self.map.structure_range()]
    }

    pub fn check_layout(&self, other: &Self) -> Result<(), IbError> {
        self.map.ensure_same(&other.map, "composite vector")
    }

    pub fn copy_from(&mut self, other: &Self) -> Result<(), IbError> {
        self.check_layout(other)?;
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    /// `self += alpha · other`
    pub fn axpy(&mut self, alpha: f64, other: &Self) -> Result<(), IbError> {
        self.check_layout(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += alpha * b;
        }
        Ok(())
    }

    pub fn dot(&self, other: &Self, comm: &dyn Communicator) -> Result<f64, IbError> {
        self.check_layout(other)?;
        Ok(comm::dot(comm, &self.map.owned_range(), &self.data, &other.data))
    }

    pub fn norm(&self, comm: &dyn Communicator) -> f64 {
        comm::norm(comm, &self.map.owned_range(), &self.data)
    }

    pub fn all_finite(&self, comm: &dyn Communicator) -> bool {
        comm::all_finite(comm, &self.map.owned_range(), &self.data)
    }

    /// Shift the pressure block to zero mean. Pressure is only defined up to
    /// a constant.
    pub fn remove_pressure_mean(&mut self, comm: &dyn Communicator) {
        let r = self.map.pressure_range();
        let owned = self.map.owned_range();
        let lo = owned.start.clamp(r.start, r.end) - r.start;
        let hi = owned.end.clamp(r.start, r.end) - r.start;
        remove_mean(&mut self.data[r], lo..hi, comm);
    }
}

/// Subtract the global mean of `p`, where this worker contributes the
/// entries in `owned` (relative to `p`) to the reduction.
pub fn remove_mean(p: &mut [f64], owned: Range<usize>, comm: &dyn Communicator) {
    let count = comm.sum(owned.len() as f64);
    if count == 0.0 {
        return;
    }
    let mean = comm.sum(p[owned].iter().sum::<f64>()) / count;
    for v in p.iter_mut() {
        *v -= mean;
    }
}
