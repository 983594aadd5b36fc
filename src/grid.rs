//! Uniform 2D MAC grid topology and the hierarchy provider seam.

use crate::types::IbError;

/// Uniform Cartesian grid of `nx × ny` cells over
/// `[x0, x0 + nx·dx] × [y0, y0 + ny·dy]`.
///
/// Staggering: x-velocity lives on vertical faces `(i·dx, (j+½)·dy)`,
/// y-velocity on horizontal faces `((i+½)·dx, j·dy)`, pressure at cell
/// centres. Each array carries `ghost_width` extra layers on every side.
#[derive(Debug, Clone, PartialEq)]
pub struct CartesianGrid {
    pub nx: usize,
    pub ny: usize,
    pub origin: [f64; 2],
    pub dx: f64,
    pub dy: f64,
    pub ghost_width: usize,
}

/// The cosine kernel has a four-point support, so stencils reach two cells
/// past the last interior face.
pub const MIN_GHOST_WIDTH: usize = 2;

impl CartesianGrid {
    pub fn new(
        nx: usize,
        ny: usize,
        lower: [f64; 2],
        upper: [f64; 2],
        ghost_width: usize,
    ) -> Result<Self, IbError> {
        if nx < 2 || ny < 2 {
            return Err(IbError::ConfigurationError(format!(
                "grid needs at least 2x2 cells, got {nx}x{ny}"
            )));
        }
        if ghost_width < MIN_GHOST_WIDTH {
            return Err(IbError::ConfigurationError(format!(
                "ghost width must be >= {MIN_GHOST_WIDTH}, got {ghost_width}"
            )));
        }
        let (lx, ly) = (upper[0] - lower[0], upper[1] - lower[1]);
        if !(lx.is_finite() && ly.is_finite() && lx > 0.0 && ly > 0.0) {
            return Err(IbError::ConfigurationError(format!(
                "invalid domain extents {lower:?}..{upper:?}"
            )));
        }
        Ok(Self {
            nx,
            ny,
            origin: lower,
            dx: lx / nx as f64,
            dy: ly / ny as f64,
            ghost_width,
        })
    }

    /// Unit square with `n × n` cells.
    pub fn unit_square(n: usize) -> Result<Self, IbError> {
        Self::new(n, n, [0.0, 0.0], [1.0, 1.0], MIN_GHOST_WIDTH)
    }

    pub fn upper(&self) -> [f64; 2] {
        [
            self.origin[0] + self.nx as f64 * self.dx,
            self.origin[1] + self.ny as f64 * self.dy,
        ]
    }

    pub fn u_shape(&self) -> (usize, usize) {
        let g = self.ghost_width;
        (self.nx + 1 + 2 * g, self.ny + 2 * g)
    }

    pub fn v_shape(&self) -> (usize, usize) {
        let g = self.ghost_width;
        (self.nx + 2 * g, self.ny + 1 + 2 * g)
    }

    pub fn p_shape(&self) -> (usize, usize) {
        let g = self.ghost_width;
        (self.nx + 2 * g, self.ny + 2 * g)
    }

    /// Physical position of x-face `(i, j)`; indices may be negative (ghost).
    pub fn u_position(&self, i: isize, j: isize) -> [f64; 2] {
        [
            self.origin[0] + i as f64 * self.dx,
            self.origin[1] + (j as f64 + 0.5) * self.dy,
        ]
    }

    pub fn v_position(&self, i: isize, j: isize) -> [f64; 2] {
        [
            self.origin[0] + (i as f64 + 0.5) * self.dx,
            self.origin[1] + j as f64 * self.dy,
        ]
    }

    pub fn cell_center(&self, i: isize, j: isize) -> [f64; 2] {
        [
            self.origin[0] + (i as f64 + 0.5) * self.dx,
            self.origin[1] + (j as f64 + 0.5) * self.dy,
        ]
    }

    pub fn cell_volume(&self) -> f64 {
        self.dx * self.dy
    }

    /// Same topology, ignoring ghost width.
    pub fn same_topology(&self, other: &Self) -> bool {
        self.nx == other.nx
            && self.ny == other.ny
            && self.origin == other.origin
            && self.dx == other.dx
            && self.dy == other.dy
    }
}

// ─────────────────────────────────────────────────────────────
//  Hierarchy provider
// ─────────────────────────────────────────────────────────────

/// Source of the current mesh topology.
///
/// `generation()` increases whenever the topology changes; anything derived
/// from the grid (DOF maps, assembled operators) is stale once it moves.
pub trait GridHierarchyProvider {
    fn grid(&self) -> &CartesianGrid;
    fn generation(&self) -> u64;
}

/// Single-level hierarchy owned by the caller. `regrid` swaps the topology
/// and bumps the generation.
#[derive(Debug, Clone)]
pub struct StaticHierarchy {
    grid: CartesianGrid,
    generation: u64,
}

impl StaticHierarchy {
    pub fn new(grid: CartesianGrid) -> Self {
        Self { grid, generation: 0 }
    }

    pub fn regrid(&mut self, grid: CartesianGrid) {
        self.grid = grid;
        self.generation += 1;
    }
}

impl GridHierarchyProvider for StaticHierarchy {
    fn grid(&self) -> &CartesianGrid {
        &self.grid
    }

    fn generation(&self) -> u64 {
        self.generation
    }
}
