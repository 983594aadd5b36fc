//! Lagrangian marker state and the elastic structure model.

use ndarray::Array2;

use crate::types::IbError;

/// Read/write access to marker positions (`n × 2`) and optional velocities.
pub trait StructureStateAccessor {
    fn positions(&self) -> &Array2<f64>;
    fn positions_mut(&mut self) -> &mut Array2<f64>;
    fn velocities(&self) -> Option<&Array2<f64>>;
    fn velocities_mut(&mut self) -> Option<&mut Array2<f64>>;

    fn num_markers(&self) -> usize {
        self.positions().nrows()
    }
}

/// Ordered marker set.
#[derive(Debug, Clone, PartialEq)]
pub struct LagrangianState {
    pub positions: Array2<f64>,
    pub velocities: Option<Array2<f64>>,
}

impl LagrangianState {
    pub fn new(positions: Array2<f64>) -> Result<Self, IbError> {
        if positions.ncols() != 2 {
            return Err(IbError::LayoutMismatch(format!(
                "marker positions must be n x 2, got {}x{}",
                positions.nrows(),
                positions.ncols()
            )));
        }
        Ok(Self {
            positions,
            velocities: None,
        })
    }

    /// Also track marker velocities, updated after each committed step.
    pub fn with_velocities(mut self) -> Self {
        self.velocities = Some(Array2::zeros(self.positions.raw_dim()));
        self
    }

    pub fn empty() -> Self {
        Self {
            positions: Array2::zeros((0, 2)),
            velocities: None,
        }
    }
}

impl StructureStateAccessor for LagrangianState {
    fn positions(&self) -> &Array2<f64> {
        &self.positions
    }

    fn positions_mut(&mut self) -> &mut Array2<f64> {
        &mut self.positions
    }

    fn velocities(&self) -> Option<&Array2<f64>> {
        self.velocities.as_ref()
    }

    fn velocities_mut(&mut self) -> Option<&mut Array2<f64>> {
        self.velocities.as_mut()
    }
}

// ─────────────────────────────────────────────────────────────
//  Structure model
// ─────────────────────────────────────────────────────────────

/// Elastic response of the marker set.
///
/// `force` returns the Lagrangian force on each marker (`n × 2`);
/// `apply_stiffness` returns `K(X)·δX` with `K = ∂F/∂X`.
pub trait StructureModel: Send + Sync {
    fn force(&self, x: &Array2<f64>) -> Array2<f64>;
    fn apply_stiffness(&self, x: &Array2<f64>, dx: &Array2<f64>) -> Array2<f64>;

    /// Check that every marker the model refers to exists.
    fn validate(&self, _num_markers: usize) -> Result<(), IbError> {
        Ok(())
    }
}

/// Linear spring between two markers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spring {
    pub a: usize,
    pub b: usize,
    pub stiffness: f64,
    pub rest_length: f64,
}

/// Marker attached to a fixed point by a zero-length spring.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tether {
    pub marker: usize,
    pub anchor: [f64; 2],
    pub stiffness: f64,
}

/// Network of springs and tethers.
#[derive(Debug, Clone, Default)]
pub struct SpringNetwork {
    pub springs: Vec<Spring>,
    pub tethers: Vec<Tether>,
}

impl SpringNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spring(mut self, a: usize, b: usize, stiffness: f64, rest_length: f64) -> Self {
        self.springs.push(Spring { a, b, stiffness, rest_length });
        self
    }

    pub fn with_tether(mut self, marker: usize, anchor: [f64; 2], stiffness: f64) -> Self {
        self.tethers.push(Tether { marker, anchor, stiffness });
        self
    }

    /// Closed ring of `n` springs joining consecutive markers.
    pub fn closed_ring(n: usize, stiffness: f64, rest_length: f64) -> Self {
        let mut net = Self::new();
        for k in 0..n {
            net.springs.push(Spring {
                a: k,
                b: (k + 1) % n,
                stiffness,
                rest_length,
            });
        }
        net
    }
}

/// Returns `(d, l)` where `d = X_b − X_a` and `l = |d|`.
fn separation(x: &Array2<f64>, s: &Spring) -> ([f64; 2], f64) {
    let d = [x[[s.b, 0]] - x[[s.a, 0]], x[[s.b, 1]] - x[[s.a, 1]]];
    (d, d[0].hypot(d[1]))
}

impl StructureModel for SpringNetwork {
    fn validate(&self, num_markers: usize) -> Result<(), IbError> {
        for s in &self.springs {
            if s.a >= num_markers || s.b >= num_markers || s.a == s.b {
                return Err(IbError::ConfigurationError(format!(
                    "spring ({}, {}) invalid for {num_markers} markers",
                    s.a, s.b
                )));
            }
        }
        for t in &self.tethers {
            if t.marker >= num_markers {
                return Err(IbError::ConfigurationError(format!(
                    "tether on marker {} invalid for {num_markers} markers",
                    t.marker
                )));
            }
        }
        Ok(())
    }

    fn force(&self, x: &Array2<f64>) -> Array2<f64> {
        let mut f = Array2::zeros(x.raw_dim());
        for s in &self.springs {
            let (d, l) = separation(x, s);
            if l == 0.0 {
                continue;
            }
            // Tension pulls a towards b.
            let t = s.stiffness * (l - s.rest_length) / l;
            for c in 0..2 {
                f[[s.a, c]] += t * d[c];
                f[[s.b, c]] -= t * d[c];
            }
        }
        for t in &self.tethers {
            for c in 0..2 {
                f[[t.marker, c]] += t.stiffness * (t.anchor[c] - x[[t.marker, c]]);
            }
        }
        f
    }

    fn apply_stiffness(&self, x: &Array2<f64>, dx: &Array2<f64>) -> Array2<f64> {
        let mut df = Array2::zeros(x.raw_dim());
        for s in &self.springs {
            let (d, l) = separation(x, s);
            if l == 0.0 {
                continue;
            }
            let e = [d[0] / l, d[1] / l];
            let dd = [dx[[s.b, 0]] - dx[[s.a, 0]], dx[[s.b, 1]] - dx[[s.a, 1]]];
            // ∂(κ(l − L₀) e)/∂d = κ[(1 − L₀/l) I + (L₀/l) e eᵀ]
            let ratio = s.rest_length / l;
            let e_dot = e[0] * dd[0] + e[1] * dd[1];
            for c in 0..2 {
                let g = s.stiffness * ((1.0 - ratio) * dd[c] + ratio * e[c] * e_dot);
                df[[s.a, c]] += g;
                df[[s.b, c]] -= g;
            }
        }
        for t in &self.tethers {
            for c in 0..2 {
                df[[t.marker, c]] -= t.stiffness * dx[[t.marker, c]];
            }
        }
        df
    }
}
