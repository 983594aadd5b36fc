//! Wall boundary data and Eulerian body forcing.

use crate::types::{Axis, WallSide};

/// Condition applied to the velocity component tangential to a wall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TangentialCondition {
    /// Prescribed wall velocity (no-slip, moving lid).
    Dirichlet,
    /// Zero normal derivative (free slip).
    Neumann,
}

/// Supplies wall velocities consumed when evaluating the fluid block.
///
/// The normal component on every wall is always prescribed.
pub trait BoundaryConditionProvider: Send + Sync {
    /// Velocity `component` on wall `side` at the point `(x, y)`, time `t`.
    fn wall_velocity(&self, side: WallSide, component: Axis, x: f64, y: f64, t: f64) -> f64;

    fn tangential_condition(&self, side: WallSide) -> TangentialCondition;
}

type WallFn = Box<dyn Fn(f64, f64, f64) -> f64 + Send + Sync>;

/// Per-wall velocity functions. Walls left unset are stationary no-slip.
pub struct WallBoundary {
    walls: [[Option<WallFn>; 2]; 4],
    tangential: [TangentialCondition; 4],
}

impl Default for WallBoundary {
    fn default() -> Self {
        Self::no_slip()
    }
}

impl std::fmt::Debug for WallBoundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WallBoundary")
            .field("tangential", &self.tangential)
            .finish_non_exhaustive()
    }
}

fn side_index(side: WallSide) -> usize {
    match side {
        WallSide::Left => 0,
        WallSide::Right => 1,
        WallSide::Bottom => 2,
        WallSide::Top => 3,
    }
}

impl WallBoundary {
    /// Stationary no-slip walls everywhere.
    pub fn no_slip() -> Self {
        Self {
            walls: Default::default(),
            tangential: [TangentialCondition::Dirichlet; 4],
        }
    }

    /// Set the velocity `component` on `side` to `f(x, y, t)`.
    pub fn with_velocity<F>(mut self, side: WallSide, component: Axis, f: F) -> Self
    where
        F: Fn(f64, f64, f64) -> f64 + Send + Sync + 'static,
    {
        self.walls[side_index(side)][component.index()] = Some(Box::new(f));
        self
    }

    /// Lid-driven cavity: the top wall slides with tangential speed
    /// `lid(x, t)`, all others are at rest.
    pub fn lid_driven<F>(lid: F) -> Self
    where
        F: Fn(f64, f64) -> f64 + Send + Sync + 'static,
    {
        Self::no_slip().with_velocity(WallSide::Top, Axis::X, move |x, _y, t| lid(x, t))
    }

    pub fn with_tangential(mut self, side: WallSide, cond: TangentialCondition) -> Self {
        self.tangential[side_index(side)] = cond;
        self
    }
}

impl BoundaryConditionProvider for WallBoundary {
    fn wall_velocity(&self, side: WallSide, component: Axis, x: f64, y: f64, t: f64) -> f64 {
        match &self.walls[side_index(side)][component.index()] {
            Some(f) => f(x, y, t),
            None => 0.0,
        }
    }

    fn tangential_condition(&self, side: WallSide) -> TangentialCondition {
        self.tangential[side_index(side)]
    }
}

// ─────────────────────────────────────────────────────────────
//  Body forcing
// ─────────────────────────────────────────────────────────────

/// Eulerian body force density `f(x, y, t)` added to the momentum equation.
pub trait BodyForce: Send + Sync {
    fn force(&self, component: Axis, x: f64, y: f64, t: f64) -> f64;
}

/// Closure-backed body force.
pub struct FnBodyForce<F>(pub F);

impl<F> BodyForce for FnBodyForce<F>
where
    F: Fn(Axis, f64, f64, f64) -> f64 + Send + Sync,
{
    fn force(&self, component: Axis, x: f64, y: f64, t: f64) -> f64 {
        (self.0)(component, x, y, t)
    }
}
