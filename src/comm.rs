//! Collective reductions across cooperating workers.
//!
//! Every norm, dot product and failure decision inside a solve goes through
//! a `Communicator`, so all workers take identical branches.

use std::ops::Range;

pub trait Communicator: Send + Sync + std::fmt::Debug {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    /// Global sum of a locally computed value.
    fn sum(&self, local: f64) -> f64;

    /// Global maximum of a locally computed value.
    fn max(&self, local: f64) -> f64;

    /// Logical AND across workers.
    fn all(&self, local: bool) -> bool;

    /// Block until every worker reaches this point.
    fn barrier(&self) {}
}

/// Single-worker communicator: every reduction is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialCommunicator;

impl Communicator for SerialCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn sum(&self, local: f64) -> f64 {
        local
    }

    fn max(&self, local: f64) -> f64 {
        local
    }

    fn all(&self, local: bool) -> bool {
        local
    }
}

/// Dot product over the locally owned range, reduced across workers.
pub fn dot(comm: &dyn Communicator, owned: &Range<usize>, a: &[f64], b: &[f64]) -> f64 {
    let local: f64 = a[owned.clone()]
        .iter()
        .zip(&b[owned.clone()])
        .map(|(x, y)| x * y)
        .sum();
    comm.sum(local)
}

pub fn norm(comm: &dyn Communicator, owned: &Range<usize>, a: &[f64]) -> f64 {
    dot(comm, owned, a, a).sqrt()
}

/// Collective finiteness check; every worker gets the same answer.
pub fn all_finite(comm: &dyn Communicator, owned: &Range<usize>, a: &[f64]) -> bool {
    comm.all(a[owned.clone()].iter().all(|v| v.is_finite()))
}
