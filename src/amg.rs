//! Smoothed-aggregation algebraic multigrid for sparse SPD matrices.
//!
//! Setup builds a hierarchy `A₀ ⊃ A₁ ⊃ …` with Galerkin coarse operators
//! `A_{l+1} = Pᵀ A_l P`, where `P` is a Jacobi-smoothed piecewise-constant
//! aggregation prolongator. The coarsest level is factored with sparse LDLᵀ.
//! Application is a fixed number of V-cycles from a zero initial guess, so
//! the approximate inverse is a fixed linear operator.

use log::debug;
use sprs::{CsMat, TriMat};

use crate::operator::{diagonal, spmv, spmv_add};
use crate::types::{Factorization, IbError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmgParameters {
    /// Strength-of-connection threshold θ.
    pub strength_threshold: f64,
    /// Stop coarsening once a level has at most this many unknowns.
    pub max_coarse_size: usize,
    pub max_levels: usize,
    pub pre_smoothing: usize,
    pub post_smoothing: usize,
    pub cycles: usize,
}

impl Default for AmgParameters {
    fn default() -> Self {
        Self {
            strength_threshold: 0.08,
            max_coarse_size: 64,
            max_levels: 12,
            pre_smoothing: 2,
            post_smoothing: 2,
            cycles: 1,
        }
    }
}

#[derive(Debug)]
struct Level {
    a: CsMat<f64>,
    diag_inv: Vec<f64>,
    /// Jacobi weight `4 / (3 ρ(D⁻¹A))`.
    omega: f64,
    p: CsMat<f64>,
    r: CsMat<f64>,
}

/// A ready-to-apply AMG hierarchy.
#[derive(Debug)]
pub struct AmgHierarchy {
    levels: Vec<Level>,
    coarse: Factorization,
    coarse_dim: usize,
    params: AmgParameters,
}

impl AmgHierarchy {
    /// Build the hierarchy for the CSR matrix `a`.
    pub fn new(a: CsMat<f64>, params: AmgParameters) -> Result<Self, IbError> {
        let a = if a.is_csr() { a } else { a.to_csr() };
        let mut levels = Vec::new();
        let mut current = a;
        while current.rows() > params.max_coarse_size && levels.len() + 1 < params.max_levels {
            let diag = diagonal(&current);
            if diag.iter().any(|&d| d <= 0.0) {
                return Err(IbError::ConfigurationError(
                    "AMG requires a positive diagonal".into(),
                ));
            }
            let diag_inv: Vec<f64> = diag.iter().map(|d| 1.0 / d).collect();
            let lambda = estimate_spectral_radius(&current, &diag_inv);
            let omega = 4.0 / (3.0 * lambda);

            let aggregates = aggregate(&current, params.strength_threshold);
            let n_agg = aggregates.iter().copied().max().map_or(0, |m| m + 1);
            if n_agg == 0 || n_agg >= current.rows() {
                break;
            }
            let t = tentative_prolongator(&aggregates, n_agg);
            let p = smooth_prolongator(&current, &t, &diag_inv, omega);
            let r: CsMat<f64> = p.transpose_view().to_csr();
            let ap: CsMat<f64> = &current * &p;
            let coarse: CsMat<f64> = &r * &ap;
            debug!(
                "amg level {}: n={} nnz={} -> {}",
                levels.len(),
                current.rows(),
                current.nnz(),
                coarse.rows()
            );
            levels.push(Level { a: current, diag_inv, omega, p, r });
            current = coarse;
        }
        let coarse_dim = current.rows();
        let coarse = Factorization::definite(current.to_csc().view())?;
        Ok(Self {
            levels,
            coarse,
            coarse_dim,
            params,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len() + 1
    }

    pub fn dim(&self) -> usize {
        self.levels
            .first()
            .map_or(self.coarse_dim, |l| l.a.rows())
    }

    /// `x ≈ A⁻¹ b` by `params.cycles` V-cycles from zero.
    pub fn apply(&self, b: &[f64], x: &mut [f64]) {
        x.iter_mut().for_each(|v| *v = 0.0);
        for _ in 0..self.params.cycles.max(1) {
            self.vcycle(0, b, x);
        }
    }

    /// One V-cycle on `A x = b` improving the current `x`.
    pub fn vcycle(&self, level: usize, b: &[f64], x: &mut [f64]) {
        if level == self.levels.len() {
            let sol = self.coarse.solve(b);
            x.copy_from_slice(&sol);
            return;
        }
        let lv = &self.levels[level];
        let n = lv.a.rows();
        let mut r = vec![0.0; n];
        for _ in 0..self.params.pre_smoothing {
            jacobi_sweep(lv, b, x, &mut r);
        }
        residual(&lv.a, b, x, &mut r);
        let nc = lv.r.rows();
        let mut rc = vec![0.0; nc];
        spmv(&lv.r, &r, &mut rc);
        let mut xc = vec![0.0; nc];
        self.vcycle(level + 1, &rc, &mut xc);
        spmv_add(&lv.p, 1.0, &xc, x);
        for _ in 0..self.params.post_smoothing {
            jacobi_sweep(lv, b, x, &mut r);
        }
    }
}

fn residual(a: &CsMat<f64>, b: &[f64], x: &[f64], r: &mut [f64]) {
    spmv(a, x, r);
    for (ri, bi) in r.iter_mut().zip(b) {
        *ri = bi - *ri;
    }
}

fn jacobi_sweep(lv: &Level, b: &[f64], x: &mut [f64], scratch: &mut [f64]) {
    residual(&lv.a, b, x, scratch);
    for ((xi, ri), di) in x.iter_mut().zip(scratch.iter()).zip(&lv.diag_inv) {
        *xi += lv.omega * di * ri;
    }
}

/// Power iteration on `D⁻¹A`. Slightly over-estimates so the smoother stays
/// convergent.
fn estimate_spectral_radius(a: &CsMat<f64>, diag_inv: &[f64]) -> f64 {
    let n = a.rows();
    let mut v: Vec<f64> = (0..n).map(|i| 1.0 + ((i * 7919) % 13) as f64 / 13.0).collect();
    let mut w = vec![0.0; n];
    let mut lambda = 1.0;
    for _ in 0..15 {
        let nv = v.iter().map(|x| x * x).sum::<f64>().sqrt();
        if nv == 0.0 {
            break;
        }
        v.iter_mut().for_each(|x| *x /= nv);
        spmv(a, &v, &mut w);
        for (wi, di) in w.iter_mut().zip(diag_inv) {
            *wi *= di;
        }
        lambda = v.iter().zip(&w).map(|(a, b)| a * b).sum::<f64>().abs();
        std::mem::swap(&mut v, &mut w);
    }
    (1.1 * lambda).max(1e-12)
}

/// Strong neighbours of each row: `|a_ij| ≥ θ √(|a_ii a_jj|)`.
fn strong_neighbours(a: &CsMat<f64>, theta: f64) -> Vec<Vec<usize>> {
    let diag = diagonal(a);
    let indptr = a.indptr();
    let ip = indptr.raw_storage();
    (0..a.rows())
        .map(|i| {
            (ip[i]..ip[i + 1])
                .filter_map(|nz| {
                    let j = a.indices()[nz];
                    let v = a.data()[nz];
                    (j != i && v.abs() >= theta * (diag[i] * diag[j]).abs().sqrt()).then_some(j)
                })
                .collect()
        })
        .collect()
}

/// Greedy three-pass aggregation. Returns the aggregate id of every row.
fn aggregate(a: &CsMat<f64>, theta: f64) -> Vec<usize> {
    const NONE: usize = usize::MAX;
    let n = a.rows();
    let strong = strong_neighbours(a, theta);
    let mut agg = vec![NONE; n];
    let mut next = 0;

    // Roots whose whole neighbourhood is still free.
    for i in 0..n {
        if agg[i] != NONE || strong[i].iter().any(|&j| agg[j] != NONE) {
            continue;
        }
        agg[i] = next;
        for &j in &strong[i] {
            agg[j] = next;
        }
        next += 1;
    }
    // Attach leftovers to a neighbouring aggregate.
    let snapshot = agg.clone();
    for i in 0..n {
        if agg[i] == NONE {
            if let Some(&j) = strong[i].iter().find(|&&j| snapshot[j] != NONE) {
                agg[i] = snapshot[j];
            }
        }
    }
    // Whatever is left forms new aggregates.
    for i in 0..n {
        if agg[i] != NONE {
            continue;
        }
        agg[i] = next;
        for &j in &strong[i] {
            if agg[j] == NONE {
                agg[j] = next;
            }
        }
        next += 1;
    }
    agg
}

fn tentative_prolongator(aggregates: &[usize], n_agg: usize) -> CsMat<f64> {
    let mut sizes = vec![0usize; n_agg];
    for &g in aggregates {
        sizes[g] += 1;
    }
    let mut t = TriMat::new((aggregates.len(), n_agg));
    for (i, &g) in aggregates.iter().enumerate() {
        t.add_triplet(i, g, 1.0 / (sizes[g] as f64).sqrt());
    }
    t.to_csr()
}

/// `P = (I − ω D⁻¹ A) T`
fn smooth_prolongator(a: &CsMat<f64>, t: &CsMat<f64>, diag_inv: &[f64], omega: f64) -> CsMat<f64> {
    let at: CsMat<f64> = a * t;
    let mut p = TriMat::new((t.rows(), t.cols()));
    for (v, (i, j)) in t.iter() {
        p.add_triplet(i, j, *v);
    }
    for (v, (i, j)) in at.iter() {
        p.add_triplet(i, j, -omega * diag_inv[i] * v);
    }
    // Duplicate triplets are summed on conversion.
    p.to_csr()
}
