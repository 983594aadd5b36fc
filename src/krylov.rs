//! Restarted flexible GMRES (right preconditioned).
//!
//! Flexible because the preconditioner may itself contain an inner Krylov
//! solve and so change from one application to the next; the preconditioned
//! directions `Z` are stored alongside the Arnoldi basis `V`.

use log::trace;

use crate::types::IbError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KrylovSettings {
    pub restart: usize,
    pub max_iterations: usize,
    pub rtol: f64,
    pub atol: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KrylovStatus {
    Converged,
    MaxIterationsReached,
    /// A whole restart cycle made no progress.
    Stagnated,
}

#[derive(Debug, Clone)]
pub struct KrylovOutcome {
    pub status: KrylovStatus,
    pub iterations: usize,
    pub initial_residual: f64,
    pub residual: f64,
    pub target: f64,
    /// Residual norm at the start and after every iteration. Within a
    /// restart cycle this is the least-squares estimate, which never grows.
    pub history: Vec<f64>,
}

impl KrylovOutcome {
    pub fn converged(&self) -> bool {
        self.status == KrylovStatus::Converged
    }
}

fn givens(a: f64, b: f64) -> (f64, f64) {
    if b == 0.0 {
        (1.0, 0.0)
    } else if a == 0.0 {
        (0.0, 1.0)
    } else {
        let r = a.hypot(b);
        (a / r, b / r)
    }
}

/// Solve `A x = b` starting from the incoming `x`.
///
/// `apply_a` and `apply_m` overwrite their output; `dot` is the (globally
/// reduced) inner product. Operator errors abort the solve; failing to
/// converge does not, the caller inspects `status`.
pub fn fgmres<A, M, D>(
    mut apply_a: A,
    mut apply_m: M,
    dot: D,
    b: &[f64],
    x: &mut [f64],
    settings: &KrylovSettings,
) -> Result<KrylovOutcome, IbError>
where
    A: FnMut(&[f64], &mut [f64]) -> Result<(), IbError>,
    M: FnMut(&[f64], &mut [f64]) -> Result<(), IbError>,
    D: Fn(&[f64], &[f64]) -> f64,
{
    let n = b.len();
    if x.len() != n {
        return Err(IbError::LayoutMismatch(format!(
            "Krylov solution of length {} for right-hand side of length {n}",
            x.len()
        )));
    }
    let norm = |v: &[f64]| dot(v, v).max(0.0).sqrt();
    let m = settings.restart.max(1);

    let b_norm = norm(b);
    let target = (settings.rtol * b_norm).max(settings.atol);

    let mut r = vec![0.0; n];
    let mut w = vec![0.0; n];
    let true_residual = |apply_a: &mut A, x: &[f64], r: &mut [f64]| -> Result<(), IbError> {
        apply_a(x, r)?;
        for (ri, bi) in r.iter_mut().zip(b) {
            *ri = bi - *ri;
        }
        Ok(())
    };
    true_residual(&mut apply_a, x, &mut r)?;
    let mut beta = norm(&r);
    let initial_residual = beta;
    let mut history = vec![beta];
    let mut iterations = 0;

    let outcome =
        |status: KrylovStatus, iterations: usize, residual: f64, history: Vec<f64>| KrylovOutcome {
            status,
            iterations,
            initial_residual,
            residual,
            target,
            history,
        };

    if beta <= target {
        return Ok(outcome(KrylovStatus::Converged, 0, beta, history));
    }

    let mut basis: Vec<Vec<f64>> = Vec::with_capacity(m + 1);
    let mut zs: Vec<Vec<f64>> = Vec::with_capacity(m);
    let mut h = vec![vec![0.0; m]; m + 1];
    let mut cs = vec![0.0; m];
    let mut sn = vec![0.0; m];
    let mut g = vec![0.0; m + 1];

    loop {
        basis.clear();
        zs.clear();
        basis.push(r.iter().map(|ri| ri / beta).collect());
        g.iter_mut().for_each(|gi| *gi = 0.0);
        g[0] = beta;
        let cycle_start = beta;
        let mut k = 0;
        let mut estimate = beta;

        while k < m && iterations < settings.max_iterations {
            let mut z = vec![0.0; n];
            apply_m(&basis[k], &mut z)?;
            apply_a(&z, &mut w)?;
            zs.push(z);

            // Modified Gram–Schmidt.
            for i in 0..=k {
                let hik = dot(&w, &basis[i]);
                h[i][k] = hik;
                for (wj, vj) in w.iter_mut().zip(&basis[i]) {
                    *wj -= hik * vj;
                }
            }
            let h_next = norm(&w);
            h[k + 1][k] = h_next;

            for i in 0..k {
                let t = cs[i] * h[i][k] + sn[i] * h[i + 1][k];
                h[i + 1][k] = -sn[i] * h[i][k] + cs[i] * h[i + 1][k];
                h[i][k] = t;
            }
            let (c, s) = givens(h[k][k], h[k + 1][k]);
            cs[k] = c;
            sn[k] = s;
            h[k][k] = c * h[k][k] + s * h[k + 1][k];
            h[k + 1][k] = 0.0;
            g[k + 1] = -s * g[k];
            g[k] *= c;

            estimate = g[k + 1].abs();
            iterations += 1;
            k += 1;
            history.push(estimate);
            trace!("fgmres it {iterations}: residual {estimate:.3e}");

            if estimate <= target || h_next <= 1e-14 * b_norm.max(f64::MIN_POSITIVE) {
                break;
            }
            basis.push(w.iter().map(|wi| wi / h_next).collect());
        }

        // Back substitution for the k × k triangular system.
        let mut y = vec![0.0; k];
        for i in (0..k).rev() {
            let mut s = g[i];
            for j in (i + 1)..k {
                s -= h[i][j] * y[j];
            }
            y[i] = if h[i][i] != 0.0 { s / h[i][i] } else { 0.0 };
        }
        for (yi, zi) in y.iter().zip(&zs) {
            for (xj, zj) in x.iter_mut().zip(zi) {
                *xj += yi * zj;
            }
        }

        true_residual(&mut apply_a, x, &mut r)?;
        beta = norm(&r);
        trace!("fgmres restart after {iterations}: true residual {beta:.3e} (estimate {estimate:.3e})");

        if beta <= target {
            return Ok(outcome(KrylovStatus::Converged, iterations, beta, history));
        }
        if iterations >= settings.max_iterations {
            return Ok(outcome(KrylovStatus::MaxIterationsReached, iterations, beta, history));
        }
        if beta >= cycle_start * (1.0 - 1e-12) {
            return Ok(outcome(KrylovStatus::Stagnated, iterations, beta, history));
        }
    }
}
