//! Newton–Krylov driver for one implicit step, written as an explicit
//! state machine.
//!
//! ```text
//! Idle → Evaluating → LinearSolving → Updating → Evaluating → …
//!            │                             │
//!            ├→ Converged                  └→ Diverged
//!            └→ MaxIterationsReached
//! ```
//!
//! Any error raised while evaluating or solving (a Krylov failure, a
//! non-finite residual) ends in `Failed`.

use std::sync::Arc;

use log::{debug, info, trace, warn};

use crate::comm::{self, Communicator};
use crate::config::SolverConfig;
use crate::dof::CompositeVector;
use crate::jacobian::JacobianAction;
use crate::krylov::{fgmres, KrylovOutcome, KrylovSettings};
use crate::operator::BlockOperator;
use crate::preconditioner::BlockPreconditioner;
use crate::residual::CompositeResidualEvaluator;
use crate::schur::{LagrangianSchurSolver, SchurOperator};
use crate::stokes::FluidBlock;
use crate::types::IbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewtonState {
    Idle,
    Evaluating,
    LinearSolving,
    Updating,
    Converged,
    Diverged,
    MaxIterationsReached,
    Failed,
}

impl NewtonState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Converged | Self::Diverged | Self::MaxIterationsReached | Self::Failed
        )
    }
}

/// Record of one nonlinear solve.
#[derive(Debug, Clone, PartialEq)]
pub struct NewtonReport {
    pub state: NewtonState,
    /// Newton updates applied.
    pub iterations: usize,
    /// `‖R‖` of the initial guess and after each accepted update.
    pub residual_history: Vec<f64>,
    /// Krylov iterations per Newton step, retries included.
    pub linear_iterations: Vec<usize>,
    /// Damping factor of each accepted update.
    pub step_lengths: Vec<f64>,
    /// Trial steps rejected by the divergence safeguard.
    pub rejected_steps: usize,
}

impl NewtonReport {
    fn new() -> Self {
        Self {
            state: NewtonState::Idle,
            iterations: 0,
            residual_history: Vec::new(),
            linear_iterations: Vec::new(),
            step_lengths: Vec::new(),
            rejected_steps: 0,
        }
    }

    pub fn initial_residual(&self) -> f64 {
        self.residual_history.first().copied().unwrap_or(0.0)
    }

    pub fn final_residual(&self) -> f64 {
        self.residual_history.last().copied().unwrap_or(0.0)
    }
}

pub struct NonlinearCoupledSolver<'a> {
    config: &'a SolverConfig,
    evaluator: &'a CompositeResidualEvaluator<'a>,
    fluid: Arc<FluidBlock>,
    comm: &'a dyn Communicator,
    state: NewtonState,
    report: NewtonReport,
    /// Residual of the last rejected trial step.
    last_rejected: f64,
}

impl<'a> NonlinearCoupledSolver<'a> {
    pub fn new(
        config: &'a SolverConfig,
        evaluator: &'a CompositeResidualEvaluator<'a>,
        fluid: Arc<FluidBlock>,
    ) -> Result<Self, IbError> {
        config.validate()?;
        evaluator.map().ensure_same(fluid.map(), "Newton fluid block")?;
        Ok(Self {
            config,
            evaluator,
            fluid,
            comm: evaluator.context().comm,
            state: NewtonState::Idle,
            report: NewtonReport::new(),
            last_rejected: 0.0,
        })
    }

    pub fn state(&self) -> NewtonState {
        self.state
    }

    /// Report of the most recent solve, including failed ones.
    pub fn report(&self) -> &NewtonReport {
        &self.report
    }

    fn transition(&mut self, next: NewtonState) {
        trace!("newton {:?} -> {:?}", self.state, next);
        self.state = next;
        self.report.state = next;
    }

    fn converged(&self, norm: f64, initial: f64) -> bool {
        norm <= self.config.nonlinear_atol || norm <= self.config.nonlinear_rtol * initial
    }

    /// Iterate from `initial` until a terminal state. Only `Converged`
    /// returns a solution; the input is never modified.
    pub fn solve(
        &mut self,
        initial: &CompositeVector,
    ) -> Result<(CompositeVector, NewtonReport), IbError> {
        self.evaluator.map().ensure_same(initial.map(), "initial guess")?;
        self.report = NewtonReport::new();
        self.state = NewtonState::Idle;
        let outcome = self.iterate(initial);
        if let Err(e) = &outcome {
            if !self.state.is_terminal() {
                warn!("newton: {} while {:?}", e.kind(), self.state);
                self.transition(NewtonState::Failed);
            }
        }
        outcome
    }

    fn iterate(
        &mut self,
        initial: &CompositeVector,
    ) -> Result<(CompositeVector, NewtonReport), IbError> {
        let map = Arc::clone(self.evaluator.map());

        let mut x = initial.clone();
        x.remove_pressure_mean(self.comm);
        let mut r = CompositeVector::zeros(&map);
        let mut delta = CompositeVector::zeros(&map);
        let mut initial_norm = 0.0;
        let mut norm = 0.0;

        loop {
            match self.state {
                NewtonState::Idle => {
                    self.evaluator.evaluate(&x, &mut r)?;
                    initial_norm = r.norm(self.comm);
                    norm = initial_norm;
                    self.report.residual_history.push(norm);
                    debug!("newton: initial residual {norm:.6e}");
                    self.transition(NewtonState::Evaluating);
                }
                NewtonState::Evaluating => {
                    if self.converged(norm, initial_norm) {
                        self.transition(NewtonState::Converged);
                    } else if self.report.iterations >= self.config.max_nonlinear_iterations {
                        self.transition(NewtonState::MaxIterationsReached);
                    } else {
                        self.transition(NewtonState::LinearSolving);
                    }
                }
                NewtonState::LinearSolving => {
                    let its = self.linear_solve(&x, &r, norm, &mut delta)?;
                    self.report.linear_iterations.push(its);
                    self.transition(NewtonState::Updating);
                }
                NewtonState::Updating => match self.update(&x, &delta, norm)? {
                    Some((trial, trial_r, trial_norm, lambda)) => {
                        x = trial;
                        r = trial_r;
                        norm = trial_norm;
                        self.report.iterations += 1;
                        self.report.residual_history.push(norm);
                        self.report.step_lengths.push(lambda);
                        debug!(
                            "newton it {}: residual {:.6e} (step {lambda})",
                            self.report.iterations, norm
                        );
                        self.transition(NewtonState::Evaluating);
                    }
                    None => self.transition(NewtonState::Diverged),
                },
                NewtonState::Converged => {
                    info!(
                        "newton converged in {} iterations, residual {:.3e} (initial {:.3e})",
                        self.report.iterations, norm, initial_norm
                    );
                    return Ok((x, self.report.clone()));
                }
                NewtonState::MaxIterationsReached => {
                    warn!(
                        "newton: iteration budget {} exhausted, residual {norm:.3e}",
                        self.config.max_nonlinear_iterations
                    );
                    return Err(IbError::MaxIterationsReached {
                        iterations: self.report.iterations,
                        residual: norm,
                    });
                }
                // Only set by `solve` after an error has left this loop.
                NewtonState::Failed => {
                    return Err(IbError::ConfigurationError(
                        "newton iteration resumed from a failed state".into(),
                    ));
                }
                NewtonState::Diverged => {
                    let previous = norm;
                    return Err(IbError::NonlinearDivergence {
                        iteration: self.report.iterations + 1,
                        residual: self.last_rejected,
                        previous,
                        ratio: self.config.divergence_safeguard_ratio,
                    });
                }
            }
        }
    }

    /// Approximately solve `J δ = −R` with preconditioned FGMRES. A failed
    /// solve is retried once with a fresh Krylov basis, warm-started from
    /// the partial solution.
    fn linear_solve(
        &self,
        x: &CompositeVector,
        r: &CompositeVector,
        norm: f64,
        delta: &mut CompositeVector,
    ) -> Result<usize, IbError> {
        let map = Arc::clone(self.evaluator.map());
        let lin = self.evaluator.linearize(x, r)?;
        let jac = JacobianAction::new(self.evaluator, &self.fluid, &lin, self.config.jacobian)?;
        let schur = LagrangianSchurSolver::new(
            SchurOperator::new(self.evaluator, &lin, Arc::clone(&self.fluid))?,
            self.config,
        )?;
        let pc = BlockPreconditioner::new(
            self.evaluator,
            &lin,
            Arc::clone(&self.fluid),
            schur,
            self.config.preconditioner_sweeps,
        )?;

        let rhs: Vec<f64> = r.as_slice().iter().map(|v| -v).collect();
        let settings = KrylovSettings {
            restart: self.config.krylov_restart,
            max_iterations: self.config.max_linear_iterations,
            rtol: self.config.linear_rtol,
            atol: self.config.linear_atol,
        };
        let owned = map.owned_range();
        let dot = |a: &[f64], b: &[f64]| comm::dot(self.comm, &owned, a, b);
        let d = delta.as_mut_slice();
        d.iter_mut().for_each(|v| *v = 0.0);

        let run = |d: &mut [f64]| -> Result<KrylovOutcome, IbError> {
            fgmres(
                |v, o| jac.apply(v, o),
                |v, o| pc.apply_inverse_approx(v, o),
                &dot,
                &rhs,
                d,
                &settings,
            )
        };

        let first = run(&mut *d)?;
        debug!(
            "linear solve: {} iterations, {:.3e} -> {:.3e} ({:?})",
            first.iterations, norm, first.residual, first.status
        );
        let mut total = first.iterations;
        if !first.converged() {
            warn!(
                "linear solve {:?} after {} iterations (residual {:.3e}, target {:.3e}); restarting",
                first.status, first.iterations, first.residual, first.target
            );
            let second = run(&mut *d)?;
            total += second.iterations;
            if !second.converged() {
                return Err(IbError::LinearSolveFailure {
                    iterations: total,
                    residual: second.residual,
                    target: second.target,
                });
            }
        }
        if !delta.all_finite(self.comm) {
            return Err(IbError::NumericalInstability("Newton step"));
        }
        Ok(total)
    }

    /// Apply `x + λ δ`, halving `λ` while the residual grows past the
    /// safeguard ratio. `None` once the halvings are used up.
    #[allow(clippy::type_complexity)]
    fn update(
        &mut self,
        x: &CompositeVector,
        delta: &CompositeVector,
        norm: f64,
    ) -> Result<Option<(CompositeVector, CompositeVector, f64, f64)>, IbError> {
        let ratio = self.config.divergence_safeguard_ratio;
        let mut lambda = 1.0;
        for _ in 0..=self.config.max_step_halvings {
            let mut trial = x.clone();
            trial.axpy(lambda, delta)?;
            trial.remove_pressure_mean(self.comm);
            let mut trial_r = CompositeVector::zeros(x.map());
            self.evaluator.evaluate(&trial, &mut trial_r)?;
            let trial_norm = trial_r.norm(self.comm);
            if trial_norm <= ratio * norm {
                return Ok(Some((trial, trial_r, trial_norm, lambda)));
            }
            warn!(
                "newton: rejecting step {lambda}, residual {trial_norm:.3e} > {ratio} x {norm:.3e}"
            );
            self.last_rejected = trial_norm;
            self.report.rejected_steps += 1;
            lambda *= 0.5;
        }
        Ok(None)
    }
}
