//! Timestep coordinator: owns the simulation state and drives one implicit
//! solve per cycle.
//!
//! A step from `tⁿ` to `tⁿ⁺¹` is
//!
//! ```text
//! preprocess_integrate → integrate(cycle 0) → … → integrate(cycle N−1) → postprocess_integrate
//! ```
//!
//! `advance` runs the whole sequence and rolls back to the step-start state
//! if any cycle fails. When the phases are driven one by one, a failed cycle
//! marks the step, and `postprocess_integrate` then rolls back and reports
//! the failure instead of advancing the clock.

use std::sync::Arc;

use log::{debug, info, warn};
use ndarray::Array2;

use crate::boundary::{BodyForce, BoundaryConditionProvider};
use crate::comm::{Communicator, SerialCommunicator};
use crate::config::{ConfigSnapshot, FluidParameters, SolverConfig};
use crate::dof::DofIndexMap;
use crate::fields::{fill_ghosts, EulerianState, GhostFill};
use crate::grid::{GridHierarchyProvider, StaticHierarchy};
use crate::interaction::{InterpolationSpreadOperator, KernelInteraction};
use crate::newton::{NewtonReport, NonlinearCoupledSolver};
use crate::operator::OperatorCoefficients;
use crate::registry::OperatorRegistry;
use crate::residual::{CompositeResidualEvaluator, StepContext};
use crate::stokes::tangential_kinds;
use crate::structure::{LagrangianState, StructureModel};
use crate::types::IbError;

/// Outcome of one `integrate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub current_time: f64,
    pub new_time: f64,
    pub cycle: usize,
    /// Zero-length interval; nothing was solved.
    pub skipped: bool,
    pub newton: Option<NewtonReport>,
}

/// State at the start of the step in progress.
#[derive(Debug, Clone)]
struct StepStart {
    current_time: f64,
    new_time: f64,
    num_cycles: usize,
    eulerian: EulerianState,
    lagrangian: LagrangianState,
    /// Kind of the first error returned by a cycle of this step.
    failure: Option<&'static str>,
}

pub struct TimestepCoordinator<H: GridHierarchyProvider = StaticHierarchy> {
    config: SolverConfig,
    fluid: FluidParameters,
    hierarchy: H,
    eulerian: EulerianState,
    lagrangian: LagrangianState,
    structure: Box<dyn StructureModel>,
    interaction: Box<dyn InterpolationSpreadOperator>,
    boundary: Box<dyn BoundaryConditionProvider>,
    body_force: Option<Box<dyn BodyForce>>,
    registry: OperatorRegistry,
    time: f64,
    steps_taken: u64,
    step_start: Option<StepStart>,
    last_report: Option<NewtonReport>,
}

fn check_interval(current: f64, new: f64) -> Result<(), IbError> {
    if !(current.is_finite() && new.is_finite()) || new < current {
        return Err(IbError::InvalidTimeInterval { current, new });
    }
    Ok(())
}

impl<H: GridHierarchyProvider> TimestepCoordinator<H> {
    /// Validates the configuration and the state layout. The solve mode in
    /// `config` is fixed for the lifetime of the coordinator.
    pub fn new<S, B>(
        config: SolverConfig,
        fluid: FluidParameters,
        hierarchy: H,
        eulerian: EulerianState,
        lagrangian: LagrangianState,
        structure: S,
        boundary: B,
    ) -> Result<Self, IbError>
    where
        S: StructureModel + 'static,
        B: BoundaryConditionProvider + 'static,
    {
        config.validate()?;
        fluid.validate()?;
        eulerian.check_layout(hierarchy.grid())?;
        if lagrangian.positions.ncols() != 2 {
            return Err(IbError::LayoutMismatch(format!(
                "marker positions must be n x 2, got {} columns",
                lagrangian.positions.ncols()
            )));
        }
        structure.validate(lagrangian.positions.nrows())?;
        let registry = OperatorRegistry::new(
            Arc::new(SerialCommunicator),
            config.solve_mode,
            config.fluid_solver,
            config.multigrid_cycles,
            tangential_kinds(&boundary),
        );
        Ok(Self {
            config,
            fluid,
            hierarchy,
            eulerian,
            lagrangian,
            structure: Box::new(structure),
            interaction: Box::new(KernelInteraction),
            boundary: Box::new(boundary),
            body_force: None,
            registry,
            time: 0.0,
            steps_taken: 0,
            step_start: None,
            last_report: None,
        })
    }

    pub fn with_body_force<F: BodyForce + 'static>(mut self, force: F) -> Self {
        self.body_force = Some(Box::new(force));
        self
    }

    pub fn with_interaction<I: InterpolationSpreadOperator + 'static>(mut self, op: I) -> Self {
        self.interaction = Box::new(op);
        self
    }

    /// Run as one of several cooperating workers.
    pub fn with_communicator(mut self, comm: Arc<dyn Communicator>) -> Self {
        self.registry = OperatorRegistry::new(
            comm,
            self.config.solve_mode,
            self.config.fluid_solver,
            self.config.multigrid_cycles,
            tangential_kinds(self.boundary.as_ref()),
        );
        self
    }

    pub fn with_time(mut self, t: f64) -> Self {
        self.time = t;
        self
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn fluid_parameters(&self) -> FluidParameters {
        self.fluid
    }

    pub fn eulerian(&self) -> &EulerianState {
        &self.eulerian
    }

    pub fn lagrangian(&self) -> &LagrangianState {
        &self.lagrangian
    }

    /// Time of the last completed step.
    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn steps_taken(&self) -> u64 {
        self.steps_taken
    }

    pub fn hierarchy(&self) -> &H {
        &self.hierarchy
    }

    /// Mutable access for regridding. A topology change is picked up at the
    /// next `preprocess_integrate`; pair it with `replace_fluid_state`.
    pub fn hierarchy_mut(&mut self) -> &mut H {
        &mut self.hierarchy
    }

    pub fn registry(&self) -> &OperatorRegistry {
        &self.registry
    }

    /// DOF map of the current topology, building it if needed.
    pub fn dof_map(&mut self) -> Result<Arc<DofIndexMap>, IbError> {
        let n = self.lagrangian.positions.nrows();
        self.registry.refresh(&self.hierarchy, n)?;
        self.registry.dof_map()
    }

    /// Swap in fluid data laid out on the current hierarchy grid.
    pub fn replace_fluid_state(&mut self, state: EulerianState) -> Result<(), IbError> {
        state.check_layout(self.hierarchy.grid())?;
        self.eulerian = state;
        Ok(())
    }

    /// Newton report of the most recent solve, failed solves included.
    pub fn last_report(&self) -> Option<&NewtonReport> {
        self.last_report.as_ref()
    }

    pub fn get_number_of_cycles(&self) -> usize {
        self.config.num_cycles
    }

    // ─────────────────────────────────────────────────────────
    //  Step lifecycle
    // ─────────────────────────────────────────────────────────

    /// Record the step-start state and refresh grid-derived objects.
    pub fn preprocess_integrate(
        &mut self,
        current_time: f64,
        new_time: f64,
        num_cycles: usize,
    ) -> Result<(), IbError> {
        check_interval(current_time, new_time)?;
        if num_cycles == 0 {
            return Err(IbError::ConfigurationError(
                "a step needs at least one cycle".into(),
            ));
        }
        let n = self.lagrangian.positions.nrows();
        self.structure.validate(n)?;
        if self.registry.refresh(&self.hierarchy, n)? {
            self.eulerian.check_layout(self.hierarchy.grid())?;
        }
        self.step_start = Some(StepStart {
            current_time,
            new_time,
            num_cycles,
            eulerian: self.eulerian.clone(),
            lagrangian: self.lagrangian.clone(),
            failure: None,
        });
        debug!("preprocess [{current_time}, {new_time}], {num_cycles} cycle(s)");
        Ok(())
    }

    /// Solve the coupled step `[current_time, new_time]` for one cycle.
    ///
    /// On success the owned states hold the converged iterate. On failure
    /// they are exactly as before the call.
    pub fn integrate(
        &mut self,
        current_time: f64,
        new_time: f64,
        cycle: usize,
    ) -> Result<StepReport, IbError> {
        check_interval(current_time, new_time)?;
        let skipped = StepReport {
            current_time,
            new_time,
            cycle,
            skipped: true,
            newton: None,
        };
        if new_time == current_time {
            debug!("zero-length step at t={current_time}; nothing to do");
            return Ok(skipped);
        }

        let fresh = match &self.step_start {
            Some(s) => s.current_time != current_time || s.new_time != new_time,
            None => true,
        };
        if fresh {
            if cycle > 0 {
                return Err(IbError::ConfigurationError(format!(
                    "cycle {cycle} requested without a preceding cycle 0"
                )));
            }
            self.preprocess_integrate(current_time, new_time, self.config.num_cycles)?;
        }
        let n = self.lagrangian.positions.nrows();
        self.registry.refresh(&self.hierarchy, n)?;

        let dt = new_time - current_time;
        let coeffs = OperatorCoefficients {
            dt,
            density: self.fluid.density,
            viscosity: self.fluid.viscosity,
        };
        coeffs.validate()?;
        let map = self.registry.dof_map()?;
        let fluid_block = self.registry.fluid_block(coeffs)?;

        let start = self
            .step_start
            .as_ref()
            .ok_or_else(|| IbError::ConfigurationError("no step in progress".into()))?;
        if cycle >= start.num_cycles {
            return Err(IbError::ConfigurationError(format!(
                "cycle {cycle} out of range for {} cycle(s)",
                start.num_cycles
            )));
        }

        let ctx = StepContext {
            map: Arc::clone(&map),
            comm: self.registry.communicator().as_ref(),
            boundary: self.boundary.as_ref(),
            body_force: self.body_force.as_deref(),
            structure: self.structure.as_ref(),
            interaction: self.interaction.as_ref(),
            fluid: self.fluid,
            new_time,
            dt,
            previous: &start.eulerian,
            previous_positions: &start.lagrangian.positions,
        };
        let evaluator = CompositeResidualEvaluator::new(ctx)?;
        let initial = map.gather(&self.eulerian, &self.lagrangian)?;

        let mut solver = NonlinearCoupledSolver::new(&self.config, &evaluator, fluid_block)?;
        let outcome = solver.solve(&initial);
        let report = solver.report().clone();
        let (solution, positions, fluid) = match outcome {
            Ok((x, _)) => {
                let positions = evaluator.committed_positions(&x)?;
                let mut fluid = self.eulerian.clone();
                map.scatter_fluid(x.as_slice(), &mut fluid)?;
                fill_ghosts(
                    &mut fluid,
                    self.boundary.as_ref(),
                    GhostFill::Boundary { t: new_time },
                );
                (x, positions, fluid)
            }
            Err(e) => {
                warn!(
                    "step [{current_time}, {new_time}] cycle {cycle} failed: {} ({e})",
                    e.kind()
                );
                drop(solver);
                drop(evaluator);
                self.last_report = Some(report);
                if let Some(s) = self.step_start.as_mut() {
                    s.failure = s.failure.or(Some(e.kind()));
                }
                return Err(e);
            }
        };
        drop(solver);
        drop(evaluator);
        self.commit(fluid, positions);
        debug!("cycle {cycle}: committed {} unknowns", solution.len());

        info!(
            "step [{current_time:.6}, {new_time:.6}] cycle {cycle}: {} newton iterations, residual {:.3e}",
            report.iterations,
            report.final_residual()
        );
        self.last_report = Some(report.clone());
        Ok(StepReport {
            newton: Some(report),
            skipped: false,
            ..skipped
        })
    }

    fn commit(&mut self, fluid: EulerianState, positions: Array2<f64>) {
        self.eulerian = fluid;
        if positions.nrows() > 0 {
            self.lagrangian.positions = positions;
        }
    }

    /// Finish the step: marker velocities, ghost synchronization and the
    /// simulation clock.
    ///
    /// If a cycle of the step failed, the owned state is rolled back to the
    /// start of the step, the clock stays put and the failure is returned.
    pub fn postprocess_integrate(
        &mut self,
        current_time: f64,
        new_time: f64,
        skip_synchronize: bool,
        num_cycles: usize,
    ) -> Result<(), IbError> {
        check_interval(current_time, new_time)?;
        if let Some(kind) = self.step_start.as_ref().and_then(|s| s.failure) {
            self.restore_step_start();
            return Err(IbError::ConfigurationError(format!(
                "step [{current_time}, {new_time}] not completed: a cycle failed with {kind}"
            )));
        }
        let start = self.step_start.take();
        if let Some(s) = &start {
            if s.num_cycles != num_cycles {
                warn!(
                    "postprocess with {num_cycles} cycle(s), step was prepared for {}",
                    s.num_cycles
                );
            }
        }
        let dt = new_time - current_time;
        if dt == 0.0 {
            return Ok(());
        }
        if let (Some(s), Some(vel)) = (&start, self.lagrangian.velocities.as_mut()) {
            let moved = &self.lagrangian.positions - &s.lagrangian.positions;
            vel.assign(&(moved / dt));
        }
        if !skip_synchronize {
            fill_ghosts(
                &mut self.eulerian,
                self.boundary.as_ref(),
                GhostFill::Boundary { t: new_time },
            );
        }
        self.time = new_time;
        self.steps_taken += 1;
        Ok(())
    }

    /// Full step: preprocess, every cycle, postprocess. A failing cycle
    /// rolls the owned state back to the start of the step.
    pub fn advance(
        &mut self,
        current_time: f64,
        new_time: f64,
    ) -> Result<Vec<StepReport>, IbError> {
        let cycles = self.get_number_of_cycles();
        self.preprocess_integrate(current_time, new_time, cycles)?;
        let mut reports = Vec::with_capacity(cycles);
        for cycle in 0..cycles {
            match self.integrate(current_time, new_time, cycle) {
                Ok(r) => reports.push(r),
                Err(e) => {
                    self.restore_step_start();
                    return Err(e);
                }
            }
        }
        self.postprocess_integrate(current_time, new_time, false, cycles)?;
        Ok(reports)
    }

    fn restore_step_start(&mut self) {
        if let Some(s) = self.step_start.take() {
            warn!("restoring state from t={}", s.current_time);
            self.eulerian = s.eulerian;
            self.lagrangian = s.lagrangian;
        }
    }

    // ─────────────────────────────────────────────────────────
    //  Restart
    // ─────────────────────────────────────────────────────────

    pub fn config_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            format_version: ConfigSnapshot::FORMAT_VERSION,
            solver: self.config.clone(),
            fluid: self.fluid,
            time: self.time,
            steps_taken: self.steps_taken,
        }
    }

    /// Resume from a snapshot taken by a coordinator of the same mode.
    pub fn restore_config(&mut self, snapshot: ConfigSnapshot) -> Result<(), IbError> {
        if snapshot.solver.solve_mode != self.config.solve_mode {
            return Err(IbError::ConfigurationError(format!(
                "snapshot was taken in {:?} mode, coordinator runs {:?}",
                snapshot.solver.solve_mode, self.config.solve_mode
            )));
        }
        snapshot.solver.validate()?;
        snapshot.fluid.validate()?;
        self.registry
            .reconfigure(snapshot.solver.fluid_solver, snapshot.solver.multigrid_cycles);
        self.config = snapshot.solver;
        self.fluid = snapshot.fluid;
        self.time = snapshot.time;
        self.steps_taken = snapshot.steps_taken;
        self.step_start = None;
        info!("restored configuration at t={} ({} steps)", self.time, self.steps_taken);
        Ok(())
    }
}
