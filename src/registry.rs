//! Per-run registry of grid-derived objects.
//!
//! Holds the shared DOF map and the cached fluid block. Both are keyed on
//! the hierarchy generation; a regrid drops them so the next solve rebuilds
//! against the new topology.

use std::sync::Arc;

use log::{debug, info};

use crate::comm::Communicator;
use crate::config::{FluidSolverKind, SolveMode};
use crate::dof::DofIndexMap;
use crate::grid::GridHierarchyProvider;
use crate::operator::{BlockOperator, OperatorCoefficients};
use crate::stokes::{FluidBlock, TangentialKinds};
use crate::types::IbError;

#[derive(Debug)]
pub struct OperatorRegistry {
    comm: Arc<dyn Communicator>,
    mode: SolveMode,
    fluid_kind: FluidSolverKind,
    multigrid_cycles: usize,
    tangential: TangentialKinds,
    generation: Option<u64>,
    map: Option<Arc<DofIndexMap>>,
    fluid: Option<Arc<FluidBlock>>,
    rebuilds: usize,
}

impl OperatorRegistry {
    pub fn new(
        comm: Arc<dyn Communicator>,
        mode: SolveMode,
        fluid_kind: FluidSolverKind,
        multigrid_cycles: usize,
        tangential: TangentialKinds,
    ) -> Self {
        Self {
            comm,
            mode,
            fluid_kind,
            multigrid_cycles,
            tangential,
            generation: None,
            map: None,
            fluid: None,
            rebuilds: 0,
        }
    }

    pub fn communicator(&self) -> &Arc<dyn Communicator> {
        &self.comm
    }

    /// Number of DOF map constructions so far.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    /// Rebuild the DOF map if the hierarchy moved to a new generation or
    /// the marker count changed. Returns whether anything was rebuilt.
    pub fn refresh(
        &mut self,
        hierarchy: &dyn GridHierarchyProvider,
        num_markers: usize,
    ) -> Result<bool, IbError> {
        let generation = hierarchy.generation();
        let stale = match (&self.map, self.generation) {
            (Some(map), Some(g)) => g != generation || map.num_markers() != num_markers,
            _ => true,
        };
        if !stale {
            return Ok(false);
        }
        if self.generation.is_some_and(|g| g != generation) {
            info!("regrid detected (generation {generation}); rebuilding operators");
        }
        let map = DofIndexMap::new(hierarchy.grid(), num_markers, self.mode, self.comm.as_ref());
        debug!("dof map: {} unknowns", map.len());
        self.map = Some(Arc::new(map));
        self.fluid = None;
        self.generation = Some(generation);
        self.rebuilds += 1;
        Ok(true)
    }

    pub fn dof_map(&self) -> Result<Arc<DofIndexMap>, IbError> {
        self.map
            .clone()
            .ok_or_else(|| IbError::LayoutMismatch("DOF map requested before refresh".into()))
    }

    /// Fluid block for `coeffs`, reusing the cached one when possible.
    pub fn fluid_block(
        &mut self,
        coeffs: OperatorCoefficients,
    ) -> Result<Arc<FluidBlock>, IbError> {
        let map = self.dof_map()?;
        if let Some(cached) = self.fluid.as_mut() {
            if cached.coefficients() == coeffs {
                return Ok(Arc::clone(cached));
            }
            match Arc::get_mut(cached) {
                Some(block) => block.set_coefficients(coeffs)?,
                None => *cached = Arc::new(cached.rebuilt(coeffs)?),
            }
            debug!("fluid block updated for dt={}", coeffs.dt);
            return Ok(Arc::clone(cached));
        }
        let block = Arc::new(FluidBlock::new(
            map,
            Arc::clone(&self.comm),
            self.tangential,
            coeffs,
            self.fluid_kind,
            self.multigrid_cycles,
        )?);
        self.fluid = Some(Arc::clone(&block));
        Ok(block)
    }

    /// Change the fluid strategy; the cached block is dropped.
    pub fn reconfigure(&mut self, fluid_kind: FluidSolverKind, multigrid_cycles: usize) {
        if fluid_kind != self.fluid_kind || multigrid_cycles != self.multigrid_cycles {
            self.fluid_kind = fluid_kind;
            self.multigrid_cycles = multigrid_cycles;
            self.fluid = None;
        }
    }
}
