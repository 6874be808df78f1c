use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::block::Block;
use crate::cell::{Cell, STEFAN_BOLTZMANN};
use crate::error::GasError;
use crate::gas::GasState;
use crate::geometry::Vector3d;
use crate::index_space::Index;
use crate::state::ConservedQuantities;




/**
 * Finite-rate chemistry: advance the composition of one cell's gas over a
 * time interval. Implementations need not update the thermodynamic state;
 * the caller does that afterwards.
 */
pub trait ChemistryUpdate: Send + Sync {
    fn advance(&self, gas: &mut GasState, dt: f64) -> Result<(), GasError>;
}




/**
 * Thermal relaxation between energy modes over a time interval.
 */
pub trait EnergyExchange: Send + Sync {
    fn advance(&self, gas: &mut GasState, dt: f64) -> Result<(), GasError>;
}




/**
 * Radiation transport. The scheduler calls `compute_q_rad_for_flowfield` only
 * at the configured cadence; in between, each cell rescales the last result
 * from its own temperature.
 */
pub trait RadiationTransport: Send + Sync {
    fn initialise(&mut self, _blocks: &[Block]) -> Result<(), GasError> {
        Ok(())
    }

    /**
     * Set `q_rad` of every interior cell of the active blocks.
     */
    fn compute_q_rad_for_flowfield(&mut self, blocks: &mut [Block]) -> Result<(), GasError>;
}




/**
 * Rigid or prescribed motion of the block grids.
 */
pub trait GridMotion: Send + Sync {
    fn velocity(&self, block: usize, t: f64) -> Vector3d;
}




/**
 * Optional user callbacks. Every method defaults to doing nothing.
 */
pub trait UserHooks: Send + Sync {
    fn at_timestep_start(&self, _sim_time: f64, _step: usize) {}

    fn at_timestep_end(&self, _sim_time: f64, _step: usize) {}

    /**
     * Add a user source term to the source vector `q` of one cell, at the
     * time level being integrated.
     */
    fn source_vector(
        &self,
        _block: usize,
        _index: Index,
        _cell: &Cell,
        _level: usize,
        _t: f64,
        _q: &mut ConservedQuantities)
    {
    }
}




/**
 * The optional collaborators of a simulation. Any that are absent are
 * skipped even when enabled in the configuration, with a warning.
 */
#[derive(Default)]
pub struct Physics {
    pub chemistry: Option<Box<dyn ChemistryUpdate>>,
    pub energy_exchange: Option<Box<dyn EnergyExchange>>,
    pub radiation: Option<Box<dyn RadiationTransport>>,
    pub grid_motion: Option<Box<dyn GridMotion>>,
    pub hooks: Option<Box<dyn UserHooks>>,
}




/**
 * Grey, optically thin emission: every cell loses `4 sigma kappa T^4` per unit
 * volume.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpticallyThinEmission {
    pub absorption_coefficient: f64,
}

impl RadiationTransport for OpticallyThinEmission {
    fn compute_q_rad_for_flowfield(&mut self, blocks: &mut [Block]) -> Result<(), GasError> {
        let kappa = self.absorption_coefficient;

        for block in blocks.iter_mut().filter(|b| b.active) {
            block
                .data
                .cells
                .par_iter_mut()
                .filter(|c| !c.ghost)
                .for_each(|c| c.q_rad = -4.0 * STEFAN_BOLTZMANN * kappa * c.fs.gas.temperature().powi(4));
        }
        Ok(())
    }
}




/**
 * Every block translates with the same constant velocity.
 */
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RigidTranslation {
    pub velocity: Vector3d,
}

impl GridMotion for RigidTranslation {
    fn velocity(&self, _block: usize, _t: f64) -> Vector3d {
        self.velocity
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::block::BlockMesh;
    use crate::gas::IdealGas;
    use crate::state::FlowState;

    #[test]
    fn optically_thin_emission_scales_with_fourth_power() {
        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.1, 0.1, 1.0) };
        let mut blocks = vec![Block::new(0, 2, (2, 2, 1), mesh, &gm)];
        blocks[0].data.fill(|x| FlowState::from_pvt(&gm, 1.0e5, Vector3d::zero(), if x.x < 0.1 { 1000.0 } else { 2000.0 }, None).unwrap());

        let mut rt = OpticallyThinEmission { absorption_coefficient: 0.5 };
        rt.compute_q_rad_for_flowfield(&mut blocks).unwrap();

        let cold = blocks[0].data.cell((0, 0, 0)).q_rad;
        let hot = blocks[0].data.cell((1, 0, 0)).q_rad;
        assert!(cold < 0.0);
        assert!((hot / cold - 16.0).abs() < 1e-9);
        assert!((cold + 2.0 * STEFAN_BOLTZMANN * 1e12).abs() < 1e-3);
    }
}
