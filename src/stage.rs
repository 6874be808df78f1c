use log::{debug, warn};
use rayon::prelude::*;
use crate::bc;
use crate::error::SolverError;
use crate::exchange::Payload;
use crate::flux::FluxCalculator;
use crate::radiation;
use crate::scheduler::Simulation;




/// Number of tries the inviscid stage gets, each at a reduced time step,
/// before the step is abandoned.
///
pub const MAX_ATTEMPTS: usize = 3;




// ============================================================================
impl Simulation {

    /// Refresh ghost cells of the active blocks: copy shared faces, then
    /// apply the inviscid boundary conditions.
    ///
    pub(crate) fn refresh_ghost_data(&mut self) -> Result<(), SolverError> {
        let t = self.state.sim_time;
        self.exchange.exchange(&mut self.blocks, Payload::FlowState, None)?;

        for block in self.blocks.iter_mut().filter(|b| b.active) {
            bc::apply_inviscid_bc(block, t)?;
        }
        Ok(())
    }

    /// Advance the inviscid terms of all active blocks over `dt_global`. A
    /// failed attempt is rolled back and repeated with a smaller step, up to
    /// `MAX_ATTEMPTS` times.
    ///
    pub(crate) fn inviscid_step(&mut self) -> Result<(), SolverError> {
        let order = self.config.time_order;

        for attempt in 1..=MAX_ATTEMPTS {
            for block in self.blocks.iter_mut().filter(|b| b.active) {
                block.data.record_conserved();
            }
            let invalid = self.inviscid_attempt()?;

            if invalid == 0 || self.config.adjust_invalid_cell_data {
                if invalid > self.config.max_invalid_cells {
                    warn!("{} invalid cells were adjusted at step {} (tolerance {})",
                        invalid, self.state.step, self.config.max_invalid_cells);
                }
                for block in self.blocks.iter_mut().filter(|b| b.active) {
                    block.data.commit_level(order);
                }
                return Ok(());
            }
            self.state.dt_global *= self.config.dt_reduction_factor;

            warn!("inviscid attempt {} at step {} left {} invalid cells; retrying with dt={:e}",
                attempt, self.state.step, invalid, self.state.dt_global);

            for block in self.blocks.iter_mut().filter(|b| b.active) {
                block.data.restore_conserved();
                block.data.decode_conserved(0, self.gas.as_ref(), &self.config.bounds);
            }
        }
        Err(SolverError::InviscidStageFailed {
            attempts: MAX_ATTEMPTS,
            step: self.state.step,
        })
    }

    /// One pass through the configured sub-stages. Returns the number of
    /// invalid cells left at the end, maximised over all workers.
    ///
    fn inviscid_attempt(&mut self) -> Result<usize, SolverError> {
        let order = self.config.time_order;
        let dt = self.state.dt_global;
        let t = self.state.sim_time;
        let grid_moves = self.config.moving_grid && t >= self.state.t_shock;

        for level in 0..order {
            self.refresh_ghost_data()?;

            if level == 0 {
                if self.config.flux_calculator == FluxCalculator::Adaptive {
                    for block in self.blocks.iter_mut().filter(|b| b.active) {
                        block.data.detect_shock_points(self.config.compression_tolerance);
                    }
                }
                if self.config.radiation {
                    if let Some(rt) = self.physics.radiation.as_deref_mut() {
                        radiation::radiation_gate(rt, &mut self.blocks, self.state.step, self.config.radiation_update_frequency)
                            .map_err(|e| SolverError::Collaborator(e.to_string()))?;
                    }
                }
            }
            if self.config.shock_fitting {
                self.exchange.exchange(&mut self.blocks, Payload::InterfaceData, None)?;
            }
            let hooks = self.physics.hooks.as_deref();
            let gm = self.gas.as_ref();
            let mut failed = 0;

            for block in self.blocks.iter_mut().filter(|b| b.active) {
                let data = &mut block.data;

                if grid_moves {
                    data.predict_vertex_positions(level, dt, order);
                }
                data.clear_fluxes();
                data.inviscid_flux(self.config.flux_calculator);
                data.inviscid_source_vectors(level, self.state.heat_factor, hooks, t);
                data.time_derivatives(level);
                data.stage_update(level, dt, order);
                failed += data.decode_conserved(level + 1, gm, &self.config.bounds);
            }
            debug!("step {} sub-stage {}: {} cells failed to decode", self.state.step, level, failed);
        }

        let gm = self.gas.as_ref();
        let adjust = self.config.adjust_invalid_cell_data;
        let local: usize = self
            .blocks
            .iter_mut()
            .filter(|b| b.active)
            .map(|b| b.data.count_invalid_cells(order, adjust, gm))
            .sum();

        Ok(self.exchange.max_usize(local)?)
    }

    /// Advance the viscous terms of all active blocks over `dt_global`. There
    /// is no retry; any cell that fails to decode is fatal.
    ///
    pub(crate) fn viscous_step(&mut self) -> Result<(), SolverError> {
        self.refresh_ghost_data()?;

        let t = self.state.sim_time;
        let dt = self.state.dt_global;
        let gm = self.gas.as_ref();
        let cp = self.config.gas.cp();
        let mut invalid = 0;

        for block in self.blocks.iter_mut().filter(|b| b.active) {
            block.data.clear_fluxes();
            bc::apply_viscous_bc(block, t)?;

            let data = &mut block.data;
            data.estimate_turbulence_viscosity(self.config.k_omega, self.config.turbulence_prandtl, cp);
            data.viscous_flux(self.state.viscous_factor);
            bc::compute_surface_heat_flux(block)?;

            let data = &mut block.data;
            data.clear_source_vectors();
            data.time_derivatives(0);
            data.stage_update(0, dt, 1);
            invalid += data.decode_conserved(1, gm, &self.config.bounds);
        }
        let invalid = self.exchange.max_usize(invalid)?;

        if invalid > 0 {
            return Err(SolverError::ViscousStageFailed { invalid, step: self.state.step });
        }
        for block in self.blocks.iter_mut().filter(|b| b.active) {
            block.data.commit_level(1);
        }
        Ok(())
    }

    /// Advance the species composition of every active cell over
    /// `dt_global` through the chemistry collaborator.
    ///
    pub(crate) fn chemistry_step(&mut self) -> Result<(), SolverError> {
        let chemistry = match self.physics.chemistry.as_deref() {
            Some(chemistry) => chemistry,
            None => return Ok(()),
        };
        let gm = self.gas.as_ref();
        let dt = self.state.dt_global;

        for block in self.blocks.iter_mut().filter(|b| b.active) {
            let id = block.data.id;
            block
                .data
                .cells
                .par_iter_mut()
                .filter(|c| !c.ghost)
                .try_for_each(|c| c.gas_increment(gm, dt, |gas, dt| chemistry.advance(gas, dt)))
                .map_err(|e| SolverError::Collaborator(format!("chemistry in block {}: {}", id, e)))?;
        }
        Ok(())
    }

    /// Relax the energy modes of every active cell over `dt_global` through
    /// the energy-exchange collaborator.
    ///
    pub(crate) fn thermal_step(&mut self) -> Result<(), SolverError> {
        let exchange = match self.physics.energy_exchange.as_deref() {
            Some(exchange) => exchange,
            None => return Ok(()),
        };
        let gm = self.gas.as_ref();
        let dt = self.state.dt_global;

        for block in self.blocks.iter_mut().filter(|b| b.active) {
            let id = block.data.id;
            block
                .data
                .cells
                .par_iter_mut()
                .filter(|c| !c.ghost)
                .try_for_each(|c| c.gas_increment(gm, dt, |gas, dt| exchange.advance(gas, dt)))
                .map_err(|e| SolverError::Collaborator(format!("energy exchange in block {}: {}", id, e)))?;
        }
        Ok(())
    }

    /// Apply `filter.npass` filter passes. Each pass diffuses then
    /// anti-diffuses, refreshing ghost data before each half and
    /// re-applying the boundary conditions after it.
    ///
    pub(crate) fn filter_passes(&mut self) -> Result<(), SolverError> {
        let mu = self.config.filter.mu;
        let t = self.state.sim_time;

        for _ in 0..self.config.filter.npass {
            for anti in [false, true] {
                self.exchange.exchange(&mut self.blocks, Payload::FlowState, None)?;
                let gm = self.gas.as_ref();

                for block in self.blocks.iter_mut().filter(|b| b.active) {
                    let id = block.data.id;
                    block
                        .data
                        .apply_spatial_filter(mu, anti, gm)
                        .map_err(|source| SolverError::Gas { block: id, source })?;
                }
                for block in self.blocks.iter_mut().filter(|b| b.active) {
                    bc::apply_inviscid_bc(block, t)?;

                    if self.config.viscous {
                        bc::apply_viscous_bc(block, t)?;
                    }
                }
            }
        }
        Ok(())
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::sync::Arc;
    use super::*;
    use crate::bc::ExtrapolateOut;
    use crate::block::{Block, BlockMesh};
    use crate::config::{Config, Control};
    use crate::error::GasError;
    use crate::gas::{GasState, IdealGas};
    use crate::geometry::{Face, Vector3d};
    use crate::physics::{ChemistryUpdate, EnergyExchange, Physics};
    use crate::state::FlowState;

    fn simulation(blocks: Vec<Block>, config: Config) -> Simulation {
        let gas = Arc::new(config.gas.clone());
        Simulation::new(config, Control::default(), gas, blocks)
    }

    /// A block with a slip wall on its west face and an outflow on its east
    /// face, in uniform flow moving east at 100 m/s. The first column of
    /// cells drains and its density reaches zero at a step of 1e-4 s.
    ///
    fn draining_block() -> Block {
        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.01, 0.01, 1.0) };
        let mut b = Block::new(0, 2, (6, 3, 1), mesh, &gm);
        b.set_bc(Face::East, Box::new(ExtrapolateOut));
        b.data.fill(|_| FlowState::from_pvt(&gm, 1.0e5, Vector3d::new(100.0, 0.0, 0.0), 300.0, None).unwrap());
        b
    }

    fn first_order() -> Config {
        Config {
            time_order: 1,
            flux_calculator: FluxCalculator::Hlle,
            ..Config::default()
        }
    }

    #[test]
    fn failed_attempts_shrink_the_step_until_it_succeeds() {
        let mut sim = simulation(vec![draining_block()], first_order());
        let dt0 = 6.0e-4;
        sim.state.dt_global = dt0;
        sim.inviscid_step().unwrap();

        assert!((sim.state.dt_global - dt0 * 0.2 * 0.2).abs() < 1e-18);
        assert!(sim.blocks[0].data.interior_cells().all(|c| !c.invalid && c.u[0].mass > 0.0));
        assert!(sim.blocks[0].data.cell((0, 1, 0)).u[0].mass < sim.blocks[0].data.cell((3, 1, 0)).u[0].mass);
    }

    #[test]
    fn exhausted_attempts_restore_the_recorded_state() {
        let mut sim = simulation(vec![draining_block()], first_order());
        let before: Vec<_> = sim.blocks[0].data.interior_cells().map(|c| c.u[0].clone()).collect();
        let dt0 = 1.0e-2;
        sim.state.dt_global = dt0;

        match sim.inviscid_step() {
            Err(SolverError::InviscidStageFailed { attempts, .. }) => assert_eq!(attempts, MAX_ATTEMPTS),
            other => panic!("unexpected {:?}", other),
        }
        assert!((sim.state.dt_global - dt0 * 0.2 * 0.2 * 0.2).abs() < 1e-18);

        for (c, u) in sim.blocks[0].data.interior_cells().zip(&before) {
            assert_eq!(&c.u[0], u);
            assert!(!c.invalid);
        }
    }

    #[test]
    fn adjusting_invalid_cells_accepts_the_first_attempt() {
        let config = Config { adjust_invalid_cell_data: true, ..first_order() };
        let mut sim = simulation(vec![draining_block()], config);
        sim.state.dt_global = 1.2e-4;
        sim.inviscid_step().unwrap();

        assert_eq!(sim.state.dt_global, 1.2e-4);
        assert!(sim.blocks[0].data.interior_cells().all(|c| !c.invalid));
    }

    fn closed_box() -> Block {
        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.01, 0.01, 1.0) };
        let mut b = Block::new(0, 2, (8, 6, 1), mesh, &gm);
        b.data.fill(|x| {
            let p = 1.0e5 * (1.0 + 0.5 * (x.x * 40.0).sin());
            let vel = Vector3d::new(30.0 * (x.y * 50.0).cos(), -20.0 * x.x, 0.0);
            FlowState::from_pvt(&gm, p, vel, 300.0 + 1000.0 * x.y, None).unwrap()
        });
        b
    }

    #[test]
    fn closed_box_conserves_mass_and_energy() {
        let (m0, e0) = closed_box().totals();

        for order in 1..=3 {
            let config = Config { time_order: order, ..Config::default() };
            let mut sim = simulation(vec![closed_box()], config);
            sim.state.dt_global = 1.0e-6;
            sim.inviscid_step().unwrap();
            let (m1, e1) = sim.blocks[0].totals();
            assert!(((m1 - m0) / m0).abs() < 1e-12, "order {}: mass {} -> {}", order, m0, m1);
            assert!(((e1 - e0) / e0).abs() < 1e-12, "order {}: energy {} -> {}", order, e0, e1);
        }
    }

    struct Recombine;

    impl ChemistryUpdate for Recombine {
        fn advance(&self, gas: &mut GasState, dt: f64) -> Result<(), GasError> {
            let dy = (1.0e3 * dt).min(gas.massf[0]);
            gas.massf[0] -= dy;
            gas.massf[1] += dy;
            Ok(())
        }
    }

    struct Broken;

    impl EnergyExchange for Broken {
        fn advance(&self, _gas: &mut GasState, _dt: f64) -> Result<(), GasError> {
            Err(GasError::Collaborator("relaxation table missing".into()))
        }
    }

    fn two_species_block() -> (Config, Block) {
        let config = Config {
            gas: IdealGas { species: 2, ..IdealGas::default() },
            ..Config::default()
        };
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.01, 0.01, 1.0) };
        let mut b = Block::new(0, 2, (3, 3, 1), mesh, &config.gas);
        let gm = config.gas.clone();
        b.data.fill(|_| FlowState::from_pvt(&gm, 1.0e5, Vector3d::zero(), 300.0, Some(&[1.0, 0.0])).unwrap());
        (config, b)
    }

    #[test]
    fn chemistry_advances_composition_and_reencodes() {
        let (config, b) = two_species_block();
        let mut sim = simulation(vec![b], config)
            .with_physics(Physics { chemistry: Some(Box::new(Recombine)), ..Physics::default() });
        sim.state.dt_global = 1.0e-4;
        sim.chemistry_step().unwrap();

        for c in sim.blocks[0].data.interior_cells() {
            assert!((c.fs.gas.massf[1] - 0.1).abs() < 1e-12);
            assert!((c.u[0].massf[1] - 0.1 * c.u[0].mass).abs() < 1e-12);
        }
    }

    #[test]
    fn thermal_collaborator_errors_are_fatal() {
        let (config, b) = two_species_block();
        let mut sim = simulation(vec![b], config)
            .with_physics(Physics { energy_exchange: Some(Box::new(Broken)), ..Physics::default() });
        sim.state.dt_global = 1.0e-4;
        assert!(matches!(sim.thermal_step(), Err(SolverError::Collaborator(_))));
    }

    #[test]
    fn absent_collaborators_are_skipped() {
        let (config, b) = two_species_block();
        let mut sim = simulation(vec![b], config);
        sim.state.dt_global = 1.0e-4;
        sim.chemistry_step().unwrap();
        sim.thermal_step().unwrap();
    }

    #[test]
    fn filter_passes_keep_a_uniform_state() {
        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.01, 0.01, 1.0) };
        let mut b = Block::new(0, 2, (5, 4, 1), mesh, &gm);
        b.data.fill(|_| FlowState::from_pvt(&gm, 1.0e5, Vector3d::zero(), 300.0, None).unwrap());
        let (m0, _) = b.totals();

        let mut config = Config::default();
        config.filter.npass = 3;
        let mut sim = simulation(vec![b], config);
        sim.refresh_ghost_data().unwrap();
        sim.filter_passes().unwrap();
        let (m1, _) = sim.blocks[0].totals();
        assert!(((m1 - m0) / m0).abs() < 1e-12);
    }
}
