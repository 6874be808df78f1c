//! The outer time loop. A `Simulation` owns the blocks of one worker, the
//! run state and the collaborators, and advances them in global steps of an
//! adaptively chosen size until a termination condition holds.
//!

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use log::{debug, error, info, warn};
use crate::bc::{self, BoundaryCondition, ExtrapolateOut};
use crate::block::Block;
use crate::config::{Config, Control};
use crate::error::SolverError;
use crate::exchange::{Exchange, LocalExchange, Payload};
use crate::gas::GasModel;
use crate::geometry::Face;
use crate::output::{OutputWriter, FINAL_OUTPUT_INDEX};
use crate::physics::{OpticallyThinEmission, Physics};
use crate::radiation;




/// Peak CFL above which the run is abandoned.
///
pub const CFL_CEILING: f64 = 100.0;

/// Largest factor by which one adjustment may grow the time step.
///
pub const DT_GROWTH_LIMIT: f64 = 1.5;

/// Factor applied to the time step when viscous terms switch on mid-run.
///
const VISCOUS_ONSET_DT_FACTOR: f64 = 0.2;




/**
 * Why a call to `integrate_in_time` returned normally. Several may hold at
 * the same step.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    ReachedTime,
    ReachedMaxStep,
    Halted,
    WallClock,
    RadiationScaling,
}




/**
 * Adapt the global time step toward the allowable one: drop to it at once
 * if it is smaller, otherwise grow by at most `DT_GROWTH_LIMIT`.
 */
pub fn adapt_time_step(dt_current: f64, dt_allow: f64) -> f64 {
    if dt_allow <= dt_current {
        dt_allow
    } else {
        (DT_GROWTH_LIMIT * dt_current).min(dt_allow)
    }
}

fn on_cadence(step: usize, every: usize) -> bool {
    every > 0 && step % every == 0
}




/**
 * The mutable state of a run: time, step, the adaptive step bookkeeping,
 * the activation ramps and the next event times.
 */
#[derive(Clone, Debug)]
pub struct RunState {
    pub sim_time: f64,
    pub step: usize,
    pub dt_global: f64,
    pub dt_allow: f64,
    pub cfl_min: f64,
    pub cfl_max: f64,
    pub cfl_peak: f64,
    pub cfl_tiny: f64,
    pub time_tiny: f64,
    pub viscous_factor: f64,
    pub viscous_on: bool,
    pub heat_factor: f64,
    pub cfl_check_pending: bool,
    pub t_plot: f64,
    pub t_his: f64,
    pub t_shock: f64,
    pub filter_enabled: bool,
    pub filter_next_time: f64,
    pub output_index: usize,
    pub output_just_written: bool,
    pub history_just_written: bool,
}




// ============================================================================
impl Default for RunState {
    fn default() -> Self {
        Self {
            sim_time: 0.0,
            step: 0,
            dt_global: 0.0,
            dt_allow: f64::INFINITY,
            cfl_min: 0.0,
            cfl_max: 0.0,
            cfl_peak: 0.0,
            cfl_tiny: 1.0,
            time_tiny: 0.0,
            viscous_factor: 0.0,
            viscous_on: false,
            heat_factor: 0.0,
            cfl_check_pending: false,
            t_plot: 0.0,
            t_his: 0.0,
            t_shock: 0.0,
            filter_enabled: false,
            filter_next_time: 0.0,
            output_index: 0,
            output_just_written: true,
            history_just_written: true,
        }
    }
}




// ============================================================================
impl RunState {

    /// The step size the last search would allow next, or the current step
    /// if no search has run.
    ///
    pub fn dt_next(&self) -> f64 {
        if self.dt_allow.is_finite() {
            self.dt_allow
        } else {
            self.dt_global
        }
    }

    /**
     * Set the ramp factors from the activation windows at the current time.
     */
    pub fn init_ramps(&mut self, config: &Config) {
        let t = self.sim_time;

        if config.viscous {
            if config.viscous_time_delay > 0.0 && t < config.viscous_time_delay {
                self.viscous_factor = 0.0;
                self.viscous_on = false;
            } else {
                self.viscous_factor = 1.0;
                self.viscous_on = true;
            }
        } else {
            self.viscous_factor = 0.0;
            self.viscous_on = false;
        }

        self.heat_factor = if config.heat_time_stop == 0.0 {
            0.0
        } else if t >= config.heat_time_start && t < config.heat_time_stop {
            1.0
        } else {
            0.0
        };
    }

    /**
     * Advance the ramp factors by one step. Switching the viscous terms on
     * after the first step cuts the time step; any increment requests a CFL
     * check.
     */
    pub fn advance_ramps(&mut self, config: &Config) {
        let t = self.sim_time;

        if config.viscous {
            if !self.viscous_on && t >= config.viscous_time_delay {
                self.viscous_on = true;

                if self.step > 0 {
                    self.viscous_factor = 0.0;
                    self.dt_global *= VISCOUS_ONSET_DT_FACTOR;
                } else {
                    self.viscous_factor = 1.0;
                }
                info!("viscous terms switched on at t={:e}, step {}", t, self.step);
            }
            if self.viscous_on && self.viscous_factor < 1.0 {
                self.viscous_factor = (self.viscous_factor + config.viscous_factor_increment).min(1.0);
                self.cfl_check_pending = true;
            }
        }

        if config.heat_time_stop > 0.0 {
            if t >= config.heat_time_start && t < config.heat_time_stop {
                if self.heat_factor < 1.0 {
                    self.heat_factor = (self.heat_factor + config.heat_factor_increment).min(1.0);
                    self.cfl_check_pending = true;
                }
            } else {
                self.heat_factor = 0.0;
            }
        }
    }

    /**
     * Schedule the first filter application, or disable the filter if it
     * would fall after its window.
     */
    pub fn init_filter(&mut self, config: &Config) {
        let filter = &config.filter;
        self.filter_enabled = filter.enabled;

        if self.sim_time > filter.tstart {
            self.filter_next_time = self.sim_time + filter.dt;

            if self.filter_next_time > filter.tend {
                self.filter_enabled = false;
            }
        } else {
            self.filter_next_time = filter.tstart;
        }
    }
}




/// One worker's share of a simulation: its blocks, the run state, the
/// collaborators and the output sinks. Driven through
/// `prepare_to_integrate`, `integrate_in_time` and `finalize`, or all three
/// at once with `run`.
///
pub struct Simulation {
    pub(crate) config: Config,
    pub(crate) control: Control,
    pub(crate) state: RunState,
    pub(crate) blocks: Vec<Block>,
    pub(crate) physics: Physics,
    pub(crate) gas: Arc<dyn GasModel>,
    pub(crate) exchange: Box<dyn Exchange>,
    pub(crate) output: Option<OutputWriter>,
    pub(crate) control_path: Option<PathBuf>,
    pub(crate) halt: Arc<AtomicBool>,
    pub(crate) max_wall_clock: Option<Duration>,
    pub(crate) wall_clock_start: Instant,
}




// ============================================================================
impl Simulation {

    pub fn new(config: Config, control: Control, gas: Arc<dyn GasModel>, blocks: Vec<Block>) -> Self {
        Self {
            config,
            control,
            state: RunState::default(),
            blocks,
            physics: Physics::default(),
            gas,
            exchange: Box::new(LocalExchange),
            output: None,
            control_path: None,
            halt: Arc::new(AtomicBool::new(false)),
            max_wall_clock: None,
            wall_clock_start: Instant::now(),
        }
    }

    pub fn with_exchange(mut self, exchange: Box<dyn Exchange>) -> Self {
        self.exchange = exchange;
        self
    }

    pub fn with_physics(mut self, physics: Physics) -> Self {
        self.physics = physics;
        self
    }

    pub fn with_output(mut self, output: OutputWriter) -> Self {
        self.output = Some(output);
        self
    }

    /// Re-read the given control file at `control_count` cadence.
    ///
    pub fn with_control_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.control_path = Some(path.into());
        self
    }

    /// Stop at the end of the step in which the flag is found set.
    ///
    pub fn with_halt_flag(mut self, halt: Arc<AtomicBool>) -> Self {
        self.halt = halt;
        self
    }

    pub fn with_max_wall_clock(mut self, budget: Duration) -> Self {
        self.max_wall_clock = Some(budget);
        self
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    fn is_master(&self) -> bool {
        self.exchange.rank() == 0
    }

    /// Load the flow snapshots with the given index into every local block,
    /// and take the simulation time from them.
    ///
    pub fn load_flow(&mut self, tindx: usize) -> Result<(), SolverError> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| SolverError::NotImplemented("resuming without a run directory".to_owned()))?;

        for block in &mut self.blocks {
            self.state.sim_time = output.read_flow(block, tindx)?;
        }
        info!("loaded flow snapshot {:04} at t={:e}", tindx, self.state.sim_time);
        Ok(())
    }

    /// Move every local block to the position recorded in the grid snapshot
    /// with the given index.
    ///
    pub fn load_grid(&mut self, tindx: usize) -> Result<(), SolverError> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| SolverError::NotImplemented("resuming without a run directory".to_owned()))?;

        for block in &mut self.blocks {
            output.read_grid(block, tindx)?;
        }
        debug!("loaded grid snapshot {:04}", tindx);
        Ok(())
    }

    fn update_grid_velocities(&mut self) {
        let t = self.state.sim_time;

        for block in &mut self.blocks {
            let vel = match self.physics.grid_motion.as_deref() {
                Some(motion) => motion.velocity(block.id(), t),
                None => self.config.grid_velocity,
            };
            block.data.set_grid_velocity(vel);
        }
    }

    /**
     * Bring the blocks to a consistent starting state: resume from a
     * snapshot if `start_tindx > 0`, encode and decode the conserved state,
     * initialise the collaborators and open the output sinks.
     */
    pub fn prepare_to_integrate(&mut self, start_tindx: usize) -> Result<(), SolverError> {
        if self.config.radiation && self.physics.radiation.is_none() {
            self.physics.radiation = Some(Box::new(OpticallyThinEmission {
                absorption_coefficient: self.config.absorption_coefficient,
            }));
        }
        if self.config.reacting && self.physics.chemistry.is_none() {
            warn!("chemistry is enabled but no chemistry update is attached; skipping it");
        }
        if self.config.energy_exchange && self.physics.energy_exchange.is_none() {
            warn!("thermal relaxation is enabled but no energy exchange is attached; skipping it");
        }

        if start_tindx > 0 {
            self.load_flow(start_tindx)?;

            if self.config.moving_grid {
                self.load_grid(start_tindx)?;
            }

            if self.config.viscous {
                if let Some(output) = self.output.as_ref() {
                    for block in &mut self.blocks {
                        output.read_heat_flux(block, start_tindx)?;
                    }
                }
            }
        }
        if self.config.moving_grid {
            self.update_grid_velocities();
        }

        let gm = self.gas.as_ref();
        let mut invalid = 0;

        for block in &mut self.blocks {
            block.data.init_time_level_geometry();
            block.data.encode_conserved();
            invalid += block.data.decode_conserved(0, gm, &self.config.bounds);
        }
        if invalid > 0 {
            warn!("{} cells failed to decode from the initial state", invalid);
        }
        self.exchange.exchange(&mut self.blocks, Payload::InterfaceData, None)?;

        if let Some(rt) = self.physics.radiation.as_deref_mut() {
            rt.initialise(&self.blocks).map_err(|e| SolverError::Collaborator(e.to_string()))?;
        }

        let master = self.is_master();
        let t = self.state.sim_time;
        let dt_init = self.control.dt_init;

        if let Some(output) = self.output.as_mut() {
            for block in &self.blocks {
                output.write_history_header(block)?;
            }
            if master {
                output.open_ledger(start_tindx > 0)?;
            }
        }
        if start_tindx == 0 && self.output.is_some() {
            if let Some(output) = self.output.as_mut() {
                output.append_ledger(0, t, dt_init)?;
            }
            self.write_fields(0)?;
        }
        self.state.output_index = start_tindx;
        self.wall_clock_start = Instant::now();
        Ok(())
    }

    /// Write the flow snapshot of every local block with the given index,
    /// plus the grid, vertex velocity and heat-flux files the run needs.
    ///
    fn write_fields(&self, tindx: usize) -> Result<(), SolverError> {
        let output = match self.output.as_ref() {
            Some(output) => output,
            None => return Ok(()),
        };
        let t = self.state.sim_time;

        for block in &self.blocks {
            output.write_flow(block, tindx, t)?;

            if self.config.moving_grid {
                output.write_grid(block, tindx, t)?;

                if self.config.write_vertex_velocities {
                    output.write_vertex_velocities(block, tindx, t)?;
                }
            }
            if self.config.viscous {
                output.write_heat_flux(block, tindx, t)?;
            }
        }
        Ok(())
    }

    fn write_snapshot(&mut self, tindx: usize) -> Result<(), SolverError> {
        let (t, dt) = (self.state.sim_time, self.state.dt_global);

        if let Some(output) = self.output.as_mut() {
            output.append_ledger(tindx, t, dt)?;
        }
        self.write_fields(tindx)?;
        info!("wrote snapshot {:04} at t={:e}", tindx, t);
        Ok(())
    }

    // TODO: read on rank 0 and broadcast, so workers never act on different
    // versions of a file edited mid-read.
    fn reload_control(&mut self) {
        let path = match self.control_path.as_ref() {
            Some(path) => path,
            None => return,
        };
        match Control::read(path) {
            Ok(control) => {
                if control != self.control {
                    debug!("control parameters reloaded from {}", path.display());
                }
                self.control = control;
            }
            Err(e) if e.is_not_found() => debug!("{} not found; keeping previous control parameters", path.display()),
            Err(e) => warn!("keeping previous control parameters: {}", e),
        }
    }

    /// Search for the largest stable step over the active blocks of every
    /// worker, and move `dt_global` toward it.
    ///
    fn search_time_step(&mut self) -> Result<(), SolverError> {
        let (dt, cfl_target, vf) = (self.state.dt_global, self.control.cfl_target, self.state.viscous_factor);
        let mut failed = false;
        let mut dt_allow = f64::INFINITY;
        let mut cfl_max = 0.0_f64;
        let mut cfl_min = f64::INFINITY;

        for block in self.blocks.iter_mut().filter(|b| b.active) {
            if !block.determine_time_step_size(dt, cfl_target, vf) {
                warn!("block {} reports no usable signal speed", block.id());
                failed = true;
                continue;
            }
            dt_allow = dt_allow.min(block.dt_allow);
            cfl_max = cfl_max.max(block.cfl_max);
            cfl_min = cfl_min.min(block.cfl_min);
        }
        if self.exchange.any(failed)? {
            return Err(SolverError::DtSearchFailed { step: self.state.step });
        }
        self.state.dt_allow = self.exchange.min_f64(dt_allow)?;
        self.state.cfl_max = self.exchange.max_f64(cfl_max)?;
        self.state.cfl_min = self.exchange.min_f64(cfl_min)?;
        self.state.cfl_peak = self.state.cfl_peak.max(self.state.cfl_max);
        self.state.dt_global = adapt_time_step(self.state.dt_global, self.state.dt_allow);
        Ok(())
    }

    fn log_status(&self, stopping_time: f64, active: f64) {
        let s = &self.state;
        let wc = self.wall_clock_start.elapsed().as_secs_f64();
        let per_step = if s.step > 0 { wc / s.step as f64 } else { 0.0 };
        let to_final_time = if s.dt_global > 0.0 { (stopping_time - s.sim_time).max(0.0) / s.dt_global * per_step } else { 0.0 };
        let to_max_step = self.control.max_step.saturating_sub(s.step) as f64 * per_step;

        info!("step={} t={:e} dt={:e} WC={:.1} WCtFT={:.1} WCtMS={:.1}",
            s.step, s.sim_time, s.dt_global, wc, to_final_time, to_max_step);
        info!("CFL min={:.4} max={:.4} tiny={:.4} at t={:e}, active blocks={}",
            s.cfl_min, s.cfl_max, s.cfl_tiny, s.time_tiny, active);

        for block in self.blocks.iter().filter(|b| b.active) {
            debug!("block {} dt_allow={:e} cfl=[{:.4}, {:.4}]", block.id(), block.dt_allow, block.cfl_min, block.cfl_max);
        }
    }

    fn log_residuals(&mut self) -> Result<(), SolverError> {
        let mut mass = 0.0_f64;
        let mut energy = 0.0_f64;

        for block in self.blocks.iter_mut().filter(|b| b.active) {
            block.compute_residuals();
            mass = mass.max(block.mass_residual);
            energy = energy.max(block.energy_residual);
        }
        let mass = self.exchange.max_f64(mass)?;
        let energy = self.exchange.max_f64(energy)?;
        info!("residuals at step {}: mass={:e} energy={:e}", self.state.step, mass, energy);
        Ok(())
    }

    fn recompute_geometry(&mut self) {
        self.update_grid_velocities();

        for block in &mut self.blocks {
            block.data.compute_primary_cell_geometric_data(0);
            block.data.init_time_level_geometry();
        }
    }

    /**
     * Advance all active blocks until `target_time` (or `max_time` from the
     * control parameters if none is given) or another termination condition
     * holds. Returns every condition that held at the final step.
     */
    pub fn integrate_in_time(&mut self, target_time: Option<f64>) -> Result<Vec<StopReason>, SolverError> {
        self.state.step = 0;
        let mut stopping_time = target_time.unwrap_or(self.control.max_time);

        let t = self.state.sim_time;
        self.state.t_plot = t + self.control.dt_plot;
        self.state.t_his = t + self.control.dt_history;
        self.state.t_shock = t + self.control.dt_shock;
        self.state.output_just_written = true;
        self.state.history_just_written = true;
        self.state.init_ramps(&self.config);
        self.state.init_filter(&self.config);

        if t >= stopping_time || self.state.step >= self.control.max_step {
            info!("nothing to integrate: t={:e}, stopping at {:e}", t, stopping_time);
            return Ok(Vec::new());
        }
        info!("integrating from t={:e} to t={:e}", t, stopping_time);

        loop {
            if on_cadence(self.state.step, self.control.control_count) {
                self.reload_control();
            }
            if target_time.is_none() {
                stopping_time = self.control.max_time;
            }

            let local_active = self.blocks.iter().filter(|b| b.active).count() as f64;
            let active = self.exchange.sum_f64(local_active)?;

            if active == 0.0 {
                error!("no active blocks at step {}", self.state.step);
                return Err(SolverError::NoActiveBlocks { step: self.state.step });
            }
            self.state.advance_ramps(&self.config);

            if let Some(hooks) = self.physics.hooks.as_deref() {
                hooks.at_timestep_start(self.state.sim_time, self.state.step);
            }
            for block in self.blocks.iter_mut().filter(|b| b.active) {
                block.data.init_residuals();
            }

            if self.state.step == 0 {
                self.state.cfl_check_pending = false;

                if !(self.config.sequence_blocks && self.state.dt_global != 0.0) {
                    self.state.dt_global = self.control.dt_init;
                }
            } else if !self.control.fixed_time_step && on_cadence(self.state.step, self.control.cfl_count) {
                self.state.cfl_check_pending = true;
            }
            if self.state.cfl_check_pending {
                self.search_time_step()?;
                self.state.cfl_check_pending = false;
            }

            if self.state.step > 5 && self.state.cfl_max < self.state.cfl_tiny {
                self.state.cfl_tiny = self.state.cfl_max;
                self.state.time_tiny = self.state.sim_time;
            }
            if self.state.cfl_max > CFL_CEILING {
                error!("peak CFL {} exceeds {} at step {}", self.state.cfl_max, CFL_CEILING, self.state.step);
                return Err(SolverError::CflCeiling { cfl: self.state.cfl_max, step: self.state.step });
            }

            self.inviscid_step()?;

            if self.config.moving_grid && self.state.sim_time >= self.state.t_shock {
                self.recompute_geometry();
                self.state.t_shock += self.control.dt_shock;
            }
            if self.config.viscous && self.state.viscous_on {
                self.viscous_step()?;
            }
            if self.state.sim_time >= self.config.reaction_time_start {
                if self.config.reacting {
                    self.chemistry_step()?;
                }
                if self.config.energy_exchange {
                    self.thermal_step()?;
                }
            }

            self.state.step += 1;
            self.state.output_just_written = false;
            self.state.history_just_written = false;
            self.state.sim_time += self.state.dt_global;
            let status_step = on_cadence(self.state.step, self.control.print_count);

            if status_step {
                self.log_status(stopping_time, active);
            }
            if self.state.sim_time >= self.state.t_plot && !self.state.output_just_written {
                self.state.output_index += 1;
                self.write_snapshot(self.state.output_index)?;
                self.state.output_just_written = true;
                self.state.t_plot += self.control.dt_plot;
            }
            if self.state.sim_time >= self.state.t_his && !self.state.history_just_written {
                if let Some(output) = self.output.as_ref() {
                    for block in &self.blocks {
                        output.write_history(block, self.state.sim_time)?;
                    }
                }
                self.state.history_just_written = true;
                self.state.t_his += self.control.dt_history;
            }
            if status_step {
                self.log_residuals()?;
            }

            if self.state.filter_enabled && self.state.sim_time > self.state.filter_next_time {
                self.filter_passes()?;
                self.state.filter_next_time = self.state.sim_time + self.config.filter.dt;

                if self.state.filter_next_time > self.config.filter.tend {
                    self.state.filter_enabled = false;
                }
            }
            if let Some(hooks) = self.physics.hooks.as_deref() {
                hooks.at_timestep_end(self.state.sim_time, self.state.step);
            }

            let reasons = self.termination_reasons(stopping_time)?;

            if !reasons.is_empty() {
                for reason in &reasons {
                    info!("stopping at step {}, t={:e}: {:?}", self.state.step, self.state.sim_time, reason);
                }
                return Ok(reasons);
            }
        }
    }

    fn termination_reasons(&mut self, stopping_time: f64) -> Result<Vec<StopReason>, SolverError> {
        let mut reasons = Vec::new();

        if self.state.sim_time >= stopping_time {
            reasons.push(StopReason::ReachedTime);
        }
        if self.state.step >= self.control.max_step {
            reasons.push(StopReason::ReachedMaxStep);
        }
        let halt = self.control.halt_now || self.halt.load(Ordering::SeqCst);

        if self.exchange.any(halt)? {
            reasons.push(StopReason::Halted);
        }
        let out_of_time = self
            .max_wall_clock
            .map_or(false, |budget| self.wall_clock_start.elapsed() > budget);

        if self.exchange.any(out_of_time)? {
            reasons.push(StopReason::WallClock);
        }
        if self.config.radiation && self.config.check_radiation_scaling {
            let ratio = self.exchange.max_f64(radiation::max_scaling_ratio(&self.blocks))?;

            if ratio > radiation::RADIATION_SCALING_LIMIT {
                warn!("radiation scaling ratio {:e} exceeds {:e}", ratio, radiation::RADIATION_SCALING_LIMIT);
                reasons.push(StopReason::RadiationScaling);
            }
        }
        Ok(reasons)
    }

    /**
     * Integrate a chain of blocks two at a time from West to East, each pair
     * for `max_time / (nblock - 1)`. The downstream block of each pair sees
     * an outflow condition on its East face while it leads the chain.
     */
    pub fn integrate_blocks_in_sequence(&mut self) -> Result<Vec<StopReason>, SolverError> {
        if self.exchange.is_distributed() {
            return Err(SolverError::NotImplemented("block-sequence integration across workers".to_owned()));
        }
        let nblock = self.blocks.len();

        if nblock < 2 {
            return self.integrate_in_time(None);
        }
        let time_slice = self.control.max_time / (nblock - 1) as f64;
        let t = self.state.sim_time;
        let gm = Arc::clone(&self.gas);
        let mut saved_east: Option<Box<dyn BoundaryCondition>> = None;
        let mut reasons = Vec::new();

        for block in &mut self.blocks {
            block.active = false;
        }
        let first = &mut self.blocks[0];
        first.active = true;
        bc::apply_inviscid_bc(first, t)?;
        first.data.propagate_data_west_to_east();
        first.data.decode_conserved(0, gm.as_ref(), &self.config.bounds);

        for jb in 1..nblock {
            if jb >= 2 {
                self.blocks[jb - 2].active = false;

                if let Some(bc) = saved_east.take() {
                    self.blocks[jb - 1].set_bc(Face::East, bc);
                }
            }
            self.blocks[jb].active = true;

            if jb < nblock - 1 {
                saved_east = Some(self.blocks[jb].replace_bc(Face::East, Box::new(ExtrapolateOut)));
            }
            let id = self.blocks[jb].id();
            self.exchange.exchange(&mut self.blocks, Payload::FlowState, Some(id))?;

            let block = &mut self.blocks[jb];
            block.data.propagate_data_west_to_east();
            block.data.decode_conserved(0, gm.as_ref(), &self.config.bounds);
            self.blocks[jb - 1].active = true;

            if jb >= 2 {
                self.state.sim_time = 0.0;
            }
            info!("integrating blocks {} and {} for {:e}", jb - 1, jb, time_slice);
            reasons = self.integrate_in_time(Some(time_slice))?;
        }

        for block in &mut self.blocks {
            block.active = true;
        }
        Ok(reasons)
    }

    /**
     * Write the final snapshot (index 9999), the ledger line for it and the
     * finish summary.
     */
    pub fn finalize(&mut self) -> Result<(), SolverError> {
        self.state.output_index = FINAL_OUTPUT_INDEX;

        if self.config.viscous {
            for block in &mut self.blocks {
                bc::compute_surface_heat_flux(block)?;
            }
        }
        self.write_snapshot(FINAL_OUTPUT_INDEX)?;

        if self.is_master() {
            if let Some(output) = self.output.as_mut() {
                output.flush_ledger()?;
                output.write_finish(self.state.sim_time, self.state.dt_next(), self.state.step)?;
            }
        }
        Ok(())
    }

    /**
     * Prepare, integrate and finalize. On a fatal error the other workers
     * are told to stop, and a forensic snapshot is attempted with the final
     * index before the error is returned.
     */
    pub fn run(&mut self, start_tindx: usize) -> Result<Vec<StopReason>, SolverError> {
        match self.run_to_completion(start_tindx) {
            Ok(reasons) => Ok(reasons),
            Err(e) => {
                error!("run failed at step {}, t={:e}: {}", self.state.step, self.state.sim_time, e);
                self.exchange.abort();

                if let Err(write_error) = self.write_fields(FINAL_OUTPUT_INDEX) {
                    warn!("could not write the forensic snapshot: {}", write_error);
                }
                if let Some(output) = self.output.as_mut() {
                    if let Err(flush_error) = output.flush_ledger() {
                        warn!("could not flush the ledger: {}", flush_error);
                    }
                }
                Err(e)
            }
        }
    }

    fn run_to_completion(&mut self, start_tindx: usize) -> Result<Vec<StopReason>, SolverError> {
        self.prepare_to_integrate(start_tindx)?;

        let reasons = if self.config.sequence_blocks {
            self.integrate_blocks_in_sequence()?
        } else {
            self.integrate_in_time(None)?
        };
        self.finalize()?;
        Ok(reasons)
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use std::fs;
    use proptest::prelude::*;
    use super::*;
    use crate::config::{BcSpec, BlockConfig, FaceBcs, InitialState};
    use crate::error::ExchangeError;
    use crate::exchange::LocalExchange;
    use crate::flux::FluxCalculator;
    use crate::gas::IdealGas;
    use crate::geometry::Vector3d;
    use crate::setup;

    proptest! {
        #[test]
        fn adapted_step_is_bounded(dt in 1e-9f64..1e-2, dt_allow in 1e-9f64..1e-2) {
            let next = adapt_time_step(dt, dt_allow);
            prop_assert!(next <= dt_allow);
            prop_assert!(next <= DT_GROWTH_LIMIT * dt * (1.0 + 1e-15));

            if dt_allow <= dt {
                prop_assert_eq!(next, dt_allow);
            } else {
                prop_assert!(next > dt);
            }
        }
    }

    fn duct(nblock: usize) -> Config {
        let inflow = InitialState { vel: Vector3d::new(1000.0, 0.0, 0.0), ..InitialState::default() };
        let blocks = (0..nblock)
            .map(|id| BlockConfig {
                shape: [10, 3, 1],
                origin: Vector3d::new(0.1 * id as f64, 0.0, 0.0),
                initial: inflow.clone(),
                bcs: FaceBcs {
                    west: if id == 0 {
                        BcSpec::SupersonicIn { state: inflow.clone() }
                    } else {
                        BcSpec::Exchange { block: id - 1, face: Face::East, orientation: 0 }
                    },
                    east: if id == nblock - 1 {
                        BcSpec::ExtrapolateOut
                    } else {
                        BcSpec::Exchange { block: id + 1, face: Face::West, orientation: 0 }
                    },
                    ..FaceBcs::default()
                },
                ..BlockConfig::default()
            })
            .collect();

        Config {
            flux_calculator: FluxCalculator::Hlle,
            blocks,
            ..Config::default()
        }
    }

    fn simulation(config: Config, control: Control) -> Simulation {
        let gas: Arc<dyn GasModel> = Arc::new(config.gas.clone());
        let blocks = setup::build_blocks(&config, &gas, 0..config.blocks.len()).unwrap();
        Simulation::new(config, control, gas, blocks)
    }

    #[test]
    fn supersonic_duct_runs_to_max_step_within_cfl_bound() {
        let control = Control {
            max_step: 1000,
            max_time: 1.0,
            cfl_target: 0.5,
            cfl_count: 1,
            ..Control::default()
        };
        let mut sim = simulation(duct(1), control);
        sim.prepare_to_integrate(0).unwrap();
        let reasons = sim.integrate_in_time(None).unwrap();

        assert_eq!(reasons, vec![StopReason::ReachedMaxStep]);
        assert_eq!(sim.state().step, 1000);
        assert!(sim.state().cfl_peak > 0.4);
        assert!(sim.state().cfl_peak <= 0.5 * DT_GROWTH_LIMIT);
    }

    #[test]
    fn wall_clock_budget_stops_after_one_step() {
        let mut sim = simulation(duct(1), Control::default()).with_max_wall_clock(Duration::ZERO);
        sim.prepare_to_integrate(0).unwrap();
        let reasons = sim.integrate_in_time(None).unwrap();

        assert_eq!(reasons, vec![StopReason::WallClock]);
        assert_eq!(sim.state().step, 1);
    }

    #[test]
    fn halt_flag_stops_the_run() {
        let halt = Arc::new(AtomicBool::new(true));
        let mut sim = simulation(duct(1), Control::default()).with_halt_flag(Arc::clone(&halt));
        sim.prepare_to_integrate(0).unwrap();
        assert_eq!(sim.integrate_in_time(None).unwrap(), vec![StopReason::Halted]);
    }

    #[test]
    fn reaching_the_target_time_stops_the_run() {
        let control = Control { dt_init: 1.0e-6, fixed_time_step: true, ..Control::default() };
        let mut sim = simulation(duct(1), control);
        sim.prepare_to_integrate(0).unwrap();
        let reasons = sim.integrate_in_time(Some(4.5e-6)).unwrap();

        assert_eq!(reasons, vec![StopReason::ReachedTime]);
        assert_eq!(sim.state().step, 5);
    }

    #[test]
    fn nothing_happens_past_the_stopping_time() {
        let mut sim = simulation(duct(1), Control::default());
        sim.state.sim_time = 2.0;
        assert!(sim.integrate_in_time(Some(1.0)).unwrap().is_empty());
        assert_eq!(sim.state().step, 0);
    }

    #[test]
    fn no_active_blocks_is_fatal() {
        let mut sim = simulation(duct(1), Control::default());
        sim.blocks_mut()[0].active = false;
        assert!(matches!(sim.integrate_in_time(None), Err(SolverError::NoActiveBlocks { step: 0 })));
    }

    #[test]
    fn viscous_ramp_cuts_the_step_at_onset() {
        let config = Config {
            viscous: true,
            viscous_time_delay: 1.0e-3,
            viscous_factor_increment: 0.25,
            ..Config::default()
        };
        let mut state = RunState::default();
        state.init_ramps(&config);
        assert!(!state.viscous_on);
        assert_eq!(state.viscous_factor, 0.0);

        state.step = 7;
        state.dt_global = 1.0e-6;
        state.sim_time = 1.0e-3;
        state.advance_ramps(&config);
        assert!(state.viscous_on);
        assert_eq!(state.viscous_factor, 0.25);
        assert!((state.dt_global - 2.0e-7).abs() < 1e-20);
        assert!(state.cfl_check_pending);

        for _ in 0..5 {
            state.advance_ramps(&config);
        }
        assert_eq!(state.viscous_factor, 1.0);
    }

    #[test]
    fn heat_ramp_is_zero_outside_its_window() {
        let config = Config {
            heat_time_start: 1.0,
            heat_time_stop: 2.0,
            heat_factor_increment: 0.5,
            ..Config::default()
        };
        let mut state = RunState::default();
        state.init_ramps(&config);
        assert_eq!(state.heat_factor, 0.0);

        state.sim_time = 1.5;
        state.advance_ramps(&config);
        assert_eq!(state.heat_factor, 0.5);
        state.advance_ramps(&config);
        state.advance_ramps(&config);
        assert_eq!(state.heat_factor, 1.0);

        state.sim_time = 2.0;
        state.advance_ramps(&config);
        assert_eq!(state.heat_factor, 0.0);
    }

    #[test]
    fn filter_outside_its_window_is_disabled() {
        let mut config = Config::default();
        config.filter.enabled = true;
        config.filter.tstart = 0.0;
        config.filter.tend = 1.0e-3;
        config.filter.dt = 1.0e-4;

        let mut state = RunState { sim_time: 2.0e-3, ..RunState::default() };
        state.init_filter(&config);
        assert!(!state.filter_enabled);

        let mut state = RunState::default();
        state.init_filter(&config);
        assert!(state.filter_enabled);
        assert_eq!(state.filter_next_time, 0.0);
    }

    #[test]
    fn control_file_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duct.control");
        fs::write(&path, "max_step = 3\ndt_init = 1e-7\n").unwrap();

        let mut sim = simulation(duct(1), Control::default()).with_control_file(&path);
        sim.prepare_to_integrate(0).unwrap();
        let reasons = sim.integrate_in_time(None).unwrap();

        assert_eq!(reasons, vec![StopReason::ReachedMaxStep]);
        assert_eq!(sim.state().step, 3);
        assert_eq!(sim.control().max_step, 3);
    }

    #[test]
    fn unreadable_control_file_keeps_previous_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("duct.control");
        fs::write(&path, "max_step = [").unwrap();

        let control = Control { max_step: 2, ..Control::default() };
        let mut sim = simulation(duct(1), control).with_control_file(&path);
        sim.prepare_to_integrate(0).unwrap();
        sim.integrate_in_time(None).unwrap();
        assert_eq!(sim.state().step, 2);
    }

    #[test]
    fn missing_control_file_keeps_previous_values() {
        let dir = tempfile::tempdir().unwrap();
        let control = Control { max_step: 2, control_count: 1, ..Control::default() };
        let mut sim = simulation(duct(1), control).with_control_file(dir.path().join("absent.control"));
        sim.prepare_to_integrate(0).unwrap();
        sim.integrate_in_time(None).unwrap();
        assert_eq!(sim.state().step, 2);
        assert_eq!(sim.control().control_count, 1);
    }

    #[test]
    fn blocks_are_integrated_in_sequence() {
        let mut config = duct(3);
        config.sequence_blocks = true;

        for spec in &mut config.blocks[1..] {
            spec.initial = InitialState::default();
        }
        let control = Control { max_time: 2.0e-5, max_step: 10_000, ..Control::default() };
        let mut sim = simulation(config, control);
        sim.prepare_to_integrate(0).unwrap();
        let reasons = sim.integrate_blocks_in_sequence().unwrap();

        assert_eq!(reasons, vec![StopReason::ReachedTime]);
        assert!(sim.blocks().iter().all(|b| b.active));
        assert!(sim.state().sim_time >= 1.0e-5);
        assert!(sim.state().sim_time < 2.0e-5);
        assert_eq!(sim.blocks()[1].bc(Face::East).name(), "exchange");
        assert_eq!(sim.blocks()[2].bc(Face::East).name(), "extrapolate_out");
        assert!(sim.blocks()[2].data.interior_cells().all(|c| c.fs.vel.x > 500.0));
    }

    struct Remote;

    impl Exchange for Remote {
        fn size(&self) -> usize {
            2
        }

        fn is_distributed(&self) -> bool {
            true
        }

        fn exchange(&mut self, blocks: &mut [Block], payload: Payload, only: Option<usize>) -> Result<(), ExchangeError> {
            LocalExchange.exchange(blocks, payload, only)
        }

        fn min_f64(&mut self, x: f64) -> Result<f64, ExchangeError> {
            Ok(x)
        }

        fn max_f64(&mut self, x: f64) -> Result<f64, ExchangeError> {
            Ok(x)
        }

        fn sum_f64(&mut self, x: f64) -> Result<f64, ExchangeError> {
            Ok(x)
        }
    }

    #[test]
    fn sequence_across_workers_is_not_implemented() {
        let mut sim = simulation(duct(2), Control::default()).with_exchange(Box::new(Remote));
        let e = sim.integrate_blocks_in_sequence().unwrap_err();
        assert!(matches!(e, SolverError::NotImplemented(_)));
        assert_eq!(e.exit_status().code(), 5);
    }

    #[test]
    fn run_writes_ledger_snapshots_and_finish_file() {
        let dir = tempfile::tempdir().unwrap();
        let control = Control { max_step: 4, dt_plot: 2.5e-6, dt_init: 1.0e-6, fixed_time_step: true, ..Control::default() };
        let mut sim = simulation(duct(1), control).with_output(OutputWriter::new(dir.path(), "duct", false));
        let reasons = sim.run(0).unwrap();
        assert_eq!(reasons, vec![StopReason::ReachedMaxStep]);

        let output = OutputWriter::new(dir.path(), "duct", false);
        let ledger = fs::read_to_string(output.ledger_path()).unwrap();
        let indexes: Vec<&str> = ledger.lines().skip(1).map(|l| &l[..4]).collect();
        assert_eq!(indexes, vec!["0000", "0001", "9999"]);
        assert!(output.flow_path(0, 0).exists());
        assert!(output.flow_path(0, 1).exists());
        assert!(output.flow_path(0, FINAL_OUTPUT_INDEX).exists());

        let finish = fs::read_to_string(output.finish_path()).unwrap();
        assert!(finish.starts_with("[simulation_end]\n"));
        assert!(finish.ends_with("no_steps = 4\n"));
    }

    #[test]
    fn finish_file_records_the_allowed_step() {
        let dir = tempfile::tempdir().unwrap();
        let control = Control { max_step: 6, cfl_count: 1, ..Control::default() };
        let mut sim = simulation(duct(1), control).with_output(OutputWriter::new(dir.path(), "duct", false));
        sim.run(0).unwrap();

        let dt_allow = sim.state().dt_allow;
        assert!(dt_allow.is_finite());
        assert_eq!(sim.state().dt_next(), dt_allow);

        let finish = fs::read_to_string(OutputWriter::new(dir.path(), "duct", false).finish_path()).unwrap();
        assert!(finish.contains(&format!("dt = {}\n", crate::output::format_exp(dt_allow))));
    }

    #[test]
    fn without_a_search_the_next_step_is_the_current_one() {
        let state = RunState { dt_global: 2.0e-6, ..RunState::default() };
        assert_eq!(state.dt_next(), 2.0e-6);
    }

    #[test]
    fn resumed_run_starts_from_the_snapshot_time() {
        let dir = tempfile::tempdir().unwrap();
        let control = Control { max_step: 3, dt_init: 1.0e-6, fixed_time_step: true, ..Control::default() };
        let mut first = simulation(duct(1), control.clone()).with_output(OutputWriter::new(dir.path(), "duct", true));
        first.run(0).unwrap();
        let t_end = first.state().sim_time;
        let expected: Vec<_> = first.blocks()[0]
            .data
            .interior_cells()
            .map(|c| {
                let mut c = c.clone();
                c.encode_conserved();
                c.u[0].clone()
            })
            .collect();

        let mut second = simulation(duct(1), control).with_output(OutputWriter::new(dir.path(), "duct", true));
        second.prepare_to_integrate(FINAL_OUTPUT_INDEX).unwrap();
        assert_eq!(second.state().sim_time, t_end);

        for (c, u) in second.blocks()[0].data.interior_cells().zip(&expected) {
            assert_eq!(&c.u[0], u);
        }
    }

    #[test]
    fn resumed_moving_grid_starts_where_the_block_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = duct(1);
        config.moving_grid = true;
        config.grid_velocity = Vector3d::new(50.0, 0.0, 0.0);

        let control = Control { max_step: 3, dt_init: 1.0e-6, fixed_time_step: true, ..Control::default() };
        let mut first = simulation(config.clone(), control.clone()).with_output(OutputWriter::new(dir.path(), "moving", false));
        first.run(0).unwrap();

        let offset = first.blocks()[0].data.grid_offset(0);
        let positions: Vec<_> = first.blocks()[0].data.interior_cells().map(|c| c.geom[0].position).collect();
        assert!((offset.x - 1.5e-4).abs() < 1e-12);

        let mut second = simulation(config, control).with_output(OutputWriter::new(dir.path(), "moving", false));
        second.prepare_to_integrate(FINAL_OUTPUT_INDEX).unwrap();
        assert_eq!(second.blocks()[0].data.grid_offset(0), offset);

        for (c, x) in second.blocks()[0].data.interior_cells().zip(&positions) {
            assert!((c.geom[0].position.x - x.x).abs() < 1e-12);
            assert_eq!(c.geom[1].position, c.geom[0].position);
        }
    }
}
