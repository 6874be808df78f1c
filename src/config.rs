use std::path::Path;
use serde::{Deserialize, Serialize};
use crate::cell::CellBounds;
use crate::error::ConfigError;
use crate::flux::FluxCalculator;
use crate::gas::IdealGas;
use crate::geometry::{Face, Vector3d};




/**
 * Settings of the spatial filter: `npass` diffusion/anti-diffusion passes
 * with coefficient `mu`, every `dt` of simulated time inside
 * `[tstart, tend]`.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub enabled: bool,
    pub tstart: f64,
    pub tend: f64,
    pub dt: f64,
    pub npass: usize,
    pub mu: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tstart: 0.0,
            tend: f64::INFINITY,
            dt: 0.0,
            npass: 1,
            mu: 0.03,
        }
    }
}




/**
 * A uniform flow state given by pressure, velocity and temperature.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialState {
    pub p: f64,
    pub vel: Vector3d,
    pub t: f64,
    pub massf: Option<Vec<f64>>,
}

impl Default for InitialState {
    fn default() -> Self {
        Self {
            p: 101.325e3,
            vel: Vector3d::zero(),
            t: 300.0,
            massf: None,
        }
    }
}




/**
 * The boundary condition named for one face in the configuration file.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BcSpec {
    SlipWall,
    ExtrapolateOut,
    SupersonicIn {
        #[serde(flatten)]
        state: InitialState,
    },
    FixedTWall {
        t_wall: f64,
        #[serde(default)]
        catalytic_massf: Option<Vec<f64>>,
    },
    Exchange {
        block: usize,
        face: Face,
        #[serde(default)]
        orientation: u8,
    },
}

impl Default for BcSpec {
    fn default() -> Self {
        BcSpec::SlipWall
    }
}




/**
 * One boundary condition per face.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceBcs {
    pub north: BcSpec,
    pub east: BcSpec,
    pub south: BcSpec,
    pub west: BcSpec,
    pub top: BcSpec,
    pub bottom: BcSpec,
}

impl FaceBcs {
    pub fn get(&self, face: Face) -> &BcSpec {
        match face {
            Face::North => &self.north,
            Face::East => &self.east,
            Face::South => &self.south,
            Face::West => &self.west,
            Face::Top => &self.top,
            Face::Bottom => &self.bottom,
        }
    }
}




/**
 * Description of one Cartesian block: its cell counts, lower corner and
 * spacing, initial state, boundary conditions and history cells.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub shape: [usize; 3],
    pub origin: Vector3d,
    pub spacing: Vector3d,
    pub initial: InitialState,
    pub bcs: FaceBcs,
    pub hist_cells: Vec<[i64; 3]>,
    pub heat_source: f64,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            shape: [10, 10, 1],
            origin: Vector3d::zero(),
            spacing: Vector3d::new(0.01, 0.01, 1.0),
            initial: InitialState::default(),
            bcs: FaceBcs::default(),
            hist_cells: Vec::new(),
            heat_source: 0.0,
        }
    }
}




/**
 * The static configuration of a run, read once at start-up.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub title: String,
    pub dimensions: usize,
    pub time_order: usize,
    pub flux_calculator: FluxCalculator,
    pub compression_tolerance: f64,

    pub viscous: bool,
    pub viscous_time_delay: f64,
    pub viscous_factor_increment: f64,
    pub k_omega: bool,
    pub turbulence_prandtl: f64,

    pub reacting: bool,
    pub energy_exchange: bool,
    pub reaction_time_start: f64,

    pub radiation: bool,
    pub radiation_update_frequency: usize,
    pub check_radiation_scaling: bool,
    pub absorption_coefficient: f64,

    pub heat_time_start: f64,
    pub heat_time_stop: f64,
    pub heat_factor_increment: f64,

    pub filter: FilterConfig,

    pub moving_grid: bool,
    pub grid_velocity: Vector3d,
    pub shock_fitting: bool,
    pub write_vertex_velocities: bool,

    pub adjust_invalid_cell_data: bool,
    pub max_invalid_cells: usize,
    pub dt_reduction_factor: f64,
    pub sequence_blocks: bool,

    pub bounds: CellBounds,
    pub gas: IdealGas,
    pub blocks: Vec<BlockConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            title: String::new(),
            dimensions: 2,
            time_order: 2,
            flux_calculator: FluxCalculator::Adaptive,
            compression_tolerance: -0.3,
            viscous: false,
            viscous_time_delay: 0.0,
            viscous_factor_increment: 0.01,
            k_omega: false,
            turbulence_prandtl: 0.89,
            reacting: false,
            energy_exchange: false,
            reaction_time_start: 0.0,
            radiation: false,
            radiation_update_frequency: 1,
            check_radiation_scaling: false,
            absorption_coefficient: 1.0,
            heat_time_start: 0.0,
            heat_time_stop: 0.0,
            heat_factor_increment: 0.01,
            filter: FilterConfig::default(),
            moving_grid: false,
            grid_velocity: Vector3d::zero(),
            shock_fitting: false,
            write_vertex_velocities: false,
            adjust_invalid_cell_data: false,
            max_invalid_cells: 10,
            dt_reduction_factor: 0.2,
            sequence_blocks: false,
            bounds: CellBounds::default(),
            gas: IdealGas::default(),
            blocks: Vec::new(),
        }
    }
}




// ============================================================================
impl Config {

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })?;
        config.validate()?;
        Ok(config)
    }

    /**
     * Reject settings the integrator cannot run with.
     */
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |m: String| Err(ConfigError::Invalid(m));

        if !(1..=3).contains(&self.time_order) {
            return invalid(format!("time_order must be 1, 2 or 3 (got {})", self.time_order));
        }
        if self.dimensions != 2 && self.dimensions != 3 {
            return invalid(format!("dimensions must be 2 or 3 (got {})", self.dimensions));
        }
        if !(self.dt_reduction_factor > 0.0 && self.dt_reduction_factor < 1.0) {
            return invalid(format!("dt_reduction_factor must lie in (0, 1) (got {})", self.dt_reduction_factor));
        }
        if self.filter.enabled && self.filter.npass == 0 {
            return invalid("filter.npass must be at least 1".to_owned());
        }
        for (n, b) in self.blocks.iter().enumerate() {
            let active = if self.dimensions == 2 { &b.shape[..2] } else { &b.shape[..] };

            if active.iter().any(|s| *s < 2) {
                return invalid(format!("block {} needs at least 2 cells on every axis", n));
            }
            if !(b.spacing.x > 0.0 && b.spacing.y > 0.0 && b.spacing.z > 0.0) {
                return invalid(format!("block {} has non-positive spacing", n));
            }
        }
        Ok(())
    }
}




/**
 * Run-time control parameters. These are re-read from the control file
 * while the run is in progress, so cadences and limits can be changed or a
 * halt requested without restarting.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Control {
    pub dt_init: f64,
    pub dt_plot: f64,
    pub dt_history: f64,
    pub dt_shock: f64,
    pub cfl_target: f64,
    pub cfl_count: usize,
    pub print_count: usize,
    pub control_count: usize,
    pub max_time: f64,
    pub max_step: usize,
    pub fixed_time_step: bool,
    pub halt_now: bool,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            dt_init: 1.0e-6,
            dt_plot: f64::INFINITY,
            dt_history: f64::INFINITY,
            dt_shock: f64::INFINITY,
            cfl_target: 0.5,
            cfl_count: 10,
            print_count: 20,
            control_count: 10,
            max_time: 1.0e-3,
            max_step: 100,
            fixed_time_step: false,
            halt_now: false,
        }
    }
}

impl Control {

    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_owned(), source })?;
        let control: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_owned(), source })?;
        control.validate()?;
        Ok(control)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cfl_count == 0 || self.print_count == 0 || self.control_count == 0 {
            return Err(ConfigError::Invalid("cfl_count, print_count and control_count must be non-zero".to_owned()));
        }
        if !(self.cfl_target > 0.0) || !(self.dt_init > 0.0) {
            return Err(ConfigError::Invalid("cfl_target and dt_init must be positive".to_owned()));
        }
        Ok(())
    }
}
