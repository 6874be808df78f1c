use serde::{Deserialize, Serialize};
use crate::error::GasError;
use crate::gas::{GasModel, GasState};
use crate::geometry::{Axis, Vector3d};
use crate::state::{ConservedQuantities, FlowState};




/// Number of conserved-state levels held by each cell: the start of the step
/// plus one level per sub-stage.
///
pub const NUM_TIME_LEVELS: usize = 4;

/// Largest supported temporal order (predictor, corrector, RK3).
///
pub const MAX_TIME_ORDER: usize = 3;

/// Stefan-Boltzmann constant, W/(m^2 K^4)
///
pub const STEFAN_BOLTZMANN: f64 = 5.670374419e-8;




/// User-configured limits on the decoded state. A cell whose temperature
/// leaves this range is treated as invalid.
///
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellBounds {
    pub min_temperature: f64,
    pub max_temperature: f64,
}

impl Default for CellBounds {
    fn default() -> Self {
        Self {
            min_temperature: 0.0,
            max_temperature: f64::INFINITY,
        }
    }
}




/// Position, volume and edge lengths of a cell at one time level.
///
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CellGeometry {
    pub position: Vector3d,
    pub volume: f64,
    pub lengths: Vector3d,
}




/// The unit of state in a block. Ghost cells share this type but only their
/// flow state and geometry are ever read.
///
#[derive(Clone, Debug)]
pub struct Cell {
    pub fs: FlowState,
    pub u: [ConservedQuantities; NUM_TIME_LEVELS],
    pub dudt: [ConservedQuantities; MAX_TIME_ORDER],
    pub q: ConservedQuantities,
    pub geom: [CellGeometry; NUM_TIME_LEVELS],
    pub ghost: bool,
    pub invalid: bool,
    pub shock: bool,
    pub base_qdot: f64,
    pub q_rad: f64,
    q_rad_saved: f64,
    f_rad_org: f64,
    u_saved: ConservedQuantities,
    u_residual: (f64, f64),
}




// ============================================================================
impl Cell {

    pub fn new(gm: &dyn GasModel, ghost: bool) -> Self {
        let z = ConservedQuantities::new(gm.num_species(), gm.num_modes());
        Self {
            fs: FlowState::new(gm),
            u: std::array::from_fn(|_| z.clone()),
            dudt: std::array::from_fn(|_| z.clone()),
            q: z.clone(),
            geom: [CellGeometry::default(); NUM_TIME_LEVELS],
            ghost,
            invalid: false,
            shock: false,
            base_qdot: 0.0,
            q_rad: 0.0,
            q_rad_saved: 0.0,
            f_rad_org: 1.0,
            u_saved: z,
            u_residual: (0.0, 0.0),
        }
    }

    /// Fill the start-of-step conserved level from the flow state.
    ///
    pub fn encode_conserved(&mut self) {
        self.u[0].encode(&self.fs)
    }

    /// Decode the flow state from the given time level. On failure the cell
    /// is flagged invalid and the error is returned; the caller decides
    /// whether that is fatal.
    ///
    pub fn decode_conserved(&mut self, level: usize, gm: &dyn GasModel, bounds: &CellBounds) -> Result<(), GasError> {
        let result = self.u[level]
            .decode(gm, &mut self.fs)
            .and_then(|()| check_bounds(&self.fs.gas, bounds));
        self.invalid = result.is_err();
        result
    }

    /// Record the start-of-step conserved state, to be restored if the step
    /// has to be repeated.
    ///
    pub fn record_conserved(&mut self) {
        self.u_saved.copy_from(&self.u[0]);
    }

    /// Restore the conserved state saved by `record_conserved`. Every
    /// intermediate level is reset with it.
    ///
    pub fn restore_conserved(&mut self) {
        for u in self.u.iter_mut() {
            u.copy_from(&self.u_saved);
        }
        self.invalid = false;
    }

    /// The snapshot taken by the last `record_conserved`.
    ///
    pub fn recorded(&self) -> &ConservedQuantities {
        &self.u_saved
    }

    /// Make the given time level the start of the next step.
    ///
    pub fn commit_level(&mut self, level: usize) {
        if level != 0 {
            let (head, tail) = self.u.split_at_mut(level);
            head[0].copy_from(&tail[0]);
            self.geom[0] = self.geom[level];
        }
    }

    /// Form the inviscid source vector for the given time level: volumetric
    /// heating (scaled by the ramp factor) and the radiative source.
    ///
    pub fn inviscid_source_vector(&mut self, heat_factor: f64) {
        self.q.clear();
        self.q.total_energy += heat_factor * self.base_qdot + self.q_rad;
    }

    /// Advance from level 0 to level 1.
    ///
    pub fn predictor_update(&mut self, dt: f64, time_order: usize) {
        let gamma_1 = if time_order == 3 { 8.0 / 15.0 } else { 1.0 };
        let (head, tail) = self.u.split_at_mut(1);
        tail[0].set_update(&head[0], dt, &[(gamma_1, &self.dudt[0])]);
    }

    /// Advance to level 2. The second-order corrector restarts from level 0;
    /// the third-order scheme continues from level 1.
    ///
    pub fn corrector_update(&mut self, dt: f64, time_order: usize) {
        let (head, tail) = self.u.split_at_mut(2);

        if time_order == 3 {
            tail[0].set_update(&head[1], dt, &[(-17.0 / 60.0, &self.dudt[0]), (5.0 / 12.0, &self.dudt[1])]);
        } else {
            tail[0].set_update(&head[0], dt, &[(0.5, &self.dudt[0]), (0.5, &self.dudt[1])]);
        }
    }

    /// Advance from level 2 to level 3.
    ///
    pub fn rk3_update(&mut self, dt: f64) {
        let (head, tail) = self.u.split_at_mut(3);
        tail[0].set_update(&head[2], dt, &[(-5.0 / 12.0, &self.dudt[1]), (3.0 / 4.0, &self.dudt[2])]);
    }

    /// Apply the stage update formula for the sub-stage that reads time
    /// level `level`.
    ///
    pub fn stage_update(&mut self, level: usize, dt: f64, time_order: usize) {
        match level {
            0 => self.predictor_update(dt, time_order),
            1 => self.corrector_update(dt, time_order),
            _ => self.rk3_update(dt),
        }
    }

    /// Copy the start-of-step geometry to every later level.
    ///
    pub fn init_time_level_geometry(&mut self) {
        let g = self.geom[0];
        self.geom.iter_mut().skip(1).for_each(|x| *x = g);
    }

    pub fn init_residuals(&mut self) {
        self.u_residual = (self.u[0].mass, self.u[0].total_energy);
    }

    /// Relative change of mass and total energy density since
    /// `init_residuals`.
    ///
    pub fn residuals(&self) -> (f64, f64) {
        let (m0, e0) = self.u_residual;
        let m = self.u[0].mass;
        let e = self.u[0].total_energy;
        (((m - m0) / m).abs(), ((e - e0) / e).abs())
    }

    /// Largest signal speed summed over the active axes, divided by the cell
    /// length on each axis. The allowable time step is the CFL target over
    /// this value.
    ///
    pub fn signal_frequency(&self, axes: &[Axis], grid_vel: Vector3d, viscous_factor: f64) -> f64 {
        let g = &self.geom[0];
        let a = self.fs.gas.a;
        let mut freq = 0.0;

        for axis in axes {
            let dx = g.lengths.component(*axis);
            let vn = (self.fs.vel.component(*axis) - grid_vel.component(*axis)).abs();
            freq += (vn + a) / dx;

            if viscous_factor > 0.0 {
                let nu = (self.fs.gas.mu + self.fs.mu_t) / self.fs.gas.rho;
                freq += viscous_factor * 4.0 * nu / (dx * dx);
            }
        }
        freq
    }

    /// Store the radiative source and the emission factor it was computed
    /// at. Between full recomputations the source is rescaled from these.
    ///
    pub fn store_rad_scaling_params(&mut self) {
        self.q_rad_saved = self.q_rad;
        self.f_rad_org = if self.q_rad <= 0.0 {
            self.fs.gas.temperature().powi(4)
        } else {
            1.0
        };
    }

    pub fn rescale_q_rad(&mut self) {
        if self.q_rad_saved <= 0.0 && self.f_rad_org > 0.0 {
            let f_rad_new = self.fs.gas.temperature().powi(4);
            self.q_rad = self.q_rad_saved * f_rad_new / self.f_rad_org;
        } else {
            self.q_rad = self.q_rad_saved;
        }
    }

    /// How far the emission factor has drifted since the radiative source
    /// was last computed.
    ///
    pub fn rad_scaling_ratio(&self) -> f64 {
        if self.q_rad_saved <= 0.0 && self.f_rad_org > 0.0 {
            let f_rad_new = self.fs.gas.temperature().powi(4);
            ((f_rad_new - self.f_rad_org) / self.f_rad_org).abs()
        } else {
            0.0
        }
    }

    /// Let an external integrator advance the gas state of this cell over
    /// `dt`, then re-evaluate the thermodynamic state and re-encode.
    ///
    pub fn gas_increment<F>(&mut self, gm: &dyn GasModel, dt: f64, advance: F) -> Result<(), GasError>
    where
        F: Fn(&mut GasState, f64) -> Result<(), GasError>,
    {
        advance(&mut self.fs.gas, dt)?;
        gm.update_thermo_from_rhoe(&mut self.fs.gas)?;
        gm.update_transport_coeffs(&mut self.fs.gas);
        self.encode_conserved();
        Ok(())
    }
}




fn check_bounds(gas: &GasState, bounds: &CellBounds) -> Result<(), GasError> {
    let t = gas.temperature();

    if t < bounds.min_temperature || t > bounds.max_temperature {
        Err(GasError::TemperatureBound {
            value: t,
            min: bounds.min_temperature,
            max: bounds.max_temperature,
        })
    } else {
        Ok(())
    }
}
