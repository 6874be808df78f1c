use serde::{Deserialize, Serialize};
use crate::error::GasError;




/**
 * Thermodynamic state of the gas in one cell or at one interface. Energies
 * and temperatures are stored per energy mode; mode zero is the
 * translational mode.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GasState {
    pub rho: f64,
    pub p: f64,
    pub a: f64,
    pub mu: f64,
    pub k: f64,
    pub massf: Vec<f64>,
    pub e: Vec<f64>,
    pub t: Vec<f64>,
}




// ============================================================================
impl GasState {

    pub fn new(num_species: usize, num_modes: usize) -> Self {
        let mut massf = vec![0.0; num_species];
        if let Some(first) = massf.first_mut() {
            *first = 1.0;
        }
        Self {
            massf,
            e: vec![0.0; num_modes],
            t: vec![0.0; num_modes],
            ..Default::default()
        }
    }

    /**
     * Total specific internal energy, summed over the energy modes.
     */
    pub fn internal_energy(&self) -> f64 {
        self.e.iter().sum()
    }

    pub fn temperature(&self) -> f64 {
        self.t.first().copied().unwrap_or(0.0)
    }

    /**
     * Copy the values of another state in place, reusing this state's
     * allocations.
     */
    pub fn copy_values_from(&mut self, other: &Self) {
        self.rho = other.rho;
        self.p = other.p;
        self.a = other.a;
        self.mu = other.mu;
        self.k = other.k;
        self.massf.clone_from(&other.massf);
        self.e.clone_from(&other.e);
        self.t.clone_from(&other.t);
    }
}




/**
 * Thermodynamic and transport property evaluation, and species/mode
 * bookkeeping. Implementations must be shareable across the threads that
 * fan out per-cell work.
 */
pub trait GasModel: Send + Sync {

    fn num_species(&self) -> usize;

    fn num_modes(&self) -> usize;

    /**
     * Compute pressure, temperatures and sound speed from density and the
     * per-mode energies.
     */
    fn update_thermo_from_rhoe(&self, gas: &mut GasState) -> Result<(), GasError>;

    /**
     * Compute density, per-mode energies and sound speed from pressure and the
     * per-mode temperatures.
     */
    fn update_thermo_from_pt(&self, gas: &mut GasState) -> Result<(), GasError>;

    /**
     * Compute the viscosity and thermal conductivity from the current
     * temperature.
     */
    fn update_transport_coeffs(&self, gas: &mut GasState);

    /**
     * Return a zeroed state with the right number of species and modes.
     */
    fn new_state(&self) -> GasState {
        GasState::new(self.num_species(), self.num_modes())
    }
}




/**
 * A calorically perfect gas with Sutherland viscosity and a constant Prandtl
 * number. Species are carried as passive scalars of identical properties.
 */
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdealGas {
    pub gamma: f64,
    pub r_gas: f64,
    pub prandtl: f64,
    pub mu_ref: f64,
    pub t_ref: f64,
    pub sutherland: f64,
    pub species: usize,
}




// ============================================================================
impl Default for IdealGas {
    fn default() -> Self {
        Self {
            gamma: 1.4,
            r_gas: 287.1,
            prandtl: 0.72,
            mu_ref: 1.716e-5,
            t_ref: 273.0,
            sutherland: 110.4,
            species: 1,
        }
    }
}

impl IdealGas {

    pub fn cv(&self) -> f64 {
        self.r_gas / (self.gamma - 1.0)
    }

    pub fn cp(&self) -> f64 {
        self.gamma * self.cv()
    }
}

impl GasModel for IdealGas {

    fn num_species(&self) -> usize {
        self.species.max(1)
    }

    fn num_modes(&self) -> usize {
        1
    }

    fn update_thermo_from_rhoe(&self, gas: &mut GasState) -> Result<(), GasError> {
        if !(gas.rho > 0.0) {
            return Err(GasError::NegativeMassDensity(gas.rho));
        }
        let e = gas.internal_energy();

        if !(e > 0.0) {
            return Err(GasError::NegativeInternalEnergy(e));
        }
        let t = e / self.cv();
        gas.t.iter_mut().for_each(|tm| *tm = t);
        gas.p = gas.rho * self.r_gas * t;
        gas.a = (self.gamma * self.r_gas * t).sqrt();

        if !gas.p.is_finite() {
            return Err(GasError::NonFinite("pressure"));
        }
        if !gas.a.is_finite() {
            return Err(GasError::NonFinite("sound speed"));
        }
        Ok(())
    }

    fn update_thermo_from_pt(&self, gas: &mut GasState) -> Result<(), GasError> {
        let t = gas.temperature();

        if !(t > 0.0) {
            return Err(GasError::NegativeInternalEnergy(t));
        }
        gas.rho = gas.p / (self.r_gas * t);

        if !(gas.rho > 0.0) {
            return Err(GasError::NegativeMassDensity(gas.rho));
        }
        let e = self.cv() * t;
        gas.e.iter_mut().enumerate().for_each(|(n, em)| *em = if n == 0 { e } else { 0.0 });
        gas.t.iter_mut().for_each(|tm| *tm = t);
        gas.a = (self.gamma * self.r_gas * t).sqrt();
        Ok(())
    }

    fn update_transport_coeffs(&self, gas: &mut GasState) {
        let t = gas.temperature();
        let s = self.sutherland;
        gas.mu = self.mu_ref * (t / self.t_ref).powf(1.5) * (self.t_ref + s) / (t + s);
        gas.k = gas.mu * self.cp() / self.prandtl;
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{GasModel, IdealGas};

    #[test]
    fn pressure_temperature_round_trip_through_energy() {
        let gm = IdealGas::default();
        let mut gas = gm.new_state();
        gas.p = 101.325e3;
        gas.t[0] = 300.0;
        gm.update_thermo_from_pt(&mut gas).unwrap();
        let rho = gas.rho;

        gas.p = 0.0;
        gas.t[0] = 0.0;
        gm.update_thermo_from_rhoe(&mut gas).unwrap();
        assert!((gas.t[0] - 300.0).abs() < 1e-9);
        assert!((gas.p - 101.325e3).abs() < 1e-6);
        assert_eq!(gas.rho, rho);
    }

    #[test]
    fn negative_energy_is_rejected() {
        let gm = IdealGas::default();
        let mut gas = gm.new_state();
        gas.rho = 1.0;
        gas.e[0] = -5.0;
        assert!(gm.update_thermo_from_rhoe(&mut gas).is_err());
    }

    #[test]
    fn sutherland_viscosity_matches_reference_point() {
        let gm = IdealGas::default();
        let mut gas = gm.new_state();
        gas.t[0] = gm.t_ref;
        gm.update_transport_coeffs(&mut gas);
        assert!((gas.mu - gm.mu_ref).abs() < 1e-15);
        assert!(gas.k > 0.0);
    }
}
