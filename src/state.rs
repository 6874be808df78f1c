use serde::{Deserialize, Serialize};
use crate::error::GasError;
use crate::gas::{GasModel, GasState};
use crate::geometry::Vector3d;




/**
 * The derived flow state of a cell or interface: the gas state plus velocity
 * and turbulence quantities.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub gas: GasState,
    pub vel: Vector3d,
    pub tke: f64,
    pub omega: f64,
    pub mu_t: f64,
    pub k_t: f64,
}




/**
 * The time-integrated quantities of a cell, per unit volume. Energies of the
 * non-translational modes are carried separately; the translational energy is
 * whatever remains of the total.
 */
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConservedQuantities {
    pub mass: f64,
    pub momentum: Vector3d,
    pub total_energy: f64,
    pub massf: Vec<f64>,
    pub energies: Vec<f64>,
    pub tke: f64,
    pub omega: f64,
}




// ============================================================================
impl FlowState {

    pub fn new(gm: &dyn GasModel) -> Self {
        Self {
            gas: gm.new_state(),
            omega: 1.0,
            ..Default::default()
        }
    }

    /**
     * Build a flow state from pressure, velocity and a single temperature,
     * applied to all energy modes. If `massf` is `None` the gas is taken to be
     * entirely the first species.
     */
    pub fn from_pvt(
        gm: &dyn GasModel,
        p: f64,
        vel: Vector3d,
        t: f64,
        massf: Option<&[f64]>) -> Result<Self, GasError>
    {
        let mut fs = Self::new(gm);
        fs.gas.p = p;
        fs.gas.t.iter_mut().for_each(|tm| *tm = t);

        if let Some(massf) = massf {
            fs.gas.massf.iter_mut().zip(massf).for_each(|(y, x)| *y = *x);
        }
        gm.update_thermo_from_pt(&mut fs.gas)?;
        gm.update_transport_coeffs(&mut fs.gas);
        fs.vel = vel;
        Ok(fs)
    }

    pub fn copy_values_from(&mut self, other: &Self) {
        self.gas.copy_values_from(&other.gas);
        self.vel = other.vel;
        self.tke = other.tke;
        self.omega = other.omega;
        self.mu_t = other.mu_t;
        self.k_t = other.k_t;
    }

    /**
     * Form the arithmetic average of density, velocity, per-mode energy,
     * composition and turbulence quantities of the given states, then
     * re-evaluate the thermodynamic state.
     */
    pub fn average_of(gm: &dyn GasModel, states: &[&FlowState]) -> Result<Self, GasError> {
        let mut fs = Self::new(gm);
        let n = states.len() as f64;

        if states.is_empty() {
            return Err(GasError::NegativeMassDensity(0.0));
        }
        fs.omega = 0.0;
        fs.gas.massf.iter_mut().for_each(|y| *y = 0.0);

        for s in states {
            fs.gas.rho += s.gas.rho / n;
            fs.vel += s.vel * (1.0 / n);
            fs.tke += s.tke / n;
            fs.omega += s.omega / n;
            fs.mu_t += s.mu_t / n;
            fs.k_t += s.k_t / n;

            for (e, se) in fs.gas.e.iter_mut().zip(&s.gas.e) {
                *e += se / n;
            }
            for (y, sy) in fs.gas.massf.iter_mut().zip(&s.gas.massf) {
                *y += sy / n;
            }
        }
        gm.update_thermo_from_rhoe(&mut fs.gas)?;
        gm.update_transport_coeffs(&mut fs.gas);
        Ok(fs)
    }

    pub fn is_finite(&self) -> bool {
        self.gas.rho.is_finite() && self.gas.p.is_finite() && self.vel.is_finite()
    }
}




// ============================================================================
impl ConservedQuantities {

    pub fn new(num_species: usize, num_modes: usize) -> Self {
        Self {
            massf: vec![0.0; num_species],
            energies: vec![0.0; num_modes.saturating_sub(1)],
            ..Default::default()
        }
    }

    pub fn clear(&mut self) {
        self.mass = 0.0;
        self.momentum = Vector3d::zero();
        self.total_energy = 0.0;
        self.massf.iter_mut().for_each(|x| *x = 0.0);
        self.energies.iter_mut().for_each(|x| *x = 0.0);
        self.tke = 0.0;
        self.omega = 0.0;
    }

    pub fn copy_from(&mut self, other: &Self) {
        self.mass = other.mass;
        self.momentum = other.momentum;
        self.total_energy = other.total_energy;
        self.massf.clone_from(&other.massf);
        self.energies.clone_from(&other.energies);
        self.tke = other.tke;
        self.omega = other.omega;
    }

    /**
     * Accumulate `c * other` into this set of quantities.
     */
    pub fn add_scaled(&mut self, c: f64, other: &Self) {
        self.mass += c * other.mass;
        self.momentum += other.momentum * c;
        self.total_energy += c * other.total_energy;
        self.massf.iter_mut().zip(&other.massf).for_each(|(x, y)| *x += c * y);
        self.energies.iter_mut().zip(&other.energies).for_each(|(x, y)| *x += c * y);
        self.tke += c * other.tke;
        self.omega += c * other.omega;
    }

    /**
     * Set this to `base + dt * sum(c_n * term_n)`, the common shape of every
     * stage update formula.
     */
    pub fn set_update(&mut self, base: &Self, dt: f64, terms: &[(f64, &Self)]) {
        self.copy_from(base);

        for (c, term) in terms {
            self.add_scaled(dt * c, term);
        }
    }

    /**
     * Fill these quantities from a flow state.
     */
    pub fn encode(&mut self, fs: &FlowState) {
        let rho = fs.gas.rho;
        let ke = 0.5 * fs.vel.norm_squared();
        self.mass = rho;
        self.momentum = fs.vel * rho;
        self.total_energy = rho * (fs.gas.internal_energy() + ke + fs.tke);
        self.massf.iter_mut().zip(&fs.gas.massf).for_each(|(u, y)| *u = rho * y);
        self.energies.iter_mut().zip(fs.gas.e.iter().skip(1)).for_each(|(u, e)| *u = rho * e);
        self.tke = rho * fs.tke;
        self.omega = rho * fs.omega;
    }

    /**
     * Recover a flow state from these quantities. An error means the
     * quantities describe no physical state; the flow state is then left
     * partially written.
     */
    pub fn decode(&self, gm: &dyn GasModel, fs: &mut FlowState) -> Result<(), GasError> {
        let rho = self.mass;

        if !(rho > 0.0) {
            return Err(GasError::NegativeMassDensity(rho));
        }
        let dinv = 1.0 / rho;
        fs.gas.rho = rho;
        fs.vel = self.momentum * dinv;
        fs.tke = self.tke * dinv;
        fs.omega = self.omega * dinv;

        let e_total = self.total_energy * dinv - 0.5 * fs.vel.norm_squared() - fs.tke;
        let mut e_other = 0.0;

        for (e, u) in fs.gas.e.iter_mut().skip(1).zip(&self.energies) {
            *e = u * dinv;
            e_other += *e;
        }
        if let Some(e0) = fs.gas.e.first_mut() {
            *e0 = e_total - e_other;
        }
        for (y, u) in fs.gas.massf.iter_mut().zip(&self.massf) {
            *y = (u * dinv).max(0.0);
        }
        let sum: f64 = fs.gas.massf.iter().sum();

        if sum > 0.0 {
            fs.gas.massf.iter_mut().for_each(|y| *y /= sum);
        }
        gm.update_thermo_from_rhoe(&mut fs.gas)?;
        gm.update_transport_coeffs(&mut fs.gas);
        Ok(())
    }
}
