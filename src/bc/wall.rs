use std::path::Path;
use std::sync::Arc;
use crate::block::{BlockData, NUM_GHOST};
use crate::error::BcError;
use crate::gas::GasModel;
use crate::geometry::Face;
use super::{BoundaryCondition, SurfaceHeatFlux};




/// Mirror the interior layers behind a face into its ghost layers, reversing
/// the velocity component normal to the face.
///
pub(crate) fn reflect_layers(data: &mut BlockData, face: Face) {
    let axis = face.axis();

    for d in 0..NUM_GHOST {
        let inner = data.face_layer(face, d, false);
        let ghost = data.face_layer(face, d, true);

        for (src, dst) in inner.into_iter().zip(ghost) {
            data.copy_flow_state(src, dst);
            let vel = data.cells[dst].fs.vel.reflect(axis);
            data.cells[dst].fs.vel = vel;
        }
    }
}




/// An inviscid wall: ghost cells are mirror images of the interior.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct SlipWall;

impl BoundaryCondition for SlipWall {
    fn name(&self) -> &str {
        "slip_wall"
    }

    fn apply_inviscid(&mut self, data: &mut BlockData, face: Face, _t: f64) -> Result<(), BcError> {
        reflect_layers(data, face);
        Ok(())
    }
}




/// Recombination at a catalytic wall, modelled as driving the wall
/// composition to a fixed set of mass fractions.
///
#[derive(Clone, Debug)]
pub struct CatalyticWall {
    pub massf: Vec<f64>,
}

impl CatalyticWall {
    fn apply(&self, massf: &mut [f64]) {
        for (y, w) in massf.iter_mut().zip(&self.massf) {
            *y = *w;
        }
    }
}




/// A no-slip wall held at a fixed temperature, with an optional catalytic
/// composition. Inviscid treatment is a slip wall. The viscous treatment
/// pins every interface on the face, and the heat flux through it is kept
/// for output. With the k-omega model the wall value of omega is also set.
///
pub struct FixedTWall {
    pub t_wall: f64,
    gas: Arc<dyn GasModel>,
    catalytic: Option<CatalyticWall>,
    k_omega: bool,
    heat: SurfaceHeatFlux,
}

impl FixedTWall {

    pub fn new(gas: Arc<dyn GasModel>, t_wall: f64) -> Self {
        Self {
            t_wall,
            gas,
            catalytic: None,
            k_omega: false,
            heat: SurfaceHeatFlux::default(),
        }
    }

    pub fn with_k_omega(mut self, k_omega: bool) -> Self {
        self.k_omega = k_omega;
        self
    }

    pub fn with_catalytic(mut self, catalytic: CatalyticWall) -> Self {
        self.catalytic = Some(catalytic);
        self
    }
}

impl BoundaryCondition for FixedTWall {
    fn name(&self) -> &str {
        "fixed_t_wall"
    }

    fn apply_inviscid(&mut self, data: &mut BlockData, face: Face, _t: f64) -> Result<(), BcError> {
        reflect_layers(data, face);
        Ok(())
    }

    fn apply_viscous(&mut self, data: &mut BlockData, face: Face, _t: f64) -> Result<(), BcError> {
        let axis = face.axis();
        let d = 0.5 * data.mesh.spacing.component(axis);

        for (f, c) in data.boundary_interfaces(face) {
            let cell = &data.cells[c].fs;
            let iface = &mut data.ifaces[axis.index()][f];
            let fs = &mut iface.fs;

            fs.copy_values_from(cell);
            fs.vel = Default::default();
            fs.gas.t.iter_mut().for_each(|t| *t = self.t_wall);
            fs.tke = 0.0;

            if self.k_omega {
                fs.omega = 6.0 * cell.gas.mu / (cell.gas.rho * 0.075 * d * d);
            }

            if let Some(catalytic) = &self.catalytic {
                catalytic.apply(&mut fs.gas.massf);
            }
            self.gas.update_thermo_from_pt(&mut fs.gas).map_err(|e| BcError::Invalid {
                bc: "fixed_t_wall".to_owned(),
                face,
                reason: e.to_string(),
            })?;
            self.gas.update_transport_coeffs(&mut fs.gas);
            iface.fixed_state = true;
        }
        Ok(())
    }

    fn heat_flux(&self) -> Option<&SurfaceHeatFlux> {
        Some(&self.heat)
    }

    fn compute_surface_heat_flux(&mut self, data: &BlockData, face: Face) -> Result<(), BcError> {
        self.heat.compute(data, face, self.t_wall);
        Ok(())
    }

    fn read_surface_heat_flux(&mut self, path: &Path, dims: usize, compressed: bool) -> Result<(), BcError> {
        self.heat = SurfaceHeatFlux::read(path, dims, compressed)?;
        Ok(())
    }
}
