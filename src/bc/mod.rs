//! Boundary conditions: one object per block face, which fills the ghost
//! cells (inviscid) or pins the interface states (viscous) outside that face.
//! The dispatcher functions at the bottom apply every face of a block in
//! turn.
//!

use std::io::{BufRead, Write};
use std::path::Path;
use crate::block::{Block, BlockData};
use crate::error::BcError;
use crate::exchange::Connection;
use crate::geometry::{Face, Vector3d};
use crate::output;

mod flow;
mod wall;

pub use flow::{ExtrapolateOut, SupersonicIn};
pub use wall::{CatalyticWall, FixedTWall, SlipWall};




/// Interface for the boundary condition attached to one face of a block.
/// Every operation except `apply_inviscid` has a default, which either does
/// nothing or reports that the condition does not support it.
///
pub trait BoundaryCondition: Send {
    /// A short name for log messages and error reports.
    fn name(&self) -> &str;

    /// The neighbouring block face, if this face is shared with another
    /// block. Such faces are filled by the exchange layer.
    fn connection(&self) -> Option<Connection> {
        None
    }

    /// Fill the ghost cells outside `face` for the inviscid flux.
    fn apply_inviscid(&mut self, data: &mut BlockData, face: Face, t: f64) -> Result<(), BcError>;

    /// Pin interface states on `face` for the viscous flux.
    fn apply_viscous(&mut self, _data: &mut BlockData, _face: Face, _t: f64) -> Result<(), BcError> {
        Ok(())
    }

    /// The surface heat flux record, for conditions that keep one.
    fn heat_flux(&self) -> Option<&SurfaceHeatFlux> {
        None
    }

    /// Evaluate the surface heat flux from the viscous interface fluxes.
    fn compute_surface_heat_flux(&mut self, _data: &BlockData, _face: Face) -> Result<(), BcError> {
        Ok(())
    }

    fn write_surface_heat_flux(&self, path: &Path, t: f64, compressed: bool) -> Result<(), BcError> {
        match self.heat_flux() {
            Some(heat) => heat.write(path, t, compressed),
            None => Err(self.not_implemented("write_surface_heat_flux", None)),
        }
    }

    fn read_surface_heat_flux(&mut self, _path: &Path, _dims: usize, _compressed: bool) -> Result<(), BcError> {
        Err(self.not_implemented("read_surface_heat_flux", None))
    }

    /// Write the position and velocity of every interface on `face`.
    fn write_vertex_velocities(&self, data: &BlockData, face: Face, path: &Path, t: f64, dims: usize) -> Result<(), BcError> {
        let io_err = |source| BcError::Io { path: path.to_owned(), source };
        let mut out = output::create_writer(path, false).map_err(io_err)?;
        let axis = face.axis();

        writeln!(out, "# t = {:e}", t).map_err(io_err)?;
        writeln!(out, "# pos.x pos.y{} vel.x vel.y{}", z_col(dims, " pos.z"), z_col(dims, " vel.z")).map_err(io_err)?;

        for (f, _) in data.boundary_interfaces(face) {
            let iface = &data.ifaces[axis.index()][f];
            write_vector(&mut out, iface.position, dims).map_err(io_err)?;
            write!(out, " ").map_err(io_err)?;
            write_vector(&mut out, iface.vel, dims).map_err(io_err)?;
            writeln!(out).map_err(io_err)?;
        }
        out.finish().map_err(io_err)
    }

    fn not_implemented(&self, operation: &'static str, face: Option<Face>) -> BcError {
        BcError::NotImplemented { bc: self.name().to_owned(), operation, face }
    }
}




fn z_col(dims: usize, s: &str) -> &str {
    if dims == 3 { s } else { "" }
}

fn write_vector<W: Write + ?Sized>(out: &mut W, v: Vector3d, dims: usize) -> std::io::Result<()> {
    if dims == 3 {
        write!(out, "{:e} {:e} {:e}", v.x, v.y, v.z)
    } else {
        write!(out, "{:e} {:e}", v.x, v.y)
    }
}




/// A face that is shared with another block. The exchange layer fills its
/// ghost cells, so both apply operations are no-ops.
///
#[derive(Clone, Debug)]
pub struct ExchangeBoundary {
    pub other: Connection,
}

impl BoundaryCondition for ExchangeBoundary {
    fn name(&self) -> &str {
        "exchange"
    }

    fn connection(&self) -> Option<Connection> {
        Some(self.other)
    }

    fn apply_inviscid(&mut self, _data: &mut BlockData, _face: Face, _t: f64) -> Result<(), BcError> {
        Ok(())
    }
}




/// One entry of a surface heat-flux record.
///
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HeatFluxPoint {
    pub position: Vector3d,
    pub q_wall: f64,
    pub t_wall: f64,
}

/// Per-interface heat flux into a wall, with the text format used to write
/// it out and read it back on resume.
///
#[derive(Clone, Debug, Default)]
pub struct SurfaceHeatFlux {
    pub points: Vec<HeatFluxPoint>,
    dims: usize,
}

impl SurfaceHeatFlux {

    pub fn new(dims: usize) -> Self {
        Self { points: Vec::new(), dims }
    }

    /// Record the energy flux through each interface on `face`, signed so
    /// that heat flowing from the gas into the wall is positive.
    ///
    pub fn compute(&mut self, data: &BlockData, face: Face, t_wall: f64) {
        let axis = face.axis();
        let sign = face.outward_sign();
        self.dims = data.dimensions;
        self.points = data
            .boundary_interfaces(face)
            .into_iter()
            .map(|(f, _)| {
                let iface = &data.ifaces[axis.index()][f];
                HeatFluxPoint {
                    position: iface.position,
                    q_wall: iface.flux.total_energy * sign,
                    t_wall,
                }
            })
            .collect();
    }

    pub fn write(&self, path: &Path, t: f64, compressed: bool) -> Result<(), BcError> {
        let io_err = |source| BcError::Io { path: path.to_owned(), source };
        let mut out = output::create_writer(path, compressed).map_err(io_err)?;
        let dims = self.dims;

        writeln!(out, "# t = {:e}", t).map_err(io_err)?;
        writeln!(out, "# pos.x pos.y{} q_wall T_wall", z_col(dims, " pos.z")).map_err(io_err)?;

        for p in &self.points {
            write_vector(&mut out, p.position, dims).map_err(io_err)?;
            writeln!(out, " {:e} {:e}", p.q_wall, p.t_wall).map_err(io_err)?;
        }
        out.finish().map_err(io_err)
    }

    pub fn read(path: &Path, dims: usize, compressed: bool) -> Result<Self, BcError> {
        let io_err = |source| BcError::Io { path: path.to_owned(), source };
        let reader = output::open_reader(path, compressed).map_err(io_err)?;
        let ncol = if dims == 3 { 5 } else { 4 };
        let mut points = Vec::new();

        for line in reader.lines() {
            let line = line.map_err(io_err)?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cols: Vec<f64> = line
                .split_whitespace()
                .map(|c| c.parse::<f64>())
                .collect::<Result<_, _>>()
                .map_err(|e| io_err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

            if cols.len() != ncol {
                return Err(io_err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("expected {} columns, found {}", ncol, cols.len()))));
            }
            let position = if dims == 3 {
                Vector3d::new(cols[0], cols[1], cols[2])
            } else {
                Vector3d::new(cols[0], cols[1], 0.0)
            };
            points.push(HeatFluxPoint {
                position,
                q_wall: cols[ncol - 2],
                t_wall: cols[ncol - 1],
            });
        }
        Ok(Self { points, dims })
    }
}




/// Apply the inviscid boundary condition on every active face of a block.
///
pub fn apply_inviscid_bc(block: &mut Block, t: f64) -> Result<(), BcError> {
    let Block { data, bcs, .. } = block;

    for face in Face::active(data.dimensions) {
        bcs[face.index()].apply_inviscid(data, *face, t)?;
    }
    Ok(())
}

/// Apply the viscous boundary condition on every active face of a block.
///
pub fn apply_viscous_bc(block: &mut Block, t: f64) -> Result<(), BcError> {
    let Block { data, bcs, .. } = block;

    for face in Face::active(data.dimensions) {
        bcs[face.index()].apply_viscous(data, *face, t)?;
    }
    Ok(())
}

pub fn compute_surface_heat_flux(block: &mut Block) -> Result<(), BcError> {
    let Block { data, bcs, .. } = block;

    for face in Face::active(data.dimensions) {
        bcs[face.index()].compute_surface_heat_flux(data, *face)?;
    }
    Ok(())
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::block::BlockMesh;
    use crate::gas::IdealGas;
    use crate::state::FlowState;
    use std::sync::Arc;

    fn block() -> Block {
        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.1, 0.1, 1.0) };
        let mut b = Block::new(0, 2, (4, 3, 1), mesh, &gm);
        b.data.fill(|x| FlowState::from_pvt(&gm, 1.0e5 + 1.0e3 * x.x, Vector3d::new(30.0, -10.0, 0.0), 300.0, None).unwrap());
        b
    }

    struct Unsupported;

    impl BoundaryCondition for Unsupported {
        fn name(&self) -> &str {
            "unsupported"
        }

        fn apply_inviscid(&mut self, _: &mut BlockData, face: Face, _: f64) -> Result<(), BcError> {
            Err(self.not_implemented("apply_inviscid", Some(face)))
        }
    }

    #[test]
    fn slip_wall_reflects_normal_velocity() {
        let mut b = block();
        apply_inviscid_bc(&mut b, 0.0).unwrap();

        let ghost = b.data.cell((-1, 1, 0));
        let inner = b.data.cell((0, 1, 0));
        assert_eq!(ghost.fs.vel.x, -inner.fs.vel.x);
        assert_eq!(ghost.fs.vel.y, inner.fs.vel.y);
        assert_eq!(ghost.fs.gas.p, inner.fs.gas.p);

        let ghost2 = b.data.cell((-2, 1, 0));
        assert_eq!(ghost2.fs.gas.p, b.data.cell((1, 1, 0)).fs.gas.p);

        let north = b.data.cell((2, 3, 0));
        assert_eq!(north.fs.vel.y, -b.data.cell((2, 2, 0)).fs.vel.y);
    }

    #[test]
    fn extrapolation_copies_the_boundary_cell() {
        let mut b = block();
        b.set_bc(Face::East, Box::new(ExtrapolateOut));
        apply_inviscid_bc(&mut b, 0.0).unwrap();

        let edge = b.data.cell((3, 1, 0)).fs.clone();
        assert_eq!(b.data.cell((4, 1, 0)).fs, edge);
        assert_eq!(b.data.cell((5, 1, 0)).fs, edge);
    }

    #[test]
    fn supersonic_inflow_fills_every_ghost_layer() {
        let gm = IdealGas::default();
        let inflow = FlowState::from_pvt(&gm, 5.0e4, Vector3d::new(900.0, 0.0, 0.0), 250.0, None).unwrap();
        let mut b = block();
        b.set_bc(Face::West, Box::new(SupersonicIn::new(inflow.clone())));
        apply_inviscid_bc(&mut b, 0.0).unwrap();

        for j in 0..3 {
            assert_eq!(b.data.cell((-1, j, 0)).fs, inflow);
            assert_eq!(b.data.cell((-2, j, 0)).fs, inflow);
        }
    }

    #[test]
    fn fixed_temperature_wall_pins_interface_state() {
        let gm = Arc::new(IdealGas { species: 2, ..Default::default() });
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.1, 0.1, 1.0) };
        let mut b = Block::new(0, 2, (4, 3, 1), mesh, gm.as_ref());
        b.data.fill(|_| FlowState::from_pvt(gm.as_ref(), 1.0e5, Vector3d::new(30.0, 0.0, 0.0), 300.0, Some(&[0.5, 0.5])).unwrap());

        let catalytic = CatalyticWall { massf: vec![1.0, 0.0] };
        b.set_bc(Face::South, Box::new(FixedTWall::new(gm.clone(), 500.0).with_catalytic(catalytic).with_k_omega(true)));
        b.data.clear_fluxes();
        apply_viscous_bc(&mut b, 0.0).unwrap();

        for (f, c) in b.data.boundary_interfaces(Face::South) {
            let iface = &b.data.ifaces[1][f];
            let cell = &b.data.cells[c];
            assert!(iface.fixed_state);
            assert_eq!(iface.fs.vel, Vector3d::zero());
            assert_eq!(iface.fs.gas.t[0], 500.0);
            assert_eq!(iface.fs.tke, 0.0);
            assert_eq!(iface.fs.gas.massf, vec![1.0, 0.0]);

            let d = 0.05;
            let expected = 6.0 * cell.fs.gas.mu / (cell.fs.gas.rho * 0.075 * d * d);
            assert!((iface.fs.omega - expected).abs() / expected < 1e-12);
        }
    }

    #[test]
    fn laminar_wall_leaves_omega_alone() {
        let gm = Arc::new(IdealGas::default());
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.1, 0.1, 1.0) };
        let mut b = Block::new(0, 2, (4, 3, 1), mesh, gm.as_ref());
        b.data.fill(|_| FlowState::from_pvt(gm.as_ref(), 1.0e5, Vector3d::new(30.0, 0.0, 0.0), 300.0, None).unwrap());

        b.set_bc(Face::South, Box::new(FixedTWall::new(gm.clone(), 500.0)));
        b.data.clear_fluxes();
        apply_viscous_bc(&mut b, 0.0).unwrap();

        for (f, c) in b.data.boundary_interfaces(Face::South) {
            assert!(b.data.ifaces[1][f].fixed_state);
            assert_eq!(b.data.ifaces[1][f].fs.omega, b.data.cells[c].fs.omega);
        }
    }

    #[test]
    fn heat_flux_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wall.heat");
        let heat = SurfaceHeatFlux {
            points: vec![
                HeatFluxPoint { position: Vector3d::new(0.05, 0.0, 0.0), q_wall: 1.5e4, t_wall: 500.0 },
                HeatFluxPoint { position: Vector3d::new(0.15, 0.0, 0.0), q_wall: -2.0, t_wall: 500.0 },
            ],
            dims: 2,
        };
        heat.write(&path, 1e-3, true).unwrap();
        let back = SurfaceHeatFlux::read(&path, 2, true).unwrap();
        assert_eq!(back.points, heat.points);
    }

    #[test]
    fn unsupported_operation_is_reported() {
        let mut b = block();
        b.set_bc(Face::North, Box::new(Unsupported));
        match apply_inviscid_bc(&mut b, 0.0) {
            Err(BcError::NotImplemented { operation, face, .. }) => {
                assert_eq!(operation, "apply_inviscid");
                assert_eq!(face, Some(Face::North));
            }
            other => panic!("unexpected {:?}", other.err()),
        }
        assert!(matches!(
            SlipWall.write_surface_heat_flux(Path::new("x"), 0.0, false),
            Err(BcError::NotImplemented { .. })));
    }
}
