use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use crate::bc::{BoundaryCondition, SlipWall};
use crate::cell::{Cell, CellBounds, CellGeometry, NUM_TIME_LEVELS};
use crate::error::{ExchangeError, GasError};
use crate::exchange::{Payload, SlabData};
use crate::flux::{self, FluxCalculator, FluxWorkspace};
use crate::gas::GasModel;
use crate::geometry::{Axis, Face, Vector3d};
use crate::index_space::{self, range3d, Index, IndexSpace};
use crate::physics::UserHooks;
use crate::state::{ConservedQuantities, FlowState};




/// Number of ghost-cell layers beyond each face of a block.
///
pub const NUM_GHOST: i64 = 2;




/// A uniform rectilinear mesh: the lower corner of the block and the cell
/// spacing on each axis. Two-dimensional blocks have unit depth.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlockMesh {
    pub origin: Vector3d,
    pub spacing: Vector3d,
}

impl BlockMesh {
    pub fn cell_center(&self, index: Index) -> Vector3d {
        let (dx, o) = (self.spacing, self.origin);
        Vector3d::new(
            o.x + dx.x * (index.0 as f64 + 0.5),
            o.y + dx.y * (index.1 as f64 + 0.5),
            o.z + dx.z * (index.2 as f64 + 0.5))
    }

    pub fn face_center(&self, axis: Axis, index: Index) -> Vector3d {
        let c = self.cell_center(index);
        let h = self.spacing.component(axis) * 0.5;
        c - axis.unit() * h
    }

    pub fn cell_volume(&self) -> f64 {
        self.spacing.x * self.spacing.y * self.spacing.z
    }

    pub fn face_area(&self, axis: Axis) -> f64 {
        self.cell_volume() / self.spacing.component(axis)
    }
}




/// A cell interface: flux accumulator, an interface flow state that viscous
/// boundary conditions may pin, and the face velocity for moving grids.
///
#[derive(Clone, Debug)]
pub struct Interface {
    pub area: f64,
    pub position: Vector3d,
    pub vel: Vector3d,
    pub flux: ConservedQuantities,
    pub fs: FlowState,
    pub fixed_state: bool,
}




/// The cells, interfaces and mesh of one block. Boundary conditions receive
/// this part of a block mutably.
///
pub struct BlockData {
    pub id: usize,
    pub dimensions: usize,
    pub mesh: BlockMesh,
    pub cells: Vec<Cell>,
    pub ifaces: [Vec<Interface>; 3],
    pub grid_velocity: Vector3d,
    grid_offset: [Vector3d; NUM_TIME_LEVELS],
    interior: IndexSpace,
    extended: IndexSpace,
    iface_spaces: [IndexSpace; 3],
    cell_ijk: Vec<Index>,
    workspace: FluxWorkspace,
}




// ============================================================================
impl BlockData {

    pub fn new(id: usize, dimensions: usize, shape: (usize, usize, usize), mesh: BlockMesh, gm: &dyn GasModel) -> Self {
        let nk = if dimensions == 2 { 1 } else { shape.2 };
        let interior = range3d(0..shape.0 as i64, 0..shape.1 as i64, 0..nk as i64);
        let axes = Axis::active(dimensions);

        for axis in axes {
            assert!(
                interior.range(*axis).end >= NUM_GHOST,
                "block {} needs at least {} cells on every active axis", id, NUM_GHOST);
        }
        let extended = interior.extend(NUM_GHOST, axes);
        let cells = extended.iter().map(|index| Cell::new(gm, !interior.contains(index))).collect();
        let cell_ijk = extended.iter().collect();

        let iface_spaces = Axis::ALL.map(|axis| {
            if axes.contains(&axis) {
                interior.extend_upper(1, axis)
            } else {
                range3d(0..0, 0..0, 0..0)
            }
        });
        let ifaces = Axis::ALL.map(|axis| {
            iface_spaces[axis.index()]
                .iter()
                .map(|index| Interface {
                    area: mesh.face_area(axis),
                    position: mesh.face_center(axis, index),
                    vel: Vector3d::zero(),
                    flux: ConservedQuantities::new(gm.num_species(), gm.num_modes()),
                    fs: FlowState::new(gm),
                    fixed_state: false,
                })
                .collect()
        });

        let mut data = Self {
            id,
            dimensions,
            mesh,
            cells,
            ifaces,
            grid_velocity: Vector3d::zero(),
            grid_offset: [Vector3d::zero(); NUM_TIME_LEVELS],
            interior,
            extended,
            iface_spaces,
            cell_ijk,
            workspace: FluxWorkspace::new(gm.num_species(), gm.num_modes()),
        };
        data.compute_primary_cell_geometric_data(0);
        data.init_time_level_geometry();
        data
    }

    pub fn axes(&self) -> &'static [Axis] {
        Axis::active(self.dimensions)
    }

    pub fn interior(&self) -> &IndexSpace {
        &self.interior
    }

    pub fn cell_index(&self, index: Index) -> usize {
        self.extended.row_major_offset(index)
    }

    pub fn cell(&self, index: Index) -> &Cell {
        &self.cells[self.cell_index(index)]
    }

    pub fn cell_mut(&mut self, index: Index) -> &mut Cell {
        let n = self.cell_index(index);
        &mut self.cells[n]
    }

    pub fn interior_cells(&self) -> impl Iterator<Item = &Cell> + '_ {
        self.interior.iter().map(move |index| self.cell(index))
    }

    /// Indexes into `cells` of the `NUM_GHOST` layers adjacent to a face,
    /// ordered by depth and then row-major over the tangential indexes.
    ///
    pub fn face_layers(&self, face: Face, ghost: bool) -> Vec<usize> {
        (0..NUM_GHOST)
            .flat_map(|d| {
                let layer = if ghost {
                    self.interior.ghost_layer(face, d)
                } else {
                    self.interior.interior_layer(face, d)
                };
                layer.iter().collect::<Vec<_>>()
            })
            .map(|index| self.cell_index(index))
            .collect()
    }

    /// Indexes into `cells` of one layer adjacent to a face.
    ///
    pub fn face_layer(&self, face: Face, depth: i64, ghost: bool) -> Vec<usize> {
        let layer = if ghost {
            self.interior.ghost_layer(face, depth)
        } else {
            self.interior.interior_layer(face, depth)
        };
        layer.iter().map(|index| self.cell_index(index)).collect()
    }

    /// The interfaces lying on a face, each paired with the interior cell
    /// behind it.
    ///
    pub fn boundary_interfaces(&self, face: Face) -> Vec<(usize, usize)> {
        let axis = face.axis();
        let space = &self.iface_spaces[axis.index()];
        let layer = self.interior.interior_layer(face, 0);
        layer
            .iter()
            .map(|index| {
                let f = if face.is_upper() { index_space::offset(index, axis, 1) } else { index };
                (space.row_major_offset(f), self.cell_index(index))
            })
            .collect()
    }

    pub fn copy_flow_state(&mut self, from: usize, to: usize) {
        if from == to {
            return;
        }
        let (a, b) = if from < to {
            let (head, tail) = self.cells.split_at_mut(to);
            (&head[from], &mut tail[0])
        } else {
            let (head, tail) = self.cells.split_at_mut(from);
            (&tail[0], &mut head[to])
        };
        b.fs.copy_values_from(&a.fs);
    }

    /// Set the flow state of every interior cell from a function of the cell
    /// position, and encode the conserved state.
    ///
    pub fn fill<F>(&mut self, f: F)
    where
        F: Fn(Vector3d) -> FlowState,
    {
        for cell in self.cells.iter_mut().filter(|c| !c.ghost) {
            cell.fs = f(cell.geom[0].position);
            cell.encode_conserved();
        }
    }

    pub fn encode_conserved(&mut self) {
        self.cells.par_iter_mut().filter(|c| !c.ghost).for_each(|c| c.encode_conserved());
    }

    /// Decode every interior cell from the given level and return the
    /// number that failed.
    ///
    pub fn decode_conserved(&mut self, level: usize, gm: &dyn GasModel, bounds: &CellBounds) -> usize {
        self.cells
            .par_iter_mut()
            .filter(|c| !c.ghost)
            .map(|c| c.decode_conserved(level, gm, bounds).is_err() as usize)
            .sum()
    }

    pub fn record_conserved(&mut self) {
        self.cells.par_iter_mut().filter(|c| !c.ghost).for_each(|c| c.record_conserved());
    }

    pub fn restore_conserved(&mut self) {
        self.cells.par_iter_mut().filter(|c| !c.ghost).for_each(|c| c.restore_conserved());
        self.grid_offset = [self.grid_offset[0]; NUM_TIME_LEVELS];
        self.init_time_level_geometry();
    }

    pub fn commit_level(&mut self, level: usize) {
        self.cells.par_iter_mut().filter(|c| !c.ghost).for_each(|c| c.commit_level(level));
        self.grid_offset[0] = self.grid_offset[level];
    }

    pub fn clear_fluxes(&mut self) {
        for f in self.ifaces.iter_mut().flatten() {
            f.flux.clear();
            f.fixed_state = false;
        }
    }

    /// Evaluate the inviscid flux at every interface from the flow states on
    /// either side.
    ///
    pub fn inviscid_flux(&mut self, calc: FluxCalculator) {
        for axis in Axis::active(self.dimensions) {
            let a = axis.index();

            for (n, index) in self.iface_spaces[a].iter().enumerate() {
                let cl = &self.cells[self.extended.row_major_offset(index_space::offset(index, *axis, -1))];
                let cr = &self.cells[self.extended.row_major_offset(index)];
                let f = &mut self.ifaces[a][n];
                let wn = f.vel.component(*axis);

                let rusanov = match calc {
                    FluxCalculator::Hlle => false,
                    FluxCalculator::Rusanov => true,
                    FluxCalculator::Adaptive => cl.shock || cr.shock,
                };
                if rusanov {
                    flux::riemann_rusanov(&cl.fs, &cr.fs, *axis, wn, &mut self.workspace, &mut f.flux)
                } else {
                    flux::riemann_hlle(&cl.fs, &cr.fs, *axis, wn, &mut self.workspace, &mut f.flux)
                }
            }
        }
    }

    /// Evaluate thin-layer viscous fluxes. Interfaces whose state was pinned
    /// by a viscous boundary condition use that state, half a cell away from
    /// the interior cell.
    ///
    pub fn viscous_flux(&mut self, viscous_factor: f64) {
        for axis in Axis::active(self.dimensions) {
            let a = axis.index();
            let dx = self.mesh.spacing.component(*axis);
            let lower = self.interior.range(*axis).start;

            for (n, index) in self.iface_spaces[a].iter().enumerate() {
                let cl = &self.cells[self.extended.row_major_offset(index_space::offset(index, *axis, -1))];
                let cr = &self.cells[self.extended.row_major_offset(index)];
                let Interface { fs, flux, fixed_state, .. } = &mut self.ifaces[a][n];

                let on_lower_face = match axis {
                    Axis::I => index.0 == lower,
                    Axis::J => index.1 == lower,
                    Axis::K => index.2 == lower,
                };

                let (left, right, distance) = match (*fixed_state, on_lower_face) {
                    (true, true) => (&*fs, &cr.fs, 0.5 * dx),
                    (true, false) => (&cl.fs, &*fs, 0.5 * dx),
                    (false, _) => (&cl.fs, &cr.fs, dx),
                };
                flux::viscous_flux(left, right, *axis, distance, viscous_factor, flux);
            }
        }
    }

    /// Estimate the turbulent viscosity and conductivity of every cell from
    /// its k-omega state, or clear them for laminar flow.
    ///
    pub fn estimate_turbulence_viscosity(&mut self, k_omega: bool, prandtl_t: f64, cp: f64) {
        self.cells.par_iter_mut().for_each(|c| {
            if k_omega && c.fs.omega > 0.0 {
                c.fs.mu_t = (c.fs.gas.rho * c.fs.tke / c.fs.omega).max(0.0);
                c.fs.k_t = c.fs.mu_t * cp / prandtl_t;
            } else {
                c.fs.mu_t = 0.0;
                c.fs.k_t = 0.0;
            }
        });
    }

    /// Form the inviscid source vector of every interior cell at the given
    /// time level, adding the user source term if a hook is attached.
    ///
    pub fn inviscid_source_vectors(&mut self, level: usize, heat_factor: f64, hooks: Option<&dyn UserHooks>, t: f64) {
        let id = self.id;
        self.cells
            .par_iter_mut()
            .zip(self.cell_ijk.par_iter())
            .filter(|(c, _)| !c.ghost)
            .for_each(|(c, index)| {
                c.inviscid_source_vector(heat_factor);

                if let Some(hooks) = hooks {
                    let mut q = std::mem::take(&mut c.q);
                    hooks.source_vector(id, *index, &*c, level, t, &mut q);
                    c.q = q;
                }
            });
    }

    pub fn clear_source_vectors(&mut self) {
        self.cells.par_iter_mut().for_each(|c| c.q.clear());
    }

    /// Compute the time derivative of every interior cell at the given level
    /// from the interface fluxes and the source vector.
    ///
    pub fn time_derivatives(&mut self, level: usize) {
        let axes = Axis::active(self.dimensions);
        let ifaces = &self.ifaces;
        let spaces = &self.iface_spaces;

        self.cells
            .par_iter_mut()
            .zip(self.cell_ijk.par_iter())
            .filter(|(c, _)| !c.ghost)
            .for_each(|(cell, index)| {
                let Cell { dudt, q, geom, .. } = cell;
                let vol = geom[level].volume;
                let d = &mut dudt[level];
                d.copy_from(q);

                for axis in axes {
                    let a = axis.index();
                    let lo = &ifaces[a][spaces[a].row_major_offset(*index)];
                    let hi = &ifaces[a][spaces[a].row_major_offset(index_space::offset(*index, *axis, 1))];
                    d.add_scaled(-hi.area / vol, &hi.flux);
                    d.add_scaled(lo.area / vol, &lo.flux);
                }
            });
    }

    pub fn stage_update(&mut self, level: usize, dt: f64, time_order: usize) {
        self.cells
            .par_iter_mut()
            .filter(|c| !c.ghost)
            .for_each(|c| c.stage_update(level, dt, time_order));
    }

    /// Flag cells that sit in a strong compression on any axis.
    ///
    pub fn detect_shock_points(&mut self, compression_tolerance: f64) {
        let axes = self.axes();
        let flags: Vec<(usize, bool)> = self
            .interior
            .iter()
            .map(|index| {
                let shock = axes.iter().any(|axis| {
                    let l = self.cell(index_space::offset(index, *axis, -1));
                    let r = self.cell(index_space::offset(index, *axis, 1));
                    let dv = r.fs.vel.component(*axis) - l.fs.vel.component(*axis);
                    let a = l.fs.gas.a.min(r.fs.gas.a);
                    a > 0.0 && dv / a < compression_tolerance
                });
                (self.cell_index(index), shock)
            })
            .collect();

        for (n, shock) in flags {
            self.cells[n].shock = shock;
        }
    }

    /// Count invalid interior cells. When `adjust` is set, each invalid cell
    /// is replaced by the average of its valid face neighbours and the given
    /// level is re-encoded from it.
    ///
    pub fn count_invalid_cells(&mut self, level: usize, adjust: bool, gm: &dyn GasModel) -> usize {
        let invalid: Vec<Index> = self.interior.iter().filter(|index| self.cell(*index).invalid).collect();

        if adjust {
            for index in &invalid {
                let neighbours: Vec<&FlowState> = self
                    .axes()
                    .iter()
                    .flat_map(|axis| [index_space::offset(*index, *axis, -1), index_space::offset(*index, *axis, 1)])
                    .filter(|n| self.interior.contains(*n) && !self.cell(*n).invalid)
                    .map(|n| &self.cell(n).fs)
                    .collect();

                if neighbours.is_empty() {
                    continue;
                }
                if let Ok(fs) = FlowState::average_of(gm, &neighbours) {
                    let cell = self.cell_mut(*index);
                    cell.u[level].encode(&fs);
                    cell.fs = fs;
                    cell.invalid = false;
                }
            }
        }
        invalid.len()
    }

    pub fn init_residuals(&mut self) {
        self.cells.par_iter_mut().filter(|c| !c.ghost).for_each(|c| c.init_residuals());
    }

    /// Largest relative mass and energy change of any interior cell since
    /// the residuals were initialised, with the location of each maximum.
    ///
    pub fn compute_residuals(&self) -> ((f64, Vector3d), (f64, Vector3d)) {
        let mut mass = (0.0, Vector3d::zero());
        let mut energy = (0.0, Vector3d::zero());

        for cell in self.interior_cells() {
            let (m, e) = cell.residuals();
            if m > mass.0 {
                mass = (m, cell.geom[0].position);
            }
            if e > energy.0 {
                energy = (e, cell.geom[0].position);
            }
        }
        (mass, energy)
    }

    /// One half of a filter pass: diffuse (or anti-diffuse) density,
    /// velocity and per-mode energy with coefficient `mu`, then re-evaluate
    /// the thermodynamic state and re-encode.
    ///
    pub fn apply_spatial_filter(&mut self, mu: f64, anti: bool, gm: &dyn GasModel) -> Result<(), GasError> {
        let sign = if anti { -mu } else { mu };
        let axes = self.axes();
        let updates: Vec<(usize, f64, Vector3d, Vec<f64>)> = self
            .interior
            .iter()
            .map(|index| {
                let c = &self.cell(index).fs;
                let mut rho = 0.0;
                let mut vel = Vector3d::zero();
                let mut e = vec![0.0; c.gas.e.len()];

                for axis in axes {
                    let l = &self.cell(index_space::offset(index, *axis, -1)).fs;
                    let r = &self.cell(index_space::offset(index, *axis, 1)).fs;
                    rho += l.gas.rho + r.gas.rho - 2.0 * c.gas.rho;
                    vel += l.vel + r.vel - c.vel * 2.0;

                    for (m, em) in e.iter_mut().enumerate() {
                        *em += l.gas.e[m] + r.gas.e[m] - 2.0 * c.gas.e[m];
                    }
                }
                let e_new = c.gas.e.iter().zip(&e).map(|(ec, d)| ec + sign * d).collect();
                (self.cell_index(index), c.gas.rho + sign * rho, c.vel + vel * sign, e_new)
            })
            .collect();

        for (n, rho, vel, e) in updates {
            let cell = &mut self.cells[n];
            cell.fs.gas.rho = rho;
            cell.fs.vel = vel;
            cell.fs.gas.e = e;
            gm.update_thermo_from_rhoe(&mut cell.fs.gas)?;
            gm.update_transport_coeffs(&mut cell.fs.gas);
            cell.encode_conserved();
        }
        Ok(())
    }

    /// Copy the flow state just outside the west face along every i-row of
    /// the block, then re-encode.
    ///
    pub fn propagate_data_west_to_east(&mut self) {
        let ghost = self.face_layer(Face::West, 0, true);
        let (ni, _, _) = self.interior.dim();

        for src in ghost {
            let (_, j, k) = self.cell_ijk[src];

            for i in 0..ni as i64 {
                let dst = self.cell_index((i, j, k));
                self.copy_flow_state(src, dst);
            }
        }
        self.encode_conserved();
    }

    /// Copy out the interior layers behind a face, for delivery to the ghost
    /// layers of a neighbouring block.
    ///
    pub fn extract_slab(&self, face: Face, payload: Payload) -> SlabData {
        let cells = self.face_layers(face, false);

        match payload {
            Payload::FlowState => SlabData::Flow(cells.iter().map(|n| self.cells[*n].fs.clone()).collect()),
            Payload::InterfaceData => SlabData::Geometry(cells.iter().map(|n| self.cells[*n].geom).collect()),
        }
    }

    /// Write a slab produced by `extract_slab` on a neighbour into the ghost
    /// layers outside a face.
    ///
    pub fn insert_slab(&mut self, face: Face, slab: &SlabData) -> Result<(), ExchangeError> {
        let cells = self.face_layers(face, true);

        if slab.len() != cells.len() {
            return Err(ExchangeError::SlabSize {
                block: self.id,
                face,
                got: slab.len(),
                expected: cells.len(),
            });
        }
        match slab {
            SlabData::Flow(states) => {
                for (n, fs) in cells.iter().zip(states) {
                    self.cells[*n].fs.copy_values_from(fs);
                }
            }
            SlabData::Geometry(geom) => {
                for (n, g) in cells.iter().zip(geom) {
                    self.cells[*n].geom = *g;
                }
            }
        }
        Ok(())
    }

    /// Set cell and interface positions at one time level from the mesh and
    /// the rigid displacement of the block at that level.
    ///
    pub fn compute_primary_cell_geometric_data(&mut self, level: usize) {
        let offset = self.grid_offset[level];
        let mesh = &self.mesh;

        for (cell, index) in self.cells.iter_mut().zip(&self.cell_ijk) {
            cell.geom[level] = CellGeometry {
                position: mesh.cell_center(*index) + offset,
                volume: mesh.cell_volume(),
                lengths: mesh.spacing,
            };
        }
        if level == 0 {
            for axis in Axis::ALL {
                let a = axis.index();
                for (f, index) in self.ifaces[a].iter_mut().zip(self.iface_spaces[a].iter()) {
                    f.position = mesh.face_center(axis, index) + offset;
                }
            }
        }
    }

    pub fn init_time_level_geometry(&mut self) {
        self.cells.iter_mut().for_each(|c| c.init_time_level_geometry());
    }

    pub fn set_grid_velocity(&mut self, vel: Vector3d) {
        self.grid_velocity = vel;
        for f in self.ifaces.iter_mut().flatten() {
            f.vel = vel;
        }
    }

    /// Move the block to its position at the end of the sub-stage that reads
    /// `level`, and compute the geometry of the next level there.
    ///
    pub fn predict_vertex_positions(&mut self, level: usize, dt: f64, time_order: usize) {
        let fraction = match (time_order, level) {
            (3, 0) => 8.0 / 15.0,
            (3, 1) => 2.0 / 3.0,
            _ => 1.0,
        };
        self.grid_offset[level + 1] = self.grid_offset[0] + self.grid_velocity * (dt * fraction);
        self.compute_primary_cell_geometric_data(level + 1);
    }

    pub fn grid_offset(&self, level: usize) -> Vector3d {
        self.grid_offset[level]
    }

    /// Place the block at a rigid displacement from its mesh, at every time
    /// level.
    ///
    pub fn set_grid_offset(&mut self, offset: Vector3d) {
        self.grid_offset = [offset; NUM_TIME_LEVELS];
        self.compute_primary_cell_geometric_data(0);
        self.init_time_level_geometry();
    }
}




/// A block: its data, the boundary condition attached to each face, whether
/// it currently takes part in the integration, and its step diagnostics.
///
pub struct Block {
    pub data: BlockData,
    pub active: bool,
    pub(crate) bcs: Vec<Box<dyn BoundaryCondition>>,
    pub dt_allow: f64,
    pub cfl_min: f64,
    pub cfl_max: f64,
    pub mass_residual: f64,
    pub mass_residual_loc: Vector3d,
    pub energy_residual: f64,
    pub energy_residual_loc: Vector3d,
    pub hist_cells: Vec<Index>,
}




// ============================================================================
impl Block {

    /// Create an active block with slip walls on every face.
    ///
    pub fn new(id: usize, dimensions: usize, shape: (usize, usize, usize), mesh: BlockMesh, gm: &dyn GasModel) -> Self {
        Self {
            data: BlockData::new(id, dimensions, shape, mesh, gm),
            active: true,
            bcs: Face::ALL.iter().map(|_| Box::new(SlipWall) as Box<dyn BoundaryCondition>).collect(),
            dt_allow: f64::INFINITY,
            cfl_min: f64::INFINITY,
            cfl_max: 0.0,
            mass_residual: 0.0,
            mass_residual_loc: Vector3d::zero(),
            energy_residual: 0.0,
            energy_residual_loc: Vector3d::zero(),
            hist_cells: Vec::new(),
        }
    }

    pub fn id(&self) -> usize {
        self.data.id
    }

    pub fn dimensions(&self) -> usize {
        self.data.dimensions
    }

    pub fn bc(&self, face: Face) -> &dyn BoundaryCondition {
        self.bcs[face.index()].as_ref()
    }

    pub fn bc_mut(&mut self, face: Face) -> &mut dyn BoundaryCondition {
        self.bcs[face.index()].as_mut()
    }

    pub fn set_bc(&mut self, face: Face, bc: Box<dyn BoundaryCondition>) {
        self.bcs[face.index()] = bc;
    }

    /// Attach a new boundary condition to a face and hand back the old one,
    /// so a temporary override can be undone.
    ///
    pub fn replace_bc(&mut self, face: Face, bc: Box<dyn BoundaryCondition>) -> Box<dyn BoundaryCondition> {
        std::mem::replace(&mut self.bcs[face.index()], bc)
    }

    /// Search for the largest time step this block allows at the given CFL
    /// target, and the CFL range the current step would give. Returns false
    /// if some cell yields no usable signal speed.
    ///
    pub fn determine_time_step_size(&mut self, dt_current: f64, cfl_target: f64, viscous_factor: f64) -> bool {
        let axes = self.data.axes();
        let grid_vel = self.data.grid_velocity;
        let mut dt_allow = f64::INFINITY;
        let mut cfl_min = f64::INFINITY;
        let mut cfl_max = 0.0_f64;

        for cell in self.data.interior_cells() {
            let freq = cell.signal_frequency(axes, grid_vel, viscous_factor);

            if !(freq.is_finite() && freq > 0.0) {
                return false;
            }
            dt_allow = dt_allow.min(cfl_target / freq);
            cfl_min = cfl_min.min(dt_current * freq);
            cfl_max = cfl_max.max(dt_current * freq);
        }
        self.dt_allow = dt_allow;
        self.cfl_min = cfl_min;
        self.cfl_max = cfl_max;
        true
    }

    pub fn compute_residuals(&mut self) {
        let ((m, ml), (e, el)) = self.data.compute_residuals();
        self.mass_residual = m;
        self.mass_residual_loc = ml;
        self.energy_residual = e;
        self.energy_residual_loc = el;
    }

    /// Total mass and total energy held by the interior cells.
    ///
    pub fn totals(&self) -> (f64, f64) {
        self.data.interior_cells().fold((0.0, 0.0), |(m, e), c| {
            let v = c.geom[0].volume;
            (m + c.u[0].mass * v, e + c.u[0].total_energy * v)
        })
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::*;
    use crate::gas::IdealGas;

    fn block(shape: (usize, usize, usize)) -> Block {
        let gm = IdealGas::default();
        let mesh = BlockMesh {
            origin: Vector3d::zero(),
            spacing: Vector3d::new(0.01, 0.01, 1.0),
        };
        let mut b = Block::new(0, 2, shape, mesh, &gm);
        b.data.fill(|x| {
            let p = if x.x < 0.04 { 2.0e5 } else { 1.0e5 };
            FlowState::from_pvt(&gm, p, Vector3d::new(50.0, 0.0, 0.0), 300.0, None).unwrap()
        });
        b
    }

    #[test]
    fn face_layers_have_ghost_depth_times_face_size() {
        let b = block((8, 4, 1));
        assert_eq!(b.data.face_layers(Face::East, true).len(), 2 * 4);
        assert_eq!(b.data.face_layers(Face::North, false).len(), 2 * 8);
        assert!(b.data.face_layers(Face::East, true).iter().all(|n| b.data.cells[*n].ghost));
        assert!(b.data.face_layers(Face::East, false).iter().all(|n| !b.data.cells[*n].ghost));
    }

    #[test]
    fn boundary_interfaces_touch_their_cells() {
        let b = block((8, 4, 1));
        for face in Face::active(2) {
            for (f, c) in b.data.boundary_interfaces(*face) {
                let axis = face.axis();
                let iface = &b.data.ifaces[axis.index()][f];
                let cell = &b.data.cells[c];
                let d = (iface.position - cell.geom[0].position).component(axis);
                assert!((d.abs() - 0.005).abs() < 1e-12);
                assert_eq!(d > 0.0, face.is_upper());
            }
        }
    }

    #[test]
    fn time_step_search_reports_cfl_of_current_step() {
        let mut b = block((8, 4, 1));
        assert!(b.determine_time_step_size(1e-6, 0.5, 0.0));
        assert!(b.dt_allow > 0.0);
        assert!(b.cfl_max >= b.cfl_min);
        assert!((b.cfl_max / 1e-6 * b.dt_allow - 0.5).abs() < 1e-9);
    }

    #[test]
    fn time_step_search_fails_on_bad_cell() {
        let mut b = block((8, 4, 1));
        b.data.cell_mut((3, 2, 0)).fs.gas.a = f64::NAN;
        assert!(!b.determine_time_step_size(1e-6, 0.5, 0.0));
    }

    #[test]
    fn filter_leaves_uniform_state_unchanged() {
        let gm = IdealGas::default();
        let mesh = BlockMesh { origin: Vector3d::zero(), spacing: Vector3d::new(0.1, 0.1, 1.0) };
        let mut b = Block::new(0, 2, (4, 4, 1), mesh, &gm);
        let fs = FlowState::from_pvt(&gm, 1.0e5, Vector3d::new(10.0, 5.0, 0.0), 300.0, None).unwrap();
        for c in b.data.cells.iter_mut() {
            c.fs = fs.clone();
        }
        b.data.encode_conserved();
        let before = b.data.cell((1, 1, 0)).u[0].clone();
        b.data.apply_spatial_filter(0.05, false, &gm).unwrap();
        b.data.apply_spatial_filter(0.05, true, &gm).unwrap();
        let after = &b.data.cell((1, 1, 0)).u[0];
        assert!((after.mass - before.mass).abs() < 1e-12);
        assert!((after.total_energy - before.total_energy).abs() < 1e-6);
    }

    #[test]
    fn invalid_cell_is_replaced_by_neighbour_average() {
        let gm = IdealGas::default();
        let mut b = block((8, 4, 1));
        let cell = b.data.cell_mut((5, 2, 0));
        cell.invalid = true;
        cell.fs.gas.rho = -1.0;
        assert_eq!(b.data.count_invalid_cells(0, true, &gm), 1);
        assert!(!b.data.cell((5, 2, 0)).invalid);
        assert!(b.data.cell((5, 2, 0)).fs.gas.rho > 0.0);
        assert_eq!(b.data.count_invalid_cells(0, true, &gm), 0);
    }

    #[test]
    fn west_to_east_propagation_copies_ghost_state() {
        let gm = IdealGas::default();
        let mut b = block((8, 4, 1));
        let inflow = FlowState::from_pvt(&gm, 3.0e5, Vector3d::new(500.0, 0.0, 0.0), 400.0, None).unwrap();
        for n in b.data.face_layer(Face::West, 0, true) {
            b.data.cells[n].fs = inflow.clone();
        }
        b.data.propagate_data_west_to_east();
        for c in b.data.interior_cells() {
            assert_eq!(c.fs.gas.p, inflow.gas.p);
        }
    }
}
