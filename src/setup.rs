use std::collections::HashMap;
use std::sync::Arc;
use crate::bc::{BoundaryCondition, CatalyticWall, ExchangeBoundary, ExtrapolateOut, FixedTWall, SlipWall, SupersonicIn};
use crate::block::{Block, BlockMesh};
use crate::config::{BcSpec, BlockConfig, Config, InitialState};
use crate::error::{GasError, SolverError};
use crate::exchange::Connection;
use crate::gas::GasModel;
use crate::geometry::Face;
use crate::state::FlowState;




/**
 * Build the flow state described by an initial-state table.
 */
pub fn initial_flow_state(gm: &dyn GasModel, initial: &InitialState) -> Result<FlowState, GasError> {
    FlowState::from_pvt(gm, initial.p, initial.vel, initial.t, initial.massf.as_deref())
}




/**
 * Build the boundary condition named in the configuration for one face.
 */
pub fn make_bc(spec: &BcSpec, config: &Config, gas: &Arc<dyn GasModel>) -> Result<Box<dyn BoundaryCondition>, GasError> {
    let bc: Box<dyn BoundaryCondition> = match spec {
        BcSpec::SlipWall => Box::new(SlipWall),
        BcSpec::ExtrapolateOut => Box::new(ExtrapolateOut),
        BcSpec::SupersonicIn { state } => {
            Box::new(SupersonicIn::new(initial_flow_state(gas.as_ref(), state)?))
        }
        BcSpec::FixedTWall { t_wall, catalytic_massf } => {
            let wall = FixedTWall::new(Arc::clone(gas), *t_wall).with_k_omega(config.k_omega);

            match catalytic_massf {
                Some(massf) => Box::new(wall.with_catalytic(CatalyticWall { massf: massf.clone() })),
                None => Box::new(wall),
            }
        }
        BcSpec::Exchange { block, face, orientation } => {
            Box::new(ExchangeBoundary {
                other: Connection { block: *block, face: *face, orientation: *orientation },
            })
        }
    };
    Ok(bc)
}




/**
 * Allocate one block from its description, attach its boundary conditions
 * and fill it with its initial state.
 */
pub fn build_block(
    id: usize,
    spec: &BlockConfig,
    config: &Config,
    gas: &Arc<dyn GasModel>) -> Result<Block, SolverError>
{
    let gm = gas.as_ref();
    let mesh = BlockMesh { origin: spec.origin, spacing: spec.spacing };
    let shape = (spec.shape[0], spec.shape[1], spec.shape[2]);
    let mut block = Block::new(id, config.dimensions, shape, mesh, gm);

    for face in Face::active(config.dimensions) {
        let bc = make_bc(spec.bcs.get(*face), config, gas).map_err(|source| SolverError::Gas { block: id, source })?;
        block.set_bc(*face, bc);
    }
    let fs = initial_flow_state(gm, &spec.initial).map_err(|source| SolverError::Gas { block: id, source })?;
    block.data.fill(|_| fs.clone());

    for cell in block.data.cells.iter_mut().filter(|c| !c.ghost) {
        cell.base_qdot = spec.heat_source;
    }
    block.hist_cells = spec.hist_cells.iter().map(|h| (h[0], h[1], h[2])).collect();
    Ok(block)
}




/**
 * Build the blocks with the given ids, in that order.
 */
pub fn build_blocks<I>(config: &Config, gas: &Arc<dyn GasModel>, ids: I) -> Result<Vec<Block>, SolverError>
where
    I: IntoIterator<Item = usize>,
{
    ids.into_iter()
        .map(|id| {
            let spec = config.blocks.get(id).ok_or_else(|| {
                SolverError::Collaborator(format!("block {} is not described in the configuration", id))
            })?;
            build_block(id, spec, config, gas)
        })
        .collect()
}




/**
 * Assign `num_blocks` blocks to `workers` workers in contiguous runs, as
 * evenly as possible. Returns the owning rank of every block id.
 */
pub fn partition_blocks(num_blocks: usize, workers: usize) -> HashMap<usize, usize> {
    let workers = workers.max(1);
    let base = num_blocks / workers;
    let extra = num_blocks % workers;
    let mut owner = HashMap::new();
    let mut id = 0;

    for rank in 0..workers {
        let count = base + if rank < extra { 1 } else { 0 };

        for _ in 0..count {
            owner.insert(id, rank);
            id += 1;
        }
    }
    owner
}

/**
 * The block ids owned by one rank, in increasing order.
 */
pub fn owned_blocks(owner: &HashMap<usize, usize>, rank: usize) -> Vec<usize> {
    let mut ids: Vec<usize> = owner.iter().filter(|(_, r)| **r == rank).map(|(id, _)| *id).collect();
    ids.sort_unstable();
    ids
}
