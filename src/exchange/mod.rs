//! Copies shared-face data between blocks, so each block's ghost layers
//! agree with its neighbour's interior before boundary conditions or
//! filtering are applied. The scheduler talks to one `Exchange` object and
//! does not know whether the neighbours live in this process or another.
//!

use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use crate::block::Block;
use crate::cell::{CellGeometry, NUM_TIME_LEVELS};
use crate::error::ExchangeError;
use crate::geometry::Face;
use crate::state::FlowState;

mod distributed;

pub use distributed::MessageExchange;




/// What an exchange copies into the ghost layers.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// The full flow state of each ghost cell.
    FlowState,
    /// The geometry of each ghost cell at every time level.
    InterfaceData,
}




/// The far side of a shared face. Orientation zero means the tangential
/// indexes of both faces run the same way; no other orientation is
/// supported.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub block: usize,
    pub face: Face,
    pub orientation: u8,
}




/// The ghost-layer data for one face, ordered by depth and then row-major
/// over the tangential indexes.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SlabData {
    Flow(Vec<FlowState>),
    Geometry(Vec<[CellGeometry; NUM_TIME_LEVELS]>),
}

impl SlabData {
    pub fn len(&self) -> usize {
        match self {
            SlabData::Flow(v) => v.len(),
            SlabData::Geometry(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}




/// Interface for moving ghost data between blocks, and for the collective
/// reductions the scheduler needs. All workers must make the same sequence
/// of calls.
///
pub trait Exchange {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    /// Whether the blocks of this run are split over more than one worker.
    fn is_distributed(&self) -> bool {
        self.size() > 1
    }

    /// Fill the ghost layers of every connected face of the local blocks,
    /// or only those of block `only`. Inactive blocks are not written to.
    fn exchange(&mut self, blocks: &mut [Block], payload: Payload, only: Option<usize>) -> Result<(), ExchangeError>;

    fn min_f64(&mut self, x: f64) -> Result<f64, ExchangeError>;

    fn max_f64(&mut self, x: f64) -> Result<f64, ExchangeError>;

    fn max_usize(&mut self, x: usize) -> Result<usize, ExchangeError> {
        Ok(self.max_f64(x as f64)? as usize)
    }

    fn sum_f64(&mut self, x: f64) -> Result<f64, ExchangeError>;

    /// Logical OR across workers.
    fn any(&mut self, flag: bool) -> Result<bool, ExchangeError> {
        Ok(self.max_f64(if flag { 1.0 } else { 0.0 })? > 0.0)
    }

    /// Called by a worker that is about to stop on a fatal error, so that
    /// workers waiting on it fail with `PeerFailed` instead of blocking.
    fn abort(&mut self) {}
}




/// Reject connections other than aligned faces sharing a normal axis.
///
pub fn check_connection(block: usize, face: Face, other: &Connection) -> Result<(), ExchangeError> {
    if other.orientation != 0 || other.face.axis() != face.axis() {
        return Err(ExchangeError::UnsupportedConnection {
            block,
            face,
            other: other.face,
            orientation: other.orientation,
        });
    }
    Ok(())
}

/// The connected faces of the given blocks, as (local position, face,
/// connection) triples.
///
pub(crate) fn connected_faces(blocks: &[Block]) -> Result<Vec<(usize, Face, Connection)>, ExchangeError> {
    let mut faces = Vec::new();

    for (n, block) in blocks.iter().enumerate() {
        for face in Face::active(block.dimensions()) {
            if let Some(conn) = block.bc(*face).connection() {
                check_connection(block.id(), *face, &conn)?;
                faces.push((n, *face, conn));
            }
        }
    }
    Ok(faces)
}

pub(crate) fn position_by_id(blocks: &[Block]) -> HashMap<usize, usize> {
    blocks.iter().enumerate().map(|(n, b)| (b.id(), n)).collect()
}




/// Exchange between blocks that all live in this process. Reductions are
/// the identity.
///
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalExchange;

impl Exchange for LocalExchange {
    fn exchange(&mut self, blocks: &mut [Block], payload: Payload, only: Option<usize>) -> Result<(), ExchangeError> {
        let position = position_by_id(blocks);
        let mut slabs = Vec::new();

        for (n, face, conn) in connected_faces(blocks)? {
            let target = &blocks[n];

            if !target.active || only.map_or(false, |id| id != target.id()) {
                continue;
            }
            let src = *position.get(&conn.block).ok_or(ExchangeError::UnknownBlock(conn.block))?;
            slabs.push((n, face, blocks[src].data.extract_slab(conn.face, payload)));
        }
        for (n, face, slab) in slabs {
            blocks[n].data.insert_slab(face, &slab)?;
        }
        Ok(())
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
