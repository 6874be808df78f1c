use std::collections::HashMap;
use std::io;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use crate::block::Block;
use crate::error::ExchangeError;
use crate::geometry::Face;
use crate::message::{Communicator, Mailbox};
use super::{connected_faces, position_by_id, Exchange, Payload, SlabData};




/// A slab addressed to the ghost layers of one face of one block.
///
#[derive(Serialize, Deserialize)]
struct SlabMessage {
    block: usize,
    face: Face,
    slab: SlabData,
}




/// Exchange between workers that each own a disjoint subset of the blocks.
/// Pairs of local blocks are copied directly; slabs destined for another
/// worker are MessagePack-encoded and sent to the owner of the target block.
/// Connections must be symmetric: if face F of A names face G of B, then
/// face G of B names face F of A.
///
pub struct MessageExchange<C: Communicator> {
    mailbox: Mailbox<C>,
    owner: HashMap<usize, usize>,
}

impl<C: Communicator> MessageExchange<C> {

    /// Create an exchange over the given transport. `owner` maps every block
    /// id in the run to the rank that holds it.
    ///
    pub fn new(comm: C, owner: HashMap<usize, usize>) -> Self {
        Self { mailbox: Mailbox::new(comm), owner }
    }

    fn owner_of(&self, block: usize) -> Result<usize, ExchangeError> {
        self.owner.get(&block).copied().ok_or(ExchangeError::UnknownBlock(block))
    }

    fn all_reduce<F>(&mut self, f: F, x: f64) -> Result<f64, ExchangeError>
    where
        F: Fn(f64, f64) -> f64,
    {
        self.mailbox.advance();
        self.mailbox.all_reduce_f64(f, x).map_err(transport_error)
    }
}

fn transport_error(e: io::Error) -> ExchangeError {
    match e.kind() {
        io::ErrorKind::ConnectionAborted => ExchangeError::PeerFailed(e.to_string()),
        _ => ExchangeError::Transport(e.to_string()),
    }
}

impl<C: Communicator> Exchange for MessageExchange<C> {
    fn rank(&self) -> usize {
        self.mailbox.rank()
    }

    fn size(&self) -> usize {
        self.mailbox.size()
    }

    fn exchange(&mut self, blocks: &mut [Block], payload: Payload, only: Option<usize>) -> Result<(), ExchangeError> {
        self.mailbox.advance();

        let me = self.mailbox.rank();
        let position = position_by_id(blocks);
        let faces = connected_faces(blocks)?;
        let wanted = |id: usize| only.map_or(true, |b| b == id);
        let mut local = Vec::new();
        let mut expected = 0;

        // The local face (n, face) both receives from and sends to its
        // neighbour, so the same loop posts sends and counts receives.
        for (n, face, conn) in &faces {
            let id = blocks[*n].id();

            if self.owner_of(conn.block)? == me {
                if blocks[*n].active && wanted(id) {
                    let src = *position.get(&conn.block).ok_or(ExchangeError::UnknownBlock(conn.block))?;
                    local.push((*n, *face, blocks[src].data.extract_slab(conn.face, payload)));
                }
                continue;
            }
            if wanted(conn.block) {
                let message = SlabMessage {
                    block: conn.block,
                    face: conn.face,
                    slab: blocks[*n].data.extract_slab(*face, payload),
                };
                let bytes = rmp_serde::to_vec(&message).map_err(|e| ExchangeError::Codec(e.to_string()))?;
                self.mailbox
                    .send(self.owner_of(conn.block)?, bytes)
                    .map_err(transport_error)?;
            }
            if wanted(id) {
                expected += 1;
            }
        }

        let mut inbound: Vec<SlabMessage> = Vec::new();
        inbound
            .try_reserve(expected)
            .map_err(|e| ExchangeError::BufferAllocation(e.to_string()))?;

        for _ in 0..expected {
            let bytes = self.mailbox.recv().map_err(transport_error)?;
            inbound.push(rmp_serde::from_slice(&bytes).map_err(|e| ExchangeError::Codec(e.to_string()))?);
        }
        debug!("rank {} received {} slabs, copied {} locally", me, inbound.len(), local.len());

        for (n, face, slab) in local {
            blocks[n].data.insert_slab(face, &slab)?;
        }
        for message in inbound {
            let n = *position.get(&message.block).ok_or(ExchangeError::UnknownBlock(message.block))?;

            if blocks[n].active {
                blocks[n].data.insert_slab(message.face, &message.slab)?;
            }
        }
        Ok(())
    }

    fn min_f64(&mut self, x: f64) -> Result<f64, ExchangeError> {
        self.all_reduce(f64::min, x)
    }

    fn max_f64(&mut self, x: f64) -> Result<f64, ExchangeError> {
        self.all_reduce(f64::max, x)
    }

    fn sum_f64(&mut self, x: f64) -> Result<f64, ExchangeError> {
        self.all_reduce(|a, b| a + b, x)
    }

    fn abort(&mut self) {
        if self.mailbox.aborted_by().is_none() {
            warn!("rank {} aborting its peers", self.mailbox.rank());
        }
        self.mailbox.abort();
    }
}
