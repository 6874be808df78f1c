use std::io;
use crossbeam_channel::{Receiver, Sender};
use super::comm::Communicator;
use super::util;

/// A communicator between threads of one process, one crossbeam channel per
/// rank.
///
pub struct ChannelCommunicator {
    rank: usize,
    senders: Vec<Sender<Vec<u8>>>,
    receiver: Receiver<Vec<u8>>,
}

impl ChannelCommunicator {

    /// Create a fully connected group of `size` communicators, ordered by
    /// rank. Each is meant to be moved into its own worker thread.
    ///
    pub fn group(size: usize) -> Vec<Self> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..size).map(|_| crossbeam_channel::unbounded()).unzip();

        receivers
            .into_iter()
            .enumerate()
            .map(|(rank, receiver)| Self {
                rank,
                senders: senders.clone(),
                receiver,
            })
            .collect()
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> io::Result<()> {
        self.senders
            .get(rank)
            .ok_or_else(|| util::other_error(format!("no peer with rank {}", rank)))?
            .send(message)
            .map_err(util::other_error)
    }

    fn recv(&self) -> io::Result<Vec<u8>> {
        self.receiver.recv().map_err(util::other_error)
    }
}
