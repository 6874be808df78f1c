use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::thread;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use super::comm::Communicator;
use super::util;

#[derive(Serialize, Deserialize)]
enum Envelope {
    Message { epoch: u64, data: Vec<u8> },
    Abort { rank: usize },
}

/// Enforces the proper ordering on incoming messages: messages are stamped
/// with the sender's epoch, and arrivals from a future epoch are kept until
/// the local worker has advanced to it. Every worker must advance the epoch
/// at the same points of its program, before each exchange and each
/// collective.
///
/// A worker that cannot go on sends an abort to its peers. Their pending and
/// later receives then fail with `ConnectionAborted` rather than waiting for
/// messages that will never come.
///
pub struct Mailbox<C: Communicator> {
    inner: C,
    epoch: Cell<u64>,
    buffer: RefCell<HashMap<u64, VecDeque<Vec<u8>>>>,
    aborted_by: Cell<Option<usize>>,
}

impl<C: Communicator> Mailbox<C> {

    pub fn new(inner: C) -> Self {
        Self {
            inner,
            epoch: Cell::new(0),
            buffer: RefCell::new(HashMap::new()),
            aborted_by: Cell::new(None),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.get()
    }

    pub fn advance(&self) {
        let epoch = self.epoch.get() + 1;
        self.epoch.set(epoch);

        if let Some(held) = self.buffer.borrow().get(&epoch) {
            debug!("{} messages were held for epoch {}", held.len(), epoch);
        }
    }

    /// The number of messages held for future epochs.
    ///
    pub fn held(&self) -> usize {
        self.buffer.borrow().values().map(VecDeque::len).sum()
    }

    /// Tell every other rank that this one is giving up. Peers that have
    /// already gone are skipped.
    ///
    pub fn abort(&self) {
        let bytes = match rmp_serde::to_vec(&Envelope::Abort { rank: self.rank() }) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("could not encode abort: {}", e);
                return;
            }
        };
        for rank in (0..self.size()).filter(|r| *r != self.rank()) {
            if let Err(e) = self.inner.send(rank, bytes.clone()) {
                debug!("abort not delivered to rank {}: {}", rank, e);
            }
        }
    }

    /// The rank whose abort this mailbox has received, if any.
    ///
    pub fn aborted_by(&self) -> Option<usize> {
        self.aborted_by.get()
    }
}

fn aborted_error(rank: usize) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, format!("rank {} aborted", rank))
}

impl<C: Communicator> Drop for Mailbox<C> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.abort();
        }
    }
}

impl<C: Communicator> Communicator for Mailbox<C> {
    fn rank(&self) -> usize {
        self.inner.rank()
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> io::Result<()> {
        let envelope = Envelope::Message { epoch: self.epoch.get(), data: message };
        let bytes = rmp_serde::to_vec(&envelope).map_err(util::other_error)?;
        self.inner.send(rank, bytes)
    }

    fn recv(&self) -> io::Result<Vec<u8>> {
        if let Some(rank) = self.aborted_by.get() {
            return Err(aborted_error(rank));
        }
        let epoch = self.epoch.get();

        let held = self.buffer.borrow_mut().get_mut(&epoch).and_then(VecDeque::pop_front);
        if let Some(data) = held {
            return Ok(data);
        }
        self.buffer.borrow_mut().remove(&epoch);

        loop {
            let bytes = self.inner.recv()?;
            let (sent, data) = match rmp_serde::from_slice::<Envelope>(&bytes).map_err(util::other_error)? {
                Envelope::Message { epoch, data } => (epoch, data),
                Envelope::Abort { rank } => {
                    self.aborted_by.set(Some(rank));
                    return Err(aborted_error(rank));
                }
            };
            if sent == epoch {
                return Ok(data);
            } else if sent > epoch {
                debug!("message for a future epoch ({}), buffering", sent);
                self.buffer.borrow_mut().entry(sent).or_default().push_back(data);
            } else {
                warn!("dropping message from past epoch {} (now {})", sent, epoch);
            }
        }
    }
}

#[cfg(test)]
mod test {

    use super::*;
    use crate::message::ChannelCommunicator;
    use std::thread;

    #[test]
    fn messages_from_a_past_epoch_are_dropped() {
        let mut group = ChannelCommunicator::group(2).into_iter();
        let a = Mailbox::new(group.next().unwrap());
        let b = Mailbox::new(group.next().unwrap());

        a.advance();
        a.send(1, vec![2]).unwrap();
        a.advance();
        a.send(1, vec![3]).unwrap();

        b.advance();
        b.advance();
        assert_eq!(b.recv().unwrap(), vec![3]);
        assert_eq!(b.held(), 0);
    }

    #[test]
    fn future_epoch_is_buffered_until_advanced() {
        let mut group = ChannelCommunicator::group(3).into_iter();
        let a = Mailbox::new(group.next().unwrap());
        let b = Mailbox::new(group.next().unwrap());
        let c = Mailbox::new(group.next().unwrap());

        a.advance();
        a.advance();
        a.send(1, vec![30]).unwrap();
        c.advance();
        c.send(1, vec![20]).unwrap();

        b.advance();
        assert_eq!(b.recv().unwrap(), vec![20]);
        assert_eq!(b.held(), 1);
        b.advance();
        assert_eq!(b.recv().unwrap(), vec![30]);
        assert_eq!(b.held(), 0);
    }

    #[test]
    fn abort_fails_a_waiting_reduction() {
        let mut group = ChannelCommunicator::group(2).into_iter();
        let a = Mailbox::new(group.next().unwrap());
        let b = Mailbox::new(group.next().unwrap());

        let waiter = thread::spawn(move || {
            b.advance();
            let result = b.all_reduce_f64(f64::max, 1.0);
            (result.map_err(|e| e.kind()), b.aborted_by(), b.recv().is_err())
        });
        a.advance();
        a.abort();

        let (result, aborted_by, later) = waiter.join().unwrap();
        assert_eq!(result, Err(io::ErrorKind::ConnectionAborted));
        assert_eq!(aborted_by, Some(0));
        assert!(later);
    }

    #[test]
    fn a_panicking_worker_aborts_its_peers() {
        let mut group = ChannelCommunicator::group(2).into_iter();
        let a = group.next().unwrap();
        let b = Mailbox::new(group.next().unwrap());

        let failed = thread::spawn(move || {
            let _mailbox = Mailbox::new(a);
            panic!("worker failed");
        });
        assert!(failed.join().is_err());
        b.advance();
        assert_eq!(b.recv().unwrap_err().kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn back_to_back_reductions_stay_separate() {
        let handles: Vec<_> = ChannelCommunicator::group(4)
            .into_iter()
            .map(|comm| {
                thread::spawn(move || {
                    let mailbox = Mailbox::new(comm);
                    let mut out = Vec::new();
                    for round in 0..20 {
                        mailbox.advance();
                        let x = (mailbox.rank() * round) as f64;
                        out.push(mailbox.all_reduce_f64(f64::max, x).unwrap());
                    }
                    out
                })
            })
            .collect();

        for h in handles {
            let out = h.join().unwrap();
            for (round, x) in out.into_iter().enumerate() {
                assert_eq!(x, (3 * round) as f64);
            }
        }
    }
}
