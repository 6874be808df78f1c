use std::collections::HashMap;
use std::io::{self, prelude::*};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use super::{backoff::ExponentialBackoff, comm::Communicator, util};

const CXN_TIMEOUT: Duration = Duration::from_millis(5000);
const RETRY_WAIT: Duration = Duration::from_millis(250);
const RETRY_MAX_WAIT: Duration = Duration::from_millis(5000);
const RETRY_LIMIT: usize = 20;

/// Owns the threads that move bytes between the TCP sockets and the
/// channels of a `TcpCommunicator`: one serial sender, and a listener which
/// spawns a reader per inbound connection.
///
struct TcpHost {
    send_thread: Option<JoinHandle<()>>,
    _listen_thread: JoinHandle<()>,
}

impl TcpHost {
    fn start(rank: usize, peers: Vec<SocketAddr>, send_src: Receiver<(usize, Vec<u8>)>, recv_sink: Sender<Vec<u8>>) -> io::Result<Self> {
        let addr = *peers
            .get(rank)
            .ok_or_else(|| util::other_error(format!("rank {} has no peer address", rank)))?;
        let listener = TcpListener::bind(addr)?;
        info!("listening on {}", addr);

        Ok(Self {
            send_thread: Some(Self::start_serial_sender(peers, send_src)),
            _listen_thread: Self::start_listener(listener, recv_sink),
        })
    }

    fn start_serial_sender(peers: Vec<SocketAddr>, send_src: Receiver<(usize, Vec<u8>)>) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut table: HashMap<usize, TcpStream> = HashMap::new();

            for (rank, message) in send_src {
                if let Err(e) = Self::send_one(&mut table, &peers, rank, &message) {
                    error!("failed to send {} bytes to rank {}: {}", message.len(), rank, e);
                }
            }
            debug!("outbound channel closed, sender shutting down");
        })
    }

    fn send_one(table: &mut HashMap<usize, TcpStream>, peers: &[SocketAddr], rank: usize, message: &[u8]) -> io::Result<()> {
        let addr = *peers
            .get(rank)
            .ok_or_else(|| util::other_error(format!("no peer with rank {}", rank)))?;

        for attempt in 0..2 {
            if !table.contains_key(&rank) {
                table.insert(rank, Self::connect_with_retry(addr)?);
            }
            let client = table
                .get_mut(&rank)
                .ok_or_else(|| util::other_error("connection table"))?;

            let result = util::write_frame(client, message).and_then(|()| {
                let ack = util::read_usize(client)?;
                if ack != message.len() {
                    return Err(util::other_error(format!(
                        "receiver acknowledged {} bytes, {} were sent", ack, message.len())));
                }
                Ok(())
            });
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt == 0 => {
                    warn!("send to {} failed ({}), reconnecting", addr, e);
                    table.remove(&rank);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn start_listener(listener: TcpListener, recv_sink: Sender<Vec<u8>>) -> JoinHandle<()> {
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        Self::handle_connection(stream, recv_sink.clone());
                    }
                    Err(e) => error!("failed to accept connection: {}", e),
                }
            }
        })
    }

    fn handle_connection(mut stream: TcpStream, recv_sink: Sender<Vec<u8>>) -> JoinHandle<()> {
        let remote = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
        info!("receiving connection from {}", remote);

        thread::spawn(move || loop {
            let result = util::read_usize(&mut stream)
                .and_then(|size| util::read_bytes_vec(&mut stream, size))
                .and_then(|bytes| {
                    let size = bytes.len();
                    recv_sink.send(bytes).map_err(util::other_error)?;
                    stream.write_all(&size.to_le_bytes())
                });

            if let Err(e) = result {
                debug!("connection from {} closed: {}", remote, e);
                break;
            }
        })
    }

    fn connect_with_retry(addr: SocketAddr) -> io::Result<TcpStream> {
        let mut last = util::other_error(format!("could not connect to {}", addr));

        for delay in ExponentialBackoff::new(RETRY_WAIT, RETRY_MAX_WAIT, 2).take(RETRY_LIMIT) {
            match TcpStream::connect_timeout(&addr, CXN_TIMEOUT) {
                Ok(s) => {
                    s.set_nodelay(true)?;
                    return Ok(s);
                }
                Err(e) => {
                    debug!("connect to {} failed: {}", addr, e);
                    last = e;
                    thread::sleep(delay);
                }
            }
        }
        Err(last)
    }
}




/// A communicator between separate processes over TCP. Messages are
/// length-prefixed and acknowledged with the received byte count.
///
pub struct TcpCommunicator {
    rank: usize,
    num_peers: usize,
    send_sink: Option<Sender<(usize, Vec<u8>)>>,
    recv_src: Receiver<Vec<u8>>,
    host: TcpHost,
}

impl TcpCommunicator {
    pub fn new(rank: usize, peers: Vec<SocketAddr>) -> io::Result<Self> {
        let num_peers = peers.len();
        let (send_sink, send_src) = crossbeam_channel::unbounded();
        let (recv_sink, recv_src) = crossbeam_channel::unbounded();
        let host = TcpHost::start(rank, peers, send_src, recv_sink)?;

        Ok(Self {
            rank,
            num_peers,
            send_sink: Some(send_sink),
            recv_src,
            host,
        })
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.num_peers
    }

    fn send(&self, rank: usize, message: Vec<u8>) -> io::Result<()> {
        self.send_sink
            .as_ref()
            .ok_or_else(|| util::other_error("communicator is shut down"))?
            .send((rank, message))
            .map_err(util::other_error)
    }

    fn recv(&self) -> io::Result<Vec<u8>> {
        self.recv_src.recv().map_err(util::other_error)
    }
}

impl Drop for TcpCommunicator {
    fn drop(&mut self) {
        self.send_sink.take();

        if let Some(handle) = self.host.send_thread.take() {
            if handle.join().is_err() {
                error!("tcp sender thread panicked");
            }
        }
    }
}
