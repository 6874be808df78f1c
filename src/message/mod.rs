//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write `send` and
//! `recv` operations for a given transport layer. Two transports are
//! included: crossbeam channels between threads of one process, and a
//! pure-Rust TCP host for separate processes. The trait then provides
//! default implementations for broadcast, reduce, and reduce-all operations.
//!
//! Collectives and block exchanges share one inbound queue, so every worker
//! wraps its transport in a `Mailbox`, which tags outgoing messages with an
//! epoch number and holds early arrivals until their epoch begins.
//!

mod backoff;
pub mod channel;
pub mod comm;
pub mod mailbox;
pub mod tcp;
pub mod util;

pub use channel::ChannelCommunicator;
pub use comm::Communicator;
pub use mailbox::Mailbox;
pub use tcp::TcpCommunicator;
