//! Gridstep is the time-integration core of a multi-block, structured-grid
//! finite-volume solver for compressible flow. Each worker owns a set of
//! Cartesian blocks with two ghost layers on every active face. A
//! `Simulation` advances them in global steps whose size is chosen from a
//! CFL search, with predictor-corrector (or RK3) inviscid stages that are
//! rolled back and retried at a smaller step when cells fail to decode.
//! Viscous, chemistry, thermal, radiation and filter sub-steps are layered on
//! top, and neighbouring blocks exchange ghost data either in process or
//! between workers over channels or TCP.

pub mod bc;
pub mod block;
pub mod cell;
pub mod config;
pub mod error;
pub mod exchange;
pub mod flux;
pub mod gas;
pub mod geometry;
pub mod index_space;
pub mod launch;
pub mod message;
pub mod output;
pub mod physics;
pub mod radiation;
pub mod scheduler;
pub mod setup;
pub mod stage;
pub mod state;

pub use scheduler::{adapt_time_step, RunState, Simulation, StopReason};
