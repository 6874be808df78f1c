use std::io;
use std::path::PathBuf;
use thiserror::Error;
use crate::geometry::Face;




/**
 * Error to represent invalid gas data or a failed conserved-to-primitive
 * recovery.
 */
#[derive(Clone, Debug, Error, PartialEq)]
pub enum GasError {
    #[error("negative mass density: {0}")]
    NegativeMassDensity(f64),

    #[error("negative internal energy: {0}")]
    NegativeInternalEnergy(f64),

    #[error("equation of state produced a non-finite {0}")]
    NonFinite(&'static str),

    #[error("temperature {value} outside the configured bounds [{min}, {max}]")]
    TemperatureBound { value: f64, min: f64, max: f64 },

    #[error("{0}")]
    Collaborator(String),
}




/**
 * Error returned by a boundary condition applied to one face of a block.
 */
#[derive(Debug, Error)]
pub enum BcError {
    #[error("boundary condition {bc} does not implement {operation} (face {face:?})")]
    NotImplemented {
        bc: String,
        operation: &'static str,
        face: Option<Face>,
    },

    #[error("boundary condition {bc} on face {face:?}: {reason}")]
    Invalid {
        bc: String,
        face: Face,
        reason: String,
    },

    #[error("surface data file {path}: {source}")]
    Io {
        path: PathBuf,
        source: io::Error,
    },
}




/**
 * Error raised while moving ghost data between blocks or reducing values
 * across workers.
 */
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("block {0} is not known to this exchange")]
    UnknownBlock(usize),

    #[error("unsupported connection from block {block} face {face:?} to face {other:?} (orientation {orientation})")]
    UnsupportedConnection {
        block: usize,
        face: Face,
        other: Face,
        orientation: u8,
    },

    #[error("slab for block {block} face {face:?} has {got} entries, expected {expected}")]
    SlabSize {
        block: usize,
        face: Face,
        got: usize,
        expected: usize,
    },

    #[error("could not allocate exchange buffers: {0}")]
    BufferAllocation(String),

    #[error("message codec: {0}")]
    Codec(String),

    #[error("transport: {0}")]
    Transport(String),

    #[error("stopping because another worker failed ({0})")]
    PeerFailed(String),

    #[error("{0} is not available with a distributed exchange")]
    NotImplemented(&'static str),
}




/**
 * Error raised while reading the static configuration or the live control
 * parameters.
 */
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("could not parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}




/**
 * The process exit status, one value per category of failure.
 */
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Failure,
    FileError,
    MemoryError,
    DtSearchFailed,
    NotImplemented,
}




// ============================================================================
impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::Failure => 1,
            ExitStatus::FileError => 2,
            ExitStatus::MemoryError => 3,
            ExitStatus::DtSearchFailed => 4,
            ExitStatus::NotImplemented => 5,
        }
    }
}




/**
 * Fatal error from the time integration. Soft termination (time, steps, wall
 * clock, halt) is not an error.
 */
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("no active blocks at step {step}")]
    NoActiveBlocks { step: usize },

    #[error("time step search failed at step {step}")]
    DtSearchFailed { step: usize },

    #[error("peak CFL {cfl} exceeds the ceiling at step {step}")]
    CflCeiling { cfl: f64, step: usize },

    #[error("inviscid stage failed after {attempts} attempts at step {step}")]
    InviscidStageFailed { attempts: usize, step: usize },

    #[error("viscous stage produced {invalid} invalid cells at step {step}")]
    ViscousStageFailed { invalid: usize, step: usize },

    #[error(transparent)]
    Boundary(#[from] BcError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("snapshot {path}: {reason}")]
    Snapshot { path: PathBuf, reason: String },

    #[error("block {block}: {source}")]
    Gas { block: usize, source: GasError },

    #[error("collaborator failed: {0}")]
    Collaborator(String),

    #[error("{0} is not implemented")]
    NotImplemented(String),
}




// ============================================================================
impl ConfigError {

    /// Whether the file to be read does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConfigError::Read { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}




// ============================================================================
impl SolverError {

    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /**
     * Map this error onto the exit status reported to the invoking
     * environment.
     */
    pub fn exit_status(&self) -> ExitStatus {
        use SolverError::*;

        match self {
            DtSearchFailed { .. } => ExitStatus::DtSearchFailed,
            Io { .. } | Snapshot { .. } | Config(ConfigError::Read { .. }) => ExitStatus::FileError,
            Boundary(BcError::NotImplemented { .. }) => ExitStatus::NotImplemented,
            Boundary(BcError::Io { .. }) => ExitStatus::FileError,
            Exchange(ExchangeError::BufferAllocation(_)) => ExitStatus::MemoryError,
            Exchange(ExchangeError::NotImplemented(_)) | NotImplemented(_) => ExitStatus::NotImplemented,
            _ => ExitStatus::Failure,
        }
    }
}
