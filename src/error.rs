//! Error taxonomy for the plant simulator.
//!
//! Contract violations (`ConfigError`, `SignalError`) are fatal and surface
//! before any machine is built. `SinkError` is recoverable: the publisher logs
//! and drops the record. `MachineError::DoubleOccupancy` signals a logic bug.

use crate::piece::PieceId;

/// Invalid configuration detected at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A numeric parameter is outside its allowed range.
    #[error("invalid {field}: {reason}")]
    InvalidValue {
        /// Name of the offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A machine type string is not one of the supported kinds.
    #[error("unknown machine type `{0}`")]
    UnknownMachineType(String),

    /// A route template references a machine missing from the roster.
    #[error("route template {template} references unknown machine `{machine}`")]
    UnknownMachine {
        /// Index of the route template.
        template: usize,
        /// Machine name as written in the template.
        machine: String,
    },

    /// Two roster entries share a name.
    #[error("duplicate machine `{0}` in roster")]
    DuplicateMachine(String),

    /// Failed to read the configuration file.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse the configuration file.
    #[error("failed to parse config TOML: {source}")]
    Toml {
        /// The underlying TOML error.
        #[from]
        source: toml::de::Error,
    },
}

/// Contract violation inside the signal model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignalError {
    /// Time step was negative or not finite.
    #[error("invalid time step {0}s")]
    InvalidDuration(f64),

    /// Time constant must be strictly positive.
    #[error("invalid time constant {0}s")]
    InvalidTimeConstant(f64),

    /// Tool quality must be strictly positive.
    #[error("invalid tool quality {0}")]
    InvalidToolQuality(f64),

    /// A physical constant is out of its allowed range.
    #[error("invalid {name} {value}: {reason}")]
    InvalidConstant {
        /// Constant name as written in configuration.
        name: &'static str,
        /// Rejected value.
        value: f64,
        /// Allowed range.
        reason: &'static str,
    },
}

/// Failures raised by a machine's occupancy gate.
#[derive(Debug, thiserror::Error)]
pub enum MachineError {
    /// The machine is occupied by another piece.
    #[error("machine {machine} is busy")]
    Busy {
        /// Machine name.
        machine: String,
        /// Piece holding the machine, if it had not started releasing yet.
        occupant: Option<PieceId>,
    },

    /// More than one holder was observed on the same machine.
    #[error("machine {machine} observed {holders} concurrent holders")]
    DoubleOccupancy {
        /// Machine name.
        machine: String,
        /// Number of holders counted at acquisition.
        holders: usize,
    },

    /// The signal model rejected its inputs.
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Publish failure at the sink boundary.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The downstream consumer has gone away.
    #[error("sink closed")]
    Closed,

    /// The downstream consumer is not keeping up.
    #[error("sink full, record dropped")]
    Backpressure,

    /// Writing the record failed.
    #[error("sink write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Serializing the record failed.
    #[error("record encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top-level simulation error.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Configuration was rejected.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A machine reported an internal error.
    #[error("machine error: {0}")]
    Machine(#[from] MachineError),

    /// A plan step names a machine the plant does not have.
    #[error("no machine named `{0}` in the plant")]
    UnknownStation(String),

    /// A piece worker panicked or was aborted by the runtime.
    #[error("piece worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}
