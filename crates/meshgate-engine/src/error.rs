//! Engine error types.

use meshgate_classes::ClassError;
use meshgate_protocol::{CommError, MessageError, TransportError};
use thiserror::Error;

use crate::directory::UnitState;
use crate::fields::FieldId;

/// Errors loading or validating persisted configuration.
///
/// The engine treats any of these at connect time as "no persisted config".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Storage could not be read or written.
    #[error("config I/O error: {0}")]
    Io(String),

    /// Engine settings file is not valid YAML.
    #[error("config parse error: {0}")]
    Yaml(String),

    /// A setting is out of range.
    #[error("invalid config: {0}")]
    Invalid(String),

    /// Snapshot does not start with the expected magic.
    #[error("not a configuration snapshot")]
    BadMagic,

    /// Snapshot written by a newer format version.
    #[error("snapshot version {found} is newer than supported version {newest}")]
    UnsupportedVersion {
        /// Version in the snapshot.
        found: u16,
        /// Newest version this build reads.
        newest: u16,
    },

    /// Snapshot ended in the middle of a record.
    #[error("snapshot truncated while reading {0}")]
    Truncated(&'static str),

    /// Two units share a name.
    #[error("duplicate unit name {0:?}")]
    DuplicateName(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err.to_string())
    }
}

/// Errors parsing a driver command line.
///
/// These are raised before any transaction is attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The line is blank.
    #[error("empty command")]
    Empty,

    /// First token is not a known verb.
    #[error("unknown command {0:?}")]
    UnknownVerb(String),

    /// Wrong number of arguments.
    #[error("{verb}: expected {expected} parameter(s), got {actual}")]
    ParameterCount {
        /// Verb name.
        verb: &'static str,
        /// Accepted counts, e.g. "2 or 3".
        expected: &'static str,
        /// Count supplied.
        actual: usize,
    },

    /// Argument could not be parsed or is out of range.
    #[error("{verb}: bad {name} {value:?}: {reason}")]
    Format {
        /// Verb name.
        verb: &'static str,
        /// Parameter name.
        name: &'static str,
        /// Raw token.
        value: String,
        /// What is wrong with it.
        reason: String,
    },
}

/// Umbrella error for engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Exchange with the coordinator failed.
    #[error(transparent)]
    Comm(#[from] CommError),

    /// A command class could not encode or decode.
    #[error(transparent)]
    Class(#[from] ClassError),

    /// Persisted configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Malformed driver command.
    #[error(transparent)]
    Command(#[from] CommandError),

    /// Coordinator reply did not match its layout.
    #[error("malformed coordinator reply: {0}")]
    Message(#[from] MessageError),

    /// No unit with this id.
    #[error("unknown unit {0}")]
    UnknownUnit(u8),

    /// No field with this id.
    #[error("unknown field {0}")]
    UnknownField(FieldId),

    /// The field cannot be written.
    #[error("field {0} is read-only")]
    ReadOnlyField(FieldId),

    /// The unit lacks the class an operation needs.
    #[error("unit {unit} does not support {class}")]
    Unsupported {
        /// Unit id.
        unit: u8,
        /// Class name.
        class: &'static str,
    },

    /// The unit is not in a state that accepts commands.
    #[error("unit {unit} is {state}")]
    UnitNotReady {
        /// Unit id.
        unit: u8,
        /// Current state.
        state: UnitState,
    },

    /// The engine has no running connection.
    #[error("not connected")]
    NotConnected,
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        EngineError::Comm(CommError::from(err))
    }
}

impl EngineError {
    /// Whether this error counts against a unit's failure streak.
    pub fn is_unit_failure(&self) -> bool {
        matches!(self, EngineError::Comm(err) if !err.is_fatal())
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
