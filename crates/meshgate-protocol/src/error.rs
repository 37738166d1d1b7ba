//! Protocol error types.

use thiserror::Error;

use crate::constants::FunctionId;

/// Errors produced while decoding a record from raw bytes.
///
/// All of these are recoverable: the record is dropped and the link carries on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer bytes than a full record.
    #[error("incomplete record: expected {expected} bytes, got {actual}")]
    Incomplete {
        /// Record length.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// First byte is not the start marker.
    #[error("bad start byte: 0x{0:02X}")]
    BadStart(u8),

    /// Checksum does not match the record body.
    #[error("checksum mismatch: computed 0x{expected:02X}, record carries 0x{actual:02X}")]
    ChecksumMismatch {
        /// Checksum computed over the received body.
        expected: u8,
        /// Checksum carried in the record.
        actual: u8,
    },

    /// Function byte does not map to a known gateway function.
    #[error("unknown command: 0x{0:02X}")]
    UnknownCommand(u8),

    /// Length byte exceeds the record data capacity.
    #[error("bad data length: {0}")]
    BadLength(u8),
}

/// Errors produced while encoding a record.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// Payload does not fit in one record.
    #[error("payload too long: maximum {max} bytes, got {actual}")]
    PayloadTooLong {
        /// Maximum payload length (function byte included).
        max: usize,
        /// Actual payload length.
        actual: usize,
    },

    /// Payload is empty (no function byte).
    #[error("payload is empty")]
    EmptyPayload,

    /// No offset value keeps the encoded body clear of control bytes.
    ///
    /// This is an internal invariant violation, not a link condition.
    #[error("no free offset value for record")]
    NoFreeOffset,
}

/// Errors produced while interpreting a coordinator reply.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageError {
    /// Reply carries a different function than requested.
    #[error("expected {expected} reply, got {actual}")]
    UnexpectedFunction {
        /// Requested function.
        expected: FunctionId,
        /// Function in the reply.
        actual: FunctionId,
    },

    /// Reply data shorter than its layout.
    #[error("{message} reply too short: need {needed} bytes, got {actual}")]
    TooShort {
        /// Message name.
        message: &'static str,
        /// Minimum data length.
        needed: usize,
        /// Actual data length.
        actual: usize,
    },
}

/// Errors reported by a [`Transport`](crate::Transport) implementation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The transport has not been opened.
    #[error("transport not open")]
    NotOpen,

    /// The peer closed the connection.
    #[error("transport closed by peer")]
    Closed,

    /// Underlying I/O failure.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a record was not accepted at link level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFailure {
    /// The coordinator answered NAK.
    Nak,
    /// The coordinator answered CAN.
    Cancelled,
    /// No handshake byte arrived before the deadline.
    NoAck,
}

impl std::fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkFailure::Nak => write!(f, "NAK"),
            LinkFailure::Cancelled => write!(f, "CAN"),
            LinkFailure::NoAck => write!(f, "no ACK"),
        }
    }
}

/// Result of a failed exchange with the coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    /// The record was rejected or not acknowledged at link level.
    #[error("link rejected record: {0}")]
    LinkRejected(LinkFailure),

    /// The record was acknowledged but no correlated reply arrived in time.
    #[error("no reply from 0x{address:02X} within {timeout_ms} ms")]
    NoReply {
        /// Address the request went to.
        address: u8,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },

    /// The transport failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Unrecoverable internal error (encoding invariant violated).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommError {
    /// Returns true for errors that count as a missed deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CommError::NoReply { .. } | CommError::LinkRejected(LinkFailure::NoAck)
        )
    }

    /// Returns true if the link itself misbehaved, as opposed to a silent unit.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, CommError::LinkRejected(_) | CommError::Transport(_))
    }

    /// Returns true if the engine must stop instead of retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommError::Internal(_))
    }
}

impl From<TransportError> for CommError {
    fn from(err: TransportError) -> Self {
        CommError::Transport(err.to_string())
    }
}

/// Result type alias for exchanges with the coordinator.
pub type CommResult<T> = Result<T, CommError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FrameError::ChecksumMismatch {
            expected: 0x12,
            actual: 0x34,
        };
        assert!(err.to_string().contains("0x12"));

        let err = CommError::NoReply {
            address: 5,
            timeout_ms: 250,
        };
        assert!(err.to_string().contains("250 ms"));
    }

    #[test]
    fn test_comm_error_classification() {
        assert!(CommError::LinkRejected(LinkFailure::NoAck).is_timeout());
        assert!(!CommError::LinkRejected(LinkFailure::Nak).is_timeout());
        assert!(CommError::Internal("x".into()).is_fatal());
        assert!(!CommError::Transport("x".into()).is_fatal());
    }
}
