//! Command-class error types.

use thiserror::Error;

/// Errors raised while encoding commands or decoding reports.
///
/// A class error never stops the engine; it surfaces as a rejected field write
/// or a field entering error state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassError {
    /// No handler is registered for the class.
    #[error("unknown command class 0x{0:02X}")]
    UnknownClass(u8),

    /// The class does not implement the requested verb.
    #[error("{class} does not support {verb}")]
    Unsupported {
        /// Class name.
        class: &'static str,
        /// Verb description.
        verb: String,
    },

    /// Report shorter than its layout requires.
    #[error("{class} report truncated: need {needed} bytes, got {actual}")]
    Truncated {
        /// Class name.
        class: &'static str,
        /// Minimum length.
        needed: usize,
        /// Actual length.
        actual: usize,
    },

    /// Report carries a command id the class does not understand.
    #[error("unexpected command 0x{command:02X} for class 0x{class:02X}")]
    UnexpectedCommand {
        /// Class id.
        class: u8,
        /// Command id.
        command: u8,
    },

    /// A value is out of range or of the wrong type.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The binding is secure but no security layer is installed.
    #[error("secure binding without a security layer")]
    SecurityUnavailable,

    /// The security layer rejected a payload.
    #[error("security layer error: {0}")]
    Security(String),
}

impl ClassError {
    /// Create an invalid value error.
    pub fn invalid(message: impl Into<String>) -> Self {
        ClassError::InvalidValue(message.into())
    }

    /// Ensure `bytes` has at least `needed` bytes.
    pub fn check_len(class: &'static str, bytes: &[u8], needed: usize) -> Result<(), ClassError> {
        if bytes.len() < needed {
            return Err(ClassError::Truncated {
                class,
                needed,
                actual: bytes.len(),
            });
        }
        Ok(())
    }
}

/// Result type alias for command-class operations.
pub type ClassResult<T> = Result<T, ClassError>;
