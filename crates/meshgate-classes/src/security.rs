//! Security encapsulation seam.
//!
//! Secure bindings exchange payloads wrapped in an encapsulation class. The
//! cryptography is supplied by the host; the engine only routes payloads
//! through it.

use crate::class::{ClassId, UnitId};
use crate::error::ClassResult;

/// Host-supplied payload encapsulation for secure bindings.
pub trait SecurityLayer: Send + Sync {
    /// Class/command header that marks an encapsulated payload.
    fn encapsulation(&self) -> (ClassId, u8);

    /// Wrap a plain class payload for `unit`. The result starts with the
    /// encapsulation header.
    fn wrap(&self, unit: UnitId, payload: &[u8]) -> ClassResult<Vec<u8>>;

    /// Unwrap an encapsulated payload received from `unit`.
    fn unwrap(&self, unit: UnitId, payload: &[u8]) -> ClassResult<Vec<u8>>;
}
