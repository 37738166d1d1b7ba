//! Mesh Gateway Serial Protocol
//!
//! This crate provides the wire layer for talking to a mesh-network coordinator
//! over a byte-oriented transport: fixed-length record framing, the link-level
//! ACK/NAK handshake, and request/reply correlation.
//!
//! # Protocol Overview
//!
//! - **Records** carry a unit address, a gateway function and up to 32 data
//!   bytes, shifted by a per-record offset and protected by a checksum.
//! - **Handshake**: the receiver of a record answers with a single `ACK` or
//!   `NAK` byte.
//! - **Transactions**: a request is complete once it is acknowledged and, for
//!   request/response functions, once the correlated reply record arrives.
//! - **Gateway messages**: enumeration replies (unit list, device type codes,
//!   node information) have fixed data layouts, see [`InitData`] and friends.
//!
//! # Example
//!
//! ```rust,ignore
//! use meshgate_protocol::{Expect, FunctionId, TransactionManager};
//!
//! let link = TransactionManager::new(transport);
//! link.open()?;
//! let reply = link.send_and_await(
//!     0,
//!     &[FunctionId::GetInitData.as_u8()],
//!     Expect::Function(FunctionId::GetInitData),
//!     Duration::from_millis(500),
//! )?;
//! ```

mod constants;
mod error;
mod frame;
mod gateway;
mod transaction;
mod transport;

pub use constants::*;
pub use error::*;
pub use frame::*;
pub use gateway::*;
pub use transaction::*;
pub use transport::*;
