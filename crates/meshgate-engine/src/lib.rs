//! Protocol engine for the mesh gateway.
//!
//! Sits between the wire layer ([`meshgate_protocol`]) and a host that only
//! reads and writes numbered fields. The engine enumerates the network,
//! interviews units for their command classes, reconciles what it finds with
//! the persisted configuration and keeps one field per readable or writable
//! value up to date by polling and by handling unsolicited reports.
//!
//! # Components
//!
//! - [`Directory`]: units, their lifecycle state and user configuration
//! - [`FieldTable`]: stable field ids bound to class values
//! - [`PollScheduler`]: round-robin polling of `Ready` units
//! - [`WakeUpQueue`]: commands held for sleeping units
//! - [`Snapshot`] and [`SnapshotStore`]: versioned binary configuration
//! - [`reconcile`]: merging a snapshot with the enumerated network
//! - [`DriverCommand`]: the text command surface
//! - [`Engine`]: lifecycle, dispatch and the host interface

mod association;
mod command;
mod config;
mod directory;
mod engine;
mod error;
mod fields;
mod poll;
mod reconcile;
mod store;
mod wakeup;

pub use association::*;
pub use command::*;
pub use config::*;
pub use directory::*;
pub use engine::*;
pub use error::*;
pub use fields::*;
pub use poll::*;
pub use reconcile::*;
pub use store::*;
pub use wakeup::*;
