//! Command-class capability model.
//!
//! Units speak a set of functional sub-protocols ("command classes"). This
//! crate defines the contract every class implements, the registry that
//! dispatches to them, and the built-in classes:
//!
//! | Id | Class |
//! |------|-------------------|
//! | 0x25 | binary switch |
//! | 0x26 | multilevel switch |
//! | 0x30 | binary sensor |
//! | 0x31 | multilevel sensor |
//! | 0x70 | configuration |
//! | 0x71 | notification |
//! | 0x84 | wake-up |
//! | 0x85 | association |
//!
//! New classes are added by implementing [`CommandClass`] and calling
//! [`ClassRegistry::register`].

pub mod builtin;
mod class;
mod error;
mod registry;
mod security;
mod value;

pub use class::*;
pub use error::*;
pub use registry::*;
pub use security::*;
pub use value::*;
