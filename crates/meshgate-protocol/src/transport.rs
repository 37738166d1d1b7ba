//! Byte-stream transport abstraction.
//!
//! The engine only needs a channel that can be opened, written and read with a
//! timeout, and purged of stale input. Whether the coordinator sits on a local
//! serial port or behind a network proxy is the implementor's business.

use std::time::Duration;

use crate::error::TransportError;

/// A byte-stream channel to the coordinator.
pub trait Transport: Send {
    /// Acquire the underlying channel.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Release the underlying channel. Closing a closed transport is a no-op.
    fn close(&mut self);

    /// Whether the channel is currently open.
    fn is_open(&self) -> bool;

    /// Write `bytes`, returning how many were written before `timeout`.
    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Read into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` if nothing arrived in time.
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Discard any input already received but not yet read.
    fn purge_inbound(&mut self) -> Result<(), TransportError>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).write(bytes, timeout)
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read(buf, timeout)
    }

    fn purge_inbound(&mut self) -> Result<(), TransportError> {
        (**self).purge_inbound()
    }
}
