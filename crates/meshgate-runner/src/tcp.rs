//! TCP transport.
//!
//! Talks to a coordinator exposed through a serial-to-TCP bridge. The bridge
//! passes bytes through untouched, so framing and handshakes are the same as
//! on a local serial line.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use meshgate_protocol::{Transport, TransportError};
use tracing::{debug, info};

/// Socket timeouts must be non-zero.
const MIN_TIMEOUT: Duration = Duration::from_millis(1);

/// Byte-stream transport over a TCP connection.
#[derive(Debug)]
pub struct TcpTransport {
    addr: String,
    connect_timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpTransport {
    /// Transport for `addr` (`host:port`). Nothing is connected until `open`.
    pub fn new(addr: impl Into<String>) -> Self {
        TcpTransport {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(3),
            stream: None,
        }
    }

    /// Override the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout.max(MIN_TIMEOUT);
        self
    }

    /// Bridge address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::NotOpen)
    }
}

impl Transport for TcpTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        self.close();
        let mut last = io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", self.addr));
        for addr in self.addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    info!("connected to coordinator bridge at {}", addr);
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(err) => {
                    debug!("connect to {} failed: {}", addr, err);
                    last = err;
                }
            }
        }
        Err(TransportError::Io(last))
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
            debug!("closed connection to {}", self.addr);
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn write(&mut self, bytes: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let stream = self.stream()?;
        stream.set_write_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        stream.write_all(bytes)?;
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let stream = self.stream()?;
        stream.set_read_timeout(Some(timeout.max(MIN_TIMEOUT)))?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.stream = None;
                Err(TransportError::Closed)
            }
            Ok(n) => Ok(n),
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    fn purge_inbound(&mut self) -> Result<(), TransportError> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 256];
        let mut purged = 0;
        let result = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(n) => purged += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        stream.set_nonblocking(false)?;
        if purged > 0 {
            debug!("purged {} stale bytes", purged);
        }
        result?;
        Ok(())
    }
}
