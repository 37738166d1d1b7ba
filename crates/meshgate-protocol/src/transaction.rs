//! Request/response correlation over the serial link.
//!
//! A [`TransactionManager`] owns the transport. Every exchange holds the link
//! lock from the first written byte until the reply (or deadline), so at most
//! one transaction is outstanding at any time and two requests with the same
//! correlation key are strictly serialized. Records that arrive while waiting
//! but do not answer the current request are kept for the unsolicited path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use parking_lot::Mutex;

use crate::constants::*;
use crate::error::{CommError, CommResult, LinkFailure, TransportError};
use crate::frame::{encode, Frame, FrameReader, LinkEvent};
use crate::transport::Transport;

/// Consecutive link-level failures before the link is reported as degraded.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Maximum unsolicited records kept while nobody drains them.
pub const UNSOLICITED_LIMIT: usize = 64;

/// Timeout for writing a single handshake byte.
const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_millis(50);

// ============================================================================
// Types
// ============================================================================

/// Identifies a request for serialization and logging purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    /// Target address.
    pub address: u8,
    /// Command class (0 for gateway-local functions).
    pub class: u8,
    /// Class command, or the function byte for gateway-local functions.
    pub command: u8,
}

impl CorrelationKey {
    /// Derive the key for a payload (function byte + data).
    pub fn for_payload(address: u8, payload: &[u8]) -> Self {
        match payload {
            [FUNC_SEND_DATA, class, command, ..] => CorrelationKey {
                address,
                class: *class,
                command: *command,
            },
            [function, ..] => CorrelationKey {
                address,
                class: 0,
                command: *function,
            },
            [] => CorrelationKey {
                address,
                class: 0,
                command: 0,
            },
        }
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unit {} class 0x{:02X} cmd 0x{:02X}",
            self.address, self.class, self.command
        )
    }
}

/// Shape of the reply that completes a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The link-level ACK is the whole answer.
    AckOnly,
    /// A record from the same address carrying this function.
    Function(FunctionId),
    /// An application command from the same address with this class/command.
    ClassReport {
        /// Reply class id.
        class: u8,
        /// Reply command id.
        command: u8,
    },
}

impl Expect {
    /// Whether `frame` answers a request sent to `address`.
    pub fn matches(&self, address: u8, frame: &Frame) -> bool {
        if frame.address != address {
            return false;
        }
        match *self {
            Expect::AckOnly => false,
            Expect::Function(function) => frame.function == function,
            Expect::ClassReport { class, command } => {
                frame.function == FunctionId::ApplicationCommand
                    && frame.class_header() == Some((class, command))
            }
        }
    }
}

/// Successful completion of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Acknowledged at link level; no reply was expected.
    Ack,
    /// The correlated reply record.
    Frame(Frame),
}

impl Reply {
    /// The reply record, if one was expected.
    pub fn into_frame(self) -> Option<Frame> {
        match self {
            Reply::Ack => None,
            Reply::Frame(frame) => Some(frame),
        }
    }
}

/// Link counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Records written.
    pub frames_sent: u64,
    /// Valid records received.
    pub frames_received: u64,
    /// Records dropped as corrupt or incomplete.
    pub corrupt: u64,
    /// ACK bytes received.
    pub acks: u64,
    /// NAK or CAN bytes received.
    pub naks: u64,
    /// Exchanges that ran past their deadline.
    pub timeouts: u64,
    /// Unsolicited records dropped because the queue was full.
    pub unsolicited_dropped: u64,
}

// ============================================================================
// Link
// ============================================================================

struct Link<T> {
    transport: T,
    reader: FrameReader,
    unsolicited: VecDeque<Frame>,
    stats: LinkStats,
}

impl<T: Transport> Link<T> {
    fn write_record(&mut self, record: &[u8], timeout: Duration, trace_frames: bool) -> CommResult<()> {
        let written = self.transport.write(record, timeout)?;
        if written != record.len() {
            return Err(CommError::Transport(format!(
                "short write: {} of {} bytes",
                written,
                record.len()
            )));
        }
        self.stats.frames_sent += 1;
        if trace_frames {
            debug!("tx {}", hex::encode(record));
        }
        Ok(())
    }

    fn send_control(&mut self, byte: u8) {
        if let Err(e) = self.transport.write(&[byte], CONTROL_WRITE_TIMEOUT) {
            warn!("failed to send handshake 0x{:02X}: {}", byte, e);
        }
    }

    /// Wait for the next inbound event until `deadline`.
    ///
    /// Valid records are acknowledged and corrupt ones rejected before the
    /// event is handed back.
    fn next_event(&mut self, deadline: Instant, trace_frames: bool) -> CommResult<Option<LinkEvent>> {
        let mut buf = [0u8; RECORD_LEN];
        loop {
            if let Some(event) = self.reader.next_event() {
                match &event {
                    LinkEvent::Frame(frame) => {
                        self.stats.frames_received += 1;
                        self.send_control(ACK);
                        if trace_frames {
                            debug!(
                                "rx {} from 0x{:02X}: {}",
                                frame.function,
                                frame.address,
                                hex::encode(&frame.data)
                            );
                        }
                    }
                    LinkEvent::Corrupt(err) => {
                        self.stats.corrupt += 1;
                        warn!("dropping corrupt record: {}", err);
                        self.send_control(NAK);
                    }
                    LinkEvent::Ack => self.stats.acks += 1,
                    LinkEvent::Nak | LinkEvent::Cancel => self.stats.naks += 1,
                }
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                if let Some(err) = self.reader.expire() {
                    self.stats.corrupt += 1;
                    debug!("partial record expired: {}", err);
                }
                return Ok(None);
            }

            let n = self.transport.read(&mut buf, deadline - now)?;
            if n > 0 {
                self.reader.push(&buf[..n]);
            }
        }
    }

    fn queue_unsolicited(&mut self, frame: Frame) {
        if self.unsolicited.len() >= UNSOLICITED_LIMIT {
            self.unsolicited.pop_front();
            self.stats.unsolicited_dropped += 1;
            warn!("unsolicited queue full, dropping oldest record");
        }
        self.unsolicited.push_back(frame);
    }

    fn exchange(
        &mut self,
        record: &[u8],
        key: CorrelationKey,
        expect: Expect,
        timeout: Duration,
        trace_frames: bool,
    ) -> CommResult<Reply> {
        let deadline = Instant::now() + timeout;
        self.write_record(record, timeout, trace_frames)?;

        // Phase 1: link handshake.
        loop {
            match self.next_event(deadline, trace_frames)? {
                Some(LinkEvent::Ack) => break,
                Some(LinkEvent::Nak) => return Err(CommError::LinkRejected(LinkFailure::Nak)),
                Some(LinkEvent::Cancel) => {
                    return Err(CommError::LinkRejected(LinkFailure::Cancelled))
                }
                Some(LinkEvent::Frame(frame)) => self.queue_unsolicited(frame),
                Some(LinkEvent::Corrupt(_)) => {}
                None => {
                    self.stats.timeouts += 1;
                    return Err(CommError::LinkRejected(LinkFailure::NoAck));
                }
            }
        }

        if expect == Expect::AckOnly {
            return Ok(Reply::Ack);
        }

        // Phase 2: correlated reply.
        loop {
            match self.next_event(deadline, trace_frames)? {
                Some(LinkEvent::Frame(frame)) if expect.matches(key.address, &frame) => {
                    return Ok(Reply::Frame(frame));
                }
                Some(LinkEvent::Frame(frame)) => {
                    trace!("queueing record from 0x{:02X} while waiting on {}", frame.address, key);
                    self.queue_unsolicited(frame);
                }
                Some(_) => {}
                None => {
                    self.stats.timeouts += 1;
                    return Err(CommError::NoReply {
                        address: key.address,
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }
}

// ============================================================================
// Transaction Manager
// ============================================================================

/// Serializes all traffic with the coordinator.
pub struct TransactionManager<T: Transport> {
    link: Mutex<Link<T>>,
    consecutive_failures: AtomicU32,
    failure_threshold: u32,
    trace_frames: AtomicBool,
}

impl<T: Transport> TransactionManager<T> {
    /// Create a manager owning `transport`.
    pub fn new(transport: T) -> Self {
        TransactionManager {
            link: Mutex::new(Link {
                transport,
                reader: FrameReader::new(),
                unsolicited: VecDeque::new(),
                stats: LinkStats::default(),
            }),
            consecutive_failures: AtomicU32::new(0),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            trace_frames: AtomicBool::new(false),
        }
    }

    /// Set how many consecutive link-level failures mark the link as degraded.
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Open the transport and discard stale input.
    pub fn open(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        link.transport.open()?;
        link.transport.purge_inbound()?;
        link.reader.clear();
        link.unsolicited.clear();
        self.consecutive_failures.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Close the transport.
    pub fn close(&self) {
        let mut link = self.link.lock();
        link.transport.close();
        link.reader.clear();
        link.unsolicited.clear();
    }

    /// Whether the transport is open.
    pub fn is_open(&self) -> bool {
        self.link.lock().transport.is_open()
    }

    /// Discard buffered input on both the transport and the reader.
    pub fn purge(&self) -> Result<(), TransportError> {
        let mut link = self.link.lock();
        link.transport.purge_inbound()?;
        link.reader.clear();
        Ok(())
    }

    /// Enable or disable hex tracing of every record.
    pub fn set_trace(&self, enabled: bool) {
        self.trace_frames.store(enabled, Ordering::Relaxed);
    }

    /// Whether hex tracing is enabled.
    pub fn trace_enabled(&self) -> bool {
        self.trace_frames.load(Ordering::Relaxed)
    }

    /// Send `payload` (function byte + data) to `address` and wait for `expect`.
    pub fn send_and_await(
        &self,
        address: u8,
        payload: &[u8],
        expect: Expect,
        timeout: Duration,
    ) -> CommResult<Reply> {
        let key = CorrelationKey::for_payload(address, payload);
        let record = encode(address, payload).map_err(|e| {
            error!("cannot encode record for {}: {}", key, e);
            CommError::Internal(e.to_string())
        })?;

        let trace_frames = self.trace_enabled();
        let result = {
            let mut link = self.link.lock();
            if !link.transport.is_open() {
                Err(CommError::from(TransportError::NotOpen))
            } else {
                link.exchange(&record, key, expect, timeout, trace_frames)
            }
        };

        match &result {
            Err(err) if err.is_link_failure() => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("{} failed ({} link failures in a row): {}", key, failures, err);
            }
            Err(err) if err.is_fatal() => {}
            // The coordinator answered, even if the unit stayed silent.
            _ => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
        }
        result
    }

    /// Send a decoded frame and wait for `expect`.
    pub fn send_frame(&self, frame: &Frame, expect: Expect, timeout: Duration) -> CommResult<Reply> {
        self.send_and_await(frame.address, &frame.payload(), expect, timeout)
    }

    /// Next record not consumed by a transaction, waiting at most `timeout`.
    pub fn next_unsolicited(&self, timeout: Duration) -> CommResult<Option<Frame>> {
        let trace_frames = self.trace_enabled();
        let mut link = self.link.lock();
        if let Some(frame) = link.unsolicited.pop_front() {
            return Ok(Some(frame));
        }
        if !link.transport.is_open() {
            return Err(CommError::from(TransportError::NotOpen));
        }

        let deadline = Instant::now() + timeout;
        loop {
            match link.next_event(deadline, trace_frames)? {
                Some(LinkEvent::Frame(frame)) => return Ok(Some(frame)),
                Some(LinkEvent::Corrupt(_)) => {}
                Some(other) => trace!("stray handshake {:?}", other),
                None => return Ok(None),
            }
        }
    }

    /// Number of unsolicited records waiting.
    pub fn pending_unsolicited(&self) -> usize {
        self.link.lock().unsolicited.len()
    }

    /// Link-level failures since the coordinator last answered.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Whether enough exchanges failed in a row to warrant a reconnect.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures() >= self.failure_threshold
    }

    /// Snapshot of the link counters.
    pub fn stats(&self) -> LinkStats {
        self.link.lock().stats
    }
}
