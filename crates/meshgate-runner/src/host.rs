//! Poll thread.
//!
//! The engine is driven from one dedicated thread that runs a poll cycle per
//! period. Host requests (field writes, driver commands) arrive over a
//! channel and are served between cycles.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender};
use meshgate_classes::FieldValue;
use meshgate_engine::{Engine, EngineError, FieldId};
use meshgate_protocol::Transport;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

/// Request from the host to the poll thread.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    /// Write a field.
    Write {
        /// Target field.
        field: FieldId,
        /// New value.
        value: FieldValue,
    },
    /// Run a driver command line.
    Command(String),
    /// Stop after the current cycle.
    Shutdown,
}

/// Totals reported when the poll thread exits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostSummary {
    /// Poll cycles run.
    pub cycles: u64,
    /// Cycles that returned an error.
    pub cycle_errors: u64,
    /// Host requests served.
    pub requests: u64,
    /// Host requests that failed.
    pub request_errors: u64,
}

/// Handle to a running poll thread.
pub struct HostHandle {
    tx: Sender<HostRequest>,
    thread: JoinHandle<HostSummary>,
}

impl HostHandle {
    /// Queue a request.
    pub fn send(&self, request: HostRequest) -> Result<(), SendError<HostRequest>> {
        self.tx.send(request)
    }

    /// Another sender for the same thread.
    pub fn sender(&self) -> Sender<HostRequest> {
        self.tx.clone()
    }

    /// Whether the thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the thread to exit.
    pub fn join(self) -> thread::Result<HostSummary> {
        self.thread.join()
    }
}

/// Start the poll thread. It runs until [`HostRequest::Shutdown`], until every
/// sender is dropped, or after `max_cycles` cycles.
pub fn spawn_host_thread<T: Transport + 'static>(
    engine: Arc<Engine<T>>,
    period: Duration,
    max_cycles: Option<u64>,
) -> io::Result<HostHandle> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let thread = thread::Builder::new()
        .name("meshgate-poll".into())
        .spawn(move || host_thread_main(&engine, &rx, period, max_cycles))?;
    Ok(HostHandle { tx, thread })
}

fn host_thread_main<T: Transport>(
    engine: &Engine<T>,
    rx: &Receiver<HostRequest>,
    period: Duration,
    max_cycles: Option<u64>,
) -> HostSummary {
    let mut summary = HostSummary::default();
    loop {
        let started = Instant::now();
        match engine.poll_cycle() {
            Ok(report) => trace!("cycle {}: {:?}", summary.cycles, report),
            Err(err) => {
                summary.cycle_errors += 1;
                warn!("poll cycle failed: {}", err);
            }
        }
        summary.cycles += 1;
        if max_cycles.is_some_and(|max| summary.cycles >= max) {
            debug!("cycle limit reached");
            break;
        }

        let deadline = started + period;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match rx.recv_timeout(remaining) {
                Ok(HostRequest::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    info!("poll thread stopping after {} cycles", summary.cycles);
                    return summary;
                }
                Ok(request) => {
                    summary.requests += 1;
                    if let Err(err) = serve(engine, request) {
                        summary.request_errors += 1;
                        warn!("request failed: {}", err);
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
            }
        }
    }
    summary
}

fn serve<T: Transport>(engine: &Engine<T>, request: HostRequest) -> Result<(), EngineError> {
    match request {
        HostRequest::Write { field, value } => {
            let delivery = engine.write_field(field, value)?;
            info!("field {}: {:?}", field, delivery);
        }
        HostRequest::Command(line) => {
            let output = engine.execute_command(&line)?;
            info!("{}: {:?}", line.trim(), output);
        }
        HostRequest::Shutdown => {}
    }
    Ok(())
}
