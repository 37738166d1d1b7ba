//! Simulated coordinator for engine integration tests.
//!
//! The gateway answers enumeration requests from a table of simulated units
//! and plays the unit side of the built-in classes it needs: binary switch,
//! association, configuration and wake-up.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use meshgate_classes::ClassRegistry;
use meshgate_engine::{Engine, EngineConfig, MemoryStore};
use meshgate_protocol::*;
use parking_lot::Mutex;

pub const CONTROLLER: u8 = 1;

/// One simulated unit.
#[derive(Debug, Clone)]
pub struct SimUnit {
    pub id: u8,
    pub listening: bool,
    pub generic: u8,
    pub specific: u8,
    pub classes: Vec<u8>,
    pub secure_classes: Vec<u8>,
    /// Acknowledged by the coordinator but never answered by the unit.
    pub silent: bool,
    /// Number of upcoming `SEND_DATA` records to reject with `NAK`.
    pub nak_sends: usize,
    pub switch: bool,
    pub groups: BTreeMap<u8, Vec<u8>>,
    pub params: BTreeMap<u8, Vec<u8>>,
    pub wakeup: (u32, u8),
    pub no_more_info: usize,
}

impl SimUnit {
    pub fn new(id: u8, classes: &[u8]) -> Self {
        SimUnit {
            id,
            listening: true,
            generic: 0x10,
            specific: 0x01,
            classes: classes.to_vec(),
            secure_classes: Vec::new(),
            silent: false,
            nak_sends: 0,
            switch: false,
            groups: BTreeMap::new(),
            params: BTreeMap::new(),
            wakeup: (3600, CONTROLLER),
            no_more_info: 0,
        }
    }

    pub fn sleeping(mut self) -> Self {
        self.listening = false;
        self
    }

    fn protocol_info(&self) -> ProtocolInfo {
        ProtocolInfo {
            listening: self.listening,
            basic: 0x04,
            generic: self.generic,
            specific: self.specific,
        }
    }

    fn node_info(&self) -> NodeInfo {
        NodeInfo {
            basic: 0x04,
            generic: self.generic,
            specific: self.specific,
            classes: self.classes.clone(),
            secure_classes: self.secure_classes.clone(),
        }
    }

    /// Play one class command; returns the report payload, if any.
    fn handle(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let (&class, rest) = data.split_first()?;
        let (&command, args) = rest.split_first()?;
        match (class, command) {
            (0x25, 0x01) => {
                self.switch = args.first().is_some_and(|b| *b != 0);
                None
            }
            (0x25, 0x02) => Some(vec![0x25, 0x03, if self.switch { 0xFF } else { 0x00 }]),
            (0x85, 0x01) => {
                let group = self.groups.entry(args[0]).or_default();
                for target in &args[1..] {
                    if !group.contains(target) {
                        group.push(*target);
                    }
                }
                None
            }
            (0x85, 0x04) => {
                if let Some(group) = self.groups.get_mut(&args[0]) {
                    if args.len() == 1 {
                        group.clear();
                    } else {
                        group.retain(|t| !args[1..].contains(t));
                    }
                }
                None
            }
            (0x85, 0x02) => {
                let mut report = vec![0x85, 0x03, args[0], 5, 0];
                report.extend(self.groups.get(&args[0]).cloned().unwrap_or_default());
                Some(report)
            }
            (0x70, 0x04) => {
                let width = args[1] as usize;
                self.params.insert(args[0], args[2..2 + width].to_vec());
                None
            }
            (0x70, 0x05) => {
                let value = self.params.get(&args[0]).cloned().unwrap_or_else(|| vec![0]);
                let mut report = vec![0x70, 0x06, args[0], value.len() as u8];
                report.extend(value);
                Some(report)
            }
            (0x84, 0x04) => {
                let seconds = u32::from_be_bytes([0, args[0], args[1], args[2]]);
                self.wakeup = (seconds, args[3]);
                None
            }
            (0x84, 0x05) => {
                let s = self.wakeup.0.to_be_bytes();
                Some(vec![0x84, 0x06, s[1], s[2], s[3], self.wakeup.1])
            }
            (0x84, 0x08) => {
                self.no_more_info += 1;
                None
            }
            _ => None,
        }
    }
}

/// Shared state of the simulated network.
#[derive(Debug, Default)]
pub struct SimNetwork {
    pub units: BTreeMap<u8, SimUnit>,
    /// Records the host sent, in order.
    pub received: Vec<Frame>,
    /// Refuse to open the transport.
    pub refuse_open: bool,
    /// Answer nothing at all, not even the handshake.
    pub unplugged: bool,
}

impl SimNetwork {
    fn respond(&mut self, frame: &Frame) -> Vec<u8> {
        if self.unplugged {
            return Vec::new();
        }
        let mut out = vec![ACK];
        let address = frame.address;
        match frame.function {
            FunctionId::GetVersion => {
                let version = VersionInfo {
                    library: 1,
                    major: 6,
                    minor: 2,
                    controller_id: CONTROLLER,
                };
                out.extend(record(0, FunctionId::GetVersion, version.to_data()));
            }
            FunctionId::GetInitData => {
                let mut units = vec![CONTROLLER];
                units.extend(self.units.keys().copied());
                let init = InitData {
                    api_version: 5,
                    capabilities: 0,
                    units,
                };
                out.extend(record(0, FunctionId::GetInitData, init.to_data()));
            }
            FunctionId::GetNodeProtocolInfo => {
                let info = self.units.get(&address).map_or(
                    ProtocolInfo {
                        listening: false,
                        basic: 0,
                        generic: 0,
                        specific: 0,
                    },
                    SimUnit::protocol_info,
                );
                out.extend(record(address, FunctionId::GetNodeProtocolInfo, info.to_data()));
            }
            FunctionId::RequestNodeInfo => {
                if let Some(unit) = self.units.get(&address).filter(|u| !u.silent) {
                    out.extend(record(address, FunctionId::ApplicationUpdate, unit.node_info().to_data()));
                }
            }
            FunctionId::SendData => {
                let Some(unit) = self.units.get_mut(&address) else {
                    return out;
                };
                if unit.nak_sends > 0 {
                    unit.nak_sends -= 1;
                    return vec![NAK];
                }
                if unit.silent {
                    return out;
                }
                if let Some(report) = unit.handle(&frame.data) {
                    out.extend(record(address, FunctionId::ApplicationCommand, report));
                }
            }
            FunctionId::ApplicationCommand | FunctionId::ApplicationUpdate => {}
        }
        out
    }
}

pub fn record(address: u8, function: FunctionId, data: Vec<u8>) -> Vec<u8> {
    Frame::new(address, function, data)
        .encode()
        .expect("test record encodes")
        .to_vec()
}

/// Transport end held by the engine.
pub struct SimTransport {
    open: bool,
    net: Arc<Mutex<SimNetwork>>,
    outbound: Arc<Mutex<VecDeque<u8>>>,
}

/// Test-side handle on the simulated network.
#[derive(Clone)]
pub struct SimHandle {
    net: Arc<Mutex<SimNetwork>>,
    outbound: Arc<Mutex<VecDeque<u8>>>,
}

impl SimHandle {
    pub fn with<R>(&self, f: impl FnOnce(&mut SimNetwork) -> R) -> R {
        f(&mut self.net.lock())
    }

    pub fn unit<R>(&self, id: u8, f: impl FnOnce(&mut SimUnit) -> R) -> R {
        let mut net = self.net.lock();
        f(net.units.get_mut(&id).expect("simulated unit exists"))
    }

    /// Queue an unsolicited report from `unit`.
    pub fn report(&self, unit: u8, payload: &[u8]) {
        self.outbound
            .lock()
            .extend(record(unit, FunctionId::ApplicationCommand, payload.to_vec()));
    }

    /// Class payloads sent to `unit`.
    pub fn sent_to(&self, unit: u8) -> Vec<Vec<u8>> {
        self.net
            .lock()
            .received
            .iter()
            .filter(|f| f.address == unit && f.function == FunctionId::SendData)
            .map(|f| f.data.clone())
            .collect()
    }

    pub fn clear_received(&self) {
        self.net.lock().received.clear();
    }
}

pub fn network(units: Vec<SimUnit>) -> (SimTransport, SimHandle) {
    let net = SimNetwork {
        units: units.into_iter().map(|u| (u.id, u)).collect(),
        ..SimNetwork::default()
    };
    let net = Arc::new(Mutex::new(net));
    let outbound = Arc::new(Mutex::new(VecDeque::new()));
    let transport = SimTransport {
        open: false,
        net: net.clone(),
        outbound: outbound.clone(),
    };
    (transport, SimHandle { net, outbound })
}

impl Transport for SimTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        if self.net.lock().refuse_open {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "coordinator unreachable",
            )));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn write(&mut self, bytes: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        // Single bytes are the host's handshake answers.
        if bytes.len() == RECORD_LEN {
            let frame = decode(bytes).expect("host sent a corrupt record");
            let mut net = self.net.lock();
            let reply = net.respond(&frame);
            net.received.push(frame);
            self.outbound.lock().extend(reply);
        }
        Ok(bytes.len())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let mut outbound = self.outbound.lock();
        if outbound.is_empty() {
            drop(outbound);
            thread::sleep(timeout.min(Duration::from_millis(1)));
            return Ok(0);
        }
        let n = buf.len().min(outbound.len());
        for slot in buf.iter_mut().take(n) {
            *slot = outbound.pop_front().unwrap_or_default();
        }
        Ok(n)
    }

    fn purge_inbound(&mut self) -> Result<(), TransportError> {
        self.outbound.lock().clear();
        Ok(())
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        transaction_timeout_ms: 60,
        inbound_timeout_ms: 2,
        poll_interval_ms: 0,
        reconnect_interval_ms: 0,
        reconnect_jitter_ms: 0,
        ..EngineConfig::default()
    }
}

pub fn engine(units: Vec<SimUnit>) -> (Engine<SimTransport>, SimHandle, MemoryStore) {
    let (transport, handle) = network(units);
    let store = MemoryStore::new();
    let engine = Engine::new(
        transport,
        ClassRegistry::with_builtin(),
        store.clone(),
        test_config(),
    );
    (engine, handle, store)
}
