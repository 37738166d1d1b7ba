//! Connection lifecycle, dispatch and the host surface.
//!
//! [`EngineContext`] owns everything the components share: the transaction
//! manager, the class registry, the snapshot store, settings and the network
//! state. The network state sits behind one mutex. Locks are always taken in
//! the order state, then link. Poll and write paths release the state lock
//! before transacting; enumeration and reconciliation hold it throughout so
//! readers never observe a half-built directory.

use std::time::Instant;

use meshgate_classes::{
    AssociationGroup, ClassCommand, ClassError, ClassEvent, ClassId, ClassRegistry, CommandClass,
    ConfigParameter, FieldValue, UnitId, Update, Verb, CLASS_CONFIGURATION, CLASS_WAKE_UP,
};
use meshgate_metrics::{metric_defs, UnitLabels};
use meshgate_protocol::{
    CommError, Expect, Frame, FunctionId, InitData, LinkStats, NodeInfo, ProtocolInfo,
    TransactionManager, Transport, VersionInfo, FUNC_GET_INIT_DATA, FUNC_GET_NODE_PROTOCOL_INFO,
    FUNC_GET_VERSION, FUNC_REQUEST_NODE_INFO, FUNC_SEND_DATA, GATEWAY_ADDRESS,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, trace, warn};

use crate::association::AssociationManager;
use crate::command::DriverCommand;
use crate::config::EngineConfig;
use crate::directory::{Directory, Unit, UnitState};
use crate::error::{EngineError, EngineResult};
use crate::fields::{FieldBinding, FieldId, FieldTable, COMMAND_FIELD_ID};
use crate::poll::PollScheduler;
use crate::reconcile::{reconcile, GatewayUnit, ReconcileReport};
use crate::store::{Snapshot, SnapshotStore};
use crate::wakeup::{QueuedCommand, WakeUpQueue};

// ============================================================================
// Types
// ============================================================================

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection wanted.
    Disconnected,
    /// Enumerating, or waiting to retry.
    Connecting,
    /// Enumerated and serving.
    Running,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Running => write!(f, "running"),
        }
    }
}

/// How a command reached its unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Transacted and acknowledged.
    Sent,
    /// Held for a sleeping unit.
    Queued {
        /// Entries now waiting for the unit.
        depth: usize,
        /// The oldest entry was dropped to make room.
        dropped: bool,
    },
}

/// Result of a driver command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    /// A change was sent or queued.
    Delivered(Delivery),
    /// Targets of a queried association group.
    Targets(Vec<UnitId>),
    /// A queried configuration parameter.
    Parameter(Option<ConfigParameter>),
    /// Frame tracing state.
    Trace(bool),
    /// Unit state after a re-interview.
    Refreshed(UnitState),
}

/// What one poll cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Inbound records handled.
    pub inbound: usize,
    /// Inbound records that could not be routed.
    pub dropped: usize,
    /// Unit polled this cycle.
    pub polled: Option<UnitId>,
    /// Whether the cycle (re)established the connection.
    pub reconnected: bool,
}

/// Where an inbound record went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routed {
    Applied,
    Woke(UnitId),
    Dropped(&'static str),
}

/// Mutable network model, guarded by one lock.
#[derive(Debug)]
pub(crate) struct NetworkState {
    pub(crate) directory: Directory,
    pub(crate) fields: FieldTable,
    pub(crate) wakeup: WakeUpQueue,
    pub(crate) poll: PollScheduler,
    /// Last enumeration result.
    pub(crate) gateway: Vec<GatewayUnit>,
    /// Last snapshot written or loaded.
    pub(crate) persisted: Option<Snapshot>,
    /// The stored snapshot could not be decoded or set aside; never overwrite it.
    pub(crate) store_locked: bool,
    pub(crate) serial: u32,
    pub(crate) controller_id: u8,
    pub(crate) link_state: LinkState,
    pub(crate) next_connect: Option<Instant>,
    rng: StdRng,
}

// ============================================================================
// Engine Context
// ============================================================================

/// Everything the engine components share.
pub struct EngineContext<T: Transport> {
    link: TransactionManager<T>,
    registry: ClassRegistry,
    store: Box<dyn SnapshotStore>,
    config: EngineConfig,
    state: Mutex<NetworkState>,
}

impl<T: Transport> EngineContext<T> {
    /// Transaction manager.
    pub fn link(&self) -> &TransactionManager<T> {
        &self.link
    }

    /// Class registry.
    pub fn registry(&self) -> &ClassRegistry {
        &self.registry
    }

    /// Engine settings.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `f` on a unit under the state lock.
    pub fn with_unit<R>(&self, id: UnitId, f: impl FnOnce(&Unit) -> R) -> EngineResult<R> {
        let state = self.state.lock();
        let unit = state.directory.get(id).ok_or(EngineError::UnknownUnit(id))?;
        Ok(f(unit))
    }

    fn class_name(&self, class: ClassId) -> &'static str {
        self.registry.get(class).map_or("unknown class", |c| c.name())
    }

    /// Send `verb` to one class instance of a `Ready` unit.
    ///
    /// Sleeping units get the command queued instead when `allow_queue` is
    /// set. A successful exchange applies the verb's effect to the directory
    /// and the reply (if any) to the fields.
    pub fn dispatch(
        &self,
        unit: UnitId,
        class: ClassId,
        instance: u8,
        verb: Verb,
        allow_queue: bool,
    ) -> EngineResult<Delivery> {
        let command = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.link_state != LinkState::Running {
                return Err(EngineError::NotConnected);
            }
            let target = state.directory.get(unit).ok_or(EngineError::UnknownUnit(unit))?;
            let binding = target.binding(class, instance).ok_or(EngineError::Unsupported {
                unit,
                class: self.class_name(class),
            })?;
            if target.state != UnitState::Ready {
                return Err(EngineError::UnitNotReady {
                    unit,
                    state: target.state,
                });
            }
            let command = self.registry.encode(unit, binding, &verb)?;
            let sleeping = target.is_sleeping(&self.registry);

            if allow_queue && sleeping {
                let dropped = state
                    .wakeup
                    .push(QueuedCommand::new(unit, class, instance, verb, command));
                let depth = state.wakeup.len(unit);
                return Ok(Delivery::Queued {
                    depth,
                    dropped: dropped.is_some(),
                });
            }
            command
        };

        let result = self.transact(unit, &command);
        let routed = {
            let mut state = self.state.lock();
            self.settle(&mut state, unit, class, instance, &verb, result)?
        };
        if let Routed::Woke(id) = routed {
            self.drain_wakeup(id);
        }
        Ok(Delivery::Sent)
    }

    /// One `SEND_DATA` exchange carrying a class command.
    fn transact(&self, unit: UnitId, command: &ClassCommand) -> EngineResult<Option<Frame>> {
        let mut payload = Vec::with_capacity(command.payload.len() + 1);
        payload.push(FUNC_SEND_DATA);
        payload.extend_from_slice(&command.payload);
        let expect = self.registry.expect_for(command);
        let class = command
            .header()
            .map_or("unknown class", |(class, _)| self.class_name(class));

        let started = Instant::now();
        let result = self
            .link
            .send_and_await(unit, &payload, expect, self.config.transaction_timeout());

        let labels = UnitLabels::new(unit).with_class(class);
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) if err.is_timeout() => "timeout",
            Err(_) => "error",
        };
        metrics::counter!(
            metric_defs::TRANSACTIONS.name,
            &labels.with(&[("result", outcome.to_string())])
        )
        .increment(1);
        match &result {
            Ok(_) => {
                metrics::histogram!(metric_defs::TRANSACTION_LATENCY.name, &labels.to_labels())
                    .record(started.elapsed().as_secs_f64() * 1000.0);
            }
            Err(err) if err.is_timeout() => {
                metrics::counter!(
                    metric_defs::TIMEOUTS.name,
                    &UnitLabels::new(unit).to_labels()
                )
                .increment(1);
            }
            Err(_) => {}
        }

        Ok(result?.into_frame())
    }

    /// Gateway-local request answered by a record with `reply`.
    fn request(&self, address: u8, function: u8, reply: FunctionId) -> EngineResult<Frame> {
        let result = self.link.send_and_await(
            address,
            &[function],
            Expect::Function(reply),
            self.config.transaction_timeout(),
        )?;
        result.into_frame().ok_or_else(|| {
            EngineError::Comm(CommError::Internal(format!("{} answered without a record", reply)))
        })
    }

    /// Account for the outcome of an exchange with `unit`.
    fn settle(
        &self,
        state: &mut NetworkState,
        unit: UnitId,
        class: ClassId,
        instance: u8,
        verb: &Verb,
        result: EngineResult<Option<Frame>>,
    ) -> EngineResult<Routed> {
        match result {
            Ok(reply) => {
                self.record_success(state, unit);
                self.apply_delivered(state, unit, class, instance, verb);
                match reply {
                    Some(frame) => self.apply_frame(state, &frame),
                    None => Ok(Routed::Applied),
                }
            }
            Err(err) => {
                if err.is_unit_failure() {
                    self.record_failure(state, unit, &err);
                }
                Err(err)
            }
        }
    }

    fn record_success(&self, state: &mut NetworkState, id: UnitId) {
        let Some(unit) = state.directory.get_mut(id) else {
            return;
        };
        unit.failures = 0;
        if unit.in_error {
            unit.in_error = false;
            info!("unit {}: responding again", id);
            let changed = state.fields.mark_unit_error(id, false);
            count_field_updates(id, changed.len());
        }
    }

    fn record_failure(&self, state: &mut NetworkState, id: UnitId, err: &EngineError) {
        let threshold = self.config.unit_failure_threshold;
        let Some(unit) = state.directory.get_mut(id) else {
            return;
        };
        unit.failures += 1;
        debug!("unit {}: failure {} of {}: {}", id, unit.failures, threshold, err);
        if unit.failures >= threshold && !unit.in_error {
            unit.in_error = true;
            warn!(
                "unit {}: {} consecutive failures, marking fields in error",
                id, unit.failures
            );
            let changed = state.fields.mark_unit_error(id, true);
            count_field_updates(id, changed.len());
            metrics::counter!(metric_defs::UNIT_ERRORS.name, &UnitLabels::new(id).to_labels())
                .increment(1);
        }
    }

    /// Record what a delivered verb changed on the unit.
    fn apply_delivered(
        &self,
        state: &mut NetworkState,
        id: UnitId,
        class: ClassId,
        instance: u8,
        verb: &Verb,
    ) {
        if let Verb::Set { sub, value } = verb {
            if let Some(handler) = self.registry.get(class).cloned() {
                self.apply_update(state, id, handler.as_ref(), instance, Update::value(*sub, value.clone()));
            }
            return;
        }

        let Some(unit) = state.directory.get_mut(id) else {
            return;
        };
        match verb {
            Verb::AssociationAdd { group, targets } => {
                let entry = unit
                    .associations
                    .entry(*group)
                    .or_insert_with(|| AssociationGroup::new(*group));
                for target in targets {
                    entry.add(*target);
                }
            }
            Verb::AssociationRemove { group, targets } => {
                if let Some(entry) = unit.associations.get_mut(group) {
                    if targets.is_empty() {
                        entry.targets.clear();
                    } else {
                        for target in targets {
                            entry.remove(*target);
                        }
                    }
                }
            }
            Verb::ConfigSet(param) => {
                unit.config.insert(param.number, param.clone());
            }
            Verb::WakeUpIntervalSet { seconds, .. } => {
                unit.wakeup_interval = Some(*seconds);
            }
            _ => {}
        }
    }

    /// Decode a report record and apply it.
    fn apply_frame(&self, state: &mut NetworkState, frame: &Frame) -> EngineResult<Routed> {
        let id = frame.address;
        let (handler, instance, update) = {
            let Some(unit) = state.directory.get(id) else {
                return Ok(Routed::Dropped("unknown unit"));
            };
            if unit.state != UnitState::Ready {
                return Ok(Routed::Dropped("unit not ready"));
            }
            let opened = self.registry.open(id, &frame.data)?;
            let Some(&class) = opened.bytes.first() else {
                return Ok(Routed::Dropped("empty payload"));
            };
            let Some(handler) = self.registry.get(class).cloned() else {
                return Ok(Routed::Dropped("unknown class"));
            };
            let Some(binding) = unit.first_binding(class) else {
                return Ok(Routed::Dropped("class not bound"));
            };
            let update = self.registry.decode(id, binding, &opened)?;
            (handler, binding.instance, update)
        };
        trace!("unit {}: {} report {:?}", id, handler.name(), update);
        Ok(self.apply_update(state, id, handler.as_ref(), instance, update))
    }

    /// Push decoded values into the binding cache and fields; apply events.
    fn apply_update(
        &self,
        state: &mut NetworkState,
        id: UnitId,
        class: &dyn CommandClass,
        instance: u8,
        update: Update,
    ) -> Routed {
        let changed = state.fields.apply_update(id, class, instance, &update);
        count_field_updates(id, changed.len());

        let Some(unit) = state.directory.get_mut(id) else {
            return Routed::Applied;
        };
        if let Some(binding) = unit.binding_mut(class.id(), instance) {
            for (sub, value) in update.values {
                binding.cache.insert(sub, value);
            }
        }
        match update.event {
            Some(ClassEvent::Association(group)) => {
                unit.associations.insert(group.group, group);
            }
            Some(ClassEvent::ConfigParameter(param)) => {
                unit.config.insert(param.number, param);
            }
            Some(ClassEvent::WakeUpInterval { seconds, .. }) => {
                unit.wakeup_interval = Some(seconds);
            }
            Some(ClassEvent::WakeUpNotification) => return Routed::Woke(id),
            None => {}
        }
        Routed::Applied
    }

    /// Route one unsolicited record.
    fn route_inbound(&self, frame: &Frame) -> EngineResult<Routed> {
        match frame.function {
            FunctionId::ApplicationCommand => {
                let mut state = self.state.lock();
                let routed = self.apply_frame(&mut state, frame)?;
                if matches!(routed, Routed::Applied | Routed::Woke(_)) {
                    self.record_success(&mut state, frame.address);
                }
                Ok(routed)
            }
            FunctionId::ApplicationUpdate => {
                trace!("node information from unit {}", frame.address);
                Ok(Routed::Applied)
            }
            _ => Ok(Routed::Dropped("unexpected function")),
        }
    }

    /// Deliver a woken unit's queue, head first, stopping at the first failure.
    ///
    /// Returns the number of delivered commands.
    pub fn drain_wakeup(&self, id: UnitId) -> usize {
        info!(
            "unit {}: awake, {} command(s) queued",
            id,
            self.state.lock().wakeup.len(id)
        );
        let mut delivered = 0;
        let drained = loop {
            let Some(entry) = self.state.lock().wakeup.front(id).cloned() else {
                break true;
            };
            let result = self.transact(id, &entry.command);

            let mut guard = self.state.lock();
            let state = &mut *guard;
            match self.settle(state, id, entry.class, entry.instance, &entry.verb, result) {
                Ok(_) => {
                    state.wakeup.pop_front(id);
                    delivered += 1;
                }
                Err(err) => {
                    warn!("unit {}: queued {} not delivered: {}", id, entry.verb, err);
                    state.wakeup.record_failure(id);
                    break false;
                }
            }
        };

        if drained {
            self.send_no_more_information(id);
        }
        if delivered > 0 {
            let mut state = self.state.lock();
            if let Err(err) = self.persist_if_changed(&mut state) {
                warn!("could not persist configuration: {}", err);
            }
        }
        delivered
    }

    fn send_no_more_information(&self, id: UnitId) {
        let command = {
            let state = self.state.lock();
            let Some(binding) = state
                .directory
                .get(id)
                .and_then(|u| u.first_binding(CLASS_WAKE_UP))
            else {
                return;
            };
            match self.registry.encode(id, binding, &Verb::WakeUpNoMoreInformation) {
                Ok(command) => command,
                Err(err) => {
                    warn!("unit {}: cannot encode no-more-information: {}", id, err);
                    return;
                }
            }
        };
        if let Err(err) = self.transact(id, &command) {
            debug!("unit {}: no-more-information not delivered: {}", id, err);
        }
    }

    // ------------------------------------------------------------------------
    // Enumeration and interview
    // ------------------------------------------------------------------------

    /// Query the coordinator for its id and unit list.
    fn enumerate(&self) -> EngineResult<(u8, Vec<GatewayUnit>)> {
        let version = self
            .request(GATEWAY_ADDRESS, FUNC_GET_VERSION, FunctionId::GetVersion)
            .and_then(|frame| Ok(VersionInfo::parse(&frame)?));
        let controller = match version {
            Ok(version) if version.controller_id != 0 => {
                info!("coordinator {}", version);
                version.controller_id
            }
            Ok(version) => {
                warn!("coordinator {} reports no id", version);
                self.config.default_controller_id
            }
            Err(err) => {
                warn!(
                    "version query failed ({}), assuming controller {}",
                    err, self.config.default_controller_id
                );
                self.config.default_controller_id
            }
        };

        let frame = self.request(GATEWAY_ADDRESS, FUNC_GET_INIT_DATA, FunctionId::GetInitData)?;
        let init = InitData::parse(&frame)?;
        debug!("coordinator lists units {:?}", init.units);

        let mut units = Vec::new();
        for id in init.units.iter().copied().filter(|id| *id != controller) {
            let frame = self.request(id, FUNC_GET_NODE_PROTOCOL_INFO, FunctionId::GetNodeProtocolInfo)?;
            let info = ProtocolInfo::parse(&frame)?;
            if info.is_present() {
                units.push(GatewayUnit::from_info(id, &info));
            } else {
                debug!("unit {} listed but unknown to the coordinator", id);
            }
        }
        Ok((controller, units))
    }

    /// Ask a `New` unit for its classes. Ends in `Ready` or `Failed`.
    fn interview(&self, unit: &mut Unit) -> bool {
        if !unit.transition(UnitState::Configuring) {
            return false;
        }
        let info = self
            .request(unit.id, FUNC_REQUEST_NODE_INFO, FunctionId::ApplicationUpdate)
            .and_then(|frame| Ok(NodeInfo::parse(&frame)?));
        match info {
            Ok(info) => {
                unit.bindings.clear();
                for class in &info.classes {
                    self.bind(unit, *class, false);
                }
                for class in &info.secure_classes {
                    self.bind(unit, *class, true);
                }
                unit.transition(UnitState::Ready);
                info!(
                    "unit {} ({}) interviewed: {} class(es)",
                    unit.id,
                    unit.name,
                    unit.bindings.len()
                );
                true
            }
            Err(err) => {
                warn!("unit {}: interview failed: {}", unit.id, err);
                unit.transition(UnitState::Failed);
                false
            }
        }
    }

    fn bind(&self, unit: &mut Unit, class: ClassId, secure: bool) {
        if !self.registry.contains(class) {
            trace!("unit {}: ignoring unsupported class 0x{:02X}", unit.id, class);
            return;
        }
        match unit.binding_mut(class, 1) {
            Some(existing) => existing.secure |= secure,
            None => unit
                .bindings
                .push(meshgate_classes::CommandClassBinding::new(class, secure)),
        }
    }

    fn interview_new(&self, directory: &mut Directory) {
        for unit in directory.iter_mut().filter(|u| u.state == UnitState::New) {
            self.interview(unit);
        }
    }

    // ------------------------------------------------------------------------
    // Reconciliation and persistence
    // ------------------------------------------------------------------------

    /// Enumerate, reconcile and interview. The caller holds the state lock.
    fn establish(&self, state: &mut NetworkState) -> EngineResult<ReconcileReport> {
        self.link.close();
        self.link.open()?;
        let (controller, gateway) = self.enumerate()?;

        let snapshot = match self.store.load(self.config.legacy_secure_policy) {
            Ok(snapshot) => {
                state.store_locked = false;
                snapshot
            }
            Err(err) => {
                warn!("ignoring persisted configuration: {}", err);
                self.set_aside_unreadable(state);
                None
            }
        };
        let persisted = match &snapshot {
            Some(snapshot) => {
                info!(
                    "loaded configuration serial {} with {} unit(s)",
                    snapshot.serial,
                    snapshot.directory.len()
                );
                state.serial = state.serial.max(snapshot.serial);
                snapshot.directory.clone()
            }
            None => Directory::new(),
        };

        let (mut directory, report) = reconcile(&persisted, &gateway);
        self.interview_new(&mut directory);
        carry_caches(&state.directory, &mut directory);

        state.persisted = snapshot;
        state.controller_id = controller;
        state.gateway = gateway;
        self.install(state, directory, &report);
        if let Err(err) = self.persist_if_changed(state) {
            warn!("could not persist configuration: {}", err);
        }
        state.link_state = LinkState::Running;
        state.next_connect = None;
        info!(
            "connected: {} unit(s), {} field(s), serial {}",
            state.directory.len(),
            state.fields.len(),
            state.serial
        );
        Ok(report)
    }

    /// Make `directory` live and rebuild everything derived from it.
    fn install(&self, state: &mut NetworkState, directory: Directory, report: &ReconcileReport) {
        state.directory = directory;
        state
            .wakeup
            .retain_units(|id| state.directory.get(id).is_some());
        state.fields.rebuild(&state.directory, &self.registry);
        state.poll.reset();

        let counts = state.directory.state_counts();
        for name in ["new", "configuring", "ready", "failed", "dead"] {
            let count = counts.get(name).copied().unwrap_or(0);
            metrics::gauge!(metric_defs::UNITS.name, &[("state", name.to_string())]).set(count as f64);
        }
        metrics::counter!(
            metric_defs::RECONCILIATIONS.name,
            &[("changed", report.is_structural().to_string())]
        )
        .increment(1);
        debug!("reconciled: {:?}", report);
    }

    /// Keep the serial of an undecodable snapshot and back its bytes up before
    /// anything replaces them. If the backup fails the store is left alone.
    fn set_aside_unreadable(&self, state: &mut NetworkState) {
        let bytes = match self.store.load_bytes() {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return,
            Err(err) => {
                warn!("stored configuration unreadable ({}), not overwriting it", err);
                state.store_locked = true;
                return;
            }
        };
        if let Some(serial) = Snapshot::peek_serial(&bytes) {
            state.serial = state.serial.max(serial);
        }
        match self.store.backup_bytes(&bytes) {
            Ok(()) => info!("kept undecodable configuration (serial {}) as a backup", state.serial),
            Err(err) => {
                warn!("could not back up stored configuration ({}), not overwriting it", err);
                state.store_locked = true;
            }
        }
    }

    /// Save the directory if its persisted content changed, bumping the serial by one.
    fn persist_if_changed(&self, state: &mut NetworkState) -> EngineResult<bool> {
        if state.store_locked {
            debug!("configuration not saved: stored snapshot is protected");
            return Ok(false);
        }
        let unchanged = state.persisted.as_ref().is_some_and(|snapshot| {
            snapshot.controller_id == state.controller_id
                && snapshot.directory.persisted_eq(&state.directory)
        });
        if unchanged {
            return Ok(false);
        }
        let snapshot = Snapshot::new(
            state.serial.wrapping_add(1),
            state.controller_id,
            state.directory.clone(),
        );
        self.store.save(&snapshot)?;
        state.serial = snapshot.serial;
        info!("configuration saved, serial {}", state.serial);
        state.persisted = Some(snapshot);
        Ok(true)
    }

    /// Drop the link and retry after the reconnect delay.
    fn schedule_retry(&self, state: &mut NetworkState, reason: &dyn std::fmt::Display) {
        self.link.close();
        let delay = self.config.reconnect_delay(&mut state.rng);
        warn!("connection lost ({}), retrying in {:?}", reason, delay);
        state.link_state = LinkState::Connecting;
        state.next_connect = Some(Instant::now() + delay);
        for id in state.directory.ids() {
            state.fields.invalidate_unit(id);
        }
    }
}

/// Keep last known values for bindings that survive a rebuild.
fn carry_caches(old: &Directory, new: &mut Directory) {
    for unit in new.iter_mut() {
        if let Some(previous) = old.get(unit.id) {
            carry_unit_cache(previous, unit);
        }
    }
}

fn carry_unit_cache(old: &Unit, new: &mut Unit) {
    if (old.generic, old.specific) != (new.generic, new.specific) {
        return;
    }
    for binding in new.bindings.iter_mut() {
        if let Some(previous) = old.bindings.iter().find(|b| b.same_instance(binding)) {
            binding.cache = previous.cache.clone();
        }
    }
}

fn count_field_updates(unit: UnitId, changed: usize) {
    if changed > 0 {
        metrics::counter!(metric_defs::FIELD_UPDATES.name, &UnitLabels::new(unit).to_labels())
            .increment(changed as u64);
    }
}

// ============================================================================
// Engine
// ============================================================================

/// The protocol engine.
///
/// `Engine` is `Send + Sync`; share it through an `Arc` to run the poll cycle
/// on one thread and write fields from others.
pub struct Engine<T: Transport> {
    ctx: EngineContext<T>,
}

impl<T: Transport> Engine<T> {
    /// Create a disconnected engine.
    pub fn new(
        transport: T,
        registry: ClassRegistry,
        store: impl SnapshotStore + 'static,
        config: EngineConfig,
    ) -> Self {
        let state = NetworkState {
            directory: Directory::new(),
            fields: FieldTable::new(),
            wakeup: WakeUpQueue::new(config.wakeup_queue_cap, config.wakeup_max_retries),
            poll: PollScheduler::new(config.poll_interval()),
            gateway: Vec::new(),
            persisted: None,
            store_locked: false,
            serial: 0,
            controller_id: config.default_controller_id,
            link_state: LinkState::Disconnected,
            next_connect: None,
            rng: StdRng::from_entropy(),
        };
        let link = TransactionManager::new(transport).with_failure_threshold(config.link_failure_threshold);
        Engine {
            ctx: EngineContext {
                link,
                registry,
                store: Box::new(store),
                config,
                state: Mutex::new(state),
            },
        }
    }

    /// Shared context.
    pub fn context(&self) -> &EngineContext<T> {
        &self.ctx
    }

    /// Association operations.
    pub fn associations(&self) -> AssociationManager<'_, T> {
        AssociationManager::new(&self.ctx)
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Open the link, enumerate the network and reconcile it with the stored
    /// configuration. On failure the engine stays `Connecting` and
    /// [`Engine::poll_cycle`] retries after the reconnect delay.
    pub fn connect(&self) -> EngineResult<ReconcileReport> {
        let mut guard = self.ctx.state.lock();
        let state = &mut *guard;
        state.link_state = LinkState::Connecting;
        info!("connecting");
        match self.ctx.establish(state) {
            Ok(report) => Ok(report),
            Err(err) => {
                self.ctx.schedule_retry(state, &err);
                Err(err)
            }
        }
    }

    /// Close the link and stop retrying.
    pub fn disconnect(&self) {
        let mut guard = self.ctx.state.lock();
        let state = &mut *guard;
        self.ctx.link.close();
        state.link_state = LinkState::Disconnected;
        state.next_connect = None;
        for id in state.directory.ids() {
            state.fields.invalidate_unit(id);
        }
        info!("disconnected");
    }

    /// Current lifecycle state.
    pub fn link_state(&self) -> LinkState {
        self.ctx.state.lock().link_state
    }

    /// One host tick: reconnect if due, drain inbound records within the
    /// frame budget, then issue at most one poll.
    pub fn poll_cycle(&self) -> EngineResult<CycleReport> {
        let mut report = CycleReport::default();
        let (link_state, due) = {
            let state = self.ctx.state.lock();
            let due = state.next_connect.map_or(true, |at| Instant::now() >= at);
            (state.link_state, due)
        };
        match link_state {
            LinkState::Disconnected => return Err(EngineError::NotConnected),
            LinkState::Connecting if !due => return Ok(report),
            LinkState::Connecting => {
                metrics::counter!(metric_defs::RECONNECTS.name).increment(1);
                match self.connect() {
                    Ok(_) => report.reconnected = true,
                    Err(err) => {
                        debug!("reconnect failed: {}", err);
                        return Ok(report);
                    }
                }
            }
            LinkState::Running => {}
        }

        self.drain_inbound(&mut report);
        self.poll_one(&mut report)?;

        if self.ctx.link.is_degraded() {
            let mut state = self.ctx.state.lock();
            let failures = self.ctx.link.consecutive_failures();
            self.ctx
                .schedule_retry(&mut state, &format!("{} link failures in a row", failures));
        }
        Ok(report)
    }

    fn drain_inbound(&self, report: &mut CycleReport) {
        let mut woken = Vec::new();
        for _ in 0..self.ctx.config.inbound_frame_budget {
            let frame = match self.ctx.link.next_unsolicited(self.ctx.config.inbound_timeout()) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!("inbound read failed: {}", err);
                    break;
                }
            };
            report.inbound += 1;
            metrics::counter!(metric_defs::FRAMES_RX.name).increment(1);

            match self.ctx.route_inbound(&frame) {
                Ok(Routed::Applied) => {}
                Ok(Routed::Woke(id)) => woken.push(id),
                Ok(Routed::Dropped(reason)) => {
                    report.dropped += 1;
                    metrics::counter!(metric_defs::FRAMES_DROPPED.name).increment(1);
                    debug!(
                        "dropped record from unit {} [{}]: {}",
                        frame.address,
                        hex::encode(&frame.data),
                        reason
                    );
                }
                Err(err) => {
                    report.dropped += 1;
                    metrics::counter!(metric_defs::FRAMES_DROPPED.name).increment(1);
                    debug!("dropped record from unit {}: {}", frame.address, err);
                }
            }
        }
        for id in woken {
            self.ctx.drain_wakeup(id);
        }
    }

    fn poll_one(&self, report: &mut CycleReport) -> EngineResult<()> {
        let request = {
            let mut guard = self.ctx.state.lock();
            let state = &mut *guard;
            let now = Instant::now();
            let request = state.poll.next(&state.directory, &self.ctx.registry, now);
            if let Some(req) = &request {
                // Stamped up front so a silent unit does not hog the scheduler.
                if let Some(binding) = state
                    .directory
                    .get_mut(req.unit)
                    .and_then(|u| u.binding_mut(req.class, req.instance))
                {
                    binding.last_poll = Some(now);
                }
            }
            request
        };
        let Some(req) = request else {
            return Ok(());
        };

        report.polled = Some(req.unit);
        trace!("polling unit {} class 0x{:02X}", req.unit, req.class);
        match self
            .ctx
            .dispatch(req.unit, req.class, req.instance, req.verb, false)
        {
            Ok(_) => Ok(()),
            Err(EngineError::Comm(err)) if err.is_fatal() => Err(EngineError::Comm(err)),
            Err(err) => {
                debug!("poll of unit {} failed: {}", req.unit, err);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Host surface
    // ------------------------------------------------------------------------

    /// Write a field. Writes to `driver.command` run the command line.
    pub fn write_field(&self, id: FieldId, value: FieldValue) -> EngineResult<Delivery> {
        if id == COMMAND_FIELD_ID {
            let FieldValue::Text(line) = value else {
                return Err(ClassError::invalid("driver.command takes a text line").into());
            };
            return match self.execute_command(&line)? {
                CommandOutput::Delivered(delivery) => Ok(delivery),
                _ => Ok(Delivery::Sent),
            };
        }

        let target = self.ctx.state.lock().fields.resolve_write(id, &value)?;
        debug!("write field {} = {}", id, target.value);
        self.ctx.dispatch(
            target.unit,
            target.class,
            target.instance,
            Verb::Set {
                sub: target.sub,
                value: target.value,
            },
            true,
        )
    }

    /// Parse and run one driver command line.
    pub fn execute_command(&self, line: &str) -> EngineResult<CommandOutput> {
        let command = DriverCommand::parse(line)?;
        self.ctx.state.lock().fields.record_command(line.trim());
        info!("driver command: {}", command);

        let output = match &command {
            DriverCommand::AddAssociation { src, group, target } => {
                CommandOutput::Delivered(self.associations().add(*src, *group, &[*target])?)
            }
            DriverCommand::DeleteAssociation {
                src,
                group,
                target: Some(target),
            } => CommandOutput::Delivered(self.associations().remove(*src, *group, &[*target])?),
            DriverCommand::DeleteAssociation {
                src,
                group,
                target: None,
            } => CommandOutput::Delivered(self.associations().remove_all(*src, *group)?),
            DriverCommand::QueryAssociation { src, group } => {
                CommandOutput::Targets(self.associations().query(*src, *group)?)
            }
            DriverCommand::SetConfigParameter { unit, param } => {
                let verb = Verb::ConfigSet(param.clone());
                CommandOutput::Delivered(self.ctx.dispatch(*unit, CLASS_CONFIGURATION, 1, verb, true)?)
            }
            DriverCommand::GetConfigParameter { unit, param } => {
                let verb = Verb::ConfigGet { parameter: *param };
                self.ctx.dispatch(*unit, CLASS_CONFIGURATION, 1, verb, false)?;
                CommandOutput::Parameter(self.ctx.with_unit(*unit, |u| u.config.get(param).cloned())?)
            }
            DriverCommand::SetWakeupInterval { unit, seconds } => {
                let target = self.controller_id();
                let verb = Verb::WakeUpIntervalSet {
                    seconds: *seconds,
                    target,
                };
                CommandOutput::Delivered(self.ctx.dispatch(*unit, CLASS_WAKE_UP, 1, verb, true)?)
            }
            DriverCommand::EnableTrace(on) => {
                self.ctx.link.set_trace(*on);
                CommandOutput::Trace(*on)
            }
            DriverCommand::Refresh { unit } => CommandOutput::Refreshed(self.refresh(*unit)?),
        };

        if command.mutates_config() {
            let mut state = self.ctx.state.lock();
            if let Err(err) = self.ctx.persist_if_changed(&mut state) {
                warn!("could not persist configuration: {}", err);
            }
        }
        Ok(output)
    }

    /// Interview one unit again and rebuild the fields.
    pub fn refresh(&self, id: UnitId) -> EngineResult<UnitState> {
        let mut guard = self.ctx.state.lock();
        let state = &mut *guard;
        if state.link_state != LinkState::Running {
            return Err(EngineError::NotConnected);
        }
        let old = state.directory.get(id).cloned().ok_or(EngineError::UnknownUnit(id))?;

        let mut unit = old.clone();
        unit.reset_interview();
        unit.transition(UnitState::New);
        self.ctx.interview(&mut unit);
        carry_unit_cache(&old, &mut unit);
        let result = unit.state;
        state.directory.insert(unit);

        state.fields.rebuild(&state.directory, &self.ctx.registry);
        state.poll.reset();
        if let Err(err) = self.ctx.persist_if_changed(state) {
            warn!("could not persist configuration: {}", err);
        }
        Ok(result)
    }

    /// Replace the configuration with an uploaded snapshot, reconciled
    /// against the network as last enumerated.
    pub fn upload_config(&self, bytes: &[u8]) -> EngineResult<ReconcileReport> {
        let snapshot = Snapshot::decode(bytes, self.ctx.config.legacy_secure_policy)?;
        let mut guard = self.ctx.state.lock();
        let state = &mut *guard;
        if state.link_state != LinkState::Running {
            return Err(EngineError::NotConnected);
        }
        info!(
            "uploaded configuration serial {} with {} unit(s)",
            snapshot.serial,
            snapshot.directory.len()
        );

        let (mut directory, report) = reconcile(&snapshot.directory, &state.gateway);
        self.ctx.interview_new(&mut directory);
        carry_caches(&state.directory, &mut directory);
        self.ctx.install(state, directory, &report);
        self.ctx.persist_if_changed(state)?;
        Ok(report)
    }

    /// Encode the live configuration.
    pub fn download_config(&self) -> Vec<u8> {
        let state = self.ctx.state.lock();
        Snapshot::new(state.serial, state.controller_id, state.directory.clone()).encode()
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Every field, in id order.
    pub fn fields(&self) -> Vec<FieldBinding> {
        self.ctx.state.lock().fields.snapshot()
    }

    /// One field by id.
    pub fn field(&self, id: FieldId) -> Option<FieldBinding> {
        self.ctx.state.lock().fields.read(id).cloned()
    }

    /// One field by name.
    pub fn field_by_name(&self, name: &str) -> Option<FieldBinding> {
        self.ctx.state.lock().fields.by_name(name).cloned()
    }

    /// Fields changed after `generation`, with the generation to pass next time.
    pub fn changed_since(&self, generation: u64) -> (u64, Vec<FieldBinding>) {
        let state = self.ctx.state.lock();
        (state.fields.generation(), state.fields.changed_since(generation))
    }

    /// One unit.
    pub fn unit(&self, id: UnitId) -> Option<Unit> {
        self.ctx.state.lock().directory.get(id).cloned()
    }

    /// Copy of the directory.
    pub fn directory(&self) -> Directory {
        self.ctx.state.lock().directory.clone()
    }

    /// Configuration serial.
    pub fn serial(&self) -> u32 {
        self.ctx.state.lock().serial
    }

    /// Coordinator unit id.
    pub fn controller_id(&self) -> u8 {
        self.ctx.state.lock().controller_id
    }

    /// Commands waiting for a sleeping unit, head first.
    pub fn queued(&self, unit: UnitId) -> Vec<QueuedCommand> {
        self.ctx.state.lock().wakeup.pending(unit)
    }

    /// Link counters.
    pub fn link_stats(&self) -> LinkStats {
        self.ctx.link.stats()
    }
}
