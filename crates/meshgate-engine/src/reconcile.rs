//! Reconciliation of persisted configuration against the live network.
//!
//! The coordinator is the authority on which units exist; the snapshot is the
//! authority on what the user configured for them. Reconciliation merges the
//! two into the directory the engine runs with. Running it twice with the same
//! inputs yields the same directory.

use std::collections::BTreeSet;

use meshgate_classes::UnitId;
use meshgate_protocol::ProtocolInfo;
use tracing::{debug, info};

use crate::directory::{Directory, Unit, UnitState};

/// One unit as enumerated from the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayUnit {
    /// Unit id.
    pub id: UnitId,
    /// Always listening.
    pub listening: bool,
    /// Generic device type.
    pub generic: u8,
    /// Specific device type.
    pub specific: u8,
}

impl GatewayUnit {
    /// Build from a protocol info reply.
    pub fn from_info(id: UnitId, info: &ProtocolInfo) -> Self {
        GatewayUnit {
            id,
            listening: info.listening,
            generic: info.generic,
            specific: info.specific,
        }
    }

    /// Build from a directory entry.
    pub fn from_unit(unit: &Unit) -> Self {
        GatewayUnit {
            id: unit.id,
            listening: unit.listening,
            generic: unit.generic,
            specific: unit.specific,
        }
    }
}

/// What a reconciliation did, by unit id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Units only the coordinator knew.
    pub added: Vec<UnitId>,
    /// Units present on both sides.
    pub kept: Vec<UnitId>,
    /// Units only the snapshot knew, now `Dead`.
    pub dead: Vec<UnitId>,
    /// `Dead` units that reappeared.
    pub revived: Vec<UnitId>,
    /// Units whose device type changed, restarted as `New`.
    pub replaced: Vec<UnitId>,
    /// Units whose interview is retried.
    pub retried: Vec<UnitId>,
}

impl ReconcileReport {
    /// Whether any unit changed side or state.
    pub fn is_structural(&self) -> bool {
        !(self.added.is_empty()
            && self.dead.is_empty()
            && self.revived.is_empty()
            && self.replaced.is_empty()
            && self.retried.is_empty())
    }
}

/// Merge `persisted` with the coordinator's unit list.
///
/// * present in both: persisted name, bindings and user data are kept, type
///   codes and the listening flag come from the coordinator; a changed type
///   code means a replaced device, which restarts as `New` without bindings
/// * coordinator only: `New`
/// * snapshot only: `Dead`, retained
/// * `Dead` units that reappear become `Ready` if interviewed, else `New`
/// * `Failed` and half-interviewed units restart as `New`
pub fn reconcile(persisted: &Directory, gateway: &[GatewayUnit]) -> (Directory, ReconcileReport) {
    let mut report = ReconcileReport::default();
    let mut directory = Directory::new();
    let present: BTreeSet<UnitId> = gateway.iter().map(|g| g.id).collect();

    for g in gateway {
        let Some(known) = persisted.get(g.id) else {
            continue;
        };
        let mut unit = known.clone();
        unit.failures = 0;
        unit.in_error = false;

        let had_type = unit.generic != 0 || unit.specific != 0;
        if had_type && (unit.generic, unit.specific) != (g.generic, g.specific) {
            info!(
                "unit {}: device type {:02x}/{:02x} -> {:02x}/{:02x}, treating as replaced",
                g.id, unit.generic, unit.specific, g.generic, g.specific
            );
            unit.reset_interview();
            unit.state = UnitState::New;
            report.replaced.push(g.id);
        }
        unit.generic = g.generic;
        unit.specific = g.specific;
        unit.listening = g.listening;

        match unit.state {
            UnitState::Dead => {
                let to = if unit.is_interviewed() {
                    UnitState::Ready
                } else {
                    UnitState::New
                };
                unit.transition(to);
                report.revived.push(g.id);
            }
            UnitState::Failed | UnitState::Configuring => {
                unit.reset_interview();
                unit.transition(UnitState::New);
                report.retried.push(g.id);
            }
            UnitState::Ready if !unit.is_interviewed() => {
                unit.transition(UnitState::New);
                report.retried.push(g.id);
            }
            UnitState::Ready | UnitState::New => {}
        }
        report.kept.push(g.id);
        directory.insert(unit);
    }

    // Kept units win name clashes with newcomers.
    for g in gateway.iter().filter(|g| persisted.get(g.id).is_none()) {
        let mut unit = Unit::new(g.id);
        unit.name = free_name(&directory, persisted, g.id);
        unit.generic = g.generic;
        unit.specific = g.specific;
        unit.listening = g.listening;
        debug!("unit {}: new on the network as {:?}", g.id, unit.name);
        report.added.push(g.id);
        directory.insert(unit);
    }

    for known in persisted.iter().filter(|u| !present.contains(&u.id)) {
        let mut unit = known.clone();
        unit.failures = 0;
        unit.in_error = false;
        if unit.state != UnitState::Dead {
            debug!("unit {}: missing from the network, marking dead", unit.id);
            report.dead.push(unit.id);
        }
        unit.transition(UnitState::Dead);
        directory.insert(unit);
    }

    (directory, report)
}

/// Default name for a newcomer that no existing unit uses.
fn free_name(directory: &Directory, persisted: &Directory, id: UnitId) -> String {
    let taken = |name: &str| directory.by_name(name).is_some() || persisted.by_name(name).is_some();
    let base = Unit::default_name(id);
    let mut name = base.clone();
    let mut n = 2;
    while taken(&name) {
        name = format!("{} ({})", base, n);
        n += 1;
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_classes::{AssociationGroup, CommandClassBinding, CLASS_BINARY_SWITCH};

    fn gw(id: UnitId) -> GatewayUnit {
        GatewayUnit {
            id,
            listening: true,
            generic: 0x10,
            specific: 0x01,
        }
    }

    fn ready(id: UnitId, name: &str) -> Unit {
        let mut unit = Unit::new(id);
        unit.name = name.into();
        unit.generic = 0x10;
        unit.specific = 0x01;
        unit.state = UnitState::Ready;
        unit.bindings.push(CommandClassBinding::new(CLASS_BINARY_SWITCH, false));
        unit
    }

    #[test]
    fn test_empty_snapshot_adds_everything() {
        let (dir, report) = reconcile(&Directory::new(), &[gw(2), gw(5)]);
        assert_eq!(report.added, vec![2, 5]);
        assert!(dir.iter().all(|u| u.state == UnitState::New));
        assert_eq!(dir.get(5).unwrap().name, "Unit 5");
    }

    #[test]
    fn test_ready_unit_missing_becomes_dead_and_is_retained() {
        let mut persisted = Directory::new();
        let mut lamp = ready(2, "Lamp");
        let mut group = AssociationGroup::new(1);
        group.add(1);
        lamp.associations.insert(1, group);
        persisted.insert(lamp);
        persisted.insert(ready(3, "Fan"));

        let (dir, report) = reconcile(&persisted, &[gw(3)]);
        assert_eq!(report.dead, vec![2]);
        let lamp = dir.get(2).expect("dead unit retained");
        assert_eq!(lamp.state, UnitState::Dead);
        assert_eq!(lamp.name, "Lamp");
        assert_eq!(lamp.associations[&1].targets, vec![1]);
        assert_eq!(lamp.bindings.len(), 1);

        // Back on the network: straight to Ready with its old configuration.
        let (dir, report) = reconcile(&dir, &[gw(2), gw(3)]);
        assert_eq!(report.revived, vec![2]);
        assert_eq!(dir.get(2).unwrap().state, UnitState::Ready);
    }

    #[test]
    fn test_idempotent() {
        let mut persisted = Directory::new();
        persisted.insert(ready(2, "Lamp"));
        let mut failed = ready(4, "Door");
        failed.state = UnitState::Failed;
        persisted.insert(failed);
        persisted.insert(ready(9, "Gone"));
        let gateway = [gw(2), gw(4), gw(6)];

        let (once, _) = reconcile(&persisted, &gateway);
        let (twice, report) = reconcile(&once, &gateway);
        assert_eq!(once, twice);
        assert!(!report.is_structural());
    }

    #[test]
    fn test_type_change_means_replacement() {
        let mut persisted = Directory::new();
        persisted.insert(ready(2, "Lamp"));
        let mut replaced = gw(2);
        replaced.generic = 0x21;

        let (dir, report) = reconcile(&persisted, &[replaced]);
        assert_eq!(report.replaced, vec![2]);
        let unit = dir.get(2).unwrap();
        assert_eq!(unit.state, UnitState::New);
        assert!(unit.bindings.is_empty());
        assert_eq!(unit.name, "Lamp");
        assert_eq!(unit.generic, 0x21);
    }

    #[test]
    fn test_failed_units_are_retried() {
        let mut persisted = Directory::new();
        let mut failed = ready(4, "Door");
        failed.state = UnitState::Failed;
        persisted.insert(failed);

        let (dir, report) = reconcile(&persisted, &[gw(4)]);
        assert_eq!(report.retried, vec![4]);
        assert_eq!(dir.get(4).unwrap().state, UnitState::New);
    }

    #[test]
    fn test_newcomer_avoids_taken_default_name() {
        let mut persisted = Directory::new();
        persisted.insert(ready(2, "Unit 7"));
        let (dir, _) = reconcile(&persisted, &[gw(2), gw(7)]);
        assert_eq!(dir.get(7).unwrap().name, "Unit 7 (2)");
        assert_eq!(dir.duplicate_name(), None);
    }
}
