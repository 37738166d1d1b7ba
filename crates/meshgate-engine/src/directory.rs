//! Unit directory: the live network model.

use std::collections::BTreeMap;

use meshgate_classes::{
    AssociationGroup, ClassId, ClassRegistry, CommandClassBinding, ConfigParameter, UnitId,
};
use serde::Serialize;
use tracing::debug;

// ============================================================================
// Unit State
// ============================================================================

/// Lifecycle of a unit.
///
/// ```text
/// New -> Configuring -> Ready
///  \         \
///   +---------+-> Failed        any -> Dead
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    /// Discovered, not yet interviewed.
    New,
    /// Interview in progress.
    Configuring,
    /// Interviewed; has fields and is polled.
    Ready,
    /// Interview failed; retried on the next connect.
    Failed,
    /// Absent from the coordinator's unit list.
    Dead,
}

impl UnitState {
    /// Snapshot code.
    pub fn code(self) -> u8 {
        match self {
            UnitState::New => 0,
            UnitState::Configuring => 1,
            UnitState::Ready => 2,
            UnitState::Failed => 3,
            UnitState::Dead => 4,
        }
    }

    /// Parse a snapshot code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(UnitState::New),
            1 => Some(UnitState::Configuring),
            2 => Some(UnitState::Ready),
            3 => Some(UnitState::Failed),
            4 => Some(UnitState::Dead),
            _ => None,
        }
    }

    /// Whether reconciliation may move a unit from `self` to `to`.
    ///
    /// Besides the interview path, reconciliation resets units: a dead unit
    /// that reappears, a failed or interrupted interview being retried, and
    /// replaced devices.
    pub fn can_transition(self, to: UnitState) -> bool {
        use UnitState::*;
        match (self, to) {
            (a, b) if a == b => true,
            (_, Dead) => true,
            (New, Configuring) | (Configuring, Ready) => true,
            (New, Failed) | (Configuring, Failed) => true,
            (Dead, Ready) | (Dead, New) | (Failed, New) => true,
            (Ready, New) | (Configuring, New) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            UnitState::New => "new",
            UnitState::Configuring => "configuring",
            UnitState::Ready => "ready",
            UnitState::Failed => "failed",
            UnitState::Dead => "dead",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Unit
// ============================================================================

/// One network device.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    /// Network id, 1..=232.
    pub id: UnitId,
    /// Unique human-assigned name.
    pub name: String,
    /// Generic device type.
    pub generic: u8,
    /// Specific device type.
    pub specific: u8,
    /// Lifecycle state.
    pub state: UnitState,
    /// Always-listening unit, as reported by the coordinator.
    pub listening: bool,
    /// Capability instances, in interview order.
    pub bindings: Vec<CommandClassBinding>,
    /// Association groups by number.
    pub associations: BTreeMap<u8, AssociationGroup>,
    /// Configuration parameters by number.
    pub config: BTreeMap<u8, ConfigParameter>,
    /// Wake-up interval in seconds, if known.
    pub wakeup_interval: Option<u32>,
    /// Consecutive failed transactions (not persisted).
    pub failures: u32,
    /// Fields currently marked in error (not persisted).
    pub in_error: bool,
}

impl Unit {
    /// Default name for a unit id.
    pub fn default_name(id: UnitId) -> String {
        format!("Unit {}", id)
    }

    /// Create a new, uninterviewed unit.
    pub fn new(id: UnitId) -> Self {
        Unit {
            id,
            name: Self::default_name(id),
            generic: 0,
            specific: 0,
            state: UnitState::New,
            listening: true,
            bindings: Vec::new(),
            associations: BTreeMap::new(),
            config: BTreeMap::new(),
            wakeup_interval: None,
            failures: 0,
            in_error: false,
        }
    }

    /// Move to `to`, returning false (and leaving the state alone) if the
    /// transition is not allowed.
    pub fn transition(&mut self, to: UnitState) -> bool {
        if !self.state.can_transition(to) {
            debug!("unit {}: refusing transition {} -> {}", self.id, self.state, to);
            return false;
        }
        if self.state != to {
            debug!("unit {}: {} -> {}", self.id, self.state, to);
            self.state = to;
        }
        true
    }

    /// Binding for a class instance.
    pub fn binding(&self, class: ClassId, instance: u8) -> Option<&CommandClassBinding> {
        self.bindings
            .iter()
            .find(|b| b.class == class && b.instance == instance)
    }

    /// Mutable binding for a class instance.
    pub fn binding_mut(&mut self, class: ClassId, instance: u8) -> Option<&mut CommandClassBinding> {
        self.bindings
            .iter_mut()
            .find(|b| b.class == class && b.instance == instance)
    }

    /// First binding of a class.
    pub fn first_binding(&self, class: ClassId) -> Option<&CommandClassBinding> {
        self.bindings.iter().find(|b| b.class == class)
    }

    /// Whether the unit has any instance of `class`.
    pub fn has_class(&self, class: ClassId) -> bool {
        self.first_binding(class).is_some()
    }

    /// Whether the unit sleeps (carries a class that marks it sleeping).
    pub fn is_sleeping(&self, registry: &ClassRegistry) -> bool {
        self.bindings
            .iter()
            .any(|b| registry.get(b.class).is_some_and(|c| c.sleeping()))
    }

    /// Whether the unit has been interviewed.
    pub fn is_interviewed(&self) -> bool {
        !self.bindings.is_empty()
    }

    /// Drop interview results, keeping identity and user data.
    pub fn reset_interview(&mut self) {
        self.bindings.clear();
        self.failures = 0;
        self.in_error = false;
    }

    /// Compare the persisted parts of two units.
    pub fn persisted_eq(&self, other: &Unit) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.generic == other.generic
            && self.specific == other.specific
            && self.state == other.state
            && self.listening == other.listening
            && self.associations == other.associations
            && self.config == other.config
            && self.wakeup_interval == other.wakeup_interval
            && self.bindings.len() == other.bindings.len()
            && self
                .bindings
                .iter()
                .zip(&other.bindings)
                .all(|(a, b)| a.same_instance(b) && a.secure == b.secure)
    }
}

// ============================================================================
// Directory
// ============================================================================

/// All known units, keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directory {
    units: BTreeMap<UnitId, Unit>,
}

impl Directory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a unit.
    pub fn insert(&mut self, unit: Unit) -> Option<Unit> {
        self.units.insert(unit.id, unit)
    }

    /// Remove a unit.
    pub fn remove(&mut self, id: UnitId) -> Option<Unit> {
        self.units.remove(&id)
    }

    /// Unit by id.
    pub fn get(&self, id: UnitId) -> Option<&Unit> {
        self.units.get(&id)
    }

    /// Mutable unit by id.
    pub fn get_mut(&mut self, id: UnitId) -> Option<&mut Unit> {
        self.units.get_mut(&id)
    }

    /// Unit by name.
    pub fn by_name(&self, name: &str) -> Option<&Unit> {
        self.units.values().find(|u| u.name == name)
    }

    /// Units in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Unit> {
        self.units.values()
    }

    /// Mutable units in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Unit> {
        self.units.values_mut()
    }

    /// Unit ids in ascending order.
    pub fn ids(&self) -> Vec<UnitId> {
        self.units.keys().copied().collect()
    }

    /// Number of units.
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Ids of `Ready` units.
    pub fn ready_ids(&self) -> Vec<UnitId> {
        self.units
            .values()
            .filter(|u| u.state == UnitState::Ready)
            .map(|u| u.id)
            .collect()
    }

    /// Number of units per state.
    pub fn state_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for unit in self.units.values() {
            *counts.entry(unit.state.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// First name used by more than one unit.
    pub fn duplicate_name(&self) -> Option<&str> {
        let mut seen = std::collections::HashSet::new();
        self.units
            .values()
            .map(|u| u.name.as_str())
            .find(|name| !seen.insert(*name))
    }

    /// Compare the persisted parts of two directories.
    pub fn persisted_eq(&self, other: &Directory) -> bool {
        self.units.len() == other.units.len()
            && self
                .units
                .values()
                .zip(other.units.values())
                .all(|(a, b)| a.persisted_eq(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_classes::{CLASS_BINARY_SWITCH, CLASS_WAKE_UP};

    #[test]
    fn test_state_codes() {
        for state in [
            UnitState::New,
            UnitState::Configuring,
            UnitState::Ready,
            UnitState::Failed,
            UnitState::Dead,
        ] {
            assert_eq!(UnitState::from_code(state.code()), Some(state));
        }
        assert_eq!(UnitState::from_code(9), None);
    }

    #[test]
    fn test_transitions() {
        let mut unit = Unit::new(4);
        assert!(!unit.transition(UnitState::Ready));
        assert!(unit.transition(UnitState::Configuring));
        assert!(unit.transition(UnitState::Ready));
        assert!(!unit.transition(UnitState::Failed));
        assert!(unit.transition(UnitState::Dead));
        assert!(unit.transition(UnitState::Ready));
        assert_eq!(unit.state, UnitState::Ready);
    }

    #[test]
    fn test_sleeping_units() {
        let registry = ClassRegistry::with_builtin();
        let mut unit = Unit::new(4);
        unit.bindings.push(CommandClassBinding::new(CLASS_BINARY_SWITCH, false));
        assert!(!unit.is_sleeping(&registry));
        unit.bindings.push(CommandClassBinding::new(CLASS_WAKE_UP, false));
        assert!(unit.is_sleeping(&registry));
    }

    #[test]
    fn test_persisted_eq_ignores_transient_state() {
        let mut a = Unit::new(2);
        a.bindings.push(CommandClassBinding::new(CLASS_BINARY_SWITCH, false));
        let mut b = a.clone();
        b.failures = 7;
        b.in_error = true;
        b.bindings[0].cache.insert(0, true.into());
        assert!(a.persisted_eq(&b));
        b.name = "Hall".into();
        assert!(!a.persisted_eq(&b));
    }

    #[test]
    fn test_duplicate_name() {
        let mut dir = Directory::new();
        dir.insert(Unit::new(2));
        let mut other = Unit::new(3);
        other.name = "Unit 2".into();
        dir.insert(other);
        assert_eq!(dir.duplicate_name(), Some("Unit 2"));
    }
}
