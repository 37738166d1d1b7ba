//! The command-class capability contract.
//!
//! A command class turns host intent ([`Verb`]) into class payload bytes and
//! class reports back into field values ([`Update`]). Each unit owns an ordered
//! list of [`CommandClassBinding`]s; the binding carries the per-instance state
//! a class needs, the class object itself is shared and stateless.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::error::{ClassError, ClassResult};
use crate::value::{Access, FieldKind, FieldValue};

/// Network id of a unit.
pub type UnitId = u8;

/// Command class identifier.
pub type ClassId = u8;

// ============================================================================
// Class Identifiers
// ============================================================================

/// Binary switch (on/off).
pub const CLASS_BINARY_SWITCH: ClassId = 0x25;
/// Multilevel switch (dimmer).
pub const CLASS_MULTILEVEL_SWITCH: ClassId = 0x26;
/// Binary sensor.
pub const CLASS_BINARY_SENSOR: ClassId = 0x30;
/// Multilevel sensor.
pub const CLASS_MULTILEVEL_SENSOR: ClassId = 0x31;
/// Configuration parameters.
pub const CLASS_CONFIGURATION: ClassId = 0x70;
/// Notification (alarm) events.
pub const CLASS_NOTIFICATION: ClassId = 0x71;
/// Wake-up interval and notifications.
pub const CLASS_WAKE_UP: ClassId = 0x84;
/// Association groups.
pub const CLASS_ASSOCIATION: ClassId = 0x85;

// ============================================================================
// Binding
// ============================================================================

/// One capability instance on a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandClassBinding {
    /// Class id.
    pub class: ClassId,
    /// Instance index, 1-based. Multi-channel devices expose a class more than once.
    pub instance: u8,
    /// Payloads must pass through the security layer.
    pub secure: bool,
    /// Last decoded value per sub-value index.
    pub cache: BTreeMap<u8, FieldValue>,
    /// When this binding was last polled.
    pub last_poll: Option<Instant>,
}

impl CommandClassBinding {
    /// Create a binding for instance 1.
    pub fn new(class: ClassId, secure: bool) -> Self {
        Self::with_instance(class, 1, secure)
    }

    /// Create a binding for a specific instance.
    pub fn with_instance(class: ClassId, instance: u8, secure: bool) -> Self {
        CommandClassBinding {
            class,
            instance,
            secure,
            cache: BTreeMap::new(),
            last_poll: None,
        }
    }

    /// Cached value for a sub-value index.
    pub fn cached(&self, sub: u8) -> Option<&FieldValue> {
        self.cache.get(&sub)
    }

    /// Whether two bindings describe the same capability instance.
    pub fn same_instance(&self, other: &CommandClassBinding) -> bool {
        self.class == other.class && self.instance == other.instance
    }
}

// ============================================================================
// Class Data
// ============================================================================

/// A device configuration parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigParameter {
    /// Parameter number.
    pub number: u8,
    /// Byte width: 1, 2 or 4.
    pub width: u8,
    /// Signed value.
    pub value: i32,
}

impl ConfigParameter {
    /// Create a parameter, validating the width and that `value` fits it.
    pub fn new(number: u8, width: u8, value: i64) -> ClassResult<Self> {
        let (min, max) = match width {
            1 => (i8::MIN as i64, i8::MAX as i64),
            2 => (i16::MIN as i64, i16::MAX as i64),
            4 => (i32::MIN as i64, i32::MAX as i64),
            _ => {
                return Err(ClassError::invalid(format!(
                    "parameter width must be 1, 2 or 4, got {}",
                    width
                )))
            }
        };
        if value < min || value > max {
            return Err(ClassError::invalid(format!(
                "value {} does not fit in {} byte(s)",
                value, width
            )));
        }
        Ok(ConfigParameter {
            number,
            width,
            value: value as i32,
        })
    }

    /// Big-endian value bytes, `width` long.
    pub fn value_bytes(&self) -> Vec<u8> {
        let bytes = self.value.to_be_bytes();
        bytes[4 - self.width as usize..].to_vec()
    }

    /// Decode a big-endian, sign-extended value of `bytes.len()` width.
    pub fn from_bytes(number: u8, bytes: &[u8]) -> ClassResult<Self> {
        let value = match bytes.len() {
            1 => bytes[0] as i8 as i64,
            2 => i16::from_be_bytes([bytes[0], bytes[1]]) as i64,
            4 => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            n => {
                return Err(ClassError::invalid(format!(
                    "parameter {} has unsupported width {}",
                    number, n
                )))
            }
        };
        ConfigParameter::new(number, bytes.len() as u8, value)
    }
}

/// Targets of one association group on a source unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AssociationGroup {
    /// Group number, 1..=255.
    pub group: u8,
    /// Ordered target unit ids.
    pub targets: Vec<UnitId>,
}

impl AssociationGroup {
    /// Create an empty group.
    pub fn new(group: u8) -> Self {
        AssociationGroup {
            group,
            targets: Vec::new(),
        }
    }

    /// Append `target` unless it is already a member. Returns true if added.
    pub fn add(&mut self, target: UnitId) -> bool {
        if self.targets.contains(&target) {
            return false;
        }
        self.targets.push(target);
        true
    }

    /// Remove `target`. Returns true if it was a member.
    pub fn remove(&mut self, target: UnitId) -> bool {
        let before = self.targets.len();
        self.targets.retain(|t| *t != target);
        self.targets.len() != before
    }
}

// ============================================================================
// Verbs and Updates
// ============================================================================

/// Host intent directed at one command-class instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    /// Ask the device for its current state.
    Get,
    /// Set the value behind a field.
    Set {
        /// Sub-value index of the field.
        sub: u8,
        /// New value.
        value: FieldValue,
    },
    /// Add targets to an association group.
    AssociationAdd {
        /// Group number.
        group: u8,
        /// Targets to add.
        targets: Vec<UnitId>,
    },
    /// Remove targets from an association group. Empty removes all.
    AssociationRemove {
        /// Group number.
        group: u8,
        /// Targets to remove.
        targets: Vec<UnitId>,
    },
    /// Query an association group.
    AssociationGet {
        /// Group number.
        group: u8,
    },
    /// Set a configuration parameter.
    ConfigSet(ConfigParameter),
    /// Query a configuration parameter.
    ConfigGet {
        /// Parameter number.
        parameter: u8,
    },
    /// Set the wake-up interval and the unit notified on wake.
    WakeUpIntervalSet {
        /// Interval in seconds (24 bits).
        seconds: u32,
        /// Unit receiving wake-up notifications.
        target: UnitId,
    },
    /// Query the wake-up interval.
    WakeUpIntervalGet,
    /// Let a woken device go back to sleep.
    WakeUpNoMoreInformation,
}

impl Verb {
    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::Set { .. } => "set",
            Verb::AssociationAdd { .. } => "association-add",
            Verb::AssociationRemove { .. } => "association-remove",
            Verb::AssociationGet { .. } => "association-get",
            Verb::ConfigSet(_) => "config-set",
            Verb::ConfigGet { .. } => "config-get",
            Verb::WakeUpIntervalSet { .. } => "wakeup-interval-set",
            Verb::WakeUpIntervalGet => "wakeup-interval-get",
            Verb::WakeUpNoMoreInformation => "wakeup-no-more-information",
        }
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Encoded command ready for the transaction manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassCommand {
    /// Class payload: class id, command id, arguments.
    pub payload: Vec<u8>,
    /// Class/command header of the report that answers this command, if any.
    pub reply: Option<(ClassId, u8)>,
    /// The payload was wrapped by the security layer.
    pub encapsulated: bool,
}

impl ClassCommand {
    /// A command that expects no report.
    pub fn new(payload: Vec<u8>) -> Self {
        ClassCommand {
            payload,
            reply: None,
            encapsulated: false,
        }
    }

    /// A command answered by the given report header.
    pub fn with_reply(payload: Vec<u8>, class: ClassId, command: u8) -> Self {
        ClassCommand {
            payload,
            reply: Some((class, command)),
            encapsulated: false,
        }
    }

    /// Class/command bytes of the payload.
    pub fn header(&self) -> Option<(ClassId, u8)> {
        match self.payload.as_slice() {
            [class, command, ..] => Some((*class, *command)),
            _ => None,
        }
    }
}

/// Class-level state carried by a report beyond plain field values.
#[derive(Debug, Clone, PartialEq)]
pub enum ClassEvent {
    /// Current members of an association group.
    Association(AssociationGroup),
    /// Current value of a configuration parameter.
    ConfigParameter(ConfigParameter),
    /// Current wake-up interval.
    WakeUpInterval {
        /// Interval in seconds.
        seconds: u32,
        /// Unit notified on wake.
        target: UnitId,
    },
    /// The device is awake and listening.
    WakeUpNotification,
}

/// Result of decoding a report.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Update {
    /// New values per sub-value index.
    pub values: Vec<(u8, FieldValue)>,
    /// Class-level state, if the report carried any.
    pub event: Option<ClassEvent>,
}

impl Update {
    /// A report that changes nothing.
    pub fn none() -> Self {
        Update::default()
    }

    /// A single field value.
    pub fn value(sub: u8, value: impl Into<FieldValue>) -> Self {
        Update {
            values: vec![(sub, value.into())],
            event: None,
        }
    }

    /// A class event with no field values.
    pub fn event(event: ClassEvent) -> Self {
        Update {
            values: Vec::new(),
            event: Some(event),
        }
    }

    /// Attach a class event.
    pub fn with_event(mut self, event: ClassEvent) -> Self {
        self.event = Some(event);
        self
    }

    /// Whether the update carries nothing.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.event.is_none()
    }
}

/// A field contributed by a class instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Sub-value index within the instance.
    pub sub: u8,
    /// Field suffix, appended to the unit name.
    pub name: &'static str,
    /// Declared type.
    pub kind: FieldKind,
    /// Host access.
    pub access: Access,
}

// ============================================================================
// Command Class Trait
// ============================================================================

/// A functional sub-protocol a unit may support.
///
/// Implementations are shared between all units and keep no per-unit state;
/// everything instance-specific lives in the [`CommandClassBinding`].
pub trait CommandClass: Send + Sync {
    /// Class id.
    fn id(&self) -> ClassId;

    /// Human-readable class name.
    fn name(&self) -> &'static str;

    /// Whether `verb` can be encoded by this class.
    fn supports(&self, verb: &Verb) -> bool;

    /// Fields this instance contributes to the host table.
    fn fields(&self, _binding: &CommandClassBinding) -> Vec<FieldSpec> {
        Vec::new()
    }

    /// Encode `verb` for `unit`.
    fn encode_command(
        &self,
        unit: UnitId,
        binding: &CommandClassBinding,
        verb: &Verb,
    ) -> ClassResult<ClassCommand>;

    /// Decode a report (class header included) received from `unit`.
    fn decode_report(
        &self,
        unit: UnitId,
        binding: &CommandClassBinding,
        bytes: &[u8],
    ) -> ClassResult<Update>;

    /// Verb issued by the active poll scheduler, if this class is polled.
    fn poll_verb(&self) -> Option<Verb> {
        None
    }

    /// Whether `new` is a change worth surfacing for sub-value `sub`.
    fn is_value_change(&self, _sub: u8, old: Option<&FieldValue>, new: &FieldValue) -> bool {
        old != Some(new)
    }

    /// Units carrying this class sleep and are never actively polled.
    fn sleeping(&self) -> bool {
        false
    }

    /// Error for a verb this class does not encode.
    fn unsupported(&self, verb: &Verb) -> ClassError {
        ClassError::Unsupported {
            class: self.name(),
            verb: verb.name().to_string(),
        }
    }
}

/// Split a report into its command id and arguments after checking the class byte.
pub fn report_parts<'a>(class: &dyn CommandClass, bytes: &'a [u8]) -> ClassResult<(u8, &'a [u8])> {
    ClassError::check_len(class.name(), bytes, 2)?;
    if bytes[0] != class.id() {
        return Err(ClassError::UnexpectedCommand {
            class: bytes[0],
            command: bytes[1],
        });
    }
    Ok((bytes[1], &bytes[2..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parameter_width_checks() {
        assert!(ConfigParameter::new(3, 1, 127).is_ok());
        assert!(ConfigParameter::new(3, 1, 128).is_err());
        assert!(ConfigParameter::new(3, 2, -32768).is_ok());
        assert!(ConfigParameter::new(3, 3, 0).is_err());
    }

    #[test]
    fn test_config_parameter_bytes() {
        let p = ConfigParameter::new(7, 2, -2).expect("should fit");
        assert_eq!(p.value_bytes(), vec![0xFF, 0xFE]);
        let back = ConfigParameter::from_bytes(7, &[0xFF, 0xFE]).expect("should decode");
        assert_eq!(back, p);

        let wide = ConfigParameter::from_bytes(1, &[0x00, 0x01, 0x00, 0x00]).expect("should decode");
        assert_eq!(wide.value, 65536);
        assert!(ConfigParameter::from_bytes(1, &[0x00, 0x01, 0x00]).is_err());
    }

    #[test]
    fn test_association_group_membership() {
        let mut group = AssociationGroup::new(1);
        assert!(group.add(2));
        assert!(group.add(1));
        assert!(!group.add(2));
        assert_eq!(group.targets, vec![2, 1]);
        assert!(group.remove(2));
        assert!(!group.remove(9));
        assert_eq!(group.targets, vec![1]);
    }

    #[test]
    fn test_update_builders() {
        assert!(Update::none().is_empty());
        let u = Update::value(0, true).with_event(ClassEvent::WakeUpNotification);
        assert_eq!(u.values, vec![(0, FieldValue::Bool(true))]);
        assert!(!u.is_empty());
    }
}
