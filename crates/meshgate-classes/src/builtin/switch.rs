//! Binary and multilevel switches.

use crate::class::*;
use crate::error::{ClassError, ClassResult};
use crate::value::{Access, FieldKind, FieldValue};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;

/// Highest dimmer level.
const LEVEL_MAX: u8 = 99;
/// "On at last level" in level reports.
const LEVEL_ON: u8 = 0xFF;

// ============================================================================
// Binary Switch
// ============================================================================

/// On/off switch.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySwitch;

impl CommandClass for BinarySwitch {
    fn id(&self) -> ClassId {
        CLASS_BINARY_SWITCH
    }

    fn name(&self) -> &'static str {
        "binary-switch"
    }

    fn supports(&self, verb: &Verb) -> bool {
        matches!(verb, Verb::Get | Verb::Set { sub: 0, .. })
    }

    fn fields(&self, _binding: &CommandClassBinding) -> Vec<FieldSpec> {
        vec![FieldSpec {
            sub: 0,
            name: "switch",
            kind: FieldKind::Bool,
            access: Access::ReadWrite,
        }]
    }

    fn encode_command(
        &self,
        _unit: UnitId,
        _binding: &CommandClassBinding,
        verb: &Verb,
    ) -> ClassResult<ClassCommand> {
        match verb {
            Verb::Get => Ok(ClassCommand::with_reply(vec![self.id(), GET], self.id(), REPORT)),
            Verb::Set { value, .. } => {
                let on = FieldKind::Bool
                    .coerce(value)
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| ClassError::invalid(format!("{} is not a switch state", value)))?;
                let level = if on { LEVEL_ON } else { 0x00 };
                Ok(ClassCommand::new(vec![self.id(), SET, level]))
            }
            other => Err(self.unsupported(other)),
        }
    }

    fn decode_report(
        &self,
        _unit: UnitId,
        _binding: &CommandClassBinding,
        bytes: &[u8],
    ) -> ClassResult<Update> {
        let (command, args) = report_parts(self, bytes)?;
        if command != REPORT {
            return Err(ClassError::UnexpectedCommand {
                class: self.id(),
                command,
            });
        }
        ClassError::check_len(self.name(), args, 1)?;
        Ok(match args[0] {
            0x00 => Update::value(0, false),
            0x01..=LEVEL_MAX | LEVEL_ON => Update::value(0, true),
            // 0xFE: state unknown
            _ => Update::none(),
        })
    }

    fn poll_verb(&self) -> Option<Verb> {
        Some(Verb::Get)
    }
}

// ============================================================================
// Multilevel Switch
// ============================================================================

/// Dimmer with levels 0..=99.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultilevelSwitch;

impl CommandClass for MultilevelSwitch {
    fn id(&self) -> ClassId {
        CLASS_MULTILEVEL_SWITCH
    }

    fn name(&self) -> &'static str {
        "multilevel-switch"
    }

    fn supports(&self, verb: &Verb) -> bool {
        matches!(verb, Verb::Get | Verb::Set { sub: 0, .. })
    }

    fn fields(&self, _binding: &CommandClassBinding) -> Vec<FieldSpec> {
        vec![FieldSpec {
            sub: 0,
            name: "level",
            kind: FieldKind::Level,
            access: Access::ReadWrite,
        }]
    }

    fn encode_command(
        &self,
        _unit: UnitId,
        _binding: &CommandClassBinding,
        verb: &Verb,
    ) -> ClassResult<ClassCommand> {
        match verb {
            Verb::Get => Ok(ClassCommand::with_reply(vec![self.id(), GET], self.id(), REPORT)),
            Verb::Set { value, .. } => {
                let level = FieldKind::Level
                    .coerce(value)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        ClassError::invalid(format!("level {} outside 0..={}", value, LEVEL_MAX))
                    })?;
                Ok(ClassCommand::new(vec![self.id(), SET, level as u8]))
            }
            other => Err(self.unsupported(other)),
        }
    }

    fn decode_report(
        &self,
        _unit: UnitId,
        _binding: &CommandClassBinding,
        bytes: &[u8],
    ) -> ClassResult<Update> {
        let (command, args) = report_parts(self, bytes)?;
        if command != REPORT {
            return Err(ClassError::UnexpectedCommand {
                class: self.id(),
                command,
            });
        }
        ClassError::check_len(self.name(), args, 1)?;
        Ok(match args[0] {
            level @ 0..=LEVEL_MAX => Update::value(0, FieldValue::Integer(level as i64)),
            LEVEL_ON => Update::value(0, FieldValue::Integer(LEVEL_MAX as i64)),
            _ => Update::none(),
        })
    }

    fn poll_verb(&self) -> Option<Verb> {
        Some(Verb::Get)
    }
}
