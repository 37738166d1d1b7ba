//! Binary and multilevel sensors.

use crate::class::*;
use crate::error::{ClassError, ClassResult};
use crate::value::{Access, FieldKind, FieldValue};

/// Smallest reading difference treated as a change.
const READING_TOLERANCE: f64 = 1e-6;

// ============================================================================
// Binary Sensor
// ============================================================================

const BINARY_GET: u8 = 0x02;
const BINARY_REPORT: u8 = 0x03;

/// Two-state sensor (contact, motion, leak).
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySensor;

impl CommandClass for BinarySensor {
    fn id(&self) -> ClassId {
        CLASS_BINARY_SENSOR
    }

    fn name(&self) -> &'static str {
        "binary-sensor"
    }

    fn supports(&self, verb: &Verb) -> bool {
        matches!(verb, Verb::Get)
    }

    fn fields(&self, _binding: &CommandClassBinding) -> Vec<FieldSpec> {
        vec![FieldSpec {
            sub: 0,
            name: "sensor",
            kind: FieldKind::Bool,
            access: Access::ReadOnly,
        }]
    }

    fn encode_command(
        &self,
        _unit: UnitId,
        _binding: &CommandClassBinding,
        verb: &Verb,
    ) -> ClassResult<ClassCommand> {
        match verb {
            Verb::Get => Ok(ClassCommand::with_reply(
                vec![self.id(), BINARY_GET],
                self.id(),
                BINARY_REPORT,
            )),
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
        if command != BINARY_REPORT {
            return Err(ClassError::UnexpectedCommand {
                class: self.id(),
                command,
            });
        }
        ClassError::check_len(self.name(), args, 1)?;
        Ok(Update::value(0, args[0] != 0))
    }

    fn poll_verb(&self) -> Option<Verb> {
        Some(Verb::Get)
    }
}

// ============================================================================
// Multilevel Sensor
// ============================================================================

const MULTILEVEL_GET: u8 = 0x04;
const MULTILEVEL_REPORT: u8 = 0x05;

/// Scaled numeric sensor (temperature, luminance, power).
///
/// Reports carry `[sensor type][precision:3|scale:2|size:3][value, big-endian]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultilevelSensor;

impl CommandClass for MultilevelSensor {
    fn id(&self) -> ClassId {
        CLASS_MULTILEVEL_SENSOR
    }

    fn name(&self) -> &'static str {
        "multilevel-sensor"
    }

    fn supports(&self, verb: &Verb) -> bool {
        matches!(verb, Verb::Get)
    }

    fn fields(&self, _binding: &CommandClassBinding) -> Vec<FieldSpec> {
        vec![
            FieldSpec {
                sub: 0,
                name: "value",
                kind: FieldKind::Float,
                access: Access::ReadOnly,
            },
            FieldSpec {
                sub: 1,
                name: "sensor_type",
                kind: FieldKind::Count,
                access: Access::ReadOnly,
            },
            FieldSpec {
                sub: 2,
                name: "scale",
                kind: FieldKind::Count,
                access: Access::ReadOnly,
            },
        ]
    }

    fn encode_command(
        &self,
        _unit: UnitId,
        _binding: &CommandClassBinding,
        verb: &Verb,
    ) -> ClassResult<ClassCommand> {
        match verb {
            Verb::Get => Ok(ClassCommand::with_reply(
                vec![self.id(), MULTILEVEL_GET],
                self.id(),
                MULTILEVEL_REPORT,
            )),
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
        if command != MULTILEVEL_REPORT {
            return Err(ClassError::UnexpectedCommand {
                class: self.id(),
                command,
            });
        }
        ClassError::check_len(self.name(), args, 2)?;
        let sensor_type = args[0];
        let precision = (args[1] >> 5) & 0x07;
        let scale = (args[1] >> 3) & 0x03;
        let size = (args[1] & 0x07) as usize;
        ClassError::check_len(self.name(), args, 2 + size)?;

        let raw = &args[2..2 + size];
        let value = match size {
            1 => raw[0] as i8 as i64,
            2 => i16::from_be_bytes([raw[0], raw[1]]) as i64,
            4 => i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64,
            n => return Err(ClassError::invalid(format!("sensor value size {}", n))),
        };
        let reading = value as f64 / 10f64.powi(precision as i32);

        Ok(Update {
            values: vec![
                (0, FieldValue::Float(reading)),
                (1, FieldValue::from(sensor_type)),
                (2, FieldValue::from(scale)),
            ],
            event: None,
        })
    }

    fn poll_verb(&self) -> Option<Verb> {
        Some(Verb::Get)
    }

    fn is_value_change(&self, sub: u8, old: Option<&FieldValue>, new: &FieldValue) -> bool {
        match (sub, old.and_then(|v| v.as_f64()), new.as_f64()) {
            (0, Some(old), Some(new)) => (old - new).abs() > READING_TOLERANCE,
            _ => old != Some(new),
        }
    }
}
