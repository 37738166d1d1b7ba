//! Notification events.

use crate::class::*;
use crate::error::{ClassError, ClassResult};
use crate::value::{Access, FieldKind, FieldValue};

const GET: u8 = 0x04;
const REPORT: u8 = 0x05;

/// Sub-value carrying the notification type.
const SUB_TYPE: u8 = 0;
/// Sub-value carrying the event code.
const SUB_EVENT: u8 = 1;

/// Pushed alarm/notification events.
///
/// Short (legacy) reports carry `[type][level]`; full reports carry
/// `[legacy type][legacy level][reserved][status][type][event]...`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Notification;

impl CommandClass for Notification {
    fn id(&self) -> ClassId {
        CLASS_NOTIFICATION
    }

    fn name(&self) -> &'static str {
        "notification"
    }

    fn supports(&self, verb: &Verb) -> bool {
        matches!(verb, Verb::Get)
    }

    fn fields(&self, _binding: &CommandClassBinding) -> Vec<FieldSpec> {
        vec![
            FieldSpec {
                sub: SUB_TYPE,
                name: "notification",
                kind: FieldKind::Count,
                access: Access::ReadOnly,
            },
            FieldSpec {
                sub: SUB_EVENT,
                name: "event",
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
            // Any type, first pending event.
            Verb::Get => Ok(ClassCommand::with_reply(
                vec![self.id(), GET, 0x00, 0xFF, 0x00],
                self.id(),
                REPORT,
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
        if command != REPORT {
            return Err(ClassError::UnexpectedCommand {
                class: self.id(),
                command,
            });
        }
        ClassError::check_len(self.name(), args, 2)?;
        let (kind, event) = if args.len() >= 6 {
            (args[4], args[5])
        } else {
            (args[0], args[1])
        };
        Ok(Update {
            values: vec![
                (SUB_TYPE, FieldValue::from(kind)),
                (SUB_EVENT, FieldValue::from(event)),
            ],
            event: None,
        })
    }

    /// Repeated events are real occurrences, so the event code always counts.
    fn is_value_change(&self, sub: u8, old: Option<&FieldValue>, new: &FieldValue) -> bool {
        sub == SUB_EVENT || old != Some(new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_report() {
        let class = Notification;
        let b = CommandClassBinding::new(CLASS_NOTIFICATION, false);
        let update = class
            .decode_report(8, &b, &[0x71, 0x05, 0, 0, 0, 0xFF, 0x07, 0x08])
            .expect("should decode");
        assert_eq!(
            update.values,
            vec![(0, FieldValue::Integer(7)), (1, FieldValue::Integer(8))]
        );
    }

    #[test]
    fn test_legacy_report() {
        let class = Notification;
        let b = CommandClassBinding::new(CLASS_NOTIFICATION, false);
        let update = class
            .decode_report(8, &b, &[0x71, 0x05, 0x02, 0xFF])
            .expect("should decode");
        assert_eq!(update.values[0], (0, FieldValue::Integer(2)));
    }

    #[test]
    fn test_repeated_event_is_change() {
        let class = Notification;
        let v = FieldValue::Integer(8);
        assert!(class.is_value_change(SUB_EVENT, Some(&v), &v));
        assert!(!class.is_value_change(SUB_TYPE, Some(&v), &v));
    }

    #[test]
    fn test_not_polled() {
        assert!(Notification.poll_verb().is_none());
    }
}
