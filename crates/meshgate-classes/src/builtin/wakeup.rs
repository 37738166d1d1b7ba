//! Wake-up interval and notifications for sleeping devices.

use crate::class::*;
use crate::error::{ClassError, ClassResult};
use crate::value::{Access, FieldKind};

const INTERVAL_SET: u8 = 0x04;
const INTERVAL_GET: u8 = 0x05;
const INTERVAL_REPORT: u8 = 0x06;
const NOTIFICATION: u8 = 0x07;
const NO_MORE_INFORMATION: u8 = 0x08;

/// Largest interval expressible in the 24-bit field.
pub const MAX_WAKEUP_INTERVAL: u32 = 0x00FF_FFFF;

/// Wake-up class. Units carrying it are treated as sleeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct WakeUp;

impl CommandClass for WakeUp {
    fn id(&self) -> ClassId {
        CLASS_WAKE_UP
    }

    fn name(&self) -> &'static str {
        "wake-up"
    }

    fn supports(&self, verb: &Verb) -> bool {
        matches!(
            verb,
            Verb::WakeUpIntervalSet { .. } | Verb::WakeUpIntervalGet | Verb::WakeUpNoMoreInformation
        )
    }

    fn fields(&self, _binding: &CommandClassBinding) -> Vec<FieldSpec> {
        vec![FieldSpec {
            sub: 0,
            name: "wakeup_interval",
            kind: FieldKind::Count,
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
            Verb::WakeUpIntervalSet { seconds, target } => {
                if *seconds > MAX_WAKEUP_INTERVAL {
                    return Err(ClassError::invalid(format!(
                        "wake-up interval {} exceeds {}",
                        seconds, MAX_WAKEUP_INTERVAL
                    )));
                }
                let s = seconds.to_be_bytes();
                Ok(ClassCommand::new(vec![
                    self.id(),
                    INTERVAL_SET,
                    s[1],
                    s[2],
                    s[3],
                    *target,
                ]))
            }
            Verb::WakeUpIntervalGet => Ok(ClassCommand::with_reply(
                vec![self.id(), INTERVAL_GET],
                self.id(),
                INTERVAL_REPORT,
            )),
            Verb::WakeUpNoMoreInformation => {
                Ok(ClassCommand::new(vec![self.id(), NO_MORE_INFORMATION]))
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
        match command {
            INTERVAL_REPORT => {
                ClassError::check_len(self.name(), args, 4)?;
                let seconds = u32::from_be_bytes([0, args[0], args[1], args[2]]);
                Ok(Update::value(0, seconds).with_event(ClassEvent::WakeUpInterval {
                    seconds,
                    target: args[3],
                }))
            }
            NOTIFICATION => Ok(Update::event(ClassEvent::WakeUpNotification)),
            other => Err(ClassError::UnexpectedCommand {
                class: self.id(),
                command: other,
            }),
        }
    }

    fn sleeping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldValue;

    #[test]
    fn test_interval_set_encoding() {
        let b = CommandClassBinding::new(CLASS_WAKE_UP, false);
        let cmd = WakeUp
            .encode_command(
                9,
                &b,
                &Verb::WakeUpIntervalSet {
                    seconds: 3600,
                    target: 1,
                },
            )
            .expect("should encode");
        assert_eq!(cmd.payload, vec![0x84, 0x04, 0x00, 0x0E, 0x10, 0x01]);
    }

    #[test]
    fn test_interval_out_of_range() {
        let b = CommandClassBinding::new(CLASS_WAKE_UP, false);
        assert!(WakeUp
            .encode_command(
                9,
                &b,
                &Verb::WakeUpIntervalSet {
                    seconds: MAX_WAKEUP_INTERVAL + 1,
                    target: 1,
                },
            )
            .is_err());
    }

    #[test]
    fn test_interval_report() {
        let b = CommandClassBinding::new(CLASS_WAKE_UP, false);
        let update = WakeUp
            .decode_report(9, &b, &[0x84, 0x06, 0x00, 0x0E, 0x10, 0x01])
            .expect("should decode");
        assert_eq!(update.values, vec![(0, FieldValue::Integer(3600))]);
        assert_eq!(
            update.event,
            Some(ClassEvent::WakeUpInterval {
                seconds: 3600,
                target: 1
            })
        );
    }

    #[test]
    fn test_notification() {
        let b = CommandClassBinding::new(CLASS_WAKE_UP, false);
        let update = WakeUp.decode_report(9, &b, &[0x84, 0x07]).expect("should decode");
        assert_eq!(update.event, Some(ClassEvent::WakeUpNotification));
        assert!(WakeUp.sleeping());
    }
}
