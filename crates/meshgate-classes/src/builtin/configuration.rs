//! Configuration parameters.

use crate::class::*;
use crate::error::{ClassError, ClassResult};

const SET: u8 = 0x04;
const GET: u8 = 0x05;
const REPORT: u8 = 0x06;

/// Device configuration parameters.
///
/// Parameters are exposed through the driver command channel rather than as
/// fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Configuration;

impl CommandClass for Configuration {
    fn id(&self) -> ClassId {
        CLASS_CONFIGURATION
    }

    fn name(&self) -> &'static str {
        "configuration"
    }

    fn supports(&self, verb: &Verb) -> bool {
        matches!(verb, Verb::ConfigSet(_) | Verb::ConfigGet { .. })
    }

    fn encode_command(
        &self,
        _unit: UnitId,
        _binding: &CommandClassBinding,
        verb: &Verb,
    ) -> ClassResult<ClassCommand> {
        match verb {
            Verb::ConfigSet(param) => {
                // Re-validate; the struct fields are public.
                let param = ConfigParameter::new(param.number, param.width, param.value as i64)?;
                let mut payload = vec![self.id(), SET, param.number, param.width];
                payload.extend(param.value_bytes());
                Ok(ClassCommand::new(payload))
            }
            Verb::ConfigGet { parameter } => Ok(ClassCommand::with_reply(
                vec![self.id(), GET, *parameter],
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
        let number = args[0];
        let width = (args[1] & 0x07) as usize;
        ClassError::check_len(self.name(), args, 2 + width)?;
        let param = ConfigParameter::from_bytes(number, &args[2..2 + width])?;
        Ok(Update::event(ClassEvent::ConfigParameter(param)))
    }
}
