//! Association groups.

use meshgate_protocol::{DATA_CAPACITY, MAX_UNIT_ID};

use crate::class::*;
use crate::error::{ClassError, ClassResult};

const SET: u8 = 0x01;
const GET: u8 = 0x02;
const REPORT: u8 = 0x03;
const REMOVE: u8 = 0x04;

/// Targets that fit after the class, command and group bytes.
const MAX_TARGETS: usize = DATA_CAPACITY - 3;

/// Association group membership.
///
/// Reports are `[group][max targets][reports to follow][targets...]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Association;

impl Association {
    fn check_targets(group: u8, targets: &[UnitId]) -> ClassResult<()> {
        if group == 0 {
            return Err(ClassError::invalid("association group 0"));
        }
        if targets.len() > MAX_TARGETS {
            return Err(ClassError::invalid(format!(
                "{} targets exceed the {} that fit in one command",
                targets.len(),
                MAX_TARGETS
            )));
        }
        if let Some(bad) = targets.iter().find(|t| **t == 0 || **t > MAX_UNIT_ID) {
            return Err(ClassError::invalid(format!("target unit {} out of range", bad)));
        }
        Ok(())
    }
}

impl CommandClass for Association {
    fn id(&self) -> ClassId {
        CLASS_ASSOCIATION
    }

    fn name(&self) -> &'static str {
        "association"
    }

    fn supports(&self, verb: &Verb) -> bool {
        matches!(
            verb,
            Verb::AssociationAdd { .. } | Verb::AssociationRemove { .. } | Verb::AssociationGet { .. }
        )
    }

    fn encode_command(
        &self,
        _unit: UnitId,
        _binding: &CommandClassBinding,
        verb: &Verb,
    ) -> ClassResult<ClassCommand> {
        match verb {
            Verb::AssociationAdd { group, targets } => {
                if targets.is_empty() {
                    return Err(ClassError::invalid("association add without targets"));
                }
                Self::check_targets(*group, targets)?;
                let mut payload = vec![self.id(), SET, *group];
                payload.extend_from_slice(targets);
                Ok(ClassCommand::new(payload))
            }
            Verb::AssociationRemove { group, targets } => {
                Self::check_targets(*group, targets)?;
                let mut payload = vec![self.id(), REMOVE, *group];
                payload.extend_from_slice(targets);
                Ok(ClassCommand::new(payload))
            }
            Verb::AssociationGet { group } => {
                Self::check_targets(*group, &[])?;
                Ok(ClassCommand::with_reply(
                    vec![self.id(), GET, *group],
                    self.id(),
                    REPORT,
                ))
            }
            other => Err(self.unsupported(other)),
        }
    }

    fn decode_report(
        &self,
        unit: UnitId,
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
        ClassError::check_len(self.name(), args, 3)?;
        if args[2] > 0 {
            tracing::debug!(
                "unit {} group {}: {} follow-up reports not merged",
                unit,
                args[0],
                args[2]
            );
        }
        let mut group = AssociationGroup::new(args[0]);
        for target in &args[3..] {
            group.add(*target);
        }
        Ok(Update::event(ClassEvent::Association(group)))
    }
}
