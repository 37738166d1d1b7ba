//! Active poll scheduler.
//!
//! Round-robin over `Ready`, non-sleeping units. Each tick walks the cursor
//! forward until a unit accepts; the acceptor yields one request for its
//! stalest pollable binding. A full lap without an acceptor is a no-op tick,
//! so a tick never costs more than one transaction.

use std::time::{Duration, Instant};

use meshgate_classes::{ClassId, ClassRegistry, UnitId, Verb};

use crate::directory::{Directory, Unit, UnitState};

/// One poll the engine should issue.
#[derive(Debug, Clone, PartialEq)]
pub struct PollRequest {
    /// Unit to poll.
    pub unit: UnitId,
    /// Class to poll.
    pub class: ClassId,
    /// Class instance.
    pub instance: u8,
    /// Verb to send.
    pub verb: Verb,
}

/// Round-robin poll cursor.
#[derive(Debug, Clone)]
pub struct PollScheduler {
    cursor: Option<UnitId>,
    interval: Duration,
}

impl PollScheduler {
    /// Create a scheduler; bindings polled within `interval` are left alone.
    pub fn new(interval: Duration) -> Self {
        PollScheduler {
            cursor: None,
            interval,
        }
    }

    /// Unit polled by the last accepted tick.
    pub fn cursor(&self) -> Option<UnitId> {
        self.cursor
    }

    /// Forget the cursor position (after a rebuild).
    pub fn reset(&mut self) {
        self.cursor = None;
    }

    /// Pick the next poll, if any unit wants one.
    pub fn next(
        &mut self,
        directory: &Directory,
        registry: &ClassRegistry,
        now: Instant,
    ) -> Option<PollRequest> {
        let eligible: Vec<&Unit> = directory
            .iter()
            .filter(|u| u.state == UnitState::Ready && !u.is_sleeping(registry))
            .collect();
        if eligible.is_empty() {
            return None;
        }

        let start = match self.cursor {
            Some(last) => eligible.iter().position(|u| u.id > last).unwrap_or(0),
            None => 0,
        };

        for step in 0..eligible.len() {
            let unit = eligible[(start + step) % eligible.len()];
            if let Some(request) = self.wants_poll(unit, registry, now) {
                self.cursor = Some(unit.id);
                return Some(request);
            }
        }
        None
    }

    /// The unit's stalest pollable binding, unless all are fresh.
    fn wants_poll(&self, unit: &Unit, registry: &ClassRegistry, now: Instant) -> Option<PollRequest> {
        unit.bindings
            .iter()
            .filter_map(|binding| {
                let verb = registry.get(binding.class)?.poll_verb()?;
                let stale = match binding.last_poll {
                    None => true,
                    Some(at) => now.saturating_duration_since(at) >= self.interval,
                };
                stale.then_some((binding, verb))
            })
            // Never-polled bindings first, then the oldest.
            .min_by_key(|(binding, _)| binding.last_poll)
            .map(|(binding, verb)| PollRequest {
                unit: unit.id,
                class: binding.class,
                instance: binding.instance,
                verb,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_classes::{
        CommandClassBinding, CLASS_BINARY_SWITCH, CLASS_CONFIGURATION, CLASS_MULTILEVEL_SENSOR,
        CLASS_WAKE_UP,
    };

    fn unit(id: UnitId, classes: &[ClassId]) -> Unit {
        let mut unit = Unit::new(id);
        unit.state = UnitState::Ready;
        for class in classes {
            unit.bindings.push(CommandClassBinding::new(*class, false));
        }
        unit
    }

    #[test]
    fn test_round_robin_order() {
        let registry = ClassRegistry::with_builtin();
        let mut dir = Directory::new();
        dir.insert(unit(2, &[CLASS_BINARY_SWITCH]));
        dir.insert(unit(5, &[CLASS_BINARY_SWITCH]));
        dir.insert(unit(9, &[CLASS_BINARY_SWITCH]));

        let mut scheduler = PollScheduler::new(Duration::ZERO);
        let now = Instant::now();
        let order: Vec<_> = (0..4)
            .map(|_| scheduler.next(&dir, &registry, now).unwrap().unit)
            .collect();
        assert_eq!(order, vec![2, 5, 9, 2]);
    }

    #[test]
    fn test_skips_sleeping_and_not_ready() {
        let registry = ClassRegistry::with_builtin();
        let mut dir = Directory::new();
        dir.insert(unit(2, &[CLASS_BINARY_SWITCH, CLASS_WAKE_UP]));
        let mut failed = unit(3, &[CLASS_BINARY_SWITCH]);
        failed.state = UnitState::Failed;
        dir.insert(failed);
        dir.insert(unit(4, &[CLASS_CONFIGURATION]));

        let mut scheduler = PollScheduler::new(Duration::ZERO);
        assert_eq!(scheduler.next(&dir, &registry, Instant::now()), None);
    }

    #[test]
    fn test_fresh_units_decline() {
        let registry = ClassRegistry::with_builtin();
        let mut dir = Directory::new();
        let now = Instant::now();
        let mut fresh = unit(2, &[CLASS_BINARY_SWITCH]);
        fresh.bindings[0].last_poll = Some(now);
        dir.insert(fresh);
        dir.insert(unit(5, &[CLASS_BINARY_SWITCH]));

        let mut scheduler = PollScheduler::new(Duration::from_secs(60));
        assert_eq!(scheduler.next(&dir, &registry, now).unwrap().unit, 5);

        dir.get_mut(5).unwrap().bindings[0].last_poll = Some(now);
        assert_eq!(scheduler.next(&dir, &registry, now), None);
        // The cursor did not move on a no-op lap.
        assert_eq!(scheduler.cursor(), Some(5));
    }

    #[test]
    fn test_stalest_binding_wins() {
        let registry = ClassRegistry::with_builtin();
        let mut dir = Directory::new();
        let now = Instant::now();
        let mut u = unit(2, &[CLASS_BINARY_SWITCH, CLASS_MULTILEVEL_SENSOR]);
        u.bindings[0].last_poll = Some(now);
        dir.insert(u);

        let mut scheduler = PollScheduler::new(Duration::ZERO);
        let request = scheduler.next(&dir, &registry, now).unwrap();
        assert_eq!(request.class, CLASS_MULTILEVEL_SENSOR);
        assert_eq!(request.verb, Verb::Get);
    }
}
