//! Deferred commands for sleeping units.
//!
//! Each sleeping unit has a FIFO. The engine delivers the head entry, pops it
//! on success and stops on the first failure; the failing entry stays at the
//! head with its retry count bumped until it exceeds the retry limit. A full
//! queue drops its oldest entry to make room.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use meshgate_classes::{ClassCommand, ClassId, UnitId, Verb};
use meshgate_metrics::{metric_defs, UnitLabels};
use tracing::{debug, warn};

/// A command waiting for its unit to wake.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCommand {
    /// Target unit.
    pub unit: UnitId,
    /// Target class.
    pub class: ClassId,
    /// Target instance.
    pub instance: u8,
    /// Host intent, applied to the directory once delivered.
    pub verb: Verb,
    /// Encoded payload.
    pub command: ClassCommand,
    /// When the command was queued.
    pub enqueued_at: Instant,
    /// Failed delivery attempts.
    pub retries: u32,
    /// Held until the unit wakes.
    pub deferred: bool,
}

impl QueuedCommand {
    /// Queue entry for a sleeping unit.
    pub fn new(unit: UnitId, class: ClassId, instance: u8, verb: Verb, command: ClassCommand) -> Self {
        QueuedCommand {
            unit,
            class,
            instance,
            verb,
            command,
            enqueued_at: Instant::now(),
            retries: 0,
            deferred: true,
        }
    }
}

/// Per-unit FIFOs.
#[derive(Debug, Clone)]
pub struct WakeUpQueue {
    queues: BTreeMap<UnitId, VecDeque<QueuedCommand>>,
    cap: usize,
    max_retries: u32,
}

impl WakeUpQueue {
    /// Create queues holding at most `cap` entries per unit.
    pub fn new(cap: usize, max_retries: u32) -> Self {
        WakeUpQueue {
            queues: BTreeMap::new(),
            cap: cap.max(1),
            max_retries,
        }
    }

    fn report_depth(&self, unit: UnitId) {
        metrics::gauge!(
            metric_defs::WAKEUP_QUEUE_DEPTH.name,
            &UnitLabels::new(unit).to_labels()
        )
        .set(self.len(unit) as f64);
    }

    fn report_drop(unit: UnitId, reason: &'static str) {
        metrics::counter!(
            metric_defs::WAKEUP_DROPPED.name,
            &UnitLabels::new(unit).with(&[("reason", reason.to_string())])
        )
        .increment(1);
    }

    /// Append a command. Returns the entry dropped to make room, if any.
    pub fn push(&mut self, command: QueuedCommand) -> Option<QueuedCommand> {
        let unit = command.unit;
        let queue = self.queues.entry(unit).or_default();
        let dropped = if queue.len() >= self.cap {
            queue.pop_front()
        } else {
            None
        };
        if let Some(old) = &dropped {
            warn!(
                "unit {}: wake-up queue full ({}), dropping oldest {} command",
                unit,
                self.cap,
                old.verb
            );
            Self::report_drop(unit, "overflow");
        }
        debug!("unit {}: queued {} for wake-up", unit, command.verb);
        queue.push_back(command);
        self.report_depth(unit);
        dropped
    }

    /// Head entry for a unit.
    pub fn front(&self, unit: UnitId) -> Option<&QueuedCommand> {
        self.queues.get(&unit).and_then(|q| q.front())
    }

    /// Remove the head entry after successful delivery.
    pub fn pop_front(&mut self, unit: UnitId) -> Option<QueuedCommand> {
        let popped = self.queues.get_mut(&unit).and_then(|q| q.pop_front());
        self.report_depth(unit);
        popped
    }

    /// Count a failed delivery of the head entry.
    ///
    /// Returns the entry if it ran out of retries and was dropped.
    pub fn record_failure(&mut self, unit: UnitId) -> Option<QueuedCommand> {
        let queue = self.queues.get_mut(&unit)?;
        let head = queue.front_mut()?;
        head.retries += 1;
        if head.retries <= self.max_retries {
            return None;
        }
        let dropped = queue.pop_front();
        if let Some(cmd) = &dropped {
            warn!(
                "unit {}: dropping {} after {} failed deliveries",
                unit, cmd.verb, cmd.retries
            );
            Self::report_drop(unit, "retries");
        }
        self.report_depth(unit);
        dropped
    }

    /// Entries waiting for a unit.
    pub fn len(&self, unit: UnitId) -> usize {
        self.queues.get(&unit).map_or(0, |q| q.len())
    }

    /// Whether a unit has nothing queued.
    pub fn is_empty(&self, unit: UnitId) -> bool {
        self.len(unit) == 0
    }

    /// Entries across all units.
    pub fn total(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }

    /// Copy of a unit's queue, head first.
    pub fn pending(&self, unit: UnitId) -> Vec<QueuedCommand> {
        self.queues
            .get(&unit)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Discard a unit's queue.
    pub fn clear(&mut self, unit: UnitId) -> usize {
        let removed = self.queues.remove(&unit).map_or(0, |q| q.len());
        if removed > 0 {
            self.report_depth(unit);
        }
        removed
    }

    /// Keep only queues of units for which `keep` returns true.
    pub fn retain_units(&mut self, mut keep: impl FnMut(UnitId) -> bool) {
        self.queues.retain(|unit, _| keep(*unit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshgate_classes::{FieldValue, CLASS_BINARY_SWITCH};

    fn command(unit: UnitId, level: u8) -> QueuedCommand {
        QueuedCommand::new(
            unit,
            CLASS_BINARY_SWITCH,
            1,
            Verb::Set {
                sub: 0,
                value: FieldValue::Integer(level as i64),
            },
            ClassCommand::new(vec![0x25, 0x01, level]),
        )
    }

    #[test]
    fn test_fifo_order() {
        let mut queue = WakeUpQueue::new(8, 3);
        for level in [1, 2, 3] {
            assert!(queue.push(command(7, level)).is_none());
        }
        let order: Vec<u8> = std::iter::from_fn(|| queue.pop_front(7))
            .map(|c| c.command.payload[2])
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut queue = WakeUpQueue::new(2, 3);
        queue.push(command(7, 1));
        queue.push(command(7, 2));
        let dropped = queue.push(command(7, 3)).expect("oldest should drop");
        assert_eq!(dropped.command.payload[2], 1);
        assert_eq!(queue.len(7), 2);
        assert_eq!(queue.front(7).unwrap().command.payload[2], 2);
    }

    #[test]
    fn test_retry_limit() {
        let mut queue = WakeUpQueue::new(4, 2);
        queue.push(command(7, 1));
        queue.push(command(7, 2));
        assert!(queue.record_failure(7).is_none());
        assert!(queue.record_failure(7).is_none());
        assert_eq!(queue.front(7).unwrap().retries, 2);
        let dropped = queue.record_failure(7).expect("should drop after limit");
        assert_eq!(dropped.command.payload[2], 1);
        assert_eq!(queue.front(7).unwrap().command.payload[2], 2);
    }

    #[test]
    fn test_queues_are_per_unit() {
        let mut queue = WakeUpQueue::new(1, 0);
        queue.push(command(7, 1));
        assert!(queue.push(command(8, 1)).is_none());
        assert_eq!(queue.total(), 2);
        assert_eq!(queue.clear(7), 1);
        assert!(queue.is_empty(7));
        assert_eq!(queue.len(8), 1);
    }
}
