//! Association group management.
//!
//! Every operation is a transaction on the unit's association class. Changes
//! for sleeping units are queued until the unit wakes; queries always go to
//! the device.

use meshgate_classes::{UnitId, Verb, CLASS_ASSOCIATION};
use meshgate_protocol::Transport;
use tracing::debug;

use crate::engine::{Delivery, EngineContext};
use crate::error::EngineResult;

/// Association operations over an engine context.
pub struct AssociationManager<'a, T: Transport> {
    ctx: &'a EngineContext<T>,
}

impl<'a, T: Transport> AssociationManager<'a, T> {
    /// Manager borrowing `ctx`.
    pub fn new(ctx: &'a EngineContext<T>) -> Self {
        AssociationManager { ctx }
    }

    /// Add `targets` to group `group` of `src`.
    pub fn add(&self, src: UnitId, group: u8, targets: &[UnitId]) -> EngineResult<Delivery> {
        let verb = Verb::AssociationAdd {
            group,
            targets: targets.to_vec(),
        };
        self.ctx.dispatch(src, CLASS_ASSOCIATION, 1, verb, true)
    }

    /// Remove `targets` from group `group` of `src`.
    pub fn remove(&self, src: UnitId, group: u8, targets: &[UnitId]) -> EngineResult<Delivery> {
        if targets.is_empty() {
            return self.remove_all(src, group);
        }
        let verb = Verb::AssociationRemove {
            group,
            targets: targets.to_vec(),
        };
        self.ctx.dispatch(src, CLASS_ASSOCIATION, 1, verb, true)
    }

    /// Clear group `group` of `src`.
    pub fn remove_all(&self, src: UnitId, group: u8) -> EngineResult<Delivery> {
        let verb = Verb::AssociationRemove {
            group,
            targets: Vec::new(),
        };
        self.ctx.dispatch(src, CLASS_ASSOCIATION, 1, verb, true)
    }

    /// Read group `group` back from `src` and return its targets.
    pub fn query(&self, src: UnitId, group: u8) -> EngineResult<Vec<UnitId>> {
        self.ctx
            .dispatch(src, CLASS_ASSOCIATION, 1, Verb::AssociationGet { group }, false)?;
        let targets = self.cached(src, group)?.unwrap_or_default();
        debug!("unit {} group {}: {:?}", src, group, targets);
        Ok(targets)
    }

    /// Targets last known for a group, without a transaction.
    pub fn cached(&self, src: UnitId, group: u8) -> EngineResult<Option<Vec<UnitId>>> {
        self.ctx.with_unit(src, |unit| {
            unit.associations.get(&group).map(|g| g.targets.clone())
        })
    }
}
