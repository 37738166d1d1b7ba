//! Field binding layer.
//!
//! Maps host-visible field ids to `(unit, class instance, sub-value)` tuples.
//! Ids are derived from the tuple itself, so rebuilding the table after a
//! reconnect or upload yields the same id for the same capability.
//!
//! The table keeps a generation counter. Every real change (value or error
//! flag) stamps the field with a new generation, which lets the host ask for
//! [`FieldTable::changed_since`] instead of diffing the whole table.

use std::collections::BTreeMap;

use meshgate_classes::{
    Access, ClassId, ClassRegistry, CommandClass, FieldKind, FieldValue, UnitId, Update,
};
use serde::Serialize;
use tracing::{debug, trace};

use crate::directory::{Directory, Unit, UnitState};
use crate::error::{EngineError, EngineResult};

/// Host-visible field identifier.
pub type FieldId = u32;

/// Id of the driver command field.
pub const COMMAND_FIELD_ID: FieldId = 0;

/// Name of the driver command field.
pub const COMMAND_FIELD_NAME: &str = "driver.command";

/// Derive a field id from its binding tuple.
pub fn field_id(unit: UnitId, class: ClassId, instance: u8, sub: u8) -> FieldId {
    (unit as u32) << 24 | (class as u32) << 16 | (instance as u32) << 8 | sub as u32
}

/// Split a field id into `(unit, class, instance, sub)`.
pub fn split_field_id(id: FieldId) -> (UnitId, ClassId, u8, u8) {
    let b = id.to_be_bytes();
    (b[0], b[1], b[2], b[3])
}

// ============================================================================
// Field Binding
// ============================================================================

/// One host-visible point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldBinding {
    /// Field id.
    pub id: FieldId,
    /// Owning unit (0 for driver fields).
    pub unit: UnitId,
    /// Owning class.
    pub class: ClassId,
    /// Owning class instance.
    pub instance: u8,
    /// Sub-value index within the instance.
    pub sub: u8,
    /// `<unit name>.<field>`.
    pub name: String,
    /// Declared type.
    pub kind: FieldKind,
    /// Host access.
    pub access: Access,
    /// Last known value.
    pub value: FieldValue,
    /// A value has been received since the field was created.
    pub valid: bool,
    /// The owning unit is failing.
    pub error: bool,
    /// Number of real changes.
    pub changes: u64,
    /// Table generation of the last change.
    #[serde(skip)]
    pub generation: u64,
}

/// A validated host write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTarget {
    /// Target field.
    pub field: FieldId,
    /// Owning unit.
    pub unit: UnitId,
    /// Owning class.
    pub class: ClassId,
    /// Owning instance.
    pub instance: u8,
    /// Sub-value index.
    pub sub: u8,
    /// Value coerced to the field kind.
    pub value: FieldValue,
}

// ============================================================================
// Field Table
// ============================================================================

/// All fields exposed to the host.
#[derive(Debug, Clone)]
pub struct FieldTable {
    fields: BTreeMap<FieldId, FieldBinding>,
    generation: u64,
}

impl Default for FieldTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldTable {
    /// Create a table holding only the driver command field.
    pub fn new() -> Self {
        let mut table = FieldTable {
            fields: BTreeMap::new(),
            generation: 0,
        };
        table.insert_command_field();
        table
    }

    fn insert_command_field(&mut self) {
        self.fields.insert(
            COMMAND_FIELD_ID,
            FieldBinding {
                id: COMMAND_FIELD_ID,
                unit: 0,
                class: 0,
                instance: 0,
                sub: 0,
                name: COMMAND_FIELD_NAME.to_string(),
                kind: FieldKind::Text,
                access: Access::WriteOnly,
                value: FieldValue::Null,
                valid: false,
                error: false,
                changes: 0,
                generation: self.generation,
            },
        );
    }

    fn field_name(unit: &Unit, name: &str, instance: u8) -> String {
        if instance <= 1 {
            format!("{}.{}", unit.name, name)
        } else {
            format!("{}.{}.{}", unit.name, name, instance)
        }
    }

    /// Register the fields of a `Ready` unit. Other units contribute nothing.
    pub fn register(&mut self, unit: &Unit, registry: &ClassRegistry) -> Vec<FieldId> {
        if unit.state != UnitState::Ready {
            return Vec::new();
        }
        let mut ids = Vec::new();
        for binding in &unit.bindings {
            let Some(class) = registry.get(binding.class) else {
                continue;
            };
            for spec in class.fields(binding) {
                let id = field_id(unit.id, binding.class, binding.instance, spec.sub);
                let cached = binding.cached(spec.sub).cloned();
                let field = FieldBinding {
                    id,
                    unit: unit.id,
                    class: binding.class,
                    instance: binding.instance,
                    sub: spec.sub,
                    name: Self::field_name(unit, spec.name, binding.instance),
                    kind: spec.kind,
                    access: spec.access,
                    valid: cached.is_some(),
                    value: cached.unwrap_or(FieldValue::Null),
                    error: unit.in_error,
                    changes: 0,
                    generation: self.generation,
                };
                trace!("field {} -> {}", id, field.name);
                self.fields.insert(id, field);
                ids.push(id);
            }
        }
        ids
    }

    /// Discard every unit field and register the directory's `Ready` units again.
    pub fn rebuild(&mut self, directory: &Directory, registry: &ClassRegistry) -> usize {
        self.generation += 1;
        self.fields.retain(|id, _| *id == COMMAND_FIELD_ID);
        let mut count = 0;
        for unit in directory.iter() {
            count += self.register(unit, registry).len();
        }
        debug!("field table rebuilt: {} unit fields", count);
        count
    }

    /// Validate a host write and resolve its target.
    pub fn resolve_write(&self, id: FieldId, value: &FieldValue) -> EngineResult<WriteTarget> {
        let field = self.fields.get(&id).ok_or(EngineError::UnknownField(id))?;
        if !field.access.is_writable() {
            return Err(EngineError::ReadOnlyField(id));
        }
        let value = field.kind.coerce(value).ok_or_else(|| {
            meshgate_classes::ClassError::invalid(format!(
                "{} is not a valid {} for {}",
                value, field.kind, field.name
            ))
        })?;
        Ok(WriteTarget {
            field: id,
            unit: field.unit,
            class: field.class,
            instance: field.instance,
            sub: field.sub,
            value,
        })
    }

    /// Apply decoded values to a class instance's fields.
    ///
    /// Returns the ids of fields that really changed; `class` decides what
    /// counts as a change.
    pub fn apply_update(
        &mut self,
        unit: UnitId,
        class: &dyn CommandClass,
        instance: u8,
        update: &Update,
    ) -> Vec<FieldId> {
        let mut changed = Vec::new();
        for (sub, value) in &update.values {
            let id = field_id(unit, class.id(), instance, *sub);
            let Some(field) = self.fields.get_mut(&id) else {
                continue;
            };
            let old = field.valid.then_some(&field.value);
            if class.is_value_change(*sub, old, value) {
                self.generation += 1;
                field.value = value.clone();
                field.valid = true;
                field.changes += 1;
                field.generation = self.generation;
                changed.push(id);
            }
        }
        changed
    }

    /// Set or clear the error flag on all of a unit's fields.
    pub fn mark_unit_error(&mut self, unit: UnitId, error: bool) -> Vec<FieldId> {
        let mut changed = Vec::new();
        let mut generation = self.generation;
        for field in self.fields.values_mut().filter(|f| f.unit == unit && f.id != COMMAND_FIELD_ID) {
            if field.error != error {
                generation += 1;
                field.error = error;
                field.changes += 1;
                field.generation = generation;
                changed.push(field.id);
            }
        }
        self.generation = generation;
        changed
    }

    /// Mark a unit's fields as holding no current value.
    pub fn invalidate_unit(&mut self, unit: UnitId) {
        for field in self.fields.values_mut().filter(|f| f.unit == unit && f.id != COMMAND_FIELD_ID) {
            field.valid = false;
        }
    }

    /// Record the last command line written to the command field.
    pub fn record_command(&mut self, line: &str) {
        self.generation += 1;
        let generation = self.generation;
        if let Some(field) = self.fields.get_mut(&COMMAND_FIELD_ID) {
            field.value = FieldValue::Text(line.to_string());
            field.changes += 1;
            field.generation = generation;
        }
    }

    /// Field by id.
    pub fn read(&self, id: FieldId) -> Option<&FieldBinding> {
        self.fields.get(&id)
    }

    /// Field by name.
    pub fn by_name(&self, name: &str) -> Option<&FieldBinding> {
        self.fields.values().find(|f| f.name == name)
    }

    /// Ids of a unit's fields.
    pub fn ids_for_unit(&self, unit: UnitId) -> Vec<FieldId> {
        self.fields
            .values()
            .filter(|f| f.unit == unit && f.id != COMMAND_FIELD_ID)
            .map(|f| f.id)
            .collect()
    }

    /// Copy of every field, in id order.
    pub fn snapshot(&self) -> Vec<FieldBinding> {
        self.fields.values().cloned().collect()
    }

    /// Fields changed after `generation`.
    pub fn changed_since(&self, generation: u64) -> Vec<FieldBinding> {
        self.fields
            .values()
            .filter(|f| f.generation > generation)
            .cloned()
            .collect()
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of fields, the command field included.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether only the command field exists.
    pub fn is_empty(&self) -> bool {
        self.fields.len() <= 1
    }
}
