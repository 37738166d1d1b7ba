//! Field value types.
//!
//! This module provides:
//! - [`FieldValue`] - The dynamic value carried by a field
//! - [`FieldKind`] - The declared type of a field
//! - [`Access`] - Whether the host may read and/or write a field

use serde::{Deserialize, Serialize};

// ============================================================================
// Field Value
// ============================================================================

/// The value a field can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value (levels, counts).
    Integer(i64),
    /// Floating point value (sensor readings).
    Float(f64),
    /// Text value.
    Text(String),
    /// No value known yet.
    Null,
}

impl FieldValue {
    /// Convert to i64 if possible.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Bool(v) => Some(i64::from(*v)),
            FieldValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    /// Convert to f64 if possible.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Convert to bool if possible. Non-zero integers are true.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Borrow the text, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Check if the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl std::fmt::Display for FieldValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Integer(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "{}", v),
            FieldValue::Null => write!(f, "null"),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<u8> for FieldValue {
    fn from(v: u8) -> Self {
        FieldValue::Integer(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

// ============================================================================
// Field Kind
// ============================================================================

/// The declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    /// On/off.
    Bool,
    /// Dimmer-style level, 0..=99.
    Level,
    /// Non-negative integer.
    Count,
    /// Scaled reading.
    Float,
    /// Free text.
    Text,
}

impl FieldKind {
    /// Coerce `value` into this kind, if it is representable.
    pub fn coerce(&self, value: &FieldValue) -> Option<FieldValue> {
        match self {
            FieldKind::Bool => value.as_bool().map(FieldValue::Bool),
            FieldKind::Level => value
                .as_i64()
                .filter(|v| (0..=99).contains(v))
                .map(FieldValue::Integer),
            FieldKind::Count => value
                .as_i64()
                .filter(|v| *v >= 0)
                .map(FieldValue::Integer),
            FieldKind::Float => value.as_f64().map(FieldValue::Float),
            FieldKind::Text => value.as_str().map(|s| FieldValue::Text(s.to_string())),
        }
    }

    /// Parse a textual value into this kind.
    pub fn parse(&self, text: &str) -> Option<FieldValue> {
        let text = text.trim();
        match self {
            FieldKind::Bool => match text.to_ascii_lowercase().as_str() {
                "1" | "on" | "true" => Some(FieldValue::Bool(true)),
                "0" | "off" | "false" => Some(FieldValue::Bool(false)),
                _ => None,
            },
            FieldKind::Level | FieldKind::Count => text
                .parse::<i64>()
                .ok()
                .and_then(|v| self.coerce(&FieldValue::Integer(v))),
            FieldKind::Float => text.parse::<f64>().ok().map(FieldValue::Float),
            FieldKind::Text => Some(FieldValue::Text(text.to_string())),
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Bool => write!(f, "bool"),
            FieldKind::Level => write!(f, "level"),
            FieldKind::Count => write!(f, "count"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Text => write!(f, "text"),
        }
    }
}

// ============================================================================
// Access
// ============================================================================

/// Host access to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Value reported by the device only.
    ReadOnly,
    /// Command-only field; reads return nothing meaningful.
    WriteOnly,
    /// Reported and commandable.
    ReadWrite,
}

impl Access {
    /// Whether the host may write this field.
    pub fn is_writable(&self) -> bool {
        matches!(self, Access::WriteOnly | Access::ReadWrite)
    }

    /// Whether the field carries a readable value.
    pub fn is_readable(&self) -> bool {
        matches!(self, Access::ReadOnly | Access::ReadWrite)
    }
}
