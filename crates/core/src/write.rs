//! The `Write`: the atomic unit of change.

use crate::value::{RecordId, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a `Write` adds or removes a value from a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Insert `value` into `(record, key)`'s value-set.
    Add,
    /// Remove `value` from `(record, key)`'s value-set.
    Remove,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => write!(f, "ADD"),
            Action::Remove => write!(f, "REMOVE"),
        }
    }
}

/// `(action, key, value, record, version)` — the atomic unit of change
/// (spec §3). Writes are immutable once accepted by the Buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Write {
    /// Add or remove.
    pub action: Action,
    /// Field name within the record.
    pub key: String,
    /// The value being added or removed.
    pub value: Value,
    /// The record this write applies to.
    pub record: RecordId,
    /// Globally unique, strictly monotonic version timestamp.
    pub version: u64,
}

impl Write {
    /// Build an ADD write.
    pub fn add(key: impl Into<String>, value: Value, record: RecordId, version: u64) -> Self {
        Write {
            action: Action::Add,
            key: key.into(),
            value,
            record,
            version,
        }
    }

    /// Build a REMOVE write.
    pub fn remove(key: impl Into<String>, value: Value, record: RecordId, version: u64) -> Self {
        Write {
            action: Action::Remove,
            key: key.into(),
            value,
            record,
            version,
        }
    }

    /// Human-readable audit line, e.g. `ADD foo AS bar IN 17 AT 12345`.
    pub fn describe(&self) -> String {
        format!(
            "{} {} AS {} IN {} AT {}",
            self.action, self.key, self.value, self.record, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_format() {
        let w = Write::add("name", Value::String("jeff".into()), 17, 100);
        assert_eq!(w.describe(), "ADD name AS jeff IN 17 AT 100");
    }
}
