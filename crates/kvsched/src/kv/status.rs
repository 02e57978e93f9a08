use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a tracked value.
///
/// The numeric codes are stable and used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValueState {
    /// Not tracked.
    #[default]
    Nonexistent,
    /// Was configured, but resync found it absent from the southbound.
    Missing,
    /// Desired, but no descriptor claims the key.
    Unimplemented,
    /// Transient state of a deleted or re-created value.
    Removed,
    /// Desired and applied.
    Configured,
    /// Present in the southbound without being desired.
    Obtained,
    /// Desired and found already present during resync.
    Discovered,
    /// Desired, blocked on unmet dependencies.
    Pending,
    /// Desired, rejected by validation.
    Invalid,
    /// Last operation failed and will not be retried.
    Failed,
    /// Last operation failed and a retry is scheduled.
    Retrying,
}

impl ValueState {
    pub fn code(self) -> i32 {
        match self {
            ValueState::Nonexistent => 0,
            ValueState::Missing => 1,
            ValueState::Unimplemented => 2,
            ValueState::Removed => 3,
            ValueState::Configured => 4,
            ValueState::Obtained => 5,
            ValueState::Discovered => 6,
            ValueState::Pending => 7,
            ValueState::Invalid => 8,
            ValueState::Failed => 9,
            ValueState::Retrying => 10,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let state = match code {
            0 => ValueState::Nonexistent,
            1 => ValueState::Missing,
            2 => ValueState::Unimplemented,
            3 => ValueState::Removed,
            4 => ValueState::Configured,
            5 => ValueState::Obtained,
            6 => ValueState::Discovered,
            7 => ValueState::Pending,
            8 => ValueState::Invalid,
            9 => ValueState::Failed,
            10 => ValueState::Retrying,
            _ => return None,
        };
        Some(state)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueState::Nonexistent => "NONEXISTENT",
            ValueState::Missing => "MISSING",
            ValueState::Unimplemented => "UNIMPLEMENTED",
            ValueState::Removed => "REMOVED",
            ValueState::Configured => "CONFIGURED",
            ValueState::Obtained => "OBTAINED",
            ValueState::Discovered => "DISCOVERED",
            ValueState::Pending => "PENDING",
            ValueState::Invalid => "INVALID",
            ValueState::Failed => "FAILED",
            ValueState::Retrying => "RETRYING",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ValueState::Failed | ValueState::Retrying)
    }
}

impl fmt::Display for ValueState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation executed (or attempted) for a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnOperation {
    #[default]
    Undefined,
    Validate,
    Create,
    Update,
    Delete,
}

impl TxnOperation {
    pub fn code(self) -> i32 {
        match self {
            TxnOperation::Undefined => 0,
            TxnOperation::Validate => 1,
            TxnOperation::Create => 2,
            TxnOperation::Update => 3,
            TxnOperation::Delete => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxnOperation::Undefined => "UNDEFINED",
            TxnOperation::Validate => "VALIDATE",
            TxnOperation::Create => "CREATE",
            TxnOperation::Update => "UPDATE",
            TxnOperation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for TxnOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValueStatus {
    pub key: String,
    pub state: ValueState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub last_operation: TxnOperation,
    /// Invalid fields for INVALID values, unsatisfied dependency labels for
    /// PENDING values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl ValueStatus {
    pub fn nonexistent(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Status of a base value bundled with the statuses of its derived values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseValueStatus {
    pub value: ValueStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub derived_values: Vec<ValueStatus>,
}

impl BaseValueStatus {
    pub fn key(&self) -> &str {
        &self.value.key
    }

    pub fn state(&self) -> ValueState {
        self.value.state
    }

    pub fn derived(&self, key: &str) -> Option<&ValueStatus> {
        self.derived_values.iter().find(|s| s.key == key)
    }
}
