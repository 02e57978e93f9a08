use chrono::{DateTime, Utc};
use serde::Serialize;

use super::node::Node;
use super::GraphState;
use crate::kv::value::serialize_value;
use crate::kv::{format_value, ValueOrigin, ValueRef, ValueState};

/// Targets of one dependency label at the time of recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedTarget {
    pub label: String,
    pub keys: Vec<String>,
}

/// One revision of a node, valid from `since` until `until` (open-ended
/// for the current revision).
#[derive(Debug, Clone, Serialize)]
pub struct RecordedNode {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
    pub key: String,
    pub label: String,
    #[serde(serialize_with = "serialize_value")]
    pub value: Option<ValueRef>,
    pub state: ValueState,
    pub origin: ValueOrigin,
    pub descriptor: Option<String>,
    pub derived_from: Option<String>,
    pub unavailable: bool,
    pub error: Option<String>,
    pub last_update: Option<String>,
    pub has_metadata: bool,
    pub targets: Vec<RecordedTarget>,
    pub derives: Vec<String>,
}

impl RecordedNode {
    pub(crate) fn capture(state: &GraphState, node: &Node, since: DateTime<Utc>) -> Self {
        let targets = state
            .dependency_targets(node.key())
            .into_iter()
            .map(|(label, keys)| RecordedTarget { label, keys })
            .collect();
        let last_update = node.last_update().map(|u| {
            let mut summary = format!("TXN-{} {}", u.txn_seq, u.operation);
            if u.revert {
                summary.push_str(" (revert)");
            }
            if u.retry.is_some() {
                summary.push_str(" (with-retry)");
            }
            summary
        });
        Self {
            since,
            until: None,
            key: node.key().to_string(),
            label: node.label().to_string(),
            value: node.value().cloned(),
            state: node.state(),
            origin: node.origin(),
            descriptor: node.descriptor().map(str::to_string),
            derived_from: node.derived_from.clone(),
            unavailable: !node.is_available(),
            error: node.error_string(),
            last_update,
            has_metadata: node.metadata().is_some(),
            targets,
            derives: node.derived_keys().iter().cloned().collect(),
        }
    }

    /// Compares everything except the validity window.
    pub(crate) fn same_revision(&self, other: &RecordedNode) -> bool {
        self.label == other.label
            && format_value(self.value.as_ref()) == format_value(other.value.as_ref())
            && self.state == other.state
            && self.descriptor == other.descriptor
            && self.derived_from == other.derived_from
            && self.unavailable == other.unavailable
            && self.error == other.error
            && self.last_update == other.last_update
            && self.has_metadata == other.has_metadata
            && self.targets == other.targets
            && self.derives == other.derives
    }

    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.since <= at && self.until.map_or(true, |until| at < until)
    }
}
