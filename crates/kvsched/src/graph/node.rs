use std::collections::BTreeSet;

use crate::kv::{
    Dependency, DescriptorError, KvWithMetadata, Metadata, TxnOperation, ValueOrigin, ValueRef,
    ValueState,
};
use crate::scheduler::RetryPolicy;

/// Error of the last failed operation of a node.
#[derive(Debug, Clone)]
pub struct NodeError {
    pub error: DescriptorError,
    pub retriable: bool,
}

/// The last change requested for a node.
#[derive(Debug, Clone)]
pub struct LastUpdate {
    pub txn_seq: u64,
    pub operation: TxnOperation,
    /// Requested value; `None` for deletes.
    pub value: Option<ValueRef>,
    pub revert: bool,
    /// Retry policy inherited from the NB transaction that touched the value.
    pub retry: Option<RetryPolicy>,
}

/// One tracked key-value pair.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) key: String,
    pub(crate) label: String,
    pub(crate) value: Option<ValueRef>,
    pub(crate) metadata: Option<Metadata>,
    pub(crate) state: ValueState,
    pub(crate) descriptor: Option<String>,
    pub(crate) derived_from: Option<String>,
    pub(crate) unavailable: bool,
    pub(crate) error: Option<NodeError>,
    pub(crate) last_update: Option<LastUpdate>,
    pub(super) dependencies: Vec<Dependency>,
    pub(super) derives: BTreeSet<String>,
}

impl Node {
    pub(crate) fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            label: key.to_string(),
            value: None,
            metadata: None,
            state: ValueState::Nonexistent,
            descriptor: None,
            derived_from: None,
            unavailable: false,
            error: None,
            last_update: None,
            dependencies: Vec::new(),
            derives: BTreeSet::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self) -> Option<&ValueRef> {
        self.value.as_ref()
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    pub fn state(&self) -> ValueState {
        self.state
    }

    /// Origin follows from the state: obtained values come from SB, nodes
    /// in any other tracked state were requested from NB.
    pub fn origin(&self) -> ValueOrigin {
        state_to_origin(self.state)
    }

    pub fn descriptor(&self) -> Option<&str> {
        self.descriptor.as_deref()
    }

    pub fn is_derived(&self) -> bool {
        self.derived_from.is_some()
    }

    /// Key of the base value; the node's own key unless derived.
    pub fn base_key(&self) -> &str {
        self.derived_from.as_deref().unwrap_or(&self.key)
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable
    }

    pub fn error(&self) -> Option<&NodeError> {
        self.error.as_ref()
    }

    pub fn error_string(&self) -> Option<String> {
        self.error.as_ref().map(|e| e.error.to_string())
    }

    pub fn last_update(&self) -> Option<&LastUpdate> {
        self.last_update.as_ref()
    }

    pub fn last_operation(&self) -> TxnOperation {
        if self.state == ValueState::Obtained {
            return TxnOperation::Undefined;
        }
        self.last_update
            .as_ref()
            .map_or(TxnOperation::Undefined, |u| u.operation)
    }

    /// Value most recently requested for this node.
    pub fn last_applied_value(&self) -> Option<&ValueRef> {
        self.last_update.as_ref().and_then(|u| u.value.as_ref())
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Keys declared as derived from this node.
    pub fn derived_keys(&self) -> &BTreeSet<String> {
        &self.derives
    }

    pub(crate) fn to_kv_with_metadata(&self) -> Option<KvWithMetadata> {
        let value = self.value.clone()?;
        Some(KvWithMetadata {
            key: self.key.clone(),
            value,
            metadata: self.metadata.clone(),
            origin: self.origin(),
        })
    }
}

pub(crate) fn state_to_origin(state: ValueState) -> ValueOrigin {
    match state {
        ValueState::Nonexistent => ValueOrigin::Unknown,
        ValueState::Obtained => ValueOrigin::FromSb,
        _ => ValueOrigin::FromNb,
    }
}
