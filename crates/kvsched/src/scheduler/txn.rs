use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TxnError;
use crate::kv::{BaseValueStatus, Metadata, Value, ValueOrigin, ValueRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TxnType {
    /// Changes requested by a caller.
    NbTransaction,
    /// A value changed spontaneously in the southbound.
    SbNotification,
    /// Re-attempt of previously failed operations.
    RetryFailedOps,
}

impl fmt::Display for TxnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnType::NbTransaction => "NB Transaction",
            TxnType::SbNotification => "SB Notification",
            TxnType::RetryFailedOps => "Retry Failed Operations",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResyncType {
    #[default]
    NotResync,
    /// Refresh from SB, then apply the complete NB state.
    FullResync,
    /// Apply the complete NB state without refreshing SB first.
    UpstreamResync,
    /// Refresh from SB and re-apply the last known NB state.
    DownstreamResync,
}

impl fmt::Display for ResyncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResyncType::NotResync => "Not Resync",
            ResyncType::FullResync => "Full Resync",
            ResyncType::UpstreamResync => "Upstream Resync",
            ResyncType::DownstreamResync => "Downstream Resync",
        };
        f.write_str(s)
    }
}

/// How failed operations are re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub period: Duration,
    /// Retries after the first failure; 0 means unlimited.
    pub max_attempts: u32,
    /// Double the delay for each subsequent retry.
    pub exp_backoff: bool,
}

impl RetryPolicy {
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

/// Options of an NB transaction.
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    pub resync: ResyncType,
    /// Log every retrieved value during refresh.
    pub verbose_refresh: bool,
    /// Keys the downstream refresh is restricted to.
    pub resync_keys: Option<BTreeSet<String>>,
    /// Overrides the configured retry policy.
    pub retry: Option<RetryPolicy>,
    /// Fail without retrying, whatever the policy.
    pub no_retry: bool,
    /// On the first failure, revert already applied values.
    pub revert_on_failure: bool,
    pub description: Option<String>,
    /// Run a dry pass first and record the planned operations.
    pub simulate: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TxnOp {
    pub key: String,
    pub value: Option<ValueRef>,
}

/// A batch of desired changes, applied atomically in dependency order.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub(crate) ops: Vec<TxnOp>,
    pub(crate) options: TxnOptions,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full resync: every NB value not in this transaction is removed.
    pub fn resync(resync: ResyncType) -> Self {
        Self {
            ops: Vec::new(),
            options: TxnOptions {
                resync,
                ..Default::default()
            },
        }
    }

    pub fn put<V: Value>(self, key: impl Into<String>, value: V) -> Self {
        self.put_value(key, Arc::new(value))
    }

    pub fn put_value(mut self, key: impl Into<String>, value: ValueRef) -> Self {
        self.ops.push(TxnOp {
            key: key.into(),
            value: Some(value),
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(TxnOp {
            key: key.into(),
            value: None,
        });
        self
    }

    pub fn with_options(mut self, options: TxnOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.options.retry = Some(policy);
        self
    }

    /// Retriable failures of this transaction go straight to FAILED.
    pub fn without_retry(mut self) -> Self {
        self.options.no_retry = true;
        self
    }

    pub fn with_revert_on_failure(mut self) -> Self {
        self.options.revert_on_failure = true;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.options.description = Some(description.into());
        self
    }

    pub fn with_simulation(mut self) -> Self {
        self.options.simulate = true;
        self
    }

    pub fn with_verbose_refresh(mut self) -> Self {
        self.options.verbose_refresh = true;
        self
    }

    pub fn with_resync_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.resync_keys = Some(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn options(&self) -> &TxnOptions {
        &self.options
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of a processed transaction.
#[derive(Debug, Clone)]
pub struct TxnOutcome {
    pub seq_num: u64,
    /// Final status of every base value named by the transaction.
    pub statuses: Vec<BaseValueStatus>,
    pub error: Option<TxnError>,
}

impl TxnOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self, key: &str) -> Option<&BaseValueStatus> {
        self.statuses.iter().find(|s| s.key() == key)
    }

    pub fn into_result(self) -> Result<Self, TxnError> {
        match self.error.clone() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// One value as processed by a transaction.
#[derive(Debug, Clone)]
pub(crate) struct KvForTxn {
    pub key: String,
    pub value: Option<ValueRef>,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
    pub is_revert: bool,
}

impl KvForTxn {
    pub fn nb(key: impl Into<String>, value: Option<ValueRef>) -> Self {
        Self {
            key: key.into(),
            value,
            metadata: None,
            origin: ValueOrigin::FromNb,
            is_revert: false,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct NbTxn {
    pub resync: ResyncType,
    pub verbose_refresh: bool,
    pub resync_keys: Option<BTreeSet<String>>,
    pub retry: Option<RetryPolicy>,
    pub revert_on_failure: bool,
    pub simulate: bool,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RetryTxn {
    pub txn_seq: u64,
    pub delay: Duration,
    pub attempt: u32,
    /// Base key -> revision (txn seq of the last update) at failure time.
    pub keys: BTreeMap<String, u64>,
}

pub(crate) enum TxnReply {
    Blocking(crossbeam_channel::Sender<TxnOutcome>),
    Async(tokio::sync::oneshot::Sender<TxnOutcome>),
}

impl TxnReply {
    /// Returns false if the caller is no longer waiting.
    pub fn send(self, outcome: TxnOutcome) -> bool {
        match self {
            TxnReply::Blocking(tx) => tx.try_send(outcome).is_ok(),
            TxnReply::Async(tx) => tx.send(outcome).is_ok(),
        }
    }
}

pub(crate) struct QueuedTxn {
    pub seq_num: u64,
    pub txn_type: TxnType,
    pub values: Vec<KvForTxn>,
    pub nb: Option<NbTxn>,
    pub retry: Option<RetryTxn>,
    pub reply: Option<TxnReply>,
}

impl QueuedTxn {
    pub fn nb(values: Vec<KvForTxn>, nb: NbTxn, reply: Option<TxnReply>) -> Self {
        Self {
            seq_num: 0,
            txn_type: TxnType::NbTransaction,
            values,
            nb: Some(nb),
            retry: None,
            reply,
        }
    }

    pub fn sb_notification(kv: KvForTxn) -> Self {
        Self {
            seq_num: 0,
            txn_type: TxnType::SbNotification,
            values: vec![kv],
            nb: None,
            retry: None,
            reply: None,
        }
    }

    pub fn retry(retry: RetryTxn) -> Self {
        Self {
            seq_num: 0,
            txn_type: TxnType::RetryFailedOps,
            values: Vec::new(),
            nb: None,
            retry: Some(retry),
            reply: None,
        }
    }

    pub fn resync_type(&self) -> ResyncType {
        self.nb.as_ref().map_or(ResyncType::NotResync, |nb| nb.resync)
    }

    pub fn revert_on_failure(&self) -> bool {
        self.nb.as_ref().is_some_and(|nb| nb.revert_on_failure)
    }
}

pub(crate) enum QueueItem {
    Txn(Box<QueuedTxn>),
    /// Acknowledged once every earlier item has been processed.
    Barrier(crossbeam_channel::Sender<()>),
}
