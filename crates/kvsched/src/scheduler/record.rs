//! Transaction records and the in-memory transaction history.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Serialize, Serializer};

use super::txn::{ResyncType, TxnType};
use crate::kv::value::serialize_value;
use crate::kv::{format_value, DescriptorError, TxnOperation, ValueOrigin, ValueRef, ValueState};

/// One operation planned or executed by a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedTxnOp {
    pub operation: TxnOperation,
    pub key: String,
    #[serde(serialize_with = "serialize_value")]
    pub prev_value: Option<ValueRef>,
    #[serde(serialize_with = "serialize_value")]
    pub new_value: Option<ValueRef>,
    pub prev_state: ValueState,
    pub new_state: ValueState,
    #[serde(serialize_with = "serialize_error")]
    pub prev_err: Option<DescriptorError>,
    #[serde(serialize_with = "serialize_error")]
    pub new_err: Option<DescriptorError>,
    pub noop: bool,
    pub is_derived: bool,
    pub is_property: bool,
    pub is_revert: bool,
    pub is_retry: bool,
    pub is_recreate: bool,
}

impl RecordedTxnOp {
    /// Flags summarizing the operation and the state transition it caused.
    pub fn flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        let (prev, new) = (self.prev_state, self.new_state);

        if self.is_derived && !self.is_property {
            flags.push("DERIVED");
        }
        if self.is_property {
            flags.push("PROPERTY");
        }
        if self.noop {
            flags.push("NOOP");
        }
        if self.is_revert && !self.is_property {
            flags.push("REVERT");
        }
        if self.is_retry && !self.is_property {
            flags.push("RETRY");
        }
        if self.is_recreate {
            flags.push("RECREATE");
        }

        if new == ValueState::Obtained {
            flags.push("OBTAINED");
        }
        if prev == ValueState::Obtained && prev != new {
            flags.push("WAS-OBTAINED");
        }
        if new == ValueState::Unimplemented {
            flags.push("UNIMPLEMENTED");
        }
        if prev == ValueState::Unimplemented && prev != new {
            flags.push("WAS-UNIMPLEMENTED");
        }
        if prev == ValueState::Removed && self.operation == TxnOperation::Delete {
            flags.push("ALREADY-REMOVED");
        }
        if prev == ValueState::Missing {
            if new == ValueState::Removed {
                flags.push("ALREADY-MISSING");
            } else {
                flags.push("WAS-MISSING");
            }
        }
        if prev == ValueState::Discovered {
            flags.push("DISCOVERED");
        }
        match (prev == ValueState::Pending, new == ValueState::Pending) {
            (true, true) => flags.push("STILL-PENDING"),
            (true, false) => flags.push("WAS-PENDING"),
            (false, true) => flags.push("IS-PENDING"),
            (false, false) => {}
        }
        if prev == ValueState::Failed {
            if new == ValueState::Failed {
                flags.push("STILL-FAILING");
            } else if new == ValueState::Configured {
                flags.push("FIXED");
            }
        } else if new == ValueState::Failed {
            flags.push("FAILED");
        }
        if prev == ValueState::Invalid {
            if new == ValueState::Invalid {
                flags.push("STILL-INVALID");
            } else if new == ValueState::Configured {
                flags.push("FIXED");
            }
        } else if new == ValueState::Invalid {
            flags.push("INVALID");
        }
        flags
    }

    fn write_to(&self, out: &mut String, index: usize, indent: usize) {
        let pad = " ".repeat(indent);
        let pad2 = " ".repeat(indent + 4);
        let flags = self.flags();
        if flags.is_empty() {
            let _ = writeln!(out, "{}{}. {}:", pad, index, self.operation);
        } else {
            let _ = writeln!(out, "{}{}. {} [{}]:", pad, index, self.operation, flags.join(" "));
        }
        let _ = writeln!(out, "{}- key: {}", pad2, self.key);
        match self.operation {
            TxnOperation::Update => {
                let _ = writeln!(out, "{}- prev-value: {}", pad2, format_value(self.prev_value.as_ref()));
                let _ = writeln!(out, "{}- new-value: {}", pad2, format_value(self.new_value.as_ref()));
            }
            TxnOperation::Delete => {
                let _ = writeln!(out, "{}- value: {}", pad2, format_value(self.prev_value.as_ref()));
            }
            TxnOperation::Create => {
                let _ = writeln!(out, "{}- value: {}", pad2, format_value(self.new_value.as_ref()));
            }
            _ => {}
        }
        if let Some(err) = &self.prev_err {
            let _ = writeln!(out, "{}- prev-error: {}", pad2, err);
        }
        if let Some(err) = &self.new_err {
            let _ = writeln!(out, "{}- error: {}", pad2, err);
        }
    }
}

fn serialize_error<S: Serializer>(
    err: &Option<DescriptorError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match err {
        Some(err) => serializer.serialize_some(&err.to_string()),
        None => serializer.serialize_none(),
    }
}

/// A value as submitted to a transaction.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedKvPair {
    pub key: String,
    #[serde(serialize_with = "serialize_value")]
    pub value: Option<ValueRef>,
    pub origin: ValueOrigin,
}

/// A finalized transaction.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedTxn {
    pub seq_num: u64,
    pub txn_type: TxnType,
    pub resync_type: ResyncType,
    pub description: Option<String>,
    pub retry_for_txn: Option<u64>,
    pub retry_attempt: u32,
    pub with_simulation: bool,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    /// Sorted by key. Empty for downstream resync.
    pub values: Vec<RecordedKvPair>,
    pub planned: Vec<RecordedTxnOp>,
    pub executed: Vec<RecordedTxnOp>,
}

impl RecordedTxn {
    /// Renders the header and submitted values, without operations.
    pub fn arguments_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "* transaction arguments:");
        let _ = writeln!(out, "    - seq-num: {}", self.seq_num);
        match (self.txn_type, self.retry_for_txn) {
            (TxnType::NbTransaction, _) if self.resync_type != ResyncType::NotResync => {
                let _ = writeln!(out, "    - type: {}, {}", self.txn_type, self.resync_type);
            }
            (TxnType::RetryFailedOps, Some(retry_for)) => {
                let _ = writeln!(
                    out,
                    "    - type: {} (for txn {}, attempt #{})",
                    self.txn_type, retry_for, self.retry_attempt
                );
            }
            _ => {
                let _ = writeln!(out, "    - type: {}", self.txn_type);
            }
        }
        if let Some(description) = &self.description {
            for (i, line) in description.lines().enumerate() {
                if i == 0 {
                    let _ = writeln!(out, "    - description: {}", line);
                } else {
                    let _ = writeln!(out, "        {}", line);
                }
            }
        }
        if self.resync_type != ResyncType::DownstreamResync {
            if self.values.is_empty() {
                let _ = writeln!(out, "    - values: NONE");
            } else {
                let _ = writeln!(out, "    - values:");
            }
            for kv in &self.values {
                // SB values are implied by a resync
                if self.resync_type != ResyncType::NotResync && kv.origin == ValueOrigin::FromSb {
                    continue;
                }
                let _ = writeln!(out, "        - key: {}", kv.key);
                let _ = writeln!(out, "          val: {}", format_value(kv.value.as_ref()));
            }
        }
        if self.with_simulation {
            let _ = writeln!(out, "* planned operations:");
            write_ops(&mut out, &self.planned);
        }
        out
    }
}

fn write_ops(out: &mut String, ops: &[RecordedTxnOp]) {
    if ops.is_empty() {
        let _ = writeln!(out, "    <NONE>");
    }
    for (i, op) in ops.iter().enumerate() {
        op.write_to(out, i + 1, 4);
    }
}

impl fmt::Display for RecordedTxn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = self.arguments_string();
        let duration = self.stop - self.start;
        let _ = writeln!(
            out,
            "* executed operations ({} -> {}, dur: {}ms):",
            self.start.format("%H:%M:%S%.3f"),
            self.stop.format("%H:%M:%S%.3f"),
            duration.num_milliseconds()
        );
        write_ops(&mut out, &self.executed);
        f.write_str(&out)
    }
}

/// Finalized transactions, oldest first.
pub(crate) struct TxnHistory {
    records: VecDeque<RecordedTxn>,
    started: DateTime<Utc>,
    age_limit: ChronoDuration,
    init_period: ChronoDuration,
}

impl TxnHistory {
    pub fn new(started: DateTime<Utc>, age_limit_mins: u64, init_period_mins: u64) -> Self {
        Self {
            records: VecDeque::new(),
            started,
            age_limit: minutes(age_limit_mins),
            init_period: minutes(init_period_mins),
        }
    }

    pub fn push(&mut self, record: RecordedTxn) {
        self.records.push_back(record);
    }

    pub fn by_seq(&self, seq_num: u64) -> Option<&RecordedTxn> {
        self.records.iter().find(|r| r.seq_num == seq_num)
    }

    /// Transactions that started inside `[since, until]`; open bounds
    /// default to the whole history.
    pub fn window(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<RecordedTxn> {
        self.records
            .iter()
            .filter(|r| since.map_or(true, |since| r.start >= since))
            .filter(|r| until.map_or(true, |until| r.start <= until))
            .cloned()
            .collect()
    }

    /// Drops records older than the age limit, except those that started
    /// within the init period. Returns the number of dropped records.
    pub fn trim(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.age_limit;
        let init_end = self.started + self.init_period;
        let before = self.records.len();
        self.records
            .retain(|r| r.start >= cutoff || r.start <= init_end);
        before - self.records.len()
    }

    /// Oldest point in time still covered by kept records.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.age_limit
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Limits are capped at 100 years.
fn minutes(mins: u64) -> ChronoDuration {
    const MAX_MINS: u64 = 100 * 365 * 24 * 60;
    ChronoDuration::minutes(mins.min(MAX_MINS) as i64)
}
