//! Transaction processing pipeline.
//!
//! Transactions are processed strictly one at a time:
//!
//! 1. pre-processing (sequence number, resync refresh, retry filtering)
//! 2. ordering (deletes first)
//! 3. optional simulation on a throw-away graph writer
//! 4. execution
//! 5. recording into the history
//! 6. post-processing (refresh of failed values, retries, verification,
//!    status notifications, reply to the caller)

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::exec::Executor;
use super::notify::Watchers;
use super::record::{RecordedKvPair, RecordedTxn, RecordedTxnOp, TxnHistory};
use super::refresh::{Refresher, ResyncData};
use super::retry::RetryQueue;
use super::status::value_status;
use super::txn::{KvForTxn, QueuedTxn, ResyncType, RetryTxn, TxnOutcome, TxnType};
use crate::config::SchedulerConfig;
use crate::descriptor::Registry;
use crate::error::{KeyWithError, KvError, TxnError, VerificationError, VerificationErrorKind};
use crate::graph::{Graph, Node};
use crate::kv::{equal_values, BaseValueStatus, ValueOrigin, ValueState};

/// State owned by the transaction processing thread.
#[derive(Default)]
pub(crate) struct Processor {
    next_seq: u64,
    resync_count: u64,
}

/// Scheduler internals shared between the API and the worker threads.
pub(crate) struct Inner {
    pub config: SchedulerConfig,
    pub registry: Registry,
    pub graph: Graph,
    pub history: Mutex<TxnHistory>,
    pub watchers: Watchers,
    pub retries: RetryQueue,
    pub processor: Mutex<Processor>,
}

struct PreProcessed {
    skip_exec: bool,
    skip_simulation: bool,
    /// Record graph changes into node timelines.
    record: bool,
}

impl Inner {
    pub fn new(config: SchedulerConfig) -> Self {
        let history = TxnHistory::new(
            Utc::now(),
            config.transaction_history_age_limit_mins,
            config.permanently_recorded_init_period_mins,
        );
        Self {
            registry: Registry::new(config.descriptor_cache_capacity),
            graph: Graph::new(),
            history: Mutex::new(history),
            watchers: Watchers::new(config.notification_timeout()),
            retries: RetryQueue::new(),
            processor: Mutex::new(Processor::default()),
            config,
        }
    }

    pub fn lock_processor(&self) -> MutexGuard<'_, Processor> {
        lock(&self.processor, "Transaction processor")
    }

    pub fn lock_history(&self) -> MutexGuard<'_, TxnHistory> {
        lock(&self.history, "Transaction history")
    }

    pub fn process(&self, mut txn: QueuedTxn) {
        let mut processor = self.lock_processor();
        txn.seq_num = processor.next_seq;
        processor.next_seq += 1;

        let span = tracing::info_span!("txn", seq_num = txn.seq_num, txn_type = %txn.txn_type);
        let _entered = span.enter();
        let start = Utc::now();
        let mut updated = BTreeSet::new();

        let pre = self.pre_process(&mut txn, &mut processor, &mut updated);
        if pre.skip_exec {
            log::debug!("Nothing to execute for {} #{}", txn.txn_type, txn.seq_num);
        } else {
            order_values_by_op(&mut txn.values);
        }

        let log_walk = self.config.log_graph_walk;
        let planned = if pre.skip_simulation {
            Vec::new()
        } else {
            // Never committed.
            let mut writer = self.graph.write(false);
            let mut scratch = BTreeSet::new();
            Executor::new(&self.registry, &mut writer, &txn, &mut scratch, true, log_walk).execute()
        };

        let executed = if pre.skip_exec {
            Vec::new()
        } else {
            let record = pre.record && self.config.record_transaction_history;
            let mut writer = self.graph.write(record);
            let executed =
                Executor::new(&self.registry, &mut writer, &txn, &mut updated, false, log_walk)
                    .execute();
            writer.commit();
            executed
        };

        if !pre.skip_exec {
            self.record_transaction(&txn, start, planned, &executed, !pre.skip_simulation);
        }
        self.post_process(txn, processor, executed, updated);
    }

    fn pre_process(
        &self,
        txn: &mut QueuedTxn,
        processor: &mut Processor,
        updated: &mut BTreeSet<String>,
    ) -> PreProcessed {
        let simulation = self.config.enable_txn_simulation;
        match txn.txn_type {
            TxnType::SbNotification => {
                let skip_exec = self.filter_notification(txn);
                PreProcessed {
                    skip_exec,
                    skip_simulation: skip_exec || !simulation,
                    record: true,
                }
            }
            TxnType::NbTransaction => {
                let skip_exec = self.pre_process_nb(txn, processor, updated);
                let simulate = txn.nb.as_ref().is_some_and(|nb| nb.simulate) || simulation;
                PreProcessed {
                    skip_exec,
                    skip_simulation: skip_exec || !simulate,
                    record: txn.resync_type() != ResyncType::DownstreamResync,
                }
            }
            TxnType::RetryFailedOps => {
                let skip_exec = self.pre_process_retry(txn);
                PreProcessed {
                    skip_exec,
                    skip_simulation: skip_exec || !simulation,
                    record: true,
                }
            }
        }
    }

    /// Returns true if the notification should be ignored.
    fn filter_notification(&self, txn: &QueuedTxn) -> bool {
        let Some(kv) = txn.values.first() else {
            return true;
        };
        if self.registry.descriptor_for_key(&kv.key).is_none() {
            log::debug!("Ignoring unimplemented SB notification for '{}'", kv.key);
            return true;
        }
        let graph = self.graph.read();
        if graph
            .node(&kv.key)
            .is_some_and(|n| n.origin() == ValueOrigin::FromNb)
        {
            log::debug!(
                "Ignoring SB notification for '{}', the value is managed from NB",
                kv.key
            );
            return true;
        }
        false
    }

    /// Refreshes the graph for resync transactions and completes the list
    /// of values to apply. Returns true if there is nothing to execute.
    fn pre_process_nb(
        &self,
        txn: &mut QueuedTxn,
        processor: &mut Processor,
        updated: &mut BTreeSet<String>,
    ) -> bool {
        let Some(nb) = txn.nb.clone() else {
            return txn.values.is_empty();
        };
        if nb.resync == ResyncType::NotResync {
            return txn.values.is_empty();
        }

        let mut writer = self.graph.write(false);
        processor.resync_count += 1;

        if nb.resync == ResyncType::DownstreamResync {
            txn.values = writer
                .nb_base_nodes()
                .filter_map(|node| {
                    node.last_update().map(|update| KvForTxn {
                        key: node.key().to_string(),
                        value: update.value.clone(),
                        metadata: None,
                        origin: ValueOrigin::FromNb,
                        is_revert: update.revert,
                    })
                })
                .collect();
        }

        if nb.resync != ResyncType::UpstreamResync {
            let keys = match nb.resync {
                ResyncType::DownstreamResync => nb.resync_keys.as_ref(),
                _ => None,
            };
            let resync = ResyncData {
                first: processor.resync_count == 1,
                values: &txn.values,
            };
            Refresher::new(&self.registry, &mut writer, updated, self.config.log_graph_walk)
                .refresh(keys, Some(&resync), nb.verbose_refresh);
        }

        let txn_keys: BTreeSet<String> = txn.values.iter().map(|kv| kv.key.clone()).collect();
        let removed: Vec<KvForTxn> = writer
            .nb_base_nodes()
            .filter(|n| !txn_keys.contains(n.key()))
            .map(|n| KvForTxn::nb(n.key(), None))
            .collect();
        let obtained: Vec<KvForTxn> = writer
            .sb_base_nodes()
            .filter(|n| !txn_keys.contains(n.key()))
            .map(|n| KvForTxn {
                key: n.key().to_string(),
                value: n.value().cloned(),
                metadata: n.metadata().cloned(),
                origin: ValueOrigin::FromSb,
                is_revert: false,
            })
            .collect();
        txn.values.extend(removed);
        txn.values.extend(obtained);
        writer.commit();

        txn.values.is_empty()
    }

    /// Turns the failed keys of a retry into values to re-apply. Keys
    /// changed since the failure are dropped.
    fn pre_process_retry(&self, txn: &mut QueuedTxn) -> bool {
        let Some(retry) = &txn.retry else {
            return true;
        };
        let graph = self.graph.read();
        let mut values = Vec::new();
        for (key, revision) in &retry.keys {
            let Some(node) = graph.node(key) else {
                continue;
            };
            let Some(update) = node.last_update() else {
                continue;
            };
            if update.txn_seq > *revision {
                // Obsolete retry.
                continue;
            }
            values.push(KvForTxn {
                key: key.clone(),
                value: update.value.clone(),
                metadata: None,
                origin: ValueOrigin::FromNb,
                is_revert: update.revert,
            });
        }
        txn.values = values;
        txn.values.is_empty()
    }

    fn record_transaction(
        &self,
        txn: &QueuedTxn,
        start: DateTime<Utc>,
        planned: Vec<RecordedTxnOp>,
        executed: &[RecordedTxnOp],
        with_simulation: bool,
    ) {
        let record = RecordedTxn {
            seq_num: txn.seq_num,
            txn_type: txn.txn_type,
            resync_type: txn.resync_type(),
            description: txn.nb.as_ref().and_then(|nb| nb.description.clone()),
            retry_for_txn: txn.retry.as_ref().map(|r| r.txn_seq),
            retry_attempt: txn.retry.as_ref().map_or(0, |r| r.attempt),
            with_simulation,
            start,
            stop: Utc::now(),
            values: txn
                .values
                .iter()
                .map(|kv| RecordedKvPair {
                    key: kv.key.clone(),
                    value: kv.value.clone(),
                    origin: kv.origin,
                })
                .collect(),
            planned,
            executed: executed.to_vec(),
        };

        if self.config.print_txn_summary {
            log::info!("\n{}", record);
        }
        if !self.config.record_transaction_history {
            return;
        }

        let now = Utc::now();
        let mut history = self.lock_history();
        history.push(record);
        let trimmed = history.trim(now);
        if trimmed > 0 {
            log::debug!("Trimmed {} transaction record(s) from history", trimmed);
        }
        let cutoff = history.cutoff(now);
        drop(history);
        self.graph.trim_timeline(cutoff);
    }

    /// The processor stays locked until the refresh of failed values is
    /// done, so SB reads from the API never overlap it.
    fn post_process(
        &self,
        mut txn: QueuedTxn,
        processor: MutexGuard<'_, Processor>,
        executed: Vec<RecordedTxnOp>,
        mut updated: BTreeSet<String>,
    ) {
        let verify = self.config.verify_mode;

        let mut to_refresh = BTreeSet::new();
        let mut to_retry = BTreeSet::new();
        let mut verbose = false;
        {
            let graph = self.graph.read();
            for op in &executed {
                let Some(node) = graph.node(&op.key) else {
                    continue;
                };
                let base = node.base_key().to_string();
                match node.state() {
                    ValueState::Unimplemented => continue,
                    ValueState::Failed => {
                        to_refresh.insert(base.clone());
                        verbose = true;
                    }
                    ValueState::Retrying => {
                        to_refresh.insert(base.clone());
                        to_retry.insert(base.clone());
                        verbose = true;
                    }
                    _ => {}
                }
                if verify {
                    to_refresh.insert(base);
                }
            }
        }

        if !to_refresh.is_empty() {
            let mut writer = self.graph.write(false);
            Refresher::new(&self.registry, &mut writer, &mut updated, self.config.log_graph_walk)
                .refresh(Some(&to_refresh), None, verbose);

            let mut retries: BTreeMap<(u64, Duration, u32), BTreeMap<String, u64>> = BTreeMap::new();
            for key in &to_retry {
                let Some(update) = writer.node(key).and_then(|n| n.last_update()) else {
                    continue;
                };
                let Some(policy) = update.retry else {
                    continue;
                };
                let previous = txn
                    .retry
                    .as_ref()
                    .filter(|r| txn.txn_type == TxnType::RetryFailedOps && r.keys.contains_key(key));
                let (seq, delay, attempt) = match previous {
                    Some(previous) => {
                        let delay = if policy.exp_backoff {
                            previous.delay * 2
                        } else {
                            policy.period
                        };
                        (previous.txn_seq, delay, previous.attempt + 1)
                    }
                    None => (txn.seq_num, policy.period, 1),
                };
                retries
                    .entry((seq, delay, attempt))
                    .or_default()
                    .insert(key.clone(), update.txn_seq);
            }
            writer.commit();
            drop(writer);

            for ((txn_seq, delay, attempt), keys) in retries {
                self.retries.schedule(RetryTxn {
                    txn_seq,
                    delay,
                    attempt,
                    keys,
                });
            }
        }
        drop(processor);

        let mut statuses: Vec<BaseValueStatus> = Vec::new();
        let mut removed = Vec::new();
        let mut kv_errors = Vec::new();
        {
            let graph = self.graph.read();
            for key in &updated {
                let status = value_status(&graph, key);
                if status.state() == ValueState::Removed {
                    removed.push(key.clone());
                }
                statuses.push(status);
            }

            for op in &executed {
                if let Some(err) = &op.new_err {
                    kv_errors.push(KeyWithError {
                        key: op.key.clone(),
                        operation: op.operation,
                        error: KvError::Descriptor(err.clone()),
                    });
                }
            }

            if verify {
                for op in &executed {
                    let Some(node) = graph.node(&op.key) else {
                        continue;
                    };
                    if let Some(kind) = self.verify_node(node) {
                        kv_errors.push(KeyWithError {
                            key: op.key.clone(),
                            operation: op.operation,
                            error: KvError::Verification(VerificationError {
                                key: op.key.clone(),
                                kind,
                            }),
                        });
                    }
                }
            }
        }

        let error = (!kv_errors.is_empty()).then(|| TxnError {
            txn_seq: txn.seq_num,
            kv_errors,
        });

        self.watchers.notify(&statuses);

        if !removed.is_empty() {
            let record = self.config.record_transaction_history;
            let mut writer = self.graph.write(record);
            for key in &removed {
                writer.delete_node(key);
            }
            writer.commit();
        }

        let outcome = TxnOutcome {
            seq_num: txn.seq_num,
            statuses: self.outcome_statuses(&txn),
            error,
        };
        match txn.reply.take() {
            Some(reply) => {
                if !reply.send(outcome) {
                    log::warn!(
                        "Caller of transaction {} is no longer waiting for the result",
                        txn.seq_num
                    );
                }
            }
            None => match &outcome.error {
                Some(err) if txn.txn_type != TxnType::SbNotification => {
                    log::error!("{}", err);
                }
                Some(err) => log::warn!("{}", err),
                None => {
                    if txn.txn_type == TxnType::NbTransaction {
                        log::info!("Transaction {} successful", txn.seq_num);
                    }
                }
            },
        }
    }

    /// Compares the applied value against what the refresh found.
    fn verify_node(&self, node: &Node) -> Option<VerificationErrorKind> {
        let state = node.state();
        if state.is_failure() {
            return None;
        }
        let expected = node.last_applied_value();
        let expected_to_not_exist =
            expected.is_none() || state == ValueState::Pending || state == ValueState::Invalid;
        if expected_to_not_exist {
            if node.is_available() {
                return Some(VerificationErrorKind::ExpectedToNotExist);
            }
            return None;
        }
        if !node.is_available() {
            return Some(VerificationErrorKind::ExpectedToExist);
        }
        let equivalent = match self.registry.descriptor_for_key(node.key()) {
            Some(descriptor) => match (node.value(), expected) {
                (Some(actual), Some(expected)) => {
                    descriptor.equivalent(node.key(), actual.as_ref(), expected.as_ref())
                }
                _ => false,
            },
            None => equal_values(node.value(), expected),
        };
        if !equivalent {
            log::warn!(
                "Verification failed for '{}': applied {:?}, refreshed {:?}",
                node.key(),
                expected,
                node.value()
            );
            return Some(VerificationErrorKind::NotEquivalent);
        }
        None
    }

    /// Statuses of the NB values named by the transaction.
    fn outcome_statuses(&self, txn: &QueuedTxn) -> Vec<BaseValueStatus> {
        if txn.txn_type != TxnType::NbTransaction {
            return Vec::new();
        }
        let graph = self.graph.read();
        let mut seen = BTreeSet::new();
        txn.values
            .iter()
            .filter(|kv| kv.origin == ValueOrigin::FromNb)
            .filter(|kv| seen.insert(kv.key.clone()))
            .map(|kv| value_status(&graph, &kv.key))
            .collect()
    }
}

/// Moves deletes in front of creates and updates, keeping the relative
/// order otherwise.
pub(crate) fn order_values_by_op(values: &mut [KvForTxn]) {
    values.sort_by_key(|kv| kv.value.is_some());
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("{} lock was poisoned, recovering", what);
            poisoned.into_inner()
        }
    }
}
