//! The scheduler: transaction queue, processing thread and query API.
//!
//! All transactions (NB transactions, SB notifications and retries) go
//! through one bounded queue and are processed sequentially by a single
//! thread. A second thread re-submits failed operations when their retry
//! delay expires.
//!
//! Descriptor callbacks run on the processing thread. Calling
//! [`Scheduler::commit`] from inside a callback deadlocks.

mod exec;
mod notify;
mod process;
mod record;
mod refresh;
mod retry;
mod status;
mod txn;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::config::{validate_config, SchedulerConfig};
use crate::descriptor::DescriptorRef;
use crate::error::{KeyWithError, KvError, Result, SchedulerError};
use crate::graph::{MetadataIndexer, MetadataMap, RecordedNode};
use crate::kv::{
    BaseValueStatus, KeySelector, KeyValuePair, KvWithMetadata, Metadata, ValueOrigin, ValueRef,
    ValueState,
};

use process::Inner;
use txn::{KvForTxn, NbTxn, QueueItem, QueuedTxn, TxnReply};

pub use record::{RecordedKvPair, RecordedTxn, RecordedTxnOp};
pub use txn::{ResyncType, RetryPolicy, Transaction, TxnOptions, TxnOutcome, TxnType};

/// Which state [`Scheduler::dump_values`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    /// Values as last requested from NB.
    NbView,
    /// Values freshly retrieved from SB.
    SbView,
    /// Available values as currently tracked by the graph.
    CachedView,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    queue: Sender<QueueItem>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Creates the scheduler and starts its worker threads.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        validate_config(&config)?;

        let capacity = config.txn_queue_capacity;
        let (queue, receiver) = bounded::<QueueItem>(capacity);
        let inner = Arc::new(Inner::new(config));
        let shutdown = Arc::new(AtomicBool::new(false));

        let processor = {
            let inner = Arc::clone(&inner);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || run_processor(inner, receiver, shutdown))
        };
        let retrier = {
            let inner = Arc::clone(&inner);
            let shutdown = Arc::clone(&shutdown);
            let queue = queue.clone();
            thread::spawn(move || inner.retries.run(&queue, &shutdown))
        };

        log::info!("Scheduler started (queue capacity {})", capacity);
        Ok(Self {
            inner,
            queue,
            shutdown,
            handles: Mutex::new(vec![processor, retrier]),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Registers a descriptor. Descriptors with metadata get a metadata map,
    /// indexed through [`KvDescriptor::index_metadata`].
    ///
    /// [`KvDescriptor::index_metadata`]: crate::descriptor::KvDescriptor::index_metadata
    pub fn register_descriptor(&self, descriptor: DescriptorRef) -> Result<()> {
        self.inner.registry.register(Arc::clone(&descriptor))?;
        if descriptor.with_metadata() {
            let name = descriptor.name().to_string();
            let indexer: MetadataIndexer =
                Arc::new(move |metadata: &Metadata| descriptor.index_metadata(metadata));
            self.inner.graph.register_metadata_map(&name, Some(indexer));
        }
        Ok(())
    }

    /// Processes the transaction and waits for its outcome. Descriptor
    /// failures are reported in [`TxnOutcome::error`], not as `Err`.
    pub fn commit(&self, txn: Transaction) -> Result<TxnOutcome> {
        let (tx, rx) = bounded(1);
        self.enqueue(txn, Some(TxnReply::Blocking(tx)))?;
        rx.recv().map_err(|_| SchedulerError::Closed)
    }

    /// Like [`Scheduler::commit`], giving up waiting after `timeout`. The
    /// transaction is still processed.
    pub fn commit_timeout(&self, txn: Transaction, timeout: Duration) -> Result<TxnOutcome> {
        let (tx, rx) = bounded(1);
        self.enqueue(txn, Some(TxnReply::Blocking(tx)))?;
        rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SchedulerError::WaitTimeout,
            RecvTimeoutError::Disconnected => SchedulerError::Closed,
        })
    }

    /// Queues the transaction without waiting. The outcome is only logged.
    pub fn submit(&self, txn: Transaction) -> Result<()> {
        self.enqueue(txn, None)
    }

    /// Queues the transaction and resolves once it is processed.
    pub async fn commit_async(&self, txn: Transaction) -> Result<TxnOutcome> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.enqueue(txn, Some(TxnReply::Async(tx)))?;
        rx.await.map_err(|_| SchedulerError::Closed)
    }

    /// Notifies the scheduler that a value changed in SB. `None` means the
    /// value disappeared.
    pub fn push_sb_notification(
        &self,
        key: impl Into<String>,
        value: Option<ValueRef>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let kv = KvForTxn {
            key: key.into(),
            value,
            metadata,
            origin: ValueOrigin::FromSb,
            is_revert: false,
        };
        self.send(QueueItem::Txn(Box::new(QueuedTxn::sb_notification(kv))))
    }

    /// Blocks until every transaction queued before this call is processed.
    pub fn transaction_barrier(&self) -> Result<()> {
        self.ensure_running()?;
        let (tx, rx) = bounded(1);
        self.queue
            .send(QueueItem::Barrier(tx))
            .map_err(|_| SchedulerError::Closed)?;
        rx.recv().map_err(|_| SchedulerError::Closed)
    }

    pub fn value_status(&self, key: &str) -> BaseValueStatus {
        status::value_status(&self.inner.graph.read(), key)
    }

    /// Current value of `key`, whether or not it is applied.
    pub fn value(&self, key: &str) -> Option<ValueRef> {
        self.inner
            .graph
            .read()
            .node(key)
            .and_then(|n| n.value().cloned())
    }

    /// Available values with keys accepted by `selector`.
    pub fn values(&self, selector: impl Fn(&str) -> bool) -> Vec<KeyValuePair> {
        let graph = self.inner.graph.read();
        graph
            .nodes()
            .filter(|n| n.is_available() && selector(n.key()))
            .filter_map(|n| {
                n.value().map(|value| KeyValuePair {
                    key: n.key().to_string(),
                    value: Arc::clone(value),
                })
            })
            .collect()
    }

    /// Values waiting for their dependencies.
    pub fn pending_values(&self, selector: impl Fn(&str) -> bool) -> Vec<KeyValuePair> {
        let graph = self.inner.graph.read();
        graph
            .nodes()
            .filter(|n| n.state() == ValueState::Pending && selector(n.key()))
            .filter_map(|n| {
                n.value().map(|value| KeyValuePair {
                    key: n.key().to_string(),
                    value: Arc::clone(value),
                })
            })
            .collect()
    }

    /// Values whose last operation failed.
    pub fn failed_values(&self, selector: impl Fn(&str) -> bool) -> Vec<KeyWithError> {
        let graph = self.inner.graph.read();
        graph
            .nodes()
            .filter(|n| selector(n.key()))
            .filter_map(|n| {
                n.error().map(|err| KeyWithError {
                    key: n.key().to_string(),
                    operation: n.last_operation(),
                    error: KvError::Descriptor(err.error.clone()),
                })
            })
            .collect()
    }

    /// Values of one descriptor as seen from the given side.
    pub fn dump_values(&self, descriptor: &str, view: View) -> Result<Vec<KvWithMetadata>> {
        let handler = self
            .inner
            .registry
            .descriptor(descriptor)
            .ok_or_else(|| SchedulerError::UnknownDescriptor(descriptor.to_string()))?;

        match view {
            View::NbView => Ok(self.nb_values(descriptor)),
            View::CachedView => {
                let graph = self.inner.graph.read();
                Ok(graph
                    .descriptor_nodes(descriptor)
                    .filter(|n| n.is_available())
                    .filter_map(|n| n.to_kv_with_metadata())
                    .collect())
            }
            View::SbView => {
                if !handler.supports_retrieve() {
                    return Err(SchedulerError::RetrieveUnsupported(descriptor.to_string()));
                }
                // Keep transactions out while SB is being read.
                let _processor = self.inner.lock_processor();
                let correlate = self.nb_values(descriptor);
                handler
                    .retrieve(&correlate)
                    .map_err(|source| SchedulerError::Retrieve {
                        descriptor: descriptor.to_string(),
                        source,
                    })
            }
        }
    }

    fn nb_values(&self, descriptor: &str) -> Vec<KvWithMetadata> {
        let graph = self.inner.graph.read();
        graph
            .descriptor_nodes(descriptor)
            .filter(|n| n.origin() == ValueOrigin::FromNb)
            .filter_map(|n| {
                let value = n.last_update()?.value.clone()?;
                Some(KvWithMetadata {
                    key: n.key().to_string(),
                    value,
                    metadata: n.metadata().cloned(),
                    origin: ValueOrigin::FromNb,
                })
            })
            .collect()
    }

    pub fn registered_nb_key_prefixes(&self) -> Vec<String> {
        self.inner.registry.nb_key_prefixes()
    }

    /// Human-readable dump of the current graph.
    pub fn graph_dump(&self) -> String {
        self.inner.graph.read().dump()
    }

    /// Snapshot of the metadata map of a descriptor.
    pub fn metadata_map(&self, descriptor: &str) -> Option<MetadataMap> {
        self.inner.graph.read().metadata_map(descriptor).cloned()
    }

    /// Subscribes to status updates of base values accepted by `selector`
    /// (all when `None`).
    pub fn watch_value_status(
        &self,
        capacity: usize,
        selector: Option<KeySelector>,
    ) -> Receiver<BaseValueStatus> {
        self.inner.watchers.subscribe(capacity, selector)
    }

    /// Recorded transactions started inside `[since, until]`.
    pub fn transaction_history(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<RecordedTxn> {
        self.inner.lock_history().window(since, until)
    }

    pub fn recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.inner.lock_history().by_seq(seq_num).cloned()
    }

    pub fn node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.inner.graph.node_timeline(key)
    }

    /// Recorded graph state as it was at `at`.
    pub fn graph_snapshot(&self, at: DateTime<Utc>) -> Vec<RecordedNode> {
        self.inner.graph.snapshot(at)
    }

    /// Stops the worker threads. Queued transactions are dropped and their
    /// callers get [`SchedulerError::Closed`].
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        log::info!("Stopping scheduler");
        self.inner.retries.wake();

        let handles: Vec<JoinHandle<()>> = match self.handles.lock() {
            Ok(mut guard) => guard.drain(..).collect(),
            Err(poisoned) => {
                log::warn!("Scheduler handles lock was poisoned, recovering");
                poisoned.into_inner().drain(..).collect()
            }
        };
        for handle in handles {
            if handle.join().is_err() {
                log::error!("Scheduler thread panicked");
            }
        }
        log::info!("Scheduler stopped");
    }

    fn enqueue(&self, txn: Transaction, reply: Option<TxnReply>) -> Result<()> {
        let options = txn.options;
        if options.resync == ResyncType::DownstreamResync && !txn.ops.is_empty() {
            return Err(SchedulerError::InvalidTransaction(
                "downstream resync must not carry values".into(),
            ));
        }
        if options.revert_on_failure && options.resync != ResyncType::NotResync {
            return Err(SchedulerError::InvalidTransaction(
                "revert on failure is not supported for resync".into(),
            ));
        }
        if let Some(op) = txn.ops.iter().find(|op| op.key.is_empty()) {
            return Err(SchedulerError::InvalidTransaction(format!(
                "empty key (value {:?})",
                op.value
            )));
        }

        let retry = if options.no_retry {
            None
        } else {
            Some(options.retry.unwrap_or_else(|| self.inner.config.retry.policy()))
        };
        let nb = NbTxn {
            resync: options.resync,
            verbose_refresh: options.verbose_refresh,
            resync_keys: options.resync_keys,
            retry,
            revert_on_failure: options.revert_on_failure,
            simulate: options.simulate,
            description: options.description,
        };
        let values = txn
            .ops
            .into_iter()
            .map(|op| KvForTxn::nb(op.key, op.value))
            .collect();
        self.send(QueueItem::Txn(Box::new(QueuedTxn::nb(values, nb, reply))))
    }

    fn send(&self, item: QueueItem) -> Result<()> {
        self.ensure_running()?;
        match self.queue.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SchedulerError::QueueFull(
                self.inner.config.txn_queue_capacity,
            )),
            Err(TrySendError::Disconnected(_)) => Err(SchedulerError::Closed),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(SchedulerError::Closed);
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_processor(inner: Arc<Inner>, receiver: Receiver<QueueItem>, shutdown: Arc<AtomicBool>) {
    log::debug!("Transaction processor started");
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(QueueItem::Txn(txn)) => inner.process(*txn),
            Ok(QueueItem::Barrier(ack)) => {
                let _ = ack.send(());
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("Transaction processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_downstream_resync_with_values() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        let txn = Transaction::resync(ResyncType::DownstreamResync).put("a", 1u32);
        assert!(matches!(
            scheduler.submit(txn),
            Err(SchedulerError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn test_closed_after_stop() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        scheduler.stop();
        assert!(matches!(
            scheduler.commit(Transaction::new().put("a", 1u32)),
            Err(SchedulerError::Closed)
        ));
    }

    #[test]
    fn test_barrier_waits_for_queue() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).unwrap();
        scheduler.submit(Transaction::new().put("a", 1u32)).unwrap();
        scheduler.transaction_barrier().unwrap();
        // No descriptor: the value is tracked but unimplemented.
        assert_eq!(scheduler.value_status("a").state(), ValueState::Unimplemented);
    }
}
