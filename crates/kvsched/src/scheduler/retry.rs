//! Delayed re-submission of failed operations.
//!
//! Retries wait in a min-heap ordered by due time. A dedicated thread pops
//! due retries and pushes them into the transaction queue as
//! retry-failed-ops transactions.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};

use super::txn::{QueueItem, QueuedTxn, RetryTxn};

/// Upper bound for a single wait, so that shutdown is noticed promptly.
const MAX_WAIT: Duration = Duration::from_millis(100);

/// Delay before re-trying to enqueue into a full transaction queue.
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Default)]
struct RetryState {
    due: BinaryHeap<Reverse<(Instant, u64)>>,
    pending: HashMap<u64, RetryTxn>,
    next_id: u64,
}

pub(crate) struct RetryQueue {
    state: Mutex<RetryState>,
    wakeup: Condvar,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RetryState::default()),
            wakeup: Condvar::new(),
        }
    }

    pub fn schedule(&self, retry: RetryTxn) {
        let delay = retry.delay;
        self.schedule_after(retry, delay);
    }

    fn schedule_after(&self, retry: RetryTxn, delay: Duration) {
        log::debug!(
            "Scheduling retry of txn {} (attempt {}) in {:?} for {} key(s)",
            retry.txn_seq,
            retry.attempt,
            delay,
            retry.keys.len()
        );
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state.due.push(Reverse((Instant::now() + delay, id)));
        state.pending.insert(id, retry);
        drop(state);
        self.wakeup.notify_one();
    }

    /// Wakes the retry thread, e.g. to notice shutdown.
    pub fn wake(&self) {
        self.wakeup.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    /// Runs until shutdown or until the transaction queue is closed.
    pub fn run(&self, queue: &Sender<QueueItem>, shutdown: &AtomicBool) {
        log::debug!("Retry thread started");
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let ready = {
                let mut state = self.lock();
                let now = Instant::now();
                let mut ready = Vec::new();
                while let Some(&Reverse((due, id))) = state.due.peek() {
                    if due > now {
                        break;
                    }
                    state.due.pop();
                    if let Some(retry) = state.pending.remove(&id) {
                        ready.push(retry);
                    }
                }
                if ready.is_empty() {
                    let wait = state
                        .due
                        .peek()
                        .map_or(MAX_WAIT, |Reverse((due, _))| {
                            due.saturating_duration_since(now).min(MAX_WAIT)
                        });
                    let _ = match self.wakeup.wait_timeout(state, wait) {
                        Ok(result) => result,
                        Err(poisoned) => {
                            log::warn!("Retry queue lock was poisoned, recovering");
                            poisoned.into_inner()
                        }
                    };
                    continue;
                }
                ready
            };

            for retry in ready {
                let item = QueueItem::Txn(Box::new(QueuedTxn::retry(retry.clone())));
                match queue.try_send(item) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        log::warn!(
                            "Transaction queue full, postponing retry of txn {}",
                            retry.txn_seq
                        );
                        self.schedule_after(retry, QUEUE_FULL_BACKOFF);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        log::debug!("Transaction queue closed, retry thread exiting");
                        return;
                    }
                }
            }
        }
        log::debug!("Retry thread stopped");
    }

    fn lock(&self) -> MutexGuard<'_, RetryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Retry queue lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
