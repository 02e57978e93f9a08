use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};

use crate::kv::{BaseValueStatus, KeySelector};

struct Watcher {
    id: u64,
    sender: Sender<BaseValueStatus>,
    selector: Option<KeySelector>,
}

/// Subscribers of value status updates.
///
/// Each subscriber has its own bounded channel. A subscriber that does not
/// drain its channel within the timeout loses the update; a subscriber that
/// dropped its receiver is forgotten.
pub(crate) struct Watchers {
    timeout: Duration,
    watchers: Mutex<(u64, Vec<Watcher>)>,
}

impl Watchers {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            watchers: Mutex::new((0, Vec::new())),
        }
    }

    pub fn subscribe(
        &self,
        capacity: usize,
        selector: Option<KeySelector>,
    ) -> Receiver<BaseValueStatus> {
        let (sender, receiver) = bounded(capacity.max(1));
        let mut guard = self.lock();
        let (next_id, watchers) = &mut *guard;
        *next_id += 1;
        watchers.push(Watcher {
            id: *next_id,
            sender,
            selector,
        });
        log::debug!("Registered value status watcher #{}", next_id);
        receiver
    }

    pub fn notify(&self, statuses: &[BaseValueStatus]) {
        if statuses.is_empty() {
            return;
        }
        let timeout = self.timeout;
        let mut guard = self.lock();
        guard.1.retain(|watcher| {
            for status in statuses {
                if !watcher.selector.as_ref().map_or(true, |s| s(status.key())) {
                    continue;
                }
                match watcher.sender.send_timeout(status.clone(), timeout) {
                    Ok(()) => {}
                    Err(SendTimeoutError::Timeout(_)) => {
                        log::warn!(
                            "Timed out delivering status of '{}' to watcher #{}, dropping update",
                            status.key(),
                            watcher.id
                        );
                    }
                    Err(SendTimeoutError::Disconnected(_)) => {
                        log::debug!("Watcher #{} disconnected", watcher.id);
                        return false;
                    }
                }
            }
            true
        });
    }

    pub fn len(&self) -> usize {
        self.lock().1.len()
    }

    fn lock(&self) -> MutexGuard<'_, (u64, Vec<Watcher>)> {
        match self.watchers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Watchers lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}
