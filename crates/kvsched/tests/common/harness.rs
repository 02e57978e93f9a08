//! Test harness running a scheduler over mock descriptors.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kvsched::{RetryPolicy, Scheduler, SchedulerConfig, ValueState};

use super::mock::{MockDescriptor, Southbound};

pub struct TestHarness {
    pub scheduler: Scheduler,
    pub sb: Arc<Southbound>,
}

impl TestHarness {
    /// Scheduler with quiet summaries and fast retries.
    pub fn new() -> Self {
        let mut config = SchedulerConfig::default();
        config.print_txn_summary = false;
        config.retry.period_ms = 10;
        Self::with_config(config)
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let scheduler = Scheduler::new(config).expect("Failed to start scheduler");
        Self {
            scheduler,
            sb: Southbound::new(),
        }
    }

    pub fn descriptor(&self, name: &str, prefix: &str) -> MockDescriptor {
        MockDescriptor::new(name, prefix, &self.sb)
    }

    pub fn register(&self, descriptor: MockDescriptor) -> Arc<MockDescriptor> {
        let descriptor = Arc::new(descriptor);
        self.scheduler
            .register_descriptor(descriptor.clone())
            .expect("Failed to register descriptor");
        descriptor
    }

    pub fn state(&self, key: &str) -> ValueState {
        self.scheduler.value_status(key).state()
    }

    /// Polls until `key` reaches `state` or the timeout expires.
    pub fn wait_for_state(&self, key: &str, state: ValueState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state(key) == state {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.state(key) == state
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        period: Duration::from_millis(10),
        max_attempts,
        exp_backoff: false,
    }
}
