//! In-memory southbound and a configurable descriptor over it.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kvsched::{
    Dependency, DescriptorError, KeyValuePair, KvDescriptor, KvWithMetadata, Metadata, Value,
    ValueRef,
};

/// Test value. Dependencies and derived keys are carried by the value
/// itself, so tests describe the graph through the data they submit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Item {
    pub value: u32,
    /// Keys this item depends on.
    pub needs: Vec<String>,
    /// Keys of values derived from this item.
    pub children: Vec<String>,
}

impl Item {
    pub fn new(value: u32) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn needs(mut self, key: &str) -> Self {
        self.needs.push(key.to_string());
        self
    }

    pub fn child(mut self, key: &str) -> Self {
        self.children.push(key.to_string());
        self
    }
}

/// Shared fake southbound: current values plus a log of descriptor calls
/// across all descriptors.
#[derive(Default)]
pub struct Southbound {
    values: Mutex<BTreeMap<String, Item>>,
    calls: Mutex<Vec<String>>,
}

impl Southbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == call).count()
    }

    pub fn get(&self, key: &str) -> Option<Item> {
        self.values.lock().unwrap().get(key).cloned()
    }

    /// Changes SB behind the scheduler's back.
    pub fn set(&self, key: &str, item: Item) {
        self.values.lock().unwrap().insert(key.to_string(), item);
    }

    pub fn remove(&self, key: &str) {
        self.values.lock().unwrap().remove(key);
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

struct Failure {
    op: &'static str,
    key: String,
    error: DescriptorError,
    /// `None` fails forever.
    remaining: Option<u32>,
}

type ValidateFn = Box<dyn Fn(&Item) -> Result<(), DescriptorError> + Send + Sync>;

/// Descriptor owning all keys under `prefix`.
pub struct MockDescriptor {
    name: String,
    prefix: String,
    sb: Arc<Southbound>,
    update: bool,
    retrieve: bool,
    metadata: bool,
    validator: Option<ValidateFn>,
    failures: Mutex<Vec<Failure>>,
    retrieve_delay: Option<Duration>,
    retrieving: AtomicUsize,
    max_retrieving: AtomicUsize,
}

impl MockDescriptor {
    pub fn new(name: &str, prefix: &str, sb: &Arc<Southbound>) -> Self {
        Self {
            name: name.to_string(),
            prefix: prefix.to_string(),
            sb: Arc::clone(sb),
            update: false,
            retrieve: false,
            metadata: false,
            validator: None,
            failures: Mutex::new(Vec::new()),
            retrieve_delay: None,
            retrieving: AtomicUsize::new(0),
            max_retrieving: AtomicUsize::new(0),
        }
    }

    pub fn with_update(mut self) -> Self {
        self.update = true;
        self
    }

    pub fn with_retrieve(mut self) -> Self {
        self.retrieve = true;
        self
    }

    /// Each retrieve takes at least `delay`.
    pub fn with_slow_retrieve(mut self, delay: Duration) -> Self {
        self.retrieve = true;
        self.retrieve_delay = Some(delay);
        self
    }

    /// Highest number of retrieve calls seen running at the same time.
    pub fn max_concurrent_retrieves(&self) -> usize {
        self.max_retrieving.load(Ordering::SeqCst)
    }

    pub fn with_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    pub fn with_validation<F>(mut self, f: F) -> Self
    where
        F: Fn(&Item) -> Result<(), DescriptorError> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(f));
        self
    }

    /// Makes `op` ("create", "update", "delete") fail for `key`, `times`
    /// times or forever. A "retrieve" failure uses an empty key.
    pub fn fail(&self, op: &'static str, key: &str, error: DescriptorError, times: Option<u32>) {
        self.failures.lock().unwrap().push(Failure {
            op,
            key: key.to_string(),
            error,
            remaining: times,
        });
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    fn injected(&self, op: &str, key: &str) -> Result<(), DescriptorError> {
        let mut failures = self.failures.lock().unwrap();
        for failure in failures.iter_mut() {
            if failure.op != op || failure.key != key {
                continue;
            }
            match &mut failure.remaining {
                None => return Err(failure.error.clone()),
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return Err(failure.error.clone());
                }
            }
        }
        Ok(())
    }

    fn metadata_for(&self, key: &str) -> Option<Metadata> {
        if self.metadata {
            Some(Arc::new(format!("meta:{}", key)))
        } else {
            None
        }
    }
}

fn item(value: &dyn Value) -> Item {
    value.downcast_ref::<Item>().cloned().unwrap_or_default()
}

impl KvDescriptor for MockDescriptor {
    fn name(&self) -> &str {
        &self.name
    }

    fn key_selector(&self, key: &str) -> bool {
        key.starts_with(&self.prefix)
    }

    fn nb_key_prefix(&self) -> Option<&str> {
        Some(&self.prefix)
    }

    fn validate(&self, _key: &str, value: &dyn Value) -> Result<(), DescriptorError> {
        match &self.validator {
            Some(validate) => validate(&item(value)),
            None => Ok(()),
        }
    }

    fn create(&self, key: &str, value: &dyn Value) -> Result<Option<Metadata>, DescriptorError> {
        self.sb.log(format!("create {}", key));
        self.injected("create", key)?;
        self.sb.set(key, item(value));
        Ok(self.metadata_for(key))
    }

    fn delete(
        &self,
        key: &str,
        _value: &dyn Value,
        _metadata: Option<&Metadata>,
    ) -> Result<(), DescriptorError> {
        self.sb.log(format!("delete {}", key));
        self.injected("delete", key)?;
        self.sb.remove(key);
        Ok(())
    }

    fn supports_update(&self) -> bool {
        self.update
    }

    fn update(
        &self,
        key: &str,
        _old: &dyn Value,
        new: &dyn Value,
        _old_metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        self.sb.log(format!("update {}", key));
        self.injected("update", key)?;
        self.sb.set(key, item(new));
        Ok(self.metadata_for(key))
    }

    fn supports_retrieve(&self) -> bool {
        self.retrieve
    }

    fn retrieve(
        &self,
        correlate: &[KvWithMetadata],
    ) -> Result<Vec<KvWithMetadata>, DescriptorError> {
        let running = self.retrieving.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_retrieving.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.retrieve_delay {
            thread::sleep(delay);
        }
        self.retrieving.fetch_sub(1, Ordering::SeqCst);

        self.injected("retrieve", "")?;
        let values = self.sb.values.lock().unwrap().clone();
        Ok(values
            .into_iter()
            .filter(|(key, _)| self.key_selector(key))
            .map(|(key, item)| {
                let metadata = correlate
                    .iter()
                    .find(|kv| kv.key == key)
                    .and_then(|kv| kv.metadata.clone())
                    .or_else(|| self.metadata_for(&key));
                KvWithMetadata {
                    key,
                    value: Arc::new(item) as ValueRef,
                    metadata,
                    origin: kvsched::ValueOrigin::Unknown,
                }
            })
            .collect())
    }

    fn dependencies(&self, _key: &str, value: &dyn Value) -> Vec<Dependency> {
        item(value)
            .needs
            .iter()
            .map(|target| Dependency::on_key(target.clone(), target.clone()))
            .collect()
    }

    fn derived_values(&self, _key: &str, value: &dyn Value) -> Vec<KeyValuePair> {
        item(value)
            .children
            .iter()
            .map(|child| KeyValuePair::new(child.clone(), Item::new(0)))
            .collect()
    }

    fn with_metadata(&self) -> bool {
        self.metadata
    }

    fn index_metadata(&self, metadata: &Metadata) -> Vec<(String, String)> {
        metadata
            .downcast_ref::<String>()
            .map(|m| vec![("meta".to_string(), m.clone())])
            .unwrap_or_default()
    }
}
