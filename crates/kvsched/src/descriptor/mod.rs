//! Descriptor contract and registry.
//!
//! A descriptor owns one key namespace and implements the CRUD, dependency
//! and derivation callbacks for the values in it. Only `name` and
//! `key_selector` are mandatory; every other callback has a default that
//! matches a descriptor without that capability.

pub mod registry;

use std::sync::Arc;

use crate::kv::{
    Dependency, DescriptorError, KeyValuePair, KvWithMetadata, Metadata, Value,
};

pub use registry::{Registry, RegistryError, DEFAULT_CACHE_CAPACITY};

/// Shared handle to a registered descriptor.
pub type DescriptorRef = Arc<dyn KvDescriptor>;

pub trait KvDescriptor: Send + Sync {
    /// Unique descriptor name.
    fn name(&self) -> &str;

    /// Returns true for keys owned by this descriptor.
    fn key_selector(&self, key: &str) -> bool;

    /// Short human-readable label for a key.
    fn key_label(&self, key: &str) -> String {
        key.to_string()
    }

    /// Prefix under which top-level values of this descriptor are submitted.
    fn nb_key_prefix(&self) -> Option<&str> {
        None
    }

    fn equivalent(&self, _key: &str, old: &dyn Value, new: &dyn Value) -> bool {
        old.equals(new)
    }

    fn validate(&self, _key: &str, _value: &dyn Value) -> Result<(), DescriptorError> {
        Ok(())
    }

    fn create(&self, key: &str, _value: &dyn Value) -> Result<Option<Metadata>, DescriptorError> {
        Err(DescriptorError::Unsupported(format!("create {}", key)))
    }

    fn delete(
        &self,
        key: &str,
        _value: &dyn Value,
        _metadata: Option<&Metadata>,
    ) -> Result<(), DescriptorError> {
        Err(DescriptorError::Unsupported(format!("delete {}", key)))
    }

    /// Whether `update` is implemented. Values of descriptors without
    /// in-place update are always re-created.
    fn supports_update(&self) -> bool {
        false
    }

    fn update(
        &self,
        key: &str,
        _old: &dyn Value,
        _new: &dyn Value,
        _old_metadata: Option<&Metadata>,
    ) -> Result<Option<Metadata>, DescriptorError> {
        Err(DescriptorError::Unsupported(format!("update {}", key)))
    }

    /// Returns true if the change from `old` to `new` requires delete+create.
    fn update_with_recreate(
        &self,
        _key: &str,
        _old: &dyn Value,
        _new: &dyn Value,
        _metadata: Option<&Metadata>,
    ) -> bool {
        false
    }

    /// Whether `retrieve` is implemented.
    fn supports_retrieve(&self) -> bool {
        false
    }

    /// Dumps the actual southbound state. `correlate` carries the values
    /// the scheduler expects to find, so that metadata can be reused.
    fn retrieve(
        &self,
        _correlate: &[KvWithMetadata],
    ) -> Result<Vec<KvWithMetadata>, DescriptorError> {
        Ok(Vec::new())
    }

    fn is_retriable_failure(&self, err: &DescriptorError) -> bool {
        err.is_retryable()
    }

    fn dependencies(&self, _key: &str, _value: &dyn Value) -> Vec<Dependency> {
        Vec::new()
    }

    fn derived_values(&self, _key: &str, _value: &dyn Value) -> Vec<KeyValuePair> {
        Vec::new()
    }

    /// Names of descriptors whose `retrieve` must run before this one's.
    fn retrieve_dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether metadata returned by create/update is kept. Without it the
    /// callbacks always receive `None`.
    fn with_metadata(&self) -> bool {
        false
    }

    /// Secondary index entries `(index, value)` for a metadata map.
    fn index_metadata(&self, _metadata: &Metadata) -> Vec<(String, String)> {
        Vec::new()
    }
}
