use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::kv::Metadata;

/// Computes secondary index entries `(index, value)` for a metadata token.
pub type MetadataIndexer = Arc<dyn Fn(&Metadata) -> Vec<(String, String)> + Send + Sync>;

/// Per-descriptor map of value label -> metadata, with optional secondary
/// indexes.
#[derive(Clone, Default)]
pub struct MetadataMap {
    entries: BTreeMap<String, MetadataEntry>,
    label_by_key: HashMap<String, String>,
    index: BTreeMap<(String, String), BTreeSet<String>>,
    indexer: Option<MetadataIndexer>,
}

#[derive(Clone)]
struct MetadataEntry {
    key: String,
    metadata: Metadata,
    index_entries: Vec<(String, String)>,
}

impl MetadataMap {
    pub(crate) fn new(indexer: Option<MetadataIndexer>) -> Self {
        Self {
            indexer,
            ..Default::default()
        }
    }

    pub fn get(&self, label: &str) -> Option<&Metadata> {
        self.entries.get(label).map(|e| &e.metadata)
    }

    /// Returns the metadata of `label` if it is of type `T`.
    pub fn get_as<T: Any>(&self, label: &str) -> Option<&T> {
        self.get(label).and_then(|m| m.downcast_ref::<T>())
    }

    /// Key of the value stored under `label`.
    pub fn key_of(&self, label: &str) -> Option<&str> {
        self.entries.get(label).map(|e| e.key.as_str())
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Metadata)> {
        self.entries.iter().map(|(l, e)| (l.as_str(), &e.metadata))
    }

    /// Labels whose metadata carries the given index entry.
    pub fn lookup_by_index(&self, index: &str, value: &str) -> Vec<String> {
        self.index
            .get(&(index.to_string(), value.to_string()))
            .map(|labels| labels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn put(&mut self, key: &str, label: &str, metadata: Metadata) {
        self.remove_key(key);
        let index_entries = self
            .indexer
            .as_ref()
            .map(|indexer| indexer(&metadata))
            .unwrap_or_default();
        for entry in &index_entries {
            self.index
                .entry(entry.clone())
                .or_default()
                .insert(label.to_string());
        }
        self.label_by_key.insert(key.to_string(), label.to_string());
        self.entries.insert(
            label.to_string(),
            MetadataEntry {
                key: key.to_string(),
                metadata,
                index_entries,
            },
        );
    }

    pub(crate) fn remove_key(&mut self, key: &str) {
        let Some(label) = self.label_by_key.remove(key) else {
            return;
        };
        if let Some(entry) = self.entries.remove(&label) {
            for index_entry in entry.index_entries {
                if let Some(labels) = self.index.get_mut(&index_entry) {
                    labels.remove(&label);
                    if labels.is_empty() {
                        self.index.remove(&index_entry);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for MetadataMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(l, e)| (l, &e.metadata)))
            .finish()
    }
}
