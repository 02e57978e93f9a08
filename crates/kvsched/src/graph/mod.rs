//! In-memory dependency graph of tracked values.
//!
//! The committed state sits behind a single reader-writer lock. Readers
//! take a point-in-time [`GraphReader`] snapshot. One [`GraphWriter`] at a
//! time stages changes on a private copy; nothing becomes visible until
//! [`GraphWriter::commit`]. Dropping a writer without committing discards
//! its changes, which is how simulated transactions leave no trace.

pub mod metadata;
pub mod node;
pub mod state;
pub mod timeline;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};

use crate::kv::Dependency;

pub use metadata::{MetadataIndexer, MetadataMap};
pub use node::{LastUpdate, Node, NodeError};
pub use state::GraphState;
pub use timeline::{RecordedNode, RecordedTarget};

pub struct Graph {
    committed: RwLock<Arc<GraphState>>,
    writer: Mutex<()>,
    timeline: Mutex<BTreeMap<String, Vec<RecordedNode>>>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            committed: RwLock::new(Arc::new(GraphState::default())),
            writer: Mutex::new(()),
            timeline: Mutex::new(BTreeMap::new()),
        }
    }

    /// Point-in-time view of the committed state.
    pub fn read(&self) -> GraphReader {
        let state = match self.committed.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => {
                log::warn!("Graph lock was poisoned, recovering");
                Arc::clone(&poisoned.into_inner())
            }
        };
        GraphReader { state }
    }

    /// Exclusive write access; blocks while another writer is active.
    /// With `record` set, committed node changes are appended to the node
    /// timelines.
    pub fn write(&self, record: bool) -> GraphWriter<'_> {
        let guard = lock(&self.writer, "graph writer");
        let working = self.read().state.as_ref().clone();
        GraphWriter {
            graph: self,
            _guard: guard,
            working,
            changed: BTreeSet::new(),
            record,
        }
    }

    /// Creates the metadata map of a descriptor. Existing maps are kept.
    pub fn register_metadata_map(&self, descriptor: &str, indexer: Option<MetadataIndexer>) {
        let mut writer = self.write(false);
        writer
            .working
            .metadata
            .entry(descriptor.to_string())
            .or_insert_with(|| MetadataMap::new(indexer));
        writer.publish();
    }

    /// Recorded revisions of one node, oldest first.
    pub fn node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        lock(&self.timeline, "graph timeline")
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Recorded revisions of all nodes valid at `at`.
    pub fn snapshot(&self, at: DateTime<Utc>) -> Vec<RecordedNode> {
        lock(&self.timeline, "graph timeline")
            .values()
            .filter_map(|revisions| revisions.iter().rev().find(|r| r.is_valid_at(at)))
            .cloned()
            .collect()
    }

    /// Drops closed revisions that ended before `cutoff`.
    pub fn trim_timeline(&self, cutoff: DateTime<Utc>) {
        let mut timeline = lock(&self.timeline, "graph timeline");
        timeline.retain(|_, revisions| {
            revisions.retain(|r| r.until.map_or(true, |until| until >= cutoff));
            !revisions.is_empty()
        });
    }

    fn record(&self, state: &GraphState, keys: &BTreeSet<String>) {
        let now = Utc::now();
        let mut timeline = lock(&self.timeline, "graph timeline");
        for key in keys {
            let revision = state.node(key).map(|n| RecordedNode::capture(state, n, now));
            let revisions = timeline.entry(key.clone()).or_default();
            let unchanged = match (revisions.last(), &revision) {
                (Some(last), Some(revision)) => {
                    last.until.is_none() && last.same_revision(revision)
                }
                _ => false,
            };
            if unchanged {
                continue;
            }
            if let Some(last) = revisions.last_mut() {
                if last.until.is_none() {
                    last.until = Some(now);
                }
            }
            revisions.extend(revision);
        }
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Read handle over a committed snapshot.
pub struct GraphReader {
    state: Arc<GraphState>,
}

impl Deref for GraphReader {
    type Target = GraphState;

    fn deref(&self) -> &GraphState {
        &self.state
    }
}

/// Exclusive write handle. Changes are staged until [`GraphWriter::commit`].
pub struct GraphWriter<'a> {
    graph: &'a Graph,
    _guard: MutexGuard<'a, ()>,
    working: GraphState,
    changed: BTreeSet<String>,
    record: bool,
}

impl GraphWriter<'_> {
    /// Returns the node for `key`, creating an empty one if missing.
    pub fn set_node(&mut self, key: &str) -> &mut Node {
        self.changed.insert(key.to_string());
        self.working.node_mut(key)
    }

    /// Replaces dependency and derivation relations of `key`.
    pub fn set_targets(
        &mut self,
        key: &str,
        dependencies: Vec<Dependency>,
        derives: BTreeSet<String>,
    ) {
        self.changed.insert(key.to_string());
        self.working.set_targets(key, dependencies, derives);
    }

    pub fn delete_node(&mut self, key: &str) -> bool {
        self.changed.insert(key.to_string());
        self.working.remove_node(key)
    }

    pub fn node_timeline(&self, key: &str) -> Vec<RecordedNode> {
        self.graph.node_timeline(key)
    }

    /// Makes staged changes visible to new readers. The writer stays
    /// usable for further changes.
    pub fn commit(&mut self) {
        for key in &self.changed {
            self.working.sync_metadata(key);
        }
        self.publish();
        if self.record {
            self.graph.record(&self.working, &self.changed);
        }
        self.changed.clear();
    }

    fn publish(&mut self) {
        let snapshot = Arc::new(self.working.clone());
        match self.graph.committed.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => {
                log::warn!("Graph lock was poisoned, recovering");
                *poisoned.into_inner() = snapshot;
            }
        }
    }
}

impl Deref for GraphWriter<'_> {
    type Target = GraphState;

    fn deref(&self) -> &GraphState {
        &self.working
    }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{value_ref, Dependency, ValueState};
    use std::sync::Arc;

    fn add(w: &mut GraphWriter<'_>, key: &str, deps: Vec<Dependency>, available: bool) {
        let node = w.set_node(key);
        node.value = Some(value_ref(key.to_string()));
        node.state = if available {
            ValueState::Configured
        } else {
            ValueState::Pending
        };
        node.unavailable = !available;
        w.set_targets(key, deps, BTreeSet::new());
    }

    #[test]
    fn test_changes_invisible_until_commit() {
        let graph = Graph::new();
        let mut w = graph.write(false);
        add(&mut w, "a", vec![], true);
        assert!(graph.read().node("a").is_none());
        w.commit();
        drop(w);
        assert!(graph.read().node("a").is_some());
    }

    #[test]
    fn test_dropped_writer_discards_changes() {
        let graph = Graph::new();
        {
            let mut w = graph.write(false);
            add(&mut w, "a", vec![], true);
        }
        assert!(graph.read().is_empty());
    }

    #[test]
    fn test_reader_is_point_in_time() {
        let graph = Graph::new();
        let mut w = graph.write(false);
        add(&mut w, "a", vec![], true);
        w.commit();
        let before = graph.read();
        add(&mut w, "b", vec![], true);
        w.commit();
        drop(w);
        assert_eq!(before.len(), 1);
        assert_eq!(graph.read().len(), 2);
    }

    #[test]
    fn test_dependents_and_readiness() {
        let graph = Graph::new();
        let mut w = graph.write(false);
        add(&mut w, "b", vec![], false);
        add(&mut w, "a", vec![Dependency::on_key("needs-b", "b")], false);
        add(&mut w, "c", vec![Dependency::any_of("any-a", ["a"])], false);

        assert_eq!(w.dependents("b"), ["a"]);
        assert_eq!(w.dependents("a"), ["c"]);
        assert_eq!(w.transitive_dependents("b"), ["a", "c"]);
        assert!(!w.is_ready("a"));
        assert_eq!(w.unsatisfied_dependencies("a"), ["needs-b"]);

        w.set_node("b").unavailable = false;
        assert!(w.is_ready("a"));
        assert!(w.unsatisfied_dependencies("a").is_empty());
    }

    #[test]
    fn test_missing_dependency_not_ready() {
        let graph = Graph::new();
        let mut w = graph.write(false);
        add(&mut w, "a", vec![Dependency::on_key("needs-x", "x")], false);
        assert!(!w.is_ready("a"));
        assert_eq!(w.dependency_targets("a"), [("needs-x".to_string(), vec![])]);
    }

    #[test]
    fn test_cycle_stays_pending() {
        let graph = Graph::new();
        let mut w = graph.write(false);
        add(&mut w, "a", vec![Dependency::on_key("b", "b")], false);
        add(&mut w, "b", vec![Dependency::on_key("a", "a")], false);
        assert!(!w.is_ready("a"));
        assert!(!w.is_ready("b"));
        assert_eq!(w.unsatisfied_dependencies("a"), ["b"]);

        // An available member unblocks its partner.
        w.set_node("b").unavailable = false;
        assert!(w.is_ready("a"));
    }

    #[test]
    fn test_any_of_prefix_targets() {
        let graph = Graph::new();
        let mut w = graph.write(false);
        add(&mut w, "if/eth0", vec![], true);
        add(&mut w, "if/eth1", vec![], false);
        add(&mut w, "ig/x", vec![], true);
        add(&mut w, "r", vec![Dependency::any_of("iface", ["if/"])], false);
        let targets = w.dependency_targets("r");
        assert_eq!(targets[0].1, ["if/eth0", "if/eth1"]);
        assert!(w.is_ready("r"));
    }

    #[test]
    fn test_delete_node_unindexes() {
        let graph = Graph::new();
        let mut w = graph.write(false);
        add(&mut w, "b", vec![], true);
        add(&mut w, "a", vec![Dependency::on_key("b", "b")], false);
        assert!(w.delete_node("a"));
        assert!(w.dependents("b").is_empty());
        assert!(!w.delete_node("a"));
    }

    #[test]
    fn test_metadata_map_synced_on_commit() {
        let graph = Graph::new();
        graph.register_metadata_map("iface", None);
        let mut w = graph.write(false);
        let node = w.set_node("config/iface/eth0");
        node.descriptor = Some("iface".into());
        node.label = "eth0".into();
        node.metadata = Some(Arc::new(7u32));
        w.commit();
        drop(w);

        let reader = graph.read();
        let map = reader.metadata_map("iface").unwrap();
        assert_eq!(map.get_as::<u32>("eth0"), Some(&7));

        let mut w = graph.write(false);
        w.delete_node("config/iface/eth0");
        w.commit();
        drop(w);
        assert!(graph.read().metadata_map("iface").unwrap().is_empty());
    }

    #[test]
    fn test_timeline_recording() {
        let graph = Graph::new();
        let before = Utc::now();
        let mut w = graph.write(true);
        add(&mut w, "a", vec![], false);
        w.commit();
        w.set_node("a").state = ValueState::Configured;
        w.commit();
        w.delete_node("a");
        w.commit();
        drop(w);

        let timeline = graph.node_timeline("a");
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].state, ValueState::Pending);
        assert_eq!(timeline[1].state, ValueState::Configured);
        assert!(timeline.iter().all(|r| r.until.is_some()));
        assert!(graph.snapshot(before).is_empty());
    }

    #[test]
    fn test_unchanged_commit_not_recorded_twice() {
        let graph = Graph::new();
        let mut w = graph.write(true);
        add(&mut w, "a", vec![], true);
        w.commit();
        w.set_node("a");
        w.commit();
        drop(w);
        assert_eq!(graph.node_timeline("a").len(), 1);
        assert_eq!(graph.snapshot(Utc::now()).len(), 1);
    }
}
