use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt::Write as _;
use std::ops::Bound;
use std::sync::Arc;

use super::metadata::MetadataMap;
use super::node::Node;
use crate::kv::{format_value, Dependency, DependencyTarget, ValueOrigin, ValueState};

/// Committed (or staged) content of the graph.
///
/// Nodes are shared between revisions and copied only when modified.
#[derive(Clone, Default)]
pub struct GraphState {
    nodes: BTreeMap<String, Arc<Node>>,
    /// Target key -> keys of nodes with a single-key dependency on it.
    dependents: HashMap<String, BTreeSet<String>>,
    /// Nodes with at least one any-of dependency.
    any_of_sources: BTreeSet<String>,
    pub(super) metadata: HashMap<String, MetadataMap>,
}

impl GraphState {
    pub fn node(&self, key: &str) -> Option<&Node> {
        self.nodes.get(key).map(Arc::as_ref)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Nodes ordered by key.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().map(Arc::as_ref)
    }

    pub fn is_available(&self, key: &str) -> bool {
        self.node(key).is_some_and(Node::is_available)
    }

    pub fn metadata_map(&self, descriptor: &str) -> Option<&MetadataMap> {
        self.metadata.get(descriptor)
    }

    /// Values that are not derived.
    pub fn base_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes().filter(|n| !n.is_derived())
    }

    /// Base values requested from NB.
    pub fn nb_base_nodes(&self) -> impl Iterator<Item = &Node> {
        self.base_nodes()
            .filter(|n| n.state() != ValueState::Obtained)
    }

    /// Base values obtained from SB.
    pub fn sb_base_nodes(&self) -> impl Iterator<Item = &Node> {
        self.base_nodes()
            .filter(|n| n.state() == ValueState::Obtained)
    }

    pub fn descriptor_nodes<'a>(&'a self, descriptor: &'a str) -> impl Iterator<Item = &'a Node> {
        self.base_nodes()
            .filter(move |n| n.descriptor() == Some(descriptor))
    }

    /// Existing nodes matching each dependency label of `key`.
    pub fn dependency_targets(&self, key: &str) -> Vec<(String, Vec<String>)> {
        let Some(node) = self.node(key) else {
            return Vec::new();
        };
        node.dependencies()
            .iter()
            .map(|dep| (dep.label.clone(), self.matching_keys(dep)))
            .collect()
    }

    fn matching_keys(&self, dep: &Dependency) -> Vec<String> {
        match &dep.target {
            DependencyTarget::Key(key) => {
                if self.contains(key) {
                    vec![key.clone()]
                } else {
                    Vec::new()
                }
            }
            DependencyTarget::AnyOf(any_of) => {
                let mut keys = BTreeSet::new();
                if any_of.key_prefixes.is_empty() {
                    keys.extend(self.keys().filter(|k| any_of.matches(k)).map(str::to_string));
                } else {
                    for prefix in &any_of.key_prefixes {
                        keys.extend(
                            self.nodes
                                .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
                                .map(|(k, _)| k)
                                .take_while(|k| k.starts_with(prefix.as_str()))
                                .filter(|k| any_of.matches(k))
                                .cloned(),
                        );
                    }
                }
                keys.into_iter().collect()
            }
        }
    }

    /// Keys of nodes that directly depend on `key`, sorted.
    pub fn dependents(&self, key: &str) -> Vec<String> {
        let mut result: BTreeSet<String> = self
            .dependents
            .get(key)
            .map(|sources| {
                sources
                    .iter()
                    .filter(|s| self.contains(s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        for source in &self.any_of_sources {
            if let Some(node) = self.node(source) {
                let depends = node.dependencies().iter().any(|dep| {
                    matches!(dep.target, DependencyTarget::AnyOf(_)) && dep.matches(key)
                });
                if depends {
                    result.insert(source.clone());
                }
            }
        }
        result.into_iter().collect()
    }

    /// Keys of all nodes that depend on `key` directly or transitively,
    /// in breadth-first order.
    pub fn transitive_dependents(&self, key: &str) -> Vec<String> {
        let mut visited = BTreeSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([key.to_string()]);
        visited.insert(key.to_string());
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents(&current) {
                if visited.insert(dependent.clone()) {
                    order.push(dependent.clone());
                    queue.push_back(dependent);
                }
            }
        }
        order
    }

    /// Existing nodes derived from `key`, sorted by key.
    pub fn derived_nodes(&self, key: &str) -> Vec<&Node> {
        self.node(key)
            .map(|node| {
                node.derived_keys()
                    .iter()
                    .filter_map(|k| self.node(k))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether every dependency of `key` has at least one available target.
    ///
    /// Values depending on each other in a cycle never satisfy one another;
    /// they stay pending until something outside the cycle makes a member
    /// available.
    pub fn is_ready(&self, key: &str) -> bool {
        let Some(node) = self.node(key) else {
            return false;
        };
        if node.origin() == ValueOrigin::FromSb {
            return true;
        }
        self.dependency_targets(key).iter().all(|(_, targets)| {
            targets.iter().any(|target| {
                self.node(target).is_some_and(|n| {
                    n.is_available() && n.state() != ValueState::Removed
                })
            })
        })
    }

    /// Labels of dependencies of `key` without any available target.
    pub fn unsatisfied_dependencies(&self, key: &str) -> Vec<String> {
        self.dependency_targets(key)
            .into_iter()
            .filter(|(_, targets)| !targets.iter().any(|t| self.is_available(t)))
            .map(|(label, _)| label)
            .collect()
    }

    /// Human-readable dump of all nodes.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "GRAPH ({} nodes)", self.len());
        for node in self.nodes() {
            let descriptor = node
                .descriptor()
                .map(|d| format!("[{}] ", d))
                .unwrap_or_default();
            let label = if node.label() != node.key() {
                format!("{} ({})", node.key(), node.label())
            } else {
                node.key().to_string()
            };
            let unavailable = if node.is_available() { "" } else { "<UNAVAILABLE> " };
            let last_update = node
                .last_update()
                .map(|u| format!("TXN-{} {}", u.txn_seq, u.operation))
                .unwrap_or_else(|| "-".to_string());
            let _ = writeln!(
                out,
                "{}{}  {}{} {}",
                descriptor,
                label,
                unavailable,
                last_update,
                node.state()
            );
            let _ = writeln!(out, "  {}", format_value(node.value()));
            let targets = self.dependency_targets(node.key());
            if !targets.is_empty() {
                let _ = writeln!(out, "  Depends on:");
                for (label, keys) in targets {
                    if keys.is_empty() {
                        let _ = writeln!(out, "   - {} -> <UNAVAILABLE>", label);
                    } else {
                        let _ = writeln!(out, "   - {} -> {}", label, keys.join(" "));
                    }
                }
            }
            if !node.derived_keys().is_empty() {
                let _ = writeln!(out, "  Derives:");
                for derived in node.derived_keys() {
                    let _ = writeln!(out, "   - {}", derived);
                }
            }
            let dependents = self.dependents(node.key());
            if !dependents.is_empty() {
                let _ = writeln!(out, "  Dependency for: {}", dependents.join(" "));
            }
            if let Some(base) = &node.derived_from {
                let _ = writeln!(out, "  Derived from: {}", base);
            }
            if let Some(metadata) = node.metadata() {
                let _ = writeln!(out, "  Metadata: {:?}", metadata);
            }
            if let Some(err) = node.error() {
                let _ = writeln!(out, "  Error: {}", err.error);
            }
        }
        out
    }

    pub(super) fn node_mut(&mut self, key: &str) -> &mut Node {
        let node = self
            .nodes
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Node::new(key)));
        Arc::make_mut(node)
    }

    pub(super) fn set_targets(
        &mut self,
        key: &str,
        dependencies: Vec<Dependency>,
        derives: BTreeSet<String>,
    ) {
        self.unindex(key);
        for dep in &dependencies {
            match &dep.target {
                DependencyTarget::Key(target) => {
                    self.dependents
                        .entry(target.clone())
                        .or_default()
                        .insert(key.to_string());
                }
                DependencyTarget::AnyOf(_) => {
                    self.any_of_sources.insert(key.to_string());
                }
            }
        }
        let node = self.node_mut(key);
        node.dependencies = dependencies;
        node.derives = derives;
    }

    pub(super) fn remove_node(&mut self, key: &str) -> bool {
        self.unindex(key);
        self.nodes.remove(key).is_some()
    }

    fn unindex(&mut self, key: &str) {
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        for dep in node.dependencies() {
            if let DependencyTarget::Key(target) = &dep.target {
                if let Some(sources) = self.dependents.get_mut(target) {
                    sources.remove(key);
                    if sources.is_empty() {
                        self.dependents.remove(target);
                    }
                }
            }
        }
        self.any_of_sources.remove(key);
    }

    /// Re-synchronizes metadata maps with the current content of `key`.
    pub(super) fn sync_metadata(&mut self, key: &str) {
        for map in self.metadata.values_mut() {
            map.remove_key(key);
        }
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        if node.is_derived() {
            return;
        }
        let (Some(descriptor), Some(metadata)) = (node.descriptor(), node.metadata()) else {
            return;
        };
        if let Some(map) = self.metadata.get_mut(descriptor) {
            map.put(&node.key, &node.label, metadata.clone());
        }
    }
}
