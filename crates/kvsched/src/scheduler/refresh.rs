//! Refresh of the graph from the southbound.
//!
//! Descriptors are walked in retrieve-dependency order. Whatever a
//! descriptor retrieves becomes available; every tracked value nobody
//! retrieved becomes unavailable.

use std::collections::BTreeSet;

use super::txn::KvForTxn;
use crate::descriptor::{DescriptorRef, Registry};
use crate::graph::node::state_to_origin;
use crate::graph::GraphWriter;
use crate::kv::{KvWithMetadata, ValueOrigin, ValueState};

/// Values of a resync transaction, used to correlate retrieved values on
/// the very first resync.
pub(crate) struct ResyncData<'v> {
    pub first: bool,
    pub values: &'v [KvForTxn],
}

pub(crate) struct Refresher<'a, 'g> {
    registry: &'a Registry,
    graph: &'a mut GraphWriter<'g>,
    updated: &'a mut BTreeSet<String>,
    log_graph_walk: bool,
    refreshed: BTreeSet<String>,
}

impl<'a, 'g> Refresher<'a, 'g> {
    pub fn new(
        registry: &'a Registry,
        graph: &'a mut GraphWriter<'g>,
        updated: &'a mut BTreeSet<String>,
        log_graph_walk: bool,
    ) -> Self {
        Self {
            registry,
            graph,
            updated,
            log_graph_walk,
            refreshed: BTreeSet::new(),
        }
    }

    /// Refreshes values of all descriptors, or only of those owning one of
    /// `keys` when given.
    pub fn refresh(
        mut self,
        keys: Option<&BTreeSet<String>>,
        resync: Option<&ResyncData<'_>>,
        verbose: bool,
    ) {
        let keys = keys.filter(|k| !k.is_empty());
        if self.log_graph_walk {
            log::debug!("[BEGIN] refresh graph (keys = {:?})", keys);
        }

        for descriptor in self.registry.all_descriptors() {
            let name = descriptor.name().to_string();
            let nodes: Vec<String> = self
                .graph
                .descriptor_nodes(&name)
                .map(|n| n.key().to_string())
                .collect();

            if keys.is_some_and(|k| !k.iter().any(|key| descriptor.key_selector(key))) {
                self.skip_refresh(&nodes, None);
                continue;
            }

            let correlate: Vec<KvWithMetadata> = match resync {
                Some(resync) if resync.first => resync
                    .values
                    .iter()
                    .filter(|kv| descriptor.key_selector(&kv.key))
                    .filter_map(|kv| {
                        kv.value.clone().map(|value| KvWithMetadata {
                            key: kv.key.clone(),
                            value,
                            metadata: None,
                            origin: kv.origin,
                        })
                    })
                    .collect(),
                _ => nodes
                    .iter()
                    .filter_map(|key| self.graph.node(key))
                    .filter(|n| n.is_available())
                    .filter_map(|n| n.to_kv_with_metadata())
                    .collect(),
            };

            if !descriptor.supports_retrieve() {
                // A resync cannot confirm NB values it is unable to read back;
                // left unrefreshed, they turn MISSING.
                let skipped: Vec<String> = match resync {
                    Some(_) => nodes
                        .iter()
                        .filter(|key| {
                            keys.is_some_and(|k| !k.contains(*key))
                                || self
                                    .graph
                                    .node(key)
                                    .map_or(true, |n| n.origin() != ValueOrigin::FromNb)
                        })
                        .cloned()
                        .collect(),
                    None => nodes,
                };
                self.skip_refresh(&skipped, None);
                continue;
            }
            let retrieved = match descriptor.retrieve(&correlate) {
                Ok(retrieved) => retrieved,
                Err(e) => {
                    log::error!("Failed to retrieve values for descriptor '{}': {}", name, e);
                    self.skip_refresh(&nodes, None);
                    continue;
                }
            };
            if verbose {
                log_retrieved(&name, &retrieved);
            }

            if let Some(keys) = keys {
                self.skip_refresh(&nodes, Some(keys));
            }

            for mut kv in retrieved {
                if keys.is_some_and(|k| !k.contains(&kv.key)) {
                    continue;
                }
                if !self.valid_retrieved(&kv, &descriptor) {
                    continue;
                }
                if kv.origin == ValueOrigin::Unknown {
                    kv.origin = self.resolve_origin(&kv.key, &correlate);
                }
                self.refresh_value(kv, &descriptor);
            }

            // Metadata of NB values that are gone from SB is stale.
            for key in &nodes {
                if self.refreshed.contains(key) {
                    continue;
                }
                let stale = self
                    .graph
                    .node(key)
                    .is_some_and(|n| n.origin() == ValueOrigin::FromNb && n.metadata().is_some());
                if stale {
                    self.graph.set_node(key).metadata = None;
                }
            }
        }

        let unrefreshed: Vec<String> = self
            .graph
            .keys()
            .filter(|key| !self.refreshed.contains(*key))
            .map(str::to_string)
            .collect();
        for key in unrefreshed {
            self.refresh_unavail_node(&key);
        }

        if self.log_graph_walk {
            log::debug!("[END] refresh graph");
        }
    }

    fn valid_retrieved(&self, kv: &KvWithMetadata, descriptor: &DescriptorRef) -> bool {
        if kv.key.is_empty() {
            log::warn!(
                "Descriptor '{}' retrieved value with empty key",
                descriptor.name()
            );
            return false;
        }
        if self.refreshed.contains(&kv.key) {
            log::warn!(
                "Descriptor '{}' retrieved key '{}' that was already refreshed",
                descriptor.name(),
                kv.key
            );
            return false;
        }
        if !descriptor.key_selector(&kv.key) {
            log::warn!(
                "Descriptor '{}' retrieved key '{}' outside of its key space",
                descriptor.name(),
                kv.key
            );
            return false;
        }
        true
    }

    /// Origin of a retrieved value that the descriptor did not classify.
    fn resolve_origin(&self, key: &str, correlate: &[KvWithMetadata]) -> ValueOrigin {
        if let Some(kv) = correlate.iter().find(|kv| kv.key == key) {
            if kv.origin != ValueOrigin::Unknown {
                return kv.origin;
            }
        }
        if let Some(last) = self.graph.node_timeline(key).last() {
            let origin = state_to_origin(last.state);
            if origin != ValueOrigin::Unknown {
                return origin;
            }
        }
        ValueOrigin::FromSb
    }

    /// Marks nodes (and their derived values) as refreshed without retrieving
    /// them.
    fn skip_refresh(&mut self, nodes: &[String], except: Option<&BTreeSet<String>>) {
        for key in nodes {
            if except.is_some_and(|e| e.contains(key)) {
                continue;
            }
            self.refreshed.insert(key.clone());
            let derived: Vec<String> = self
                .graph
                .derived_nodes(key)
                .into_iter()
                .map(|n| n.key().to_string())
                .collect();
            self.refreshed.extend(derived);
        }
    }

    fn refresh_value(&mut self, kv: KvWithMetadata, descriptor: &DescriptorRef) {
        let key = kv.key.as_str();
        let node = self.graph.set_node(key);
        node.label = descriptor.key_label(key);
        node.value = Some(kv.value.clone());
        if descriptor.with_metadata() {
            node.metadata = kv.metadata.clone();
        }
        self.refresh_avail_node(key, kv.origin, false, key);

        let mut obsolete: BTreeSet<String> = self
            .graph
            .derived_nodes(key)
            .into_iter()
            .map(|n| n.key().to_string())
            .collect();
        let derives = descriptor.derived_values(key, kv.value.as_ref());
        for derived in &derives {
            obsolete.remove(&derived.key);
        }

        // Obsolete derived values stay as targets until refreshed as
        // unavailable.
        let mut derive_keys: BTreeSet<String> = derives.iter().map(|d| d.key.clone()).collect();
        derive_keys.extend(obsolete.iter().cloned());
        let dependencies = descriptor.dependencies(key, kv.value.as_ref());
        self.graph.set_targets(key, dependencies, derive_keys);

        for derived in derives {
            self.graph.set_node(&derived.key).value = Some(derived.value.clone());
            let dependencies = self
                .registry
                .descriptor_for_key(&derived.key)
                .map(|d| d.dependencies(&derived.key, derived.value.as_ref()))
                .unwrap_or_default();
            self.graph
                .set_targets(&derived.key, dependencies, BTreeSet::new());
            self.refresh_avail_node(&derived.key, kv.origin, true, key);
        }

        for key in obsolete {
            self.refresh_unavail_node(&key);
        }
    }

    fn refresh_avail_node(&mut self, key: &str, origin: ValueOrigin, derived: bool, base_key: &str) {
        if self.log_graph_walk {
            log::debug!("  -> refresh available value (key = {})", key);
        }
        let Some(node) = self.graph.node(key) else {
            return;
        };
        if derived {
            if node.value().is_none() {
                self.graph.delete_node(key);
                return;
            }
            if self.refreshed.contains(key) {
                log::warn!("Derived key '{}' was already refreshed", key);
            }
        }

        let available = node.is_available();
        let state = node.state();
        self.refreshed.insert(key.to_string());

        let descriptor = self.registry.descriptor_for_key(key);
        let node = self.graph.set_node(key);
        node.unavailable = false;
        match state {
            ValueState::Nonexistent => {
                node.state = if origin == ValueOrigin::FromSb {
                    ValueState::Obtained
                } else {
                    ValueState::Discovered
                };
            }
            ValueState::Pending => node.state = ValueState::Configured,
            _ => {}
        }
        let changed = !available || node.state != state;
        node.descriptor = descriptor.map(|d| d.name().to_string());
        node.derived_from = derived.then(|| base_key.to_string());
        if changed {
            self.updated.insert(base_key.to_string());
        }
    }

    fn refresh_unavail_node(&mut self, key: &str) {
        if self.log_graph_walk {
            log::debug!("  -> refresh unavailable value (key = {})", key);
        }
        let Some(node) = self.graph.node(key) else {
            return;
        };
        self.refreshed.insert(key.to_string());
        if node.is_available() {
            self.updated.insert(node.base_key().to_string());
        }
        let state = node.state();
        let removal_requested = node
            .last_update()
            .map_or(true, |u| u.value.is_none());
        if node.origin() == ValueOrigin::FromSb
            || (state == ValueState::Discovered && removal_requested)
        {
            // Nothing tracks it apart from the southbound.
            self.graph.delete_node(key);
            return;
        }

        let node = self.graph.set_node(key);
        node.unavailable = true;
        match state {
            ValueState::Unimplemented => {}
            ValueState::Configured | ValueState::Discovered => {
                node.state = if removal_requested {
                    ValueState::Removed
                } else {
                    ValueState::Missing
                };
            }
            _ => {}
        }
    }
}

fn log_retrieved(descriptor: &str, retrieved: &[KvWithMetadata]) {
    let mut listing = String::new();
    for kv in retrieved {
        listing.push_str(&format!(
            "\n  - key: {} ({}), value: {:?}, metadata: {}",
            kv.key,
            kv.origin,
            kv.value,
            if kv.metadata.is_some() { "<set>" } else { "<none>" }
        ));
    }
    log::debug!(
        "Descriptor '{}' retrieved {} value(s):{}",
        descriptor,
        retrieved.len(),
        listing
    );
}
