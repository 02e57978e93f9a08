//! Descriptor registry with a bounded LRU key -> descriptor cache.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use thiserror::Error;

use super::DescriptorRef;

/// Default capacity of the key -> descriptor cache.
pub const DEFAULT_CACHE_CAPACITY: u64 = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Descriptor name must not be empty")]
    EmptyName,

    #[error("Descriptor '{0}' is already registered")]
    DuplicateDescriptor(String),

    #[error("Descriptor '{new}' overlaps key space of '{existing}' (probe key '{probe}')")]
    OverlappingKeySpace {
        new: String,
        existing: String,
        probe: String,
    },

    #[error("Retrieve dependency cycle between descriptors: {}", cycle.join(", "))]
    RetrieveDependencyCycle { cycle: Vec<String> },
}

#[derive(Default)]
struct RegistryState {
    /// Registration order.
    descriptors: Vec<DescriptorRef>,
    /// Topologically sorted by retrieve dependencies.
    ordered: Vec<DescriptorRef>,
}

/// Holds all registered descriptors and resolves key ownership.
pub struct Registry {
    state: RwLock<RegistryState>,
    cache: Cache<String, Option<DescriptorRef>>,
}

impl Registry {
    pub fn new(cache_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(cache_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            state: RwLock::new(RegistryState::default()),
            cache,
        }
    }

    /// Adds a descriptor.
    ///
    /// Rejects duplicate names, key spaces overlapping an already registered
    /// descriptor and retrieve-dependency cycles. A rejected descriptor is
    /// not kept.
    pub fn register(&self, descriptor: DescriptorRef) -> Result<(), RegistryError> {
        let name = descriptor.name().to_string();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut state = self.write_state();
        if state.descriptors.iter().any(|d| d.name() == name) {
            return Err(RegistryError::DuplicateDescriptor(name));
        }
        for existing in &state.descriptors {
            check_overlap(&descriptor, existing)?;
        }

        let mut descriptors = state.descriptors.clone();
        descriptors.push(descriptor);
        let ordered = topological_order(&descriptors)?;

        state.descriptors = descriptors;
        state.ordered = ordered;
        // Cached misses may now resolve to the new descriptor.
        self.cache.invalidate_all();
        drop(state);

        log::info!("Registered descriptor '{}'", name);
        Ok(())
    }

    /// Resolves the descriptor owning `key`.
    pub fn descriptor_for_key(&self, key: &str) -> Option<DescriptorRef> {
        if let Some(cached) = self.cache.get(key) {
            return cached;
        }

        let state = self.read_state();
        let mut matching = state.descriptors.iter().filter(|d| d.key_selector(key));
        let found = matching.next().cloned();
        if let Some(other) = matching.next() {
            if let Some(first) = &found {
                log::warn!(
                    "Key '{}' is claimed by descriptors '{}' and '{}', using '{}'",
                    key,
                    first.name(),
                    other.name(),
                    first.name()
                );
            }
        }
        // Still under the read lock: a registration in between would leave
        // a stale miss behind.
        self.cache.insert(key.to_string(), found.clone());
        drop(state);
        found
    }

    pub fn descriptor(&self, name: &str) -> Option<DescriptorRef> {
        self.read_state()
            .descriptors
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// All descriptors, ordered so that every descriptor comes after the
    /// descriptors listed in its `retrieve_dependencies`.
    pub fn all_descriptors(&self) -> Vec<DescriptorRef> {
        self.read_state().ordered.clone()
    }

    pub fn nb_key_prefixes(&self) -> Vec<String> {
        self.read_state()
            .descriptors
            .iter()
            .filter_map(|d| d.nb_key_prefix().map(str::to_string))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_state().descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_state(&self) -> RwLockReadGuard<'_, RegistryState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Descriptor registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, RegistryState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Descriptor registry lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

/// Probes each descriptor's NB prefix against the other's key selector.
fn check_overlap(new: &DescriptorRef, existing: &DescriptorRef) -> Result<(), RegistryError> {
    let overlap = |probe: &str| RegistryError::OverlappingKeySpace {
        new: new.name().to_string(),
        existing: existing.name().to_string(),
        probe: probe.to_string(),
    };
    if let Some(prefix) = new.nb_key_prefix() {
        if existing.key_selector(prefix) {
            return Err(overlap(prefix));
        }
    }
    if let Some(prefix) = existing.nb_key_prefix() {
        if new.key_selector(prefix) {
            return Err(overlap(prefix));
        }
    }
    Ok(())
}

/// Kahn's algorithm over retrieve dependencies. Ties keep registration
/// order; dependencies on unknown descriptors are ignored.
fn topological_order(descriptors: &[DescriptorRef]) -> Result<Vec<DescriptorRef>, RegistryError> {
    let index: HashMap<&str, usize> = descriptors
        .iter()
        .enumerate()
        .map(|(i, d)| (d.name(), i))
        .collect();

    let mut in_degree = vec![0usize; descriptors.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); descriptors.len()];
    for (i, descriptor) in descriptors.iter().enumerate() {
        let deps: BTreeSet<String> = descriptor.retrieve_dependencies().into_iter().collect();
        for dep in deps {
            if let Some(&j) = index.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[j].push(i);
            }
        }
    }

    let mut ready: BTreeSet<usize> = (0..descriptors.len())
        .filter(|&i| in_degree[i] == 0)
        .collect();
    let mut ordered = Vec::with_capacity(descriptors.len());
    while let Some(i) = ready.pop_first() {
        ordered.push(descriptors[i].clone());
        for &dependent in &dependents[i] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if ordered.len() < descriptors.len() {
        let mut cycle: Vec<String> = (0..descriptors.len())
            .filter(|&i| in_degree[i] > 0)
            .map(|i| descriptors[i].name().to_string())
            .collect();
        cycle.sort();
        return Err(RegistryError::RetrieveDependencyCycle { cycle });
    }
    Ok(ordered)
}
