use std::fmt;
use std::sync::Arc;

/// Predicate over keys.
pub type KeySelector = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Builds a [`KeySelector`] from a closure.
pub fn key_selector<F>(f: F) -> KeySelector
where
    F: Fn(&str) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Dependency satisfied by any available key matching one of the prefixes
/// (all keys if there are none) and the optional selector.
#[derive(Clone, Default)]
pub struct AnyOfDependency {
    pub key_prefixes: Vec<String>,
    pub key_selector: Option<KeySelector>,
}

impl AnyOfDependency {
    pub fn matches(&self, key: &str) -> bool {
        let prefix_ok = self.key_prefixes.is_empty()
            || self.key_prefixes.iter().any(|p| key.starts_with(p.as_str()));
        prefix_ok && self.key_selector.as_ref().map_or(true, |sel| sel(key))
    }
}

impl fmt::Debug for AnyOfDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyOfDependency")
            .field("key_prefixes", &self.key_prefixes)
            .field("key_selector", &self.key_selector.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum DependencyTarget {
    Key(String),
    AnyOf(AnyOfDependency),
}

/// A value must not be created until each of its dependencies is satisfied.
/// Labels are unique per value and are reported for pending values.
#[derive(Debug, Clone)]
pub struct Dependency {
    pub label: String,
    pub target: DependencyTarget,
}

impl Dependency {
    /// Dependency on one exact key.
    pub fn on_key(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            target: DependencyTarget::Key(key.into()),
        }
    }

    /// Dependency on any key under one of the given prefixes.
    pub fn any_of<I, S>(label: impl Into<String>, key_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            label: label.into(),
            target: DependencyTarget::AnyOf(AnyOfDependency {
                key_prefixes: key_prefixes.into_iter().map(Into::into).collect(),
                key_selector: None,
            }),
        }
    }

    /// Narrows an any-of dependency with a key predicate. No effect on
    /// single-key dependencies.
    pub fn with_selector<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        if let DependencyTarget::AnyOf(any_of) = &mut self.target {
            any_of.key_selector = Some(Arc::new(f));
        }
        self
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.target {
            DependencyTarget::Key(k) => k == key,
            DependencyTarget::AnyOf(any_of) => any_of.matches(key),
        }
    }

    pub fn key(&self) -> Option<&str> {
        match &self.target {
            DependencyTarget::Key(k) => Some(k),
            DependencyTarget::AnyOf(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_dependency_matches_exact() {
        let dep = Dependency::on_key("iface", "config/iface/eth0");
        assert!(dep.matches("config/iface/eth0"));
        assert!(!dep.matches("config/iface/eth01"));
        assert_eq!(dep.key(), Some("config/iface/eth0"));
    }

    #[test]
    fn test_any_of_with_prefixes_and_selector() {
        let dep = Dependency::any_of("some-route", ["config/route/", "config/static/"])
            .with_selector(|k| k.ends_with("/default"));
        assert!(dep.matches("config/route/default"));
        assert!(dep.matches("config/static/default"));
        assert!(!dep.matches("config/route/other"));
        assert!(!dep.matches("config/iface/default"));
        assert!(dep.key().is_none());
    }

    #[test]
    fn test_any_of_without_prefixes_matches_all() {
        let dep = Dependency::any_of("anything", Vec::<String>::new());
        assert!(dep.matches("whatever"));
    }
}
