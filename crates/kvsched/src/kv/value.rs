use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};

/// A configuration payload tracked by the scheduler.
///
/// Blanket-implemented for every `PartialEq + Debug + Send + Sync` type, so
/// plain structs can be submitted without any extra glue.
pub trait Value: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    /// Structural equality. Values of different concrete types are never equal.
    fn equals(&self, other: &dyn Value) -> bool;
}

impl<T> Value for T
where
    T: Any + Send + Sync + fmt::Debug + PartialEq,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn equals(&self, other: &dyn Value) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }
}

impl dyn Value {
    /// Returns the concrete value if it is of type `T`.
    pub fn downcast_ref<T: Value>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Shared handle to a value.
pub type ValueRef = Arc<dyn Value>;

/// Opaque descriptor-owned data attached to a created value.
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Wraps a concrete value into a shared handle.
pub fn value_ref<V: Value>(value: V) -> ValueRef {
    Arc::new(value)
}

/// Where a value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueOrigin {
    #[default]
    Unknown,
    FromNb,
    FromSb,
}

impl fmt::Display for ValueOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueOrigin::Unknown => "unknown",
            ValueOrigin::FromNb => "from-NB",
            ValueOrigin::FromSb => "from-SB",
        };
        f.write_str(s)
    }
}

/// Key paired with a value, as produced by `derived_values`.
#[derive(Debug, Clone)]
pub struct KeyValuePair {
    pub key: String,
    pub value: ValueRef,
}

impl KeyValuePair {
    pub fn new<V: Value>(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value: Arc::new(value),
        }
    }
}

/// A retrieved (or correlated) value together with its metadata and origin.
#[derive(Debug, Clone)]
pub struct KvWithMetadata {
    pub key: String,
    pub value: ValueRef,
    pub metadata: Option<Metadata>,
    pub origin: ValueOrigin,
}

impl KvWithMetadata {
    pub fn new<V: Value>(key: impl Into<String>, value: V) -> Self {
        Self {
            key: key.into(),
            value: Arc::new(value),
            metadata: None,
            origin: ValueOrigin::Unknown,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_origin(mut self, origin: ValueOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// Compares two optional values with structural equality.
pub fn equal_values(a: Option<&ValueRef>, b: Option<&ValueRef>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.equals(b.as_ref()),
        _ => false,
    }
}

/// Renders an optional value for logs and records.
pub fn format_value(value: Option<&ValueRef>) -> String {
    match value {
        Some(value) => format!("{:?}", value),
        None => "<nil>".to_string(),
    }
}

pub(crate) fn serialize_value<S: Serializer>(
    value: &Option<ValueRef>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(value) => serializer.serialize_some(&format!("{:?}", value)),
        None => serializer.serialize_none(),
    }
}
