//! Key-value model shared by the scheduler and descriptors.
//!
//! Keys are plain strings; values are type-erased [`Value`] handles compared
//! through the owning descriptor; metadata is an opaque token the scheduler
//! stores and hands back without looking inside.

pub mod dependency;
pub mod error;
pub mod status;
pub mod value;

pub use dependency::{key_selector, AnyOfDependency, Dependency, DependencyTarget, KeySelector};
pub use error::DescriptorError;
pub use status::{BaseValueStatus, TxnOperation, ValueState, ValueStatus};
pub use value::{
    equal_values, format_value, value_ref, KeyValuePair, KvWithMetadata, Metadata, Value,
    ValueOrigin, ValueRef,
};
