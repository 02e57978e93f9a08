pub mod config;
pub mod descriptor;
pub mod error;
pub mod graph;
pub mod kv;
pub mod scheduler;
pub mod telemetry;

pub use config::{load_config, load_config_from_str, RetryConfig, SchedulerConfig};
pub use descriptor::{DescriptorRef, KvDescriptor, Registry, RegistryError};
pub use error::{
    ConfigError, KeyWithError, KvError, Result, SchedulerError, TxnError, VerificationError,
    VerificationErrorKind,
};
pub use graph::{MetadataMap, RecordedNode};
pub use kv::{
    key_selector, value_ref, BaseValueStatus, Dependency, DescriptorError, KeySelector,
    KeyValuePair, KvWithMetadata, Metadata, TxnOperation, Value, ValueOrigin, ValueRef,
    ValueState, ValueStatus,
};
pub use scheduler::{
    RecordedKvPair, RecordedTxn, RecordedTxnOp, ResyncType, RetryPolicy, Scheduler, Transaction,
    TxnOptions, TxnOutcome, TxnType, View,
};
pub use telemetry::{init_logging, LogFormat};
