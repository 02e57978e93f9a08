use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::descriptor::RegistryError;
use crate::kv::{DescriptorError, TxnOperation};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler is closed")]
    Closed,

    #[error("Transaction queue is full (capacity {0})")]
    QueueFull(usize),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Timed out waiting for transaction result")]
    WaitTimeout,

    #[error("Unknown descriptor: {0}")]
    UnknownDescriptor(String),

    #[error("Descriptor '{0}' does not support retrieve")]
    RetrieveUnsupported(String),

    #[error("Retrieve failed for descriptor '{descriptor}': {source}")]
    Retrieve {
        descriptor: String,
        #[source]
        source: DescriptorError,
    },

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Kind of mismatch detected when verifying applied values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationErrorKind {
    ExpectedToExist,
    ExpectedToNotExist,
    NotEquivalent,
}

impl fmt::Display for VerificationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerificationErrorKind::ExpectedToExist => "value is expected to exist",
            VerificationErrorKind::ExpectedToNotExist => "value is expected to not exist",
            VerificationErrorKind::NotEquivalent => {
                "applied value is not equivalent with the refreshed one"
            }
        };
        f.write_str(s)
    }
}

/// Applied value does not match what a refresh found in the southbound.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("verification failed for '{key}': {kind}")]
pub struct VerificationError {
    pub key: String,
    pub kind: VerificationErrorKind,
}

/// Error attached to one key of a transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Verification(#[from] VerificationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyWithError {
    pub key: String,
    pub operation: TxnOperation,
    pub error: KvError,
}

/// Failure of one or more values of a transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct TxnError {
    pub txn_seq: u64,
    pub kv_errors: Vec<KeyWithError>,
}

impl TxnError {
    pub fn error_for(&self, key: &str) -> Option<&KvError> {
        self.kv_errors
            .iter()
            .find(|e| e.key == key)
            .map(|e| &e.error)
    }
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transaction {} failed for {} value(s):",
            self.txn_seq,
            self.kv_errors.len()
        )?;
        for e in &self.kv_errors {
            write!(f, " [{} {}: {}]", e.operation, e.key, e.error)?;
        }
        Ok(())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
