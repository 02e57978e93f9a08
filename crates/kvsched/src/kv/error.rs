use thiserror::Error;

/// Errors returned by descriptor callbacks.
///
/// These never escape the scheduler as process-level failures; they are
/// captured into the state of the affected value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("invalid value: {reason}")]
    InvalidValue {
        reason: String,
        invalid_fields: Vec<String>,
    },

    #[error("operation failed: {0}")]
    Operation(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl DescriptorError {
    pub fn invalid<I, S>(reason: impl Into<String>, invalid_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DescriptorError::InvalidValue {
            reason: reason.into(),
            invalid_fields: invalid_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Default retriable classification used when a descriptor does not
    /// override `is_retriable_failure`.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DescriptorError::Operation(_) | DescriptorError::Transient(_)
        )
    }

    pub fn invalid_fields(&self) -> &[String] {
        match self {
            DescriptorError::InvalidValue { invalid_fields, .. } => invalid_fields,
            _ => &[],
        }
    }
}
