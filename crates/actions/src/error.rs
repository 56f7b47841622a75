//! Action-level error type.

use thiserror::Error;

/// Errors returned by an [`ActionRunner`](crate::ActionRunner).
///
/// The step executor uses the variant to decide retry behaviour:
/// - `Retryable`: the attempt failed but another attempt may succeed.
/// - `Fatal`: retrying cannot help (bad configuration, missing source).
/// - `Spawn`: the process could not be started at all; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Transient failure, e.g. a script exiting non-zero.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("{0}")]
    Fatal(String),

    /// The program is missing or not executable.
    #[error("{0}")]
    Spawn(String),
}

impl ActionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Fatal(msg) | Self::Spawn(msg) => msg,
        }
    }
}
