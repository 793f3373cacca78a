//! Shared primitives for all mqlease crates.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across mqlease crates.
pub type QueueResult<T> = Result<T, QueueError>;

/// A validated non-empty UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NonEmptyString(String);

impl NonEmptyString {
    /// Creates a validated non-empty string.
    pub fn new(value: impl Into<String>) -> QueueResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(QueueError::Validation(
                "value must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<NonEmptyString> for String {
    fn from(value: NonEmptyString) -> Self {
        value.0
    }
}

impl std::fmt::Display for NonEmptyString {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Common queueing error categories.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Requested message or entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation conflicts with broker state, such as a lost message lock.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Broker transport or protocol failure.
    #[error("broker error: {0}")]
    Broker(String),

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Returns the stable category name of this error.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::NotFound(_) => "NotFoundError",
            Self::Conflict(_) => "ConflictError",
            Self::Broker(_) => "BrokerError",
            Self::Internal(_) => "InternalError",
        }
    }
}
