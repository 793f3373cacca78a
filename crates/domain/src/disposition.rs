use std::fmt::{Display, Formatter};

use mqlease_core::QueueError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::MessageProperties;

/// Outgoing property key carrying the chain of failure categories.
pub const EXCEPTIONS_PROPERTY: &str = "Exceptions";

/// Separator between failure categories across redelivery attempts.
pub const EXCEPTIONS_SEPARATOR: char = ':';

/// Terminal outcome applied to one leased message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispositionAction {
    /// Acknowledge and remove the message.
    Complete,
    /// Release the lock so the broker redelivers the message.
    Abandon,
    /// Move the message to the dead-letter destination.
    DeadLetter,
}

impl DispositionAction {
    /// Returns stable action value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl Display for DispositionAction {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Lifecycle state of one message lease.
///
/// `Actioned` is terminal: once entered the lease never transitions again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "action", rename_all = "snake_case")]
pub enum LeaseState {
    /// Lease created but no renewal deadline scheduled yet.
    Active,
    /// Renewal deadline scheduled and pending.
    Renewing,
    /// Lease window elapsed before any disposition was applied.
    Expired,
    /// One disposition attempt was made against the broker.
    Actioned(DispositionAction),
}

impl LeaseState {
    /// Returns whether no further disposition may be attempted.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Actioned(_))
    }

    /// Returns the applied action when terminal.
    #[must_use]
    pub fn action(&self) -> Option<DispositionAction> {
        match self {
            Self::Actioned(action) => Some(*action),
            Self::Active | Self::Renewing | Self::Expired => None,
        }
    }
}

/// Processing error recorded against a message on abandon or dead-letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingFailure {
    category: String,
    detail: String,
}

impl ProcessingFailure {
    /// Creates a failure with an explicit category name.
    #[must_use]
    pub fn new(category: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            detail: detail.into(),
        }
    }

    /// Creates a failure categorized by the error's type name.
    #[must_use]
    pub fn from_error<E>(error: &E) -> Self
    where
        E: std::error::Error,
    {
        Self::new(short_type_name(std::any::type_name::<E>()), error.to_string())
    }

    /// Returns the category name written to the outgoing property bag.
    #[must_use]
    pub fn category(&self) -> &str {
        self.category.as_str()
    }

    /// Returns the human-readable detail.
    #[must_use]
    pub fn detail(&self) -> &str {
        self.detail.as_str()
    }
}

impl From<&QueueError> for ProcessingFailure {
    fn from(error: &QueueError) -> Self {
        Self::new(error.category(), error.to_string())
    }
}

impl Display for ProcessingFailure {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}: {}", self.category, self.detail)
    }
}

/// Builds the outgoing property bag for an abandon or dead-letter call.
///
/// Without a failure the bag is empty. With one, the category is appended to
/// any chain already present on the incoming properties.
#[must_use]
pub fn failure_properties(
    user_properties: &MessageProperties,
    failure: Option<&ProcessingFailure>,
) -> MessageProperties {
    let mut outgoing = MessageProperties::new();
    let Some(failure) = failure else {
        return outgoing;
    };

    let chain = match user_properties.get(EXCEPTIONS_PROPERTY) {
        Some(existing) => format!(
            "{}{EXCEPTIONS_SEPARATOR}{}",
            property_text(existing),
            failure.category()
        ),
        None => failure.category().to_owned(),
    };

    outgoing.insert(EXCEPTIONS_PROPERTY.to_owned(), Value::String(chain));
    outgoing
}

fn property_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn short_type_name(type_name: &str) -> &str {
    let without_generics = type_name
        .split_once('<')
        .map_or(type_name, |(head, _)| head);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}
