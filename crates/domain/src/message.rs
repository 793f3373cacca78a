use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, TimeDelta, Utc};
use mqlease_core::{NonEmptyString, QueueResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String-keyed property bag attached to broker messages.
pub type MessageProperties = BTreeMap<String, Value>;

/// Broker-assigned message identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(NonEmptyString);

impl MessageId {
    /// Creates a validated message identifier.
    pub fn new(value: impl Into<String>) -> QueueResult<Self> {
        Ok(Self(NonEmptyString::new(value)?))
    }

    /// Returns the identifier value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for MessageId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Opaque token identifying the broker lock held over one message delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockToken(NonEmptyString);

impl LockToken {
    /// Creates a validated lock token.
    pub fn new(value: impl Into<String>) -> QueueResult<Self> {
        Ok(Self(NonEmptyString::new(value)?))
    }

    /// Returns the token value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for LockToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Immutable view of one message delivered under a time-bounded lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasedMessage {
    id: MessageId,
    lock_token: LockToken,
    locked_until_utc: DateTime<Utc>,
    user_properties: MessageProperties,
    delivery_count: u32,
    body: Value,
}

impl LeasedMessage {
    /// Creates a first-delivery message view with no properties and an empty body.
    #[must_use]
    pub fn new(id: MessageId, lock_token: LockToken, locked_until_utc: DateTime<Utc>) -> Self {
        Self {
            id,
            lock_token,
            locked_until_utc,
            user_properties: MessageProperties::new(),
            delivery_count: 1,
            body: Value::Null,
        }
    }

    /// Replaces the incoming user properties.
    #[must_use]
    pub fn with_user_properties(mut self, user_properties: MessageProperties) -> Self {
        self.user_properties = user_properties;
        self
    }

    /// Sets how many times the broker has delivered this message.
    #[must_use]
    pub fn with_delivery_count(mut self, delivery_count: u32) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    /// Sets the message body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Returns the message identifier.
    #[must_use]
    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Returns the lock token for terminal broker operations.
    #[must_use]
    pub fn lock_token(&self) -> &LockToken {
        &self.lock_token
    }

    /// Returns the instant the broker lock expires.
    #[must_use]
    pub fn locked_until_utc(&self) -> DateTime<Utc> {
        self.locked_until_utc
    }

    /// Returns incoming user properties.
    #[must_use]
    pub fn user_properties(&self) -> &MessageProperties {
        &self.user_properties
    }

    /// Returns the delivery count, starting at 1.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Returns the message body.
    #[must_use]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// Returns the lock time left at `now`; negative once the lock has lapsed.
    #[must_use]
    pub fn remaining_lock(&self, now: DateTime<Utc>) -> TimeDelta {
        self.locked_until_utc.signed_duration_since(now)
    }
}
