use std::time::Duration;

use async_trait::async_trait;
use mqlease_core::QueueResult;
use mqlease_domain::{LeasedMessage, LockToken, MessageProperties};

/// Terminal operations against a message lock.
///
/// Implementations must be safe to call from concurrent tasks.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Acknowledges and removes the locked message.
    async fn complete(&self, lock_token: &LockToken) -> QueueResult<()>;

    /// Releases the lock for redelivery, merging `properties` into the message.
    async fn abandon(
        &self,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()>;

    /// Moves the locked message to the dead-letter destination, merging `properties`.
    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()>;
}

/// Receive side of a broker entity.
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Receives one message locked for `lock_duration`, or `None` when idle.
    async fn receive(&self, lock_duration: Duration) -> QueueResult<Option<LeasedMessage>>;
}
