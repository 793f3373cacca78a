use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use mqlease_application::{BrokerClient, Clock, MessageReceiver};
use mqlease_core::{QueueError, QueueResult};
use mqlease_domain::{LeasedMessage, LockToken, MessageId, MessageProperties};
use serde_json::Value;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Value,
    properties: MessageProperties,
    delivery_count: u32,
}

#[derive(Debug, Clone)]
struct HeldLock {
    message_id: MessageId,
    locked_until: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: HashMap<MessageId, StoredMessage>,
    ready: VecDeque<MessageId>,
    locks: HashMap<LockToken, HeldLock>,
    dead_letters: Vec<MessageId>,
}

impl QueueState {
    fn reclaim_expired_locks(&mut self, now: DateTime<Utc>) {
        let expired: Vec<LockToken> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.locked_until <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(lock) = self.locks.remove(&token) {
                self.ready.push_back(lock.message_id);
            }
        }
    }

    fn release(&mut self, lock_token: &LockToken, now: DateTime<Utc>) -> QueueResult<MessageId> {
        let lock = self.locks.remove(lock_token).ok_or_else(|| {
            QueueError::Conflict(format!("lock token '{lock_token}' is not held"))
        })?;

        if lock.locked_until <= now {
            self.ready.push_back(lock.message_id);
            return Err(QueueError::Conflict(format!(
                "lock token '{lock_token}' expired"
            )));
        }

        Ok(lock.message_id)
    }

    fn merge_properties(&mut self, message_id: &MessageId, properties: MessageProperties) {
        if let Some(message) = self.messages.get_mut(message_id) {
            message.properties.extend(properties);
        }
    }
}

/// Process-local queue implementing both receive and terminal operations.
///
/// Locks that lapse are returned to the ready list on the next receive.
pub struct InMemoryMessageQueue {
    clock: Arc<dyn Clock>,
    state: Mutex<QueueState>,
}

impl InMemoryMessageQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Appends one message and returns its identifier.
    pub async fn enqueue(
        &self,
        body: Value,
        properties: MessageProperties,
    ) -> QueueResult<MessageId> {
        let message_id = MessageId::new(uuid::Uuid::new_v4().to_string())?;
        let mut state = self.state.lock().await;
        state.messages.insert(
            message_id.clone(),
            StoredMessage {
                body,
                properties,
                delivery_count: 0,
            },
        );
        state.ready.push_back(message_id.clone());
        Ok(message_id)
    }

    /// Returns how many messages wait for delivery.
    pub async fn ready_count(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    /// Returns dead-lettered messages with their properties, oldest first.
    pub async fn dead_letters(&self) -> Vec<(MessageId, MessageProperties)> {
        let state = self.state.lock().await;
        state
            .dead_letters
            .iter()
            .filter_map(|message_id| {
                state
                    .messages
                    .get(message_id)
                    .map(|message| (message_id.clone(), message.properties.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl MessageReceiver for InMemoryMessageQueue {
    async fn receive(&self, lock_duration: Duration) -> QueueResult<Option<LeasedMessage>> {
        let lock_duration = TimeDelta::from_std(lock_duration)
            .map_err(|error| QueueError::Validation(format!("invalid lock duration: {error}")))?;
        let now = self.clock.now_utc();

        let mut state = self.state.lock().await;
        state.reclaim_expired_locks(now);

        let Some(message_id) = state.ready.pop_front() else {
            return Ok(None);
        };

        let stored = state.messages.get_mut(&message_id).ok_or_else(|| {
            QueueError::NotFound(format!("message '{message_id}' is queued but not stored"))
        })?;
        stored.delivery_count = stored.delivery_count.saturating_add(1);
        let stored = stored.clone();

        let lock_token = LockToken::new(uuid::Uuid::new_v4().to_string())?;
        let locked_until = now + lock_duration;
        state.locks.insert(
            lock_token.clone(),
            HeldLock {
                message_id: message_id.clone(),
                locked_until,
            },
        );

        Ok(Some(
            LeasedMessage::new(message_id, lock_token, locked_until)
                .with_user_properties(stored.properties)
                .with_delivery_count(stored.delivery_count)
                .with_body(stored.body),
        ))
    }
}

#[async_trait]
impl BrokerClient for InMemoryMessageQueue {
    async fn complete(&self, lock_token: &LockToken) -> QueueResult<()> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        let message_id = state.release(lock_token, now)?;
        state.messages.remove(&message_id);
        Ok(())
    }

    async fn abandon(
        &self,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        let message_id = state.release(lock_token, now)?;
        state.merge_properties(&message_id, properties);
        state.ready.push_back(message_id);
        Ok(())
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()> {
        let now = self.clock.now_utc();
        let mut state = self.state.lock().await;
        let message_id = state.release(lock_token, now)?;
        state.merge_properties(&message_id, properties);
        state.dead_letters.push(message_id);
        Ok(())
    }
}
