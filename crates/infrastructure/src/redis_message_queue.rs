//! Redis-backed message queue with lock-token leases.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use mqlease_application::{BrokerClient, Clock, MessageReceiver};
use mqlease_core::{QueueError, QueueResult};
use mqlease_domain::{LeasedMessage, LockToken, MessageId, MessageProperties};
use redis::Script;
use serde_json::Value;

const RECEIVE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[2])
for _, token in ipairs(expired) do
  local id = redis.call('HGET', KEYS[3], token)
  redis.call('ZREM', KEYS[2], token)
  redis.call('HDEL', KEYS[3], token)
  if id then
    redis.call('RPUSH', KEYS[1], id)
  end
end

local id = redis.call('LPOP', KEYS[1])
if not id then
  return nil
end

local message_key = ARGV[1] .. id
local deliveries = redis.call('HINCRBY', message_key, 'delivery_count', 1)
redis.call('HSET', KEYS[3], ARGV[4], id)
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[4])
local fields = redis.call('HMGET', message_key, 'body', 'properties')
return {id, fields[1] or 'null', fields[2] or '{}', deliveries}
"#;

const COMPLETE_SCRIPT: &str = r#"
local id = redis.call('HGET', KEYS[2], ARGV[2])
if not id then
  return 0
end

local expires_at = tonumber(redis.call('ZSCORE', KEYS[1], ARGV[2]))
redis.call('HDEL', KEYS[2], ARGV[2])
redis.call('ZREM', KEYS[1], ARGV[2])
if expires_at == nil or expires_at <= tonumber(ARGV[3]) then
  redis.call('RPUSH', KEYS[3], id)
  return 0
end

redis.call('DEL', ARGV[1] .. id)
return 1
"#;

const SETTLE_SCRIPT: &str = r#"
local id = redis.call('HGET', KEYS[2], ARGV[2])
if not id then
  return 0
end

local expires_at = tonumber(redis.call('ZSCORE', KEYS[1], ARGV[2]))
redis.call('HDEL', KEYS[2], ARGV[2])
redis.call('ZREM', KEYS[1], ARGV[2])
if expires_at == nil or expires_at <= tonumber(ARGV[3]) then
  redis.call('RPUSH', KEYS[3], id)
  return 0
end

local message_key = ARGV[1] .. id
local updates = cjson.decode(ARGV[4])
if next(updates) ~= nil then
  local current = redis.call('HGET', message_key, 'properties')
  local properties = {}
  if current then
    properties = cjson.decode(current)
  end
  for key, value in pairs(updates) do
    properties[key] = value
  end
  redis.call('HSET', message_key, 'properties', cjson.encode(properties))
end

redis.call('RPUSH', KEYS[4], id)
return 1
"#;

/// Redis implementation of one queue or subscription.
///
/// Ready messages live in a list, held locks in a sorted set scored by expiry,
/// and lapsed locks are returned to the ready list on the next receive.
#[derive(Clone)]
pub struct RedisMessageQueue {
    client: redis::Client,
    clock: Arc<dyn Clock>,
    key_prefix: String,
}

impl RedisMessageQueue {
    /// Creates one queue adapter for `entity_path` under `key_prefix`.
    #[must_use]
    pub fn new(
        client: redis::Client,
        clock: Arc<dyn Clock>,
        key_prefix: impl AsRef<str>,
        entity_path: impl AsRef<str>,
    ) -> Self {
        Self {
            client,
            clock,
            key_prefix: format!("{}:{}", key_prefix.as_ref(), entity_path.as_ref()),
        }
    }

    /// Appends one message and returns its identifier.
    pub async fn enqueue(
        &self,
        body: &Value,
        properties: &MessageProperties,
    ) -> QueueResult<MessageId> {
        let message_id = MessageId::new(uuid::Uuid::new_v4().to_string())?;
        let body = serde_json::to_string(body).map_err(|error| {
            QueueError::Validation(format!("failed to serialize message body: {error}"))
        })?;
        let properties = serde_json::to_string(properties).map_err(|error| {
            QueueError::Validation(format!("failed to serialize message properties: {error}"))
        })?;

        let mut connection = self.connection().await?;
        redis::pipe()
            .atomic()
            .hset_multiple(
                self.message_key(&message_id),
                &[
                    ("body", body),
                    ("properties", properties),
                    ("delivery_count", "0".to_owned()),
                ],
            )
            .rpush(self.ready_key(), message_id.as_str())
            .query_async::<()>(&mut connection)
            .await
            .map_err(|error| QueueError::Broker(format!("failed to enqueue message: {error}")))?;

        Ok(message_id)
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.key_prefix)
    }

    fn lock_expiry_key(&self) -> String {
        format!("{}:lock_expiry", self.key_prefix)
    }

    fn lock_owner_key(&self) -> String {
        format!("{}:lock_owner", self.key_prefix)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead_letter", self.key_prefix)
    }

    fn message_key_prefix(&self) -> String {
        format!("{}:message:", self.key_prefix)
    }

    fn message_key(&self, message_id: &MessageId) -> String {
        format!("{}{message_id}", self.message_key_prefix())
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| QueueError::Broker(format!("failed to connect to redis: {error}")))
    }

    async fn settle(
        &self,
        lock_token: &LockToken,
        destination_key: String,
        properties: &MessageProperties,
        operation: &str,
    ) -> QueueResult<()> {
        let properties = serde_json::to_string(properties).map_err(|error| {
            QueueError::Validation(format!("failed to serialize message properties: {error}"))
        })?;
        let mut connection = self.connection().await?;

        let settled = Script::new(SETTLE_SCRIPT)
            .key(self.lock_expiry_key())
            .key(self.lock_owner_key())
            .key(self.ready_key())
            .key(destination_key)
            .arg(self.message_key_prefix())
            .arg(lock_token.as_str())
            .arg(self.clock.now_utc().timestamp_millis())
            .arg(properties)
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| {
                QueueError::Broker(format!("failed to {operation} message: {error}"))
            })?;

        if settled == 0 {
            return Err(QueueError::Conflict(format!(
                "lock token '{lock_token}' is no longer held"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl MessageReceiver for RedisMessageQueue {
    async fn receive(&self, lock_duration: Duration) -> QueueResult<Option<LeasedMessage>> {
        let lock_duration = TimeDelta::from_std(lock_duration)
            .map_err(|error| QueueError::Validation(format!("invalid lock duration: {error}")))?;
        let now = self.clock.now_utc();
        let locked_until = now + lock_duration;
        let lock_token = LockToken::new(uuid::Uuid::new_v4().to_string())?;

        let mut connection = self.connection().await?;
        let received = Script::new(RECEIVE_SCRIPT)
            .key(self.ready_key())
            .key(self.lock_expiry_key())
            .key(self.lock_owner_key())
            .arg(self.message_key_prefix())
            .arg(now.timestamp_millis())
            .arg(locked_until.timestamp_millis())
            .arg(lock_token.as_str())
            .invoke_async::<Option<(String, String, String, u32)>>(&mut connection)
            .await
            .map_err(|error| QueueError::Broker(format!("failed to receive message: {error}")))?;

        let Some((message_id, body, properties, delivery_count)) = received else {
            return Ok(None);
        };

        let body = serde_json::from_str::<Value>(body.as_str()).map_err(|error| {
            QueueError::Internal(format!(
                "message '{message_id}' has an unreadable body: {error}"
            ))
        })?;
        let properties =
            serde_json::from_str::<MessageProperties>(properties.as_str()).map_err(|error| {
                QueueError::Internal(format!(
                    "message '{message_id}' has unreadable properties: {error}"
                ))
            })?;

        Ok(Some(
            LeasedMessage::new(MessageId::new(message_id)?, lock_token, locked_until)
                .with_user_properties(properties)
                .with_delivery_count(delivery_count)
                .with_body(body),
        ))
    }
}

#[async_trait]
impl BrokerClient for RedisMessageQueue {
    async fn complete(&self, lock_token: &LockToken) -> QueueResult<()> {
        let mut connection = self.connection().await?;

        let completed = Script::new(COMPLETE_SCRIPT)
            .key(self.lock_expiry_key())
            .key(self.lock_owner_key())
            .key(self.ready_key())
            .arg(self.message_key_prefix())
            .arg(lock_token.as_str())
            .arg(self.clock.now_utc().timestamp_millis())
            .invoke_async::<i32>(&mut connection)
            .await
            .map_err(|error| QueueError::Broker(format!("failed to complete message: {error}")))?;

        if completed == 0 {
            return Err(QueueError::Conflict(format!(
                "lock token '{lock_token}' is no longer held"
            )));
        }

        Ok(())
    }

    async fn abandon(
        &self,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()> {
        self.settle(lock_token, self.ready_key(), &properties, "abandon")
            .await
    }

    async fn dead_letter(
        &self,
        lock_token: &LockToken,
        properties: MessageProperties,
    ) -> QueueResult<()> {
        self.settle(
            lock_token,
            self.dead_letter_key(),
            &properties,
            "dead-letter",
        )
        .await
    }
}
