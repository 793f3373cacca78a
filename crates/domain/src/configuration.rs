use std::time::Duration;

use mqlease_core::{NonEmptyString, QueueError, QueueResult};

/// Default lower bound for receive retry backoff.
pub const DEFAULT_MINIMUM_BACKOFF_SECONDS: u32 = 5;

/// Default upper bound for receive retry backoff.
pub const DEFAULT_MAXIMUM_BACKOFF_SECONDS: u32 = 50;

/// Default delivery attempts allowed before a message is dead-lettered.
pub const DEFAULT_MAXIMUM_RETRY_COUNT: u32 = 10;

/// Receive-side limits shared by queue and topic consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    max_concurrent_calls: u32,
    minimum_backoff_seconds: u32,
    maximum_backoff_seconds: u32,
    maximum_retry_count: u32,
    maximum_callback_timeout: Option<Duration>,
}

impl ConsumerSettings {
    /// Creates settings with default backoff and retry limits.
    pub fn new(max_concurrent_calls: u32) -> QueueResult<Self> {
        if max_concurrent_calls == 0 {
            return Err(QueueError::Validation(
                "max_concurrent_calls must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            max_concurrent_calls,
            minimum_backoff_seconds: DEFAULT_MINIMUM_BACKOFF_SECONDS,
            maximum_backoff_seconds: DEFAULT_MAXIMUM_BACKOFF_SECONDS,
            maximum_retry_count: DEFAULT_MAXIMUM_RETRY_COUNT,
            maximum_callback_timeout: None,
        })
    }

    /// Overrides the receive backoff bounds.
    pub fn with_backoff(
        mut self,
        minimum_backoff_seconds: u32,
        maximum_backoff_seconds: u32,
    ) -> QueueResult<Self> {
        if minimum_backoff_seconds > maximum_backoff_seconds {
            return Err(QueueError::Validation(format!(
                "minimum backoff {minimum_backoff_seconds}s exceeds maximum backoff {maximum_backoff_seconds}s"
            )));
        }

        self.minimum_backoff_seconds = minimum_backoff_seconds;
        self.maximum_backoff_seconds = maximum_backoff_seconds;
        Ok(self)
    }

    /// Overrides the delivery attempts allowed before dead-lettering.
    #[must_use]
    pub fn with_maximum_retry_count(mut self, maximum_retry_count: u32) -> Self {
        self.maximum_retry_count = maximum_retry_count;
        self
    }

    /// Bounds how long one handler invocation may run.
    #[must_use]
    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.maximum_callback_timeout = Some(timeout);
        self
    }

    /// Returns the in-flight handler limit.
    #[must_use]
    pub fn max_concurrent_calls(&self) -> u32 {
        self.max_concurrent_calls
    }

    /// Returns the minimum backoff in seconds.
    #[must_use]
    pub fn minimum_backoff_seconds(&self) -> u32 {
        self.minimum_backoff_seconds
    }

    /// Returns the maximum backoff in seconds.
    #[must_use]
    pub fn maximum_backoff_seconds(&self) -> u32 {
        self.maximum_backoff_seconds
    }

    /// Returns the delivery attempts allowed before dead-lettering.
    #[must_use]
    pub fn maximum_retry_count(&self) -> u32 {
        self.maximum_retry_count
    }

    /// Returns the optional handler timeout.
    #[must_use]
    pub fn maximum_callback_timeout(&self) -> Option<Duration> {
        self.maximum_callback_timeout
    }

    /// Returns the backoff after `consecutive_failures` receive failures.
    ///
    /// Doubles from the minimum and saturates at the maximum.
    #[must_use]
    pub fn backoff_for(&self, consecutive_failures: u32) -> Duration {
        let factor = 1_u64
            .checked_shl(consecutive_failures.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let seconds = u64::from(self.minimum_backoff_seconds)
            .saturating_mul(factor)
            .min(u64::from(self.maximum_backoff_seconds));
        Duration::from_secs(seconds)
    }
}

/// Connection details for one receive source.
pub trait BrokerConfiguration: Send + Sync {
    /// Returns the broker connection string.
    fn connection_string(&self) -> &str;

    /// Returns the broker entity path messages are received from.
    fn entity_path(&self) -> String;

    /// Returns receive-side limits.
    fn settings(&self) -> &ConsumerSettings;
}

/// Configuration for consuming a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfiguration {
    connection_string: NonEmptyString,
    queue_name: NonEmptyString,
    settings: ConsumerSettings,
}

impl QueueConfiguration {
    /// Creates a validated queue configuration.
    pub fn new(
        connection_string: impl Into<String>,
        queue_name: impl Into<String>,
        settings: ConsumerSettings,
    ) -> QueueResult<Self> {
        Ok(Self {
            connection_string: NonEmptyString::new(connection_string)?,
            queue_name: NonEmptyString::new(queue_name)?,
            settings,
        })
    }

    /// Returns the queue name.
    #[must_use]
    pub fn queue_name(&self) -> &str {
        self.queue_name.as_str()
    }
}

impl BrokerConfiguration for QueueConfiguration {
    fn connection_string(&self) -> &str {
        self.connection_string.as_str()
    }

    fn entity_path(&self) -> String {
        self.queue_name.as_str().to_owned()
    }

    fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }
}

/// Configuration for consuming one topic subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfiguration {
    connection_string: NonEmptyString,
    topic_name: NonEmptyString,
    subscription_name: NonEmptyString,
    settings: ConsumerSettings,
}

impl TopicConfiguration {
    /// Creates a validated topic subscription configuration.
    pub fn new(
        connection_string: impl Into<String>,
        topic_name: impl Into<String>,
        subscription_name: impl Into<String>,
        settings: ConsumerSettings,
    ) -> QueueResult<Self> {
        Ok(Self {
            connection_string: NonEmptyString::new(connection_string)?,
            topic_name: NonEmptyString::new(topic_name)?,
            subscription_name: NonEmptyString::new(subscription_name)?,
            settings,
        })
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic_name(&self) -> &str {
        self.topic_name.as_str()
    }

    /// Returns the subscription name.
    #[must_use]
    pub fn subscription_name(&self) -> &str {
        self.subscription_name.as_str()
    }
}

impl BrokerConfiguration for TopicConfiguration {
    fn connection_string(&self) -> &str {
        self.connection_string.as_str()
    }

    fn entity_path(&self) -> String {
        format!("{}/subscriptions/{}", self.topic_name, self.subscription_name)
    }

    fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }
}
