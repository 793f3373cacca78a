//! Domain entities and invariants for leased broker messages.

#![forbid(unsafe_code)]

mod configuration;
mod disposition;
mod message;
mod renewal;

pub use configuration::{
    BrokerConfiguration, ConsumerSettings, DEFAULT_MAXIMUM_BACKOFF_SECONDS,
    DEFAULT_MAXIMUM_RETRY_COUNT, DEFAULT_MINIMUM_BACKOFF_SECONDS, QueueConfiguration,
    TopicConfiguration,
};
pub use disposition::{
    DispositionAction, EXCEPTIONS_PROPERTY, EXCEPTIONS_SEPARATOR, LeaseState, ProcessingFailure,
    failure_properties,
};
pub use message::{LeasedMessage, LockToken, MessageId, MessageProperties};
pub use renewal::{RENEWAL_WINDOW_FACTOR, renewal_deadline};
