//! Application services and ports.

#![forbid(unsafe_code)]

mod cancellation;
mod consumer_service;
mod lease_manager;
mod lease_ports;

pub use cancellation::CancellationSignal;
pub use consumer_service::{ConsumerService, ConsumerStats};
pub use lease_manager::{DispositionOutcome, LeaseManager};
pub use lease_ports::{BrokerClient, Clock, HandlerOutcome, MessageHandler, MessageReceiver};
