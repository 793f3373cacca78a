mod broker;
mod clock;
mod handler;

pub use broker::{BrokerClient, MessageReceiver};
pub use clock::Clock;
pub use handler::{HandlerOutcome, MessageHandler};
