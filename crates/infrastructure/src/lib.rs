//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod http_message_handler;
mod in_memory_message_queue;
mod redis_message_queue;
mod system_clock;

pub use http_message_handler::HttpMessageHandler;
pub use in_memory_message_queue::InMemoryMessageQueue;
pub use redis_message_queue::RedisMessageQueue;
pub use system_clock::SystemClock;
