//! Partitioned command queue with manual acknowledgment.
//!
//! Deposit commands are routed to a partition by account id, so one consumer
//! sees every command for an account in enqueue order.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;
pub mod r#trait;

pub use in_memory::InMemoryCommandQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;
pub use r#trait::{CommandQueue, DeadLetter, Delivery, QueueError};
