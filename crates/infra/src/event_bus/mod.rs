//! Infrastructure-backed event bus implementations.
//!
//! The bus abstraction and the in-process bus live in `im2-events`. This
//! module adds transports for observers outside the process.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};
