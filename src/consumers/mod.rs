//! Facilities to consume messages from a RabbitMq queue.
//!
//! [`Consumer`] runs groups of concurrent workers against one queue; each
//! delivery is handed to a [`MessageHandler`], whose outcome is translated
//! into exactly one broker acknowledgement. [`DelayedRetry`] decorates any
//! handler with dead-letter based delayed redelivery.
mod consumer;
mod delayed_retry;
mod handler;

pub use consumer::{ConsumeParams, Consumer, ConsumerBuilder, ConsumerError};
pub use delayed_retry::{expired_death_count, DelayedRetry, RetryPolicy};
pub use handler::{apply_action, Action, HandlerError, HandlerFn, MessageHandler};
