//! `warren` is a client-side resilience layer for RabbitMQ, built on top of
//! [`lapin`].
//!
//! It supervises a single broker connection ([`connection::Connection`]),
//! pools protocol channels for concurrent publishing
//! ([`publishers::Publisher`]), runs groups of consumer workers per queue
//! ([`consumers::Consumer`]) and implements a dead-letter based
//! retry-with-delay handling policy ([`consumers::DelayedRetry`]).
//!
//! [`Publisher`](crate::publishers::Publisher) and
//! [`Consumer`](crate::consumers::Consumer) are the best starting points to
//! learn what `warren` provides and how to leverage it.

pub mod connection;
pub mod consumers;
pub mod publishers;

pub mod amqp;
pub mod pool;
pub mod topology;
