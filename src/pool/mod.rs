//! A bounded pool of protocol channels built on one [`Connection`](crate::connection::Connection).
//!
//! The pool provides two key guarantees:
//! - A channel that errored during use is never returned to the idle set -
//!   it is destroyed and lazily replaced on demand.
//! - Channels left idle beyond a configured threshold are reclaimed on the
//!   owning publisher's cleanup tick ([`ResourcePool::evict_idle`]).
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use warren::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
//! use warren::connection::Connection;
//! use warren::pool::{ChannelManager, ResourcePool};
//!
//! async fn example() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!     let factory = ConnectionFactory::new_from_config(&settings)?;
//!     let connection = Connection::establish(factory, CancellationToken::new()).await?;
//!
//!     // at most 8 channels, created on demand.
//!     let pool = ResourcePool::new(ChannelManager::new(connection), 8);
//!
//!     let channel = pool.acquire().await?;
//!     // the channel goes back to the idle set when the guard is dropped.
//!     drop(channel);
//!     Ok(())
//! }
//! ```

mod channel;
mod error;
#[allow(clippy::module_inception)]
mod pool;

pub use channel::ChannelManager;
pub use error::PoolError;
pub use pool::{Manage, Pooled, ResourcePool};
