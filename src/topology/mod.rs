//! Declarative management of queues, exchanges and bindings.
//!
//! [`Topology`] is a thin pass-through over one protocol channel: it keeps no
//! state of its own, the broker remains the single source of truth. Reusable
//! bundles of declarations implement [`Preset`];
//! [`DelayedRetryPreset`] provisions the queue set expected by
//! [`DelayedRetry`](crate::consumers::DelayedRetry).
use crate::connection::Connection;
use lapin::options::{
    ExchangeBindOptions, ExchangeDeclareOptions, ExchangeDeleteOptions, ExchangeUnbindOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};

mod presets;
pub use presets::DelayedRetryPreset;

/// Parameters for a queue declaration.
#[derive(Clone, Default)]
pub struct QueueDeclare {
    pub name: String,
    /// Survive a broker restart.
    pub durable: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
    /// Restrict the queue to this connection.
    pub exclusive: bool,
    /// Do not wait for the broker to confirm the declaration.
    pub no_wait: bool,
    /// Check for existence instead of creating; the declaration fails if the
    /// queue does not exist.
    pub passive: bool,
    /// Additional queue arguments, e.g. dead-letter configuration.
    pub args: FieldTable,
}

impl QueueDeclare {
    /// A durable queue with no other flags set.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            ..Default::default()
        }
    }

    /// Set the `x-dead-letter-exchange` argument: where the broker republishes
    /// messages that are rejected, nacked without requeue, or expired.
    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(exchange.into()),
        );
        self
    }

    /// Set the `x-dead-letter-routing-key` argument, overriding the original
    /// routing key on dead-lettered messages.
    #[must_use]
    pub fn with_dead_letter_routing_key(mut self, routing_key: &str) -> Self {
        self.args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(routing_key.into()),
        );
        self
    }

    /// Set the `x-message-ttl` argument, in milliseconds, applied to every
    /// message in the queue.
    #[must_use]
    pub fn with_message_ttl(mut self, milliseconds: i64) -> Self {
        self.args
            .insert("x-message-ttl".into(), AMQPValue::LongLongInt(milliseconds));
        self
    }
}

/// Parameters for an exchange declaration.
#[derive(Clone)]
pub struct ExchangeDeclare {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
    /// Accept publishes only from other exchanges, not from clients.
    pub internal: bool,
    pub no_wait: bool,
    /// Check for existence instead of creating.
    pub passive: bool,
    pub args: FieldTable,
}

impl ExchangeDeclare {
    /// A durable exchange with no other flags set.
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
            ..Default::default()
        }
    }
}

impl Default for ExchangeDeclare {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            no_wait: false,
            passive: false,
            args: FieldTable::default(),
        }
    }
}

/// One binding between a source exchange and a destination queue or exchange.
#[derive(Clone, Default)]
pub struct Binding {
    /// The queue (or, for exchange-to-exchange bindings, the exchange)
    /// receiving messages.
    pub destination: String,
    /// The exchange messages are routed from.
    pub source: String,
    pub routing_key: String,
    pub no_wait: bool,
    pub args: FieldTable,
}

/// Parameters for deleting a queue or an exchange.
#[derive(Clone, Default)]
pub struct Delete {
    pub name: String,
    /// Refuse to delete while consumers (or, for exchanges, bindings) exist.
    pub if_unused: bool,
    /// Refuse to delete a queue that still holds messages. Queues only.
    pub if_empty: bool,
    pub no_wait: bool,
}

/// Pass-through topology operations over one dedicated protocol channel.
pub struct Topology {
    channel: Channel,
}

impl Topology {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Open a dedicated channel on `connection` for topology work.
    pub async fn from_connection(connection: &Connection) -> Result<Self, lapin::Error> {
        Ok(Self::new(connection.open_channel().await?))
    }

    pub async fn declare_queue(&self, declare: &QueueDeclare) -> Result<lapin::Queue, lapin::Error> {
        self.channel
            .queue_declare(
                &declare.name,
                QueueDeclareOptions {
                    passive: declare.passive,
                    durable: declare.durable,
                    exclusive: declare.exclusive,
                    auto_delete: declare.auto_delete,
                    nowait: declare.no_wait,
                },
                declare.args.clone(),
            )
            .await
    }

    pub async fn declare_queues(&self, declares: &[QueueDeclare]) -> Result<(), lapin::Error> {
        for declare in declares {
            self.declare_queue(declare).await?;
        }
        Ok(())
    }

    /// Passive declaration: fails if the queue does not exist, returns its
    /// current message and consumer counts otherwise.
    pub async fn inspect_queue(&self, name: &str) -> Result<lapin::Queue, lapin::Error> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
    }

    pub async fn bind_queue(&self, binding: &Binding) -> Result<(), lapin::Error> {
        self.channel
            .queue_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                QueueBindOptions {
                    nowait: binding.no_wait,
                },
                binding.args.clone(),
            )
            .await
    }

    pub async fn bind_queues(&self, bindings: &[Binding]) -> Result<(), lapin::Error> {
        for binding in bindings {
            self.bind_queue(binding).await?;
        }
        Ok(())
    }

    pub async fn unbind_queue(&self, binding: &Binding) -> Result<(), lapin::Error> {
        self.channel
            .queue_unbind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                binding.args.clone(),
            )
            .await
    }

    pub async fn unbind_queues(&self, bindings: &[Binding]) -> Result<(), lapin::Error> {
        for binding in bindings {
            self.unbind_queue(binding).await?;
        }
        Ok(())
    }

    /// Returns the number of messages deleted along with the queue.
    pub async fn delete_queue(&self, delete: &Delete) -> Result<u32, lapin::Error> {
        self.channel
            .queue_delete(
                &delete.name,
                QueueDeleteOptions {
                    if_unused: delete.if_unused,
                    if_empty: delete.if_empty,
                    nowait: delete.no_wait,
                },
            )
            .await
    }

    pub async fn delete_queues(&self, deletes: &[Delete]) -> Result<(), lapin::Error> {
        for delete in deletes {
            self.delete_queue(delete).await?;
        }
        Ok(())
    }

    /// Drop all ready messages from a queue, returning how many were purged.
    pub async fn purge_queue(&self, name: &str, no_wait: bool) -> Result<u32, lapin::Error> {
        self.channel
            .queue_purge(name, QueuePurgeOptions { nowait: no_wait })
            .await
    }

    pub async fn declare_exchange(&self, declare: &ExchangeDeclare) -> Result<(), lapin::Error> {
        self.channel
            .exchange_declare(
                &declare.name,
                declare.kind.clone(),
                ExchangeDeclareOptions {
                    passive: declare.passive,
                    durable: declare.durable,
                    auto_delete: declare.auto_delete,
                    internal: declare.internal,
                    nowait: declare.no_wait,
                },
                declare.args.clone(),
            )
            .await
    }

    pub async fn declare_exchanges(&self, declares: &[ExchangeDeclare]) -> Result<(), lapin::Error> {
        for declare in declares {
            self.declare_exchange(declare).await?;
        }
        Ok(())
    }

    /// Bind an exchange to another exchange.
    pub async fn bind_exchange(&self, binding: &Binding) -> Result<(), lapin::Error> {
        self.channel
            .exchange_bind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeBindOptions {
                    nowait: binding.no_wait,
                },
                binding.args.clone(),
            )
            .await
    }

    pub async fn bind_exchanges(&self, bindings: &[Binding]) -> Result<(), lapin::Error> {
        for binding in bindings {
            self.bind_exchange(binding).await?;
        }
        Ok(())
    }

    pub async fn unbind_exchange(&self, binding: &Binding) -> Result<(), lapin::Error> {
        self.channel
            .exchange_unbind(
                &binding.destination,
                &binding.source,
                &binding.routing_key,
                ExchangeUnbindOptions {
                    nowait: binding.no_wait,
                },
                binding.args.clone(),
            )
            .await
    }

    pub async fn unbind_exchanges(&self, bindings: &[Binding]) -> Result<(), lapin::Error> {
        for binding in bindings {
            self.unbind_exchange(binding).await?;
        }
        Ok(())
    }

    pub async fn delete_exchange(&self, delete: &Delete) -> Result<(), lapin::Error> {
        self.channel
            .exchange_delete(
                &delete.name,
                ExchangeDeleteOptions {
                    if_unused: delete.if_unused,
                    nowait: delete.no_wait,
                },
            )
            .await
    }

    pub async fn delete_exchanges(&self, deletes: &[Delete]) -> Result<(), lapin::Error> {
        for delete in deletes {
            self.delete_exchange(delete).await?;
        }
        Ok(())
    }

    /// Apply `presets` in order, stopping at the first failure.
    pub async fn apply_presets(&self, presets: &[&dyn Preset]) -> Result<(), anyhow::Error> {
        for preset in presets {
            preset.apply(self).await?;
        }
        Ok(())
    }
}

/// A replayable bundle of topology declarations.
///
/// Presets are expected to be idempotent: applying one against a broker that
/// already carries the topology must succeed. Keep to plain declares and
/// binds and this falls out naturally from AMQP semantics.
#[async_trait::async_trait]
pub trait Preset: Send + Sync {
    async fn apply(&self, topology: &Topology) -> Result<(), anyhow::Error>;
}
