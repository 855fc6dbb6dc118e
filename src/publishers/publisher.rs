use crate::connection::Connection;
use crate::pool::{ChannelManager, PoolError, ResourcePool};
use crate::publishers::OutboundMessage;
use lapin::message::BasicReturnMessage;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::Confirmation;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{timeout, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A high-level interface to publish messages.
///
/// # Fault tolerance
///
/// `Publisher` draws its channels from a bounded pool built on one
/// [`Connection`]. Channels that errored are destroyed rather than reused,
/// and channels idle for longer than the configured threshold are reclaimed
/// periodically. On connection loss the pool is torn down; if a reconnect
/// timeout is configured the publisher re-establishes the connection and
/// rebuilds the pool within that window, otherwise it shuts down permanently.
/// A clean [`Connection::shutdown`] shuts the publisher down as well.
///
/// # How do I build a `Publisher`?
///
/// `Publisher` provides a fluent API to add configuration step-by-step,
/// known as "builder pattern" in Rust.
/// The starting point is [`Publisher::builder`].
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    token: CancellationToken,
    publish_timeout: Duration,
    max_channels: usize,
    max_idle_time: Duration,
    cleanup_interval: Duration,
    reconnect_timeout: Option<Duration>,
    publisher_confirms: bool,
    state: RwLock<PublisherState>,
}

struct PublisherState {
    connection: Connection,
    pool: ResourcePool<ChannelManager>,
}

impl Publisher {
    /// Start building a [`Publisher`] on top of an established [`Connection`].
    ///
    /// # Example
    ///
    /// ```no_run
    /// use tokio_util::sync::CancellationToken;
    /// use warren::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
    /// use warren::connection::Connection;
    /// use warren::publishers::Publisher;
    ///
    /// async fn get_publisher() -> anyhow::Result<Publisher> {
    ///     let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
    ///     let connection = Connection::establish(factory, CancellationToken::new()).await?;
    ///     let publisher = Publisher::builder(connection)
    ///         .max_channels(8)
    ///         .reconnect_timeout(std::time::Duration::from_secs(30))
    ///         .build();
    ///     Ok(publisher)
    /// }
    /// ```
    pub fn builder(connection: Connection) -> PublisherBuilder {
        PublisherBuilder::new(connection)
    }

    /// Publish a message to RabbitMq.
    ///
    /// The channel used for the operation goes back to the pool on success
    /// and is destroyed on any error - a post-error channel is never reused.
    #[tracing::instrument(
        skip_all,
        name = "publish",
        fields(exchange = %message.exchange_name, routing_key = %message.routing_key)
    )]
    pub async fn publish(&self, message: OutboundMessage) -> Result<(), PublisherError> {
        match timeout(self.inner.publish_timeout, self.publish_inner(message)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(PublisherError::Timeout),
        }
    }

    async fn publish_inner(&self, message: OutboundMessage) -> Result<(), PublisherError> {
        let pool = {
            let state = self.inner.state.read().await;
            if state.connection.is_closed() {
                return Err(PublisherError::NotConnected);
            }
            state.pool.clone()
        };

        let message = inject_amqp_properties(message);
        let options = BasicPublishOptions {
            mandatory: message.mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0 - see
            // https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error.
            immediate: false,
        };

        let channel = pool.acquire().await?;
        let confirm = match channel
            .basic_publish(
                &message.exchange_name,
                &message.routing_key,
                options,
                &message.payload,
                message.properties.clone(),
            )
            .await
        {
            Ok(confirm) => confirm,
            Err(e) => {
                channel.destroy().await;
                return Err(PublisherError::Broker(e));
            }
        };

        match confirm.await {
            Ok(Confirmation::Ack(return_message)) => {
                if let Some(return_message) = return_message {
                    // Reply Code 312 - NO_ROUTE.
                    // See https://www.rabbitmq.com/amqp-0-9-1-reference.html
                    if return_message.reply_code == 312 {
                        return Err(PublisherError::UnroutableMessage(return_message));
                    }
                }
                Ok(())
            }
            Ok(Confirmation::Nack(return_message)) => {
                Err(PublisherError::NegativeAck(return_message))
            }
            Ok(Confirmation::NotRequested) => Ok(()),
            Err(e) => {
                channel.destroy().await;
                Err(PublisherError::Broker(e))
            }
        }
    }

    /// Shut the publisher down: the background task closes the pool and the
    /// publisher stops accepting publishes.
    pub fn shutdown(&self) {
        self.inner.token.cancel();
    }

    /// The cancellation scope of this publisher.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.token
    }
}

/// Error returned when trying to publish a message using [`Publisher`].
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("the connection to the RabbitMq broker is not ready")]
    NotConnected,
    #[error("failed to acquire a channel from the pool")]
    Pool(#[from] PoolError),
    #[error("error encountered when interacting with the RabbitMq broker")]
    Broker(#[source] lapin::Error),
    #[error("the timeout threshold was reached while trying to publish the message")]
    Timeout,
    #[error("the message could not be routed: {0:?}")]
    UnroutableMessage(Box<BasicReturnMessage>),
    #[error("the RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder {
    connection: Connection,
    publish_timeout: Duration,
    max_channels: usize,
    max_idle_time: Duration,
    cleanup_interval: Duration,
    reconnect_timeout: Option<Duration>,
    publisher_confirms: bool,
    parent_token: Option<CancellationToken>,
}

impl PublisherBuilder {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            publish_timeout: Duration::from_secs(3),
            max_channels: 3,
            max_idle_time: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            reconnect_timeout: None,
            publisher_confirms: true,
            parent_token: None,
        }
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Maximum number of channels held by the pool, counting both idle and
    /// in-use ones. Defaults to 3.
    #[must_use]
    pub fn max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    /// How long a channel may sit idle before the next cleanup tick destroys
    /// it. Defaults to 30 seconds; set this smaller than the cleanup
    /// interval.
    #[must_use]
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Cadence of the idle-channel cleanup task. Defaults to 1 minute.
    #[must_use]
    pub fn cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }

    /// Time budget for re-establishing the connection after a loss.
    ///
    /// If left unspecified the publisher shuts down permanently on
    /// connection loss instead of reconnecting.
    #[must_use]
    pub fn reconnect_timeout(mut self, reconnect_timeout: Duration) -> Self {
        self.reconnect_timeout = Some(reconnect_timeout);
        self
    }

    /// Do not wait for broker confirmations on published messages.
    #[must_use]
    pub fn without_publisher_confirmations(mut self) -> Self {
        self.publisher_confirms = false;
        self
    }

    /// Tie the publisher's lifetime to an external cancellation scope.
    ///
    /// By default the publisher owns an independent scope, cancelled only by
    /// [`Publisher::shutdown`], a failed reconnect or a clean close of the
    /// connection.
    #[must_use]
    pub fn cancellation(mut self, parent: &CancellationToken) -> Self {
        self.parent_token = Some(parent.child_token());
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    ///
    /// Spawns the publisher's background task; must be called within a tokio
    /// runtime.
    pub fn build(self) -> Publisher {
        let token = self.parent_token.unwrap_or_default();
        let pool = build_pool(&self.connection, self.publisher_confirms, self.max_channels);
        let inner = Arc::new(PublisherInner {
            token,
            publish_timeout: self.publish_timeout,
            max_channels: self.max_channels,
            max_idle_time: self.max_idle_time,
            cleanup_interval: self.cleanup_interval,
            reconnect_timeout: self.reconnect_timeout,
            publisher_confirms: self.publisher_confirms,
            state: RwLock::new(PublisherState {
                connection: self.connection,
                pool,
            }),
        });
        tokio::spawn(supervise(Arc::clone(&inner)));
        Publisher { inner }
    }
}

fn build_pool(
    connection: &Connection,
    publisher_confirms: bool,
    max_channels: usize,
) -> ResourcePool<ChannelManager> {
    let mut manager = ChannelManager::new(connection.clone());
    if !publisher_confirms {
        manager = manager.without_publisher_confirmations();
    }
    ResourcePool::new(manager, max_channels)
}

/// The outcomes the publisher background task reacts to.
#[derive(Debug)]
enum SupervisionEvent {
    /// The publisher's own scope was cancelled.
    Shutdown,
    /// The session reported an unrecoverable error; `None` when the
    /// notification channel itself went away.
    ConnectionLost(Option<lapin::Error>),
    /// The connection scope was cancelled without a loss notification,
    /// i.e. a clean [`Connection::shutdown`].
    ConnectionClosed,
    CleanupTick,
}

/// Wait for the next supervision event, in descending priority.
///
/// A lost session also cancels its own scope, so the loss notification is
/// checked before the scope: the reconnect policy keys on the loss, while
/// scope cancellation alone means a deliberate close.
async fn next_event(
    publisher_scope: &CancellationToken,
    connection_scope: &CancellationToken,
    closed: &mut broadcast::Receiver<lapin::Error>,
    ticker: &mut Interval,
) -> SupervisionEvent {
    tokio::select! {
        biased;
        _ = publisher_scope.cancelled() => SupervisionEvent::Shutdown,
        notification = closed.recv() => SupervisionEvent::ConnectionLost(notification.ok()),
        _ = connection_scope.cancelled() => SupervisionEvent::ConnectionClosed,
        _ = ticker.tick() => SupervisionEvent::CleanupTick,
    }
}

/// Publisher background task: drives the idle-channel cleanup tick and
/// reacts to connection loss per the configured reconnect policy. A clean
/// close of the connection scope winds the publisher down as well.
async fn supervise(inner: Arc<PublisherInner>) {
    let mut ticker = tokio::time::interval(inner.cleanup_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let (connection, pool) = {
            let state = inner.state.read().await;
            (state.connection.clone(), state.pool.clone())
        };
        let mut closed = connection.subscribe_closed();

        loop {
            let event = next_event(
                &inner.token,
                connection.cancellation(),
                &mut closed,
                &mut ticker,
            )
            .await;
            match event {
                SupervisionEvent::Shutdown => {
                    pool.close().await;
                    info!("publisher shut down, channel pool closed");
                    return;
                }
                SupervisionEvent::CleanupTick => {
                    pool.evict_idle(inner.max_idle_time).await;
                }
                SupervisionEvent::ConnectionLost(notification) => {
                    match notification {
                        Some(error) => error!(%error, "publisher lost its RabbitMq connection"),
                        None => error!("publisher lost track of its RabbitMq connection"),
                    }
                    break;
                }
                SupervisionEvent::ConnectionClosed => {
                    pool.close().await;
                    info!("RabbitMq connection closed, shutting the publisher down");
                    inner.token.cancel();
                    return;
                }
            }
        }

        pool.close().await;

        let Some(reconnect_timeout) = inner.reconnect_timeout else {
            error!("no reconnect timeout configured, shutting the publisher down");
            inner.token.cancel();
            return;
        };

        let factory = connection.factory().clone();
        let reconnect = Connection::establish(factory, inner.token.child_token());
        match timeout(reconnect_timeout, reconnect).await {
            Ok(Ok(new_connection)) => {
                info!("publisher re-established its RabbitMq connection");
                let pool = build_pool(&new_connection, inner.publisher_confirms, inner.max_channels);
                *inner.state.write().await = PublisherState {
                    connection: new_connection,
                    pool,
                };
            }
            Ok(Err(_)) | Err(_) => {
                warn!(
                    timeout_secs = reconnect_timeout.as_secs(),
                    "publisher failed to re-establish the RabbitMq connection in time, shutting down"
                );
                inner.token.cancel();
                return;
            }
        }
    }
}

/// Inject the current timestamp and a message id, unless the caller already
/// set them.
fn inject_amqp_properties(mut message: OutboundMessage) -> OutboundMessage {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = message.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    message.properties =
        props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_properties_do_not_clobber_caller_values() {
        let message = OutboundMessage::default()
            .with_message_id("original-id".into())
            .with_routing_key("orders.created".into());

        let injected = inject_amqp_properties(message);

        assert_eq!(
            injected.properties.message_id().as_ref().map(|s| s.as_str()),
            Some("original-id")
        );
        assert!(injected.properties.timestamp().is_some());
    }

    #[test]
    fn injected_properties_fill_in_missing_message_id() {
        let injected = inject_amqp_properties(OutboundMessage::default());
        assert!(injected.properties.message_id().is_some());
    }

    async fn quiet_ticker() -> Interval {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        // The first tick of an interval completes immediately.
        ticker.tick().await;
        ticker
    }

    #[tokio::test]
    async fn a_clean_connection_close_winds_the_publisher_down() {
        let publisher_scope = CancellationToken::new();
        let connection_scope = CancellationToken::new();
        let (_closed_tx, mut closed) = broadcast::channel(4);
        let mut ticker = quiet_ticker().await;

        connection_scope.cancel();
        let event = next_event(&publisher_scope, &connection_scope, &mut closed, &mut ticker).await;
        assert!(matches!(event, SupervisionEvent::ConnectionClosed));
    }

    #[tokio::test]
    async fn a_loss_notification_outranks_the_cancelled_connection_scope() {
        let publisher_scope = CancellationToken::new();
        let connection_scope = CancellationToken::new();
        let (closed_tx, mut closed) = broadcast::channel(4);
        let mut ticker = quiet_ticker().await;

        // A lost session notifies and then cancels its own scope; the loss
        // must win so the reconnect policy applies.
        closed_tx
            .send(lapin::Error::InvalidConnectionState(
                lapin::ConnectionState::Closed,
            ))
            .unwrap();
        connection_scope.cancel();

        let event = next_event(&publisher_scope, &connection_scope, &mut closed, &mut ticker).await;
        assert!(matches!(event, SupervisionEvent::ConnectionLost(Some(_))));
    }

    #[tokio::test]
    async fn publisher_shutdown_takes_priority_over_everything() {
        let publisher_scope = CancellationToken::new();
        let connection_scope = CancellationToken::new();
        let (closed_tx, mut closed) = broadcast::channel(4);
        let mut ticker = quiet_ticker().await;

        closed_tx
            .send(lapin::Error::InvalidConnectionState(
                lapin::ConnectionState::Closed,
            ))
            .unwrap();
        connection_scope.cancel();
        publisher_scope.cancel();

        let event = next_event(&publisher_scope, &connection_scope, &mut closed, &mut ticker).await;
        assert!(matches!(event, SupervisionEvent::Shutdown));
    }
}
