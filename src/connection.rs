//! Supervision of a single broker connection.
//!
//! [`Connection`] owns one `lapin` session and a background supervisor task.
//! Publishers and consumers hold cheap clones of the handle and derive their
//! own cancellation scope from it via [`Connection::child_token`].

use crate::amqp::ConnectionFactory;
use lapin::Channel;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Error returned by [`Connection::establish`].
///
/// Transient dial failures are retried internally and never surfaced;
/// cancellation of the owning scope is the only way establishment can fail.
#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("connection establishment was cancelled before a session could be opened")]
    Cancelled,
}

/// A supervised session with the RabbitMq broker.
///
/// `Connection` is a cheap-clone handle: publishers and consumers keep their
/// own copy, while the session itself is owned by the supervisor task spawned
/// by [`Connection::establish`]. The supervisor selects between the owning
/// cancellation scope (triggering a clean close of the session) and an error
/// notification from the session itself (marking the connection done so that
/// dependents can react).
#[derive(Clone)]
pub struct Connection {
    session: Arc<lapin::Connection>,
    factory: ConnectionFactory,
    token: CancellationToken,
    closed_tx: broadcast::Sender<lapin::Error>,
}

impl Connection {
    /// Establish a session with the broker, retrying failed dial attempts
    /// immediately until either success or `token` is cancelled.
    ///
    /// Note: the retry loop has no backoff or jitter by design. Under
    /// sustained broker unavailability this keeps the dial path hot; bound
    /// the wait by cancelling `token` or by wrapping the call in a timeout.
    pub async fn establish(
        factory: ConnectionFactory,
        token: CancellationToken,
    ) -> Result<Self, ConnectError> {
        let mut attempt: u32 = 1;
        let session = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ConnectError::Cancelled),
                outcome = factory.new_connection() => match outcome {
                    Ok(session) => break session,
                    Err(error) => {
                        warn!(%error, attempt, "cannot establish connection to RabbitMq, retrying");
                        attempt += 1;
                    }
                },
            }
        };
        info!("RabbitMq connection established");

        let (closed_tx, _) = broadcast::channel(4);
        session.on_error({
            let closed_tx = closed_tx.clone();
            move |error| {
                let _ = closed_tx.send(error);
            }
        });

        let connection = Self {
            session: Arc::new(session),
            factory,
            token,
            closed_tx,
        };
        tokio::spawn(supervise(
            connection.session.clone(),
            connection.token.clone(),
            connection.closed_tx.subscribe(),
        ));
        Ok(connection)
    }

    /// Whether the underlying session is no longer usable.
    pub fn is_closed(&self) -> bool {
        !self.session.status().connected()
    }

    /// Open a new protocol channel on this connection.
    ///
    /// This is a single attempt; [`ChannelManager`](crate::pool::ChannelManager)
    /// layers a retry loop on top for pooled channels.
    pub async fn open_channel(&self) -> Result<Channel, lapin::Error> {
        self.session.create_channel().await
    }

    /// Subscribe to connection-loss notifications.
    ///
    /// A value is delivered when the session reports an unrecoverable error.
    /// A clean [`Connection::shutdown`] does not notify; observe the
    /// cancellation token for that.
    pub fn subscribe_closed(&self) -> broadcast::Receiver<lapin::Error> {
        self.closed_tx.subscribe()
    }

    /// The cancellation scope owning this connection.
    ///
    /// It is cancelled either by the caller (clean shutdown) or by the
    /// supervisor when the session reports an unrecoverable close.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.token
    }

    /// Derive a child cancellation scope for a dependent component.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// The factory this session was dialed with.
    ///
    /// Used by [`Publisher`](crate::publishers::Publisher) to re-establish
    /// the connection after a loss.
    pub fn factory(&self) -> &ConnectionFactory {
        &self.factory
    }

    /// Request a clean close of the session.
    ///
    /// The supervisor task performs the actual close; dependents observe the
    /// cancellation of [`Connection::cancellation`].
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

/// One background task per established session.
async fn supervise(
    session: Arc<lapin::Connection>,
    token: CancellationToken,
    mut closed: broadcast::Receiver<lapin::Error>,
) {
    tokio::select! {
        _ = token.cancelled() => {
            if let Err(error) = session.close(200, "shutting down").await {
                warn!(%error, "error while closing the RabbitMq connection");
            }
            info!("RabbitMq connection closed");
        }
        notification = closed.recv() => {
            if let Ok(error) = notification {
                error!(%error, "connection to RabbitMq was closed");
            }
            // Mark the connection done so dependents wind down.
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::configuration::RabbitMqSettings;

    #[tokio::test]
    async fn establish_fails_fast_when_already_cancelled() {
        let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default()).unwrap();
        let token = CancellationToken::new();
        token.cancel();

        let outcome = Connection::establish(factory, token).await;
        assert!(matches!(outcome, Err(ConnectError::Cancelled)));
    }
}
