//! Implements [`Manage`] for [`Channel`].
use super::Manage;
use crate::connection::Connection;
use lapin::{options::ConfirmSelectOptions, Channel, ChannelState};
use tracing::{debug, warn};

/// Creates and disposes of the [`Channel`]s held by a
/// [`ResourcePool`](super::ResourcePool).
///
/// By default all channels have publisher confirmations enabled; you can opt
/// out using [`ChannelManager::without_publisher_confirmations`].
pub struct ChannelManager {
    connection: Connection,
    pub(crate) publisher_confirms: bool,
}

impl ChannelManager {
    /// Construct a `ChannelManager` on top of a [`Connection`].
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            publisher_confirms: true,
        }
    }

    /// Disable publisher confirmations on the channels built by this manager.
    pub fn without_publisher_confirmations(mut self) -> Self {
        self.publisher_confirms = false;
        self
    }
}

#[async_trait::async_trait]
impl Manage for ChannelManager {
    type Resource = Channel;

    /// Open a new channel, retrying failed attempts until the connection
    /// scope is cancelled.
    async fn create(&self) -> Result<Channel, anyhow::Error> {
        let cancelled = self.connection.cancellation();
        loop {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {
                    anyhow::bail!("connection scope was cancelled while opening a channel");
                }
                outcome = self.connection.open_channel() => match outcome {
                    Ok(channel) => {
                        if self.publisher_confirms {
                            channel
                                .confirm_select(ConfirmSelectOptions { nowait: false })
                                .await?;
                        }
                        debug!("RabbitMq channel opened");
                        return Ok(channel);
                    }
                    Err(error) => {
                        warn!(%error, "unable to open a RabbitMq channel, retrying");
                    }
                },
            }
        }
    }

    async fn destroy(&self, channel: Channel) {
        // A channel that already died broker-side has nothing left to close.
        if !matches!(channel.status().state(), ChannelState::Connected) {
            return;
        }
        match channel.close(200, "closed by the channel pool").await {
            Ok(()) => debug!("RabbitMq channel closed"),
            Err(error) => warn!(%error, "error while closing a pooled RabbitMq channel"),
        }
    }
}
