//! Worker groups consuming a single queue.
use crate::connection::Connection;
use crate::consumers::MessageHandler;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::BasicConsumeOptions;
use lapin::types::FieldTable;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Instrument};

#[derive(thiserror::Error, Debug)]
pub enum ConsumerError {
    /// The connection was already gone when the group was started.
    #[error("the connection to the RabbitMq broker is not available")]
    NotConnected,
    /// The worker group scope was cancelled.
    #[error("the consumer worker group was cancelled")]
    Cancelled,
    /// The channel a worker was consuming on was closed by the broker.
    #[error("the consume channel was closed by the broker")]
    ChannelClosed(#[source] lapin::Error),
    /// A broker interaction failed.
    #[error("error encountered when interacting with the RabbitMq broker")]
    Broker(#[source] lapin::Error),
    /// A worker task panicked or was aborted.
    #[error("a consumer worker task failed")]
    Worker(#[source] tokio::task::JoinError),
}

/// Identity and flags for a `basic.consume`, applied identically to every
/// worker in a group.
#[derive(Clone, Default)]
pub struct ConsumeParams {
    /// The queue to consume from.
    pub queue: String,
    /// Prefix for the per-worker consumer tags. Workers are tagged
    /// `<prefix>-<index>`, falling back to the queue name when unset.
    pub consumer_tag: Option<String>,
    /// Let the broker consider deliveries acknowledged as soon as they are
    /// sent. The handler chain still runs, but its acknowledgements are
    /// meaningless; leave this off unless you can afford message loss.
    pub auto_ack: bool,
    /// Request exclusive consumer access to the queue.
    pub exclusive: bool,
    /// Do not receive messages published on this same connection.
    pub no_local: bool,
    /// Do not wait for the broker to confirm the consume request.
    pub no_wait: bool,
    /// Additional arguments for the consume request.
    pub args: FieldTable,
}

/// Consumes messages from a queue with a group of concurrent workers.
///
/// Each worker opens its own protocol channel and registers its own
/// `basic.consume`; the broker round-robins deliveries between them. The
/// group lives in a cancellation scope derived from the connection, so a
/// connection shutdown winds down every worker.
pub struct Consumer {
    connection: Connection,
    token: CancellationToken,
    workers_count: usize,
    synchronous: bool,
}

#[must_use = "a builder does nothing unless you call `build`"]
pub struct ConsumerBuilder {
    connection: Connection,
    workers_count: usize,
    synchronous: bool,
}

impl Consumer {
    pub fn builder(connection: Connection) -> ConsumerBuilder {
        ConsumerBuilder {
            connection,
            workers_count: 1,
            synchronous: false,
        }
    }

    /// Run a group of workers against `params.queue` until the queue is
    /// deleted, the scope is cancelled or a worker fails.
    ///
    /// The first worker error cancels its siblings and becomes the result of
    /// the group; cancellations triggered by that error are not reported as
    /// errors of their own. A connection loss cancels the group as well.
    pub async fn start_workers_group(
        &self,
        params: ConsumeParams,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumerError> {
        if self.connection.is_closed() {
            return Err(ConsumerError::NotConnected);
        }

        let token = self.token.child_token();
        let mut workers = JoinSet::new();
        for index in 1..=self.workers_count.max(1) {
            let consumer_tag = match &params.consumer_tag {
                Some(prefix) => format!("{prefix}-{index}"),
                None => format!("{}-{}", params.queue, index),
            };
            workers.spawn(worker(
                self.connection.clone(),
                params.clone(),
                consumer_tag,
                Arc::clone(&handler),
                self.synchronous,
                token.clone(),
            ));
        }

        await_group(workers, token, self.connection.subscribe_closed()).await
    }
}

impl ConsumerBuilder {
    /// How many concurrent workers the group runs. Defaults to 1.
    pub fn workers_count(mut self, count: usize) -> Self {
        self.workers_count = count;
        self
    }

    /// Process deliveries inline on the worker task instead of spawning a
    /// task per delivery. Each worker then handles at most one message at a
    /// time, preserving the delivery order within its channel.
    pub fn synchronous(mut self) -> Self {
        self.synchronous = true;
        self
    }

    pub fn build(self) -> Consumer {
        Consumer {
            token: self.connection.child_token(),
            connection: self.connection,
            workers_count: self.workers_count,
            synchronous: self.synchronous,
        }
    }
}

/// Supervise a set of spawned workers: the first error wins, cancels the
/// remaining workers and is returned once all of them have wound down.
async fn await_group(
    mut workers: JoinSet<Result<(), ConsumerError>>,
    token: CancellationToken,
    mut connection_closed: broadcast::Receiver<lapin::Error>,
) -> Result<(), ConsumerError> {
    let mut first_error = None;
    loop {
        tokio::select! {
            joined = workers.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(worker_error))) => {
                    if first_error.is_none() {
                        error!(error = %worker_error, "consumer worker failed, stopping the group");
                        first_error = Some(worker_error);
                    }
                    token.cancel();
                }
                Some(Err(join_error)) => {
                    if first_error.is_none() {
                        first_error = Some(ConsumerError::Worker(join_error));
                    }
                    token.cancel();
                }
            },
            _ = connection_closed.recv() => token.cancel(),
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

async fn worker(
    connection: Connection,
    params: ConsumeParams,
    consumer_tag: String,
    handler: Arc<dyn MessageHandler>,
    synchronous: bool,
    token: CancellationToken,
) -> Result<(), ConsumerError> {
    let channel = connection
        .open_channel()
        .await
        .map_err(ConsumerError::Broker)?;

    // `on_error` may fire more than once; one slot is enough, we only care
    // about the first failure.
    let (channel_error_tx, mut channel_errors) = mpsc::channel(1);
    channel.on_error(move |error| {
        let _ = channel_error_tx.try_send(error);
    });

    let options = BasicConsumeOptions {
        no_local: params.no_local,
        no_ack: params.auto_ack,
        exclusive: params.exclusive,
        nowait: params.no_wait,
    };
    let mut deliveries = channel
        .basic_consume(&params.queue, &consumer_tag, options, params.args.clone())
        .await
        .map_err(ConsumerError::Broker)?;

    info!(queue = %params.queue, consumer_tag = %consumer_tag, "consumer worker started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ConsumerError::Cancelled),
            Some(channel_error) = channel_errors.recv() => {
                return Err(ConsumerError::ChannelClosed(channel_error));
            }
            delivery = deliveries.next() => match delivery {
                // The broker cancelled the consumer, e.g. the queue was deleted.
                None => return Ok(()),
                Some(Err(error)) => return Err(ConsumerError::Broker(error)),
                Some(Ok(delivery)) => {
                    let handler = Arc::clone(&handler);
                    let tag = consumer_tag.clone();
                    if synchronous {
                        dispatch(handler, delivery, tag).await;
                    } else {
                        let span = tracing::info_span!("message_dispatch", consumer_tag = %tag);
                        tokio::spawn(dispatch(handler, delivery, tag).instrument(span));
                    }
                }
            },
        }
    }
}

/// Hand one delivery to the handler chain. Chain failures are logged and
/// never tear the worker down; the chain itself guarantees the delivery got
/// a terminal acknowledgement wherever that was still possible.
async fn dispatch(handler: Arc<dyn MessageHandler>, delivery: Delivery, consumer_tag: String) {
    if let Err(handler_error) = handler.process(&delivery).await {
        error!(
            error = %handler_error,
            consumer_tag = %consumer_tag,
            delivery_tag = %delivery.delivery_tag,
            "failed to process a delivery",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    #[tokio::test]
    async fn a_group_of_successful_workers_reports_no_error() {
        let token = CancellationToken::new();
        let (_closed_tx, closed_rx) = broadcast::channel(1);
        let mut workers = JoinSet::new();
        for _ in 0..3 {
            workers.spawn(async { Ok(()) });
        }

        let outcome = await_group(workers, token, closed_rx).await;
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn the_first_failure_cancels_the_siblings_and_wins() {
        let token = CancellationToken::new();
        let (_closed_tx, closed_rx) = broadcast::channel(1);
        let mut workers = JoinSet::new();
        for _ in 0..2 {
            let token = token.clone();
            workers.spawn(async move {
                token.cancelled().await;
                Err(ConsumerError::Cancelled)
            });
        }
        workers.spawn(async {
            sleep(Duration::from_millis(10)).await;
            Err(ConsumerError::NotConnected)
        });

        let outcome = await_group(workers, token, closed_rx).await;
        assert!(matches!(outcome, Err(ConsumerError::NotConnected)));
    }

    #[tokio::test]
    async fn a_connection_loss_notification_winds_the_group_down() {
        let token = CancellationToken::new();
        let (closed_tx, closed_rx) = broadcast::channel(1);
        let mut workers = JoinSet::new();
        for _ in 0..2 {
            let token = token.clone();
            workers.spawn(async move {
                token.cancelled().await;
                Err(ConsumerError::Cancelled)
            });
        }

        closed_tx
            .send(lapin::Error::InvalidConnectionState(
                lapin::ConnectionState::Closed,
            ))
            .unwrap();
        let outcome = await_group(workers, token, closed_rx).await;
        assert!(matches!(outcome, Err(ConsumerError::Cancelled)));
    }
}
