//! The message handling contract and its acknowledgement semantics.
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};
use std::fmt;
use std::future::Future;

/// The terminal disposition of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Positively acknowledge the delivery.
    Ack,
    /// Negatively acknowledge without requeueing; the broker dead-letters
    /// the message if the queue is configured for it, drops it otherwise.
    Nack,
    /// Negatively acknowledge and put the message back on the queue.
    Requeue,
    /// Reject the delivery without requeueing.
    Reject,
}

/// The broker primitives an [`Action`] translates to. Every action maps to
/// exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acknowledgement {
    Ack,
    Nack { requeue: bool },
    Reject,
}

impl Action {
    pub(crate) fn acknowledgement(self) -> Acknowledgement {
        match self {
            Action::Ack => Acknowledgement::Ack,
            Action::Nack => Acknowledgement::Nack { requeue: false },
            Action::Requeue => Acknowledgement::Nack { requeue: true },
            Action::Reject => Acknowledgement::Reject,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Ack => "ack",
            Action::Nack => "nack",
            Action::Requeue => "requeue",
            Action::Reject => "reject",
        };
        f.write_str(name)
    }
}

/// Apply `action` to `delivery`, invoking exactly one acknowledgement
/// primitive on the channel the delivery arrived on.
pub async fn apply_action(delivery: &Delivery, action: Action) -> Result<(), lapin::Error> {
    match action.acknowledgement() {
        Acknowledgement::Ack => {
            delivery
                .acker
                .ack(BasicAckOptions { multiple: false })
                .await
        }
        Acknowledgement::Nack { requeue } => {
            delivery
                .acker
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue,
                })
                .await
        }
        Acknowledgement::Reject => {
            delivery
                .acker
                .reject(BasicRejectOptions { requeue: false })
                .await
        }
    }
}

/// Errors surfaced by [`MessageHandler::process`].
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    /// The pre-handle hook failed; the delivery was not touched.
    #[error("the pre-handle hook failed")]
    BeforeHandle(#[source] anyhow::Error),
    /// Handling failed; the delivery was dispositioned with `action`.
    #[error("message handling failed, the delivery was dispositioned with {action}")]
    Handling {
        action: Action,
        #[source]
        source: anyhow::Error,
    },
    /// The acknowledgement itself could not be delivered to the broker.
    #[error("failed to apply {action} to the delivery")]
    Acknowledge {
        action: Action,
        #[source]
        source: anyhow::Error,
    },
    /// The after-handle hook failed.
    #[error("the after-handle hook failed")]
    AfterHandle(#[source] anyhow::Error),
}

/// The contract between a consumer worker and your message processing logic.
///
/// Only [`handle`](MessageHandler::handle) is mandatory; the other stages
/// have defaults that acknowledge the delivery according to the returned
/// [`Action`]. The chain guarantees each delivery receives exactly one
/// terminal acknowledgement, no matter which stage fails.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Runs before [`handle`](MessageHandler::handle). An error aborts the
    /// chain before the delivery is touched, leaving it unacknowledged.
    async fn before_handle(&self, _delivery: &Delivery) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// Process the delivery, returning the [`Action`] to disposition it with.
    async fn handle(&self, delivery: &Delivery) -> Result<Action, anyhow::Error>;

    /// Runs after a successful [`handle`](MessageHandler::handle). The
    /// default applies `action` to the delivery.
    async fn after_handle(&self, delivery: &Delivery, action: Action) -> Result<(), HandlerError> {
        apply_action(delivery, action)
            .await
            .map_err(|source| HandlerError::Acknowledge {
                action,
                source: source.into(),
            })
    }

    /// Runs when [`handle`](MessageHandler::handle) returned an error. The
    /// default requeues the delivery and surfaces the handling error.
    ///
    /// Careful: a message that keeps failing will be redelivered forever.
    /// Wrap your handler in [`DelayedRetry`](super::DelayedRetry) to bound
    /// the number of attempts.
    async fn on_handle_error(
        &self,
        delivery: &Delivery,
        error: anyhow::Error,
    ) -> Result<(), HandlerError> {
        let action = Action::Requeue;
        match apply_action(delivery, action).await {
            Ok(()) => Err(HandlerError::Handling {
                action,
                source: error,
            }),
            Err(ack_error) => Err(HandlerError::Acknowledge {
                action,
                source: anyhow::Error::new(ack_error)
                    .context(format!("while handling a failed delivery: {error:#}")),
            }),
        }
    }

    /// Drive the whole chain for one delivery.
    async fn process(&self, delivery: &Delivery) -> Result<(), HandlerError> {
        self.before_handle(delivery)
            .await
            .map_err(HandlerError::BeforeHandle)?;
        match self.handle(delivery).await {
            Ok(action) => self.after_handle(delivery, action).await,
            Err(error) => self.on_handle_error(delivery, error).await,
        }
    }
}

/// Newtype to turn an async function into a [`MessageHandler`].
///
/// ```no_run
/// use warren::consumers::{Action, HandlerFn};
/// use lapin::message::Delivery;
///
/// async fn log_size(delivery: &Delivery) -> Result<Action, anyhow::Error> {
///     println!("{} bytes", delivery.data.len());
///     Ok(Action::Ack)
/// }
///
/// let handler = HandlerFn(log_size);
/// ```
pub struct HandlerFn<F>(pub F);

/// Helper trait to paper over the lifetime of the delivery borrowed by the
/// future a handler function returns.
pub trait AsyncHandleFn<'a>: Send + Sync + 'static {
    type Output: Future<Output = Result<Action, anyhow::Error>> + Send + 'a;
    fn call(&'a self, delivery: &'a Delivery) -> Self::Output;
}

impl<'a, F, Fut> AsyncHandleFn<'a> for F
where
    F: Fn(&'a Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Action, anyhow::Error>> + Send + 'a,
{
    type Output = Fut;

    fn call(&'a self, delivery: &'a Delivery) -> Fut {
        (self)(delivery)
    }
}

#[async_trait::async_trait]
impl<F> MessageHandler for HandlerFn<F>
where
    F: for<'a> AsyncHandleFn<'a>,
{
    async fn handle(&self, delivery: &Delivery) -> Result<Action, anyhow::Error> {
        self.0.call(delivery).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::BasicProperties;

    fn delivery(data: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: "".into(),
            routing_key: "".into(),
            redelivered: false,
            properties: BasicProperties::default(),
            data: data.to_vec(),
            acker: Default::default(),
        }
    }

    #[test]
    fn every_action_maps_to_a_single_acknowledgement() {
        assert_eq!(Action::Ack.acknowledgement(), Acknowledgement::Ack);
        assert_eq!(
            Action::Nack.acknowledgement(),
            Acknowledgement::Nack { requeue: false }
        );
        assert_eq!(
            Action::Requeue.acknowledgement(),
            Acknowledgement::Nack { requeue: true }
        );
        assert_eq!(Action::Reject.acknowledgement(), Acknowledgement::Reject);
    }

    async fn reject_empty(delivery: &Delivery) -> Result<Action, anyhow::Error> {
        if delivery.data.is_empty() {
            Ok(Action::Reject)
        } else {
            Ok(Action::Ack)
        }
    }

    #[tokio::test]
    async fn an_async_function_can_be_used_as_a_handler() {
        let handler = HandlerFn(reject_empty);

        let action = handler.handle(&delivery(b"payload")).await.unwrap();
        assert_eq!(action, Action::Ack);
        let action = handler.handle(&delivery(b"")).await.unwrap();
        assert_eq!(action, Action::Reject);
    }

    #[tokio::test]
    async fn the_default_pre_handle_hook_is_a_no_op() {
        let handler = HandlerFn(reject_empty);
        assert!(handler.before_handle(&delivery(b"payload")).await.is_ok());
    }
}
