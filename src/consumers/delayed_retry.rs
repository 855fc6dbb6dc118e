//! Delayed redelivery built on broker-native dead-lettering.
//!
//! No timers run client-side: a failed delivery is republished to a delay
//! queue with a per-message TTL and no consumers. When the TTL expires the
//! broker dead-letters the copy back to the main queue, where it is picked
//! up again with an incremented `x-death` count. Once the count reaches the
//! configured ceiling the delivery is rejected and dead-letters to the
//! failed queue instead.
//!
//! [`DelayedRetryPreset`](crate::topology::DelayedRetryPreset) provisions
//! the matching queue set.
use crate::amqp::convenience::BasicPropertiesExt;
use crate::consumers::{apply_action, Action, HandlerError, MessageHandler};
use crate::publishers::{OutboundMessage, Publisher};
use lapin::message::Delivery;
use lapin::types::{AMQPValue, ShortString};
use lapin::BasicProperties;
use std::borrow::Cow;
use std::time::Duration;
use tracing::warn;

/// Configuration for [`DelayedRetry`]. Not mutated after construction.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// How long a failed message parks in the delay queue before the broker
    /// routes it back for another attempt.
    pub delay: Duration,
    /// How many expired round trips a delivery may accumulate before it is
    /// rejected for good.
    pub max_retries: i64,
    /// The exchange retry copies are published to.
    pub delay_exchange: String,
    /// The routing key binding the delay queue.
    pub delay_routing_key: String,
}

impl RetryPolicy {
    /// Whether a delivery that already expired `prior_expirations` times is
    /// entitled to another attempt.
    pub fn should_retry(&self, prior_expirations: i64) -> bool {
        prior_expirations < self.max_retries
    }
}

/// Decorates a [`MessageHandler`] with delayed redelivery of failed messages.
///
/// All stages delegate to the wrapped handler; only the error path is
/// replaced. On a handling error the delivery is republished to the delay
/// queue and the original positively acknowledged, keeping the retry state
/// entirely broker-side in the `x-death` header. When the retry ceiling is
/// reached, or the republish itself fails, the delivery is rejected so that
/// it dead-letters to the failed queue rather than being lost.
pub struct DelayedRetry<H> {
    inner: H,
    policy: RetryPolicy,
    publisher: Publisher,
}

impl<H> DelayedRetry<H> {
    /// `publisher` must outlive connection losses if retries are expected to
    /// survive them; see [`PublisherBuilder::reconnect_timeout`](crate::publishers::PublisherBuilder::reconnect_timeout).
    pub fn new(inner: H, policy: RetryPolicy, publisher: Publisher) -> Self {
        Self {
            inner,
            policy,
            publisher,
        }
    }
}

#[async_trait::async_trait]
impl<H: MessageHandler> MessageHandler for DelayedRetry<H> {
    async fn before_handle(&self, delivery: &Delivery) -> Result<(), anyhow::Error> {
        self.inner.before_handle(delivery).await
    }

    async fn handle(&self, delivery: &Delivery) -> Result<Action, anyhow::Error> {
        self.inner.handle(delivery).await
    }

    async fn after_handle(&self, delivery: &Delivery, action: Action) -> Result<(), HandlerError> {
        self.inner.after_handle(delivery, action).await
    }

    async fn on_handle_error(
        &self,
        delivery: &Delivery,
        error: anyhow::Error,
    ) -> Result<(), HandlerError> {
        let (action, error) =
            choose_retry_action(&self.publisher, &self.policy, delivery, error).await;

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
}

/// The republish seam used by [`DelayedRetry`].
#[async_trait::async_trait]
pub(crate) trait RetryTransport: Send + Sync {
    async fn park(&self, message: OutboundMessage) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl RetryTransport for Publisher {
    async fn park(&self, message: OutboundMessage) -> Result<(), anyhow::Error> {
        self.publish(message).await.map_err(anyhow::Error::new)
    }
}

/// Pick the terminal action for a failed delivery.
///
/// While the retry ceiling allows, a copy is parked in the delay queue and
/// the original gets an Ack; at the ceiling no republish is attempted and
/// the delivery is rejected. A failed republish downgrades to Reject as
/// well, so the message dead-letters instead of being lost.
async fn choose_retry_action(
    transport: &dyn RetryTransport,
    policy: &RetryPolicy,
    delivery: &Delivery,
    error: anyhow::Error,
) -> (Action, anyhow::Error) {
    let prior_expirations = expired_death_count(&delivery.properties);
    if !policy.should_retry(prior_expirations) {
        return (Action::Reject, error);
    }

    match transport.park(retry_message(delivery, policy)).await {
        Ok(()) => (Action::Ack, error),
        Err(publish_error) => {
            warn!(
                error = %publish_error,
                "failed to park a copy of the delivery in the delay queue, rejecting",
            );
            let error = error
                .context(format!("republishing to the delay queue failed: {publish_error:#}"));
            (Action::Reject, error)
        }
    }
}

/// How many times the message already expired out of a queue, according to
/// the `x-death` header the broker maintains.
///
/// Dead-lettering for other reasons (`rejected`, `maxlen`) is ignored, and a
/// missing or malformed header counts as zero.
pub fn expired_death_count(properties: &BasicProperties) -> i64 {
    let death_header: ShortString = "x-death".into();
    let death_history = match properties
        .get_header(&death_header)
        .and_then(AMQPValue::as_array)
    {
        Some(history) => history,
        None => return 0,
    };
    let reason_key: ShortString = "reason".into();
    let count_key: ShortString = "count".into();
    for event in death_history.as_slice() {
        let event = match event.as_field_table() {
            Some(event) => event,
            None => continue,
        };
        match event.inner().get(&reason_key).and_then(string_value) {
            Some(reason) if reason == "expired" => {}
            _ => continue,
        }
        return event
            .inner()
            .get(&count_key)
            .and_then(AMQPValue::as_long_long_int)
            .unwrap_or(0);
    }
    0
}

fn string_value(value: &AMQPValue) -> Option<Cow<'_, str>> {
    match value {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes())),
        AMQPValue::ShortString(value) => Some(Cow::Borrowed(value.as_str())),
        _ => None,
    }
}

/// Build the copy of `delivery` to park in the delay queue.
///
/// Headers, content type, content encoding and the body are preserved so
/// that the redelivered message is indistinguishable from the original; the
/// per-message TTL is the policy delay.
fn retry_message(delivery: &Delivery, policy: &RetryPolicy) -> OutboundMessage {
    let mut properties = BasicProperties::default();
    if let Some(headers) = delivery.properties.headers() {
        properties = properties.with_headers(headers.clone());
    }
    if let Some(content_type) = delivery.properties.content_type() {
        properties = properties.with_content_type(content_type.clone());
    }
    if let Some(content_encoding) = delivery.properties.content_encoding() {
        properties = properties.with_content_encoding(content_encoding.clone());
    }

    OutboundMessage {
        payload: delivery.data.clone(),
        exchange_name: policy.delay_exchange.clone(),
        routing_key: policy.delay_routing_key.clone(),
        properties: properties.with_expiration(duration_to_expiration(policy.delay)),
        mandatory: false,
    }
}

/// Convert a delay into the broker's per-message TTL format: whole
/// milliseconds as a decimal string. Sub-millisecond delays truncate to "0",
/// meaning the copy expires immediately.
fn duration_to_expiration(delay: Duration) -> ShortString {
    delay.as_millis().to_string().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::types::{FieldArray, FieldTable};
    use std::sync::Mutex;

    /// Records parked copies instead of talking to a broker.
    #[derive(Default)]
    struct ParkLog {
        fail: bool,
        parked: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait::async_trait]
    impl RetryTransport for ParkLog {
        async fn park(&self, message: OutboundMessage) -> Result<(), anyhow::Error> {
            self.parked.lock().unwrap().push(message);
            if self.fail {
                anyhow::bail!("the delay queue is unreachable");
            }
            Ok(())
        }
    }

    fn delivery_with_expirations(count: i64) -> Delivery {
        let properties = if count > 0 {
            properties_with_deaths(vec![death_event("expired", count)])
        } else {
            BasicProperties::default()
        };
        Delivery {
            delivery_tag: 1,
            exchange: "orders".into(),
            routing_key: "orders".into(),
            redelivered: false,
            properties,
            data: b"{}".to_vec(),
            acker: Default::default(),
        }
    }

    fn death_event(reason: &str, count: i64) -> AMQPValue {
        let mut event = FieldTable::default();
        event.insert("reason".into(), AMQPValue::LongString(reason.into()));
        event.insert("count".into(), AMQPValue::LongLongInt(count));
        event.insert("queue".into(), AMQPValue::LongString("orders".into()));
        AMQPValue::FieldTable(event)
    }

    fn properties_with_deaths(events: Vec<AMQPValue>) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert("x-death".into(), AMQPValue::FieldArray(FieldArray::from(events)));
        BasicProperties::default().with_headers(headers)
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_secs(60),
            max_retries: 5,
            delay_exchange: "orders".into(),
            delay_routing_key: "orders.delay".into(),
        }
    }

    #[test]
    fn expirations_convert_to_whole_milliseconds() {
        assert_eq!(duration_to_expiration(Duration::ZERO).as_str(), "0");
        assert_eq!(
            duration_to_expiration(Duration::from_micros(900)).as_str(),
            "0"
        );
        assert_eq!(
            duration_to_expiration(Duration::from_secs(60)).as_str(),
            "60000"
        );
        assert_eq!(
            duration_to_expiration(Duration::from_nanos(65_536_344_334)).as_str(),
            "65536"
        );
    }

    #[test]
    fn a_delivery_without_death_history_has_expired_zero_times() {
        assert_eq!(expired_death_count(&BasicProperties::default()), 0);
        assert_eq!(
            expired_death_count(&BasicProperties::default().with_headers(FieldTable::default())),
            0
        );
    }

    #[test]
    fn the_expired_event_count_is_extracted_from_the_death_history() {
        let properties = properties_with_deaths(vec![
            death_event("rejected", 7),
            death_event("expired", 3),
        ]);
        assert_eq!(expired_death_count(&properties), 3);
    }

    #[test]
    fn deaths_for_other_reasons_are_ignored() {
        let properties = properties_with_deaths(vec![death_event("maxlen", 2)]);
        assert_eq!(expired_death_count(&properties), 0);
    }

    #[test]
    fn a_malformed_death_header_counts_as_zero() {
        let mut headers = FieldTable::default();
        headers.insert("x-death".into(), AMQPValue::LongString("oops".into()));
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(expired_death_count(&properties), 0);

        let properties =
            properties_with_deaths(vec![AMQPValue::LongString("not a table".into())]);
        assert_eq!(expired_death_count(&properties), 0);
    }

    #[tokio::test]
    async fn failures_below_the_ceiling_park_a_copy_and_ack() {
        let transport = ParkLog::default();
        let (action, _) = choose_retry_action(
            &transport,
            &policy(),
            &delivery_with_expirations(4),
            anyhow::anyhow!("handler failed"),
        )
        .await;

        assert_eq!(action, Action::Ack);
        let parked = transport.parked.lock().unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].routing_key, "orders.delay");
        assert_eq!(
            parked[0].properties.expiration().as_ref().map(|v| v.as_str()),
            Some("60000")
        );
    }

    #[tokio::test]
    async fn the_failure_past_the_ceiling_is_rejected_without_republishing() {
        // Five prior expirations against a ceiling of five: the sixth
        // attempt gets no delay-queue copy.
        let transport = ParkLog::default();
        let (action, _) = choose_retry_action(
            &transport,
            &policy(),
            &delivery_with_expirations(5),
            anyhow::anyhow!("handler failed"),
        )
        .await;

        assert_eq!(action, Action::Reject);
        assert!(transport.parked.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn a_failed_republish_downgrades_to_reject() {
        let transport = ParkLog {
            fail: true,
            ..Default::default()
        };
        let (action, error) = choose_retry_action(
            &transport,
            &policy(),
            &delivery_with_expirations(0),
            anyhow::anyhow!("handler failed"),
        )
        .await;

        assert_eq!(action, Action::Reject);
        assert_eq!(transport.parked.lock().unwrap().len(), 1);
        assert!(format!("{error:#}").contains("delay queue"));
    }

    #[test]
    fn the_retry_ceiling_counts_prior_expirations() {
        let policy = policy();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn retry_copies_preserve_the_message_identity() {
        let mut headers = FieldTable::default();
        headers.insert("trace-id".into(), AMQPValue::LongString("abc-123".into()));
        let delivery = Delivery {
            delivery_tag: 42,
            exchange: "orders".into(),
            routing_key: "orders".into(),
            redelivered: false,
            properties: BasicProperties::default()
                .with_headers(headers.clone())
                .with_content_type("application/json".into())
                .with_content_encoding("gzip".into()),
            data: b"{\"id\":1}".to_vec(),
            acker: Default::default(),
        };

        let message = retry_message(&delivery, &policy());

        assert_eq!(message.exchange_name, "orders");
        assert_eq!(message.routing_key, "orders.delay");
        assert_eq!(message.payload, delivery.data);
        assert!(!message.mandatory);
        assert_eq!(message.properties.headers(), &Some(headers));
        assert_eq!(
            message.properties.content_type().as_ref().map(|v| v.as_str()),
            Some("application/json")
        );
        assert_eq!(
            message.properties.content_encoding().as_ref().map(|v| v.as_str()),
            Some("gzip")
        );
        assert_eq!(
            message.properties.expiration().as_ref().map(|v| v.as_str()),
            Some("60000")
        );
    }
}
