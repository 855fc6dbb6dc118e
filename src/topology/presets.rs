//! Reusable topology bundles.
use super::{Binding, Preset, QueueDeclare, Topology};
use anyhow::Context;
use lapin::types::ShortString;

/// Provisions the three-queue set expected by
/// [`DelayedRetry`](crate::consumers::DelayedRetry).
///
/// Given a main queue `orders` bound to exchange `commerce` with routing key
/// `orders`, the preset declares:
///
/// * `orders`, dead-lettering to `commerce` with key `orders.failed`;
/// * `orders_delay`, bound with key `orders.delay`, dead-lettering back to
///   `commerce` with the main key so expired copies re-enter `orders`;
/// * `orders_failed`, bound with key `orders.failed`, where messages land
///   once the retry ceiling is reached.
///
/// The exchange itself is not declared; routing keys must be unique per
/// queue set on the shared exchange.
pub struct DelayedRetryPreset {
    /// The main queue.
    pub queue: QueueDeclare,
    /// The delay queue; derived from the main declaration with a `_delay`
    /// suffix when unset.
    pub delay_queue: Option<QueueDeclare>,
    /// The failed queue; derived with a `_failed` suffix when unset.
    pub failed_queue: Option<QueueDeclare>,
    /// The exchange all three queues are bound to.
    pub exchange_name: String,
    /// The main routing key; defaults to the main queue name. The delay and
    /// failed keys are always `<key>.delay` and `<key>.failed`.
    pub routing_key: Option<String>,
}

struct QueuePlan {
    queues: [QueueDeclare; 3],
    bindings: [Binding; 3],
}

impl DelayedRetryPreset {
    pub fn new(exchange_name: impl Into<String>, queue: QueueDeclare) -> Self {
        Self {
            queue,
            delay_queue: None,
            failed_queue: None,
            exchange_name: exchange_name.into(),
            routing_key: None,
        }
    }

    /// Resolve derived queue names, routing keys and dead-letter arguments.
    ///
    /// Dead-letter arguments already present on a caller-supplied declaration
    /// are left untouched.
    fn plan(&self) -> QueuePlan {
        let main_key = self
            .routing_key
            .clone()
            .unwrap_or_else(|| self.queue.name.clone());
        let delay_key = format!("{main_key}.delay");
        let failed_key = format!("{main_key}.failed");

        let delay_queue = self
            .delay_queue
            .clone()
            .unwrap_or_else(|| derived(&self.queue, "delay"));
        let failed_queue = self
            .failed_queue
            .clone()
            .unwrap_or_else(|| derived(&self.queue, "failed"));

        let main_queue = with_default_dead_letter(self.queue.clone(), &self.exchange_name, &failed_key);
        let delay_queue = with_default_dead_letter(delay_queue, &self.exchange_name, &main_key);

        let bind = |queue: &QueueDeclare, key: &str| Binding {
            destination: queue.name.clone(),
            source: self.exchange_name.clone(),
            routing_key: key.to_owned(),
            ..Default::default()
        };
        QueuePlan {
            bindings: [
                bind(&main_queue, &main_key),
                bind(&delay_queue, &delay_key),
                bind(&failed_queue, &failed_key),
            ],
            queues: [main_queue, delay_queue, failed_queue],
        }
    }
}

fn derived(queue: &QueueDeclare, suffix: &str) -> QueueDeclare {
    let mut derived = queue.clone();
    derived.name = format!("{}_{}", queue.name, suffix);
    derived
}

fn with_default_dead_letter(queue: QueueDeclare, exchange: &str, routing_key: &str) -> QueueDeclare {
    let exchange_key: ShortString = "x-dead-letter-exchange".into();
    let routing_key_key: ShortString = "x-dead-letter-routing-key".into();
    let mut queue = queue;
    if !queue.args.inner().contains_key(&exchange_key) {
        queue = queue.with_dead_letter_exchange(exchange);
    }
    if !queue.args.inner().contains_key(&routing_key_key) {
        queue = queue.with_dead_letter_routing_key(routing_key);
    }
    queue
}

#[async_trait::async_trait]
impl Preset for DelayedRetryPreset {
    async fn apply(&self, topology: &Topology) -> Result<(), anyhow::Error> {
        let plan = self.plan();
        topology
            .declare_queues(&plan.queues)
            .await
            .context("failed to declare the delayed-retry queue set")?;
        topology
            .bind_queues(&plan.bindings)
            .await
            .context("failed to bind the delayed-retry queue set")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::types::AMQPValue;

    fn dead_letter_args(queue: &QueueDeclare) -> (Option<String>, Option<String>) {
        let exchange_key: ShortString = "x-dead-letter-exchange".into();
        let routing_key_key: ShortString = "x-dead-letter-routing-key".into();
        let as_string = |value: Option<&AMQPValue>| match value {
            Some(AMQPValue::LongString(value)) => {
                Some(String::from_utf8_lossy(value.as_bytes()).into_owned())
            }
            _ => None,
        };
        (
            as_string(queue.args.inner().get(&exchange_key)),
            as_string(queue.args.inner().get(&routing_key_key)),
        )
    }

    #[test]
    fn derived_queues_and_keys_follow_the_naming_scheme() {
        let preset = DelayedRetryPreset::new("commerce", QueueDeclare::durable("orders"));
        let plan = preset.plan();

        let names: Vec<_> = plan.queues.iter().map(|q| q.name.as_str()).collect();
        assert_eq!(names, ["orders", "orders_delay", "orders_failed"]);
        let keys: Vec<_> = plan
            .bindings
            .iter()
            .map(|b| b.routing_key.as_str())
            .collect();
        assert_eq!(keys, ["orders", "orders.delay", "orders.failed"]);
        for binding in &plan.bindings {
            assert_eq!(binding.source, "commerce");
        }
    }

    #[test]
    fn the_dead_letter_cycle_routes_through_the_shared_exchange() {
        let preset = DelayedRetryPreset::new("commerce", QueueDeclare::durable("orders"));
        let plan = preset.plan();

        // Main queue dead-letters to the failed key, delay queue back to the
        // main key; the failed queue is a terminus.
        assert_eq!(
            dead_letter_args(&plan.queues[0]),
            (Some("commerce".into()), Some("orders.failed".into()))
        );
        assert_eq!(
            dead_letter_args(&plan.queues[1]),
            (Some("commerce".into()), Some("orders".into()))
        );
        assert_eq!(dead_letter_args(&plan.queues[2]), (None, None));
    }

    #[test]
    fn caller_supplied_dead_letter_arguments_are_preserved() {
        let mut preset = DelayedRetryPreset::new(
            "commerce",
            QueueDeclare::durable("orders").with_dead_letter_exchange("graveyard"),
        );
        preset.routing_key = Some("orders.v2".into());
        let plan = preset.plan();

        assert_eq!(
            dead_letter_args(&plan.queues[0]),
            (Some("graveyard".into()), Some("orders.v2.failed".into()))
        );
        let keys: Vec<_> = plan
            .bindings
            .iter()
            .map(|b| b.routing_key.as_str())
            .collect();
        assert_eq!(keys, ["orders.v2", "orders.v2.delay", "orders.v2.failed"]);
    }
}
