use async_trait::async_trait;
use chrono::Utc;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{error, info};

use voyage_core::{Notifier, NotifyError, Order, OrderEventKind};
use voyage_shared::OrderNotification;

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!("Sent message to {}/{}: partition {} offset {}", topic, key, delivery.partition, delivery.offset);
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", topic, e);
                Err(e)
            }
        }
    }
}

/// Publishes order notifications as JSON, keyed by order id.
#[derive(Clone)]
pub struct KafkaNotifier {
    producer: EventProducer,
    topic: String,
}

impl KafkaNotifier {
    pub fn new(producer: EventProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

pub fn notification_for(
    order: &Order,
    event: OrderEventKind,
    subject: &str,
    body: &str,
) -> OrderNotification {
    OrderNotification {
        order_id: order.id,
        user_id: order.user_id,
        event_type: event.as_str().to_string(),
        subject: subject.to_string(),
        body: body.to_string(),
        state: order.state.as_str().to_string(),
        total_cents: order.total_cents,
        currency: order.currency.clone(),
        timestamp: Utc::now().timestamp(),
    }
}

#[async_trait]
impl Notifier for KafkaNotifier {
    async fn notify(
        &self,
        order: &Order,
        event: OrderEventKind,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(&notification_for(order, event, subject, body))
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        self.producer
            .publish(&self.topic, &order.id.to_string(), &payload)
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voyage_core::{Cart, OrderState};

    #[test]
    fn test_notification_carries_order_state() {
        let mut order = Order::from_cart(&Cart::new(9, "EUR"), "k-1").unwrap();
        order.state = OrderState::Refunded;

        let event = notification_for(&order, OrderEventKind::RefundIssued, "Refund", "Issued");

        assert_eq!(event.order_id, order.id);
        assert_eq!(event.event_type, "REFUND_ISSUED");
        assert_eq!(event.state, "REFUNDED");
        assert_eq!(event.currency, "EUR");
    }
}
