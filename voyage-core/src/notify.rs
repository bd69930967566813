use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

use crate::order::Order;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderEventKind {
    BookingPending,
    BookingConfirmed,
    TripCompleted,
    BookingCancelled,
    RefundIssued,
}

impl OrderEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderEventKind::BookingPending => "BOOKING_PENDING",
            OrderEventKind::BookingConfirmed => "BOOKING_CONFIRMED",
            OrderEventKind::TripCompleted => "TRIP_COMPLETED",
            OrderEventKind::BookingCancelled => "BOOKING_CANCELLED",
            OrderEventKind::RefundIssued => "REFUND_ISSUED",
        }
    }
}

impl fmt::Display for OrderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    Delivery(String),
}

/// Outbound customer notification. Called only after the state change that
/// produced it has committed; failures never roll anything back.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        order: &Order,
        event: OrderEventKind,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError>;
}

/// Writes notifications to the tracing pipeline.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        order: &Order,
        event: OrderEventKind,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        info!(
            order_id = %order.id,
            user_id = order.user_id,
            event = %event,
            "{}: {}",
            subject,
            body
        );
        Ok(())
    }
}
