use uuid::Uuid;

/// Published on the notification topic after an order changes state.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone, PartialEq)]
pub struct OrderNotification {
    pub order_id: Uuid,
    pub user_id: i64,
    pub event_type: String,
    pub subject: String,
    pub body: String,
    pub state: String,
    pub total_cents: i64,
    pub currency: String,
    pub timestamp: i64,
}
