use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::cart::Cart;
use crate::product::{group_by_availability, AvailabilityKey, ProductRef};
use crate::{CoreError, CoreResult};

/// Order status in the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Refunded,
}

impl OrderState {
    pub const ALL: [OrderState; 5] = [
        OrderState::Pending,
        OrderState::Confirmed,
        OrderState::Completed,
        OrderState::Cancelled,
        OrderState::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderState::Pending => "PENDING",
            OrderState::Confirmed => "CONFIRMED",
            OrderState::Completed => "COMPLETED",
            OrderState::Cancelled => "CANCELLED",
            OrderState::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// Terminal states hand their stock back to the ledger.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Cancelled | OrderState::Refunded)
    }
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A financial record line; never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetail {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product: ProductRef,
    pub package_id: Option<i64>,
    pub availability_id: i64,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub created_at: DateTime<Utc>,
}

impl OrderDetail {
    pub fn availability_key(&self) -> Option<AvailabilityKey> {
        self.product
            .kind
            .is_stocked()
            .then(|| AvailabilityKey::new(self.product.kind, self.availability_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: i64,
    pub cart_id: Option<Uuid>,
    pub state: OrderState,
    pub total_cents: i64,
    pub currency: String,
    pub idempotency_key: String,
    pub payment_method: Option<String>,
    pub refunded_cents: Option<i64>,
    pub details: Vec<OrderDetail>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Snapshots the cart lines into a PENDING order. Unit prices are echoed
    /// from the cart; no discount rules are evaluated here.
    pub fn from_cart(cart: &Cart, idempotency_key: impl Into<String>) -> CoreResult<Self> {
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        let details: Vec<OrderDetail> = cart
            .items
            .iter()
            .map(|line| -> CoreResult<OrderDetail> {
                Ok(OrderDetail {
                    id: Uuid::new_v4(),
                    order_id,
                    product: line.product,
                    package_id: line.package_id,
                    availability_id: line.availability_id,
                    quantity: line.quantity,
                    unit_price_cents: line.unit_price_cents,
                    subtotal_cents: line.line_total_cents()?,
                    discount_cents: 0,
                    created_at: now,
                })
            })
            .collect::<CoreResult<_>>()?;

        let total_cents = details.iter().try_fold(0i64, |total, d| {
            total
                .checked_add(d.subtotal_cents - d.discount_cents)
                .ok_or(CoreError::InvalidAmount(d.subtotal_cents))
        })?;

        Ok(Self {
            id: order_id,
            user_id: cart.user_id,
            cart_id: Some(cart.id),
            state: OrderState::Pending,
            total_cents,
            currency: cart.currency.clone(),
            idempotency_key: idempotency_key.into(),
            payment_method: None,
            refunded_cents: None,
            details,
            created_at: now,
            updated_at: now,
        })
    }

    /// Units held by this order, one entry per availability row.
    pub fn stock_holdings(&self) -> CoreResult<BTreeMap<AvailabilityKey, i32>> {
        group_by_availability(
            self.details
                .iter()
                .filter_map(|d| d.availability_key().map(|key| (key, d.quantity))),
        )
    }
}

/// Replay handle for a retried create-order request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub user_id: i64,
    pub order_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::NewCartLine;
    use crate::product::ProductKind;

    #[test]
    fn test_from_cart_copies_lines() {
        let mut cart = Cart::new(42, "USD");
        for (kind, id, qty) in [(ProductKind::Room, 3, 2), (ProductKind::Package, 9, 1)] {
            cart.add_line(NewCartLine {
                product: ProductRef::new(kind, id * 10),
                package_id: (kind == ProductKind::Package).then_some(id),
                availability_id: id,
                quantity: qty,
                unit_price_cents: 12500,
                currency: "USD".to_string(),
                config: serde_json::Value::Null,
            })
            .unwrap();
        }

        let order = Order::from_cart(&cart, "key-1").unwrap();

        assert_eq!(order.state, OrderState::Pending);
        assert_eq!(order.user_id, 42);
        assert_eq!(order.total_cents, cart.total_cents);
        assert_eq!(order.details.len(), 2);
        assert!(order.details.iter().all(|d| d.order_id == order.id));
        assert_eq!(order.stock_holdings().unwrap().len(), 1);
    }

    #[test]
    fn test_state_round_trip_and_terminality() {
        for state in OrderState::ALL {
            assert_eq!(OrderState::parse(state.as_str()), Some(state));
        }
        assert!(OrderState::Refunded.is_terminal());
        assert!(!OrderState::Completed.is_terminal());
    }
}
