pub mod product;
pub mod availability;
pub mod cart;
pub mod order;
pub mod audit;
pub mod metrics;
pub mod repository;
pub mod notify;

pub use product::{AvailabilityKey, ProductKind, ProductRef};
pub use availability::{AvailabilityRecord, CapacityAccessor, FlightAvailability, RoomAvailability, SeatAvailability};
pub use cart::{Cart, CartLineItem, CartStatus, NewCartLine};
pub use order::{IdempotencyRecord, Order, OrderDetail, OrderState};
pub use audit::{AuditCause, AuditEntry, AuditOperation, AuditOutcome};
pub use metrics::{utilization, MetricsEvent, MetricsSample, StockLevels, StockMetrics};
pub use repository::{StockStore, StoreTx};
pub use notify::{LogNotifier, Notifier, NotifyError, OrderEventKind};

use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Quantity must be greater than zero, got {0}")]
    InvalidQuantity(i32),

    #[error("Availability not found: {0}")]
    ProductNotFound(AvailabilityKey),

    #[error("Insufficient stock for {key}: requested {requested}, available {available}")]
    InsufficientStock {
        key: AvailabilityKey,
        requested: i32,
        available: i32,
    },

    #[error("Timed out waiting for row lock on {0}")]
    LockTimeout(String),

    #[error("Unknown product type: {0}")]
    UnknownProductType(String),

    #[error("Cart {0} not found")]
    CartNotFound(Uuid),

    #[error("Cart line {line_id} not found in cart {cart_id}")]
    CartLineNotFound { cart_id: Uuid, line_id: Uuid },

    #[error("Cart {cart_id} is {status}, expected OPEN")]
    InvalidCartState { cart_id: Uuid, status: CartStatus },

    #[error("Cart {0} has no items")]
    EmptyCart(Uuid),

    #[error("Currency mismatch: cart uses {expected}, item uses {found}")]
    CurrencyMismatch { expected: String, found: String },

    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Cannot {action} an order in state {state}")]
    InvalidTransition {
        state: OrderState,
        action: &'static str,
    },

    /// Rendered exactly like the not-found error of the same entity.
    #[error("{entity} {id} not found")]
    NotAuthorized { entity: &'static str, id: Uuid },

    #[error("Idempotency key already used: {0}")]
    DuplicateIdempotencyKey(String),

    #[error("Idempotency key is required")]
    MissingIdempotencyKey,

    /// Refund outside `(0, total]`, or a line price whose totals overflow.
    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Storage failure: {0}")]
    Storage(String),
}

impl CoreError {
    /// Caller may retry: the row could not even be checked.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::LockTimeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CoreError::ProductNotFound(_)
                | CoreError::CartNotFound(_)
                | CoreError::CartLineNotFound { .. }
                | CoreError::OrderNotFound(_)
                | CoreError::NotAuthorized { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_authorized_reads_as_not_found() {
        let id = Uuid::new_v4();
        let hidden = CoreError::NotAuthorized { entity: "Order", id };
        let missing = CoreError::OrderNotFound(id);

        assert_eq!(hidden.to_string(), missing.to_string());
        assert!(hidden.is_not_found());
        assert!(!hidden.is_retryable());
    }

    #[test]
    fn test_only_lock_timeout_is_retryable() {
        let key = AvailabilityKey::new(ProductKind::Activity, 7);
        assert!(CoreError::LockTimeout(key.to_string()).is_retryable());
        assert!(!CoreError::InsufficientStock { key, requested: 2, available: 1 }.is_retryable());
    }
}
