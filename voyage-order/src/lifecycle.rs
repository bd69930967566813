use chrono::Utc;
use serde::{Deserialize, Serialize};

use voyage_core::{AvailabilityKey, CoreError, CoreResult, Order, OrderEventKind, OrderState};

/// Caller intent against an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OrderAction {
    Pay { method: String },
    Complete,
    Cancel,
    /// `None` refunds the full total.
    Refund { amount_cents: Option<i64> },
}

impl OrderAction {
    pub fn name(&self) -> &'static str {
        match self {
            OrderAction::Pay { .. } => "pay",
            OrderAction::Complete => "complete",
            OrderAction::Cancel => "cancel",
            OrderAction::Refund { .. } => "refund",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderEffect {
    ReleaseStock { key: AvailabilityKey, quantity: i32 },
    Notify { event: OrderEventKind, subject: String, body: String },
}

/// Outcome of a valid transition. Effects run in order, stock first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: OrderState,
    pub to: OrderState,
    pub effects: Vec<OrderEffect>,
}

impl Transition {
    pub fn releases_stock(&self) -> bool {
        self.effects
            .iter()
            .any(|e| matches!(e, OrderEffect::ReleaseStock { .. }))
    }
}

/// The transition table. `None` means the pair is not allowed.
pub fn target_state(state: OrderState, action: &OrderAction) -> Option<OrderState> {
    use OrderState::*;

    match (state, action) {
        (Pending, OrderAction::Pay { .. }) => Some(Confirmed),
        (Confirmed, OrderAction::Complete) => Some(Completed),
        (Pending | Confirmed, OrderAction::Cancel) => Some(Cancelled),
        (Confirmed | Completed, OrderAction::Refund { .. }) => Some(Refunded),
        _ => None,
    }
}

/// Computes the next state and the effects of `action` without touching
/// anything. Stock is released only when crossing from a live state into a
/// terminal one, so a terminal order never releases twice.
pub fn transition(order: &Order, action: &OrderAction) -> CoreResult<Transition> {
    let from = order.state;
    let to = target_state(from, action).ok_or(CoreError::InvalidTransition {
        state: from,
        action: action.name(),
    })?;

    if let OrderAction::Refund { amount_cents: Some(amount) } = action {
        if *amount <= 0 || *amount > order.total_cents {
            return Err(CoreError::InvalidAmount(*amount));
        }
    }

    let mut effects = Vec::new();
    if !from.is_terminal() && to.is_terminal() {
        effects.extend(
            order
                .stock_holdings()?
                .into_iter()
                .map(|(key, quantity)| OrderEffect::ReleaseStock { key, quantity }),
        );
    }
    effects.push(notice(order, action));

    Ok(Transition { from, to, effects })
}

/// Writes the new state and the action's bookkeeping onto the order.
pub fn apply(order: &mut Order, action: &OrderAction, to: OrderState) {
    match action {
        OrderAction::Pay { method } => order.payment_method = Some(method.clone()),
        OrderAction::Refund { amount_cents } => {
            order.refunded_cents = Some(amount_cents.unwrap_or(order.total_cents));
        }
        OrderAction::Complete | OrderAction::Cancel => {}
    }
    order.state = to;
    order.updated_at = Utc::now();
}

fn money(cents: i64, currency: &str) -> String {
    format!("{}.{:02} {}", cents / 100, (cents % 100).abs(), currency)
}

fn notice(order: &Order, action: &OrderAction) -> OrderEffect {
    let (event, subject, body) = match action {
        OrderAction::Pay { method } => (
            OrderEventKind::BookingConfirmed,
            "Booking confirmed".to_string(),
            format!(
                "Payment of {} by {} received for order {}.",
                money(order.total_cents, &order.currency),
                method,
                order.id
            ),
        ),
        OrderAction::Complete => (
            OrderEventKind::TripCompleted,
            "Trip completed".to_string(),
            format!("Order {} is complete. Thanks for travelling with us.", order.id),
        ),
        OrderAction::Cancel => (
            OrderEventKind::BookingCancelled,
            "Booking cancelled".to_string(),
            format!("Order {} has been cancelled.", order.id),
        ),
        OrderAction::Refund { amount_cents } => (
            OrderEventKind::RefundIssued,
            "Refund issued".to_string(),
            format!(
                "A refund of {} was issued for order {}.",
                money(amount_cents.unwrap_or(order.total_cents), &order.currency),
                order.id
            ),
        ),
    };
    OrderEffect::Notify { event, subject, body }
}

/// Notification for a freshly created order.
pub fn pending_notice(order: &Order) -> OrderEffect {
    OrderEffect::Notify {
        event: OrderEventKind::BookingPending,
        subject: "Booking received".to_string(),
        body: format!(
            "Order {} for {} is awaiting payment.",
            order.id,
            money(order.total_cents, &order.currency)
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voyage_core::{Cart, NewCartLine, ProductKind, ProductRef};

    fn order_in(state: OrderState) -> Order {
        let mut cart = Cart::new(1, "USD");
        for (kind, id, qty) in [
            (ProductKind::Activity, 4, 2),
            (ProductKind::Package, 1, 1),
            (ProductKind::Flight, 2, 3),
        ] {
            cart.add_line(NewCartLine {
                product: ProductRef::new(kind, id),
                package_id: None,
                availability_id: id,
                quantity: qty,
                unit_price_cents: 1000,
                currency: "USD".to_string(),
                config: Default::default(),
            })
            .unwrap();
        }
        let mut order = Order::from_cart(&cart, "key").unwrap();
        order.state = state;
        order
    }

    fn actions() -> Vec<OrderAction> {
        vec![
            OrderAction::Pay { method: "card".to_string() },
            OrderAction::Complete,
            OrderAction::Cancel,
            OrderAction::Refund { amount_cents: None },
        ]
    }

    #[test]
    fn test_transition_table_is_total() {
        use OrderState::*;
        let allowed = [
            (Pending, "pay", Confirmed),
            (Confirmed, "complete", Completed),
            (Pending, "cancel", Cancelled),
            (Confirmed, "cancel", Cancelled),
            (Confirmed, "refund", Refunded),
            (Completed, "refund", Refunded),
        ];

        for state in OrderState::ALL {
            for action in actions() {
                let expected = allowed
                    .iter()
                    .find(|(s, a, _)| *s == state && *a == action.name())
                    .map(|(_, _, to)| *to);
                let result = transition(&order_in(state), &action);

                match expected {
                    Some(to) => assert_eq!(result.unwrap().to, to),
                    None => assert!(
                        matches!(result, Err(CoreError::InvalidTransition { state: s, .. }) if s == state),
                        "{} should reject {}",
                        state,
                        action.name()
                    ),
                }
            }
        }
    }

    #[test]
    fn test_release_only_when_entering_terminal_state() {
        let cancel = transition(&order_in(OrderState::Confirmed), &OrderAction::Cancel).unwrap();
        let releases: Vec<_> = cancel
            .effects
            .iter()
            .filter_map(|e| match e {
                OrderEffect::ReleaseStock { key, quantity } => Some((key.kind, *quantity)),
                _ => None,
            })
            .collect();
        assert_eq!(releases, vec![(ProductKind::Activity, 2), (ProductKind::Flight, 3)]);

        let refund = transition(
            &order_in(OrderState::Completed),
            &OrderAction::Refund { amount_cents: Some(500) },
        )
        .unwrap();
        assert!(refund.releases_stock());

        let pay = transition(
            &order_in(OrderState::Pending),
            &OrderAction::Pay { method: "card".to_string() },
        )
        .unwrap();
        assert!(!pay.releases_stock());
        assert!(matches!(
            pay.effects.last(),
            Some(OrderEffect::Notify { event: OrderEventKind::BookingConfirmed, .. })
        ));
    }

    #[test]
    fn test_refund_amount_bounds() {
        let order = order_in(OrderState::Confirmed);
        let total = order.total_cents;

        for bad in [0, -1, total + 1] {
            assert!(matches!(
                transition(&order, &OrderAction::Refund { amount_cents: Some(bad) }),
                Err(CoreError::InvalidAmount(a)) if a == bad
            ));
        }
        assert!(transition(&order, &OrderAction::Refund { amount_cents: Some(total) }).is_ok());
    }

    #[test]
    fn test_apply_records_payment_and_refund() {
        let mut order = order_in(OrderState::Pending);
        apply(&mut order, &OrderAction::Pay { method: "paypal".to_string() }, OrderState::Confirmed);
        assert_eq!(order.payment_method.as_deref(), Some("paypal"));

        apply(&mut order, &OrderAction::Refund { amount_cents: None }, OrderState::Refunded);
        assert_eq!(order.refunded_cents, Some(order.total_cents));
        assert_eq!(order.state, OrderState::Refunded);
    }
}
