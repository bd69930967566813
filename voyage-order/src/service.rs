use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use voyage_core::{AuditCause, CoreError, CoreResult, Notifier, Order, StockStore};
use voyage_inventory::Ledger;

use crate::cart::CartService;
use crate::lifecycle::{self, pending_notice, OrderAction, OrderEffect};

/// Order lifecycle over the store, the ledger and the notification hook.
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn StockStore>,
    ledger: Ledger,
    carts: CartService,
    notifier: Arc<dyn Notifier>,
}

impl OrderService {
    pub fn new(store: Arc<dyn StockStore>, notifier: Arc<dyn Notifier>) -> Self {
        let ledger = Ledger::new(store.clone());
        let carts = CartService::new(store.clone(), ledger.clone());
        Self { store, ledger, carts, notifier }
    }

    pub fn carts(&self) -> &CartService {
        &self.carts
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Checks the cart out into a PENDING order. A key that was already used
    /// fails with `DuplicateIdempotencyKey` and reserves nothing.
    pub async fn create_order_from_cart(
        &self,
        cart_id: Uuid,
        user_id: i64,
        idempotency_key: &str,
    ) -> CoreResult<Order> {
        let order = self
            .carts
            .checkout(cart_id, user_id, |cart| Order::from_cart(cart, idempotency_key))
            .await?;

        self.deliver(&order, pending_notice(&order)).await;
        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid, user_id: i64) -> CoreResult<Order> {
        let order = self
            .store
            .find_order(order_id)
            .await?
            .ok_or(CoreError::OrderNotFound(order_id))?;
        if order.user_id != user_id {
            return Err(CoreError::NotAuthorized { entity: "Order", id: order_id });
        }
        Ok(order)
    }

    /// Looks up the order a previous request created with `key`, while its
    /// idempotency record is retained.
    pub async fn find_by_idempotency_key(&self, user_id: i64, key: &str) -> CoreResult<Option<Order>> {
        match self.store.find_idempotency_record(user_id, key).await? {
            Some(record) => self.store.find_order(record.order_id).await,
            None => Ok(None),
        }
    }

    pub async fn pay(&self, order_id: Uuid, user_id: i64, method: &str) -> CoreResult<Order> {
        self.act(order_id, user_id, OrderAction::Pay { method: method.to_string() })
            .await
    }

    pub async fn complete(&self, order_id: Uuid, user_id: i64) -> CoreResult<Order> {
        self.act(order_id, user_id, OrderAction::Complete).await
    }

    pub async fn cancel(&self, order_id: Uuid, user_id: i64) -> CoreResult<Order> {
        self.act(order_id, user_id, OrderAction::Cancel).await
    }

    /// `amount_cents` of `None` refunds the whole order.
    pub async fn refund(
        &self,
        order_id: Uuid,
        user_id: i64,
        amount_cents: Option<i64>,
    ) -> CoreResult<Order> {
        self.act(order_id, user_id, OrderAction::Refund { amount_cents })
            .await
    }

    async fn act(&self, order_id: Uuid, user_id: i64, action: OrderAction) -> CoreResult<Order> {
        let mut tx = self.store.begin().await?;
        let mut order = tx
            .lock_order(order_id)
            .await?
            .ok_or(CoreError::OrderNotFound(order_id))?;
        if order.user_id != user_id {
            return Err(CoreError::NotAuthorized { entity: "Order", id: order_id });
        }

        let step = lifecycle::transition(&order, &action).map_err(|e| {
            warn!(
                order_id = %order_id,
                state = %order.state,
                action = action.name(),
                "Transition rejected: {}",
                e
            );
            e
        })?;

        let cause = match &action {
            OrderAction::Refund { .. } => AuditCause::Refund(order_id),
            _ => AuditCause::Cancellation(order_id),
        };

        let mut notices = Vec::new();
        for effect in step.effects {
            match effect {
                OrderEffect::ReleaseStock { key, quantity } => {
                    self.ledger
                        .release_within(tx.as_mut(), key, quantity, cause)
                        .await?;
                }
                notice @ OrderEffect::Notify { .. } => notices.push(notice),
            }
        }

        lifecycle::apply(&mut order, &action, step.to);
        tx.update_order(&order).await?;
        tx.commit().await?;

        info!(order_id = %order_id, from = %step.from, to = %step.to, "Order transitioned");

        for notice in notices {
            self.deliver(&order, notice).await;
        }
        Ok(order)
    }

    /// Runs after commit. A delivery failure is logged and otherwise ignored.
    async fn deliver(&self, order: &Order, effect: OrderEffect) {
        let OrderEffect::Notify { event, subject, body } = effect else {
            return;
        };
        if let Err(e) = self.notifier.notify(order, event, &subject, &body).await {
            error!(order_id = %order.id, event = %event, "Notification failed: {}", e);
        }
    }
}
