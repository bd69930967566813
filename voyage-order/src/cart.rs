use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use voyage_core::{
    AuditCause, Cart, CartStatus, CoreError, CoreResult, IdempotencyRecord, NewCartLine, Order,
    StockStore, StoreTx,
};
use voyage_inventory::Ledger;

/// Cart aggregate operations. Nothing here touches the ledger except
/// [`checkout`](CartService::checkout).
#[derive(Clone)]
pub struct CartService {
    store: Arc<dyn StockStore>,
    ledger: Ledger,
}

async fn lock_owned(tx: &mut dyn StoreTx, cart_id: Uuid, user_id: i64) -> CoreResult<Cart> {
    let cart = tx
        .lock_cart(cart_id)
        .await?
        .ok_or(CoreError::CartNotFound(cart_id))?;
    if cart.user_id != user_id {
        return Err(CoreError::NotAuthorized { entity: "Cart", id: cart_id });
    }
    Ok(cart)
}

impl CartService {
    pub fn new(store: Arc<dyn StockStore>, ledger: Ledger) -> Self {
        Self { store, ledger }
    }

    pub async fn open_cart(&self, user_id: i64, currency: &str) -> CoreResult<Cart> {
        let cart = Cart::new(user_id, currency);
        let mut tx = self.store.begin().await?;
        tx.save_cart(&cart).await?;
        tx.commit().await?;
        info!(cart_id = %cart.id, user_id, "Cart opened");
        Ok(cart)
    }

    pub async fn get_cart(&self, cart_id: Uuid, user_id: i64) -> CoreResult<Cart> {
        let cart = self
            .store
            .find_cart(cart_id)
            .await?
            .ok_or(CoreError::CartNotFound(cart_id))?;
        if cart.user_id != user_id {
            return Err(CoreError::NotAuthorized { entity: "Cart", id: cart_id });
        }
        Ok(cart)
    }

    /// Locks the cart, applies `mutate` and saves the result.
    async fn modify<F>(&self, cart_id: Uuid, user_id: i64, mutate: F) -> CoreResult<Cart>
    where
        F: FnOnce(&mut Cart) -> CoreResult<()> + Send,
    {
        let mut tx = self.store.begin().await?;
        let mut cart = lock_owned(tx.as_mut(), cart_id, user_id).await?;
        mutate(&mut cart)?;
        tx.save_cart(&cart).await?;
        tx.commit().await?;
        Ok(cart)
    }

    /// Adds a line or merges it into an existing line for the same
    /// availability. Stock is not reserved here.
    pub async fn add_item(&self, cart_id: Uuid, user_id: i64, line: NewCartLine) -> CoreResult<Cart> {
        let cart = self
            .modify(cart_id, user_id, |cart| cart.add_line(line).map(|_| ()))
            .await?;
        info!(cart_id = %cart_id, items = cart.item_count, total_cents = cart.total_cents, "Cart item added");
        Ok(cart)
    }

    pub async fn update_quantity(
        &self,
        cart_id: Uuid,
        user_id: i64,
        line_id: Uuid,
        quantity: i32,
    ) -> CoreResult<Cart> {
        self.modify(cart_id, user_id, |cart| cart.set_quantity(line_id, quantity))
            .await
    }

    pub async fn remove_item(&self, cart_id: Uuid, user_id: i64, line_id: Uuid) -> CoreResult<Cart> {
        self.modify(cart_id, user_id, |cart| cart.remove_line(line_id))
            .await
    }

    /// OPEN -> CANCELLED at the owner's request.
    pub async fn abandon(&self, cart_id: Uuid, user_id: i64) -> CoreResult<Cart> {
        let cart = self
            .modify(cart_id, user_id, |cart| {
                cart.ensure_open()?;
                cart.transition(CartStatus::Cancelled);
                Ok(())
            })
            .await?;
        info!(cart_id = %cart_id, "Cart abandoned");
        Ok(cart)
    }

    /// Converts the cart into an order built by `order_factory`, reserving
    /// stock for every ledger-backed line in one transaction.
    ///
    /// Rows are locked in canonical key order. Any failure rolls back every
    /// reservation made so far and surfaces unchanged.
    pub async fn checkout<F>(&self, cart_id: Uuid, user_id: i64, order_factory: F) -> CoreResult<Order>
    where
        F: FnOnce(&Cart) -> CoreResult<Order> + Send,
    {
        let mut tx = self.store.begin().await?;
        let mut cart = lock_owned(tx.as_mut(), cart_id, user_id).await?;

        // a retried request finds its key taken before it finds the cart ordered
        let order = order_factory(&cart)?;
        if order.idempotency_key.trim().is_empty() {
            return Err(CoreError::MissingIdempotencyKey);
        }
        if tx
            .find_order_by_idempotency_key(&order.idempotency_key)
            .await?
            .is_some()
        {
            warn!(cart_id = %cart_id, key = %order.idempotency_key, "Idempotency key replayed");
            return Err(CoreError::DuplicateIdempotencyKey(order.idempotency_key));
        }

        cart.ensure_open()?;
        if cart.items.is_empty() {
            return Err(CoreError::EmptyCart(cart_id));
        }

        let cause = AuditCause::Checkout(cart_id);
        for (key, quantity) in cart.stock_requirements()? {
            if let Err(e) = self.ledger.reserve_within(tx.as_mut(), key, quantity, cause).await {
                warn!(cart_id = %cart_id, key = %key, "Checkout aborted: {}", e);
                return Err(e);
            }
        }

        tx.insert_order(&order).await?;
        tx.insert_idempotency_record(&IdempotencyRecord {
            key: order.idempotency_key.clone(),
            user_id,
            order_id: order.id,
            created_at: order.created_at,
        })
        .await?;

        cart.transition(CartStatus::Ordered);
        tx.save_cart(&cart).await?;
        tx.commit().await?;

        info!(
            cart_id = %cart_id,
            order_id = %order.id,
            total_cents = order.total_cents,
            "Checkout completed"
        );
        Ok(order)
    }

    /// OPEN -> EXPIRED. Returns false when the cart was no longer open.
    pub async fn expire(&self, cart_id: Uuid) -> CoreResult<bool> {
        self.expire_idle_since(cart_id, None).await
    }

    async fn expire_idle_since(
        &self,
        cart_id: Uuid,
        cutoff: Option<DateTime<Utc>>,
    ) -> CoreResult<bool> {
        let mut tx = self.store.begin().await?;
        let mut cart = tx
            .lock_cart(cart_id)
            .await?
            .ok_or(CoreError::CartNotFound(cart_id))?;

        let touched_since = cutoff.is_some_and(|c| cart.updated_at >= c);
        if cart.status != CartStatus::Open || touched_since {
            return Ok(false);
        }

        cart.transition(CartStatus::Expired);
        tx.save_cart(&cart).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Expires OPEN carts idle for longer than `max_idle`. Failures on single
    /// carts are logged and skipped. Returns how many carts were (or, on a
    /// dry run, would be) expired.
    pub async fn expire_stale(&self, max_idle: Duration, dry_run: bool) -> CoreResult<usize> {
        let cutoff = Utc::now() - max_idle;
        let stale = self.store.stale_carts(cutoff).await?;

        if dry_run {
            info!(count = stale.len(), cutoff = %cutoff, "Dry run: carts that would expire");
            return Ok(stale.len());
        }

        let mut expired = 0;
        for cart_id in stale {
            match self.expire_idle_since(cart_id, Some(cutoff)).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => error!(cart_id = %cart_id, "Failed to expire cart: {}", e),
            }
        }

        info!(expired, cutoff = %cutoff, "Stale carts expired");
        Ok(expired)
    }
}
