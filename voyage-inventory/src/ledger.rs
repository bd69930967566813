use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use voyage_core::{
    AuditCause, AuditEntry, AuditOperation, AvailabilityKey, CapacityAccessor, CoreError,
    CoreResult, ProductKind, StockLevels, StockStore, StoreTx,
};

use crate::audit::AuditTrail;

/// Result of one reserve or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockMovement {
    pub key: AvailabilityKey,
    pub requested: i32,
    pub applied: i32,
    pub remaining: i32,
    pub clamped: bool,
}

/// Consumes `quantity` units if they are available. On shortfall returns the
/// units that were available and leaves the counter untouched.
pub fn apply_reserve<C>(counter: &mut C, quantity: i32) -> Result<i32, i32>
where
    C: CapacityAccessor + ?Sized,
{
    let remaining = counter.remaining();
    if remaining < quantity {
        return Err(remaining);
    }
    counter.set_consumed(counter.consumed() + quantity);
    Ok(counter.remaining())
}

/// Returns up to `quantity` units, clamping consumption at zero.
/// Yields `(applied, remaining)`.
pub fn apply_release<C>(counter: &mut C, quantity: i32) -> (i32, i32)
where
    C: CapacityAccessor + ?Sized,
{
    let consumed = counter.consumed();
    let next = (consumed - quantity).max(0);
    counter.set_consumed(next);
    (consumed - next, counter.remaining())
}

/// Availability ledger. One generic reserve/release primitive over every
/// stocked product type, with row locking delegated to the store.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn StockStore>,
    audit: AuditTrail,
}

impl Ledger {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        let audit = AuditTrail::new(store.clone());
        Self { store, audit }
    }

    pub fn audit(&self) -> &AuditTrail {
        &self.audit
    }

    /// Reserves inside the caller's transaction. The row stays locked until
    /// that transaction ends.
    pub async fn reserve_within(
        &self,
        tx: &mut dyn StoreTx,
        key: AvailabilityKey,
        quantity: i32,
        cause: AuditCause,
    ) -> CoreResult<StockMovement> {
        match self.try_reserve(tx, key, quantity, cause).await {
            Ok(movement) => Ok(movement),
            Err(e) => {
                self.audit
                    .record_failure(AuditOperation::Reserve, key, quantity, &e, cause)
                    .await;
                Err(e)
            }
        }
    }

    pub async fn release_within(
        &self,
        tx: &mut dyn StoreTx,
        key: AvailabilityKey,
        quantity: i32,
        cause: AuditCause,
    ) -> CoreResult<StockMovement> {
        match self.try_release(tx, key, quantity, cause).await {
            Ok(movement) => Ok(movement),
            Err(e) => {
                self.audit
                    .record_failure(AuditOperation::Release, key, quantity, &e, cause)
                    .await;
                Err(e)
            }
        }
    }

    /// Reserves in a transaction of its own.
    pub async fn reserve(&self, key: AvailabilityKey, quantity: i32) -> CoreResult<StockMovement> {
        let mut tx = self.store.begin().await?;
        let movement = self
            .reserve_within(tx.as_mut(), key, quantity, AuditCause::Direct)
            .await?;
        tx.commit().await?;
        Ok(movement)
    }

    pub async fn release(&self, key: AvailabilityKey, quantity: i32) -> CoreResult<StockMovement> {
        let mut tx = self.store.begin().await?;
        let movement = self
            .release_within(tx.as_mut(), key, quantity, AuditCause::Direct)
            .await?;
        tx.commit().await?;
        Ok(movement)
    }

    pub fn adapter(&self, kind: ProductKind) -> CoreResult<LedgerAdapter<'_>> {
        if !kind.is_stocked() {
            return Err(CoreError::UnknownProductType(kind.to_string()));
        }
        Ok(LedgerAdapter { ledger: self, kind })
    }

    pub fn activities(&self) -> LedgerAdapter<'_> {
        LedgerAdapter { ledger: self, kind: ProductKind::Activity }
    }

    pub fn transportation(&self) -> LedgerAdapter<'_> {
        LedgerAdapter { ledger: self, kind: ProductKind::Transportation }
    }

    pub fn rooms(&self) -> LedgerAdapter<'_> {
        LedgerAdapter { ledger: self, kind: ProductKind::Room }
    }

    pub fn flights(&self) -> LedgerAdapter<'_> {
        LedgerAdapter { ledger: self, kind: ProductKind::Flight }
    }

    async fn try_reserve(
        &self,
        tx: &mut dyn StoreTx,
        key: AvailabilityKey,
        quantity: i32,
        cause: AuditCause,
    ) -> CoreResult<StockMovement> {
        if quantity <= 0 {
            warn!(key = %key, quantity, "Rejected reserve with invalid quantity");
            return Err(CoreError::InvalidQuantity(quantity));
        }
        if !key.kind.is_stocked() {
            return Err(CoreError::UnknownProductType(key.kind.to_string()));
        }

        // deactivated rows keep their counters but accept no new reservations
        let mut record = tx
            .lock_availability(key)
            .await?
            .filter(|record| record.is_active())
            .ok_or(CoreError::ProductNotFound(key))?;

        let remaining = apply_reserve(&mut record, quantity).map_err(|available| {
            warn!(key = %key, requested = quantity, available, "Insufficient stock");
            CoreError::InsufficientStock { key, requested: quantity, available }
        })?;

        tx.update_availability(&record).await?;
        self.audit
            .record(
                tx,
                AuditEntry::success(AuditOperation::Reserve, key, quantity, remaining, cause),
                StockLevels::of(&record),
            )
            .await?;

        info!(key = %key, quantity, remaining, cause = %cause, "Stock reserved");
        Ok(StockMovement {
            key,
            requested: quantity,
            applied: quantity,
            remaining,
            clamped: false,
        })
    }

    async fn try_release(
        &self,
        tx: &mut dyn StoreTx,
        key: AvailabilityKey,
        quantity: i32,
        cause: AuditCause,
    ) -> CoreResult<StockMovement> {
        if quantity <= 0 {
            warn!(key = %key, quantity, "Rejected release with invalid quantity");
            return Err(CoreError::InvalidQuantity(quantity));
        }
        if !key.kind.is_stocked() {
            return Err(CoreError::UnknownProductType(key.kind.to_string()));
        }

        let mut record = tx
            .lock_availability(key)
            .await?
            .ok_or(CoreError::ProductNotFound(key))?;

        let (applied, remaining) = apply_release(&mut record, quantity);
        tx.update_availability(&record).await?;

        let clamped = applied < quantity;
        let entry = if clamped {
            warn!(
                key = %key,
                requested = quantity,
                applied,
                cause = %cause,
                "Release exceeded reserved units, clamped at zero"
            );
            AuditEntry::clamped(key, quantity, applied, remaining, cause)
        } else {
            AuditEntry::success(AuditOperation::Release, key, quantity, remaining, cause)
        };
        self.audit.record(tx, entry, StockLevels::of(&record)).await?;

        info!(key = %key, quantity = applied, remaining, cause = %cause, "Stock released");
        Ok(StockMovement {
            key,
            requested: quantity,
            applied,
            remaining,
            clamped,
        })
    }
}

/// Per-product-type entry point onto the shared primitive.
pub struct LedgerAdapter<'a> {
    ledger: &'a Ledger,
    kind: ProductKind,
}

impl LedgerAdapter<'_> {
    pub fn kind(&self) -> ProductKind {
        self.kind
    }

    pub async fn reserve(&self, id: i64, quantity: i32) -> CoreResult<StockMovement> {
        self.ledger
            .reserve(AvailabilityKey::new(self.kind, id), quantity)
            .await
    }

    pub async fn release(&self, id: i64, quantity: i32) -> CoreResult<StockMovement> {
        self.ledger
            .release(AvailabilityKey::new(self.kind, id), quantity)
            .await
    }
}
