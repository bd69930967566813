use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use voyage_core::{CoreResult, StockStore};

use crate::cart::CartService;

/// Purges idempotency records older than `max_age`. Orders keep their keys,
/// so a purged key still cannot create a second order. Returns the number of
/// records removed, or that would be removed on a dry run.
pub async fn cleanup_idempotency(
    store: &dyn StockStore,
    max_age: Duration,
    dry_run: bool,
) -> CoreResult<u64> {
    let cutoff = Utc::now() - max_age;

    if dry_run {
        let count = store.count_idempotency_records_before(cutoff).await?;
        info!(count, cutoff = %cutoff, "Dry run: idempotency records that would be purged");
        return Ok(count);
    }

    let purged = store.delete_idempotency_records_before(cutoff).await?;
    info!(purged, cutoff = %cutoff, "Idempotency records purged");
    Ok(purged)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired_carts: usize,
    pub purged_idempotency_records: u64,
    pub dry_run: bool,
}

/// Scheduled housekeeping: cart expiry followed by idempotency cleanup.
#[derive(Clone)]
pub struct Maintenance {
    store: Arc<dyn StockStore>,
    carts: CartService,
    cart_retention: Duration,
    idempotency_retention: Duration,
}

impl Maintenance {
    pub fn new(
        store: Arc<dyn StockStore>,
        carts: CartService,
        cart_retention: Duration,
        idempotency_retention: Duration,
    ) -> Self {
        Self {
            store,
            carts,
            cart_retention,
            idempotency_retention,
        }
    }

    pub async fn run_once(&self, dry_run: bool) -> CoreResult<MaintenanceReport> {
        let expired_carts = self.carts.expire_stale(self.cart_retention, dry_run).await?;
        let purged_idempotency_records =
            cleanup_idempotency(self.store.as_ref(), self.idempotency_retention, dry_run).await?;

        Ok(MaintenanceReport {
            expired_carts,
            purged_idempotency_records,
            dry_run,
        })
    }
}
