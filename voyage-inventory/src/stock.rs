use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use voyage_core::{
    utilization, AvailabilityKey, AvailabilityRecord, CapacityAccessor, CoreError, CoreResult,
    ProductKind, StockMetrics, StockStore,
};

use crate::ledger::Ledger;

/// Read-only sufficiency check for one availability row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockCheck {
    pub key: AvailabilityKey,
    pub requested: i32,
    pub sufficient: bool,
    pub available: i32,
    pub total: i32,
    pub reserved: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockSummary {
    pub key: AvailabilityKey,
    pub total: i32,
    pub reserved: i32,
    pub available: i32,
    pub utilization: f64,
    pub is_active: bool,
}

/// One entry of a pre-flight request. `product_type` is free text so that
/// unknown types can be reported instead of rejected up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReservation {
    pub product_type: String,
    pub id: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkError {
    pub index: usize,
    pub reservation: BulkReservation,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkValidation {
    pub valid: bool,
    pub errors: Vec<BulkError>,
    pub warnings: Vec<String>,
    pub reservations: Vec<StockCheck>,
}

/// Product-type-agnostic facade over the ledger.
#[derive(Clone)]
pub struct StockService {
    store: Arc<dyn StockStore>,
    ledger: Ledger,
}

impl StockService {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        let ledger = Ledger::new(store.clone());
        Self { store, ledger }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    async fn load(&self, kind: ProductKind, id: i64) -> CoreResult<AvailabilityRecord> {
        if !kind.is_stocked() {
            return Err(CoreError::UnknownProductType(kind.to_string()));
        }
        let key = AvailabilityKey::new(kind, id);
        self.store
            .find_availability(key)
            .await?
            .ok_or(CoreError::ProductNotFound(key))
    }

    /// Does not lock. The answer can be stale by the time the caller acts on it.
    pub async fn check_stock(&self, kind: ProductKind, id: i64, quantity: i32) -> CoreResult<StockCheck> {
        if quantity <= 0 {
            return Err(CoreError::InvalidQuantity(quantity));
        }
        let record = self.load(kind, id).await?;
        let key = record.key();
        if !record.is_active() {
            return Err(CoreError::ProductNotFound(key));
        }

        let available = record.remaining();
        debug!(key = %key, requested = quantity, available, "Stock checked");
        Ok(StockCheck {
            key,
            requested: quantity,
            sufficient: available >= quantity,
            available,
            total: record.total(),
            reserved: record.consumed(),
        })
    }

    /// Checks every entry on its own and collects the outcome. Never reserves
    /// and never fails as a whole.
    pub async fn validate_bulk(&self, reservations: &[BulkReservation]) -> BulkValidation {
        let mut result = BulkValidation {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            reservations: Vec::new(),
        };
        let mut requested_per_row: BTreeMap<AvailabilityKey, (i32, i32)> = BTreeMap::new();

        for (index, reservation) in reservations.iter().enumerate() {
            let outcome = match reservation.product_type.parse::<ProductKind>() {
                Ok(kind) => self.check_stock(kind, reservation.id, reservation.quantity).await,
                Err(e) => Err(e),
            };

            let error = match outcome {
                Ok(check) if check.sufficient => {
                    let row = requested_per_row.entry(check.key).or_insert((0, check.available));
                    row.0 += check.requested;
                    result.reservations.push(check);
                    continue;
                }
                Ok(check) => format!(
                    "Insufficient stock: available {}, requested {}",
                    check.available, check.requested
                ),
                Err(e) => e.to_string(),
            };

            result.valid = false;
            result.errors.push(BulkError {
                index,
                reservation: reservation.clone(),
                error,
            });
        }

        for (key, (requested, available)) in requested_per_row {
            if requested > available {
                result.warnings.push(format!(
                    "Entries for {} request {} units combined, only {} available",
                    key, requested, available
                ));
            }
        }

        result
    }

    pub async fn get_summary(&self, kind: ProductKind, id: i64) -> CoreResult<StockSummary> {
        let record = self.load(kind, id).await?;
        let (total, reserved) = (record.total(), record.consumed());
        Ok(StockSummary {
            key: record.key(),
            total,
            reserved,
            available: record.remaining(),
            utilization: utilization(reserved, total),
            is_active: record.is_active(),
        })
    }

    /// Same as [`get_summary`](Self::get_summary) for a caller-supplied type name.
    pub async fn get_summary_by_name(&self, product_type: &str, id: i64) -> CoreResult<StockSummary> {
        let kind = product_type.parse::<ProductKind>()?;
        self.get_summary(kind, id).await
    }

    /// Metrics for one row and day; today when `date` is `None`. A row with
    /// no movements that day yields `None`.
    pub async fn get_metrics(
        &self,
        kind: ProductKind,
        id: i64,
        date: Option<NaiveDate>,
    ) -> CoreResult<Option<StockMetrics>> {
        let key = AvailabilityKey::new(kind, id);
        let date = date.unwrap_or_else(|| Utc::now().date_naive());
        self.store.find_metrics(key, date).await
    }
}
