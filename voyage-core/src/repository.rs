use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::audit::AuditEntry;
use crate::availability::AvailabilityRecord;
use crate::cart::Cart;
use crate::metrics::{MetricsSample, StockMetrics};
use crate::order::{IdempotencyRecord, Order};
use crate::product::AvailabilityKey;
use crate::CoreResult;

/// Persistence for the ledger, carts and orders.
///
/// Mutations happen inside a [`StoreTx`]. Rows locked through a transaction
/// stay locked until it commits or is dropped; waiting on a held lock is
/// bounded and surfaces as `CoreError::LockTimeout`.
#[async_trait]
pub trait StockStore: Send + Sync {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>>;

    /// Unlocked read, for reporting and pre-flight checks.
    async fn find_availability(&self, key: AvailabilityKey)
        -> CoreResult<Option<AvailabilityRecord>>;

    async fn find_cart(&self, cart_id: Uuid) -> CoreResult<Option<Cart>>;

    async fn find_order(&self, order_id: Uuid) -> CoreResult<Option<Order>>;

    /// Writes an entry in its own unit of work, so it survives a rollback of
    /// the caller's transaction.
    async fn append_audit(&self, entry: AuditEntry) -> CoreResult<()>;

    async fn list_audit(&self, key: AvailabilityKey) -> CoreResult<Vec<AuditEntry>>;

    /// Folds a sample into the metrics outside any transaction, like
    /// [`append_audit`](StockStore::append_audit).
    async fn record_metrics(&self, sample: MetricsSample) -> CoreResult<()>;

    async fn find_metrics(
        &self,
        key: AvailabilityKey,
        date: NaiveDate,
    ) -> CoreResult<Option<StockMetrics>>;

    /// OPEN carts last touched before `cutoff`.
    async fn stale_carts(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Uuid>>;

    async fn find_idempotency_record(
        &self,
        user_id: i64,
        key: &str,
    ) -> CoreResult<Option<IdempotencyRecord>>;

    async fn count_idempotency_records_before(&self, cutoff: DateTime<Utc>) -> CoreResult<u64>;

    async fn delete_idempotency_records_before(&self, cutoff: DateTime<Utc>) -> CoreResult<u64>;
}

/// One atomic unit of work. Dropping without `commit` discards every write.
#[async_trait]
pub trait StoreTx: Send {
    /// Locks the row exclusively for the life of the transaction.
    async fn lock_availability(
        &mut self,
        key: AvailabilityKey,
    ) -> CoreResult<Option<AvailabilityRecord>>;

    async fn update_availability(&mut self, record: &AvailabilityRecord) -> CoreResult<()>;

    async fn lock_cart(&mut self, cart_id: Uuid) -> CoreResult<Option<Cart>>;

    /// Inserts or replaces the cart with all its lines.
    async fn save_cart(&mut self, cart: &Cart) -> CoreResult<()>;

    async fn lock_order(&mut self, order_id: Uuid) -> CoreResult<Option<Order>>;

    /// Fails with `DuplicateIdempotencyKey` when the key is taken.
    async fn insert_order(&mut self, order: &Order) -> CoreResult<()>;

    async fn update_order(&mut self, order: &Order) -> CoreResult<()>;

    async fn find_order_by_idempotency_key(&mut self, key: &str) -> CoreResult<Option<Order>>;

    async fn insert_idempotency_record(&mut self, record: &IdempotencyRecord) -> CoreResult<()>;

    async fn append_audit(&mut self, entry: AuditEntry) -> CoreResult<()>;

    /// Upserts the day's metrics row for the sample's key.
    async fn record_metrics(&mut self, sample: MetricsSample) -> CoreResult<()>;

    async fn commit(self: Box<Self>) -> CoreResult<()>;

    async fn rollback(self: Box<Self>) -> CoreResult<()>;
}
