use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

use voyage_core::{
    AuditEntry, AvailabilityKey, AvailabilityRecord, Cart, CartStatus, CoreError, CoreResult,
    IdempotencyRecord, MetricsSample, Order, StockMetrics, StockStore, StoreTx,
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Availability(AvailabilityKey),
    Cart(Uuid),
    Order(Uuid),
}

impl std::fmt::Display for RowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowKey::Availability(key) => write!(f, "availability {}", key),
            RowKey::Cart(id) => write!(f, "cart {}", id),
            RowKey::Order(id) => write!(f, "order {}", id),
        }
    }
}

#[derive(Default)]
struct Tables {
    availability: BTreeMap<AvailabilityKey, AvailabilityRecord>,
    carts: HashMap<Uuid, Cart>,
    orders: HashMap<Uuid, Order>,
    idempotency: HashMap<String, IdempotencyRecord>,
    audit: Vec<AuditEntry>,
    metrics: BTreeMap<(AvailabilityKey, NaiveDate), StockMetrics>,
}

impl Tables {
    fn key_taken(&self, key: &str) -> bool {
        self.orders.values().any(|o| o.idempotency_key == key)
    }

    fn apply_metrics(&mut self, sample: &MetricsSample) {
        self.metrics
            .entry((sample.key, sample.date))
            .or_insert_with(|| StockMetrics::new(sample.key, sample.date))
            .apply(sample);
    }
}

struct Shared {
    tables: Mutex<Tables>,
    row_locks: Mutex<HashMap<RowKey, Arc<RowLock<()>>>>,
    lock_timeout: Duration,
}

impl Shared {
    fn tables(&self) -> CoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| CoreError::Storage("memory store poisoned".to_string()))
    }

    fn row_lock(&self, row: RowKey) -> CoreResult<Arc<RowLock<()>>> {
        let mut locks = self
            .row_locks
            .lock()
            .map_err(|_| CoreError::Storage("lock table poisoned".to_string()))?;
        Ok(locks.entry(row).or_default().clone())
    }

    /// Forgets locks nobody holds or waits on. Waiters keep a clone of the
    /// `Arc`, so a count of one means only the map refers to it.
    fn prune_row_locks<I>(&self, rows: I)
    where
        I: IntoIterator<Item = RowKey>,
    {
        let Ok(mut locks) = self.row_locks.lock() else {
            return;
        };
        for row in rows {
            if locks.get(&row).is_some_and(|lock| Arc::strong_count(lock) == 1) {
                locks.remove(&row);
            }
        }
    }
}

/// In-process engine with row locks held for the life of a transaction and
/// writes staged until commit.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                row_locks: Mutex::new(HashMap::new()),
                lock_timeout,
            }),
        }
    }

    /// Publishes an availability row, replacing any previous version.
    pub fn insert_availability(&self, record: AvailabilityRecord) -> CoreResult<()> {
        self.shared.tables()?.availability.insert(record.key(), record);
        Ok(())
    }

    /// Stores a cart as-is, timestamps included.
    pub fn insert_cart(&self, cart: Cart) -> CoreResult<()> {
        self.shared.tables()?.carts.insert(cart.id, cart);
        Ok(())
    }

    pub fn insert_idempotency_record(&self, record: IdempotencyRecord) -> CoreResult<()> {
        self.shared.tables()?.idempotency.insert(record.key.clone(), record);
        Ok(())
    }

    pub fn availability(&self, key: AvailabilityKey) -> CoreResult<Option<AvailabilityRecord>> {
        Ok(self.shared.tables()?.availability.get(&key).cloned())
    }

    pub fn audit_entries(&self) -> CoreResult<Vec<AuditEntry>> {
        Ok(self.shared.tables()?.audit.clone())
    }

    pub fn orders(&self) -> CoreResult<Vec<Order>> {
        Ok(self.shared.tables()?.orders.values().cloned().collect())
    }

    pub fn idempotency_records(&self) -> CoreResult<Vec<IdempotencyRecord>> {
        Ok(self.shared.tables()?.idempotency.values().cloned().collect())
    }
}

#[async_trait]
impl StockStore for MemoryStore {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx::new(self.shared.clone())))
    }

    async fn find_availability(
        &self,
        key: AvailabilityKey,
    ) -> CoreResult<Option<AvailabilityRecord>> {
        self.availability(key)
    }

    async fn find_cart(&self, cart_id: Uuid) -> CoreResult<Option<Cart>> {
        Ok(self.shared.tables()?.carts.get(&cart_id).cloned())
    }

    async fn find_order(&self, order_id: Uuid) -> CoreResult<Option<Order>> {
        Ok(self.shared.tables()?.orders.get(&order_id).cloned())
    }

    async fn append_audit(&self, entry: AuditEntry) -> CoreResult<()> {
        self.shared.tables()?.audit.push(entry);
        Ok(())
    }

    async fn list_audit(&self, key: AvailabilityKey) -> CoreResult<Vec<AuditEntry>> {
        Ok(self
            .shared
            .tables()?
            .audit
            .iter()
            .filter(|entry| entry.key == key)
            .cloned()
            .collect())
    }

    async fn record_metrics(&self, sample: MetricsSample) -> CoreResult<()> {
        self.shared.tables()?.apply_metrics(&sample);
        Ok(())
    }

    async fn find_metrics(
        &self,
        key: AvailabilityKey,
        date: NaiveDate,
    ) -> CoreResult<Option<StockMetrics>> {
        Ok(self.shared.tables()?.metrics.get(&(key, date)).cloned())
    }

    async fn stale_carts(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Uuid>> {
        Ok(self
            .shared
            .tables()?
            .carts
            .values()
            .filter(|cart| cart.status == CartStatus::Open && cart.updated_at < cutoff)
            .map(|cart| cart.id)
            .collect())
    }

    async fn find_idempotency_record(
        &self,
        user_id: i64,
        key: &str,
    ) -> CoreResult<Option<IdempotencyRecord>> {
        Ok(self
            .shared
            .tables()?
            .idempotency
            .get(key)
            .filter(|record| record.user_id == user_id)
            .cloned())
    }

    async fn count_idempotency_records_before(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let tables = self.shared.tables()?;
        Ok(tables.idempotency.values().filter(|r| r.created_at < cutoff).count() as u64)
    }

    async fn delete_idempotency_records_before(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let mut tables = self.shared.tables()?;
        let before = tables.idempotency.len();
        tables.idempotency.retain(|_, record| record.created_at >= cutoff);
        Ok((before - tables.idempotency.len()) as u64)
    }
}

pub struct MemoryTx {
    shared: Arc<Shared>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    availability: BTreeMap<AvailabilityKey, AvailabilityRecord>,
    carts: HashMap<Uuid, Cart>,
    orders: HashMap<Uuid, Order>,
    new_order_keys: Vec<String>,
    idempotency: Vec<IdempotencyRecord>,
    audit: Vec<AuditEntry>,
    metrics: Vec<MetricsSample>,
}

impl MemoryTx {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            held: HashMap::new(),
            availability: BTreeMap::new(),
            carts: HashMap::new(),
            orders: HashMap::new(),
            new_order_keys: Vec::new(),
            idempotency: Vec::new(),
            audit: Vec::new(),
            metrics: Vec::new(),
        }
    }

    async fn acquire(&mut self, row: RowKey) -> CoreResult<()> {
        if self.held.contains_key(&row) {
            return Ok(());
        }
        let lock = self.shared.row_lock(row)?;
        let Ok(guard) = tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned()).await
        else {
            self.shared.prune_row_locks([row]);
            return Err(CoreError::LockTimeout(row.to_string()));
        };
        debug!(row = %row, "Row lock acquired");
        self.held.insert(row, guard);
        Ok(())
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn lock_availability(
        &mut self,
        key: AvailabilityKey,
    ) -> CoreResult<Option<AvailabilityRecord>> {
        self.acquire(RowKey::Availability(key)).await?;
        if let Some(staged) = self.availability.get(&key) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.shared.tables()?.availability.get(&key).cloned())
    }

    async fn update_availability(&mut self, record: &AvailabilityRecord) -> CoreResult<()> {
        self.availability.insert(record.key(), record.clone());
        Ok(())
    }

    async fn lock_cart(&mut self, cart_id: Uuid) -> CoreResult<Option<Cart>> {
        self.acquire(RowKey::Cart(cart_id)).await?;
        if let Some(staged) = self.carts.get(&cart_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.shared.tables()?.carts.get(&cart_id).cloned())
    }

    async fn save_cart(&mut self, cart: &Cart) -> CoreResult<()> {
        self.carts.insert(cart.id, cart.clone());
        Ok(())
    }

    async fn lock_order(&mut self, order_id: Uuid) -> CoreResult<Option<Order>> {
        self.acquire(RowKey::Order(order_id)).await?;
        if let Some(staged) = self.orders.get(&order_id) {
            return Ok(Some(staged.clone()));
        }
        Ok(self.shared.tables()?.orders.get(&order_id).cloned())
    }

    async fn insert_order(&mut self, order: &Order) -> CoreResult<()> {
        let key = &order.idempotency_key;
        if self.new_order_keys.contains(key) || self.shared.tables()?.key_taken(key) {
            return Err(CoreError::DuplicateIdempotencyKey(key.clone()));
        }
        self.new_order_keys.push(key.clone());
        self.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn update_order(&mut self, order: &Order) -> CoreResult<()> {
        self.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order_by_idempotency_key(&mut self, key: &str) -> CoreResult<Option<Order>> {
        if let Some(staged) = self.orders.values().find(|o| o.idempotency_key == key) {
            return Ok(Some(staged.clone()));
        }
        Ok(self
            .shared
            .tables()?
            .orders
            .values()
            .find(|o| o.idempotency_key == key)
            .cloned())
    }

    async fn insert_idempotency_record(&mut self, record: &IdempotencyRecord) -> CoreResult<()> {
        self.idempotency.push(record.clone());
        Ok(())
    }

    async fn append_audit(&mut self, entry: AuditEntry) -> CoreResult<()> {
        self.audit.push(entry);
        Ok(())
    }

    async fn record_metrics(&mut self, sample: MetricsSample) -> CoreResult<()> {
        self.metrics.push(sample);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> CoreResult<()> {
        let shared = self.shared.clone();
        let mut tables = shared.tables()?;

        // another transaction may have committed the same key since insert_order
        if let Some(key) = self.new_order_keys.iter().find(|k| tables.key_taken(k)) {
            return Err(CoreError::DuplicateIdempotencyKey(key.clone()));
        }

        tables.availability.append(&mut self.availability);
        tables.carts.extend(self.carts.drain());
        tables.orders.extend(self.orders.drain());
        for record in self.idempotency.drain(..) {
            tables.idempotency.insert(record.key.clone(), record);
        }
        tables.audit.append(&mut self.audit);
        for sample in self.metrics.drain(..) {
            tables.apply_metrics(&sample);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> CoreResult<()> {
        debug!(rows = self.held.len(), "Transaction rolled back");
        Ok(())
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        let rows: Vec<RowKey> = self.held.keys().copied().collect();
        self.held.clear();
        self.shared.prune_row_locks(rows);
    }
}
