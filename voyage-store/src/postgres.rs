use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

use voyage_core::{
    AuditCause, AuditEntry, AuditOperation, AuditOutcome, AvailabilityKey, AvailabilityRecord,
    Cart, CartLineItem, CartStatus, CoreError, CoreResult, FlightAvailability, IdempotencyRecord,
    MetricsEvent, MetricsSample, Order, OrderDetail, OrderState, ProductKind, ProductRef,
    RoomAvailability, SeatAvailability, StockMetrics, StockStore, StoreTx,
};

const LOCK_NOT_AVAILABLE: &str = "55P03";
const UNIQUE_VIOLATION: &str = "23505";

fn map_sqlx(err: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(LOCK_NOT_AVAILABLE) {
            return CoreError::LockTimeout(db.message().to_string());
        }
    }
    error!("Database error: {}", err);
    CoreError::Storage(err.to_string())
}

fn corrupt(what: &str, value: &str) -> CoreError {
    CoreError::Storage(format!("unrecognized {} '{}' in storage", what, value))
}

// Internal structs for type-safe querying
#[derive(sqlx::FromRow)]
struct SeatRow {
    id: i64,
    total_seats: i32,
    reserved_seats: i32,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct RoomRow {
    id: i64,
    check_in: NaiveDate,
    check_out: NaiveDate,
    max_quantity: i32,
    available_quantity: i32,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct FlightRow {
    id: i64,
    capacity: i32,
    available_seats: i32,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct CartRow {
    id: Uuid,
    user_id: i64,
    status: String,
    currency: String,
    total_cents: i64,
    item_count: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct CartItemRow {
    id: Uuid,
    cart_id: Uuid,
    product_type: String,
    metadata_id: i64,
    package_id: Option<i64>,
    availability_id: i64,
    quantity: i32,
    unit_price_cents: i64,
    currency: String,
    config: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: i64,
    cart_id: Option<Uuid>,
    state: String,
    total_cents: i64,
    currency: String,
    idempotency_key: String,
    payment_method: Option<String>,
    refunded_cents: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OrderDetailRow {
    id: Uuid,
    order_id: Uuid,
    product_type: String,
    metadata_id: i64,
    package_id: Option<i64>,
    availability_id: i64,
    quantity: i32,
    unit_price_cents: i64,
    subtotal_cents: i64,
    discount_cents: i64,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct IdempotencyRow {
    key: String,
    user_id: i64,
    order_id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    operation_id: Uuid,
    operation: String,
    product_type: String,
    availability_id: i64,
    requested: i32,
    applied: i32,
    remaining: Option<i32>,
    outcome: String,
    reason: Option<String>,
    cause: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct MetricsRow {
    product_type: String,
    availability_id: i64,
    date: NaiveDate,
    total_capacity: i32,
    current_reserved: i32,
    current_available: i32,
    utilization_rate: f64,
    total_reservations: i64,
    total_releases: i64,
    failed_operations: i64,
    updated_at: DateTime<Utc>,
}

impl MetricsRow {
    fn into_metrics(self) -> CoreResult<StockMetrics> {
        let kind = self.product_type.parse::<ProductKind>()?;
        Ok(StockMetrics {
            key: AvailabilityKey::new(kind, self.availability_id),
            date: self.date,
            total_capacity: self.total_capacity,
            current_reserved: self.current_reserved,
            current_available: self.current_available,
            utilization_rate: self.utilization_rate,
            total_reservations: self.total_reservations,
            total_releases: self.total_releases,
            failed_operations: self.failed_operations,
            updated_at: self.updated_at,
        })
    }
}

impl SeatRow {
    fn into_seat(self) -> SeatAvailability {
        SeatAvailability {
            id: self.id,
            total_seats: self.total_seats,
            reserved_seats: self.reserved_seats,
            is_active: self.is_active,
        }
    }
}

impl CartItemRow {
    fn into_item(self) -> CoreResult<CartLineItem> {
        let kind = self.product_type.parse::<ProductKind>()?;
        Ok(CartLineItem {
            id: self.id,
            cart_id: self.cart_id,
            product: ProductRef::new(kind, self.metadata_id),
            package_id: self.package_id,
            availability_id: self.availability_id,
            quantity: self.quantity,
            unit_price_cents: self.unit_price_cents,
            currency: self.currency,
            config: self.config,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl CartRow {
    fn into_cart(self, items: Vec<CartLineItem>) -> CoreResult<Cart> {
        let status = CartStatus::parse(&self.status)
            .ok_or_else(|| corrupt("cart status", &self.status))?;
        Ok(Cart {
            id: self.id,
            user_id: self.user_id,
            status,
            currency: self.currency,
            total_cents: self.total_cents,
            item_count: self.item_count,
            items,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl OrderDetailRow {
    fn into_detail(self) -> CoreResult<OrderDetail> {
        let kind = self.product_type.parse::<ProductKind>()?;
        Ok(OrderDetail {
            id: self.id,
            order_id: self.order_id,
            product: ProductRef::new(kind, self.metadata_id),
            package_id: self.package_id,
            availability_id: self.availability_id,
            quantity: self.quantity,
            unit_price_cents: self.unit_price_cents,
            subtotal_cents: self.subtotal_cents,
            discount_cents: self.discount_cents,
            created_at: self.created_at,
        })
    }
}

impl OrderRow {
    fn into_order(self, details: Vec<OrderDetail>) -> CoreResult<Order> {
        let state = OrderState::parse(&self.state)
            .ok_or_else(|| corrupt("order state", &self.state))?;
        Ok(Order {
            id: self.id,
            user_id: self.user_id,
            cart_id: self.cart_id,
            state,
            total_cents: self.total_cents,
            currency: self.currency,
            idempotency_key: self.idempotency_key,
            payment_method: self.payment_method,
            refunded_cents: self.refunded_cents,
            details,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl From<IdempotencyRow> for IdempotencyRecord {
    fn from(row: IdempotencyRow) -> Self {
        IdempotencyRecord {
            key: row.key,
            user_id: row.user_id,
            order_id: row.order_id,
            created_at: row.created_at,
        }
    }
}

impl AuditRow {
    fn into_entry(self) -> CoreResult<AuditEntry> {
        let kind = self.product_type.parse::<ProductKind>()?;
        Ok(AuditEntry {
            id: self.id,
            operation_id: self.operation_id,
            operation: AuditOperation::parse(&self.operation)
                .ok_or_else(|| corrupt("audit operation", &self.operation))?,
            key: AvailabilityKey::new(kind, self.availability_id),
            requested: self.requested,
            applied: self.applied,
            remaining: self.remaining,
            outcome: AuditOutcome::parse(&self.outcome)
                .ok_or_else(|| corrupt("audit outcome", &self.outcome))?,
            reason: self.reason,
            cause: AuditCause::parse(&self.cause).ok_or_else(|| corrupt("audit cause", &self.cause))?,
            created_at: self.created_at,
        })
    }
}

fn availability_table(kind: ProductKind) -> CoreResult<&'static str> {
    match kind {
        ProductKind::Activity => Ok("activity_availability"),
        ProductKind::Transportation => Ok("transportation_availability"),
        ProductKind::Room => Ok("room_availability"),
        ProductKind::Flight => Ok("flight_availability"),
        ProductKind::Package => Err(CoreError::UnknownProductType(kind.to_string())),
    }
}

async fn fetch_availability<'e, E>(
    executor: E,
    key: AvailabilityKey,
    for_update: bool,
) -> CoreResult<Option<AvailabilityRecord>>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let table = availability_table(key.kind)?;
    let lock = if for_update { " FOR UPDATE" } else { "" };

    let record = match key.kind {
        ProductKind::Activity | ProductKind::Transportation => {
            let sql = format!(
                "SELECT id, total_seats, reserved_seats, is_active FROM {} WHERE id = $1{}",
                table, lock
            );
            sqlx::query_as::<_, SeatRow>(&sql)
                .bind(key.id)
                .fetch_optional(executor)
                .await
                .map_err(map_sqlx)?
                .map(|row| {
                    if key.kind == ProductKind::Activity {
                        AvailabilityRecord::Activity(row.into_seat())
                    } else {
                        AvailabilityRecord::Transportation(row.into_seat())
                    }
                })
        }
        ProductKind::Room => {
            let sql = format!(
                "SELECT id, check_in, check_out, max_quantity, available_quantity, is_active FROM {} WHERE id = $1{}",
                table, lock
            );
            sqlx::query_as::<_, RoomRow>(&sql)
                .bind(key.id)
                .fetch_optional(executor)
                .await
                .map_err(map_sqlx)?
                .map(|row| {
                    AvailabilityRecord::Room(RoomAvailability {
                        id: row.id,
                        check_in: row.check_in,
                        check_out: row.check_out,
                        max_quantity: row.max_quantity,
                        available_quantity: row.available_quantity,
                        is_active: row.is_active,
                    })
                })
        }
        ProductKind::Flight => {
            let sql = format!(
                "SELECT id, capacity, available_seats, is_active FROM {} WHERE id = $1{}",
                table, lock
            );
            sqlx::query_as::<_, FlightRow>(&sql)
                .bind(key.id)
                .fetch_optional(executor)
                .await
                .map_err(map_sqlx)?
                .map(|row| {
                    AvailabilityRecord::Flight(FlightAvailability {
                        id: row.id,
                        capacity: row.capacity,
                        available_seats: row.available_seats,
                        is_active: row.is_active,
                    })
                })
        }
        ProductKind::Package => None,
    };

    Ok(record)
}

async fn insert_audit<'e, E>(executor: E, entry: &AuditEntry) -> CoreResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO stock_audit_log (id, operation_id, operation, product_type, availability_id, requested, applied, remaining, outcome, reason, cause, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
        "#,
    )
    .bind(entry.id)
    .bind(entry.operation_id)
    .bind(entry.operation.as_str())
    .bind(entry.key.kind.as_str())
    .bind(entry.key.id)
    .bind(entry.requested)
    .bind(entry.applied)
    .bind(entry.remaining)
    .bind(entry.outcome.as_str())
    .bind(entry.reason.as_deref())
    .bind(entry.cause.to_string())
    .bind(entry.created_at)
    .execute(executor)
    .await
    .map_err(map_sqlx)?;
    Ok(())
}

/// Counters add up on conflict; levels are overwritten only when the sample
/// carries them.
async fn upsert_metrics<'e, E>(executor: E, sample: &MetricsSample) -> CoreResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let mut seed = StockMetrics::new(sample.key, sample.date);
    seed.apply(sample);
    let levels = if sample.levels.is_some() {
        "total_capacity = EXCLUDED.total_capacity,
                current_reserved = EXCLUDED.current_reserved,
                current_available = EXCLUDED.current_available,
                utilization_rate = EXCLUDED.utilization_rate,"
    } else {
        ""
    };
    let sql = format!(
        r#"
        INSERT INTO stock_metrics (product_type, availability_id, date, total_capacity, current_reserved, current_available, utilization_rate, total_reservations, total_releases, failed_operations, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (product_type, availability_id, date) DO UPDATE SET
                {}
                total_reservations = stock_metrics.total_reservations + EXCLUDED.total_reservations,
                total_releases = stock_metrics.total_releases + EXCLUDED.total_releases,
                failed_operations = stock_metrics.failed_operations + EXCLUDED.failed_operations,
                updated_at = EXCLUDED.updated_at
        "#,
        levels
    );

    sqlx::query(&sql)
        .bind(sample.key.kind.as_str())
        .bind(sample.key.id)
        .bind(seed.date)
        .bind(seed.total_capacity)
        .bind(seed.current_reserved)
        .bind(seed.current_available)
        .bind(seed.utilization_rate)
        .bind(i64::from(sample.event == MetricsEvent::Reserved))
        .bind(i64::from(sample.event == MetricsEvent::Released))
        .bind(i64::from(sample.event == MetricsEvent::Failed))
        .bind(seed.updated_at)
        .execute(executor)
        .await
        .map_err(map_sqlx)?;
    Ok(())
}

/// PostgreSQL engine. Row locks are `SELECT ... FOR UPDATE`, bounded by a
/// per-transaction `lock_timeout`.
#[derive(Clone)]
pub struct PgStockStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStockStore {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    async fn load_cart_items(&self, cart_id: Uuid) -> CoreResult<Vec<CartLineItem>> {
        let rows: Vec<CartItemRow> = sqlx::query_as(CART_ITEMS_SQL)
            .bind(cart_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(CartItemRow::into_item).collect()
    }

    async fn load_order_details(&self, order_id: Uuid) -> CoreResult<Vec<OrderDetail>> {
        let rows: Vec<OrderDetailRow> = sqlx::query_as(ORDER_DETAILS_SQL)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.into_iter().map(OrderDetailRow::into_detail).collect()
    }
}

const CART_SQL: &str = "SELECT id, user_id, status, currency, total_cents, item_count, created_at, updated_at FROM carts WHERE id = $1";
const CART_ITEMS_SQL: &str = "SELECT id, cart_id, product_type, metadata_id, package_id, availability_id, quantity, unit_price_cents, currency, config, created_at, updated_at FROM cart_items WHERE cart_id = $1 ORDER BY created_at";
const ORDER_SQL: &str = "SELECT id, user_id, cart_id, state, total_cents, currency, idempotency_key, payment_method, refunded_cents, created_at, updated_at FROM orders";
const ORDER_DETAILS_SQL: &str = "SELECT id, order_id, product_type, metadata_id, package_id, availability_id, quantity, unit_price_cents, subtotal_cents, discount_cents, created_at FROM order_details WHERE order_id = $1 ORDER BY created_at";

#[async_trait]
impl StockStore for PgStockStore {
    async fn begin(&self) -> CoreResult<Box<dyn StoreTx>> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        // SET does not accept bind parameters
        let set_timeout = format!("SET LOCAL lock_timeout = '{}ms'", self.lock_timeout.as_millis());
        sqlx::query(&set_timeout)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        Ok(Box::new(PgTx { tx }))
    }

    async fn find_availability(
        &self,
        key: AvailabilityKey,
    ) -> CoreResult<Option<AvailabilityRecord>> {
        fetch_availability(&self.pool, key, false).await
    }

    async fn find_cart(&self, cart_id: Uuid) -> CoreResult<Option<Cart>> {
        let row: Option<CartRow> = sqlx::query_as(CART_SQL)
            .bind(cart_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let items = self.load_cart_items(cart_id).await?;
                Ok(Some(row.into_cart(items)?))
            }
            None => Ok(None),
        }
    }

    async fn find_order(&self, order_id: Uuid) -> CoreResult<Option<Order>> {
        let sql = format!("{} WHERE id = $1", ORDER_SQL);
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => {
                let details = self.load_order_details(order_id).await?;
                Ok(Some(row.into_order(details)?))
            }
            None => Ok(None),
        }
    }

    async fn append_audit(&self, entry: AuditEntry) -> CoreResult<()> {
        insert_audit(&self.pool, &entry).await
    }

    async fn list_audit(&self, key: AvailabilityKey) -> CoreResult<Vec<AuditEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT id, operation_id, operation, product_type, availability_id, requested, applied, remaining, outcome, reason, cause, created_at FROM stock_audit_log WHERE product_type = $1 AND availability_id = $2 ORDER BY created_at",
        )
        .bind(key.kind.as_str())
        .bind(key.id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }

    async fn record_metrics(&self, sample: MetricsSample) -> CoreResult<()> {
        upsert_metrics(&self.pool, &sample).await
    }

    async fn find_metrics(
        &self,
        key: AvailabilityKey,
        date: NaiveDate,
    ) -> CoreResult<Option<StockMetrics>> {
        let row: Option<MetricsRow> = sqlx::query_as(
            "SELECT product_type, availability_id, date, total_capacity, current_reserved, current_available, utilization_rate, total_reservations, total_releases, failed_operations, updated_at FROM stock_metrics WHERE product_type = $1 AND availability_id = $2 AND date = $3",
        )
        .bind(key.kind.as_str())
        .bind(key.id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.map(MetricsRow::into_metrics).transpose()
    }

    async fn stale_carts(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> =
            sqlx::query_as("SELECT id FROM carts WHERE status = 'OPEN' AND updated_at < $1")
                .bind(cutoff)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn find_idempotency_record(
        &self,
        user_id: i64,
        key: &str,
    ) -> CoreResult<Option<IdempotencyRecord>> {
        let row: Option<IdempotencyRow> = sqlx::query_as(
            "SELECT key, user_id, order_id, created_at FROM idempotency_records WHERE key = $1 AND user_id = $2",
        )
        .bind(key)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(IdempotencyRecord::from))
    }

    async fn count_idempotency_records_before(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM idempotency_records WHERE created_at < $1")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await
                .map_err(map_sqlx)?;
        Ok(count.max(0) as u64)
    }

    async fn delete_idempotency_records_before(&self, cutoff: DateTime<Utc>) -> CoreResult<u64> {
        let result = sqlx::query("DELETE FROM idempotency_records WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(result.rows_affected())
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn lock_availability(
        &mut self,
        key: AvailabilityKey,
    ) -> CoreResult<Option<AvailabilityRecord>> {
        fetch_availability(&mut *self.tx, key, true).await
    }

    async fn update_availability(&mut self, record: &AvailabilityRecord) -> CoreResult<()> {
        let table = availability_table(record.kind())?;
        let (column, value) = match record {
            AvailabilityRecord::Activity(seat) | AvailabilityRecord::Transportation(seat) => {
                ("reserved_seats", seat.reserved_seats)
            }
            AvailabilityRecord::Room(room) => ("available_quantity", room.available_quantity),
            AvailabilityRecord::Flight(flight) => ("available_seats", flight.available_seats),
        };
        let sql = format!("UPDATE {} SET {} = $2 WHERE id = $1", table, column);
        sqlx::query(&sql)
            .bind(record.id())
            .bind(value)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn lock_cart(&mut self, cart_id: Uuid) -> CoreResult<Option<Cart>> {
        let sql = format!("{} FOR UPDATE", CART_SQL);
        let row: Option<CartRow> = sqlx::query_as(&sql)
            .bind(cart_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let items: Vec<CartItemRow> = sqlx::query_as(CART_ITEMS_SQL)
            .bind(cart_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        let items = items
            .into_iter()
            .map(CartItemRow::into_item)
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Some(row.into_cart(items)?))
    }

    async fn save_cart(&mut self, cart: &Cart) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO carts (id, user_id, status, currency, total_cents, item_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                currency = EXCLUDED.currency,
                total_cents = EXCLUDED.total_cents,
                item_count = EXCLUDED.item_count,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(cart.id)
        .bind(cart.user_id)
        .bind(cart.status.as_str())
        .bind(&cart.currency)
        .bind(cart.total_cents)
        .bind(cart.item_count)
        .bind(cart.created_at)
        .bind(cart.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;

        sqlx::query("DELETE FROM cart_items WHERE cart_id = $1")
            .bind(cart.id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;

        for item in &cart.items {
            sqlx::query(
                r#"
                INSERT INTO cart_items (id, cart_id, product_type, metadata_id, package_id, availability_id, quantity, unit_price_cents, currency, config, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(item.id)
            .bind(cart.id)
            .bind(item.product.kind.as_str())
            .bind(item.product.metadata_id)
            .bind(item.package_id)
            .bind(item.availability_id)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(&item.currency)
            .bind(&item.config)
            .bind(item.created_at)
            .bind(item.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn lock_order(&mut self, order_id: Uuid) -> CoreResult<Option<Order>> {
        let sql = format!("{} WHERE id = $1 FOR UPDATE", ORDER_SQL);
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let details: Vec<OrderDetailRow> = sqlx::query_as(ORDER_DETAILS_SQL)
            .bind(order_id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        let details = details
            .into_iter()
            .map(OrderDetailRow::into_detail)
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Some(row.into_order(details)?))
    }

    async fn insert_order(&mut self, order: &Order) -> CoreResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, cart_id, state, total_cents, currency, idempotency_key, payment_method, refunded_cents, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(order.id)
        .bind(order.user_id)
        .bind(order.cart_id)
        .bind(order.state.as_str())
        .bind(order.total_cents)
        .bind(&order.currency)
        .bind(&order.idempotency_key)
        .bind(order.payment_method.as_deref())
        .bind(order.refunded_cents)
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await;

        if let Err(sqlx::Error::Database(db)) = &inserted {
            if db.code().as_deref() == Some(UNIQUE_VIOLATION) {
                return Err(CoreError::DuplicateIdempotencyKey(order.idempotency_key.clone()));
            }
        }
        inserted.map_err(map_sqlx)?;

        for detail in &order.details {
            sqlx::query(
                r#"
                INSERT INTO order_details (id, order_id, product_type, metadata_id, package_id, availability_id, quantity, unit_price_cents, subtotal_cents, discount_cents, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(detail.id)
            .bind(order.id)
            .bind(detail.product.kind.as_str())
            .bind(detail.product.metadata_id)
            .bind(detail.package_id)
            .bind(detail.availability_id)
            .bind(detail.quantity)
            .bind(detail.unit_price_cents)
            .bind(detail.subtotal_cents)
            .bind(detail.discount_cents)
            .bind(detail.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn update_order(&mut self, order: &Order) -> CoreResult<()> {
        sqlx::query(
            "UPDATE orders SET state = $2, payment_method = $3, refunded_cents = $4, updated_at = $5 WHERE id = $1",
        )
        .bind(order.id)
        .bind(order.state.as_str())
        .bind(order.payment_method.as_deref())
        .bind(order.refunded_cents)
        .bind(order.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn find_order_by_idempotency_key(&mut self, key: &str) -> CoreResult<Option<Order>> {
        let sql = format!("{} WHERE idempotency_key = $1", ORDER_SQL);
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let details: Vec<OrderDetailRow> = sqlx::query_as(ORDER_DETAILS_SQL)
            .bind(row.id)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(map_sqlx)?;
        let details = details
            .into_iter()
            .map(OrderDetailRow::into_detail)
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Some(row.into_order(details)?))
    }

    async fn insert_idempotency_record(&mut self, record: &IdempotencyRecord) -> CoreResult<()> {
        sqlx::query(
            "INSERT INTO idempotency_records (key, user_id, order_id, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.key)
        .bind(record.user_id)
        .bind(record.order_id)
        .bind(record.created_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn append_audit(&mut self, entry: AuditEntry) -> CoreResult<()> {
        insert_audit(&mut *self.tx, &entry).await
    }

    async fn record_metrics(&mut self, sample: MetricsSample) -> CoreResult<()> {
        upsert_metrics(&mut *self.tx, &sample).await
    }

    async fn commit(self: Box<Self>) -> CoreResult<()> {
        self.tx.commit().await.map_err(map_sqlx)
    }

    async fn rollback(self: Box<Self>) -> CoreResult<()> {
        debug!("Rolling back transaction");
        self.tx.rollback().await.map_err(map_sqlx)
    }
}
