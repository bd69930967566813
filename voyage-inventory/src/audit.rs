use std::sync::Arc;
use tracing::error;

use voyage_core::{
    AuditCause, AuditEntry, AuditOperation, AvailabilityKey, CoreError, CoreResult, MetricsEvent,
    MetricsSample, StockLevels, StockStore, StoreTx,
};

/// Append-only writer for stock movements and the daily metrics they feed.
///
/// Successful movements are written through the caller's transaction and
/// commit with it. Failures are written straight to the store so the entry
/// outlives the rollback of the transaction that failed.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn StockStore>,
}

impl AuditTrail {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }

    /// `levels` are the row's counters after the movement.
    pub async fn record(
        &self,
        tx: &mut dyn StoreTx,
        entry: AuditEntry,
        levels: StockLevels,
    ) -> CoreResult<()> {
        let event = match entry.operation {
            AuditOperation::Reserve => MetricsEvent::Reserved,
            AuditOperation::Release => MetricsEvent::Released,
        };
        let sample = MetricsSample::new(entry.key, event, Some(levels));
        tx.append_audit(entry).await?;
        tx.record_metrics(sample).await
    }

    /// Never fails: a lost failure entry must not mask the original error.
    pub async fn record_failure(
        &self,
        operation: AuditOperation,
        key: AvailabilityKey,
        requested: i32,
        reason: &CoreError,
        cause: AuditCause,
    ) {
        let entry = AuditEntry::failure(operation, key, requested, reason.to_string(), cause);
        if let Err(e) = self.store.append_audit(entry).await {
            error!(
                key = %key,
                operation = operation.as_str(),
                "Failed to write audit entry: {}",
                e
            );
        }

        let sample = MetricsSample::new(key, MetricsEvent::Failed, None);
        if let Err(e) = self.store.record_metrics(sample).await {
            error!(key = %key, "Failed to update stock metrics: {}", e);
        }
    }

    pub async fn history(&self, key: AvailabilityKey) -> CoreResult<Vec<AuditEntry>> {
        self.store.list_audit(key).await
    }
}
