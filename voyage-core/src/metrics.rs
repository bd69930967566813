use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::availability::CapacityAccessor;
use crate::product::AvailabilityKey;

/// Percentage of capacity consumed, two decimals; zero for empty capacity.
pub fn utilization(reserved: i32, total: i32) -> f64 {
    if total <= 0 {
        return 0.0;
    }
    let pct = f64::from(reserved) / f64::from(total) * 100.0;
    (pct * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsEvent {
    Reserved,
    Released,
    Failed,
}

/// Counter levels of a row right after a movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    pub total: i32,
    pub reserved: i32,
    pub available: i32,
}

impl StockLevels {
    pub fn of<C: CapacityAccessor + ?Sized>(counter: &C) -> Self {
        Self {
            total: counter.total(),
            reserved: counter.consumed(),
            available: counter.remaining(),
        }
    }
}

/// One movement to fold into the day's metrics for a row. Failures carry no
/// levels: the row may be missing or was never read.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    pub key: AvailabilityKey,
    pub date: NaiveDate,
    pub event: MetricsEvent,
    pub levels: Option<StockLevels>,
}

impl MetricsSample {
    pub fn new(key: AvailabilityKey, event: MetricsEvent, levels: Option<StockLevels>) -> Self {
        Self {
            key,
            date: Utc::now().date_naive(),
            event,
            levels,
        }
    }
}

/// Daily per-row snapshot: current levels plus movement counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockMetrics {
    pub key: AvailabilityKey,
    pub date: NaiveDate,
    pub total_capacity: i32,
    pub current_reserved: i32,
    pub current_available: i32,
    pub utilization_rate: f64,
    pub total_reservations: i64,
    pub total_releases: i64,
    pub failed_operations: i64,
    pub updated_at: DateTime<Utc>,
}

impl StockMetrics {
    pub fn new(key: AvailabilityKey, date: NaiveDate) -> Self {
        Self {
            key,
            date,
            total_capacity: 0,
            current_reserved: 0,
            current_available: 0,
            utilization_rate: 0.0,
            total_reservations: 0,
            total_releases: 0,
            failed_operations: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn apply(&mut self, sample: &MetricsSample) {
        if let Some(levels) = sample.levels {
            self.total_capacity = levels.total;
            self.current_reserved = levels.reserved;
            self.current_available = levels.available;
            self.utilization_rate = utilization(levels.reserved, levels.total);
        }
        let counter = match sample.event {
            MetricsEvent::Reserved => &mut self.total_reservations,
            MetricsEvent::Released => &mut self.total_releases,
            MetricsEvent::Failed => &mut self.failed_operations,
        };
        *counter = counter.saturating_add(1);
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::availability::FlightAvailability;
    use crate::product::ProductKind;

    #[test]
    fn test_utilization_rounding() {
        assert_eq!(utilization(1, 3), 33.33);
        assert_eq!(utilization(2, 3), 66.67);
        assert_eq!(utilization(20, 20), 100.0);
        assert_eq!(utilization(0, 0), 0.0);
    }

    #[test]
    fn test_failure_keeps_last_levels() {
        let key = AvailabilityKey::new(ProductKind::Flight, 3);
        let mut flight = FlightAvailability::new(3, 80);
        flight.available_seats = 60;

        let mut metrics = StockMetrics::new(key, Utc::now().date_naive());
        metrics.apply(&MetricsSample::new(key, MetricsEvent::Reserved, Some(StockLevels::of(&flight))));
        metrics.apply(&MetricsSample::new(key, MetricsEvent::Failed, None));

        assert_eq!(metrics.current_reserved, 20);
        assert_eq!(metrics.current_available, 60);
        assert_eq!(metrics.utilization_rate, 25.0);
        assert_eq!((metrics.total_reservations, metrics.total_releases, metrics.failed_operations), (1, 0, 1));
    }
}
