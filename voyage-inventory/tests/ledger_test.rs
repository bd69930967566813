use chrono::NaiveDate;
use std::sync::Arc;
use std::time::Duration;
use voyage_core::{
    AuditCause, AuditOperation, AuditOutcome, AvailabilityKey, AvailabilityRecord, CoreError,
    FlightAvailability, ProductKind, RoomAvailability, SeatAvailability, StockStore,
};
use voyage_inventory::{BulkReservation, Ledger, StockService};
use voyage_store::MemoryStore;

fn seats(kind: ProductKind, id: i64, total: i32, reserved: i32) -> AvailabilityRecord {
    let seat = SeatAvailability {
        id,
        total_seats: total,
        reserved_seats: reserved,
        is_active: true,
    };
    match kind {
        ProductKind::Transportation => AvailabilityRecord::Transportation(seat),
        _ => AvailabilityRecord::Activity(seat),
    }
}

fn setup(records: Vec<AvailabilityRecord>) -> (MemoryStore, Ledger) {
    let store = MemoryStore::new();
    for record in records {
        store.insert_availability(record).unwrap();
    }
    let ledger = Ledger::new(Arc::new(store.clone()));
    (store, ledger)
}

fn reserved_seats(store: &MemoryStore, key: AvailabilityKey) -> i32 {
    match store.availability(key).unwrap().unwrap() {
        AvailabilityRecord::Activity(s) | AvailabilityRecord::Transportation(s) => s.reserved_seats,
        other => panic!("not a seat record: {:?}", other),
    }
}

#[tokio::test]
async fn test_reserve_then_release() {
    let key = AvailabilityKey::new(ProductKind::Activity, 1);
    let (store, ledger) = setup(vec![seats(ProductKind::Activity, 1, 20, 5)]);

    let reserved = ledger.activities().reserve(1, 10).await.unwrap();
    assert_eq!(reserved.remaining, 5);
    assert_eq!(reserved_seats(&store, key), 15);

    let released = ledger.activities().release(1, 3).await.unwrap();
    assert_eq!(released.remaining, 8);
    assert_eq!(reserved_seats(&store, key), 12);
}

#[tokio::test]
async fn test_insufficient_stock_leaves_counter_untouched() {
    let key = AvailabilityKey::new(ProductKind::Activity, 1);
    let (store, ledger) = setup(vec![seats(ProductKind::Activity, 1, 20, 5)]);

    let err = ledger.reserve(key, 20).await.unwrap_err();

    assert!(matches!(
        err,
        CoreError::InsufficientStock { requested: 20, available: 15, .. }
    ));
    assert!(!err.is_retryable());
    assert_eq!(reserved_seats(&store, key), 5);
}

#[tokio::test]
async fn test_invalid_quantity_and_missing_rows() {
    let (_store, ledger) = setup(vec![seats(ProductKind::Transportation, 4, 10, 0)]);

    assert!(matches!(
        ledger.transportation().reserve(4, 0).await,
        Err(CoreError::InvalidQuantity(0))
    ));
    assert!(matches!(
        ledger.transportation().release(4, -2).await,
        Err(CoreError::InvalidQuantity(-2))
    ));
    assert!(matches!(
        ledger.flights().reserve(4, 1).await,
        Err(CoreError::ProductNotFound(_))
    ));
    assert!(matches!(
        ledger.adapter(ProductKind::Package),
        Err(CoreError::UnknownProductType(_))
    ));
}

#[tokio::test]
async fn test_over_release_clamps_and_is_repeatable() {
    let key = AvailabilityKey::new(ProductKind::Activity, 2);
    let (store, ledger) = setup(vec![seats(ProductKind::Activity, 2, 10, 3)]);

    let first = ledger.release(key, 5).await.unwrap();
    assert!(first.clamped);
    assert_eq!(first.applied, 3);
    assert_eq!(first.remaining, 10);

    let second = ledger.release(key, 5).await.unwrap();
    assert_eq!(second.applied, 0);
    assert_eq!(reserved_seats(&store, key), 0);

    let outcomes: Vec<_> = store
        .audit_entries()
        .unwrap()
        .into_iter()
        .map(|e| e.outcome)
        .collect();
    assert_eq!(outcomes, vec![AuditOutcome::Clamped, AuditOutcome::Clamped]);
}

#[tokio::test]
async fn test_room_counter_respects_ceiling() {
    let key = AvailabilityKey::new(ProductKind::Room, 3);
    let (store, ledger) = setup(vec![AvailabilityRecord::Room(RoomAvailability {
        id: 3,
        check_in: NaiveDate::from_ymd_opt(2026, 7, 1).unwrap(),
        check_out: NaiveDate::from_ymd_opt(2026, 7, 5).unwrap(),
        max_quantity: 8,
        available_quantity: 5,
        is_active: true,
    })]);

    assert_eq!(ledger.rooms().reserve(3, 5).await.unwrap().remaining, 0);
    assert!(matches!(
        ledger.rooms().reserve(3, 1).await,
        Err(CoreError::InsufficientStock { available: 0, .. })
    ));

    let released = ledger.rooms().release(3, 20).await.unwrap();
    assert_eq!(released.applied, 8);
    match store.availability(key).unwrap().unwrap() {
        AvailabilityRecord::Room(room) => assert_eq!(room.available_quantity, 8),
        other => panic!("unexpected record {:?}", other),
    }
}

#[tokio::test]
async fn test_flight_counter_orientation() {
    let key = AvailabilityKey::new(ProductKind::Flight, 9);
    let (store, ledger) = setup(vec![AvailabilityRecord::Flight(FlightAvailability::new(9, 180))]);

    ledger.flights().reserve(9, 2).await.unwrap();

    match store.availability(key).unwrap().unwrap() {
        AvailabilityRecord::Flight(flight) => assert_eq!(flight.available_seats, 178),
        other => panic!("unexpected record {:?}", other),
    }
}

#[tokio::test]
async fn test_inactive_row_rejects_reserve_but_accepts_release() {
    let key = AvailabilityKey::new(ProductKind::Activity, 5);
    let mut record = SeatAvailability {
        id: 5,
        total_seats: 10,
        reserved_seats: 4,
        is_active: false,
    };
    let (store, ledger) = setup(vec![AvailabilityRecord::Activity(record.clone())]);

    assert!(matches!(ledger.reserve(key, 1).await, Err(CoreError::ProductNotFound(_))));
    ledger.release(key, 4).await.unwrap();

    record.reserved_seats = 0;
    assert_eq!(store.availability(key).unwrap(), Some(AvailabilityRecord::Activity(record)));
}

#[tokio::test]
async fn test_every_attempt_is_audited() {
    let key = AvailabilityKey::new(ProductKind::Activity, 1);
    let missing = AvailabilityKey::new(ProductKind::Activity, 99);
    let (store, ledger) = setup(vec![seats(ProductKind::Activity, 1, 5, 0)]);

    ledger.reserve(key, 2).await.unwrap();
    ledger.reserve(key, 4).await.unwrap_err();
    ledger.reserve(missing, 1).await.unwrap_err();
    ledger.release(key, 1).await.unwrap();

    let entries = store.audit_entries().unwrap();
    assert_eq!(entries.len(), 4);

    assert_eq!(entries[0].operation, AuditOperation::Reserve);
    assert_eq!(entries[0].outcome, AuditOutcome::Success);
    assert_eq!(entries[0].remaining, Some(3));
    assert_eq!(entries[0].cause, AuditCause::Direct);

    let failures: Vec<_> = entries
        .iter()
        .filter(|e| e.outcome == AuditOutcome::Failure)
        .collect();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|e| e.applied == 0 && e.reason.is_some()));
    assert!(failures.iter().any(|e| e.key == missing));

    let history = ledger.audit().history(key).await.unwrap();
    assert_eq!(history.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reserves_never_oversell() {
    let key = AvailabilityKey::new(ProductKind::Activity, 1);
    let (store, ledger) = setup(vec![seats(ProductKind::Activity, 1, 10, 0)]);

    let first = tokio::spawn({
        let ledger = ledger.clone();
        async move { ledger.reserve(key, 6).await }
    });
    let second = tokio::spawn({
        let ledger = ledger.clone();
        async move { ledger.reserve(key, 6).await }
    });

    let results = [first.await.unwrap(), second.await.unwrap()];
    let successes = results.iter().filter(|r| r.is_ok()).count();
    let shortfalls = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::InsufficientStock { available: 4, .. })))
        .count();

    assert_eq!(successes, 1);
    assert_eq!(shortfalls, 1);
    assert_eq!(reserved_seats(&store, key), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_small_reserves_fill_exactly() {
    let key = AvailabilityKey::new(ProductKind::Transportation, 2);
    let (store, ledger) = setup(vec![seats(ProductKind::Transportation, 2, 25, 0)]);

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.reserve(key, 1).await })
        })
        .collect();

    let mut ok = 0;
    for handle in handles {
        if handle.await.unwrap().is_ok() {
            ok += 1;
        }
    }

    assert_eq!(ok, 25);
    assert_eq!(reserved_seats(&store, key), 25);
}

#[tokio::test]
async fn test_lock_timeout_is_retryable_and_audited() {
    let key = AvailabilityKey::new(ProductKind::Activity, 1);
    let store = MemoryStore::with_lock_timeout(Duration::from_millis(50));
    store.insert_availability(seats(ProductKind::Activity, 1, 10, 0)).unwrap();
    let ledger = Ledger::new(Arc::new(store.clone()));

    let mut holder = store.begin().await.unwrap();
    holder.lock_availability(key).await.unwrap();

    let err = ledger.reserve(key, 1).await.unwrap_err();
    assert!(matches!(err, CoreError::LockTimeout(_)));
    assert!(err.is_retryable());

    holder.rollback().await.unwrap();
    assert_eq!(ledger.reserve(key, 1).await.unwrap().remaining, 9);

    let outcomes: Vec<_> = store.audit_entries().unwrap().iter().map(|e| e.outcome).collect();
    assert_eq!(outcomes, vec![AuditOutcome::Failure, AuditOutcome::Success]);
}

#[tokio::test]
async fn test_check_stock_is_read_only() {
    let key = AvailabilityKey::new(ProductKind::Activity, 1);
    let (store, _ledger) = setup(vec![seats(ProductKind::Activity, 1, 20, 5)]);
    let service = StockService::new(Arc::new(store.clone()));

    let check = service.check_stock(ProductKind::Activity, 1, 16).await.unwrap();
    assert!(!check.sufficient);
    assert_eq!((check.available, check.total, check.reserved), (15, 20, 5));

    assert!(matches!(
        service.check_stock(ProductKind::Activity, 1, 0).await,
        Err(CoreError::InvalidQuantity(0))
    ));
    assert!(matches!(
        service.check_stock(ProductKind::Flight, 1, 1).await,
        Err(CoreError::ProductNotFound(_))
    ));
    assert_eq!(reserved_seats(&store, key), 5);
    assert!(store.audit_entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_validate_bulk_collects_per_entry_results() {
    let (store, _ledger) = setup(vec![
        seats(ProductKind::Activity, 1, 10, 8),
        AvailabilityRecord::Flight(FlightAvailability::new(2, 50)),
    ]);
    let service = StockService::new(Arc::new(store.clone()));

    let entry = |product_type: &str, id, quantity| BulkReservation {
        product_type: product_type.to_string(),
        id,
        quantity,
    };
    let result = service
        .validate_bulk(&[
            entry("flight", 2, 4),
            entry("activity", 1, 5),
            entry("cruise", 1, 1),
            entry("activity", 1, 2),
            entry("activity", 1, 1),
        ])
        .await;

    assert!(!result.valid);
    assert_eq!(result.reservations.len(), 3);
    let failed: Vec<_> = result.errors.iter().map(|e| e.index).collect();
    assert_eq!(failed, vec![1, 2]);
    assert!(result.errors[1].error.contains("cruise"));
    // two valid entries on activity#1 together exceed what is left
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(store.availability(AvailabilityKey::new(ProductKind::Activity, 1)).unwrap(), Some(seats(ProductKind::Activity, 1, 10, 8)));
}

#[tokio::test]
async fn test_summary_normalizes_every_orientation() {
    let (store, _ledger) = setup(vec![
        seats(ProductKind::Activity, 1, 3, 1),
        AvailabilityRecord::Room(RoomAvailability {
            id: 1,
            check_in: NaiveDate::from_ymd_opt(2026, 1, 10).unwrap(),
            check_out: NaiveDate::from_ymd_opt(2026, 1, 12).unwrap(),
            max_quantity: 4,
            available_quantity: 1,
            is_active: true,
        }),
        AvailabilityRecord::Flight(FlightAvailability {
            id: 1,
            capacity: 0,
            available_seats: 0,
            is_active: true,
        }),
    ]);
    let service = StockService::new(Arc::new(store));

    let activity = service.get_summary(ProductKind::Activity, 1).await.unwrap();
    assert_eq!(activity.utilization, 33.33);

    let room = service.get_summary_by_name("lodgment", 1).await.unwrap();
    assert_eq!((room.total, room.reserved, room.available), (4, 3, 1));
    assert_eq!(room.utilization, 75.0);

    let flight = service.get_summary(ProductKind::Flight, 1).await.unwrap();
    assert_eq!(flight.utilization, 0.0);

    assert!(matches!(
        service.get_summary_by_name("cruise", 1).await,
        Err(CoreError::UnknownProductType(_))
    ));
    assert!(matches!(
        service.get_summary(ProductKind::Transportation, 1).await,
        Err(CoreError::ProductNotFound(_))
    ));
}

#[tokio::test]
async fn test_movements_feed_daily_metrics() {
    let key = AvailabilityKey::new(ProductKind::Transportation, 5);
    let (store, ledger) = setup(vec![seats(ProductKind::Transportation, 5, 10, 0)]);
    let service = StockService::new(Arc::new(store.clone()));
    let buses = ledger.transportation();

    assert!(service.get_metrics(ProductKind::Transportation, 5, None).await.unwrap().is_none());

    buses.reserve(5, 4).await.unwrap();
    buses.reserve(5, 3).await.unwrap();
    buses.release(5, 2).await.unwrap();
    assert!(buses.reserve(5, 20).await.is_err());
    assert!(buses.reserve(5, 0).await.is_err());

    // rolled back with its transaction
    let mut tx = store.begin().await.unwrap();
    ledger.reserve_within(tx.as_mut(), key, 1, AuditCause::Direct).await.unwrap();
    drop(tx);

    let metrics = service
        .get_metrics(ProductKind::Transportation, 5, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metrics.key, key);
    assert_eq!(metrics.total_capacity, 10);
    assert_eq!(metrics.current_reserved, 5);
    assert_eq!(metrics.current_available, 5);
    assert_eq!(metrics.utilization_rate, 50.0);
    assert_eq!(metrics.total_reservations, 2);
    assert_eq!(metrics.total_releases, 1);
    assert_eq!(metrics.failed_operations, 2);

    let clamped = buses.release(5, 100).await.unwrap();
    assert!(clamped.clamped);

    let metrics = service
        .get_metrics(ProductKind::Transportation, 5, Some(metrics.date))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metrics.total_releases, 2);
    assert_eq!(metrics.current_reserved, 0);
    assert_eq!(metrics.utilization_rate, 0.0);
}
