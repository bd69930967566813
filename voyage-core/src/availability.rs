use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::product::{AvailabilityKey, ProductKind};

/// Uniform view over a capacity counter, whatever its storage orientation.
///
/// Every record normalizes to `remaining = total - consumed` with
/// `0 <= consumed <= total`.
pub trait CapacityAccessor {
    fn total(&self) -> i32;
    fn consumed(&self) -> i32;
    fn set_consumed(&mut self, consumed: i32);

    fn remaining(&self) -> i32 {
        self.total() - self.consumed()
    }

    fn within_bounds(&self) -> bool {
        (0..=self.total()).contains(&self.consumed())
    }
}

/// Seat-style stock counting consumed units (activities, transportation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeatAvailability {
    pub id: i64,
    pub total_seats: i32,
    pub reserved_seats: i32,
    pub is_active: bool,
}

impl SeatAvailability {
    pub fn new(id: i64, total_seats: i32) -> Self {
        Self {
            id,
            total_seats,
            reserved_seats: 0,
            is_active: true,
        }
    }
}

impl CapacityAccessor for SeatAvailability {
    fn total(&self) -> i32 {
        self.total_seats
    }

    fn consumed(&self) -> i32 {
        self.reserved_seats
    }

    fn set_consumed(&mut self, consumed: i32) {
        self.reserved_seats = consumed;
    }
}

/// Room-nights for a date range. Counts remaining units; `available_quantity`
/// may start below `max_quantity`, and release never lifts it past the ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAvailability {
    pub id: i64,
    pub check_in: NaiveDate,
    pub check_out: NaiveDate,
    pub max_quantity: i32,
    pub available_quantity: i32,
    pub is_active: bool,
}

impl CapacityAccessor for RoomAvailability {
    fn total(&self) -> i32 {
        self.max_quantity
    }

    fn consumed(&self) -> i32 {
        self.max_quantity - self.available_quantity
    }

    fn set_consumed(&mut self, consumed: i32) {
        self.available_quantity = self.max_quantity - consumed;
    }
}

/// Flight seats. Counts remaining seats against the aircraft capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightAvailability {
    pub id: i64,
    pub capacity: i32,
    pub available_seats: i32,
    pub is_active: bool,
}

impl FlightAvailability {
    pub fn new(id: i64, capacity: i32) -> Self {
        Self {
            id,
            capacity,
            available_seats: capacity,
            is_active: true,
        }
    }
}

impl CapacityAccessor for FlightAvailability {
    fn total(&self) -> i32 {
        self.capacity
    }

    fn consumed(&self) -> i32 {
        self.capacity - self.available_seats
    }

    fn set_consumed(&mut self, consumed: i32) {
        self.available_seats = self.capacity - consumed;
    }
}

/// One ledger row, tagged by product type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AvailabilityRecord {
    Activity(SeatAvailability),
    Transportation(SeatAvailability),
    Room(RoomAvailability),
    Flight(FlightAvailability),
}

impl AvailabilityRecord {
    pub fn kind(&self) -> ProductKind {
        match self {
            AvailabilityRecord::Activity(_) => ProductKind::Activity,
            AvailabilityRecord::Transportation(_) => ProductKind::Transportation,
            AvailabilityRecord::Room(_) => ProductKind::Room,
            AvailabilityRecord::Flight(_) => ProductKind::Flight,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            AvailabilityRecord::Activity(a) | AvailabilityRecord::Transportation(a) => a.id,
            AvailabilityRecord::Room(r) => r.id,
            AvailabilityRecord::Flight(f) => f.id,
        }
    }

    pub fn key(&self) -> AvailabilityKey {
        AvailabilityKey::new(self.kind(), self.id())
    }

    pub fn is_active(&self) -> bool {
        match self {
            AvailabilityRecord::Activity(a) | AvailabilityRecord::Transportation(a) => a.is_active,
            AvailabilityRecord::Room(r) => r.is_active,
            AvailabilityRecord::Flight(f) => f.is_active,
        }
    }

    pub fn counter(&self) -> &dyn CapacityAccessor {
        match self {
            AvailabilityRecord::Activity(a) | AvailabilityRecord::Transportation(a) => a,
            AvailabilityRecord::Room(r) => r,
            AvailabilityRecord::Flight(f) => f,
        }
    }

    pub fn counter_mut(&mut self) -> &mut dyn CapacityAccessor {
        match self {
            AvailabilityRecord::Activity(a) | AvailabilityRecord::Transportation(a) => a,
            AvailabilityRecord::Room(r) => r,
            AvailabilityRecord::Flight(f) => f,
        }
    }
}

impl CapacityAccessor for AvailabilityRecord {
    fn total(&self) -> i32 {
        self.counter().total()
    }

    fn consumed(&self) -> i32 {
        self.counter().consumed()
    }

    fn set_consumed(&mut self, consumed: i32) {
        self.counter_mut().set_consumed(consumed);
    }
}
