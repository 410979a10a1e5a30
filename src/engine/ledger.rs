use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::model::Capacity;

/// A bookable unit: one (date, time slot) pair, or one activity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum UnitKey {
    Slot { date: NaiveDate, time_slot: String },
    Activity(Ulid),
}

impl UnitKey {
    pub fn slot(date: NaiveDate, time_slot: impl Into<String>) -> Self {
        UnitKey::Slot {
            date,
            time_slot: time_slot.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UnitKey::Slot { .. } => "slot",
            UnitKey::Activity(_) => "activity",
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKey::Slot { date, time_slot } => write!(f, "slot {date} {time_slot}"),
            UnitKey::Activity(id) => write!(f, "activity {id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerError {
    CapacityExceeded { capacity: Capacity, reserved: u32 },
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::CapacityExceeded { capacity, reserved } => {
                write!(f, "capacity {capacity} exceeded ({reserved} reserved)")
            }
        }
    }
}

impl std::error::Error for LedgerError {}

/// Capacity and live reservation count of one unit. Only reachable through
/// the unit's mutex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitCounter {
    pub capacity: Capacity,
    pub reserved: u32,
}

impl UnitCounter {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            reserved: 0,
        }
    }

    /// Check-and-increment. On failure nothing changes.
    pub fn try_reserve(&mut self, amount: u32) -> Result<(), LedgerError> {
        if !self.capacity.admits(self.reserved, amount) {
            return Err(LedgerError::CapacityExceeded {
                capacity: self.capacity,
                reserved: self.reserved,
            });
        }
        self.reserved += amount;
        Ok(())
    }

    /// Decrement, floored at 0. Not idempotent: callers guarantee one release
    /// per reservation by flipping the owning record's status under this lock.
    pub fn release(&mut self, amount: u32) {
        self.reserved = self.reserved.saturating_sub(amount);
    }

    /// Re-apply a reservation that is already durable (WAL replay). Skips the
    /// capacity check: the reservation was admitted when it was first made.
    pub fn restore(&mut self, amount: u32) {
        self.reserved = self.reserved.saturating_add(amount);
    }

    pub fn available(&self) -> Option<u32> {
        self.capacity.remaining(self.reserved)
    }
}

pub type SharedUnit = Arc<Mutex<UnitCounter>>;

/// Per-unit capacity accounting. Units are created lazily and each carries its
/// own lock, so operations on different units never wait on each other.
#[derive(Default)]
pub struct CapacityLedger {
    units: DashMap<UnitKey, SharedUnit>,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the unit, creating it with `capacity` on first use.
    pub fn unit(&self, key: &UnitKey, capacity: Capacity) -> SharedUnit {
        if let Some(unit) = self.units.get(key) {
            return unit.value().clone();
        }
        self.units
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(UnitCounter::new(capacity))))
            .value()
            .clone()
    }

    pub fn get(&self, key: &UnitKey) -> Option<SharedUnit> {
        self.units.get(key).map(|e| e.value().clone())
    }

    /// Lock a unit, creating it with `capacity` on first use.
    pub async fn lock(&self, key: &UnitKey, capacity: Capacity) -> OwnedMutexGuard<UnitCounter> {
        self.unit(key, capacity).lock_owned().await
    }

    pub async fn try_reserve(
        &self,
        key: &UnitKey,
        capacity: Capacity,
        amount: u32,
    ) -> Result<(), LedgerError> {
        self.lock(key, capacity).await.try_reserve(amount)
    }

    /// Release on a unit that was never materialized is a no-op.
    pub async fn release(&self, key: &UnitKey, amount: u32) {
        if let Some(unit) = self.get(key) {
            unit.lock().await.release(amount);
        }
    }

    /// Change a unit's capacity, creating it if needed. Existing reservations
    /// are kept even when they now exceed the new capacity.
    pub async fn set_capacity(&self, key: &UnitKey, capacity: Capacity) {
        self.lock(key, capacity).await.capacity = capacity;
    }

    /// `(capacity, reserved)` of a unit, if it exists.
    pub async fn snapshot(&self, key: &UnitKey) -> Option<(Capacity, u32)> {
        let unit = self.get(key)?;
        let guard = unit.lock().await;
        Some((guard.capacity, guard.reserved))
    }

    pub fn keys(&self) -> Vec<UnitKey> {
        self.units.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}
