use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::slot::SlotKey;

use super::ledger::{capacity_of, occupancy, occupancy_excluding};
use super::EngineError;

/// Queue position for a booking about to be appended at (provider, slot, date).
///
/// Counts the collection *before* insertion; the caller must append under
/// the same lock or the check is racy.
pub fn assign_on_create(
    bookings: &[Booking],
    provider: &Provider,
    slot: &SlotKey,
    date: NaiveDate,
) -> Result<u32, EngineError> {
    let placement = Placement::new(provider.id, *slot, date);
    next_position(occupancy(bookings, &placement), capacity_of(provider, slot))
}

/// Queue position for booking `edited` moved to `target`.
///
/// The edited record never counts itself. A cleared target (`None`) means
/// the booking is unassigned and gets position 0.
pub fn recompute_on_edit(
    bookings: &[Booking],
    edited: Ulid,
    target: Option<(&Provider, &SlotKey, NaiveDate)>,
) -> Result<u32, EngineError> {
    let Some((provider, slot, date)) = target else {
        return Ok(0);
    };
    let placement = Placement::new(provider.id, *slot, date);
    let taken = occupancy_excluding(bookings, &placement, Some(edited));
    next_position(taken, capacity_of(provider, slot))
}

fn next_position(taken: u32, capacity: u32) -> Result<u32, EngineError> {
    if taken >= capacity {
        return Err(EngineError::CapacityExceeded(capacity));
    }
    Ok(taken + 1)
}
