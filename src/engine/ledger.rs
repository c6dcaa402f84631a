use ulid::Ulid;

use crate::model::*;
use crate::slot::SlotKey;

// ── Capacity accounting ──────────────────────────────────────────

/// Number of bookings sitting exactly at `placement`.
pub fn occupancy(bookings: &[Booking], placement: &Placement) -> u32 {
    occupancy_excluding(bookings, placement, None)
}

/// Like `occupancy`, but ignores the booking with id `exclude`.
pub fn occupancy_excluding(bookings: &[Booking], placement: &Placement, exclude: Option<Ulid>) -> u32 {
    bookings
        .iter()
        .filter(|b| Some(b.id) != exclude && b.is_at(placement))
        .count() as u32
}

/// Bookings referencing `slot` of `provider_id` on any date.
pub fn slot_total(bookings: &[Booking], provider_id: Ulid, slot: &SlotKey) -> u32 {
    bookings
        .iter()
        .filter(|b| b.provider_id == Some(provider_id) && b.slot.as_ref() == Some(slot))
        .count() as u32
}

/// Configured capacity of `slot`, or `DEFAULT_SLOT_CAPACITY`.
pub fn capacity_of(provider: &Provider, slot: &SlotKey) -> u32 {
    provider
        .slot(slot)
        .map(ProviderSlot::resolved_capacity)
        .unwrap_or(crate::limits::DEFAULT_SLOT_CAPACITY)
}

pub fn has_room(bookings: &[Booking], provider: &Provider, slot: &SlotKey, date: chrono::NaiveDate) -> bool {
    let placement = Placement::new(provider.id, *slot, date);
    occupancy(bookings, &placement) < capacity_of(provider, slot)
}
