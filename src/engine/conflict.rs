use serde::Serialize;

use crate::model::*;
use crate::slot::SlotKey;

use super::ledger::{capacity_of, slot_total};
use super::EngineError;

/// What merging a new slot into its overlapping neighbours would produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeProposal {
    pub new_key: SlotKey,
    pub overlaps: Vec<SlotKey>,
    pub merged_key: SlotKey,
    pub merged_capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub merged_key: SlotKey,
    pub capacity: u32,
    /// Bookings whose slot was re-keyed to `merged_key`.
    pub rewritten: u32,
    pub removed: Vec<SlotKey>,
}

/// Existing slots on the same weekday (or the same override day) whose
/// range overlaps `new_key`'s. Touching ranges do not overlap.
pub fn find_overlaps(provider: &Provider, new_key: &SlotKey) -> Vec<SlotKey> {
    let anchor = new_key.anchor();
    let range = new_key.range();
    provider
        .slot_keys()
        .filter(|k| k.anchor() == anchor && k.range().overlaps(&range))
        .copied()
        .collect()
}

/// Hull of all ranges, widest capacity of all slots involved.
///
/// `new_capacity` is the capacity requested for the new slot; defaulting it
/// is the caller's job.
pub fn propose_merge(
    provider: &Provider,
    overlaps: &[SlotKey],
    new_key: &SlotKey,
    new_capacity: u32,
) -> MergeProposal {
    let mut range = new_key.range();
    let mut merged_capacity = new_capacity;
    for key in overlaps {
        range = range.hull(&key.range());
        merged_capacity = merged_capacity.max(capacity_of(provider, key));
    }
    MergeProposal {
        new_key: *new_key,
        overlaps: overlaps.to_vec(),
        merged_key: new_key.with_range(range),
        merged_capacity,
    }
}

/// Replace the overlapping slots with the merged one and re-key their bookings.
///
/// All-or-nothing: if the bookings already held by the overlapping slots
/// (over all dates) exceed the merged capacity, nothing is touched.
pub fn apply_merge(
    provider: &mut Provider,
    bookings: &mut [Booking],
    proposal: &MergeProposal,
) -> Result<MergeSummary, EngineError> {
    let booked: u32 = proposal
        .overlaps
        .iter()
        .map(|k| slot_total(bookings, provider.id, k))
        .sum();
    if booked > proposal.merged_capacity {
        return Err(EngineError::MergeCapacityExceeded {
            booked,
            capacity: proposal.merged_capacity,
        });
    }

    let mut rewritten = 0;
    for b in bookings.iter_mut() {
        if b.provider_id == Some(provider.id)
            && let Some(slot) = b.slot
            && proposal.overlaps.contains(&slot)
        {
            b.slot = Some(proposal.merged_key);
            rewritten += 1;
        }
    }

    for key in &proposal.overlaps {
        provider.remove_slot(key);
    }
    provider.upsert_slot(proposal.merged_key, Some(proposal.merged_capacity));

    Ok(MergeSummary {
        merged_key: proposal.merged_key,
        capacity: proposal.merged_capacity,
        rewritten,
        removed: proposal.overlaps.clone(),
    })
}
