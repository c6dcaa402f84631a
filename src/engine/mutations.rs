use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::ScheduleEvent;
use crate::observability;
use crate::slot::{MonthDay, SlotKey, SlotKind, TimeRange};

use super::availability::{is_available, offers};
use super::conflict::{apply_merge, find_overlaps, propose_merge, MergeProposal, MergeSummary};
use super::ledger::slot_total;
use super::queue::{assign_on_create, recompute_on_edit};
use super::{today, Engine, EngineError, Owner, ProviderState};

/// A booking can move between containers while we wait for locks; retry
/// the lookup this many times before giving up.
pub(super) const MAX_MOVE_ATTEMPTS: usize = 3;

/// Result of `Engine::add_weekly_slot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotAddOutcome {
    /// No overlap; the slot was added as requested.
    Added { slot: SlotKey, capacity: u32 },
    /// Overlapping slots were merged into one.
    Merged(MergeSummary),
    /// The merge was not confirmed; nothing changed.
    Declined(MergeProposal),
}

fn validate_name(name: &str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 || capacity > MAX_SLOT_CAPACITY {
        return Err(EngineError::LimitExceeded("slot capacity out of range"));
    }
    Ok(())
}

fn ensure_not_past(date: NaiveDate) -> Result<(), EngineError> {
    if date < today() {
        return Err(EngineError::PastDate(date));
    }
    Ok(())
}

/// Date-specific slots to drop when `date` stops being an open date.
///
/// Keys carry no year, so they are kept while another open date shares
/// the same month and day. Refuses if any booking still points at them.
fn date_slots_to_drop(state: &ProviderState, date: NaiveDate) -> Result<Vec<SlotKey>, EngineError> {
    let day = MonthDay::of(date);
    if state
        .provider
        .open_dates
        .iter()
        .any(|d| *d != date && day.matches(*d))
    {
        return Ok(Vec::new());
    }
    let keys: Vec<SlotKey> = state
        .provider
        .slot_keys()
        .filter(|k| k.is_override_for(date))
        .copied()
        .collect();
    for key in &keys {
        let booked = slot_total(&state.bookings, state.provider.id, key);
        if booked > 0 {
            return Err(EngineError::SlotInUse {
                slot: *key,
                bookings: booked,
            });
        }
    }
    Ok(keys)
}

impl Engine {
    // ── Providers ────────────────────────────────────────────

    pub async fn create_provider(
        &self,
        id: Ulid,
        name: String,
        subject: String,
        title: String,
    ) -> Result<(), EngineError> {
        if self.state.len() >= MAX_PROVIDERS {
            return Err(EngineError::LimitExceeded("too many providers"));
        }
        validate_name(&name)?;
        validate_name(&subject)?;
        validate_name(&title)?;

        let mut provider = Provider::new(id, name, subject);
        provider.title = title;
        match self.state.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::ProviderAlreadyExists(id)),
            Entry::Vacant(v) => {
                info!("provider {id} created: {} ({})", provider.name, provider.subject);
                v.insert(Arc::new(RwLock::new(ProviderState::new(provider))));
            }
        }
        metrics::gauge!(observability::PROVIDERS_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    /// Rename/re-title a provider; display copies on its bookings follow.
    pub async fn update_provider_info(
        &self,
        id: Ulid,
        name: String,
        subject: String,
        title: String,
    ) -> Result<(), EngineError> {
        validate_name(&name)?;
        validate_name(&subject)?;
        validate_name(&title)?;
        let mut guard = self.provider_write(id).await?;
        let state = &mut *guard;
        state.provider.name = name;
        state.provider.subject = subject;
        state.provider.title = title;
        for b in &mut state.bookings {
            b.provider_name = state.provider.name.clone();
            b.provider_subject = state.provider.subject.clone();
        }
        info!("provider {id} updated: {}", state.provider.name);
        self.notify.send(id, ScheduleEvent::ProviderUpdated);
        Ok(())
    }

    pub async fn delete_provider(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.provider_write(id).await?;
        if !guard.bookings.is_empty() {
            return Err(EngineError::ProviderHasBookings(id));
        }
        // Removed while still locked so waiters see it gone once they acquire.
        self.state.remove(&id);
        drop(guard);
        info!("provider {id} deleted");
        self.notify.send(id, ScheduleEvent::ProviderDeleted);
        self.notify.remove(&id);
        metrics::gauge!(observability::PROVIDERS_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    // ── Schedule editing ─────────────────────────────────────

    /// Add a recurring weekly slot.
    ///
    /// If it overlaps existing slots on the same weekday, the merge that
    /// would result is passed to `confirm`; only a `true` answer applies it.
    /// Without an explicit `capacity` a plain addition gets
    /// `NEW_SLOT_DEFAULT_CAPACITY`; a merge keeps the widest capacity among
    /// the overlapping slots.
    pub async fn add_weekly_slot(
        &self,
        provider_id: Ulid,
        key: SlotKey,
        capacity: Option<u32>,
        confirm: impl FnOnce(&MergeProposal) -> bool,
    ) -> Result<SlotAddOutcome, EngineError> {
        if key.kind() != SlotKind::Weekly {
            return Err(EngineError::InvalidSlotFormat(format!("{key} is not a weekly slot")));
        }
        if let Some(cap) = capacity {
            validate_capacity(cap)?;
        }

        let mut guard = self.provider_write(provider_id).await?;
        let state = &mut *guard;
        if state.provider.has_slot(&key) {
            return Err(EngineError::SlotAlreadyExists(key));
        }

        let overlaps = find_overlaps(&state.provider, &key);
        if overlaps.is_empty() {
            if state.provider.slots.len() >= MAX_SLOTS_PER_PROVIDER {
                return Err(EngineError::LimitExceeded("too many slots on provider"));
            }
            let capacity = capacity.unwrap_or(NEW_SLOT_DEFAULT_CAPACITY);
            state.provider.upsert_slot(key, Some(capacity));
            info!("provider {provider_id}: added slot {key} (capacity {capacity})");
            self.notify
                .send(provider_id, ScheduleEvent::SlotAdded { slot: key, capacity });
            return Ok(SlotAddOutcome::Added { slot: key, capacity });
        }

        // Unset capacity competes as the plain slot default, not the new-slot one.
        let proposal = propose_merge(
            &state.provider,
            &overlaps,
            &key,
            capacity.unwrap_or(DEFAULT_SLOT_CAPACITY),
        );
        if !confirm(&proposal) {
            debug!(
                "provider {provider_id}: merge of {key} into {} declined",
                proposal.merged_key
            );
            return Ok(SlotAddOutcome::Declined(proposal));
        }

        let summary = apply_merge(&mut state.provider, &mut state.bookings, &proposal)?;
        metrics::counter!(observability::SLOT_MERGES_TOTAL).increment(1);
        metrics::counter!(observability::MERGE_REWRITES_TOTAL).increment(u64::from(summary.rewritten));
        info!(
            "provider {provider_id}: merged {} slots into {} (capacity {}, {} bookings re-keyed)",
            summary.removed.len(),
            summary.merged_key,
            summary.capacity,
            summary.rewritten
        );
        self.notify.send(
            provider_id,
            ScheduleEvent::SlotsMerged {
                removed: summary.removed.clone(),
                merged: summary.merged_key,
                capacity: summary.capacity,
                rewritten: summary.rewritten,
            },
        );
        Ok(SlotAddOutcome::Merged(summary))
    }

    /// Force `date` open with a date-specific slot `range`.
    /// Calling it again for the same date adds further ranges.
    pub async fn open_date(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        capacity: Option<u32>,
    ) -> Result<SlotKey, EngineError> {
        ensure_not_past(date)?;
        let capacity = capacity.unwrap_or(NEW_SLOT_DEFAULT_CAPACITY);
        validate_capacity(capacity)?;

        let mut guard = self.provider_write(provider_id).await?;
        let key = SlotKey::for_date(date, range);
        if guard.provider.has_slot(&key) {
            return Err(EngineError::SlotAlreadyExists(key));
        }
        if guard.provider.slots.len() >= MAX_SLOTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many slots on provider"));
        }
        guard.provider.closed_dates.remove(&date);
        guard.provider.open_dates.insert(date);
        guard.provider.upsert_slot(key, Some(capacity));
        info!("provider {provider_id}: opened {date} with slot {key} (capacity {capacity})");
        self.notify.send(provider_id, ScheduleEvent::DateOpened { date });
        self.notify
            .send(provider_id, ScheduleEvent::SlotAdded { slot: key, capacity });
        Ok(key)
    }

    /// Force `date` closed. Drops the date's own slots; returns the dropped keys.
    pub async fn close_date(&self, provider_id: Ulid, date: NaiveDate) -> Result<Vec<SlotKey>, EngineError> {
        ensure_not_past(date)?;
        let mut guard = self.provider_write(provider_id).await?;
        if guard.provider.closed_dates.contains(&date) {
            return Ok(Vec::new());
        }
        let dropped = if guard.provider.open_dates.contains(&date) {
            date_slots_to_drop(&guard, date)?
        } else {
            Vec::new()
        };

        for key in &dropped {
            guard.provider.remove_slot(key);
        }
        guard.provider.open_dates.remove(&date);
        guard.provider.closed_dates.insert(date);

        let stranded = guard.bookings.iter().filter(|b| b.date == Some(date)).count();
        if stranded > 0 {
            warn!("provider {provider_id}: {date} closed with {stranded} bookings still on it");
        }
        info!("provider {provider_id}: closed {date}");
        self.notify.send(provider_id, ScheduleEvent::DateClosed { date });
        Ok(dropped)
    }

    /// Clear an open or closed override on `date`, returning to the weekly
    /// schedule. Returns the date-specific slots that were dropped.
    pub async fn reset_date(&self, provider_id: Ulid, date: NaiveDate) -> Result<Vec<SlotKey>, EngineError> {
        let mut guard = self.provider_write(provider_id).await?;
        let dropped = if guard.provider.open_dates.contains(&date) {
            let dropped = date_slots_to_drop(&guard, date)?;
            for key in &dropped {
                guard.provider.remove_slot(key);
            }
            guard.provider.open_dates.remove(&date);
            dropped
        } else if guard.provider.closed_dates.remove(&date) {
            Vec::new()
        } else {
            return Err(EngineError::DateNotOverridden(date));
        };
        info!("provider {provider_id}: reset {date}");
        self.notify.send(provider_id, ScheduleEvent::DateReset { date });
        Ok(dropped)
    }

    /// Change the capacity of an existing slot. Cannot go below the number
    /// of bookings already referencing the slot.
    pub async fn set_slot_capacity(
        &self,
        provider_id: Ulid,
        key: SlotKey,
        capacity: u32,
    ) -> Result<(), EngineError> {
        validate_capacity(capacity)?;
        let mut guard = self.provider_write(provider_id).await?;
        if !guard.provider.has_slot(&key) {
            return Err(EngineError::SlotNotFound(key));
        }
        let booked = slot_total(&guard.bookings, provider_id, &key);
        if capacity < booked {
            return Err(EngineError::CapacityBelowOccupancy {
                slot: key,
                booked,
                requested: capacity,
            });
        }
        guard.provider.upsert_slot(key, Some(capacity));
        info!("provider {provider_id}: capacity of {key} set to {capacity}");
        self.notify
            .send(provider_id, ScheduleEvent::CapacityChanged { slot: key, capacity });
        Ok(())
    }

    /// Remove a slot nobody is booked into.
    pub async fn remove_slot(&self, provider_id: Ulid, key: SlotKey) -> Result<(), EngineError> {
        let mut guard = self.provider_write(provider_id).await?;
        if !guard.provider.has_slot(&key) {
            return Err(EngineError::SlotNotFound(key));
        }
        let booked = slot_total(&guard.bookings, provider_id, &key);
        if booked > 0 {
            return Err(EngineError::SlotInUse {
                slot: key,
                bookings: booked,
            });
        }
        guard.provider.remove_slot(&key);
        info!("provider {provider_id}: removed slot {key}");
        self.notify.send(provider_id, ScheduleEvent::SlotRemoved { slot: key });
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    fn check_patient(&self, patient: &mut Patient) -> Result<(), EngineError> {
        validate_name(&patient.name)?;
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        let identity = validator.validate_identity(&patient.national_id);
        if !identity.valid {
            return Err(EngineError::InvalidIdentity);
        }
        if !validator.validate_phone(&patient.phone) {
            return Err(EngineError::InvalidPhone);
        }
        patient.gender = identity.gender;
        patient.age = identity.age;
        Ok(())
    }

    /// Validate and commit a new booking, assigning its queue position.
    pub async fn create_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let result = self.create_booking_locked(request).await;
        if let Err(e) = &result {
            observability::record_rejection(e);
            debug!("booking rejected: {e}");
        }
        result
    }

    /// Claim `id` in the booking index and count the patient, refusing
    /// an id already in use anywhere. Caller holds the provider lock; the
    /// detached list is locked here so moves in and out of it cannot interleave.
    async fn reserve_booking(&self, id: Ulid, provider_id: Ulid, national_id: &str) -> Result<(), EngineError> {
        let detached = self.detached.lock().await;
        if detached.iter().any(|b| b.id == id) {
            return Err(EngineError::BookingAlreadyExists(id));
        }
        let Entry::Vacant(slot) = self.booking_index.entry(id) else {
            return Err(EngineError::BookingAlreadyExists(id));
        };
        if !national_id.is_empty() {
            let mut count = self.patients.entry(national_id.to_string()).or_insert(0);
            if self.one_booking_per_patient && *count > 0 {
                return Err(EngineError::PatientAlreadyBooked);
            }
            *count += 1;
        }
        slot.insert(provider_id);
        drop(detached);
        Ok(())
    }

    async fn create_booking_locked(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let BookingRequest {
            id,
            mut patient,
            provider_id,
            slot,
            date,
            description,
        } = request;
        if description.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        self.check_patient(&mut patient)?;

        let mut guard = self.provider_write(provider_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many bookings on provider"));
        }
        if !is_available(&guard.provider, date) {
            return Err(EngineError::DateUnavailable(date));
        }
        if !offers(&guard.provider, &slot, date) {
            return Err(EngineError::SlotNotOffered { slot, date });
        }
        let queue_position = assign_on_create(&guard.bookings, &guard.provider, &slot, date)?;

        let booking = Booking {
            id,
            patient,
            provider_id: Some(provider_id),
            provider_name: guard.provider.name.clone(),
            provider_subject: guard.provider.subject.clone(),
            slot: Some(slot),
            date: Some(date),
            description,
            queue_position,
        };
        self.reserve_booking(id, provider_id, &booking.patient.national_id)
            .await?;
        guard.bookings.push(booking.clone());
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            "booking {id}: {} -> {} {slot} on {date}, queue #{queue_position}",
            booking.patient.name, booking.provider_name
        );
        self.notify.send(
            provider_id,
            ScheduleEvent::BookingCreated {
                id,
                slot,
                date,
                queue_position,
            },
        );
        Ok(booking)
    }

    /// Apply an edit. A changed (provider, slot, date) is re-validated and
    /// gets a fresh queue position; an unchanged one keeps its position;
    /// a cleared one resets it to 0.
    pub async fn update_booking(&self, id: Ulid, edit: BookingEdit) -> Result<Booking, EngineError> {
        let result = self.update_booking_locked(id, edit).await;
        if let Err(e) = &result {
            observability::record_rejection(e);
            debug!("edit of booking {id} rejected: {e}");
        }
        result
    }

    async fn update_booking_locked(&self, id: Ulid, edit: BookingEdit) -> Result<Booking, EngineError> {
        let target = edit.placement();
        let BookingEdit {
            mut patient,
            provider_id,
            slot,
            date,
            description,
        } = edit;
        if let Some(d) = &description
            && d.len() > MAX_DESCRIPTION_LEN
        {
            return Err(EngineError::LimitExceeded("description too long"));
        }
        if let Some(p) = patient.as_mut() {
            self.check_patient(p)?;
        }

        for _ in 0..MAX_MOVE_ATTEMPTS {
            let owner = self.owner_of(id).await?;

            // Provider locks in id order, then the detached list.
            let mut ids: Vec<Ulid> = Vec::with_capacity(2);
            if let Owner::Provider(pid) = owner {
                ids.push(pid);
            }
            if let Some(pid) = provider_id {
                ids.push(pid);
            }
            ids.sort();
            ids.dedup();
            let mut guards: Vec<OwnedRwLockWriteGuard<ProviderState>> = Vec::with_capacity(ids.len());
            for pid in &ids {
                guards.push(self.provider_write(*pid).await?);
            }
            let slot_of = |pid: Ulid| ids.iter().position(|x| *x == pid).unwrap_or(0);
            let mut detached = if owner == Owner::Detached || provider_id.is_none() {
                Some(self.detached.lock().await)
            } else {
                None
            };

            let current = match owner {
                Owner::Provider(pid) => {
                    let g = &guards[slot_of(pid)];
                    g.position_of(id).map(|i| g.bookings[i].clone())
                }
                Owner::Detached => detached
                    .as_ref()
                    .and_then(|d| d.iter().find(|b| b.id == id).cloned()),
            };
            let Some(current) = current else {
                // Moved while we were waiting for the locks.
                continue;
            };

            let target_state = provider_id.map(|pid| &guards[slot_of(pid)]);
            let queue_position = match (target, target_state) {
                (Some(p), Some(_)) if current.placement() == Some(p) && current.queue_position > 0 => {
                    current.queue_position
                }
                (Some(p), Some(state)) => {
                    if !is_available(&state.provider, p.date) {
                        return Err(EngineError::DateUnavailable(p.date));
                    }
                    if !offers(&state.provider, &p.slot, p.date) {
                        return Err(EngineError::SlotNotOffered {
                            slot: p.slot,
                            date: p.date,
                        });
                    }
                    recompute_on_edit(&state.bookings, id, Some((&state.provider, &p.slot, p.date)))?
                }
                _ => recompute_on_edit(&[], id, None)?,
            };

            let mut updated = current.clone();
            if let Some(p) = patient.clone() {
                updated.patient = p;
            }
            if let Some(d) = description.clone() {
                updated.description = d;
            }
            updated.provider_id = provider_id;
            updated.slot = slot;
            updated.date = date;
            match target_state {
                Some(state) => {
                    updated.provider_name = state.provider.name.clone();
                    updated.provider_subject = state.provider.subject.clone();
                }
                None => {
                    updated.provider_name.clear();
                    updated.provider_subject.clear();
                }
            }
            updated.queue_position = queue_position;

            // Same container: replace in place to keep insertion order.
            let same_home = match (owner, provider_id) {
                (Owner::Provider(a), Some(b)) => a == b,
                (Owner::Detached, None) => true,
                _ => false,
            };
            if same_home {
                match owner {
                    Owner::Provider(pid) => {
                        let g = &mut guards[slot_of(pid)];
                        if let Some(i) = g.position_of(id) {
                            g.bookings[i] = updated.clone();
                        }
                    }
                    Owner::Detached => {
                        if let Some(d) = detached.as_mut()
                            && let Some(b) = d.iter_mut().find(|b| b.id == id)
                        {
                            *b = updated.clone();
                        }
                    }
                }
            } else {
                match owner {
                    Owner::Provider(pid) => {
                        let g = &mut guards[slot_of(pid)];
                        g.bookings.retain(|b| b.id != id);
                    }
                    Owner::Detached => {
                        if let Some(d) = detached.as_mut() {
                            d.retain(|b| b.id != id);
                        }
                    }
                }
                match provider_id {
                    Some(pid) => {
                        guards[slot_of(pid)].bookings.push(updated.clone());
                        self.booking_index.insert(id, pid);
                    }
                    None => {
                        if let Some(d) = detached.as_mut() {
                            d.push(updated.clone());
                        }
                        self.booking_index.remove(&id);
                    }
                }
            }
            if updated.patient.national_id != current.patient.national_id {
                self.untrack_patient(&current.patient.national_id);
                self.track_patient(&updated.patient.national_id);
            }
            drop(detached);
            drop(guards);

            match updated.placement() {
                Some(p) => info!(
                    "booking {id} updated: {} on {}, queue #{}",
                    p.slot, p.date, updated.queue_position
                ),
                None => info!("booking {id} updated: unplaced"),
            }
            let event = ScheduleEvent::BookingUpdated {
                id,
                queue_position: updated.queue_position,
            };
            if let Owner::Provider(pid) = owner
                && provider_id != Some(pid)
            {
                self.notify.send(pid, event.clone());
            }
            if let Some(pid) = provider_id {
                self.notify.send(pid, event);
            }
            return Ok(updated);
        }
        Err(EngineError::BookingNotFound(id))
    }

    /// Delete a booking. Remaining queue positions are left as they are.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        for _ in 0..MAX_MOVE_ATTEMPTS {
            let removed = match self.owner_of(id).await? {
                Owner::Provider(pid) => {
                    let mut guard = self.provider_write(pid).await?;
                    let removed = guard.position_of(id).map(|i| guard.bookings.remove(i));
                    if removed.is_some() {
                        self.booking_index.remove(&id);
                        self.notify.send(pid, ScheduleEvent::BookingDeleted { id });
                    }
                    removed
                }
                Owner::Detached => {
                    let mut detached = self.detached.lock().await;
                    detached
                        .iter()
                        .position(|b| b.id == id)
                        .map(|i| detached.remove(i))
                }
            };
            if let Some(booking) = removed {
                self.untrack_patient(&booking.patient.national_id);
                metrics::counter!(observability::BOOKINGS_DELETED_TOTAL).increment(1);
                info!("booking {id} deleted ({})", booking.patient.name);
                return Ok(booking);
            }
        }
        Err(EngineError::BookingNotFound(id))
    }
}
