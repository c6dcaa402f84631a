use std::collections::BTreeSet;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::DEFAULT_SLOT_CAPACITY;
use crate::slot::SlotKey;

/// A slot a provider offers, with its optional per-slot capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSlot {
    pub key: SlotKey,
    /// `None` falls back to `DEFAULT_SLOT_CAPACITY`.
    #[serde(default)]
    pub capacity: Option<u32>,
}

impl ProviderSlot {
    pub fn new(key: SlotKey, capacity: Option<u32>) -> Self {
        Self { key, capacity }
    }

    pub fn resolved_capacity(&self) -> u32 {
        self.capacity.unwrap_or(DEFAULT_SLOT_CAPACITY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: Ulid,
    pub name: String,
    /// Department.
    pub subject: String,
    #[serde(default)]
    pub title: String,
    /// Weekly and date-override slots, in insertion order.
    #[serde(default)]
    pub slots: Vec<ProviderSlot>,
    /// Dates forced open regardless of weekday.
    #[serde(default)]
    pub open_dates: BTreeSet<NaiveDate>,
    /// Dates forced closed regardless of weekday. Disjoint from `open_dates`.
    #[serde(default)]
    pub closed_dates: BTreeSet<NaiveDate>,
}

impl Provider {
    pub fn new(id: Ulid, name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            subject: subject.into(),
            title: String::new(),
            slots: Vec::new(),
            open_dates: BTreeSet::new(),
            closed_dates: BTreeSet::new(),
        }
    }

    pub fn slot(&self, key: &SlotKey) -> Option<&ProviderSlot> {
        self.slots.iter().find(|s| s.key == *key)
    }

    pub fn has_slot(&self, key: &SlotKey) -> bool {
        self.slot(key).is_some()
    }

    pub fn slot_keys(&self) -> impl Iterator<Item = &SlotKey> {
        self.slots.iter().map(|s| &s.key)
    }

    /// Insert or replace the capacity of `key`; appends the slot if new.
    pub fn upsert_slot(&mut self, key: SlotKey, capacity: Option<u32>) {
        match self.slots.iter_mut().find(|s| s.key == key) {
            Some(existing) => existing.capacity = capacity,
            None => self.slots.push(ProviderSlot::new(key, capacity)),
        }
    }

    pub fn remove_slot(&mut self, key: &SlotKey) -> Option<ProviderSlot> {
        let pos = self.slots.iter().position(|s| s.key == *key)?;
        Some(self.slots.remove(pos))
    }

    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id,
            name: self.name.clone(),
            subject: self.subject.clone(),
            title: self.title.clone(),
            slot_count: self.slots.len(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patient {
    pub name: String,
    pub national_id: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub age: u32,
}

/// The (provider, slot, date) tuple capacity and queue positions are counted over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placement {
    pub provider_id: Ulid,
    pub slot: SlotKey,
    pub date: NaiveDate,
}

impl Placement {
    pub fn new(provider_id: Ulid, slot: SlotKey, date: NaiveDate) -> Self {
        Self {
            provider_id,
            slot,
            date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub patient: Patient,
    #[serde(default)]
    pub provider_id: Option<Ulid>,
    #[serde(default)]
    pub provider_name: String,
    #[serde(default)]
    pub provider_subject: String,
    #[serde(default)]
    pub slot: Option<SlotKey>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub description: String,
    /// 1-based rank within the placement; 0 = unassigned.
    #[serde(default)]
    pub queue_position: u32,
}

impl Booking {
    /// `None` when any of provider, slot or date is cleared.
    pub fn placement(&self) -> Option<Placement> {
        Some(Placement::new(self.provider_id?, self.slot?, self.date?))
    }

    pub fn is_at(&self, placement: &Placement) -> bool {
        self.provider_id == Some(placement.provider_id)
            && self.slot == Some(placement.slot)
            && self.date == Some(placement.date)
    }
}

/// Input for `Engine::create_booking`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub patient: Patient,
    pub provider_id: Ulid,
    pub slot: SlotKey,
    pub date: NaiveDate,
    pub description: String,
}

/// Full replacement values for an edited booking. Clearing any of
/// provider, slot or date unassigns its queue position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingEdit {
    pub patient: Option<Patient>,
    pub provider_id: Option<Ulid>,
    pub slot: Option<SlotKey>,
    pub date: Option<NaiveDate>,
    pub description: Option<String>,
}

impl BookingEdit {
    /// Start from the booking's current values.
    pub fn from_booking(booking: &Booking) -> Self {
        Self {
            patient: None,
            provider_id: booking.provider_id,
            slot: booking.slot,
            date: booking.date,
            description: None,
        }
    }

    pub fn placement(&self) -> Option<Placement> {
        Some(Placement::new(self.provider_id?, self.slot?, self.date?))
    }
}

/// Result of the external identity validator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityCheck {
    pub valid: bool,
    pub gender: String,
    pub age: u32,
}

/// Identity and phone validation supplied by the embedding application.
pub trait PatientValidator: Send + Sync {
    fn validate_identity(&self, national_id: &str) -> IdentityCheck;
    fn validate_phone(&self, phone: &str) -> bool;
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: String,
    pub subject: String,
    pub title: String,
    pub slot_count: usize,
}

/// Booking field matched by `Engine::search_bookings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingSearchField {
    ProviderName,
    PatientName,
    Phone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotOccupancy {
    pub key: SlotKey,
    pub booked: u32,
    pub capacity: u32,
}

impl SlotOccupancy {
    pub fn is_full(&self) -> bool {
        self.booked >= self.capacity
    }
}

/// Everything the persistence layer loads and saves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub providers: Vec<Provider>,
    pub bookings: Vec<Booking>,
}
