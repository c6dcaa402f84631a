mod availability;
mod conflict;
mod error;
mod ledger;
mod mutations;
mod queries;
mod queue;
#[cfg(test)]
mod tests;

pub use availability::{available_dates, available_slots, is_available, offers};
pub use conflict::{apply_merge, find_overlaps, propose_merge, MergeProposal, MergeSummary};
pub use error::EngineError;
pub use ledger::{capacity_of, has_room, occupancy, occupancy_excluding, slot_total};
pub use mutations::SlotAddOutcome;
pub use queue::{assign_on_create, recompute_on_edit};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

/// A provider together with every booking placed with it.
#[derive(Debug, Clone)]
pub struct ProviderState {
    pub provider: Provider,
    /// Insertion order.
    pub bookings: Vec<Booking>,
}

impl ProviderState {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            bookings: Vec::new(),
        }
    }

    pub(super) fn position_of(&self, booking_id: Ulid) -> Option<usize> {
        self.bookings.iter().position(|b| b.id == booking_id)
    }
}

/// Repository of providers and bookings keyed by stable ids.
///
/// Each provider's state sits behind its own write lock; every
/// check-then-insert, edit recomputation and merge for that provider runs
/// while holding it. Bookings without a known provider are kept in
/// `detached`, always locked after any provider lock.
pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedProviderState>,
    /// Reverse lookup: booking id → provider id
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    pub(super) detached: Mutex<Vec<Booking>>,
    pub notify: Arc<NotifyHub>,
    pub(super) validator: Option<Arc<dyn PatientValidator>>,
    /// National id → number of bookings carrying it.
    pub(super) patients: DashMap<String, u32>,
    /// Refuse a new booking for a national id that already has one.
    pub(super) one_booking_per_patient: bool,
}

/// Where a booking currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Owner {
    Provider(Ulid),
    Detached,
}

impl Engine {
    pub fn new(notify: Arc<NotifyHub>) -> Self {
        Self {
            state: DashMap::new(),
            booking_index: DashMap::new(),
            detached: Mutex::new(Vec::new()),
            notify,
            validator: None,
            patients: DashMap::new(),
            one_booking_per_patient: false,
        }
    }

    /// Install the external identity/phone validator used on booking intake.
    pub fn with_validator(mut self, validator: Arc<dyn PatientValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Allow at most one booking per patient national id.
    pub fn with_one_booking_per_patient(mut self) -> Self {
        self.one_booking_per_patient = true;
        self
    }

    /// Build an engine from loaded records. Duplicate ids are skipped;
    /// bookings naming an unknown provider are kept detached.
    pub fn from_snapshot(snapshot: Snapshot, notify: Arc<NotifyHub>) -> Self {
        let mut engine = Self::new(notify);
        let mut states: HashMap<Ulid, ProviderState> = HashMap::new();

        for provider in snapshot.providers {
            if states.contains_key(&provider.id) {
                warn!("skipping duplicate provider {}", provider.id);
                continue;
            }
            states.insert(provider.id, ProviderState::new(provider));
        }

        let mut detached = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for booking in snapshot.bookings {
            if !seen.insert(booking.id) {
                warn!("skipping duplicate booking {}", booking.id);
                continue;
            }
            engine.track_patient(&booking.patient.national_id);
            match booking.provider_id.and_then(|pid| states.get_mut(&pid)) {
                Some(state) => {
                    engine.booking_index.insert(booking.id, state.provider.id);
                    state.bookings.push(booking);
                }
                None => {
                    if let Some(pid) = booking.provider_id {
                        warn!("booking {} references unknown provider {pid}", booking.id);
                    }
                    detached.push(booking);
                }
            }
        }

        for (id, state) in states {
            engine.state.insert(id, Arc::new(RwLock::new(state)));
        }
        // Sole owner; nothing else can hold this mutex yet.
        *engine.detached.get_mut() = detached;
        metrics::gauge!(crate::observability::PROVIDERS_ACTIVE).set(engine.state.len() as f64);
        engine
    }

    /// Copy out every provider and booking for persistence.
    pub async fn snapshot(&self) -> Snapshot {
        let mut providers = Vec::new();
        let mut bookings = Vec::new();
        for (_, rs) in self.sorted_states() {
            let guard = rs.read().await;
            providers.push(guard.provider.clone());
            bookings.extend(guard.bookings.iter().cloned());
        }
        bookings.extend(self.detached.lock().await.iter().cloned());
        Snapshot {
            providers,
            bookings,
        }
    }

    pub fn provider_count(&self) -> usize {
        self.state.len()
    }

    pub fn get_provider_state(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    /// Lookup provider, acquire its write lock.
    pub(super) async fn provider_write(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let rs = self
            .get_provider_state(&id)
            .ok_or(EngineError::ProviderNotFound(id))?;
        let guard = rs.clone().write_owned().await;
        // Deleted (and possibly re-created) while we waited.
        let current = self.state.get(&id).map(|e| Arc::ptr_eq(e.value(), &rs));
        if current != Some(true) {
            return Err(EngineError::ProviderNotFound(id));
        }
        Ok(guard)
    }

    pub(super) fn track_patient(&self, national_id: &str) {
        if national_id.is_empty() {
            return;
        }
        *self.patients.entry(national_id.to_string()).or_insert(0) += 1;
    }

    pub(super) fn untrack_patient(&self, national_id: &str) {
        if let Some(mut count) = self.patients.get_mut(national_id) {
            *count = count.saturating_sub(1);
        }
        self.patients.remove_if(national_id, |_, count| *count == 0);
    }

    /// Current owner of a booking according to the index. Callers must
    /// re-check after locking; the booking may move in between.
    pub(super) async fn owner_of(&self, booking_id: Ulid) -> Result<Owner, EngineError> {
        if let Some(pid) = self.booking_index.get(&booking_id).map(|e| *e.value()) {
            return Ok(Owner::Provider(pid));
        }
        if self.detached.lock().await.iter().any(|b| b.id == booking_id) {
            return Ok(Owner::Detached);
        }
        Err(EngineError::BookingNotFound(booking_id))
    }

    /// All provider states ordered by id (the lock acquisition order).
    pub(super) fn sorted_states(&self) -> Vec<(Ulid, SharedProviderState)> {
        let mut all: Vec<(Ulid, SharedProviderState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }
}

pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}
