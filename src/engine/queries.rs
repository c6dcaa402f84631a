use chrono::NaiveDate;
use tokio::sync::OwnedRwLockReadGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::slot::SlotKey;

use super::availability;
use super::conflict::{find_overlaps, propose_merge, MergeProposal};
use super::ledger::{capacity_of, occupancy};
use super::mutations::MAX_MOVE_ATTEMPTS;
use super::{Engine, EngineError, Owner, ProviderState};

impl Engine {
    async fn provider_read(&self, id: Ulid) -> Result<OwnedRwLockReadGuard<ProviderState>, EngineError> {
        let rs = self
            .get_provider_state(&id)
            .ok_or(EngineError::ProviderNotFound(id))?;
        Ok(rs.read_owned().await)
    }

    // ── Providers ────────────────────────────────────────────

    pub async fn get_provider(&self, id: Ulid) -> Result<Provider, EngineError> {
        Ok(self.provider_read(id).await?.provider.clone())
    }

    /// All providers, ordered by id.
    pub async fn list_providers(&self) -> Vec<ProviderInfo> {
        let mut out = Vec::with_capacity(self.state.len());
        for (_, rs) in self.sorted_states() {
            out.push(rs.read().await.provider.info());
        }
        out
    }

    pub async fn providers_by_subject(&self, subject: &str) -> Vec<ProviderInfo> {
        let mut all = self.list_providers().await;
        all.retain(|p| p.subject == subject);
        all
    }

    // ── Availability ─────────────────────────────────────────

    pub async fn is_available(&self, provider_id: Ulid, date: NaiveDate) -> Result<bool, EngineError> {
        let guard = self.provider_read(provider_id).await?;
        Ok(availability::is_available(&guard.provider, date))
    }

    /// Bookable slot keys on `date`; empty when the provider is not available.
    pub async fn available_slots(&self, provider_id: Ulid, date: NaiveDate) -> Result<Vec<SlotKey>, EngineError> {
        let guard = self.provider_read(provider_id).await?;
        if !availability::is_available(&guard.provider, date) {
            return Ok(Vec::new());
        }
        Ok(availability::available_slots(&guard.provider, date))
    }

    pub async fn available_dates(
        &self,
        provider_id: Ulid,
        from: NaiveDate,
        days: u32,
    ) -> Result<Vec<NaiveDate>, EngineError> {
        if days > MAX_DATE_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("date window too wide"));
        }
        let guard = self.provider_read(provider_id).await?;
        Ok(availability::available_dates(&guard.provider, from, days))
    }

    /// Occupancy of every slot bookable on `date`.
    pub async fn slot_board(&self, provider_id: Ulid, date: NaiveDate) -> Result<Vec<SlotOccupancy>, EngineError> {
        let guard = self.provider_read(provider_id).await?;
        if !availability::is_available(&guard.provider, date) {
            return Ok(Vec::new());
        }
        let board = availability::available_slots(&guard.provider, date)
            .into_iter()
            .map(|key| SlotOccupancy {
                key,
                booked: occupancy(&guard.bookings, &Placement::new(provider_id, key, date)),
                capacity: capacity_of(&guard.provider, &key),
            })
            .collect();
        Ok(board)
    }

    /// The merge `add_weekly_slot` would propose for `key`, if any.
    pub async fn preview_slot(
        &self,
        provider_id: Ulid,
        key: &SlotKey,
        capacity: Option<u32>,
    ) -> Result<Option<MergeProposal>, EngineError> {
        let guard = self.provider_read(provider_id).await?;
        let overlaps = find_overlaps(&guard.provider, key);
        if overlaps.is_empty() {
            return Ok(None);
        }
        let capacity = capacity.unwrap_or(DEFAULT_SLOT_CAPACITY);
        Ok(Some(propose_merge(&guard.provider, &overlaps, key, capacity)))
    }

    // ── Bookings ─────────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        for _ in 0..MAX_MOVE_ATTEMPTS {
            let found = match self.owner_of(id).await? {
                Owner::Provider(pid) => {
                    let guard = self.provider_read(pid).await?;
                    guard.position_of(id).map(|i| guard.bookings[i].clone())
                }
                Owner::Detached => self
                    .detached
                    .lock()
                    .await
                    .iter()
                    .find(|b| b.id == id)
                    .cloned(),
            };
            if let Some(booking) = found {
                return Ok(booking);
            }
        }
        Err(EngineError::BookingNotFound(id))
    }

    /// Bookings with this provider, in insertion order.
    pub async fn bookings_for_provider(&self, provider_id: Ulid) -> Result<Vec<Booking>, EngineError> {
        Ok(self.provider_read(provider_id).await?.bookings.clone())
    }

    /// Every booking: per provider in id order, then unplaced ones.
    pub async fn list_bookings(&self) -> Vec<Booking> {
        self.snapshot().await.bookings
    }

    /// Case-insensitive substring search over one field. A blank keyword
    /// matches everything.
    pub async fn search_bookings(&self, field: BookingSearchField, keyword: &str) -> Vec<Booking> {
        let keyword = keyword.trim().to_lowercase();
        let mut all = self.list_bookings().await;
        if keyword.is_empty() {
            return all;
        }
        all.retain(|b| {
            let value = match field {
                BookingSearchField::ProviderName => &b.provider_name,
                BookingSearchField::PatientName => &b.patient.name,
                BookingSearchField::Phone => &b.patient.phone,
            };
            value.to_lowercase().contains(&keyword)
        });
        all
    }
}
