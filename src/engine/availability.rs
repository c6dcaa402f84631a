use chrono::{Days, NaiveDate};

use crate::model::Provider;
use crate::slot::SlotKey;

// ── Availability resolution ───────────────────────────────────────

/// Whether the provider sees patients on `date`.
///
/// Closed overrides win over everything, open overrides win over the
/// weekly schedule (even when no slot is defined for that date), and
/// otherwise the date is open iff some weekly slot falls on its weekday.
pub fn is_available(provider: &Provider, date: NaiveDate) -> bool {
    if provider.closed_dates.contains(&date) {
        return false;
    }
    if provider.open_dates.contains(&date) {
        return true;
    }
    provider.slot_keys().any(|k| k.is_weekly_for(date))
}

/// Slots that apply on `date`, in the provider's slot order.
///
/// On an open override date the date-specific slots are used; if none were
/// defined the regular weekly schedule for that weekday is inherited.
/// Closed dates are not filtered here; callers check `is_available` first.
pub fn available_slots(provider: &Provider, date: NaiveDate) -> Vec<SlotKey> {
    if provider.open_dates.contains(&date) {
        let own: Vec<SlotKey> = provider
            .slot_keys()
            .filter(|k| k.is_override_for(date))
            .copied()
            .collect();
        if !own.is_empty() {
            return own;
        }
    }
    provider
        .slot_keys()
        .filter(|k| k.is_weekly_for(date))
        .copied()
        .collect()
}

/// True if `slot` is one of the slots resolved for `date`.
pub fn offers(provider: &Provider, slot: &SlotKey, date: NaiveDate) -> bool {
    available_slots(provider, date).contains(slot)
}

/// Dates in `[from, from + days)` on which the provider is available.
pub fn available_dates(provider: &Provider, from: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..days)
        .filter_map(|i| from.checked_add_days(Days::new(u64::from(i))))
        .filter(|d| is_available(provider, *d))
        .collect()
}
