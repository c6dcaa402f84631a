use chrono::NaiveDate;
use ulid::Ulid;

use crate::slot::{SlotKey, SlotParseError};

#[derive(Debug)]
pub enum EngineError {
    InvalidSlotFormat(String),
    ProviderNotFound(Ulid),
    ProviderAlreadyExists(Ulid),
    BookingNotFound(Ulid),
    BookingAlreadyExists(Ulid),
    SlotNotOffered {
        slot: SlotKey,
        date: NaiveDate,
    },
    DateUnavailable(NaiveDate),
    CapacityExceeded(u32),
    MergeCapacityExceeded {
        booked: u32,
        capacity: u32,
    },
    SlotAlreadyExists(SlotKey),
    SlotNotFound(SlotKey),
    SlotInUse {
        slot: SlotKey,
        bookings: u32,
    },
    CapacityBelowOccupancy {
        slot: SlotKey,
        booked: u32,
        requested: u32,
    },
    ProviderHasBookings(Ulid),
    DateNotOverridden(NaiveDate),
    PastDate(NaiveDate),
    InvalidIdentity,
    InvalidPhone,
    PatientAlreadyBooked,
    LimitExceeded(&'static str),
}

impl EngineError {
    /// Short label for the rejection counter.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidSlotFormat(_) => "invalid_slot_format",
            EngineError::ProviderNotFound(_) => "provider_not_found",
            EngineError::ProviderAlreadyExists(_) => "provider_already_exists",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::BookingAlreadyExists(_) => "booking_already_exists",
            EngineError::SlotNotOffered { .. } => "slot_not_offered",
            EngineError::DateUnavailable(_) => "date_unavailable",
            EngineError::CapacityExceeded(_) => "capacity_exceeded",
            EngineError::MergeCapacityExceeded { .. } => "merge_capacity_exceeded",
            EngineError::SlotAlreadyExists(_) => "slot_already_exists",
            EngineError::SlotNotFound(_) => "slot_not_found",
            EngineError::SlotInUse { .. } => "slot_in_use",
            EngineError::CapacityBelowOccupancy { .. } => "capacity_below_occupancy",
            EngineError::ProviderHasBookings(_) => "provider_has_bookings",
            EngineError::DateNotOverridden(_) => "date_not_overridden",
            EngineError::PastDate(_) => "past_date",
            EngineError::InvalidIdentity => "invalid_identity",
            EngineError::InvalidPhone => "invalid_phone",
            EngineError::PatientAlreadyBooked => "patient_already_booked",
            EngineError::LimitExceeded(_) => "limit_exceeded",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidSlotFormat(e) => write!(f, "{e}"),
            EngineError::ProviderNotFound(id) => write!(f, "provider not found: {id}"),
            EngineError::ProviderAlreadyExists(id) => write!(f, "provider already exists: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::BookingAlreadyExists(id) => write!(f, "booking already exists: {id}"),
            EngineError::SlotNotOffered { slot, date } => {
                write!(f, "slot {slot} is not offered on {date}")
            }
            EngineError::DateUnavailable(date) => write!(f, "provider does not see patients on {date}"),
            EngineError::CapacityExceeded(cap) => {
                write!(f, "capacity {cap} exceeded: all places taken")
            }
            EngineError::MergeCapacityExceeded { booked, capacity } => write!(
                f,
                "merge aborted: {booked} existing bookings exceed merged capacity {capacity}"
            ),
            EngineError::SlotAlreadyExists(slot) => write!(f, "slot already exists: {slot}"),
            EngineError::SlotNotFound(slot) => write!(f, "slot not found: {slot}"),
            EngineError::SlotInUse { slot, bookings } => {
                write!(f, "slot {slot} still has {bookings} bookings")
            }
            EngineError::CapacityBelowOccupancy {
                slot,
                booked,
                requested,
            } => write!(
                f,
                "cannot set capacity of {slot} to {requested}: {booked} already booked"
            ),
            EngineError::ProviderHasBookings(id) => {
                write!(f, "cannot delete provider {id}: has bookings")
            }
            EngineError::DateNotOverridden(date) => {
                write!(f, "{date} is neither a special open nor a closed date")
            }
            EngineError::PastDate(date) => write!(f, "{date} is in the past"),
            EngineError::InvalidIdentity => write!(f, "invalid national id"),
            EngineError::InvalidPhone => write!(f, "invalid phone number"),
            EngineError::PatientAlreadyBooked => {
                write!(f, "a booking for this national id already exists")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<SlotParseError> for EngineError {
    fn from(e: SlotParseError) -> Self {
        EngineError::InvalidSlotFormat(e.to_string())
    }
}
