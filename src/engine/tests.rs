use std::sync::Arc;

use chrono::{Datelike, Days, NaiveDate, Weekday};

use super::*;
use crate::limits::*;
use crate::notify::{NotifyHub, ScheduleEvent};
use crate::slot::{SlotKey, TimeRange};

fn key(s: &str) -> SlotKey {
    s.parse().unwrap()
}

fn range(s: &str) -> TimeRange {
    s.parse().unwrap()
}

fn new_engine() -> Engine {
    Engine::new(Arc::new(NotifyHub::new()))
}

/// First `weekday` at least a week ahead of today.
fn upcoming(weekday: Weekday) -> NaiveDate {
    let mut d = today() + Days::new(7);
    while d.weekday() != weekday {
        d = d + Days::new(1);
    }
    d
}

fn patient(name: &str) -> Patient {
    Patient {
        name: name.into(),
        national_id: "110101199001011234".into(),
        phone: "13800138000".into(),
        ..Default::default()
    }
}

fn request(provider_id: Ulid, slot: &str, date: NaiveDate) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        patient: patient("Zhang San"),
        provider_id,
        slot: key(slot),
        date,
        description: String::new(),
    }
}

/// Provider with the given weekly slots and capacities.
async fn provider_with(engine: &Engine, name: &str, slots: &[(&str, u32)]) -> Ulid {
    let id = Ulid::new();
    engine
        .create_provider(id, name.into(), "Cardiology".into(), "Chief Physician".into())
        .await
        .unwrap();
    for (k, cap) in slots {
        let outcome = engine
            .add_weekly_slot(id, key(k), Some(*cap), |_| false)
            .await
            .unwrap();
        assert!(matches!(outcome, SlotAddOutcome::Added { .. }));
    }
    id
}

// ── Booking intake ───────────────────────────────────────

#[tokio::test]
async fn engine_capacity_caps_bookings_per_slot_and_date() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let wed = upcoming(Weekday::Wed);

    let b1 = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    let b2 = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    assert_eq!(b1.queue_position, 1);
    assert_eq!(b2.queue_position, 2);
    assert_eq!(b1.provider_name, "Dr. Li");

    let err = engine
        .create_booking(request(li, "周三：09:00-10:00", wed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(2)));

    // Same slot, the following week, is a separate tuple.
    let next = wed + Days::new(7);
    let b3 = engine.create_booking(request(li, "周三：09:00-10:00", next)).await.unwrap();
    assert_eq!(b3.queue_position, 1);
}

#[tokio::test]
async fn engine_rejects_unavailable_date_and_foreign_slot() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;

    let thu = upcoming(Weekday::Thu);
    let err = engine
        .create_booking(request(li, "周三：09:00-10:00", thu))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DateUnavailable(d) if d == thu));

    let wed = upcoming(Weekday::Wed);
    let err = engine
        .create_booking(request(li, "周三：14:00-15:00", wed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotNotOffered { .. }));

    let err = engine
        .create_booking(request(Ulid::new(), "周三：09:00-10:00", wed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProviderNotFound(_)));
}

#[tokio::test]
async fn engine_duplicate_ids_rejected() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let err = engine
        .create_provider(li, "Dr. Li".into(), "Cardiology".into(), String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProviderAlreadyExists(id) if id == li));

    let wed = upcoming(Weekday::Wed);
    let req = request(li, "周三：09:00-10:00", wed);
    engine.create_booking(req.clone()).await.unwrap();
    let err = engine.create_booking(req).await.unwrap_err();
    assert!(matches!(err, EngineError::BookingAlreadyExists(_)));
}

struct FakeValidator;

impl PatientValidator for FakeValidator {
    fn validate_identity(&self, national_id: &str) -> IdentityCheck {
        IdentityCheck {
            valid: national_id.len() == 18,
            gender: "女".into(),
            age: 34,
        }
    }

    fn validate_phone(&self, phone: &str) -> bool {
        phone.len() == 11 && phone.starts_with('1')
    }
}

#[tokio::test]
async fn engine_validator_checks_and_fills_patient() {
    let engine = new_engine().with_validator(Arc::new(FakeValidator));
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 5)]).await;
    let wed = upcoming(Weekday::Wed);

    let mut bad_id = request(li, "周三：09:00-10:00", wed);
    bad_id.patient.national_id = "123".into();
    assert!(matches!(
        engine.create_booking(bad_id).await.unwrap_err(),
        EngineError::InvalidIdentity
    ));

    let mut bad_phone = request(li, "周三：09:00-10:00", wed);
    bad_phone.patient.phone = "555-0100".into();
    assert!(matches!(
        engine.create_booking(bad_phone).await.unwrap_err(),
        EngineError::InvalidPhone
    ));

    let ok = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    assert_eq!(ok.patient.gender, "女");
    assert_eq!(ok.patient.age, 34);
    // Rejections never took a place in the queue.
    assert_eq!(ok.queue_position, 1);
}

#[tokio::test]
async fn engine_concurrent_bookings_never_overbook() {
    let engine = Arc::new(new_engine());
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 5)]).await;
    let wed = upcoming(Weekday::Wed);

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.create_booking(request(li, "周三：09:00-10:00", wed)).await })
        })
        .collect();
    let results = futures::future::join_all(tasks).await;

    let mut positions: Vec<u32> = results
        .into_iter()
        .filter_map(|r| r.unwrap().ok())
        .map(|b| b.queue_position)
        .collect();
    positions.sort();
    assert_eq!(positions, vec![1, 2, 3, 4, 5]);
    assert_eq!(engine.bookings_for_provider(li).await.unwrap().len(), 5);
}

// ── Edits and deletes ────────────────────────────────────

#[tokio::test]
async fn engine_edit_keeps_position_unless_placement_changes() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 3)]).await;
    let wed = upcoming(Weekday::Wed);
    let b1 = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    let b2 = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();

    let mut edit = BookingEdit::from_booking(&b1);
    edit.description = Some("follow-up".into());
    let b1 = engine.update_booking(b1.id, edit).await.unwrap();
    assert_eq!(b1.queue_position, 1);
    assert_eq!(b1.description, "follow-up");

    // Moving to the next week starts a fresh queue there.
    let mut edit = BookingEdit::from_booking(&b2);
    edit.date = Some(wed + Days::new(7));
    let b2 = engine.update_booking(b2.id, edit).await.unwrap();
    assert_eq!(b2.queue_position, 1);

    // Moving back counts only the others already in the tuple.
    let mut edit = BookingEdit::from_booking(&b2);
    edit.date = Some(wed);
    let b2 = engine.update_booking(b2.id, edit).await.unwrap();
    assert_eq!(b2.queue_position, 2);
}

#[tokio::test]
async fn engine_edit_into_full_slot_is_rejected() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 1)]).await;
    let wed = upcoming(Weekday::Wed);
    let next = wed + Days::new(7);
    engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    let b2 = engine.create_booking(request(li, "周三：09:00-10:00", next)).await.unwrap();

    let mut edit = BookingEdit::from_booking(&b2);
    edit.date = Some(wed);
    let err = engine.update_booking(b2.id, edit).await.unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(1)));
    assert_eq!(engine.get_booking(b2.id).await.unwrap(), b2);
}

#[tokio::test]
async fn engine_cleared_placement_unassigns_and_detaches() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 3)]).await;
    let wed = upcoming(Weekday::Wed);
    let b = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();

    let mut edit = BookingEdit::from_booking(&b);
    edit.slot = None;
    let cleared = engine.update_booking(b.id, edit).await.unwrap();
    assert_eq!(cleared.queue_position, 0);
    assert_eq!(engine.bookings_for_provider(li).await.unwrap(), vec![cleared.clone()]);

    // Without a provider it is kept apart from every provider.
    let mut edit = BookingEdit::from_booking(&cleared);
    edit.provider_id = None;
    let cleared = engine.update_booking(b.id, edit).await.unwrap();
    assert_eq!(cleared.provider_name, "");
    assert!(engine.bookings_for_provider(li).await.unwrap().is_empty());
    assert_eq!(engine.list_bookings().await, vec![cleared.clone()]);

    let mut edit = BookingEdit::from_booking(&cleared);
    edit.provider_id = Some(li);
    edit.slot = Some(key("周三：09:00-10:00"));
    let placed = engine.update_booking(b.id, edit).await.unwrap();
    assert_eq!(placed.queue_position, 1);
    assert_eq!(placed.provider_name, "Dr. Li");
    assert_eq!(engine.bookings_for_provider(li).await.unwrap().len(), 1);
}

#[tokio::test]
async fn engine_edit_moves_booking_between_providers() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let wang = provider_with(&engine, "Dr. Wang", &[("周三：10:00-11:00", 2)]).await;
    let wed = upcoming(Weekday::Wed);
    let b = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();

    // Wang does not offer Li's slot.
    let mut edit = BookingEdit::from_booking(&b);
    edit.provider_id = Some(wang);
    let err = engine.update_booking(b.id, edit.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotNotOffered { .. }));

    edit.slot = Some(key("周三：10:00-11:00"));
    let moved = engine.update_booking(b.id, edit).await.unwrap();
    assert_eq!(moved.provider_name, "Dr. Wang");
    assert_eq!(moved.queue_position, 1);
    assert!(engine.bookings_for_provider(li).await.unwrap().is_empty());
    assert_eq!(engine.bookings_for_provider(wang).await.unwrap(), vec![moved]);

    engine.delete_provider(li).await.unwrap();
    assert!(matches!(
        engine.delete_provider(wang).await.unwrap_err(),
        EngineError::ProviderHasBookings(_)
    ));
}

#[tokio::test]
async fn engine_delete_leaves_positions_gapped() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 3)]).await;
    let wed = upcoming(Weekday::Wed);
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap().id);
    }

    let removed = engine.delete_booking(ids[1]).await.unwrap();
    assert_eq!(removed.queue_position, 2);
    assert!(matches!(
        engine.delete_booking(ids[1]).await.unwrap_err(),
        EngineError::BookingNotFound(_)
    ));

    let positions: Vec<u32> = engine
        .bookings_for_provider(li)
        .await
        .unwrap()
        .iter()
        .map(|b| b.queue_position)
        .collect();
    assert_eq!(positions, vec![1, 3]);

    // Count + 1 over the survivors.
    let b = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    assert_eq!(b.queue_position, 3);
}

// ── Schedule editing ─────────────────────────────────────

#[tokio::test]
async fn engine_add_weekly_slot_guards() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周一：09:00-10:00", 2)]).await;

    let err = engine
        .add_weekly_slot(li, key("周一：09:00-10:00"), None, |_| true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotAlreadyExists(_)));

    let err = engine
        .add_weekly_slot(li, key("05-01：09:00-10:00"), None, |_| true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidSlotFormat(_)));

    let err = engine
        .add_weekly_slot(li, key("周二：09:00-10:00"), Some(0), |_| true)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));

    let outcome = engine
        .add_weekly_slot(li, key("周二：09:00-10:00"), None, |_| panic!("no overlap expected"))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SlotAddOutcome::Added {
            slot: key("周二：09:00-10:00"),
            capacity: NEW_SLOT_DEFAULT_CAPACITY
        }
    );
}

#[tokio::test]
async fn engine_merge_rewrites_bookings() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周一：09:00-10:00", 2)]).await;
    let mon = upcoming(Weekday::Mon);
    let b = engine.create_booking(request(li, "周一：09:00-10:00", mon)).await.unwrap();

    let preview = engine
        .preview_slot(li, &key("周一：09:30-11:00"), Some(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.merged_key, key("周一：09:00-11:00"));

    let outcome = engine
        .add_weekly_slot(li, key("周一：09:30-11:00"), Some(3), |p| {
            assert_eq!(p.overlaps, vec![key("周一：09:00-10:00")]);
            true
        })
        .await
        .unwrap();
    let SlotAddOutcome::Merged(summary) = outcome else {
        panic!("expected a merge");
    };
    assert_eq!(summary.merged_key, key("周一：09:00-11:00"));
    assert_eq!(summary.capacity, 3);
    assert_eq!(summary.rewritten, 1);

    let provider = engine.get_provider(li).await.unwrap();
    let keys: Vec<SlotKey> = provider.slot_keys().copied().collect();
    assert_eq!(keys, vec![key("周一：09:00-11:00")]);
    let b = engine.get_booking(b.id).await.unwrap();
    assert_eq!(b.slot, Some(key("周一：09:00-11:00")));
    assert_eq!(b.queue_position, 1);
}

#[tokio::test]
async fn engine_declined_merge_changes_nothing() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周一：09:00-10:00", 2)]).await;
    let before = engine.get_provider(li).await.unwrap();

    let outcome = engine
        .add_weekly_slot(li, key("周一：09:30-11:00"), None, |_| false)
        .await
        .unwrap();
    assert!(matches!(outcome, SlotAddOutcome::Declined(ref p) if p.merged_capacity == 2));
    assert_eq!(engine.get_provider(li).await.unwrap(), before);
}

#[tokio::test]
async fn engine_merge_without_capacity_keeps_widest_existing() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周一：11:00-13:00", 2)]).await;

    let outcome = engine
        .add_weekly_slot(li, key("周一：09:00-12:00"), None, |_| true)
        .await
        .unwrap();
    let SlotAddOutcome::Merged(summary) = outcome else {
        panic!("expected a merge");
    };
    assert_eq!(summary.merged_key, key("周一：09:00-13:00"));
    assert_eq!(summary.capacity, 2);

    let preview = engine
        .preview_slot(li, &key("周一：12:30-14:00"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(preview.merged_capacity, 2);
}

#[tokio::test]
async fn engine_merge_counts_bookings_across_all_dates() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周一：09:00-10:00", 1)]).await;
    let mon = upcoming(Weekday::Mon);
    engine.create_booking(request(li, "周一：09:00-10:00", mon)).await.unwrap();
    engine
        .create_booking(request(li, "周一：09:00-10:00", mon + Days::new(7)))
        .await
        .unwrap();
    let before = engine.get_provider(li).await.unwrap();

    let err = engine
        .add_weekly_slot(li, key("周一：09:30-10:30"), Some(1), |_| true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::MergeCapacityExceeded {
            booked: 2,
            capacity: 1
        }
    ));
    assert_eq!(engine.get_provider(li).await.unwrap(), before);
}

#[tokio::test]
async fn engine_capacity_change_and_removal_guards() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let wed = upcoming(Weekday::Wed);
    let slot = key("周三：09:00-10:00");
    engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    let b2 = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();

    let err = engine.set_slot_capacity(li, slot, 1).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::CapacityBelowOccupancy {
            booked: 2,
            requested: 1,
            ..
        }
    ));
    assert!(matches!(
        engine.set_slot_capacity(li, slot, MAX_SLOT_CAPACITY + 1).await.unwrap_err(),
        EngineError::LimitExceeded(_)
    ));
    engine.set_slot_capacity(li, slot, 4).await.unwrap();
    let b3 = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    assert_eq!(b3.queue_position, 3);

    assert!(matches!(
        engine.remove_slot(li, slot).await.unwrap_err(),
        EngineError::SlotInUse { bookings: 3, .. }
    ));
    assert!(matches!(
        engine.remove_slot(li, key("周五：09:00-10:00")).await.unwrap_err(),
        EngineError::SlotNotFound(_)
    ));

    for b in engine.bookings_for_provider(li).await.unwrap() {
        engine.delete_booking(b.id).await.unwrap();
    }
    assert!(engine.get_booking(b2.id).await.is_err());
    engine.remove_slot(li, slot).await.unwrap();
    assert!(!engine.is_available(li, wed).await.unwrap());
}

#[tokio::test]
async fn engine_open_and_close_special_date() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let thu = upcoming(Weekday::Thu);
    assert!(!engine.is_available(li, thu).await.unwrap());

    let special = engine
        .open_date(li, thu, range("14:00-16:00"), Some(3))
        .await
        .unwrap();
    assert_eq!(special, SlotKey::for_date(thu, range("14:00-16:00")));
    assert!(engine.is_available(li, thu).await.unwrap());
    assert_eq!(engine.available_slots(li, thu).await.unwrap(), vec![special]);

    let b = engine
        .create_booking(BookingRequest {
            slot: special,
            ..request(li, "周三：09:00-10:00", thu)
        })
        .await
        .unwrap();
    let board = engine.slot_board(li, thu).await.unwrap();
    assert_eq!(
        board,
        vec![SlotOccupancy {
            key: special,
            booked: 1,
            capacity: 3
        }]
    );

    assert!(matches!(
        engine.close_date(li, thu).await.unwrap_err(),
        EngineError::SlotInUse { bookings: 1, .. }
    ));
    engine.delete_booking(b.id).await.unwrap();
    assert_eq!(engine.close_date(li, thu).await.unwrap(), vec![special]);
    assert!(!engine.is_available(li, thu).await.unwrap());
    assert!(engine.available_slots(li, thu).await.unwrap().is_empty());
    assert!(!engine.get_provider(li).await.unwrap().has_slot(&special));
}

#[tokio::test]
async fn engine_reset_returns_to_weekly_schedule() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let wed = upcoming(Weekday::Wed);

    engine.close_date(li, wed).await.unwrap();
    assert!(!engine.is_available(li, wed).await.unwrap());
    assert!(engine.slot_board(li, wed).await.unwrap().is_empty());

    assert!(engine.reset_date(li, wed).await.unwrap().is_empty());
    assert!(engine.is_available(li, wed).await.unwrap());
    assert!(matches!(
        engine.reset_date(li, wed).await.unwrap_err(),
        EngineError::DateNotOverridden(_)
    ));

    // Open a weekly day with its own hours, then reset back.
    let special = engine.open_date(li, wed, range("13:00-14:00"), None).await.unwrap();
    assert_eq!(engine.available_slots(li, wed).await.unwrap(), vec![special]);
    assert_eq!(engine.reset_date(li, wed).await.unwrap(), vec![special]);
    assert_eq!(
        engine.available_slots(li, wed).await.unwrap(),
        vec![key("周三：09:00-10:00")]
    );
}

#[tokio::test]
async fn engine_past_dates_cannot_be_overridden() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[]).await;
    let yesterday = today() - Days::new(1);
    assert!(matches!(
        engine.open_date(li, yesterday, range("09:00-10:00"), None).await.unwrap_err(),
        EngineError::PastDate(_)
    ));
    assert!(matches!(
        engine.close_date(li, yesterday).await.unwrap_err(),
        EngineError::PastDate(_)
    ));
}

#[tokio::test]
async fn engine_date_slots_survive_while_month_day_is_shared() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[]).await;
    let mut d1 = upcoming(Weekday::Thu);
    while d1.with_year(d1.year() + 1).is_none() {
        d1 = d1 + Days::new(7);
    }
    let d2 = d1.with_year(d1.year() + 1).unwrap();

    let k1 = engine.open_date(li, d1, range("09:00-10:00"), None).await.unwrap();
    let k2 = engine.open_date(li, d2, range("14:00-15:00"), None).await.unwrap();

    assert!(engine.close_date(li, d1).await.unwrap().is_empty());
    assert_eq!(engine.available_slots(li, d2).await.unwrap(), vec![k1, k2]);
}

#[tokio::test]
async fn engine_available_dates_window() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let from = upcoming(Weekday::Mon);
    let dates = engine.available_dates(li, from, 14).await.unwrap();
    assert_eq!(dates, vec![from + Days::new(2), from + Days::new(9)]);
    assert!(matches!(
        engine.available_dates(li, from, MAX_DATE_WINDOW_DAYS + 1).await.unwrap_err(),
        EngineError::LimitExceeded(_)
    ));
}

// ── Providers ────────────────────────────────────────────

#[tokio::test]
async fn engine_provider_rename_refreshes_booking_copies() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let wang = provider_with(&engine, "Dr. Wang", &[]).await;
    let wed = upcoming(Weekday::Wed);
    let b = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();

    engine
        .update_provider_info(li, "Dr. Li Wei".into(), "Neurology".into(), "Attending".into())
        .await
        .unwrap();
    let b = engine.get_booking(b.id).await.unwrap();
    assert_eq!(b.provider_name, "Dr. Li Wei");
    assert_eq!(b.provider_subject, "Neurology");

    let neuro = engine.providers_by_subject("Neurology").await;
    assert_eq!(neuro.len(), 1);
    assert_eq!(neuro[0].id, li);
    assert_eq!(engine.list_providers().await.len(), 2);

    engine.delete_provider(wang).await.unwrap();
    assert!(matches!(
        engine.get_provider(wang).await.unwrap_err(),
        EngineError::ProviderNotFound(_)
    ));
    assert_eq!(engine.provider_count(), 1);
}

#[tokio::test]
async fn engine_publishes_schedule_events() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let mut rx = engine.notify.subscribe(li);
    let wed = upcoming(Weekday::Wed);

    let b = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    assert_eq!(
        rx.recv().await.unwrap(),
        ScheduleEvent::BookingCreated {
            id: b.id,
            slot: key("周三：09:00-10:00"),
            date: wed,
            queue_position: 1
        }
    );

    engine.delete_booking(b.id).await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), ScheduleEvent::BookingDeleted { id: b.id });
}

// ── Snapshots ────────────────────────────────────────────

#[tokio::test]
async fn engine_snapshot_roundtrip() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let wed = upcoming(Weekday::Wed);
    engine.open_date(li, upcoming(Weekday::Sat), range("08:00-12:00"), None).await.unwrap();
    engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();

    let snapshot = engine.snapshot().await;
    let restored = Engine::from_snapshot(snapshot.clone(), Arc::new(NotifyHub::new()));
    assert_eq!(restored.snapshot().await, snapshot);

    // Restored engine keeps enforcing capacity.
    let err = restored
        .create_booking(request(li, "周三：09:00-10:00", wed))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapacityExceeded(2)));
}

#[tokio::test]
async fn engine_snapshot_keeps_orphaned_bookings() {
    let ghost = Ulid::new();
    let wed = upcoming(Weekday::Wed);
    let orphan = Booking {
        id: Ulid::new(),
        patient: patient("Li Si"),
        provider_id: Some(ghost),
        provider_name: "Dr. Gone".into(),
        provider_subject: "Surgery".into(),
        slot: Some(key("周三：09:00-10:00")),
        date: Some(wed),
        description: String::new(),
        queue_position: 4,
    };
    let snapshot = Snapshot {
        providers: Vec::new(),
        bookings: vec![orphan.clone(), orphan.clone()],
    };
    let engine = Engine::from_snapshot(snapshot, Arc::new(NotifyHub::new()));

    assert_eq!(engine.get_booking(orphan.id).await.unwrap(), orphan);
    assert_eq!(engine.list_bookings().await, vec![orphan.clone()]);
    engine.delete_booking(orphan.id).await.unwrap();
    assert!(engine.list_bookings().await.is_empty());
}

// ── Identity and uniqueness ──────────────────────────────

#[tokio::test]
async fn engine_booking_id_is_unique_across_detached_bookings() {
    let li = Ulid::new();
    let mut provider = Provider::new(li, "Dr. Li", "Cardiology");
    provider.upsert_slot(key("周三：09:00-10:00"), Some(2));
    let unplaced = Booking {
        id: Ulid::new(),
        patient: patient("Li Si"),
        provider_id: None,
        provider_name: String::new(),
        provider_subject: String::new(),
        slot: None,
        date: None,
        description: String::new(),
        queue_position: 0,
    };
    let snapshot = Snapshot {
        providers: vec![provider],
        bookings: vec![unplaced.clone()],
    };
    let engine = Engine::from_snapshot(snapshot, Arc::new(NotifyHub::new()));

    let mut req = request(li, "周三：09:00-10:00", upcoming(Weekday::Wed));
    req.id = unplaced.id;
    let err = engine.create_booking(req).await.unwrap_err();
    assert!(matches!(err, EngineError::BookingAlreadyExists(id) if id == unplaced.id));
    assert_eq!(engine.list_bookings().await, vec![unplaced]);
    assert!(engine.bookings_for_provider(li).await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_concurrent_creates_with_same_id_keep_one() {
    let engine = Arc::new(new_engine());
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 5)]).await;
    let wang = provider_with(&engine, "Dr. Wang", &[("周三：09:00-10:00", 5)]).await;
    let wed = upcoming(Weekday::Wed);
    let id = Ulid::new();

    let tasks: Vec<_> = [li, wang, li, wang]
        .into_iter()
        .map(|pid| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut req = request(pid, "周三：09:00-10:00", wed);
                req.id = id;
                engine.create_booking(req).await
            })
        })
        .collect();
    let results = futures::future::join_all(tasks).await;

    let created = results.iter().filter(|r| r.as_ref().unwrap().is_ok()).count();
    assert_eq!(created, 1);
    assert_eq!(engine.list_bookings().await.len(), 1);
    assert!(engine.get_booking(id).await.is_ok());
}

#[tokio::test]
async fn engine_one_booking_per_national_id_when_enabled() {
    let engine = new_engine().with_one_booking_per_patient();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 5)]).await;
    let wed = upcoming(Weekday::Wed);

    let first = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    let err = engine
        .create_booking(request(li, "周三：09:00-10:00", wed + Days::new(7)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PatientAlreadyBooked));

    let mut other = request(li, "周三：09:00-10:00", wed);
    other.patient.national_id = "110101199202025678".into();
    let other = engine.create_booking(other).await.unwrap();
    assert_eq!(other.queue_position, 2);

    // Correcting the id on an existing booking releases the old one.
    let mut edit = BookingEdit::from_booking(&first);
    edit.patient = Some(Patient {
        national_id: "110101198503037890".into(),
        ..first.patient.clone()
    });
    engine.update_booking(first.id, edit).await.unwrap();
    let again = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();

    // Cancelling frees the id too.
    engine.delete_booking(again.id).await.unwrap();
    engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
}

#[tokio::test]
async fn engine_search_bookings_by_field() {
    let engine = new_engine();
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 5)]).await;
    let wang = provider_with(&engine, "Dr. Wang", &[("周三：09:00-10:00", 5)]).await;
    let wed = upcoming(Weekday::Wed);

    let zhang = engine.create_booking(request(li, "周三：09:00-10:00", wed)).await.unwrap();
    let mut req = request(wang, "周三：09:00-10:00", wed);
    req.patient.name = "Li Si".into();
    req.patient.phone = "13912345678".into();
    let lisi = engine.create_booking(req).await.unwrap();

    let by_provider = engine.search_bookings(BookingSearchField::ProviderName, "dr. li").await;
    assert_eq!(by_provider, vec![zhang.clone()]);
    let by_patient = engine.search_bookings(BookingSearchField::PatientName, "LI").await;
    assert_eq!(by_patient, vec![lisi.clone()]);
    let by_phone = engine.search_bookings(BookingSearchField::Phone, " 139 ").await;
    assert_eq!(by_phone, vec![lisi]);
    assert!(engine.search_bookings(BookingSearchField::Phone, "000000").await.is_empty());
    assert_eq!(engine.search_bookings(BookingSearchField::PatientName, "  ").await.len(), 2);
}

#[tokio::test]
async fn engine_writer_refused_when_provider_replaced_while_waiting() {
    let engine = Arc::new(new_engine());
    let li = provider_with(&engine, "Dr. Li", &[("周三：09:00-10:00", 2)]).await;
    let held = engine.get_provider_state(&li).unwrap().write_owned().await;

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.set_slot_capacity(li, key("周三：09:00-10:00"), 3).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Same id, fresh state, swapped in while the writer is queued on the old lock.
    let fresh = Provider::new(li, "Dr. Li", "Cardiology");
    engine.state.insert(li, Arc::new(RwLock::new(ProviderState::new(fresh))));
    drop(held);

    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(EngineError::ProviderNotFound(id)) if id == li));
    assert!(engine.get_provider(li).await.unwrap().slots.is_empty());
}
