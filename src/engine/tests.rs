use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{Duration, NaiveDate, TimeZone, Utc};

use super::*;
use crate::clock::ManualClock;
use crate::store::{MemoryStore, Store, StoreError};

const PHONE: &str = "34 9 9999-9999";
const OTHER_PHONE: &str = "34 9 8888-7777";

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> Timestamp {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

/// Wednesday 08:00. Monday 2026-11-09 10:00 is exactly nine business days out.
fn t0() -> Timestamp {
    at(2026, 10, 28, 8, 0)
}

/// Monday of the first bookable week.
fn mon(h: u32, mi: u32) -> Timestamp {
    at(2026, 11, 9, h, mi)
}

fn engine_at(now: Timestamp) -> (Engine, ManualClock, MemoryStore) {
    let clock = ManualClock::new(now);
    let store = MemoryStore::new();
    let engine = Engine::open(
        Box::new(store.clone()),
        Arc::new(clock.clone()),
        Calendar::default(),
    )
    .unwrap();
    (engine, clock, store)
}

fn request(lab_id: Id, phone: &str, start: Timestamp, minutes: u32) -> NewReservation {
    NewReservation {
        lab_id: Some(lab_id),
        requester_name: "Prof. Silva".into(),
        phone: phone.into(),
        start_time: Some(start),
        duration_minutes: Some(minutes),
        ..Default::default()
    }
}

fn block(lab_id: Id, start: Timestamp, end: Timestamp) -> NewBlock {
    NewBlock {
        lab_id: Some(lab_id),
        start_time: Some(start),
        end_time: Some(end),
        reason: "maintenance".into(),
    }
}

fn rejection(result: Result<impl std::fmt::Debug, EngineError>) -> Rejection {
    match result {
        Err(EngineError::Validation(r)) => r,
        other => panic!("expected validation error, got {other:?}"),
    }
}

// ── Store initialization ─────────────────────────────────

#[test]
fn open_seeds_three_labs() {
    let (engine, _clock, store) = engine_at(t0());
    let labs = engine.list_labs();
    assert_eq!(labs.len(), 3);
    assert_eq!(labs[0].name, "Lab 01");
    assert_eq!(labs[0].capacity, 30);
    assert_eq!(labs[2].capacity, 20);
    assert_eq!(store.saved(), Some(Snapshot::seeded()));
}

#[test]
fn reopen_keeps_existing_data() {
    let (mut engine, clock, store) = engine_at(t0());
    engine
        .create_reservation(request(1, PHONE, mon(10, 0), 30))
        .unwrap();

    let reopened = Engine::open(Box::new(store.clone()), Arc::new(clock), Calendar::default()).unwrap();
    assert_eq!(reopened.snapshot().reservations.len(), 1);
    assert_eq!(reopened.snapshot().last_id, 1);
    assert_eq!(reopened.list_labs().len(), 3);
}

#[test]
fn open_rejects_inverted_stored_block() {
    let mut store = MemoryStore::new();
    let mut snapshot = Snapshot::seeded();
    snapshot.blocks.push(Block {
        id: 1,
        lab_id: 1,
        start_time: mon(14, 0),
        end_time: mon(13, 0),
        reason: "maintenance".into(),
    });
    snapshot.last_id = 1;
    store.save(&snapshot).unwrap();

    let opened = Engine::open(
        Box::new(store),
        Arc::new(ManualClock::new(t0())),
        Calendar::default(),
    );
    match opened {
        Err(EngineError::Storage(StoreError::Invalid(msg))) => {
            assert_eq!(msg, "block 1 ends before it starts")
        }
        Err(other) => panic!("expected invalid snapshot, got {other:?}"),
        Ok(_) => panic!("inverted block accepted"),
    }
}

#[test]
fn get_lab_unknown_is_not_found() {
    let (engine, _clock, _store) = engine_at(t0());
    assert_eq!(engine.get_lab(2).unwrap().name, "Lab 02");
    assert!(matches!(engine.get_lab(42), Err(EngineError::NotFound(Entity::Lab, 42))));
}

// ── Create: happy path ───────────────────────────────────

#[test]
fn create_stores_pending_with_derived_end() {
    let (mut engine, _clock, store) = engine_at(t0());
    let mut input = request(1, PHONE, mon(10, 0), 90);
    input.course = Some("  Physics ".into());
    input.section = Some("   ".into());
    input.note = Some("bring adapters".into());

    let r = engine.create_reservation(input).unwrap();
    assert_eq!(r.id, 1);
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.start_time, mon(10, 0));
    assert_eq!(r.end_time, mon(11, 30));
    assert_eq!(r.end_time - r.start_time, Duration::minutes(90));
    assert_eq!(r.created_at, t0());
    assert_eq!(r.course.as_deref(), Some("Physics"));
    assert_eq!(r.section, None);
    assert_eq!(r.note.as_deref(), Some("bring adapters"));
    assert_eq!(r.denial_reason, None);

    // persisted before returning
    let saved = store.saved().unwrap();
    assert_eq!(saved.reservations, vec![r]);
    assert_eq!(saved.last_id, 1);
}

#[test]
fn create_accepts_every_valid_duration() {
    let (mut engine, _clock, _store) = engine_at(t0());
    for (i, minutes) in [30, 60, 90, 120, 150, 180, 210, 240].into_iter().enumerate() {
        let day = at(2026, 11, 16 + i as u32 % 5, 8, 0) + Duration::hours(5 * (i as i64 / 5));
        let r = engine
            .create_reservation(request(1 + (i as Id % 3), OTHER_PHONE, day, minutes))
            .unwrap();
        assert_eq!(r.end_time, day + Duration::minutes(minutes as i64));
    }
}

// ── Create: check order and individual rules ─────────────

#[test]
fn missing_fields_are_reported_by_name() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let base = request(1, PHONE, mon(10, 0), 30);

    let cases: Vec<(NewReservation, &str)> = vec![
        (NewReservation { lab_id: None, ..base.clone() }, "lab_id"),
        (NewReservation { lab_id: Some(0), ..base.clone() }, "lab_id"),
        (NewReservation { requester_name: " ".into(), ..base.clone() }, "requester_name"),
        (NewReservation { phone: String::new(), ..base.clone() }, "phone"),
        (NewReservation { start_time: None, ..base.clone() }, "start_time"),
        (NewReservation { duration_minutes: Some(0), ..base.clone() }, "duration_minutes"),
        (NewReservation { duration_minutes: None, ..base.clone() }, "duration_minutes"),
    ];
    for (input, field) in cases {
        assert_eq!(
            rejection(engine.create_reservation(input)),
            Rejection::MissingField(field)
        );
    }
    assert!(engine.snapshot().reservations.is_empty());
}

#[test]
fn oversized_text_rejected() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let mut input = request(1, PHONE, mon(10, 0), 30);
    input.note = Some("x".repeat(crate::limits::MAX_TEXT_LEN + 1));
    assert_eq!(
        rejection(engine.create_reservation(input)),
        Rejection::FieldTooLong("note")
    );
}

#[test]
fn unknown_lab_is_not_found() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let result = engine.create_reservation(request(9, PHONE, mon(10, 0), 30));
    assert!(matches!(result, Err(EngineError::NotFound(Entity::Lab, 9))));
}

#[test]
fn phone_format() {
    let (mut engine, _clock, _store) = engine_at(t0());
    for bad in [
        "34 8 9999-9999",
        "349 9999-9999",
        "34 9 99999999",
        "34 9 9999-999",
        " 34 9 9999-9999",
        "34 9 9999-9999 ",
        "ab 9 9999-9999",
        "34  9 9999-9999",
    ] {
        let err = rejection(engine.create_reservation(request(1, bad, mon(10, 0), 30)));
        assert_eq!(err, Rejection::PhoneFormat, "{bad:?} should be rejected");
        assert!(err.to_string().contains("phone format invalid"));
    }
    engine
        .create_reservation(request(1, "11 9 1234-5678", mon(10, 0), 30))
        .unwrap();
}

#[test]
fn duration_bounds_and_step() {
    let (mut engine, _clock, _store) = engine_at(t0());
    for bad in [15, 29, 45, 100, 270, 300] {
        assert_eq!(
            rejection(engine.create_reservation(request(1, PHONE, mon(10, 0), bad))),
            Rejection::Duration(bad)
        );
    }
}

#[test]
fn first_failing_check_wins() {
    let (mut engine, _clock, _store) = engine_at(t0());
    // Bad phone, bad duration and no lead time: phone is checked first.
    let input = request(1, "nope", at(2026, 10, 29, 10, 0), 45);
    assert_eq!(rejection(engine.create_reservation(input)), Rejection::PhoneFormat);

    // Bad duration and no lead time: duration comes before lead time.
    let input = request(1, PHONE, at(2026, 10, 29, 10, 0), 45);
    assert_eq!(rejection(engine.create_reservation(input)), Rejection::Duration(45));
}

#[test]
fn lead_time_nine_business_days() {
    let (mut engine, _clock, _store) = engine_at(t0());

    // Friday before: Wed..Fri + Mon..Fri = 8.
    let err = rejection(engine.create_reservation(request(1, PHONE, at(2026, 11, 6, 10, 0), 30)));
    assert_eq!(err, Rejection::LeadTime { business_days: 8 });
    assert!(err.to_string().contains("lead time insufficient"));

    // Weekend in between adds nothing.
    let err = rejection(engine.create_reservation(request(1, PHONE, at(2026, 11, 8, 10, 0), 30)));
    assert_eq!(err, Rejection::LeadTime { business_days: 8 });

    // Monday at a time later than "now" in the day: exactly nine.
    engine
        .create_reservation(request(1, PHONE, mon(10, 0), 30))
        .unwrap();
}

#[test]
fn lead_time_counts_time_of_day() {
    // Monday 07:00 is earlier in the day than the 08:00 cursor, so the ninth
    // business day is not reached yet.
    let (mut engine, _clock, _store) = engine_at(t0());
    assert_eq!(
        rejection(engine.create_reservation(request(1, PHONE, mon(7, 0), 30))),
        Rejection::LeadTime { business_days: 8 }
    );
    engine
        .create_reservation(request(1, PHONE, mon(8, 0), 30))
        .unwrap();
}

#[test]
fn lead_time_in_lab_offset() {
    // At -03:00 "now" is Wednesday 05:00 local and the Monday 10:00 local
    // start is 13:00 UTC.
    let clock = ManualClock::new(t0());
    let cal = Calendar::new(Calendar::parse_offset("-03:00").unwrap());
    let mut engine =
        Engine::open(Box::new(MemoryStore::new()), Arc::new(clock), cal).unwrap();
    engine
        .create_reservation(request(1, PHONE, mon(13, 0), 30))
        .unwrap();
    // Friday 23:00 local is Saturday 02:00 UTC, still the eighth business day.
    assert_eq!(
        rejection(engine.create_reservation(request(2, PHONE, at(2026, 11, 7, 2, 0), 30))),
        Rejection::LeadTime { business_days: 8 }
    );
}

// ── Weekly quota ─────────────────────────────────────────

/// Eight non-conflicting starts in the week of Sunday 2026-11-08.
fn eight_slots_in_week() -> Vec<(Id, Timestamp)> {
    vec![
        (1, at(2026, 11, 9, 10, 0)),
        (1, at(2026, 11, 9, 14, 0)),
        (2, at(2026, 11, 10, 10, 0)),
        (2, at(2026, 11, 10, 14, 0)),
        (3, at(2026, 11, 11, 10, 0)),
        (3, at(2026, 11, 12, 10, 0)),
        (1, at(2026, 11, 13, 10, 0)),
        (2, at(2026, 11, 14, 10, 0)), // Saturday still counts
    ]
}

#[test]
fn weekly_quota_ninth_rejected_on_any_lab() {
    let (mut engine, _clock, _store) = engine_at(t0());
    for (lab, start) in eight_slots_in_week() {
        engine.create_reservation(request(lab, PHONE, start, 60)).unwrap();
    }

    for lab in 1..=3 {
        let err = rejection(engine.create_reservation(request(lab, PHONE, at(2026, 11, 13, 16, 0), 30)));
        assert_eq!(err, Rejection::QuotaExceeded { active_this_week: 8 });
        assert!(err.to_string().contains("quota exceeded"));
    }

    // Other phones and the following week are unaffected.
    engine
        .create_reservation(request(3, OTHER_PHONE, at(2026, 11, 13, 16, 0), 30))
        .unwrap();
    engine
        .create_reservation(request(1, PHONE, at(2026, 11, 16, 10, 0), 30))
        .unwrap();
}

#[test]
fn weekly_quota_ignores_inactive_reservations() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let mut ids = Vec::new();
    for (lab, start) in eight_slots_in_week() {
        ids.push(engine.create_reservation(request(lab, PHONE, start, 60)).unwrap().id);
    }
    engine.deny_reservation(ids[0], "lab reserved for exams").unwrap();
    engine.create_reservation(request(3, PHONE, at(2026, 11, 13, 16, 0), 30)).unwrap();
}

#[test]
fn weekly_quota_uses_sunday_week_start() {
    let (mut engine, _clock, _store) = engine_at(t0());
    for (lab, start) in eight_slots_in_week() {
        engine.create_reservation(request(lab, PHONE, start, 60)).unwrap();
    }
    // Sunday 2026-11-15 opens a new week.
    engine
        .create_reservation(request(1, PHONE, at(2026, 11, 15, 0, 0), 30))
        .unwrap();
}

// ── Blocks vs reservations ───────────────────────────────

#[test]
fn block_overlap_rejects_reservation() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let b = engine.add_block(block(1, mon(9, 0), mon(12, 0))).unwrap();

    let err = rejection(engine.create_reservation(request(1, PHONE, mon(11, 30), 60)));
    assert_eq!(err, Rejection::BlockConflict { block_id: b.id });
    assert!(err.to_string().contains("block conflict"));

    // Touching the block edge is fine, and blocks carry no buffer.
    engine.create_reservation(request(1, PHONE, mon(12, 0), 30)).unwrap();
    engine.create_reservation(request(1, PHONE, mon(8, 30), 30)).unwrap();
    // Other labs are not blocked.
    engine.create_reservation(request(2, PHONE, mon(10, 0), 30)).unwrap();
}

#[test]
fn block_checked_before_reservation_conflict() {
    let (mut engine, _clock, _store) = engine_at(t0());
    engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    let b = engine.add_block(block(1, mon(10, 0), mon(11, 0))).unwrap(); // pending does not stop it
    assert_eq!(
        rejection(engine.create_reservation(request(1, OTHER_PHONE, mon(10, 30), 30))),
        Rejection::BlockConflict { block_id: b.id }
    );
}

// ── Buffered reservation conflicts ───────────────────────

#[test]
fn fifteen_minute_gap_accepted() {
    let (mut engine, _clock, _store) = engine_at(t0());
    engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    // after: ends 10:30, next starts 10:45
    engine.create_reservation(request(1, OTHER_PHONE, mon(10, 45), 30)).unwrap();
    // before: ends 9:45, existing starts 10:00
    engine.create_reservation(request(1, OTHER_PHONE, mon(9, 15), 30)).unwrap();
}

#[test]
fn fourteen_minute_gap_rejected() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let first = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();

    let err = rejection(engine.create_reservation(request(1, OTHER_PHONE, mon(10, 44), 30)));
    assert_eq!(err, Rejection::ReservationConflict { reservation_id: first.id });
    assert!(err.to_string().contains("reservation conflict"));

    assert_eq!(
        rejection(engine.create_reservation(request(1, OTHER_PHONE, mon(9, 16), 30))),
        Rejection::ReservationConflict { reservation_id: first.id }
    );
}

#[test]
fn conflicts_are_per_lab_and_per_active_status() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let first = engine.create_reservation(request(1, PHONE, mon(10, 0), 60)).unwrap();
    engine.create_reservation(request(2, OTHER_PHONE, mon(10, 0), 60)).unwrap();

    engine.deny_reservation(first.id, "exam week").unwrap();
    engine.create_reservation(request(1, OTHER_PHONE, mon(10, 0), 60)).unwrap();
}

#[test]
fn scenario_approve_then_buffer_conflict() {
    let (mut engine, _clock, _store) = engine_at(t0());

    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.end_time, mon(10, 30));

    let r = engine.approve_reservation(r.id).unwrap();
    assert_eq!(r.status, ReservationStatus::Approved);

    // 10:40 falls inside the first reservation's buffer, which runs to 10:45.
    let err = rejection(engine.create_reservation(request(1, OTHER_PHONE, mon(10, 40), 30)));
    assert_eq!(err, Rejection::ReservationConflict { reservation_id: r.id });
}

// ── Expiration sweep ─────────────────────────────────────

#[test]
fn pending_expires_after_48_hours_on_list() {
    let (mut engine, clock, store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();

    clock.advance(Duration::hours(48) - Duration::minutes(1));
    let listed = engine.list_reservations(&ReservationFilter::default()).unwrap();
    assert_eq!(listed[0].status, ReservationStatus::Pending);

    clock.advance(Duration::minutes(1));
    let listed = engine.list_reservations(&ReservationFilter::default()).unwrap();
    assert_eq!(listed[0].id, r.id);
    assert_eq!(listed[0].status, ReservationStatus::Expired);

    // persisted by the sweep itself
    let saved = store.saved().unwrap();
    assert_eq!(saved.reservations[0].status, ReservationStatus::Expired);
}

#[test]
fn approved_never_expires() {
    let (mut engine, clock, _store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    engine.approve_reservation(r.id).unwrap();
    clock.advance(Duration::days(5));
    assert_eq!(
        engine.get_reservation(r.id).unwrap().status,
        ReservationStatus::Approved
    );
}

#[test]
fn expired_reservations_free_quota_and_slot() {
    let (mut engine, clock, _store) = engine_at(t0());
    // week of Sunday 2026-11-15, far enough out to survive the clock jump
    let starts = [
        (1, at(2026, 11, 16, 10, 0)),
        (1, at(2026, 11, 16, 14, 0)),
        (2, at(2026, 11, 17, 10, 0)),
        (2, at(2026, 11, 17, 14, 0)),
        (3, at(2026, 11, 18, 10, 0)),
        (3, at(2026, 11, 19, 10, 0)),
        (1, at(2026, 11, 20, 10, 0)),
        (2, at(2026, 11, 20, 14, 0)),
    ];
    for (lab, start) in starts {
        engine.create_reservation(request(lab, PHONE, start, 60)).unwrap();
    }

    clock.advance(Duration::hours(47));
    assert_eq!(
        rejection(engine.create_reservation(request(3, PHONE, at(2026, 11, 20, 16, 0), 30))),
        Rejection::QuotaExceeded { active_this_week: 8 }
    );

    clock.advance(Duration::hours(1));
    // The create call sweeps first; the eight pending requests are gone.
    let r = engine
        .create_reservation(request(1, PHONE, at(2026, 11, 16, 10, 0), 60))
        .unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);

    let expired = engine
        .list_reservations(&ReservationFilter {
            status: Some(ReservationStatus::Expired),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(expired.len(), 8);
}

#[test]
fn expired_reservation_cannot_be_approved() {
    let (mut engine, clock, _store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    clock.advance(Duration::hours(48));
    let err = engine.approve_reservation(r.id).unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidState {
            status: ReservationStatus::Expired,
            action: "approve",
            ..
        }
    ));
}

// ── Approve / deny ───────────────────────────────────────

#[test]
fn approve_requires_pending() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    engine.approve_reservation(r.id).unwrap();
    assert!(matches!(
        engine.approve_reservation(r.id),
        Err(EngineError::InvalidState { status: ReservationStatus::Approved, .. })
    ));
    assert!(matches!(
        engine.approve_reservation(999),
        Err(EngineError::NotFound(Entity::Reservation, 999))
    ));
}

#[test]
fn deny_stores_reason() {
    let (mut engine, _clock, store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();

    let err = rejection(engine.deny_reservation(r.id, "   "));
    assert_eq!(err, Rejection::DenialReasonRequired);
    assert_eq!(engine.get_reservation(r.id).unwrap().status, ReservationStatus::Pending);

    let denied = engine.deny_reservation(r.id, " lab closed for inventory ").unwrap();
    assert_eq!(denied.status, ReservationStatus::Denied);
    assert_eq!(denied.denial_reason.as_deref(), Some("lab closed for inventory"));
    assert_eq!(store.saved().unwrap().reservations[0], denied);

    // terminal: no re-approve, no second denial
    assert!(matches!(
        engine.approve_reservation(r.id),
        Err(EngineError::InvalidState { status: ReservationStatus::Denied, .. })
    ));
    assert!(matches!(
        engine.deny_reservation(r.id, "again"),
        Err(EngineError::InvalidState { .. })
    ));
}

#[test]
fn deny_checks_state_before_reason() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    engine.approve_reservation(r.id).unwrap();
    assert!(matches!(
        engine.deny_reservation(r.id, ""),
        Err(EngineError::InvalidState { action: "deny", .. })
    ));
    assert!(matches!(
        engine.deny_reservation(77, ""),
        Err(EngineError::NotFound(Entity::Reservation, 77))
    ));
}

#[test]
fn only_denied_reservations_carry_a_reason() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let a = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    let b = engine.create_reservation(request(2, PHONE, mon(10, 0), 30)).unwrap();
    engine.approve_reservation(a.id).unwrap();
    engine.deny_reservation(b.id, "overlaps an exam").unwrap();
    for r in engine.list_reservations(&ReservationFilter::default()).unwrap() {
        assert_eq!(
            r.denial_reason.is_some(),
            r.status == ReservationStatus::Denied,
            "{r:?}"
        );
    }
}

// ── Cancel ───────────────────────────────────────────────

#[test]
fn cancel_notice_boundary() {
    let (mut engine, clock, _store) = engine_at(t0());
    let a = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    let b = engine.create_reservation(request(2, PHONE, mon(10, 0), 30)).unwrap();
    // approved so they survive until the day before
    engine.approve_reservation(a.id).unwrap();
    engine.approve_reservation(b.id).unwrap();

    clock.set(mon(10, 0) - Duration::hours(12));
    let cancelled = engine.cancel_reservation(a.id).unwrap();
    assert_eq!(cancelled.status, ReservationStatus::Cancelled);

    clock.set(mon(10, 0) - Duration::hours(11) - Duration::minutes(59));
    let err = rejection(engine.cancel_reservation(b.id));
    assert_eq!(err, Rejection::InsufficientNotice { hours_left: 11 });
    assert!(err.to_string().contains("insufficient notice"));
    assert_eq!(engine.get_reservation(b.id).unwrap().status, ReservationStatus::Approved);
}

#[test]
fn cancel_after_start_rejected() {
    let (mut engine, clock, _store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    engine.approve_reservation(r.id).unwrap();
    clock.set(mon(10, 0) + Duration::hours(13));
    assert!(matches!(
        rejection(engine.cancel_reservation(r.id)),
        Rejection::InsufficientNotice { .. }
    ));
}

#[test]
fn cancel_pending_and_terminal_states() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    engine.cancel_reservation(r.id).unwrap();
    assert!(matches!(
        engine.cancel_reservation(r.id),
        Err(EngineError::InvalidState { status: ReservationStatus::Cancelled, action: "cancel", .. })
    ));
    assert!(matches!(
        engine.approve_reservation(r.id),
        Err(EngineError::InvalidState { .. })
    ));
    assert!(matches!(
        engine.cancel_reservation(12345),
        Err(EngineError::NotFound(Entity::Reservation, 12345))
    ));

    // the freed slot can be booked again
    engine.create_reservation(request(1, OTHER_PHONE, mon(10, 0), 30)).unwrap();
}

// ── Blocks ───────────────────────────────────────────────

#[test]
fn block_round_trip() {
    let (mut engine, _clock, store) = engine_at(t0());
    let added = engine.add_block(block(2, mon(8, 0), mon(12, 0))).unwrap();
    assert_eq!(added.lab_id, 2);
    assert_eq!(added.reason, "maintenance");

    assert_eq!(engine.list_blocks(Some(2)), vec![added.clone()]);
    assert_eq!(engine.list_blocks(None), vec![added.clone()]);
    assert!(engine.list_blocks(Some(1)).is_empty());
    assert_eq!(store.saved().unwrap().blocks, vec![added.clone()]);

    let removed = engine.remove_block(added.id).unwrap();
    assert_eq!(removed, added);
    assert!(engine.list_blocks(Some(2)).is_empty());
    assert!(store.saved().unwrap().blocks.is_empty());

    assert!(matches!(
        engine.remove_block(added.id),
        Err(EngineError::NotFound(Entity::Block, _))
    ));
}

#[test]
fn block_rejects_approved_overlap_only() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let approved = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    engine.approve_reservation(approved.id).unwrap();
    engine.create_reservation(request(1, PHONE, mon(14, 0), 30)).unwrap();

    let err = rejection(engine.add_block(block(1, mon(10, 15), mon(11, 0))));
    assert_eq!(err, Rejection::BlockOverlapsApproved { reservation_id: approved.id });

    // touching the approved reservation is fine; covering a pending one too
    engine.add_block(block(1, mon(10, 30), mon(11, 0))).unwrap();
    engine.add_block(block(1, mon(13, 0), mon(15, 0))).unwrap();
}

#[test]
fn block_input_validation() {
    let (mut engine, _clock, _store) = engine_at(t0());
    assert_eq!(
        rejection(engine.add_block(block(1, mon(12, 0), mon(12, 0)))),
        Rejection::BlockSpanInverted
    );
    assert_eq!(
        rejection(engine.add_block(block(1, mon(12, 0), mon(11, 0)))),
        Rejection::BlockSpanInverted
    );
    assert_eq!(
        rejection(engine.add_block(NewBlock { reason: " ".into(), ..block(1, mon(9, 0), mon(10, 0)) })),
        Rejection::MissingField("reason")
    );
    assert_eq!(
        rejection(engine.add_block(NewBlock { end_time: None, ..block(1, mon(9, 0), mon(10, 0)) })),
        Rejection::MissingField("end_time")
    );
    assert!(matches!(
        engine.add_block(block(4, mon(9, 0), mon(10, 0))),
        Err(EngineError::NotFound(Entity::Lab, 4))
    ));
}

#[test]
fn ids_shared_and_never_reused() {
    let (mut engine, clock, store) = engine_at(t0());
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    let b = engine.add_block(block(2, mon(8, 0), mon(9, 0))).unwrap();
    assert_eq!((r.id, b.id), (1, 2));
    engine.remove_block(b.id).unwrap();

    let mut reopened =
        Engine::open(Box::new(store), Arc::new(clock), Calendar::default()).unwrap();
    let next = reopened.add_block(block(2, mon(8, 0), mon(9, 0))).unwrap();
    assert_eq!(next.id, 3);
}

// ── Filters and slots ────────────────────────────────────

#[test]
fn list_reservations_filters_combine() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let a = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    let b = engine.create_reservation(request(2, PHONE, mon(10, 0), 30)).unwrap();
    let c = engine.create_reservation(request(1, OTHER_PHONE, mon(14, 0), 30)).unwrap();
    engine.approve_reservation(b.id).unwrap();

    let ids = |engine: &mut Engine, f: ReservationFilter| -> Vec<Id> {
        engine.list_reservations(&f).unwrap().into_iter().map(|r| r.id).collect()
    };

    assert_eq!(ids(&mut engine, ReservationFilter::default()), vec![a.id, b.id, c.id]);
    assert_eq!(
        ids(&mut engine, ReservationFilter { phone: Some(PHONE.into()), ..Default::default() }),
        vec![a.id, b.id]
    );
    assert_eq!(
        ids(&mut engine, ReservationFilter { lab_id: Some(1), ..Default::default() }),
        vec![a.id, c.id]
    );
    assert_eq!(
        ids(
            &mut engine,
            ReservationFilter {
                phone: Some(PHONE.into()),
                lab_id: Some(2),
                status: Some(ReservationStatus::Approved),
            }
        ),
        vec![b.id]
    );
    assert!(ids(
        &mut engine,
        ReservationFilter { status: Some(ReservationStatus::Denied), ..Default::default() }
    )
    .is_empty());
}

#[test]
fn day_slots_mark_reserved_and_blocked() {
    let (mut engine, _clock, _store) = engine_at(t0());
    engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    engine.add_block(block(1, mon(13, 0), mon(14, 0))).unwrap();

    let date = NaiveDate::from_ymd_opt(2026, 11, 9).unwrap();
    let slots = engine.day_slots(1, date).unwrap();
    assert_eq!(slots.len(), 28);
    assert_eq!(slots[0].start, mon(8, 0));
    assert_eq!(slots[27].start, mon(21, 30));
    assert_eq!(slots[27].end, mon(22, 0));

    let state_at = |h: u32, m: u32| {
        slots
            .iter()
            .find(|s| s.start == mon(h, m))
            .map(|s| s.state)
            .unwrap()
    };
    assert_eq!(state_at(9, 0), SlotState::Free);
    assert_eq!(state_at(9, 30), SlotState::Reserved);
    assert_eq!(state_at(10, 0), SlotState::Reserved);
    assert_eq!(state_at(10, 30), SlotState::Reserved);
    assert_eq!(state_at(11, 0), SlotState::Free);
    assert_eq!(state_at(12, 30), SlotState::Free);
    assert_eq!(state_at(13, 0), SlotState::Blocked);
    assert_eq!(state_at(13, 30), SlotState::Blocked);
    assert_eq!(state_at(14, 0), SlotState::Free);

    // other lab untouched
    assert!(engine
        .day_slots(2, date)
        .unwrap()
        .iter()
        .all(|s| s.state == SlotState::Free));
}

#[test]
fn day_slots_weekend_and_unknown_lab() {
    let (mut engine, _clock, _store) = engine_at(t0());
    let saturday = NaiveDate::from_ymd_opt(2026, 11, 7).unwrap();
    assert!(engine.day_slots(1, saturday).unwrap().is_empty());
    assert!(matches!(
        engine.day_slots(8, saturday),
        Err(EngineError::NotFound(Entity::Lab, 8))
    ));
}

// ── Reset and storage failures ───────────────────────────

#[test]
fn reset_restores_seed_state() {
    let (mut engine, _clock, store) = engine_at(t0());
    engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();
    engine.add_block(block(2, mon(8, 0), mon(9, 0))).unwrap();
    engine.reset().unwrap();
    assert_eq!(engine.snapshot(), &Snapshot::seeded());
    assert_eq!(store.saved(), Some(Snapshot::seeded()));
}

/// Saves succeed until `fail` is set.
struct FlakyStore {
    inner: MemoryStore,
    fail: Arc<AtomicBool>,
}

impl Store for FlakyStore {
    fn load(&mut self) -> Result<Option<Snapshot>, StoreError> {
        self.inner.load()
    }

    fn save(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.save(snapshot)
    }
}

#[test]
fn failed_save_leaves_no_partial_state() {
    let fail = Arc::new(AtomicBool::new(false));
    let inner = MemoryStore::new();
    let store = FlakyStore {
        inner: inner.clone(),
        fail: fail.clone(),
    };
    let clock = ManualClock::new(t0());
    let mut engine = Engine::open(Box::new(store), Arc::new(clock), Calendar::default()).unwrap();
    let r = engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();

    fail.store(true, Ordering::SeqCst);
    assert!(matches!(
        engine.create_reservation(request(2, PHONE, mon(10, 0), 30)),
        Err(EngineError::Storage(_))
    ));
    assert!(matches!(engine.approve_reservation(r.id), Err(EngineError::Storage(_))));
    assert_eq!(engine.snapshot().reservations.len(), 1);
    assert_eq!(engine.snapshot().reservations[0].status, ReservationStatus::Pending);
    assert_eq!(engine.snapshot().last_id, 1);
    assert_eq!(inner.saved().unwrap(), *engine.snapshot());

    // the failed id was not burned
    fail.store(false, Ordering::SeqCst);
    let next = engine.create_reservation(request(2, PHONE, mon(10, 0), 30)).unwrap();
    assert_eq!(next.id, 2);
}

#[test]
fn failed_sweep_blocks_the_operation() {
    let fail = Arc::new(AtomicBool::new(false));
    let clock = ManualClock::new(t0());
    let store = FlakyStore {
        inner: MemoryStore::new(),
        fail: fail.clone(),
    };
    let mut engine =
        Engine::open(Box::new(store), Arc::new(clock.clone()), Calendar::default()).unwrap();
    engine.create_reservation(request(1, PHONE, mon(10, 0), 30)).unwrap();

    clock.advance(Duration::hours(49));
    fail.store(true, Ordering::SeqCst);
    assert!(matches!(
        engine.list_reservations(&ReservationFilter::default()),
        Err(EngineError::Storage(_))
    ));
    assert_eq!(engine.snapshot().reservations[0].status, ReservationStatus::Pending);
}
