use std::sync::LazyLock;

use chrono::Duration;
use regex::Regex;

use crate::calendar::Calendar;
use crate::limits::*;
use crate::model::*;

use super::{EngineError, Entity, Rejection};

static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{2} 9 [0-9]{4}-[0-9]{4}$").expect("static phone pattern"));

/// A reservation request that passed every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CheckedReservation {
    pub lab_id: Id,
    pub span: Span,
    pub duration_minutes: u32,
}

/// Run the reservation checks in order; the first failure wins.
pub(crate) fn check_reservation(
    snap: &Snapshot,
    input: &NewReservation,
    now: Timestamp,
    cal: &Calendar,
) -> Result<CheckedReservation, EngineError> {
    // 1. presence
    let lab_id = input
        .lab_id
        .filter(|id| *id != 0)
        .ok_or(Rejection::MissingField("lab_id"))?;
    require_text("requester_name", &input.requester_name)?;
    require_text("phone", &input.phone)?;
    let start = input.start_time.ok_or(Rejection::MissingField("start_time"))?;
    let duration_minutes = input
        .duration_minutes
        .filter(|d| *d != 0)
        .ok_or(Rejection::MissingField("duration_minutes"))?;
    for (field, value) in [
        ("course", &input.course),
        ("section", &input.section),
        ("note", &input.note),
    ] {
        if let Some(v) = value {
            limit_text(field, v)?;
        }
    }
    if snap.lab(lab_id).is_none() {
        return Err(EngineError::NotFound(Entity::Lab, lab_id));
    }

    // 2. phone
    if !PHONE_RE.is_match(&input.phone) {
        return Err(Rejection::PhoneFormat.into());
    }

    // 3. duration
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&duration_minutes)
        || duration_minutes % DURATION_STEP_MINUTES != 0
    {
        return Err(Rejection::Duration(duration_minutes).into());
    }
    let span = Span::new(start, start + Duration::minutes(i64::from(duration_minutes)));

    // 4. lead time
    let business_days = cal.business_days_between(now, start);
    if business_days < MIN_LEAD_BUSINESS_DAYS {
        return Err(Rejection::LeadTime { business_days }.into());
    }

    // 5. weekly quota
    let active_this_week = weekly_count(snap, &input.phone, start, cal);
    if active_this_week >= WEEKLY_QUOTA {
        return Err(Rejection::QuotaExceeded { active_this_week }.into());
    }

    // 6. blocks
    if let Some(block) = find_block_conflict(snap, lab_id, &span) {
        return Err(Rejection::BlockConflict { block_id: block.id }.into());
    }

    // 7. other reservations, buffered
    if let Some(other) = find_reservation_conflict(snap, lab_id, &span) {
        return Err(Rejection::ReservationConflict {
            reservation_id: other.id,
        }
        .into());
    }

    Ok(CheckedReservation {
        lab_id,
        span,
        duration_minutes,
    })
}

/// Block checks. Only approved reservations stand in the way; a pending
/// request does not stop the admin from blocking its slot.
pub(crate) fn check_block(snap: &Snapshot, input: &NewBlock) -> Result<(Id, Span), EngineError> {
    let lab_id = input
        .lab_id
        .filter(|id| *id != 0)
        .ok_or(Rejection::MissingField("lab_id"))?;
    let start = input.start_time.ok_or(Rejection::MissingField("start_time"))?;
    let end = input.end_time.ok_or(Rejection::MissingField("end_time"))?;
    require_text("reason", &input.reason)?;
    if snap.lab(lab_id).is_none() {
        return Err(EngineError::NotFound(Entity::Lab, lab_id));
    }
    if end <= start {
        return Err(Rejection::BlockSpanInverted.into());
    }
    let span = Span::new(start, end);

    if let Some(r) = snap
        .active_on_lab(lab_id)
        .find(|r| r.status == ReservationStatus::Approved && r.span().overlaps(&span))
    {
        return Err(Rejection::BlockOverlapsApproved {
            reservation_id: r.id,
        }
        .into());
    }
    Ok((lab_id, span))
}

pub(crate) fn check_denial_reason(reason: &str) -> Result<String, Rejection> {
    let trimmed = reason.trim();
    if trimmed.is_empty() {
        return Err(Rejection::DenialReasonRequired);
    }
    limit_text("reason", trimmed)?;
    Ok(trimmed.to_string())
}

pub(crate) fn check_cancel_notice(start: Timestamp, now: Timestamp) -> Result<(), Rejection> {
    let left = start - now;
    if left < Duration::hours(CANCEL_NOTICE_HOURS) {
        return Err(Rejection::InsufficientNotice {
            hours_left: left.num_hours(),
        });
    }
    Ok(())
}

/// Pending reservations whose age has reached the TTL.
pub(crate) fn collect_expired(snap: &Snapshot, now: Timestamp) -> Vec<Id> {
    let ttl = Duration::hours(PENDING_TTL_HOURS);
    snap.reservations
        .iter()
        .filter(|r| r.status == ReservationStatus::Pending && now - r.created_at >= ttl)
        .map(|r| r.id)
        .collect()
}

/// State of a grid slot: would a minimum-length request starting at
/// `start` be stopped by a block, or by the buffered reservation check?
pub(crate) fn slot_state(snap: &Snapshot, lab_id: Id, start: Timestamp) -> SlotState {
    let probe = Span::new(
        start,
        start + Duration::minutes(i64::from(MIN_DURATION_MINUTES)),
    );
    if find_block_conflict(snap, lab_id, &probe).is_some() {
        SlotState::Blocked
    } else if find_reservation_conflict(snap, lab_id, &probe).is_some() {
        SlotState::Reserved
    } else {
        SlotState::Free
    }
}

fn weekly_count(snap: &Snapshot, phone: &str, start: Timestamp, cal: &Calendar) -> usize {
    let (week_start, week_end) = cal.week_bounds(start);
    snap.reservations
        .iter()
        .filter(|r| {
            r.phone == phone
                && r.status.is_active()
                && r.start_time >= week_start
                && r.start_time <= week_end
        })
        .count()
}

fn find_block_conflict<'a>(snap: &'a Snapshot, lab_id: Id, span: &Span) -> Option<&'a Block> {
    snap.blocks_on_lab(lab_id).find(|b| b.span().overlaps(span))
}

fn find_reservation_conflict<'a>(
    snap: &'a Snapshot,
    lab_id: Id,
    span: &Span,
) -> Option<&'a Reservation> {
    let buffered = span.widen(Duration::minutes(BUFFER_MINUTES));
    snap.active_on_lab(lab_id)
        .find(|r| buffered.overlaps(&r.span()))
}

fn require_text(field: &'static str, value: &str) -> Result<(), Rejection> {
    if value.trim().is_empty() {
        return Err(Rejection::MissingField(field));
    }
    limit_text(field, value)
}

fn limit_text(field: &'static str, value: &str) -> Result<(), Rejection> {
    if value.len() > MAX_TEXT_LEN {
        return Err(Rejection::FieldTooLong(field));
    }
    Ok(())
}
