use std::fmt;

use crate::model::{Id, ReservationStatus};
use crate::store::StoreError;

#[derive(Debug)]
pub enum EngineError {
    /// A business rule rejected the request.
    Validation(Rejection),
    NotFound(Entity, Id),
    InvalidState {
        id: Id,
        status: ReservationStatus,
        action: &'static str,
    },
    Storage(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Lab,
    Reservation,
    Block,
}

impl Entity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Lab => "lab",
            Entity::Reservation => "reservation",
            Entity::Block => "block",
        }
    }
}

/// Which rule failed, with enough detail to explain it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    MissingField(&'static str),
    FieldTooLong(&'static str),
    PhoneFormat,
    Duration(u32),
    LeadTime { business_days: i64 },
    QuotaExceeded { active_this_week: usize },
    BlockConflict { block_id: Id },
    ReservationConflict { reservation_id: Id },
    DenialReasonRequired,
    InsufficientNotice { hours_left: i64 },
    BlockSpanInverted,
    BlockOverlapsApproved { reservation_id: Id },
}

impl Rejection {
    /// Short stable label, used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Rejection::MissingField(_) => "missing_field",
            Rejection::FieldTooLong(_) => "field_too_long",
            Rejection::PhoneFormat => "phone_format",
            Rejection::Duration(_) => "duration",
            Rejection::LeadTime { .. } => "lead_time",
            Rejection::QuotaExceeded { .. } => "quota",
            Rejection::BlockConflict { .. } => "block_conflict",
            Rejection::ReservationConflict { .. } => "reservation_conflict",
            Rejection::DenialReasonRequired => "denial_reason",
            Rejection::InsufficientNotice { .. } => "insufficient_notice",
            Rejection::BlockSpanInverted => "block_span",
            Rejection::BlockOverlapsApproved { .. } => "block_overlaps_approved",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use crate::limits::*;
        match self {
            Rejection::MissingField(field) => write!(f, "missing required field: {field}"),
            Rejection::FieldTooLong(field) => {
                write!(f, "field too long: {field} (max {MAX_TEXT_LEN} bytes)")
            }
            Rejection::PhoneFormat => {
                write!(f, "phone format invalid: expected NN 9 NNNN-NNNN (e.g. 34 9 9999-9999)")
            }
            Rejection::Duration(minutes) => write!(
                f,
                "duration invalid: {minutes} min (must be {MIN_DURATION_MINUTES}-{MAX_DURATION_MINUTES} in steps of {DURATION_STEP_MINUTES})"
            ),
            Rejection::LeadTime { business_days } => write!(
                f,
                "lead time insufficient: {business_days} business days, {MIN_LEAD_BUSINESS_DAYS} required"
            ),
            Rejection::QuotaExceeded { active_this_week } => write!(
                f,
                "quota exceeded: {active_this_week} reservations this week for this phone (max {WEEKLY_QUOTA})"
            ),
            Rejection::BlockConflict { block_id } => {
                write!(f, "block conflict: lab is blocked (block {block_id})")
            }
            Rejection::ReservationConflict { reservation_id } => write!(
                f,
                "reservation conflict with reservation {reservation_id} ({BUFFER_MINUTES} min buffer)"
            ),
            Rejection::DenialReasonRequired => write!(f, "denial reason required"),
            Rejection::InsufficientNotice { hours_left } => write!(
                f,
                "insufficient notice: about {hours_left}h before start, {CANCEL_NOTICE_HOURS}h required"
            ),
            Rejection::BlockSpanInverted => write!(f, "block end must be after start"),
            Rejection::BlockOverlapsApproved { reservation_id } => write!(
                f,
                "block conflicts with approved reservation {reservation_id}"
            ),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(r) => write!(f, "{r}"),
            EngineError::NotFound(entity, id) => write!(f, "{} not found: {id}", entity.as_str()),
            EngineError::InvalidState { id, status, action } => {
                write!(f, "cannot {action} reservation {id}: status is {status}")
            }
            EngineError::Storage(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::Validation(r)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Storage(e)
    }
}
