use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::intervals_overlap;

/// Absolute instant. Serialized as RFC 3339 with a UTC offset.
pub type Timestamp = DateTime<Utc>;

/// Labs, reservations and blocks share one id space.
pub type Id = u64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        intervals_overlap(self.start, self.end, other.start, other.end)
    }

    /// Grow the span by `by` on both sides.
    pub fn widen(&self, by: Duration) -> Span {
        Span::new(self.start - by, self.end + by)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lab {
    pub id: Id,
    pub name: String,
    pub capacity: u32,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Approved,
    Denied,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Approved => "approved",
            ReservationStatus::Denied => "denied",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(ReservationStatus::Pending),
            "approved" => Some(ReservationStatus::Approved),
            "denied" => Some(ReservationStatus::Denied),
            "cancelled" | "canceled" => Some(ReservationStatus::Cancelled),
            "expired" => Some(ReservationStatus::Expired),
            _ => None,
        }
    }

    /// Pending and approved reservations hold their slot and count toward quota.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Approved)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Id,
    pub lab_id: Id,
    pub requester_name: String,
    pub phone: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub duration_minutes: u32,
    #[serde(default)]
    pub course: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
    pub status: ReservationStatus,
    pub created_at: Timestamp,
    #[serde(default)]
    pub denial_reason: Option<String>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }
}

/// Maintenance window during which a lab cannot be reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub id: Id,
    pub lab_id: Id,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub reason: String,
}

impl Block {
    pub fn span(&self) -> Span {
        Span::new(self.start_time, self.end_time)
    }
}

/// The whole persisted state. This is the on-disk document format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub labs: Vec<Lab>,
    #[serde(default)]
    pub reservations: Vec<Reservation>,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub last_id: Id,
}

impl Snapshot {
    /// Initial state: three seed labs, nothing booked.
    pub fn seeded() -> Self {
        let lab = |id: Id, capacity: u32| Lab {
            id,
            name: format!("Lab {id:02}"),
            capacity,
            description: format!("Computer Lab {id:02}"),
        };
        Self {
            labs: vec![lab(1, 30), lab(2, 25), lab(3, 20)],
            reservations: Vec::new(),
            blocks: Vec::new(),
            last_id: 0,
        }
    }

    /// First reservation or block whose end does not follow its start.
    pub fn inverted_span(&self) -> Option<(&'static str, Id)> {
        let reservations = self
            .reservations
            .iter()
            .filter(|r| r.end_time <= r.start_time)
            .map(|r| ("reservation", r.id));
        let blocks = self
            .blocks
            .iter()
            .filter(|b| b.end_time <= b.start_time)
            .map(|b| ("block", b.id));
        reservations.chain(blocks).next()
    }

    /// Bump and return the id counter. Ids are never handed out twice.
    pub fn next_id(&mut self) -> Id {
        self.last_id += 1;
        self.last_id
    }

    pub fn lab(&self, id: Id) -> Option<&Lab> {
        self.labs.iter().find(|l| l.id == id)
    }

    pub fn reservation(&self, id: Id) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Id) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    /// Active reservations on one lab.
    pub fn active_on_lab(&self, lab_id: Id) -> impl Iterator<Item = &Reservation> {
        self.reservations
            .iter()
            .filter(move |r| r.lab_id == lab_id && r.status.is_active())
    }

    pub fn blocks_on_lab(&self, lab_id: Id) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(move |b| b.lab_id == lab_id)
    }
}

// ── Inputs ───────────────────────────────────────────────────────

/// A reservation request as submitted. Missing values are `None` or blank
/// and are rejected by validation, not by the type system, so callers get
/// a rule-specific reason.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewReservation {
    pub lab_id: Option<Id>,
    pub requester_name: String,
    pub phone: String,
    pub start_time: Option<Timestamp>,
    pub duration_minutes: Option<u32>,
    pub course: Option<String>,
    pub section: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewBlock {
    pub lab_id: Option<Id>,
    pub start_time: Option<Timestamp>,
    pub end_time: Option<Timestamp>,
    pub reason: String,
}

/// Optional filters for listing reservations; all set fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub phone: Option<String>,
    pub lab_id: Option<Id>,
    pub status: Option<ReservationStatus>,
}

impl ReservationFilter {
    pub fn matches(&self, r: &Reservation) -> bool {
        self.phone.as_ref().is_none_or(|p| *p == r.phone)
            && self.lab_id.is_none_or(|id| id == r.lab_id)
            && self.status.is_none_or(|s| s == r.status)
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Reserved,
    Blocked,
}

impl SlotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SlotState::Free => "free",
            SlotState::Reserved => "reserved",
            SlotState::Blocked => "blocked",
        }
    }
}

/// One cell of the half-hour booking grid for a lab-local day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub start: Timestamp,
    pub end: Timestamp,
    pub state: SlotState,
}
