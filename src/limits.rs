//! Booking policy and input limits.

/// Minimum notice, counted in business days (inclusive walk from "now").
pub const MIN_LEAD_BUSINESS_DAYS: i64 = 9;

/// Max active (pending/approved) reservations per phone per calendar week.
pub const WEEKLY_QUOTA: usize = 8;

/// Gap enforced on both sides of every active reservation on a lab.
pub const BUFFER_MINUTES: i64 = 15;

/// Pending reservations older than this are swept to `expired`.
pub const PENDING_TTL_HOURS: i64 = 48;

/// Cancellation needs at least this much notice before the start.
pub const CANCEL_NOTICE_HOURS: i64 = 12;

pub const MIN_DURATION_MINUTES: u32 = 30;
pub const MAX_DURATION_MINUTES: u32 = 240;
pub const DURATION_STEP_MINUTES: u32 = 30;

/// Slot grid: first slot at 08:00, last slot starts at 21:30.
pub const SLOT_DAY_START_HOUR: u32 = 8;
pub const SLOT_DAY_END_HOUR: u32 = 22;
pub const SLOT_MINUTES: u32 = 30;

/// Max bytes for any free-text field (name, course, note, reasons).
pub const MAX_TEXT_LEN: usize = 1024;
