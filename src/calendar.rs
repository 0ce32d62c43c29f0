//! Date arithmetic for the booking rules.
//!
//! Anything that depends on "which day is it" (weekdays, calendar weeks,
//! slot grids) is evaluated in one fixed lab-local offset. Pure elapsed-time
//! helpers are offset independent.

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc, Weekday};

use crate::model::Timestamp;

const HOUR_MS: i64 = 3_600_000;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calendar {
    offset: FixedOffset,
}

impl Default for Calendar {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl Calendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Parse `+HH:MM`, `-HH:MM`, `+HHMM` or `Z`.
    pub fn parse_offset(s: &str) -> Option<FixedOffset> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("z") || s.eq_ignore_ascii_case("utc") {
            return Some(Utc.fix());
        }
        let (sign, rest) = match s.as_bytes().first()? {
            b'+' => (1, &s[1..]),
            b'-' => (-1, &s[1..]),
            _ => return None,
        };
        let digits: String = rest.chars().filter(|c| *c != ':').collect();
        if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let hours: i32 = digits[..2].parse().ok()?;
        let minutes: i32 = digits[2..].parse().ok()?;
        if minutes >= 60 {
            return None;
        }
        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
    }

    pub fn local_date(&self, t: Timestamp) -> NaiveDate {
        t.with_timezone(&self.offset).date_naive()
    }

    /// Lab-local `date` at `hour:minute`, as an absolute instant.
    pub fn at(&self, date: NaiveDate, hour: u32, minute: u32) -> Option<Timestamp> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)?;
        let shift = Duration::seconds(i64::from(self.offset.local_minus_utc()));
        Some(Utc.from_utc_datetime(&(date.and_time(time) - shift)))
    }

    pub fn is_business_day(&self, t: Timestamp) -> bool {
        !matches!(
            t.with_timezone(&self.offset).weekday(),
            Weekday::Sat | Weekday::Sun
        )
    }

    /// Count business days visited walking one day at a time from `start`
    /// while the cursor is still `<= end`. The time of day of `start` is
    /// carried along, so both ends count only when reached. Whole weeks
    /// contribute five days each; only the remainder is walked.
    pub fn business_days_between(&self, start: Timestamp, end: Timestamp) -> i64 {
        if start > end {
            return 0;
        }
        let steps = (end - start).num_days() + 1;
        let weeks = steps / 7;
        let mut count = weeks * 5;
        let mut cursor = start + Duration::days(weeks * 7);
        for _ in 0..steps % 7 {
            if self.is_business_day(cursor) {
                count += 1;
            }
            cursor += Duration::days(1);
        }
        count
    }

    /// Sunday 00:00:00.000 through Saturday 23:59:59.999 (inclusive) of the
    /// lab-local week containing `t`.
    pub fn week_bounds(&self, t: Timestamp) -> (Timestamp, Timestamp) {
        let local = t.with_timezone(&self.offset);
        let back = i64::from(local.weekday().num_days_from_sunday());
        let sunday = local.date_naive() - Duration::days(back);
        let shift = Duration::seconds(i64::from(self.offset.local_minus_utc()));
        let start = Utc.from_utc_datetime(&(sunday.and_time(NaiveTime::MIN) - shift));
        let end = start + Duration::days(7) - Duration::milliseconds(1);
        (start, end)
    }
}

/// Absolute difference in hours, rounded half up.
pub fn hours_between(a: Timestamp, b: Timestamp) -> i64 {
    rounded_abs(a - b, HOUR_MS)
}

/// Absolute difference in days, rounded half up.
pub fn days_between(a: Timestamp, b: Timestamp) -> i64 {
    rounded_abs(a - b, DAY_MS)
}

fn rounded_abs(delta: Duration, unit_ms: i64) -> i64 {
    (delta.num_milliseconds().abs() + unit_ms / 2) / unit_ms
}

/// Half-open overlap: `[start_a, end_a)` and `[start_b, end_b)` share an instant.
pub fn intervals_overlap(
    start_a: Timestamp,
    end_a: Timestamp,
    start_b: Timestamp,
    end_b: Timestamp,
) -> bool {
    start_a < end_b && end_a > start_b
}
