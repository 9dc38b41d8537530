//! Interval arithmetic for the scheduling core.
//!
//! This module provides [`TimeInterval`], a half-open interval `[start, end)`
//! in UTC. All overlap and containment logic in the resolution engine goes
//! through these methods so the boundary semantics live in one place.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A half-open interval `[start, end)` in UTC.
///
/// Intervals are ordered by start, then end, so they can be used as keys in
/// ordered collections and sorted deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    /// Start of the interval (inclusive).
    pub start: DateTime<Utc>,
    /// End of the interval (exclusive).
    pub end: DateTime<Utc>,
}

impl TimeInterval {
    /// Creates a new interval.
    ///
    /// # Panics
    ///
    /// Panics if `start` is after `end`. Use [`TimeInterval::checked`] when
    /// the bounds come from untrusted input.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        assert!(start <= end, "TimeInterval start must be <= end");
        Self { start, end }
    }

    /// Creates a new interval, returning `None` when `start > end`.
    pub fn checked(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Creates an interval from a start time and duration.
    pub fn from_duration(start: DateTime<Utc>, duration: Duration) -> Self {
        Self::new(start, start + duration)
    }

    /// Creates an interval covering a single day in the given timezone.
    pub fn for_date<Tz: TimeZone>(date: NaiveDate, tz: &Tz) -> Option<Self> {
        let start = tz
            .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
            .earliest()?
            .with_timezone(&Utc);
        let end = tz
            .from_local_datetime(&date.succ_opt()?.and_hms_opt(0, 0, 0)?)
            .earliest()?
            .with_timezone(&Utc);
        Some(Self { start, end })
    }

    /// Returns the duration of the interval.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Returns true if the interval is degenerate (zero length).
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Checks if a datetime falls within this interval.
    ///
    /// Half-open semantics: the start is included, the end is not.
    pub fn contains(&self, dt: DateTime<Utc>) -> bool {
        self.start <= dt && dt < self.end
    }

    /// Checks if two intervals overlap.
    ///
    /// `[a1, a2)` and `[b1, b2)` overlap iff `a1 < b2 && b1 < a2`. Degenerate
    /// intervals never overlap anything, including themselves.
    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        !self.is_empty() && !other.is_empty() && self.start < other.end && other.start < self.end
    }
}

impl PartialOrd for TimeInterval {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeInterval {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}
