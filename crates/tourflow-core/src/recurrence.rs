//! Weekday + time-of-day recurrence expansion.
//!
//! An availability rule is a weekly pattern ("Mondays and Wednesdays at 09:00
//! and 14:00"). Expansion turns that pattern into the concrete UTC datetimes
//! falling inside a bounded half-open range, interpreting the wall-clock
//! times in the tour's timezone. A rule anchored at "09:00 local" therefore
//! yields 09:00 local on both sides of a daylight-saving transition.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

/// A weekly recurrence pattern: a set of weekdays and start times of day.
///
/// Duplicate entries are tolerated; expansion deduplicates its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeeklyPattern {
    /// Weekdays the pattern fires on.
    pub weekdays: Vec<Weekday>,
    /// Start times of day, interpreted in the pattern's timezone.
    pub start_times: Vec<NaiveTime>,
}

impl WeeklyPattern {
    /// Creates a pattern from weekday and time iterators.
    pub fn new(
        weekdays: impl IntoIterator<Item = Weekday>,
        start_times: impl IntoIterator<Item = NaiveTime>,
    ) -> Self {
        Self {
            weekdays: weekdays.into_iter().collect(),
            start_times: start_times.into_iter().collect(),
        }
    }

    /// Returns true if the pattern can never fire.
    pub fn is_empty(&self) -> bool {
        self.weekdays.is_empty() || self.start_times.is_empty()
    }
}

/// Expands a weekly pattern into concrete UTC datetimes within `[from, to)`.
///
/// The result is ascending and free of duplicates. Local times that fall in a
/// spring-forward gap are skipped; ambiguous fall-back times resolve to the
/// earlier of the two instants. An empty pattern or an empty range yields an
/// empty vector.
pub fn expand_weekly(
    pattern: &WeeklyPattern,
    tz: Tz,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    if pattern.is_empty() || from >= to {
        return Vec::new();
    }

    // Walk local calendar days. The local date of `from` can be behind the
    // UTC date, so start one day early and let the range filter trim.
    let first_day = from.with_timezone(&tz).date_naive() - Duration::days(1);
    let last_day = to.with_timezone(&tz).date_naive() + Duration::days(1);

    let mut out = Vec::new();
    let mut day = first_day;
    while day <= last_day {
        if pattern.weekdays.contains(&day.weekday()) {
            for &time in &pattern.start_times {
                let Some(local) = tz.from_local_datetime(&day.and_time(time)).earliest() else {
                    // Wall-clock time does not exist on this day (DST gap).
                    continue;
                };
                let instant = local.with_timezone(&Utc);
                if from <= instant && instant < to {
                    out.push(instant);
                }
            }
        }
        day += Duration::days(1);
    }

    out.sort_unstable();
    out.dedup();
    out
}
