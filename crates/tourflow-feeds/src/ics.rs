//! iCalendar (RFC 5545) parsing for external feeds.
//!
//! Imported feeds are reduced to the one thing resolution cares about: busy
//! intervals. Each VEVENT yields one interval; events carrying an RRULE are
//! expanded within the sync horizon for DAILY and WEEKLY frequencies, which
//! covers the recurring blocks real calendar apps emit.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use icalendar::{Calendar, CalendarComponent, CalendarDateTime, Component, DatePerhapsTime, Event};
use tracing::{debug, warn};
use uuid::Uuid;

use tourflow_core::{BusyInterval, TimeInterval};

use crate::error::{FeedError, FeedResult};

/// Upper bound on occurrences expanded from a single RRULE.
const MAX_OCCURRENCES: usize = 1000;

/// Parses feed content into busy intervals overlapping the horizon.
///
/// Individual malformed events are skipped with a warning; a body that is not
/// iCalendar at all is a parse error, which the registry records as a failed
/// sync.
pub fn parse_busy_intervals(
    ics: &str,
    feed_id: Uuid,
    horizon: TimeInterval,
) -> FeedResult<Vec<BusyInterval>> {
    let calendar: Calendar = ics
        .parse()
        .map_err(|e: String| FeedError::parse(format!("not an iCalendar document: {}", e)))?;

    let mut out = Vec::new();
    for component in calendar.iter() {
        let CalendarComponent::Event(event) = component else {
            continue;
        };
        let Some(occurrences) = event_occurrences(event, horizon.end) else {
            warn!(feed = %feed_id, "Skipping event without usable start/end");
            continue;
        };
        let summary = event.get_summary().map(str::to_string);
        for interval in occurrences {
            if !interval.overlaps(&horizon) {
                continue;
            }
            let mut busy = BusyInterval::new(feed_id, interval);
            if let Some(ref s) = summary {
                busy.summary = Some(s.clone());
            }
            out.push(busy);
        }
    }

    out.sort_by_key(|b| b.interval);
    debug!(feed = %feed_id, intervals = out.len(), "Parsed feed");
    Ok(out)
}

/// Returns the occupied intervals of one VEVENT, expanded up to `limit`.
fn event_occurrences(event: &Event, limit: DateTime<Utc>) -> Option<Vec<TimeInterval>> {
    let start = event.get_start()?;
    let base = base_interval(start.clone(), event.get_end())?;

    let Some(rrule) = event.property_value("RRULE").and_then(RRule::parse) else {
        return Some(vec![base]);
    };

    // Expansion works on wall-clock time so a weekly 09:00 block stays at
    // 09:00 across DST transitions, matching the emitting calendar.
    let (anchor_local, tz) = local_anchor(start);
    Some(rrule.expand(anchor_local, tz, base.duration(), limit))
}

/// Computes the event's first occurrence as a UTC interval.
fn base_interval(start: DatePerhapsTime, end: Option<DatePerhapsTime>) -> Option<TimeInterval> {
    let start_utc = to_utc(&start)?;
    let end_utc = match end {
        Some(e) => to_utc(&e)?,
        // RFC 5545 defaults: one day for date-valued starts, zero otherwise.
        None => match start {
            DatePerhapsTime::Date(_) => start_utc + Duration::days(1),
            DatePerhapsTime::DateTime(_) => start_utc,
        },
    };
    TimeInterval::checked(start_utc, end_utc)
}

/// Converts an iCalendar date-or-datetime to UTC.
///
/// Date values become midnight UTC; floating times are taken as UTC; zoned
/// times resolve their TZID through chrono-tz, falling back to UTC for
/// unknown zone names.
fn to_utc(dt: &DatePerhapsTime) -> Option<DateTime<Utc>> {
    match dt {
        DatePerhapsTime::Date(date) => Some(date.and_hms_opt(0, 0, 0)?.and_utc()),
        DatePerhapsTime::DateTime(cdt) => match cdt {
            CalendarDateTime::Utc(dt) => Some(*dt),
            CalendarDateTime::Floating(naive) => Some(Utc.from_utc_datetime(naive)),
            CalendarDateTime::WithTimezone { date_time, tzid } => match tzid.parse::<Tz>() {
                Ok(tz) => tz
                    .from_local_datetime(date_time)
                    .earliest()
                    .map(|local| local.with_timezone(&Utc)),
                Err(_) => {
                    warn!(tzid = %tzid, "Unknown TZID, assuming UTC");
                    Some(Utc.from_utc_datetime(date_time))
                }
            },
        },
    }
}

/// Returns the event start as wall-clock time plus the zone it lives in.
fn local_anchor(start: DatePerhapsTime) -> (NaiveDateTime, Tz) {
    match start {
        DatePerhapsTime::Date(date) => (
            date.and_hms_opt(0, 0, 0).expect("midnight is valid"),
            chrono_tz::UTC,
        ),
        DatePerhapsTime::DateTime(cdt) => match cdt {
            CalendarDateTime::Utc(dt) => (dt.naive_utc(), chrono_tz::UTC),
            CalendarDateTime::Floating(naive) => (naive, chrono_tz::UTC),
            CalendarDateTime::WithTimezone { date_time, tzid } => {
                let tz = tzid.parse::<Tz>().unwrap_or(chrono_tz::UTC);
                (date_time, tz)
            }
        },
    }
}

/// Recurrence frequency; only the shapes seen in real feeds are expanded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freq {
    Daily,
    Weekly,
}

/// A parsed RRULE, limited to the parts the importer understands.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RRule {
    freq: Freq,
    interval: u32,
    count: Option<u32>,
    until: Option<DateTime<Utc>>,
    by_day: Vec<Weekday>,
}

impl RRule {
    /// Parses an RRULE property value such as
    /// `FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE;UNTIL=20240601T000000Z`.
    ///
    /// Returns `None` for frequencies the importer does not expand; the
    /// caller then keeps the base occurrence only.
    fn parse(value: &str) -> Option<Self> {
        let mut freq = None;
        let mut interval = 1;
        let mut count = None;
        let mut until = None;
        let mut by_day = Vec::new();

        for part in value.split(';') {
            let Some((key, val)) = part.split_once('=') else {
                continue;
            };
            match key.trim().to_ascii_uppercase().as_str() {
                "FREQ" => {
                    freq = match val.trim().to_ascii_uppercase().as_str() {
                        "DAILY" => Some(Freq::Daily),
                        "WEEKLY" => Some(Freq::Weekly),
                        other => {
                            warn!(freq = %other, "Unsupported RRULE frequency, keeping base occurrence");
                            return None;
                        }
                    };
                }
                "INTERVAL" => interval = val.trim().parse().unwrap_or(1),
                "COUNT" => count = val.trim().parse().ok(),
                "UNTIL" => until = parse_until(val.trim()),
                "BYDAY" => {
                    by_day = val
                        .split(',')
                        .filter_map(|d| parse_weekday(d.trim()))
                        .collect();
                }
                _ => {}
            }
        }

        Some(Self {
            freq: freq?,
            interval: interval.max(1),
            count,
            until,
            by_day,
        })
    }

    /// Expands the rule into UTC intervals, stopping at `limit`, UNTIL,
    /// COUNT, or the occurrence cap, whichever comes first.
    fn expand(
        &self,
        anchor: NaiveDateTime,
        tz: Tz,
        duration: Duration,
        limit: DateTime<Utc>,
    ) -> Vec<TimeInterval> {
        let anchor_weekday = anchor.weekday();
        let weekdays: &[Weekday] = if self.freq == Freq::Weekly && !self.by_day.is_empty() {
            &self.by_day
        } else {
            std::slice::from_ref(&anchor_weekday)
        };
        // Week index is relative to the Monday of the anchor's week.
        let anchor_week_start =
            anchor.date() - Duration::days(anchor_weekday.num_days_from_monday() as i64);

        let mut out = Vec::new();
        let mut date = anchor.date();
        while out.len() < MAX_OCCURRENCES {
            let matches = match self.freq {
                Freq::Daily => {
                    (date - anchor.date()).num_days() % (self.interval as i64) == 0
                }
                Freq::Weekly => {
                    let week = (date - anchor_week_start).num_days() / 7;
                    week % (self.interval as i64) == 0 && weekdays.contains(&date.weekday())
                }
            };

            if matches {
                if let Some(local) = tz.from_local_datetime(&date.and_time(anchor.time())).earliest()
                {
                    let start = local.with_timezone(&Utc);
                    if let Some(until) = self.until
                        && start > until
                    {
                        break;
                    }
                    if start >= limit {
                        break;
                    }
                    out.push(TimeInterval::from_duration(start, duration));
                    if let Some(count) = self.count
                        && out.len() >= count as usize
                    {
                        break;
                    }
                }
            }
            date += Duration::days(1);
        }
        out
    }
}

/// Parses an UNTIL value (`YYYYMMDDTHHMMSSZ`, `YYYYMMDDTHHMMSS`, or `YYYYMMDD`).
fn parse_until(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y%m%dT%H%M%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y%m%d") {
        return Some(date.and_hms_opt(23, 59, 59)?.and_utc());
    }
    None
}

/// Parses a BYDAY token (`MO`, `TU`, ...); positional prefixes are ignored.
/// Garbled tokens, including ones ending mid-character, yield `None`.
fn parse_weekday(s: &str) -> Option<Weekday> {
    let code = s.get(s.len().saturating_sub(2)..)?;
    match code {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn horizon_2024() -> TimeInterval {
        TimeInterval::new(utc(2024, 1, 1, 0, 0), utc(2025, 1, 1, 0, 0))
    }

    fn one_off_ics() -> &'static str {
        "BEGIN:VCALENDAR\r\n\
         VERSION:2.0\r\n\
         PRODID:-//Test//Test//EN\r\n\
         BEGIN:VEVENT\r\n\
         UID:busy-1@example.com\r\n\
         DTSTART:20240115T100000Z\r\n\
         DTEND:20240115T120000Z\r\n\
         SUMMARY:Dentist\r\n\
         END:VEVENT\r\n\
         END:VCALENDAR"
    }

    #[test]
    fn parse_one_off_event() {
        let feed = Uuid::new_v4();
        let busy = parse_busy_intervals(one_off_ics(), feed, horizon_2024()).unwrap();

        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].feed_id, feed);
        assert_eq!(busy[0].interval.start, utc(2024, 1, 15, 10, 0));
        assert_eq!(busy[0].interval.end, utc(2024, 1, 15, 12, 0));
        assert_eq!(busy[0].summary.as_deref(), Some("Dentist"));
    }

    #[test]
    fn all_day_event_blocks_whole_day() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   VERSION:2.0\r\n\
                   BEGIN:VEVENT\r\n\
                   UID:holiday@example.com\r\n\
                   DTSTART;VALUE=DATE:20240210\r\n\
                   DTEND;VALUE=DATE:20240211\r\n\
                   SUMMARY:Holiday\r\n\
                   END:VEVENT\r\n\
                   END:VCALENDAR";
        let busy = parse_busy_intervals(ics, Uuid::new_v4(), horizon_2024()).unwrap();

        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].interval.start, utc(2024, 2, 10, 0, 0));
        assert_eq!(busy[0].interval.end, utc(2024, 2, 11, 0, 0));
    }

    #[test]
    fn weekly_rrule_expands_within_horizon() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   VERSION:2.0\r\n\
                   BEGIN:VEVENT\r\n\
                   UID:standup@example.com\r\n\
                   DTSTART:20240101T090000Z\r\n\
                   DTEND:20240101T093000Z\r\n\
                   RRULE:FREQ=WEEKLY;BYDAY=MO;COUNT=4\r\n\
                   SUMMARY:Standup\r\n\
                   END:VEVENT\r\n\
                   END:VCALENDAR";
        let busy = parse_busy_intervals(ics, Uuid::new_v4(), horizon_2024()).unwrap();

        let starts: Vec<_> = busy.iter().map(|b| b.interval.start).collect();
        assert_eq!(
            starts,
            vec![
                utc(2024, 1, 1, 9, 0),
                utc(2024, 1, 8, 9, 0),
                utc(2024, 1, 15, 9, 0),
                utc(2024, 1, 22, 9, 0),
            ]
        );
        assert!(busy.iter().all(|b| b.interval.duration() == Duration::minutes(30)));
    }

    #[test]
    fn daily_rrule_respects_until() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   VERSION:2.0\r\n\
                   BEGIN:VEVENT\r\n\
                   UID:block@example.com\r\n\
                   DTSTART:20240301T080000Z\r\n\
                   DTEND:20240301T090000Z\r\n\
                   RRULE:FREQ=DAILY;UNTIL=20240303T080000Z\r\n\
                   END:VEVENT\r\n\
                   END:VCALENDAR";
        let busy = parse_busy_intervals(ics, Uuid::new_v4(), horizon_2024()).unwrap();

        let starts: Vec<_> = busy.iter().map(|b| b.interval.start).collect();
        assert_eq!(
            starts,
            vec![utc(2024, 3, 1, 8, 0), utc(2024, 3, 2, 8, 0), utc(2024, 3, 3, 8, 0)]
        );
    }

    #[test]
    fn unsupported_frequency_keeps_base_occurrence() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   VERSION:2.0\r\n\
                   BEGIN:VEVENT\r\n\
                   UID:monthly@example.com\r\n\
                   DTSTART:20240105T080000Z\r\n\
                   DTEND:20240105T090000Z\r\n\
                   RRULE:FREQ=MONTHLY\r\n\
                   END:VEVENT\r\n\
                   END:VCALENDAR";
        let busy = parse_busy_intervals(ics, Uuid::new_v4(), horizon_2024()).unwrap();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].interval.start, utc(2024, 1, 5, 8, 0));
    }

    #[test]
    fn events_outside_horizon_are_dropped() {
        let horizon = TimeInterval::new(utc(2024, 6, 1, 0, 0), utc(2024, 7, 1, 0, 0));
        let busy = parse_busy_intervals(one_off_ics(), Uuid::new_v4(), horizon).unwrap();
        assert!(busy.is_empty());
    }

    #[test]
    fn garbage_body_is_a_parse_error() {
        let err = parse_busy_intervals("not a calendar", Uuid::new_v4(), horizon_2024());
        assert!(err.is_err());
    }

    #[test]
    fn zero_length_marker_event_blocks_nothing() {
        // Some calendar apps emit DTSTART == DTEND marker events.
        let ics = "BEGIN:VCALENDAR\r\n\
                   VERSION:2.0\r\n\
                   BEGIN:VEVENT\r\n\
                   UID:marker@example.com\r\n\
                   DTSTART:20240115T100000Z\r\n\
                   DTEND:20240115T100000Z\r\n\
                   END:VEVENT\r\n\
                   END:VCALENDAR";
        let busy = parse_busy_intervals(ics, Uuid::new_v4(), horizon_2024()).unwrap();
        assert!(busy.is_empty());
    }

    #[test]
    fn multibyte_byday_token_is_skipped_without_panicking() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   VERSION:2.0\r\n\
                   BEGIN:VEVENT\r\n\
                   UID:mangled@example.com\r\n\
                   DTSTART:20240101T090000Z\r\n\
                   DTEND:20240101T093000Z\r\n\
                   RRULE:FREQ=WEEKLY;BYDAY=\u{e9}Q;COUNT=2\r\n\
                   END:VEVENT\r\n\
                   END:VCALENDAR";
        let busy = parse_busy_intervals(ics, Uuid::new_v4(), horizon_2024()).unwrap();

        // The unusable BYDAY falls back to the anchor weekday (Monday).
        let starts: Vec<_> = busy.iter().map(|b| b.interval.start).collect();
        assert_eq!(starts, vec![utc(2024, 1, 1, 9, 0), utc(2024, 1, 8, 9, 0)]);
    }

    #[test]
    fn zoned_times_resolve_their_tzid() {
        let ics = "BEGIN:VCALENDAR\r\n\
                   VERSION:2.0\r\n\
                   BEGIN:VEVENT\r\n\
                   UID:paris@example.com\r\n\
                   DTSTART;TZID=Europe/Paris:20240115T100000\r\n\
                   DTEND;TZID=Europe/Paris:20240115T110000\r\n\
                   END:VEVENT\r\n\
                   END:VCALENDAR";
        let busy = parse_busy_intervals(ics, Uuid::new_v4(), horizon_2024()).unwrap();
        // Paris is UTC+1 in January.
        assert_eq!(busy[0].interval.start, utc(2024, 1, 15, 9, 0));
    }

    mod rrule {
        use super::*;

        #[test]
        fn parse_full_rule() {
            let rule = RRule::parse("FREQ=WEEKLY;INTERVAL=2;BYDAY=MO,WE;COUNT=10").unwrap();
            assert_eq!(rule.freq, Freq::Weekly);
            assert_eq!(rule.interval, 2);
            assert_eq!(rule.count, Some(10));
            assert_eq!(rule.by_day, vec![Weekday::Mon, Weekday::Wed]);
        }

        #[test]
        fn weekday_tokens_tolerate_garbage() {
            assert_eq!(parse_weekday("MO"), Some(Weekday::Mon));
            assert_eq!(parse_weekday("2TU"), Some(Weekday::Tue));
            assert_eq!(parse_weekday("XX"), None);
            assert_eq!(parse_weekday("\u{e9}Q"), None); // ends mid-character
            assert_eq!(parse_weekday(""), None);
        }

        #[test]
        fn parse_until_formats() {
            assert_eq!(parse_until("20240601T120000Z"), Some(utc(2024, 6, 1, 12, 0)));
            assert!(parse_until("20240601").is_some());
            assert!(parse_until("junk").is_none());
        }

        #[test]
        fn biweekly_interval_skips_weeks() {
            let rule = RRule::parse("FREQ=WEEKLY;INTERVAL=2;COUNT=3").unwrap();
            let anchor = NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap();
            let got = rule.expand(
                anchor,
                chrono_tz::UTC,
                Duration::hours(1),
                utc(2025, 1, 1, 0, 0),
            );
            let starts: Vec<_> = got.iter().map(|iv| iv.start).collect();
            assert_eq!(
                starts,
                vec![utc(2024, 1, 1, 9, 0), utc(2024, 1, 15, 9, 0), utc(2024, 1, 29, 9, 0)]
            );
        }

        #[test]
        fn expansion_is_capped() {
            let rule = RRule::parse("FREQ=DAILY").unwrap();
            let anchor = NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap();
            let got = rule.expand(
                anchor,
                chrono_tz::UTC,
                Duration::hours(1),
                utc(2100, 1, 1, 0, 0),
            );
            assert_eq!(got.len(), MAX_OCCURRENCES);
        }
    }
}
