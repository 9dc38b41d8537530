//! Slot resolution.
//!
//! Slots are never stored: every query recomputes them from the current
//! rules, exceptions, imported busy intervals, and bookings. A slot exists
//! exactly when an active rule produces it and nothing removes it.
//!
//! Precedence, strongest first: exceptions, then imported busy time, then
//! overlapping bookings, then per-departure capacity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use uuid::Uuid;

use tourflow_core::{
    expand_weekly, AvailabilityRule, Booking, BookingSource, ResolvedSlot, TimeInterval, Tour,
    TourSource,
};
use tourflow_feeds::{FeedRegistry, StaleFeed};

use crate::error::{EngineError, EngineResult};

/// The outcome of one resolution query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// Bookable departures, ascending by start time.
    pub slots: Vec<ResolvedSlot>,
    /// Feeds whose busy data may be out of date. The slots above were still
    /// computed against their last known snapshot.
    pub stale_feeds: Vec<StaleFeed>,
}

/// Computes bookable slots for a tour over a time range.
pub struct SlotResolver {
    rules: Arc<crate::store::RuleStore>,
    exceptions: Arc<crate::store::ExceptionStore>,
    feeds: Arc<FeedRegistry>,
    tours: Arc<dyn TourSource>,
    bookings: Arc<dyn BookingSource>,
}

impl SlotResolver {
    /// Creates a resolver over the given collaborators.
    pub fn new(
        rules: Arc<crate::store::RuleStore>,
        exceptions: Arc<crate::store::ExceptionStore>,
        feeds: Arc<FeedRegistry>,
        tours: Arc<dyn TourSource>,
        bookings: Arc<dyn BookingSource>,
    ) -> Self {
        Self {
            rules,
            exceptions,
            feeds,
            tours,
            bookings,
        }
    }

    /// Resolves the bookable slots for `tour_id` with starts in
    /// `[range_start, range_end)`, as seen at `as_of`.
    #[instrument(skip(self), fields(tour = %tour_id))]
    pub fn resolve_slots(
        &self,
        tour_id: Uuid,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        as_of: DateTime<Utc>,
    ) -> EngineResult<Resolution> {
        if range_start >= range_end {
            return Err(EngineError::InvalidRange {
                start: range_start,
                end: range_end,
            });
        }
        let tour = self
            .tours
            .tour(tour_id)
            .ok_or(EngineError::TourNotFound { tour_id })?;

        let rules = self.rules.rules_for_tour(tour_id);
        let exceptions = self.exceptions.exceptions_for_tour(tour_id);
        let busy = self.feeds.guide_busy(tour.guide_id, as_of);

        // Bookings that merely overlap the range can still block its slots,
        // so the window is widened by one departure length on each side.
        let window = TimeInterval::new(range_start - tour.duration(), range_end + tour.duration());
        let bookings = self.bookings.active_bookings(tour_id, window);

        let mut slots: Vec<ResolvedSlot> = Vec::new();
        for rule in rules.iter().filter(|r| r.active) {
            let earliest = as_of + rule.lead_time();
            for start in expand_weekly(&rule.pattern(), tour.timezone, range_start, range_end) {
                if start < earliest {
                    continue;
                }
                let interval = tour.departure_interval(start);
                if exceptions.iter().any(|e| e.interval().overlaps(&interval)) {
                    continue;
                }
                if busy.intervals.iter().any(|b| b.interval.overlaps(&interval)) {
                    continue;
                }
                if let Some(capacity) = remaining_capacity(&tour, rule, interval, &bookings, as_of)
                {
                    slots.push(ResolvedSlot {
                        tour_id,
                        start_time: interval.start,
                        end_time: interval.end,
                        capacity_remaining: capacity,
                    });
                }
            }
        }

        // Two rules can produce the same departure; keep the roomier one.
        slots.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then(b.capacity_remaining.cmp(&a.capacity_remaining))
        });
        slots.dedup_by_key(|s| s.start_time);

        debug!(
            slots = slots.len(),
            stale_feeds = busy.stale_feeds.len(),
            "Resolved slots"
        );
        Ok(Resolution {
            slots,
            stale_feeds: busy.stale_feeds,
        })
    }

    /// Re-checks that a departure still has room for `participants`.
    ///
    /// Called by the booking service immediately before it persists a
    /// booking, to close the window between browsing and booking.
    pub fn confirm_capacity(
        &self,
        tour_id: Uuid,
        start: DateTime<Utc>,
        participants: i32,
        as_of: DateTime<Utc>,
    ) -> EngineResult<ResolvedSlot> {
        if participants <= 0 {
            return Err(EngineError::validation(format!(
                "participants must be positive, got {}",
                participants
            )));
        }

        let resolution =
            self.resolve_slots(tour_id, start, start + chrono::Duration::seconds(1), as_of)?;
        let slot = resolution
            .slots
            .into_iter()
            .find(|s| s.start_time == start)
            .ok_or(EngineError::CapacityRace {
                tour_id,
                start,
                requested: participants,
                remaining: 0,
            })?;

        if slot.capacity_remaining < participants {
            return Err(EngineError::CapacityRace {
                tour_id,
                start,
                requested: participants,
                remaining: slot.capacity_remaining,
            });
        }
        Ok(slot)
    }
}

/// Returns the seats left for a departure, or `None` if a booking blocks it
/// or no seat remains.
fn remaining_capacity(
    tour: &Tour,
    rule: &AvailabilityRule,
    interval: TimeInterval,
    bookings: &[Booking],
    as_of: DateTime<Utc>,
) -> Option<i32> {
    let mut taken = 0i32;
    for booking in bookings {
        if !booking.consumes_capacity_at(as_of) {
            continue;
        }
        if booking.start == interval.start {
            taken += booking.participants;
        } else if booking.interval(tour.duration()).overlaps(&interval) {
            // A departure already underway elsewhere in the schedule blocks
            // this one outright.
            return None;
        }
    }

    let capacity = rule.max_capacity.min(tour.max_capacity) - taken;
    (capacity > 0).then_some(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ExceptionStore, RuleDraft, RuleStore};
    use chrono::{Duration, NaiveTime, TimeZone, Weekday};
    use chrono_tz::{Europe::Paris, UTC};
    use tourflow_core::{InMemoryBookings, InMemoryTours};
    use tourflow_feeds::FeedConfig;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    struct Fixture {
        resolver: SlotResolver,
        rules: Arc<RuleStore>,
        exceptions: Arc<ExceptionStore>,
        feeds: Arc<FeedRegistry>,
        tours: Arc<InMemoryTours>,
        bookings: Arc<InMemoryBookings>,
        tour: Tour,
    }

    fn fixture() -> Fixture {
        let rules = Arc::new(RuleStore::new());
        let exceptions = Arc::new(ExceptionStore::new());
        let feeds = Arc::new(FeedRegistry::new(FeedConfig::default()));
        let tours = Arc::new(InMemoryTours::new());
        let bookings = Arc::new(InMemoryBookings::new());

        let tour = Tour::new(Uuid::new_v4(), Uuid::new_v4(), "City walk", 10, 120, UTC);
        tours.insert(tour.clone());
        bookings.register_tour(tour.id, tour.guide_id);

        let resolver = SlotResolver::new(
            rules.clone(),
            exceptions.clone(),
            feeds.clone(),
            tours.clone(),
            bookings.clone(),
        );
        Fixture {
            resolver,
            rules,
            exceptions,
            feeds,
            tours,
            bookings,
            tour,
        }
    }

    fn monday_rule(capacity: i32) -> RuleDraft {
        RuleDraft {
            weekdays: vec![Weekday::Mon],
            start_times: vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap()],
            max_capacity: capacity,
            min_booking_lead_hours: Some(0),
        }
    }

    // January 2024 has Mondays on the 1st, 8th, 15th, 22nd, and 29th; this
    // range covers the first four.
    fn range_start() -> DateTime<Utc> {
        utc(2024, 1, 1, 0)
    }

    fn range_end() -> DateTime<Utc> {
        utc(2024, 1, 29, 0)
    }

    fn resolve(f: &Fixture) -> Resolution {
        f.resolver
            .resolve_slots(f.tour.id, range_start(), range_end(), utc(2023, 12, 1, 0))
            .unwrap()
    }

    #[test]
    fn weekly_rule_produces_one_slot_per_occurrence() {
        let f = fixture();
        f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();

        let resolution = resolve(&f);
        assert_eq!(
            resolution.slots.iter().map(|s| s.start_time).collect::<Vec<_>>(),
            vec![
                utc(2024, 1, 1, 9),
                utc(2024, 1, 8, 9),
                utc(2024, 1, 15, 9),
                utc(2024, 1, 22, 9),
            ]
        );
        assert!(resolution.slots.iter().all(|s| s.capacity_remaining == 10));
        assert!(resolution.slots.iter().all(|s| s.end_time - s.start_time
            == Duration::minutes(120)));
        assert!(resolution.stale_feeds.is_empty());
    }

    #[test]
    fn resolution_is_idempotent() {
        let f = fixture();
        f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();

        assert_eq!(resolve(&f), resolve(&f));
    }

    #[test]
    fn exception_removes_overlapping_slots() {
        let f = fixture();
        f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
        f.exceptions
            .create_exception(f.tour.id, utc(2024, 1, 8, 0), utc(2024, 1, 9, 0), "day off")
            .unwrap();

        let starts: Vec<_> = resolve(&f).slots.iter().map(|s| s.start_time).collect();
        assert!(!starts.contains(&utc(2024, 1, 8, 9)));
        assert_eq!(starts.len(), 3);
    }

    #[test]
    fn booking_at_slot_start_reduces_capacity() {
        let f = fixture();
        f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
        f.bookings.insert(Booking::confirmed(
            Uuid::new_v4(),
            f.tour.id,
            utc(2024, 1, 1, 9),
            3,
        ));

        let resolution = resolve(&f);
        assert_eq!(resolution.slots[0].start_time, utc(2024, 1, 1, 9));
        assert_eq!(resolution.slots[0].capacity_remaining, 7);
        assert_eq!(resolution.slots[1].capacity_remaining, 10);
    }

    #[test]
    fn fully_booked_departure_disappears() {
        let f = fixture();
        f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
        f.bookings.insert(Booking::confirmed(
            Uuid::new_v4(),
            f.tour.id,
            utc(2024, 1, 1, 9),
            10,
        ));

        let starts: Vec<_> = resolve(&f).slots.iter().map(|s| s.start_time).collect();
        assert!(!starts.contains(&utc(2024, 1, 1, 9)));
    }

    #[test]
    fn overlapping_booking_at_other_start_blocks_slot() {
        let f = fixture();
        f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
        // A departure at 08:00 runs until 10:00 and collides with the 09:00
        // slot without sharing its start.
        f.bookings.insert(Booking::confirmed(
            Uuid::new_v4(),
            f.tour.id,
            utc(2024, 1, 1, 8),
            1,
        ));

        let starts: Vec<_> = resolve(&f).slots.iter().map(|s| s.start_time).collect();
        assert!(!starts.contains(&utc(2024, 1, 1, 9)));
        assert!(starts.contains(&utc(2024, 1, 8, 9)));
    }

    #[test]
    fn expired_pending_hold_frees_capacity() {
        let f = fixture();
        f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
        f.bookings.insert(Booking::pending(
            Uuid::new_v4(),
            f.tour.id,
            utc(2024, 1, 1, 9),
            4,
            utc(2023, 12, 15, 0),
        ));

        // Before the hold lapses it consumes seats.
        let before = f
            .resolver
            .resolve_slots(f.tour.id, range_start(), range_end(), utc(2023, 12, 1, 0))
            .unwrap();
        assert_eq!(before.slots[0].capacity_remaining, 6);

        // After it lapses the seats come back.
        let after = f
            .resolver
            .resolve_slots(f.tour.id, range_start(), range_end(), utc(2023, 12, 20, 0))
            .unwrap();
        assert_eq!(after.slots[0].capacity_remaining, 10);
    }

    #[test]
    fn lead_time_hides_imminent_departures() {
        let f = fixture();
        f.rules
            .create_rule(
                &f.tour,
                RuleDraft {
                    min_booking_lead_hours: Some(24),
                    ..monday_rule(10)
                },
            )
            .unwrap();

        // As of Sunday Dec 31 at 12:00, the Monday 09:00 departure is only
        // 21 hours away.
        let resolution = f
            .resolver
            .resolve_slots(f.tour.id, range_start(), range_end(), utc(2023, 12, 31, 12))
            .unwrap();
        let starts: Vec<_> = resolution.slots.iter().map(|s| s.start_time).collect();
        assert!(!starts.contains(&utc(2024, 1, 1, 9)));
        assert!(starts.contains(&utc(2024, 1, 8, 9)));
    }

    #[test]
    fn inactive_rules_produce_nothing() {
        let f = fixture();
        let rule = f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
        f.rules.set_rule_active(f.tour.id, rule.id, false).unwrap();

        assert!(resolve(&f).slots.is_empty());
    }

    #[test]
    fn duplicate_departure_keeps_larger_capacity() {
        let f = fixture();
        f.rules.create_rule(&f.tour, monday_rule(4)).unwrap();
        f.rules.create_rule(&f.tour, monday_rule(8)).unwrap();

        let resolution = resolve(&f);
        assert_eq!(resolution.slots.len(), 4);
        assert!(resolution.slots.iter().all(|s| s.capacity_remaining == 8));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let f = fixture();
        let err = f
            .resolver
            .resolve_slots(f.tour.id, utc(2024, 1, 29, 0), utc(2024, 1, 1, 0), utc(2023, 12, 1, 0))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange { .. }));

        // Degenerate ranges are invalid too.
        let err = f
            .resolver
            .resolve_slots(f.tour.id, utc(2024, 1, 1, 0), utc(2024, 1, 1, 0), utc(2023, 12, 1, 0))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidRange { .. }));
    }

    #[test]
    fn unknown_tour_is_rejected() {
        let f = fixture();
        let err = f
            .resolver
            .resolve_slots(Uuid::new_v4(), range_start(), range_end(), utc(2023, 12, 1, 0))
            .unwrap_err();
        assert!(matches!(err, EngineError::TourNotFound { .. }));
    }

    #[test]
    fn rule_times_follow_the_tour_timezone_across_dst() {
        let f = fixture();
        let tour = Tour::new(Uuid::new_v4(), Uuid::new_v4(), "Paris walk", 10, 120, Paris);
        f.tours.insert(tour.clone());
        f.rules.create_rule(&tour, monday_rule(10)).unwrap();

        // The last Monday of March 2024 falls after the spring DST change.
        let resolution = f
            .resolver
            .resolve_slots(tour.id, utc(2024, 3, 1, 0), utc(2024, 4, 1, 0), utc(2024, 2, 1, 0))
            .unwrap();
        let starts: Vec<_> = resolution.slots.iter().map(|s| s.start_time).collect();
        // 09:00 CET is 08:00 UTC; 09:00 CEST is 07:00 UTC.
        assert!(starts.contains(&utc(2024, 3, 25, 8)));
        assert!(!starts.contains(&utc(2024, 3, 25, 9)));
        assert!(starts.contains(&utc(2024, 3, 4, 8)));
    }

    mod external_busy {
        use super::*;
        use tourflow_feeds::{BoxFuture, FeedResult, FetchFeed, FetchOutcome, Validators};

        struct OneShotFetcher {
            body: String,
        }

        impl FetchFeed for OneShotFetcher {
            fn fetch_feed<'a>(
                &'a self,
                _url: &'a str,
                _validators: &'a Validators,
            ) -> BoxFuture<'a, FeedResult<FetchOutcome>> {
                Box::pin(async move {
                    Ok(FetchOutcome::Fetched {
                        body: self.body.clone(),
                        validators: Validators::default(),
                    })
                })
            }
        }

        fn ics_blocking(start: &str, end: &str) -> String {
            format!(
                "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\n\
                 UID:dentist@example.com\r\nSUMMARY:Dentist\r\n\
                 DTSTART:{start}\r\nDTEND:{end}\r\n\
                 END:VEVENT\r\nEND:VCALENDAR"
            )
        }

        #[tokio::test]
        async fn imported_busy_time_blocks_overlapping_slots() {
            let f = fixture();
            f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
            let feed = f
                .feeds
                .add_feed(f.tour.guide_id, "personal", "https://example.com/cal.ics")
                .unwrap();

            // Busy 10:00-11:00 on Jan 8 overlaps the 09:00-11:00 departure.
            let fetcher = OneShotFetcher {
                body: ics_blocking("20240108T100000Z", "20240108T110000Z"),
            };
            f.feeds.sync_feed(feed.id, &fetcher).await.unwrap();

            let resolution = f
                .resolver
                .resolve_slots(f.tour.id, range_start(), range_end(), utc(2023, 12, 1, 0))
                .unwrap();
            let starts: Vec<_> = resolution.slots.iter().map(|s| s.start_time).collect();
            assert!(!starts.contains(&utc(2024, 1, 8, 9)));
            assert!(starts.contains(&utc(2024, 1, 1, 9)));
            assert!(resolution.stale_feeds.is_empty());
        }

        #[tokio::test]
        async fn never_synced_feed_is_reported_stale_but_does_not_block() {
            let f = fixture();
            f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
            let feed = f
                .feeds
                .add_feed(f.tour.guide_id, "personal", "https://example.com/cal.ics")
                .unwrap();

            let resolution = resolve(&f);
            assert_eq!(resolution.slots.len(), 4);
            assert_eq!(resolution.stale_feeds.len(), 1);
            assert_eq!(resolution.stale_feeds[0].feed_id, feed.id);
        }
    }

    mod capacity_confirmation {
        use super::*;

        #[test]
        fn confirms_when_seats_remain() {
            let f = fixture();
            f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();

            let slot = f
                .resolver
                .confirm_capacity(f.tour.id, utc(2024, 1, 1, 9), 4, utc(2023, 12, 1, 0))
                .unwrap();
            assert_eq!(slot.capacity_remaining, 10);
        }

        #[test]
        fn races_when_seats_ran_out() {
            let f = fixture();
            f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
            f.bookings.insert(Booking::confirmed(
                Uuid::new_v4(),
                f.tour.id,
                utc(2024, 1, 1, 9),
                8,
            ));

            let err = f
                .resolver
                .confirm_capacity(f.tour.id, utc(2024, 1, 1, 9), 4, utc(2023, 12, 1, 0))
                .unwrap_err();
            match err {
                EngineError::CapacityRace {
                    requested,
                    remaining,
                    ..
                } => {
                    assert_eq!(requested, 4);
                    assert_eq!(remaining, 2);
                }
                other => panic!("expected CapacityRace, got {other:?}"),
            }
        }

        #[test]
        fn races_when_slot_no_longer_exists() {
            let f = fixture();
            f.rules.create_rule(&f.tour, monday_rule(10)).unwrap();
            f.exceptions
                .create_exception(f.tour.id, utc(2024, 1, 1, 0), utc(2024, 1, 2, 0), "off")
                .unwrap();

            let err = f
                .resolver
                .confirm_capacity(f.tour.id, utc(2024, 1, 1, 9), 1, utc(2023, 12, 1, 0))
                .unwrap_err();
            assert!(matches!(err, EngineError::CapacityRace { remaining: 0, .. }));
        }

        #[test]
        fn rejects_non_positive_participants() {
            let f = fixture();
            assert!(f
                .resolver
                .confirm_capacity(f.tour.id, utc(2024, 1, 1, 9), 0, utc(2023, 12, 1, 0))
                .is_err());
        }
    }
}
