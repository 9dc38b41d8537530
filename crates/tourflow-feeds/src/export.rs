//! iCalendar export of a guide's confirmed departures.
//!
//! Produces one VEVENT per confirmed booking so guides can overlay their
//! tour schedule on a personal calendar. Events carry `TRANSP:OPAQUE` and
//! are timestamped in the tour's timezone, so a subscribing calendar shows
//! them at the correct wall-clock time year-round.

use icalendar::{Calendar, CalendarDateTime, Component, DatePerhapsTime, Event, EventLike};
use tracing::debug;
use uuid::Uuid;

use tourflow_core::{Booking, BookingSource, Tour, TourSource};

use crate::error::{FeedError, FeedResult};

/// Domain suffix for exported event UIDs.
const UID_DOMAIN: &str = "tourflow";

/// Builds an iCalendar document with every confirmed booking across the
/// guide's tours.
///
/// A guide with no confirmed bookings gets a valid, empty calendar.
pub fn export_guide_calendar(
    guide_id: Uuid,
    tours: &dyn TourSource,
    bookings: &dyn BookingSource,
) -> FeedResult<String> {
    let owned = tours.tours_for_guide(guide_id);
    let confirmed = bookings.confirmed_for_guide(guide_id);

    let mut calendar = Calendar::new();
    calendar.name("Tour departures");

    let mut exported = 0usize;
    for booking in &confirmed {
        let tour = owned.iter().find(|t| t.id == booking.tour_id).ok_or_else(|| {
            FeedError::internal(format!(
                "booking {} references tour {} not owned by guide {}",
                booking.id, booking.tour_id, guide_id
            ))
        })?;
        calendar.push(departure_event(tour, booking));
        exported += 1;
    }

    debug!(guide = %guide_id, events = exported, "Exported guide calendar");
    Ok(calendar.to_string())
}

fn departure_event(tour: &Tour, booking: &Booking) -> Event {
    let interval = booking.interval(tour.duration());
    let mut event = Event::new();
    event
        .uid(&format!("{}@{}", booking.id, UID_DOMAIN))
        .summary(&tour.title)
        .description(&format!(
            "{}, {} participant(s)",
            tour.title, booking.participants
        ))
        .starts(zoned(tour, interval.start))
        .ends(zoned(tour, interval.end))
        .add_property("TRANSP", "OPAQUE");
    if let Some(ref location) = tour.location {
        event.location(location);
    }
    event.done()
}

fn zoned(tour: &Tour, instant: chrono::DateTime<chrono::Utc>) -> DatePerhapsTime {
    DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone {
        date_time: instant.with_timezone(&tour.timezone).naive_local(),
        tzid: tour.timezone.name().to_string(),
    })
}
