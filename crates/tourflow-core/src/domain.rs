//! Domain model for the scheduling core.
//!
//! This module provides the entities the resolution engine reads:
//! - [`Tour`]: capacity, duration, and timezone for a bookable tour
//! - [`AvailabilityRule`]: a recurring weekly availability pattern
//! - [`AvailabilityException`]: an ad hoc blackout interval
//! - [`BusyInterval`]: busy time imported from an external calendar feed
//! - [`Booking`]: a reference to a booking held by the booking service
//! - [`ResolvedSlot`]: the ephemeral output of slot resolution

use chrono::{DateTime, Duration, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recurrence::WeeklyPattern;
use crate::time::TimeInterval;

/// A bookable tour, owned by a guide.
///
/// Immutable from the engine's point of view; tour management lives in an
/// external collaborator and is read through [`crate::sources::TourSource`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tour {
    /// Unique identifier.
    pub id: Uuid,
    /// The guide who runs this tour.
    pub guide_id: Uuid,
    /// Display title, used as the exported VEVENT summary.
    pub title: String,
    /// Meeting point / location, if known.
    pub location: Option<String>,
    /// Hard capacity ceiling for any single departure.
    pub max_capacity: i32,
    /// Length of one departure.
    pub duration_minutes: i64,
    /// The timezone rule times are interpreted in.
    pub timezone: Tz,
}

impl Tour {
    /// Creates a tour with the given identity and constraints.
    pub fn new(
        id: Uuid,
        guide_id: Uuid,
        title: impl Into<String>,
        max_capacity: i32,
        duration_minutes: i64,
        timezone: Tz,
    ) -> Self {
        Self {
            id,
            guide_id,
            title: title.into(),
            location: None,
            max_capacity,
            duration_minutes,
            timezone,
        }
    }

    /// Builder method to set the location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Returns the duration of one departure.
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes)
    }

    /// Returns the interval occupied by a departure starting at `start`.
    pub fn departure_interval(&self, start: DateTime<Utc>) -> TimeInterval {
        TimeInterval::from_duration(start, self.duration())
    }
}

/// Default minimum booking lead time when a rule does not specify one.
pub const DEFAULT_LEAD_HOURS: i64 = 12;

/// A recurring weekly availability pattern for a tour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    /// Unique identifier.
    pub id: Uuid,
    /// The tour this rule belongs to.
    pub tour_id: Uuid,
    /// Whether the rule currently produces slots.
    pub active: bool,
    /// Weekdays the rule fires on.
    pub weekdays: Vec<Weekday>,
    /// Departure times of day, in the tour's timezone.
    pub start_times: Vec<NaiveTime>,
    /// Capacity per departure; never exceeds the tour's capacity.
    pub max_capacity: i32,
    /// Minimum hours between "now" and a bookable departure.
    pub min_booking_lead_hours: i64,
    /// Creation time, used for deterministic listing order.
    pub created_at: DateTime<Utc>,
}

impl AvailabilityRule {
    /// Returns the rule's recurrence pattern.
    pub fn pattern(&self) -> WeeklyPattern {
        WeeklyPattern {
            weekdays: self.weekdays.clone(),
            start_times: self.start_times.clone(),
        }
    }

    /// Returns the minimum lead time as a duration.
    pub fn lead_time(&self) -> Duration {
        Duration::hours(self.min_booking_lead_hours)
    }
}

/// A one-off blackout interval for a tour, overriding all rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityException {
    /// Unique identifier.
    pub id: Uuid,
    /// The tour this blackout applies to.
    pub tour_id: Uuid,
    /// Start of the blackout (inclusive).
    pub start_date: DateTime<Utc>,
    /// End of the blackout (exclusive).
    pub end_date: DateTime<Utc>,
    /// Free-text reason shown to the guide.
    pub reason: String,
    /// Creation time, used for deterministic listing order.
    pub created_at: DateTime<Utc>,
}

impl AvailabilityException {
    /// Returns the blackout as an interval.
    pub fn interval(&self) -> TimeInterval {
        TimeInterval::new(self.start_date, self.end_date)
    }
}

/// A busy interval imported from an external calendar feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyInterval {
    /// The feed this interval came from.
    pub feed_id: Uuid,
    /// The busy time range.
    pub interval: TimeInterval,
    /// Event summary from the source calendar, if present.
    pub summary: Option<String>,
}

impl BusyInterval {
    /// Creates a busy interval for a feed.
    pub fn new(feed_id: Uuid, interval: TimeInterval) -> Self {
        Self {
            feed_id,
            interval,
            summary: None,
        }
    }

    /// Builder method to set the summary.
    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Lifecycle state of a booking, as reported by the booking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Awaiting payment; holds capacity until it expires.
    Pending,
    /// Paid and confirmed.
    Confirmed,
    /// Cancelled by the customer or guide.
    Cancelled,
    /// A pending booking whose payment window lapsed.
    Expired,
}

/// A booking held by the external booking service.
///
/// Referenced, never owned: the engine only reads bookings to compute
/// remaining capacity and to export the guide's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Unique identifier.
    pub id: Uuid,
    /// The tour booked.
    pub tour_id: Uuid,
    /// Departure start time.
    pub start: DateTime<Utc>,
    /// Number of participants.
    pub participants: i32,
    /// Current lifecycle state.
    pub status: BookingStatus,
    /// For pending bookings, when the payment hold lapses.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Booking {
    /// Creates a confirmed booking.
    pub fn confirmed(id: Uuid, tour_id: Uuid, start: DateTime<Utc>, participants: i32) -> Self {
        Self {
            id,
            tour_id,
            start,
            participants,
            status: BookingStatus::Confirmed,
            expires_at: None,
        }
    }

    /// Creates a pending booking holding capacity until `expires_at`.
    pub fn pending(
        id: Uuid,
        tour_id: Uuid,
        start: DateTime<Utc>,
        participants: i32,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tour_id,
            start,
            participants,
            status: BookingStatus::Pending,
            expires_at: Some(expires_at),
        }
    }

    /// Builder method to set the status.
    pub fn with_status(mut self, status: BookingStatus) -> Self {
        self.status = status;
        self
    }

    /// Whether this booking consumes capacity as of the given time.
    ///
    /// Confirmed bookings always do; pending bookings only until their hold
    /// lapses; cancelled and expired bookings never do.
    pub fn consumes_capacity_at(&self, as_of: DateTime<Utc>) -> bool {
        match self.status {
            BookingStatus::Confirmed => true,
            BookingStatus::Pending => self.expires_at.is_none_or(|e| as_of < e),
            BookingStatus::Cancelled | BookingStatus::Expired => false,
        }
    }

    /// Returns the interval occupied by this booking for a tour of the given
    /// duration.
    pub fn interval(&self, duration: Duration) -> TimeInterval {
        TimeInterval::from_duration(self.start, duration)
    }
}

/// A concrete bookable departure, computed fresh on every resolution call.
///
/// Never persisted and never mutated after construction; the durable side
/// effect of consuming a slot is a booking, created by the booking service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSlot {
    /// The tour this slot belongs to.
    pub tour_id: Uuid,
    /// Departure start.
    pub start_time: DateTime<Utc>,
    /// Departure end.
    pub end_time: DateTime<Utc>,
    /// Seats still available.
    pub capacity_remaining: i32,
}

impl ResolvedSlot {
    /// Returns the slot as an interval.
    pub fn interval(&self) -> TimeInterval {
        TimeInterval::new(self.start_time, self.end_time)
    }
}
