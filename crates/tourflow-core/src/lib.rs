//! Core types: intervals, recurrence expansion, domain model, collaborator traits

pub mod domain;
pub mod recurrence;
pub mod sources;
pub mod time;
pub mod tracing;

pub use domain::{
    AvailabilityException, AvailabilityRule, Booking, BookingStatus, BusyInterval, ResolvedSlot,
    Tour, DEFAULT_LEAD_HOURS,
};
pub use recurrence::{expand_weekly, WeeklyPattern};
pub use sources::{BookingSource, InMemoryBookings, InMemoryTours, TourSource};
pub use time::TimeInterval;
pub use tracing::{init_tracing, TracingConfig, TracingError, TracingOutputFormat};
