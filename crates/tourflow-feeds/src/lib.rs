//! External calendar integration: iCal feed import and calendar export.
//!
//! The importer downloads iCalendar feeds registered by guides, expands
//! their events (including recurring ones) into busy intervals, and keeps a
//! last-known-good snapshot per feed. The exporter renders a guide's
//! confirmed departures back out as an iCalendar document.

pub mod error;
pub mod export;
pub mod fetch;
pub mod ics;
pub mod registry;
pub mod scheduler;

pub use error::{FeedError, FeedErrorCode, FeedResult};
pub use export::export_guide_calendar;
pub use fetch::{BoxFuture, FetchConfig, FetchFeed, FetchOutcome, FeedFetcher, Validators};
pub use ics::parse_busy_intervals;
pub use registry::{
    BusySnapshot, ExternalCalendarFeed, FeedConfig, FeedRegistry, FeedStatus, GuideBusy,
    StaleFeed, SyncOutcome, SyncReport, SyncStatus,
};
pub use scheduler::{SyncHandle, SyncScheduler, SyncSchedulerConfig, SyncSchedulerState};
