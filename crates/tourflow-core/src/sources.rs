//! Collaborator traits for the tour and booking services.
//!
//! The resolution engine and the calendar export never own tours or
//! bookings; they read them through these seams. The in-memory
//! implementations back tests and local development.

use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use crate::domain::{Booking, BookingStatus, Tour};
use crate::time::TimeInterval;

/// Read access to the tour catalog.
pub trait TourSource: Send + Sync {
    /// Looks up a tour by id.
    fn tour(&self, id: Uuid) -> Option<Tour>;

    /// Returns every tour owned by the guide.
    fn tours_for_guide(&self, guide_id: Uuid) -> Vec<Tour>;
}

/// Read access to bookings held by the booking service.
pub trait BookingSource: Send + Sync {
    /// Returns the non-cancelled, non-expired bookings for a tour whose
    /// departure starts within the window. Callers widen the window when they
    /// need bookings that merely overlap it, and still apply pending-hold
    /// expiry via [`Booking::consumes_capacity_at`].
    fn active_bookings(&self, tour_id: Uuid, window: TimeInterval) -> Vec<Booking>;

    /// Returns every confirmed booking across the guide's tours.
    fn confirmed_for_guide(&self, guide_id: Uuid) -> Vec<Booking>;
}

/// In-memory tour catalog.
#[derive(Debug, Default)]
pub struct InMemoryTours {
    tours: RwLock<HashMap<Uuid, Tour>>,
}

impl InMemoryTours {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a tour.
    pub fn insert(&self, tour: Tour) {
        self.tours
            .write()
            .expect("tour catalog lock poisoned")
            .insert(tour.id, tour);
    }
}

impl TourSource for InMemoryTours {
    fn tour(&self, id: Uuid) -> Option<Tour> {
        self.tours
            .read()
            .expect("tour catalog lock poisoned")
            .get(&id)
            .cloned()
    }

    fn tours_for_guide(&self, guide_id: Uuid) -> Vec<Tour> {
        let mut tours: Vec<Tour> = self
            .tours
            .read()
            .expect("tour catalog lock poisoned")
            .values()
            .filter(|t| t.guide_id == guide_id)
            .cloned()
            .collect();
        tours.sort_by_key(|t| t.id);
        tours
    }
}

/// In-memory booking ledger.
#[derive(Debug, Default)]
pub struct InMemoryBookings {
    bookings: RwLock<Vec<Booking>>,
    // Joined here so `confirmed_for_guide` does not need a TourSource.
    tour_guides: RwLock<HashMap<Uuid, Uuid>>,
}

impl InMemoryBookings {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records which guide owns a tour, for guide-scoped queries.
    pub fn register_tour(&self, tour_id: Uuid, guide_id: Uuid) {
        self.tour_guides
            .write()
            .expect("booking ledger lock poisoned")
            .insert(tour_id, guide_id);
    }

    /// Appends a booking.
    pub fn insert(&self, booking: Booking) {
        self.bookings
            .write()
            .expect("booking ledger lock poisoned")
            .push(booking);
    }
}

impl BookingSource for InMemoryBookings {
    fn active_bookings(&self, tour_id: Uuid, window: TimeInterval) -> Vec<Booking> {
        self.bookings
            .read()
            .expect("booking ledger lock poisoned")
            .iter()
            .filter(|b| {
                b.tour_id == tour_id
                    && !matches!(b.status, BookingStatus::Cancelled | BookingStatus::Expired)
                    && window.contains(b.start)
            })
            .cloned()
            .collect()
    }

    fn confirmed_for_guide(&self, guide_id: Uuid) -> Vec<Booking> {
        let guides = self
            .tour_guides
            .read()
            .expect("booking ledger lock poisoned");
        let mut out: Vec<Booking> = self
            .bookings
            .read()
            .expect("booking ledger lock poisoned")
            .iter()
            .filter(|b| {
                b.status == BookingStatus::Confirmed
                    && guides.get(&b.tour_id) == Some(&guide_id)
            })
            .cloned()
            .collect();
        out.sort_by_key(|b| (b.start, b.id));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::{DateTime, Utc};
    use chrono_tz::UTC;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn tour_lookup_and_guide_listing() {
        let tours = InMemoryTours::new();
        let guide = Uuid::new_v4();
        let a = Tour::new(Uuid::new_v4(), guide, "A", 5, 60, UTC);
        let b = Tour::new(Uuid::new_v4(), guide, "B", 5, 60, UTC);
        let other = Tour::new(Uuid::new_v4(), Uuid::new_v4(), "C", 5, 60, UTC);
        tours.insert(a.clone());
        tours.insert(b.clone());
        tours.insert(other);

        assert_eq!(tours.tour(a.id), Some(a));
        assert_eq!(tours.tours_for_guide(guide).len(), 2);
        assert_eq!(tours.tours_for_guide(Uuid::new_v4()).len(), 0);
    }

    #[test]
    fn active_bookings_filters_status_and_window() {
        let bookings = InMemoryBookings::new();
        let tour = Uuid::new_v4();

        bookings.insert(Booking::confirmed(Uuid::new_v4(), tour, utc(2024, 1, 1, 9), 2));
        bookings.insert(
            Booking::confirmed(Uuid::new_v4(), tour, utc(2024, 1, 2, 9), 2)
                .with_status(BookingStatus::Cancelled),
        );
        bookings.insert(Booking::confirmed(Uuid::new_v4(), tour, utc(2024, 2, 1, 9), 2));

        let window = TimeInterval::new(utc(2024, 1, 1, 0), utc(2024, 1, 31, 0));
        let active = bookings.active_bookings(tour, window);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].start, utc(2024, 1, 1, 9));
    }

    #[test]
    fn confirmed_for_guide_joins_tour_ownership() {
        let bookings = InMemoryBookings::new();
        let guide = Uuid::new_v4();
        let tour = Uuid::new_v4();
        let foreign_tour = Uuid::new_v4();
        bookings.register_tour(tour, guide);
        bookings.register_tour(foreign_tour, Uuid::new_v4());

        bookings.insert(Booking::confirmed(Uuid::new_v4(), tour, utc(2024, 1, 1, 9), 2));
        bookings.insert(Booking::pending(
            Uuid::new_v4(),
            tour,
            utc(2024, 1, 2, 9),
            1,
            utc(2024, 1, 1, 0),
        ));
        bookings.insert(Booking::confirmed(
            Uuid::new_v4(),
            foreign_tour,
            utc(2024, 1, 1, 9),
            2,
        ));

        let confirmed = bookings.confirmed_for_guide(guide);
        assert_eq!(confirmed.len(), 1);
        assert_eq!(confirmed[0].tour_id, tour);
    }
}
