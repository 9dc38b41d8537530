//! Engine error types.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur in the availability engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A rule or exception failed validation.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// A resolution query with an inverted or empty range.
    #[error("Invalid range: {start} must be before {end}")]
    InvalidRange {
        /// Requested range start.
        start: DateTime<Utc>,
        /// Requested range end.
        end: DateTime<Utc>,
    },

    /// The referenced tour does not exist.
    #[error("Tour not found: {tour_id}")]
    TourNotFound {
        /// The unknown tour id.
        tour_id: Uuid,
    },

    /// The referenced rule or exception does not exist.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// A booking request lost the race for the remaining seats.
    #[error(
        "Capacity exhausted for tour {tour_id} at {start}: {requested} requested, {remaining} left"
    )]
    CapacityRace {
        /// The tour being booked.
        tour_id: Uuid,
        /// The departure start.
        start: DateTime<Utc>,
        /// Seats requested.
        requested: i32,
        /// Seats actually remaining.
        remaining: i32,
    },
}

impl EngineError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }
}
