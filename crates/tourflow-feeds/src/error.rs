//! Error types for external calendar feed operations.

use std::fmt;
use thiserror::Error;

/// The category of a feed error.
///
/// Used by the sync scheduler to decide whether a failed sync is worth
/// retrying before the next scheduled cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedErrorCode {
    /// Network error - connection failed, timeout, DNS resolution, etc.
    FetchError,
    /// The feed content was not valid iCalendar data.
    ParseError,
    /// The feed URL or configuration was rejected.
    ValidationError,
    /// The feed id is unknown.
    NotFound,
    /// Server returned an error status.
    ServerError,
    /// Internal importer error - unexpected state, bug.
    InternalError,
}

impl FeedErrorCode {
    /// Returns true if this error is transient and the sync may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::FetchError | Self::ServerError)
    }

    /// Returns a stable name for this error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FetchError => "fetch_error",
            Self::ParseError => "parse_error",
            Self::ValidationError => "validation_error",
            Self::NotFound => "not_found",
            Self::ServerError => "server_error",
            Self::InternalError => "internal_error",
        }
    }
}

impl fmt::Display for FeedErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An error that occurred while importing or exporting calendar data.
#[derive(Debug, Error)]
pub struct FeedError {
    code: FeedErrorCode,
    message: String,
    /// The feed that generated this error, if known.
    feed: Option<String>,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl FeedError {
    /// Creates a new feed error with the given code and message.
    pub fn new(code: FeedErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            feed: None,
            source: None,
        }
    }

    /// Creates a fetch error.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::FetchError, message)
    }

    /// Creates a parse error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::ParseError, message)
    }

    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::ValidationError, message)
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::NotFound, message)
    }

    /// Creates a server error.
    pub fn server(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::ServerError, message)
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FeedErrorCode::InternalError, message)
    }

    /// Sets the feed name for this error.
    pub fn with_feed(mut self, feed: impl Into<String>) -> Self {
        self.feed = Some(feed.into());
        self
    }

    /// Sets the source error for this error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Returns the error code.
    pub fn code(&self) -> FeedErrorCode {
        self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if this error is transient and may be retried.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref feed) = self.feed {
            write!(f, "[{}] ", feed)?;
        }
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A specialized Result type for feed operations.
pub type FeedResult<T> = Result<T, FeedError>;
