//! Resolution cache with TTL and source-version stamping.
//!
//! Resolution is pure computation over the stores, so its results can be
//! cached per query. The key carries the full query including `as_of`, so
//! lead-time filtering and pending-hold expiry are never answered from a
//! result computed for a different observation time. An entry is served
//! only while two conditions hold: the TTL has not lapsed, and the rule,
//! exception, and feed stores all still report the version they had when
//! the entry was computed. Any write to any of them bumps a counter and
//! silently invalidates every dependent entry. Bookings live outside the
//! versioned stores, so booking commits call
//! [`CachedResolver::invalidate_tour`] explicitly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::EngineResult;
use crate::resolver::{Resolution, SlotResolver};

/// Identifies one resolution query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryKey {
    /// The tour queried.
    pub tour_id: Uuid,
    /// Range start (inclusive).
    pub range_start: DateTime<Utc>,
    /// Range end (exclusive).
    pub range_end: DateTime<Utc>,
    /// Observation time the result was computed for.
    pub as_of: DateTime<Utc>,
}

/// The store versions a cache entry was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceVersions {
    /// Rule store version.
    pub rules: u64,
    /// Exception store version.
    pub exceptions: u64,
    /// Feed registry version.
    pub feeds: u64,
}

/// One cached resolution.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached result.
    pub resolution: Resolution,
    /// When the entry was computed.
    pub computed_at: DateTime<Utc>,
    versions: SourceVersions,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(resolution: Resolution, versions: SourceVersions, ttl: Duration) -> Self {
        Self {
            resolution,
            computed_at: Utc::now(),
            versions,
            expires_at: Instant::now() + ttl,
        }
    }

    /// Returns true if the TTL has lapsed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn is_valid(&self, current: SourceVersions) -> bool {
        !self.is_expired() && self.versions == current
    }
}

/// Cache of resolution results keyed by query.
#[derive(Debug)]
pub struct ResolutionCache {
    default_ttl: Duration,
    entries: HashMap<QueryKey, CacheEntry>,
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl ResolutionCache {
    /// Creates a cache with the given TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: HashMap::new(),
        }
    }

    /// Returns the cached resolution for `key` if it is fresh and was
    /// computed against the current store versions.
    pub fn get_valid(&self, key: &QueryKey, current: SourceVersions) -> Option<&Resolution> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_valid(current))
            .map(|entry| &entry.resolution)
    }

    /// Inserts or replaces an entry.
    pub fn insert(&mut self, key: QueryKey, resolution: Resolution, versions: SourceVersions) {
        self.entries
            .insert(key, CacheEntry::new(resolution, versions, self.default_ttl));
        trace!(tour = %key.tour_id, "Cached resolution");
    }

    /// Removes every entry for a tour.
    pub fn invalidate_tour(&mut self, tour_id: Uuid) {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.tour_id != tour_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(tour = %tour_id, removed = removed, "Invalidated cached resolutions");
        }
    }

    /// Removes expired entries and returns how many were evicted.
    pub fn evict_expired(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        before - self.entries.len()
    }

    /// Clears the cache.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns the number of entries, including expired ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A [`SlotResolver`] fronted by a [`ResolutionCache`].
pub struct CachedResolver {
    resolver: SlotResolver,
    rules: Arc<crate::store::RuleStore>,
    exceptions: Arc<crate::store::ExceptionStore>,
    feeds: Arc<tourflow_feeds::FeedRegistry>,
    cache: Mutex<ResolutionCache>,
}

impl CachedResolver {
    /// Wraps a resolver with a cache.
    ///
    /// The store handles must be the same ones the resolver reads, so the
    /// version stamps describe the data the resolution actually saw.
    pub fn new(
        resolver: SlotResolver,
        rules: Arc<crate::store::RuleStore>,
        exceptions: Arc<crate::store::ExceptionStore>,
        feeds: Arc<tourflow_feeds::FeedRegistry>,
        ttl: Duration,
    ) -> Self {
        Self {
            resolver,
            rules,
            exceptions,
            feeds,
            cache: Mutex::new(ResolutionCache::new(ttl)),
        }
    }

    /// Returns the wrapped resolver.
    pub fn resolver(&self) -> &SlotResolver {
        &self.resolver
    }

    fn current_versions(&self) -> SourceVersions {
        SourceVersions {
            rules: self.rules.version(),
            exceptions: self.exceptions.version(),
            feeds: self.feeds.version(),
        }
    }

    /// Resolves slots, serving a cached result when one is still valid.
    pub fn resolve_slots(
        &self,
        tour_id: Uuid,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
        as_of: DateTime<Utc>,
    ) -> EngineResult<Resolution> {
        let key = QueryKey {
            tour_id,
            range_start,
            range_end,
            as_of,
        };
        let versions = self.current_versions();

        {
            let cache = self.cache.lock().expect("resolution cache lock poisoned");
            if let Some(hit) = cache.get_valid(&key, versions) {
                trace!(tour = %tour_id, "Resolution cache hit");
                return Ok(hit.clone());
            }
        }

        let resolution = self
            .resolver
            .resolve_slots(tour_id, range_start, range_end, as_of)?;
        // Stamp with the versions read before resolving: if a store changed
        // mid-computation, the stamp is already outdated and the entry will
        // miss on the next lookup.
        self.cache
            .lock()
            .expect("resolution cache lock poisoned")
            .insert(key, resolution.clone(), versions);
        Ok(resolution)
    }

    /// Drops every cached entry for a tour.
    ///
    /// Bookings are not covered by the store version stamps, so callers that
    /// commit a booking invalidate the tour here.
    pub fn invalidate_tour(&self, tour_id: Uuid) {
        self.cache
            .lock()
            .expect("resolution cache lock poisoned")
            .invalidate_tour(tour_id);
    }
}
