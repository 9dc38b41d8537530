//! Feed registry: sync state and cached busy intervals per external calendar.
//!
//! Each feed moves through `PendingSync → Syncing → Synced | Failed`. The
//! parsed busy intervals live in a copy-on-write [`BusySnapshot`] that is
//! replaced atomically on a successful sync and retained across failures, so
//! resolution never runs against an empty set just because the last download
//! broke. A failed or overdue feed is reported as stale instead.
//!
//! Syncs are single-flight per feed: a per-feed async mutex serializes them
//! so a slow fetch can never overwrite a newer snapshot with older data.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use tourflow_core::{BusyInterval, TimeInterval};

use crate::error::{FeedError, FeedResult};
use crate::fetch::{FetchFeed, FetchOutcome, Validators};
use crate::ics;

/// Importer configuration.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// How far ahead busy intervals are materialized on each sync.
    pub horizon: Duration,
    /// Target interval between syncs; also the staleness threshold.
    pub refresh_cadence: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            horizon: Duration::days(365),
            refresh_cadence: Duration::hours(6),
        }
    }
}

/// An external calendar feed registered by a guide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCalendarFeed {
    /// Unique identifier.
    pub id: Uuid,
    /// The guide whose availability this feed blocks.
    pub guide_id: Uuid,
    /// Display name.
    pub name: String,
    /// Source URL of the iCalendar document.
    pub url: String,
    /// Inactive feeds keep their state but stop blocking slots.
    pub active: bool,
    /// Creation time, used for deterministic listing order.
    pub created_at: DateTime<Utc>,
}

/// Sync lifecycle state of a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Registered but never synced.
    PendingSync,
    /// A sync is in flight.
    Syncing,
    /// The last sync succeeded.
    Synced,
    /// The last sync failed; the previous snapshot is still served.
    Failed,
}

/// The busy intervals of one feed as of its last successful sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusySnapshot {
    /// Busy intervals within the sync horizon.
    pub intervals: Vec<BusyInterval>,
    /// When this snapshot was taken.
    pub synced_at: Option<DateTime<Utc>>,
}

/// External view of a feed's sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStatus {
    /// The feed definition.
    pub feed: ExternalCalendarFeed,
    /// Current lifecycle state.
    pub status: SyncStatus,
    /// Last successful sync, if any.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Error recorded by the most recent failed sync.
    pub last_error: Option<String>,
    /// Number of cached busy intervals.
    pub interval_count: usize,
}

/// A feed whose cached data could be out of date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleFeed {
    /// The stale feed.
    pub feed_id: Uuid,
    /// Display name, for warnings shown to the guide.
    pub name: String,
    /// Last successful sync, or `None` if the feed never synced.
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Busy data for one guide across all active feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuideBusy {
    /// Busy intervals, ascending.
    pub intervals: Vec<BusyInterval>,
    /// Feeds whose data is stale; resolution still uses their last snapshot.
    pub stale_feeds: Vec<StaleFeed>,
}

/// Result of syncing one feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new snapshot was installed.
    Updated,
    /// The server reported the content unchanged.
    NotModified,
}

/// Aggregate result of a scheduled sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Feeds that installed a new snapshot.
    pub updated: usize,
    /// Feeds whose content was unchanged.
    pub unchanged: usize,
    /// Feeds whose sync failed.
    pub failed: usize,
}

impl SyncReport {
    /// Returns true if any feed failed to sync.
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

#[derive(Debug)]
struct FeedEntry {
    feed: ExternalCalendarFeed,
    status: SyncStatus,
    last_synced_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    validators: Validators,
    snapshot: Arc<BusySnapshot>,
    sync_lock: Arc<Mutex<()>>,
}

impl FeedEntry {
    fn new(feed: ExternalCalendarFeed) -> Self {
        Self {
            feed,
            status: SyncStatus::PendingSync,
            last_synced_at: None,
            last_error: None,
            validators: Validators::default(),
            snapshot: Arc::new(BusySnapshot::default()),
            sync_lock: Arc::new(Mutex::new(())),
        }
    }

    fn status_view(&self) -> FeedStatus {
        FeedStatus {
            feed: self.feed.clone(),
            status: self.status,
            last_synced_at: self.last_synced_at,
            last_error: self.last_error.clone(),
            interval_count: self.snapshot.intervals.len(),
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, cadence: Duration) -> bool {
        match (self.status, self.last_synced_at) {
            (SyncStatus::Failed, _) => true,
            (_, None) => true,
            (_, Some(last)) => now - last > cadence,
        }
    }
}

/// Registry of external calendar feeds and their cached busy intervals.
///
/// The registry is the sole writer of feed sync state. Reads never await:
/// snapshots are `Arc`s swapped under a briefly-held lock.
#[derive(Debug)]
pub struct FeedRegistry {
    config: FeedConfig,
    feeds: RwLock<HashMap<Uuid, FeedEntry>>,
    version: AtomicU64,
}

impl Default for FeedRegistry {
    fn default() -> Self {
        Self::new(FeedConfig::default())
    }
}

impl FeedRegistry {
    /// Creates an empty registry.
    pub fn new(config: FeedConfig) -> Self {
        Self {
            config,
            feeds: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Monotonic counter bumped on every state change.
    ///
    /// Resolution caches key their entries on this to invalidate whenever
    /// feed data (or its staleness) may have changed.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Registers a new feed for a guide.
    pub fn add_feed(
        &self,
        guide_id: Uuid,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> FeedResult<ExternalCalendarFeed> {
        let name = name.into();
        let url = url.into();
        validate_feed_url(&url)?;

        let feed = ExternalCalendarFeed {
            id: Uuid::new_v4(),
            guide_id,
            name,
            url,
            active: true,
            created_at: Utc::now(),
        };
        self.feeds
            .write()
            .expect("feed registry lock poisoned")
            .insert(feed.id, FeedEntry::new(feed.clone()));
        self.bump();
        info!(feed = %feed.id, name = %feed.name, "Registered external calendar feed");
        Ok(feed)
    }

    /// Renames a feed and/or changes its URL.
    ///
    /// A URL change discards the cached snapshot and validators: the old data
    /// described a different calendar.
    pub fn update_feed(
        &self,
        id: Uuid,
        name: impl Into<String>,
        url: impl Into<String>,
    ) -> FeedResult<ExternalCalendarFeed> {
        let name = name.into();
        let url = url.into();
        validate_feed_url(&url)?;

        let mut feeds = self.feeds.write().expect("feed registry lock poisoned");
        let entry = feeds
            .get_mut(&id)
            .ok_or_else(|| FeedError::not_found(format!("no feed with id {}", id)))?;

        if entry.feed.url != url {
            entry.snapshot = Arc::new(BusySnapshot::default());
            entry.validators = Validators::default();
            entry.status = SyncStatus::PendingSync;
            entry.last_synced_at = None;
            entry.last_error = None;
        }
        entry.feed.name = name;
        entry.feed.url = url;
        let feed = entry.feed.clone();
        drop(feeds);
        self.bump();
        Ok(feed)
    }

    /// Activates or deactivates a feed without losing its state.
    pub fn set_active(&self, id: Uuid, active: bool) -> FeedResult<()> {
        let mut feeds = self.feeds.write().expect("feed registry lock poisoned");
        let entry = feeds
            .get_mut(&id)
            .ok_or_else(|| FeedError::not_found(format!("no feed with id {}", id)))?;
        entry.feed.active = active;
        drop(feeds);
        self.bump();
        Ok(())
    }

    /// Removes a feed. Removing an unknown id is a no-op.
    pub fn remove_feed(&self, id: Uuid) {
        let removed = self
            .feeds
            .write()
            .expect("feed registry lock poisoned")
            .remove(&id);
        if removed.is_some() {
            self.bump();
            info!(feed = %id, "Removed external calendar feed");
        }
    }

    /// Returns the sync state of one feed.
    pub fn feed_status(&self, id: Uuid) -> Option<FeedStatus> {
        self.feeds
            .read()
            .expect("feed registry lock poisoned")
            .get(&id)
            .map(FeedEntry::status_view)
    }

    /// Returns the guide's feeds ordered by creation time.
    pub fn list_feeds(&self, guide_id: Uuid) -> Vec<FeedStatus> {
        let feeds = self.feeds.read().expect("feed registry lock poisoned");
        let mut out: Vec<FeedStatus> = feeds
            .values()
            .filter(|e| e.feed.guide_id == guide_id)
            .map(FeedEntry::status_view)
            .collect();
        out.sort_by_key(|s| (s.feed.created_at, s.feed.id));
        out
    }

    /// Returns the merged busy intervals of the guide's active feeds, with
    /// the set of feeds whose data is stale as of `now`.
    pub fn guide_busy(&self, guide_id: Uuid, now: DateTime<Utc>) -> GuideBusy {
        let feeds = self.feeds.read().expect("feed registry lock poisoned");
        let mut busy = GuideBusy::default();
        for entry in feeds.values() {
            if entry.feed.guide_id != guide_id || !entry.feed.active {
                continue;
            }
            busy.intervals.extend(entry.snapshot.intervals.iter().cloned());
            if entry.is_stale(now, self.config.refresh_cadence) {
                busy.stale_feeds.push(StaleFeed {
                    feed_id: entry.feed.id,
                    name: entry.feed.name.clone(),
                    last_synced_at: entry.last_synced_at,
                });
            }
        }
        drop(feeds);
        busy.intervals.sort_by_key(|b| b.interval);
        busy.stale_feeds.sort_by_key(|s| s.feed_id);
        busy
    }

    /// Syncs one feed now, serialized against any concurrent sync of the
    /// same feed.
    pub async fn sync_feed(&self, id: Uuid, fetcher: &dyn FetchFeed) -> FeedResult<SyncOutcome> {
        // Snapshot what the fetch needs, then release the registry lock so a
        // slow download never blocks reads or other feeds.
        let (url, name, validators, sync_lock) = {
            let feeds = self.feeds.read().expect("feed registry lock poisoned");
            let entry = feeds
                .get(&id)
                .ok_or_else(|| FeedError::not_found(format!("no feed with id {}", id)))?;
            (
                entry.feed.url.clone(),
                entry.feed.name.clone(),
                entry.validators.clone(),
                Arc::clone(&entry.sync_lock),
            )
        };

        let _guard = sync_lock.lock().await;
        self.mark_syncing(id)?;

        let outcome = match fetcher.fetch_feed(&url, &validators).await {
            Ok(FetchOutcome::NotModified) => {
                self.record_success(id, None, None)?;
                debug!(feed = %id, "Feed unchanged");
                Ok(SyncOutcome::NotModified)
            }
            Ok(FetchOutcome::Fetched { body, validators }) => {
                let now = Utc::now();
                let horizon = TimeInterval::new(now, now + self.config.horizon);
                match ics::parse_busy_intervals(&body, id, horizon) {
                    Ok(intervals) => {
                        let count = intervals.len();
                        let snapshot = Arc::new(BusySnapshot {
                            intervals,
                            synced_at: Some(now),
                        });
                        self.record_success(id, Some(snapshot), Some(validators))?;
                        info!(feed = %id, intervals = count, "Feed synced");
                        Ok(SyncOutcome::Updated)
                    }
                    Err(e) => {
                        self.record_failure(id, &e);
                        Err(e.with_feed(name))
                    }
                }
            }
            Err(e) => {
                self.record_failure(id, &e);
                Err(e.with_feed(name))
            }
        };

        self.bump();
        outcome
    }

    /// Syncs every active feed that is due as of `now`: never synced, failed
    /// last time, or past the refresh cadence.
    pub async fn sync_due(&self, fetcher: &dyn FetchFeed, now: DateTime<Utc>) -> SyncReport {
        let due: Vec<Uuid> = {
            let feeds = self.feeds.read().expect("feed registry lock poisoned");
            feeds
                .values()
                .filter(|e| e.feed.active && e.is_stale(now, self.config.refresh_cadence))
                .map(|e| e.feed.id)
                .collect()
        };

        let mut report = SyncReport::default();
        for id in due {
            match self.sync_feed(id, fetcher).await {
                Ok(SyncOutcome::Updated) => report.updated += 1,
                Ok(SyncOutcome::NotModified) => report.unchanged += 1,
                Err(e) => {
                    warn!(feed = %id, error = %e, "Feed sync failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn mark_syncing(&self, id: Uuid) -> FeedResult<()> {
        let mut feeds = self.feeds.write().expect("feed registry lock poisoned");
        let entry = feeds
            .get_mut(&id)
            .ok_or_else(|| FeedError::not_found(format!("feed {} removed during sync", id)))?;
        entry.status = SyncStatus::Syncing;
        Ok(())
    }

    fn record_success(
        &self,
        id: Uuid,
        snapshot: Option<Arc<BusySnapshot>>,
        validators: Option<Validators>,
    ) -> FeedResult<()> {
        let mut feeds = self.feeds.write().expect("feed registry lock poisoned");
        let entry = feeds
            .get_mut(&id)
            .ok_or_else(|| FeedError::not_found(format!("feed {} removed during sync", id)))?;
        if let Some(snapshot) = snapshot {
            entry.snapshot = snapshot;
        }
        if let Some(validators) = validators {
            entry.validators = validators;
        }
        entry.status = SyncStatus::Synced;
        entry.last_synced_at = Some(Utc::now());
        entry.last_error = None;
        Ok(())
    }

    fn record_failure(&self, id: Uuid, error: &FeedError) {
        let mut feeds = self.feeds.write().expect("feed registry lock poisoned");
        // Prior snapshot is deliberately retained: last-known-good data keeps
        // serving resolution while the feed is flagged stale.
        if let Some(entry) = feeds.get_mut(&id) {
            entry.status = SyncStatus::Failed;
            entry.last_error = Some(error.to_string());
        }
    }
}

fn validate_feed_url(url: &str) -> FeedResult<()> {
    let parsed =
        Url::parse(url).map_err(|e| FeedError::validation(format!("invalid feed URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FeedError::validation(format!(
            "unsupported feed URL scheme: {}",
            parsed.scheme()
        )));
    }
    Ok(())
}
