//! Background scheduler for feed sync.
//!
//! Drives [`FeedRegistry::sync_due`] on a periodic cycle with:
//! - Jitter to avoid thundering herd against feed servers
//! - Cooldown after a manual refresh
//! - Exponential backoff while syncs keep failing

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::fetch::FetchFeed;
use crate::registry::{FeedRegistry, SyncReport};

/// Sync scheduler configuration.
#[derive(Debug, Clone)]
pub struct SyncSchedulerConfig {
    /// Base interval between sync passes.
    pub sync_interval: Duration,
    /// Maximum jitter to add to the interval (as fraction 0.0-1.0).
    pub jitter_fraction: f64,
    /// Cooldown period after a manual refresh.
    pub refresh_cooldown: Duration,
    /// Initial backoff duration after a failing pass.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub backoff_multiplier: f64,
    /// Maximum consecutive failing passes before the scheduler stops trying.
    pub max_consecutive_failures: u32,
}

impl Default for SyncSchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(900), // 15 minutes
            jitter_fraction: 0.1,
            refresh_cooldown: Duration::from_secs(60),
            initial_backoff: Duration::from_secs(10),
            max_backoff: Duration::from_secs(900),
            backoff_multiplier: 2.0,
            max_consecutive_failures: 10,
        }
    }
}

impl SyncSchedulerConfig {
    /// Creates a config with the given sync interval.
    pub fn new(sync_interval: Duration) -> Self {
        Self {
            sync_interval,
            ..Default::default()
        }
    }

    /// Builder: set jitter fraction.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Builder: set refresh cooldown.
    pub fn with_refresh_cooldown(mut self, cooldown: Duration) -> Self {
        self.refresh_cooldown = cooldown;
        self
    }

    /// Builder: set backoff parameters.
    pub fn with_backoff(mut self, initial: Duration, max: Duration, multiplier: f64) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self.backoff_multiplier = multiplier;
        self
    }

    /// Calculates the next sync delay with jitter.
    pub fn next_sync_delay(&self) -> Duration {
        let base = self.sync_interval.as_secs_f64();
        let jitter_range = base * self.jitter_fraction;
        let jitter = rand_jitter(jitter_range);
        Duration::from_secs_f64(base + jitter)
    }

    /// Calculates backoff delay based on consecutive failing passes.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_backoff.as_secs_f64();
        let multiplier = self
            .backoff_multiplier
            .powi(consecutive_failures as i32 - 1);
        let delay = base * multiplier;
        let max = self.max_backoff.as_secs_f64();

        Duration::from_secs_f64(delay.min(max))
    }
}

/// Simple pseudo-random jitter generator.
/// Uses the current time to generate a value in [-range, range].
fn rand_jitter(range: f64) -> f64 {
    use std::time::SystemTime;

    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let fraction = (nanos as f64) / (1_000_000_000.0);
    (fraction * 2.0 - 1.0) * range
}

/// Commands that can be sent to a running scheduler.
#[derive(Debug, Clone)]
pub enum SyncCommand {
    /// Trigger an immediate sync pass.
    SyncNow,
    /// Trigger a sync pass, bypassing cooldown if force is true.
    Refresh { force: bool },
    /// Pause the scheduler.
    Pause,
    /// Resume the scheduler.
    Resume,
    /// Stop the scheduler.
    Stop,
}

/// Scheduler state.
#[derive(Debug, Clone)]
pub struct SyncSchedulerState {
    /// Whether the scheduler is paused.
    pub paused: bool,
    /// Number of consecutive failing passes.
    pub consecutive_failures: u32,
    /// Last fully successful pass.
    pub last_sync: Option<DateTime<Utc>>,
    /// Last pass attempt.
    pub last_attempt: Option<DateTime<Utc>>,
    /// Last error message.
    pub last_error: Option<String>,
    /// Last manual refresh (for cooldown).
    pub last_refresh: Option<Instant>,
    /// Report from the most recent pass.
    pub last_report: Option<SyncReport>,
}

impl Default for SyncSchedulerState {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncSchedulerState {
    /// Creates a fresh state.
    pub fn new() -> Self {
        Self {
            paused: false,
            consecutive_failures: 0,
            last_sync: None,
            last_attempt: None,
            last_error: None,
            last_refresh: None,
            last_report: None,
        }
    }

    /// Records a pass where every due feed synced.
    pub fn record_success(&mut self, report: SyncReport) {
        self.consecutive_failures = 0;
        self.last_sync = Some(Utc::now());
        self.last_attempt = self.last_sync;
        self.last_error = None;
        self.last_report = Some(report);
    }

    /// Records a pass where at least one feed failed.
    pub fn record_failure(&mut self, report: SyncReport) {
        self.consecutive_failures += 1;
        self.last_attempt = Some(Utc::now());
        self.last_error = Some(format!("{} feed(s) failed to sync", report.failed));
        self.last_report = Some(report);
    }

    /// Records a manual refresh.
    pub fn record_refresh(&mut self) {
        self.last_refresh = Some(Instant::now());
    }

    /// Returns true if we're inside the post-refresh cooldown.
    pub fn in_cooldown(&self, cooldown: Duration) -> bool {
        if let Some(last_refresh) = self.last_refresh {
            last_refresh.elapsed() < cooldown
        } else {
            false
        }
    }
}

/// Shared scheduler state.
pub type SharedSyncState = Arc<RwLock<SyncSchedulerState>>;

/// Periodically syncs all due feeds in a [`FeedRegistry`].
pub struct SyncScheduler {
    config: SyncSchedulerConfig,
    state: SharedSyncState,
    command_tx: mpsc::Sender<SyncCommand>,
    command_rx: Option<mpsc::Receiver<SyncCommand>>,
}

impl SyncScheduler {
    /// Creates a scheduler with the given configuration.
    pub fn new(config: SyncSchedulerConfig) -> Self {
        let (command_tx, command_rx) = mpsc::channel(16);
        Self {
            config,
            state: Arc::new(RwLock::new(SyncSchedulerState::new())),
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    /// Returns a handle for sending commands to the scheduler.
    pub fn handle(&self) -> SyncHandle {
        SyncHandle {
            command_tx: self.command_tx.clone(),
            state: self.state.clone(),
        }
    }

    /// Returns the shared state.
    pub fn state(&self) -> SharedSyncState {
        self.state.clone()
    }

    /// Runs the scheduler loop until stopped.
    pub async fn run(mut self, registry: Arc<FeedRegistry>, fetcher: Arc<dyn FetchFeed>) {
        let mut command_rx = self.command_rx.take().expect("run called twice");

        info!(
            interval_secs = self.config.sync_interval.as_secs(),
            "Feed sync scheduler started"
        );

        // Initial pass
        self.sync_pass(&registry, fetcher.as_ref()).await;

        loop {
            let delay = self.calculate_next_delay().await;
            debug!(delay_secs = delay.as_secs(), "Scheduling next sync pass");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let state = self.state.read().await;
                    if state.paused {
                        debug!("Scheduler paused, skipping pass");
                        continue;
                    }
                    drop(state);

                    self.sync_pass(&registry, fetcher.as_ref()).await;
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::SyncNow) => {
                            debug!("Received SyncNow command");
                            self.sync_pass(&registry, fetcher.as_ref()).await;
                        }
                        Some(SyncCommand::Refresh { force }) => {
                            debug!(force = force, "Received Refresh command");
                            let state = self.state.read().await;
                            let in_cooldown = state.in_cooldown(self.config.refresh_cooldown);
                            drop(state);

                            if force || !in_cooldown {
                                self.state.write().await.record_refresh();
                                self.sync_pass(&registry, fetcher.as_ref()).await;
                            } else {
                                debug!("Skipping refresh due to cooldown");
                            }
                        }
                        Some(SyncCommand::Pause) => {
                            info!("Scheduler paused");
                            self.state.write().await.paused = true;
                        }
                        Some(SyncCommand::Resume) => {
                            info!("Scheduler resumed");
                            self.state.write().await.paused = false;
                        }
                        Some(SyncCommand::Stop) | None => {
                            info!("Scheduler stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn calculate_next_delay(&self) -> Duration {
        let state = self.state.read().await;

        if state.consecutive_failures > 0 {
            let backoff = self.config.backoff_delay(state.consecutive_failures);
            debug!(
                failures = state.consecutive_failures,
                backoff_secs = backoff.as_secs(),
                "Using backoff delay"
            );
            return backoff;
        }

        if state.in_cooldown(self.config.refresh_cooldown)
            && let Some(last_refresh) = state.last_refresh
        {
            let remaining = self.config.refresh_cooldown - last_refresh.elapsed();
            let next_delay = self.config.next_sync_delay();
            return remaining.max(next_delay);
        }

        self.config.next_sync_delay()
    }

    async fn sync_pass(&self, registry: &FeedRegistry, fetcher: &dyn FetchFeed) {
        let state = self.state.read().await;
        if state.consecutive_failures >= self.config.max_consecutive_failures {
            error!(
                failures = state.consecutive_failures,
                max = self.config.max_consecutive_failures,
                "Max consecutive failures reached, skipping pass"
            );
            return;
        }
        drop(state);

        debug!("Starting sync pass");
        let report = registry.sync_due(fetcher, Utc::now()).await;
        if report.has_failures() {
            warn!(
                failed = report.failed,
                updated = report.updated,
                "Sync pass had failures"
            );
            self.state.write().await.record_failure(report);
        } else {
            info!(
                updated = report.updated,
                unchanged = report.unchanged,
                "Sync pass completed"
            );
            self.state.write().await.record_success(report);
        }
    }
}

/// Handle for sending commands to a running scheduler.
#[derive(Clone)]
pub struct SyncHandle {
    command_tx: mpsc::Sender<SyncCommand>,
    state: SharedSyncState,
}

impl SyncHandle {
    /// Triggers an immediate sync pass.
    pub async fn sync_now(&self) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.command_tx.send(SyncCommand::SyncNow).await
    }

    /// Triggers a refresh (respects cooldown unless force is true).
    pub async fn refresh(&self, force: bool) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.command_tx.send(SyncCommand::Refresh { force }).await
    }

    /// Pauses the scheduler.
    pub async fn pause(&self) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.command_tx.send(SyncCommand::Pause).await
    }

    /// Resumes the scheduler.
    pub async fn resume(&self) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.command_tx.send(SyncCommand::Resume).await
    }

    /// Stops the scheduler.
    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<SyncCommand>> {
        self.command_tx.send(SyncCommand::Stop).await
    }

    /// Returns the current scheduler state.
    pub async fn state(&self) -> SyncSchedulerState {
        self.state.read().await.clone()
    }

    /// Returns true if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        self.state.read().await.paused
    }
}
