//! Multi-source feed monitor.
//!
//! Each feed runs in its own task: the streaming feed in a reconnect loop
//! with exponential backoff, each polling feed on its own timer. No feed
//! failure blocks another. Every report is normalised, filtered and written
//! to the [`EventStore`], which deduplicates and publishes updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::backoff::{Backoff, BackoffConfig};
use super::feed::{FeedDescriptor, FeedHandle, PollingFeed, RawFeedReport, StreamingFeed};
use crate::error::FeedError;
use crate::store::{EventStore, UpsertOutcome};

/// Monitor tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Feed chain, highest priority first
    pub feeds: Vec<FeedDescriptor>,
    /// Reconnect backoff for streaming feeds and failing pollers
    pub backoff: BackoffConfig,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            feeds: FeedDescriptor::default_chain(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Reachability of one feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedStatus {
    /// No attempt yet
    Unknown,
    /// Last attempt succeeded (or stream connected)
    Healthy,
    /// Last attempt failed or stream dropped
    Failing,
    /// Capability missing on this host
    Unavailable,
}

/// Health record of one feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedHealth {
    /// Feed id
    pub feed_id: String,
    /// Current status
    pub status: FeedStatus,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Last successful connect or fetch
    pub last_success: Option<DateTime<Utc>>,
    /// Last error message
    pub last_error: Option<String>,
    /// Reports written to the store
    pub reports_accepted: u64,
    /// Reports dropped as malformed
    pub reports_rejected: u64,
    /// Reports skipped by the magnitude filter
    pub reports_filtered: u64,
}

impl FeedHealth {
    fn new(feed_id: &str) -> Self {
        Self {
            feed_id: feed_id.to_string(),
            status: FeedStatus::Unknown,
            consecutive_failures: 0,
            last_success: None,
            last_error: None,
            reports_accepted: 0,
            reports_rejected: 0,
            reports_filtered: 0,
        }
    }

    /// Whether the feed can currently deliver
    pub fn is_unreachable(&self) -> bool {
        matches!(self.status, FeedStatus::Failing | FeedStatus::Unavailable)
    }
}

/// Shared ingestion path used by every feed task.
#[derive(Clone)]
struct Ingestor {
    store: EventStore,
    health: Arc<RwLock<HashMap<String, FeedHealth>>>,
}

impl Ingestor {
    fn ingest(&self, feed: &FeedDescriptor, raw: &RawFeedReport, now: DateTime<Utc>) -> Option<UpsertOutcome> {
        let report = match raw.normalize(feed, now) {
            Ok(report) => report,
            Err(e) => {
                self.reject(feed, &e);
                return None;
            }
        };

        if report.magnitude < feed.min_magnitude {
            tracing::debug!(
                feed = %feed.id,
                magnitude = report.magnitude,
                min = feed.min_magnitude,
                "Report below feed magnitude filter"
            );
            self.update(&feed.id, |h| h.reports_filtered += 1);
            return None;
        }

        match self.store.upsert_report(&report, feed.rank(), now) {
            Ok(outcome) => {
                self.update(&feed.id, |h| h.reports_accepted += 1);
                Some(outcome)
            }
            Err(e) => {
                tracing::debug!(feed = %feed.id, error = %e, "Store rejected report");
                None
            }
        }
    }

    fn reject(&self, feed: &FeedDescriptor, error: &FeedError) {
        tracing::warn!(feed = %feed.id, error = %error, "Dropping malformed report");
        self.update(&feed.id, |h| h.reports_rejected += 1);
    }

    fn mark_success(&self, feed_id: &str, now: DateTime<Utc>) {
        self.update(feed_id, |h| {
            h.status = FeedStatus::Healthy;
            h.consecutive_failures = 0;
            h.last_success = Some(now);
        });
    }

    fn mark_failure(&self, feed_id: &str, error: &FeedError) {
        self.update(feed_id, |h| {
            h.status = FeedStatus::Failing;
            h.consecutive_failures += 1;
            h.last_error = Some(error.to_string());
        });
    }

    fn mark_unavailable(&self, feed_id: &str) {
        self.update(feed_id, |h| h.status = FeedStatus::Unavailable);
    }

    fn update(&self, feed_id: &str, f: impl FnOnce(&mut FeedHealth)) {
        let mut health = self.health.write();
        let entry = health
            .entry(feed_id.to_string())
            .or_insert_with(|| FeedHealth::new(feed_id));
        f(entry);
    }
}

/// Ordered set of feeds funnelling into the event store.
pub struct MultiSourceMonitor {
    feeds: Vec<FeedHandle>,
    backoff: BackoffConfig,
    ingestor: Ingestor,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiSourceMonitor {
    /// Create a monitor writing into `store`
    pub fn new(store: EventStore, backoff: BackoffConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            feeds: Vec::new(),
            backoff,
            ingestor: Ingestor {
                store,
                health: Arc::new(RwLock::new(HashMap::new())),
            },
            running: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Add a feed; the list is kept in priority order
    pub fn add_feed(&mut self, feed: FeedHandle) {
        let id = feed.descriptor().id.clone();
        self.ingestor
            .health
            .write()
            .insert(id.clone(), FeedHealth::new(&id));
        self.feeds.push(feed);
        self.feeds.sort_by_key(|f| f.descriptor().priority);
    }

    /// Builder form of [`MultiSourceMonitor::add_feed`]
    pub fn with_feed(mut self, feed: FeedHandle) -> Self {
        self.add_feed(feed);
        self
    }

    /// Feeds in priority order
    pub fn feeds(&self) -> &[FeedHandle] {
        &self.feeds
    }

    /// Whether feed tasks are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn one task per available feed.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(false);

        let mut tasks = self.tasks.lock();
        for feed in &self.feeds {
            let descriptor = feed.descriptor().clone();
            if !feed.is_available() {
                tracing::warn!(feed = %descriptor.id, "Feed unavailable on this host, skipping");
                self.ingestor.mark_unavailable(&descriptor.id);
                continue;
            }

            let ingestor = self.ingestor.clone();
            let shutdown = self.shutdown_tx.subscribe();
            let backoff = Backoff::new(&self.backoff);
            let handle = match feed {
                FeedHandle::Streaming(f) => {
                    let f = f.clone();
                    tokio::spawn(async move { run_stream_loop(f, ingestor, backoff, shutdown).await })
                }
                FeedHandle::Polling(f) => {
                    let f = f.clone();
                    tokio::spawn(async move { run_poll_loop(f, ingestor, backoff, shutdown).await })
                }
            };
            tracing::info!(feed = %descriptor.id, mode = ?descriptor.mode, priority = descriptor.priority, "Feed started");
            tasks.push(handle);
        }
    }

    /// Stop every feed task and wait for them to exit.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Feed task ended abnormally");
            }
        }
        tracing::info!("Multi-source monitor stopped");
    }

    /// Normalise and store one raw report as if it came from `feed_id`.
    pub fn ingest(&self, feed_id: &str, raw: &RawFeedReport, now: DateTime<Utc>) -> Option<UpsertOutcome> {
        let feed = self.feeds.iter().find(|f| f.descriptor().id == feed_id)?;
        self.ingestor.ingest(feed.descriptor(), raw, now)
    }

    /// Health of every feed, in priority order
    pub fn health(&self) -> Vec<FeedHealth> {
        let health = self.ingestor.health.read();
        self.feeds
            .iter()
            .filter_map(|f| health.get(&f.descriptor().id).cloned())
            .collect()
    }

    /// True when there are no feeds or every feed is failing or unavailable
    pub fn all_feeds_unreachable(&self) -> bool {
        let health = self.ingestor.health.read();
        self.feeds.iter().all(|f| {
            health
                .get(&f.descriptor().id)
                .map(FeedHealth::is_unreachable)
                .unwrap_or(true)
        })
    }
}

async fn run_stream_loop(
    feed: Arc<dyn StreamingFeed>,
    ingestor: Ingestor,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    let descriptor = feed.descriptor().clone();

    'reconnect: loop {
        if *shutdown.borrow() {
            break;
        }

        let connected = tokio::select! {
            _ = shutdown.changed() => break 'reconnect,
            result = feed.connect() => result,
        };

        match connected {
            Ok(mut stream) => {
                backoff.reset();
                ingestor.mark_success(&descriptor.id, Utc::now());
                tracing::info!(feed = %descriptor.id, "Stream connected");

                loop {
                    let item = tokio::select! {
                        _ = shutdown.changed() => break 'reconnect,
                        item = stream.next_report() => item,
                    };
                    match item {
                        Some(Ok(raw)) => {
                            ingestor.ingest(&descriptor, &raw, Utc::now());
                        }
                        Some(Err(e)) => ingestor.reject(&descriptor, &e),
                        None => {
                            let e = FeedError::Disconnected {
                                feed: descriptor.id.clone(),
                            };
                            tracing::warn!(feed = %descriptor.id, "Stream disconnected");
                            ingestor.mark_failure(&descriptor.id, &e);
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(feed = %descriptor.id, error = %e, "Stream connect failed");
                ingestor.mark_failure(&descriptor.id, &e);
            }
        }

        let delay = backoff.next_delay();
        tracing::debug!(feed = %descriptor.id, retry_in_ms = delay.as_millis() as u64, attempt = backoff.attempts(), "Reconnecting");
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    tracing::debug!(feed = %descriptor.id, "Stream loop stopped");
}

async fn run_poll_loop(
    feed: Arc<dyn PollingFeed>,
    ingestor: Ingestor,
    mut backoff: Backoff,
    mut shutdown: watch::Receiver<bool>,
) {
    let descriptor = feed.descriptor().clone();
    let interval = Duration::from_secs_f64(descriptor.poll_interval_sec.max(0.1));

    loop {
        if *shutdown.borrow() {
            break;
        }

        let fetched = tokio::select! {
            _ = shutdown.changed() => break,
            result = feed.fetch() => result,
        };

        let wait = match fetched {
            Ok(reports) => {
                backoff.reset();
                let now = Utc::now();
                ingestor.mark_success(&descriptor.id, now);
                for raw in &reports {
                    ingestor.ingest(&descriptor, raw, now);
                }
                interval
            }
            Err(e) => {
                tracing::warn!(feed = %descriptor.id, error = %e, "Poll failed");
                ingestor.mark_failure(&descriptor.id, &e);
                backoff.next_delay().max(interval)
            }
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    tracing::debug!(feed = %descriptor.id, "Poll loop stopped");
}
