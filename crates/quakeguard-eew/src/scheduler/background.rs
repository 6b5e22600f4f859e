//! Best-effort periodic wake-ups.
//!
//! The contract is "roughly every `period`, may be skipped". Work run from a
//! tick must stay correct under arbitrarily delayed or missing ticks; only
//! timeliness may suffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Work executed on each background wake-up
pub trait BackgroundTask: Send + Sync {
    /// Run once. `now` is the wall-clock time of the wake-up.
    fn run(&self, now: DateTime<Utc>);
}

/// Platform background execution facility
#[async_trait]
pub trait BackgroundHost: Send + Sync {
    /// Host name for logging
    fn name(&self) -> &str;

    /// Register `task` to run roughly every `period`
    async fn register(&self, period: Duration, task: Arc<dyn BackgroundTask>) -> BackgroundRegistration;
}

/// Handle to a registered task. Dropping it cancels further ticks.
pub struct BackgroundRegistration {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    fired: Arc<AtomicU64>,
}

impl BackgroundRegistration {
    /// Wrap a running tick task
    pub fn new(stop_tx: watch::Sender<bool>, handle: JoinHandle<()>, fired: Arc<AtomicU64>) -> Self {
        Self {
            stop_tx,
            handle: Some(handle),
            fired,
        }
    }

    /// Ticks delivered so far
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    /// Stop ticking and wait for the task to exit
    pub async fn cancel(mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for BackgroundRegistration {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Host backed by a tokio interval.
///
/// `skip_every` drops every n-th tick to mimic an OS that defers work.
#[derive(Debug, Clone, Default)]
pub struct TokioIntervalHost {
    skip_every: Option<u64>,
}

impl TokioIntervalHost {
    /// Host that fires every tick
    pub fn new() -> Self {
        Self::default()
    }

    /// Host that silently skips every `n`-th tick
    pub fn skipping_every(n: u64) -> Self {
        Self {
            skip_every: (n > 0).then_some(n),
        }
    }
}

#[async_trait]
impl BackgroundHost for TokioIntervalHost {
    fn name(&self) -> &str {
        "tokio-interval"
    }

    async fn register(&self, period: Duration, task: Arc<dyn BackgroundTask>) -> BackgroundRegistration {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let fired = Arc::new(AtomicU64::new(0));
        let fired_counter = fired.clone();
        let skip_every = self.skip_every;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        n += 1;
                        if skip_every.is_some_and(|k| n % k == 0) {
                            tracing::trace!(tick = n, "Background tick skipped");
                            continue;
                        }
                        task.run(Utc::now());
                        fired_counter.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        });

        tracing::debug!(period_ms = period.as_millis() as u64, "Background task registered");
        BackgroundRegistration::new(stop_tx, handle, fired)
    }
}
