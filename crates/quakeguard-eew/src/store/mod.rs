//! Canonical earthquake event store.
//!
//! Many producers (streaming feed, polling feeds, crowd consensus) race to
//! report the same physical quake. Writes are serialised per coarse
//! (time, location) bucket through striped mutexes; reads are lock-free
//! snapshots of an `Arc<HashMap>` that writers replace copy-on-write.
//!
//! The store is an explicit, cloneable handle with its own lifecycle
//! (`init`, `reset`, `shutdown`), so tests get isolated instances.

pub mod dedup;

pub use dedup::{BucketKey, DedupRule, Observation};

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::{
    CrowdEvidence, DomainEvent, EarthquakeEvent, EventId, EventStatus, EvidenceOrigin, SourceId, SourceRank,
    SourceReport,
};
use crate::error::StoreError;

/// Store tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Same-event matching rule
    pub dedup: DedupRule,
    /// Events whose origin is older than this are pruned (default: 24 h)
    pub retention_hours: f64,
    /// Number of write stripes (default: 256)
    pub write_stripes: usize,
    /// Capacity of the update broadcast channel (default: 256)
    pub broadcast_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dedup: DedupRule::default(),
            retention_hours: 24.0,
            write_stripes: 256,
            broadcast_capacity: 256,
        }
    }
}

/// Result of writing evidence to the store
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// Evidence matched nothing; a new event was created
    Created(EarthquakeEvent),
    /// Evidence was merged into an existing event
    Updated {
        /// Event after the merge
        event: EarthquakeEvent,
        /// Status before the merge
        previous_status: EventStatus,
    },
    /// Evidence matched an event but changed nothing
    Unchanged(EventId),
}

impl UpsertOutcome {
    /// Id of the affected event
    pub fn event_id(&self) -> EventId {
        match self {
            UpsertOutcome::Created(e) => *e.id(),
            UpsertOutcome::Updated { event, .. } => *event.id(),
            UpsertOutcome::Unchanged(id) => *id,
        }
    }
}

/// Immutable view of every event at one point in time
pub type StoreSnapshot = Arc<HashMap<EventId, EarthquakeEvent>>;

const UNINITIALIZED: u8 = 0;
const RUNNING: u8 = 1;
const SHUT_DOWN: u8 = 2;

struct StoreInner {
    config: StoreConfig,
    lifecycle: AtomicU8,
    events: RwLock<StoreSnapshot>,
    external_index: Mutex<HashMap<(SourceId, String), EventId>>,
    stripes: Vec<Mutex<()>>,
    updates: broadcast::Sender<DomainEvent>,
}

/// Shared handle to the event store
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl EventStore {
    /// Create an uninitialised store. Call [`EventStore::init`] before writing.
    pub fn new(config: StoreConfig) -> Self {
        let (updates, _) = broadcast::channel(config.broadcast_capacity.max(1));
        let stripes = (0..config.write_stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            inner: Arc::new(StoreInner {
                config,
                lifecycle: AtomicU8::new(UNINITIALIZED),
                events: RwLock::new(Arc::new(HashMap::new())),
                external_index: Mutex::new(HashMap::new()),
                stripes,
                updates,
            }),
        }
    }

    /// Accept writes
    pub fn init(&self) {
        self.inner.lifecycle.store(RUNNING, Ordering::SeqCst);
        tracing::debug!("Event store initialised");
    }

    /// Drop every event. Lifecycle state is unchanged.
    pub fn reset(&self) {
        *self.inner.events.write() = Arc::new(HashMap::new());
        self.inner.external_index.lock().clear();
        tracing::debug!("Event store reset");
    }

    /// Reject all further writes
    pub fn shutdown(&self) {
        self.inner.lifecycle.store(SHUT_DOWN, Ordering::SeqCst);
        tracing::debug!("Event store shut down");
    }

    /// Whether writes are accepted
    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.load(Ordering::SeqCst) == RUNNING
    }

    /// Matching rule in use
    pub fn dedup_rule(&self) -> &DedupRule {
        &self.inner.config.dedup
    }

    /// Subscribe to create/update/prune notifications
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.inner.updates.subscribe()
    }

    /// Point-in-time view of all events
    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner.events.read().clone()
    }

    /// Look up one event
    pub fn get(&self, id: &EventId) -> Option<EarthquakeEvent> {
        self.snapshot().get(id).cloned()
    }

    /// All events, oldest origin first
    pub fn events(&self) -> Vec<EarthquakeEvent> {
        let mut events: Vec<_> = self.snapshot().values().cloned().collect();
        events.sort_by_key(|e| e.origin_time());
        events
    }

    /// Number of events
    pub fn len(&self) -> usize {
        self.inner.events.read().len()
    }

    /// Whether the store holds no events
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dedup-on-write of a feed report.
    pub fn upsert_report(
        &self,
        report: &SourceReport,
        rank: SourceRank,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.ensure_running()?;
        let obs = Observation {
            origin_time: report.origin_time,
            epicenter: report.epicenter,
            magnitude: report.magnitude,
            crowd_estimate: false,
        };
        // A revision of a report we already hold updates the same event.
        let key = report.external_key();
        let (_guards, target) = self.lock_target(&obs, || self.inner.external_index.lock().get(&key).copied());

        let outcome = match target {
            Some(mut event) => {
                let previous_status = event.status();
                if event.apply_report(report, rank, now) {
                    self.commit(event.clone());
                    UpsertOutcome::Updated { event, previous_status }
                } else {
                    UpsertOutcome::Unchanged(*event.id())
                }
            }
            None => {
                let event = EarthquakeEvent::from_report(report, rank, now);
                self.commit(event.clone());
                UpsertOutcome::Created(event)
            }
        };
        self.inner.external_index.lock().insert(key, outcome.event_id());

        self.publish(&outcome, EvidenceOrigin::Feed(report.source_id.clone()), now);
        Ok(outcome)
    }

    /// Dedup-on-write of a crowd cluster that reached quorum.
    pub fn upsert_crowd(&self, evidence: &CrowdEvidence, now: DateTime<Utc>) -> Result<UpsertOutcome, StoreError> {
        self.write_crowd(evidence, None, now)
    }

    /// Merge further crowd evidence into the event a cluster was already
    /// promoted into. Falls back to matching if that event has been pruned.
    pub fn upsert_crowd_into(
        &self,
        event_id: EventId,
        evidence: &CrowdEvidence,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.write_crowd(evidence, Some(event_id), now)
    }

    fn write_crowd(
        &self,
        evidence: &CrowdEvidence,
        known: Option<EventId>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        self.ensure_running()?;
        let obs = Observation {
            origin_time: evidence.origin_time,
            epicenter: evidence.centroid,
            magnitude: evidence.magnitude,
            crowd_estimate: true,
        };
        let (_guards, target) = self.lock_target(&obs, || known);

        let outcome = match target {
            Some(mut event) => {
                let previous_status = event.status();
                if event.apply_cluster(evidence, now) {
                    self.commit(event.clone());
                    UpsertOutcome::Updated { event, previous_status }
                } else {
                    UpsertOutcome::Unchanged(*event.id())
                }
            }
            None => {
                let event = EarthquakeEvent::from_crowd(evidence, now);
                self.commit(event.clone());
                UpsertOutcome::Created(event)
            }
        };

        self.publish(
            &outcome,
            EvidenceOrigin::Crowd {
                devices: evidence.device_count,
            },
            now,
        );
        Ok(outcome)
    }

    /// Remove events older than the retention horizon. Returns how many went.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - Duration::milliseconds((self.inner.config.retention_hours * 3_600_000.0) as i64);
        let expired: Vec<EventId> = self
            .snapshot()
            .values()
            .filter(|e| e.is_older_than(horizon))
            .map(|e| *e.id())
            .collect();
        if expired.is_empty() {
            return 0;
        }

        {
            let mut guard = self.inner.events.write();
            let map = Arc::make_mut(&mut *guard);
            for id in &expired {
                map.remove(id);
            }
        }
        let gone: BTreeSet<EventId> = expired.iter().copied().collect();
        self.inner.external_index.lock().retain(|_, id| !gone.contains(id));

        for id in &expired {
            let _ = self.inner.updates.send(DomainEvent::EventPruned {
                event_id: *id,
                timestamp: now,
            });
        }
        tracing::debug!(pruned = expired.len(), "Pruned expired events");
        expired.len()
    }

    fn ensure_running(&self) -> Result<(), StoreError> {
        match self.inner.lifecycle.load(Ordering::SeqCst) {
            RUNNING => Ok(()),
            SHUT_DOWN => Err(StoreError::ShutDown),
            _ => Err(StoreError::NotInitialized),
        }
    }

    /// Lock the write stripes of `obs`, then resolve the event it merges
    /// into (`known` first, else the closest match).
    ///
    /// Every write to an event holds the stripes of that event as stored,
    /// so when the target lies outside the stripes already held they are
    /// added and the lookup repeats. The held set only grows, which bounds
    /// the retries by the stripe count.
    fn lock_target(
        &self,
        obs: &Observation,
        known: impl Fn() -> Option<EventId>,
    ) -> (Vec<MutexGuard<'_, ()>>, Option<EarthquakeEvent>) {
        let mut held = self.stripe_indices(obs);
        loop {
            let guards = self.lock_stripes(&held);
            let snapshot = self.snapshot();
            let target = known()
                .and_then(|id| snapshot.get(&id))
                .or_else(|| self.find_match(&snapshot, obs))
                .cloned();
            let Some(event) = target else {
                return (guards, None);
            };
            let needed = self.stripe_indices(&observation_of(&event));
            if needed.is_subset(&held) {
                return (guards, Some(event));
            }
            drop(guards);
            held.extend(needed);
        }
    }

    fn stripe_indices(&self, obs: &Observation) -> BTreeSet<usize> {
        let stripes = self.inner.stripes.len() as u64;
        self.inner
            .config
            .dedup
            .lock_keys(obs)
            .iter()
            .map(|key| {
                let mut h = DefaultHasher::new();
                key.hash(&mut h);
                (h.finish() % stripes) as usize
            })
            .collect()
    }

    fn lock_stripes(&self, indices: &BTreeSet<usize>) -> Vec<MutexGuard<'_, ()>> {
        // Ascending stripe order keeps concurrent writers deadlock-free.
        indices.iter().map(|&i| self.inner.stripes[i].lock()).collect()
    }

    fn find_match<'a>(&self, snapshot: &'a StoreSnapshot, obs: &Observation) -> Option<&'a EarthquakeEvent> {
        let rule = &self.inner.config.dedup;
        snapshot
            .values()
            .filter_map(|event| {
                let other = observation_of(event);
                rule.matches(obs, &other).then(|| (rule.closeness(obs, &other), event))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, event)| event)
    }

    fn commit(&self, event: EarthquakeEvent) {
        let mut guard = self.inner.events.write();
        Arc::make_mut(&mut *guard).insert(*event.id(), event);
    }

    fn publish(&self, outcome: &UpsertOutcome, origin: EvidenceOrigin, now: DateTime<Utc>) {
        let update = match outcome {
            UpsertOutcome::Created(event) => {
                tracing::info!(
                    event_id = %event.id(),
                    magnitude = event.magnitude(),
                    status = %event.status(),
                    origin = ?origin,
                    "New earthquake event"
                );
                DomainEvent::EventCreated {
                    event: event.clone(),
                    origin,
                    timestamp: now,
                }
            }
            UpsertOutcome::Updated { event, previous_status } => {
                tracing::info!(
                    event_id = %event.id(),
                    magnitude = event.magnitude(),
                    status = %event.status(),
                    sources = event.confirming_sources().len(),
                    origin = ?origin,
                    "Earthquake event updated"
                );
                DomainEvent::EventUpdated {
                    event: event.clone(),
                    previous_status: *previous_status,
                    origin,
                    timestamp: now,
                }
            }
            UpsertOutcome::Unchanged(_) => return,
        };
        // No subscribers is fine.
        let _ = self.inner.updates.send(update);
    }
}

fn observation_of(event: &EarthquakeEvent) -> Observation {
    Observation {
        origin_time: event.origin_time(),
        epicenter: *event.epicenter(),
        magnitude: event.magnitude(),
        crowd_estimate: event.confirming_sources().is_empty(),
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("events", &self.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GeoPoint;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn store() -> EventStore {
        let store = EventStore::new(StoreConfig::default());
        store.init();
        store
    }

    fn report(source: &str, ext: &str, mag: f64, epicenter: GeoPoint, t_sec: i64) -> SourceReport {
        SourceReport {
            source_id: SourceId::new(source),
            external_event_id: ext.to_string(),
            magnitude: mag,
            epicenter,
            depth_km: 10.0,
            origin_time: t0() + Duration::seconds(t_sec),
            reported_at: t0() + Duration::seconds(t_sec + 3),
        }
    }

    #[test]
    fn test_writes_rejected_before_init_and_after_shutdown() {
        let s = EventStore::new(StoreConfig::default());
        let r = report("afad", "1", 5.0, GeoPoint::new(38.0, 27.0), 0);
        assert_eq!(
            s.upsert_report(&r, SourceRank::new(1, true), t0()),
            Err(StoreError::NotInitialized)
        );
        s.init();
        assert!(s.upsert_report(&r, SourceRank::new(1, true), t0()).is_ok());
        s.shutdown();
        assert_eq!(s.upsert_report(&r, SourceRank::new(1, true), t0()), Err(StoreError::ShutDown));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_same_event_from_two_feeds_merges() {
        let s = store();
        let e = GeoPoint::new(38.0, 27.0);
        s.upsert_report(&report("afad", "a1", 6.1, e, 0), SourceRank::new(1, true), t0())
            .unwrap();
        let out = s
            .upsert_report(
                &report("emsc", "e9", 6.0, e.offset_km(8.0, 0.0), 2),
                SourceRank::new(4, false),
                t0(),
            )
            .unwrap();
        assert!(matches!(out, UpsertOutcome::Updated { .. }));
        assert_eq!(s.len(), 1);
        let event = s.events().remove(0);
        assert_eq!(event.confirming_sources().len(), 2);
        assert_eq!(event.magnitude(), 6.1);
    }

    #[test]
    fn test_distant_events_stay_separate() {
        let s = store();
        s.upsert_report(
            &report("afad", "1", 5.0, GeoPoint::new(38.0, 27.0), 0),
            SourceRank::new(1, true),
            t0(),
        )
        .unwrap();
        s.upsert_report(
            &report("afad", "2", 5.0, GeoPoint::new(40.0, 35.0), 1),
            SourceRank::new(1, true),
            t0(),
        )
        .unwrap();
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_repeat_report_is_unchanged() {
        let s = store();
        let r = report("afad", "1", 5.0, GeoPoint::new(38.0, 27.0), 0);
        s.upsert_report(&r, SourceRank::new(1, true), t0()).unwrap();
        let out = s.upsert_report(&r, SourceRank::new(1, true), t0()).unwrap();
        assert!(matches!(out, UpsertOutcome::Unchanged(_)));
    }

    #[test]
    fn test_late_authoritative_confirms_older_candidate() {
        let s = store();
        let e = GeoPoint::new(38.0, 27.0);
        let first = s
            .upsert_report(&report("emsc", "e1", 5.0, e, 0), SourceRank::new(4, false), t0())
            .unwrap();
        assert_eq!(s.get(&first.event_id()).unwrap().status(), EventStatus::Candidate);
        s.upsert_report(&report("afad", "a1", 5.1, e, 1), SourceRank::new(1, true), t0())
            .unwrap();
        assert_eq!(s.get(&first.event_id()).unwrap().status(), EventStatus::Confirmed);
    }

    #[test]
    fn test_crowd_creates_confirmed_event_then_feed_corroborates() {
        let s = store();
        let centroid = GeoPoint::new(38.0, 27.0);
        let crowd = CrowdEvidence {
            centroid,
            magnitude: 5.0,
            origin_time: t0(),
            depth_km: 10.0,
            device_count: 5,
        };
        let created = s.upsert_crowd(&crowd, t0()).unwrap();
        assert!(matches!(created, UpsertOutcome::Created(ref e) if e.is_confirmed()));

        s.upsert_report(
            &report("usgs", "u1", 5.4, centroid.offset_km(5.0, 5.0), 4),
            SourceRank::new(3, false),
            t0(),
        )
        .unwrap();
        assert_eq!(s.len(), 1);
        let event = s.events().remove(0);
        assert_eq!(event.magnitude(), 5.4);
        assert_eq!(event.confirming_device_cluster_size(), 5);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_writes() {
        let s = store();
        let before = s.snapshot();
        s.upsert_report(
            &report("afad", "1", 5.0, GeoPoint::new(38.0, 27.0), 0),
            SourceRank::new(1, true),
            t0(),
        )
        .unwrap();
        assert!(before.is_empty());
        assert_eq!(s.snapshot().len(), 1);
    }

    #[test]
    fn test_prune_and_reset() {
        let s = store();
        s.upsert_report(
            &report("afad", "1", 5.0, GeoPoint::new(38.0, 27.0), 0),
            SourceRank::new(1, true),
            t0(),
        )
        .unwrap();
        assert_eq!(s.prune(t0() + Duration::hours(1)), 0);
        assert_eq!(s.prune(t0() + Duration::hours(25)), 1);
        assert!(s.is_empty());

        s.upsert_report(
            &report("afad", "2", 5.0, GeoPoint::new(38.0, 27.0), 0),
            SourceRank::new(1, true),
            t0(),
        )
        .unwrap();
        s.reset();
        assert!(s.is_empty());
        assert!(s.is_running());
    }

    #[tokio::test]
    async fn test_updates_are_broadcast() {
        let s = store();
        let mut rx = s.subscribe();
        s.upsert_report(
            &report("afad", "1", 5.0, GeoPoint::new(38.0, 27.0), 0),
            SourceRank::new(1, true),
            t0(),
        )
        .unwrap();
        let update = rx.recv().await.unwrap();
        assert_eq!(update.event_type(), "EventCreated");
        assert!(update.is_promotion());
    }

    #[test]
    fn test_concurrent_writers_produce_one_event() {
        let s = store();
        let e = GeoPoint::new(38.0, 27.0);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let s = s.clone();
                std::thread::spawn(move || {
                    let r = report(&format!("feed{i}"), "x", 5.0, e.offset_km(i as f64, 0.0), i % 3);
                    s.upsert_report(&r, SourceRank::new(2, false), t0()).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(s.len(), 1);
        assert_eq!(s.events()[0].confirming_sources().len(), 8);
    }

    #[test]
    fn test_writer_holds_stripes_of_a_distant_target() {
        let s = store();
        let e = GeoPoint::new(38.0, 27.0);
        let created = s
            .upsert_report(&report("afad", "a1", 6.0, e, 0), SourceRank::new(1, true), t0())
            .unwrap();
        let event = s.get(&created.event_id()).unwrap();

        // A relocated revision far outside every bucket of the stored event.
        let far = Observation {
            origin_time: t0() + Duration::seconds(200),
            epicenter: e.offset_km(1000.0, 0.0),
            magnitude: 6.0,
            crowd_estimate: false,
        };
        let own = s.stripe_indices(&far);
        let needed = s.stripe_indices(&observation_of(&event));
        assert!(!needed.is_subset(&own));

        let (guards, target) = s.lock_target(&far, || Some(*event.id()));
        assert_eq!(target.map(|t| *t.id()), Some(*event.id()));
        for i in needed {
            assert!(s.inner.stripes[i].try_lock().is_none(), "stripe {i} not held");
        }
        drop(guards);
    }

    #[test]
    fn test_concurrent_merges_from_both_sides_keep_every_update() {
        let s = store();
        let e = GeoPoint::new(38.0, 27.0);
        s.upsert_report(&report("afad", "a1", 6.5, e, 0), SourceRank::new(1, true), t0())
            .unwrap();

        // Lower-priority reports scattered 40 km around the epicenter and
        // ±4 s around the origin: each matches the event but not each other.
        let writers = 16;
        let handles: Vec<_> = (0..writers)
            .map(|i| {
                let s = s.clone();
                std::thread::spawn(move || {
                    let bearing = (i as f64) * std::f64::consts::TAU / writers as f64;
                    let at = e.offset_km(40.0 * bearing.cos(), 40.0 * bearing.sin());
                    let t_sec = if i % 2 == 0 { -4 } else { 4 };
                    let r = report(&format!("feed{i}"), &format!("x{i}"), 6.4, at, t_sec);
                    s.upsert_report(&r, SourceRank::new(5, false), t0()).unwrap()
                })
            })
            .collect();
        for h in handles {
            assert!(matches!(h.join().unwrap(), UpsertOutcome::Updated { .. }));
        }

        assert_eq!(s.len(), 1);
        let event = s.events().remove(0);
        assert_eq!(event.confirming_sources().len(), writers + 1);
        assert_eq!(event.revision(), writers as u32);
    }
}
