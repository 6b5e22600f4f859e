//! Seismic feed capabilities, descriptors and payload normalisation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::{GeoPoint, SourceId, SourceRank, SourceReport};
use crate::error::FeedError;
use crate::wave::DEFAULT_DEPTH_KM;

/// How a feed delivers reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    /// Long-lived push connection
    Streaming,
    /// Periodic fetch
    Polling,
}

/// Static description of one feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedDescriptor {
    /// Stable feed id
    pub id: String,
    /// Display name
    pub name: String,
    /// Delivery mode
    pub mode: FeedMode,
    /// 1 is the highest priority
    pub priority: u8,
    /// A single report from this feed confirms an event
    pub authoritative: bool,
    /// Reports below this magnitude are ignored
    pub min_magnitude: f64,
    /// Fetch interval for polling feeds
    pub poll_interval_sec: f64,
}

impl FeedDescriptor {
    /// Streaming feed descriptor
    pub fn streaming(id: impl Into<String>, priority: u8, authoritative: bool) -> Self {
        let id = id.into();
        Self {
            name: id.to_uppercase(),
            id,
            mode: FeedMode::Streaming,
            priority,
            authoritative,
            min_magnitude: 0.0,
            poll_interval_sec: 0.0,
        }
    }

    /// Polling feed descriptor
    pub fn polling(id: impl Into<String>, priority: u8, authoritative: bool, interval_sec: f64) -> Self {
        let id = id.into();
        Self {
            name: id.to_uppercase(),
            id,
            mode: FeedMode::Polling,
            priority,
            authoritative,
            min_magnitude: 0.0,
            poll_interval_sec: interval_sec,
        }
    }

    /// Set the magnitude filter
    pub fn with_min_magnitude(mut self, min_magnitude: f64) -> Self {
        self.min_magnitude = min_magnitude;
        self
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Trust rank used when merging
    pub fn rank(&self) -> SourceRank {
        SourceRank::new(self.priority, self.authoritative)
    }

    /// Source id stamped on reports
    pub fn source_id(&self) -> SourceId {
        SourceId::new(self.id.clone())
    }

    /// Default feed chain: a regional streaming agency first, polling fallbacks after.
    pub fn default_chain() -> Vec<FeedDescriptor> {
        vec![
            FeedDescriptor::streaming("afad", 1, true).with_name("AFAD"),
            FeedDescriptor::polling("kandilli", 2, true, 10.0).with_name("Kandilli"),
            FeedDescriptor::polling("usgs", 3, false, 30.0)
                .with_name("USGS")
                .with_min_magnitude(4.0),
            FeedDescriptor::polling("emsc", 4, false, 60.0).with_name("EMSC"),
        ]
    }
}

/// Feed payload before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFeedReport {
    /// Feed-assigned event id
    #[serde(alias = "eventId", alias = "event_id")]
    pub id: String,
    /// Magnitude
    #[serde(alias = "mag")]
    pub magnitude: f64,
    /// Epicenter latitude
    #[serde(alias = "lat")]
    pub latitude: f64,
    /// Epicenter longitude
    #[serde(alias = "lon", alias = "lng")]
    pub longitude: f64,
    /// Focal depth in km
    #[serde(default, alias = "depth")]
    pub depth_km: Option<f64>,
    /// Origin time
    #[serde(alias = "time", alias = "originTime")]
    pub origin_time: DateTime<Utc>,
    /// Publication time
    #[serde(default, alias = "updated", alias = "reportedAt")]
    pub reported_at: Option<DateTime<Utc>>,
}

impl RawFeedReport {
    /// Validate and convert into a [`SourceReport`].
    pub fn normalize(&self, feed: &FeedDescriptor, now: DateTime<Utc>) -> Result<SourceReport, FeedError> {
        if self.id.trim().is_empty() {
            return Err(FeedError::malformed(&feed.id, "empty event id"));
        }
        if !self.magnitude.is_finite() || !(-2.0..=10.0).contains(&self.magnitude) {
            return Err(FeedError::malformed(
                &feed.id,
                format!("magnitude {} out of range", self.magnitude),
            ));
        }
        let epicenter = GeoPoint::new(self.latitude, self.longitude);
        if !epicenter.is_valid() {
            return Err(FeedError::malformed(&feed.id, format!("invalid epicenter {epicenter}")));
        }
        let depth_km = self.depth_km.unwrap_or(DEFAULT_DEPTH_KM);
        if !depth_km.is_finite() || depth_km < 0.0 {
            return Err(FeedError::malformed(&feed.id, format!("invalid depth {depth_km}")));
        }

        Ok(SourceReport {
            source_id: feed.source_id(),
            external_event_id: self.id.clone(),
            magnitude: self.magnitude,
            epicenter,
            depth_km,
            origin_time: self.origin_time,
            reported_at: self.reported_at.unwrap_or(now),
        })
    }
}

/// Parse a JSON payload holding one report or an array of reports.
pub fn parse_payload(feed: &FeedDescriptor, json: &str) -> Result<Vec<RawFeedReport>, FeedError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Many(Vec<RawFeedReport>),
        One(RawFeedReport),
    }

    match serde_json::from_str::<Payload>(json) {
        Ok(Payload::Many(reports)) => Ok(reports),
        Ok(Payload::One(report)) => Ok(vec![report]),
        Err(e) => Err(FeedError::malformed(&feed.id, e.to_string())),
    }
}

/// Open push connection.
#[async_trait]
pub trait FeedStream: Send {
    /// Next report. `None` means the connection dropped.
    async fn next_report(&mut self) -> Option<Result<RawFeedReport, FeedError>>;
}

/// Push feed capability.
#[async_trait]
pub trait StreamingFeed: Send + Sync {
    /// Feed description
    fn descriptor(&self) -> &FeedDescriptor;

    /// Whether this feed can be used on this host
    fn is_available(&self) -> bool {
        true
    }

    /// Open a connection
    async fn connect(&self) -> Result<Box<dyn FeedStream>, FeedError>;
}

/// Polling feed capability.
#[async_trait]
pub trait PollingFeed: Send + Sync {
    /// Feed description
    fn descriptor(&self) -> &FeedDescriptor;

    /// Whether this feed can be used on this host
    fn is_available(&self) -> bool {
        true
    }

    /// Fetch the current report list
    async fn fetch(&self) -> Result<Vec<RawFeedReport>, FeedError>;
}

/// A feed of either kind; the monitor is polymorphic over this set.
#[derive(Clone)]
pub enum FeedHandle {
    /// Push feed
    Streaming(Arc<dyn StreamingFeed>),
    /// Polling feed
    Polling(Arc<dyn PollingFeed>),
}

impl FeedHandle {
    /// Feed description
    pub fn descriptor(&self) -> &FeedDescriptor {
        match self {
            FeedHandle::Streaming(f) => f.descriptor(),
            FeedHandle::Polling(f) => f.descriptor(),
        }
    }

    /// Whether this feed can be used on this host
    pub fn is_available(&self) -> bool {
        match self {
            FeedHandle::Streaming(f) => f.is_available(),
            FeedHandle::Polling(f) => f.is_available(),
        }
    }
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("FeedHandle").field(&self.descriptor().id).finish()
    }
}

/// Polling feed that replays scripted responses, then returns empty lists.
pub struct ScriptedPollingFeed {
    descriptor: FeedDescriptor,
    available: bool,
    responses: Mutex<VecDeque<Result<Vec<RawFeedReport>, FeedError>>>,
    fetches: AtomicUsize,
}

impl ScriptedPollingFeed {
    /// Create with no scripted responses
    pub fn new(descriptor: FeedDescriptor) -> Self {
        Self {
            descriptor,
            available: true,
            responses: Mutex::new(VecDeque::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Queue a response
    pub fn push_response(&self, response: Result<Vec<RawFeedReport>, FeedError>) {
        self.responses.lock().push_back(response);
    }

    /// Builder form of [`ScriptedPollingFeed::push_response`]
    pub fn with_response(self, response: Result<Vec<RawFeedReport>, FeedError>) -> Self {
        self.push_response(response);
        self
    }

    /// Mark as unavailable on this host
    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// Number of fetches so far
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PollingFeed for ScriptedPollingFeed {
    fn descriptor(&self) -> &FeedDescriptor {
        &self.descriptor
    }

    fn is_available(&self) -> bool {
        self.available
    }

    async fn fetch(&self) -> Result<Vec<RawFeedReport>, FeedError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.responses.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// One scripted connection of a [`ScriptedStreamingFeed`].
#[derive(Debug, Clone)]
pub enum StreamSession {
    /// Connection attempt fails
    Refused(FeedError),
    /// Connection yields these items, then drops
    Deliver(Vec<Result<RawFeedReport, FeedError>>),
}

/// Streaming feed that plays scripted sessions. Once the script is
/// exhausted, connections succeed and stay open without traffic.
pub struct ScriptedStreamingFeed {
    descriptor: FeedDescriptor,
    sessions: Mutex<VecDeque<StreamSession>>,
    connects: AtomicUsize,
}

impl ScriptedStreamingFeed {
    /// Create with no scripted sessions
    pub fn new(descriptor: FeedDescriptor) -> Self {
        Self {
            descriptor,
            sessions: Mutex::new(VecDeque::new()),
            connects: AtomicUsize::new(0),
        }
    }

    /// Queue a session
    pub fn with_session(self, session: StreamSession) -> Self {
        self.sessions.lock().push_back(session);
        self
    }

    /// Connection attempts so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

struct ScriptedStream {
    items: VecDeque<Result<RawFeedReport, FeedError>>,
    hold_open: bool,
}

#[async_trait]
impl FeedStream for ScriptedStream {
    async fn next_report(&mut self) -> Option<Result<RawFeedReport, FeedError>> {
        match self.items.pop_front() {
            Some(item) => Some(item),
            None if self.hold_open => std::future::pending().await,
            None => None,
        }
    }
}

#[async_trait]
impl StreamingFeed for ScriptedStreamingFeed {
    fn descriptor(&self) -> &FeedDescriptor {
        &self.descriptor
    }

    async fn connect(&self) -> Result<Box<dyn FeedStream>, FeedError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        let session = self.sessions.lock().pop_front();
        match session {
            Some(StreamSession::Refused(e)) => Err(e),
            Some(StreamSession::Deliver(items)) => Ok(Box::new(ScriptedStream {
                items: items.into(),
                hold_open: false,
            })),
            None => Ok(Box::new(ScriptedStream {
                items: VecDeque::new(),
                hold_open: true,
            })),
        }
    }
}
