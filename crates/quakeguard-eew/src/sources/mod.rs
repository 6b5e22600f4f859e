//! External seismic feeds: capabilities, normalisation, failover and the
//! multi-source monitor.

pub mod backoff;
pub mod feed;
pub mod monitor;

pub use backoff::{Backoff, BackoffConfig};
pub use feed::{
    parse_payload, FeedDescriptor, FeedHandle, FeedMode, FeedStream, PollingFeed, RawFeedReport,
    ScriptedPollingFeed, ScriptedStreamingFeed, StreamSession, StreamingFeed,
};
pub use monitor::{FeedHealth, FeedStatus, MultiSourceMonitor, SourcesConfig};
