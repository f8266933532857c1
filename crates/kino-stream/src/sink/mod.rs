//! Media sink abstraction
//!
//! A sink is the consumer of fetched media: it holds one track per selected
//! rendition, reports which time ranges each track has buffered and exposes
//! the playback position. The scheduler treats it as the source of truth for
//! what is already loaded.

pub mod memory;

pub use memory::MemorySink;

use crate::buffer::TimeRanges;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;

/// Handle of a track created on a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub usize);

impl std::fmt::Display for TrackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "track-{}", self.0)
    }
}

/// Sink failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("Sink quota exceeded: {requested} bytes requested, {available} available")]
    QuotaExceeded { requested: usize, available: usize },

    #[error("Sink is closed")]
    Closed,

    #[error("Unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("Sink is not open")]
    NotOpen,

    #[error("Unsupported content type: {0}")]
    Unsupported(String),
}

pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// A piece of segment data plus the timeline span of its segment
#[derive(Debug, Clone, PartialEq)]
pub struct AppendChunk {
    pub data: Bytes,
    /// Segment start in seconds
    pub start: f64,
    /// Segment end in seconds; equal to `start` for init data
    pub end: f64,
    /// First chunk of the segment; anything left of an earlier attempt is dropped
    pub is_first: bool,
    /// Last chunk of the segment
    pub is_last: bool,
}

impl AppendChunk {
    pub fn is_init(&self) -> bool {
        self.end <= self.start
    }
}

/// Consumer of media data
#[async_trait]
pub trait MediaSink: Send + Sync {
    /// Resolves once the sink accepts tracks
    async fn opened(&self) -> SinkResult<()>;

    /// Create a track for a content type such as `video/mp4; codecs="avc1.64001f"`
    fn create_track(&self, content_type: &str) -> SinkResult<TrackId>;

    /// Append one chunk; resolves when the append has completed
    async fn append(&self, track: TrackId, chunk: AppendChunk) -> SinkResult<()>;

    /// Drop buffered media in `[start, end)`; resolves when done
    async fn remove(&self, track: TrackId, start: f64, end: f64) -> SinkResult<()>;

    /// Buffered time ranges of a track
    fn buffered(&self, track: TrackId) -> SinkResult<TimeRanges>;

    /// Current playback position in seconds
    fn current_time(&self) -> f64;

    /// Receiver notified whenever the playback position changes
    fn position_updates(&self) -> watch::Receiver<f64>;

    /// Declare the presentation duration in seconds
    fn set_duration(&self, seconds: f64) -> SinkResult<()>;

    /// Signal that no more data will be appended
    fn end_of_stream(&self) -> SinkResult<()>;
}
