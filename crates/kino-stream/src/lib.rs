//! Kino Stream - HLS Streaming Engine
//!
//! This crate feeds a media sink from an HLS source:
//! - Multivariant and media playlist parsing
//! - Rendition selection under a resolution ceiling
//! - Segment fetching with retry, backoff and chunk coalescing
//! - Buffer scheduling driven by the playback position
//! - A sink abstraction with an in-memory implementation
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Kino Stream                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Playlist   │  │  Rendition   │  │   Segment    │           │
//! │  │    Loader    │  │   Selector   │  │   Fetcher    │           │
//! │  └──────┬───────┘  └──────┬───────┘  └──────┬───────┘           │
//! │         │                 │                 │                   │
//! │         └─────────────────┼─────────────────┘                   │
//! │                           │                                     │
//! │                    ┌──────┴──────┐                              │
//! │                    │   Stream    │                              │
//! │                    │   Engine    │                              │
//! │                    └──────┬──────┘                              │
//! │                           │                                     │
//! │  ┌──────────────┐  ┌──────┴──────┐  ┌──────────────┐            │
//! │  │  Transport   │  │   Buffer    │  │    Media     │            │
//! │  │   (retry)    │  │  Scheduler  │──│     Sink     │            │
//! │  └──────────────┘  └─────────────┘  └──────────────┘            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod error;
pub mod fetcher;
pub mod manifest;
pub mod net;
pub mod scheduler;
pub mod selector;
pub mod session;
pub mod sink;
pub mod types;

pub use buffer::{TimeRange, TimeRanges};
pub use error::{Error, Result};
pub use fetcher::{ChunkedStream, SegmentFetcher};
pub use manifest::{MediaPlaylist, MultivariantPlaylist, PlaylistKind, PlaylistLoader};
pub use net::{HttpTransport, RetryPolicy, Transport, TransportResponse};
pub use scheduler::{BufferScheduler, SchedulerSettings, TickReport};
pub use selector::{RenditionSelector, Selection, SelectionConstraints};
pub use session::StreamEngine;
pub use sink::{AppendChunk, MediaSink, MemorySink, SinkError, TrackId};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the library version once at host startup
pub fn init() {
    tracing::info!(version = VERSION, "Kino Stream initialized");
}
