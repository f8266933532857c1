//! Buffer scheduler - the streaming control loop
//!
//! Each selected rendition gets a track on the sink. On every trigger (a
//! periodic tick or a playback position change) every idle track:
//! 1. Reads its buffered ranges from the sink
//! 2. Works out which segments extend the buffer to the look-ahead target
//! 3. Fetches them in timeline order and appends their chunks one at a time
//!
//! A full sink triggers back-buffer eviction and a single retry. After each
//! tick the scheduler checks whether every track is buffered to the end and,
//! if so, signals end-of-stream once.

use crate::{
    buffer::{contiguous_buffered_end, eviction_end, segments_to_load_excluding},
    error::Error,
    fetcher::{ChunkedStream, SegmentFetcher},
    manifest::MediaPlaylist,
    sink::{AppendChunk, MediaSink, SinkError, TrackId},
    types::{EngineOptions, Rendition, RenditionKind, Segment, SessionId, StreamConfig},
    Result,
};
use bytes::Bytes;
use futures::{future::join_all, StreamExt};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

/// Timing parameters of a scheduler
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Seconds to keep buffered ahead of the playhead
    pub look_ahead: f64,
    /// Seconds kept behind the playhead when evicting
    pub back_buffer: f64,
    /// Largest gap between ranges treated as contiguous
    pub gap_tolerance: f64,
    pub tick_interval: Duration,
}

impl SchedulerSettings {
    pub fn new(options: &EngineOptions, config: &StreamConfig) -> Self {
        Self {
            look_ahead: config.look_ahead(options),
            back_buffer: options.back_buffer_secs,
            gap_tolerance: options.gap_tolerance_secs,
            tick_interval: options.tick_interval(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::new(&EngineOptions::default(), &StreamConfig::default())
    }
}

/// Per-track load state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackPhase {
    Idle,
    Loading,
    /// Buffered through the final segment
    Done,
}

/// A sink track fed from one rendition's segment list
#[derive(Debug)]
pub struct TrackState {
    id: TrackId,
    rendition: Rendition,
    segments: Vec<Segment>,
    end: f64,
    phase: Mutex<TrackPhase>,
    /// Segments the origin refused for good; never requested again
    unavailable: Mutex<HashSet<Url>>,
}

impl TrackState {
    pub fn new(id: TrackId, playlist: MediaPlaylist) -> Self {
        let end = playlist
            .segments
            .iter()
            .map(|s| s.end)
            .fold(0.0, f64::max);
        Self {
            id,
            rendition: playlist.rendition,
            segments: playlist.segments,
            end,
            phase: Mutex::new(TrackPhase::Idle),
            unavailable: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn kind(&self) -> RenditionKind {
        self.rendition.kind
    }

    pub fn rendition(&self) -> &Rendition {
        &self.rendition
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Timeline end of the last segment
    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn phase(&self) -> TrackPhase {
        *self.phase.lock()
    }

    /// The segment at `uri` failed with a status retrying cannot fix
    pub fn is_unavailable(&self, uri: &Url) -> bool {
        self.unavailable.lock().contains(uri)
    }

    fn mark_unavailable(&self, uri: &Url) {
        self.unavailable.lock().insert(uri.clone());
    }

    /// Enter `Loading` unless a load is already running
    fn begin(&self) -> Option<LoadingGuard<'_>> {
        let mut phase = self.phase.lock();
        if *phase == TrackPhase::Loading {
            return None;
        }
        *phase = TrackPhase::Loading;
        Some(LoadingGuard {
            track: self,
            next: TrackPhase::Idle,
        })
    }
}

/// Leaves `Loading` when dropped, on every exit path
struct LoadingGuard<'a> {
    track: &'a TrackState,
    next: TrackPhase,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        *self.track.phase.lock() = self.next;
    }
}

/// How a track's work for one tick ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// A previous load was still running
    Busy,
    /// Buffer already reaches the target
    Satisfied,
    /// Segments were requested
    Loaded,
    /// The sink is unusable
    Stopped,
    /// The session was cancelled
    Aborted,
}

/// Result of one track's work in a tick
#[derive(Debug, Clone, PartialEq)]
pub struct TrackReport {
    pub track: TrackId,
    pub kind: RenditionKind,
    pub outcome: TrackOutcome,
    /// Contiguous buffered end seen at the start of the tick
    pub buffered_end: f64,
    /// Segments fully appended
    pub appended: usize,
    /// Segments given up on
    pub failed: usize,
}

impl TrackReport {
    fn new(track: &TrackState, outcome: TrackOutcome) -> Self {
        Self {
            track: track.id,
            kind: track.kind(),
            outcome,
            buffered_end: 0.0,
            appended: 0,
            failed: 0,
        }
    }
}

/// Result of one scheduler tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tracks: Vec<TrackReport>,
    /// End-of-stream has been signalled to the sink
    pub end_of_stream: bool,
}

impl TickReport {
    pub fn appended(&self) -> usize {
        self.tracks.iter().map(|t| t.appended).sum()
    }

    pub fn failed(&self) -> usize {
        self.tracks.iter().map(|t| t.failed).sum()
    }

    pub fn is_aborted(&self) -> bool {
        self.tracks.iter().any(|t| t.outcome == TrackOutcome::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Tick,
    Position,
    PositionsClosed,
}

/// Drives segment loading for all tracks of a session
pub struct BufferScheduler {
    session: SessionId,
    sink: Arc<dyn MediaSink>,
    fetcher: SegmentFetcher,
    tracks: Vec<TrackState>,
    duration: Option<f64>,
    settings: SchedulerSettings,
    cancel: CancellationToken,
    ended: AtomicBool,
}

impl BufferScheduler {
    pub fn new(
        session: SessionId,
        sink: Arc<dyn MediaSink>,
        fetcher: SegmentFetcher,
        tracks: Vec<TrackState>,
        duration: Option<f64>,
        settings: SchedulerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session,
            sink,
            fetcher,
            tracks,
            duration,
            settings,
            cancel,
            ended: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn tracks(&self) -> &[TrackState] {
        &self.tracks
    }

    /// Presentation duration, if known
    pub fn duration(&self) -> Option<f64> {
        self.duration
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// End-of-stream has been signalled and no data was appended since
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }

    /// Run one scheduling pass over all tracks concurrently, then check
    /// end-of-stream
    pub async fn tick(&self) -> TickReport {
        if self.cancel.is_cancelled() {
            return TickReport {
                tracks: self
                    .tracks
                    .iter()
                    .map(|t| TrackReport::new(t, TrackOutcome::Aborted))
                    .collect(),
                end_of_stream: false,
            };
        }

        let position = self.sink.current_time();
        let tracks = join_all(self.tracks.iter().map(|t| self.load_track(t, position))).await;

        if tracks.iter().any(|t| t.appended > 0) {
            self.ended.store(false, Ordering::Release);
        }

        let end_of_stream = self.check_end_of_stream();
        TickReport {
            tracks,
            end_of_stream,
        }
    }

    #[instrument(skip_all, fields(session = %self.session, track = %track.kind(), position = position))]
    async fn load_track(&self, track: &TrackState, position: f64) -> TrackReport {
        let Some(mut guard) = track.begin() else {
            trace!("Track busy, trigger coalesced");
            return TrackReport::new(track, TrackOutcome::Busy);
        };

        let buffered = match self.sink.buffered(track.id) {
            Ok(ranges) => ranges,
            Err(SinkError::Closed) => {
                debug!("Sink closed, skipping track");
                return TrackReport::new(track, TrackOutcome::Stopped);
            }
            Err(e) => {
                warn!(error = %e, "Could not read buffered ranges");
                return TrackReport::new(track, TrackOutcome::Stopped);
            }
        };

        let tolerance = self.settings.gap_tolerance;
        let buffered_end = contiguous_buffered_end(&buffered, position, tolerance);
        let needed = {
            let unavailable = track.unavailable.lock();
            segments_to_load_excluding(
                &track.segments,
                &buffered,
                position,
                self.settings.look_ahead,
                tolerance,
                |uri| unavailable.contains(uri),
            )
        };

        if needed.is_empty() {
            if buffered_end >= track.end - tolerance {
                guard.next = TrackPhase::Done;
            }
            let mut report = TrackReport::new(track, TrackOutcome::Satisfied);
            report.buffered_end = buffered_end;
            return report;
        }

        debug!(
            buffered_end,
            target = position + self.settings.look_ahead,
            segments = needed.len(),
            "Loading segments"
        );

        let mut report = TrackReport::new(track, TrackOutcome::Loaded);
        report.buffered_end = buffered_end;

        for segment in needed {
            let Some(uri) = segment.uri.as_ref() else {
                continue;
            };
            match self.load_segment(track, segment, uri).await {
                Ok(()) => report.appended += 1,
                Err(Error::Aborted) => {
                    debug!("Session cancelled during load");
                    report.outcome = TrackOutcome::Aborted;
                    return report;
                }
                Err(Error::Sink(SinkError::Closed)) => {
                    debug!("Sink closed during load");
                    report.outcome = TrackOutcome::Stopped;
                    return report;
                }
                Err(e) if e.is_permanent_status() => {
                    warn!(uri = %uri, code = e.error_code(), error = %e, "Segment unavailable, not requesting again");
                    track.mark_unavailable(uri);
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(uri = %uri, code = e.error_code(), error = %e, "Segment failed, moving on");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Fetch one segment and append its chunks in order
    async fn load_segment(&self, track: &TrackState, segment: &Segment, uri: &Url) -> Result<()> {
        let mut chunks = self.fetcher.fetch_chunks(uri, &self.cancel).await?;

        let mut current = self.next_chunk(&mut chunks, uri).await?;
        let mut is_first = true;
        while let Some(data) = current {
            let next = self.next_chunk(&mut chunks, uri).await?;
            let chunk = AppendChunk {
                data,
                start: segment.start,
                end: segment.end,
                is_first,
                is_last: next.is_none(),
            };
            self.append_with_eviction(track, chunk, uri).await?;
            is_first = false;
            current = next;
        }

        trace!(uri = %uri, start = segment.start, end = segment.end, "Segment appended");
        Ok(())
    }

    async fn next_chunk(&self, chunks: &mut ChunkedStream, uri: &Url) -> Result<Option<Bytes>> {
        let item = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(Error::Aborted),
            item = chunks.next() => item,
        };
        match item {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(Error::Aborted)) => Err(Error::Aborted),
            Some(Err(e)) => Err(Error::SegmentFetch {
                url: uri.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(None),
        }
    }

    /// Append a chunk; on a full sink evict the back buffer and retry once
    async fn append_with_eviction(
        &self,
        track: &TrackState,
        chunk: AppendChunk,
        uri: &Url,
    ) -> Result<()> {
        self.ensure_active()?;
        let bytes = chunk.data.len();
        match self.sink.append(track.id, chunk.clone()).await {
            Ok(()) => {
                debug!(bytes, is_last = chunk.is_last, "Chunk appended");
                return Ok(());
            }
            Err(SinkError::QuotaExceeded { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let evict_to = eviction_end(self.sink.current_time(), self.settings.back_buffer);
        info!(evict_to, bytes, "Sink full, evicting back buffer");
        self.ensure_active()?;
        if evict_to > 0.0 {
            self.sink.remove(track.id, 0.0, evict_to).await?;
        }

        self.ensure_active()?;
        match self.sink.append(track.id, chunk).await {
            Ok(()) => Ok(()),
            Err(SinkError::QuotaExceeded { requested, available }) => Err(Error::SegmentFetch {
                url: uri.to_string(),
                reason: format!(
                    "sink still full after eviction ({} bytes requested, {} available)",
                    requested, available
                ),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Signal end-of-stream once every track is buffered through its end.
    ///
    /// Returns whether the stream is ended. Safe to call repeatedly; a closed
    /// sink is treated as finished rather than as an error.
    pub fn check_end_of_stream(&self) -> bool {
        let Some(duration) = self.duration else {
            return false;
        };
        if self.cancel.is_cancelled() {
            return false;
        }
        if self.ended.load(Ordering::Acquire) {
            return true;
        }

        let position = self.sink.current_time();
        let tolerance = self.settings.gap_tolerance;
        for track in &self.tracks {
            let Ok(buffered) = self.sink.buffered(track.id) else {
                return false;
            };
            let target = track.end.min(duration) - tolerance;
            if contiguous_buffered_end(&buffered, position, tolerance) < target {
                return false;
            }
        }

        if self.ended.swap(true, Ordering::AcqRel) {
            return true;
        }
        match self.sink.end_of_stream() {
            Ok(()) => info!(session = %self.session, duration, "End of stream"),
            Err(e) => debug!(error = %e, "Sink did not accept end of stream"),
        }
        for track in &self.tracks {
            let mut phase = track.phase.lock();
            if *phase == TrackPhase::Idle {
                *phase = TrackPhase::Done;
            }
        }
        true
    }

    /// Drive the scheduler until the session is cancelled.
    ///
    /// Ticks run on a fixed interval and on every position change. Each tick
    /// runs as its own task so an idle track is not held up by a slow one;
    /// the per-track guard keeps a track from loading twice at once.
    #[instrument(skip_all, fields(session = %self.session))]
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut positions = Some(self.sink.position_updates());
        let mut ticks = JoinSet::new();

        info!(tracks = self.tracks.len(), "Scheduler started");
        loop {
            let trigger = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = ticks.join_next(), if !ticks.is_empty() => {
                    if let Ok(report) = joined {
                        log_tick(&report);
                    }
                    continue;
                }
                _ = interval.tick() => Trigger::Tick,
                changed = next_position(&mut positions) => {
                    if changed { Trigger::Position } else { Trigger::PositionsClosed }
                }
            };

            if trigger == Trigger::PositionsClosed {
                debug!("Position updates closed, relying on the periodic tick");
                positions = None;
                continue;
            }

            let scheduler = Arc::clone(&self);
            ticks.spawn(async move { scheduler.tick().await });
        }

        ticks.abort_all();
        info!("Scheduler stopped");
    }
}

async fn next_position(positions: &mut Option<watch::Receiver<f64>>) -> bool {
    match positions {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

fn log_tick(report: &TickReport) {
    if report.appended() > 0 || report.failed() > 0 || report.end_of_stream {
        debug!(
            appended = report.appended(),
            failed = report.failed(),
            end_of_stream = report.end_of_stream,
            "Tick finished"
        );
    }
}
