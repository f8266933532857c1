//! In-memory media sink
//!
//! Keeps byte accounting and buffered ranges per track without decoding
//! anything. Used for headless operation and tests.

use super::{AppendChunk, MediaSink, SinkError, SinkResult, TrackId};
use crate::buffer::{TimeRange, TimeRanges};
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Ranges closer than this are merged when reporting buffered time
const MERGE_EPSILON: f64 = 1e-6;

/// Lifecycle of a [`MemorySink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Pending,
    Open,
    Ended,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Span {
    start: f64,
    end: f64,
    bytes: usize,
}

#[derive(Debug, Default)]
struct MemoryTrack {
    content_type: String,
    init_bytes: usize,
    spans: Vec<Span>,
    /// Segment whose chunks are still arriving
    partial: Option<Span>,
    appends: usize,
}

#[derive(Debug)]
struct Inner {
    state: SinkState,
    capacity: usize,
    used: usize,
    duration: Option<f64>,
    tracks: Vec<MemoryTrack>,
    end_of_stream_calls: usize,
}

impl Inner {
    fn writable(&mut self) -> SinkResult<()> {
        match self.state {
            SinkState::Pending => Err(SinkError::NotOpen),
            SinkState::Closed => Err(SinkError::Closed),
            SinkState::Ended => {
                self.state = SinkState::Open;
                Ok(())
            }
            SinkState::Open => Ok(()),
        }
    }

    fn track(&self, track: TrackId) -> SinkResult<&MemoryTrack> {
        self.tracks.get(track.0).ok_or(SinkError::UnknownTrack(track))
    }

    fn append(&mut self, track: TrackId, chunk: &AppendChunk) -> SinkResult<()> {
        self.writable()?;
        let Inner {
            tracks,
            used,
            capacity,
            ..
        } = self;
        let entry = tracks.get_mut(track.0).ok_or(SinkError::UnknownTrack(track))?;

        let stale = entry
            .partial
            .is_some_and(|p| {
                !chunk.is_init() && (chunk.is_first || p.start != chunk.start || p.end != chunk.end)
            });
        if stale {
            if let Some(abandoned) = entry.partial.take() {
                *used = used.saturating_sub(abandoned.bytes);
            }
        }

        let len = chunk.data.len();
        let available = capacity.saturating_sub(*used);
        if len > available {
            return Err(SinkError::QuotaExceeded {
                requested: len,
                available,
            });
        }
        *used += len;
        entry.appends += 1;

        if chunk.is_init() {
            entry.init_bytes += len;
            return Ok(());
        }

        let partial = entry.partial.get_or_insert(Span {
            start: chunk.start,
            end: chunk.end,
            bytes: 0,
        });
        partial.bytes += len;

        if chunk.is_last {
            if let Some(complete) = entry.partial.take() {
                let (replaced, kept): (Vec<Span>, Vec<Span>) = entry
                    .spans
                    .drain(..)
                    .partition(|s| s.start >= complete.start && s.end <= complete.end);
                *used = used.saturating_sub(replaced.iter().map(|s| s.bytes).sum());
                entry.spans = kept;
                entry.spans.push(complete);
                entry.spans.sort_by(|a, b| a.start.total_cmp(&b.start));
            }
        }
        Ok(())
    }

    fn remove(&mut self, track: TrackId, start: f64, end: f64) -> SinkResult<()> {
        if self.state == SinkState::Closed {
            return Err(SinkError::Closed);
        }
        let Inner { tracks, used, .. } = self;
        let entry = tracks.get_mut(track.0).ok_or(SinkError::UnknownTrack(track))?;

        let mut kept = Vec::with_capacity(entry.spans.len());
        for span in entry.spans.drain(..) {
            if span.end <= start || span.start >= end {
                kept.push(span);
                continue;
            }
            let length = span.end - span.start;
            let mut retained = 0;
            if span.start < start {
                let piece = piece_of(&span, span.start, start, length);
                retained += piece.bytes;
                kept.push(piece);
            }
            if span.end > end {
                let piece = piece_of(&span, end, span.end, length);
                retained += piece.bytes;
                kept.push(piece);
            }
            *used = used.saturating_sub(span.bytes.saturating_sub(retained));
        }
        entry.spans = kept;
        Ok(())
    }
}

fn piece_of(span: &Span, start: f64, end: f64, length: f64) -> Span {
    let share = if length > 0.0 { (end - start) / length } else { 0.0 };
    Span {
        start,
        end,
        bytes: ((span.bytes as f64) * share).round() as usize,
    }
}

/// Sink that records appended media in memory, bounded by a byte quota
#[derive(Debug)]
pub struct MemorySink {
    inner: Mutex<Inner>,
    opened: watch::Sender<bool>,
    position: watch::Sender<f64>,
}

impl MemorySink {
    /// Create an open sink holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        let sink = Self::pending(capacity);
        sink.open();
        sink
    }

    /// Create a sink that rejects tracks until [`open`](Self::open) is called
    pub fn pending(capacity: usize) -> Self {
        let (opened, _) = watch::channel(false);
        let (position, _) = watch::channel(0.0);
        Self {
            inner: Mutex::new(Inner {
                state: SinkState::Pending,
                capacity,
                used: 0,
                duration: None,
                tracks: Vec::new(),
                end_of_stream_calls: 0,
            }),
            opened,
            position,
        }
    }

    pub fn open(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == SinkState::Pending {
                inner.state = SinkState::Open;
            }
        }
        self.opened.send_replace(true);
    }

    /// Detach the sink; later operations fail with [`SinkError::Closed`]
    pub fn close(&self) {
        self.inner.lock().state = SinkState::Closed;
        self.opened.send_replace(true);
        debug!("Memory sink closed");
    }

    /// Move the playhead and notify position subscribers
    pub fn set_position(&self, seconds: f64) {
        self.position.send_replace(seconds);
    }

    /// Drop everything buffered on a track
    pub fn clear_track(&self, track: TrackId) -> SinkResult<()> {
        self.inner.lock().remove(track, f64::NEG_INFINITY, f64::INFINITY)
    }

    pub fn state(&self) -> SinkState {
        self.inner.lock().state
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SinkState::Ended
    }

    pub fn duration(&self) -> Option<f64> {
        self.inner.lock().duration
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    pub fn bytes_used(&self) -> usize {
        self.inner.lock().used
    }

    pub fn track_count(&self) -> usize {
        self.inner.lock().tracks.len()
    }

    pub fn content_type(&self, track: TrackId) -> SinkResult<String> {
        Ok(self.inner.lock().track(track)?.content_type.clone())
    }

    /// Number of successful appends on a track
    pub fn append_count(&self, track: TrackId) -> SinkResult<usize> {
        Ok(self.inner.lock().track(track)?.appends)
    }

    pub fn init_bytes(&self, track: TrackId) -> SinkResult<usize> {
        Ok(self.inner.lock().track(track)?.init_bytes)
    }

    pub fn end_of_stream_calls(&self) -> usize {
        self.inner.lock().end_of_stream_calls
    }
}

#[async_trait]
impl MediaSink for MemorySink {
    async fn opened(&self) -> SinkResult<()> {
        let mut rx = self.opened.subscribe();
        rx.wait_for(|open| *open).await.map_err(|_| SinkError::Closed)?;
        match self.state() {
            SinkState::Closed => Err(SinkError::Closed),
            _ => Ok(()),
        }
    }

    fn create_track(&self, content_type: &str) -> SinkResult<TrackId> {
        let mut inner = self.inner.lock();
        match inner.state {
            SinkState::Closed => return Err(SinkError::Closed),
            SinkState::Pending => return Err(SinkError::NotOpen),
            _ => {}
        }
        if !(content_type.starts_with("video/") || content_type.starts_with("audio/")) {
            return Err(SinkError::Unsupported(content_type.to_string()));
        }
        let id = TrackId(inner.tracks.len());
        inner.tracks.push(MemoryTrack {
            content_type: content_type.to_string(),
            ..MemoryTrack::default()
        });
        debug!(track = %id, content_type, "Track created");
        Ok(id)
    }

    async fn append(&self, track: TrackId, chunk: AppendChunk) -> SinkResult<()> {
        self.inner.lock().append(track, &chunk)?;
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn remove(&self, track: TrackId, start: f64, end: f64) -> SinkResult<()> {
        self.inner.lock().remove(track, start, end)?;
        tokio::task::yield_now().await;
        Ok(())
    }

    fn buffered(&self, track: TrackId) -> SinkResult<TimeRanges> {
        let inner = self.inner.lock();
        if inner.state == SinkState::Closed {
            return Err(SinkError::Closed);
        }
        let mut merged: Vec<TimeRange> = Vec::new();
        for span in &inner.track(track)?.spans {
            match merged.last_mut() {
                Some(last) if span.start <= last.end + MERGE_EPSILON => {
                    last.end = last.end.max(span.end);
                }
                _ => merged.push(TimeRange::new(span.start, span.end)),
            }
        }
        Ok(TimeRanges::new(merged))
    }

    fn current_time(&self) -> f64 {
        *self.position.borrow()
    }

    fn position_updates(&self) -> watch::Receiver<f64> {
        self.position.subscribe()
    }

    fn set_duration(&self, seconds: f64) -> SinkResult<()> {
        let mut inner = self.inner.lock();
        if inner.state == SinkState::Closed {
            return Err(SinkError::Closed);
        }
        inner.duration = Some(seconds);
        Ok(())
    }

    fn end_of_stream(&self) -> SinkResult<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            SinkState::Closed => Err(SinkError::Closed),
            SinkState::Pending => Err(SinkError::NotOpen),
            _ => {
                inner.state = SinkState::Ended;
                inner.end_of_stream_calls += 1;
                Ok(())
            }
        }
    }
}
