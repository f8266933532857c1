//! Buffered time-range arithmetic
//!
//! Handles:
//! - Contiguous buffered end from the playhead, with gap tolerance
//! - Coverage checks for already-buffered segments
//! - Selecting the segments needed to reach the look-ahead target
//! - Back-buffer eviction bounds
//!
//! Nothing here caches sink state: callers pass the ranges the sink reports
//! on every tick.

use crate::types::Segment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use url::Url;

/// Default gap between ranges still treated as contiguous (seconds)
pub const DEFAULT_GAP_TOLERANCE: f64 = 0.25;

/// Half-open `[start, end)` interval of buffered media time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// True if `time` lies within the range widened by `tolerance` on both sides
    pub fn contains_within(&self, time: f64, tolerance: f64) -> bool {
        time >= self.start - tolerance && time <= self.end + tolerance
    }

    /// True if `other` lies entirely inside the range widened by `tolerance`
    pub fn covers(&self, other: &TimeRange, tolerance: f64) -> bool {
        self.start - tolerance <= other.start && self.end + tolerance >= other.end
    }
}

/// Ordered set of buffered ranges as reported by a sink
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRanges(Vec<TimeRange>);

impl TimeRanges {
    /// Build from arbitrary ranges; they are ordered by start
    pub fn new(mut ranges: Vec<TimeRange>) -> Self {
        ranges.sort_by(|a, b| a.start.total_cmp(&b.start));
        Self(ranges)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TimeRange> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[TimeRange] {
        &self.0
    }

    pub fn start(&self, index: usize) -> Option<f64> {
        self.0.get(index).map(|r| r.start)
    }

    pub fn end(&self, index: usize) -> Option<f64> {
        self.0.get(index).map(|r| r.end)
    }

    /// Seconds buffered contiguously ahead of `time`
    pub fn buffered_ahead(&self, time: f64, tolerance: f64) -> f64 {
        contiguous_buffered_end(self, time, tolerance) - time
    }
}

impl From<Vec<(f64, f64)>> for TimeRanges {
    fn from(ranges: Vec<(f64, f64)>) -> Self {
        Self::new(
            ranges
                .into_iter()
                .map(|(start, end)| TimeRange::new(start, end))
                .collect(),
        )
    }
}

impl<'a> IntoIterator for &'a TimeRanges {
    type Item = &'a TimeRange;
    type IntoIter = std::slice::Iter<'a, TimeRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Furthest time reachable from `time` by following ranges whose gaps are
/// within `tolerance`.
///
/// Returns `time` itself when no range contains or borders it.
pub fn contiguous_buffered_end(ranges: &TimeRanges, time: f64, tolerance: f64) -> f64 {
    let Some(first) = ranges
        .iter()
        .position(|range| range.contains_within(time, tolerance))
    else {
        return time;
    };

    let mut end = ranges.0[first].end;
    for next in &ranges.0[first + 1..] {
        if next.start - end > tolerance {
            break;
        }
        end = end.max(next.end);
    }
    end
}

/// True if some buffered range fully covers `range` (with tolerance)
pub fn is_covered(ranges: &TimeRanges, range: &TimeRange, tolerance: f64) -> bool {
    ranges.iter().any(|buffered| buffered.covers(range, tolerance))
}

/// End of the region to evict when the sink runs out of space
pub fn eviction_end(position: f64, back_buffer: f64) -> f64 {
    (position - back_buffer).max(0.0)
}

/// Segments that must be fetched to extend the buffer to `time + look_ahead`.
///
/// The init segment leads when nothing is buffered. Timed segments are walked
/// from the first one ending past the contiguous buffered end, skipping
/// segments without a URI, segments already covered, and URIs already picked,
/// until a picked segment reaches the target. A covered segment reaching the
/// target also ends the walk.
pub fn segments_to_load<'a>(
    segments: &'a [Segment],
    buffered: &TimeRanges,
    time: f64,
    look_ahead: f64,
    tolerance: f64,
) -> Vec<&'a Segment> {
    segments_to_load_excluding(segments, buffered, time, look_ahead, tolerance, |_| false)
}

/// [`segments_to_load`] that also passes over URIs for which `excluded`
/// returns true, treating them like covered segments.
pub fn segments_to_load_excluding<'a>(
    segments: &'a [Segment],
    buffered: &TimeRanges,
    time: f64,
    look_ahead: f64,
    tolerance: f64,
    excluded: impl Fn(&Url) -> bool,
) -> Vec<&'a Segment> {
    let target = time + look_ahead;
    let buffered_end = contiguous_buffered_end(buffered, time, tolerance);
    if buffered_end >= target {
        return Vec::new();
    }

    let mut picked = Vec::new();
    let mut seen = HashSet::new();

    if buffered.is_empty() {
        if let Some(init) = segments.iter().find(|s| s.is_init()) {
            if let Some(uri) = init.uri.as_ref().filter(|uri| !excluded(*uri)) {
                seen.insert(uri);
                picked.push(init);
            }
        }
    }

    let timed = segments
        .iter()
        .filter(|s| !s.is_init())
        .skip_while(|s| s.end <= buffered_end);

    for segment in timed {
        let Some(uri) = &segment.uri else {
            continue;
        };
        if excluded(uri) || is_covered(buffered, &segment.range(), tolerance) {
            if segment.end >= target {
                break;
            }
            continue;
        }
        if !seen.insert(uri) {
            continue;
        }
        picked.push(segment);
        if segment.end >= target {
            break;
        }
    }

    picked
}
