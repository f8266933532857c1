//! Core types for Kino Stream

use crate::{buffer::TimeRange, net::RetryPolicy, Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

/// Unique identifier for a load session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Video resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Parse a `WxH` resolution attribute
    pub fn parse(value: &str) -> Option<Self> {
        let (w, h) = value.trim().split_once(['x', 'X'])?;
        Some(Self {
            width: w.trim().parse().ok()?,
            height: h.trim().parse().ok()?,
        })
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Track kind of a rendition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenditionKind {
    Video,
    Audio,
}

impl std::fmt::Display for RenditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenditionKind::Video => write!(f, "video"),
            RenditionKind::Audio => write!(f, "audio"),
        }
    }
}

/// One selectable track described by a multivariant playlist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rendition {
    /// Identifier, unique within the manifest
    pub id: String,
    /// Video or audio
    pub kind: RenditionKind,
    /// Absolute URI of the rendition's media playlist
    pub uri: Url,
    /// Container MIME type (`video/mp4` or `audio/mp4`)
    pub mime_type: String,
    /// Codec used when creating the sink track
    pub codec: Option<String>,
    /// Full CODECS attribute as declared
    pub codecs: Option<String>,
    /// Declared resolution (video only)
    pub resolution: Option<Resolution>,
    /// GROUP-ID of an audio rendition
    pub group_id: Option<String>,
    /// AUDIO group referenced by a video rendition
    pub audio_group: Option<String>,
    /// DEFAULT=YES on an audio rendition
    pub is_default_audio: bool,
    /// Declared BANDWIDTH in bits per second
    pub bandwidth: Option<u64>,
    /// NAME attribute
    pub name: Option<String>,
    /// LANGUAGE attribute
    pub language: Option<String>,
    /// Remaining tag attributes, keyed by normalized name
    pub attributes: BTreeMap<String, String>,
}

impl Rendition {
    /// Declared height, if any
    pub fn height(&self) -> Option<u32> {
        self.resolution.map(|r| r.height)
    }

    /// Content type handed to the sink, e.g. `video/mp4; codecs="avc1.64001f"`
    pub fn content_type(&self) -> String {
        match &self.codec {
            Some(codec) => format!("{}; codecs=\"{}\"", self.mime_type, codec),
            None => self.mime_type.clone(),
        }
    }
}

/// One fetchable unit of a rendition's timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Absolute URI, `None` when the playlist never supplied one
    pub uri: Option<Url>,
    /// Duration in seconds; `0` marks an initialization segment
    pub duration: f64,
    /// Timeline start in seconds
    pub start: f64,
    /// Timeline end in seconds
    pub end: f64,
    /// Extra tag attributes (EXT-X-MAP only)
    pub attributes: BTreeMap<String, String>,
}

impl Segment {
    /// Create a timed media segment
    pub fn timed(uri: Option<Url>, start: f64, duration: f64) -> Self {
        Self {
            uri,
            duration,
            start,
            end: start + duration,
            attributes: BTreeMap::new(),
        }
    }

    /// Create an initialization segment
    pub fn init(uri: Option<Url>) -> Self {
        Self::timed(uri, 0.0, 0.0)
    }

    pub fn is_init(&self) -> bool {
        self.duration == 0.0
    }

    /// Timeline span of this segment
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// Resolution ceiling such as `480p`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MaxResolution(pub u32);

impl MaxResolution {
    pub fn height(&self) -> u32 {
        self.0
    }
}

impl FromStr for MaxResolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_suffix(['p', 'P'])
            .unwrap_or(trimmed);
        match digits.parse::<u32>() {
            Ok(height) if height > 0 => Ok(Self(height)),
            _ => Err(Error::InvalidConfig(format!(
                "max resolution must look like \"720p\", got {:?}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for MaxResolution {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MaxResolution> for String {
    fn from(value: MaxResolution) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for MaxResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}p", self.0)
    }
}

/// Per-source configuration supplied by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamConfig {
    /// Tallest video rendition allowed
    pub max_resolution: Option<MaxResolution>,
    /// Request the alternate audio track
    pub audio: bool,
    /// Suppress audio track selection
    pub muted: bool,
    /// Look-ahead target override (seconds)
    pub max_buffer_length: Option<f64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_resolution: None,
            audio: true,
            muted: false,
            max_buffer_length: None,
        }
    }
}

impl StreamConfig {
    /// Parse from the host's JSON representation
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_resolution(mut self, max: MaxResolution) -> Self {
        self.max_resolution = Some(max);
        self
    }

    pub fn with_muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn with_max_buffer_length(mut self, seconds: f64) -> Self {
        self.max_buffer_length = Some(seconds);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(len) = self.max_buffer_length {
            if !len.is_finite() || len <= 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "maxBufferLength must be a positive number of seconds, got {}",
                    len
                )));
            }
        }
        Ok(())
    }

    /// Whether an alternate audio rendition should be selected
    pub fn wants_audio(&self) -> bool {
        self.audio && !self.muted
    }

    /// Effective look-ahead target in seconds
    pub fn look_ahead(&self, options: &EngineOptions) -> f64 {
        self.max_buffer_length.unwrap_or(options.look_ahead_secs)
    }
}

/// Engine-wide tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Default look-ahead target (seconds)
    pub look_ahead_secs: f64,
    /// Played media retained behind the playhead on eviction (seconds)
    pub back_buffer_secs: f64,
    /// Gap between buffered ranges still treated as contiguous (seconds)
    pub gap_tolerance_secs: f64,
    /// Periodic scheduler tick
    pub tick_interval_ms: u64,
    /// Minimum bytes per sink append
    pub min_chunk_size: usize,
    /// Retry attempts after the first request
    pub max_retries: u32,
    /// Backoff base delay
    pub retry_base_delay_ms: u64,
    /// Upper bound of the multiplicative backoff jitter
    pub retry_jitter: f64,
    /// Connection establishment timeout; bodies stream without a deadline
    pub connect_timeout_ms: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            look_ahead_secs: 5.0,
            back_buffer_secs: 10.0,
            gap_tolerance_secs: 0.25,
            tick_interval_ms: 500,
            min_chunk_size: 128 * 1024,
            max_retries: 5,
            retry_base_delay_ms: 1000,
            retry_jitter: 0.1,
            connect_timeout_ms: 10_000,
        }
    }
}

impl EngineOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(Error::InvalidConfig(format!("{} must be positive, got {}", name, v)))
            }
        };
        positive("look_ahead_secs", self.look_ahead_secs)?;
        if !self.back_buffer_secs.is_finite() || self.back_buffer_secs < 0.0 {
            return Err(Error::InvalidConfig("back_buffer_secs must be >= 0".into()));
        }
        if !self.gap_tolerance_secs.is_finite() || self.gap_tolerance_secs < 0.0 {
            return Err(Error::InvalidConfig("gap_tolerance_secs must be >= 0".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick_interval_ms must be > 0".into()));
        }
        if self.min_chunk_size == 0 {
            return Err(Error::InvalidConfig("min_chunk_size must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(Error::InvalidConfig("retry_jitter must be within [0, 1]".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            jitter: self.retry_jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parse() {
        assert_eq!(Resolution::parse("1280x720"), Some(Resolution::new(1280, 720)));
        assert_eq!(Resolution::parse("640X360"), Some(Resolution::new(640, 360)));
        assert_eq!(Resolution::parse("wide"), None);
    }

    #[test]
    fn test_max_resolution_from_str() {
        assert_eq!("480p".parse::<MaxResolution>().unwrap(), MaxResolution(480));
        assert_eq!("1080P".parse::<MaxResolution>().unwrap(), MaxResolution(1080));
        assert_eq!(" 720 ".parse::<MaxResolution>().unwrap(), MaxResolution(720));
        assert!("p".parse::<MaxResolution>().is_err());
        assert!("0p".parse::<MaxResolution>().is_err());
        assert_eq!(MaxResolution(360).to_string(), "360p");
    }

    #[test]
    fn test_stream_config_json() {
        let config =
            StreamConfig::from_json(r#"{"maxResolution":"720p","muted":true,"maxBufferLength":8}"#)
                .unwrap();
        assert_eq!(config.max_resolution, Some(MaxResolution(720)));
        assert!(config.audio);
        assert!(!config.wants_audio());
        assert_eq!(config.look_ahead(&EngineOptions::default()), 8.0);

        assert!(StreamConfig::from_json(r#"{"maxResolution":"tall"}"#).is_err());
        assert!(StreamConfig::from_json(r#"{"maxBufferLength":-1}"#).is_err());
    }

    #[test]
    fn test_engine_options_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.look_ahead_secs, 5.0);
        assert_eq!(options.back_buffer_secs, 10.0);
        assert_eq!(options.gap_tolerance_secs, 0.25);
        assert_eq!(options.tick_interval(), Duration::from_millis(500));
        assert_eq!(options.min_chunk_size, 131_072);
        assert_eq!(options.retry_policy().max_retries, 5);
        assert_eq!(options.connect_timeout(), Duration::from_secs(10));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_engine_options_partial_json() {
        let options = EngineOptions::from_json(r#"{"tick_interval_ms":100}"#).unwrap();
        assert_eq!(options.tick_interval_ms, 100);
        assert_eq!(options.max_retries, 5);
        let options = EngineOptions::from_json(r#"{"connect_timeout_ms":2500}"#).unwrap();
        assert_eq!(options.connect_timeout(), Duration::from_millis(2500));
        assert!(EngineOptions::from_json(r#"{"retry_jitter":2.0}"#).is_err());
    }

    #[test]
    fn test_segment_helpers() {
        let init = Segment::init(None);
        assert!(init.is_init());
        let seg = Segment::timed(None, 4.0, 2.0);
        assert_eq!(seg.end, 6.0);
        assert_eq!(seg.range(), TimeRange::new(4.0, 6.0));
    }
}
