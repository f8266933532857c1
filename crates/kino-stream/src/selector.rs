//! Rendition selection
//!
//! Picks one video rendition and, optionally, the default audio rendition of
//! the video's audio group:
//! - With a height ceiling, the tallest video at or under it wins
//! - Without one, the first video in manifest order wins
//! - Video renditions without a declared height always pass the ceiling

use crate::{
    error::Error,
    types::{Rendition, RenditionKind, StreamConfig},
    Result,
};
use tracing::{debug, instrument};

/// Constraints applied when choosing renditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionConstraints {
    /// Tallest allowed video height in pixels
    pub max_height: Option<u32>,
    /// Include the default audio rendition of the video's audio group
    pub audio: bool,
}

impl Default for SelectionConstraints {
    fn default() -> Self {
        Self {
            max_height: None,
            audio: true,
        }
    }
}

impl From<&StreamConfig> for SelectionConstraints {
    fn from(config: &StreamConfig) -> Self {
        Self {
            max_height: config.max_resolution.map(|r| r.height()),
            audio: config.wants_audio(),
        }
    }
}

/// Chosen renditions
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub video: Rendition,
    pub audio: Option<Rendition>,
}

impl Selection {
    /// Selected renditions, video first
    pub fn renditions(&self) -> impl Iterator<Item = &Rendition> {
        std::iter::once(&self.video).chain(self.audio.as_ref())
    }
}

/// Chooses renditions from a parsed multivariant playlist
#[derive(Debug, Clone, Default)]
pub struct RenditionSelector;

impl RenditionSelector {
    pub fn new() -> Self {
        Self
    }

    /// Select renditions for playback.
    ///
    /// Fails with [`Error::NoSuitableRendition`] when no video rendition
    /// satisfies the constraints.
    #[instrument(skip_all, fields(max_height = ?constraints.max_height, audio = constraints.audio))]
    pub fn select(
        &self,
        renditions: &[Rendition],
        constraints: &SelectionConstraints,
    ) -> Result<Selection> {
        let (videos, audios): (Vec<&Rendition>, Vec<&Rendition>) = renditions
            .iter()
            .partition(|r| r.kind == RenditionKind::Video);

        let video = match constraints.max_height {
            Some(max) => Self::tallest_within(&videos, max),
            None => videos.first().copied(),
        }
        .ok_or_else(|| {
            Error::NoSuitableRendition(match constraints.max_height {
                Some(max) => format!("no video rendition at or below {}p", max),
                None => "manifest lists no video renditions".to_string(),
            })
        })?;

        let audio = if constraints.audio {
            Self::default_audio(&audios, video)
        } else {
            None
        };

        debug!(
            video = %video.id,
            height = ?video.height(),
            audio = ?audio.map(|a| a.id.as_str()),
            "Renditions selected"
        );

        Ok(Selection {
            video: video.clone(),
            audio: audio.cloned(),
        })
    }

    /// Tallest video not exceeding `max`; ties keep manifest order
    fn tallest_within<'a>(videos: &[&'a Rendition], max: u32) -> Option<&'a Rendition> {
        let mut candidates: Vec<&Rendition> = videos
            .iter()
            .copied()
            .filter(|r| r.height().map_or(true, |h| h <= max))
            .collect();
        candidates.sort_by(|a, b| b.height().unwrap_or(0).cmp(&a.height().unwrap_or(0)));
        candidates.first().copied()
    }

    fn default_audio<'a>(audios: &[&'a Rendition], video: &Rendition) -> Option<&'a Rendition> {
        let group = video.audio_group.as_deref()?;
        audios
            .iter()
            .copied()
            .find(|a| a.is_default_audio && a.group_id.as_deref() == Some(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Resolution;
    use std::collections::BTreeMap;
    use url::Url;

    fn video(id: &str, height: Option<u32>) -> Rendition {
        Rendition {
            id: id.to_string(),
            kind: RenditionKind::Video,
            uri: Url::parse(&format!("https://cdn.example.com/{}.m3u8", id)).unwrap(),
            mime_type: "video/mp4".to_string(),
            codec: Some("avc1.64001f".to_string()),
            codecs: None,
            resolution: height.map(|h| Resolution::new(h * 16 / 9, h)),
            group_id: None,
            audio_group: Some("aac".to_string()),
            is_default_audio: false,
            bandwidth: None,
            name: None,
            language: None,
            attributes: BTreeMap::new(),
        }
    }

    fn audio(id: &str, group: &str, is_default: bool) -> Rendition {
        Rendition {
            kind: RenditionKind::Audio,
            mime_type: "audio/mp4".to_string(),
            codec: Some("mp4a.40.2".to_string()),
            resolution: None,
            group_id: Some(group.to_string()),
            audio_group: None,
            is_default_audio: is_default,
            ..video(id, None)
        }
    }

    fn ladder() -> Vec<Rendition> {
        vec![
            audio("audio-en", "aac", true),
            audio("audio-de", "aac", false),
            video("v360", Some(360)),
            video("v480", Some(480)),
            video("v720", Some(720)),
            video("v1080", Some(1080)),
        ]
    }

    fn constraints(max_height: Option<u32>, audio: bool) -> SelectionConstraints {
        SelectionConstraints { max_height, audio }
    }

    #[test]
    fn test_tallest_under_ceiling() {
        let selection = RenditionSelector::new()
            .select(&ladder(), &constraints(Some(480), true))
            .unwrap();
        assert_eq!(selection.video.id, "v480");
        assert_eq!(selection.audio.unwrap().id, "audio-en");
    }

    #[test]
    fn test_ceiling_between_rungs() {
        let selection = RenditionSelector::new()
            .select(&ladder(), &constraints(Some(719), false))
            .unwrap();
        assert_eq!(selection.video.id, "v480");
        assert!(selection.audio.is_none());
    }

    #[test]
    fn test_first_video_without_ceiling() {
        let selection = RenditionSelector::new()
            .select(&ladder(), &SelectionConstraints::default())
            .unwrap();
        assert_eq!(selection.video.id, "v360");
        assert_eq!(selection.renditions().count(), 2);
    }

    #[test]
    fn test_ceiling_below_every_rendition() {
        let err = RenditionSelector::new()
            .select(&ladder(), &constraints(Some(240), true))
            .unwrap_err();
        assert!(matches!(err, Error::NoSuitableRendition(_)));
    }

    #[test]
    fn test_no_video_renditions() {
        let only_audio = vec![audio("a", "aac", true)];
        let err = RenditionSelector::new()
            .select(&only_audio, &SelectionConstraints::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoSuitableRendition(_)));
    }

    #[test]
    fn test_heightless_video_passes_ceiling() {
        let renditions = vec![video("unknown", None), video("v1080", Some(1080))];
        let selection = RenditionSelector::new()
            .select(&renditions, &constraints(Some(720), true))
            .unwrap();
        assert_eq!(selection.video.id, "unknown");
    }

    #[test]
    fn test_equal_heights_keep_manifest_order() {
        let renditions = vec![video("first", Some(720)), video("second", Some(720))];
        let selection = RenditionSelector::new()
            .select(&renditions, &constraints(Some(1080), true))
            .unwrap();
        assert_eq!(selection.video.id, "first");
    }

    #[test]
    fn test_audio_group_must_match() {
        let renditions = vec![audio("other", "ac3", true), video("v480", Some(480))];
        let selection = RenditionSelector::new()
            .select(&renditions, &SelectionConstraints::default())
            .unwrap();
        assert!(selection.audio.is_none());
    }

    #[test]
    fn test_constraints_from_config() {
        let config = StreamConfig::default()
            .with_max_resolution("720p".parse().unwrap())
            .with_muted(true);
        let constraints = SelectionConstraints::from(&config);
        assert_eq!(constraints.max_height, Some(720));
        assert!(!constraints.audio);
    }
}
