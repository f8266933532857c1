//! HLS manifest loading and parsing

mod attributes;
mod hls;

pub use attributes::{normalize_key, parse_attributes, Attributes};
pub use hls::{parse_media, parse_multivariant, synthesize_rendition};

use crate::{
    error::Error,
    net::{fetch_with_retry, RetryPolicy, Transport},
    types::{Rendition, Segment},
    Result,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

/// Playlist flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistKind {
    /// Lists renditions (`#EXT-X-STREAM-INF`)
    Multivariant,
    /// Lists segments (`#EXTINF`)
    Media,
}

/// Detect the playlist flavor from its content
pub fn detect_playlist_kind(text: &str) -> PlaylistKind {
    if text.contains("#EXT-X-STREAM-INF") {
        return PlaylistKind::Multivariant;
    }
    if text.contains("#EXTINF") || text.contains("#EXT-X-TARGETDURATION") {
        return PlaylistKind::Media;
    }
    PlaylistKind::Multivariant
}

/// Directory of a playlist URL: last path segment, query and fragment removed
pub fn base_uri(url: &Url) -> Url {
    let mut base = url.clone();
    base.set_query(None);
    base.set_fragment(None);
    if !base.path().ends_with('/') {
        let dir = match base.path().rfind('/') {
            Some(idx) => base.path()[..=idx].to_string(),
            None => "/".to_string(),
        };
        base.set_path(&dir);
    }
    base
}

/// Resolve a playlist URI. Values starting with `http` are used as-is,
/// everything else is joined onto the base directory of `base`.
pub fn resolve_uri(raw: &str, base: &Url) -> Result<Url> {
    let raw = raw.trim();
    let resolved = if raw.starts_with("http") {
        Url::parse(raw)
    } else {
        base_uri(base).join(raw)
    };
    resolved.map_err(|e| Error::InvalidUri {
        uri: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Renditions offered by a source
#[derive(Debug, Clone)]
pub struct MultivariantPlaylist {
    /// URL the playlist was loaded from
    pub uri: Url,
    /// Flavor of the document that was fetched
    pub kind: PlaylistKind,
    /// Renditions in manifest order
    pub renditions: Vec<Rendition>,
}

/// Segment timeline of one rendition
#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub rendition: Rendition,
    pub segments: Vec<Segment>,
}

impl MediaPlaylist {
    /// Sum of all segment durations in seconds
    pub fn duration(&self) -> f64 {
        self.segments.iter().map(|s| s.duration).sum()
    }

    /// Timed (non-init) segments
    pub fn timed_segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().filter(|s| !s.is_init())
    }
}

/// Fetches and parses playlists through a [`Transport`]
pub struct PlaylistLoader {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl PlaylistLoader {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self { transport, retry }
    }

    /// Fetch a playlist body as text (invalid UTF-8 is replaced)
    #[instrument(skip_all, fields(url = %url))]
    pub async fn fetch_text(&self, url: &Url, cancel: &CancellationToken) -> Result<String> {
        let response = fetch_with_retry(self.transport.as_ref(), url, &self.retry, cancel)
            .await
            .map_err(|e| manifest_error(url, e))?;
        let text = response.text().await.map_err(|e| manifest_error(url, e))?;
        debug!(bytes = text.len(), "Playlist fetched");
        Ok(text)
    }

    /// Load the source playlist.
    ///
    /// A media playlist given directly as the source yields a single video
    /// rendition pointing back at it.
    #[instrument(skip_all, fields(url = %url))]
    pub async fn load_multivariant(
        &self,
        url: &Url,
        cancel: &CancellationToken,
    ) -> Result<MultivariantPlaylist> {
        let text = self.fetch_text(url, cancel).await?;
        let kind = detect_playlist_kind(&text);
        let renditions = match kind {
            PlaylistKind::Multivariant => parse_multivariant(&text, url),
            PlaylistKind::Media => vec![synthesize_rendition(url)],
        };
        info!(?kind, renditions = renditions.len(), "Source playlist loaded");
        Ok(MultivariantPlaylist {
            uri: url.clone(),
            kind,
            renditions,
        })
    }

    /// Load the media playlist of a rendition
    #[instrument(skip(self, rendition, cancel), fields(rendition = %rendition.id))]
    pub async fn load_media(
        &self,
        rendition: &Rendition,
        cancel: &CancellationToken,
    ) -> Result<MediaPlaylist> {
        let text = self.fetch_text(&rendition.uri, cancel).await?;
        let segments = parse_media(&text, &rendition.uri);
        let playlist = MediaPlaylist {
            rendition: rendition.clone(),
            segments,
        };
        if playlist.timed_segments().next().is_none() {
            return Err(Error::EmptyPlaylist(rendition.uri.to_string()));
        }
        info!(
            segments = playlist.segments.len(),
            duration = playlist.duration(),
            "Media playlist loaded"
        );
        Ok(playlist)
    }
}

fn manifest_error(url: &Url, error: Error) -> Error {
    match error {
        Error::Aborted => Error::Aborted,
        Error::HttpStatus { status, .. } => Error::ManifestStatus {
            url: url.to_string(),
            status,
        },
        other => Error::ManifestFetch(format!("{}: {}", url, other)),
    }
}
