//! HLS playlist parser
//!
//! Both playlist flavors are parsed by folding lines through an ordered rule
//! table. Each rule pairs a line predicate with a handler that updates the
//! model being built; the first matching rule wins and lines no rule claims
//! are dropped. Supported tags:
//! - `#EXT-X-MEDIA` (alternate audio renditions)
//! - `#EXT-X-STREAM-INF` (video variants)
//! - `#EXT-X-MAP` (initialization segments)
//! - `#EXTINF` (media segments)

use super::attributes::{parse_attributes, Attributes};
use super::resolve_uri;
use crate::types::{Rendition, RenditionKind, Resolution, Segment};
use tracing::trace;
use url::Url;

const VIDEO_MIME: &str = "video/mp4";
const AUDIO_MIME: &str = "audio/mp4";
const AUDIO_CODEC_PREFIX: &str = "mp4a";

/// A line predicate paired with the handler that folds the line into `M`
struct Rule<M> {
    name: &'static str,
    matches: fn(&str) -> bool,
    apply: fn(&mut M, &str, &Url),
}

/// Fold every line of `text` through `rules`
fn reduce<M: Default>(text: &str, rules: &[Rule<M>], base: &Url) -> M {
    let mut model = M::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match rules.iter().find(|rule| (rule.matches)(line)) {
            Some(rule) => {
                trace!(rule = rule.name, line, "Applying playlist rule");
                (rule.apply)(&mut model, line, base);
            }
            None => trace!(line, "Ignoring playlist line"),
        }
    }
    model
}

fn is_uri_line(line: &str) -> bool {
    !line.starts_with('#')
}

fn is_media_tag(line: &str) -> bool {
    line.starts_with("#EXT-X-MEDIA:")
}

fn is_stream_inf_tag(line: &str) -> bool {
    line.starts_with("#EXT-X-STREAM-INF:")
}

fn is_map_tag(line: &str) -> bool {
    line.starts_with("#EXT-X-MAP:")
}

fn is_extinf_tag(line: &str) -> bool {
    line.starts_with("#EXTINF:")
}

fn resolve_or_skip(raw: &str, base: &Url) -> Option<Url> {
    match resolve_uri(raw, base) {
        Ok(uri) => Some(uri),
        Err(e) => {
            trace!(uri = raw, error = %e, "Skipping unresolvable URI");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Multivariant playlists
// ---------------------------------------------------------------------------

/// Rendition under construction; the URI may arrive on a later line
#[derive(Debug)]
struct PendingRendition {
    kind: RenditionKind,
    uri: Option<Url>,
    codec: Option<String>,
    codecs: Option<String>,
    resolution: Option<Resolution>,
    group_id: Option<String>,
    audio_group: Option<String>,
    is_default_audio: bool,
    bandwidth: Option<u64>,
    name: Option<String>,
    language: Option<String>,
    attributes: Attributes,
}

impl PendingRendition {
    fn new(kind: RenditionKind, attributes: Attributes) -> Self {
        Self {
            kind,
            uri: None,
            codec: None,
            codecs: None,
            resolution: None,
            group_id: None,
            audio_group: None,
            is_default_audio: false,
            bandwidth: None,
            name: None,
            language: None,
            attributes,
        }
    }
}

#[derive(Debug, Default)]
struct MultivariantModel {
    entries: Vec<PendingRendition>,
}

const MULTIVARIANT_RULES: &[Rule<MultivariantModel>] = &[
    Rule {
        name: "media",
        matches: is_media_tag,
        apply: on_alternate_media,
    },
    Rule {
        name: "stream-inf",
        matches: is_stream_inf_tag,
        apply: on_stream_inf,
    },
    Rule {
        name: "variant-uri",
        matches: is_uri_line,
        apply: on_variant_uri,
    },
];

fn on_alternate_media(model: &mut MultivariantModel, line: &str, base: &Url) {
    let mut attrs = parse_attributes(line);

    if let Some(kind) = attrs.get("type") {
        if !kind.eq_ignore_ascii_case("AUDIO") {
            trace!(kind = %kind, "Ignoring non-audio alternate rendition");
            return;
        }
    }
    let Some(raw_uri) = attrs.remove("uri") else {
        return;
    };
    let Some(uri) = resolve_or_skip(&raw_uri, base) else {
        return;
    };

    let group_id = attrs.remove("group_id");
    let is_default_audio = attrs
        .remove("default")
        .is_some_and(|v| v.eq_ignore_ascii_case("YES"));
    let name = attrs.remove("name");
    let language = attrs.remove("language");

    let mut entry = PendingRendition::new(RenditionKind::Audio, attrs);
    entry.uri = Some(uri);
    entry.group_id = group_id;
    entry.is_default_audio = is_default_audio;
    entry.name = name;
    entry.language = language;
    model.entries.push(entry);
}

fn on_stream_inf(model: &mut MultivariantModel, line: &str, _base: &Url) {
    let mut attrs = parse_attributes(line);

    let codecs = attrs.remove("codecs");
    let resolution = attrs.remove("resolution").and_then(|r| Resolution::parse(&r));
    let audio_group = attrs.remove("audio");
    let bandwidth = attrs.remove("bandwidth").and_then(|b| b.trim().parse().ok());

    let (video_codec, audio_codec) = match &codecs {
        Some(list) => split_codecs(list),
        None => (None, None),
    };

    if let (Some(group), Some(codec)) = (&audio_group, &audio_codec) {
        for entry in model.entries.iter_mut().filter(|e| {
            e.kind == RenditionKind::Audio && e.group_id.as_deref() == Some(group.as_str())
        }) {
            if entry.codec.is_none() {
                entry.codec = Some(codec.clone());
            }
        }
    }

    let mut entry = PendingRendition::new(RenditionKind::Video, attrs);
    entry.codec = video_codec;
    entry.codecs = codecs;
    entry.resolution = resolution;
    entry.audio_group = audio_group;
    entry.bandwidth = bandwidth;
    model.entries.push(entry);
}

fn on_variant_uri(model: &mut MultivariantModel, line: &str, base: &Url) {
    let Some(entry) = model.entries.last_mut() else {
        trace!(line, "URI line before any rendition tag");
        return;
    };
    if entry.uri.is_some() {
        trace!(line, "Rendition already has a URI");
        return;
    }
    entry.uri = resolve_or_skip(line, base);
}

/// Split a CODECS list into its video and `mp4a` audio codecs
fn split_codecs(list: &str) -> (Option<String>, Option<String>) {
    let mut video = None;
    let mut audio = None;
    for codec in list.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        if codec.to_ascii_lowercase().starts_with(AUDIO_CODEC_PREFIX) {
            audio.get_or_insert_with(|| codec.to_string());
        } else {
            video.get_or_insert_with(|| codec.to_string());
        }
    }
    (video, audio)
}

/// Parse a multivariant playlist into renditions in declaration order.
///
/// Relative URIs are resolved against `base`; entries that never received a
/// URI are dropped.
pub fn parse_multivariant(text: &str, base: &Url) -> Vec<Rendition> {
    let model = reduce(text, MULTIVARIANT_RULES, base);

    let mut video_count = 0;
    let mut audio_count = 0;
    model
        .entries
        .into_iter()
        .filter_map(|entry| {
            let uri = entry.uri?;
            let (id, mime_type) = match entry.kind {
                RenditionKind::Video => {
                    video_count += 1;
                    (format!("video-{}", video_count - 1), VIDEO_MIME)
                }
                RenditionKind::Audio => {
                    audio_count += 1;
                    (format!("audio-{}", audio_count - 1), AUDIO_MIME)
                }
            };
            Some(Rendition {
                id,
                kind: entry.kind,
                uri,
                mime_type: mime_type.to_string(),
                codec: entry.codec,
                codecs: entry.codecs,
                resolution: entry.resolution,
                group_id: entry.group_id,
                audio_group: entry.audio_group,
                is_default_audio: entry.is_default_audio,
                bandwidth: entry.bandwidth,
                name: entry.name,
                language: entry.language,
                attributes: entry.attributes,
            })
        })
        .collect()
}

/// Rendition standing in for a media playlist used directly as the source
pub fn synthesize_rendition(uri: &Url) -> Rendition {
    Rendition {
        id: "video-0".to_string(),
        kind: RenditionKind::Video,
        uri: uri.clone(),
        mime_type: VIDEO_MIME.to_string(),
        codec: None,
        codecs: None,
        resolution: None,
        group_id: None,
        audio_group: None,
        is_default_audio: false,
        bandwidth: None,
        name: None,
        language: None,
        attributes: Attributes::new(),
    }
}

// ---------------------------------------------------------------------------
// Media playlists
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MediaModel {
    segments: Vec<Segment>,
}

const MEDIA_RULES: &[Rule<MediaModel>] = &[
    Rule {
        name: "map",
        matches: is_map_tag,
        apply: on_map,
    },
    Rule {
        name: "extinf",
        matches: is_extinf_tag,
        apply: on_extinf,
    },
    Rule {
        name: "segment-uri",
        matches: is_uri_line,
        apply: on_segment_uri,
    },
];

fn on_map(model: &mut MediaModel, line: &str, base: &Url) {
    let mut attrs = parse_attributes(line);
    let uri = attrs.remove("uri").and_then(|raw| resolve_or_skip(&raw, base));
    let mut segment = Segment::init(uri);
    segment.attributes = attrs;
    model.segments.push(segment);
}

fn on_extinf(model: &mut MediaModel, line: &str, _base: &Url) {
    let value = line.trim_start_matches("#EXTINF:");
    let raw = value.split(',').next().unwrap_or_default().trim();
    match raw.parse::<f64>() {
        Ok(duration) if duration.is_finite() && duration > 0.0 => {
            model.segments.push(Segment::timed(None, 0.0, duration));
        }
        _ => trace!(line, "Skipping EXTINF with invalid duration"),
    }
}

fn on_segment_uri(model: &mut MediaModel, line: &str, base: &Url) {
    let Some(segment) = model.segments.last_mut() else {
        trace!(line, "URI line before any segment tag");
        return;
    };
    if segment.uri.is_some() {
        trace!(line, "Segment already has a URI");
        return;
    }
    segment.uri = resolve_or_skip(line, base);
}

/// Parse a media playlist into its ordered segment list.
///
/// Initialization segments have duration zero. Timed segments get `start` and
/// `end` from a running sum of durations in playlist order.
pub fn parse_media(text: &str, base: &Url) -> Vec<Segment> {
    let mut segments = reduce(text, MEDIA_RULES, base).segments;

    let mut clock = 0.0;
    for segment in segments.iter_mut() {
        segment.start = clock;
        segment.end = clock + segment.duration;
        clock = segment.end;
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;

    const MULTIVARIANT: &str = r#"#EXTM3U
#EXT-X-VERSION:6
#EXT-X-INDEPENDENT-SEGMENTS
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aac",NAME="English",LANGUAGE="en",DEFAULT=YES,AUTOSELECT=YES,URI="audio/en/index.m3u8"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aac",NAME="Deutsch",LANGUAGE="de",DEFAULT=NO,URI="audio/de/index.m3u8"
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aac",NAME="Commentary"
#EXT-X-STREAM-INF:BANDWIDTH=800000,CODECS="avc1.4d401e,mp4a.40.2",RESOLUTION=640x360,AUDIO="aac"
video/360p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=1400000,CODECS="avc1.4d401f,mp4a.40.2",RESOLUTION=854x480,AUDIO="aac"
video/480p/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2800000,CODECS="avc1.64001f,mp4a.40.2",RESOLUTION=1280x720,AUDIO="aac",FRAME-RATE=30.000
https://cdn.other.com/video/720p/index.m3u8
"#;

    const MEDIA: &str = r#"#EXTM3U
#EXT-X-VERSION:7
#EXT-X-TARGETDURATION:5
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-MAP:URI="init.mp4",BYTERANGE="720@0"
#EXTINF:5.005,
segment-0.m4s
#EXTINF:5.005,
segment-1.m4s?token=abc
#EXTINF:2.5,title
segment-2.m4s
#EXT-X-ENDLIST
"#;

    fn base() -> Url {
        Url::parse("https://cdn.example.com/vod/master.m3u8?session=42").unwrap()
    }

    #[test]
    fn test_multivariant_renditions_in_order() {
        let renditions = parse_multivariant(MULTIVARIANT, &base());
        let ids: Vec<_> = renditions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["audio-0", "audio-1", "video-0", "video-1", "video-2"]);
    }

    #[test]
    fn test_multivariant_video_fields() {
        let renditions = parse_multivariant(MULTIVARIANT, &base());
        let video = &renditions[2];
        assert_eq!(video.kind, RenditionKind::Video);
        assert_eq!(video.uri.as_str(), "https://cdn.example.com/vod/video/360p/index.m3u8");
        assert_eq!(video.resolution, Some(Resolution::new(640, 360)));
        assert_eq!(video.codec.as_deref(), Some("avc1.4d401e"));
        assert_eq!(video.codecs.as_deref(), Some("avc1.4d401e,mp4a.40.2"));
        assert_eq!(video.audio_group.as_deref(), Some("aac"));
        assert_eq!(video.bandwidth, Some(800_000));
        assert_eq!(video.content_type(), "video/mp4; codecs=\"avc1.4d401e\"");
    }

    #[test]
    fn test_absolute_variant_uri_untouched() {
        let renditions = parse_multivariant(MULTIVARIANT, &base());
        let top = &renditions[4];
        assert_eq!(top.uri.as_str(), "https://cdn.other.com/video/720p/index.m3u8");
        assert_eq!(top.attributes.get("frame_rate").map(String::as_str), Some("30.000"));
    }

    #[test]
    fn test_audio_codec_backfilled() {
        let renditions = parse_multivariant(MULTIVARIANT, &base());
        let english = &renditions[0];
        assert_eq!(english.kind, RenditionKind::Audio);
        assert!(english.is_default_audio);
        assert_eq!(english.group_id.as_deref(), Some("aac"));
        assert_eq!(english.language.as_deref(), Some("en"));
        assert_eq!(english.codec.as_deref(), Some("mp4a.40.2"));
        assert_eq!(english.mime_type, "audio/mp4");
        assert_eq!(english.uri.as_str(), "https://cdn.example.com/vod/audio/en/index.m3u8");
        assert!(!renditions[1].is_default_audio);
    }

    #[test]
    fn test_audio_without_uri_is_skipped() {
        let renditions = parse_multivariant(MULTIVARIANT, &base());
        assert!(renditions.iter().all(|r| r.name.as_deref() != Some("Commentary")));
    }

    #[test]
    fn test_non_audio_media_ignored() {
        let text = "#EXTM3U\n\
            #EXT-X-MEDIA:TYPE=SUBTITLES,GROUP-ID=\"subs\",NAME=\"en\",URI=\"subs/en.m3u8\"\n\
            #EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=640x360\n\
            v.m3u8\n";
        let renditions = parse_multivariant(text, &base());
        assert_eq!(renditions.len(), 1);
        assert_eq!(renditions[0].kind, RenditionKind::Video);
    }

    #[test]
    fn test_variant_without_uri_dropped() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1,RESOLUTION=640x360\n";
        assert!(parse_multivariant(text, &base()).is_empty());
    }

    #[test]
    fn test_variant_without_codecs_or_resolution() {
        let text = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1\nlow.m3u8\n";
        let renditions = parse_multivariant(text, &base());
        assert_eq!(renditions[0].resolution, None);
        assert_eq!(renditions[0].codec, None);
        assert_eq!(renditions[0].content_type(), "video/mp4");
    }

    #[test]
    fn test_media_segments_timeline() {
        let segments = parse_media(MEDIA, &base());
        assert_eq!(segments.len(), 4);

        let init = &segments[0];
        assert!(init.is_init());
        assert_eq!(init.uri.as_ref().unwrap().as_str(), "https://cdn.example.com/vod/init.mp4");
        assert_eq!(init.attributes.get("byterange").map(String::as_str), Some("720@0"));

        assert_eq!(segments[1].start, 0.0);
        assert!((segments[1].end - 5.005).abs() < 1e-9);
        assert!((segments[2].start - 5.005).abs() < 1e-9);
        assert!((segments[3].end - 12.51).abs() < 1e-9);
        assert_eq!(
            segments[2].uri.as_ref().unwrap().as_str(),
            "https://cdn.example.com/vod/segment-1.m4s?token=abc"
        );
    }

    #[test]
    fn test_media_segment_ends_chain() {
        let segments = parse_media(MEDIA, &base());
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_media_invalid_extinf_skipped() {
        let text = "#EXTM3U\n#EXTINF:abc,\nbad.m4s\n#EXTINF:4.0,\ngood.m4s\n";
        let segments = parse_media(text, &base());
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].duration, 4.0);
        assert!(segments[0].uri.as_ref().unwrap().as_str().ends_with("good.m4s"));
    }

    #[test]
    fn test_media_segment_without_uri_kept_unresolved() {
        let text = "#EXTM3U\n#EXTINF:4.0,\n#EXTINF:4.0,\nb.m4s\n";
        let segments = parse_media(text, &base());
        assert_eq!(segments.len(), 2);
        assert!(segments[0].uri.is_none());
        assert_eq!(segments[1].start, 4.0);
    }

    #[test]
    fn test_crlf_line_endings() {
        let text = "#EXTM3U\r\n#EXTINF:6.0,\r\nseg.ts\r\n";
        let segments = parse_media(text, &base());
        assert_eq!(segments[0].uri.as_ref().unwrap().as_str(), "https://cdn.example.com/vod/seg.ts");
    }

    #[test]
    fn test_split_codecs() {
        assert_eq!(
            split_codecs("mp4a.40.2, avc1.64001f"),
            (Some("avc1.64001f".to_string()), Some("mp4a.40.2".to_string()))
        );
        assert_eq!(split_codecs("hvc1.1.6.L93.B0"), (Some("hvc1.1.6.L93.B0".to_string()), None));
    }
}
