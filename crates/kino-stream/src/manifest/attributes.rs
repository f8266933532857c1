//! Tag attribute lists (`KEY=VALUE,KEY="VALUE"`)

use nom::{
    branch::alt,
    bytes::complete::{take_till, take_till1, take_while1},
    character::complete::char,
    sequence::{delimited, separated_pair},
    IResult, Parser,
};
use std::collections::BTreeMap;

/// Parsed attributes keyed by normalized name (`GROUP-ID` becomes `group_id`)
pub type Attributes = BTreeMap<String, String>;

fn key(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_').parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), take_till(|c: char| c == '"'), char('"')).parse(input)
}

fn unquoted(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c == ',').parse(input)
}

fn attribute(input: &str) -> IResult<&str, (&str, &str)> {
    separated_pair(key, char('='), alt((quoted, unquoted))).parse(input)
}

/// Normalize an attribute name: lowercase, `-` replaced by `_`
pub fn normalize_key(key: &str) -> String {
    key.trim().to_ascii_lowercase().replace('-', "_")
}

/// Parse the attribute list of a tag line.
///
/// Everything up to the first `:` is the tag name and is ignored. Entries that
/// do not parse are skipped up to the next comma.
pub fn parse_attributes(line: &str) -> Attributes {
    let mut attributes = Attributes::new();
    let mut rest = match line.split_once(':') {
        Some((_, list)) => list.trim(),
        None => return attributes,
    };

    while !rest.is_empty() {
        match attribute(rest) {
            Ok((remaining, (name, value))) => {
                attributes.insert(normalize_key(name), value.trim().to_string());
                rest = remaining.strip_prefix(',').unwrap_or(remaining).trim_start();
            }
            Err(_) => {
                rest = match rest.find(',') {
                    Some(idx) => rest[idx + 1..].trim_start(),
                    None => "",
                };
            }
        }
    }

    attributes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_inf_attributes() {
        let attrs = parse_attributes(
            r#"#EXT-X-STREAM-INF:BANDWIDTH=2149280,CODECS="avc1.64001f,mp4a.40.2",RESOLUTION=1280x720,AUDIO="aac""#,
        );
        assert_eq!(attrs["bandwidth"], "2149280");
        assert_eq!(attrs["codecs"], "avc1.64001f,mp4a.40.2");
        assert_eq!(attrs["resolution"], "1280x720");
        assert_eq!(attrs["audio"], "aac");
    }

    #[test]
    fn test_keys_are_normalized() {
        let attrs = parse_attributes(r#"#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="aac",DEFAULT=YES"#);
        assert_eq!(attrs["type"], "AUDIO");
        assert_eq!(attrs["group_id"], "aac");
        assert_eq!(attrs["default"], "YES");
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let attrs = parse_attributes(r#"#EXT-X-MAP:garbage,URI="init.mp4",=oops,BYTERANGE=720@0"#);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["uri"], "init.mp4");
        assert_eq!(attrs["byterange"], "720@0");
    }

    #[test]
    fn test_line_without_attributes() {
        assert!(parse_attributes("#EXTM3U").is_empty());
        assert!(parse_attributes("#EXT-X-ENDLIST:").is_empty());
    }
}
