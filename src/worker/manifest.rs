//! HLS manifest inspection
//!
//! The passthrough backend relays raw bytes. A master playlist that points
//! at variant or alternate audio playlists cannot be relayed that way, so it
//! is detected and rejected.

const STREAM_INF: &str = "#EXT-X-STREAM-INF";
const MEDIA: &str = "#EXT-X-MEDIA:";

/// Whether a response content type denotes an M3U/HLS playlist
pub fn is_playlist(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("mpegurl")
}

/// Playlists referenced by a master manifest
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ManifestRefs {
    /// URIs following `#EXT-X-STREAM-INF` tags
    pub variants: Vec<String>,
    /// URIs of default audio renditions
    pub audio: Vec<String>,
}

impl ManifestRefs {
    /// Whether the manifest refers to further playlists
    pub fn is_empty(&self) -> bool {
        self.variants.is_empty() && self.audio.is_empty()
    }
}

/// Collect variant and default audio playlist references
pub fn parse(text: &str) -> ManifestRefs {
    let mut refs = ManifestRefs::default();
    let mut expect_variant = false;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }

        if line.starts_with(STREAM_INF) {
            expect_variant = true;
            continue;
        }

        if let Some(attrs) = line.strip_prefix(MEDIA) {
            if attribute(attrs, "TYPE") == Some("AUDIO")
                && attribute(attrs, "DEFAULT") == Some("YES")
            {
                if let Some(uri) = attribute(attrs, "URI") {
                    refs.audio.push(uri.to_string());
                }
            }
            continue;
        }

        if expect_variant && !line.starts_with('#') {
            refs.variants.push(line.to_string());
            expect_variant = false;
        }
    }

    refs
}

// Attribute lists are comma separated KEY=VALUE pairs; values may be quoted
// and quoted values may contain commas.
fn attribute<'a>(attrs: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = attrs;
    while !rest.is_empty() {
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];

        let (value, next) = if let Some(quoted) = after.strip_prefix('"') {
            let end = quoted.find('"').unwrap_or(quoted.len());
            let tail = quoted.get(end + 1..).unwrap_or("");
            (&quoted[..end], tail.strip_prefix(',').unwrap_or(tail))
        } else {
            match after.find(',') {
                Some(comma) => (&after[..comma], &after[comma + 1..]),
                None => (after, ""),
            }
        };

        if key.eq_ignore_ascii_case(name) {
            return Some(value.trim());
        }
        rest = next;
    }
    None
}
