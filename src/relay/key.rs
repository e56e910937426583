//! Stream and client identifiers

use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Unique identifier for a stream (provider + channel)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    /// Provider ID (e.g., "M1a2b3")
    pub provider: String,
    /// Channel ID within the provider
    pub channel: String,
}

impl StreamKey {
    /// Create a new stream key
    pub fn new(provider: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            channel: channel.into(),
        }
    }

    /// Working directory for this stream's segment files
    pub fn folder(&self, temp_dir: &Path) -> PathBuf {
        temp_dir
            .join(path_component(&self.provider))
            .join(path_component(&self.channel))
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.provider, self.channel)
    }
}

// Channel IDs come from provider playlists and may contain anything.
fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '\0' => '_',
            c => c,
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{}", cleaned),
        _ => cleaned,
    }
}

/// Random token identifying one client of one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(StreamKey::new("M1", "101").to_string(), "M1/101");
    }

    #[test]
    fn test_folder_is_sanitized() {
        let key = StreamKey::new("M1", "../etc/passwd");
        let folder = key.folder(Path::new("/tmp/relay"));

        assert_eq!(folder, PathBuf::from("/tmp/relay/M1/.._etc_passwd"));
        assert!(folder.starts_with("/tmp/relay/M1"));

        let key = StreamKey::new("M1", "..");
        assert_eq!(
            key.folder(Path::new("/tmp/relay")),
            PathBuf::from("/tmp/relay/M1/_..")
        );
    }

    #[test]
    fn test_client_ids_are_unique() {
        assert_ne!(ClientId::new(), ClientId::new());
    }
}
