//! Relay statistics
//!
//! Snapshots of the active streams for UI reporting ("currently used
//! channels" per provider).

use std::time::Duration;

use serde::Serialize;

/// Per-stream statistics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    /// Channel ID
    pub channel_id: String,
    /// Channel display name
    pub name: String,
    /// Reserved or attached clients
    pub clients: usize,
    /// Failover URL in use (0 = primary)
    pub backup_index: usize,
    /// Bytes relayed from the upstream
    pub bytes_relayed: u64,
    /// Time since the stream was created
    pub uptime: Duration,
    /// Whether the stream is waiting out its grace period
    pub in_grace: bool,
}

impl StreamStats {
    /// Average bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.uptime.as_secs();
        if secs > 0 {
            (self.bytes_relayed * 8) / secs
        } else {
            0
        }
    }
}

/// Active streams of one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStats {
    pub provider_id: String,
    pub name: String,
    /// Tuners in use
    pub streams: Vec<StreamStats>,
}

impl ProviderStats {
    /// Names of the channels currently relayed
    pub fn channel_names(&self) -> Vec<&str> {
        self.streams.iter().map(|s| s.name.as_str()).collect()
    }

    /// Clients across all streams of the provider
    pub fn client_count(&self) -> usize {
        self.streams.iter().map(|s| s.clients).sum()
    }
}

/// Snapshot of all active streams
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActiveStreams {
    /// Providers with at least one active stream, sorted by ID
    pub providers: Vec<ProviderStats>,
}

impl ActiveStreams {
    pub fn provider(&self, id: &str) -> Option<&ProviderStats> {
        self.providers.iter().find(|p| p.provider_id == id)
    }

    /// Total number of active streams
    pub fn stream_count(&self) -> usize {
        self.providers.iter().map(|p| p.streams.len()).sum()
    }

    /// Total number of clients
    pub fn client_count(&self) -> usize {
        self.providers.iter().map(ProviderStats::client_count).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(channel: &str, clients: usize, bytes: u64, secs: u64) -> StreamStats {
        StreamStats {
            channel_id: channel.to_string(),
            name: format!("Channel {}", channel),
            clients,
            backup_index: 0,
            bytes_relayed: bytes,
            uptime: Duration::from_secs(secs),
            in_grace: false,
        }
    }

    #[test]
    fn test_bitrate() {
        // 1,000,000 bytes * 8 bits / 10 seconds = 800,000 bps
        assert_eq!(stream("1", 1, 1_000_000, 10).bitrate(), 800_000);
        assert_eq!(stream("1", 1, 1_000_000, 0).bitrate(), 0);
    }

    #[test]
    fn test_totals() {
        let snapshot = ActiveStreams {
            providers: vec![
                ProviderStats {
                    provider_id: "M1".into(),
                    name: "Cable".into(),
                    streams: vec![stream("1", 2, 0, 0), stream("2", 1, 0, 0)],
                },
                ProviderStats {
                    provider_id: "M2".into(),
                    name: "Sat".into(),
                    streams: vec![stream("9", 0, 0, 0)],
                },
            ],
        };

        assert_eq!(snapshot.stream_count(), 3);
        assert_eq!(snapshot.client_count(), 3);
        assert_eq!(
            snapshot.provider("M1").unwrap().channel_names(),
            vec!["Channel 1", "Channel 2"]
        );
        assert!(snapshot.provider("M3").is_none());
    }

    #[test]
    fn test_serializes() {
        let snapshot = ActiveStreams {
            providers: vec![ProviderStats {
                provider_id: "M1".into(),
                name: "Cable".into(),
                streams: vec![stream("1", 1, 0, 0)],
            }],
        };

        let value = toml::Value::try_from(&snapshot).unwrap();
        let providers = value.get("providers").unwrap().as_array().unwrap();
        assert_eq!(providers[0].get("name").unwrap().as_str(), Some("Cable"));
    }
}
