//! Provider collaborator contract
//!
//! Providers (playlists or HDHomeRun tuners) are ingested elsewhere. The relay
//! only needs each provider's display name, its tuner count and an optional
//! upstream proxy, plus a way to turn a (provider, channel) pair into a
//! [`ChannelRequest`].

use std::collections::HashMap;

/// Provider information needed by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Provider ID (e.g. "M1a2b3")
    pub id: String,
    /// Display name
    pub name: String,
    /// Maximum number of channels that may be open concurrently
    pub tuner_count: usize,
    /// Optional HTTP proxy (e.g. "http://10.0.0.1:3128")
    pub http_proxy: Option<String>,
}

impl ProviderInfo {
    /// Create provider info without a proxy
    pub fn new(id: impl Into<String>, name: impl Into<String>, tuner_count: usize) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            tuner_count,
            http_proxy: None,
        }
    }

    /// Route upstream requests through a proxy
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.http_proxy = Some(proxy.into());
        self
    }
}

/// A request to play one channel of one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Provider the channel belongs to
    pub provider_id: String,
    /// Channel ID, unique within the provider
    pub channel_id: String,
    /// Channel display name
    pub name: String,
    /// Primary upstream URL
    pub url: String,
    /// Backup URLs, tried in order when the primary fails
    pub backup_urls: Vec<String>,
}

impl ChannelRequest {
    /// Create a request without backups
    pub fn new(
        provider_id: impl Into<String>,
        channel_id: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        let channel_id = channel_id.into();
        Self {
            provider_id: provider_id.into(),
            name: channel_id.clone(),
            channel_id,
            url: url.into(),
            backup_urls: Vec::new(),
        }
    }

    /// Set the display name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add a backup URL
    pub fn backup(mut self, url: impl Into<String>) -> Self {
        self.backup_urls.push(url.into());
        self
    }
}

/// Source of provider configuration
pub trait ProviderDirectory: Send + Sync {
    /// Look up a provider by ID
    fn provider(&self, id: &str) -> Option<ProviderInfo>;

    /// Resolve a channel of a provider into a play request
    fn channel(&self, provider_id: &str, channel_id: &str) -> Option<ChannelRequest>;
}

/// In-memory provider directory, usually built from the settings file
#[derive(Debug, Clone, Default)]
pub struct StaticProviders {
    providers: HashMap<String, ProviderInfo>,
    channels: HashMap<(String, String), ChannelRequest>,
}

impl StaticProviders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a provider
    pub fn insert_provider(&mut self, info: ProviderInfo) {
        self.providers.insert(info.id.clone(), info);
    }

    /// Add (or replace) a channel
    pub fn insert_channel(&mut self, channel: ChannelRequest) {
        let key = (channel.provider_id.clone(), channel.channel_id.clone());
        self.channels.insert(key, channel);
    }

    /// Builder-style variant of [`insert_provider`](Self::insert_provider)
    pub fn with_provider(mut self, info: ProviderInfo) -> Self {
        self.insert_provider(info);
        self
    }

    /// Builder-style variant of [`insert_channel`](Self::insert_channel)
    pub fn with_channel(mut self, channel: ChannelRequest) -> Self {
        self.insert_channel(channel);
        self
    }

    /// Number of configured providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ProviderDirectory for StaticProviders {
    fn provider(&self, id: &str) -> Option<ProviderInfo> {
        self.providers.get(id).cloned()
    }

    fn channel(&self, provider_id: &str, channel_id: &str) -> Option<ChannelRequest> {
        self.channels
            .get(&(provider_id.to_string(), channel_id.to_string()))
            .cloned()
    }
}
