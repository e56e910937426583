//! Relay configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::worker::BackendKind;

/// Placeholder in the transcoder option template replaced by the channel URL
pub const URL_PLACEHOLDER: &str = "[URL]";

/// Default transcoder options: remux the input to MPEG-TS on stdout
pub const DEFAULT_TRANSCODER_OPTIONS: &str =
    "-hide_banner -loglevel error -i [URL] -c copy -f mpegts pipe:1";

/// External transcoder settings for the process-backed worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscoderConfig {
    /// Path to the transcoder binary
    pub path: PathBuf,
    /// Space separated option template containing [`URL_PLACEHOLDER`]
    pub options: String,
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("ffmpeg"),
            options: DEFAULT_TRANSCODER_OPTIONS.to_string(),
        }
    }
}

/// Stream relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Root folder for segment directories and the PID ledger
    pub temp_dir: PathBuf,

    /// Upstream acquisition backend
    pub backend: BackendKind,

    /// Transcoder used by the process-backed backend
    pub transcoder: TranscoderConfig,

    /// User agent sent upstream
    pub user_agent: Option<String>,

    /// Size of the chunks read from the upstream
    pub chunk_size: usize,

    /// Number of chunks the worker may queue ahead of the broadcaster
    pub pipe_capacity: usize,

    /// Bytes per segment file before rolling over to the next one
    pub segment_size: usize,

    /// Number of most recent segment files kept on the store
    pub segment_retention: usize,

    /// Maximum bytes buffered for a single client before it is evicted
    pub client_buffer_limit: usize,

    /// Delay between the last client leaving and stream teardown
    pub grace_period: Duration,

    /// Restart the worker in place when the upstream closes
    pub auto_reconnect: bool,

    /// Delay before an in-place restart
    pub reconnect_delay: Duration,

    /// Maximum number of backup URLs honored per channel
    pub max_backups: usize,

    /// Keep segments in RAM instead of on disk
    pub store_in_memory: bool,

    /// Prime late joiners with the most recently broadcast chunks
    pub late_join_catchup: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("iptv-relay"),
            backend: BackendKind::Process,
            transcoder: TranscoderConfig::default(),
            user_agent: None,
            chunk_size: 4 * 1024,
            pipe_capacity: 64,
            segment_size: 2 * 1024 * 1024, // 2MB
            segment_retention: 4,
            client_buffer_limit: 16 * 1024 * 1024,
            grace_period: Duration::from_secs(5),
            auto_reconnect: false,
            reconnect_delay: Duration::from_secs(1),
            max_backups: 3,
            store_in_memory: false,
            late_join_catchup: true,
        }
    }
}

impl RelayConfig {
    /// Set the temp folder
    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    /// Set the backend kind
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Set the transcoder binary and option template
    pub fn transcoder(mut self, path: impl Into<PathBuf>, options: impl Into<String>) -> Self {
        self.transcoder = TranscoderConfig {
            path: path.into(),
            options: options.into(),
        };
        self
    }

    /// Set the upstream user agent
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Set the read chunk size (at least 1 byte)
    ///
    /// Raises the client buffer limit so that one chunk always fits.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self.client_buffer_limit = self.client_buffer_limit.max(self.chunk_size);
        self
    }

    /// Set the segment size (at least one chunk)
    pub fn segment_size(mut self, size: usize) -> Self {
        self.segment_size = size.max(1);
        self
    }

    /// Set the number of retained segments (at least 1)
    pub fn segment_retention(mut self, count: usize) -> Self {
        self.segment_retention = count.max(1);
        self
    }

    /// Set the per-client buffer limit (at least one chunk)
    pub fn client_buffer_limit(mut self, limit: usize) -> Self {
        self.client_buffer_limit = limit.max(self.chunk_size);
        self
    }

    /// Set the grace period
    pub fn grace_period(mut self, period: Duration) -> Self {
        self.grace_period = period;
        self
    }

    /// Enable or disable auto reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the delay before an in-place restart
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Set the maximum number of backups
    pub fn max_backups(mut self, count: usize) -> Self {
        self.max_backups = count;
        self
    }

    /// Keep segments in RAM
    pub fn store_in_memory(mut self, enabled: bool) -> Self {
        self.store_in_memory = enabled;
        self
    }

    /// Enable or disable late-join catchup
    pub fn late_join_catchup(mut self, enabled: bool) -> Self {
        self.late_join_catchup = enabled;
        self
    }

    /// Location of the PID ledger
    pub fn pid_file(&self) -> PathBuf {
        self.temp_dir.join("PIDs")
    }

    /// Bytes of recent output kept for late joiners
    ///
    /// Half the client buffer at most, so a primed client still has room for
    /// live chunks.
    pub fn catchup_capacity(&self) -> usize {
        self.segment_size.min(self.client_buffer_limit / 2)
    }
}
