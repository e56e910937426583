//! Server configuration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default relay port
pub const DEFAULT_PORT: u16 = 34400;

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// The request head must arrive within this time
    pub request_timeout: Duration,

    /// MPEG-TS file served when a provider's tuners are all in use
    /// (built-in filler when unset)
    pub limit_content_path: Option<PathBuf>,

    /// Folder holding the image a tuner-limit clip is rendered from
    pub limit_image_dir: Option<PathBuf>,

    /// Folder holding the rendered tuner-limit clip
    pub limit_video_dir: Option<PathBuf>,

    /// How many times the tuner-limit content is sent
    pub limit_repeat: u32,

    /// Pause between two sends of the tuner-limit content
    pub limit_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 0, // Unlimited
            tcp_nodelay: true,
            request_timeout: Duration::from_secs(10),
            limit_content_path: None,
            limit_image_dir: None,
            limit_video_dir: None,
            limit_repeat: 600,
            limit_interval: Duration::from_millis(100),
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Serve a custom file when the tuner limit is reached
    pub fn limit_content(mut self, path: impl Into<PathBuf>) -> Self {
        self.limit_content_path = Some(path.into());
        self
    }

    /// Render the tuner-limit clip from an image in `image_dir` into
    /// `video_dir`
    pub fn limit_folders(
        mut self,
        image_dir: impl Into<PathBuf>,
        video_dir: impl Into<PathBuf>,
    ) -> Self {
        self.limit_image_dir = Some(image_dir.into());
        self.limit_video_dir = Some(video_dir.into());
        self
    }

    /// Set how often and how fast the tuner-limit content is repeated
    pub fn limit_schedule(mut self, repeat: u32, interval: Duration) -> Self {
        self.limit_repeat = repeat;
        self.limit_interval = interval;
        self
    }
}
