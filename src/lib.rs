//! IPTV stream relay
//!
//! Relays live channels from upstream providers to any number of downstream
//! players while enforcing each provider's tuner (connection) limit. One
//! upstream connection per channel is shared by all of its viewers.
//!
//! # Overview
//!
//! - [`relay::StreamManager`] admits clients, owns the active streams and
//!   recovers from failures.
//! - [`worker`] acquires an upstream, either through an external transcoder
//!   process or by downloading it directly, with backup-URL failover.
//! - [`store`] holds the rotating segment files used to prime late joiners.
//! - [`server::RelayServer`] is a minimal HTTP front end.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use iptv_relay::provider::{ChannelRequest, ProviderInfo, StaticProviders};
//! use iptv_relay::relay::{RelayConfig, StreamManager};
//! use iptv_relay::server::{RelayServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> iptv_relay::Result<()> {
//!     let providers = StaticProviders::new()
//!         .with_provider(ProviderInfo::new("M1", "Cable", 2))
//!         .with_channel(ChannelRequest::new("M1", "101", "http://upstream/101.ts"));
//!
//!     let manager = StreamManager::new(RelayConfig::default(), Arc::new(providers));
//!     let server = RelayServer::new(ServerConfig::default(), manager.clone());
//!
//!     server
//!         .run_until(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!
//!     manager.teardown_all().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod provider;
pub mod relay;
pub mod server;
pub mod settings;
pub mod stats;
pub mod store;
pub mod worker;

pub use error::{Error, ErrorCode, Result};
pub use provider::{ChannelRequest, ProviderDirectory, ProviderInfo, StaticProviders};
pub use relay::{RelayConfig, Served, StreamKey, StreamManager};
pub use server::{RelayServer, ServerConfig};
pub use settings::Settings;
