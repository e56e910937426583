//! Relay HTTP front end
//!
//! A deliberately small HTTP/1.1 server: one route, no keep-alive. Each
//! `GET /stream/<provider>/<channel>` is admitted through the
//! [`StreamManager`](crate::relay::StreamManager) and answered with the raw
//! MPEG-TS stream, or with [`LimitContent`] when the provider's tuners are
//! all in use.

pub mod config;
pub mod limit;
pub mod listener;

pub use config::ServerConfig;
pub use limit::LimitContent;
pub use listener::RelayServer;
