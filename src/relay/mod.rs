//! Stream relay
//!
//! The relay shares one upstream connection per channel among any number of
//! downstream clients and enforces each provider's tuner limit.
//!
//! # Architecture
//!
//! ```text
//!                           StreamManager (Clone)
//!                     ┌─────────────────────────────┐
//!                     │ registry: provider_id → {   │
//!                     │   name,                     │
//!                     │   channel_id → Arc<Stream>  │
//!                     │ }                           │
//!                     │ error task ◄── ErrorEvent ──┼──────────────┐
//!                     └──────────────┬──────────────┘              │
//!                                    │                             │
//!                                    ▼                             │
//!                      Stream { worker, clients, grace }           │
//!                                    │                             │
//!          Worker ──► pipe ──► Broadcaster ──┬──► Client ──► sink  │
//!            │                               ├──► Client ──► sink  │
//!            │                               └──► Client ──► sink  │
//!            └───────────────────────── failures ──────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! 1. [`StreamManager::start_or_join`] reserves a client slot, creating the
//!    stream (and starting its worker) if the provider has a free tuner.
//! 2. [`StreamManager::attach`] binds the slot to a response sink. The client
//!    is primed with the most recent chunks and then receives every chunk the
//!    broadcaster takes from the pipe.
//! 3. [`StreamManager::detach`] removes the client. When the last one leaves a
//!    grace timer is armed while the worker keeps running; a new client within
//!    the grace period joins the running stream, otherwise it is torn down and
//!    its segment folder removed.
//!
//! Background tasks never recover on their own. They report [`ErrorEvent`]s
//! and the manager's error task decides what to do.

pub mod catchup;
pub mod client;
pub mod config;
pub mod event;
pub mod key;
pub mod manager;
pub mod stream;

pub use catchup::CatchupBuffer;
pub use client::{ClientSession, Push, ResponseSink};
pub use config::{RelayConfig, TranscoderConfig};
pub use event::{ErrorCause, ErrorEvent, EventSender};
pub use key::{ClientId, StreamKey};
pub use manager::{Served, StreamManager, Ticket};
pub use stream::Stream;
