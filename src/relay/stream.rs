//! Stream and broadcaster
//!
//! A [`Stream`] owns the worker for one channel, the set of attached clients,
//! and the broadcaster session that copies pipe chunks into client buffers.
//!
//! The worker and the broadcaster keep running while the stream sits in its
//! grace period; the broadcaster then only feeds the catchup buffer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::store::SegmentStore;
use crate::worker::{FailoverChain, Worker};

use super::catchup::CatchupBuffer;
use super::client::{Client, ClientSession, Push, ResponseSink};
use super::config::RelayConfig;
use super::event::{ErrorCause, ErrorEvent, EventSender};
use super::key::{ClientId, StreamKey};

/// Armed grace timer
#[derive(Debug)]
struct GraceTimer {
    epoch: u64,
    handle: AbortHandle,
}

/// State guarded by the stream lock
#[derive(Debug, Default)]
struct StreamState {
    clients: HashMap<ClientId, Arc<Client>>,
    /// Recent chunks for late joiners
    catchup: CatchupBuffer,
    /// Cancellation token of the running broadcaster session
    session: Option<CancellationToken>,
    grace: Option<GraceTimer>,
    /// Bumped whenever a grace timer is armed or disarmed
    grace_epoch: u64,
}

/// One relayed channel
#[derive(Debug)]
pub struct Stream {
    key: StreamKey,
    id: u64,
    name: String,
    folder: PathBuf,
    auto_reconnect: bool,
    client_buffer_limit: usize,
    late_join_catchup: bool,
    cancel: CancellationToken,
    events: EventSender,
    failover: Arc<std::sync::Mutex<FailoverChain>>,
    worker: Worker,
    state: Mutex<StreamState>,
    bytes_relayed: AtomicU64,
    started_at: Instant,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: StreamKey,
        id: u64,
        name: String,
        folder: PathBuf,
        config: &RelayConfig,
        events: EventSender,
        failover: Arc<std::sync::Mutex<FailoverChain>>,
        worker: Worker,
    ) -> Self {
        Self {
            key,
            id,
            name,
            folder,
            auto_reconnect: config.auto_reconnect,
            client_buffer_limit: config.client_buffer_limit,
            late_join_catchup: config.late_join_catchup,
            cancel: CancellationToken::new(),
            events,
            failover,
            worker,
            state: Mutex::new(StreamState {
                catchup: CatchupBuffer::with_max_size(config.catchup_capacity()),
                ..StreamState::default()
            }),
            bytes_relayed: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Generation of this stream
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Channel display name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Segment folder
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn auto_reconnect(&self) -> bool {
        self.auto_reconnect
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Index of the failover URL in use (0 = primary)
    pub fn backup_index(&self) -> usize {
        crate::worker::lock(&self.failover).index()
    }

    /// Total bytes taken from the pipe
    pub fn bytes_relayed(&self) -> u64 {
        self.bytes_relayed.load(Ordering::Relaxed)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of reserved or attached clients
    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Whether a grace timer is armed
    pub async fn in_grace(&self) -> bool {
        self.state.lock().await.grace.is_some()
    }

    /// Reserve a client slot
    ///
    /// Disarms a pending grace timer. Starts the worker unless it is already
    /// running, which it still is during the grace period.
    pub(crate) async fn join(&self) -> ClientId {
        let mut state = self.state.lock().await;

        if let Some(timer) = state.grace.take() {
            timer.handle.abort();
            tracing::info!(stream = %self.key, "Grace period cancelled, stream reused");
        }
        state.grace_epoch += 1;

        let was_idle = state.clients.is_empty();
        let client = Arc::new(Client::new(self.cancel.child_token(), self.client_buffer_limit));
        let id = client.id();
        state.clients.insert(id, client);

        tracing::info!(
            stream = %self.key,
            client = %id,
            clients = state.clients.len(),
            "Client reserved"
        );
        drop(state);

        if was_idle {
            self.worker.start();
        }
        id
    }

    /// Bind a reserved client to its sink and start delivering
    pub(crate) async fn attach(
        self: &Arc<Self>,
        client_id: ClientId,
        sink: ResponseSink,
        connection: CancellationToken,
    ) -> Result<ClientSession> {
        let mut state = self.state.lock().await;
        let client = state
            .clients
            .get(&client_id)
            .cloned()
            .ok_or_else(|| Error::ClientNotFound {
                stream: self.key.clone(),
                client: client_id.to_string(),
            })?;

        // Primed and set live under the lock the broadcaster pushes under
        if self.late_join_catchup && !state.catchup.is_empty() {
            let data = state.catchup.snapshot();
            tracing::debug!(
                stream = %self.key,
                client = %client_id,
                bytes = data.len(),
                "Late join catchup"
            );
            client.prime(&data);
        }
        client.set_live();

        let session = client
            .spawn_delivery(self.key.clone(), self.id, sink, connection, self.events.clone())
            .ok_or_else(|| Error::ClientNotFound {
                stream: self.key.clone(),
                client: client_id.to_string(),
            })?;
        client.signal();

        let running = state.session.as_ref().is_some_and(|s| !s.is_cancelled());
        if !running {
            let token = self.cancel.child_token();
            state.session = Some(token.clone());
            tokio::spawn(self.clone().broadcast(token));
        }

        tracing::info!(stream = %self.key, client = %client_id, "Client attached");
        Ok(session)
    }

    /// Remove a client
    ///
    /// Returns the new grace epoch when the last client left and the caller
    /// arms the timer. The worker keeps running until the timer expires.
    pub(crate) async fn detach(&self, client_id: ClientId) -> Option<u64> {
        let mut state = self.state.lock().await;

        let client = state.clients.remove(&client_id)?;
        client.evict();

        tracing::info!(
            stream = %self.key,
            client = %client_id,
            clients = state.clients.len(),
            delivered = client.delivered(),
            "Client left"
        );

        if !state.clients.is_empty() {
            return None;
        }

        state.grace_epoch += 1;
        Some(state.grace_epoch)
    }

    /// Record the timer task for `epoch`; a stale epoch aborts it instead
    pub(crate) async fn arm_grace(&self, epoch: u64, handle: AbortHandle) {
        let mut state = self.state.lock().await;
        if state.grace_epoch == epoch && state.clients.is_empty() {
            state.grace = Some(GraceTimer { epoch, handle });
        } else {
            handle.abort();
        }
    }

    /// Abort a pending grace timer
    pub(crate) async fn disarm_grace(&self) {
        let mut state = self.state.lock().await;
        if let Some(timer) = state.grace.take() {
            timer.handle.abort();
        }
        state.grace_epoch += 1;
    }

    /// Whether the timer for `epoch` is still the current one and no client
    /// has arrived since; consumes the timer when it is
    pub(crate) async fn grace_expired(&self, epoch: u64) -> bool {
        let mut state = self.state.lock().await;
        let current = state.grace.as_ref().is_some_and(|t| t.epoch == epoch)
            || (state.grace.is_none() && state.grace_epoch == epoch);

        if current && state.clients.is_empty() {
            state.grace = None;
            true
        } else {
            false
        }
    }

    /// Evict every client
    pub(crate) async fn evict_all(&self) {
        let mut state = self.state.lock().await;
        for (_, client) in state.clients.drain() {
            client.evict();
        }
        if let Some(session) = state.session.take() {
            session.cancel();
        }
    }

    /// Final teardown: stop everything and remove the segment folder
    pub(crate) async fn shutdown(&self, store: &SegmentStore) {
        self.cancel.cancel();
        self.worker.close().await;

        if let Err(e) = store.remove_dir_all(&self.folder).await {
            tracing::warn!(
                stream = %self.key,
                folder = %self.folder.display(),
                error = %e,
                code = crate::error::ErrorCode::BufferRemoveFailed.as_u16(),
                "Segment folder could not be removed"
            );
        }

        tracing::info!(
            stream = %self.key,
            bytes = self.bytes_relayed(),
            uptime_secs = self.started_at.elapsed().as_secs(),
            "Stream closed"
        );
    }

    /// Copy pipe chunks into every live client's buffer until the session ends
    async fn broadcast(self: Arc<Self>, session: CancellationToken) {
        let pipe = self.worker.pipe();
        let mut rx = tokio::select! {
            _ = session.cancelled() => return,
            rx = pipe.lock_owned() => rx,
        };

        tracing::debug!(stream = %self.key, "Broadcaster started");

        loop {
            let chunk = tokio::select! {
                _ = session.cancelled() => break,
                chunk = rx.recv() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            self.bytes_relayed.fetch_add(chunk.len() as u64, Ordering::Relaxed);

            let mut state = self.state.lock().await;
            if self.late_join_catchup {
                state.catchup.push(chunk.clone());
            }
            for client in state.clients.values().filter(|c| c.is_live() && !c.is_evicted()) {
                match client.push(&chunk) {
                    Push::Signaled | Push::Discarded => {}
                    Push::Skipped => {
                        tracing::trace!(
                            stream = %self.key,
                            client = %client.id(),
                            pending = client.pending(),
                            "Flush already pending"
                        );
                    }
                    Push::Overrun => {
                        self.events.report(ErrorEvent::client(
                            self.key.clone(),
                            self.id,
                            client.id(),
                            ErrorCause::SendToClient("outbound buffer overrun".into()),
                        ));
                    }
                }
            }
        }

        // Lets the next attach start a fresh session
        session.cancel();
        tracing::debug!(stream = %self.key, "Broadcaster stopped");
    }
}
