//! Stream manager
//!
//! Owns the registry of active streams, enforces per-provider tuner limits,
//! runs the grace timers and is the single place where error events are
//! turned into recovery actions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::provider::{ChannelRequest, ProviderDirectory};
use crate::stats::{ActiveStreams, ProviderStats, StreamStats};
use crate::store::SegmentStore;
use crate::worker::{FailoverChain, PidLedger, Worker};

use super::client::{ClientSession, ResponseSink};
use super::config::RelayConfig;
use super::event::{ErrorEvent, EventSender};
use super::key::{ClientId, StreamKey};
use super::stream::Stream;

/// Admission granted by [`StreamManager::start_or_join`]
///
/// The client slot stays reserved (and counts toward keeping the stream
/// alive) until it is detached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub key: StreamKey,
    pub stream_id: u64,
    pub client: ClientId,
}

/// How a [`StreamManager::serve`] call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// The client was streamed to until it left or was evicted
    Streamed,
    /// The provider's tuner limit was reached; serve substitute content
    LimitReached,
}

#[derive(Debug)]
struct ProviderStreams {
    name: String,
    streams: HashMap<String, Arc<Stream>>,
}

type Registry = HashMap<String, ProviderStreams>;

struct Inner {
    config: RelayConfig,
    providers: Arc<dyn ProviderDirectory>,
    store: SegmentStore,
    pids: PidLedger,
    registry: Mutex<Registry>,
    events: EventSender,
    next_stream_id: AtomicU64,
    shutting_down: AtomicBool,
}

/// Handle to the stream manager; cheap to clone
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

impl StreamManager {
    /// Create a manager and spawn its error-handling task
    pub fn new(config: RelayConfig, providers: Arc<dyn ProviderDirectory>) -> Self {
        let store = SegmentStore::new(config.store_in_memory);
        Self::with_store(config, providers, store)
    }

    /// Create a manager on an explicit segment store
    pub fn with_store(
        config: RelayConfig,
        providers: Arc<dyn ProviderDirectory>,
        store: SegmentStore,
    ) -> Self {
        let (events, rx) = EventSender::channel();
        let pids = PidLedger::new(config.pid_file());

        let inner = Arc::new(Inner {
            config,
            providers,
            store,
            pids,
            registry: Mutex::new(HashMap::new()),
            events,
            next_stream_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });

        tokio::spawn(handle_errors(Arc::downgrade(&inner), rx));

        Self { inner }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &SegmentStore {
        &self.inner.store
    }

    pub fn pid_ledger(&self) -> &PidLedger {
        &self.inner.pids
    }

    /// Provider directory requests are resolved against
    pub fn providers(&self) -> &Arc<dyn ProviderDirectory> {
        &self.inner.providers
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Resolve a provider's channel into a play request
    pub fn resolve(&self, provider_id: &str, channel_id: &str) -> Result<ChannelRequest> {
        let providers = &self.inner.providers;
        if providers.provider(provider_id).is_none() {
            return Err(Error::UnknownProvider(provider_id.to_string()));
        }
        providers
            .channel(provider_id, channel_id)
            .ok_or_else(|| Error::UnknownChannel {
                provider: provider_id.to_string(),
                channel: channel_id.to_string(),
            })
    }

    /// Admit a client to a channel
    ///
    /// Joins the existing stream for the channel, or creates one if the
    /// provider has a free tuner. Returns `Ok(None)` when the tuner limit is
    /// reached.
    pub async fn start_or_join(&self, request: &ChannelRequest) -> Result<Option<Ticket>> {
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }
        let provider = self
            .inner
            .providers
            .provider(&request.provider_id)
            .ok_or_else(|| Error::UnknownProvider(request.provider_id.clone()))?;

        let key = StreamKey::new(provider.id.clone(), request.channel_id.clone());
        let mut registry = self.inner.registry.lock().await;

        // Checked again under the lock; teardown_all drains the registry
        // holding it
        if self.is_shutting_down() {
            return Err(Error::ShuttingDown);
        }

        let entry = registry
            .entry(provider.id.clone())
            .or_insert_with(|| ProviderStreams {
                name: provider.name.clone(),
                streams: HashMap::new(),
            });

        if let Some(stream) = entry.streams.get(&request.channel_id).cloned() {
            let client = stream.join().await;
            return Ok(Some(Ticket {
                key,
                stream_id: stream.id(),
                client,
            }));
        }

        if entry.streams.len() >= provider.tuner_count {
            let in_use = entry.streams.len();
            if entry.streams.is_empty() {
                registry.remove(&provider.id);
            }
            tracing::info!(
                provider = %provider.id,
                channel = %request.channel_id,
                tuners = provider.tuner_count,
                in_use,
                "Tuner limit reached"
            );
            return Ok(None);
        }

        let config = &self.inner.config;
        let id = self.inner.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let folder = key.folder(&config.temp_dir);
        let failover = Arc::new(std::sync::Mutex::new(FailoverChain::new(
            request.url.clone(),
            &request.backup_urls,
            config.max_backups,
        )));
        let worker = Worker::new(
            key.clone(),
            id,
            config.clone(),
            provider.clone(),
            failover.clone(),
            self.inner.store.clone(),
            folder.clone(),
            self.inner.pids.clone(),
            self.inner.events.clone(),
        );
        let stream = Arc::new(Stream::new(
            key.clone(),
            id,
            request.name.clone(),
            folder,
            config,
            self.inner.events.clone(),
            failover,
            worker,
        ));

        tracing::info!(
            stream = %key,
            stream_id = id,
            name = %request.name,
            backend = %config.backend,
            tuners_in_use = entry.streams.len() + 1,
            tuners = provider.tuner_count,
            "Stream started"
        );

        let client = stream.join().await;
        entry.streams.insert(request.channel_id.clone(), stream);

        Ok(Some(Ticket {
            key,
            stream_id: id,
            client,
        }))
    }

    /// Bind a reserved client to its response sink
    ///
    /// `connection` is cancelled by the caller when the downstream goes away.
    pub async fn attach(
        &self,
        ticket: &Ticket,
        sink: ResponseSink,
        connection: CancellationToken,
    ) -> Result<ClientSession> {
        let stream = self
            .find(&ticket.key, Some(ticket.stream_id))
            .await
            .ok_or_else(|| Error::StreamNotFound(ticket.key.clone()))?;

        stream.attach(ticket.client, sink, connection).await
    }

    /// Admit, attach and stream to one client until it is gone
    pub async fn serve(
        &self,
        request: &ChannelRequest,
        sink: ResponseSink,
        connection: CancellationToken,
    ) -> Result<Served> {
        let Some(ticket) = self.start_or_join(request).await? else {
            return Ok(Served::LimitReached);
        };

        let session = match self.attach(&ticket, sink, connection).await {
            Ok(session) => session,
            Err(e) => {
                self.detach(&ticket.key.provider, &ticket.key.channel, ticket.client)
                    .await;
                return Err(e);
            }
        };

        session.closed().await;
        self.detach(&ticket.key.provider, &ticket.key.channel, ticket.client)
            .await;
        Ok(Served::Streamed)
    }

    /// Remove a client; idempotent
    ///
    /// When the last client leaves, the worker is stopped and the stream
    /// waits out the grace period before it is torn down.
    pub async fn detach(&self, provider_id: &str, channel_id: &str, client: ClientId) {
        let key = StreamKey::new(provider_id, channel_id);
        let Some(stream) = self.find(&key, None).await else {
            return;
        };
        let Some(epoch) = stream.detach(client).await else {
            return;
        };

        let grace = self.inner.config.grace_period;
        tracing::info!(
            stream = %key,
            grace_ms = grace.as_millis() as u64,
            "Last client left, entering grace period"
        );

        let weak = Arc::downgrade(&self.inner);
        let stream_id = stream.id();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                StreamManager { inner }.expire(key, stream_id, epoch).await;
            }
        });
        stream.arm_grace(epoch, timer.abort_handle()).await;
    }

    /// Tear down a stream whose grace period ran out
    async fn expire(&self, key: StreamKey, stream_id: u64, epoch: u64) {
        let stream = {
            let mut registry = self.inner.registry.lock().await;
            let Some(entry) = registry.get_mut(&key.provider) else {
                return;
            };
            let Some(stream) = entry.streams.get(&key.channel).cloned() else {
                return;
            };
            if stream.id() != stream_id || !stream.grace_expired(epoch).await {
                return;
            }

            entry.streams.remove(&key.channel);
            if entry.streams.is_empty() {
                registry.remove(&key.provider);
            }
            stream
        };

        tracing::info!(stream = %key, "Grace period expired");
        stream.shutdown(&self.inner.store).await;
    }

    /// Evict every client of a stream and tear it down now
    async fn teardown(&self, key: &StreamKey, stream_id: u64) {
        let stream = {
            let mut registry = self.inner.registry.lock().await;
            let Some(entry) = registry.get_mut(&key.provider) else {
                return;
            };
            if entry.streams.get(&key.channel).map(|s| s.id()) != Some(stream_id) {
                return;
            }
            let stream = entry.streams.remove(&key.channel);
            if entry.streams.is_empty() {
                registry.remove(&key.provider);
            }
            stream
        };

        if let Some(stream) = stream {
            stream.disarm_grace().await;
            stream.evict_all().await;
            stream.shutdown(&self.inner.store).await;
        }
    }

    /// Evict all clients, tear down all streams and refuse new requests
    pub async fn teardown_all(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);

        let streams: Vec<Arc<Stream>> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .drain()
                .flat_map(|(_, entry)| entry.streams.into_values())
                .collect()
        };

        tracing::info!(streams = streams.len(), "Tearing down all streams");

        for stream in &streams {
            stream.disarm_grace().await;
            stream.evict_all().await;
        }
        futures::future::join_all(streams.iter().map(|s| s.shutdown(&self.inner.store))).await;
    }

    /// Active streams per provider
    pub async fn snapshot(&self) -> ActiveStreams {
        let registry = self.inner.registry.lock().await;
        let mut providers = BTreeMap::new();

        for (provider_id, entry) in registry.iter() {
            let mut streams = Vec::with_capacity(entry.streams.len());
            for (channel_id, stream) in &entry.streams {
                streams.push(StreamStats {
                    channel_id: channel_id.clone(),
                    name: stream.name().to_string(),
                    clients: stream.client_count().await,
                    backup_index: stream.backup_index(),
                    bytes_relayed: stream.bytes_relayed(),
                    uptime: stream.started_at().elapsed(),
                    in_grace: stream.in_grace().await,
                });
            }
            streams.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));

            providers.insert(
                provider_id.clone(),
                ProviderStats {
                    provider_id: provider_id.clone(),
                    name: entry.name.clone(),
                    streams,
                },
            );
        }

        ActiveStreams {
            providers: providers.into_values().collect(),
        }
    }

    /// Look up an active stream, optionally requiring a generation
    pub async fn stream(&self, key: &StreamKey) -> Option<Arc<Stream>> {
        self.find(key, None).await
    }

    async fn find(&self, key: &StreamKey, stream_id: Option<u64>) -> Option<Arc<Stream>> {
        let registry = self.inner.registry.lock().await;
        registry
            .get(&key.provider)
            .and_then(|entry| entry.streams.get(&key.channel))
            .filter(|stream| stream_id.map_or(true, |id| stream.id() == id))
            .cloned()
    }

    /// Apply the recovery policy for one error event
    async fn handle_event(&self, event: ErrorEvent) {
        let Some(stream) = self.find(&event.stream, Some(event.stream_id)).await else {
            tracing::debug!(
                stream = %event.stream,
                stream_id = event.stream_id,
                error = %event.cause,
                "Ignoring event for a stream that is gone"
            );
            return;
        };

        let code = event.cause.code().map(|c| c.as_u16());

        if let Some(client) = event.client {
            if event.cause.is_fatal() {
                tracing::error!(
                    stream = %event.stream,
                    client = %client,
                    code,
                    error = %event.cause,
                    "Client failed"
                );
            } else {
                tracing::debug!(
                    stream = %event.stream,
                    client = %client,
                    error = %event.cause,
                    "Client gone"
                );
            }
            self.detach(&event.stream.provider, &event.stream.channel, client)
                .await;
            return;
        }

        if event.upstream_closed && stream.auto_reconnect() && stream.client_count().await > 0 {
            tracing::info!(
                stream = %event.stream,
                code,
                error = %event.cause,
                "Upstream closed, reconnecting"
            );
            stream.worker().restart();
            return;
        }

        if event.cause.is_fatal() {
            tracing::error!(stream = %event.stream, code, error = %event.cause, "Stream failed");
        } else {
            tracing::debug!(stream = %event.stream, code, error = %event.cause, "Stream ended");
        }
        self.teardown(&event.stream, event.stream_id).await;
    }
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("temp_dir", &self.inner.config.temp_dir)
            .field("backend", &self.inner.config.backend)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Single consumer of the error channel
async fn handle_errors(manager: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<ErrorEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = manager.upgrade() else {
            break;
        };
        StreamManager { inner }.handle_event(event).await;
    }
    tracing::debug!("Error handler stopped");
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::provider::{ProviderInfo, StaticProviders};
    use crate::relay::ErrorCause;
    use crate::worker::testing::script;

    const WAIT: Duration = Duration::from_secs(10);

    /// Poll a condition until it holds or the test times out
    macro_rules! wait_until {
        ($cond:expr) => {
            tokio::time::timeout(WAIT, async {
                while !$cond {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("condition not reached in time")
        };
    }

    fn config(temp: &Path) -> RelayConfig {
        RelayConfig::default()
            .temp_dir(temp)
            .transcoder("sh", "[URL]")
            .grace_period(Duration::from_millis(200))
            .store_in_memory(true)
    }

    /// Script that prints numbered tick lines slowly, then idles
    fn ticker(dir: &Path, name: &str) -> String {
        script(
            dir,
            name,
            "i=0\n\
             while [ $i -lt 1000 ]; do echo \"tick $i\"; i=$((i+1)); sleep 0.01; done\n\
             sleep 30",
        )
        .display()
        .to_string()
    }

    fn manager(config: RelayConfig, tuners: usize, dir: &Path) -> StreamManager {
        let providers = StaticProviders::new()
            .with_provider(ProviderInfo::new("P1", "Cable", tuners))
            .with_channel(ChannelRequest::new("P1", "C1", ticker(dir, "c1")).name("One"))
            .with_channel(ChannelRequest::new("P1", "C2", ticker(dir, "c2")).name("Two"));
        StreamManager::new(config, Arc::new(providers))
    }

    fn request(manager: &StreamManager, channel: &str) -> ChannelRequest {
        manager.providers().channel("P1", channel).unwrap()
    }

    #[tokio::test]
    async fn test_tuner_limit_and_grace_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 1, dir.path());
        let c1 = request(&manager, "C1");
        let c2 = request(&manager, "C2");

        // First client takes the only tuner
        let a = manager.start_or_join(&c1).await.unwrap().unwrap();
        // Same channel shares the stream
        let b = manager.start_or_join(&c1).await.unwrap().unwrap();
        assert_eq!(a.stream_id, b.stream_id);
        // Other channel is refused
        assert!(manager.start_or_join(&c2).await.unwrap().is_none());

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.stream_count(), 1);
        assert_eq!(snapshot.client_count(), 2);

        manager.detach("P1", "C1", a.client).await;
        manager.detach("P1", "C1", b.client).await;
        // Idempotent
        manager.detach("P1", "C1", b.client).await;

        // Still held during the grace period
        let stream = manager.stream(&a.key).await.unwrap();
        assert!(stream.in_grace().await);
        assert!(manager.start_or_join(&c2).await.unwrap().is_none());

        // After expiry the tuner is free again
        wait_until!(manager.stream(&a.key).await.is_none());
        wait_until!(!manager.store().exists(stream.folder()).await);
        assert!(manager.snapshot().await.is_empty());
        assert_eq!(stream.worker().active_backends(), 0);

        let c = manager.start_or_join(&c2).await.unwrap().unwrap();
        assert_ne!(c.stream_id, a.stream_id);

        manager.teardown_all().await;
    }

    #[tokio::test]
    async fn test_concurrent_admission_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 1, dir.path());
        let c1 = request(&manager, "C1");
        let c2 = request(&manager, "C2");

        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = manager.clone();
            let req = if i % 2 == 0 { c1.clone() } else { c2.clone() };
            tasks.push(tokio::spawn(async move { manager.start_or_join(&req).await.unwrap() }));
        }

        let mut admitted = Vec::new();
        for task in tasks {
            if let Some(ticket) = task.await.unwrap() {
                admitted.push(ticket);
            }
        }

        assert!(!admitted.is_empty());
        let first = &admitted[0];
        assert!(admitted.iter().all(|t| t.stream_id == first.stream_id));

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.stream_count(), 1);
        assert_eq!(snapshot.client_count(), admitted.len());

        manager.teardown_all().await;
    }

    #[tokio::test]
    async fn test_reattach_within_grace_keeps_stream() {
        let dir = tempfile::tempdir().unwrap();
        let launches = dir.path().join("launches");
        let upstream = script(
            dir.path(),
            "counted",
            &format!(
                "echo run >> {}\ni=0\n\
                 while true; do echo \"tick $i\"; i=$((i+1)); sleep 0.01; done",
                launches.display()
            ),
        );
        let providers = StaticProviders::new()
            .with_provider(ProviderInfo::new("P1", "Cable", 1))
            .with_channel(ChannelRequest::new("P1", "C1", upstream.display().to_string()));
        let config = config(dir.path()).grace_period(Duration::from_secs(5));
        let manager = StreamManager::new(config, Arc::new(providers));
        let c1 = request(&manager, "C1");

        let a = manager.start_or_join(&c1).await.unwrap().unwrap();
        let (writer, _reader) = tokio::io::duplex(64 * 1024);
        let session = manager.attach(&a, Box::new(writer), CancellationToken::new()).await.unwrap();
        let stream = manager.stream(&a.key).await.unwrap();
        wait_until!(stream.worker().segment_sequence().await >= 1);

        manager.detach("P1", "C1", a.client).await;
        session.closed().await;
        assert!(stream.in_grace().await);

        // The backend keeps producing through the grace period
        let relayed = stream.bytes_relayed();
        wait_until!(stream.bytes_relayed() > relayed + 50);
        assert!(stream.worker().is_running());

        let b = manager.start_or_join(&c1).await.unwrap().unwrap();
        assert_eq!(b.stream_id, a.stream_id);
        assert!(!stream.in_grace().await);
        assert!(stream.worker().is_running());
        assert_eq!(stream.worker().active_backends(), 1);
        assert!(manager.store().exists(stream.folder()).await);

        let (writer, _reader) = tokio::io::duplex(64 * 1024);
        let session = manager.attach(&b, Box::new(writer), CancellationToken::new()).await.unwrap();
        let mut delivered = session.delivered();
        tokio::time::timeout(WAIT, delivered.wait_for(|n| *n > 0)).await.unwrap().unwrap();

        // One launch across attach, detach and rejoin
        let log = tokio::fs::read_to_string(&launches).await.unwrap();
        assert_eq!(log.lines().filter(|l| *l == "run").count(), 1);

        manager.teardown_all().await;
        assert_eq!(stream.worker().active_backends(), 0);
    }

    #[tokio::test]
    async fn test_late_join_catchup_has_no_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 1, dir.path());
        let c1 = request(&manager, "C1");

        let a = manager.start_or_join(&c1).await.unwrap().unwrap();
        let stream = manager.stream(&a.key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let (wa, mut ra) = tokio::io::duplex(256 * 1024);
        let sa = manager.attach(&a, Box::new(wa), CancellationToken::new()).await.unwrap();
        wait_until!(stream.bytes_relayed() > 400);

        // Joins while the catchup buffer already holds output
        let b = manager.start_or_join(&c1).await.unwrap().unwrap();
        let (wb, mut rb) = tokio::io::duplex(256 * 1024);
        let sb = manager.attach(&b, Box::new(wb), CancellationToken::new()).await.unwrap();

        let mut db = sb.delivered();
        tokio::time::timeout(WAIT, db.wait_for(|n| *n >= 800)).await.unwrap().unwrap();

        manager.teardown_all().await;
        sa.closed().await;
        sb.closed().await;

        let mut out_a = String::new();
        let mut out_b = String::new();
        ra.read_to_string(&mut out_a).await.unwrap();
        rb.read_to_string(&mut out_b).await.unwrap();

        let ticks = |out: &str| -> Vec<usize> {
            out.lines()
                .filter_map(|l| l.strip_prefix("tick "))
                .filter_map(|n| n.parse().ok())
                .collect()
        };
        let ticks_a = ticks(&out_a);
        let ticks_b = ticks(&out_b);

        // Output queued before the first attach arrives exactly once
        assert_eq!(ticks_a[0], 0);
        // The primed bytes and the live chunks line up without repeats
        for run in [&ticks_a, &ticks_b] {
            assert!(run.len() > 5);
            assert!(run.windows(2).all(|w| w[1] == w[0] + 1));
        }
        // The late joiner starts from buffered output, not from its attach time
        assert_eq!(ticks_b[0], 0);
    }

    #[tokio::test]
    async fn test_fan_out_delivers_same_bytes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path()).late_join_catchup(false);
        let manager = manager(config, 1, dir.path());
        let c1 = request(&manager, "C1");

        let a = manager.start_or_join(&c1).await.unwrap().unwrap();
        let b = manager.start_or_join(&c1).await.unwrap().unwrap();

        let (wa, mut ra) = tokio::io::duplex(64 * 1024);
        let (wb, mut rb) = tokio::io::duplex(64 * 1024);
        let sa = manager.attach(&a, Box::new(wa), CancellationToken::new()).await.unwrap();
        let sb = manager.attach(&b, Box::new(wb), CancellationToken::new()).await.unwrap();

        let mut da = sa.delivered();
        let mut db = sb.delivered();
        tokio::time::timeout(WAIT, da.wait_for(|n| *n >= 200)).await.unwrap().unwrap();
        tokio::time::timeout(WAIT, db.wait_for(|n| *n >= 200)).await.unwrap().unwrap();

        manager.teardown_all().await;
        sa.closed().await;
        sb.closed().await;

        let mut out_a = String::new();
        let mut out_b = String::new();
        ra.read_to_string(&mut out_a).await.unwrap();
        rb.read_to_string(&mut out_b).await.unwrap();

        let ticks = |out: &str| -> Vec<usize> {
            out.lines()
                .filter_map(|l| l.strip_prefix("tick "))
                .filter_map(|n| n.parse().ok())
                .collect()
        };
        let ticks_a = ticks(&out_a);
        let ticks_b = ticks(&out_b);

        // The first client went live before the broadcaster started
        assert_eq!(ticks_a[0], 0);
        // Each client sees a gapless, ordered run of the same chunks
        for run in [&ticks_a, &ticks_b] {
            assert!(run.len() > 5);
            assert!(run.windows(2).all(|w| w[1] == w[0] + 1));
        }
        assert!(ticks_b[0] >= ticks_a[0]);
    }

    #[tokio::test]
    async fn test_failing_client_does_not_affect_others() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 1, dir.path());
        let c1 = request(&manager, "C1");

        let good = manager.start_or_join(&c1).await.unwrap().unwrap();
        let bad = manager.start_or_join(&c1).await.unwrap().unwrap();

        let (writer, mut reader) = tokio::io::duplex(64 * 1024);
        let broken = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset"))
            .build();

        let good_session = manager
            .attach(&good, Box::new(writer), CancellationToken::new())
            .await
            .unwrap();
        let bad_session = manager
            .attach(&bad, Box::new(broken), CancellationToken::new())
            .await
            .unwrap();

        // The broken client is detached by the error task
        tokio::time::timeout(WAIT, bad_session.closed()).await.unwrap();
        let stream = manager.stream(&good.key).await.unwrap();
        wait_until!(stream.client_count().await == 1);

        // The healthy one keeps receiving
        let mut delivered = good_session.delivered();
        let before = *delivered.borrow();
        tokio::time::timeout(WAIT, delivered.wait_for(|n| *n > before + 50))
            .await
            .unwrap()
            .unwrap();

        let mut buf = [0u8; 16];
        assert!(reader.read(&mut buf).await.unwrap() > 0);

        manager.teardown_all().await;
    }

    #[tokio::test]
    async fn test_serve_returns_after_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 1, dir.path());
        let c1 = request(&manager, "C1");
        let c2 = request(&manager, "C2");

        let connection = CancellationToken::new();
        let served = tokio::spawn({
            let manager = manager.clone();
            let connection = connection.clone();
            async move {
                manager
                    .serve(&c1, Box::new(tokio::io::sink()), connection)
                    .await
                    .unwrap()
            }
        });

        wait_until!(manager.snapshot().await.client_count() == 1);
        assert_eq!(
            manager
                .serve(&c2, Box::new(tokio::io::sink()), CancellationToken::new())
                .await
                .unwrap(),
            Served::LimitReached
        );

        connection.cancel();
        assert_eq!(served.await.unwrap(), Served::Streamed);
        wait_until!(manager.stream(&StreamKey::new("P1", "C1")).await.is_none());
    }

    #[tokio::test]
    async fn test_upstream_end_tears_down_without_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let providers = StaticProviders::new()
            .with_provider(ProviderInfo::new("P1", "Cable", 1))
            .with_channel(ChannelRequest::new(
                "P1",
                "C1",
                script(dir.path(), "short", "echo done\nsleep 0.5").display().to_string(),
            ));
        let manager = StreamManager::new(config(dir.path()), Arc::new(providers));
        let req = manager.providers().channel("P1", "C1").unwrap();

        let ticket = manager.start_or_join(&req).await.unwrap().unwrap();
        let session = manager
            .attach(&ticket, Box::new(tokio::io::sink()), CancellationToken::new())
            .await
            .unwrap();

        // Clients are evicted and the stream disappears
        tokio::time::timeout(WAIT, session.closed()).await.unwrap();
        wait_until!(manager.stream(&ticket.key).await.is_none());
    }

    #[tokio::test]
    async fn test_auto_reconnect_restarts_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("runs.log");
        let source = script(
            dir.path(),
            "flaky",
            &format!("echo run >> {}\necho data", log.display()),
        );
        let providers = StaticProviders::new()
            .with_provider(ProviderInfo::new("P1", "Cable", 1))
            .with_channel(ChannelRequest::new("P1", "C1", source.display().to_string()));
        let config = config(dir.path())
            .auto_reconnect(true)
            .reconnect_delay(Duration::from_millis(20));
        let manager = StreamManager::new(config, Arc::new(providers));
        let req = manager.providers().channel("P1", "C1").unwrap();

        let ticket = manager.start_or_join(&req).await.unwrap().unwrap();
        let _session = manager
            .attach(&ticket, Box::new(tokio::io::sink()), CancellationToken::new())
            .await
            .unwrap();

        wait_until!(std::fs::read_to_string(&log)
            .map(|s| s.lines().count() >= 3)
            .unwrap_or(false));

        // Same stream generation throughout
        let stream = manager.stream(&ticket.key).await.unwrap();
        assert_eq!(stream.id(), ticket.stream_id);

        manager.teardown_all().await;
    }

    #[tokio::test]
    async fn test_stale_events_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 1, dir.path());
        let c1 = request(&manager, "C1");

        let ticket = manager.start_or_join(&c1).await.unwrap().unwrap();
        manager.inner.events.report(ErrorEvent::stream(
            ticket.key.clone(),
            ticket.stream_id + 100,
            ErrorCause::ReadFailed("old".into()),
            true,
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(manager.stream(&ticket.key).await.is_some());

        manager.teardown_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_refuses_requests() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 2, dir.path());
        let c1 = request(&manager, "C1");

        let ticket = manager.start_or_join(&c1).await.unwrap().unwrap();
        manager.teardown_all().await;

        assert!(manager.stream(&ticket.key).await.is_none());
        assert!(matches!(
            manager.start_or_join(&c1).await,
            Err(Error::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 1, dir.path());

        assert_eq!(manager.resolve("P1", "C2").unwrap().name, "Two");
        assert!(matches!(manager.resolve("P9", "C1"), Err(Error::UnknownProvider(_))));
        assert!(matches!(
            manager.resolve("P1", "C9"),
            Err(Error::UnknownChannel { channel, .. }) if channel == "C9"
        ));
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(config(dir.path()), 1, dir.path());

        let result = manager
            .start_or_join(&ChannelRequest::new("P9", "C1", "http://x"))
            .await;
        assert!(matches!(result, Err(Error::UnknownProvider(id)) if id == "P9"));
    }
}
