//! Upstream workers
//!
//! A worker acquires one channel from its upstream and feeds the stream's
//! pipe. Each chunk is also written to the rotating segment files that late
//! joiners are primed from.
//!
//! ```text
//!                       ┌────────────────────────────┐
//!   upstream URL ──────►│  Backend (process | http)  │
//!   (primary/backups)   └─────────────┬──────────────┘
//!                                     │ chunk
//!                        ┌────────────┴────────────┐
//!                        ▼                         ▼
//!                 SegmentWriter               pipe (mpsc)
//!               <folder>/<seq>.ts                  │
//!                                                  ▼
//!                                             Broadcaster
//! ```
//!
//! On an upstream failure the worker moves on to the next backup URL by
//! itself. Anything else, and a failure with no backup left, is reported to
//! the stream manager as an [`ErrorEvent`].
//!
//! At most one backend runs per worker: a new run waits for the previous one
//! to finish before it touches the upstream.

pub mod failover;
pub mod manifest;
pub mod passthrough;
pub mod pid;
pub mod process;
pub mod segment;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::provider::ProviderInfo;
use crate::relay::{ErrorCause, ErrorEvent, EventSender, RelayConfig, StreamKey};
use crate::store::SegmentStore;

pub use failover::FailoverChain;
pub use pid::PidLedger;
pub use segment::SegmentWriter;

/// How a worker acquires the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// External transcoder writing MPEG-TS to stdout
    #[default]
    Process,
    /// Direct HTTP download of the upstream bytes
    Passthrough,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Process => "process",
            BackendKind::Passthrough => "passthrough",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiving end of a worker's pipe, shared by successive broadcaster sessions
pub type PipeReceiver = Arc<Mutex<mpsc::Receiver<Bytes>>>;

/// Everything a backend run needs; shared by all runs of one worker
#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub key: StreamKey,
    pub stream_id: u64,
    pub config: RelayConfig,
    pub provider: ProviderInfo,
    pub failover: Arc<std::sync::Mutex<FailoverChain>>,
    pub segments: Arc<Mutex<SegmentWriter>>,
    pub pids: PidLedger,
    pub events: EventSender,
    active: Arc<AtomicUsize>,
}

/// Result of handing one chunk downstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Forwarded {
    Sent,
    Stopped,
}

impl WorkerShared {
    /// Write a chunk to the segments, then into the pipe
    ///
    /// Waits while the pipe is full; stopping the run ends the wait.
    pub(crate) async fn forward(
        &self,
        chunk: Bytes,
        pipe: &mpsc::Sender<Bytes>,
        stop: &CancellationToken,
    ) -> Result<Forwarded, ErrorCause> {
        if chunk.is_empty() {
            return Ok(Forwarded::Sent);
        }

        self.segments.lock().await.write(&chunk).await?;

        tokio::select! {
            _ = stop.cancelled() => Ok(Forwarded::Stopped),
            sent = pipe.send(chunk) => match sent {
                Ok(()) => Ok(Forwarded::Sent),
                Err(_) => Ok(Forwarded::Stopped),
            },
        }
    }

    /// Current failover URL
    fn current_url(&self) -> String {
        lock(&self.failover).current().to_string()
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RunSlot {
    stop: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl RunSlot {
    fn is_running(&self) -> bool {
        let live_token = self.stop.as_ref().is_some_and(|stop| !stop.is_cancelled());
        let live_task = self.handle.as_ref().is_some_and(|h| !h.is_finished());
        live_token && live_task
    }
}

/// Upstream acquisition for one stream
pub struct Worker {
    shared: Arc<WorkerShared>,
    pipe_tx: std::sync::Mutex<Option<mpsc::Sender<Bytes>>>,
    pipe_rx: PipeReceiver,
    run: std::sync::Mutex<RunSlot>,
    closed: CancellationToken,
}

impl Worker {
    /// Create an idle worker
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: StreamKey,
        stream_id: u64,
        config: RelayConfig,
        provider: ProviderInfo,
        failover: Arc<std::sync::Mutex<FailoverChain>>,
        store: SegmentStore,
        folder: std::path::PathBuf,
        pids: PidLedger,
        events: EventSender,
    ) -> Self {
        let segments = SegmentWriter::new(
            store,
            folder,
            config.segment_size,
            config.segment_retention,
        );
        let (tx, rx) = mpsc::channel(config.pipe_capacity.max(1));

        Self {
            shared: Arc::new(WorkerShared {
                key,
                stream_id,
                config,
                provider,
                failover,
                segments: Arc::new(Mutex::new(segments)),
                pids,
                events,
                active: Arc::new(AtomicUsize::new(0)),
            }),
            pipe_tx: std::sync::Mutex::new(Some(tx)),
            pipe_rx: Arc::new(Mutex::new(rx)),
            run: std::sync::Mutex::new(RunSlot::default()),
            closed: CancellationToken::new(),
        }
    }

    /// Receiving end of the pipe
    pub fn pipe(&self) -> PipeReceiver {
        self.pipe_rx.clone()
    }

    /// Number of backends currently running (0 or 1)
    pub fn active_backends(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Whether a run is in progress
    pub fn is_running(&self) -> bool {
        lock(&self.run).is_running()
    }

    /// Whether the worker was closed for good
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// URL the worker is (or will be) reading from
    pub fn current_url(&self) -> String {
        self.shared.current_url()
    }

    /// Contents of the segment currently being written
    pub async fn current_segment(&self) -> Option<Bytes> {
        let (store, path) = {
            let segments = self.shared.segments.lock().await;
            let path = segments.current_path()?.to_path_buf();
            (segments.store().clone(), path)
        };

        match store.read(&path).await {
            Ok(data) => Some(data),
            Err(e) => {
                tracing::debug!(
                    stream = %self.shared.key,
                    path = %path.display(),
                    error = %e,
                    "Segment unavailable"
                );
                None
            }
        }
    }

    /// Sequence number of the current segment
    pub async fn segment_sequence(&self) -> u64 {
        self.shared.segments.lock().await.sequence()
    }

    /// Start acquiring the upstream; no-op while a run is in progress
    pub fn start(&self) {
        self.start_after(Duration::ZERO);
    }

    /// Stop the current run; the worker can be started again
    pub fn stop(&self) {
        if let Some(stop) = lock(&self.run).stop.as_ref() {
            stop.cancel();
        }
    }

    /// Stop the current run and start a new one after the reconnect delay
    ///
    /// The new run continues with the failover URL that was active.
    pub fn restart(&self) {
        tracing::info!(
            stream = %self.shared.key,
            url = %self.shared.current_url(),
            "Restarting worker"
        );
        self.stop();
        self.start_after(self.shared.config.reconnect_delay);
    }

    /// Stop for good and wait for the backend to exit
    pub async fn close(&self) {
        self.closed.cancel();
        lock(&self.pipe_tx).take();

        let handle = lock(&self.run).handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(stream = %self.shared.key, error = %e, "Worker task failed");
            }
        }

        self.shared.segments.lock().await.finish().await;
    }

    fn start_after(&self, delay: Duration) {
        if self.closed.is_cancelled() {
            return;
        }
        let Some(pipe) = lock(&self.pipe_tx).clone() else {
            return;
        };

        let mut run = lock(&self.run);
        if run.is_running() {
            return;
        }

        let stop = self.closed.child_token();
        let previous = run.handle.take();
        let shared = self.shared.clone();
        let task_stop = stop.clone();

        run.stop = Some(stop);
        run.handle = Some(tokio::spawn(async move {
            // One backend at a time
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            if !delay.is_zero() {
                tokio::select! {
                    _ = task_stop.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if task_stop.is_cancelled() {
                return;
            }

            run_chain(shared, pipe, task_stop).await;
        }));
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("stream", &self.shared.key)
            .field("stream_id", &self.shared.stream_id)
            .field("backend", &self.shared.config.backend)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Run backends along the failover chain until stopped or out of options
async fn run_chain(shared: Arc<WorkerShared>, pipe: mpsc::Sender<Bytes>, stop: CancellationToken) {
    let _active = ActiveGuard::new(&shared.active);

    if let Err(cause) = shared.segments.lock().await.prepare().await {
        shared
            .events
            .report(ErrorEvent::stream(shared.key.clone(), shared.stream_id, cause, false));
        return;
    }

    loop {
        let url = shared.current_url();
        tracing::info!(
            stream = %shared.key,
            backend = %shared.config.backend,
            url = %url,
            "Worker started"
        );

        let result = match shared.config.backend {
            BackendKind::Process => process::run(&shared, &url, &pipe, &stop).await,
            BackendKind::Passthrough => passthrough::run(&shared, &url, &pipe, &stop).await,
        };

        let cause = match result {
            Ok(()) => {
                tracing::debug!(stream = %shared.key, "Worker stopped");
                return;
            }
            Err(cause) => cause,
        };

        if stop.is_cancelled() {
            tracing::debug!(stream = %shared.key, error = %cause, "Worker stopped while failing");
            return;
        }

        if cause.is_upstream() {
            let next = lock(&shared.failover)
                .advance()
                .map(|(index, url)| (index, url.to_string()));
            if let Some((index, next_url)) = next {
                tracing::warn!(
                    stream = %shared.key,
                    error = %cause,
                    backup = index,
                    url = %next_url,
                    "Upstream failed, switching to backup"
                );
                continue;
            }
        }

        let upstream_closed = cause.is_upstream();
        shared.events.report(ErrorEvent::stream(
            shared.key.clone(),
            shared.stream_id,
            cause,
            upstream_closed,
        ));
        return;
    }
}

/// Lock a std mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
