//! Client adapter
//!
//! Each downstream connection gets its own outbound buffer and delivery task.
//! The broadcaster only appends to the buffer and pokes the task; a slow or
//! broken client therefore never holds up the others.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::worker::lock;

use super::event::{ErrorCause, ErrorEvent, EventSender};
use super::key::{ClientId, StreamKey};

/// Writable half of a downstream response
pub type ResponseSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Outcome of offering a chunk to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// Buffered and the delivery task was signaled
    Signaled,
    /// Buffered; a flush was already pending, so no new signal
    Skipped,
    /// The buffer limit was hit; the client receives nothing more
    Overrun,
    /// Dropped because the client overran earlier
    Discarded,
}

/// One downstream consumer of a stream
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    buffer: std::sync::Mutex<BytesMut>,
    limit: usize,
    flush_tx: mpsc::Sender<()>,
    flush_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    evict: CancellationToken,
    delivered: watch::Sender<u64>,
    skipped: AtomicU64,
    live: AtomicBool,
    overrun: AtomicBool,
}

impl Client {
    pub(crate) fn new(evict: CancellationToken, limit: usize) -> Self {
        let (flush_tx, flush_rx) = mpsc::channel(1);
        let (delivered, _) = watch::channel(0);

        Self {
            id: ClientId::new(),
            buffer: std::sync::Mutex::new(BytesMut::new()),
            limit,
            flush_tx,
            flush_rx: std::sync::Mutex::new(Some(flush_rx)),
            evict,
            delivered,
            skipped: AtomicU64::new(0),
            live: AtomicBool::new(false),
            overrun: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Whether the client receives broadcast chunks
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub(crate) fn set_live(&self) {
        self.live.store(true, Ordering::Release);
    }

    /// Flush signals that were dropped because one was already pending
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Bytes written to the sink so far
    pub fn delivered(&self) -> u64 {
        *self.delivered.borrow()
    }

    /// Bytes waiting in the outbound buffer
    pub fn pending(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Stop delivery
    pub(crate) fn evict(&self) {
        self.evict.cancel();
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evict.is_cancelled()
    }

    /// Seed the buffer with catchup data before the client goes live
    ///
    /// Only the newest `limit` bytes are kept.
    pub(crate) fn prime(&self, data: &[u8]) {
        let start = data.len().saturating_sub(self.limit);
        lock(&self.buffer).extend_from_slice(&data[start..]);
    }

    /// Append a broadcast chunk and wake the delivery task
    pub(crate) fn push(&self, chunk: &[u8]) -> Push {
        if self.overrun.load(Ordering::Relaxed) {
            return Push::Discarded;
        }

        {
            let mut buffer = lock(&self.buffer);
            if buffer.len() + chunk.len() > self.limit {
                buffer.clear();
                self.overrun.store(true, Ordering::Relaxed);
                return Push::Overrun;
            }
            buffer.extend_from_slice(chunk);
        }

        if self.signal() {
            Push::Signaled
        } else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            Push::Skipped
        }
    }

    /// Request a flush; `false` when one is already pending
    pub(crate) fn signal(&self) -> bool {
        self.flush_tx.try_send(()).is_ok()
    }

    fn take_pending(&self) -> Option<Bytes> {
        let mut buffer = lock(&self.buffer);
        if buffer.is_empty() {
            None
        } else {
            Some(buffer.split().freeze())
        }
    }

    /// Spawn the delivery task writing this client's buffer to `sink`
    ///
    /// Returns `None` if delivery was already started.
    pub(crate) fn spawn_delivery(
        self: &Arc<Self>,
        key: StreamKey,
        stream_id: u64,
        sink: ResponseSink,
        connection: CancellationToken,
        events: EventSender,
    ) -> Option<ClientSession> {
        let flush_rx = lock(&self.flush_rx).take()?;
        let client = self.clone();
        let delivered = self.delivered.subscribe();
        let task_key = key.clone();

        let task = tokio::spawn(async move {
            client
                .deliver(sink, flush_rx, connection, |cause| {
                    events.report(ErrorEvent::client(task_key.clone(), stream_id, client.id, cause))
                })
                .await;
        });

        Some(ClientSession {
            key,
            id: self.id,
            delivered,
            task,
        })
    }

    async fn deliver(
        &self,
        mut sink: ResponseSink,
        mut flush_rx: mpsc::Receiver<()>,
        connection: CancellationToken,
        report: impl Fn(ErrorCause),
    ) {
        'run: loop {
            tokio::select! {
                _ = self.evict.cancelled() => break,
                _ = connection.cancelled() => {
                    report(ErrorCause::ClientDisconnected);
                    break;
                }
                signal = flush_rx.recv() => {
                    if signal.is_none() {
                        break;
                    }

                    while let Some(data) = self.take_pending() {
                        let written = tokio::select! {
                            _ = self.evict.cancelled() => break 'run,
                            _ = connection.cancelled() => {
                                report(ErrorCause::ClientDisconnected);
                                break 'run;
                            }
                            written = write_flush(&mut sink, &data) => written,
                        };

                        if let Err(e) = written {
                            tracing::debug!(
                                client = %self.id,
                                error = %e,
                                "Write to client failed"
                            );
                            report(ErrorCause::SendToClient(e.to_string()));
                            break 'run;
                        }
                        self.delivered.send_modify(|total| *total += data.len() as u64);
                    }
                }
            }
        }

        let _ = sink.shutdown().await;
    }
}

async fn write_flush(sink: &mut ResponseSink, data: &[u8]) -> std::io::Result<()> {
    sink.write_all(data).await?;
    sink.flush().await
}

/// Handle to an attached client's delivery
#[derive(Debug)]
pub struct ClientSession {
    key: StreamKey,
    id: ClientId,
    delivered: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl ClientSession {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Watch of the total bytes written to the sink
    pub fn delivered(&self) -> watch::Receiver<u64> {
        self.delivered.clone()
    }

    /// Wait until delivery has ended
    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            tracing::warn!(
                stream = %self.key,
                client = %self.id,
                error = %e,
                "Delivery task failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_skips_when_signal_pending() {
        let client = Client::new(CancellationToken::new(), 1024);

        assert_eq!(client.push(b"aaa"), Push::Signaled);
        assert_eq!(client.push(b"bbb"), Push::Skipped);
        assert_eq!(client.skipped(), 1);

        // Both chunks are buffered regardless
        assert_eq!(client.pending(), 6);
    }

    #[test]
    fn test_overrun_stops_buffering() {
        let client = Client::new(CancellationToken::new(), 8);

        assert_eq!(client.push(b"12345"), Push::Signaled);
        assert_eq!(client.push(b"67890"), Push::Overrun);
        assert_eq!(client.push(b"x"), Push::Discarded);
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn test_prime_keeps_newest_bytes() {
        let client = Client::new(CancellationToken::new(), 4);
        client.prime(b"abcdefgh");
        assert_eq!(client.take_pending().unwrap(), Bytes::from_static(b"efgh"));
        assert!(client.take_pending().is_none());
    }

    #[tokio::test]
    async fn test_delivery_writes_in_order() {
        let client = Arc::new(Client::new(CancellationToken::new(), 1024));
        let (events, _rx) = EventSender::channel();
        let (writer, mut reader) = tokio::io::duplex(1024);

        let session = client
            .spawn_delivery(
                StreamKey::new("M1", "1"),
                1,
                Box::new(writer),
                CancellationToken::new(),
                events,
            )
            .unwrap();
        assert!(client
            .spawn_delivery(
                StreamKey::new("M1", "1"),
                1,
                Box::new(tokio::io::sink()),
                CancellationToken::new(),
                EventSender::channel().0,
            )
            .is_none());

        client.push(b"one,");
        client.push(b"two,");
        client.push(b"three");

        let mut delivered = session.delivered();
        delivered.wait_for(|n| *n >= 13).await.unwrap();

        client.evict();
        session.closed().await;

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, b"one,two,three");
    }

    #[tokio::test]
    async fn test_write_failure_reports_client_event() {
        let client = Arc::new(Client::new(CancellationToken::new(), 1024));
        let (events, mut rx) = EventSender::channel();
        let sink = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let session = client
            .spawn_delivery(
                StreamKey::new("M1", "1"),
                9,
                Box::new(sink),
                CancellationToken::new(),
                events,
            )
            .unwrap();
        client.push(b"data");
        session.closed().await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.client, Some(client.id()));
        assert_eq!(event.stream_id, 9);
        assert!(matches!(event.cause, ErrorCause::SendToClient(_)));
    }

    #[tokio::test]
    async fn test_connection_cancel_reports_disconnect() {
        let client = Arc::new(Client::new(CancellationToken::new(), 1024));
        let (events, mut rx) = EventSender::channel();
        let connection = CancellationToken::new();

        let session = client
            .spawn_delivery(
                StreamKey::new("M1", "1"),
                1,
                Box::new(tokio::io::sink()),
                connection.clone(),
                events,
            )
            .unwrap();
        connection.cancel();
        session.closed().await;

        let event = rx.recv().await.unwrap();
        assert_eq!(event.cause, ErrorCause::ClientDisconnected);
        assert_eq!(event.client, Some(client.id()));
    }
}
