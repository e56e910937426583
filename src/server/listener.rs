//! Relay server listener
//!
//! Handles the TCP accept loop and serves `GET /stream/<provider>/<channel>`
//! requests from the stream manager.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::relay::StreamManager;
use crate::server::config::ServerConfig;
use crate::server::limit::LimitContent;

const MAX_HEAD_SIZE: usize = 8 * 1024;
const STREAM_PREFIX: &str = "/stream/";

/// HTTP front end for the relay
pub struct RelayServer {
    config: ServerConfig,
    manager: StreamManager,
    next_session_id: AtomicU64,
    connection_semaphore: Option<Arc<Semaphore>>,
}

impl RelayServer {
    /// Create a new server with the given configuration and manager
    pub fn new(config: ServerConfig, manager: StreamManager) -> Self {
        let connection_semaphore = if config.max_connections > 0 {
            Some(Arc::new(Semaphore::new(config.max_connections)))
        } else {
            None
        };

        Self {
            config,
            manager,
            next_session_id: AtomicU64::new(1),
            connection_semaphore,
        }
    }

    /// Get the stream manager
    pub fn manager(&self) -> &StreamManager {
        &self.manager
    }

    /// Get the bind address
    pub fn bind_addr(&self) -> SocketAddr {
        self.config.bind_addr
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve_until(listener, shutdown).await
    }

    /// Serve connections from an already bound listener until `shutdown` resolves
    pub async fn serve_until<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Relay server listening");

        let transcoder = &self.manager.config().transcoder.path;
        let limit = Arc::new(LimitContent::prepare(&self.config, transcoder).await);

        tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener, limit) => result,
        }
    }

    async fn accept_loop(&self, listener: &TcpListener, limit: Arc<LimitContent>) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr, limit.clone());
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(
        &self,
        socket: TcpStream,
        peer_addr: SocketAddr,
        limit: Arc<LimitContent>,
    ) {
        // Check connection limit
        let permit = if let Some(ref sem) = self.connection_semaphore {
            match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    tracing::warn!(peer = %peer_addr, "Connection rejected: limit reached");
                    return;
                }
            }
        } else {
            None
        };

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            session_id = session_id,
            peer = %peer_addr,
            "New connection"
        );

        if self.config.tcp_nodelay {
            if let Err(e) = socket.set_nodelay(true) {
                tracing::error!(error = %e, "Failed to configure socket");
                return;
            }
        }

        let config = self.config.clone();
        let manager = self.manager.clone();

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = serve_connection(socket, &config, &manager, &limit).await {
                tracing::debug!(
                    session_id = session_id,
                    error = %e,
                    "Connection error"
                );
            }

            tracing::debug!(session_id = session_id, "Connection closed");
        });
    }
}

async fn serve_connection(
    socket: TcpStream,
    config: &ServerConfig,
    manager: &StreamManager,
    limit: &LimitContent,
) -> io::Result<()> {
    let (mut read, mut write) = socket.into_split();

    let head = tokio::time::timeout(config.request_timeout, read_head(&mut read))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request head timed out"))??;

    let Some((provider, channel)) = parse_route(&head) else {
        return respond(&mut write, "404 Not Found").await;
    };

    if manager.is_shutting_down() {
        return respond(&mut write, "503 Service Unavailable").await;
    }

    let request = match manager.resolve(&provider, &channel) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(
                provider = %provider,
                channel = %channel,
                error = %e,
                "Unknown stream requested"
            );
            return respond(&mut write, "404 Not Found").await;
        }
    };

    let ticket = match manager.start_or_join(&request).await {
        Ok(Some(ticket)) => ticket,
        Ok(None) => {
            write_head(&mut write, "200 OK", "video/mpeg").await?;
            limit
                .serve(&mut write, config.limit_repeat, config.limit_interval)
                .await?;
            return write.shutdown().await;
        }
        Err(e) => {
            tracing::warn!(
                provider = %provider,
                channel = %channel,
                error = %e,
                "Stream request failed"
            );
            return respond(&mut write, "503 Service Unavailable").await;
        }
    };

    // Reader on the request side notices the client leaving
    let connection = CancellationToken::new();
    tokio::spawn(watch_disconnect(read, connection.clone()));

    let result = async {
        write_head(&mut write, "200 OK", "video/mp2t").await?;
        manager
            .attach(&ticket, Box::new(write), connection.clone())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
    .await;

    match result {
        Ok(session) => session.closed().await,
        Err(e) => tracing::debug!(stream = %ticket.key, error = %e, "Attach failed"),
    }

    connection.cancel();
    manager
        .detach(&ticket.key.provider, &ticket.key.channel, ticket.client)
        .await;
    Ok(())
}

async fn watch_disconnect(mut reader: OwnedReadHalf, connection: CancellationToken) {
    let mut buf = [0u8; 512];
    loop {
        let read = tokio::select! {
            _ = connection.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    connection.cancel();
}

/// Read until the end of the request head
async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<String> {
    let mut head = Vec::with_capacity(1024);
    let mut buf = [0u8; 1024];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before request",
            ));
        }
        head.extend_from_slice(&buf[..n]);

        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
        }
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

/// Extract `(provider, channel)` from `GET /stream/<provider>/<channel>`
fn parse_route(head: &str) -> Option<(String, String)> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();

    if parts.next()? != "GET" {
        return None;
    }
    let target = parts.next()?;
    let path = target.split(['?', '#']).next()?;
    let rest = path.strip_prefix(STREAM_PREFIX)?;

    let (provider, channel) = rest.split_once('/')?;
    if provider.is_empty() || channel.is_empty() || channel.contains('/') {
        return None;
    }
    Some((provider.to_string(), channel.to_string()))
}

async fn write_head<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    status: &str,
    content_type: &str,
) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n",
        status, content_type
    );
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}

async fn respond<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, status: &str) -> io::Result<()> {
    write_head(writer, status, "text/plain").await?;
    writer.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route() {
        assert_eq!(
            parse_route("GET /stream/M1/101 HTTP/1.1\r\nHost: x\r\n\r\n"),
            Some(("M1".to_string(), "101".to_string()))
        );
        assert_eq!(
            parse_route("GET /stream/M1/101?token=abc HTTP/1.1\r\n\r\n"),
            Some(("M1".to_string(), "101".to_string()))
        );
        assert_eq!(parse_route("POST /stream/M1/101 HTTP/1.1\r\n\r\n"), None);
        assert_eq!(parse_route("GET /web/ HTTP/1.1\r\n\r\n"), None);
        assert_eq!(parse_route("GET /stream/M1 HTTP/1.1\r\n\r\n"), None);
        assert_eq!(parse_route("GET /stream/M1/1/2 HTTP/1.1\r\n\r\n"), None);
    }

    #[tokio::test]
    async fn test_read_head() {
        let mut reader = tokio_test::io::Builder::new()
            .read(b"GET /stream/M1/1 HTTP/1.1\r\n")
            .read(b"Host: relay\r\n\r\n")
            .build();

        let head = read_head(&mut reader).await.unwrap();
        assert!(head.starts_with("GET /stream/M1/1"));
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_read_head_eof() {
        let mut reader = tokio_test::io::Builder::new().read(b"GET /").build();
        let err = read_head(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[cfg(unix)]
    mod scenarios {
        use std::time::Duration;

        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        use super::*;
        use crate::provider::{ChannelRequest, ProviderInfo, StaticProviders};
        use crate::relay::RelayConfig;
        use crate::worker::testing::script;

        async fn start(
            dir: &std::path::Path,
            tuners: usize,
        ) -> (SocketAddr, StreamManager, CancellationToken) {
            let source = script(dir, "live", "while true; do echo live; sleep 0.01; done");
            let providers = StaticProviders::new()
                .with_provider(ProviderInfo::new("M1", "Cable", tuners))
                .with_channel(ChannelRequest::new("M1", "1", source.display().to_string()))
                .with_channel(ChannelRequest::new("M1", "2", source.display().to_string()));
            let relay = RelayConfig::default()
                .temp_dir(dir)
                .transcoder("sh", "[URL]")
                .store_in_memory(true)
                .grace_period(Duration::from_millis(50));
            let manager = StreamManager::new(relay, Arc::new(providers));

            let config = ServerConfig::default().limit_schedule(2, Duration::from_millis(1));
            let server = RelayServer::new(config, manager.clone());
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();

            let shutdown = CancellationToken::new();
            let stop = shutdown.clone();
            tokio::spawn(async move {
                server
                    .serve_until(listener, async move { stop.cancelled().await })
                    .await
                    .unwrap();
            });
            (addr, manager, shutdown)
        }

        async fn get(addr: SocketAddr, path: &str) -> TcpStream {
            let mut socket = TcpStream::connect(addr).await.unwrap();
            socket
                .write_all(format!("GET {} HTTP/1.1\r\nHost: relay\r\n\r\n", path).as_bytes())
                .await
                .unwrap();
            socket
        }

        async fn read_some(socket: &mut TcpStream, min: usize) -> String {
            let mut out = Vec::new();
            let mut buf = [0u8; 1024];
            while out.len() < min {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            String::from_utf8_lossy(&out).into_owned()
        }

        #[tokio::test]
        async fn test_streams_channel() {
            let dir = tempfile::tempdir().unwrap();
            let (addr, manager, shutdown) = start(dir.path(), 1).await;

            let mut socket = get(addr, "/stream/M1/1").await;
            let body = tokio::time::timeout(Duration::from_secs(10), read_some(&mut socket, 200))
                .await
                .unwrap();
            assert!(body.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(body.contains("Content-Type: video/mp2t"));
            assert!(body.contains("live\n"));

            // Second channel hits the tuner limit
            let mut refused = get(addr, "/stream/M1/2").await;
            let mut limit = Vec::new();
            refused.read_to_end(&mut limit).await.unwrap();
            let limit_head = String::from_utf8_lossy(&limit);
            assert!(limit_head.contains("Content-Type: video/mpeg"));
            let filler = LimitContent::filler();
            assert!(limit.len() >= 2 * filler.payload().len());

            // Hanging up releases the client
            drop(socket);
            tokio::time::timeout(Duration::from_secs(10), async {
                while !manager.snapshot().await.is_empty() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .unwrap();

            manager.teardown_all().await;
            shutdown.cancel();
        }

        #[tokio::test]
        async fn test_unknown_routes() {
            let dir = tempfile::tempdir().unwrap();
            let (addr, manager, shutdown) = start(dir.path(), 1).await;

            for path in ["/stream/M1/404", "/stream/M9/1", "/playlist.m3u"] {
                let mut socket = get(addr, path).await;
                let mut out = String::new();
                socket.read_to_string(&mut out).await.unwrap();
                assert!(out.starts_with("HTTP/1.1 404 Not Found"), "{}: {}", path, out);
            }

            manager.teardown_all().await;
            let mut socket = get(addr, "/stream/M1/1").await;
            let mut out = String::new();
            socket.read_to_string(&mut out).await.unwrap();
            assert!(out.starts_with("HTTP/1.1 503"));

            shutdown.cancel();
        }
    }
}
