//! Error events
//!
//! Workers, broadcasters and delivery tasks never recover from failures
//! themselves (beyond the worker's backup chain). They report an
//! [`ErrorEvent`] to the stream manager, which decides whether to evict one
//! client, restart the worker in place, or tear the whole stream down.

use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::ErrorCode;

use super::key::{ClientId, StreamKey};

/// Why an error event was raised
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ErrorCause {
    #[error("segment folder missing: {0}")]
    BufferFolderMissing(String),

    #[error("could not send data to client: {0}")]
    SendToClient(String),

    #[error("could not create segment file: {0}")]
    SegmentCreate(String),

    #[error("could not start transcoder: {0}")]
    ProcessStart(String),

    #[error("upstream read failed: {0}")]
    ReadFailed(String),

    #[error("segment write failed: {0}")]
    WriteFailed(String),

    #[error("upstream is an adaptive manifest, which cannot be relayed directly")]
    ManifestUnsupported,

    #[error("upstream ended the stream")]
    EndOfStream,

    #[error("client disconnected")]
    ClientDisconnected,
}

impl ErrorCause {
    /// Stable code for UI reporting
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ErrorCause::BufferFolderMissing(_) => Some(ErrorCode::BufferFolderMissing),
            ErrorCause::SendToClient(_) => Some(ErrorCode::SendToClientFailed),
            ErrorCause::SegmentCreate(_) => Some(ErrorCode::SegmentCreateFailed),
            ErrorCause::ProcessStart(_) => Some(ErrorCode::ProcessStartFailed),
            ErrorCause::ReadFailed(_) => Some(ErrorCode::ReadFailed),
            ErrorCause::WriteFailed(_) => Some(ErrorCode::WriteFailed),
            ErrorCause::ManifestUnsupported => Some(ErrorCode::ManifestUnsupported),
            ErrorCause::EndOfStream => Some(ErrorCode::EndOfStream),
            ErrorCause::ClientDisconnected => None,
        }
    }

    /// Whether the cause deserves error-level logging
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ErrorCause::EndOfStream | ErrorCause::ClientDisconnected
        )
    }

    /// Whether the cause lies with the upstream source
    ///
    /// Upstream causes are worth retrying against a backup URL; local resource
    /// problems are not.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            ErrorCause::ProcessStart(_)
                | ErrorCause::ReadFailed(_)
                | ErrorCause::ManifestUnsupported
                | ErrorCause::EndOfStream
        )
    }
}

/// An error reported to the stream manager
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    /// What went wrong
    pub cause: ErrorCause,
    /// Stream the event originates from
    pub stream: StreamKey,
    /// Generation of that stream; events for a replaced stream are ignored
    pub stream_id: u64,
    /// Affected client, or `None` for a stream-wide condition
    pub client: Option<ClientId>,
    /// Whether the upstream feed has ended
    pub upstream_closed: bool,
}

impl ErrorEvent {
    /// A condition affecting the whole stream
    pub fn stream(
        key: StreamKey,
        stream_id: u64,
        cause: ErrorCause,
        upstream_closed: bool,
    ) -> Self {
        Self {
            cause,
            stream: key,
            stream_id,
            client: None,
            upstream_closed,
        }
    }

    /// A condition affecting one client only
    pub fn client(key: StreamKey, stream_id: u64, client: ClientId, cause: ErrorCause) -> Self {
        Self {
            cause,
            stream: key,
            stream_id,
            client: Some(client),
            upstream_closed: false,
        }
    }
}

/// Sending side of the error channel
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<ErrorEvent>,
}

impl EventSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<ErrorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Report an event; never blocks
    pub fn report(&self, event: ErrorEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Error channel closed, event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(!ErrorCause::EndOfStream.is_fatal());
        assert!(!ErrorCause::ClientDisconnected.is_fatal());
        assert!(ErrorCause::ReadFailed("reset".into()).is_fatal());

        assert!(ErrorCause::EndOfStream.is_upstream());
        assert!(ErrorCause::ManifestUnsupported.is_upstream());
        assert!(!ErrorCause::BufferFolderMissing("/tmp".into()).is_upstream());
        assert!(!ErrorCause::WriteFailed("disk full".into()).is_upstream());
    }

    #[test]
    fn test_codes() {
        assert_eq!(ErrorCause::EndOfStream.code(), Some(ErrorCode::EndOfStream));
        assert_eq!(
            ErrorCause::SegmentCreate("x".into()).code(),
            Some(ErrorCode::SegmentCreateFailed)
        );
        assert_eq!(ErrorCause::ClientDisconnected.code(), None);
    }

    #[tokio::test]
    async fn test_event_channel() {
        let (sender, mut rx) = EventSender::channel();
        let key = StreamKey::new("M1", "1");
        let client = ClientId::new();

        sender.report(ErrorEvent::client(key.clone(), 7, client, ErrorCause::ClientDisconnected));
        sender.report(ErrorEvent::stream(key, 7, ErrorCause::EndOfStream, true));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.client, Some(client));
        assert!(!first.upstream_closed);

        let second = rx.recv().await.unwrap();
        assert!(second.client.is_none());
        assert!(second.upstream_closed);
        assert_eq!(second.stream_id, 7);
    }
}
