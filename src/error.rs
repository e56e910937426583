//! Error types
//!
//! [`Error`] covers failures returned from the public API. Failures that happen
//! inside background tasks never surface here; they travel as
//! [`ErrorEvent`](crate::relay::ErrorEvent)s to the stream manager, tagged with
//! a stable [`ErrorCode`] for UI reporting.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::relay::StreamKey;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for relay operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read settings {path}: {source}")]
    SettingsRead { source: io::Error, path: PathBuf },

    #[error("failed to parse settings {path}: {source}")]
    SettingsParse {
        source: toml::de::Error,
        path: PathBuf,
    },

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown channel {channel} for provider {provider}")]
    UnknownChannel { provider: String, channel: String },

    #[error("stream not found: {0}")]
    StreamNotFound(StreamKey),

    #[error("client {client} is not reserved on stream {stream}")]
    ClientNotFound { stream: StreamKey, client: String },

    #[error("stream manager is shutting down")]
    ShuttingDown,

    #[error("transcoder {path} failed: {message}")]
    Transcoder { path: PathBuf, message: String },
}

/// Stable error codes reported to the UI
///
/// The numbering matches the codes operators already know from the log
/// viewer, so the values must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Connection to the streaming source was interrupted
    EndOfStream = 4000,
    /// Temporary buffer files could not be deleted
    BufferRemoveFailed = 4005,
    /// The segment folder does not exist or cannot be created
    BufferFolderMissing = 4008,
    /// Data could not be sent to a client
    SendToClientFailed = 4009,
    /// A segment file could not be created
    SegmentCreateFailed = 4010,
    /// The transcoder process could not be started
    ProcessStartFailed = 4011,
    /// Reading from the upstream failed
    ReadFailed = 4012,
    /// Writing a segment file failed
    WriteFailed = 4013,
    /// The upstream delivered an adaptive manifest instead of a stream
    ManifestUnsupported = 4017,
    /// The PID ledger could not be updated
    PidLedgerFailed = 4040,
}

impl ErrorCode {
    /// Numeric value of the code
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ErrorCode::EndOfStream.as_u16(), 4000);
        assert_eq!(ErrorCode::BufferFolderMissing.as_u16(), 4008);
        assert_eq!(ErrorCode::SendToClientFailed.as_u16(), 4009);
        assert_eq!(ErrorCode::SegmentCreateFailed.as_u16(), 4010);
        assert_eq!(ErrorCode::ReadFailed.as_u16(), 4012);
        assert_eq!(ErrorCode::WriteFailed.as_u16(), 4013);
        assert_eq!(ErrorCode::ManifestUnsupported.to_string(), "4017");
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnknownChannel {
            provider: "M1".into(),
            channel: "42".into(),
        };
        assert_eq!(err.to_string(), "unknown channel 42 for provider M1");

        let err = Error::StreamNotFound(StreamKey::new("M1", "42"));
        assert_eq!(err.to_string(), "stream not found: M1/42");
    }
}
