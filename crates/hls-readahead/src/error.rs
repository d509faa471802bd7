//! Unified crate-level error types.
//!
//! This module provides a single [`HlsError`] type used across the crate and a
//! convenient [`HlsResult`] alias.
//!
//! The session-facing kinds (`OpenFailed`, `SegmentUnavailable`, ...) are what a
//! consumer of [`crate::StreamSession`] matches on. The transport-level kinds
//! (`Io`, `HttpError`, `Timeout`) are produced by the downloader and usually end
//! up wrapped inside one of the session-facing kinds once retries give up.

use std::io;
use std::sync::Arc;

/// Result type used by this crate.
pub type HlsResult<T> = Result<T, HlsError>;

/// Unified error type for the `hls-readahead` crate.
#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    /// A generic error with a message.
    #[error("{0}")]
    Message(String),

    /// Bad URL, unreachable top-level playlist or no playable variant.
    #[error("open failed: {0}")]
    OpenFailed(#[source] Box<HlsError>),

    /// A media playlist could not be fetched or parsed.
    #[error("playlist unavailable: {url}: {source}")]
    PlaylistUnavailable {
        url: String,
        #[source]
        source: Box<HlsError>,
    },

    /// A segment could not be fetched after retries and quality demotion.
    #[error("segment {sequence} unavailable: {source}")]
    SegmentUnavailable {
        sequence: u64,
        #[source]
        source: Box<HlsError>,
    },

    /// Key server request failed.
    #[error("key fetch failed for {url}: {source}")]
    KeyFetchFailed {
        url: String,
        #[source]
        source: Box<HlsError>,
    },

    /// Key bytes were malformed or the payload did not decrypt.
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Seek target lies beyond the known bounds of the stream.
    #[error("seek out of range")]
    SeekOutOfRange,

    /// Byte seeking requires a fully indexed on-demand stream.
    #[error("byte seek not supported: stream length unknown")]
    SeekNotSupported,

    /// Operation was cancelled by `close` or a buffer reset.
    #[error("operation cancelled")]
    Cancelled,

    /// The consumer waited for data longer than the configured read timeout.
    #[error("read timed out waiting for segment data")]
    ReadTimeout,

    /// The parsed top-level playlist yielded zero entries.
    #[error("no variants found")]
    NoVariantsFound,

    /// Errors related to invalid or unsupported playlist contents.
    #[error("invalid playlist: {0}")]
    InvalidPlaylist(String),

    /// Invalid parameters provided by the caller.
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// HTTP request failed.
    #[error("HTTP error: {status} for {url}")]
    HttpError {
        /// HTTP status code.
        status: u16,
        /// URL that failed.
        url: String,
    },

    /// Request timed out.
    #[error("request timeout for {0}")]
    Timeout(String),

    /// A fatal error recorded by the read-ahead worker, shared with every
    /// subsequent consumer call.
    #[error("{0}")]
    Fatal(#[source] Arc<HlsError>),

    /// Extra context around a lower-level HLS error.
    #[error("{context}: {source}")]
    Context {
        /// What we were doing when the error occurred.
        context: &'static str,
        /// The underlying error.
        #[source]
        source: Box<HlsError>,
    },
}

impl HlsError {
    /// Convenience helper to construct a simple message error.
    pub fn msg(msg: impl Into<String>) -> Self {
        HlsError::Message(msg.into())
    }

    /// Attach static context to an existing error.
    pub fn with_context(self, context: &'static str) -> Self {
        HlsError::Context {
            context,
            source: Box::new(self),
        }
    }

    pub(crate) fn open_failed(source: HlsError) -> Self {
        HlsError::OpenFailed(Box::new(source))
    }

    pub(crate) fn playlist_unavailable(url: impl Into<String>, source: HlsError) -> Self {
        match source {
            HlsError::Cancelled => HlsError::Cancelled,
            source => HlsError::PlaylistUnavailable {
                url: url.into(),
                source: Box::new(source),
            },
        }
    }

    pub(crate) fn key_fetch_failed(url: impl Into<String>, source: HlsError) -> Self {
        match source {
            HlsError::Cancelled => HlsError::Cancelled,
            source => HlsError::KeyFetchFailed {
                url: url.into(),
                source: Box::new(source),
            },
        }
    }

    pub(crate) fn timeout(url: impl Into<String>) -> Self {
        HlsError::Timeout(url.into())
    }

    /// Strips `Fatal` and `Context` wrappers.
    pub fn root(&self) -> &HlsError {
        match self {
            HlsError::Fatal(inner) => inner.root(),
            HlsError::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns true for cancellation, including wrapped cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), HlsError::Cancelled)
    }

    /// Transport failures worth another attempt.
    ///
    /// Parse, decryption and cancellation errors are structural and never retried.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            HlsError::Io(_) | HlsError::Timeout(_) => true,
            HlsError::HttpError { status, .. } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }
}

impl From<HlsError> for io::Error {
    fn from(err: HlsError) -> Self {
        let kind = match err.root() {
            HlsError::ReadTimeout | HlsError::Timeout(_) => io::ErrorKind::TimedOut,
            HlsError::SeekOutOfRange | HlsError::InvalidParams(_) => io::ErrorKind::InvalidInput,
            HlsError::SeekNotSupported => io::ErrorKind::Unsupported,
            HlsError::Cancelled => io::ErrorKind::Interrupted,
            HlsError::Io(e) => e.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}
