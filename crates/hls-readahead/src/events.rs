//! Out-of-band notifications published by a running session.

use std::sync::Arc;
use std::time::Duration;

use crate::error::HlsError;

/// Events emitted by the read-ahead pipeline.
///
/// Delivered over a `tokio::sync::broadcast` channel; slow subscribers lose
/// the oldest events rather than stalling the worker.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    /// The active tier changed. Units enqueued from now on come from `to`.
    VariantChanged {
        from: usize,
        to: usize,
        bandwidth: u64,
        codecs: Option<String>,
    },
    /// A segment was downloaded and queued for the reader.
    SegmentQueued {
        variant: usize,
        sequence: u64,
        byte_len: u64,
        duration: Duration,
    },
    /// A live playlist was reloaded.
    PlaylistRefreshed { variant: usize, segments: usize },
    /// The producer has queued the last segment of a finished playlist.
    EndOfStream,
    /// The worker stopped on an unrecoverable error.
    Error(Arc<HlsError>),
}
