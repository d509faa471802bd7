//! Adaptive-bitrate HLS read-ahead streaming.
//!
//! The crate turns an HLS master or media playlist into a seekable byte
//! stream. A background worker downloads (and decrypts) segments ahead of the
//! reader into a bounded buffer, refreshes live playlists and switches quality
//! tiers, while the consumer reads through a synchronous, file-like API.
//!
//! This crate is composed of several modules:
//! - `parser`: Adapter over `hls_m3u8` producing segment descriptors and variant lists.
//! - `downloader`: HTTP/file transport for playlists, segments and keys.
//! - `keys`: Decryption key cache and AES-128 segment decryption.
//! - `playlist`: One quality tier with its segment list and cursor.
//! - `variants`: The set of tiers and quality switching.
//! - `abr`: Throughput estimation and up/down switch decisions.
//! - `buffer`: Bounded queue of downloaded segments.
//! - `worker`: The read-ahead producer task.
//! - `session`: `StreamSession`, the public byte-stream facade.
//! - `settings` / `open_params`: Configuration and URL query hints.
//! - `error`: Unified error types.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main
//! types from the internal modules to form the public API of the
//! `hls-readahead` crate.

mod abr;
mod buffer;
mod downloader;
mod error;
mod events;
mod keys;
mod open_params;
mod parser;
mod playlist;
mod session;
mod settings;
mod variants;
mod worker;

#[cfg(feature = "aes-decrypt")]
mod crypto;

#[cfg(test)]
mod testing;

pub use crate::abr::{AbrConfig, AbrController, AbrDecision, ThroughputEstimator};
pub use crate::buffer::{BufferUnit, ConsumeStatus, SegmentBuffer};
pub use crate::downloader::{ResourceDownloader, ResourceFetcher, ResourceKind};
pub use crate::error::{HlsError, HlsResult};
pub use crate::events::StreamEvent;
pub use crate::keys::SegmentKeyStore;
pub use crate::open_params::OpenParams;
pub use crate::parser::{
    ByteRange, KeyMethod, M3u8Parser, MediaPlaylist, ParsedPlaylist, PlaylistParser,
    SegmentDescriptor, SegmentKey, VariantEntry,
};
pub use crate::playlist::VariantPlaylist;
pub use crate::session::{CONTENT_TYPE, PlayerAction, StreamInfo, StreamSession};
pub use crate::settings::{HlsSettings, KeyProcessorCallback};
pub use crate::variants::{SwitchDirection, SwitchPlan, VariantSet};
pub use crate::worker::WorkerState;

#[cfg(feature = "aes-decrypt")]
pub use crate::crypto::{decrypt_aes128_cbc, iv_from_sequence};

pub use bytes::Bytes;
pub use std::time::Duration;
