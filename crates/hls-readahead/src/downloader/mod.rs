//! Transport layer used for playlists, segments and keys.
//!
//! The session only depends on the [`ResourceFetcher`] trait. The default
//! implementation, [`ResourceDownloader`], fetches whole resources over HTTP
//! (or from `file://` URLs) with timeouts, cancellation and retry/backoff.

use async_trait::async_trait;
use bytes::Bytes;
use url::Url;

use crate::error::HlsResult;
use crate::parser::ByteRange;

mod basic;

pub use basic::ResourceDownloader;

/// What a fetch is for. Drives retry behavior and key-specific headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Playlist,
    Segment,
    Key,
}

/// Whole-resource fetch. Resuming or seeking connections is not required.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &Url,
        kind: ResourceKind,
        range: Option<ByteRange>,
    ) -> HlsResult<Bytes>;
}
