//! In-memory fetcher and playlist builders shared by unit tests.

use std::collections::HashMap;
use std::fmt::Write as _;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use url::Url;

use crate::downloader::{ResourceFetcher, ResourceKind};
use crate::error::{HlsError, HlsResult};
use crate::parser::ByteRange;

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) const BASE: &str = "http://cdn.test/";

pub(crate) fn url(path: &str) -> Url {
    Url::parse(BASE).unwrap().join(path).unwrap()
}

/// Serves registered resources; `fail_next` makes a URL answer 503 a number of times.
#[derive(Default)]
pub(crate) struct MockFetcher {
    resources: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, u32>>,
    requests: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, path: &str, body: impl Into<Bytes>) {
        self.resources
            .lock()
            .insert(url(path).to_string(), body.into());
    }

    pub(crate) fn fail_next(&self, path: &str, times: u32) {
        self.failures.lock().insert(url(path).to_string(), times);
    }

    pub(crate) fn request_count(&self, path: &str) -> usize {
        let target = url(path).to_string();
        self.requests.lock().iter().filter(|u| **u == target).count()
    }
}

#[async_trait]
impl ResourceFetcher for MockFetcher {
    async fn fetch(
        &self,
        url: &Url,
        _kind: ResourceKind,
        range: Option<ByteRange>,
    ) -> HlsResult<Bytes> {
        let key = url.to_string();
        self.requests.lock().push(key.clone());

        if let Some(left) = self.failures.lock().get_mut(&key) {
            if *left > 0 {
                *left -= 1;
                return Err(HlsError::HttpError {
                    status: 503,
                    url: key,
                });
            }
        }

        let body = self
            .resources
            .lock()
            .get(&key)
            .cloned()
            .ok_or(HlsError::HttpError {
                status: 404,
                url: key,
            })?;
        Ok(match range {
            Some(r) => body.slice(r.offset as usize..(r.offset + r.length) as usize),
            None => body,
        })
    }
}

/// Media playlist with `count` segments named `{prefix}{seq}.ts`.
pub(crate) fn media_playlist(prefix: &str, first: u64, count: u64, secs: u64, ended: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#EXTM3U");
    let _ = writeln!(out, "#EXT-X-VERSION:3");
    let _ = writeln!(out, "#EXT-X-TARGETDURATION:{secs}");
    let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{first}");
    for seq in first..first + count {
        let _ = writeln!(out, "#EXTINF:{secs}.0,");
        let _ = writeln!(out, "{prefix}{seq}.ts");
    }
    if ended {
        let _ = writeln!(out, "#EXT-X-ENDLIST");
    }
    out
}

/// Segment payload recognisable by tier and sequence.
pub(crate) fn segment_body(prefix: &str, seq: u64, len: usize) -> Bytes {
    let tag = format!("{prefix}{seq}|");
    Bytes::from(tag.bytes().cycle().take(len).collect::<Vec<u8>>())
}

/// Registers a two-tier stream: `master.m3u8` with `lo/` (100k) and `hi/` (900k).
pub(crate) fn two_tier_vod(fetcher: &MockFetcher, count: u64, secs: u64, len: usize) {
    fetcher.insert(
        "master.m3u8",
        "#EXTM3U\n\
         #EXT-X-STREAM-INF:BANDWIDTH=900000\n\
         hi/index.m3u8\n\
         #EXT-X-STREAM-INF:BANDWIDTH=100000\n\
         lo/index.m3u8\n",
    );
    for tier in ["lo", "hi"] {
        fetcher.insert(
            &format!("{tier}/index.m3u8"),
            media_playlist("s", 0, count, secs, true),
        );
        for seq in 0..count {
            fetcher.insert(
                &format!("{tier}/s{seq}.ts"),
                segment_body(tier, seq, len),
            );
        }
    }
}
