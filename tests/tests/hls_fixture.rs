//! In-process HLS origin for integration tests.
//!
//! Layout served under the returned base URL:
//! - `master.m3u8`: two variants, `v0.m3u8` (128 kbit/s) and `v1.m3u8` (2.56 Mbit/s);
//! - `v{n}.m3u8`: on-demand playlists of `SEGMENT_COUNT` one-second segments
//!   `seg/v{n}_{i}.bin`, sequence numbers aligned across variants;
//! - `enc.m3u8`: AES-128 encrypted copy of `v0`, key at `key.bin`;
//! - `live.m3u8`: a growing playlist driven by [`HlsFixture::set_live_segments`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aes::Aes128;
use axum::Router;
use axum::extract::{Path, RawQuery};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use cbc::Encryptor;
use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};
use url::Url;

pub const SEGMENT_COUNT: usize = 12;
/// Large enough for the throughput estimator to take samples.
pub const SEGMENT_LEN: usize = 4096;
pub const KEY: [u8; 16] = *b"0123456789abcdef";

/// One request to `key.bin`: the raw query string and the `X-Fingerprint` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRequest {
    pub query: Option<String>,
    pub fingerprint: Option<String>,
}

#[derive(Clone)]
struct FixtureState {
    blobs: Arc<Mutex<HashMap<String, Bytes>>>,
    request_counts: Arc<Mutex<HashMap<String, u64>>>,
    /// Remaining 503 answers per path.
    failures: Arc<Mutex<HashMap<String, u32>>>,
    key_requests: Arc<Mutex<Vec<KeyRequest>>>,
    slow_prefix: Option<(String, Duration)>,
}

pub struct HlsFixture {
    state: FixtureState,
}

impl Default for HlsFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl HlsFixture {
    pub fn new() -> Self {
        let mut blobs = HashMap::new();
        put_master(&mut blobs);
        for v in 0..2 {
            blobs.insert(
                format!("v{v}.m3u8"),
                Bytes::from(media_playlist(&format!("seg/v{v}_"), 0, SEGMENT_COUNT, true, false)),
            );
            for i in 0..SEGMENT_COUNT {
                blobs.insert(format!("seg/v{v}_{i}.bin"), segment_payload(v, i));
            }
        }
        blobs.insert(
            "enc.m3u8".to_string(),
            Bytes::from(media_playlist("seg/enc_", 0, SEGMENT_COUNT, true, true)),
        );
        for i in 0..SEGMENT_COUNT {
            blobs.insert(format!("seg/enc_{i}.bin"), encrypt(&segment_payload(0, i), i as u64));
        }
        blobs.insert("key.bin".to_string(), Bytes::from_static(&KEY));

        Self {
            state: FixtureState {
                blobs: Arc::new(Mutex::new(blobs)),
                request_counts: Arc::new(Mutex::new(HashMap::new())),
                failures: Arc::new(Mutex::new(HashMap::new())),
                key_requests: Arc::new(Mutex::new(Vec::new())),
                slow_prefix: None,
            },
        }
    }

    /// Delays every response whose path starts with `prefix` (e.g. `seg/v1_`).
    pub fn with_slow_prefix(mut self, prefix: &str, delay: Duration) -> Self {
        self.state.slow_prefix = Some((prefix.to_string(), delay));
        self
    }

    /// Answers the next `times` requests for `path` with 503.
    pub fn fail_next(&self, path: &str, times: u32) {
        self.state
            .failures
            .lock()
            .unwrap()
            .insert(path.to_string(), times);
    }

    /// Publishes the first `count` live segments; `ended` appends `#EXT-X-ENDLIST`.
    pub fn set_live_segments(&self, count: usize, ended: bool) {
        let mut blobs = self.state.blobs.lock().unwrap();
        blobs.insert(
            "live.m3u8".to_string(),
            Bytes::from(media_playlist("seg/v0_", 0, count, ended, false)),
        );
    }

    pub fn request_count_for(&self, path: &str) -> u64 {
        let p = path.trim_start_matches('/');
        *self.state.request_counts.lock().unwrap().get(p).unwrap_or(&0)
    }

    pub fn key_requests(&self) -> Vec<KeyRequest> {
        self.state.key_requests.lock().unwrap().clone()
    }

    /// Starts the server on `127.0.0.1:0` and returns the base URL (ending with `/`).
    pub async fn start(&self) -> Url {
        let app = build_router(self.state.clone());

        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .expect("failed to bind local fixture server");
        listener
            .set_nonblocking(true)
            .expect("failed to set nonblocking on fixture listener");
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener)
                .expect("failed to convert fixture listener to tokio listener");
            axum::serve(listener, app).await.unwrap();
        });

        Url::parse(&format!("http://{addr}/")).expect("failed to build base url")
    }
}

/// Plain payload of segment `i` of variant `v`, padded to `SEGMENT_LEN`.
pub fn segment_payload(v: usize, i: usize) -> Bytes {
    let tag = format!("V{v}-SEG-{i:03}|");
    Bytes::from(tag.bytes().cycle().take(SEGMENT_LEN).collect::<Vec<u8>>())
}

/// Concatenated payloads of variant `v`.
pub fn variant_bytes(v: usize) -> Vec<u8> {
    (0..SEGMENT_COUNT)
        .flat_map(|i| segment_payload(v, i).to_vec())
        .collect()
}

fn encrypt(plain: &[u8], sequence: u64) -> Bytes {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&sequence.to_be_bytes());
    let data =
        Encryptor::<Aes128>::new(&KEY.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plain);
    Bytes::from(data)
}

fn put_master(blobs: &mut HashMap<String, Bytes>) {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n\n");
    for (v, bw) in [(0, 128_000), (1, 2_560_000)] {
        out.push_str(&format!("#EXT-X-STREAM-INF:BANDWIDTH={bw}\n"));
        out.push_str(&format!("v{v}.m3u8\n"));
    }
    blobs.insert("master.m3u8".to_string(), Bytes::from(out));
}

fn media_playlist(seg_prefix: &str, first: usize, count: usize, ended: bool, encrypted: bool) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:3\n");
    out.push_str("#EXT-X-TARGETDURATION:1\n");
    out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{first}\n"));
    if encrypted {
        out.push_str("#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"\n");
    }
    for i in first..first + count {
        out.push_str("#EXTINF:1.0,\n");
        out.push_str(&format!("{seg_prefix}{i}.bin\n"));
    }
    if ended {
        out.push_str("#EXT-X-ENDLIST\n");
    }
    out
}

async fn serve_blob(
    key: String,
    query: Option<String>,
    headers: HeaderMap,
    state: FixtureState,
) -> impl IntoResponse {
    *state
        .request_counts
        .lock()
        .unwrap()
        .entry(key.clone())
        .or_insert(0) += 1;

    if key == "key.bin" {
        state.key_requests.lock().unwrap().push(KeyRequest {
            query,
            fingerprint: headers
                .get("x-fingerprint")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        });
    }

    if let Some((prefix, delay)) = &state.slow_prefix {
        if key.starts_with(prefix.as_str()) {
            tokio::time::sleep(*delay).await;
        }
    }

    let fail = {
        let mut failures = state.failures.lock().unwrap();
        match failures.get_mut(&key) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    };
    if fail {
        return (StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), Bytes::new());
    }

    let Some(bytes) = state.blobs.lock().unwrap().get(&key).cloned() else {
        return (StatusCode::NOT_FOUND, HeaderMap::new(), Bytes::new());
    };

    let mut out_headers = HeaderMap::new();
    out_headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static(if key.ends_with(".m3u8") {
            "application/vnd.apple.mpegurl"
        } else {
            "application/octet-stream"
        }),
    );
    out_headers.insert(
        axum::http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    (StatusCode::OK, out_headers, bytes)
}

// - "/seg/{name}" maps to "seg/<name>"
// - "/{path}" serves everything else (playlists, key.bin)
fn build_router(state: FixtureState) -> Router {
    Router::new()
        .route(
            "/seg/{name}",
            get({
                let state = state.clone();
                move |Path(name): Path<String>, headers: HeaderMap| {
                    serve_blob(format!("seg/{name}"), None, headers, state.clone())
                }
            }),
        )
        .route(
            "/{path}",
            get({
                let state = state.clone();
                move |Path(path): Path<String>, RawQuery(query): RawQuery, headers: HeaderMap| {
                    serve_blob(path, query, headers, state.clone())
                }
            }),
        )
}
