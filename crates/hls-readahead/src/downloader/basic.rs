use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use super::{ResourceFetcher, ResourceKind};
use crate::error::{HlsError, HlsResult};
use crate::parser::ByteRange;
use crate::settings::HlsSettings;

/// HTTP resource downloader for playlists, segments and keys.
///
/// Supports cancellation and bounded retries/backoff. `request_timeout` acts like a
/// progress/idle timeout while the body is collected.
///
/// Playlists and keys are retried here. Segments get a single attempt per call:
/// the read-ahead worker owns the segment retry and demotion policy.
#[derive(Debug, Clone)]
pub struct ResourceDownloader {
    client: reqwest::Client,

    // Request / retry configuration.
    request_timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
    max_retry_delay: Duration,

    // Cancellation token used for all network operations performed by this downloader.
    cancel: CancellationToken,

    // Optional headers to attach to KEY fetch requests.
    key_request_headers: Option<HashMap<String, String>>,
}

impl ResourceDownloader {
    /// Creates a new downloader.
    pub fn new(
        request_timeout: Duration,
        max_retries: u32,
        retry_base_delay: Duration,
        max_retry_delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
            max_retries,
            retry_base_delay,
            max_retry_delay,
            cancel,
            key_request_headers: None,
        }
    }

    /// Creates a downloader configured from session settings.
    pub fn from_settings(settings: &HlsSettings, cancel: CancellationToken) -> Self {
        Self::new(
            settings.request_timeout,
            settings.max_retries,
            settings.retry_base_delay,
            settings.max_retry_delay,
            cancel,
        )
        .with_key_request_headers(settings.key_request_headers.clone())
    }

    /// Sets optional headers used for key fetch requests.
    pub fn with_key_request_headers(mut self, headers: Option<HashMap<String, String>>) -> Self {
        self.key_request_headers = headers;
        self
    }

    // ----------------------------
    // Internals: retry policy
    // ----------------------------

    async fn retry_with_backoff<T, F, Fut>(
        &self,
        url: &Url,
        op_name: &str,
        mut f: F,
    ) -> HlsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = HlsResult<T>>,
    {
        let mut last_error: Option<HlsError> = None;
        let mut delay = self.retry_base_delay;

        for attempt in 0..=self.max_retries {
            if self.cancel.is_cancelled() {
                return Err(HlsError::Cancelled);
            }

            match f().await {
                Ok(v) => {
                    if attempt > 0 {
                        debug!(
                            url = %url,
                            attempts = attempt + 1,
                            operation = op_name,
                            "download succeeded after retry"
                        );
                    }
                    return Ok(v);
                }
                Err(HlsError::Cancelled) => return Err(HlsError::Cancelled),
                Err(e) => {
                    debug!(
                        url = %url,
                        attempt = attempt + 1,
                        max_attempts = self.max_retries + 1,
                        operation = op_name,
                        "download attempt failed: {}",
                        e
                    );
                    let retryable = e.is_retryable();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }

                    if attempt < self.max_retries {
                        tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => return Err(HlsError::Cancelled),
                            _ = tokio::time::sleep(delay) => {},
                        }
                        delay = (delay * 2).min(self.max_retry_delay);
                    }
                }
            }
        }

        debug!(url = %url, operation = op_name, "download giving up");

        Err(last_error.unwrap_or_else(|| HlsError::msg("download failed with no error")))
    }

    // ----------------------------
    // Internals: request attempts
    // ----------------------------

    fn build_key_headers(&self) -> HlsResult<HeaderMap> {
        let mut headers = HeaderMap::new();

        if let Some(h) = &self.key_request_headers {
            for (k, v) in h {
                let name = HeaderName::from_bytes(k.as_bytes()).map_err(|e| {
                    HlsError::msg(format!("invalid header name `{}`: {}", k, e))
                })?;
                let value = HeaderValue::from_str(v).map_err(|e| {
                    HlsError::msg(format!("invalid header value for `{}`: {}", k, e))
                })?;
                headers.insert(name, value);
            }
        }

        Ok(headers)
    }

    async fn try_fetch_once(
        &self,
        url: &Url,
        kind: ResourceKind,
        range: Option<ByteRange>,
    ) -> HlsResult<Bytes> {
        if url.scheme() == "file" {
            return Self::read_file(url, range).await;
        }

        let mut headers = if kind == ResourceKind::Key {
            self.build_key_headers()?
        } else {
            HeaderMap::new()
        };
        if let Some(r) = range {
            let end = r.offset + r.length.saturating_sub(1);
            let value = HeaderValue::from_str(&format!("bytes={}-{}", r.offset, end))
                .map_err(|e| HlsError::msg(e.to_string()))?;
            headers.insert(RANGE, value);
        }

        // Creation is cancellable: if the downloader token is cancelled while we're
        // waiting for response headers, abort early.
        let send_fut = timeout(
            self.request_timeout,
            self.client.get(url.clone()).headers(headers).send(),
        );
        let res = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(HlsError::Cancelled),
            res = send_fut => res,
        };

        let response = match res {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(HlsError::timeout(url.as_str())),
            Ok(Err(e)) => {
                return Err(HlsError::Io(std::io::Error::other(format!(
                    "request failed (url={}): {}",
                    url, e
                ))));
            }
            Err(_) => return Err(HlsError::timeout(url.as_str())),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(HlsError::HttpError {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        Self::collect_stream_to_bytes(
            Box::pin(response.bytes_stream()),
            &self.cancel,
            Some(self.request_timeout),
            url.as_str(),
        )
        .await
    }

    async fn read_file(url: &Url, range: Option<ByteRange>) -> HlsResult<Bytes> {
        let path = url
            .to_file_path()
            .map_err(|_| HlsError::msg(format!("invalid file url: {}", url)))?;
        let data = Bytes::from(tokio::fs::read(path).await?);
        match range {
            None => Ok(data),
            Some(r) => {
                let start = usize::try_from(r.offset).unwrap_or(usize::MAX);
                let end = usize::try_from(r.offset + r.length).unwrap_or(usize::MAX);
                if end > data.len() || start > end {
                    return Err(HlsError::msg(format!("byte range out of bounds: {}", url)));
                }
                Ok(data.slice(start..end))
            }
        }
    }

    async fn collect_stream_to_bytes<S, E>(
        mut stream: S,
        cancel: &CancellationToken,
        idle_timeout: Option<Duration>,
        url: &str,
    ) -> HlsResult<Bytes>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut buf = BytesMut::with_capacity(16 * 1024);

        loop {
            // Support cancellation while reading, and optionally enforce an idle timeout
            // (no new chunks within the timeout window).
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HlsError::Cancelled),
                item = async {
                    if let Some(d) = idle_timeout {
                        tokio::time::timeout(d, stream.next()).await.map_err(|_| ())
                    } else {
                        Ok(stream.next().await)
                    }
                } => {
                    match item {
                        Ok(v) => v,
                        Err(()) => return Err(HlsError::timeout(url)),
                    }
                },
            };

            match next {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    return Err(HlsError::Io(std::io::Error::other(format!(
                        "stream read error (url={}): {}",
                        url, e
                    ))));
                }
                None => break,
            }
        }

        Ok(buf.freeze())
    }
}

#[async_trait]
impl ResourceFetcher for ResourceDownloader {
    async fn fetch(
        &self,
        url: &Url,
        kind: ResourceKind,
        range: Option<ByteRange>,
    ) -> HlsResult<Bytes> {
        match kind {
            ResourceKind::Segment => self.try_fetch_once(url, kind, range).await,
            ResourceKind::Playlist => {
                self.retry_with_backoff(url, "playlist", || self.try_fetch_once(url, kind, range))
                    .await
            }
            ResourceKind::Key => {
                self.retry_with_backoff(url, "key", || self.try_fetch_once(url, kind, range))
                    .await
            }
        }
    }
}
