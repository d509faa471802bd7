//! Unified configuration for the `hls-readahead` crate.
//!
//! A single flat struct covers every configuration domain:
//! - transport behavior (timeouts, retries, backoff)
//! - read-ahead sizing and the consumer read timeout
//! - the segment failure policy (demotion threshold, retry budget)
//! - quality selection and ABR knobs
//! - key handling (query params, headers, key post-processing)
//!
//! URL query parameters given to [`crate::StreamSession::open`] override the
//! matching fields; see [`crate::OpenParams`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

/// Callback type used to transform raw key bytes fetched from a key server
/// before they are used for decryption. This allows custom key wrapping flows.
pub type KeyProcessorCallback = dyn Fn(Bytes) -> Bytes + Send + Sync;

/// Unified settings for a streaming session.
#[derive(Clone)]
pub struct HlsSettings {
    // ----------------------------
    // Transport
    // ----------------------------
    /// Timeout for a single HTTP operation.
    /// Default: 30 seconds.
    pub request_timeout: Duration,

    /// Maximum number of retry attempts for playlist and key requests.
    /// Default: 3 retries.
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries.
    /// Default: 100ms.
    pub retry_base_delay: Duration,

    /// Maximum backoff delay (cap for exponential growth).
    /// Default: 5 seconds.
    pub max_retry_delay: Duration,

    // ----------------------------
    // Read-ahead
    // ----------------------------
    /// Number of segments kept queued ahead of the consumer.
    /// Default: 3.
    pub read_ahead_buffers: usize,

    /// Upper bound on the media duration held in the queue.
    /// Default: 60 seconds.
    pub max_buffered_duration: Duration,

    /// How long `read` waits for data before failing with `ReadTimeout`.
    /// Default: 10 seconds.
    pub read_timeout: Duration,

    /// Optional override for how often live playlists are refreshed.
    /// If not set, half of `#EXT-X-TARGETDURATION` is used.
    pub live_refresh_interval: Option<Duration>,

    /// How many segments before the live edge a live stream starts at.
    /// Default: 3.
    pub live_start_offset_segments: usize,

    // ----------------------------
    // Failure policy
    // ----------------------------
    /// Consecutive segment failures that trigger a quality demotion (auto quality only).
    /// Default: 3.
    pub segment_failures_before_downgrade: u32,

    /// Attempts spent on one segment at one tier before the session fails.
    /// Default: 6.
    pub segment_retry_budget: u32,

    // ----------------------------
    // Quality selection
    // ----------------------------
    /// Whether the worker may switch tiers on its own.
    /// Default: true.
    pub auto_quality: bool,

    /// Starting tier index (ascending bandwidth order). `None` starts at the
    /// lowest tier in auto mode.
    pub initial_variant: Option<usize>,

    /// Requested start offset, measured from the end of the preroll.
    pub start_time: Option<Duration>,

    /// Leading portion of the stream that is skipped and excluded from reported times.
    pub preroll: Option<Duration>,

    /// Forces live (`Some(true)`) or on-demand (`Some(false)`) handling instead
    /// of deriving it from the playlist.
    pub live_hint: Option<bool>,

    /// Safety factor applied to throughput when selecting a variant.
    /// Default: 0.8.
    pub abr_throughput_safety_factor: f64,

    /// Hysteresis ratio for up-switch decisions (e.g., 0.15 = +15% headroom).
    /// Default: 0.15.
    pub abr_up_hysteresis_ratio: f64,

    /// Hysteresis ratio for down-switch decisions (e.g., 0.05 = -5% margin).
    /// Default: 0.05.
    pub abr_down_hysteresis_ratio: f64,

    /// Minimum buffered media required before an up-switch.
    /// Default: 0 (disabled gating).
    pub abr_min_buffer_for_up_switch: Duration,

    /// Minimal interval between consecutive switches to avoid oscillations.
    /// Default: 4 seconds.
    pub abr_min_switch_interval: Duration,

    // ----------------------------
    // Keys
    // ----------------------------
    /// Optional callback to post-process fetched AES keys before use.
    ///
    /// Not included in Debug output for readability.
    pub key_processor_cb: Option<Arc<Box<KeyProcessorCallback>>>,

    /// Optional query parameters appended to key fetch requests.
    pub key_query_params: Option<HashMap<String, String>>,

    /// Optional headers added to key fetch requests.
    pub key_request_headers: Option<HashMap<String, String>>,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(5),

            read_ahead_buffers: 3,
            max_buffered_duration: Duration::from_secs(60),
            read_timeout: Duration::from_secs(10),
            live_refresh_interval: None,
            live_start_offset_segments: 3,

            segment_failures_before_downgrade: 3,
            segment_retry_budget: 6,

            auto_quality: true,
            initial_variant: None,
            start_time: None,
            preroll: None,
            live_hint: None,
            abr_throughput_safety_factor: 0.8,
            abr_up_hysteresis_ratio: 0.15,
            abr_down_hysteresis_ratio: 0.05,
            abr_min_buffer_for_up_switch: Duration::ZERO,
            abr_min_switch_interval: Duration::from_secs(4),

            key_processor_cb: None,
            key_query_params: None,
            key_request_headers: None,
        }
    }
}

impl fmt::Debug for HlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not print `key_processor_cb` to keep Debug output clean.
        f.debug_struct("HlsSettings")
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("max_retry_delay", &self.max_retry_delay)
            .field("read_ahead_buffers", &self.read_ahead_buffers)
            .field("max_buffered_duration", &self.max_buffered_duration)
            .field("read_timeout", &self.read_timeout)
            .field("live_refresh_interval", &self.live_refresh_interval)
            .field(
                "live_start_offset_segments",
                &self.live_start_offset_segments,
            )
            .field(
                "segment_failures_before_downgrade",
                &self.segment_failures_before_downgrade,
            )
            .field("segment_retry_budget", &self.segment_retry_budget)
            .field("auto_quality", &self.auto_quality)
            .field("initial_variant", &self.initial_variant)
            .field("start_time", &self.start_time)
            .field("preroll", &self.preroll)
            .field("live_hint", &self.live_hint)
            .field(
                "abr_throughput_safety_factor",
                &self.abr_throughput_safety_factor,
            )
            .field("abr_up_hysteresis_ratio", &self.abr_up_hysteresis_ratio)
            .field("abr_down_hysteresis_ratio", &self.abr_down_hysteresis_ratio)
            .field(
                "abr_min_buffer_for_up_switch",
                &self.abr_min_buffer_for_up_switch,
            )
            .field("abr_min_switch_interval", &self.abr_min_switch_interval)
            .field("key_query_params", &self.key_query_params)
            .field("key_request_headers", &self.key_request_headers)
            .finish()
    }
}

impl HlsSettings {
    // -------------------------
    // Constructors
    // -------------------------

    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create settings optimized for mobile networks.
    /// - Shorter timeouts
    /// - More aggressive retries
    pub fn mobile(mut self) -> Self {
        self.request_timeout = Duration::from_secs(15);
        self.max_retries = 5;
        self.retry_base_delay = Duration::from_millis(50);
        self.max_retry_delay = Duration::from_secs(3);
        self
    }

    /// Create settings optimized for low-latency live streaming.
    /// - Shorter timeouts
    /// - Fewer retries
    /// - Smaller read-ahead window
    pub fn low_latency(mut self) -> Self {
        self.request_timeout = Duration::from_secs(5);
        self.max_retries = 1;
        self.retry_base_delay = Duration::from_millis(50);
        self.max_retry_delay = Duration::from_millis(500);
        self.read_ahead_buffers = 2;
        self.live_start_offset_segments = 2;
        self
    }

    // -------------------------
    // Transport setters
    // -------------------------

    pub fn request_timeout(mut self, v: Duration) -> Self {
        self.request_timeout = v;
        self
    }

    pub fn max_retries(mut self, v: u32) -> Self {
        self.max_retries = v;
        self
    }

    pub fn retry_base_delay(mut self, v: Duration) -> Self {
        self.retry_base_delay = v;
        self
    }

    pub fn max_retry_delay(mut self, v: Duration) -> Self {
        self.max_retry_delay = v;
        self
    }

    // -------------------------
    // Read-ahead setters
    // -------------------------

    pub fn read_ahead_buffers(mut self, v: usize) -> Self {
        self.read_ahead_buffers = v.max(1);
        self
    }

    pub fn max_buffered_duration(mut self, v: Duration) -> Self {
        self.max_buffered_duration = v;
        self
    }

    pub fn read_timeout(mut self, v: Duration) -> Self {
        self.read_timeout = v;
        self
    }

    pub fn live_refresh_interval(mut self, v: Option<Duration>) -> Self {
        self.live_refresh_interval = v;
        self
    }

    pub fn live_start_offset_segments(mut self, v: usize) -> Self {
        self.live_start_offset_segments = v;
        self
    }

    // -------------------------
    // Failure policy setters
    // -------------------------

    pub fn segment_failures_before_downgrade(mut self, v: u32) -> Self {
        self.segment_failures_before_downgrade = v;
        self
    }

    pub fn segment_retry_budget(mut self, v: u32) -> Self {
        self.segment_retry_budget = v;
        self
    }

    // -------------------------
    // Quality setters
    // -------------------------

    pub fn auto_quality(mut self, v: bool) -> Self {
        self.auto_quality = v;
        self
    }

    pub fn initial_variant(mut self, v: Option<usize>) -> Self {
        self.initial_variant = v;
        self
    }

    pub fn start_time(mut self, v: Option<Duration>) -> Self {
        self.start_time = v;
        self
    }

    pub fn preroll(mut self, v: Option<Duration>) -> Self {
        self.preroll = v;
        self
    }

    pub fn live_hint(mut self, v: Option<bool>) -> Self {
        self.live_hint = v;
        self
    }

    pub fn abr_throughput_safety_factor(mut self, v: f64) -> Self {
        self.abr_throughput_safety_factor = v;
        self
    }

    pub fn abr_up_hysteresis_ratio(mut self, v: f64) -> Self {
        self.abr_up_hysteresis_ratio = v;
        self
    }

    pub fn abr_down_hysteresis_ratio(mut self, v: f64) -> Self {
        self.abr_down_hysteresis_ratio = v;
        self
    }

    pub fn abr_min_buffer_for_up_switch(mut self, v: Duration) -> Self {
        self.abr_min_buffer_for_up_switch = v;
        self
    }

    pub fn abr_min_switch_interval(mut self, v: Duration) -> Self {
        self.abr_min_switch_interval = v;
        self
    }

    // -------------------------
    // Key setters
    // -------------------------

    pub fn key_processor_cb(mut self, cb: Option<Arc<Box<KeyProcessorCallback>>>) -> Self {
        self.key_processor_cb = cb;
        self
    }

    pub fn key_query_params(mut self, params: Option<HashMap<String, String>>) -> Self {
        self.key_query_params = params;
        self
    }

    pub fn key_request_headers(mut self, headers: Option<HashMap<String, String>>) -> Self {
        self.key_request_headers = headers;
        self
    }
}
