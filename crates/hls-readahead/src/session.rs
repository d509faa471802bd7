//! Public byte-stream facade over the read-ahead pipeline.
//!
//! A [`StreamSession`] owns a small dedicated tokio runtime that drives the
//! [`ReadAheadWorker`](crate::worker); every public method is synchronous and
//! safe to call from a plain playback thread. Do not call them from inside an
//! async context: they block on the session runtime.

use std::io::{self, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::buffer::ConsumeStatus;
use crate::downloader::{ResourceDownloader, ResourceFetcher};
use crate::error::{HlsError, HlsResult};
use crate::events::StreamEvent;
use crate::keys::SegmentKeyStore;
use crate::open_params::OpenParams;
use crate::parser::{M3u8Parser, PlaylistParser};
use crate::settings::HlsSettings;
use crate::variants::{SwitchDirection, VariantSet};
use crate::worker::{
    PipelineState, ReadAheadWorker, Shared, WorkerState, initial_state, switch_variant,
};

/// MIME type of the produced byte stream.
pub const CONTENT_TYPE: &str = "video/MP2T";

/// Player-level commands routed through [`StreamSession::on_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerAction {
    QualityUp,
    QualityDown,
    SeekForward(Duration),
    SeekBackward(Duration),
}

/// Summary returned by [`StreamSession::stat`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub is_live: bool,
    /// Duration of the initial tier, preroll excluded. Zero for an unloaded live window.
    pub total_time: Duration,
    pub variant_count: usize,
    /// Byte length when every segment size is declared by the playlist.
    pub length: Option<u64>,
}

/// Everything resolved before the worker starts.
struct Prepared {
    variants: VariantSet,
    next_sequence: u64,
    clock: Duration,
    position: u64,
    is_live: bool,
}

pub struct StreamSession {
    runtime: Option<Runtime>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    fetcher: Arc<dyn ResourceFetcher>,
    parser: Arc<dyn PlaylistParser>,
    params: OpenParams,
    url: Url,
    is_live: bool,
    preroll: Duration,
    read_timeout: Duration,
    closed: bool,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("url", &self.url.as_str())
            .field("is_live", &self.is_live)
            .field("preroll", &self.preroll)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Opens `url` with the default HTTP/file downloader and `hls_m3u8` parser.
    ///
    /// Recognised query parameters (see [`OpenParams`]) override `settings`.
    pub fn open(url: &str, settings: HlsSettings) -> HlsResult<Self> {
        let params = OpenParams::parse(url).map_err(HlsError::open_failed)?;
        let settings = params.apply_to(settings);
        let cancel = CancellationToken::new();
        let fetcher = Arc::new(ResourceDownloader::from_settings(&settings, cancel.clone()));
        Self::start(params, settings, fetcher, Arc::new(M3u8Parser), cancel)
    }

    /// Opens `url` with caller-provided transport and parser.
    pub fn open_with(
        url: &str,
        settings: HlsSettings,
        fetcher: Arc<dyn ResourceFetcher>,
        parser: Arc<dyn PlaylistParser>,
    ) -> HlsResult<Self> {
        let params = OpenParams::parse(url).map_err(HlsError::open_failed)?;
        let settings = params.apply_to(settings);
        Self::start(params, settings, fetcher, parser, CancellationToken::new())
    }

    /// Returns true when the top-level playlist at `url` can be fetched and parsed.
    pub fn exists(url: &str, settings: HlsSettings) -> bool {
        Self::stat(url, settings).is_ok()
    }

    /// Loads the playlists of `url` without starting a session.
    pub fn stat(url: &str, settings: HlsSettings) -> HlsResult<StreamInfo> {
        let params = OpenParams::parse(url)?;
        let settings = params.apply_to(settings);
        let playlist_url = playlist_url(&params)?;
        let runtime = build_runtime()?;
        let cancel = CancellationToken::new();
        let fetcher = ResourceDownloader::from_settings(&settings, cancel.clone());

        let prepared = runtime.block_on(prepare(&playlist_url, &settings, &fetcher, &M3u8Parser));
        cancel.cancel();
        runtime.shutdown_background();

        let prepared = prepared?;
        let preroll = settings.preroll.unwrap_or_default();
        let tier = prepared.variants.current();
        Ok(StreamInfo {
            is_live: prepared.is_live,
            total_time: tier.total_duration().saturating_sub(preroll),
            variant_count: prepared.variants.len(),
            length: if prepared.is_live {
                None
            } else {
                tier.byte_length()
            },
        })
    }

    fn start(
        params: OpenParams,
        settings: HlsSettings,
        fetcher: Arc<dyn ResourceFetcher>,
        parser: Arc<dyn PlaylistParser>,
        cancel: CancellationToken,
    ) -> HlsResult<Self> {
        let url = playlist_url(&params).map_err(HlsError::open_failed)?;
        let runtime = build_runtime().map_err(HlsError::open_failed)?;

        let prepared = runtime
            .block_on(prepare(&url, &settings, &*fetcher, &*parser))
            .map_err(HlsError::open_failed)?;
        let is_live = prepared.is_live;

        let mut state = initial_state(
            prepared.variants,
            &settings,
            prepared.next_sequence,
            prepared.clock,
        );
        state.position = prepared.position;
        let shared = Arc::new(Shared::new(state, cancel));

        let keys = Arc::new(SegmentKeyStore::from_settings(fetcher.clone(), &settings));
        let worker = ReadAheadWorker::new(
            shared.clone(),
            fetcher.clone(),
            parser.clone(),
            keys,
            &settings,
        );
        let handle = runtime.spawn(worker.run());

        info!(
            url = %url,
            is_live,
            start_sequence = prepared.next_sequence,
            "hls session opened"
        );
        Ok(Self {
            runtime: Some(runtime),
            shared,
            worker: Some(handle),
            fetcher,
            parser,
            params,
            url,
            is_live,
            preroll: settings.preroll.unwrap_or_default(),
            read_timeout: settings.read_timeout,
            closed: false,
        })
    }

    /// Copies the next queued bytes into `buf`.
    ///
    /// Blocks, bounded by the configured read timeout, while nothing is queued.
    /// `Ok(0)` means the stream is finished; a stall is reported as
    /// [`HlsError::ReadTimeout`] instead.
    pub fn read(&mut self, buf: &mut [u8]) -> HlsResult<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + self.read_timeout;
        let mut st = self.shared.state.lock();
        let mut timed_out = false;
        loop {
            if let Some(err) = &st.fatal {
                return Err(HlsError::Fatal(err.clone()));
            }
            let queued = st.buffer.len();
            match st.buffer.consume(buf) {
                ConsumeStatus::Data(n) => {
                    st.position += n as u64;
                    if let Some((_, offset)) = st.buffer.last_started() {
                        st.clock = offset;
                    }
                    let freed = st.buffer.len() < queued;
                    drop(st);
                    if freed {
                        self.shared.wake_producer();
                    }
                    return Ok(n);
                }
                ConsumeStatus::EndOfStream => return Ok(0),
                ConsumeStatus::WouldBlock if timed_out => return Err(HlsError::ReadTimeout),
                ConsumeStatus::WouldBlock => {
                    timed_out = self
                        .shared
                        .data_ready
                        .wait_until(&mut st, deadline)
                        .timed_out();
                }
            }
        }
    }

    /// Byte seek. Only available once the total length is known.
    pub fn seek(&mut self, pos: SeekFrom) -> HlsResult<u64> {
        self.ensure_open()?;
        let mut st = self.shared.state.lock();
        if pos == SeekFrom::Current(0) {
            return Ok(st.position);
        }
        let total = if self.is_live {
            None
        } else {
            st.variants.current().byte_length()
        };
        let Some(total) = total else {
            return Err(HlsError::SeekNotSupported);
        };

        let target = match pos {
            SeekFrom::Start(n) => i128::from(n),
            SeekFrom::Current(d) => i128::from(st.position) + i128::from(d),
            SeekFrom::End(d) => i128::from(total) + i128::from(d),
        };
        if target < 0 || target > i128::from(total) {
            return Err(HlsError::SeekOutOfRange);
        }
        let target = target as u64;

        let tier = st.variants.current();
        let (sequence, intra) = match tier.locate_byte(target) {
            Some(hit) => hit,
            // Seeking to the very end: nothing left to fetch.
            None => (tier.last_sequence().map_or(0, |s| s + 1), 0),
        };
        reposition(&mut st, sequence);
        st.buffer.skip_next(intra as usize);
        st.position = target;
        drop(st);

        debug!(target, sequence, intra, "byte seek");
        self.shared.wake_producer();
        Ok(target)
    }

    /// Moves playback to `t` (relative to the end of the preroll).
    ///
    /// Fails with [`HlsError::SeekOutOfRange`], leaving the state untouched,
    /// when `t` lies beyond the known segments.
    pub fn seek_to_time(&mut self, t: Duration) -> HlsResult<()> {
        self.ensure_open()?;
        let target = t + self.preroll;
        let mut st = self.shared.state.lock();
        let Some(sequence) = st.variants.current().sequence_at_time(target) else {
            return Err(HlsError::SeekOutOfRange);
        };
        reposition(&mut st, sequence);
        st.position = st.variants.current().byte_offset_of(sequence).unwrap_or(0);
        drop(st);

        debug!(?t, sequence, "time seek");
        self.shared.wake_producer();
        Ok(())
    }

    /// Total byte length; `None` for live streams and while sizes are unknown.
    pub fn length(&self) -> Option<u64> {
        if self.is_live {
            return None;
        }
        self.shared.state.lock().variants.current().byte_length()
    }

    pub fn position(&self) -> u64 {
        self.shared.state.lock().position
    }

    /// Program date of the first known segment as unix seconds, 0 when absent.
    pub fn start_time(&self) -> i64 {
        self.shared.state.lock().variants.current().start_date()
    }

    /// [`start_time`](Self::start_time) as a UTC timestamp.
    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        match self.start_time() {
            0 => None,
            secs => DateTime::from_timestamp(secs, 0),
        }
    }

    /// Playback offset of the data being read, relative to the end of the preroll.
    pub fn current_time(&self) -> Duration {
        self.shared.state.lock().clock.saturating_sub(self.preroll)
    }

    pub fn total_time(&self) -> Duration {
        self.shared
            .state
            .lock()
            .variants
            .current()
            .total_duration()
            .saturating_sub(self.preroll)
    }

    /// True once the active playlist is finished and every queued byte was read.
    pub fn is_eof(&self) -> bool {
        let st = self.shared.state.lock();
        st.fatal.is_none()
            && st.buffer.is_end_of_stream()
            && st.buffer.is_empty()
            && st.variants.current().is_finished()
    }

    pub fn is_live(&self) -> bool {
        self.is_live
    }

    pub fn inc_quality(&mut self) -> HlsResult<bool> {
        self.change_quality(SwitchDirection::Up)
    }

    pub fn dec_quality(&mut self) -> HlsResult<bool> {
        self.change_quality(SwitchDirection::Down)
    }

    /// A manual change that takes effect pins the quality: automatic
    /// switching is turned off. A no-op at a tier bound changes nothing.
    fn change_quality(&mut self, direction: SwitchDirection) -> HlsResult<bool> {
        let runtime = self.ensure_open()?;
        let switched = runtime.block_on(switch_variant(
            &self.shared,
            &*self.fetcher,
            &*self.parser,
            direction,
        ))?;
        if switched {
            self.shared.state.lock().auto_quality = false;
        }
        Ok(switched)
    }

    pub fn current_variant(&self) -> usize {
        self.shared.state.lock().variants.current_index()
    }

    pub fn variant_count(&self) -> usize {
        self.shared.state.lock().variants.len()
    }

    pub fn auto_quality(&self) -> bool {
        self.shared.state.lock().auto_quality
    }

    /// Adjusts the number of queued segments (minimum 1).
    pub fn set_read_ahead_buffers(&self, n: usize) {
        self.shared.state.lock().buffer.set_capacity(n);
        self.shared.wake_producer();
    }

    /// Returns and clears whether the consumer has crossed a decoder-reset
    /// boundary (quality switch, discontinuity or seek) since the last call.
    pub fn take_decoder_reset(&self) -> bool {
        self.shared.state.lock().buffer.take_decoder_reset()
    }

    pub fn content_type(&self) -> &'static str {
        CONTENT_TYPE
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.params.fingerprint.as_deref()
    }

    pub fn key_server_params(&self) -> Option<&str> {
        self.params.key_server_params.as_deref()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn worker_state(&self) -> WorkerState {
        self.shared.state.lock().worker_state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.shared.events.subscribe()
    }

    /// Routes a player command. Returns whether it took effect.
    pub fn on_action(&mut self, action: PlayerAction) -> bool {
        let res = match action {
            PlayerAction::QualityUp => self.inc_quality(),
            PlayerAction::QualityDown => self.dec_quality(),
            PlayerAction::SeekForward(d) => {
                let t = self.current_time() + d;
                self.seek_to_time(t).map(|_| true)
            }
            PlayerAction::SeekBackward(d) => {
                let t = self.current_time().saturating_sub(d);
                self.seek_to_time(t).map(|_| true)
            }
        };
        match res {
            Ok(handled) => handled,
            Err(e) => {
                debug!(?action, error = %e, "player action rejected");
                false
            }
        }
    }

    /// Stops the worker, waits for it to exit and drops all queued data.
    ///
    /// Calling it again is a no-op.
    pub fn close(&mut self) -> HlsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.shared.state.lock().worker_state = WorkerState::Stopping;
        self.shared.cancel.cancel();
        self.shared.wake_producer();

        if let Some(runtime) = self.runtime.take() {
            if let Some(handle) = self.worker.take() {
                if let Err(e) = runtime.block_on(handle) {
                    error!(error = %e, "read-ahead worker did not exit cleanly");
                }
            }
            runtime.shutdown_background();
        }

        {
            let mut st = self.shared.state.lock();
            st.buffer.reset();
            st.worker_state = WorkerState::Stopped;
        }
        self.shared.data_ready.notify_all();
        debug!(url = %self.url, "hls session closed");
        Ok(())
    }

    fn ensure_open(&self) -> HlsResult<&Runtime> {
        match &self.runtime {
            Some(rt) if !self.closed => Ok(rt),
            _ => Err(HlsError::Cancelled),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
        self.shared.wake_producer();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl io::Read for StreamSession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        StreamSession::read(self, buf).map_err(io::Error::from)
    }
}

impl io::Seek for StreamSession {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        StreamSession::seek(self, pos).map_err(io::Error::from)
    }
}

/// Points the pipeline at `sequence`: queued units are discarded, in-flight
/// ones invalidated, and the next unit carries the decoder-reset flag.
fn reposition(st: &mut PipelineState, sequence: u64) {
    st.buffer.reset();
    st.next_sequence = sequence;
    st.variants.mark_decoder_reset();
    let tier = st.variants.current_mut();
    tier.set_position(sequence);
    if let Some(offset) = tier.time_offset_of(sequence) {
        st.clock = offset;
    }
}

fn playlist_url(params: &OpenParams) -> HlsResult<Url> {
    params
        .playlist_url
        .clone()
        .ok_or(HlsError::InvalidParams("url"))
}

fn build_runtime() -> HlsResult<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("hls-readahead")
        .enable_all()
        .build()
        .map_err(HlsError::Io)
}

/// Loads the variant set and the starting tier and picks the first sequence.
async fn prepare(
    url: &Url,
    settings: &HlsSettings,
    fetcher: &dyn ResourceFetcher,
    parser: &dyn PlaylistParser,
) -> HlsResult<Prepared> {
    let mut variants = VariantSet::build_from_master(url, fetcher, parser).await?;
    variants.select_initial(settings.auto_quality, settings.initial_variant);
    if !variants.current().is_loaded() {
        variants.current_mut().load(fetcher, parser).await?;
    }

    let tier = variants.current_mut();
    let is_live = settings.live_hint.unwrap_or_else(|| tier.can_grow());
    let preroll = settings.preroll.unwrap_or_default();
    let start = preroll + settings.start_time.unwrap_or_default();

    let next_sequence = if !start.is_zero() {
        tier.sequence_at_time(start).ok_or(HlsError::SeekOutOfRange)?
    } else if is_live {
        let index = tier.len().saturating_sub(settings.live_start_offset_segments);
        match tier.segment(index) {
            Some(seg) => seg.sequence,
            None => tier.first_sequence().unwrap_or(0),
        }
    } else {
        tier.first_sequence().unwrap_or(0)
    };
    tier.set_position(next_sequence);

    Ok(Prepared {
        clock: tier.time_offset_of(next_sequence).unwrap_or_default(),
        position: tier.byte_offset_of(next_sequence).unwrap_or(0),
        next_sequence,
        is_live,
        variants,
    })
}
