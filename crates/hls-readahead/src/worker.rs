//! Background producer that keeps the segment buffer filled.
//!
//! The worker and the session share one [`Shared`] value. Every field of
//! [`PipelineState`] is read and written under its mutex; the lock is never
//! held across an `.await`. The consumer sleeps on the `data_ready` condvar,
//! the worker on the `wake` notifier.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace};
use url::Url;

use crate::abr::{AbrConfig, AbrController, AbrDecision};
use crate::buffer::{BufferUnit, SegmentBuffer};
use crate::downloader::{ResourceFetcher, ResourceKind};
use crate::error::{HlsError, HlsResult};
use crate::events::StreamEvent;
use crate::keys::SegmentKeyStore;
use crate::parser::{PlaylistParser, SegmentDescriptor};
use crate::playlist::VariantPlaylist;
use crate::settings::HlsSettings;
use crate::variants::{SwitchDirection, VariantSet};

/// Lifecycle of the read-ahead task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// State guarded by the session lock.
#[derive(Debug)]
pub(crate) struct PipelineState {
    pub variants: VariantSet,
    pub buffer: SegmentBuffer,
    /// Sequence number the worker fetches next.
    pub next_sequence: u64,
    pub auto_quality: bool,
    pub worker_state: WorkerState,
    /// Set once the worker gave up; every later read reports it.
    pub fatal: Option<Arc<HlsError>>,
    /// Bytes handed to the consumer since the last seek target.
    pub position: u64,
    /// Playback offset of the data the consumer is reading.
    pub clock: Duration,
    pub last_refresh: Option<Instant>,
}

pub(crate) struct Shared {
    pub state: Mutex<PipelineState>,
    pub data_ready: Condvar,
    pub wake: Notify,
    pub cancel: CancellationToken,
    pub events: broadcast::Sender<StreamEvent>,
}

impl Shared {
    pub fn new(state: PipelineState, cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(state),
            data_ready: Condvar::new(),
            wake: Notify::new(),
            cancel,
            events,
        }
    }

    pub fn emit(&self, event: StreamEvent) {
        let _ = self.events.send(event);
    }

    /// Wakes the producer if it is waiting for space, a seek or shutdown.
    pub fn wake_producer(&self) {
        self.wake.notify_one();
    }
}

/// Outcome of one [`ReadAheadWorker::read_ahead`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Queued(u64),
    Refreshed,
    Switched,
    /// Waited for space, a refresh interval or a retry delay.
    Waited,
    EndOfStream,
    /// The active tier has no segments at all; nothing was done.
    Empty,
}

enum Plan {
    Fetch {
        segment: Arc<SegmentDescriptor>,
        variant: usize,
        time_offset: Duration,
        decoder_reset: bool,
        epoch: u64,
    },
    Refresh {
        variant: usize,
        uri: Url,
        wait: Duration,
    },
    End,
    Empty,
}

/// Moves the active tier one step, fetching the target playlist if needed.
///
/// Shared by the worker (ABR and failure demotion) and the session (manual
/// quality changes).
pub(crate) async fn switch_variant(
    shared: &Shared,
    fetcher: &dyn ResourceFetcher,
    parser: &dyn PlaylistParser,
    direction: SwitchDirection,
) -> HlsResult<bool> {
    let Some(plan) = shared.state.lock().variants.plan_switch(direction) else {
        return Ok(false);
    };

    let loaded = if plan.needs_load {
        let media = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Err(HlsError::Cancelled),
            media = VariantPlaylist::fetch(&plan.uri, fetcher, parser) => media?,
        };
        Some(media)
    } else {
        None
    };

    let event = {
        let mut st = shared.state.lock();
        if !st.variants.commit_switch(&plan, loaded) {
            return Ok(false);
        }
        let tier = st.variants.current();
        StreamEvent::VariantChanged {
            from: plan.from,
            to: plan.to,
            bandwidth: tier.bandwidth(),
            codecs: tier.codecs().map(str::to_string),
        }
    };
    shared.wake_producer();
    shared.emit(event);
    Ok(true)
}

pub(crate) struct ReadAheadWorker {
    shared: Arc<Shared>,
    fetcher: Arc<dyn ResourceFetcher>,
    parser: Arc<dyn PlaylistParser>,
    keys: Arc<SegmentKeyStore>,
    abr: AbrController,
    refresh_interval: Option<Duration>,
    failures_before_downgrade: u32,
    retry_budget: u32,
    max_retry_delay: Duration,
    retry_delay: Duration,
    /// Failures of the current sequence number since the last demotion.
    consecutive_failures: u32,
    /// All failed attempts at the current sequence number.
    spent_attempts: u32,
    failing_sequence: Option<u64>,
    /// Buffer epoch the ABR history belongs to.
    seen_epoch: u64,
}

impl ReadAheadWorker {
    const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
    const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(2);
    const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(500);

    pub fn new(
        shared: Arc<Shared>,
        fetcher: Arc<dyn ResourceFetcher>,
        parser: Arc<dyn PlaylistParser>,
        keys: Arc<SegmentKeyStore>,
        settings: &HlsSettings,
    ) -> Self {
        let seen_epoch = shared.state.lock().buffer.epoch();
        Self {
            shared,
            fetcher,
            parser,
            keys,
            abr: AbrController::new(AbrConfig::from_settings(settings)),
            refresh_interval: settings.live_refresh_interval,
            failures_before_downgrade: settings.segment_failures_before_downgrade.max(1),
            retry_budget: settings.segment_retry_budget.max(1),
            max_retry_delay: settings.max_retry_delay,
            retry_delay: Self::INITIAL_RETRY_DELAY,
            consecutive_failures: 0,
            spent_attempts: 0,
            failing_sequence: None,
            seen_epoch,
        }
    }

    /// Runs until cancelled or until an unrecoverable error.
    #[instrument(skip(self))]
    pub async fn run(mut self) {
        self.set_state(WorkerState::Running);
        loop {
            match self.read_ahead().await {
                Ok(Step::Empty) => {
                    self.mark_end_of_stream();
                    if self.wait_for_wake().await.is_err() {
                        break;
                    }
                }
                Ok(Step::EndOfStream) => {
                    if self.wait_for_wake().await.is_err() {
                        break;
                    }
                }
                Ok(step) => trace!(?step, "read-ahead step"),
                Err(e) if e.is_cancelled() => {
                    if self.shared.cancel.is_cancelled() {
                        trace!("read-ahead worker cancelled");
                        break;
                    }
                    trace!("enqueue invalidated by buffer reset");
                }
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        self.set_state(WorkerState::Stopped);
    }

    /// Performs one pass: waits for space, adapts quality, then fetches the
    /// next segment, refreshes a live playlist or reports the end.
    #[instrument(skip(self))]
    pub async fn read_ahead(&mut self) -> HlsResult<Step> {
        if self.shared.cancel.is_cancelled() {
            return Err(HlsError::Cancelled);
        }
        if !self.shared.state.lock().buffer.has_space() {
            self.wait_for_wake().await?;
            return Ok(Step::Waited);
        }

        self.observe_reposition();
        if let Some(direction) = self.abr_direction() {
            if self.try_switch(direction).await? {
                return Ok(Step::Switched);
            }
        }

        match self.plan() {
            Plan::Fetch {
                segment,
                variant,
                time_offset,
                decoder_reset,
                epoch,
            } => {
                self.fetch_and_enqueue(segment, variant, time_offset, decoder_reset, epoch)
                    .await
            }
            Plan::Refresh { variant, uri, wait } => self.refresh(variant, &uri, wait).await,
            Plan::End => {
                self.mark_end_of_stream();
                Ok(Step::EndOfStream)
            }
            Plan::Empty => Ok(Step::Empty),
        }
    }

    /// Switches one tier. A target that cannot be loaded leaves the current
    /// tier in place; only cancellation is an error.
    async fn try_switch(&mut self, direction: SwitchDirection) -> HlsResult<bool> {
        let res = switch_variant(&self.shared, &*self.fetcher, &*self.parser, direction).await;
        match res {
            Ok(switched) => {
                if switched {
                    self.abr.on_switch(Instant::now());
                }
                Ok(switched)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                debug!(?direction, error = %e, "quality switch failed, staying on current tier");
                self.abr.on_switch(Instant::now());
                Ok(false)
            }
        }
    }

    /// Drops throughput history gathered before a seek.
    fn observe_reposition(&mut self) {
        let epoch = self.shared.state.lock().buffer.epoch();
        if epoch != self.seen_epoch {
            self.seen_epoch = epoch;
            self.abr.reset();
            trace!(epoch, "throughput history reset after reposition");
        }
    }

    fn abr_direction(&self) -> Option<SwitchDirection> {
        let st = self.shared.state.lock();
        if !st.auto_quality {
            return None;
        }
        let decision = self.abr.decide(
            &st.variants.bandwidths(),
            st.variants.current_index(),
            st.buffer.buffered_duration(),
            Instant::now(),
        );
        match decision {
            AbrDecision::Stay => None,
            AbrDecision::Up => Some(SwitchDirection::Up),
            AbrDecision::Down => Some(SwitchDirection::Down),
        }
    }

    fn plan(&self) -> Plan {
        let mut st = self.shared.state.lock();
        let next = st.next_sequence;
        let epoch = st.buffer.epoch();
        let decoder_reset = st.variants.pending_decoder_reset();
        let variant = st.variants.current_index();
        let last_refresh = st.last_refresh;
        let tier = st.variants.current_mut();

        if tier.is_loaded() && tier.set_position(next) {
            if let Some(segment) = tier.current().cloned() {
                let time_offset = tier.time_offset_of(segment.sequence).unwrap_or_default();
                return Plan::Fetch {
                    decoder_reset: decoder_reset || segment.discontinuity,
                    segment,
                    variant,
                    time_offset,
                    epoch,
                };
            }
        }

        if !tier.is_loaded() {
            return Plan::Refresh {
                variant,
                uri: tier.uri().clone(),
                wait: Duration::ZERO,
            };
        }
        if tier.can_grow() {
            let interval = self.refresh_interval_for(tier.target_duration());
            let elapsed = last_refresh.map_or(interval, |t| t.elapsed());
            return Plan::Refresh {
                variant,
                uri: tier.uri().clone(),
                wait: interval.saturating_sub(elapsed),
            };
        }
        if tier.is_empty() {
            return Plan::Empty;
        }
        if let Some(last) = tier.last_sequence() {
            tier.set_position(last);
        }
        Plan::End
    }

    fn refresh_interval_for(&self, target_duration: Duration) -> Duration {
        if let Some(interval) = self.refresh_interval {
            return interval;
        }
        let half = target_duration / 2;
        if half.is_zero() {
            Self::DEFAULT_REFRESH_INTERVAL
        } else {
            half.max(Self::MIN_REFRESH_INTERVAL)
        }
    }

    #[instrument(skip(self, segment), fields(sequence = segment.sequence))]
    async fn fetch_and_enqueue(
        &mut self,
        segment: Arc<SegmentDescriptor>,
        variant: usize,
        time_offset: Duration,
        decoder_reset: bool,
        epoch: u64,
    ) -> HlsResult<Step> {
        let started = Instant::now();
        let fetched = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(HlsError::Cancelled),
            res = self.fetcher.fetch(&segment.uri, ResourceKind::Segment, segment.byte_range) => res,
        };
        let raw = match fetched {
            Ok(raw) => raw,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => return self.on_segment_failure(segment.sequence, e).await,
        };
        let elapsed = started.elapsed();

        // Key and decryption failures are structural: no retry, no demotion.
        let payload = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(HlsError::Cancelled),
            res = self.keys.decrypt(raw.clone(), segment.key.as_ref(), segment.sequence) => res?,
        };

        self.abr.on_segment_downloaded(raw.len() as u64, elapsed);
        self.retry_delay = Self::INITIAL_RETRY_DELAY;
        self.consecutive_failures = 0;
        self.spent_attempts = 0;
        self.failing_sequence = None;

        let unit = BufferUnit::new(
            payload,
            variant,
            segment.sequence,
            segment.duration,
            time_offset,
            decoder_reset,
        );
        self.enqueue(unit, epoch).await
    }

    /// Waits for room and queues the unit. Fails with `Cancelled` when the
    /// buffer was reset after the unit was planned.
    async fn enqueue(&mut self, mut unit: BufferUnit, epoch: u64) -> HlsResult<Step> {
        loop {
            let queued = {
                let mut st = self.shared.state.lock();
                if st.buffer.epoch() != epoch {
                    trace!(sequence = unit.sequence, "dropping segment planned before reset");
                    return Err(HlsError::Cancelled);
                }
                let (variant, sequence, duration) = (unit.variant, unit.sequence, unit.duration);
                let byte_len = unit.len() as u64;
                let decoder_reset = unit.needs_decoder_reset;
                match st.buffer.try_enqueue(unit, epoch) {
                    Ok(()) => {
                        st.next_sequence = sequence + 1;
                        if let Some(tier) = st.variants.tier_mut(variant) {
                            tier.record_size(sequence, byte_len);
                        }
                        if decoder_reset {
                            st.variants.take_decoder_reset();
                        }
                        Ok((
                            sequence,
                            StreamEvent::SegmentQueued {
                                variant,
                                sequence,
                                byte_len,
                                duration,
                            },
                        ))
                    }
                    Err(back) => Err(back),
                }
            };

            match queued {
                Ok((sequence, event)) => {
                    self.shared.data_ready.notify_all();
                    self.shared.emit(event);
                    return Ok(Step::Queued(sequence));
                }
                Err(back) => {
                    unit = back;
                    self.wait_for_wake().await?;
                }
            }
        }
    }

    async fn on_segment_failure(&mut self, sequence: u64, err: HlsError) -> HlsResult<Step> {
        if self.failing_sequence != Some(sequence) {
            self.failing_sequence = Some(sequence);
            self.consecutive_failures = 0;
            self.spent_attempts = 0;
        }
        self.consecutive_failures += 1;
        self.spent_attempts += 1;
        debug!(
            sequence,
            attempt = self.spent_attempts,
            error = %err,
            "segment fetch failed"
        );

        if self.spent_attempts >= self.retry_budget {
            return Err(HlsError::SegmentUnavailable {
                sequence,
                source: Box::new(err),
            });
        }

        if self.consecutive_failures >= self.failures_before_downgrade {
            let auto = self.shared.state.lock().auto_quality;
            if auto && self.try_switch(SwitchDirection::Down).await? {
                debug!(sequence, "demoted quality after repeated failures");
                self.consecutive_failures = 0;
                self.retry_delay = Self::INITIAL_RETRY_DELAY;
                return Ok(Step::Switched);
            }
        }

        self.backoff_sleep().await?;
        Ok(Step::Waited)
    }

    #[instrument(skip(self, uri), fields(url = %uri))]
    async fn refresh(&mut self, variant: usize, uri: &Url, wait: Duration) -> HlsResult<Step> {
        if !wait.is_zero() {
            tokio::select! {
                biased;
                _ = self.shared.cancel.cancelled() => return Err(HlsError::Cancelled),
                _ = self.shared.wake.notified() => {
                    trace!("refresh wait interrupted");
                    return Ok(Step::Waited);
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let fetched = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(HlsError::Cancelled),
            res = VariantPlaylist::fetch(uri, &*self.fetcher, &*self.parser) => res,
        };
        let media = match fetched {
            Ok(media) => media,
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                debug!(url = %uri, error = %e, "playlist refresh failed");
                self.shared.state.lock().last_refresh = Some(Instant::now());
                self.backoff_sleep().await?;
                return Ok(Step::Waited);
            }
        };

        let segments = {
            let mut st = self.shared.state.lock();
            st.last_refresh = Some(Instant::now());
            match st.variants.tier_mut(variant) {
                Some(tier) => {
                    tier.apply(media);
                    tier.len()
                }
                None => return Ok(Step::Waited),
            }
        };
        trace!(variant, segments, "playlist refreshed");
        self.shared
            .emit(StreamEvent::PlaylistRefreshed { variant, segments });
        Ok(Step::Refreshed)
    }

    fn mark_end_of_stream(&self) {
        let newly_ended = {
            let mut st = self.shared.state.lock();
            let newly = !st.buffer.is_end_of_stream();
            st.buffer.mark_end_of_stream();
            newly
        };
        self.shared.data_ready.notify_all();
        if newly_ended {
            trace!("end of stream reached");
            self.shared.emit(StreamEvent::EndOfStream);
        }
    }

    fn fail(&self, err: HlsError) {
        error!(error = %err, "read-ahead worker stopped");
        let err = Arc::new(err);
        self.shared.state.lock().fatal = Some(err.clone());
        self.shared.data_ready.notify_all();
        self.shared.emit(StreamEvent::Error(err));
    }

    fn set_state(&self, state: WorkerState) {
        let mut st = self.shared.state.lock();
        // A stop request wins over the worker's own transitions until it exits.
        if st.worker_state == WorkerState::Stopping && state == WorkerState::Running {
            return;
        }
        st.worker_state = state;
    }

    async fn wait_for_wake(&self) -> HlsResult<()> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => Err(HlsError::Cancelled),
            _ = self.shared.wake.notified() => Ok(()),
        }
    }

    /// Sleep with backoff and cancellation; update retry delay.
    async fn backoff_sleep(&mut self) -> HlsResult<()> {
        tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => {
                return Err(HlsError::Cancelled);
            }
            _ = tokio::time::sleep(self.retry_delay) => {}
        }
        self.retry_delay = (self.retry_delay * 2).min(self.max_retry_delay);
        Ok(())
    }
}

/// Builds the state a session starts with.
pub(crate) fn initial_state(
    variants: VariantSet,
    settings: &HlsSettings,
    next_sequence: u64,
    clock: Duration,
) -> PipelineState {
    PipelineState {
        variants,
        buffer: SegmentBuffer::new(settings.read_ahead_buffers, settings.max_buffered_duration),
        next_sequence,
        auto_quality: settings.auto_quality,
        worker_state: WorkerState::Idle,
        fatal: None,
        position: 0,
        clock,
        last_refresh: None,
    }
}
