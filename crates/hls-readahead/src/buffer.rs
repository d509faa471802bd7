//! Bounded queue of downloaded segment payloads.
//!
//! The buffer itself is plain data. All access happens under the session
//! lock; the worker waits for space and the reader waits for data on the
//! synchronization primitives owned by the session.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;

/// One downloaded (and decrypted) segment awaiting consumption.
#[derive(Debug, Clone)]
pub struct BufferUnit {
    payload: Bytes,
    /// Bytes of `payload` already handed to the consumer.
    read: usize,
    started: bool,
    pub variant: usize,
    pub sequence: u64,
    pub duration: Duration,
    /// Playback offset of the segment start within its tier.
    pub time_offset: Duration,
    /// The decoder must reset before consuming this unit.
    pub needs_decoder_reset: bool,
    pub enqueued_at: Instant,
}

impl BufferUnit {
    pub fn new(
        payload: Bytes,
        variant: usize,
        sequence: u64,
        duration: Duration,
        time_offset: Duration,
        needs_decoder_reset: bool,
    ) -> Self {
        Self {
            payload,
            read: 0,
            started: false,
            variant,
            sequence,
            duration,
            time_offset,
            needs_decoder_reset,
            enqueued_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.payload.len() - self.read
    }
}

/// Result of a non-blocking [`SegmentBuffer::consume`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeStatus {
    /// Bytes copied; zero only for an empty output slice.
    Data(usize),
    /// Nothing queued yet; more data may arrive.
    WouldBlock,
    /// Nothing queued and the producer reached the end of the stream.
    EndOfStream,
}

#[derive(Debug)]
pub struct SegmentBuffer {
    units: VecDeque<BufferUnit>,
    capacity: usize,
    max_duration: Duration,
    /// Bumped on every reset; enqueues tagged with an older epoch are refused.
    epoch: u64,
    end_of_stream: bool,
    /// Bytes to drop from the next enqueued unit (byte seek into a segment).
    pending_skip: usize,
    /// The consumer started a unit that carried the decoder-reset flag.
    decoder_reset_seen: bool,
    /// `(sequence, time_offset)` of the unit most recently started.
    last_started: Option<(u64, Duration)>,
}

impl SegmentBuffer {
    pub fn new(capacity: usize, max_duration: Duration) -> Self {
        Self {
            units: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            max_duration,
            epoch: 0,
            end_of_stream: false,
            pending_skip: 0,
            decoder_reset_seen: false,
            last_started: None,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the unit limit (minimum 1). Units already queued are kept even
    /// when the new limit is lower; the producer simply waits longer.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    pub fn mark_end_of_stream(&mut self) {
        self.end_of_stream = true;
    }

    /// Media time of all queued units.
    pub fn buffered_duration(&self) -> Duration {
        self.units.iter().map(|u| u.duration).sum()
    }

    /// Whether one more unit fits within both the unit and the duration bound.
    ///
    /// An empty buffer always has space so a single long segment cannot stall
    /// the pipeline.
    pub fn has_space(&self) -> bool {
        if self.units.is_empty() {
            return true;
        }
        self.units.len() < self.capacity && self.buffered_duration() < self.max_duration
    }

    /// Queues `unit` if it was produced for the current epoch and fits.
    ///
    /// Hands the unit back when the buffer is full or has been reset since the
    /// producer read `epoch`.
    pub fn try_enqueue(&mut self, mut unit: BufferUnit, epoch: u64) -> Result<(), BufferUnit> {
        if epoch != self.epoch || !self.has_space() {
            return Err(unit);
        }
        debug_assert!(
            self.units.back().is_none_or(|b| b.sequence <= unit.sequence),
            "units must be queued in sequence order"
        );
        if self.pending_skip > 0 {
            unit.read = self.pending_skip.min(unit.payload.len());
            self.pending_skip = 0;
        }
        self.units.push_back(unit);
        Ok(())
    }

    pub fn front(&self) -> Option<&BufferUnit> {
        self.units.front()
    }

    /// Copies queued bytes into `out` without blocking.
    ///
    /// Exhausted units are discarded. A read never spans into a unit flagged
    /// for decoder reset once bytes of an earlier unit were copied, so the
    /// reset lands on a read boundary.
    pub fn consume(&mut self, out: &mut [u8]) -> ConsumeStatus {
        let mut copied = 0usize;
        while copied < out.len() {
            let Some(front) = self.units.front_mut() else {
                break;
            };
            if !front.started {
                if front.needs_decoder_reset && copied > 0 {
                    break;
                }
                front.started = true;
                if front.needs_decoder_reset {
                    self.decoder_reset_seen = true;
                }
                self.last_started = Some((front.sequence, front.time_offset));
            }

            let n = front.remaining().min(out.len() - copied);
            out[copied..copied + n].copy_from_slice(&front.payload[front.read..front.read + n]);
            front.read += n;
            copied += n;

            if front.remaining() == 0 {
                self.units.pop_front();
            }
        }

        if copied > 0 {
            ConsumeStatus::Data(copied)
        } else if out.is_empty() && !self.units.is_empty() {
            ConsumeStatus::Data(0)
        } else if self.end_of_stream && self.units.is_empty() {
            ConsumeStatus::EndOfStream
        } else {
            ConsumeStatus::WouldBlock
        }
    }

    /// Drops `n` bytes of the next unit to be enqueued.
    pub fn skip_next(&mut self, n: usize) {
        self.pending_skip = n;
    }

    /// Position of the unit the consumer is currently in.
    pub fn last_started(&self) -> Option<(u64, Duration)> {
        self.last_started
    }

    /// Returns and clears whether a decoder-reset unit has been started.
    pub fn take_decoder_reset(&mut self) -> bool {
        std::mem::take(&mut self.decoder_reset_seen)
    }

    /// Discards every queued unit and invalidates in-flight enqueues.
    ///
    /// Returns the number of units dropped.
    pub fn reset(&mut self) -> usize {
        let dropped = self.units.len();
        self.units.clear();
        self.epoch = self.epoch.wrapping_add(1);
        self.end_of_stream = false;
        self.pending_skip = 0;
        self.last_started = None;
        dropped
    }
}
