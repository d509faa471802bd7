//! One quality tier: its ordered segment list and the read cursor.
//!
//! The descriptor list is append-only. A reload (live refresh) only appends
//! descriptors whose sequence number is greater than the last known one, so
//! everything the cursor has already passed stays where it was.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;
use url::Url;

use crate::downloader::{ResourceFetcher, ResourceKind};
use crate::error::{HlsError, HlsResult};
use crate::parser::{MediaPlaylist, ParsedPlaylist, PlaylistParser, SegmentDescriptor};

#[derive(Debug, Clone)]
pub struct VariantPlaylist {
    bandwidth: u64,
    uri: Url,
    codecs: Option<String>,
    segments: Vec<Arc<SegmentDescriptor>>,
    /// Start offset of each segment, parallel to `segments`.
    offsets: Vec<Duration>,
    /// `None` until the first successful load.
    position: Option<usize>,
    target_duration: Duration,
    start_date: i64,
    can_grow: bool,
    /// Byte sizes observed while downloading, keyed by sequence number.
    learned_sizes: HashMap<u64, u64>,
}

impl VariantPlaylist {
    /// Creates an unloaded playlist.
    pub fn new(bandwidth: u64, uri: Url, codecs: Option<String>) -> Self {
        Self {
            bandwidth,
            uri,
            codecs,
            segments: Vec::new(),
            offsets: Vec::new(),
            position: None,
            target_duration: Duration::ZERO,
            start_date: 0,
            can_grow: true,
            learned_sizes: HashMap::new(),
        }
    }

    pub fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    pub fn codecs(&self) -> Option<&str> {
        self.codecs.as_deref()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.position.is_some()
    }

    /// Cursor index, `None` while unloaded.
    pub fn position(&self) -> Option<usize> {
        self.position
    }

    pub fn target_duration(&self) -> Duration {
        self.target_duration
    }

    /// Unix seconds of the first segment's program date, 0 when absent.
    pub fn start_date(&self) -> i64 {
        self.start_date
    }

    /// Whether the source may still append segments.
    pub fn can_grow(&self) -> bool {
        self.can_grow
    }

    /// True while the cursor is before the last index.
    pub fn has_pending_segments(&self) -> bool {
        match self.position {
            Some(pos) => pos + 1 < self.segments.len(),
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        !self.has_pending_segments() && !self.can_grow
    }

    /// Fetches and parses the playlist at `uri`. Does not touch any cursor.
    pub async fn fetch(
        uri: &Url,
        fetcher: &dyn ResourceFetcher,
        parser: &dyn PlaylistParser,
    ) -> HlsResult<MediaPlaylist> {
        let bytes = fetcher
            .fetch(uri, ResourceKind::Playlist, None)
            .await
            .map_err(|e| HlsError::playlist_unavailable(uri.as_str(), e))?;
        match parser.parse(&bytes, uri) {
            Ok(ParsedPlaylist::Media(media)) => Ok(media),
            Ok(ParsedPlaylist::Master(_)) => Err(HlsError::playlist_unavailable(
                uri.as_str(),
                HlsError::InvalidPlaylist("expected a media playlist".to_string()),
            )),
            Err(e) => Err(HlsError::playlist_unavailable(uri.as_str(), e)),
        }
    }

    /// Fetches and applies this playlist. Returns `Ok(false)` without fetching
    /// when the playlist is already finished.
    pub async fn load(
        &mut self,
        fetcher: &dyn ResourceFetcher,
        parser: &dyn PlaylistParser,
    ) -> HlsResult<bool> {
        if self.is_finished() {
            return Ok(false);
        }
        let media = Self::fetch(&self.uri, fetcher, parser).await?;
        Ok(self.apply(media))
    }

    /// Merges a freshly parsed playlist. The first load puts the cursor at 0;
    /// later reloads only append, so an existing cursor stays where it is.
    ///
    /// Returns false (and changes nothing) when the playlist is already finished.
    pub fn apply(&mut self, media: MediaPlaylist) -> bool {
        if self.is_finished() {
            return false;
        }

        self.target_duration = media.target_duration;
        let mut appended = 0usize;
        for seg in media.segments {
            // Sequence numbers must strictly increase with index.
            if self.last_sequence().is_some_and(|last| seg.sequence <= last) {
                continue;
            }
            let offset = match (self.offsets.last(), self.segments.last()) {
                (Some(off), Some(prev)) => *off + self.effective_duration(prev),
                _ => Duration::ZERO,
            };
            self.offsets.push(offset);
            self.segments.push(Arc::new(seg));
            appended += 1;
        }

        self.can_grow = media.can_grow;
        self.start_date = self
            .segments
            .first()
            .and_then(|s| s.start_date)
            .unwrap_or(0);
        self.position = Some(self.position.unwrap_or(0));

        trace!(
            uri = %self.uri,
            appended,
            total = self.segments.len(),
            can_grow = self.can_grow,
            "playlist loaded"
        );
        true
    }

    /// Moves the cursor to the first descriptor with sequence >= `sequence`.
    ///
    /// Fails, leaving the cursor unchanged, when `sequence` is past the last known one.
    pub fn set_position(&mut self, sequence: u64) -> bool {
        let Some(last) = self.last_sequence() else {
            return false;
        };
        if sequence > last {
            return false;
        }
        match self.segments.iter().position(|s| s.sequence >= sequence) {
            Some(idx) => {
                self.position = Some(idx);
                true
            }
            None => false,
        }
    }

    pub fn current(&self) -> Option<&Arc<SegmentDescriptor>> {
        self.position.and_then(|p| self.segments.get(p))
    }

    pub fn first(&self) -> Option<&Arc<SegmentDescriptor>> {
        self.segments.first()
    }

    pub fn last(&self) -> Option<&Arc<SegmentDescriptor>> {
        self.segments.last()
    }

    pub fn current_sequence(&self) -> Option<u64> {
        self.current().map(|s| s.sequence)
    }

    pub fn first_sequence(&self) -> Option<u64> {
        self.first().map(|s| s.sequence)
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.last().map(|s| s.sequence)
    }

    pub fn index_of(&self, sequence: u64) -> Option<usize> {
        self.segments
            .binary_search_by_key(&sequence, |s| s.sequence)
            .ok()
    }

    pub fn segment(&self, index: usize) -> Option<&Arc<SegmentDescriptor>> {
        self.segments.get(index)
    }

    /// Playback offset of the segment with this sequence number.
    pub fn time_offset_of(&self, sequence: u64) -> Option<Duration> {
        self.index_of(sequence).map(|i| self.offsets[i])
    }

    /// Sum of all known segment durations.
    pub fn total_duration(&self) -> Duration {
        match (self.offsets.last(), self.segments.last()) {
            (Some(off), Some(seg)) => *off + self.effective_duration(seg),
            _ => Duration::ZERO,
        }
    }

    /// Sequence number of the segment playing at offset `t`.
    ///
    /// `None` when `t` lies beyond the known segments.
    pub fn sequence_at_time(&self, t: Duration) -> Option<u64> {
        if t >= self.total_duration() {
            return None;
        }
        // Last segment whose start offset is <= t.
        let idx = self.offsets.partition_point(|off| *off <= t).checked_sub(1)?;
        self.segments.get(idx).map(|s| s.sequence)
    }

    /// Records the byte size of a downloaded segment.
    pub fn record_size(&mut self, sequence: u64, len: u64) {
        self.learned_sizes.insert(sequence, len);
    }

    /// Byte size of a segment, from the playlist's byte range or from a download.
    pub fn size_of(&self, sequence: u64) -> Option<u64> {
        self.learned_sizes.get(&sequence).copied().or_else(|| {
            self.index_of(sequence)
                .and_then(|i| self.segments[i].byte_len())
        })
    }

    /// Total byte length, known only for a fixed playlist whose every segment size is known.
    pub fn byte_length(&self) -> Option<u64> {
        if self.can_grow || self.segments.is_empty() {
            return None;
        }
        self.segments
            .iter()
            .map(|s| self.size_of(s.sequence))
            .sum()
    }

    /// Byte offset where the segment with `sequence` starts, if every earlier size is known.
    pub fn byte_offset_of(&self, sequence: u64) -> Option<u64> {
        let idx = self.index_of(sequence)?;
        self.segments[..idx]
            .iter()
            .map(|s| self.size_of(s.sequence))
            .sum()
    }

    /// Segment containing byte `offset` and the offset inside it.
    pub fn locate_byte(&self, offset: u64) -> Option<(u64, u64)> {
        let mut start = 0u64;
        for seg in &self.segments {
            let len = self.size_of(seg.sequence)?;
            if offset < start + len {
                return Some((seg.sequence, offset - start));
            }
            start += len;
        }
        None
    }

    /// Segments with no `#EXTINF` duration fall back to the target duration.
    fn effective_duration(&self, seg: &SegmentDescriptor) -> Duration {
        if seg.duration.is_zero() {
            self.target_duration
        } else {
            seg.duration
        }
    }
}
