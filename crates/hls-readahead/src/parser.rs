//! Playlist parser module.
//!
//! Adapter around the `hls_m3u8` crate that turns raw playlist bytes into the
//! crate's [`ParsedPlaylist`] model. The session only talks to the
//! [`PlaylistParser`] trait, so a different parser can be plugged in.

use std::time::Duration;

use hls_m3u8::Decryptable;
use hls_m3u8::MasterPlaylist as HlsMasterPlaylist;
use hls_m3u8::MediaPlaylist as HlsMediaPlaylist;
use hls_m3u8::tags::VariantStream as HlsVariantStreamTag;
use hls_m3u8::types::{EncryptionMethod, InitializationVector};
use url::Url;

use crate::error::{HlsError, HlsResult};

/// Encryption scheme announced by `#EXT-X-KEY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMethod {
    Aes128,
    /// Sample-level encryption; not decryptable at the segment layer.
    SampleAes,
}

/// Decryption key reference carried by a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentKey {
    pub method: KeyMethod,
    pub uri: Url,
    /// Explicit IV; when absent the IV is derived from the sequence number.
    pub iv: Option<[u8; 16]>,
}

/// Sub-range of a resource (`#EXT-X-BYTERANGE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

/// One playlist entry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    pub sequence: u64,
    pub uri: Url,
    pub duration: Duration,
    pub byte_range: Option<ByteRange>,
    pub key: Option<SegmentKey>,
    /// `#EXT-X-DISCONTINUITY` precedes this segment.
    pub discontinuity: bool,
    /// `#EXT-X-PROGRAM-DATE-TIME` as unix seconds.
    pub start_date: Option<i64>,
}

impl SegmentDescriptor {
    /// Byte length when the playlist declares it.
    pub fn byte_len(&self) -> Option<u64> {
        self.byte_range.map(|r| r.length)
    }
}

/// One `#EXT-X-STREAM-INF` entry of a master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEntry {
    pub bandwidth: u64,
    pub uri: Url,
    pub codecs: Option<String>,
}

/// Parsed media playlist.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub segments: Vec<SegmentDescriptor>,
    pub target_duration: Duration,
    /// The playlist may still grow (no `#EXT-X-ENDLIST`).
    pub can_grow: bool,
}

/// Result of parsing a top-level or media playlist.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPlaylist {
    Media(MediaPlaylist),
    Master(Vec<VariantEntry>),
}

/// Turns raw playlist bytes into segment descriptors or a variant list.
///
/// Relative URIs are resolved against `base`, the URL the playlist was fetched from.
pub trait PlaylistParser: Send + Sync {
    fn parse(&self, data: &[u8], base: &Url) -> HlsResult<ParsedPlaylist>;
}

/// [`PlaylistParser`] backed by `hls_m3u8`.
#[derive(Debug, Clone, Copy, Default)]
pub struct M3u8Parser;

impl PlaylistParser for M3u8Parser {
    fn parse(&self, data: &[u8], base: &Url) -> HlsResult<ParsedPlaylist> {
        let input = std::str::from_utf8(data)
            .map_err(|e| HlsError::InvalidPlaylist(format!("invalid UTF-8: {}", e)))?;
        if input.contains("#EXT-X-STREAM-INF") || input.contains("#EXT-X-I-FRAME-STREAM-INF") {
            parse_master_playlist(input, base).map(ParsedPlaylist::Master)
        } else {
            parse_media_playlist(input, base).map(ParsedPlaylist::Media)
        }
    }
}

fn resolve(base: &Url, uri: &str) -> HlsResult<Url> {
    base.join(uri)
        .map_err(|e| HlsError::InvalidPlaylist(format!("bad uri `{uri}`: {e}")))
}

/// Parse a master playlist into its playable variants.
///
/// I-frame-only streams are skipped; they cannot feed a byte-stream consumer.
pub fn parse_master_playlist(input: &str, base: &Url) -> HlsResult<Vec<VariantEntry>> {
    let hls_master = HlsMasterPlaylist::try_from(input)
        .map_err(|e| HlsError::InvalidPlaylist(format!("hls_m3u8 parse error: {}", e)))?;

    hls_master
        .variant_streams
        .iter()
        .filter_map(|vs| match vs {
            HlsVariantStreamTag::ExtXStreamInf {
                uri, stream_data, ..
            } => Some((uri, stream_data)),
            HlsVariantStreamTag::ExtXIFrame { .. } => None,
        })
        .map(|(uri, stream_data)| {
            Ok(VariantEntry {
                bandwidth: stream_data.bandwidth(),
                uri: resolve(base, uri)?,
                codecs: stream_data.codecs().map(|c| c.to_string()),
            })
        })
        .collect()
}

/// Parse a media playlist into segment descriptors.
pub fn parse_media_playlist(input: &str, base: &Url) -> HlsResult<MediaPlaylist> {
    let hls_media = HlsMediaPlaylist::try_from(input)
        .map_err(|e| HlsError::InvalidPlaylist(format!("hls_m3u8 parse error: {}", e)))?;

    let media_sequence = hls_media.media_sequence as u64;
    // Derive end-of-stream strictly from presence of the EXT-X-ENDLIST tag.
    // Some servers set Playlist-Type=VOD or EVENT without a terminal ENDLIST.
    let can_grow = !input.contains("#EXT-X-ENDLIST");

    // A byte range without an offset continues where the previous one ended.
    let mut next_range_offset = 0u64;
    let mut segments = Vec::with_capacity(hls_media.segments.num_elements());

    for (index, (_idx, seg)) in hls_media.segments.iter().enumerate() {
        let key = match seg.keys().first() {
            Some(k) => Some(SegmentKey {
                method: match k.method {
                    EncryptionMethod::Aes128 => KeyMethod::Aes128,
                    _ => KeyMethod::SampleAes,
                },
                uri: resolve(base, k.uri())?,
                // A derived (`Number`) IV is left to the decryptor.
                iv: match k.iv {
                    InitializationVector::Aes128(iv) => Some(iv),
                    _ => None,
                },
            }),
            None => None,
        };

        let byte_range = seg.byte_range.as_ref().map(|r| {
            let offset = r.start().map_or(next_range_offset, |s| s as u64);
            let length = r.len() as u64;
            next_range_offset = offset + length;
            ByteRange { offset, length }
        });

        segments.push(SegmentDescriptor {
            sequence: media_sequence + index as u64,
            uri: resolve(base, seg.uri())?,
            duration: seg.duration.duration(),
            byte_range,
            key,
            discontinuity: seg.has_discontinuity,
            start_date: seg
                .program_date_time
                .as_ref()
                .map(|p| p.date_time.timestamp()),
        });
    }

    Ok(MediaPlaylist {
        segments,
        target_duration: hls_media.target_duration,
        can_grow,
    })
}
