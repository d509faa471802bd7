//! Query parameters recognised by [`crate::StreamSession::open`].
//!
//! The session URL may carry playback hints alongside the playlist address:
//!
//! ```text
//! https://cdn.example/master.m3u8?token=abc&quality=1&start_time=90&live=0
//! ```
//!
//! Recognised parameters are removed before the playlist is fetched; anything
//! else (`token` above) stays on the URL.

use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::error::{HlsError, HlsResult};
use crate::settings::HlsSettings;

const FINGERPRINT: &str = "fingerprint";
const KEY_PARAMS: &str = "key_params";
const QUALITY: &str = "quality";
const AUTO_QUALITY: &str = "auto_quality";
const START_TIME: &str = "start_time";
const PREROLL: &str = "preroll";
const LIVE: &str = "live";

/// Parameters extracted from the session URL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenParams {
    /// Playlist URL with the recognised parameters stripped.
    pub playlist_url: Option<Url>,
    /// Client fingerprint forwarded to the key server.
    pub fingerprint: Option<String>,
    /// Raw key-server parameter string as given in the URL.
    pub key_server_params: Option<String>,
    pub quality: Option<usize>,
    pub auto_quality: Option<bool>,
    /// Start offset measured from the end of the preroll, the same frame as
    /// [`StreamSession::seek_to_time`](crate::StreamSession::seek_to_time).
    pub start_time: Option<Duration>,
    /// Leading part of the stream that is skipped and hidden from reported times.
    pub preroll: Option<Duration>,
    pub live: Option<bool>,
}

impl OpenParams {
    /// Splits `raw` into the playlist URL and the recognised parameters.
    pub fn parse(raw: &str) -> HlsResult<Self> {
        let mut url = Url::parse(raw).map_err(|e| HlsError::msg(format!("invalid url `{raw}`: {e}")))?;
        let mut params = OpenParams::default();
        let mut passthrough: Vec<(String, String)> = Vec::new();

        for (key, value) in url.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                FINGERPRINT => params.fingerprint = Some(value),
                KEY_PARAMS => params.key_server_params = Some(value),
                QUALITY => params.quality = Some(parse_number(QUALITY, &value)?),
                AUTO_QUALITY => params.auto_quality = Some(parse_flag(AUTO_QUALITY, &value)?),
                START_TIME => params.start_time = Some(parse_seconds(START_TIME, &value)?),
                PREROLL => params.preroll = Some(parse_seconds(PREROLL, &value)?),
                LIVE => params.live = Some(parse_flag(LIVE, &value)?),
                _ => passthrough.push((key.into_owned(), value)),
            }
        }

        if passthrough.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(passthrough);
        }
        params.playlist_url = Some(url);
        Ok(params)
    }

    /// Splits `key_server_params` into `k=v` pairs. Pairs are separated by `,` or `;`.
    pub fn key_server_pairs(&self) -> HashMap<String, String> {
        let Some(raw) = self.key_server_params.as_deref() else {
            return HashMap::new();
        };
        raw.split([',', ';'])
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                let k = k.trim();
                (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
            })
            .collect()
    }

    /// Applies the URL hints on top of `settings`.
    pub fn apply_to(&self, mut settings: HlsSettings) -> HlsSettings {
        if let Some(q) = self.quality {
            settings.initial_variant = Some(q);
            // An explicit tier without an explicit auto flag pins the quality.
            if self.auto_quality.is_none() {
                settings.auto_quality = false;
            }
        }
        if let Some(auto) = self.auto_quality {
            settings.auto_quality = auto;
        }
        if self.start_time.is_some() {
            settings.start_time = self.start_time;
        }
        if self.preroll.is_some() {
            settings.preroll = self.preroll;
        }
        if self.live.is_some() {
            settings.live_hint = self.live;
        }

        let key_pairs = self.key_server_pairs();
        if !key_pairs.is_empty() {
            settings
                .key_query_params
                .get_or_insert_with(HashMap::new)
                .extend(key_pairs);
        }
        if let Some(fp) = &self.fingerprint {
            settings
                .key_request_headers
                .get_or_insert_with(HashMap::new)
                .insert("X-Fingerprint".to_string(), fp.clone());
        }
        settings
    }
}

fn parse_number(name: &'static str, value: &str) -> HlsResult<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| HlsError::InvalidParams(name))
}

fn parse_flag(name: &'static str, value: &str) -> HlsResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(HlsError::InvalidParams(name)),
    }
}

fn parse_seconds(name: &'static str, value: &str) -> HlsResult<Duration> {
    let secs: f64 = value
        .trim()
        .parse()
        .map_err(|_| HlsError::InvalidParams(name))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(HlsError::InvalidParams(name));
    }
    Ok(Duration::from_secs_f64(secs))
}
