//! All quality tiers of one stream and the active-tier selection.

use tracing::{debug, info};
use url::Url;

use crate::downloader::{ResourceFetcher, ResourceKind};
use crate::error::{HlsError, HlsResult};
use crate::parser::{MediaPlaylist, ParsedPlaylist, PlaylistParser};
use crate::playlist::VariantPlaylist;

/// Direction of a one-step quality change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchDirection {
    Up,
    Down,
}

/// A tier change computed under the lock and committed once the target
/// playlist is available.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchPlan {
    pub from: usize,
    pub to: usize,
    pub uri: Url,
    /// The target tier has never been loaded and must be fetched first.
    pub needs_load: bool,
}

/// Tiers in ascending bandwidth order plus the active index.
#[derive(Debug, Clone)]
pub struct VariantSet {
    tiers: Vec<VariantPlaylist>,
    current: usize,
    pending_decoder_reset: bool,
}

impl VariantSet {
    /// Builds the set from already-constructed tiers, sorting them by bandwidth.
    pub fn from_tiers(mut tiers: Vec<VariantPlaylist>) -> HlsResult<Self> {
        if tiers.is_empty() {
            return Err(HlsError::NoVariantsFound);
        }
        tiers.sort_by_key(|t| t.bandwidth());
        Ok(Self {
            tiers,
            current: 0,
            pending_decoder_reset: false,
        })
    }

    /// Fetches the top-level playlist and creates one tier per variant.
    ///
    /// A plain media playlist yields a single, already loaded tier.
    pub async fn build_from_master(
        url: &Url,
        fetcher: &dyn ResourceFetcher,
        parser: &dyn PlaylistParser,
    ) -> HlsResult<Self> {
        let bytes = fetcher
            .fetch(url, ResourceKind::Playlist, None)
            .await
            .map_err(|e| HlsError::playlist_unavailable(url.as_str(), e))?;

        match parser.parse(&bytes, url)? {
            ParsedPlaylist::Master(variants) => {
                debug!(url = %url, variants = variants.len(), "parsed master playlist");
                let tiers = variants
                    .into_iter()
                    .map(|v| VariantPlaylist::new(v.bandwidth, v.uri, v.codecs))
                    .collect();
                Self::from_tiers(tiers)
            }
            ParsedPlaylist::Media(media) => {
                debug!(url = %url, segments = media.segments.len(), "single media playlist");
                let mut tier = VariantPlaylist::new(0, url.clone(), None);
                tier.apply(media);
                Self::from_tiers(vec![tier])
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &VariantPlaylist {
        &self.tiers[self.current]
    }

    pub fn current_mut(&mut self) -> &mut VariantPlaylist {
        &mut self.tiers[self.current]
    }

    pub fn tier(&self, index: usize) -> Option<&VariantPlaylist> {
        self.tiers.get(index)
    }

    pub fn tier_mut(&mut self, index: usize) -> Option<&mut VariantPlaylist> {
        self.tiers.get_mut(index)
    }

    pub fn bandwidths(&self) -> Vec<u64> {
        self.tiers.iter().map(VariantPlaylist::bandwidth).collect()
    }

    /// Picks the starting tier.
    ///
    /// Without a requested tier both modes start at the lowest bandwidth.
    /// Out-of-range requests are clamped to the top tier.
    pub fn select_initial(&mut self, auto_quality: bool, requested: Option<usize>) -> usize {
        let top = self.tiers.len() - 1;
        self.current = requested.map_or(0, |r| r.min(top));
        debug!(
            tier = self.current,
            auto_quality,
            bandwidth = self.current().bandwidth(),
            "selected initial tier"
        );
        self.current
    }

    /// Computes a one-step switch, or `None` at the bound.
    pub fn plan_switch(&self, direction: SwitchDirection) -> Option<SwitchPlan> {
        let to = match direction {
            SwitchDirection::Up => self.current.checked_add(1).filter(|i| *i < self.tiers.len())?,
            SwitchDirection::Down => self.current.checked_sub(1)?,
        };
        let target = &self.tiers[to];
        Some(SwitchPlan {
            from: self.current,
            to,
            uri: target.uri().clone(),
            needs_load: !target.is_loaded(),
        })
    }

    /// Applies a planned switch.
    ///
    /// `loaded` is the freshly fetched target playlist, if one was fetched. The
    /// target cursor is synchronized to the sequence number the previous tier's
    /// cursor was at. Returns false when the plan went stale or the target is
    /// still unloaded.
    pub fn commit_switch(&mut self, plan: &SwitchPlan, loaded: Option<MediaPlaylist>) -> bool {
        if self.current != plan.from || plan.to >= self.tiers.len() {
            return false;
        }
        let sync_sequence = self.tiers[plan.from].current_sequence();

        let target = &mut self.tiers[plan.to];
        if let Some(media) = loaded {
            target.apply(media);
        }
        if !target.is_loaded() {
            return false;
        }
        if let Some(seq) = sync_sequence {
            // A lagging live tier may not know `seq` yet; its cursor stays at 0
            // and the worker re-positions on its next pass.
            target.set_position(seq);
        }

        info!(
            from = plan.from,
            to = plan.to,
            bandwidth = target.bandwidth(),
            "quality switch"
        );
        self.current = plan.to;
        self.pending_decoder_reset = true;
        true
    }

    /// Moves one tier up, loading the target tier when needed.
    ///
    /// Convenience for a caller that owns the set outright. A set shared
    /// behind a lock must use [`plan_switch`](Self::plan_switch) and
    /// [`commit_switch`](Self::commit_switch) so the fetch happens unlocked,
    /// as the read-ahead worker and the session do.
    pub async fn increase_quality(
        &mut self,
        fetcher: &dyn ResourceFetcher,
        parser: &dyn PlaylistParser,
    ) -> HlsResult<bool> {
        self.switch(SwitchDirection::Up, fetcher, parser).await
    }

    /// Moves one tier down, loading the target tier when needed.
    ///
    /// See [`increase_quality`](Self::increase_quality) for the locking caveat.
    pub async fn decrease_quality(
        &mut self,
        fetcher: &dyn ResourceFetcher,
        parser: &dyn PlaylistParser,
    ) -> HlsResult<bool> {
        self.switch(SwitchDirection::Down, fetcher, parser).await
    }

    async fn switch(
        &mut self,
        direction: SwitchDirection,
        fetcher: &dyn ResourceFetcher,
        parser: &dyn PlaylistParser,
    ) -> HlsResult<bool> {
        let Some(plan) = self.plan_switch(direction) else {
            return Ok(false);
        };
        let loaded = if plan.needs_load {
            Some(VariantPlaylist::fetch(&plan.uri, fetcher, parser).await?)
        } else {
            None
        };
        Ok(self.commit_switch(&plan, loaded))
    }

    /// Whether the next produced unit must carry the decoder-reset flag.
    pub fn pending_decoder_reset(&self) -> bool {
        self.pending_decoder_reset
    }

    pub fn mark_decoder_reset(&mut self) {
        self.pending_decoder_reset = true;
    }

    pub fn take_decoder_reset(&mut self) -> bool {
        std::mem::take(&mut self.pending_decoder_reset)
    }
}
