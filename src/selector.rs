//! Beat asset selection.
//!
//! Ranking is pure; the async half walks the ranked list, downloading and
//! stream-checking each candidate until one passes.

use crate::cache::{AssetFetcher, CachedAsset};
use crate::error::AttemptRecord;
use crate::manifest::{AssetCandidate, AssetManifest, BeatCandidates, Recommendation};
use crate::quality::QualityGate;
use crate::{logi, logw};
use std::collections::{HashMap, HashSet, VecDeque};

/// Asset usage across the beats selected so far in a build.
#[derive(Debug, Clone)]
pub struct UsageTracker {
    counts: HashMap<String, usize>,
    recent: VecDeque<String>,
    window: usize,
    reuse_cap: usize,
}

impl UsageTracker {
    /// `reuse_cap` is `ceil(total_beats / 2)`: an asset used that often is
    /// demoted behind every other candidate.
    pub fn new(recent_window: usize, total_beats: usize) -> Self {
        Self {
            counts: HashMap::new(),
            recent: VecDeque::new(),
            window: recent_window,
            reuse_cap: total_beats.div_ceil(2).max(1),
        }
    }

    pub fn record(&mut self, asset_id: &str) {
        *self.counts.entry(asset_id.to_string()).or_insert(0) += 1;
        self.recent.retain(|id| id != asset_id);
        self.recent.push_back(asset_id.to_string());
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
    }

    pub fn uses(&self, asset_id: &str) -> usize {
        self.counts.get(asset_id).copied().unwrap_or(0)
    }

    pub fn is_recent(&self, asset_id: &str) -> bool {
        self.recent.iter().any(|id| id == asset_id)
    }

    pub fn over_cap(&self, asset_id: &str) -> bool {
        self.uses(asset_id) >= self.reuse_cap
    }

    pub fn counts(&self) -> &HashMap<String, usize> {
        &self.counts
    }
}

fn tier(recommendation: Recommendation) -> u8 {
    match recommendation {
        Recommendation::Use => 0,
        Recommendation::Fallback => 1,
        Recommendation::Unknown | Recommendation::Skip => 2,
    }
}

/// Ordered candidates for one beat plus the hard rejects.
#[derive(Debug, Clone, Default)]
pub struct Ranking {
    pub pinned: Option<AssetCandidate>,
    pub ordered: Vec<AssetCandidate>,
    pub rejected: Vec<AttemptRecord>,
}

pub fn rank_candidates(
    beat: &BeatCandidates,
    manifest: &AssetManifest,
    usage: &UsageTracker,
) -> Ranking {
    let mut ranking = Ranking::default();

    let pinned_id = beat.pinned.as_deref().map(str::trim).filter(|id| !id.is_empty());
    if let Some(id) = pinned_id {
        let candidate = beat
            .candidates
            .iter()
            .find(|c| c.archive_item_id == id)
            .or_else(|| manifest.find_candidate(id))
            .cloned()
            .unwrap_or_else(|| AssetCandidate::new(id, Recommendation::Use));
        ranking.pinned = Some(candidate);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    if let Some(id) = pinned_id {
        seen.insert(id);
    }

    let mut keyed = Vec::new();
    for (index, candidate) in beat.candidates.iter().enumerate() {
        let id = candidate.archive_item_id.as_str();
        if !seen.insert(id) {
            continue;
        }
        if candidate.recommendation == Recommendation::Skip {
            ranking.rejected.push(AttemptRecord::new(id, "marked skip"));
            continue;
        }
        if candidate.has_text_overlay {
            ranking.rejected.push(AttemptRecord::new(id, "text overlay"));
            continue;
        }
        let key = (
            usage.over_cap(id),
            tier(candidate.recommendation),
            usage.uses(id),
            usage.is_recent(id),
            index,
        );
        keyed.push((key, candidate.clone()));
    }
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    ranking.ordered = keyed.into_iter().map(|(_, c)| c).collect();
    ranking
}

/// The result of selecting for one beat. `asset` is `None` when nothing
/// usable was found; `attempts` lists every rejection either way.
#[derive(Debug, Clone)]
pub struct SelectionOutcome {
    pub asset: Option<(AssetCandidate, CachedAsset)>,
    pub attempts: Vec<AttemptRecord>,
    pub from_stability_pool: bool,
}

pub struct Selector<'a> {
    fetcher: &'a dyn AssetFetcher,
    gate: &'a dyn QualityGate,
    download_attempts: u32,
}

impl<'a> Selector<'a> {
    pub fn new(fetcher: &'a dyn AssetFetcher, gate: &'a dyn QualityGate, download_attempts: u32) -> Self {
        Self {
            fetcher,
            gate,
            download_attempts: download_attempts.max(1),
        }
    }

    pub async fn select_asset(
        &self,
        beat: &BeatCandidates,
        manifest: &AssetManifest,
        usage: &UsageTracker,
    ) -> SelectionOutcome {
        let ranking = rank_candidates(beat, manifest, usage);
        let mut attempts = ranking.rejected.clone();
        let mut tried: HashSet<String> = HashSet::new();

        let ranked = ranking.pinned.iter().chain(ranking.ordered.iter());
        for candidate in ranked {
            tried.insert(candidate.archive_item_id.clone());
            if let Some(asset) = self.try_candidate(candidate, &mut attempts).await {
                return SelectionOutcome {
                    asset: Some((candidate.clone(), asset)),
                    attempts,
                    from_stability_pool: false,
                };
            }
        }

        let mut pool: Vec<AssetCandidate> = manifest
            .stability_pool()
            .into_iter()
            .filter(|c| !tried.contains(&c.archive_item_id))
            .collect();
        pool.sort_by_key(|c| (usage.over_cap(&c.archive_item_id), usage.uses(&c.archive_item_id)));
        if !pool.is_empty() {
            logw(format!(
                "Beat {}: ranked candidates exhausted; widening to {} manifest assets",
                beat.block_id,
                pool.len()
            ));
        }
        for candidate in &pool {
            if let Some(asset) = self.try_candidate(candidate, &mut attempts).await {
                return SelectionOutcome {
                    asset: Some((candidate.clone(), asset)),
                    attempts,
                    from_stability_pool: true,
                };
            }
        }

        logw(format!("Beat {}: no usable asset ({} rejections)", beat.block_id, attempts.len()));
        SelectionOutcome {
            asset: None,
            attempts,
            from_stability_pool: false,
        }
    }

    /// Download + stream check, retrying up to `download_attempts` times.
    /// Files failing the stream probe are evicted before the next try.
    async fn try_candidate(
        &self,
        candidate: &AssetCandidate,
        attempts: &mut Vec<AttemptRecord>,
    ) -> Option<CachedAsset> {
        let id = candidate.archive_item_id.as_str();
        let asset_ref = candidate.asset_ref();

        for attempt in 1..=self.download_attempts {
            let cached = match self.fetcher.fetch(&asset_ref).await {
                Ok(cached) => cached,
                Err(err) => {
                    attempts.push(AttemptRecord::new(id, format!("download failed: {}", err)));
                    if err.is_retryable() {
                        continue;
                    }
                    return None;
                }
            };

            match self.gate.has_video_stream(&cached.local_path).await {
                Ok(true) => {
                    logi(format!("Selected {} (attempt {})", id, attempt));
                    return Some(cached.verified());
                }
                Ok(false) => {
                    attempts.push(AttemptRecord::new(id, "no video stream"));
                }
                Err(err) => {
                    attempts.push(AttemptRecord::new(id, format!("stream probe failed: {}", err)));
                }
            }
            if let Err(err) = self.fetcher.evict(&cached).await {
                logw(format!("Could not evict {}: {}", cached.local_path.display(), err));
            }
        }
        None
    }
}
