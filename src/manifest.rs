use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio::fs;

/// Upstream verdict on a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Use,
    Fallback,
    Skip,
    #[default]
    #[serde(other)]
    Unknown,
}

/// A proposed media asset for one beat, as ranked by the search layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCandidate {
    /// Source-prefixed id, e.g. `wikimedia:File.webm`.
    pub archive_item_id: String,
    #[serde(default)]
    pub thumbnail_url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub media_type: String,
    #[serde(default)]
    pub recommendation: Recommendation,
    #[serde(default)]
    pub has_text_overlay: bool,
    /// Canonical media URL when the search layer already knows it.
    #[serde(default)]
    pub url: Option<String>,
    /// Primary/reusable assets bypass the download size ceiling.
    #[serde(default)]
    pub primary: bool,
}

impl AssetCandidate {
    pub fn new(archive_item_id: impl Into<String>, recommendation: Recommendation) -> Self {
        Self {
            archive_item_id: archive_item_id.into(),
            thumbnail_url: String::new(),
            title: String::new(),
            media_type: String::new(),
            recommendation,
            has_text_overlay: false,
            url: None,
            primary: false,
        }
    }

    pub fn asset_ref(&self) -> AssetRef {
        AssetRef {
            item_id: self.archive_item_id.clone(),
            url: self.url.clone(),
            primary: self.primary,
        }
    }

    /// Never selectable by ranking: marked skip or carrying burned-in text.
    pub fn is_hard_rejected(&self) -> bool {
        self.recommendation == Recommendation::Skip || self.has_text_overlay
    }
}

/// What the cache needs to fetch an asset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetRef {
    pub item_id: String,
    pub url: Option<String>,
    pub primary: bool,
}

impl AssetRef {
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            url: None,
            primary: false,
        }
    }

    /// Identity used for content addressing: the URL when known, else the id.
    pub fn canonical(&self) -> &str {
        self.url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .unwrap_or(&self.item_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatCandidates {
    pub block_id: String,
    /// User-pinned asset id; wins whenever it is technically usable.
    #[serde(default)]
    pub pinned: Option<String>,
    #[serde(default)]
    pub candidates: Vec<AssetCandidate>,
}

/// Resolved-asset manifest: ranked candidates per narration block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetManifest {
    #[serde(default)]
    pub beats: Vec<BeatCandidates>,
}

impl AssetManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).with_context(|| "Failed to parse asset manifest JSON")
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read manifest: {}", path.as_ref().display()))?;
        Self::from_json(&text)
    }

    pub fn for_block(&self, block_id: &str) -> Option<&BeatCandidates> {
        self.beats.iter().find(|b| b.block_id == block_id)
    }

    /// Every selectable candidate in the manifest, first occurrence per id.
    ///
    /// This is the widened pool a beat falls back to when its own ranked
    /// candidates are exhausted.
    pub fn stability_pool(&self) -> Vec<AssetCandidate> {
        let mut seen = HashSet::new();
        self.beats
            .iter()
            .flat_map(|b| b.candidates.iter())
            .filter(|c| !c.is_hard_rejected())
            .filter(|c| seen.insert(c.archive_item_id.clone()))
            .cloned()
            .collect()
    }

    /// Look up a candidate by id anywhere in the manifest.
    pub fn find_candidate(&self, item_id: &str) -> Option<&AssetCandidate> {
        self.beats
            .iter()
            .flat_map(|b| b.candidates.iter())
            .find(|c| c.archive_item_id == item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_with_defaults() {
        let text = r#"{"beats":[{"block_id":"b1","pinned":"wikimedia:P.jpg","candidates":[
            {"archive_item_id":"wikimedia:A.webm","recommendation":"use"},
            {"archive_item_id":"archive:reel42","recommendation":"maybe","has_text_overlay":true}
        ]}]}"#;
        let manifest = AssetManifest::from_json(text).unwrap();
        let beat = manifest.for_block("b1").unwrap();
        assert_eq!(beat.pinned.as_deref(), Some("wikimedia:P.jpg"));
        assert_eq!(beat.candidates[0].recommendation, Recommendation::Use);
        assert_eq!(beat.candidates[1].recommendation, Recommendation::Unknown);
        assert!(beat.candidates[1].is_hard_rejected());
    }

    #[test]
    fn stability_pool_excludes_hard_rejects_and_duplicates() {
        let mut skip = AssetCandidate::new("x:skip", Recommendation::Skip);
        skip.title = "skip me".to_string();
        let manifest = AssetManifest {
            beats: vec![
                BeatCandidates {
                    block_id: "b1".to_string(),
                    pinned: None,
                    candidates: vec![AssetCandidate::new("x:a", Recommendation::Use), skip],
                },
                BeatCandidates {
                    block_id: "b2".to_string(),
                    pinned: None,
                    candidates: vec![
                        AssetCandidate::new("x:a", Recommendation::Fallback),
                        AssetCandidate::new("x:b", Recommendation::Unknown),
                    ],
                },
            ],
        };
        let ids: Vec<String> = manifest
            .stability_pool()
            .into_iter()
            .map(|c| c.archive_item_id)
            .collect();
        assert_eq!(ids, vec!["x:a".to_string(), "x:b".to_string()]);
    }

    #[test]
    fn canonical_prefers_url() {
        let mut r = AssetRef::new("wikimedia:A.webm");
        assert_eq!(r.canonical(), "wikimedia:A.webm");
        r.url = Some("https://upload.wikimedia.org/a.webm".to_string());
        assert_eq!(r.canonical(), "https://upload.wikimedia.org/a.webm");
    }
}
