//! Shot plan data model and the compiler / validator that produce it.

pub mod compiler;
pub mod guardrail;
pub mod keywords;
pub mod normalize;
pub mod validate;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::ops::RangeInclusive;
use std::path::Path;

pub use compiler::{CompileOutput, compile};
pub use validate::{ValidatedPlan, load_validated_plan, validate, validate_plan};

pub const SHOT_PLAN_VERSION: &str = "shot_plan.v1";
pub const SHOT_PLAN_SOURCE: &str = "deterministic_compiler";

pub const KEYWORDS_PER_SCENE: usize = 8;
pub const QUERIES_PER_SCENE: usize = 5;
pub const KEYWORD_WORDS: RangeInclusive<usize> = 2..=5;
pub const QUERY_WORDS: RangeInclusive<usize> = 5..=9;
pub const MAX_FOCUS_ENTITIES: usize = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    Tension,
    Tragedy,
    Hope,
    Victory,
    Mystery,
}

impl Emotion {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "neutral" => Some(Self::Neutral),
            "tension" => Some(Self::Tension),
            "tragedy" => Some(Self::Tragedy),
            "hope" => Some(Self::Hope),
            "victory" => Some(Self::Victory),
            "mystery" => Some(Self::Mystery),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutRhythm {
    Slow,
    #[default]
    Medium,
    Fast,
}

impl CutRhythm {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "slow" => Some(Self::Slow),
            "medium" => Some(Self::Medium),
            "fast" => Some(Self::Fast),
            _ => None,
        }
    }
}

/// Closed set of shot categories a scene can ask the asset search for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShotType {
    MapsContext,
    ArchivalDocuments,
    TroopMovement,
    PortraitsLeaders,
    DestructionAftermath,
    CivilianLife,
    IndustryLogistics,
    CombatAction,
    EstablishingLandscape,
}

impl ShotType {
    pub const ALL: [ShotType; 9] = [
        ShotType::MapsContext,
        ShotType::ArchivalDocuments,
        ShotType::TroopMovement,
        ShotType::PortraitsLeaders,
        ShotType::DestructionAftermath,
        ShotType::CivilianLife,
        ShotType::IndustryLogistics,
        ShotType::CombatAction,
        ShotType::EstablishingLandscape,
    ];

    /// Always present in inferred sets so a scene is never without a shot type.
    pub const FILLER: ShotType = ShotType::EstablishingLandscape;

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MapsContext => "maps_context",
            Self::ArchivalDocuments => "archival_documents",
            Self::TroopMovement => "troop_movement",
            Self::PortraitsLeaders => "portraits_leaders",
            Self::DestructionAftermath => "destruction_aftermath",
            Self::CivilianLife => "civilian_life",
            Self::IndustryLogistics => "industry_logistics",
            Self::CombatAction => "combat_action",
            Self::EstablishingLandscape => "establishing_landscape",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let wanted = raw.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == wanted)
    }
}

/// A compiled scene on the shot plan timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    pub scene_id: String,
    pub narration_block_ids: Vec<String>,
    pub emotion: Emotion,
    pub cut_rhythm: CutRhythm,
    pub shot_types: Vec<ShotType>,
    pub source_preference: String,
    pub focus_entities: Vec<String>,
    pub start_sec: u32,
    pub end_sec: u32,
    pub narration_summary: String,
    pub keywords: Vec<String>,
    pub search_queries: Vec<String>,
}

impl Scene {
    pub fn duration_sec(&self) -> u32 {
        self.end_sec.saturating_sub(self.start_sec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assumptions {
    pub words_per_minute: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShotPlan {
    pub version: String,
    pub source: String,
    pub assumptions: Assumptions,
    pub scenes: Vec<Scene>,
    pub total_scenes: usize,
    pub total_duration_sec: u32,
}

impl ShotPlan {
    pub fn new(words_per_minute: u32, scenes: Vec<Scene>) -> Self {
        let total_duration_sec = scenes.last().map(|s| s.end_sec).unwrap_or(0);
        Self {
            version: SHOT_PLAN_VERSION.to_string(),
            source: SHOT_PLAN_SOURCE.to_string(),
            assumptions: Assumptions { words_per_minute },
            total_scenes: scenes.len(),
            total_duration_sec,
            scenes,
        }
    }

    /// Block ids in timeline order (scene order, then in-scene order).
    pub fn block_order(&self) -> impl Iterator<Item = &str> + '_ {
        self.scenes
            .iter()
            .flat_map(|s| s.narration_block_ids.iter().map(String::as_str))
    }
}

/// Persisted form: `{"shot_plan": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShotPlanDocument {
    pub shot_plan: ShotPlan,
}

/// Write the plan document atomically (temp file in the same directory, then rename).
pub fn write_plan_document(path: &Path, plan: &ShotPlan) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let doc = ShotPlanDocument {
        shot_plan: plan.clone(),
    };
    let body = serde_json::to_vec_pretty(&doc)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(&body)?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to persist shot plan to {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!(Emotion::parse(" Tragedy "), Some(Emotion::Tragedy));
        assert_eq!(Emotion::parse("joy"), None);
        assert_eq!(CutRhythm::parse("FAST"), Some(CutRhythm::Fast));
        assert_eq!(ShotType::parse("maps_context"), Some(ShotType::MapsContext));
        assert_eq!(ShotType::parse("drone_shot"), None);
    }

    #[test]
    fn shot_type_serializes_snake_case() {
        let json = serde_json::to_string(&ShotType::DestructionAftermath).unwrap();
        assert_eq!(json, "\"destruction_aftermath\"");
        for t in ShotType::ALL {
            assert_eq!(serde_json::to_string(&t).unwrap(), format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn write_plan_document_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plans/plan.json");
        let plan = ShotPlan::new(150, vec![]);
        write_plan_document(&path, &plan).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let doc: ShotPlanDocument = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc.shot_plan.version, SHOT_PLAN_VERSION);
        assert_eq!(doc.shot_plan.assumptions.words_per_minute, 150);
    }
}
