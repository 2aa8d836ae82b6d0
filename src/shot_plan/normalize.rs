//! Coerces a loosely structured scene plan into draft scenes.
//!
//! Nothing in here fails: every input maps to a (possibly empty) list of
//! tagged outcomes plus warnings, and a plan can always be synthesized from
//! narration alone.

use super::{CutRhythm, Emotion, MAX_FOCUS_ENTITIES, ShotType};
use crate::narration::NarrationBlock;
use serde_json::{Map, Value};
use std::collections::HashSet;

pub const DEFAULT_SOURCE_PREFERENCE: &str = "archival";

const MIN_SYNTHETIC_SCENES: usize = 6;
const MAX_SYNTHETIC_SCENES: usize = 12;
const MIN_BLOCKS_PER_SYNTHETIC_SCENE: usize = 3;

const SHOT_TYPE_CUES: &[(ShotType, &[&str])] = &[
    (
        ShotType::MapsContext,
        &["map", "maps", "route", "routes", "border", "borders", "territory", "frontier", "campaign"],
    ),
    (
        ShotType::ArchivalDocuments,
        &["letter", "letters", "treaty", "document", "documents", "telegram", "newspaper", "decree", "signed"],
    ),
    (
        ShotType::TroopMovement,
        &["troops", "army", "armies", "soldiers", "march", "marched", "division", "regiment", "advance", "retreat"],
    ),
    (
        ShotType::PortraitsLeaders,
        &["general", "king", "queen", "emperor", "president", "minister", "leader", "commander", "tsar"],
    ),
    (
        ShotType::DestructionAftermath,
        &["fire", "fires", "ruins", "destroyed", "destruction", "bombed", "burned", "rubble"],
    ),
    (
        ShotType::CivilianLife,
        &["civilians", "families", "refugees", "villagers", "children", "crowds", "citizens"],
    ),
    (
        ShotType::IndustryLogistics,
        &["factory", "factories", "railway", "railroad", "supply", "supplies", "ships", "trains", "production"],
    ),
    (
        ShotType::CombatAction,
        &["battle", "attack", "assault", "fighting", "artillery", "siege", "offensive", "guns"],
    ),
];

/// A scene after normalization, before coverage repair and timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftScene {
    pub scene_id: Option<String>,
    pub narration_block_ids: Vec<String>,
    pub emotion: Emotion,
    pub cut_rhythm: CutRhythm,
    /// Empty means "infer from the scene text once coverage is known".
    pub shot_types: Vec<ShotType>,
    pub source_preference: String,
    pub focus_entities: Vec<String>,
    pub narration_summary: Option<String>,
}

impl DraftScene {
    fn synthetic(block_ids: Vec<String>, shot_types: Vec<ShotType>) -> Self {
        Self {
            scene_id: None,
            narration_block_ids: block_ids,
            emotion: Emotion::default(),
            cut_rhythm: CutRhythm::default(),
            shot_types,
            source_preference: DEFAULT_SOURCE_PREFERENCE.to_string(),
            focus_entities: Vec::new(),
            narration_summary: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneOutcome {
    /// Every required field was present and in range.
    Valid(DraftScene),
    /// Usable after coercion; `repairs` lists what was changed.
    Repaired {
        scene: DraftScene,
        repairs: Vec<String>,
    },
    /// Generated from narration alone.
    Synthetic(DraftScene),
}

impl SceneOutcome {
    pub fn scene(&self) -> &DraftScene {
        match self {
            Self::Valid(scene) | Self::Synthetic(scene) => scene,
            Self::Repaired { scene, .. } => scene,
        }
    }

    pub fn into_scene(self) -> DraftScene {
        match self {
            Self::Valid(scene) | Self::Synthetic(scene) => scene,
            Self::Repaired { scene, .. } => scene,
        }
    }

    pub fn repairs(&self) -> &[String] {
        match self {
            Self::Repaired { repairs, .. } => repairs,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedPlan {
    pub outcomes: Vec<SceneOutcome>,
    pub warnings: Vec<String>,
}

/// Normalize whatever the creative step produced.
///
/// Accepts `{"scenes": [...]}`, a bare array of scenes, or either of those
/// encoded as a JSON string.
pub fn normalize_scene_plan(raw: Option<&Value>) -> NormalizedPlan {
    let mut plan = NormalizedPlan::default();

    let Some(raw) = raw else {
        plan.warnings.push("no scene plan supplied".to_string());
        return plan;
    };

    let decoded;
    let raw = match raw {
        Value::String(text) => match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                decoded = value;
                &decoded
            }
            Err(_) => {
                plan.warnings
                    .push("scene plan is a string but not valid JSON".to_string());
                return plan;
            }
        },
        other => other,
    };

    let entries = match raw {
        Value::Array(items) => items,
        Value::Object(obj) => match obj.get("scenes") {
            Some(Value::Array(items)) => items,
            _ => {
                plan.warnings
                    .push("scene plan object has no scenes array".to_string());
                return plan;
            }
        },
        _ => {
            plan.warnings
                .push("scene plan is not a structured object".to_string());
            return plan;
        }
    };

    for (idx, entry) in entries.iter().enumerate() {
        match entry {
            Value::Object(obj) => plan.outcomes.push(normalize_scene(obj)),
            _ => plan
                .warnings
                .push(format!("scene entry {} is not an object; dropped", idx + 1)),
        }
    }

    plan
}

fn normalize_scene(obj: &Map<String, Value>) -> SceneOutcome {
    let mut repairs = Vec::new();

    let scene_id = match obj.get("scene_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(_) => {
            repairs.push("scene_id invalid; regenerated".to_string());
            None
        }
        None => None,
    };

    let ids_value = obj.get("narration_block_ids").or_else(|| obj.get("block_ids"));
    let narration_block_ids = match ids_value {
        Some(value) => {
            let (ids, changed) = coerce_string_list(value);
            if changed {
                repairs.push("narration_block_ids coerced".to_string());
            }
            ids
        }
        None => {
            repairs.push("narration_block_ids missing".to_string());
            Vec::new()
        }
    };

    let emotion = match obj.get("emotion").and_then(Value::as_str).map(Emotion::parse) {
        Some(Some(e)) => e,
        _ => {
            repairs.push("emotion defaulted to neutral".to_string());
            Emotion::default()
        }
    };

    let cut_rhythm = match obj
        .get("cut_rhythm")
        .and_then(Value::as_str)
        .map(CutRhythm::parse)
    {
        Some(Some(r)) => r,
        _ => {
            repairs.push("cut_rhythm defaulted to medium".to_string());
            CutRhythm::default()
        }
    };

    let shot_types = match obj.get("shot_types") {
        Some(value) => {
            let (raw_types, _) = coerce_string_list(value);
            let mut types: Vec<ShotType> = Vec::new();
            let mut dropped = 0usize;
            for raw in &raw_types {
                match ShotType::parse(raw) {
                    Some(t) if !types.contains(&t) => types.push(t),
                    Some(_) => {}
                    None => dropped += 1,
                }
            }
            if dropped > 0 {
                repairs.push(format!("{} unknown shot_types dropped", dropped));
            }
            if types.is_empty() {
                repairs.push("shot_types empty; will be inferred".to_string());
            }
            types
        }
        None => {
            repairs.push("shot_types missing; will be inferred".to_string());
            Vec::new()
        }
    };

    let source_preference = match obj.get("source_preference") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(_) => {
            repairs.push("source_preference invalid; defaulted".to_string());
            DEFAULT_SOURCE_PREFERENCE.to_string()
        }
        None => DEFAULT_SOURCE_PREFERENCE.to_string(),
    };

    let focus_entities = match obj.get("focus_entities") {
        Some(value) => {
            let (mut entities, changed) = coerce_string_list(value);
            if changed {
                repairs.push("focus_entities coerced".to_string());
            }
            if entities.len() > MAX_FOCUS_ENTITIES {
                entities.truncate(MAX_FOCUS_ENTITIES);
                repairs.push(format!("focus_entities truncated to {}", MAX_FOCUS_ENTITIES));
            }
            entities
        }
        None => Vec::new(),
    };

    let narration_summary = match obj.get("narration_summary") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::String(_)) | None => None,
        Some(_) => {
            repairs.push("narration_summary invalid; regenerated".to_string());
            None
        }
    };

    let scene = DraftScene {
        scene_id,
        narration_block_ids,
        emotion,
        cut_rhythm,
        shot_types,
        source_preference,
        focus_entities,
        narration_summary,
    };

    if repairs.is_empty() {
        SceneOutcome::Valid(scene)
    } else {
        SceneOutcome::Repaired { scene, repairs }
    }
}

/// Ordered, de-duplicated, trimmed strings from an arbitrary JSON value.
///
/// The flag is set when anything had to be dropped or converted.
pub fn coerce_string_list(value: &Value) -> (Vec<String>, bool) {
    let mut out: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    let mut changed = false;

    let mut push = |raw: String, out: &mut Vec<String>, changed: &mut bool| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            *changed = true;
            return;
        }
        if seen.insert(trimmed.to_string()) {
            out.push(trimmed.to_string());
        } else {
            *changed = true;
        }
    };

    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::String(s) => push(s.clone(), &mut out, &mut changed),
                    Value::Number(n) => {
                        changed = true;
                        push(n.to_string(), &mut out, &mut changed);
                    }
                    _ => changed = true,
                }
            }
        }
        Value::String(s) => {
            changed = true;
            for part in s.split(',') {
                push(part.to_string(), &mut out, &mut changed);
            }
        }
        Value::Number(n) => {
            changed = true;
            push(n.to_string(), &mut out, &mut changed);
        }
        _ => changed = true,
    }

    (out, changed)
}

/// Keyword-cue shot type inference. The filler type is always included.
pub fn infer_shot_types(text: &str) -> Vec<ShotType> {
    let tokens: HashSet<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect();

    let mut types: Vec<ShotType> = SHOT_TYPE_CUES
        .iter()
        .filter(|(_, cues)| cues.iter().any(|cue| tokens.contains(*cue)))
        .map(|(t, _)| *t)
        .collect();
    types.push(ShotType::FILLER);
    types
}

/// Blocks per synthetic scene for `n` narration blocks.
pub fn synthetic_chunk_size(n: usize) -> usize {
    if n == 0 {
        return MIN_BLOCKS_PER_SYNTHETIC_SCENE;
    }
    let target = ((n as f64 / 3.0).round() as usize).clamp(MIN_SYNTHETIC_SCENES, MAX_SYNTHETIC_SCENES);
    n.div_ceil(target).max(MIN_BLOCKS_PER_SYNTHETIC_SCENE)
}

/// Deterministic plan built from narration alone.
pub fn synthesize_scene_plan(blocks: &[NarrationBlock]) -> Vec<SceneOutcome> {
    if blocks.is_empty() {
        return Vec::new();
    }
    let chunk = synthetic_chunk_size(blocks.len());
    blocks
        .chunks(chunk)
        .map(|group| {
            let text = group
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let ids = group.iter().map(|b| b.block_id.clone()).collect();
            SceneOutcome::Synthetic(DraftScene::synthetic(ids, infer_shot_types(&text)))
        })
        .collect()
}

/// Single scene spanning every block; the last resort when nothing else survives.
pub fn fallback_scene(blocks: &[NarrationBlock]) -> SceneOutcome {
    let text = blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    let ids = blocks.iter().map(|b| b.block_id.clone()).collect();
    SceneOutcome::Synthetic(DraftScene::synthetic(ids, infer_shot_types(&text)))
}
