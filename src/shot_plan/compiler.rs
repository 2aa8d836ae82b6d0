use super::guardrail::QueryGuardrail;
use super::keywords::{Anchors, draft_queries, extract_anchors, finalize_queries, generate_keywords, summarize};
use super::normalize::{
    DraftScene, SceneOutcome, fallback_scene, infer_shot_types, normalize_scene_plan,
    synthesize_scene_plan,
};
use super::{Scene, ShotPlan};
use crate::error::CompileError;
use crate::narration::NarrationBlock;
use crate::timing::scene_seconds;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Guardrail passes allowed to rewrite a query list before it is taken as-is.
const MAX_GUARDRAIL_PASSES: usize = 2;

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub plan: ShotPlan,
    pub warnings: Vec<String>,
}

/// Compile narration plus an optional, possibly malformed scene plan into a shot plan.
///
/// Malformed creative input is absorbed into warnings; the only error is an
/// unavailable query guardrail.
pub fn compile(
    blocks: &[NarrationBlock],
    raw_plan: Option<&Value>,
    words_per_minute: u32,
    guardrail: &dyn QueryGuardrail,
) -> Result<CompileOutput, CompileError> {
    let mut warnings = Vec::new();

    let normalized = normalize_scene_plan(raw_plan);
    warnings.extend(normalized.warnings);
    for (idx, outcome) in normalized.outcomes.iter().enumerate() {
        for repair in outcome.repairs() {
            warnings.push(format!("scene {}: {}", idx + 1, repair));
        }
    }

    let mut outcomes = normalized.outcomes;
    let usable = outcomes
        .iter()
        .any(|o| !o.scene().narration_block_ids.is_empty());
    if !usable {
        if raw_plan.is_some() {
            warnings.push("scene plan has no usable scenes; synthesized from narration".to_string());
        }
        outcomes = synthesize_scene_plan(blocks);
    }

    let drafts: Vec<DraftScene> = outcomes.into_iter().map(SceneOutcome::into_scene).collect();
    let (mut drafts, coverage_warnings) = repair_coverage(drafts, blocks);
    warnings.extend(coverage_warnings);

    if drafts.is_empty() && !blocks.is_empty() {
        warnings.push("no scene survived coverage repair; synthesized from narration".to_string());
        let synthetic = synthesize_scene_plan(blocks)
            .into_iter()
            .map(SceneOutcome::into_scene)
            .collect();
        drafts = repair_coverage(synthetic, blocks).0;
    }
    if drafts.is_empty() {
        warnings.push("no narration blocks; emitting a single fallback scene".to_string());
        drafts.push(fallback_scene(blocks).into_scene());
    }

    let text_by_id: HashMap<&str, &str> = blocks
        .iter()
        .map(|b| (b.block_id.as_str(), b.text.as_str()))
        .collect();

    let mut used_ids = HashSet::new();
    let mut scenes = Vec::with_capacity(drafts.len());
    let mut cursor = 0u32;

    for (idx, draft) in drafts.into_iter().enumerate() {
        let texts: Vec<&str> = draft
            .narration_block_ids
            .iter()
            .filter_map(|id| text_by_id.get(id.as_str()).copied())
            .collect();
        let scene_text = texts.join(" ");

        let duration = scene_seconds(texts.iter().copied(), words_per_minute);
        let start_sec = cursor;
        let end_sec = start_sec + duration;
        cursor = end_sec;

        let shot_types = if draft.shot_types.is_empty() {
            infer_shot_types(&scene_text)
        } else {
            draft.shot_types
        };

        let anchors = extract_anchors(&scene_text, &draft.focus_entities);
        let keywords = generate_keywords(&anchors, &shot_types);
        let scene_label = format!("scene {}", idx + 1);
        let search_queries = guard_queries(
            draft_queries(&scene_text, &anchors, &shot_types),
            &scene_text,
            &anchors,
            guardrail,
            &scene_label,
            &mut warnings,
        )?;

        scenes.push(Scene {
            scene_id: unique_scene_id(draft.scene_id, idx, &mut used_ids),
            narration_block_ids: draft.narration_block_ids,
            emotion: draft.emotion,
            cut_rhythm: draft.cut_rhythm,
            shot_types,
            source_preference: draft.source_preference,
            focus_entities: draft.focus_entities,
            start_sec,
            end_sec,
            narration_summary: summarize(&scene_text, draft.narration_summary.as_deref()),
            keywords,
            search_queries,
        });
    }

    debug!(scenes = scenes.len(), warnings = warnings.len(), "shot plan compiled");
    Ok(CompileOutput {
        plan: ShotPlan::new(words_per_minute, scenes),
        warnings,
    })
}

/// Assign every narration block to exactly one scene.
///
/// Scenes claim blocks in plan order; a block already claimed is ignored,
/// unknown ids are dropped, scenes left empty are removed, and unclaimed
/// blocks go to the last surviving scene.
pub fn repair_coverage(
    drafts: Vec<DraftScene>,
    blocks: &[NarrationBlock],
) -> (Vec<DraftScene>, Vec<String>) {
    let mut warnings = Vec::new();
    let position: HashMap<&str, usize> = blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.block_id.as_str(), i))
        .collect();
    let mut consumed = vec![false; blocks.len()];
    let mut survivors: Vec<DraftScene> = Vec::new();

    for (scene_idx, mut draft) in drafts.into_iter().enumerate() {
        let mut claimed: Vec<usize> = Vec::new();
        for id in &draft.narration_block_ids {
            match position.get(id.as_str()) {
                Some(&pos) if !consumed[pos] => {
                    consumed[pos] = true;
                    claimed.push(pos);
                }
                Some(_) => warnings.push(format!(
                    "scene {}: block {} already assigned; duplicate reference ignored",
                    scene_idx + 1,
                    id
                )),
                None => warnings.push(format!(
                    "scene {}: unknown block {} dropped",
                    scene_idx + 1,
                    id
                )),
            }
        }

        if claimed.is_empty() {
            warnings.push(format!("scene {}: no blocks left; scene dropped", scene_idx + 1));
            continue;
        }

        claimed.sort_unstable();
        draft.narration_block_ids = claimed
            .into_iter()
            .map(|pos| blocks[pos].block_id.clone())
            .collect();
        survivors.push(draft);
    }

    let orphans: Vec<String> = blocks
        .iter()
        .zip(&consumed)
        .filter(|(_, taken)| !**taken)
        .map(|(b, _)| b.block_id.clone())
        .collect();

    if !orphans.is_empty() {
        if let Some(last) = survivors.last_mut() {
            warnings.push(format!(
                "{} unreferenced blocks appended to the last scene: {:?}",
                orphans.len(),
                orphans
            ));
            last.narration_block_ids.extend(orphans);
        }
    }

    (survivors, warnings)
}

fn guard_queries(
    drafted: Vec<String>,
    scene_text: &str,
    anchors: &Anchors,
    guardrail: &dyn QueryGuardrail,
    scene_label: &str,
    warnings: &mut Vec<String>,
) -> Result<Vec<String>, CompileError> {
    let mut current = drafted;
    for pass in 1..=MAX_GUARDRAIL_PASSES {
        let verdict = guardrail
            .validate(&current, scene_text)
            .map_err(|err| CompileError::GuardrailUnavailable(err.to_string()))?;
        current = verdict.queries;
        if verdict.accepted {
            break;
        }
        for diag in verdict.diagnostics {
            warnings.push(format!("{} guardrail pass {}: {}", scene_label, pass, diag));
        }
    }
    Ok(finalize_queries(&current, anchors))
}

fn unique_scene_id(provided: Option<String>, idx: usize, used: &mut HashSet<String>) -> String {
    let base = provided.unwrap_or_else(|| format!("scene_{:02}", idx + 1));
    let mut candidate = base.clone();
    let mut n = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{}_{}", base, n);
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shot_plan::guardrail::{GuardrailError, GuardrailVerdict, TopicAnchorGuardrail};
    use crate::shot_plan::{KEYWORDS_PER_SCENE, QUERIES_PER_SCENE, ShotType};
    use serde_json::json;

    fn blocks(n: usize) -> Vec<NarrationBlock> {
        (1..=n)
            .map(|i| {
                NarrationBlock::new(
                    format!("b{}", i),
                    format!("In 1916 the armies near Verdun fought for hill number {} under heavy fire.", i),
                )
            })
            .collect()
    }

    struct OfflineGuardrail;

    impl QueryGuardrail for OfflineGuardrail {
        fn validate(&self, _: &[String], _: &str) -> Result<GuardrailVerdict, GuardrailError> {
            Err(GuardrailError::Unavailable("service down".to_string()))
        }
    }

    /// Always rejects and returns nothing, forcing the fallback padding.
    struct EmptyingGuardrail;

    impl QueryGuardrail for EmptyingGuardrail {
        fn validate(&self, _: &[String], _: &str) -> Result<GuardrailVerdict, GuardrailError> {
            Ok(GuardrailVerdict {
                queries: Vec::new(),
                accepted: false,
                diagnostics: vec!["all queries rejected".to_string()],
            })
        }
    }

    fn ids(scene: &Scene) -> Vec<&str> {
        scene.narration_block_ids.iter().map(String::as_str).collect()
    }

    #[test]
    fn nine_blocks_without_plan_yield_three_scenes() {
        let out = compile(&blocks(9), None, 150, &TopicAnchorGuardrail).unwrap();
        assert_eq!(out.plan.scenes.len(), 3);
        assert_eq!(out.plan.total_scenes, 3);
        let covered: Vec<&str> = out.plan.block_order().collect();
        assert_eq!(covered, vec!["b1", "b2", "b3", "b4", "b5", "b6", "b7", "b8", "b9"]);
    }

    #[test]
    fn duplicate_reference_keeps_first_occurrence() {
        let raw = json!({"scenes": [
            {"scene_id": "a", "narration_block_ids": ["b1", "b2"]},
            {"scene_id": "b", "narration_block_ids": ["b2", "b3"]}
        ]});
        let out = compile(&blocks(4), Some(&raw), 150, &TopicAnchorGuardrail).unwrap();
        let scenes = &out.plan.scenes;
        assert_eq!(scenes.len(), 2);
        assert_eq!(ids(&scenes[0]), vec!["b1", "b2"]);
        assert_eq!(ids(&scenes[1]), vec!["b3", "b4"]);
        assert!(out.warnings.iter().any(|w| w.contains("duplicate reference")));
    }

    #[test]
    fn emptied_scenes_are_dropped_and_orphans_appended() {
        let raw = json!([
            {"narration_block_ids": ["b3", "b1"]},
            {"narration_block_ids": ["b1", "ghost"]},
            {"narration_block_ids": ["b5"]}
        ]);
        let out = compile(&blocks(6), Some(&raw), 150, &TopicAnchorGuardrail).unwrap();
        let scenes = &out.plan.scenes;
        assert_eq!(scenes.len(), 2);
        assert_eq!(ids(&scenes[0]), vec!["b1", "b3"]);
        assert_eq!(ids(&scenes[1]), vec!["b5", "b2", "b4", "b6"]);
    }

    #[test]
    fn unusable_plan_falls_back_to_synthesis() {
        let raw = json!({"scenes": [{"narration_block_ids": ["nope"]}]});
        let out = compile(&blocks(9), Some(&raw), 150, &TopicAnchorGuardrail).unwrap();
        assert_eq!(out.plan.scenes.len(), 3);
    }

    #[test]
    fn zero_blocks_yield_single_fallback_scene() {
        let out = compile(&[], None, 150, &TopicAnchorGuardrail).unwrap();
        assert_eq!(out.plan.scenes.len(), 1);
        let scene = &out.plan.scenes[0];
        assert_eq!(scene.start_sec, 0);
        assert_eq!(scene.end_sec, 2);
        assert_eq!(scene.keywords.len(), KEYWORDS_PER_SCENE);
        assert_eq!(scene.search_queries.len(), QUERIES_PER_SCENE);
    }

    #[test]
    fn timeline_is_contiguous() {
        let out = compile(&blocks(20), None, 150, &TopicAnchorGuardrail).unwrap();
        let scenes = &out.plan.scenes;
        assert!(scenes[0].start_sec == 0);
        for pair in scenes.windows(2) {
            assert_eq!(pair[1].start_sec, pair[0].end_sec);
        }
        for s in scenes {
            assert!(s.end_sec > s.start_sec);
        }
        assert_eq!(out.plan.total_duration_sec, scenes.last().unwrap().end_sec);
    }

    #[test]
    fn shot_types_are_inferred_when_missing() {
        let raw = json!([{"narration_block_ids": ["b1"], "shot_types": ["bogus"]}]);
        let out = compile(&blocks(1), Some(&raw), 150, &TopicAnchorGuardrail).unwrap();
        let types = &out.plan.scenes[0].shot_types;
        assert!(types.contains(&ShotType::CombatAction) || types.contains(&ShotType::DestructionAftermath));
        assert!(types.contains(&ShotType::FILLER));
    }

    #[test]
    fn compile_is_idempotent() {
        let raw = json!({"scenes": [{"narration_block_ids": ["b1", "b2"], "emotion": "hope"}]});
        let a = compile(&blocks(7), Some(&raw), 150, &TopicAnchorGuardrail).unwrap();
        let b = compile(&blocks(7), Some(&raw), 150, &TopicAnchorGuardrail).unwrap();
        assert_eq!(
            serde_json::to_string(&a.plan).unwrap(),
            serde_json::to_string(&b.plan).unwrap()
        );
    }

    #[test]
    fn unavailable_guardrail_is_fatal() {
        let err = compile(&blocks(3), None, 150, &OfflineGuardrail).unwrap_err();
        assert!(matches!(err, CompileError::GuardrailUnavailable(_)));
    }

    #[test]
    fn emptied_queries_are_padded_back_to_five() {
        let out = compile(&blocks(3), None, 150, &EmptyingGuardrail).unwrap();
        for scene in &out.plan.scenes {
            assert_eq!(scene.search_queries.len(), QUERIES_PER_SCENE);
        }
        assert!(out.warnings.iter().any(|w| w.contains("all queries rejected")));
    }

    #[test]
    fn scene_ids_are_unique() {
        let raw = json!([
            {"scene_id": "x", "narration_block_ids": ["b1"]},
            {"scene_id": "x", "narration_block_ids": ["b2"]}
        ]);
        let out = compile(&blocks(2), Some(&raw), 150, &TopicAnchorGuardrail).unwrap();
        assert_eq!(out.plan.scenes[0].scene_id, "x");
        assert_eq!(out.plan.scenes[1].scene_id, "x_2");
    }
}
