use archival_montage::narration::NarrationBlock;
use archival_montage::shot_plan::guardrail::TopicAnchorGuardrail;
use archival_montage::shot_plan::{
    KEYWORDS_PER_SCENE, QUERIES_PER_SCENE, ShotPlan, compile, load_validated_plan, validate,
    validate_plan, write_plan_document,
};
use serde_json::{Value, json};
use std::collections::HashSet;

const WPM: u32 = 150;

fn narration(n: usize) -> Vec<NarrationBlock> {
    (1..=n)
        .map(|i| {
            NarrationBlock::new(
                format!("b{}", i),
                format!(
                    "In 1917 the convoys of the Royal Navy escorted merchant ships across the Atlantic, voyage {}.",
                    i
                ),
            )
        })
        .collect()
}

fn compile_plan(blocks: &[NarrationBlock], raw: Option<&Value>) -> ShotPlan {
    compile(blocks, raw, WPM, &TopicAnchorGuardrail).unwrap().plan
}

fn assert_coverage(plan: &ShotPlan, blocks: &[NarrationBlock]) {
    let mut seen = HashSet::new();
    for id in plan.block_order() {
        assert!(seen.insert(id.to_string()), "{} covered twice", id);
    }
    let expected: HashSet<String> = blocks.iter().map(|b| b.block_id.clone()).collect();
    assert_eq!(seen, expected);
}

fn assert_timeline(plan: &ShotPlan) {
    assert_eq!(plan.scenes[0].start_sec, 0);
    for pair in plan.scenes.windows(2) {
        assert_eq!(pair[1].start_sec, pair[0].end_sec);
    }
    for scene in &plan.scenes {
        assert!(scene.end_sec > scene.start_sec);
    }
    assert_eq!(plan.total_duration_sec, plan.scenes.last().unwrap().end_sec);
}

fn assert_counts(plan: &ShotPlan) {
    for scene in &plan.scenes {
        assert_eq!(scene.keywords.len(), KEYWORDS_PER_SCENE);
        assert_eq!(scene.search_queries.len(), QUERIES_PER_SCENE);
    }
}

#[test]
fn nine_blocks_without_scene_plan_become_three_valid_scenes() {
    let blocks = narration(9);
    let plan = compile_plan(&blocks, None);

    assert_eq!(plan.scenes.len(), 3);
    assert_eq!(plan.total_scenes, 3);
    assert_coverage(&plan, &blocks);
    assert_timeline(&plan);
    assert_counts(&plan);
    assert!(validate_plan(&plan, &blocks).is_ok());
}

#[test]
fn malformed_scene_plans_still_compile_to_valid_plans() {
    let blocks = narration(7);
    let inputs = [
        json!("not a plan"),
        json!({ "scenes": [] }),
        json!({ "scenes": [{ "narration_block_ids": ["zz", 5, null] }] }),
        json!([{ "block_ids": ["b3", "b1"], "emotion": "furious", "shot_types": ["nonsense"] }]),
        json!({ "scenes": [{ "scene_id": "a", "narration_block_ids": ["b1"] }, { "scene_id": "a" }] }),
    ];

    for raw in &inputs {
        let plan = compile_plan(&blocks, Some(raw));
        assert_coverage(&plan, &blocks);
        assert_timeline(&plan);
        assert_counts(&plan);
        validate_plan(&plan, &blocks).unwrap_or_else(|err| panic!("{} rejected: {}", raw, err));
    }
}

#[test]
fn duplicate_reference_keeps_first_and_orphan_goes_last() {
    let blocks = narration(4);
    let raw = json!({
        "scenes": [
            { "scene_id": "opening", "narration_block_ids": ["b1", "b2"] },
            { "scene_id": "closing", "narration_block_ids": ["b2", "b3"] }
        ]
    });
    let plan = compile_plan(&blocks, Some(&raw));

    assert_eq!(plan.scenes.len(), 2);
    assert_eq!(plan.scenes[0].narration_block_ids, vec!["b1", "b2"]);
    assert_eq!(plan.scenes[1].narration_block_ids, vec!["b3", "b4"]);
    assert_coverage(&plan, &blocks);
    assert!(validate_plan(&plan, &blocks).is_ok());
}

#[test]
fn compiling_twice_is_byte_identical() {
    let blocks = narration(11);
    let raw = json!({
        "scenes": [
            { "narration_block_ids": ["b1", "b2", "b3"], "focus_entities": ["Royal Navy"] },
            { "narration_block_ids": ["b4", "b5", "b6", "b7"] }
        ]
    });

    let first = serde_json::to_string(&compile_plan(&blocks, Some(&raw))).unwrap();
    let second = serde_json::to_string(&compile_plan(&blocks, Some(&raw))).unwrap();
    assert_eq!(first, second);
}

#[test]
fn persisted_plan_round_trips_through_the_validator() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plans/shot_plan.json");
    let blocks = narration(5);
    let plan = compile_plan(&blocks, None);

    write_plan_document(&path, &plan).unwrap();
    let loaded = load_validated_plan(&path, &blocks).unwrap();
    assert_eq!(loaded.plan(), &plan);
}

#[test]
fn tampered_documents_are_rejected_with_codes() {
    let blocks = narration(6);
    let plan = compile_plan(&blocks, None);
    let document = json!({ "shot_plan": serde_json::to_value(&plan).unwrap() });

    let mut gap = document.clone();
    gap["shot_plan"]["scenes"][1]["start_sec"] = json!(999);
    assert_eq!(
        validate(&gap, &blocks).unwrap_err().code(),
        "SHOTPLAN_NON_MONOTONIC_TIMING"
    );

    let mut fractional = document.clone();
    fractional["shot_plan"]["scenes"][0]["end_sec"] = json!(4.5);
    assert_eq!(
        validate(&fractional, &blocks).unwrap_err().code(),
        "SHOTPLAN_NON_INTEGER_TIMING"
    );

    let mut short = document.clone();
    short["shot_plan"]["scenes"][0]["keywords"] = json!(["convoy"]);
    assert_eq!(
        validate(&short, &blocks).unwrap_err().code(),
        "SHOTPLAN_KEYWORD_COUNT"
    );

    let more_blocks = narration(7);
    assert_eq!(
        validate(&document, &more_blocks).unwrap_err().code(),
        "SHOTPLAN_COVERAGE_GAP"
    );
}
