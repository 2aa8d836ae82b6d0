//! Hard gate between the compiler and everything downstream.
//!
//! Works on the JSON document rather than the typed plan so that a
//! hand-edited or foreign document with fractional timings is caught too.

use super::{
    KEYWORD_WORDS, KEYWORDS_PER_SCENE, QUERIES_PER_SCENE, QUERY_WORDS, SHOT_PLAN_SOURCE,
    SHOT_PLAN_VERSION, ShotPlan,
};
use crate::error::ValidationError;
use crate::narration::NarrationBlock;
use crate::timing::word_count;
use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::Path;

/// A shot plan that passed [`validate`]. Only obtainable through validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPlan {
    plan: ShotPlan,
}

impl ValidatedPlan {
    pub fn plan(&self) -> &ShotPlan {
        &self.plan
    }

    pub fn into_inner(self) -> ShotPlan {
        self.plan
    }
}

/// Validate a plan document (`{"shot_plan": {...}}` or the bare plan).
pub fn validate(document: &Value, blocks: &[NarrationBlock]) -> Result<ValidatedPlan, ValidationError> {
    let plan = document.get("shot_plan").unwrap_or(document);
    let obj = plan
        .as_object()
        .ok_or_else(|| ValidationError::Malformed("shot plan is not an object".to_string()))?;

    let version = string_field(obj, "version")?;
    if version != SHOT_PLAN_VERSION {
        return Err(ValidationError::BadVersion {
            found: version.to_string(),
            expected: SHOT_PLAN_VERSION.to_string(),
        });
    }
    let source = string_field(obj, "source")?;
    if source != SHOT_PLAN_SOURCE {
        return Err(ValidationError::BadSource {
            found: source.to_string(),
            expected: SHOT_PLAN_SOURCE.to_string(),
        });
    }

    let scenes = obj
        .get("scenes")
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::Malformed("scenes is not an array".to_string()))?;
    if scenes.is_empty() {
        return Err(ValidationError::NoScenes);
    }

    let mut covered: HashSet<&str> = HashSet::new();
    let mut prev_end: Option<u64> = None;

    for (idx, scene) in scenes.iter().enumerate() {
        let n = idx + 1;
        let scene = scene
            .as_object()
            .ok_or_else(|| ValidationError::Malformed(format!("scene {} is not an object", n)))?;

        let start = integer_field(scene, "start_sec", n)?;
        let end = integer_field(scene, "end_sec", n)?;
        if end <= start {
            return Err(ValidationError::NonMonotonicTiming {
                scene: n,
                detail: format!("end_sec {} <= start_sec {}", end, start),
            });
        }
        if let Some(prev) = prev_end {
            if start != prev {
                return Err(ValidationError::NonMonotonicTiming {
                    scene: n,
                    detail: format!("start_sec {} != previous end_sec {}", start, prev),
                });
            }
        }
        prev_end = Some(end);

        check_terms(scene, "keywords", n, KEYWORDS_PER_SCENE, &KEYWORD_WORDS)?;
        check_terms(scene, "search_queries", n, QUERIES_PER_SCENE, &QUERY_WORDS)?;

        let ids = scene
            .get("narration_block_ids")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ValidationError::Malformed(format!("scene {} narration_block_ids missing", n))
            })?;
        if ids.is_empty() && !blocks.is_empty() {
            return Err(ValidationError::EmptyScene { scene: n });
        }
        for id in ids {
            let id = id.as_str().ok_or_else(|| {
                ValidationError::Malformed(format!("scene {} has a non-string block id", n))
            })?;
            if !covered.insert(id) {
                return Err(ValidationError::DuplicateBlock {
                    block_id: id.to_string(),
                });
            }
        }
    }

    let missing: Vec<String> = blocks
        .iter()
        .filter(|b| !covered.contains(b.block_id.as_str()))
        .map(|b| b.block_id.clone())
        .collect();
    if !missing.is_empty() {
        return Err(ValidationError::CoverageGap { missing });
    }

    let typed: ShotPlan = serde_json::from_value(plan.clone())
        .map_err(|err| ValidationError::Malformed(err.to_string()))?;
    if typed.total_scenes != typed.scenes.len() {
        return Err(ValidationError::Malformed(format!(
            "total_scenes {} does not match {} scenes",
            typed.total_scenes,
            typed.scenes.len()
        )));
    }

    Ok(ValidatedPlan { plan: typed })
}

/// Validate an in-memory plan through the same document checks.
pub fn validate_plan(plan: &ShotPlan, blocks: &[NarrationBlock]) -> Result<ValidatedPlan, ValidationError> {
    let document = serde_json::to_value(plan)
        .map_err(|err| ValidationError::Malformed(err.to_string()))?;
    validate(&document, blocks)
}

/// Read a plan document from disk and validate it before anything can use it.
pub fn load_validated_plan(path: &Path, blocks: &[NarrationBlock]) -> Result<ValidatedPlan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read shot plan: {}", path.display()))?;
    let document: Value = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse shot plan: {}", path.display()))?;
    let validated = validate(&document, blocks)
        .with_context(|| format!("Shot plan rejected: {}", path.display()))?;
    Ok(validated)
}

fn string_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a str, ValidationError> {
    obj.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::Malformed(format!("{} missing or not a string", key)))
}

fn integer_field(
    scene: &Map<String, Value>,
    key: &'static str,
    n: usize,
) -> Result<u64, ValidationError> {
    scene
        .get(key)
        .and_then(Value::as_u64)
        .ok_or(ValidationError::NonIntegerTiming {
            scene: n,
            field: key,
        })
}

fn check_terms(
    scene: &Map<String, Value>,
    field: &'static str,
    n: usize,
    expected: usize,
    bounds: &RangeInclusive<usize>,
) -> Result<(), ValidationError> {
    let terms = scene
        .get(field)
        .and_then(Value::as_array)
        .ok_or_else(|| ValidationError::Malformed(format!("scene {} {} missing", n, field)))?;

    if terms.len() != expected {
        return Err(if field == "keywords" {
            ValidationError::KeywordCount {
                scene: n,
                found: terms.len(),
                expected,
            }
        } else {
            ValidationError::QueryCount {
                scene: n,
                found: terms.len(),
                expected,
            }
        });
    }

    for term in terms {
        let text = term.as_str().unwrap_or("").trim();
        if text.is_empty() {
            return Err(ValidationError::EmptyTerm { scene: n, field });
        }
        let words = word_count(text);
        if !bounds.contains(&words) {
            return Err(ValidationError::TermLength {
                scene: n,
                field,
                term: text.to_string(),
                words,
                min: *bounds.start(),
                max: *bounds.end(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shot_plan::compile;
    use crate::shot_plan::guardrail::TopicAnchorGuardrail;
    use serde_json::json;

    fn blocks(n: usize) -> Vec<NarrationBlock> {
        (1..=n)
            .map(|i| NarrationBlock::new(format!("b{}", i), format!("Paris in 1871 saw block {} of the Commune.", i)))
            .collect()
    }

    fn compiled_doc(n: usize) -> Value {
        let out = compile(&blocks(n), None, 150, &TopicAnchorGuardrail).unwrap();
        json!({ "shot_plan": out.plan })
    }

    fn code_of(doc: &Value, n: usize) -> &'static str {
        validate(doc, &blocks(n)).unwrap_err().code()
    }

    #[test]
    fn compiled_plan_passes() {
        let doc = compiled_doc(9);
        let validated = validate(&doc, &blocks(9)).unwrap();
        assert_eq!(validated.plan().scenes.len(), 3);
        assert!(validate(&doc["shot_plan"], &blocks(9)).is_ok());
    }

    #[test]
    fn wrong_tags_are_rejected() {
        let mut doc = compiled_doc(3);
        doc["shot_plan"]["version"] = json!("shot_plan.v0");
        assert_eq!(code_of(&doc, 3), "SHOTPLAN_BAD_VERSION");

        let mut doc = compiled_doc(3);
        doc["shot_plan"]["source"] = json!("llm");
        assert_eq!(code_of(&doc, 3), "SHOTPLAN_BAD_SOURCE");
    }

    #[test]
    fn empty_scene_list_is_rejected() {
        let mut doc = compiled_doc(3);
        doc["shot_plan"]["scenes"] = json!([]);
        assert_eq!(code_of(&doc, 3), "SHOTPLAN_NO_SCENES");
    }

    #[test]
    fn fractional_timing_is_rejected() {
        let mut doc = compiled_doc(3);
        doc["shot_plan"]["scenes"][0]["end_sec"] = json!(4.5);
        assert_eq!(code_of(&doc, 3), "SHOTPLAN_NON_INTEGER_TIMING");
    }

    #[test]
    fn overlapping_timing_is_rejected() {
        let mut doc = compiled_doc(9);
        let end0 = doc["shot_plan"]["scenes"][0]["end_sec"].as_u64().unwrap();
        doc["shot_plan"]["scenes"][1]["start_sec"] = json!(end0 - 1);
        assert_eq!(code_of(&doc, 9), "SHOTPLAN_NON_MONOTONIC_TIMING");
    }

    #[test]
    fn term_counts_are_exact() {
        let mut doc = compiled_doc(3);
        doc["shot_plan"]["scenes"][0]["keywords"]
            .as_array_mut()
            .unwrap()
            .pop();
        assert_eq!(code_of(&doc, 3), "SHOTPLAN_KEYWORD_COUNT");

        let mut doc = compiled_doc(3);
        doc["shot_plan"]["scenes"][0]["search_queries"]
            .as_array_mut()
            .unwrap()
            .push(json!("one more query that is fine"));
        assert_eq!(code_of(&doc, 3), "SHOTPLAN_QUERY_COUNT");

        let mut doc = compiled_doc(3);
        doc["shot_plan"]["scenes"][0]["keywords"][3] = json!("  ");
        assert_eq!(code_of(&doc, 3), "SHOTPLAN_EMPTY_TERM");
    }

    #[test]
    fn coverage_gaps_and_duplicates_are_rejected() {
        let doc = compiled_doc(3);
        let err = validate(&doc, &blocks(4)).unwrap_err();
        assert_eq!(err, ValidationError::CoverageGap { missing: vec!["b4".to_string()] });

        let mut doc = compiled_doc(9);
        doc["shot_plan"]["scenes"][1]["narration_block_ids"]
            .as_array_mut()
            .unwrap()
            .push(json!("b1"));
        assert_eq!(code_of(&doc, 9), "SHOTPLAN_DUPLICATE_BLOCK");
    }

    #[test]
    fn load_validated_plan_reads_written_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        let out = compile(&blocks(5), None, 150, &TopicAnchorGuardrail).unwrap();
        crate::shot_plan::write_plan_document(&path, &out.plan).unwrap();
        let loaded = load_validated_plan(&path, &blocks(5)).unwrap();
        assert_eq!(loaded.into_inner(), out.plan);
    }
}
