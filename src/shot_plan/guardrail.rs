//! Query guardrails: keep search queries anchored to the scene's topic.

use super::QUERY_WORDS;
use super::keywords::{extract_anchors, is_stopword};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("guardrail unavailable: {0}")]
    Unavailable(String),
}

/// Result of one guardrail pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardrailVerdict {
    /// Queries as the guardrail wants them (possibly rewritten).
    pub queries: Vec<String>,
    /// True when the input already satisfied every rule.
    pub accepted: bool,
    pub diagnostics: Vec<String>,
}

/// Synchronous validator every compiled query list must pass through.
pub trait QueryGuardrail: Send + Sync {
    fn validate(
        &self,
        queries: &[String],
        scene_text: &str,
    ) -> Result<GuardrailVerdict, GuardrailError>;
}

/// Requires every query to share at least one significant token with the
/// scene text; rewrites offenders by prefixing the scene's anchor.
#[derive(Debug, Clone, Copy, Default)]
pub struct TopicAnchorGuardrail;

fn significant_tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 4 && !is_stopword(w))
        .map(str::to_lowercase)
        .collect()
}

impl QueryGuardrail for TopicAnchorGuardrail {
    fn validate(
        &self,
        queries: &[String],
        scene_text: &str,
    ) -> Result<GuardrailVerdict, GuardrailError> {
        let topic = significant_tokens(scene_text);
        let anchor = extract_anchors(scene_text, &[]).primary().to_string();
        let mut diagnostics = Vec::new();
        let mut out = Vec::with_capacity(queries.len());

        for query in queries {
            let trimmed = query.trim();
            if trimmed.is_empty() {
                diagnostics.push("empty query removed".to_string());
                continue;
            }
            if topic.is_empty() || !significant_tokens(trimmed).is_disjoint(&topic) {
                out.push(trimmed.to_string());
                continue;
            }
            let rewritten = format!("{} {}", anchor, trimmed)
                .split_whitespace()
                .take(*QUERY_WORDS.end())
                .collect::<Vec<_>>()
                .join(" ");
            diagnostics.push(format!("query {:?} not anchored; rewritten", trimmed));
            out.push(rewritten);
        }

        Ok(GuardrailVerdict {
            accepted: diagnostics.is_empty(),
            queries: out,
            diagnostics,
        })
    }
}
