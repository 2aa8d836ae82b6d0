//! Error types for plan compilation, media fetching and the build pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the shot plan compiler.
///
/// Malformed creative input never shows up here; only a missing required
/// collaborator does.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("query guardrail unavailable: {0}")]
    GuardrailUnavailable(String),
}

/// Hard-gate rejections of a shot plan document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("shot plan document is malformed: {0}")]
    Malformed(String),

    #[error("unexpected shot plan version {found:?} (expected {expected:?})")]
    BadVersion { found: String, expected: String },

    #[error("unexpected shot plan source {found:?} (expected {expected:?})")]
    BadSource { found: String, expected: String },

    #[error("shot plan has no scenes")]
    NoScenes,

    #[error("scene {scene} has a non-integer {field}")]
    NonIntegerTiming { scene: usize, field: &'static str },

    #[error("scene {scene} timing is not monotonic: {detail}")]
    NonMonotonicTiming { scene: usize, detail: String },

    #[error("scene {scene} has {found} keywords (expected {expected})")]
    KeywordCount {
        scene: usize,
        found: usize,
        expected: usize,
    },

    #[error("scene {scene} has {found} search queries (expected {expected})")]
    QueryCount {
        scene: usize,
        found: usize,
        expected: usize,
    },

    #[error("scene {scene} has an empty {field} entry")]
    EmptyTerm { scene: usize, field: &'static str },

    #[error("scene {scene} {field} entry {term:?} has {words} words (allowed {min}-{max})")]
    TermLength {
        scene: usize,
        field: &'static str,
        term: String,
        words: usize,
        min: usize,
        max: usize,
    },

    #[error("scene {scene} covers no narration blocks")]
    EmptyScene { scene: usize },

    #[error("narration block {block_id} appears in more than one scene")]
    DuplicateBlock { block_id: String },

    #[error("narration blocks missing from scene coverage: {missing:?}")]
    CoverageGap { missing: Vec<String> },
}

impl ValidationError {
    /// Stable diagnostic code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "SHOTPLAN_MALFORMED",
            Self::BadVersion { .. } => "SHOTPLAN_BAD_VERSION",
            Self::BadSource { .. } => "SHOTPLAN_BAD_SOURCE",
            Self::NoScenes => "SHOTPLAN_NO_SCENES",
            Self::NonIntegerTiming { .. } => "SHOTPLAN_NON_INTEGER_TIMING",
            Self::NonMonotonicTiming { .. } => "SHOTPLAN_NON_MONOTONIC_TIMING",
            Self::KeywordCount { .. } => "SHOTPLAN_KEYWORD_COUNT",
            Self::QueryCount { .. } => "SHOTPLAN_QUERY_COUNT",
            Self::EmptyTerm { .. } => "SHOTPLAN_EMPTY_TERM",
            Self::TermLength { .. } => "SHOTPLAN_TERM_LENGTH",
            Self::EmptyScene { .. } => "SHOTPLAN_EMPTY_SCENE",
            Self::DuplicateBlock { .. } => "SHOTPLAN_DUPLICATE_BLOCK",
            Self::CoverageGap { .. } => "SHOTPLAN_COVERAGE_GAP",
        }
    }
}

/// Errors from resolving or downloading a media asset.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not resolve a media URL for {item_id}: {message}")]
    Unresolvable { item_id: String, message: String },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("asset {item_id} is {size} bytes, above the {limit} byte ceiling")]
    TooLarge {
        item_id: String,
        size: u64,
        limit: u64,
    },

    #[error("download of {item_id} produced an empty file")]
    EmptyFile { item_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether fetching the same asset again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Unresolvable { .. } | Self::TooLarge { .. } => false,
            Self::HttpStatus { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            Self::Http(_) | Self::EmptyFile { .. } | Self::Io(_) => true,
        }
    }
}

/// Errors from running ffmpeg / ffprobe.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("{tool} failed: {message}")]
    ToolFailed {
        tool: &'static str,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("{tool} timed out after {secs} seconds")]
    Timeout { tool: &'static str, secs: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaError {
    pub fn tool_failed(
        tool: &'static str,
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::ToolFailed {
            tool,
            message: message.into(),
            stderr,
            exit_code,
        }
    }
}

/// One rejected attempt at using an asset for a beat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub asset_id: String,
    pub reason: String,
}

impl AttemptRecord {
    pub fn new(asset_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            reason: reason.into(),
        }
    }
}

/// Everything that went wrong for a single beat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeatFailure {
    pub block_id: String,
    pub attempts: Vec<AttemptRecord>,
}

/// Fatal build outcomes.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("shot plan rejected: {0}")]
    InvalidPlan(#[from] ValidationError),

    #[error("no visual assets usable for any of {} beats", .beats.len())]
    NoVisualAssets { beats: Vec<BeatFailure> },

    #[error("no clips produced ({} beats attempted)", .beats.len())]
    NoClipsProduced { beats: Vec<BeatFailure> },

    #[error("concatenation failed: {0}")]
    ConcatFailed(String),

    #[error("build cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("another build holds the lock at {0}")]
    Locked(PathBuf),

    #[error("media tool error: {0}")]
    Media(#[from] MediaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BuildError {
    /// Stable diagnostic code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPlan(inner) => inner.code(),
            Self::NoVisualAssets { .. } => "NO_VISUAL_ASSETS",
            Self::NoClipsProduced { .. } => "NO_CLIPS_PRODUCED",
            Self::ConcatFailed(_) => "CONCAT_FAILED",
            Self::Cancelled { .. } => "BUILD_CANCELLED",
            Self::Locked(_) => "BUILD_LOCKED",
            Self::Media(_) => "MEDIA_TOOL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
        }
    }

    /// Per-beat diagnostics, when the failure carries them.
    pub fn beat_failures(&self) -> &[BeatFailure] {
        match self {
            Self::NoVisualAssets { beats } | Self::NoClipsProduced { beats } => beats,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_error_codes_are_stable() {
        let err = BuildError::NoVisualAssets { beats: vec![] };
        assert_eq!(err.code(), "NO_VISUAL_ASSETS");

        let err = BuildError::from(ValidationError::NoScenes);
        assert_eq!(err.code(), "SHOTPLAN_NO_SCENES");
    }

    #[test]
    fn fetch_retryability() {
        let too_large = FetchError::TooLarge {
            item_id: "x".to_string(),
            size: 2,
            limit: 1,
        };
        assert!(!too_large.is_retryable());
        let not_found = FetchError::HttpStatus {
            status: 404,
            url: "u".to_string(),
        };
        assert!(!not_found.is_retryable());
        let busy = FetchError::HttpStatus {
            status: 503,
            url: "u".to_string(),
        };
        assert!(busy.is_retryable());
        assert!(FetchError::EmptyFile { item_id: "x".to_string() }.is_retryable());
    }

    #[test]
    fn beat_failures_exposes_diagnostics() {
        let err = BuildError::NoClipsProduced {
            beats: vec![BeatFailure {
                block_id: "b1".to_string(),
                attempts: vec![AttemptRecord::new("wikimedia:A.webm", "no video stream")],
            }],
        };
        assert_eq!(err.beat_failures().len(), 1);
        assert_eq!(err.beat_failures()[0].attempts[0].reason, "no video stream");
    }
}
