use crate::assembler::ClipHold;
use crate::cutter::Subclip;
use crate::error::{AttemptRecord, BuildError};
use crate::logw;
use crate::panzoom::Effect;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Ok,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipRecord {
    pub sequence: usize,
    pub in_sec: f64,
    pub out_sec: f64,
    pub effect: Effect,
    pub output: String,
    /// Frozen-frame seconds before / after the clip on the final timeline.
    #[serde(default)]
    pub hold_before_sec: f64,
    #[serde(default)]
    pub hold_after_sec: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatReport {
    pub block_id: String,
    pub scene_id: String,
    pub duration_sec: f64,
    pub selected_asset: Option<String>,
    #[serde(default)]
    pub from_stability_pool: bool,
    #[serde(default)]
    pub clips: Vec<ClipRecord>,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
}

/// Everything a build did, persisted next to the video as
/// `<name>.report.json` whether the build succeeded or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompilationReport {
    pub name: String,
    pub status: BuildStatus,
    pub error_code: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub plan_version: String,
    pub total_scenes: usize,
    pub beats: Vec<BeatReport>,
    pub asset_reuse: BTreeMap<String, usize>,
    pub coverage: f64,
    pub warnings: Vec<String>,
    pub music: Option<String>,
    pub output: Option<String>,
}

impl CompilationReport {
    pub fn new(name: impl Into<String>, plan_version: impl Into<String>, total_scenes: usize) -> Self {
        Self {
            name: name.into(),
            status: BuildStatus::Running,
            error_code: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            plan_version: plan_version.into(),
            total_scenes,
            beats: Vec::new(),
            asset_reuse: BTreeMap::new(),
            coverage: 0.0,
            warnings: Vec::new(),
            music: None,
            output: None,
        }
    }

    /// Record a degraded-but-acceptable condition (also logged).
    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        logw(&message);
        self.warnings.push(message);
    }

    pub fn beat_mut(&mut self, block_id: &str) -> Option<&mut BeatReport> {
        self.beats.iter_mut().find(|b| b.block_id == block_id)
    }

    /// Attach produced clips (and their frame holds, if any) to their
    /// beats, paths relative to `base`.
    pub fn record_clips(&mut self, clips: &[Subclip], holds: &[ClipHold], base: &Path) {
        for (idx, clip) in clips.iter().enumerate() {
            let hold = holds.get(idx).copied().unwrap_or_default();
            let output = relative_display(&clip.output_path, base);
            if let Some(beat) = self.beat_mut(&clip.block_id) {
                beat.clips.push(ClipRecord {
                    sequence: clip.sequence,
                    in_sec: clip.in_sec,
                    out_sec: clip.out_sec,
                    effect: clip.effect,
                    output,
                    hold_before_sec: hold.lead_secs,
                    hold_after_sec: hold.tail_secs,
                });
            }
        }
    }

    /// Share of beats that ended up with at least one clip.
    pub fn compute_coverage(&mut self) -> f64 {
        let total = self.beats.len();
        let covered = self.beats.iter().filter(|b| !b.clips.is_empty()).count();
        self.coverage = if total == 0 { 0.0 } else { covered as f64 / total as f64 };
        self.coverage
    }

    pub fn finish_ok(&mut self, output: &Path, base: &Path) {
        self.output = Some(relative_display(output, base));
        self.status = if self.warnings.is_empty() {
            BuildStatus::Ok
        } else {
            BuildStatus::Degraded
        };
        self.finished_at = Some(Utc::now());
    }

    pub fn finish_failed(&mut self, err: &BuildError) {
        self.status = BuildStatus::Failed;
        self.error_code = Some(err.code().to_string());
        self.error = Some(err.to_string());
        for failure in err.beat_failures() {
            if let Some(beat) = self.beat_mut(&failure.block_id) {
                for attempt in &failure.attempts {
                    if !beat.attempts.contains(attempt) {
                        beat.attempts.push(attempt.clone());
                    }
                }
            }
        }
        self.finished_at = Some(Utc::now());
    }

    /// Atomically write `<output_dir>/<name>.report.json`.
    pub fn write_to(&self, output_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;
        let path = report_path(output_dir, &self.name);
        let json = serde_json::to_string_pretty(self).context("Failed to serialize report")?;

        let mut tmp = tempfile::NamedTempFile::new_in(output_dir)
            .with_context(|| format!("Failed to create temp file in {}", output_dir.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write report {}", path.display()))?;
        Ok(path)
    }
}

pub fn report_path(output_dir: &Path, name: &str) -> PathBuf {
    output_dir.join(format!("{}.report.json", name))
}

fn relative_display(path: &Path, base: &Path) -> String {
    pathdiff::diff_paths(path, base)
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BeatFailure;

    fn beat(id: &str) -> BeatReport {
        BeatReport {
            block_id: id.to_string(),
            scene_id: "scene_01".to_string(),
            duration_sec: 4.0,
            selected_asset: None,
            from_stability_pool: false,
            clips: Vec::new(),
            attempts: Vec::new(),
        }
    }

    #[test]
    fn warnings_make_a_build_degraded() {
        let mut report = CompilationReport::new("ep1", "shot_plan.v1", 1);
        report.beats.push(beat("b1"));
        report.finish_ok(Path::new("/out/ep1.mp4"), Path::new("/out"));
        assert_eq!(report.status, BuildStatus::Ok);
        assert_eq!(report.output.as_deref(), Some("ep1.mp4"));

        report.warn("no background music found");
        report.finish_ok(Path::new("/out/ep1.mp4"), Path::new("/out"));
        assert_eq!(report.status, BuildStatus::Degraded);
    }

    #[test]
    fn failure_carries_code_and_attempts() {
        let mut report = CompilationReport::new("ep1", "shot_plan.v1", 1);
        report.beats.push(beat("b1"));
        let err = BuildError::NoVisualAssets {
            beats: vec![BeatFailure {
                block_id: "b1".to_string(),
                attempts: vec![AttemptRecord::new("x:a", "marked skip")],
            }],
        };
        report.finish_failed(&err);
        assert_eq!(report.status, BuildStatus::Failed);
        assert_eq!(report.error_code.as_deref(), Some("NO_VISUAL_ASSETS"));
        assert_eq!(report.beats[0].attempts.len(), 1);
    }

    #[test]
    fn coverage_counts_beats_with_clips() {
        let mut report = CompilationReport::new("ep1", "shot_plan.v1", 1);
        report.beats.push(beat("b1"));
        report.beats.push(beat("b2"));
        report.beats[0].clips.push(ClipRecord {
            sequence: 0,
            in_sec: 30.0,
            out_sec: 34.0,
            effect: Effect::None,
            output: "b1_0.mp4".to_string(),
            hold_before_sec: 0.0,
            hold_after_sec: 0.0,
        });
        assert_eq!(report.compute_coverage(), 0.5);
    }

    #[test]
    fn report_is_written_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let report = CompilationReport::new("ep1", "shot_plan.v1", 0);
        let path = report.write_to(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("ep1.report.json"));
        let text = std::fs::read_to_string(path).unwrap();
        let back: CompilationReport = serde_json::from_str(&text).unwrap();
        assert_eq!(back.status, BuildStatus::Running);
    }
}
