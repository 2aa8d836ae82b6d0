//! Compilation builder: validated shot plan + asset manifest -> video.
//!
//! Phases run `init -> downloading -> cutting -> assembly -> done`; any
//! failure lands in `failed` with the report still written. Downloads and
//! cuts fan out under their own caps; selection and assembly are serial.

use crate::api::MediaKind;
use crate::assembler::{AssemblyRequest, BeatSlot, MusicBed, NarrationSegment, TimelineAssembler};
use crate::cache::{AssetCache, AssetFetcher, CachedAsset, DownloadProgress};
use crate::config::BuildConfig;
use crate::cutter::{ClipCutter, ClipWindow, CutRequest, Subclip, WindowTracker, clip_count};
use crate::error::{AttemptRecord, BeatFailure, BuildError, FetchError};
use crate::ffmpeg::{CommandRunner, SystemRunner};
use crate::lock::BuildLockGuard;
use crate::manifest::{AssetCandidate, AssetManifest, BeatCandidates};
use crate::narration::{NarrationBlock, block_audio_path};
use crate::progress::{Phase, ProgressHandle, ProgressReporter};
use crate::quality::{FfmpegQualityGate, QualityGate};
use crate::report::{BeatReport, CompilationReport};
use crate::selector::{Selector, UsageTracker, rank_candidates};
use crate::shot_plan::ValidatedPlan;
use crate::timing::estimate_seconds_f64;
use crate::{logi, logok, logw, stable_seed};
use futures_util::stream::{self, StreamExt};
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use walkdir::WalkDir;

pub const MUSIC_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav"];

/// Shortest visual segment a beat is given.
const MIN_BEAT_SECS: f64 = 1.0;

const MIB: f64 = 1024.0 * 1024.0;

fn file_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() { "untitled".to_string() } else { cleaned }
}

/// The collaborators a build talks to.
#[derive(Clone)]
pub struct BuildServices {
    pub fetcher: Arc<dyn AssetFetcher>,
    pub gate: Arc<dyn QualityGate>,
    pub runner: Arc<dyn CommandRunner>,
}

impl BuildServices {
    /// Real cache, ffprobe-backed gate and subprocess runner. Download byte
    /// counts go to `downloads` when given.
    pub fn system(cfg: &BuildConfig, downloads: Option<DownloadProgress>) -> Result<Self, FetchError> {
        let mut cache = AssetCache::new(cfg)?;
        if let Some(progress) = downloads {
            cache = cache.with_progress(progress);
        }
        Ok(Self {
            fetcher: Arc::new(cache),
            gate: Arc::new(FfmpegQualityGate),
            runner: Arc::new(SystemRunner),
        })
    }
}

/// Forward per-download byte counts into a build's `downloading` events.
pub fn download_progress(handle: ProgressHandle) -> DownloadProgress {
    Arc::new(move |item_id: &str, written: u64, total: Option<u64>| {
        let message = match total {
            Some(total) => format!(
                "Downloading {}: {:.1}/{:.1} MiB",
                item_id,
                written as f64 / MIB,
                total as f64 / MIB
            ),
            None => format!("Downloading {}: {:.1} MiB", item_id, written as f64 / MIB),
        };
        handle.detail(
            Phase::Downloading,
            message,
            json!({ "item_id": item_id, "bytes": written, "total_bytes": total }),
        );
    })
}

pub struct BuildRequest<'a> {
    /// Output base name (`<output_dir>/<name>.mp4`).
    pub name: &'a str,
    pub plan: &'a ValidatedPlan,
    pub blocks: &'a [NarrationBlock],
    pub manifest: &'a AssetManifest,
    /// Directory holding `<block_id>.{wav,mp3,m4a}` voice-over files.
    pub audio_dir: Option<&'a Path>,
}

#[derive(Debug)]
pub struct BuildOutput {
    pub video: PathBuf,
    pub report_path: Option<PathBuf>,
    pub report: CompilationReport,
}

#[derive(Debug, Clone)]
struct Beat {
    block_id: String,
    duration: f64,
    audio: Option<PathBuf>,
}

type Selection = Option<(AssetCandidate, CachedAsset)>;

pub struct CompilationBuilder {
    cfg: BuildConfig,
    services: BuildServices,
    cancel: Arc<AtomicBool>,
}

impl CompilationBuilder {
    pub fn new(cfg: BuildConfig, services: BuildServices) -> Self {
        Self {
            cfg,
            services,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the flag aborts the build at the next beat boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn check_cancelled(&self, phase: Phase) -> Result<(), BuildError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(BuildError::Cancelled {
                phase: phase.as_str().to_string(),
            });
        }
        Ok(())
    }

    fn work_dir(&self, name: &str) -> PathBuf {
        self.cfg.work_dir.join(file_safe(name))
    }

    /// Run a full build. The lock guard is proof that no other build is
    /// mutating the same work directory.
    pub async fn run(
        &self,
        _lock: &BuildLockGuard,
        req: BuildRequest<'_>,
        progress: &ProgressReporter,
    ) -> Result<BuildOutput, BuildError> {
        let plan = req.plan.plan();
        let mut report = CompilationReport::new(file_safe(req.name), &plan.version, plan.scenes.len());
        progress.emit(
            Phase::Init,
            0.0,
            format!("Starting build {}", req.name),
            json!({ "scenes": plan.scenes.len(), "blocks": req.blocks.len() }),
        );

        match self.execute(&req, &mut report, progress).await {
            Ok(video) => {
                report.finish_ok(&video, &self.cfg.output_dir);
                let report_path = self.persist_report(&report);
                self.cleanup(&self.work_dir(req.name)).await;
                logok(format!("Build {} finished: {:?}", req.name, report.status));
                progress.emit(
                    Phase::Done,
                    1.0,
                    format!("Wrote {}", video.display()),
                    json!({ "status": report.status, "coverage": report.coverage }),
                );
                Ok(BuildOutput {
                    video,
                    report_path,
                    report,
                })
            }
            Err(err) => {
                report.finish_failed(&err);
                self.persist_report(&report);
                logw(format!("Build {} failed [{}]: {}", req.name, err.code(), err));
                progress.emit(Phase::Failed, 1.0, err.to_string(), json!({ "code": err.code() }));
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        req: &BuildRequest<'_>,
        report: &mut CompilationReport,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, BuildError> {
        let clips_dir = self.work_dir(req.name).join("clips");
        fs::create_dir_all(&clips_dir).await?;
        fs::create_dir_all(&self.cfg.cache_dir).await?;
        fs::create_dir_all(&self.cfg.output_dir).await?;

        let beats = self.collect_beats(req, report).await;
        logi(format!("Build {}: {} beats", req.name, beats.len()));

        self.check_cancelled(Phase::Downloading)?;
        self.prefetch(req.manifest, &beats, progress).await;
        let selections = self.select_assets(req.manifest, &beats, report, progress).await?;

        self.check_cancelled(Phase::Cutting)?;
        let clips = self.cut_clips(&clips_dir, &beats, &selections, report, progress).await?;

        self.check_cancelled(Phase::Assembly)?;
        self.assemble(req.name, &beats, clips, report, progress).await
    }

    /// Beats in plan order, timed by their voice-over file when one exists.
    async fn collect_beats(&self, req: &BuildRequest<'_>, report: &mut CompilationReport) -> Vec<Beat> {
        let texts: HashMap<&str, &str> = req
            .blocks
            .iter()
            .map(|b| (b.block_id.as_str(), b.text.as_str()))
            .collect();

        let mut beats = Vec::new();
        let mut missing_audio = 0usize;
        for scene in &req.plan.plan().scenes {
            for block_id in &scene.narration_block_ids {
                let text = texts.get(block_id.as_str()).copied().unwrap_or("");
                let estimate = estimate_seconds_f64(text, self.cfg.words_per_minute).max(MIN_BEAT_SECS);

                let mut audio = req.audio_dir.and_then(|dir| block_audio_path(dir, block_id));
                let mut duration = estimate;
                if let Some(path) = &audio {
                    match self.services.gate.media_duration(path).await {
                        Ok(secs) => duration = secs.max(MIN_BEAT_SECS),
                        Err(err) => {
                            logw(format!("Unreadable narration audio {}: {}", path.display(), err));
                            audio = None;
                        }
                    }
                }
                if audio.is_none() {
                    missing_audio += 1;
                }

                report.beats.push(BeatReport {
                    block_id: block_id.clone(),
                    scene_id: scene.scene_id.clone(),
                    duration_sec: duration,
                    selected_asset: None,
                    from_stability_pool: false,
                    clips: Vec::new(),
                    attempts: Vec::new(),
                });
                beats.push(Beat {
                    block_id: block_id.clone(),
                    duration,
                    audio,
                });
            }
        }

        if missing_audio > 0 {
            report.warn(format!(
                "{} of {} blocks have no narration audio; silence used",
                missing_audio,
                beats.len()
            ));
        }
        beats
    }

    /// Warm the cache with each beat's first choice in parallel. Failures
    /// here only cost time; selection retries them.
    async fn prefetch(&self, manifest: &AssetManifest, beats: &[Beat], progress: &ProgressReporter) {
        let usage = UsageTracker::new(self.cfg.recent_window, beats.len());
        let mut seen = HashSet::new();
        let mut refs = Vec::new();
        for beat in beats {
            let Some(candidates) = manifest.for_block(&beat.block_id) else {
                continue;
            };
            let ranking = rank_candidates(candidates, manifest, &usage);
            for candidate in ranking.pinned.iter().chain(ranking.ordered.iter().take(1)) {
                if seen.insert(candidate.archive_item_id.clone()) {
                    refs.push(candidate.asset_ref());
                }
            }
        }
        if refs.is_empty() {
            return;
        }

        let total = refs.len();
        let fetcher = self.services.fetcher.as_ref();
        let mut results = stream::iter(refs)
            .map(|asset| async move {
                let result = fetcher.fetch(&asset).await;
                (asset, result)
            })
            .buffer_unordered(self.cfg.max_parallel_downloads.max(1));

        let mut done = 0usize;
        while let Some((asset, result)) = results.next().await {
            done += 1;
            if let Err(err) = result {
                logw(format!("Prefetch {} failed: {}", asset.item_id, err));
            }
            progress.emit(
                Phase::Downloading,
                0.5 * done as f64 / total as f64,
                format!("Prefetched {}/{}", done, total),
                json!({ "item_id": asset.item_id }),
            );
        }
    }

    async fn select_assets(
        &self,
        manifest: &AssetManifest,
        beats: &[Beat],
        report: &mut CompilationReport,
        progress: &ProgressReporter,
    ) -> Result<Vec<Selection>, BuildError> {
        let selector = Selector::new(
            self.services.fetcher.as_ref(),
            self.services.gate.as_ref(),
            self.cfg.download_attempts,
        );
        let mut usage = UsageTracker::new(self.cfg.recent_window, beats.len());
        let mut selections = Vec::with_capacity(beats.len());
        let mut failures = Vec::new();

        for (i, beat) in beats.iter().enumerate() {
            self.check_cancelled(Phase::Downloading)?;

            let empty;
            let candidates = match manifest.for_block(&beat.block_id) {
                Some(candidates) => candidates,
                None => {
                    empty = BeatCandidates {
                        block_id: beat.block_id.clone(),
                        pinned: None,
                        candidates: Vec::new(),
                    };
                    &empty
                }
            };

            let outcome = selector.select_asset(candidates, manifest, &usage).await;
            if let Some(entry) = report.beat_mut(&beat.block_id) {
                entry.attempts.extend(outcome.attempts.iter().cloned());
                entry.from_stability_pool = outcome.from_stability_pool;
                entry.selected_asset = outcome
                    .asset
                    .as_ref()
                    .map(|(candidate, _)| candidate.archive_item_id.clone());
            }

            match outcome.asset {
                Some((candidate, asset)) => {
                    usage.record(&candidate.archive_item_id);
                    if outcome.from_stability_pool {
                        report.warn(format!(
                            "Beat {} uses {} from the widened asset pool",
                            beat.block_id, candidate.archive_item_id
                        ));
                    }
                    selections.push(Some((candidate, asset)));
                }
                None => {
                    failures.push(BeatFailure {
                        block_id: beat.block_id.clone(),
                        attempts: outcome.attempts,
                    });
                    selections.push(None);
                }
            }

            progress.emit(
                Phase::Downloading,
                0.5 + 0.5 * (i + 1) as f64 / beats.len() as f64,
                format!("Selected assets for {}/{} beats", i + 1, beats.len()),
                json!({ "block_id": beat.block_id }),
            );
        }

        report.asset_reuse = usage
            .counts()
            .iter()
            .map(|(id, count)| (id.clone(), *count))
            .collect();

        if selections.iter().all(Option::is_none) {
            return Err(BuildError::NoVisualAssets { beats: failures });
        }
        if !failures.is_empty() {
            report.warn(format!("{} beats have no usable asset", failures.len()));
        }
        Ok(selections)
    }

    async fn cut_clips(
        &self,
        clips_dir: &Path,
        beats: &[Beat],
        selections: &[Selection],
        report: &mut CompilationReport,
        progress: &ProgressReporter,
    ) -> Result<Vec<Subclip>, BuildError> {
        let mut tracker = WindowTracker::default();
        let mut durations: HashMap<String, Option<f64>> = HashMap::new();
        let mut jobs: Vec<(CutRequest, String)> = Vec::new();

        for (index, (beat, selection)) in beats.iter().zip(selections).enumerate() {
            let Some((candidate, asset)) = selection else {
                continue;
            };
            let count = clip_count(beat.duration);
            let clip_secs = beat.duration / count as f64;

            let (source_secs, windows) = match asset.media_kind {
                MediaKind::Image => (None, vec![ClipWindow::new(0.0, clip_secs); count]),
                MediaKind::Video => {
                    let source_secs = match durations.get(&asset.cache_key) {
                        Some(known) => *known,
                        None => {
                            let probed = self.services.gate.media_duration(&asset.local_path).await.ok();
                            durations.insert(asset.cache_key.clone(), probed);
                            probed
                        }
                    };
                    let windows = tracker.plan(
                        &asset.cache_key,
                        source_secs,
                        clip_secs,
                        count,
                        self.cfg.safe_head_secs,
                    );
                    (source_secs, windows)
                }
            };

            for (sequence, window) in windows.into_iter().enumerate() {
                let output_path = clips_dir.join(format!(
                    "{:03}_{}_{}.mp4",
                    index,
                    file_safe(&beat.block_id),
                    sequence
                ));
                jobs.push((
                    CutRequest {
                        block_id: beat.block_id.clone(),
                        sequence,
                        asset: asset.clone(),
                        window,
                        source_secs,
                        output_path,
                    },
                    candidate.archive_item_id.clone(),
                ));
            }
        }

        let total = jobs.len();
        progress.emit(Phase::Cutting, 0.0, format!("Cutting {} clips", total), json!({ "clips": total }));

        let cutter = ClipCutter::new(
            self.services.runner.as_ref(),
            self.services.gate.as_ref(),
            self.cfg.width,
            self.cfg.height,
            self.cfg.fps,
            self.cfg.cut_timeout(),
        );
        let cutter = &cutter;
        let cancel = self.cancel.as_ref();
        let mut results = stream::iter(jobs.into_iter().enumerate())
            .map(|(order, (job, asset_id))| async move {
                if cancel.load(Ordering::SeqCst) {
                    return (order, job, asset_id, Err("cancelled".to_string()));
                }
                let result = cutter.cut(&job).await;
                (order, job, asset_id, result)
            })
            .buffer_unordered(self.cfg.max_parallel_cuts.max(1));

        let mut finished = Vec::with_capacity(total);
        while let Some(item) = results.next().await {
            finished.push(item);
            progress.emit(
                Phase::Cutting,
                finished.len() as f64 / total.max(1) as f64,
                format!("Cut {}/{}", finished.len(), total),
                serde_json::Value::Null,
            );
        }
        drop(results);
        self.check_cancelled(Phase::Cutting)?;

        // Completion order is arbitrary; the timeline is plan order.
        finished.sort_by_key(|(order, ..)| *order);

        let mut clips = Vec::with_capacity(finished.len());
        for (_, job, asset_id, result) in finished {
            match result {
                Ok(clip) => clips.push(clip),
                Err(reason) => {
                    logw(format!("{} clip {} failed: {}", job.block_id, job.sequence, reason));
                    if let Some(entry) = report.beat_mut(&job.block_id) {
                        entry.attempts.push(AttemptRecord::new(asset_id, reason));
                    }
                }
            }
        }

        if clips.is_empty() {
            let beats = report
                .beats
                .iter()
                .map(|b| BeatFailure {
                    block_id: b.block_id.clone(),
                    attempts: b.attempts.clone(),
                })
                .collect();
            return Err(BuildError::NoClipsProduced { beats });
        }
        logok(format!("Cut {}/{} clips", clips.len(), total));
        Ok(clips)
    }

    async fn assemble(
        &self,
        name: &str,
        beats: &[Beat],
        clips: Vec<Subclip>,
        report: &mut CompilationReport,
        progress: &ProgressReporter,
    ) -> Result<PathBuf, BuildError> {
        let narration: Vec<NarrationSegment> = beats
            .iter()
            .map(|beat| match &beat.audio {
                Some(path) => NarrationSegment::File(path.clone()),
                None => NarrationSegment::Silence(beat.duration),
            })
            .collect();
        let narration_secs: f64 = beats.iter().map(|b| b.duration).sum();

        let music = match pick_music(&self.cfg.music_dir, name) {
            Some(path) => {
                logi(format!("Background music: {}", path.display()));
                report.music = Some(path.display().to_string());
                Some(MusicBed {
                    path,
                    gain: self.cfg.bgm_gain,
                    fade_in_secs: self.cfg.bgm_fade_in_secs,
                    fade_out_secs: self.cfg.bgm_fade_out_secs,
                })
            }
            None => {
                report.warn(format!(
                    "No background music in {}; narration only",
                    self.cfg.music_dir.display()
                ));
                None
            }
        };

        progress.emit(
            Phase::Assembly,
            0.0,
            format!("Assembling {} clips", clips.len()),
            json!({ "narration_secs": narration_secs }),
        );

        let slots = beats
            .iter()
            .map(|beat| BeatSlot {
                block_id: beat.block_id.clone(),
                duration: beat.duration,
            })
            .collect();
        let request = AssemblyRequest {
            clips,
            beats: slots,
            narration,
            narration_secs,
            music,
            output: self.cfg.output_dir.join(format!("{}.mp4", file_safe(name))),
            width: self.cfg.width,
            height: self.cfg.height,
            fps: self.cfg.fps,
        };
        let assembler = TimelineAssembler::new(
            self.services.runner.as_ref(),
            self.services.gate.as_ref(),
            self.cfg.concat_timeout(),
        );
        let outcome = assembler.assemble(&request).await?;

        for (clip, reason) in &outcome.dropped {
            if let Some(entry) = report.beat_mut(&clip.block_id) {
                let asset_id = entry.selected_asset.clone().unwrap_or_default();
                entry.attempts.push(AttemptRecord::new(asset_id, reason.clone()));
            }
        }
        report.record_clips(&outcome.used_clips, &outcome.holds, &self.cfg.work_dir);
        let uncovered: Vec<(String, f64)> = report
            .beats
            .iter()
            .filter(|b| b.clips.is_empty())
            .map(|b| (b.block_id.clone(), b.duration_sec))
            .collect();
        for (block_id, secs) in uncovered {
            report.warn(format!("Beat {} has no footage; frame held for {:.1}s", block_id, secs));
        }

        let coverage = report.compute_coverage();
        if coverage < self.cfg.min_coverage {
            report.warn(format!(
                "Visual coverage {:.0}% is below the {:.0}% threshold",
                coverage * 100.0,
                self.cfg.min_coverage * 100.0
            ));
        }
        if outcome.padded_secs > 0.0 {
            logw(format!("Held the last frame for {:.2}s", outcome.padded_secs));
        }

        progress.emit(
            Phase::Assembly,
            1.0,
            format!("Assembled {}", outcome.output.display()),
            json!({ "video_secs": outcome.video_secs, "padded_secs": outcome.padded_secs }),
        );
        Ok(outcome.output)
    }

    fn persist_report(&self, report: &CompilationReport) -> Option<PathBuf> {
        match report.write_to(&self.cfg.output_dir) {
            Ok(path) => {
                logi(format!("Report: {}", path.display()));
                Some(path)
            }
            Err(err) => {
                logw(format!("Could not write report: {:#}", err));
                None
            }
        }
    }

    /// Remove subclips and other intermediates once the video exists.
    async fn cleanup(&self, work_dir: &Path) {
        if !work_dir.exists() {
            return;
        }
        for entry in WalkDir::new(work_dir).min_depth(1).contents_first(true) {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            if path.is_dir() {
                fs::remove_dir(path).await.ok();
            } else {
                fs::remove_file(path).await.ok();
            }
        }
        fs::remove_dir(work_dir).await.ok();
    }
}

fn list_music(dir: &Path) -> Vec<PathBuf> {
    let mut tracks: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .map(|e| MUSIC_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false)
        })
        .collect();
    tracks.sort();
    tracks
}

/// A track from `dir`, if it holds any. The pick is seeded by the build
/// name, so rebuilding the same video keeps its music.
pub fn pick_music(dir: &Path, build_name: &str) -> Option<PathBuf> {
    let tracks = list_music(dir);
    if tracks.is_empty() {
        return None;
    }
    let mut rng = rand::rngs::StdRng::seed_from_u64(stable_seed(build_name));
    let idx = rng.gen_range(0..tracks.len());
    tracks.into_iter().nth(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::manifest::{AssetRef, Recommendation};
    use crate::progress::ProgressEvent;
    use crate::report::BuildStatus;
    use crate::shot_plan::guardrail::TopicAnchorGuardrail;
    use crate::shot_plan::{compile, validate_plan};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FakeFetcher {
        dir: PathBuf,
    }

    #[async_trait]
    impl AssetFetcher for FakeFetcher {
        async fn fetch(&self, asset: &AssetRef) -> Result<CachedAsset, FetchError> {
            let key = crate::cache::cache_key(asset.canonical());
            Ok(CachedAsset {
                local_path: self.dir.join(format!("{}.mp4", key)),
                cache_key: key,
                media_kind: MediaKind::Video,
                verified_has_video_stream: false,
            })
        }

        async fn evict(&self, _asset: &CachedAsset) -> Result<(), FetchError> {
            Ok(())
        }
    }

    /// Every file has video; rendered clips whose name contains
    /// `black_marker` sample black.
    struct FakeGate {
        black_marker: Option<&'static str>,
    }

    #[async_trait]
    impl QualityGate for FakeGate {
        async fn has_video_stream(&self, _path: &Path) -> Result<bool, MediaError> {
            Ok(true)
        }

        async fn is_black_frame(&self, path: &Path, _at: f64) -> Result<bool, MediaError> {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            Ok(self.black_marker.is_some_and(|marker| name.contains(marker)))
        }

        async fn media_duration(&self, _path: &Path) -> Result<f64, MediaError> {
            Ok(120.0)
        }
    }

    /// Writes a placeholder at the output path of every command.
    struct TouchRunner {
        outputs: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for TouchRunner {
        async fn run(&self, args: &[String], _timeout: Duration) -> Result<(), MediaError> {
            if let Some(out) = args.last() {
                std::fs::write(out, b"rendered").map_err(MediaError::from)?;
                self.outputs.lock().unwrap().push(out.clone());
            }
            Ok(())
        }
    }

    struct Fixture {
        root: tempfile::TempDir,
        cfg: BuildConfig,
        blocks: Vec<NarrationBlock>,
        plan: ValidatedPlan,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let cfg = BuildConfig {
            cache_dir: root.path().join("cache"),
            work_dir: root.path().join("work"),
            output_dir: root.path().join("output"),
            music_dir: root.path().join("music"),
            width: 640,
            height: 360,
            ..BuildConfig::default()
        };
        let blocks: Vec<NarrationBlock> = (1..=3)
            .map(|i| {
                NarrationBlock::new(
                    format!("b{}", i),
                    format!("Troops crossed the Marne in 1914 during phase {} of the retreat.", i),
                )
            })
            .collect();
        let compiled = compile(&blocks, None, cfg.words_per_minute, &TopicAnchorGuardrail).unwrap();
        let plan = validate_plan(&compiled.plan, &blocks).unwrap();
        Fixture {
            root,
            cfg,
            blocks,
            plan,
        }
    }

    fn services(root: &Path, runner: Arc<TouchRunner>) -> BuildServices {
        services_with_gate(root, runner, FakeGate { black_marker: None })
    }

    fn services_with_gate(root: &Path, runner: Arc<TouchRunner>, gate: FakeGate) -> BuildServices {
        BuildServices {
            fetcher: Arc::new(FakeFetcher {
                dir: root.join("cache"),
            }),
            gate: Arc::new(gate),
            runner,
        }
    }

    fn request<'a>(fx: &'a Fixture, manifest: &'a AssetManifest) -> BuildRequest<'a> {
        BuildRequest {
            name: "episode",
            plan: &fx.plan,
            blocks: &fx.blocks,
            manifest,
            audio_dir: None,
        }
    }

    fn manifest_for(blocks: &[NarrationBlock], recommendation: Recommendation) -> AssetManifest {
        AssetManifest {
            beats: blocks
                .iter()
                .map(|b| BeatCandidates {
                    block_id: b.block_id.clone(),
                    pinned: None,
                    candidates: vec![
                        AssetCandidate::new("archive:reel_a", recommendation),
                        AssetCandidate::new("archive:reel_b", recommendation),
                    ],
                })
                .collect(),
        }
    }

    fn recorder() -> (ProgressReporter, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let reporter = ProgressReporter::new(
            Box::new(move |e: &ProgressEvent| sink.lock().unwrap().push(e.clone())),
            Duration::ZERO,
        );
        (reporter, events)
    }

    #[tokio::test]
    async fn all_skip_manifest_fails_with_no_visual_assets() {
        let fx = fixture();
        let runner = Arc::new(TouchRunner {
            outputs: Mutex::new(Vec::new()),
        });
        let builder = CompilationBuilder::new(fx.cfg.clone(), services(fx.root.path(), runner.clone()));
        let manifest = manifest_for(&fx.blocks, Recommendation::Skip);
        let lock = crate::lock::acquire(&fx.cfg.work_dir, fx.cfg.lock_stale()).unwrap();
        let (progress, events) = recorder();

        let err = builder
            .run(
                &lock,
                BuildRequest {
                    name: "episode",
                    plan: &fx.plan,
                    blocks: &fx.blocks,
                    manifest: &manifest,
                    audio_dir: None,
                },
                &progress,
            )
            .await
            .unwrap_err();
        progress.finish();

        assert_eq!(err.code(), "NO_VISUAL_ASSETS");
        assert_eq!(err.beat_failures().len(), 3);
        assert!(err.beat_failures()[0]
            .attempts
            .iter()
            .all(|a| a.reason == "marked skip"));
        assert!(runner.outputs.lock().unwrap().is_empty());
        assert!(!fx.cfg.output_dir.join("episode.mp4").exists());

        let report_text =
            std::fs::read_to_string(fx.cfg.output_dir.join("episode.report.json")).unwrap();
        let report: CompilationReport = serde_json::from_str(&report_text).unwrap();
        assert_eq!(report.status, BuildStatus::Failed);
        assert_eq!(report.error_code.as_deref(), Some("NO_VISUAL_ASSETS"));
        assert_eq!(events.lock().unwrap().last().unwrap().phase, Phase::Failed);
    }

    #[tokio::test]
    async fn healthy_build_writes_video_and_degraded_report() {
        let fx = fixture();
        let runner = Arc::new(TouchRunner {
            outputs: Mutex::new(Vec::new()),
        });
        let builder = CompilationBuilder::new(fx.cfg.clone(), services(fx.root.path(), runner.clone()));
        let manifest = manifest_for(&fx.blocks, Recommendation::Use);
        let lock = crate::lock::acquire(&fx.cfg.work_dir, fx.cfg.lock_stale()).unwrap();
        let (progress, events) = recorder();

        let output = builder
            .run(
                &lock,
                BuildRequest {
                    name: "episode",
                    plan: &fx.plan,
                    blocks: &fx.blocks,
                    manifest: &manifest,
                    audio_dir: None,
                },
                &progress,
            )
            .await
            .unwrap();
        progress.finish();

        assert!(output.video.exists());
        assert!(output.report_path.as_ref().unwrap().exists());
        // no voice-over files and no music: acceptable, but flagged
        assert_eq!(output.report.status, BuildStatus::Degraded);
        assert_eq!(output.report.coverage, 1.0);

        let outputs = runner.outputs.lock().unwrap();
        let cuts: Vec<&String> = outputs.iter().filter(|o| o.contains("clips")).collect();
        assert_eq!(cuts.len(), 3);
        let assembled = outputs.last().unwrap();
        assert!(assembled.ends_with("episode.partial.mp4"));

        let used: Vec<&str> = output
            .report
            .beats
            .iter()
            .filter_map(|b| b.selected_asset.as_deref())
            .collect();
        assert_eq!(used.len(), 3);
        assert!(used.contains(&"archive:reel_b"));
        assert!(!fx.cfg.work_dir.join("episode").exists());

        let events = events.lock().unwrap();
        let phases: Vec<Phase> = events.iter().map(|e| e.phase).collect();
        assert_eq!(phases.first(), Some(&Phase::Init));
        assert_eq!(phases.last(), Some(&Phase::Done));
        assert!(phases.contains(&Phase::Cutting));
    }

    #[tokio::test]
    async fn cancelled_build_stops_before_downloading() {
        let fx = fixture();
        let runner = Arc::new(TouchRunner {
            outputs: Mutex::new(Vec::new()),
        });
        let builder = CompilationBuilder::new(fx.cfg.clone(), services(fx.root.path(), runner));
        builder.cancel_handle().store(true, Ordering::SeqCst);
        let manifest = manifest_for(&fx.blocks, Recommendation::Use);
        let lock = crate::lock::acquire(&fx.cfg.work_dir, fx.cfg.lock_stale()).unwrap();

        let err = builder
            .run(
                &lock,
                BuildRequest {
                    name: "episode",
                    plan: &fx.plan,
                    blocks: &fx.blocks,
                    manifest: &manifest,
                    audio_dir: None,
                },
                &ProgressReporter::logging(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "BUILD_CANCELLED");
    }

    #[tokio::test]
    async fn uncovered_beat_keeps_later_beats_on_their_narration() {
        let fx = fixture();
        let runner = Arc::new(TouchRunner {
            outputs: Mutex::new(Vec::new()),
        });
        let gate = FakeGate {
            black_marker: Some("_b2_"),
        };
        let builder = CompilationBuilder::new(
            fx.cfg.clone(),
            services_with_gate(fx.root.path(), runner.clone(), gate),
        );
        let manifest = manifest_for(&fx.blocks, Recommendation::Use);
        let lock = crate::lock::acquire(&fx.cfg.work_dir, fx.cfg.lock_stale()).unwrap();

        let output = builder
            .run(&lock, request(&fx, &manifest), &ProgressReporter::logging())
            .await
            .unwrap();
        let report = &output.report;
        assert_eq!(report.status, BuildStatus::Degraded);
        assert!(report.beats[1].clips.is_empty());
        assert!(report.warnings.iter().any(|w| w.starts_with("Beat b2 has no footage")));
        assert!(report.beats[1]
            .attempts
            .iter()
            .any(|a| a.reason == "black frames at every shift"));

        // Walk the video timeline and compare each beat's first frame with
        // where its narration starts.
        let mut video_cursor = 0.0;
        let mut narration_cursor = 0.0;
        for beat in &report.beats {
            if let Some(first) = beat.clips.first() {
                assert!(
                    (video_cursor + first.hold_before_sec - narration_cursor).abs() < 1e-6,
                    "{} starts at {} but its narration at {}",
                    beat.block_id,
                    video_cursor + first.hold_before_sec,
                    narration_cursor
                );
            }
            for clip in &beat.clips {
                video_cursor += clip.hold_before_sec + (clip.out_sec - clip.in_sec) + clip.hold_after_sec;
            }
            narration_cursor += beat.duration_sec;
        }
        assert!((video_cursor - narration_cursor).abs() < 1e-6);

        let b1_tail = report.beats[0].clips.last().unwrap().hold_after_sec;
        assert!((b1_tail - report.beats[1].duration_sec).abs() < 1e-6);
    }

    #[tokio::test]
    async fn black_everywhere_fails_with_no_clips_produced() {
        let fx = fixture();
        let runner = Arc::new(TouchRunner {
            outputs: Mutex::new(Vec::new()),
        });
        let gate = FakeGate {
            black_marker: Some("_b"),
        };
        let builder = CompilationBuilder::new(
            fx.cfg.clone(),
            services_with_gate(fx.root.path(), runner.clone(), gate),
        );
        let manifest = manifest_for(&fx.blocks, Recommendation::Use);
        let lock = crate::lock::acquire(&fx.cfg.work_dir, fx.cfg.lock_stale()).unwrap();

        let err = builder
            .run(&lock, request(&fx, &manifest), &ProgressReporter::logging())
            .await
            .unwrap_err();

        assert_eq!(err.code(), "NO_CLIPS_PRODUCED");
        assert_eq!(err.beat_failures().len(), 3);
        for beat in err.beat_failures() {
            assert!(
                beat.attempts.iter().any(|a| a.reason == "black frames at every shift"),
                "{} lacks the cut failure",
                beat.block_id
            );
        }
        assert!(runner
            .outputs
            .lock()
            .unwrap()
            .iter()
            .all(|o| !o.ends_with("episode.partial.mp4")));

        let report_text =
            std::fs::read_to_string(fx.cfg.output_dir.join("episode.report.json")).unwrap();
        let report: CompilationReport = serde_json::from_str(&report_text).unwrap();
        assert_eq!(report.status, BuildStatus::Failed);
        assert_eq!(report.error_code.as_deref(), Some("NO_CLIPS_PRODUCED"));

        let videos: Vec<PathBuf> = std::fs::read_dir(&fx.cfg.output_dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "mp4"))
            .collect();
        assert!(videos.is_empty(), "unexpected videos {:?}", videos);
    }

    #[test]
    fn download_bytes_become_downloading_events() {
        let (progress, events) = recorder();
        let forward = download_progress(progress.handle());
        progress.emit(Phase::Downloading, 0.5, "prefetching", serde_json::Value::Null);
        forward("archive:reel_a", 3 * 1024 * 1024, Some(6 * 1024 * 1024));
        progress.finish();

        let events = events.lock().unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.phase, Phase::Downloading);
        assert_eq!(last.percent, 25.0);
        assert_eq!(last.message, "Downloading archive:reel_a: 3.0/6.0 MiB");
        assert_eq!(last.details["bytes"], 3 * 1024 * 1024);
        assert_eq!(last.details["item_id"], "archive:reel_a");
    }

    #[test]
    fn music_is_picked_from_supported_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(pick_music(dir.path(), "episode").is_none());
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        assert!(pick_music(dir.path(), "episode").is_none());
        std::fs::write(dir.path().join("theme.MP3"), b"x").unwrap();
        assert_eq!(pick_music(dir.path(), "episode"), Some(dir.path().join("theme.MP3")));
    }

    #[test]
    fn music_pick_is_stable_per_build_name() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.mp3", "b.m4a", "c.wav", "d.mp3"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let first = pick_music(dir.path(), "verdun-1916");
        assert!(first.is_some());
        for _ in 0..5 {
            assert_eq!(pick_music(dir.path(), "verdun-1916"), first);
        }
    }

    #[test]
    fn names_are_made_file_safe() {
        assert_eq!(file_safe("Battle of the Somme!"), "Battle_of_the_Somme_");
        assert_eq!(file_safe(""), "untitled");
    }
}
