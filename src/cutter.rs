//! Clip cutting: how many clips a beat gets, which source windows they use,
//! and rendering each one with black-frame avoidance.

use crate::api::MediaKind;
use crate::cache::CachedAsset;
use crate::ffmpeg::{self, CommandRunner};
use crate::panzoom::{self, Effect};
use crate::quality::{QualityGate, sample_point};
use crate::{logi, logw};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const SINGLE_CLIP_MAX_SECS: f64 = 14.0;
pub const DOUBLE_CLIP_MAX_SECS: f64 = 28.0;

/// Seconds added to a window's in-point when the cut samples as black.
pub const SHIFT_OFFSETS: [f64; 5] = [0.0, 1.0, 3.0, 7.0, 12.0];

const EPSILON: f64 = 1e-6;

pub fn clip_count(beat_secs: f64) -> usize {
    if beat_secs <= SINGLE_CLIP_MAX_SECS {
        1
    } else if beat_secs <= DOUBLE_CLIP_MAX_SECS {
        2
    } else {
        3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClipWindow {
    pub in_sec: f64,
    pub out_sec: f64,
    /// Source is shorter than the window and is looped to fill it.
    #[serde(default)]
    pub looped: bool,
}

impl ClipWindow {
    pub fn new(in_sec: f64, out_sec: f64) -> Self {
        Self {
            in_sec,
            out_sec,
            looped: false,
        }
    }

    pub fn duration(&self) -> f64 {
        self.out_sec - self.in_sec
    }

    fn overlaps(&self, start: f64, end: f64) -> bool {
        start < self.out_sec - EPSILON && end > self.in_sec + EPSILON
    }
}

/// Earliest start at or after `from` whose window avoids every `taken` one.
fn first_free(from: f64, source_secs: f64, clip_secs: f64, taken: &[ClipWindow]) -> Option<f64> {
    let mut start = from;
    loop {
        let end = start + clip_secs;
        if end > source_secs + EPSILON {
            return None;
        }
        let blocker = taken
            .iter()
            .filter(|w| w.overlaps(start, end))
            .map(|w| w.out_sec)
            .fold(None, |acc: Option<f64>, out| Some(acc.map_or(out, |a| a.max(out))));
        match blocker {
            Some(next) => start = next,
            None => return Some(start),
        }
    }
}

/// Choose `count` windows of `clip_secs` on a source, avoiding footage
/// already used. The first `safe_head` seconds are skipped when the source
/// is long enough to afford it. When fresh footage runs out, windows restart
/// at the head.
pub fn plan_windows(
    source_secs: Option<f64>,
    clip_secs: f64,
    count: usize,
    used: &[ClipWindow],
    safe_head: f64,
) -> Vec<ClipWindow> {
    let mut taken = used.to_vec();
    let mut planned = Vec::with_capacity(count);

    for _ in 0..count {
        let window = match source_secs {
            None => {
                let start = taken.iter().map(|w| w.out_sec).fold(0.0, f64::max);
                ClipWindow::new(start, start + clip_secs)
            }
            Some(total) if total < clip_secs + EPSILON => ClipWindow {
                in_sec: 0.0,
                out_sec: clip_secs,
                looped: true,
            },
            Some(total) => {
                let head = if total - safe_head >= clip_secs { safe_head } else { 0.0 };
                let start = first_free(head, total, clip_secs, &taken)
                    .or_else(|| first_free(0.0, total, clip_secs, &taken))
                    .unwrap_or(head);
                ClipWindow::new(start, start + clip_secs)
            }
        };
        taken.push(window);
        planned.push(window);
    }
    planned
}

/// Windows already consumed per source asset, across beats.
#[derive(Debug, Default)]
pub struct WindowTracker {
    used: HashMap<String, Vec<ClipWindow>>,
}

impl WindowTracker {
    pub fn plan(
        &mut self,
        asset_key: &str,
        source_secs: Option<f64>,
        clip_secs: f64,
        count: usize,
        safe_head: f64,
    ) -> Vec<ClipWindow> {
        let used = self.used.entry(asset_key.to_string()).or_default();
        let windows = plan_windows(source_secs, clip_secs, count, used, safe_head);
        used.extend(windows.iter().copied());
        windows
    }
}

/// A normalized, silent clip ready for assembly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subclip {
    pub block_id: String,
    /// Position within the beat.
    pub sequence: usize,
    pub source_asset: CachedAsset,
    pub in_sec: f64,
    pub out_sec: f64,
    pub effect: Effect,
    pub output_path: PathBuf,
}

impl Subclip {
    pub fn duration(&self) -> f64 {
        self.out_sec - self.in_sec
    }
}

#[derive(Debug, Clone)]
pub struct CutRequest {
    pub block_id: String,
    pub sequence: usize,
    pub asset: CachedAsset,
    pub window: ClipWindow,
    pub source_secs: Option<f64>,
    pub output_path: PathBuf,
}

pub struct ClipCutter<'a> {
    runner: &'a dyn CommandRunner,
    gate: &'a dyn QualityGate,
    width: u32,
    height: u32,
    fps: u32,
    timeout: Duration,
}

impl<'a> ClipCutter<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        gate: &'a dyn QualityGate,
        width: u32,
        height: u32,
        fps: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            gate,
            width,
            height,
            fps,
            timeout,
        }
    }

    /// Render one clip. On a black sample the in-point is shifted through
    /// [`SHIFT_OFFSETS`]; the error string explains why the window was given up.
    pub async fn cut(&self, req: &CutRequest) -> Result<Subclip, String> {
        let duration = req.window.duration();
        let src = req.asset.local_path.as_path();

        if req.asset.media_kind == MediaKind::Image {
            let name = file_name(&req.output_path);
            let effect = Effect::for_output(&name);
            let filter = panzoom::panzoom_filter(effect, self.width, self.height, self.fps, duration);
            let args = ffmpeg::still_cut_args(src, duration, &filter, &req.output_path);
            return self
                .render_checked(req, &args, 0.0, effect)
                .await?
                .ok_or_else(|| "still renders black".to_string());
        }

        for shift in SHIFT_OFFSETS {
            let in_sec = req.window.in_sec + shift;
            if shift > 0.0 && !req.window.looped {
                if let Some(total) = req.source_secs {
                    if in_sec + duration > total + EPSILON {
                        break;
                    }
                }
            }
            let args = ffmpeg::video_cut_args(
                src,
                in_sec,
                duration,
                req.window.looped,
                &req.output_path,
                self.width,
                self.height,
                self.fps,
            );
            if let Some(clip) = self.render_checked(req, &args, shift, Effect::None).await? {
                return Ok(clip);
            }
            logw(format!(
                "{} clip {}: black frame at +{}s; shifting",
                req.block_id, req.sequence, shift
            ));
        }
        Err("black frames at every shift".to_string())
    }

    /// `Ok(None)` means the render worked but sampled black.
    async fn render_checked(
        &self,
        req: &CutRequest,
        args: &[String],
        shift: f64,
        effect: Effect,
    ) -> Result<Option<Subclip>, String> {
        let duration = req.window.duration();
        if let Err(err) = self.runner.run(args, self.timeout).await {
            remove_quietly(&req.output_path).await;
            return Err(format!("cut failed: {}", err));
        }

        match self.gate.has_video_stream(&req.output_path).await {
            Ok(true) => {}
            Ok(false) => {
                remove_quietly(&req.output_path).await;
                return Err("cut has no video stream".to_string());
            }
            Err(err) => {
                remove_quietly(&req.output_path).await;
                return Err(format!("stream probe failed: {}", err));
            }
        }

        let black = self
            .gate
            .is_black_frame(&req.output_path, sample_point(duration))
            .await
            .map_err(|err| format!("frame sample failed: {}", err))?;
        if black {
            remove_quietly(&req.output_path).await;
            return Ok(None);
        }

        logi(format!(
            "Cut {} clip {} [{:.2}-{:.2}] -> {}",
            req.block_id,
            req.sequence,
            req.window.in_sec + shift,
            req.window.out_sec + shift,
            req.output_path.display()
        ));
        Ok(Some(Subclip {
            block_id: req.block_id.clone(),
            sequence: req.sequence,
            source_asset: req.asset.clone(),
            in_sec: req.window.in_sec + shift,
            out_sec: req.window.out_sec + shift,
            effect,
            output_path: req.output_path.clone(),
        }))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

async fn remove_quietly(path: &Path) {
    let _ = fs::remove_file(path).await;
}
