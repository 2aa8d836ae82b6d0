//! Timeline assembly: one ffmpeg run that normalizes and concatenates the
//! subclips, concatenates the narration track, and mixes background music
//! under it. The narration is the timing reference.

use crate::cutter::Subclip;
use crate::error::BuildError;
use crate::ffmpeg::{self, CommandRunner};
use crate::quality::QualityGate;
use crate::{logi, logok, logw};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const AUDIO_SAMPLE_RATE: u32 = 48_000;

/// Video shorter than the narration by less than this is not padded.
const PAD_TOLERANCE_SECS: f64 = 0.05;

#[derive(Debug, Clone, PartialEq)]
pub enum NarrationSegment {
    File(PathBuf),
    /// Stand-in for a block without recorded audio.
    Silence(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MusicBed {
    pub path: PathBuf,
    pub gain: f64,
    pub fade_in_secs: f64,
    pub fade_out_secs: f64,
}

/// A narration beat's slot on the timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct BeatSlot {
    pub block_id: String,
    pub duration: f64,
}

/// Frozen-frame time added around one concat input.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClipHold {
    /// First frame held before the clip (uncovered beats at the start).
    pub lead_secs: f64,
    /// Last frame held after the clip (uncovered time later in its beat or
    /// in the beats that follow).
    pub tail_secs: f64,
}

impl ClipHold {
    pub fn total(&self) -> f64 {
        self.lead_secs + self.tail_secs
    }
}

/// Holds that keep every beat's footage starting at its narration offset.
///
/// `clips` must be in plan order. Time a beat's clips do not fill is held on
/// the last accepted frame before it; uncovered beats ahead of the first
/// clip are held on that clip's first frame.
pub fn timeline_holds(clips: &[Subclip], beats: &[BeatSlot]) -> Vec<ClipHold> {
    let mut holds = vec![ClipHold::default(); clips.len()];
    let mut next = 0usize;
    let mut last: Option<usize> = None;
    let mut leading = 0.0;

    for beat in beats {
        let mut visual = 0.0;
        while next < clips.len() && clips[next].block_id == beat.block_id {
            visual += clips[next].duration();
            last = Some(next);
            next += 1;
        }
        let gap = beat.duration - visual;
        if gap <= PAD_TOLERANCE_SECS {
            continue;
        }
        match last {
            Some(idx) => holds[idx].tail_secs += gap,
            None => leading += gap,
        }
    }
    if leading > 0.0 {
        if let Some(first) = holds.first_mut() {
            first.lead_secs = leading;
        }
    }
    holds
}

#[derive(Debug, Clone)]
pub struct AssemblyRequest {
    /// In plan order.
    pub clips: Vec<Subclip>,
    /// Every beat in plan order, covered or not.
    pub beats: Vec<BeatSlot>,
    pub narration: Vec<NarrationSegment>,
    pub narration_secs: f64,
    pub music: Option<MusicBed>,
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct AssemblyOutcome {
    pub output: PathBuf,
    pub used_clips: Vec<Subclip>,
    /// Parallel to `used_clips`.
    pub holds: Vec<ClipHold>,
    pub dropped: Vec<(Subclip, String)>,
    pub video_secs: f64,
    pub padded_secs: f64,
}

fn hold_filter(hold: &ClipHold) -> String {
    let mut filter = String::new();
    if hold.lead_secs > PAD_TOLERANCE_SECS {
        filter.push_str(&format!(",tpad=start_mode=clone:start_duration={:.3}", hold.lead_secs));
    }
    if hold.tail_secs > PAD_TOLERANCE_SECS {
        filter.push_str(&format!(",tpad=stop_mode=clone:stop_duration={:.3}", hold.tail_secs));
    }
    filter
}

/// Per-input scale/pad/fps/format normalization (plus any frame holds)
/// followed by one concat. One input per entry in `holds`. The output label
/// is `[vout]`.
pub fn build_concat_graph(holds: &[ClipHold], width: u32, height: u32, fps: u32, pad_secs: f64) -> String {
    let inputs = holds.len();
    let mut parts = Vec::with_capacity(inputs + 2);
    let mut labels = String::new();
    for (i, hold) in holds.iter().enumerate() {
        parts.push(format!(
            "[{i}:v]scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={fps},format=yuv420p{hold}[v{i}]",
            i = i,
            w = width,
            h = height,
            fps = fps,
            hold = hold_filter(hold)
        ));
        labels.push_str(&format!("[v{}]", i));
    }
    if pad_secs > PAD_TOLERANCE_SECS {
        parts.push(format!("{}concat=n={}:v=1:a=0[vcat]", labels, inputs));
        parts.push(format!(
            "[vcat]tpad=stop_mode=clone:stop_duration={:.3}[vout]",
            pad_secs
        ));
    } else {
        parts.push(format!("{}concat=n={}:v=1:a=0[vout]", labels, inputs));
    }
    parts.join(";")
}

/// Narration inputs start at `first_input`; the music bed (if any) is the
/// input right after them. The output label is `[aout]`.
pub fn build_audio_graph(
    first_input: usize,
    segments: usize,
    music: Option<&MusicBed>,
    total_secs: f64,
) -> String {
    let mut parts = Vec::with_capacity(segments + 3);
    let mut labels = String::new();
    for k in 0..segments {
        parts.push(format!(
            "[{}:a]aresample={},aformat=sample_fmts=fltp:channel_layouts=stereo[n{}]",
            first_input + k,
            AUDIO_SAMPLE_RATE,
            k
        ));
        labels.push_str(&format!("[n{}]", k));
    }

    match music {
        None => {
            parts.push(format!("{}concat=n={}:v=0:a=1[aout]", labels, segments));
        }
        Some(bed) => {
            parts.push(format!("{}concat=n={}:v=0:a=1[narr]", labels, segments));
            let fade_out_start = (total_secs - bed.fade_out_secs).max(0.0);
            parts.push(format!(
                "[{}:a]aresample={},aformat=sample_fmts=fltp:channel_layouts=stereo,volume={:.3},afade=t=in:st=0:d={:.2},afade=t=out:st={:.3}:d={:.2}[bgm]",
                first_input + segments,
                AUDIO_SAMPLE_RATE,
                bed.gain,
                bed.fade_in_secs,
                fade_out_start,
                bed.fade_out_secs
            ));
            parts.push(
                "[narr][bgm]amix=inputs=2:duration=first:dropout_transition=2:normalize=0[aout]"
                    .to_string(),
            );
        }
    }
    parts.join(";")
}

fn temp_output_path(output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!("{}.partial.mp4", stem))
}

pub fn render_args(
    req: &AssemblyRequest,
    clips: &[Subclip],
    holds: &[ClipHold],
    pad_secs: f64,
    out: &Path,
) -> Vec<String> {
    let mut args = vec![
        "ffmpeg".to_string(),
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ];
    for clip in clips {
        args.extend(["-i".to_string(), clip.output_path.display().to_string()]);
    }
    for segment in &req.narration {
        match segment {
            NarrationSegment::File(path) => {
                args.extend(["-i".to_string(), path.display().to_string()]);
            }
            NarrationSegment::Silence(secs) => args.extend([
                "-f".to_string(),
                "lavfi".to_string(),
                "-t".to_string(),
                format!("{:.3}", secs),
                "-i".to_string(),
                format!("anullsrc=r={}:cl=stereo", AUDIO_SAMPLE_RATE),
            ]),
        }
    }
    if let Some(bed) = &req.music {
        args.extend([
            "-stream_loop".to_string(),
            "-1".to_string(),
            "-i".to_string(),
            bed.path.display().to_string(),
        ]);
    }

    let video = build_concat_graph(holds, req.width, req.height, req.fps, pad_secs);
    let audio = build_audio_graph(clips.len(), req.narration.len(), req.music.as_ref(), req.narration_secs);
    args.extend([
        "-filter_complex".to_string(),
        format!("{};{}", video, audio),
        "-map".to_string(),
        "[vout]".to_string(),
        "-map".to_string(),
        "[aout]".to_string(),
    ]);
    args.extend(ffmpeg::h264_output_args());
    args.extend([
        "-r".to_string(),
        req.fps.to_string(),
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
        "-t".to_string(),
        format!("{:.3}", req.narration_secs),
        "-movflags".to_string(),
        "+faststart".to_string(),
        out.display().to_string(),
    ]);
    args
}

pub struct TimelineAssembler<'a> {
    runner: &'a dyn CommandRunner,
    gate: &'a dyn QualityGate,
    timeout: Duration,
}

impl<'a> TimelineAssembler<'a> {
    pub fn new(runner: &'a dyn CommandRunner, gate: &'a dyn QualityGate, timeout: Duration) -> Self {
        Self {
            runner,
            gate,
            timeout,
        }
    }

    pub async fn assemble(&self, req: &AssemblyRequest) -> Result<AssemblyOutcome, BuildError> {
        let mut used = Vec::with_capacity(req.clips.len());
        let mut dropped = Vec::new();
        for clip in &req.clips {
            match self.gate.has_video_stream(&clip.output_path).await {
                Ok(true) => used.push(clip.clone()),
                Ok(false) => {
                    logw(format!("Dropping {} before concat: no video stream", clip.output_path.display()));
                    dropped.push((clip.clone(), "no video stream before concat".to_string()));
                }
                Err(err) => {
                    logw(format!("Dropping {} before concat: {}", clip.output_path.display(), err));
                    dropped.push((clip.clone(), format!("stream probe failed before concat: {}", err)));
                }
            }
        }
        if used.is_empty() {
            return Err(BuildError::ConcatFailed(
                "no subclip passed the pre-concat stream check".to_string(),
            ));
        }
        if req.narration.is_empty() {
            return Err(BuildError::ConcatFailed("no narration segments".to_string()));
        }

        let holds = timeline_holds(&used, &req.beats);
        let held: f64 = holds.iter().map(ClipHold::total).sum();
        if held > 0.0 {
            logi(format!("Holding frames for {:.2}s to keep beats on their narration", held));
        }
        let video_secs: f64 = used.iter().map(Subclip::duration).sum::<f64>() + held;
        let pad_secs = (req.narration_secs - video_secs).max(0.0);
        if pad_secs > PAD_TOLERANCE_SECS {
            logi(format!("Video {:.2}s < narration {:.2}s; holding last frame", video_secs, req.narration_secs));
        }

        if let Some(parent) = req.output.parent() {
            fs::create_dir_all(parent).await?;
        }
        let partial = temp_output_path(&req.output);
        let args = render_args(req, &used, &holds, pad_secs, &partial);

        // Last look right before the command: nothing without video gets in.
        for clip in &used {
            if !self.gate.has_video_stream(&clip.output_path).await.unwrap_or(false) {
                return Err(BuildError::ConcatFailed(format!(
                    "{} lost its video stream before concat",
                    clip.output_path.display()
                )));
            }
        }

        logi(format!("Assembling {} clips -> {}", used.len(), req.output.display()));
        if let Err(err) = self.runner.run(&args, self.timeout).await {
            let _ = fs::remove_file(&partial).await;
            return Err(BuildError::ConcatFailed(err.to_string()));
        }
        if !self.gate.has_video_stream(&partial).await.unwrap_or(false) {
            let _ = fs::remove_file(&partial).await;
            return Err(BuildError::ConcatFailed(
                "assembled file has no video stream".to_string(),
            ));
        }
        fs::rename(&partial, &req.output).await?;
        logok(format!("Wrote {}", req.output.display()));

        Ok(AssemblyOutcome {
            output: req.output.clone(),
            used_clips: used,
            holds,
            dropped,
            video_secs,
            padded_secs: if pad_secs > PAD_TOLERANCE_SECS { pad_secs } else { 0.0 },
        })
    }
}
