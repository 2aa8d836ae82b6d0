use crate::error::MediaError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Side of the grayscale thumbnail used for frame classification.
pub const SAMPLE_WIDTH: u32 = 64;
pub const SAMPLE_HEIGHT: u32 = 36;

const STDERR_TAIL_CHARS: usize = 2000;

fn tool_name(program: &str) -> &'static str {
    match program {
        "ffmpeg" => "ffmpeg",
        "ffprobe" => "ffprobe",
        _ => "command",
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(STDERR_TAIL_CHARS);
    chars[start..].iter().collect::<String>().trim().to_string()
}

/// Run `args[0]` with the remaining args, killing it if `timeout` elapses.
/// Returns stdout on success.
pub async fn run_cmd(args: &[String], timeout: Duration) -> Result<Vec<u8>, MediaError> {
    let Some((program, rest)) = args.split_first() else {
        return Err(MediaError::tool_failed("command", "empty command line", None, None));
    };
    let tool = tool_name(program);
    tracing::debug!(tool, args = ?rest, "running media command");

    let child = Command::new(program)
        .args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(MediaError::Timeout {
                tool,
                secs: timeout.as_secs(),
            });
        }
    };

    if !output.status.success() {
        return Err(MediaError::tool_failed(
            tool,
            format!("exited with {}", output.status),
            Some(stderr_tail(&output.stderr)),
            output.status.code(),
        ));
    }
    Ok(output.stdout)
}

/// Executes rendering command lines. Cutting and assembly go through this
/// seam so their control flow can be exercised without ffmpeg installed.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[String], timeout: Duration) -> Result<(), MediaError>;
}

/// Runs commands as real subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, args: &[String], timeout: Duration) -> Result<(), MediaError> {
        run_cmd(args, timeout).await.map(|_| ())
    }
}

fn ffmpeg_base() -> Vec<String> {
    vec![
        "ffmpeg".to_string(),
        "-y".to_string(),
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ]
}

/// Encoder settings shared by every rendered video file.
pub fn h264_output_args() -> Vec<String> {
    vec![
        "-c:v".to_string(),
        "libx264".to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
        "-preset".to_string(),
        "veryfast".to_string(),
        "-crf".to_string(),
        "22".to_string(),
    ]
}

/// True when ffprobe reports at least one video stream. A file ffprobe
/// cannot read has no usable stream.
pub async fn probe_has_video_stream(path: &Path) -> Result<bool, MediaError> {
    let args = vec![
        "ffprobe".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-select_streams".to_string(),
        "v".to_string(),
        "-show_entries".to_string(),
        "stream=codec_type".to_string(),
        "-of".to_string(),
        "csv=p=0".to_string(),
        path.display().to_string(),
    ];
    match run_cmd(&args, PROBE_TIMEOUT).await {
        Ok(stdout) => Ok(String::from_utf8_lossy(&stdout)
            .lines()
            .any(|line| line.trim() == "video")),
        Err(MediaError::ToolFailed { .. }) => Ok(false),
        Err(err) => Err(err),
    }
}

pub async fn probe_duration(path: &Path) -> Result<f64, MediaError> {
    let args = vec![
        "ffprobe".to_string(),
        "-v".to_string(),
        "error".to_string(),
        "-show_entries".to_string(),
        "format=duration".to_string(),
        "-of".to_string(),
        "default=noprint_wrappers=1:nokey=1".to_string(),
        path.display().to_string(),
    ];
    let stdout = run_cmd(&args, PROBE_TIMEOUT).await?;
    parse_duration(&String::from_utf8_lossy(&stdout)).ok_or_else(|| {
        MediaError::tool_failed(
            "ffprobe",
            format!("no duration for {}", path.display()),
            None,
            None,
        )
    })
}

pub fn parse_duration(text: &str) -> Option<f64> {
    let duration = text.trim().lines().next()?.trim().parse::<f64>().ok()?;
    (duration.is_finite() && duration > 0.0).then_some(duration)
}

/// Decode one frame at `at_sec` as a `SAMPLE_WIDTH`x`SAMPLE_HEIGHT` gray bitmap.
pub async fn sample_gray_frame(path: &Path, at_sec: f64) -> Result<Vec<u8>, MediaError> {
    let mut args = ffmpeg_base();
    args.extend([
        "-ss".to_string(),
        format!("{:.3}", at_sec.max(0.0)),
        "-i".to_string(),
        path.display().to_string(),
        "-frames:v".to_string(),
        "1".to_string(),
        "-vf".to_string(),
        format!("scale={}:{},format=gray", SAMPLE_WIDTH, SAMPLE_HEIGHT),
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pix_fmt".to_string(),
        "gray".to_string(),
        "pipe:1".to_string(),
    ]);
    run_cmd(&args, PROBE_TIMEOUT).await
}

/// Scale to cover the target, center-crop, fixed fps, no audio.
/// `looped` repeats a source shorter than the requested duration.
#[allow(clippy::too_many_arguments)]
pub fn video_cut_args(
    src: &Path,
    in_sec: f64,
    duration: f64,
    looped: bool,
    out: &Path,
    width: u32,
    height: u32,
    fps: u32,
) -> Vec<String> {
    let mut args = ffmpeg_base();
    if looped {
        args.extend(["-stream_loop".to_string(), "-1".to_string()]);
    }
    args.extend([
        "-ss".to_string(),
        format!("{:.3}", in_sec),
        "-i".to_string(),
        src.display().to_string(),
        "-t".to_string(),
        format!("{:.3}", duration),
        "-vf".to_string(),
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h},fps={fps},setsar=1,format=yuv420p",
            w = width,
            h = height,
            fps = fps
        ),
        "-an".to_string(),
    ]);
    args.extend(h264_output_args());
    args.extend(["-movflags".to_string(), "+faststart".to_string(), out.display().to_string()]);
    args
}

/// Render a still through a prepared pan/zoom filter chain.
pub fn still_cut_args(src: &Path, duration: f64, filter: &str, out: &Path) -> Vec<String> {
    let mut args = ffmpeg_base();
    args.extend([
        "-i".to_string(),
        src.display().to_string(),
        "-vf".to_string(),
        filter.to_string(),
        "-t".to_string(),
        format!("{:.3}", duration),
        "-an".to_string(),
    ]);
    args.extend(h264_output_args());
    args.extend(["-movflags".to_string(), "+faststart".to_string(), out.display().to_string()]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn parses_probe_duration() {
        assert_eq!(parse_duration("12.480000\n"), Some(12.48));
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration("0.000"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn video_cut_is_silent_and_normalized() {
        let args = video_cut_args(
            &PathBuf::from("cache/a.webm"),
            31.5,
            7.0,
            false,
            &PathBuf::from("work/clip.mp4"),
            1920,
            1080,
            30,
        );
        let joined = args.join(" ");
        assert!(joined.starts_with("ffmpeg -y"));
        assert!(joined.contains("-ss 31.500 -i cache/a.webm -t 7.000"));
        assert!(joined.contains(
            "scale=1920:1080:force_original_aspect_ratio=increase,crop=1920:1080,fps=30,setsar=1"
        ));
        assert!(args.contains(&"-an".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("work/clip.mp4"));
        assert!(!args.contains(&"-stream_loop".to_string()));
    }

    #[test]
    fn stderr_tail_keeps_the_end() {
        let long = "x".repeat(STDERR_TAIL_CHARS + 10) + "END";
        let tail = stderr_tail(long.as_bytes());
        assert!(tail.ends_with("END"));
        assert_eq!(tail.chars().count(), STDERR_TAIL_CHARS);
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let err = run_cmd(&[], PROBE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, MediaError::ToolFailed { tool: "command", .. }));
    }
}
