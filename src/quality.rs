//! Quality gate: stream presence and black-frame detection.

use crate::error::MediaError;
use crate::ffmpeg;
use async_trait::async_trait;
use std::path::Path;

/// Mean luma below this is a candidate black frame.
pub const BLACK_MEAN_LUMA: f64 = 20.0;
/// A pixel darker than this counts as dark.
pub const DARK_PIXEL_LUMA: u8 = 32;
/// Share of dark pixels required to classify a frame as black.
pub const DARK_PIXEL_SHARE: f64 = 0.98;

#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn has_video_stream(&self, path: &Path) -> Result<bool, MediaError>;

    async fn is_black_frame(&self, path: &Path, at_sec: f64) -> Result<bool, MediaError>;

    async fn media_duration(&self, path: &Path) -> Result<f64, MediaError>;
}

/// Gate backed by ffprobe/ffmpeg subprocesses.
#[derive(Debug, Clone, Copy, Default)]
pub struct FfmpegQualityGate;

#[async_trait]
impl QualityGate for FfmpegQualityGate {
    async fn has_video_stream(&self, path: &Path) -> Result<bool, MediaError> {
        ffmpeg::probe_has_video_stream(path).await
    }

    async fn is_black_frame(&self, path: &Path, at_sec: f64) -> Result<bool, MediaError> {
        let pixels = ffmpeg::sample_gray_frame(path, at_sec).await?;
        // Nothing decodable at that point is as useless as a black frame.
        Ok(pixels.is_empty() || classify_black(&pixels))
    }

    async fn media_duration(&self, path: &Path) -> Result<f64, MediaError> {
        ffmpeg::probe_duration(path).await
    }
}

/// Classify a grayscale bitmap as black (or nearly so).
pub fn classify_black(pixels: &[u8]) -> bool {
    if pixels.is_empty() {
        return true;
    }
    let total = pixels.len() as f64;
    let mean = pixels.iter().map(|&p| p as f64).sum::<f64>() / total;
    let dark = pixels.iter().filter(|&&p| p < DARK_PIXEL_LUMA).count() as f64;
    mean < BLACK_MEAN_LUMA && dark / total >= DARK_PIXEL_SHARE
}

/// Where to sample a clip of `duration` seconds: half a second in, or the
/// midpoint for anything shorter than a second.
pub fn sample_point(duration: f64) -> f64 {
    if duration > 1.0 { 0.5 } else { (duration / 2.0).max(0.0) }
}
