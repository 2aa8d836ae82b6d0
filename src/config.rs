use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub const DEFAULT_WORDS_PER_MINUTE: u32 = 150;
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 500 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_music_dir")]
    pub music_dir: PathBuf,

    #[serde(default = "default_words_per_minute")]
    pub words_per_minute: u32,

    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,

    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    /// How many distinct, most recently used assets are deprioritized.
    #[serde(default = "default_recent_window")]
    pub recent_window: usize,
    /// Seconds skipped at the head of video sources (title cards, logos).
    #[serde(default = "default_safe_head_secs")]
    pub safe_head_secs: f64,

    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
    #[serde(default = "default_max_parallel_cuts")]
    pub max_parallel_cuts: usize,
    #[serde(default = "default_cut_timeout_secs")]
    pub cut_timeout_secs: u64,
    #[serde(default = "default_concat_timeout_secs")]
    pub concat_timeout_secs: u64,

    /// Share of beats that must end up with footage before the build is flagged degraded.
    #[serde(default = "default_min_coverage")]
    pub min_coverage: f64,

    #[serde(default = "default_bgm_gain")]
    pub bgm_gain: f64,
    #[serde(default = "default_bgm_fade_in_secs")]
    pub bgm_fade_in_secs: f64,
    #[serde(default = "default_bgm_fade_out_secs")]
    pub bgm_fade_out_secs: f64,

    #[serde(default)]
    pub europeana_api_key: Option<String>,

    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_music_dir() -> PathBuf {
    PathBuf::from("backgroundmusic")
}

fn default_words_per_minute() -> u32 {
    DEFAULT_WORDS_PER_MINUTE
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_fps() -> u32 {
    30
}

fn default_max_download_bytes() -> u64 {
    DEFAULT_MAX_DOWNLOAD_BYTES
}

fn default_download_attempts() -> u32 {
    3
}

fn default_http_timeout_secs() -> u64 {
    120
}

fn default_recent_window() -> usize {
    8
}

fn default_safe_head_secs() -> f64 {
    30.0
}

fn default_max_parallel_downloads() -> usize {
    4
}

fn default_max_parallel_cuts() -> usize {
    3
}

fn default_cut_timeout_secs() -> u64 {
    300
}

fn default_concat_timeout_secs() -> u64 {
    1800
}

fn default_min_coverage() -> f64 {
    0.6
}

fn default_bgm_gain() -> f64 {
    0.12
}

fn default_bgm_fade_in_secs() -> f64 {
    2.0
}

fn default_bgm_fade_out_secs() -> f64 {
    3.0
}

fn default_lock_stale_secs() -> u64 {
    6 * 3600
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            work_dir: default_work_dir(),
            output_dir: default_output_dir(),
            music_dir: default_music_dir(),
            words_per_minute: default_words_per_minute(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            max_download_bytes: default_max_download_bytes(),
            download_attempts: default_download_attempts(),
            http_timeout_secs: default_http_timeout_secs(),
            recent_window: default_recent_window(),
            safe_head_secs: default_safe_head_secs(),
            max_parallel_downloads: default_max_parallel_downloads(),
            max_parallel_cuts: default_max_parallel_cuts(),
            cut_timeout_secs: default_cut_timeout_secs(),
            concat_timeout_secs: default_concat_timeout_secs(),
            min_coverage: default_min_coverage(),
            bgm_gain: default_bgm_gain(),
            bgm_fade_in_secs: default_bgm_fade_in_secs(),
            bgm_fade_out_secs: default_bgm_fade_out_secs(),
            europeana_api_key: None,
            lock_stale_secs: default_lock_stale_secs(),
        }
    }
}

impl BuildConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config: {}", path.as_ref().display()))?;
        let config: BuildConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.as_ref().display()))?;
        config.check()?;
        Ok(config)
    }

    pub fn check(&self) -> Result<()> {
        if self.words_per_minute == 0 {
            anyhow::bail!("config: words_per_minute must be positive");
        }
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("config: width/height must be positive");
        }
        if self.width % 2 != 0 || self.height % 2 != 0 {
            anyhow::bail!("config: width/height must be even for yuv420p output");
        }
        if self.fps == 0 {
            anyhow::bail!("config: fps must be positive");
        }
        if !(0.0..=1.0).contains(&self.min_coverage) {
            anyhow::bail!("config: min_coverage must be within 0..=1");
        }
        if self.download_attempts == 0 {
            anyhow::bail!("config: download_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn cut_timeout(&self) -> Duration {
        Duration::from_secs(self.cut_timeout_secs)
    }

    pub fn concat_timeout(&self) -> Duration {
        Duration::from_secs(self.concat_timeout_secs)
    }

    pub fn lock_stale(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}
