use crate::config::BuildConfig;
use crate::logi;
use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

/// Create the cache, work and output directories a build writes into.
pub async fn ensure_directories(cfg: &BuildConfig) -> Result<()> {
    for dir in [&cfg.cache_dir, &cfg.work_dir, &cfg.output_dir] {
        ensure_dir(dir).await?;
    }
    Ok(())
}

pub async fn ensure_dir(dir: &Path) -> Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        logi(format!("Created directory: {}", dir.display()));
    }
    Ok(())
}

async fn tool_runs(tool: &str) -> bool {
    match tokio::process::Command::new(tool)
        .arg("-version")
        .output()
        .await
    {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Both ffmpeg and ffprobe are required for a build.
pub async fn check_media_tools() -> bool {
    tool_runs("ffmpeg").await && tool_runs("ffprobe").await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_directories_creates_missing_dirs() {
        let root = tempfile::tempdir().unwrap();
        let cfg = BuildConfig {
            cache_dir: root.path().join("cache"),
            work_dir: root.path().join("work/nested"),
            output_dir: root.path().join("out"),
            ..BuildConfig::default()
        };
        ensure_directories(&cfg).await.unwrap();
        assert!(cfg.cache_dir.is_dir());
        assert!(cfg.work_dir.is_dir());
        assert!(cfg.output_dir.is_dir());
    }
}
