//! Content-addressed asset cache.
//!
//! Files live at `<cache_dir>/<sha256(url or id)[..32]>.<ext>` and are
//! shared across beats and across builds. Downloads stream into a temp file
//! inside the cache directory and are renamed into place, so a concurrent
//! reader never observes a partial file.

use crate::api::{MediaKind, MediaResolver, url_extension};
use crate::config::BuildConfig;
use crate::error::FetchError;
use crate::manifest::AssetRef;
use crate::{logi, logok, logw};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

/// Download progress callback: `(item_id, bytes_written, total_if_known)`.
pub type DownloadProgress = Arc<dyn Fn(&str, u64, Option<u64>) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedAsset {
    pub cache_key: String,
    pub local_path: PathBuf,
    pub media_kind: MediaKind,
    pub verified_has_video_stream: bool,
}

impl CachedAsset {
    pub fn verified(mut self) -> Self {
        self.verified_has_video_stream = true;
        self
    }
}

pub fn cache_key(identity: &str) -> String {
    let digest = Sha256::digest(identity.trim().as_bytes());
    hex::encode(digest)[..32].to_string()
}

/// Fetch-or-reuse seam used by the selector and the prefetch stage.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, asset: &AssetRef) -> Result<CachedAsset, FetchError>;

    /// Drop a cached file so the next fetch downloads it again.
    async fn evict(&self, asset: &CachedAsset) -> Result<(), FetchError>;
}

pub struct AssetCache {
    dir: PathBuf,
    max_bytes: u64,
    resolver: MediaResolver,
    progress: Option<DownloadProgress>,
}

impl AssetCache {
    pub fn new(cfg: &BuildConfig) -> Result<Self, FetchError> {
        Ok(Self {
            dir: cfg.cache_dir.clone(),
            max_bytes: cfg.max_download_bytes,
            resolver: MediaResolver::new(cfg)?,
            progress: None,
        })
    }

    pub fn with_progress(mut self, progress: DownloadProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Existing non-empty file for `key` with a recognized media extension.
    /// Zero-byte leftovers are removed so the caller re-fetches.
    pub async fn lookup(&self, key: &str) -> Result<Option<CachedAsset>, FetchError> {
        let exts = crate::api::VIDEO_EXTENSIONS
            .iter()
            .chain(crate::api::IMAGE_EXTENSIONS.iter());
        for ext in exts {
            let path = self.dir.join(format!("{}.{}", key, ext));
            let meta = match fs::metadata(&path).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.len() == 0 {
                logw(format!("Evicting empty cache file {}", path.display()));
                fs::remove_file(&path).await?;
                continue;
            }
            if let Some(kind) = MediaKind::from_extension(ext) {
                return Ok(Some(CachedAsset {
                    cache_key: key.to_string(),
                    local_path: path,
                    media_kind: kind,
                    verified_has_video_stream: false,
                }));
            }
        }
        Ok(None)
    }

    async fn download(&self, asset: &AssetRef, key: &str) -> Result<CachedAsset, FetchError> {
        let resolved = self.resolver.resolve(asset).await?;

        if let Ok(parsed) = Url::parse(&resolved.url) {
            if parsed.scheme() == "file" {
                let source = parsed.to_file_path().map_err(|_| FetchError::Unresolvable {
                    item_id: asset.item_id.clone(),
                    message: "invalid file url".to_string(),
                })?;
                return self.ingest_local(asset, key, &source).await;
            }
        }

        let resp = self.resolver.client().get(&resolved.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resolved.url.clone(),
            });
        }

        let total = resp.content_length().or(resolved.reported_size);
        if let Some(size) = total {
            self.check_ceiling(asset, size)?;
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let ext = url_extension(&resolved.url)
            .filter(|ext| MediaKind::from_extension(ext).is_some())
            .or_else(|| MediaKind::extension_for_content_type(&content_type).map(str::to_string))
            .ok_or_else(|| FetchError::Unresolvable {
                item_id: asset.item_id.clone(),
                message: format!("unrecognized media type {:?}", content_type),
            })?;

        fs::create_dir_all(&self.dir).await?;
        let temp_path = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".part")
            .tempfile_in(&self.dir)?
            .into_temp_path();
        let mut file = fs::File::create(&temp_path).await?;

        let mut written: u64 = 0;
        let mut reported: u64 = 0;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            self.check_ceiling(asset, written)?;
            file.write_all(&chunk).await?;
            if written - reported >= PROGRESS_STEP_BYTES {
                reported = written;
                self.report(asset, written, total);
            }
        }
        file.flush().await?;
        drop(file);

        if written == 0 {
            return Err(FetchError::EmptyFile {
                item_id: asset.item_id.clone(),
            });
        }
        self.report(asset, written, total);

        self.commit(temp_path, key, &ext)
    }

    async fn ingest_local(
        &self,
        asset: &AssetRef,
        key: &str,
        source: &Path,
    ) -> Result<CachedAsset, FetchError> {
        let ext = url_extension(&source.to_string_lossy()).unwrap_or_default();
        let size = fs::metadata(source).await?.len();
        if size == 0 {
            return Err(FetchError::EmptyFile {
                item_id: asset.item_id.clone(),
            });
        }
        self.check_ceiling(asset, size)?;

        fs::create_dir_all(&self.dir).await?;
        let temp_path = tempfile::Builder::new()
            .prefix(".copy-")
            .suffix(".part")
            .tempfile_in(&self.dir)?
            .into_temp_path();
        let copied = fs::copy(source, &temp_path).await?;
        self.report(asset, copied, Some(size));
        self.commit(temp_path, key, &ext)
    }

    fn commit(
        &self,
        temp_path: tempfile::TempPath,
        key: &str,
        ext: &str,
    ) -> Result<CachedAsset, FetchError> {
        let media_kind = MediaKind::from_extension(ext).ok_or_else(|| FetchError::Unresolvable {
            item_id: key.to_string(),
            message: format!("unrecognized media extension {:?}", ext),
        })?;
        let final_path = self.dir.join(format!("{}.{}", key, ext));
        temp_path.persist(&final_path).map_err(|e| e.error)?;
        Ok(CachedAsset {
            cache_key: key.to_string(),
            local_path: final_path,
            media_kind,
            verified_has_video_stream: false,
        })
    }

    fn report(&self, asset: &AssetRef, written: u64, total: Option<u64>) {
        if let Some(progress) = &self.progress {
            progress(&asset.item_id, written, total);
        }
    }

    fn check_ceiling(&self, asset: &AssetRef, size: u64) -> Result<(), FetchError> {
        if !asset.primary && size > self.max_bytes {
            return Err(FetchError::TooLarge {
                item_id: asset.item_id.clone(),
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl AssetFetcher for AssetCache {
    async fn fetch(&self, asset: &AssetRef) -> Result<CachedAsset, FetchError> {
        let key = cache_key(asset.canonical());
        if let Some(hit) = self.lookup(&key).await? {
            logi(format!("Cache hit {} -> {}", asset.item_id, hit.local_path.display()));
            return Ok(hit);
        }

        logi(format!("Cache miss {}; downloading", asset.item_id));
        let cached = self.download(asset, &key).await?;
        logok(format!("Cached {} at {}", asset.item_id, cached.local_path.display()));
        Ok(cached)
    }

    async fn evict(&self, asset: &CachedAsset) -> Result<(), FetchError> {
        match fs::remove_file(&asset.local_path).await {
            Ok(()) => {
                logw(format!("Evicted {}", asset.local_path.display()));
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
