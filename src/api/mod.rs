//! Direct-media URL resolution for the archival providers.
//!
//! Candidate ids are source-prefixed (`archive:`, `wikimedia:`,
//! `europeana:`); anything else is treated as a URL and accepted only when
//! it already points at a media file.

pub mod archive_org;
pub mod europeana;
pub mod wikimedia;

use crate::config::BuildConfig;
use crate::error::FetchError;
use crate::manifest::AssetRef;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

pub const USER_AGENT: &str = concat!("archival-montage/", env!("CARGO_PKG_VERSION"));

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "webm", "ogv", "mov", "mkv", "m4v", "avi", "mpg", "mpeg",
];
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "tif", "tiff", "webp", "gif"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Image,
}

impl MediaKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else {
            None
        }
    }

    /// Fallback extension when the URL carries none, from a content type.
    pub fn extension_for_content_type(content_type: &str) -> Option<&'static str> {
        let mime = content_type.split(';').next().unwrap_or("").trim();
        match mime.to_ascii_lowercase().as_str() {
            "video/mp4" => Some("mp4"),
            "video/webm" => Some("webm"),
            "video/ogg" => Some("ogv"),
            "video/quicktime" => Some("mov"),
            "video/x-matroska" => Some("mkv"),
            "video/mpeg" => Some("mpg"),
            "image/jpeg" => Some("jpg"),
            "image/png" => Some("png"),
            "image/tiff" => Some("tif"),
            "image/webp" => Some("webp"),
            "image/gif" => Some("gif"),
            _ => None,
        }
    }
}

/// Lowercased extension of the last path segment of a URL or file name,
/// ignoring query strings and fragments.
pub fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let last = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_media_url(url: &str) -> bool {
    url_extension(url)
        .and_then(|ext| MediaKind::from_extension(&ext))
        .is_some()
}

/// Where a candidate id points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    ArchiveOrg(String),
    Wikimedia(String),
    Europeana(String),
    Direct(String),
}

impl Source {
    pub fn parse(item_id: &str) -> Self {
        let item_id = item_id.trim();
        let Some((prefix, rest)) = item_id.split_once(':') else {
            return Self::Direct(item_id.to_string());
        };
        let rest = rest.trim().to_string();
        match prefix.to_ascii_lowercase().as_str() {
            "archive" | "archiveorg" => Self::ArchiveOrg(rest),
            "wikimedia" | "commons" => Self::Wikimedia(rest),
            "europeana" => Self::Europeana(rest),
            _ => Self::Direct(item_id.to_string()),
        }
    }
}

/// A URL the cache can stream, plus the size the provider reported (if any).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMedia {
    pub url: String,
    pub reported_size: Option<u64>,
}

impl ResolvedMedia {
    pub fn new(url: impl Into<String>, reported_size: Option<u64>) -> Self {
        Self {
            url: url.into(),
            reported_size,
        }
    }
}

/// Resolves candidate ids to direct media URLs using the provider APIs.
#[derive(Clone)]
pub struct MediaResolver {
    client: Client,
    europeana_key: String,
}

impl MediaResolver {
    pub fn new(cfg: &BuildConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(cfg.http_timeout())
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            europeana_key: cfg
                .europeana_api_key
                .clone()
                .unwrap_or_else(|| europeana::DEMO_KEY.to_string()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn resolve(&self, asset: &AssetRef) -> Result<ResolvedMedia, FetchError> {
        if let Some(url) = asset.url.as_deref().filter(|u| is_media_url(u)) {
            return Ok(ResolvedMedia::new(url, None));
        }

        match Source::parse(&asset.item_id) {
            Source::ArchiveOrg(identifier) => {
                let doc = self.get_json(&archive_org::metadata_url(&identifier)).await?;
                archive_org::pick_media_file(&identifier, &doc).ok_or_else(|| {
                    unresolvable(asset, "archive.org item has no video or image file")
                })
            }
            Source::Wikimedia(title) => {
                let url = wikimedia::imageinfo_url(&title).map_err(|e| unresolvable(asset, e))?;
                let doc = self.get_json(url.as_str()).await?;
                wikimedia::parse_imageinfo(&doc)
                    .ok_or_else(|| unresolvable(asset, "commons file has no imageinfo"))
            }
            Source::Europeana(record_id) => {
                let url = europeana::record_url(&record_id, &self.europeana_key)
                    .map_err(|e| unresolvable(asset, e))?;
                let doc = self.get_json(url.as_str()).await?;
                europeana::parse_record(&doc)
                    .map(|u| ResolvedMedia::new(u, None))
                    .ok_or_else(|| unresolvable(asset, "record has no edmIsShownBy/edmIsShownAt"))
            }
            Source::Direct(reference) => {
                if is_media_url(&reference) && Url::parse(&reference).is_ok() {
                    Ok(ResolvedMedia::new(reference, None))
                } else {
                    Err(unresolvable(asset, "not a direct media URL"))
                }
            }
        }
    }

    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.json::<Value>().await?)
    }
}

fn unresolvable(asset: &AssetRef, message: impl ToString) -> FetchError {
    FetchError::Unresolvable {
        item_id: asset.item_id.clone(),
        message: message.to_string(),
    }
}

/// Size fields arrive as numbers or numeric strings depending on provider.
pub(crate) fn json_size(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_prefixes() {
        assert_eq!(
            Source::parse("archive:battle_reel_1916"),
            Source::ArchiveOrg("battle_reel_1916".to_string())
        );
        assert_eq!(
            Source::parse("archiveorg:x"),
            Source::ArchiveOrg("x".to_string())
        );
        assert_eq!(
            Source::parse("wikimedia:File:Verdun.webm"),
            Source::Wikimedia("File:Verdun.webm".to_string())
        );
        assert_eq!(
            Source::parse("europeana:/2021672/abc"),
            Source::Europeana("/2021672/abc".to_string())
        );
        assert_eq!(
            Source::parse("https://example.org/a.mp4"),
            Source::Direct("https://example.org/a.mp4".to_string())
        );
    }

    #[test]
    fn media_extensions_ignore_query() {
        assert_eq!(url_extension("https://x.org/a/b.WEBM?dl=1"), Some("webm".to_string()));
        assert!(is_media_url("https://x.org/photo.jpeg#top"));
        assert!(!is_media_url("https://x.org/item/page"));
        assert!(!is_media_url("https://x.org/archive.zip"));
        assert_eq!(MediaKind::from_extension("PNG"), Some(MediaKind::Image));
        assert_eq!(
            MediaKind::extension_for_content_type("video/mp4; codecs=avc1"),
            Some("mp4")
        );
    }

    #[tokio::test]
    async fn direct_urls_resolve_without_network() {
        let resolver = MediaResolver::new(&BuildConfig::default()).unwrap();
        let asset = AssetRef::new("https://example.org/films/reel.mp4");
        let resolved = resolver.resolve(&asset).await.unwrap();
        assert_eq!(resolved.url, "https://example.org/films/reel.mp4");

        let asset = AssetRef::new("https://example.org/films/landing");
        assert!(matches!(
            resolver.resolve(&asset).await,
            Err(FetchError::Unresolvable { .. })
        ));
    }
}
