use super::{IMAGE_EXTENSIONS, ResolvedMedia, VIDEO_EXTENSIONS, json_size, url_extension};
use serde_json::Value;

const METADATA_BASE: &str = "https://archive.org/metadata";
const DOWNLOAD_BASE: &str = "https://archive.org/download";

pub fn metadata_url(identifier: &str) -> String {
    format!("{}/{}", METADATA_BASE, identifier.trim_matches('/'))
}

pub fn download_url(identifier: &str, file_name: &str) -> String {
    format!(
        "{}/{}/{}",
        DOWNLOAD_BASE,
        identifier.trim_matches('/'),
        file_name.trim_start_matches('/')
    )
}

/// First video file in the item's file list, else the first image.
/// Thumbnails and other derivatives flagged by format are skipped.
pub fn pick_media_file(identifier: &str, metadata: &Value) -> Option<ResolvedMedia> {
    let files = metadata.get("files")?.as_array()?;

    let usable = |extensions: &[&str]| {
        files.iter().find_map(|file| {
            let name = file.get("name")?.as_str()?;
            let format = file.get("format").and_then(Value::as_str).unwrap_or("");
            if format.to_ascii_lowercase().contains("thumbnail") {
                return None;
            }
            let ext = url_extension(name)?;
            if !extensions.contains(&ext.as_str()) {
                return None;
            }
            Some(ResolvedMedia::new(
                download_url(identifier, name),
                json_size(file.get("size")),
            ))
        })
    };

    usable(VIDEO_EXTENSIONS).or_else(|| usable(IMAGE_EXTENSIONS))
}
