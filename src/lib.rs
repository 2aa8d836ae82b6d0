use once_cell::sync::Lazy;
use std::sync::{Arc, Mutex};

pub mod api;
pub mod assembler;
pub mod builder;
pub mod cache;
pub mod config;
pub mod cutter;
pub mod error;
pub mod ffmpeg;
pub mod init;
pub mod lock;
pub mod manifest;
pub mod narration;
pub mod panzoom;
pub mod progress;
pub mod quality;
pub mod report;
pub mod selector;
pub mod shot_plan;
pub mod timing;

pub type BuildLogHook = Arc<Mutex<dyn Fn(&str) + Send + Sync + 'static>>;

static LOG_HOOK: Lazy<Mutex<Option<BuildLogHook>>> = Lazy::new(|| Mutex::new(None));

/// Mirror every pipeline log line into `hook` (or stop mirroring with `None`).
pub fn set_log_hook(hook: Option<BuildLogHook>) {
    if let Ok(mut guard) = LOG_HOOK.lock() {
        *guard = hook;
    }
}

pub(crate) fn logv(tag: &str, message: &str) {
    match tag {
        "WARN" => tracing::warn!("{}", message),
        _ => tracing::info!("{}", message),
    }

    if let Ok(guard) = LOG_HOOK.lock() {
        if let Some(hook) = guard.as_ref() {
            if let Ok(callback) = hook.lock() {
                let line = format!("[{}] {}", tag, message);
                callback(&line);
            }
        }
    }
}

/// Seed derived from the first 8 bytes of the SHA-256 of `text`.
///
/// Stands in for randomness wherever output must be reproducible.
pub fn stable_seed(text: &str) -> u64 {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(text.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

pub(crate) fn logi(message: impl AsRef<str>) {
    logv("INFO", message.as_ref());
}

pub(crate) fn logok(message: impl AsRef<str>) {
    logv("OK", message.as_ref());
}

pub(crate) fn logw(message: impl AsRef<str>) {
    logv("WARN", message.as_ref());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_mirrors_tagged_lines_until_cleared() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&lines);
        set_log_hook(Some(Arc::new(Mutex::new(move |line: &str| {
            sink.lock().unwrap().push(line.to_string())
        }))));
        logw("reel_a has no video stream");
        set_log_hook(None);
        logi("after the hook was cleared");

        let lines = lines.lock().unwrap();
        assert!(lines.iter().any(|l| l == "[WARN] reel_a has no video stream"));
        assert!(!lines.iter().any(|l| l.contains("after the hook was cleared")));
    }

    #[test]
    fn stable_seed_depends_only_on_text() {
        assert_eq!(stable_seed("episode"), stable_seed("episode"));
        assert_ne!(stable_seed("episode"), stable_seed("episode-2"));
    }
}
