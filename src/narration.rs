use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

const AUDIO_EXTENSIONS: &[&str] = &["wav", "mp3", "m4a"];

/// One block of voice-over text. Order in the surrounding list is significant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NarrationBlock {
    pub block_id: String,
    pub text: String,
}

impl NarrationBlock {
    pub fn new(block_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            block_id: block_id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NarrationRoot {
    Wrapped { blocks: Vec<NarrationBlock> },
    Bare(Vec<NarrationBlock>),
}

/// Parse narration JSON: either `[{block_id, text}, ...]` or `{"blocks": [...]}`.
pub fn parse_narration(text: &str) -> Result<Vec<NarrationBlock>> {
    let root: NarrationRoot =
        serde_json::from_str(text).with_context(|| "Failed to parse narration JSON")?;
    let blocks = match root {
        NarrationRoot::Wrapped { blocks } => blocks,
        NarrationRoot::Bare(blocks) => blocks,
    };

    let mut seen = HashSet::new();
    for block in &blocks {
        if block.block_id.trim().is_empty() {
            anyhow::bail!("narration block with empty block_id");
        }
        if !seen.insert(block.block_id.as_str()) {
            anyhow::bail!("duplicate narration block_id {}", block.block_id);
        }
    }
    Ok(blocks)
}

pub async fn load_narration<P: AsRef<Path>>(path: P) -> Result<Vec<NarrationBlock>> {
    let text = fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read narration: {}", path.as_ref().display()))?;
    parse_narration(&text)
}

/// Per-block voice-over file `<dir>/<block_id>.{wav,mp3,m4a}`, if present.
pub fn block_audio_path(audio_dir: &Path, block_id: &str) -> Option<PathBuf> {
    AUDIO_EXTENSIONS
        .iter()
        .map(|ext| audio_dir.join(format!("{}.{}", block_id, ext)))
        .find(|p| p.is_file())
}
