//! Spoken-duration estimates from narration text.

/// Scenes never get shorter than this, even for empty narration.
pub const MIN_SCENE_SECONDS: u32 = 2;

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Estimated seconds to speak `text` at `words_per_minute`, rounded to whole seconds.
pub fn estimate_seconds(text: &str, words_per_minute: u32) -> u32 {
    let wpm = words_per_minute.max(1) as f64;
    let secs = word_count(text) as f64 / wpm * 60.0;
    secs.round() as u32
}

/// Precise estimate for beat planning when no narration audio is available.
pub fn estimate_seconds_f64(text: &str, words_per_minute: u32) -> f64 {
    let wpm = words_per_minute.max(1) as f64;
    word_count(text) as f64 / wpm * 60.0
}

/// Sum of block estimates, clamped to the minimum scene length.
pub fn scene_seconds<'a, I>(texts: I, words_per_minute: u32) -> u32
where
    I: IntoIterator<Item = &'a str>,
{
    let total: u32 = texts
        .into_iter()
        .map(|t| estimate_seconds(t, words_per_minute))
        .sum();
    total.max(MIN_SCENE_SECONDS)
}
