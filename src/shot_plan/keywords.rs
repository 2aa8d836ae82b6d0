//! Deterministic search terms for a scene.
//!
//! Everything here is a pure function of the scene text and its shot types,
//! so recompiling the same narration yields the same terms.

use super::{KEYWORD_WORDS, KEYWORDS_PER_SCENE, QUERIES_PER_SCENE, QUERY_WORDS, ShotType};
use crate::stable_seed;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;

const MAX_ANCHOR_WORDS: usize = 3;
const SUMMARY_WORDS: usize = 30;

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "again", "against", "all", "also", "an", "and", "any", "are", "as",
    "at", "be", "been", "before", "but", "by", "during", "each", "even", "for", "from", "had",
    "has", "have", "he", "her", "here", "his", "how", "in", "into", "is", "it", "its", "just",
    "more", "most", "no", "not", "now", "of", "on", "once", "only", "or", "our", "over", "she",
    "so", "some", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "those", "through", "to", "under", "until", "was", "we", "were", "what", "when",
    "where", "which", "while", "who", "why", "will", "with", "within", "would", "yet", "you",
];

const GENERIC_KEYWORDS: &[&str] = &[
    "archival film footage",
    "historical newsreel footage",
    "vintage documentary footage",
    "black and white footage",
    "historical photograph archive",
    "period archival photograph",
    "old newsreel clip",
    "archival still image",
    "historic public domain film",
    "museum archive collection",
];

const KEYWORD_PAD: &[&str] = &["archival", "footage", "historical", "photo"];
const QUERY_PAD: &[&str] = &["historical", "archive", "public", "domain", "collection", "film"];

const QUERY_ROTATION: &[&str] = &[
    "archival footage",
    "historical photograph",
    "newsreel film",
    "vintage map",
    "original documents",
];

static PROPER_NOUN_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"\b\p{Lu}\p{Ll}+(?:\s+\p{Lu}\p{Ll}+)*").ok());

static YEAR_RE: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"\b(1\d{3}|20\d{2})\b").ok());

fn object_phrases(shot_type: ShotType) -> [&'static str; 2] {
    match shot_type {
        ShotType::MapsContext => ["archival map", "route map"],
        ShotType::ArchivalDocuments => ["historical document", "signed treaty"],
        ShotType::TroopMovement => ["marching troops", "army column"],
        ShotType::PortraitsLeaders => ["official portrait", "leader photograph"],
        ShotType::DestructionAftermath => ["city ruins", "bomb damage"],
        ShotType::CivilianLife => ["civilian crowd", "refugee families"],
        ShotType::IndustryLogistics => ["factory floor", "railway freight"],
        ShotType::CombatAction => ["battle footage", "artillery fire"],
        ShotType::EstablishingLandscape => ["landscape panorama", "aerial view"],
    }
}

fn preferred_query_phrase(shot_type: ShotType) -> &'static str {
    match shot_type {
        ShotType::MapsContext => "vintage map",
        ShotType::ArchivalDocuments => "original documents",
        ShotType::TroopMovement | ShotType::CombatAction => "newsreel film",
        ShotType::PortraitsLeaders => "historical photograph",
        ShotType::DestructionAftermath
        | ShotType::CivilianLife
        | ShotType::IndustryLogistics
        | ShotType::EstablishingLandscape => "archival footage",
    }
}

pub(crate) fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word.to_lowercase().as_str())
}

/// Topic anchors pulled from a scene's text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Anchors {
    pub entity: Option<String>,
    pub year: Option<String>,
}

impl Anchors {
    /// The single strongest anchor, used when nothing else is available.
    pub fn primary(&self) -> &str {
        self.entity
            .as_deref()
            .or(self.year.as_deref())
            .unwrap_or("historical")
    }
}

/// Proper-noun phrases in order of first appearance, leading stop-words removed.
pub fn proper_noun_phrases(text: &str) -> Vec<String> {
    let Some(re) = PROPER_NOUN_RE.as_ref() else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for m in re.find_iter(text) {
        let words: Vec<&str> = m
            .as_str()
            .split_whitespace()
            .skip_while(|w| is_stopword(w))
            .take(MAX_ANCHOR_WORDS)
            .collect();
        if words.is_empty() {
            continue;
        }
        let phrase = words.join(" ");
        if seen.insert(phrase.to_lowercase()) {
            out.push(phrase);
        }
    }
    out
}

pub fn first_year(text: &str) -> Option<String> {
    YEAR_RE
        .as_ref()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Pick anchors for a scene. The proper-noun choice is seeded by the text hash.
pub fn extract_anchors(text: &str, focus_entities: &[String]) -> Anchors {
    let candidates = proper_noun_phrases(text);
    let entity = if candidates.is_empty() {
        focus_entities.first().map(|e| {
            e.split_whitespace()
                .take(MAX_ANCHOR_WORDS)
                .collect::<Vec<_>>()
                .join(" ")
        })
    } else {
        let idx = (stable_seed(text) % candidates.len() as u64) as usize;
        Some(candidates[idx].clone())
    };

    Anchors {
        entity: entity.filter(|e| !e.is_empty()),
        year: first_year(text),
    }
}

/// Truncate to the upper bound, pad from `pad` up to the lower bound.
///
/// Returns `None` when the phrase cannot be brought into range.
pub fn clamp_words(phrase: &str, bounds: &RangeInclusive<usize>, pad: &[&str]) -> Option<String> {
    let mut words: Vec<String> = phrase
        .split_whitespace()
        .take(*bounds.end())
        .map(str::to_string)
        .collect();

    for filler in pad {
        if words.len() >= *bounds.start() {
            break;
        }
        if !words.iter().any(|w| w.eq_ignore_ascii_case(filler)) {
            words.push((*filler).to_string());
        }
    }

    if bounds.contains(&words.len()) {
        Some(words.join(" "))
    } else {
        None
    }
}

/// Collects unique (case-insensitive) terms up to a fixed count.
struct TermSet {
    limit: usize,
    bounds: RangeInclusive<usize>,
    pad: &'static [&'static str],
    seen: HashSet<String>,
    terms: Vec<String>,
}

impl TermSet {
    fn new(limit: usize, bounds: RangeInclusive<usize>, pad: &'static [&'static str]) -> Self {
        Self {
            limit,
            bounds,
            pad,
            seen: HashSet::new(),
            terms: Vec::with_capacity(limit),
        }
    }

    fn is_full(&self) -> bool {
        self.terms.len() >= self.limit
    }

    fn push(&mut self, phrase: &str) -> bool {
        if self.is_full() {
            return false;
        }
        let Some(clamped) = clamp_words(phrase, &self.bounds, self.pad) else {
            return false;
        };
        if self.seen.insert(clamped.to_lowercase()) {
            self.terms.push(clamped);
            true
        } else {
            false
        }
    }

    fn into_terms(self) -> Vec<String> {
        self.terms
    }
}

/// Exactly `KEYWORDS_PER_SCENE` unique keywords of 2-5 words.
pub fn generate_keywords(anchors: &Anchors, shot_types: &[ShotType]) -> Vec<String> {
    let mut set = TermSet::new(KEYWORDS_PER_SCENE, KEYWORD_WORDS, KEYWORD_PAD);
    let objects: Vec<&str> = shot_types.iter().flat_map(|t| object_phrases(*t)).collect();

    if let Some(entity) = &anchors.entity {
        for object in objects.iter().take(3) {
            set.push(&format!("{} {}", entity, object));
        }
    }
    if let Some(year) = &anchors.year {
        for object in objects.iter().take(2) {
            set.push(&format!("{} {}", object, year));
        }
    }
    if let (Some(entity), Some(year)) = (&anchors.entity, &anchors.year) {
        set.push(&format!("{} {}", entity, year));
    }
    for object in &objects {
        set.push(object);
    }
    for generic in GENERIC_KEYWORDS {
        if set.is_full() {
            break;
        }
        set.push(generic);
    }

    set.into_terms()
}

/// Most frequent significant words of the scene, excluding anchor words.
fn context_words(text: &str, anchors: &Anchors, limit: usize) -> Vec<String> {
    let anchor_words: HashSet<String> = anchors
        .entity
        .iter()
        .flat_map(|e| e.split_whitespace())
        .map(str::to_lowercase)
        .collect();

    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (pos, raw) in text
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| w.chars().count() >= 4)
        .enumerate()
    {
        let word = raw.to_lowercase();
        if is_stopword(&word) || anchor_words.contains(&word) {
            continue;
        }
        let entry = counts.entry(word).or_insert((0, pos));
        entry.0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
    ranked.into_iter().take(limit).map(|(w, _)| w).collect()
}

/// Query object phrases, shot-type preferences first, then the fixed rotation order.
pub fn query_phrase_order(shot_types: &[ShotType]) -> Vec<&'static str> {
    let mut order: Vec<&'static str> = Vec::with_capacity(QUERY_ROTATION.len());
    for t in shot_types {
        let phrase = preferred_query_phrase(*t);
        if !order.contains(&phrase) {
            order.push(phrase);
        }
    }
    for phrase in QUERY_ROTATION {
        if !order.contains(phrase) {
            order.push(*phrase);
        }
    }
    order
}

/// Candidate queries before guardrail review. May contain fewer than five on odd input.
pub fn draft_queries(text: &str, anchors: &Anchors, shot_types: &[ShotType]) -> Vec<String> {
    let context = context_words(text, anchors, 3);
    let topic = anchors.entity.as_deref().unwrap_or("historical");

    query_phrase_order(shot_types)
        .into_iter()
        .take(QUERIES_PER_SCENE)
        .enumerate()
        .map(|(i, phrase)| {
            let mut parts: Vec<String> = vec![topic.to_string()];
            if let Some(year) = &anchors.year {
                parts.push(year.clone());
            }
            parts.push(phrase.to_string());
            if !context.is_empty() {
                parts.push(context[i % context.len()].clone());
                if context.len() > 1 {
                    parts.push(context[(i + 1) % context.len()].clone());
                }
            }
            parts.join(" ")
        })
        .collect()
}

/// Bring any query list to exactly five unique, in-bounds queries.
pub fn finalize_queries(queries: &[String], anchors: &Anchors) -> Vec<String> {
    let mut set = TermSet::new(QUERIES_PER_SCENE, QUERY_WORDS, QUERY_PAD);
    for q in queries {
        set.push(q);
    }

    let anchor = anchors.primary();
    let fallbacks = [
        format!("{} archival footage historical record", anchor),
        format!("{} vintage newsreel film archive", anchor),
        format!("{} historical photograph public domain", anchor),
        format!("{} original documents museum collection", anchor),
        format!("{} old map historical atlas scan", anchor),
    ];
    for fallback in &fallbacks {
        set.push(fallback);
    }

    let mut reel = 1usize;
    while !set.is_full() && reel <= QUERIES_PER_SCENE * 4 {
        set.push(&format!("{} archival film reel {}", anchor, reel));
        reel += 1;
    }
    set.into_terms()
}

/// Provided summary, or the opening words of the scene text.
pub fn summarize(text: &str, provided: Option<&str>) -> String {
    if let Some(summary) = provided.map(str::trim).filter(|s| !s.is_empty()) {
        return summary.to_string();
    }
    let summary = text
        .split_whitespace()
        .take(SUMMARY_WORDS)
        .collect::<Vec<_>>()
        .join(" ");
    if summary.is_empty() {
        "Archival sequence".to_string()
    } else {
        summary
    }
}
