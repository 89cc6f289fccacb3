//! Text matching between asserted citation text and authoritative text.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

static RE_NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\p{L}\p{N}]+").unwrap());

/// Words too common to count towards overlap.
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "that", "the", "this", "to", "with",
];

/// How asserted text relates to the authoritative text.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TextMatch {
    /// Normalized asserted text is a substring of the normalized source.
    Exact,
    /// Token overlap at or above the threshold.
    Similar(f64),
    /// Token overlap below the threshold.
    Mismatch(f64),
}

impl TextMatch {
    pub fn is_supported(&self) -> bool {
        !matches!(self, TextMatch::Mismatch(_))
    }
}

/// Lowercase, collapse punctuation and whitespace to single spaces.
pub fn normalize(text: &str) -> String {
    RE_NON_WORD
        .replace_all(&text.to_lowercase(), " ")
        .trim()
        .to_string()
}

fn tokens(normalized: &str) -> HashSet<&str> {
    normalized
        .split(' ')
        .filter(|t| !t.is_empty() && !STOPWORDS.contains(t))
        .collect()
}

/// Share of the asserted text's content words found in the source.
pub fn token_overlap(asserted: &str, source: &str) -> f64 {
    let asserted = normalize(asserted);
    let source = normalize(source);
    let wanted = tokens(&asserted);
    if wanted.is_empty() {
        return 0.0;
    }
    let available = tokens(&source);
    let hits = wanted.iter().filter(|t| available.contains(*t)).count();
    hits as f64 / wanted.len() as f64
}

/// Decide whether `source` supports `asserted`.
pub fn match_text(asserted: &str, source: &str, threshold: f64) -> TextMatch {
    let needle = normalize(asserted);
    if needle.is_empty() {
        return TextMatch::Mismatch(0.0);
    }
    let haystack = normalize(source);
    if format!(" {haystack} ").contains(&format!(" {needle} ")) {
        return TextMatch::Exact;
    }

    let overlap = token_overlap(asserted, source);
    if overlap >= threshold {
        TextMatch::Similar(overlap)
    } else {
        TextMatch::Mismatch(overlap)
    }
}
