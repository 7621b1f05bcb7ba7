use once_cell::sync::Lazy;
use regex::Regex;

static NON_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\p{L}\p{Nd}'\s]+").expect("valid tokenizer regex"));

pub fn normalize_text(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

/// Lowercased, whitespace-collapsed text with typographic apostrophes folded
/// to ASCII so rule patterns see one spelling.
pub fn normalize_for_matching(input: &str) -> String {
    normalize_text(input)
        .to_lowercase()
        .replace(['\u{2019}', '\u{2018}'], "'")
}

pub fn tokenize(input: &str) -> Vec<String> {
    let normalized = normalize_for_matching(input);
    let cleaned = NON_WORD.replace_all(&normalized, " ");

    cleaned
        .split_whitespace()
        .map(|token| token.trim_matches('\''))
        .filter(|token| token.chars().count() > 1)
        .map(ToString::to_string)
        .collect()
}
