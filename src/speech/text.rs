//! Script text preparation for speech.

use std::sync::LazyLock;

use regex::Regex;

static PAUSE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[PAUSE\s*\d+\s*s\]").expect("valid pause regex"));

static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Replace `[PAUSE Ns]` markers with `...` and collapse whitespace.
pub fn clean_text(text: &str) -> String {
    let without_pauses = PAUSE_MARKER.replace_all(text, "...");
    WHITESPACE.replace_all(&without_pauses, " ").trim().to_string()
}

/// Split text into sentences at .!? boundaries.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if (b == b'.' || b == b'!' || b == b'?')
            && i + 1 < bytes.len()
            && bytes[i + 1].is_ascii_whitespace()
        {
            let end = i + 1;
            let s = text[start..end].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = end;
        }
    }

    // Remainder
    let s = text[start..].trim();
    if !s.is_empty() {
        sentences.push(s);
    }

    sentences
}
