//! Text utilities: normalization, fingerprints, correction markers, chunking.
//!
//! All lengths here are measured in characters, not bytes, so multi-byte
//! scripts chunk and truncate the same way ASCII does.

use sha2::{Digest, Sha256};

/// Phrases that mark a message as correcting earlier information.
pub const CORRECTION_MARKERS: &[&str] = &[
    "это ошибка",
    "ошибка",
    "неправильно",
    "раньше я говорил",
    "на самом деле",
    "правильно так",
    "не сотрудничает",
    "не занимается",
    "исправление",
    "коррекция",
    "обновление",
    "теперь",
    "в действительности",
    "actually",
    "correction",
    "update",
    "wrong",
    "mistake",
];

/// Trim, collapse internal whitespace runs to one space, lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 hex digest of [`normalize_text`].
///
/// Two texts that differ only in case or whitespace share a fingerprint.
pub fn fingerprint(text: &str) -> String {
    let digest = Sha256::digest(normalize_text(text).as_bytes());
    format!("{digest:x}")
}

/// Whether the text contains any [`CORRECTION_MARKERS`] phrase.
pub fn is_correction_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    CORRECTION_MARKERS.iter().any(|m| lower.contains(m))
}

/// Number of characters in `text`.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// The first `max_chars` characters of `text`.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Characters `[start, end)` of `text`, clamped to its length.
pub fn slice_chars(text: &str, start: usize, end: usize) -> &str {
    let byte_at = |n: usize| text.char_indices().nth(n).map_or(text.len(), |(i, _)| i);
    let from = byte_at(start);
    let to = byte_at(end.max(start));
    &text[from..to]
}

// ─────────────────────────────────────────────────────────────────────────────
// Chunking
// ─────────────────────────────────────────────────────────────────────────────

/// Split long text into chunks of at most `max_chars` characters.
///
/// Paragraphs (blank-line separated) are packed greedily. A paragraph that
/// alone exceeds the limit is split on sentence boundaries, and a sentence
/// that alone exceeds it is hard-sliced. Chunks shorter than `min_chars` are
/// folded into the previous chunk when that stays within the limit.
///
/// Text within the limit comes back as a single trimmed chunk; blank text
/// yields no chunks.
pub fn split_into_chunks(text: &str, max_chars: usize, min_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    if char_len(text) <= max_chars {
        return vec![trimmed.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    for para in text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        if char_len(&current) + char_len(para) + 2 <= max_chars {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(para);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if char_len(para) <= max_chars {
            current = para.to_string();
            continue;
        }

        for sentence in split_sentences(para) {
            if char_len(&current) + char_len(sentence) < max_chars {
                if !current.is_empty() {
                    current.push(' ');
                }
                current.push_str(sentence);
                continue;
            }
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if char_len(sentence) > max_chars {
                chunks.extend(hard_split(sentence, max_chars));
            } else {
                current = sentence.to_string();
            }
        }
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim().to_string());
    }

    merge_small_chunks(chunks, max_chars, min_chars)
}

/// Split on whitespace that follows `.`, `!` or `?`.
fn split_sentences(para: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev_terminal = false;
    let mut in_gap = false;

    for (idx, ch) in para.char_indices() {
        if ch.is_whitespace() {
            if prev_terminal && !in_gap {
                let sentence = para[start..idx].trim();
                if !sentence.is_empty() {
                    out.push(sentence);
                }
                in_gap = true;
            }
            if !in_gap {
                prev_terminal = false;
            }
            continue;
        }
        if in_gap {
            start = idx;
            in_gap = false;
        }
        prev_terminal = matches!(ch, '.' | '!' | '?');
    }

    if !in_gap {
        let tail = para[start..].trim();
        if !tail.is_empty() {
            out.push(tail);
        }
    }
    out
}

fn hard_split(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(max_chars)
        .map(|c| c.iter().collect::<String>().trim().to_string())
        .filter(|c| !c.is_empty())
        .collect()
}

fn merge_small_chunks(chunks: Vec<String>, max_chars: usize, min_chars: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        let chunk = chunk.trim().to_string();
        if chunk.is_empty() {
            continue;
        }
        if char_len(&chunk) < min_chars {
            if let Some(last) = out.last_mut() {
                if char_len(last) + char_len(&chunk) + 2 <= max_chars {
                    last.push_str("\n\n");
                    last.push_str(&chunk);
                    continue;
                }
            }
        }
        out.push(chunk);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
