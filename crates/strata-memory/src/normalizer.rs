//! Entity name normalization for cross-layer matching.
//!
//! A canonical key is the lowercased name with diacritics folded,
//! punctuation removed and whitespace collapsed. Keys that are too short or
//! generic to identify anything come back as `None`, and such entities are
//! never bridged.

use std::sync::LazyLock;

use regex::Regex;

/// Shortest key (in characters) that can take part in linking.
pub const MIN_KEY_CHARS: usize = 3;

/// Generic names that would bridge unrelated entities.
pub const ENTITY_STOP_WORDS: &[&str] = &[
    "project",
    "system",
    "data",
    "memory",
    "graph",
    "ai",
    "model",
    "user",
    "assistant",
    "chat",
    "summary",
    "context",
    "fact",
    "проект",
    "система",
    "данные",
    "память",
    "граф",
    "ии",
    "модель",
    "пользователь",
    "ассистент",
    "чат",
    "саммари",
    "контекст",
    "факт",
    "unknown",
    "none",
    "null",
];

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s]").unwrap());

/// Fold a single lowercase character to its base letter.
fn fold_char(c: char) -> Option<char> {
    let folded = match c {
        'ё' => 'е',
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'ď' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' => 'i',
        'ł' => 'l',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
        'ř' => 'r',
        'ś' | 'š' | 'ş' => 's',
        'ť' | 'ţ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        // Combining marks left over from decomposed input.
        '\u{0300}'..='\u{036f}' => return None,
        other => other,
    };
    Some(folded)
}

/// Canonical key for `name`, or `None` when it must not be linked.
pub fn normalize_entity_name(name: &str) -> Option<String> {
    let folded: String = name.to_lowercase().chars().filter_map(fold_char).collect();
    let stripped = NON_WORD.replace_all(&folded, "");
    let key = stripped.split_whitespace().collect::<Vec<_>>().join(" ");

    if key.chars().count() < MIN_KEY_CHARS || ENTITY_STOP_WORDS.contains(&key.as_str()) {
        return None;
    }
    Some(key)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
