//! # Context Assembler
//!
//! Turns a [`FusionResult`] into a bounded text block for an LLM prompt.
//! Summaries and corrections go first, plain chat logs are skipped, long
//! episodes contribute a query-biased snippet. Length is estimated at four
//! characters per token.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use strata_core::text::{char_len, slice_chars, truncate_chars};
use strata_core::{EpisodeKind, Fact};
use strata_settings::ContextSettings;
use tracing::debug;

use crate::retrieval::{FusionResult, Scored};

/// Characters per estimated token.
pub const CHARS_PER_TOKEN: usize = 4;

/// Appended when the text was cut to fit the budget.
pub const TRUNCATION_MARKER: &str = "\n[context truncated to fit token budget]";

/// Marks an elided edge of a snippet.
const ELLIPSIS: char = '…';

/// Query tokens considered for snippet anchoring.
const MAX_QUERY_TOKENS: usize = 8;

const CORRECTION_TURN_CHARS: usize = 400;
const ENTITY_SUMMARY_CHARS: usize = 240;
const FACT_CHARS: usize = 100;
const COMMUNITY_SUMMARY_CHARS: usize = 80;

static QUERY_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\w{3,}").unwrap());

/// Items taken from each section.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSections {
    /// Episodes.
    pub episodes: usize,
    /// Entities (only when no episode qualified).
    pub entities: usize,
    /// Relationships.
    pub relationships: usize,
    /// Communities.
    pub communities: usize,
}

/// Assembled context.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextResult {
    /// Prompt-ready text.
    pub text: String,
    /// Estimated tokens.
    pub token_estimate: usize,
    /// Per-section counts.
    pub sections: ContextSections,
    /// Whether the budget cut the text.
    pub truncated: bool,
}

/// Estimated tokens of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    char_len(text) / CHARS_PER_TOKEN
}

/// Snippet of `text` anchored on the first query token it contains.
///
/// The window starts `window` characters before the match and spans at most
/// `max_len` characters. Falls back to the head of the text.
pub fn best_snippet(text: &str, query: &str, max_len: usize, window: usize) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return truncate_chars(text, max_len).to_string();
    }

    let hay: Vec<char> = text.chars().map(lower_char).collect();
    let hit = QUERY_TOKEN
        .find_iter(&query)
        .take(MAX_QUERY_TOKENS)
        .find_map(|m| {
            let needle: Vec<char> = m.as_str().chars().map(lower_char).collect();
            find_chars(&hay, &needle)
        });
    let Some(hit) = hit else {
        return truncate_chars(text, max_len).to_string();
    };

    let start = hit.saturating_sub(window);
    let end = hay.len().min(start + max_len);
    let mut snippet = String::new();
    if start > 0 {
        snippet.push(ELLIPSIS);
    }
    snippet.push_str(slice_chars(text, start, end).trim());
    if end < hay.len() {
        snippet.push(ELLIPSIS);
    }
    snippet
}

/// Single-char lowercase so positions line up with the original text.
fn lower_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

fn find_chars(hay: &[char], needle: &[char]) -> Option<usize> {
    if needle.is_empty() || needle.len() > hay.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

fn is_chat_log(content: &str) -> bool {
    content.starts_with("User: ") || content.starts_with("Assistant: ")
}

fn format_fact(fact: &Fact) -> Option<String> {
    let subject = fact.source_name.trim();
    let object = fact.target_name.trim();
    let relation = fact.relation.trim();
    if !subject.is_empty() && !object.is_empty() && !relation.is_empty() {
        return Some(format!("- {subject} — {relation} → {object}"));
    }
    let text = fact.fact.trim();
    if !text.is_empty() {
        let short = truncate_chars(text, FACT_CHARS);
        if relation.is_empty() {
            return Some(format!("- {short}"));
        }
        return Some(format!("- [{relation}] {short}"));
    }
    (!relation.is_empty()).then(|| format!("- {relation}"))
}

fn ranked<T>(items: &[Scored<T>]) -> Vec<&Scored<T>> {
    let mut sorted: Vec<&Scored<T>> = items.iter().collect();
    sorted.sort_by(|a, b| b.score.total_cmp(&a.score));
    sorted
}

/// Builds prompt context from fused search results.
#[derive(Clone, Debug, Default)]
pub struct ContextAssembler {
    settings: ContextSettings,
}

impl ContextAssembler {
    /// Assembler with the given budgets.
    pub fn new(settings: ContextSettings) -> Self {
        Self { settings }
    }

    /// Assemble with the configured token budget.
    pub fn assemble(&self, result: &FusionResult, query: &str) -> ContextResult {
        self.assemble_within(result, query, self.settings.max_tokens)
    }

    /// Assemble within `max_tokens`.
    pub fn assemble_within(&self, result: &FusionResult, query: &str, max_tokens: usize) -> ContextResult {
        let s = &self.settings;
        let mut parts: Vec<String> = Vec::new();
        let mut sections = ContextSections::default();

        if !result.episodes.is_empty() {
            parts.push("## From memory:".to_string());
            for scored in ranked(&result.episodes).into_iter().take(s.episode_scan_depth) {
                let episode = &scored.item;
                let line = match episode.kind {
                    Some(EpisodeKind::ChatSummary) => {
                        format!("Previous discussion: {}", episode.content.trim())
                    }
                    Some(EpisodeKind::ChatTurn) if episode.is_correction => format!(
                        "- UPDATE IN CONVERSATION: {}",
                        truncate_chars(episode.content.trim(), CORRECTION_TURN_CHARS)
                    ),
                    Some(EpisodeKind::ChatTurn) => continue,
                    _ if is_chat_log(&episode.content) => continue,
                    _ => {
                        let snippet =
                            best_snippet(&episode.content, query, s.snippet_max_len, s.snippet_window);
                        if episode.is_correction {
                            format!("- UPDATE: {snippet}")
                        } else {
                            format!("- {snippet}")
                        }
                    }
                };
                parts.push(line);
                sections.episodes += 1;
                if sections.episodes >= s.max_episodes {
                    break;
                }
            }
            if sections.episodes == 0 {
                let _ = parts.pop();
            }
        }

        if sections.episodes == 0 && !result.entities.is_empty() {
            parts.push("\n## Key entities:".to_string());
            for scored in ranked(&result.entities) {
                if sections.entities >= s.max_entities {
                    break;
                }
                let name = scored.item.name.trim();
                if name.is_empty() {
                    continue;
                }
                let summary = scored.item.summary.trim();
                parts.push(if summary.is_empty() {
                    format!("- {name}")
                } else {
                    format!("- {name}: {}", truncate_chars(summary, ENTITY_SUMMARY_CHARS))
                });
                sections.entities += 1;
            }
        }

        if !result.relationships.is_empty() {
            parts.push("\n## Relationships:".to_string());
            for scored in ranked(&result.relationships).into_iter().take(s.max_relationships) {
                if let Some(line) = format_fact(&scored.item) {
                    parts.push(line);
                    sections.relationships += 1;
                }
            }
        }

        if !result.communities.is_empty() {
            parts.push("\n## Communities:".to_string());
            for scored in ranked(&result.communities).into_iter().take(s.max_communities) {
                let name = scored.item.name.trim();
                let summary = truncate_chars(scored.item.summary.trim(), COMMUNITY_SUMMARY_CHARS);
                if !summary.is_empty() {
                    parts.push(format!("- {name}: {summary}"));
                } else if !name.is_empty() {
                    parts.push(format!("- {name}"));
                } else {
                    continue;
                }
                sections.communities += 1;
            }
        }

        let mut text = parts.join("\n");
        let mut token_estimate = estimate_tokens(&text);
        let truncated = token_estimate > max_tokens;
        if truncated {
            let keep = truncate_chars(&text, max_tokens.saturating_mul(CHARS_PER_TOKEN)).len();
            text.truncate(keep);
            text.push_str(TRUNCATION_MARKER);
            token_estimate = max_tokens;
        }

        debug!(
            query = %truncate_chars(query, 50),
            tokens = token_estimate,
            ?sections,
            truncated,
            "context assembled"
        );
        ContextResult {
            text,
            token_estimate,
            sections,
            truncated,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use serde_json::json;
    use strata_core::{Community, Entity, Episode, Layer};

    fn scored<T>(item: T, score: f64) -> Scored<T> {
        Scored {
            item,
            score,
            expanded: false,
            hop: 0,
        }
    }

    fn episode(kind: EpisodeKind, content: &str, correction: bool) -> Episode {
        Episode {
            id: strata_core::EpisodeId::new(),
            name: "n".into(),
            content: content.into(),
            layer: Some(Layer::Personal),
            fingerprint: None,
            kind: Some(kind),
            source_description: String::new(),
            author: None,
            conversation_id: None,
            turn_index: None,
            is_correction: correction,
            summarized: false,
            metadata: json!({}),
            created_at: Utc::now(),
            valid_at: Utc::now(),
        }
    }

    fn entity(name: &str, summary: &str) -> Entity {
        Entity {
            id: strata_core::EntityId::new(),
            name: name.into(),
            name_norm: None,
            layer: Layer::Knowledge,
            summary: summary.into(),
            tags: vec![],
            merged_into: None,
            created_at: Utc::now(),
        }
    }

    fn fact(source: &str, relation: &str, target: &str, text: &str) -> Fact {
        Fact {
            id: strata_core::FactId::new(),
            layer: Layer::Knowledge,
            source: "a".into(),
            target: "b".into(),
            source_name: source.into(),
            target_name: target.into(),
            relation: relation.into(),
            fact: text.into(),
            valid_at: None,
            invalid_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn snippet_centers_on_query_token() {
        let text = format!("{}Lena works in Riga.{}", "x".repeat(300), "y".repeat(600));
        let s = best_snippet(&text, "where does lena work", 520, 240);
        assert!(s.starts_with('…'));
        assert!(s.ends_with('…'));
        assert!(s.contains("Lena works"));
        assert_eq!(char_len(&s), 522);
    }

    #[test]
    fn snippet_falls_back_to_head() {
        assert_eq!(best_snippet("  short text  ", "zzz", 520, 240), "short text");
        assert_eq!(best_snippet("abcdef", "", 3, 1), "abc");
        assert_eq!(best_snippet("", "q", 3, 1), "");
    }

    #[test]
    fn snippet_handles_cyrillic() {
        let text = format!("{}Марк руководит студией", "а".repeat(10));
        let s = best_snippet(&text, "кто такой марк", 12, 2);
        assert!(s.starts_with('…'));
        assert!(s.contains("Марк"));
    }

    #[test]
    fn episodes_follow_the_inclusion_policy() {
        let result = FusionResult {
            episodes: vec![
                scored(episode(EpisodeKind::ChatTurn, "User: hi\nAssistant: hello", false), 5.0),
                scored(episode(EpisodeKind::ChatSummary, "They talked about Lena", false), 4.0),
                scored(episode(EpisodeKind::ChatTurn, "User: actually Lena moved", true), 3.0),
                scored(episode(EpisodeKind::Document, "User: pasted log", false), 2.5),
                scored(episode(EpisodeKind::Document, "Lena is a designer", false), 2.0),
                scored(episode(EpisodeKind::Document, "Never reached", false), 1.0),
            ],
            ..FusionResult::default()
        };
        let ctx = ContextAssembler::default().assemble(&result, "Lena");
        assert_eq!(ctx.sections.episodes, 3);
        assert_eq!(
            ctx.text,
            "## From memory:\n\
             Previous discussion: They talked about Lena\n\
             - UPDATE IN CONVERSATION: User: actually Lena moved\n\
             - Lena is a designer"
        );
        assert!(!ctx.truncated);
    }

    #[test]
    fn entities_fill_in_when_no_episode_qualifies() {
        let result = FusionResult {
            episodes: vec![scored(episode(EpisodeKind::ChatTurn, "User: hi", false), 1.0)],
            entities: vec![
                scored(entity("Mark", ""), 0.2),
                scored(entity("Lena", "Designer in Riga"), 0.9),
                scored(entity("  ", "nameless"), 0.5),
            ],
            ..FusionResult::default()
        };
        let ctx = ContextAssembler::default().assemble(&result, "who");
        assert_eq!(ctx.sections.episodes, 0);
        assert_eq!(ctx.sections.entities, 2);
        assert_eq!(ctx.text, "\n## Key entities:\n- Lena: Designer in Riga\n- Mark");
    }

    #[test]
    fn relationships_and_communities() {
        let result = FusionResult {
            relationships: vec![
                scored(fact("Sergey", "develops", "Mark", ""), 0.9),
                scored(fact("", "", "", "Lena has worked for 3 years"), 0.8),
                scored(fact("", "", "", ""), 0.7),
                scored(fact("Lena", "moved_to", "", "Lena moved to Tallinn"), 0.6),
            ],
            communities: vec![scored(
                Community {
                    id: strata_core::CommunityId::new(),
                    layer: Layer::Project,
                    name: "Studio".into(),
                    summary: "Design studio in Riga".into(),
                },
                0.5,
            )],
            ..FusionResult::default()
        };
        let ctx = ContextAssembler::default().assemble(&result, "q");
        assert_eq!(ctx.sections.relationships, 3);
        assert_eq!(ctx.sections.communities, 1);
        assert!(ctx.text.contains("- Sergey — develops → Mark"));
        assert!(ctx.text.contains("- Lena has worked for 3 years"));
        assert!(ctx.text.contains("- [moved_to] Lena moved to Tallinn"));
        assert!(ctx.text.ends_with("- Studio: Design studio in Riga"));
    }

    #[test]
    fn empty_result_is_empty_context() {
        let ctx = ContextAssembler::default().assemble(&FusionResult::default(), "q");
        assert_eq!(ctx, ContextResult::default());
    }

    proptest! {
        #[test]
        fn budget_is_respected(body in "[a-z ]{0,400}", extra in 0usize..40, max_tokens in 1usize..60) {
            let result = FusionResult {
                episodes: (0..=extra % 4)
                    .map(|i| scored(episode(EpisodeKind::Document, &format!("{body} {i}"), false), 1.0))
                    .collect(),
                ..FusionResult::default()
            };
            let ctx = ContextAssembler::default().assemble_within(&result, "q", max_tokens);
            if ctx.truncated {
                prop_assert!(ctx.text.ends_with(TRUNCATION_MARKER));
                prop_assert_eq!(
                    char_len(&ctx.text),
                    max_tokens * CHARS_PER_TOKEN + char_len(TRUNCATION_MARKER)
                );
                prop_assert_eq!(ctx.token_estimate, max_tokens);
            } else {
                prop_assert!(!ctx.text.contains(TRUNCATION_MARKER));
                prop_assert!(ctx.token_estimate <= max_tokens);
            }
        }
    }
}
