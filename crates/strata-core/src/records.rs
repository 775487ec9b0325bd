//! Graph records as read back from the store.
//!
//! The store is the single source of truth for these; the engine only holds
//! them transiently while serving a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CommunityId, ConversationId, EntityId, EpisodeId, FactId, UserId};
use crate::layer::{EpisodeKind, Layer};

/// A stored unit of raw text plus metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    /// Episode id.
    pub id: EpisodeId,
    /// Short name given at write time.
    pub name: String,
    /// Full text.
    pub content: String,
    /// Layer tag. `None` until stamped when the writer did not set one.
    pub layer: Option<Layer>,
    /// Stable hash of the normalized content.
    pub fingerprint: Option<String>,
    /// Kind tag.
    pub kind: Option<EpisodeKind>,
    /// Free-form description of where the text came from.
    pub source_description: String,
    /// Author, once attached.
    pub author: Option<UserId>,
    /// Conversation this episode belongs to (turns and summaries).
    pub conversation_id: Option<ConversationId>,
    /// Allocated turn number (turns only).
    pub turn_index: Option<i64>,
    /// Whether the text carries a correction marker.
    pub is_correction: bool,
    /// Whether a summary already covers this turn.
    pub summarized: bool,
    /// Remaining metadata as a JSON object.
    pub metadata: serde_json::Value,
    /// When the episode was written.
    pub created_at: DateTime<Utc>,
    /// Reference time the content refers to.
    pub valid_at: DateTime<Utc>,
}

/// A named concept node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    /// Entity id.
    pub id: EntityId,
    /// Display name.
    pub name: String,
    /// Canonical key for cross-layer matching, `None` when excluded from linking.
    pub name_norm: Option<String>,
    /// Owning layer.
    pub layer: Layer,
    /// Free-text summary.
    pub summary: String,
    /// Tags collected from merges and extraction.
    pub tags: Vec<String>,
    /// Surviving entity when this one was merged away.
    pub merged_into: Option<EntityId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// An undirected identity link between two same-named entities.
///
/// Stored with the lexicographically smaller id first so each unordered
/// pair has exactly one representation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bridge {
    /// Smaller id of the pair.
    pub low: EntityId,
    /// Larger id of the pair.
    pub high: EntityId,
}

impl Bridge {
    /// Build the canonical representation of the pair `{a, b}`.
    ///
    /// Returns `None` for a self-pair.
    #[must_use]
    pub fn between(a: EntityId, b: EntityId) -> Option<Self> {
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Some(Self { low: a, high: b }),
            std::cmp::Ordering::Greater => Some(Self { low: b, high: a }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// The other end of the bridge, if `id` is one of its ends.
    #[must_use]
    pub fn other(&self, id: &EntityId) -> Option<&EntityId> {
        if &self.low == id {
            Some(&self.high)
        } else if &self.high == id {
            Some(&self.low)
        } else {
            None
        }
    }
}

/// A directed relationship between two entities.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    /// Fact id.
    pub id: FactId,
    /// Owning layer.
    pub layer: Layer,
    /// Subject entity.
    pub source: EntityId,
    /// Object entity.
    pub target: EntityId,
    /// Subject display name.
    pub source_name: String,
    /// Object display name.
    pub target_name: String,
    /// Relationship label, e.g. `works_as`.
    pub relation: String,
    /// Free-text statement of the fact.
    pub fact: String,
    /// Start of validity.
    pub valid_at: Option<DateTime<Utc>>,
    /// End of validity; `None` while the fact is current.
    pub invalid_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Fact {
    /// Whether the fact is current (never invalidated).
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.invalid_at.is_none()
    }

    /// Whether the fact held at `at`.
    #[must_use]
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_at.is_none_or(|from| from <= at) && self.invalid_at.is_none_or(|to| to > at)
    }
}

/// A cluster of related entities with a summary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Community {
    /// Community id.
    pub id: CommunityId,
    /// Owning layer.
    pub layer: Layer,
    /// Display name.
    pub name: String,
    /// Free-text summary.
    pub summary: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fact(valid: Option<DateTime<Utc>>, invalid: Option<DateTime<Utc>>) -> Fact {
        Fact {
            id: FactId::from("f1"),
            layer: Layer::Knowledge,
            source: EntityId::from("a"),
            target: EntityId::from("b"),
            source_name: "Lena".into(),
            target_name: "designer".into(),
            relation: "works_as".into(),
            fact: "Lena is a designer".into(),
            valid_at: valid,
            invalid_at: invalid,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn bridge_orders_its_ends() {
        let b = Bridge::between(EntityId::from("z"), EntityId::from("a")).unwrap();
        assert_eq!(b.low.as_str(), "a");
        assert_eq!(b.high.as_str(), "z");
        assert_eq!(
            Bridge::between(EntityId::from("a"), EntityId::from("z")),
            Some(b)
        );
    }

    #[test]
    fn bridge_rejects_self_pair() {
        assert!(Bridge::between(EntityId::from("a"), EntityId::from("a")).is_none());
    }

    #[test]
    fn bridge_other_end() {
        let b = Bridge::between(EntityId::from("a"), EntityId::from("b")).unwrap();
        assert_eq!(b.other(&EntityId::from("a")).unwrap().as_str(), "b");
        assert_eq!(b.other(&EntityId::from("b")).unwrap().as_str(), "a");
        assert!(b.other(&EntityId::from("c")).is_none());
    }

    #[test]
    fn fact_validity_window() {
        let jan = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let jun = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let dec = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();

        let f = fact(Some(jan), Some(dec));
        assert!(!f.is_current());
        assert!(f.is_valid_at(jun));
        assert!(!f.is_valid_at(dec));

        let open = fact(Some(jun), None);
        assert!(open.is_current());
        assert!(!open.is_valid_at(jan));
        assert!(open.is_valid_at(dec));
    }
}
