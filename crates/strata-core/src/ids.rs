//! Typed identifiers for graph records.
//!
//! Each record kind gets its own newtype around `String` so an entity id
//! cannot be handed to an episode lookup by mistake. Identifiers are
//! totally ordered; the cross-layer linker relies on that ordering to pick
//! which side of a pair initiates a bridge.
//!
//! Fresh ids are UUID v7 (time-ordered) via [`uuid::Uuid::now_v7`].

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

fn new_v7() -> String {
    Uuid::now_v7().to_string()
}

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new time-ordered id.
            #[must_use]
            pub fn new() -> Self {
                Self(new_v7())
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

record_id! {
    /// Identifier of a stored episode.
    EpisodeId
}

record_id! {
    /// Identifier of an entity node.
    EntityId
}

record_id! {
    /// Identifier of a relationship/fact edge.
    FactId
}

record_id! {
    /// Identifier of a community node.
    CommunityId
}

record_id! {
    /// Identifier of a user (episode author).
    UserId
}

record_id! {
    /// Identifier of a conversation.
    ConversationId
}

record_id! {
    /// Identifier of an ingestion job.
    JobId
}

record_id! {
    /// Owner token of an ingest claim.
    ClaimId
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn episode_id_new_is_uuid_v7() {
        let id = EpisodeId::new();
        let parsed = Uuid::parse_str(id.as_str()).unwrap();
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(EntityId::new(), EntityId::new());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = EntityId::from("a-1");
        let b = EntityId::from("b-1");
        assert!(a < b);
        assert_eq!(a.clone().min(b.clone()), a);
    }

    #[test]
    fn later_v7_ids_sort_after_earlier() {
        let first = EntityId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EntityId::new();
        assert!(first < second);
    }

    #[test]
    fn display_and_deref() {
        let id = UserId::from("user-7");
        assert_eq!(format!("{id}"), "user-7");
        let s: &str = &id;
        assert_eq!(s, "user-7");
    }

    #[test]
    fn serde_is_transparent() {
        let id = ConversationId::from("conv-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"conv-1\"");
        let back: ConversationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
