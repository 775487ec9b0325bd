//! Memory layers and episode kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::CoreError;

/// A logical partition of memory.
///
/// Layers scope search and are the dimension across which same-named
/// entities get bridged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    /// Facts about the user.
    Personal,
    /// Project-specific notes and decisions.
    Project,
    /// General knowledge and documents.
    Knowledge,
    /// Lessons learned and past outcomes.
    Experience,
}

impl Layer {
    /// Every layer, in declaration order.
    pub const ALL: [Layer; 4] = [
        Layer::Personal,
        Layer::Project,
        Layer::Knowledge,
        Layer::Experience,
    ];

    /// Storage and wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Project => "project",
            Self::Knowledge => "knowledge",
            Self::Experience => "experience",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "personal" => Ok(Self::Personal),
            "project" => Ok(Self::Project),
            "knowledge" => Ok(Self::Knowledge),
            "experience" => Ok(Self::Experience),
            other => Err(CoreError::UnknownLayer(other.to_string())),
        }
    }
}

/// What an episode represents.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeKind {
    /// A single user/assistant exchange.
    ChatTurn,
    /// A periodic summary over several turns.
    ChatSummary,
    /// An ingested document or document chunk.
    Document,
    /// A recorded experience or outcome.
    Experience,
}

impl EpisodeKind {
    /// Storage and wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChatTurn => "chat_turn",
            Self::ChatSummary => "chat_summary",
            Self::Document => "document",
            Self::Experience => "experience",
        }
    }
}

impl fmt::Display for EpisodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EpisodeKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat_turn" => Ok(Self::ChatTurn),
            "chat_summary" => Ok(Self::ChatSummary),
            "document" => Ok(Self::Document),
            "experience" => Ok(Self::Experience),
            other => Err(CoreError::UnknownKind(other.to_string())),
        }
    }
}
