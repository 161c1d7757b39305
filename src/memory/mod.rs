mod store;

pub use store::SqliteMemoryStore;

use crate::ledger::ConversationTurn;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Fixed category set for saved conversation memories.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemoryCategory {
    UserInfo,
    Project,
    TechNote,
    SmallTalk,
    Consultation,
    Idea,
    #[default]
    Other,
}

/// Fixed importance levels.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize, Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Medium,
    High,
}

/// A durable, named snapshot of a past conversation plus metadata.
///
/// The conversation snapshot is immutable after creation; edits touch
/// title/content/category/tags/importance only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub title: String,
    pub content: String,
    pub character_id: String,
    pub character_name: String,
    pub conversation: Vec<ConversationTurn>,
    pub category: MemoryCategory,
    pub tags: Vec<String>,
    pub importance: Importance,
    pub created_at: String,
    pub updated_at: String,
    pub last_accessed: Option<String>,
    pub access_count: u64,
}

/// Fields supplied when creating a memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewMemory {
    pub title: String,
    pub content: String,
    #[serde(default = "default_character")]
    pub character_id: String,
    #[serde(default = "default_character")]
    pub character_name: String,
    #[serde(default)]
    pub conversation: Vec<ConversationTurn>,
    #[serde(default)]
    pub category: MemoryCategory,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub importance: Importance,
}

fn default_character() -> String {
    "assistant".into()
}

/// Partial update; `None` leaves a field as it was. The conversation
/// snapshot is deliberately absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryPatch {
    pub title: Option<String>,
    pub content: Option<String>,
    pub category: Option<MemoryCategory>,
    pub tags: Option<Vec<String>>,
    pub importance: Option<Importance>,
}

/// Search filters; all provided filters are ANDed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MemoryFilter {
    /// Case-insensitive match against title, content, tags and
    /// character name.
    pub keyword: Option<String>,
    pub character_id: Option<String>,
    pub category: Option<MemoryCategory>,
    pub importance: Option<Importance>,
}

/// Whitelisted sort keys for [`SqliteMemoryStore::list_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemorySort {
    #[default]
    CreatedAt,
    UpdatedAt,
    Title,
    AccessCount,
}

impl MemorySort {
    pub(crate) const fn column(self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::UpdatedAt => "updated_at",
            Self::Title => "title",
            Self::AccessCount => "access_count",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn category_round_trips_through_strings() {
        assert_eq!(MemoryCategory::TechNote.to_string(), "tech_note");
        assert_eq!(
            MemoryCategory::from_str("tech_note").unwrap(),
            MemoryCategory::TechNote
        );
        assert!(MemoryCategory::from_str("no_such_category").is_err());
    }

    #[test]
    fn importance_orders_low_to_high() {
        assert!(Importance::Low < Importance::Medium);
        assert!(Importance::Medium < Importance::High);
    }

    #[test]
    fn sort_keys_map_to_columns() {
        assert_eq!(MemorySort::CreatedAt.column(), "created_at");
        assert_eq!(MemorySort::AccessCount.column(), "access_count");
    }

    #[test]
    fn new_memory_deserializes_with_defaults() {
        let json = r#"{"title": "t", "content": "c"}"#;
        let memory: NewMemory = serde_json::from_str(json).unwrap();
        assert_eq!(memory.category, MemoryCategory::Other);
        assert_eq!(memory.importance, Importance::Medium);
        assert!(memory.conversation.is_empty());
    }
}
