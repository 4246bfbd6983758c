//! Domain entities for the memory system
//!
//! Memory entries are a tagged sum over role; the file-persistence layer
//! dispatches on the tag to choose a subdirectory. Entities are strict
//! (no optional fields where a value is required); the storage metadata
//! model carries the optional attributes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role tag of a stored memory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRole {
    User,
    Assistant,
    Memory,
    Summary,
}

impl MemoryRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryRole::User => "user",
            MemoryRole::Assistant => "assistant",
            MemoryRole::Memory => "memory",
            MemoryRole::Summary => "summary",
        }
    }
}

/// Which rolling summary an entry is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Short,
    Long,
}

impl SummaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::Short => "short",
            SummaryKind::Long => "long",
        }
    }

    /// Stable document id for a conversation's rolling summary.
    pub fn doc_id(&self, conversation_id: &str) -> String {
        format!("{}::summary-{}", conversation_id, self.as_str())
    }

    /// Token budget for the summary update prompt.
    pub fn max_tokens(&self) -> u32 {
        match self {
            SummaryKind::Short => 256,
            SummaryKind::Long => 512,
        }
    }
}

/// Metadata for a stored memory document (file frontmatter and vector store)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryMetadata {
    pub conversation_id: String,
    pub role: MemoryRole,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salience: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fact_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_kind: Option<SummaryKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaced_by: Option<String>,
}

impl MemoryMetadata {
    pub fn new(conversation_id: impl Into<String>, role: MemoryRole, created_at: String) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            role,
            created_at,
            salience: None,
            tags: None,
            fact_key: None,
            source_id: None,
            summary_kind: None,
            replaced_by: None,
        }
    }

    /// Subdirectory under the conversation folder for this entry.
    pub fn subdir(&self) -> String {
        match self.role {
            MemoryRole::User | MemoryRole::Assistant => "turns".to_string(),
            MemoryRole::Memory => "facts".to_string(),
            MemoryRole::Summary => {
                let kind = self.summary_kind.unwrap_or(SummaryKind::Short);
                format!("summaries/{}", kind.as_str())
            }
        }
    }

    /// JSON map for the vector store.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Memory document as returned from the vector store
#[derive(Debug, Clone)]
pub struct StoredMemory {
    pub id: String,
    pub content: String,
    pub metadata: MemoryMetadata,
    pub distance: Option<f32>,
}

/// A single user or assistant message persisted for a conversation
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: String,
    pub conversation_id: String,
    pub role: MemoryRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(conversation_id: &str, role: MemoryRole, content: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// An atomic piece of information extracted from a user message
#[derive(Debug, Clone, PartialEq)]
pub struct Fact {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    /// Id of the turn this fact was extracted from
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(
        conversation_id: &str,
        content: &str,
        source_id: &str,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            source_id: source_id.to_string(),
            created_at,
        }
    }
}

/// Heuristic tag extraction: alphabetic tokens of length >= 4, first
/// `max_tags` unique occurrences, lowercased.
pub fn extract_tags(text: &str, max_tags: usize) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for raw in text.split_whitespace() {
        let cleaned: String = raw.chars().filter(|c| c.is_alphabetic()).collect();
        let cleaned = cleaned.to_lowercase();
        if cleaned.len() >= 4 && !tags.contains(&cleaned) {
            tags.push(cleaned);
        }
        if tags.len() >= max_tags {
            break;
        }
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&MemoryRole::Memory).unwrap(),
            "\"memory\""
        );
        let role: MemoryRole = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, MemoryRole::Assistant);
    }

    #[test]
    fn test_subdir_dispatch() {
        let mut meta = MemoryMetadata::new("c", MemoryRole::User, "t".into());
        assert_eq!(meta.subdir(), "turns");
        meta.role = MemoryRole::Memory;
        assert_eq!(meta.subdir(), "facts");
        meta.role = MemoryRole::Summary;
        meta.summary_kind = Some(SummaryKind::Long);
        assert_eq!(meta.subdir(), "summaries/long");
    }

    #[test]
    fn test_summary_doc_id_stable() {
        assert_eq!(
            SummaryKind::Short.doc_id("conv-1"),
            "conv-1::summary-short"
        );
        assert_eq!(SummaryKind::Long.doc_id("conv-1"), "conv-1::summary-long");
    }

    #[test]
    fn test_extract_tags() {
        let tags = extract_tags("My wife Anne loves biking on sunny weekends", 5);
        assert!(tags.contains(&"wife".to_string()));
        assert!(tags.contains(&"anne".to_string()));
        assert!(!tags.contains(&"my".to_string()));
        assert!(tags.len() <= 5);
    }

    #[test]
    fn test_extract_tags_dedups() {
        let tags = extract_tags("wife wife wife", 5);
        assert_eq!(tags, vec!["wife".to_string()]);
    }
}
