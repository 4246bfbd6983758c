//! Memory storage helpers
//!
//! Every durable memory mutation writes both stores: the Markdown file tree
//! (audit trail, tombstones) and the vector collection (retrieval). The
//! vector store is the retrieval source of truth; the snapshot anchors
//! reconciliation after a crash.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::files::MemoryFileStore;
use crate::memory::entities::{
    Fact, MemoryMetadata, MemoryRole, StoredMemory, SummaryKind, Turn,
};
use crate::memory::entities::extract_tags;
use crate::store::{Collection, WhereClause};

/// Fact salience default: freshly extracted facts matter most.
const FACT_SALIENCE: f32 = 1.0;
const FACT_MAX_TAGS: usize = 5;

/// Dual-store handle for one memory collection
#[derive(Clone)]
pub struct MemoryStore {
    collection: Collection,
    files: Arc<MemoryFileStore>,
}

fn stored_memory(doc: crate::store::StoredDoc, distance: Option<f32>) -> Option<StoredMemory> {
    let metadata: MemoryMetadata =
        serde_json::from_value(serde_json::Value::Object(doc.metadata)).ok()?;
    Some(StoredMemory {
        id: doc.id,
        content: doc.content,
        metadata,
        distance,
    })
}

impl MemoryStore {
    pub fn new(collection: Collection, files: Arc<MemoryFileStore>) -> Self {
        Self { collection, files }
    }

    pub fn files(&self) -> &MemoryFileStore {
        &self.files
    }

    /// Persist a conversation turn to both stores.
    pub async fn persist_turn(&self, turn: &Turn) -> Result<()> {
        let metadata = MemoryMetadata::new(
            &turn.conversation_id,
            turn.role,
            turn.created_at.to_rfc3339(),
        );
        self.files.write_entry(&turn.id, &turn.content, &metadata)?;
        self.collection
            .upsert(
                &[turn.id.clone()],
                &[turn.content.clone()],
                &[metadata.to_json()],
            )
            .await
    }

    /// Persist extracted facts to both stores.
    pub async fn persist_facts(&self, facts: &[Fact]) -> Result<()> {
        if facts.is_empty() {
            return Ok(());
        }
        let mut ids = Vec::with_capacity(facts.len());
        let mut contents = Vec::with_capacity(facts.len());
        let mut metadatas = Vec::with_capacity(facts.len());
        for fact in facts {
            let mut metadata = MemoryMetadata::new(
                &fact.conversation_id,
                MemoryRole::Memory,
                fact.created_at.to_rfc3339(),
            );
            metadata.salience = Some(FACT_SALIENCE);
            metadata.tags = Some(extract_tags(&fact.content, FACT_MAX_TAGS));
            metadata.source_id = Some(fact.source_id.clone());
            self.files.write_entry(&fact.id, &fact.content, &metadata)?;
            ids.push(fact.id.clone());
            contents.push(fact.content.clone());
            metadatas.push(metadata.to_json());
        }
        self.collection.upsert(&ids, &contents, &metadatas).await
    }

    /// Replace a conversation's rolling summary (stable id). The previous
    /// file version is tombstoned with `replaced_by` pointing at itself,
    /// keeping the audit trail linear.
    pub async fn persist_summary(
        &self,
        conversation_id: &str,
        kind: SummaryKind,
        content: &str,
    ) -> Result<()> {
        let doc_id = kind.doc_id(conversation_id);
        let mut replacements = HashMap::new();
        replacements.insert(doc_id.clone(), doc_id.clone());
        self.files
            .soft_delete(conversation_id, &[doc_id.clone()], &replacements)?;

        let mut metadata = MemoryMetadata::new(
            conversation_id,
            MemoryRole::Summary,
            chrono::Utc::now().to_rfc3339(),
        );
        metadata.summary_kind = Some(kind);
        self.files.write_entry(&doc_id, content, &metadata)?;
        self.collection
            .upsert(
                &[doc_id],
                &[content.to_string()],
                &[metadata.to_json()],
            )
            .await
    }

    /// Query relevant non-summary entries for a conversation.
    pub async fn query_memories(
        &self,
        conversation_id: &str,
        text: &str,
        n: usize,
    ) -> Result<Vec<StoredMemory>> {
        let filter = WhereClause::and(vec![
            WhereClause::eq("conversation_id", conversation_id),
            WhereClause::ne("role", MemoryRole::Summary.as_str()),
        ]);
        let docs = self.collection.query(text, n, Some(&filter)).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| {
                let distance = doc.distance;
                stored_memory(
                    crate::store::StoredDoc {
                        id: doc.id,
                        content: doc.content,
                        metadata: doc.metadata,
                    },
                    Some(distance),
                )
            })
            .collect())
    }

    /// List all entries for a conversation, optionally excluding summaries.
    pub fn list_entries(
        &self,
        conversation_id: &str,
        include_summary: bool,
    ) -> Result<Vec<StoredMemory>> {
        let mut clauses = vec![WhereClause::eq("conversation_id", conversation_id)];
        if !include_summary {
            clauses.push(WhereClause::ne("role", MemoryRole::Summary.as_str()));
        }
        let filter = WhereClause::and(clauses);
        Ok(self
            .collection
            .get(Some(&filter))?
            .into_iter()
            .filter_map(|doc| stored_memory(doc, None))
            .collect())
    }

    /// Fetch one rolling summary, if present.
    pub fn get_summary(
        &self,
        conversation_id: &str,
        kind: SummaryKind,
    ) -> Result<Option<StoredMemory>> {
        let filter = WhereClause::and(vec![
            WhereClause::eq("conversation_id", conversation_id),
            WhereClause::eq("role", MemoryRole::Summary.as_str()),
            WhereClause::eq("summary_kind", kind.as_str()),
        ]);
        Ok(self
            .collection
            .get(Some(&filter))?
            .into_iter()
            .next()
            .and_then(|doc| stored_memory(doc, None)))
    }

    /// Delete entries from both stores, tombstoning the files. The
    /// replacement map annotates tombstones with their successor ids.
    pub fn delete_entries(
        &self,
        conversation_id: &str,
        ids: &[String],
        replacement_map: &HashMap<String, String>,
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.collection.delete_ids(ids)?;
        self.files
            .soft_delete(conversation_id, ids, replacement_map)?;
        Ok(())
    }

    /// Evict the oldest non-summary entries past `max_entries`. Returns the
    /// number evicted.
    pub fn evict_if_needed(&self, conversation_id: &str, max_entries: usize) -> Result<usize> {
        if max_entries == 0 {
            return Ok(0);
        }
        let mut entries = self.list_entries(conversation_id, false)?;
        if entries.len() <= max_entries {
            return Ok(0);
        }
        entries.sort_by(|a, b| a.metadata.created_at.cmp(&b.metadata.created_at));
        let overflow: Vec<String> = entries
            .iter()
            .take(entries.len() - max_entries)
            .map(|e| e.id.clone())
            .collect();
        let count = overflow.len();
        self.delete_entries(conversation_id, &overflow, &HashMap::new())?;
        tracing::info!(
            "Evicted {count} entries from conversation {conversation_id}"
        );
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::store::VectorStore;
    use chrono::{Duration, Utc};
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempdir().unwrap();
        let vector = VectorStore::open_in_memory(Arc::new(HashEmbedder::new(128))).unwrap();
        let files = Arc::new(MemoryFileStore::new(dir.path()).unwrap());
        let store = MemoryStore::new(vector.collection("memory"), files);
        (dir, store)
    }

    #[tokio::test]
    async fn test_persist_and_query_fact() {
        let (_dir, store) = store();
        let fact = Fact::new("conv", "The user's wife is Jane.", "turn-1", Utc::now());
        store.persist_facts(&[fact.clone()]).await.unwrap();

        let hits = store.query_memories("conv", "who is my wife", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, fact.id);
        assert_eq!(hits[0].metadata.role, MemoryRole::Memory);
        assert_eq!(hits[0].metadata.salience, Some(1.0));
        assert_eq!(hits[0].metadata.source_id.as_deref(), Some("turn-1"));

        // File mirror exists.
        assert!(store.files().get(&fact.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_query_excludes_summaries() {
        let (_dir, store) = store();
        store
            .persist_summary("conv", SummaryKind::Short, "summary text")
            .await
            .unwrap();
        let hits = store.query_memories("conv", "summary text", 5).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_summary_replacement_is_stable() {
        let (_dir, store) = store();
        store
            .persist_summary("conv", SummaryKind::Short, "first")
            .await
            .unwrap();
        store
            .persist_summary("conv", SummaryKind::Short, "second")
            .await
            .unwrap();

        let summary = store.get_summary("conv", SummaryKind::Short).unwrap().unwrap();
        assert_eq!(summary.content, "second");
        assert_eq!(summary.id, "conv::summary-short");
        // Exactly one live summary entry of that kind.
        let all = store.list_entries("conv", true).unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_short_and_long_summaries_coexist() {
        let (_dir, store) = store();
        store
            .persist_summary("conv", SummaryKind::Short, "short")
            .await
            .unwrap();
        store
            .persist_summary("conv", SummaryKind::Long, "long")
            .await
            .unwrap();
        assert_eq!(
            store.get_summary("conv", SummaryKind::Short).unwrap().unwrap().content,
            "short"
        );
        assert_eq!(
            store.get_summary("conv", SummaryKind::Long).unwrap().unwrap().content,
            "long"
        );
    }

    #[tokio::test]
    async fn test_delete_tombstones_files() {
        let (_dir, store) = store();
        let fact = Fact::new("conv", "The user's wife is Jane.", "t", Utc::now());
        store.persist_facts(&[fact.clone()]).await.unwrap();

        let mut replacements = HashMap::new();
        replacements.insert(fact.id.clone(), "new-id".to_string());
        store
            .delete_entries("conv", &[fact.id.clone()], &replacements)
            .unwrap();

        assert!(store.query_memories("conv", "wife", 5).await.unwrap().is_empty());
        assert!(store.files().get(&fact.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_removes_oldest_first() {
        let (_dir, store) = store();
        let base = Utc::now();
        let old = Fact::new("conv", "oldest fact", "t", base - Duration::days(2));
        let mid = Fact::new("conv", "middle fact", "t", base - Duration::days(1));
        let new = Fact::new("conv", "newest fact", "t", base);
        store
            .persist_facts(&[old.clone(), mid.clone(), new.clone()])
            .await
            .unwrap();

        let evicted = store.evict_if_needed("conv", 2).unwrap();
        assert_eq!(evicted, 1);
        let remaining = store.list_entries("conv", false).unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|e| e.id != old.id));
    }

    #[tokio::test]
    async fn test_eviction_noop_under_budget() {
        let (_dir, store) = store();
        let fact = Fact::new("conv", "a fact", "t", Utc::now());
        store.persist_facts(&[fact]).await.unwrap();
        assert_eq!(store.evict_if_needed("conv", 10).unwrap(), 0);
    }
}
