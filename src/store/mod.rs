//! Vector store adapter
//!
//! A thin wrapper over an embedding-backed document store persisted in
//! SQLite. Documents carry content, a metadata JSON map, and an embedding
//! BLOB; queries embed the text and rank by ascending cosine distance.
//! The persistence directory is opaque to callers.

mod filter;

pub use filter::{CmpOp, WhereClause};

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};

use crate::embedding::{cosine_similarity, Embedder};
use crate::error::{RecallError, Result};

/// Max documents per embedding API call; bounds request size.
const EMBED_BATCH_SIZE: usize = 16;

/// A document returned from `get`
#[derive(Debug, Clone)]
pub struct StoredDoc {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// A document returned from `query`, with its cosine distance
#[derive(Debug, Clone)]
pub struct ScoredDoc {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub distance: f32,
}

/// Storage engine wrapping SQLite plus an embedding backend
pub struct VectorStore {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
}

impl VectorStore {
    /// Open or create the store under the given directory
    pub fn open(path: &Path, embedder: Arc<dyn Embedder>) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let db_path = path.join("vectors.db");
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags)?;
        Self::init(conn, embedder)
    }

    /// In-memory store for tests
    pub fn open_in_memory(embedder: Arc<dyn Embedder>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, embedder)
    }

    fn init(conn: Connection, embedder: Arc<dyn Embedder>) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=30000;
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata TEXT NOT NULL,
                embedding BLOB NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE INDEX IF NOT EXISTS idx_documents_collection
                ON documents(collection);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            embedder,
        })
    }

    /// Get a handle to a named collection
    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            conn: Arc::clone(&self.conn),
            embedder: Arc::clone(&self.embedder),
            name: name.to_string(),
        }
    }
}

/// Handle to a named collection within the store
#[derive(Clone)]
pub struct Collection {
    conn: Arc<Mutex<Connection>>,
    embedder: Arc<dyn Embedder>,
    name: String,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert or replace documents, embedding them in bounded batches.
    pub async fn upsert(
        &self,
        ids: &[String],
        documents: &[String],
        metadatas: &[serde_json::Value],
    ) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        if ids.len() != documents.len() || ids.len() != metadatas.len() {
            return Err(RecallError::InvalidInput(
                "upsert requires ids, documents and metadatas of equal length".to_string(),
            ));
        }

        for start in (0..ids.len()).step_by(EMBED_BATCH_SIZE) {
            let end = (start + EMBED_BATCH_SIZE).min(ids.len());
            let batch_docs = &documents[start..end];
            let embeddings = self
                .embedder
                .embed_batch(batch_docs)
                .await
                .map_err(|e| RecallError::Store(format!("embedding failed: {e}")))?;

            let conn = self.conn.lock();
            for (offset, embedding) in embeddings.iter().enumerate() {
                let i = start + offset;
                let metadata = serde_json::to_string(&metadatas[i])?;
                conn.execute(
                    "INSERT OR REPLACE INTO documents
                     (collection, id, content, metadata, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        self.name,
                        ids[i],
                        documents[i],
                        metadata,
                        encode_embedding(embedding)
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// Query for the `n` nearest documents, ordered by ascending distance.
    pub async fn query(
        &self,
        text: &str,
        n: usize,
        filter: Option<&WhereClause>,
    ) -> Result<Vec<ScoredDoc>> {
        if n == 0 {
            return Ok(vec![]);
        }
        let query_embedding = self
            .embedder
            .embed_batch(&[text.to_string()])
            .await
            .map_err(|e| RecallError::Store(format!("embedding failed: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| RecallError::Store("embedder returned no vector".to_string()))?;

        let mut scored: Vec<ScoredDoc> = self
            .scan(filter)?
            .into_iter()
            .map(|(doc, embedding)| {
                let distance = 1.0 - cosine_similarity(&query_embedding, &embedding);
                ScoredDoc {
                    id: doc.id,
                    content: doc.content,
                    metadata: doc.metadata,
                    distance,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(n);
        Ok(scored)
    }

    /// Fetch all documents matching the filter (no ranking).
    pub fn get(&self, filter: Option<&WhereClause>) -> Result<Vec<StoredDoc>> {
        Ok(self.scan(filter)?.into_iter().map(|(doc, _)| doc).collect())
    }

    /// Delete documents by id. Returns the number removed.
    pub fn delete_ids(&self, ids: &[String]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock();
        let mut deleted = 0;
        for id in ids {
            deleted += conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![self.name, id],
            )?;
        }
        Ok(deleted)
    }

    /// Delete all documents matching the filter. Returns the number removed.
    pub fn delete_where(&self, filter: &WhereClause) -> Result<usize> {
        let ids: Vec<String> = self
            .get(Some(filter))?
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        self.delete_ids(&ids)
    }

    /// Total documents in the collection
    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE collection = ?1",
            params![self.name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Scan the collection, applying the filter in-process.
    fn scan(&self, filter: Option<&WhereClause>) -> Result<Vec<(StoredDoc, Vec<f32>)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, content, metadata, embedding FROM documents WHERE collection = ?1",
        )?;
        let rows = stmt.query_map(params![self.name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, content, metadata_json, embedding_blob) = row?;
            let metadata: serde_json::Map<String, serde_json::Value> =
                serde_json::from_str(&metadata_json)?;
            if let Some(clause) = filter {
                if !clause.matches(&metadata) {
                    continue;
                }
            }
            out.push((
                StoredDoc {
                    id,
                    content,
                    metadata,
                },
                decode_embedding(&embedding_blob),
            ));
        }
        Ok(out)
    }
}

fn encode_embedding(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use serde_json::json;

    fn test_store() -> VectorStore {
        VectorStore::open_in_memory(Arc::new(HashEmbedder::new(128))).unwrap()
    }

    fn meta(role: &str, conversation: &str) -> serde_json::Value {
        json!({"role": role, "conversation_id": conversation})
    }

    #[tokio::test]
    async fn test_upsert_and_query_orders_by_distance() {
        let store = test_store();
        let docs = store.collection("docs");
        docs.upsert(
            &["a".into(), "b".into()],
            &[
                "the password is bananas".into(),
                "weather report for tuesday".into(),
            ],
            &[meta("chunk", "c"), meta("chunk", "c")],
        )
        .await
        .unwrap();

        let hits = docs.query("what is the password", 2, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert!(hits[0].distance <= hits[1].distance);
    }

    #[tokio::test]
    async fn test_upsert_replaces_existing_id() {
        let store = test_store();
        let docs = store.collection("docs");
        docs.upsert(
            &["a".into()],
            &["first version".into()],
            &[meta("chunk", "c")],
        )
        .await
        .unwrap();
        docs.upsert(
            &["a".into()],
            &["second version".into()],
            &[meta("chunk", "c")],
        )
        .await
        .unwrap();

        assert_eq!(docs.count().unwrap(), 1);
        let all = docs.get(None).unwrap();
        assert_eq!(all[0].content, "second version");
    }

    #[tokio::test]
    async fn test_query_respects_filter() {
        let store = test_store();
        let memory = store.collection("memory");
        memory
            .upsert(
                &["m1".into(), "m2".into()],
                &["fact in conv one".into(), "fact in conv two".into()],
                &[meta("memory", "one"), meta("memory", "two")],
            )
            .await
            .unwrap();

        let filter = WhereClause::eq("conversation_id", "one");
        let hits = memory.query("fact", 10, Some(&filter)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "m1");
    }

    #[tokio::test]
    async fn test_delete_where() {
        let store = test_store();
        let docs = store.collection("docs");
        docs.upsert(
            &["a".into(), "b".into(), "c".into()],
            &["one".into(), "two".into(), "three".into()],
            &[
                json!({"file_path": "x.txt"}),
                json!({"file_path": "x.txt"}),
                json!({"file_path": "y.txt"}),
            ],
        )
        .await
        .unwrap();

        let removed = docs
            .delete_where(&WhereClause::eq("file_path", "x.txt"))
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(docs.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let store = test_store();
        store
            .collection("docs")
            .upsert(&["a".into()], &["doc".into()], &[json!({})])
            .await
            .unwrap();
        assert_eq!(store.collection("memory").count().unwrap(), 0);
    }

    #[test]
    fn test_embedding_roundtrip() {
        let embedding = vec![0.5_f32, -1.25, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&embedding)), embedding);
    }
}
