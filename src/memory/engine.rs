//! Core memory engine
//!
//! Augments chat requests with retrieved memory and rolling summaries, and
//! runs the post-response write path: turn persistence, fact extraction,
//! reconciliation, summary updates, and eviction.

use std::sync::Arc;

use chrono::Utc;

use crate::error::Result;
use crate::llm::LlmClient;
use crate::memory::entities::{MemoryRole, SummaryKind, Turn};
use crate::memory::reconcile;
use crate::memory::store::MemoryStore;
use crate::retrieval::{rank, Candidate, Reranker, CANDIDATE_MULTIPLIER};
use crate::types::{ChatRequest, MemoryHit, Message, RetrievalConfig};

/// Reserved conversation id for memories shared across conversations.
pub const GLOBAL_CONVERSATION_ID: &str = "global";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub default_memory_id: String,
    pub default_top_k: i64,
    pub enable_summarization: bool,
    pub max_entries: usize,
    pub retrieval: RetrievalConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_memory_id: "default".to_string(),
            default_top_k: 5,
            enable_summarization: true,
            max_entries: 500,
            retrieval: RetrievalConfig::default(),
        }
    }
}

/// Result of a memory retrieval: ranked entries plus summary blocks,
/// which are kept separate from the entry list.
#[derive(Debug, Clone, Default)]
pub struct MemoryRetrieval {
    pub entries: Vec<MemoryHit>,
    pub summaries: Vec<String>,
}

impl MemoryRetrieval {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.summaries.is_empty()
    }
}

/// Long-term memory engine over one memory store
pub struct MemoryEngine {
    store: MemoryStore,
    llm: LlmClient,
    reranker: Arc<dyn Reranker>,
    config: MemoryConfig,
}

impl MemoryEngine {
    pub fn new(
        store: MemoryStore,
        llm: LlmClient,
        reranker: Arc<dyn Reranker>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            llm,
            reranker,
            config,
        }
    }

    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Retrieve relevant memories and rolling summaries for a query.
    pub async fn retrieve(
        &self,
        conversation_id: &str,
        query: &str,
        top_k: usize,
    ) -> Result<MemoryRetrieval> {
        if top_k == 0 {
            return Ok(MemoryRetrieval::default());
        }

        // Primary scope plus the reserved global scope when distinct.
        let mut scopes = vec![conversation_id.to_string()];
        if self.config.retrieval.include_global && conversation_id != GLOBAL_CONVERSATION_ID {
            scopes.push(GLOBAL_CONVERSATION_ID.to_string());
        }

        let mut candidates: Vec<Candidate> = Vec::new();
        for scope in &scopes {
            for memory in self
                .store
                .query_memories(scope, query, top_k * CANDIDATE_MULTIPLIER)
                .await?
            {
                candidates.push(Candidate {
                    id: memory.id,
                    content: memory.content,
                    metadata: memory
                        .metadata
                        .to_json()
                        .as_object()
                        .cloned()
                        .unwrap_or_default(),
                    distance: memory.distance,
                });
            }
        }

        let selected = rank(
            query,
            &candidates,
            self.reranker.as_ref(),
            top_k,
            &self.config.retrieval,
        )?;

        let entries = selected
            .into_iter()
            .map(|(idx, score)| {
                let candidate = &candidates[idx];
                MemoryHit {
                    role: candidate
                        .metadata
                        .get("role")
                        .and_then(|v| v.as_str())
                        .unwrap_or("memory")
                        .to_string(),
                    content: candidate.content.clone(),
                    created_at: candidate
                        .metadata
                        .get("created_at")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    score,
                }
            })
            .collect();

        let mut summaries = Vec::new();
        if let Some(short) = self.store.get_summary(conversation_id, SummaryKind::Short)? {
            summaries.push(format!("Short summary:\n{}", short.content));
        }
        if let Some(long) = self.store.get_summary(conversation_id, SummaryKind::Long)? {
            summaries.push(format!("Long summary:\n{}", long.content));
        }

        Ok(MemoryRetrieval { entries, summaries })
    }

    /// Retrieve memory context and augment the chat request. Returns the
    /// (possibly augmented) request, the retrieval used, and the resolved
    /// conversation id.
    pub async fn augment(
        &self,
        request: &ChatRequest,
    ) -> Result<(ChatRequest, Option<MemoryRetrieval>, String)> {
        let conversation_id = request
            .memory_id
            .clone()
            .unwrap_or_else(|| self.config.default_memory_id.clone());

        let Some(user_message) = request.last_user_message().map(String::from) else {
            return Ok((request.clone(), None, conversation_id));
        };

        let top_k = request.memory_top_k.unwrap_or(self.config.default_top_k);
        if top_k <= 0 {
            tracing::info!("Memory retrieval disabled for this request (top_k={top_k})");
            return Ok((request.clone(), None, conversation_id));
        }

        let retrieval = self
            .retrieve(&conversation_id, &user_message, top_k as usize)
            .await?;
        if retrieval.is_empty() {
            return Ok((request.clone(), None, conversation_id));
        }

        let augmented_content = format_augmented_content(&user_message, &retrieval);
        let mut augmented = request.clone();
        augmented.messages.pop();
        augmented
            .messages
            .push(Message::new("user", augmented_content));

        Ok((augmented, Some(retrieval), conversation_id))
    }

    /// Post-response write path. Never blocks the user's reply; the caller
    /// runs this in a background task and logs failures.
    pub async fn post_process(
        &self,
        conversation_id: &str,
        user_message: Option<&str>,
        assistant_message: Option<&str>,
        model: &str,
    ) -> Result<()> {
        // Persist the raw turns first; the user turn anchors fact provenance.
        let mut source_id = None;
        if let Some(content) = user_message.filter(|c| !c.trim().is_empty()) {
            let turn = Turn::new(conversation_id, MemoryRole::User, content);
            source_id = Some(turn.id.clone());
            self.store.persist_turn(&turn).await?;
        }
        if let Some(content) = assistant_message.filter(|c| !c.trim().is_empty()) {
            let turn = Turn::new(conversation_id, MemoryRole::Assistant, content);
            self.store.persist_turn(&turn).await?;
        }

        let facts =
            reconcile::extract_salient_facts(&self.llm, model, user_message).await;
        if !facts.is_empty() {
            let created_at = Utc::now();
            let source = source_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let outcome = reconcile::reconcile_facts(
                &self.store,
                &self.llm,
                model,
                conversation_id,
                &facts,
                &source,
                created_at,
            )
            .await?;

            if !outcome.to_delete.is_empty() {
                self.store.delete_entries(
                    conversation_id,
                    &outcome.to_delete,
                    &outcome.replacement_map,
                )?;
            }
            if !outcome.to_add.is_empty() {
                self.store.persist_facts(&outcome.to_add).await?;
            }

            if self.config.enable_summarization {
                self.update_rolling_summaries(conversation_id, &facts, model)
                    .await?;
            }
        }

        self.store
            .evict_if_needed(conversation_id, self.config.max_entries)?;
        Ok(())
    }

    async fn update_rolling_summaries(
        &self,
        conversation_id: &str,
        facts: &[String],
        model: &str,
    ) -> Result<()> {
        for kind in [SummaryKind::Short, SummaryKind::Long] {
            let mut prior = self
                .store
                .get_summary(conversation_id, kind)?
                .map(|p| p.content);

            // A summary that has outgrown its budget gets recompressed
            // before the rolling update.
            let over_budget = prior
                .as_deref()
                .map(|c| crate::text::count_tokens(c, model) > kind.max_tokens() as usize)
                .unwrap_or(false);
            if over_budget {
                let content = prior.clone().unwrap_or_default();
                let config = crate::summarize::SummarizerConfig {
                    model: model.to_string(),
                    ..Default::default()
                };
                match crate::summarize::summarize(
                    &content,
                    &config,
                    &self.llm,
                    None,
                    crate::summarize::ContentType::Conversation,
                )
                .await
                {
                    Ok(result) => prior = result.summary.or(prior),
                    Err(e) => {
                        tracing::warn!("Summary recompression failed ({kind:?}): {e}");
                    }
                }
            }

            match reconcile::update_summary(
                &self.llm,
                model,
                prior.as_deref(),
                facts,
                kind,
            )
            .await
            {
                Ok(Some(summary)) => {
                    self.store
                        .persist_summary(conversation_id, kind, &summary)
                        .await?;
                }
                Ok(None) => {}
                Err(e) => {
                    // Summaries are retried on the next turn.
                    tracing::warn!("Rolling summary update failed ({kind:?}): {e}");
                }
            }
        }
        Ok(())
    }
}

/// Compose the augmented user message: summaries, then ranked memories,
/// then the current message.
fn format_augmented_content(user_message: &str, retrieval: &MemoryRetrieval) -> String {
    let mut parts = Vec::new();
    if !retrieval.summaries.is_empty() {
        parts.push(format!(
            "Conversation summaries:\n{}",
            retrieval.summaries.join("\n\n")
        ));
    }
    if !retrieval.entries.is_empty() {
        let memory_block: Vec<String> = retrieval
            .entries
            .iter()
            .map(|m| format!("[{}] {}", m.role, m.content))
            .collect();
        parts.push(format!(
            "Long-term memory (most relevant first):\n{}",
            memory_block.join("\n\n---\n\n")
        ));
    }
    parts.push(format!("Current message: {user_message}"));
    parts.join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::files::MemoryFileStore;
    use crate::memory::entities::Fact;
    use crate::retrieval::LexicalReranker;
    use crate::store::VectorStore;
    use tempfile::tempdir;

    fn engine() -> (tempfile::TempDir, MemoryEngine) {
        let dir = tempdir().unwrap();
        let vector = VectorStore::open_in_memory(Arc::new(HashEmbedder::new(128))).unwrap();
        let files = Arc::new(MemoryFileStore::new(dir.path()).unwrap());
        let store = MemoryStore::new(vector.collection("memory"), files);
        let llm = LlmClient::new("http://127.0.0.1:1", None);
        let engine = MemoryEngine::new(
            store,
            llm,
            Arc::new(LexicalReranker::new()),
            MemoryConfig::default(),
        );
        (dir, engine)
    }

    fn request(content: &str, memory_id: Option<&str>, top_k: Option<i64>) -> ChatRequest {
        ChatRequest {
            model: "m".to_string(),
            messages: vec![Message::new("user", content)],
            temperature: None,
            max_tokens: None,
            stream: None,
            memory_id: memory_id.map(String::from),
            memory_top_k: top_k,
            rag_top_k: None,
            extra: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn test_retrieve_ranks_matching_fact_first() {
        let (_dir, engine) = engine();
        let facts = vec![
            Fact::new("conv", "The user's wife is Jane.", "t", Utc::now()),
            Fact::new("conv", "The user drives a red bicycle.", "t", Utc::now()),
        ];
        engine.store().persist_facts(&facts).await.unwrap();

        let retrieval = engine.retrieve("conv", "who is my wife", 2).await.unwrap();
        assert!(!retrieval.entries.is_empty());
        assert!(retrieval.entries[0].content.contains("Jane"));
    }

    #[tokio::test]
    async fn test_retrieve_includes_global_scope() {
        let (_dir, engine) = engine();
        let global_fact = Fact::new(
            GLOBAL_CONVERSATION_ID,
            "The company holiday is in July.",
            "t",
            Utc::now(),
        );
        engine.store().persist_facts(&[global_fact]).await.unwrap();

        let retrieval = engine
            .retrieve("conv", "when is the company holiday", 3)
            .await
            .unwrap();
        assert!(retrieval
            .entries
            .iter()
            .any(|e| e.content.contains("July")));
    }

    #[tokio::test]
    async fn test_augment_rewrites_last_user_message() {
        let (_dir, engine) = engine();
        let fact = Fact::new("conv", "The user's wife is Jane.", "t", Utc::now());
        engine.store().persist_facts(&[fact]).await.unwrap();

        let request = request("who is my wife", Some("conv"), None);
        let (augmented, retrieval, conversation_id) = engine.augment(&request).await.unwrap();

        assert_eq!(conversation_id, "conv");
        assert!(retrieval.is_some());
        let last = augmented.messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert!(last.content.contains("Long-term memory"));
        assert!(last.content.contains("Jane"));
        assert!(last.content.contains("Current message: who is my wife"));
    }

    #[tokio::test]
    async fn test_augment_top_k_zero_passthrough() {
        let (_dir, engine) = engine();
        let fact = Fact::new("conv", "The user's wife is Jane.", "t", Utc::now());
        engine.store().persist_facts(&[fact]).await.unwrap();

        let request = request("who is my wife", Some("conv"), Some(0));
        let (augmented, retrieval, _) = engine.augment(&request).await.unwrap();
        assert!(retrieval.is_none());
        assert_eq!(augmented.messages[0].content, "who is my wife");
    }

    #[tokio::test]
    async fn test_augment_empty_store_passthrough() {
        let (_dir, engine) = engine();
        let request = request("hello there", None, None);
        let (augmented, retrieval, conversation_id) = engine.augment(&request).await.unwrap();
        assert!(retrieval.is_none());
        assert_eq!(conversation_id, "default");
        assert_eq!(augmented.messages[0].content, "hello there");
    }

    #[tokio::test]
    async fn test_post_process_persists_turns_despite_dead_llm() {
        let (_dir, engine) = engine();
        // Fact extraction fails against the dead endpoint and degrades to
        // no facts; the raw turns must still be persisted.
        engine
            .post_process("conv", Some("my wife is Jane"), Some("Noted!"), "m")
            .await
            .unwrap();

        let entries = engine.store().list_entries("conv", true).unwrap();
        assert_eq!(entries.len(), 2);
        let roles: Vec<MemoryRole> = entries.iter().map(|e| e.metadata.role).collect();
        assert!(roles.contains(&MemoryRole::User));
        assert!(roles.contains(&MemoryRole::Assistant));
    }

    #[test]
    fn test_format_augmented_content_order() {
        let retrieval = MemoryRetrieval {
            entries: vec![MemoryHit {
                role: "memory".to_string(),
                content: "The user's wife is Anne.".to_string(),
                created_at: String::new(),
                score: 1.0,
            }],
            summaries: vec!["Short summary:\nUser is married.".to_string()],
        };
        let content = format_augmented_content("who is my wife", &retrieval);
        let summaries_at = content.find("Conversation summaries").unwrap();
        let memory_at = content.find("Long-term memory").unwrap();
        let current_at = content.find("Current message").unwrap();
        assert!(summaries_at < memory_at && memory_at < current_at);
    }
}
