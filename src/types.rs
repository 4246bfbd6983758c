//! Shared wire types and configuration structs
//!
//! Every module takes a value-typed config; there are no process-wide
//! globals besides the vector store handle and the snapshot lock registry,
//! both created at startup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A single chat message in the OpenAI wire format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// OpenAI-compatible chat-completion request with proxy extensions.
///
/// Unknown fields are captured in `extra` and forwarded untouched; the
/// proxy-only extensions (`memory_id`, `memory_top_k`, `rag_top_k`) are
/// stripped before the request leaves the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_top_k: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag_top_k: Option<i64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Fields that never reach the upstream endpoint.
pub const PROXY_ONLY_FIELDS: &[&str] = &["memory_id", "memory_top_k", "rag_top_k"];

impl ChatRequest {
    /// Last user message content, if any.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
    }

    /// Whether the client asked for a streaming response.
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Serialize for forwarding, stripping proxy-only fields.
    pub fn to_forward_payload(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        if let Some(obj) = value.as_object_mut() {
            for field in PROXY_ONLY_FIELDS {
                obj.remove(*field);
            }
        }
        value
    }
}

/// Source attribution for a retrieved document chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RagSource {
    pub source: String,
    pub path: String,
    pub chunk_id: i64,
    pub score: f32,
}

/// A memory entry returned to the client as a retrieval hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryHit {
    pub role: String,
    pub content: String,
    pub created_at: String,
    pub score: f32,
}

/// Metadata attached to an indexed document chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocMetadata {
    pub source: String,
    pub file_path: String,
    pub file_type: String,
    pub chunk_id: i64,
    pub total_chunks: i64,
    pub indexed_at: String,
    pub file_hash: String,
}

/// Retrieval tuning knobs shared by doc and memory retrieval.
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Diversity/relevance trade-off for MMR selection.
    pub mmr_lambda: f32,
    /// Weight applied to tag-overlap boosts.
    pub tag_boost: f32,
    /// Blended scores below this are dropped before MMR.
    pub score_threshold: f32,
    /// Also query the reserved "global" conversation scope.
    pub include_global: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mmr_lambda: 0.7,
            tag_boost: 0.1,
            score_threshold: 0.0,
            include_global: true,
        }
    }
}

/// Embedding backend selection.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// "openai" or "hash"
    pub backend: String,
    /// Model name for the HTTP backend (e.g. text-embedding-3-small)
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: "hash".to_string(),
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            dimensions: 384,
        }
    }
}

/// Top-level server configuration assembled by the binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub openai_base_url: String,
    pub chat_api_key: Option<String>,
    pub embedding: EmbeddingConfig,
    pub default_top_k: i64,
    pub enable_summarization: bool,
    pub max_entries: usize,
    pub retrieval: RetrievalConfig,
    pub long_conversation: bool,
    pub compress_threshold: f32,
    pub raw_recent_tokens: usize,
    pub target_context_tokens: usize,
    pub docs_folder: PathBuf,
    pub memory_root: PathBuf,
    pub store_path: PathBuf,
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "http://localhost:8080/v1".to_string(),
            chat_api_key: None,
            embedding: EmbeddingConfig::default(),
            default_top_k: 5,
            enable_summarization: true,
            max_entries: 500,
            retrieval: RetrievalConfig::default(),
            long_conversation: false,
            compress_threshold: 0.8,
            raw_recent_tokens: 40_000,
            target_context_tokens: 150_000,
            docs_folder: PathBuf::from("./rag_docs"),
            memory_root: PathBuf::from("./memory"),
            store_path: PathBuf::from("./recall_db"),
            host: "127.0.0.1".to_string(),
            port: 8000,
        }
    }
}
