//! Recall - Retrieval/Memory Proxy Core
//!
//! An OpenAI-compatible chat-completions gateway that transparently enriches
//! requests with context from an indexed document corpus and a per-conversation
//! long-term memory, forwards the augmented request upstream, and writes the
//! results back into the stores.

pub mod embedding;
pub mod error;
pub mod files;
pub mod index;
pub mod llm;
pub mod memory;
pub mod proxy;
pub mod retrieval;
pub mod server;
pub mod store;
pub mod summarize;
pub mod text;
pub mod types;

pub use error::{RecallError, Result};
pub use store::VectorStore;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
