//! Long-term conversation memory
//!
//! Request augmentation, LLM-driven fact reconciliation, rolling summaries,
//! and the long-conversation segment log.

pub mod entities;
pub mod engine;
pub mod long_conversation;
pub mod reconcile;
pub mod store;

pub use engine::{MemoryConfig, MemoryEngine, MemoryRetrieval, GLOBAL_CONVERSATION_ID};
pub use store::MemoryStore;
