//! Text utilities: token counting and chunking
//!
//! Both are synchronous and CPU-bound; callers on the async runtime invoke
//! them inline (they are cheap relative to the network calls around them).

mod chunker;
mod tokens;

pub use chunker::{chunk, split_sentences};
pub use tokens::{count_tokens, estimate_tokens};
