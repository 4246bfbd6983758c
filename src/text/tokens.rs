//! Token counting with cached tokenizers
//!
//! Uses tiktoken-rs with a per-model BPE cache. Unknown models fall back to
//! cl100k_base (covers most modern LLMs); if no tokenizer can be built at
//! all, a chars/4 estimate is used so counting never fails.

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tiktoken_rs::CoreBPE;

static BPE_CACHE: Lazy<Mutex<HashMap<String, Option<Arc<CoreBPE>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Get the tokenizer for a model, building and caching it on first use.
fn bpe_for_model(model: &str) -> Option<Arc<CoreBPE>> {
    let mut cache = BPE_CACHE.lock();
    cache
        .entry(model.to_string())
        .or_insert_with(|| {
            tiktoken_rs::get_bpe_from_model(model)
                .or_else(|_| tiktoken_rs::cl100k_base())
                .map(Arc::new)
                .map_err(|e| {
                    tracing::warn!("No tokenizer available for {model}: {e}; using estimate");
                    e
                })
                .ok()
        })
        .clone()
}

/// Count tokens using the model's tokenizer, falling back to a char-based
/// estimate. Special tokens are encoded normally: upstream LLM output may
/// contain control sequences like `<|endoftext|>` and must not be rejected.
pub fn count_tokens(text: &str, model: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    match bpe_for_model(model) {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => estimate_tokens(text),
    }
}

/// Rough token estimate based on character length (~4 chars/token).
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    std::cmp::max(1, (text.len() + 3) / 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(count_tokens("", "gpt-4"), 0);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_known_model() {
        let n = count_tokens("Hello, world!", "gpt-4");
        assert!(n > 0);
        assert!(n < 10);
    }

    #[test]
    fn test_unknown_model_falls_back() {
        // Unknown models use cl100k_base, not the estimate, so the count
        // should match a known cl100k model.
        let unknown = count_tokens("The quick brown fox jumps over the lazy dog.", "llama3.1:8b");
        let known = count_tokens("The quick brown fox jumps over the lazy dog.", "gpt-4");
        assert_eq!(unknown, known);
    }

    #[test]
    fn test_control_sequences_accepted() {
        let n = count_tokens("before <|endoftext|> after", "gpt-4");
        assert!(n > 0);
    }

    #[test]
    fn test_estimate_minimum_one() {
        assert_eq!(estimate_tokens("a"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
