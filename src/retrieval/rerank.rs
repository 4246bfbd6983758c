//! Cross-encoder reranking seam
//!
//! Retrieval scores `(query, doc)` pairs through the `Reranker` trait. The
//! default implementation is a lexical scorer (term overlap, exact-phrase
//! and length signals); a neural cross-encoder can implement the same trait
//! out-of-tree. A reranker returning no scores switches retrieval to pure
//! distance ordering.

use std::collections::HashSet;

use crate::error::Result;

/// Scores query-document relevance for candidate reordering
pub trait Reranker: Send + Sync {
    /// Return one relevance score per document, in input order. An empty
    /// vector signals "no reranking available".
    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>>;
}

/// Configuration for the lexical reranker
#[derive(Debug, Clone)]
pub struct LexicalRerankConfig {
    /// Weight of the term-overlap component
    pub term_overlap_weight: f32,
    /// Bonus when the full query appears verbatim
    pub exact_match_boost: f32,
    /// Mild penalty factor for very short documents
    pub min_doc_tokens: usize,
}

impl Default for LexicalRerankConfig {
    fn default() -> Self {
        Self {
            term_overlap_weight: 1.0,
            exact_match_boost: 0.2,
            min_doc_tokens: 3,
        }
    }
}

/// Heuristic relevance scorer over query features
pub struct LexicalReranker {
    config: LexicalRerankConfig,
}

impl LexicalReranker {
    pub fn new() -> Self {
        Self {
            config: LexicalRerankConfig::default(),
        }
    }

    pub fn with_config(config: LexicalRerankConfig) -> Self {
        Self { config }
    }

    fn score_one(&self, query_terms: &HashSet<String>, query_lower: &str, doc: &str) -> f32 {
        let doc_lower = doc.to_lowercase();
        let doc_terms = extract_terms(&doc_lower);

        let overlap = if query_terms.is_empty() {
            0.0
        } else {
            query_terms.intersection(&doc_terms).count() as f32 / query_terms.len() as f32
        };

        let exact = if !query_lower.is_empty() && doc_lower.contains(query_lower) {
            self.config.exact_match_boost
        } else {
            0.0
        };

        let length_penalty = if doc_terms.len() < self.config.min_doc_tokens {
            0.9
        } else {
            1.0
        };

        (self.config.term_overlap_weight * overlap + exact) * length_penalty
    }
}

impl Default for LexicalReranker {
    fn default() -> Self {
        Self::new()
    }
}

impl Reranker for LexicalReranker {
    fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f32>> {
        let query_lower = query.to_lowercase();
        let query_terms = extract_terms(&query_lower);
        Ok(documents
            .iter()
            .map(|doc| self.score_one(&query_terms, &query_lower, doc))
            .collect())
    }
}

/// A reranker that opts out, forcing the distance-ordering fallback.
pub struct NoopReranker;

impl Reranker for NoopReranker {
    fn score(&self, _query: &str, _documents: &[&str]) -> Result<Vec<f32>> {
        Ok(vec![])
    }
}

/// Normalized terms: lowercase alphanumeric runs longer than two chars.
fn extract_terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() > 2)
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relevant_doc_scores_higher() {
        let reranker = LexicalReranker::new();
        let scores = reranker
            .score(
                "who is my wife",
                &["The user's wife is Jane.", "The weather is sunny today."],
            )
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn test_exact_phrase_boost() {
        let reranker = LexicalReranker::new();
        let scores = reranker
            .score(
                "secret password",
                &[
                    "the secret password is kept here",
                    "password rotation and secret storage policies",
                ],
            )
            .unwrap();
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn test_scores_match_input_order_and_len() {
        let reranker = LexicalReranker::new();
        let docs = vec!["a", "b", "c"];
        let scores = reranker.score("query", &docs).unwrap();
        assert_eq!(scores.len(), 3);
    }

    #[test]
    fn test_noop_returns_empty() {
        let scores = NoopReranker.score("q", &["doc"]).unwrap();
        assert!(scores.is_empty());
    }
}
