//! Retrieval engine
//!
//! Query -> candidate fetch -> cross-encoder rerank -> score blending
//! (distance, recency, salience, tag overlap) -> MMR diversification.
//! Used for both the document corpus and conversation memory; memory
//! retrieval additionally returns the rolling summaries as separate blocks.

mod mmr;
mod rerank;

pub use mmr::{mmr_select, token_jaccard};
pub use rerank::{LexicalRerankConfig, LexicalReranker, NoopReranker, Reranker};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::memory::entities::extract_tags;
use crate::store::Collection;
use crate::types::{RagSource, RetrievalConfig};

/// Candidates fetched per requested result, before rerank + MMR.
pub const CANDIDATE_MULTIPLIER: usize = 3;

/// Context budget for rendered document blocks (~3000 tokens).
const MAX_CONTEXT_CHARS: usize = 12_000;

const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// A retrieval candidate with its store metadata
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
    pub content: String,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub distance: Option<f32>,
}

/// Rendered document retrieval: context blocks plus source attributions
#[derive(Debug, Clone)]
pub struct DocRetrieval {
    pub context: String,
    pub sources: Vec<RagSource>,
}

/// Recency boost: 1 / (1 + age_days / 7).
fn recency_boost(metadata: &serde_json::Map<String, serde_json::Value>) -> f32 {
    let timestamp = metadata
        .get("created_at")
        .or_else(|| metadata.get("indexed_at"))
        .and_then(|v| v.as_str());
    let Some(timestamp) = timestamp else {
        return 0.0;
    };
    let Ok(parsed) = DateTime::parse_from_rfc3339(timestamp) else {
        return 0.0;
    };
    let age_days = (Utc::now() - parsed.with_timezone(&Utc))
        .num_seconds()
        .max(0) as f32
        / 86_400.0;
    1.0 / (1.0 + age_days / 7.0)
}

fn salience_boost(metadata: &serde_json::Map<String, serde_json::Value>) -> f32 {
    metadata
        .get("salience")
        .and_then(|v| v.as_f64())
        .map(|s| s as f32)
        .unwrap_or(0.0)
}

/// Shared alphabetic tokens (length >= 4) between query and entry tags,
/// capped at 3, each worth 0.1.
fn tag_overlap_boost(query: &str, metadata: &serde_json::Map<String, serde_json::Value>) -> f32 {
    let Some(tags) = metadata.get("tags").and_then(|v| v.as_array()) else {
        return 0.0;
    };
    let entry_tags: Vec<String> = tags
        .iter()
        .filter_map(|v| v.as_str().map(str::to_lowercase))
        .collect();
    if entry_tags.is_empty() {
        return 0.0;
    }
    let query_tags = extract_tags(query, 5);
    let overlap = query_tags
        .iter()
        .filter(|t| entry_tags.contains(t))
        .count()
        .min(3);
    overlap as f32 * 0.1
}

/// Rerank and blend candidate scores, then apply MMR. Returns
/// `(candidate_index, blended_score)` pairs in selection order.
///
/// When the reranker yields no scores, ranking falls back to pure
/// distance ordering with the same boosts.
pub fn rank(
    query: &str,
    candidates: &[Candidate],
    reranker: &dyn Reranker,
    top_k: usize,
    config: &RetrievalConfig,
) -> Result<Vec<(usize, f32)>> {
    if candidates.is_empty() || top_k == 0 {
        return Ok(vec![]);
    }

    let contents: Vec<&str> = candidates.iter().map(|c| c.content.as_str()).collect();
    let rerank_scores = reranker.score(query, &contents)?;
    let reranked = rerank_scores.len() == candidates.len();

    let blended: Vec<f32> = candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let distance_bonus = candidate
                .distance
                .map(|d| 1.0 / (1.0 + d))
                .unwrap_or(0.0);
            let base = if reranked {
                rerank_scores[i] + 0.1 * distance_bonus
            } else {
                distance_bonus
            };
            base + 0.2 * recency_boost(&candidate.metadata)
                + 0.1 * salience_boost(&candidate.metadata)
                + config.tag_boost * tag_overlap_boost(query, &candidate.metadata)
        })
        .collect();

    // Drop weak candidates, then order by blended score with the rerank
    // score breaking ties.
    let mut order: Vec<usize> = (0..candidates.len())
        .filter(|&i| blended[i] >= config.score_threshold)
        .collect();
    order.sort_by(|&a, &b| {
        blended[b]
            .partial_cmp(&blended[a])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                if reranked {
                    rerank_scores[b]
                        .partial_cmp(&rerank_scores[a])
                        .unwrap_or(std::cmp::Ordering::Equal)
                } else {
                    std::cmp::Ordering::Equal
                }
            })
    });

    let ordered_contents: Vec<&str> = order.iter().map(|&i| contents[i]).collect();
    let ordered_scores: Vec<f32> = order.iter().map(|&i| blended[i]).collect();
    let picked = mmr_select(&ordered_contents, &ordered_scores, top_k, config.mmr_lambda);

    Ok(picked
        .into_iter()
        .map(|pos| (order[pos], ordered_scores[pos]))
        .collect())
}

/// Retrieve document context for a query. Returns None when nothing
/// relevant was found.
pub async fn retrieve_docs(
    collection: &Collection,
    reranker: &dyn Reranker,
    query: &str,
    top_k: usize,
    config: &RetrievalConfig,
) -> Result<Option<DocRetrieval>> {
    if top_k == 0 {
        return Ok(None);
    }
    let candidates: Vec<Candidate> = collection
        .query(query, top_k * CANDIDATE_MULTIPLIER, None)
        .await?
        .into_iter()
        .map(|doc| Candidate {
            id: doc.id,
            content: doc.content,
            metadata: doc.metadata,
            distance: Some(doc.distance),
        })
        .collect();
    if candidates.is_empty() {
        return Ok(None);
    }

    let selected = rank(query, &candidates, reranker, top_k, config)?;
    if selected.is_empty() {
        return Ok(None);
    }

    let mut context_parts = Vec::with_capacity(selected.len());
    let mut sources = Vec::with_capacity(selected.len());
    for (idx, score) in &selected {
        let candidate = &candidates[*idx];
        let path = candidate
            .metadata
            .get("file_path")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        context_parts.push(format!("[Source: {path}]\n{}", candidate.content));
        sources.push(RagSource {
            source: candidate
                .metadata
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string(),
            path: path.to_string(),
            chunk_id: candidate
                .metadata
                .get("chunk_id")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
            score: *score,
        });
    }

    Ok(Some(DocRetrieval {
        context: truncate_context(&context_parts.join(CONTEXT_SEPARATOR), MAX_CONTEXT_CHARS),
        sources,
    }))
}

/// Truncate rendered context to complete chunks within `max_chars`.
pub fn truncate_context(context: &str, max_chars: usize) -> String {
    if context.len() <= max_chars {
        return context.to_string();
    }
    let mut kept = Vec::new();
    let mut total = 0;
    for chunk in context.split(CONTEXT_SEPARATOR) {
        let added = chunk.len() + CONTEXT_SEPARATOR.len();
        if total + added > max_chars {
            break;
        }
        kept.push(chunk);
        total += added;
    }
    kept.join(CONTEXT_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candidate(id: &str, content: &str, distance: f32) -> Candidate {
        Candidate {
            id: id.to_string(),
            content: content.to_string(),
            metadata: serde_json::Map::new(),
            distance: Some(distance),
        }
    }

    fn candidate_with_meta(id: &str, content: &str, metadata: serde_json::Value) -> Candidate {
        Candidate {
            id: id.to_string(),
            content: content.to_string(),
            metadata: metadata.as_object().cloned().unwrap_or_default(),
            distance: Some(0.5),
        }
    }

    #[test]
    fn test_rank_prefers_relevant_content() {
        let candidates = vec![
            candidate("a", "grocery list with apples and bread", 0.3),
            candidate("b", "the user's wife is Jane", 0.4),
        ];
        let picked = rank(
            "who is my wife",
            &candidates,
            &LexicalReranker::new(),
            1,
            &RetrievalConfig::default(),
        )
        .unwrap();
        assert_eq!(picked[0].0, 1);
    }

    #[test]
    fn test_rank_falls_back_to_distance_without_reranker() {
        let candidates = vec![
            candidate("far", "far away content", 0.9),
            candidate("near", "near content", 0.1),
        ];
        let picked = rank(
            "query",
            &candidates,
            &NoopReranker,
            2,
            &RetrievalConfig::default(),
        )
        .unwrap();
        assert_eq!(picked[0].0, 1);
    }

    #[test]
    fn test_salience_and_recency_boost_scores() {
        let now = Utc::now().to_rfc3339();
        let candidates = vec![
            candidate_with_meta("plain", "same words here", json!({})),
            candidate_with_meta(
                "boosted",
                "same words here",
                json!({"salience": 1.0, "created_at": now}),
            ),
        ];
        let picked = rank(
            "same words",
            &candidates,
            &LexicalReranker::new(),
            2,
            &RetrievalConfig::default(),
        )
        .unwrap();
        assert_eq!(picked[0].0, 1);
        assert!(picked[0].1 > picked[1].1);
    }

    #[test]
    fn test_tag_overlap_capped_at_three() {
        let meta = json!({"tags": ["wife", "anne", "biking", "tokyo", "spring"]});
        let metadata = meta.as_object().cloned().unwrap();
        let boost = tag_overlap_boost("wife anne biking tokyo spring", &metadata);
        assert!((boost - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_score_threshold_filters() {
        let candidates = vec![candidate("weak", "nothing in common", 10.0)];
        let config = RetrievalConfig {
            score_threshold: 0.5,
            ..Default::default()
        };
        let picked = rank("query words", &candidates, &LexicalReranker::new(), 5, &config).unwrap();
        assert!(picked.is_empty());
    }

    #[test]
    fn test_truncate_keeps_complete_chunks() {
        let chunks = vec!["a".repeat(50), "b".repeat(50), "c".repeat(50)];
        let context = chunks.join(CONTEXT_SEPARATOR);
        let truncated = truncate_context(&context, 120);
        assert!(truncated.contains(&chunks[0]));
        assert!(truncated.contains(&chunks[1]));
        assert!(!truncated.contains(&chunks[2]));
        // No partial chunk at the tail.
        assert!(truncated.ends_with(&chunks[1]));
    }

    #[tokio::test]
    async fn test_retrieve_docs_end_to_end() {
        use crate::embedding::HashEmbedder;
        use crate::store::VectorStore;
        use std::sync::Arc;

        let store = VectorStore::open_in_memory(Arc::new(HashEmbedder::new(128))).unwrap();
        let docs = store.collection("docs");
        docs.upsert(
            &["secret.txt:chunk:0".into(), "other.txt:chunk:0".into()],
            &[
                "The password is 'bananas'.".into(),
                "Tuesday's forecast calls for rain.".into(),
            ],
            &[
                json!({"source": "secret.txt", "file_path": "secret.txt", "chunk_id": 0}),
                json!({"source": "other.txt", "file_path": "other.txt", "chunk_id": 0}),
            ],
        )
        .await
        .unwrap();

        let retrieval = retrieve_docs(
            &docs,
            &LexicalReranker::new(),
            "What is the password?",
            1,
            &RetrievalConfig::default(),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(retrieval.context.contains("[Source: secret.txt]"));
        assert!(retrieval.context.contains("bananas"));
        assert_eq!(retrieval.sources[0].path, "secret.txt");
    }

    #[tokio::test]
    async fn test_retrieve_docs_top_k_zero_disables() {
        use crate::embedding::HashEmbedder;
        use crate::store::VectorStore;
        use std::sync::Arc;

        let store = VectorStore::open_in_memory(Arc::new(HashEmbedder::new(64))).unwrap();
        let docs = store.collection("docs");
        let result = retrieve_docs(
            &docs,
            &LexicalReranker::new(),
            "anything",
            0,
            &RetrievalConfig::default(),
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }
}
