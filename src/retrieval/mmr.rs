//! Maximal Marginal Relevance selection
//!
//! Trades relevance for diversity: after seeding with the top scorer, each
//! round picks the candidate maximizing
//! `lambda * score - (1 - lambda) * max_redundancy`, where redundancy is
//! token-Jaccard similarity against the already-selected set.

use std::collections::HashSet;

/// Token-Jaccard similarity between two texts (lowercased whitespace tokens).
pub fn token_jaccard(a: &str, b: &str) -> f32 {
    let ta: HashSet<String> = a.to_lowercase().split_whitespace().map(String::from).collect();
    let tb: HashSet<String> = b.to_lowercase().split_whitespace().map(String::from).collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    intersection as f32 / union as f32
}

/// Select up to `max_items` indices from `contents` by MMR, in selection
/// order. Ties keep the earlier (higher-ranked) candidate.
pub fn mmr_select(contents: &[&str], scores: &[f32], max_items: usize, lambda: f32) -> Vec<usize> {
    if contents.is_empty() || max_items == 0 {
        return vec![];
    }

    let mut remaining: Vec<usize> = (0..contents.len()).collect();
    let mut selected: Vec<usize> = Vec::new();

    // Seed with the top scorer.
    let first = remaining
        .iter()
        .copied()
        .fold(0usize, |best, i| if scores[i] > scores[best] { i } else { best });
    selected.push(first);
    remaining.retain(|&i| i != first);

    while !remaining.is_empty() && selected.len() < max_items {
        let mut best_idx = None;
        let mut best_score = f32::NEG_INFINITY;
        for &i in &remaining {
            let redundancy = selected
                .iter()
                .map(|&s| token_jaccard(contents[i], contents[s]))
                .fold(0.0_f32, f32::max);
            let mmr = lambda * scores[i] - (1.0 - lambda) * redundancy;
            if mmr > best_score {
                best_score = mmr;
                best_idx = Some(i);
            }
        }
        let Some(pick) = best_idx else { break };
        selected.push(pick);
        remaining.retain(|&i| i != pick);
    }

    selected
}
