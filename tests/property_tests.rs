//! Property-based tests for recall
//!
//! These tests verify invariants that must hold for all inputs:
//! - The chunker respects its token budget and loses no content
//! - MMR selection is bounded and degenerates correctly at the lambda extremes
//! - Filter parsing never panics
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// CHUNKER TESTS
// ============================================================================

mod chunker_tests {
    use super::*;
    use recall::text::{chunk, count_tokens};

    proptest! {
        /// Invariant: chunking never panics on any input
        #[test]
        fn never_panics(s in "\\PC{0,400}") {
            let _ = chunk(&s, 32, 8, "gpt-4");
        }

        /// Invariant: whitespace-only input yields no chunks
        #[test]
        fn blank_input_yields_nothing(s in "[ \t\n]{0,50}") {
            prop_assert!(chunk(&s, 32, 8, "gpt-4").is_empty());
        }

        /// Invariant: text within the budget comes back as a single chunk
        #[test]
        fn small_text_single_chunk(s in "[a-z ]{1,40}") {
            prop_assume!(!s.trim().is_empty());
            let chunks = chunk(&s, 200, 20, "gpt-4");
            prop_assert_eq!(chunks.len(), 1);
        }

        /// Invariant: every word of the input survives chunking (overlap
        /// may duplicate words, never drop them)
        #[test]
        fn no_content_lost(words in proptest::collection::vec("[a-z]{2,8}", 1..60)) {
            let text = words
                .chunks(5)
                .map(|group| format!("{}.", group.join(" ")))
                .collect::<Vec<_>>()
                .join("\n\n");
            let chunks = chunk(&text, 16, 4, "gpt-4");
            let rejoined = chunks.join(" ");
            for word in &words {
                prop_assert!(rejoined.contains(word.as_str()));
            }
        }

        /// Invariant: multi-sentence chunks respect the token budget
        /// (only indivisible single sentences may exceed it)
        #[test]
        fn budget_respected(words in proptest::collection::vec("[a-z]{2,8}", 10..80)) {
            let text = words
                .chunks(4)
                .map(|group| format!("{}.", group.join(" ")))
                .collect::<Vec<_>>()
                .join(" ");
            for c in chunk(&text, 24, 6, "gpt-4") {
                // A chunk over budget must be a single sentence.
                if count_tokens(&c, "gpt-4") > 24 {
                    prop_assert_eq!(c.matches('.').count(), 1);
                }
            }
        }
    }
}

// ============================================================================
// MMR TESTS
// ============================================================================

mod mmr_tests {
    use super::*;
    use recall::retrieval::{mmr_select, token_jaccard};

    proptest! {
        /// Invariant: jaccard similarity stays in [0, 1] and is symmetric
        #[test]
        fn jaccard_bounded_and_symmetric(a in "[a-f ]{0,60}", b in "[a-f ]{0,60}") {
            let ab = token_jaccard(&a, &b);
            let ba = token_jaccard(&b, &a);
            prop_assert!((0.0..=1.0).contains(&ab));
            prop_assert!((ab - ba).abs() < 1e-6);
        }

        /// Invariant: selection size is min(max_items, candidates) and
        /// contains no duplicates
        #[test]
        fn selection_bounded_unique(
            scores in proptest::collection::vec(0.0_f32..1.0, 1..20),
            max_items in 0usize..25,
            lambda in 0.0_f32..=1.0,
        ) {
            let contents: Vec<String> =
                (0..scores.len()).map(|i| format!("item number {i}")).collect();
            let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
            let picked = mmr_select(&refs, &scores, max_items, lambda);

            prop_assert_eq!(picked.len(), max_items.min(scores.len()));
            let mut sorted = picked.clone();
            sorted.sort_unstable();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), picked.len());
        }

        /// Invariant: with lambda = 1 the selection is exactly the top-k
        /// by score
        #[test]
        fn lambda_one_is_pure_relevance(
            scores in proptest::collection::vec(0.0_f32..1.0, 2..15),
            k in 1usize..10,
        ) {
            let contents: Vec<String> =
                (0..scores.len()).map(|i| format!("unique text {i}")).collect();
            let refs: Vec<&str> = contents.iter().map(String::as_str).collect();
            let picked = mmr_select(&refs, &scores, k, 1.0);

            let mut expected: Vec<usize> = (0..scores.len()).collect();
            expected.sort_by(|&a, &b| {
                scores[b].partial_cmp(&scores[a]).unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            });
            expected.truncate(k.min(scores.len()));
            prop_assert_eq!(picked, expected);
        }
    }
}

// ============================================================================
// FILTER TESTS
// ============================================================================

mod filter_tests {
    use super::*;
    use recall::store::WhereClause;
    use serde_json::json;

    proptest! {
        /// Invariant: parsing arbitrary JSON objects never panics
        #[test]
        fn parse_never_panics(key in "[a-z$]{1,10}", value in "\\PC{0,20}") {
            let _ = WhereClause::parse(&json!({ key: value }));
        }

        /// Invariant: a parsed equality filter matches exactly the
        /// metadata carrying that value
        #[test]
        fn equality_roundtrip(field in "[a-z_]{1,12}", value in "[a-zA-Z0-9]{0,16}") {
            let clause = WhereClause::parse(&json!({ field.clone(): value.clone() })).unwrap();

            let mut matching = serde_json::Map::new();
            matching.insert(field.clone(), json!(value));
            prop_assert!(clause.matches(&matching));

            let mut other = serde_json::Map::new();
            other.insert(field, json!(format!("{value}-different")));
            prop_assert!(!clause.matches(&other));
        }

        /// Invariant: $in matches iff the value is in the list
        #[test]
        fn in_semantics(values in proptest::collection::vec("[a-z]{1,6}", 1..6), probe in "[a-z]{1,6}") {
            let clause = WhereClause::parse(&json!({"field": {"$in": values.clone()}})).unwrap();
            let mut metadata = serde_json::Map::new();
            metadata.insert("field".to_string(), json!(probe));
            prop_assert_eq!(clause.matches(&metadata), values.contains(&probe));
        }
    }
}

// ============================================================================
// SLUG TESTS
// ============================================================================

mod slug_tests {
    use super::*;
    use recall::files::slugify;

    proptest! {
        /// Invariant: slugs are never empty and contain only safe chars
        #[test]
        fn slug_charset(s in "\\PC{0,60}") {
            let slug = slugify(&s);
            prop_assert!(!slug.is_empty());
            let is_safe_char = |c: char| c.is_alphanumeric() || matches!(c, '-' | '.' | '_');
            prop_assert!(slug.chars().all(is_safe_char));
        }

        /// Invariant: slugification is idempotent
        #[test]
        fn slug_idempotent(s in "\\PC{1,60}") {
            let once = slugify(&s);
            prop_assert_eq!(slugify(&once), once.clone());
        }
    }
}
