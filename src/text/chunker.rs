//! Token-bounded text chunking with sentence-aware overlap
//!
//! Splits by blank-line paragraphs first, re-splitting oversize paragraphs
//! at sentence boundaries. Paragraphs are packed greedily; when a chunk
//! fills up, the next one starts with an overlap tail of the previous
//! chunk's last words. A single sentence that exceeds the chunk size is
//! emitted as-is rather than split mid-sentence.

use once_cell::sync::Lazy;
use regex::Regex;

use super::tokens::count_tokens;

static PARAGRAPH_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").expect("valid regex"));

// Sentence boundary: terminal punctuation, whitespace, then an uppercase
// letter. The regex crate has no lookarounds, so matches are located and the
// text is cut manually, keeping the punctuation with the left sentence.
static SENTENCE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]\s+[A-Z]").expect("valid regex"));

/// Split text into sentences at `[.!?]` + whitespace + uppercase boundaries.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_BOUNDARY.find_iter(text) {
        // Cut after the punctuation; the uppercase letter (always one byte)
        // begins the next sentence.
        let cut = m.start() + 1;
        let piece = text[start..cut].trim();
        if !piece.is_empty() {
            sentences.push(piece.to_string());
        }
        start = m.end() - 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Collect the last words of `parts` totalling at most `overlap` tokens.
fn overlap_tail(parts: &[String], overlap: usize, model: &str) -> String {
    if overlap == 0 || parts.is_empty() {
        return String::new();
    }
    let joined = parts.join(" ");
    let mut words: Vec<&str> = Vec::new();
    let mut tokens = 0;
    for word in joined.split_whitespace().rev() {
        let word_tokens = count_tokens(word, model);
        if tokens + word_tokens > overlap {
            break;
        }
        words.push(word);
        tokens += word_tokens;
    }
    words.reverse();
    words.join(" ")
}

/// Split `text` into overlapping chunks of at most `chunk_size` tokens.
///
/// Guarantees: `chunk("") == []`; a text within the budget is returned as a
/// single chunk; every output chunk fits the budget except indivisible
/// sentences, which are emitted whole.
pub fn chunk(text: &str, chunk_size: usize, overlap: usize, model: &str) -> Vec<String> {
    if text.trim().is_empty() || chunk_size == 0 {
        return Vec::new();
    }
    if count_tokens(text, model) <= chunk_size {
        return vec![text.to_string()];
    }

    let paragraphs: Vec<&str> = PARAGRAPH_SPLIT
        .split(text)
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.is_empty() {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0;

    // Joining parts costs roughly one separator token per joint; account
    // for it so flushed chunks stay inside the budget.
    let cost = |parts: &[String], tokens: usize| -> usize {
        if parts.is_empty() {
            tokens
        } else {
            tokens + 1
        }
    };
    let mut flush = |current: &mut Vec<String>, current_tokens: &mut usize, chunks: &mut Vec<String>| {
        if !current.is_empty() {
            chunks.push(current.join("\n\n"));
            current.clear();
            *current_tokens = 0;
        }
    };

    for para in paragraphs {
        let para_tokens = count_tokens(para, model);

        if para_tokens > chunk_size {
            // Oversize paragraph: re-split by sentences.
            flush(&mut current, &mut current_tokens, &mut chunks);
            for sentence in split_sentences(para) {
                let sent_tokens = count_tokens(&sentence, model);
                if sent_tokens > chunk_size {
                    // Indivisible sentence, emitted as-is.
                    flush(&mut current, &mut current_tokens, &mut chunks);
                    chunks.push(sentence);
                    continue;
                }
                if current_tokens + cost(&current, sent_tokens) > chunk_size
                    && !current.is_empty()
                {
                    let tail = overlap_tail(&current, overlap, model);
                    flush(&mut current, &mut current_tokens, &mut chunks);
                    if !tail.is_empty() {
                        current_tokens = count_tokens(&tail, model);
                        current.push(tail);
                    }
                }
                current_tokens += cost(&current, sent_tokens);
                current.push(sentence);
            }
        } else if current_tokens + cost(&current, para_tokens) > chunk_size
            && !current.is_empty()
        {
            let tail = overlap_tail(&current, overlap, model);
            flush(&mut current, &mut current_tokens, &mut chunks);
            if !tail.is_empty() {
                current_tokens = count_tokens(&tail, model);
                current.push(tail);
            }
            current_tokens += cost(&current, para_tokens);
            current.push(para.to_string());
        } else {
            current_tokens += cost(&current, para_tokens);
            current.push(para.to_string());
        }
    }

    flush(&mut current, &mut current_tokens, &mut chunks);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL: &str = "gpt-4";

    #[test]
    fn test_empty_returns_no_chunks() {
        assert!(chunk("", 100, 20, MODEL).is_empty());
        assert!(chunk("   \n\n  ", 100, 20, MODEL).is_empty());
    }

    #[test]
    fn test_short_text_single_chunk() {
        let text = "Just a short note.";
        let chunks = chunk(text, 100, 20, MODEL);
        assert_eq!(chunks, vec![text.to_string()]);
    }

    #[test]
    fn test_chunks_respect_budget() {
        let para = "The cat sat on the mat. The dog barked at the moon. Birds sang in the morning.";
        let text = vec![para; 20].join("\n\n");
        let chunks = chunk(&text, 60, 10, MODEL);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(
                count_tokens(c, MODEL) <= 60,
                "chunk exceeded budget: {} tokens",
                count_tokens(c, MODEL)
            );
        }
    }

    #[test]
    fn test_indivisible_sentence_emitted_whole() {
        let long_sentence = format!("word {}", "and more ".repeat(100));
        let chunks = chunk(&long_sentence, 20, 5, MODEL);
        // The sentence has no boundaries, so it must appear intact somewhere.
        assert!(chunks.iter().any(|c| count_tokens(c, MODEL) > 20));
    }

    #[test]
    fn test_overlap_carries_trailing_words() {
        let para = "Alpha beta gamma delta. Epsilon zeta eta theta. Iota kappa lambda mu.";
        let text = vec![para; 10].join("\n\n");
        let chunks = chunk(&text, 40, 8, MODEL);
        assert!(chunks.len() > 1);
        // The second chunk should begin with words from the end of the first.
        let first_tail: Vec<&str> = chunks[0].split_whitespace().rev().take(2).collect();
        let second_head: Vec<&str> = chunks[1].split_whitespace().take(8).collect();
        assert!(
            first_tail.iter().any(|w| second_head.contains(w)),
            "no overlap between consecutive chunks"
        );
    }

    #[test]
    fn test_content_preserved_in_order() {
        let text = "First paragraph here.\n\nSecond paragraph follows.\n\nThird one closes.";
        let chunks = chunk(text, 8, 0, MODEL);
        let rejoined = chunks.join(" ");
        for word in ["First", "Second", "Third"] {
            assert!(rejoined.contains(word));
        }
        let first = rejoined.find("First").unwrap();
        let second = rejoined.find("Second").unwrap();
        let third = rejoined.find("Third").unwrap();
        assert!(first < second && second < third);
    }

    #[test]
    fn test_split_sentences_boundaries() {
        let sentences = split_sentences("One thing. Another thing! A question? Yes.");
        assert_eq!(sentences.len(), 4);
        assert_eq!(sentences[0], "One thing.");
        assert_eq!(sentences[2], "A question?");
    }

    #[test]
    fn test_split_sentences_ignores_lowercase_continuation() {
        // "e.g. something" must not split: no uppercase after the period.
        let sentences = split_sentences("Use retrieval e.g. when context is large.");
        assert_eq!(sentences.len(), 1);
    }
}
