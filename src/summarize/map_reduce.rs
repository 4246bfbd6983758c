//! Map-reduce summarization with dynamic collapse
//!
//! Map: split content into chunks and summarize each in parallel, bounded
//! by a semaphore. Reduce: while the combined summaries exceed `token_max`,
//! group consecutive summaries under the budget and synthesize each group,
//! recursing. No predetermined levels; the collapse depth follows the
//! actual content length, with a safety cap.

use std::sync::Arc;

use tokio::sync::Semaphore;

use super::prompts;
use super::SummarizerConfig;
use crate::error::{RecallError, Result};
use crate::llm::LlmClient;
use crate::text;
use crate::types::Message;

/// Safety limit on recursive collapse depth.
const MAX_COLLAPSE_DEPTH: usize = 10;

/// Result of the map-reduce pipeline
#[derive(Debug, Clone)]
pub struct MapReduceResult {
    pub summary: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub compression_ratio: f32,
    pub collapse_depth: usize,
}

/// Target summary size: ~10% of the input, bounded to [50, 500] tokens.
pub fn estimate_summary_tokens(input_tokens: usize) -> usize {
    (input_tokens / 10).clamp(50, 500)
}

/// ~0.75 words per token for English text.
pub fn tokens_to_words(tokens: usize) -> usize {
    tokens * 3 / 4
}

/// Generate one summary completion.
pub async fn generate_summary(
    llm: &LlmClient,
    config: &SummarizerConfig,
    prompt: String,
    max_tokens: u32,
) -> Result<String> {
    let messages = vec![
        Message::new("system", prompts::SUMMARIZER_SYSTEM_PROMPT),
        Message::new("user", prompt),
    ];
    let summary = llm
        .complete(&config.model, &messages, 0.3, max_tokens)
        .await
        .map_err(|e| RecallError::Summarization(e.to_string()))?;
    let summary = summary.trim().to_string();
    if summary.is_empty() {
        return Err(RecallError::Summarization(
            "model returned an empty summary".to_string(),
        ));
    }
    Ok(summary)
}

/// Summarize long content by mapping over chunks and collapsing until the
/// combined summaries fit `token_max`.
pub async fn map_reduce_summarize(
    content: &str,
    config: &SummarizerConfig,
    llm: &LlmClient,
) -> Result<MapReduceResult> {
    let input_tokens = text::count_tokens(content, &config.model);

    let chunks = text::chunk(content, config.chunk_size, config.chunk_overlap, &config.model);
    tracing::info!("Map phase: processing {} chunks", chunks.len());
    let mut summaries = map_summarize(&chunks, config, llm).await?;

    let mut depth = 0;
    while total_tokens(&summaries, &config.model) > config.token_max {
        depth += 1;
        if depth > MAX_COLLAPSE_DEPTH {
            tracing::warn!(
                "Hit max collapse depth {MAX_COLLAPSE_DEPTH}, forcing final summary"
            );
            break;
        }
        tracing::info!(
            "Reduce phase (depth {depth}): collapsing {} summaries ({} tokens)",
            summaries.len(),
            total_tokens(&summaries, &config.model)
        );
        summaries = collapse_summaries(summaries, config, llm).await?;
    }

    let final_summary = if summaries.len() > 1 {
        synthesize(&summaries, config, llm).await?
    } else {
        summaries
            .into_iter()
            .next()
            .ok_or_else(|| RecallError::Summarization("map phase produced nothing".to_string()))?
    };

    let output_tokens = text::count_tokens(&final_summary, &config.model);
    Ok(MapReduceResult {
        summary: final_summary,
        input_tokens,
        output_tokens,
        compression_ratio: if input_tokens > 0 {
            output_tokens as f32 / input_tokens as f32
        } else {
            0.0
        },
        collapse_depth: depth,
    })
}

fn total_tokens(texts: &[String], model: &str) -> usize {
    texts.iter().map(|t| text::count_tokens(t, model)).sum()
}

/// Map phase: summarize each chunk in parallel, bounded by the semaphore.
async fn map_summarize(
    chunks: &[String],
    config: &SummarizerConfig,
    llm: &LlmClient,
) -> Result<Vec<String>> {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let total = chunks.len();

    let tasks = chunks.iter().enumerate().map(|(i, chunk)| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| RecallError::Summarization("semaphore closed".to_string()))?;
            let source_tokens = text::count_tokens(chunk, &config.model);
            let target = estimate_summary_tokens(source_tokens);
            let prompt =
                prompts::chunk_prompt(i, total, chunk, tokens_to_words(target));
            generate_summary(llm, config, prompt, (target + 50) as u32).await
        }
    });

    futures::future::try_join_all(tasks).await
}

/// Reduce phase: group consecutive summaries that together fit within
/// `token_max`, then synthesize each group in parallel.
async fn collapse_summaries(
    summaries: Vec<String>,
    config: &SummarizerConfig,
    llm: &LlmClient,
) -> Result<Vec<String>> {
    if summaries.len() <= 1 {
        return Ok(summaries);
    }

    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0;
    for summary in summaries {
        let tokens = text::count_tokens(&summary, &config.model);
        if current_tokens + tokens > config.token_max && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(summary);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
    let tasks = groups.iter().map(|group| {
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|_| RecallError::Summarization("semaphore closed".to_string()))?;
            synthesize(group, config, llm).await
        }
    });
    futures::future::try_join_all(tasks).await
}

/// Combine several summaries into one.
async fn synthesize(
    summaries: &[String],
    config: &SummarizerConfig,
    llm: &LlmClient,
) -> Result<String> {
    let combined_tokens = total_tokens(summaries, &config.model);
    let target = estimate_summary_tokens(combined_tokens);
    let prompt = prompts::meta_prompt(summaries, tokens_to_words(target));
    generate_summary(llm, config, prompt, (target + 100) as u32).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_summary_tokens_bounds() {
        assert_eq!(estimate_summary_tokens(100), 50);
        assert_eq!(estimate_summary_tokens(2000), 200);
        assert_eq!(estimate_summary_tokens(100_000), 500);
    }

    #[test]
    fn test_tokens_to_words() {
        assert_eq!(tokens_to_words(100), 75);
        assert_eq!(tokens_to_words(0), 0);
    }
}
