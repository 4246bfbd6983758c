//! Adaptive summarization
//!
//! Strategy is selected by input length: very short content needs no
//! summary, short content gets a single sentence, and everything else goes
//! through map-reduce with dynamic collapse until the result fits the
//! token budget.

mod map_reduce;
pub mod prompts;

pub use map_reduce::{
    estimate_summary_tokens, generate_summary, map_reduce_summarize, tokens_to_words,
    MapReduceResult,
};
pub use prompts::ContentType;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::llm::LlmClient;
use crate::text;

/// Below this many tokens, no summary is needed.
pub const THRESHOLD_NONE: usize = 100;
/// Below this many tokens, a single sentence suffices.
pub const THRESHOLD_BRIEF: usize = 500;

/// Summary strategy based on input length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryLevel {
    /// < 100 tokens: no summary needed
    None,
    /// 100-500 tokens: single-sentence summary
    Brief,
    /// >= 500 tokens: map-reduce with dynamic collapse
    MapReduce,
}

/// Map token count to the appropriate level.
pub fn determine_level(token_count: usize) -> SummaryLevel {
    if token_count < THRESHOLD_NONE {
        SummaryLevel::None
    } else if token_count < THRESHOLD_BRIEF {
        SummaryLevel::Brief
    } else {
        SummaryLevel::MapReduce
    }
}

/// Configuration for summarization operations
#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub model: String,
    /// Target token count per map-phase chunk
    pub chunk_size: usize,
    /// Collapse until combined summaries fit this budget
    pub token_max: usize,
    /// Token overlap between map-phase chunks
    pub chunk_overlap: usize,
    /// Parallelism bound for map and reduce calls
    pub max_concurrent: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4".to_string(),
            chunk_size: 2048,
            token_max: 3000,
            chunk_overlap: 200,
            max_concurrent: 5,
        }
    }
}

/// Result of summarization with compression metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryResult {
    pub level: SummaryLevel,
    /// None for the NONE level
    pub summary: Option<String>,
    pub input_tokens: usize,
    pub output_tokens: usize,
    /// output / input; lower means more compression
    pub compression_ratio: f32,
    /// Reduce iterations needed (0 = no collapse)
    pub collapse_depth: usize,
    pub created_at: DateTime<Utc>,
}

impl SummaryResult {
    fn none(input_tokens: usize) -> Self {
        Self {
            level: SummaryLevel::None,
            summary: None,
            input_tokens,
            output_tokens: 0,
            compression_ratio: 0.0,
            collapse_depth: 0,
            created_at: Utc::now(),
        }
    }
}

/// Summarize content with a strategy adapted to its length.
///
/// `prior_summary` provides continuity context for content-aware prompts;
/// BRIEF ignores the content type by design of the prompt set.
pub async fn summarize(
    content: &str,
    config: &SummarizerConfig,
    llm: &LlmClient,
    prior_summary: Option<&str>,
    content_type: ContentType,
) -> Result<SummaryResult> {
    if content.trim().is_empty() {
        return Ok(SummaryResult::none(0));
    }

    let input_tokens = text::count_tokens(content, &config.model);
    let level = determine_level(input_tokens);
    tracing::info!(
        "Summarizing {} tokens at level {:?} (type={:?})",
        input_tokens,
        level,
        content_type
    );

    match level {
        SummaryLevel::None => Ok(SummaryResult::none(input_tokens)),
        SummaryLevel::Brief => {
            let prompt = prompts::brief_prompt(content);
            let summary = generate_summary(llm, config, prompt, 50).await?;
            let output_tokens = text::count_tokens(&summary, &config.model);
            Ok(SummaryResult {
                level,
                summary: Some(summary),
                input_tokens,
                output_tokens,
                compression_ratio: output_tokens as f32 / input_tokens as f32,
                collapse_depth: 0,
                created_at: Utc::now(),
            })
        }
        SummaryLevel::MapReduce => {
            // Single-chunk inputs skip the map phase and use the
            // content-type prompt directly.
            if input_tokens <= config.token_max {
                let target = estimate_summary_tokens(input_tokens);
                let prompt = prompts::content_prompt(
                    content_type,
                    content,
                    prior_summary,
                    tokens_to_words(target),
                );
                let summary = generate_summary(llm, config, prompt, (target + 50) as u32).await?;
                let output_tokens = text::count_tokens(&summary, &config.model);
                return Ok(SummaryResult {
                    level,
                    summary: Some(summary),
                    input_tokens,
                    output_tokens,
                    compression_ratio: output_tokens as f32 / input_tokens as f32,
                    collapse_depth: 0,
                    created_at: Utc::now(),
                });
            }

            let result = map_reduce_summarize(content, config, llm).await?;
            Ok(SummaryResult {
                level,
                summary: Some(result.summary),
                input_tokens: result.input_tokens,
                output_tokens: result.output_tokens,
                compression_ratio: result.compression_ratio,
                collapse_depth: result.collapse_depth,
                created_at: Utc::now(),
            })
        }
    }
}
