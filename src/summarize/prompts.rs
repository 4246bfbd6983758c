//! Prompt templates for adaptive summarization
//!
//! Written for mid-size instruct models; structured, factual output with
//! explicit word budgets.

/// Content categories that alter the summarization instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    #[default]
    General,
    Conversation,
    Journal,
    Document,
}

impl ContentType {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "conversation" => ContentType::Conversation,
            "journal" => ContentType::Journal,
            "document" => ContentType::Document,
            _ => ContentType::General,
        }
    }
}

/// BRIEF level - single sentence for short content (100-500 tokens).
pub fn brief_prompt(content: &str) -> String {
    format!(
        "Summarize the following in ONE sentence (maximum 20 words).\n\
         Focus on the single most important point or takeaway.\n\n\
         Content:\n{content}\n\nOne-sentence summary:"
    )
}

/// Map phase - summarize one section of a longer document.
pub fn chunk_prompt(chunk_index: usize, total_chunks: usize, content: &str, max_words: usize) -> String {
    format!(
        "Summarize this section of a longer document.\n\
         Capture the main points while preserving important details.\n\n\
         Section {index} of {total}:\n{content}\n\n\
         Summary of this section (maximum {max_words} words):",
        index = chunk_index + 1,
        total = total_chunks,
    )
}

/// Reduce phase - combine several summaries into one.
pub fn meta_prompt(summaries: &[String], max_words: usize) -> String {
    let formatted: Vec<String> = summaries
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[Section {}]\n{}", i + 1, s))
        .collect();
    format!(
        "Synthesize these summaries into a single coherent overview.\n\
         Identify common themes and key points across all sections.\n\
         Eliminate redundancy while preserving unique insights.\n\n\
         Summaries to combine:\n{}\n\n\
         Combined summary (maximum {max_words} words):",
        formatted.join("\n\n"),
    )
}

/// Content-type aware prompt for single-chunk summarization.
pub fn content_prompt(
    content_type: ContentType,
    content: &str,
    prior_summary: Option<&str>,
    max_words: usize,
) -> String {
    let prior_context = match prior_summary {
        Some(prior) => format!("Prior context (for continuity):\n{prior}\n"),
        None => String::new(),
    };
    let focus = match content_type {
        ContentType::General => {
            "Focus on:\n\
             - Key facts, decisions, and outcomes\n\
             - Important context that should be remembered\n\
             - Skip transient details, greetings, and chitchat"
        }
        ContentType::Conversation => {
            "Summarize this conversation from the AI assistant's perspective.\n\
             Focus on:\n\
             - What the user wanted or asked about\n\
             - Key information the user shared about themselves\n\
             - Decisions made or conclusions reached\n\
             - Any commitments or follow-ups mentioned"
        }
        ContentType::Journal => {
            "Summarize this personal entry or reflection.\n\
             Preserve:\n\
             - Key events and experiences mentioned\n\
             - Emotions and insights expressed\n\
             - Goals, plans, or intentions stated\n\
             - People, places, or things that are important"
        }
        ContentType::Document => {
            "Summarize this technical content or documentation.\n\
             Focus on:\n\
             - Main concepts and their relationships\n\
             - Key procedures or processes described\n\
             - Important specifications or requirements\n\
             - Conclusions or recommendations"
        }
    };
    format!(
        "Summarize the following content concisely in a short paragraph.\n\n\
         {focus}\n\n{prior_context}\n\
         Content to summarize:\n{content}\n\n\
         Summary (maximum {max_words} words):"
    )
}

/// System prompt for every summarization call.
pub const SUMMARIZER_SYSTEM_PROMPT: &str =
    "You are a concise summarizer. Output only the summary, no preamble.";
