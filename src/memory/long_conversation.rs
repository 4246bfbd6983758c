//! Long-conversation mode: chronological context with asymmetric compression
//!
//! Maintains an append-only, per-conversation segment log persisted as
//! frontmatter Markdown files. Context is built newest-first under a token
//! budget. When total tokens cross the compression threshold, older
//! segments are summarized: assistant turns aggressively (bullet points,
//! ~20% target), user turns gently (~70% target, code and quotes
//! preserved). Repeated large pastes are deduplicated into reference
//! segments pointing at the original.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{RecallError, Result};
use crate::files::atomic_write;
use crate::llm::LlmClient;
use crate::retrieval::token_jaccard;
use crate::summarize::{ContentType, SummarizerConfig};
use crate::text;
use crate::types::Message;

const LONG_CONVO_DIR: &str = "long_conversations";
const SEGMENTS_DIR: &str = "segments";
const METADATA_FILE: &str = "metadata.json";

/// Minimum chunk length considered for reference deduplication.
const MIN_DEDUP_CHARS: usize = 200;

/// Compression state of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    Raw,
    Summarized,
    Reference,
}

/// A single turn in a long conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: String,
    /// "user", "assistant" or "system"
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Token count of the original content
    pub original_tokens: usize,
    /// Token count after compression
    pub current_tokens: usize,
    pub state: SegmentState,
    /// Summarized version of the content, for summarized segments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Id of the original segment this one references
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refers_to: Option<String>,
    /// Compact diff against the referenced segment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    /// Content fingerprint for deduplication
    pub content_hash: String,
}

impl Segment {
    /// The text this segment contributes to a built context.
    pub fn context_content(&self) -> &str {
        match self.state {
            SegmentState::Summarized => self.summary.as_deref().unwrap_or(&self.content),
            _ => &self.content,
        }
    }
}

/// Per-role compression behavior
#[derive(Debug, Clone, Copy)]
pub struct RoleCompression {
    /// Keep at least this many recent turns of the role raw
    pub recent_turns: usize,
    /// Compress to roughly this fraction of the original
    pub target_ratio: f32,
}

/// Long-conversation tuning knobs
#[derive(Debug, Clone)]
pub struct LongConversationConfig {
    pub target_context_tokens: usize,
    /// Start compressing at this fraction of the target
    pub compress_threshold: f32,
    /// Newest tokens that are never compressed
    pub raw_recent_tokens: usize,
    /// Token-Jaccard similarity above which a paste is deduplicated
    pub dedup_threshold: f32,
    /// Model used for token accounting and compression prompts
    pub model: String,
    pub user: RoleCompression,
    pub assistant: RoleCompression,
}

impl Default for LongConversationConfig {
    fn default() -> Self {
        Self {
            target_context_tokens: 150_000,
            compress_threshold: 0.8,
            raw_recent_tokens: 40_000,
            dedup_threshold: 0.7,
            model: "gpt-4".to_string(),
            user: RoleCompression {
                recent_turns: 20,
                target_ratio: 0.7,
            },
            assistant: RoleCompression {
                recent_turns: 10,
                target_ratio: 0.2,
            },
        }
    }
}

impl LongConversationConfig {
    fn role_compression(&self, role: &str) -> RoleCompression {
        if role == "user" {
            self.user
        } else {
            self.assistant
        }
    }
}

/// Full conversation state: a contiguous, append-only segment arena with
/// id and content-hash side maps for reference lookup.
#[derive(Debug)]
pub struct LongConversation {
    pub id: String,
    segments: Vec<Segment>,
    id_index: HashMap<String, usize>,
    hash_index: HashMap<String, usize>,
    pub current_total_tokens: usize,
}

impl LongConversation {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            segments: Vec::new(),
            id_index: HashMap::new(),
            hash_index: HashMap::new(),
            current_total_tokens: 0,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segment_by_id(&self, id: &str) -> Option<&Segment> {
        self.id_index.get(id).map(|&i| &self.segments[i])
    }

    /// Ordinal (1-based) of a segment, as used in reference markers.
    pub fn ordinal_of(&self, id: &str) -> Option<usize> {
        self.id_index.get(id).map(|&i| i + 1)
    }

    fn push(&mut self, segment: Segment) -> usize {
        let index = self.segments.len();
        self.id_index.insert(segment.id.clone(), index);
        // First occurrence wins: references should point at the original.
        self.hash_index
            .entry(segment.content_hash.clone())
            .or_insert(index);
        self.current_total_tokens += segment.current_tokens;
        self.segments.push(segment);
        index
    }

    /// Indices of segments protected from compression: the newest
    /// `raw_recent_tokens` worth, plus the most recent turns of each role.
    fn protected_indices(&self, config: &LongConversationConfig) -> Vec<bool> {
        let mut protected = vec![false; self.segments.len()];

        let mut token_count = 0;
        for (i, segment) in self.segments.iter().enumerate().rev() {
            token_count += segment.current_tokens;
            protected[i] = true;
            if token_count > config.raw_recent_tokens {
                break;
            }
        }

        for role in ["user", "assistant"] {
            let keep = config.role_compression(role).recent_turns;
            let mut seen = 0;
            for (i, segment) in self.segments.iter().enumerate().rev() {
                if segment.role == role {
                    protected[i] = true;
                    seen += 1;
                    if seen >= keep {
                        break;
                    }
                }
            }
        }

        protected
    }
}

fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Create a raw segment from content.
pub fn create_segment(role: &str, content: &str, model: &str) -> Segment {
    let tokens = text::count_tokens(content, model);
    Segment {
        id: Uuid::new_v4().to_string(),
        role: role.to_string(),
        content: content.to_string(),
        timestamp: Utc::now(),
        original_tokens: tokens,
        current_tokens: tokens,
        state: SegmentState::Raw,
        summary: None,
        refers_to: None,
        diff: None,
        content_hash: content_hash(content),
    }
}

/// Lines present in `new` but not in `reference`, capped for compactness.
fn compact_diff(new: &str, reference: &str) -> Option<String> {
    let reference_lines: std::collections::HashSet<&str> =
        reference.lines().map(str::trim).collect();
    let added: Vec<String> = new
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !reference_lines.contains(line))
        .take(20)
        .map(|line| format!("+ {line}"))
        .collect();
    if added.is_empty() {
        None
    } else {
        Some(added.join("\n"))
    }
}

/// Detect whether `content` repeats a prior segment: any blank-line chunk
/// of at least `MIN_DEDUP_CHARS` chars with token-Jaccard similarity at or
/// above the threshold. Returns the referenced segment's id.
fn detect_reference(
    conversation: &LongConversation,
    content: &str,
    config: &LongConversationConfig,
) -> Option<String> {
    // Exact repeat of a large paste: hash lookup. Short messages repeat
    // naturally and stay raw.
    if content.len() >= MIN_DEDUP_CHARS {
        if let Some(&index) = conversation.hash_index.get(&content_hash(content)) {
            return Some(conversation.segments[index].id.clone());
        }
    }

    let chunks: Vec<&str> = content
        .split("\n\n")
        .map(str::trim)
        .filter(|c| c.len() >= MIN_DEDUP_CHARS)
        .collect();
    if chunks.is_empty() {
        return None;
    }

    for segment in conversation.segments.iter().rev() {
        if segment.state == SegmentState::Reference {
            continue;
        }
        for chunk in &chunks {
            if token_jaccard(chunk, &segment.content) >= config.dedup_threshold {
                return Some(segment.id.clone());
            }
        }
    }
    None
}

/// Build a user segment, deduplicating repeated pastes into a reference
/// segment with a compact marker and optional diff.
pub fn make_user_segment(
    conversation: &LongConversation,
    content: &str,
    config: &LongConversationConfig,
) -> Segment {
    let Some(refers_to) = detect_reference(conversation, content, config) else {
        return create_segment("user", content, &config.model);
    };

    let ordinal = conversation.ordinal_of(&refers_to).unwrap_or(0);
    let referenced = conversation
        .segment_by_id(&refers_to)
        .map(|s| s.content.clone())
        .unwrap_or_default();
    let diff = compact_diff(content, &referenced);

    let marker = match &diff {
        Some(diff) => format!("[Similar to segment {ordinal}]\nChanges:\n{diff}"),
        None => format!("[Similar to segment {ordinal}]"),
    };
    let original_tokens = text::count_tokens(content, &config.model);
    let current_tokens = text::count_tokens(&marker, &config.model);

    Segment {
        id: Uuid::new_v4().to_string(),
        role: "user".to_string(),
        content: marker,
        timestamp: Utc::now(),
        original_tokens,
        current_tokens,
        state: SegmentState::Reference,
        summary: None,
        refers_to: Some(refers_to),
        diff,
        content_hash: content_hash(content),
    }
}

/// Build the outbound message list under `token_budget`: system prompt and
/// the new user message always included, history filled newest-first but
/// emitted in chronological order.
pub fn build_context(
    conversation: &LongConversation,
    new_message: &str,
    token_budget: usize,
    system_prompt: Option<&str>,
    model: &str,
) -> Vec<Message> {
    let mut messages = Vec::new();
    let mut reserved = text::count_tokens(new_message, model);
    if let Some(system) = system_prompt {
        reserved += text::count_tokens(system, model);
        messages.push(Message::new("system", system));
    }

    let available = token_budget.saturating_sub(reserved);
    let mut history: Vec<&Segment> = Vec::new();
    let mut used = 0;
    for segment in conversation.segments.iter().rev() {
        if used + segment.current_tokens > available {
            break;
        }
        history.push(segment);
        used += segment.current_tokens;
    }

    for segment in history.into_iter().rev() {
        messages.push(Message::new(segment.role.clone(), segment.context_content()));
    }
    messages.push(Message::new("user", new_message));
    messages
}

/// Whether the conversation has crossed its compression threshold.
pub fn should_compress(
    conversation: &LongConversation,
    config: &LongConversationConfig,
) -> bool {
    if config.target_context_tokens == 0 {
        return false;
    }
    let usage = conversation.current_total_tokens as f32 / config.target_context_tokens as f32;
    usage >= config.compress_threshold
}

/// Select segment indices to compress: raw, non-system, outside the
/// protected window; assistant turns first, then oldest first. When a
/// target reduction is given, stops once the estimated savings reach it.
pub fn select_segments_to_compress(
    conversation: &LongConversation,
    config: &LongConversationConfig,
    target_reduction: Option<usize>,
) -> Vec<usize> {
    let protected = conversation.protected_indices(config);
    let mut candidates: Vec<usize> = conversation
        .segments
        .iter()
        .enumerate()
        .filter(|(i, seg)| {
            seg.state == SegmentState::Raw && seg.role != "system" && !protected[*i]
        })
        .map(|(i, _)| i)
        .collect();

    candidates.sort_by_key(|&i| {
        let seg = &conversation.segments[i];
        (seg.role == "user", seg.timestamp)
    });

    if let Some(target) = target_reduction {
        let mut selected = Vec::new();
        let mut savings = 0;
        for i in candidates {
            let seg = &conversation.segments[i];
            let ratio = config.role_compression(&seg.role).target_ratio;
            savings += (seg.current_tokens as f32 * (1.0 - ratio)) as usize;
            selected.push(i);
            if savings >= target {
                break;
            }
        }
        return selected;
    }
    candidates
}

fn user_summarize_prompt(target_ratio: f32, content: &str) -> String {
    format!(
        "Summarize the following user message concisely while:\n\
         - Preserving ALL code blocks exactly as-is (do not modify or summarize code)\n\
         - Preserving direct quotes and specific requests\n\
         - Keeping technical details and requirements\n\
         - Maintaining the user's intent\n\n\
         Target length: approximately {:.0}% of original.\n\n\
         User message:\n{content}\n\nSummary:",
        target_ratio * 100.0
    )
}

fn assistant_summarize_prompt(target_ratio: f32, content: &str) -> String {
    format!(
        "Summarize the following assistant response aggressively to bullet points:\n\
         - Keep only key decisions (\"I decided to...\", \"I'll use...\")\n\
         - Keep only final conclusions and answers\n\
         - Remove explanations, elaborations, and filler\n\
         - Preserve any code that was provided\n\n\
         Target length: approximately {:.0}% of original.\n\n\
         Assistant response:\n{content}\n\nSummary:",
        target_ratio * 100.0
    )
}

/// Summarize one segment with the role-appropriate prompt. Segments too
/// large for a single completion go through map-reduce first.
async fn summarize_segment(
    segment: &Segment,
    config: &LongConversationConfig,
    llm: &LlmClient,
) -> Result<String> {
    let summarizer = SummarizerConfig {
        model: config.model.clone(),
        ..Default::default()
    };
    if segment.current_tokens > summarizer.token_max {
        let result = crate::summarize::summarize(
            &segment.content,
            &summarizer,
            llm,
            None,
            ContentType::Conversation,
        )
        .await?;
        if let Some(summary) = result.summary {
            return Ok(summary);
        }
    }

    let compression = config.role_compression(&segment.role);
    let prompt = if segment.role == "user" {
        user_summarize_prompt(compression.target_ratio, &segment.content)
    } else {
        assistant_summarize_prompt(compression.target_ratio, &segment.content)
    };
    let max_tokens =
        ((segment.current_tokens as f32 * compression.target_ratio) as u32 + 64).max(64);
    let summary = llm
        .complete(
            &config.model,
            &[Message::new("user", prompt)],
            0.3,
            max_tokens,
        )
        .await?;
    let summary = summary.trim().to_string();
    if summary.is_empty() {
        return Err(RecallError::Summarization(
            "segment summary came back empty".to_string(),
        ));
    }
    Ok(summary)
}

/// File-backed store for long-conversation segment logs
pub struct LongConversationStore {
    memory_root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ConversationMetadata {
    id: String,
    target_context_tokens: usize,
    current_total_tokens: usize,
    compress_threshold: f32,
    raw_recent_tokens: usize,
    segment_count: usize,
}

impl LongConversationStore {
    pub fn new(memory_root: impl Into<PathBuf>) -> Self {
        Self {
            memory_root: memory_root.into(),
        }
    }

    fn conversation_dir(&self, conversation_id: &str) -> PathBuf {
        self.memory_root.join(LONG_CONVO_DIR).join(conversation_id)
    }

    fn segments_dir(&self, conversation_id: &str) -> PathBuf {
        self.conversation_dir(conversation_id).join(SEGMENTS_DIR)
    }

    fn segment_filename(segment: &Segment, index: usize) -> String {
        format!(
            "{:06}_{}_{}.md",
            index,
            segment.role,
            segment.timestamp.format("%Y%m%d-%H%M%S")
        )
    }

    /// Persist one segment (1-based index keeps filenames chronological).
    pub fn save_segment(
        &self,
        conversation_id: &str,
        segment: &Segment,
        index: usize,
    ) -> Result<PathBuf> {
        let path = self
            .segments_dir(conversation_id)
            .join(Self::segment_filename(segment, index));
        atomic_write(&path, &render_segment(segment))?;
        Ok(path)
    }

    /// Load all segments, sorted by filename (chronological order).
    pub fn load_segments(&self, conversation_id: &str) -> Result<Vec<Segment>> {
        let dir = self.segments_dir(conversation_id);
        if !dir.exists() {
            return Ok(vec![]);
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("md"))
            .collect();
        paths.sort();

        let mut segments = Vec::new();
        for path in paths {
            match parse_segment(&path) {
                Ok(Some(segment)) => segments.push(segment),
                Ok(None) => tracing::warn!("Skipping malformed segment file: {}", path.display()),
                Err(e) => tracing::warn!("Failed to read segment {}: {e}", path.display()),
            }
        }
        Ok(segments)
    }

    pub fn save_metadata(
        &self,
        conversation: &LongConversation,
        config: &LongConversationConfig,
    ) -> Result<()> {
        let metadata = ConversationMetadata {
            id: conversation.id.clone(),
            target_context_tokens: config.target_context_tokens,
            current_total_tokens: conversation.current_total_tokens,
            compress_threshold: config.compress_threshold,
            raw_recent_tokens: config.raw_recent_tokens,
            segment_count: conversation.len(),
        };
        let path = self.conversation_dir(&conversation.id).join(METADATA_FILE);
        atomic_write(&path, &serde_json::to_string_pretty(&metadata)?)
    }

    /// Load a conversation from disk, or create a new one.
    pub fn load(&self, conversation_id: &str) -> Result<LongConversation> {
        let mut conversation = LongConversation::new(conversation_id);
        for segment in self.load_segments(conversation_id)? {
            conversation.push(segment);
        }
        Ok(conversation)
    }

    /// Append a segment and persist it plus the metadata.
    pub fn append(
        &self,
        conversation: &mut LongConversation,
        segment: Segment,
        config: &LongConversationConfig,
    ) -> Result<usize> {
        let index = conversation.push(segment);
        self.save_segment(
            &conversation.id,
            &conversation.segments[index],
            index + 1,
        )?;
        self.save_metadata(conversation, config)?;
        Ok(index)
    }

    /// Compress segments until enough tokens are freed to land back under
    /// the threshold. Per-segment failures are logged and skipped. Returns
    /// the number of tokens freed.
    pub async fn compress(
        &self,
        conversation: &mut LongConversation,
        config: &LongConversationConfig,
        llm: &LlmClient,
    ) -> Result<usize> {
        if !should_compress(conversation, config) {
            return Ok(0);
        }

        // Aim below the threshold with some headroom.
        let target_tokens = (config.target_context_tokens as f32
            * config.compress_threshold
            * 0.9) as usize;
        let tokens_to_free = conversation
            .current_total_tokens
            .saturating_sub(target_tokens);
        tracing::info!(
            "Conversation {} at {} tokens, freeing {}",
            conversation.id,
            conversation.current_total_tokens,
            tokens_to_free
        );

        let selected = select_segments_to_compress(conversation, config, Some(tokens_to_free));
        if selected.is_empty() {
            tracing::warn!("No segments available for compression");
            return Ok(0);
        }

        let mut freed = 0;
        for index in selected {
            let segment = conversation.segments[index].clone();
            let summary = match summarize_segment(&segment, config, llm).await {
                Ok(summary) => summary,
                Err(e) => {
                    tracing::warn!("Failed to compress segment {}: {e}", segment.id);
                    continue;
                }
            };
            let new_tokens = text::count_tokens(&summary, &config.model);
            if new_tokens >= segment.current_tokens {
                continue;
            }
            let saved = segment.current_tokens - new_tokens;

            {
                let segment = &mut conversation.segments[index];
                segment.summary = Some(summary);
                segment.current_tokens = new_tokens;
                segment.state = SegmentState::Summarized;
            }
            conversation.current_total_tokens -= saved;
            freed += saved;
            self.save_segment(&conversation.id, &conversation.segments[index], index + 1)?;

            if freed >= tokens_to_free {
                break;
            }
        }

        self.save_metadata(conversation, config)?;
        tracing::info!(
            "Compression freed {freed} tokens, conversation now at {}",
            conversation.current_total_tokens
        );
        Ok(freed)
    }
}

/// Frontmatter fields of a segment file (content is the body).
#[derive(Debug, Serialize, Deserialize)]
struct SegmentFrontMatter {
    id: String,
    role: String,
    timestamp: DateTime<Utc>,
    original_tokens: usize,
    current_tokens: usize,
    state: SegmentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refers_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    diff: Option<String>,
    #[serde(default)]
    content_hash: String,
}

fn render_segment(segment: &Segment) -> String {
    let front = SegmentFrontMatter {
        id: segment.id.clone(),
        role: segment.role.clone(),
        timestamp: segment.timestamp,
        original_tokens: segment.original_tokens,
        current_tokens: segment.current_tokens,
        state: segment.state,
        summary: segment.summary.clone(),
        refers_to: segment.refers_to.clone(),
        diff: segment.diff.clone(),
        content_hash: segment.content_hash.clone(),
    };
    let yaml = serde_yaml::to_string(&front).unwrap_or_default();
    format!("---\n{yaml}---\n\n{}\n", segment.content)
}

fn parse_segment(path: &Path) -> Result<Option<Segment>> {
    let raw = std::fs::read_to_string(path)?;
    let Some(rest) = raw.strip_prefix("---") else {
        return Ok(None);
    };
    let Some(end) = rest.find("---") else {
        return Ok(None);
    };
    let front: SegmentFrontMatter = match serde_yaml::from_str(&rest[..end]) {
        Ok(front) => front,
        Err(_) => return Ok(None),
    };
    let content = rest[end + 3..].trim().to_string();
    Ok(Some(Segment {
        id: front.id,
        role: front.role,
        content,
        timestamp: front.timestamp,
        original_tokens: front.original_tokens,
        current_tokens: front.current_tokens,
        state: front.state,
        summary: front.summary,
        refers_to: front.refers_to,
        diff: front.diff,
        content_hash: front.content_hash,
    }))
}
