//! LLM-driven memory reconciliation
//!
//! Extracts candidate facts from the user's message, asks a second agent to
//! decide ADD/UPDATE/DELETE/NONE against existing memories, and converts
//! the decisions into store mutations. Transient LLM failures degrade
//! gracefully; a safeguard re-adds new facts whenever the decisions would
//! otherwise leave them lost.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::llm::LlmClient;
use crate::memory::entities::{Fact, SummaryKind};
use crate::memory::store::MemoryStore;
use crate::types::Message;

/// Existing memories presented to the decision agent, at most this many.
const MAX_EXISTING_FOR_RECONCILE: usize = 20;
/// Candidates fetched per new fact when gathering existing memories.
const EXISTING_PER_FACT: usize = 5;

pub const FACT_SYSTEM_PROMPT: &str = r#"You are a memory extractor. From the latest exchange, return 1-3 concise fact sentences based ONLY on user messages.

Guidelines:
- If there is no meaningful fact, return [].
- Ignore assistant/system content completely.
- Facts must be short, readable sentences (e.g., "The user's wife is Anne.", "Planning a trip to Japan next spring.").
- Do not return acknowledgements, questions, or meta statements; only factual statements from the user.
- NEVER output refusals like "I cannot..." or "I don't know...". If you can't extract a fact, return [].
- Return a JSON list of strings.

Few-shots:
- Input: User: "Hi." / Assistant: "Hello" -> []
- Input: User: "My wife is Anne." / Assistant: "Got it." -> ["The user's wife is Anne."]
- Input: User: "I like biking on weekends." / Assistant: "Cool!" -> ["User likes biking on weekends."]"#;

pub const UPDATE_MEMORY_PROMPT: &str = r#"You are a smart memory manager. For each new fact, decide: ADD, UPDATE an existing memory, or skip if duplicate.

Operations:
1. **ADD**: The new fact is unrelated to all existing memories -> add it as new.
2. **UPDATE**: The new fact refines/corrects an existing memory -> replace the old with the new.
3. **DELETE**: The new fact explicitly contradicts an existing memory -> delete the old, then ADD the new.
4. **NONE**: The new fact is an exact duplicate of an existing memory -> skip it.

**Critical Rule**: Every new fact MUST result in either ADD or UPDATE (unless it's an exact duplicate).
If a new fact is unrelated to existing memories, use ADD. Do NOT use NONE for unrelated facts.

Schema:
- ADD:    {"event": "ADD", "text": "the new fact text"}
- UPDATE: {"event": "UPDATE", "id": <int>, "text": "the new fact text"}
- DELETE: {"event": "DELETE", "id": <int>}
- NONE:   {"event": "NONE"} (only for exact duplicates)

Key: Only use UPDATE if the facts are about THE SAME TOPIC. Different topics = ADD.

Output a JSON list of decisions only. No prose or code fences."#;

pub const SUMMARY_PROMPT: &str = "You are a concise conversation summarizer. Update the running summary with the new facts.\nKeep it brief, factual, and focused on durable information; do not restate transient chit-chat.\nPrefer aggregating related facts into compact statements; drop redundancies.";

/// Decision event kinds emitted by the reconciliation agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionEvent {
    Add,
    Update,
    Delete,
    None,
}

/// One reconciliation decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDecision {
    pub event: DecisionEvent,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
}

/// The mutations derived from a decision list
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub to_add: Vec<Fact>,
    pub to_delete: Vec<String>,
    /// old id -> new id, used to annotate tombstones
    pub replacement_map: HashMap<String, String>,
}

/// Extract 1-3 candidate facts from the user message only. Transient LLM
/// failures and unparseable output degrade to an empty list.
pub async fn extract_salient_facts(
    llm: &LlmClient,
    model: &str,
    user_message: Option<&str>,
) -> Vec<String> {
    let Some(transcript) = user_message.filter(|m| !m.trim().is_empty()) else {
        return vec![];
    };
    let messages = vec![
        Message::new("system", FACT_SYSTEM_PROMPT),
        Message::new("user", transcript),
    ];
    match llm
        .complete_json::<Vec<String>>(model, &messages, 0.0, 200)
        .await
    {
        Ok(facts) => facts
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect(),
        Err(e) => {
            tracing::warn!("Fact extraction failed, skipping this turn: {e}");
            vec![]
        }
    }
}

fn add_all(
    new_facts: &[String],
    conversation_id: &str,
    source_id: &str,
    created_at: DateTime<Utc>,
) -> ReconcileOutcome {
    ReconcileOutcome {
        to_add: new_facts
            .iter()
            .filter(|f| !f.trim().is_empty())
            .map(|f| Fact::new(conversation_id, f.trim(), source_id, created_at))
            .collect(),
        ..Default::default()
    }
}

/// Convert agent decisions into actionable changes. `id_map` translates the
/// positional ids shown to the agent back into store ids.
pub fn apply_decisions(
    decisions: &[MemoryDecision],
    id_map: &HashMap<i64, String>,
    new_facts: &[String],
    conversation_id: &str,
    source_id: &str,
    created_at: DateTime<Utc>,
) -> ReconcileOutcome {
    let mut outcome = ReconcileOutcome::default();

    for decision in decisions {
        match decision.event {
            DecisionEvent::Add => {
                if let Some(text) = decision.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
                {
                    outcome
                        .to_add
                        .push(Fact::new(conversation_id, text, source_id, created_at));
                }
            }
            DecisionEvent::Update => {
                let Some(original) = decision.id.and_then(|id| id_map.get(&id)) else {
                    continue;
                };
                let Some(text) =
                    decision.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
                else {
                    continue;
                };
                let replacement = Fact::new(conversation_id, text, source_id, created_at);
                outcome.to_delete.push(original.clone());
                outcome
                    .replacement_map
                    .insert(original.clone(), replacement.id.clone());
                outcome.to_add.push(replacement);
            }
            DecisionEvent::Delete => {
                if let Some(original) = decision.id.and_then(|id| id_map.get(&id)) {
                    outcome.to_delete.push(original.clone());
                }
            }
            DecisionEvent::None => {}
        }
    }

    // Safeguard: if the agent returned nothing or only DELETEs, the new
    // facts would be lost and the store could end up empty. Retain them.
    let has_keep_action = decisions.iter().any(|d| {
        matches!(
            d.event,
            DecisionEvent::Add | DecisionEvent::Update | DecisionEvent::None
        )
    });
    if !has_keep_action && !new_facts.is_empty() {
        tracing::info!("Reconcile produced no additions/keeps; retaining new facts");
        outcome.to_add = add_all(new_facts, conversation_id, source_id, created_at).to_add;
    }

    outcome
}

/// Gather existing memory facts relevant to the new facts, deduplicated,
/// capped at `MAX_EXISTING_FOR_RECONCILE`.
async fn gather_existing(
    store: &MemoryStore,
    conversation_id: &str,
    new_facts: &[String],
) -> Result<Vec<(String, String)>> {
    let mut seen = std::collections::HashSet::new();
    let mut existing = Vec::new();
    for fact in new_facts {
        for memory in store
            .query_memories(conversation_id, fact, EXISTING_PER_FACT)
            .await?
        {
            if memory.metadata.role != crate::memory::entities::MemoryRole::Memory {
                continue;
            }
            if seen.insert(memory.id.clone()) {
                existing.push((memory.id, memory.content));
            }
            if existing.len() >= MAX_EXISTING_FOR_RECONCILE {
                return Ok(existing);
            }
        }
    }
    Ok(existing)
}

/// Decide add/update/delete/none for the new facts against existing
/// memories. Agent failures fall back to adding all new facts.
pub async fn reconcile_facts(
    store: &MemoryStore,
    llm: &LlmClient,
    model: &str,
    conversation_id: &str,
    new_facts: &[String],
    source_id: &str,
    created_at: DateTime<Utc>,
) -> Result<ReconcileOutcome> {
    if new_facts.is_empty() {
        return Ok(ReconcileOutcome::default());
    }

    let existing = gather_existing(store, conversation_id, new_facts).await?;
    if existing.is_empty() {
        tracing::info!("No existing memory facts; adding all new facts");
        return Ok(add_all(new_facts, conversation_id, source_id, created_at));
    }

    let id_map: HashMap<i64, String> = existing
        .iter()
        .enumerate()
        .map(|(idx, (id, _))| (idx as i64, id.clone()))
        .collect();
    let existing_json: Vec<serde_json::Value> = existing
        .iter()
        .enumerate()
        .map(|(idx, (_, text))| serde_json::json!({"id": idx.to_string(), "text": text}))
        .collect();
    let payload = serde_json::to_string_pretty(&serde_json::json!({
        "existing": existing_json,
        "new_facts": new_facts,
    }))?;

    let messages = vec![
        Message::new("system", UPDATE_MEMORY_PROMPT),
        Message::new("user", payload),
    ];
    let decisions = match llm
        .complete_json::<Vec<MemoryDecision>>(model, &messages, 0.0, 512)
        .await
    {
        Ok(decisions) => decisions,
        Err(e) => {
            tracing::warn!("Memory decision agent failed; adding all new facts: {e}");
            return Ok(add_all(new_facts, conversation_id, source_id, created_at));
        }
    };

    tracing::debug!("Reconcile decisions: {:?}", decisions);
    Ok(apply_decisions(
        &decisions,
        &id_map,
        new_facts,
        conversation_id,
        source_id,
        created_at,
    ))
}

/// Update one rolling summary from the new facts. Returns None when there
/// is nothing to change.
pub async fn update_summary(
    llm: &LlmClient,
    model: &str,
    prior_summary: Option<&str>,
    new_facts: &[String],
    kind: SummaryKind,
) -> Result<Option<String>> {
    if new_facts.is_empty() {
        return Ok(None);
    }
    let mut parts = Vec::new();
    if let Some(prior) = prior_summary {
        parts.push(format!("Previous summary:\n{prior}"));
    }
    let bullets: Vec<String> = new_facts.iter().map(|f| format!("- {f}")).collect();
    parts.push(format!("New facts:\n{}", bullets.join("\n")));

    let messages = vec![
        Message::new("system", SUMMARY_PROMPT),
        Message::new("user", parts.join("\n\n")),
    ];
    let summary = llm
        .complete(model, &messages, 0.2, kind.max_tokens())
        .await?;
    let summary = summary.trim();
    if summary.is_empty() {
        Ok(prior_summary.map(String::from))
    } else {
        Ok(Some(summary.to_string()))
    }
}
