//! Proxy gateway
//!
//! The HTTP surface: an OpenAI-compatible chat-completions endpoint that
//! orchestrates retrieval -> forward -> post-write, plus catalog and
//! health endpoints. Post-response work (fact extraction, summaries,
//! segment append, eviction) runs in tracked background tasks serialized
//! per conversation; shutdown awaits them with a bounded timeout.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::{RecallError, Result};
use crate::index::Indexer;
use crate::llm::LlmClient;
use crate::memory::long_conversation::{
    self, LongConversationConfig, LongConversationStore,
};
use crate::memory::MemoryEngine;
use crate::proxy::{self, SseContentAccumulator};
use crate::retrieval::{retrieve_docs, DocRetrieval, Reranker};
use crate::store::Collection;
use crate::types::{ChatRequest, Message, ServerConfig};

/// Bounded wait for tracked background tasks at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const RAG_SYSTEM_TEMPLATE: &str = "You are a helpful assistant with access to documentation.\n\n\
## Instructions\n\
- Use the retrieved context ONLY if it's relevant to the question\n\
- If the context is irrelevant, ignore it and answer based on your knowledge (or say you don't know)\n\
- When using context, cite sources: [Source: filename]\n\n\
## Retrieved Context\n\
The following was automatically retrieved based on the user's query. It may or may not be relevant:\n\n";

/// Shared gateway state
pub struct AppState {
    pub config: ServerConfig,
    pub docs: Collection,
    pub indexer: Arc<Indexer>,
    pub memory: Arc<MemoryEngine>,
    pub long_store: Arc<LongConversationStore>,
    pub long_config: LongConversationConfig,
    pub reranker: Arc<dyn Reranker>,
    pub upstream: reqwest::Client,
    pub llm: LlmClient,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
    conversation_queues: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ServerConfig,
        docs: Collection,
        indexer: Arc<Indexer>,
        memory: Arc<MemoryEngine>,
        long_store: Arc<LongConversationStore>,
        long_config: LongConversationConfig,
        reranker: Arc<dyn Reranker>,
    ) -> Self {
        let llm = LlmClient::new(&config.openai_base_url, config.chat_api_key.clone());
        Self {
            config,
            docs,
            indexer,
            memory,
            long_store,
            long_config,
            reranker,
            upstream: proxy::upstream_client(),
            llm,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            conversation_queues: DashMap::new(),
        }
    }

    /// Per-conversation queue lock serializing memory mutations.
    fn conversation_queue(&self, conversation_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.conversation_queues
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Await tracked background tasks, then cancel stragglers.
    pub async fn graceful_shutdown(&self) {
        self.tracker.close();
        if tokio::time::timeout(SHUTDOWN_GRACE, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!("Background tasks still running at shutdown; cancelling");
            self.shutdown.cancel();
            self.tracker.wait().await;
        }
    }
}

/// Build the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/reindex", post(reindex))
        .route("/files", get(list_files))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// OpenAI-shaped error body carrying the mapped status.
pub struct ApiError(RecallError);

impl From<RecallError> for ApiError {
    fn from(err: RecallError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        // Upstream failures pass their body through verbatim when it is
        // already JSON; anything else is wrapped in an OpenAI error shape.
        let body = match &self.0 {
            RecallError::Upstream { body, .. } => serde_json::from_str(body)
                .unwrap_or_else(|_| openai_error_body(body)),
            other => openai_error_body(&other.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

fn openai_error_body(message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"message": message, "type": "proxy_error"}})
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "docs_folder": state.config.docs_folder.display().to_string(),
        "memory_root": state.config.memory_root.display().to_string(),
        "openai_base_url": state.config.openai_base_url,
        "default_top_k": state.config.default_top_k,
    }))
}

async fn list_files(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let files = state.indexer.catalog()?;
    let total = files.len();
    Ok(Json(serde_json::json!({"files": files, "total": total})))
}

async fn reindex(
    State(state): State<Arc<AppState>>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    let indexer = Arc::clone(&state.indexer);
    state.tracker.spawn(async move {
        if let Err(e) = indexer.initial_index().await {
            tracing::error!("Reindex failed: {e}");
        }
    });
    let total_chunks = state.indexer.count()?;
    Ok(Json(
        serde_json::json!({"status": "started reindexing", "total_chunks": total_chunks}),
    ))
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<serde_json::Value>,
) -> std::result::Result<Response, ApiError> {
    let request: ChatRequest = serde_json::from_value(raw)
        .map_err(|e| RecallError::InvalidInput(format!("malformed request: {e}")))?;
    if request.messages.is_empty() {
        return Err(RecallError::InvalidInput("messages must not be empty".to_string()).into());
    }

    // 1. Document retrieval. Failures degrade to no context.
    let rag_retrieval = gather_rag_context(&state, &request).await;

    // 2. Memory retrieval + augmentation. Failures degrade likewise.
    let (mut augmented, memory_retrieval, conversation_id) =
        match state.memory.augment(&request).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Memory retrieval degraded to no context: {e}");
                let conversation_id = request
                    .memory_id
                    .clone()
                    .unwrap_or_else(|| state.memory.config().default_memory_id.clone());
                (request.clone(), None, conversation_id)
            }
        };

    if let Some(retrieval) = &rag_retrieval {
        let system = format!("{RAG_SYSTEM_TEMPLATE}{}", retrieval.context);
        augmented.messages.insert(0, Message::new("system", system));
    }

    // 3. Long-conversation context: replace history with the token-budgeted
    // view over the segment log.
    if state.config.long_conversation {
        if let Some(user_message) = augmented.last_user_message().map(String::from) {
            match state.long_store.load(&conversation_id) {
                Ok(conversation) => {
                    let system_prompt = augmented
                        .messages
                        .iter()
                        .find(|m| m.role == "system")
                        .map(|m| m.content.clone());
                    augmented.messages = long_conversation::build_context(
                        &conversation,
                        &user_message,
                        state.long_config.target_context_tokens,
                        system_prompt.as_deref(),
                        &state.long_config.model,
                    );
                }
                Err(e) => {
                    tracing::warn!("Long-conversation context unavailable: {e}");
                }
            }
        }
    }

    let user_message = request.last_user_message().map(String::from);
    let payload = augmented.to_forward_payload();

    if request.is_streaming() {
        return stream_response(state, payload, conversation_id, user_message, request.model).await;
    }

    // 4. Forward and annotate.
    let mut response = proxy::forward_json(
        &state.upstream,
        &state.config.openai_base_url,
        state.config.chat_api_key.as_deref(),
        &payload,
    )
    .await?;

    let assistant_message = proxy::extract_assistant_content(&response);
    if let Some(obj) = response.as_object_mut() {
        if let Some(retrieval) = &rag_retrieval {
            obj.insert(
                "rag_sources".to_string(),
                serde_json::to_value(&retrieval.sources).unwrap_or_default(),
            );
        }
        if let Some(memory) = &memory_retrieval {
            obj.insert(
                "memory_hits".to_string(),
                serde_json::to_value(&memory.entries).unwrap_or_default(),
            );
        }
    }

    // 5. Fire-and-forget post-write, tracked for shutdown.
    spawn_post_processing(
        &state,
        conversation_id,
        user_message,
        assistant_message,
        request.model,
    );

    Ok(Json(response).into_response())
}

async fn gather_rag_context(
    state: &Arc<AppState>,
    request: &ChatRequest,
) -> Option<DocRetrieval> {
    let top_k = request.rag_top_k.unwrap_or(state.config.default_top_k);
    if top_k <= 0 {
        if request.rag_top_k.is_some() {
            tracing::info!("RAG retrieval disabled for this request (top_k={top_k})");
        }
        return None;
    }
    let query = request.last_user_message()?;
    match retrieve_docs(
        &state.docs,
        state.reranker.as_ref(),
        query,
        top_k as usize,
        &state.config.retrieval,
    )
    .await
    {
        Ok(retrieval) => retrieval,
        Err(e) => {
            tracing::warn!("Document retrieval degraded to no context: {e}");
            None
        }
    }
}

/// Byte-for-byte SSE passthrough. Assistant deltas are accumulated on the
/// side so the memory write path can run once the stream closes; nothing
/// is injected into the stream itself.
async fn stream_response(
    state: Arc<AppState>,
    payload: serde_json::Value,
    conversation_id: String,
    user_message: Option<String>,
    model: String,
) -> std::result::Result<Response, ApiError> {
    let upstream = proxy::forward_stream(
        &state.upstream,
        &state.config.openai_base_url,
        state.config.chat_api_key.as_deref(),
        &payload,
    )
    .await;

    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            // A single error frame, then close.
            tracing::error!("Streaming upstream failed: {e}");
            let frame = match e {
                RecallError::Upstream { body, .. } => proxy::sse_error_frame(&body),
                other => proxy::sse_error_frame(&other.to_string()),
            };
            return Ok(sse_response(Body::from(frame)));
        }
    };

    struct StreamCtx {
        inner: futures::stream::BoxStream<'static, reqwest::Result<Bytes>>,
        accumulator: SseContentAccumulator,
        state: Arc<AppState>,
        conversation_id: String,
        user_message: Option<String>,
        model: String,
        done: bool,
    }

    let ctx = StreamCtx {
        inner: upstream.bytes_stream().boxed(),
        accumulator: SseContentAccumulator::new(),
        state,
        conversation_id,
        user_message,
        model,
        done: false,
    };

    let stream = futures::stream::unfold(ctx, |mut ctx| async move {
        if ctx.done {
            return None;
        }
        match ctx.inner.next().await {
            Some(Ok(bytes)) => {
                ctx.accumulator.feed(&bytes);
                Some((Ok::<Bytes, std::convert::Infallible>(bytes), ctx))
            }
            Some(Err(e)) => {
                tracing::error!("Streaming error: {e}");
                ctx.done = true;
                let frame = Bytes::from(proxy::sse_error_frame(&e.to_string()));
                Some((Ok(frame), ctx))
            }
            None => {
                // Stream closed normally: schedule the post-write.
                let assistant = ctx.accumulator.content().map(String::from);
                spawn_post_processing(
                    &ctx.state,
                    ctx.conversation_id.clone(),
                    ctx.user_message.clone(),
                    assistant,
                    ctx.model.clone(),
                );
                None
            }
        }
    });

    Ok(sse_response(Body::from_stream(stream)))
}

fn sse_response(body: Body) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Schedule the post-response write path on the tracker, serialized per
/// conversation. Memory errors are logged and retried on the next turn.
fn spawn_post_processing(
    state: &Arc<AppState>,
    conversation_id: String,
    user_message: Option<String>,
    assistant_message: Option<String>,
    model: String,
) {
    if state.tracker.is_closed() {
        tracing::warn!("Shutdown in progress; skipping post-processing");
        return;
    }
    let state = Arc::clone(state);
    state.tracker.clone().spawn(async move {
        let cancelled = state.shutdown.clone();
        let work = async {
            let queue = state.conversation_queue(&conversation_id);
            let _serialized = queue.lock().await;

            if let Err(e) = append_segments(
                &state,
                &conversation_id,
                user_message.as_deref(),
                assistant_message.as_deref(),
            )
            .await
            {
                tracing::warn!("Segment append failed for {conversation_id}: {e}");
            }

            if let Err(e) = state
                .memory
                .post_process(
                    &conversation_id,
                    user_message.as_deref(),
                    assistant_message.as_deref(),
                    &model,
                )
                .await
            {
                tracing::warn!("Memory post-processing failed for {conversation_id}: {e}");
            }
        };
        tokio::select! {
            _ = cancelled.cancelled() => {
                tracing::warn!("Post-processing cancelled at shutdown");
            }
            _ = work => {}
        }
    });
}

/// Append the turn's segments to the long-conversation log, deduplicating
/// repeated pastes, and compress when over threshold.
async fn append_segments(
    state: &Arc<AppState>,
    conversation_id: &str,
    user_message: Option<&str>,
    assistant_message: Option<&str>,
) -> Result<()> {
    let mut conversation = state.long_store.load(conversation_id)?;

    if let Some(content) = user_message.filter(|c| !c.trim().is_empty()) {
        let segment =
            long_conversation::make_user_segment(&conversation, content, &state.long_config);
        state
            .long_store
            .append(&mut conversation, segment, &state.long_config)?;
    }
    if let Some(content) = assistant_message.filter(|c| !c.trim().is_empty()) {
        let segment =
            long_conversation::create_segment("assistant", content, &state.long_config.model);
        state
            .long_store
            .append(&mut conversation, segment, &state.long_config)?;
    }

    if long_conversation::should_compress(&conversation, &state.long_config) {
        state
            .long_store
            .compress(&mut conversation, &state.long_config, &state.llm)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedder;
    use crate::files::MemoryFileStore;
    use crate::index::IndexConfig;
    use crate::llm::LlmClient;
    use crate::memory::{MemoryConfig, MemoryStore};
    use crate::retrieval::LexicalReranker;
    use crate::store::VectorStore;
    use tower::ServiceExt;

    fn test_state(upstream_url: &str, docs_dir: &std::path::Path, memory_dir: &std::path::Path) -> Arc<AppState> {
        let vector = VectorStore::open_in_memory(Arc::new(HashEmbedder::new(128))).unwrap();
        let docs = vector.collection("docs");
        let files = Arc::new(MemoryFileStore::new(memory_dir).unwrap());
        let memory_store = MemoryStore::new(vector.collection("memory"), files);
        let reranker: Arc<dyn Reranker> = Arc::new(LexicalReranker::new());
        let llm = LlmClient::new(upstream_url, None);
        let memory = Arc::new(MemoryEngine::new(
            memory_store,
            llm,
            Arc::clone(&reranker),
            MemoryConfig::default(),
        ));
        let indexer = Arc::new(Indexer::new(
            docs.clone(),
            docs_dir.to_path_buf(),
            IndexConfig::default(),
        ));
        let config = ServerConfig {
            openai_base_url: upstream_url.to_string(),
            docs_folder: docs_dir.to_path_buf(),
            memory_root: memory_dir.to_path_buf(),
            ..Default::default()
        };
        Arc::new(AppState::new(
            config,
            docs,
            indexer,
            memory,
            Arc::new(LongConversationStore::new(memory_dir)),
            LongConversationConfig::default(),
            reranker,
        ))
    }

    /// Minimal OpenAI-compatible stub upstream for gateway tests.
    async fn spawn_stub_upstream() -> String {
        use axum::routing::post as axum_post;

        async fn completions(Json(body): Json<serde_json::Value>) -> Json<serde_json::Value> {
            // Echo the received messages back so tests can inspect what
            // the gateway forwarded.
            Json(serde_json::json!({
                "id": "chatcmpl-stub",
                "object": "chat.completion",
                "model": body["model"],
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "stub reply"},
                    "finish_reason": "stop"
                }],
                "echo": body["messages"],
            }))
        }

        let app = Router::new().route("/v1/chat/completions", axum_post(completions));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        format!("http://{addr}/v1")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let docs = tempfile::tempdir().unwrap();
        let memory = tempfile::tempdir().unwrap();
        let state = test_state("http://127.0.0.1:1/v1", docs.path(), memory.path());
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_files_endpoint_empty() {
        let docs = tempfile::tempdir().unwrap();
        let memory = tempfile::tempdir().unwrap();
        let state = test_state("http://127.0.0.1:1/v1", docs.path(), memory.path());
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/files")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 0);
    }

    #[tokio::test]
    async fn test_chat_rejects_empty_messages() {
        let docs = tempfile::tempdir().unwrap();
        let memory = tempfile::tempdir().unwrap();
        let state = test_state("http://127.0.0.1:1/v1", docs.path(), memory.path());
        let app = router(state);

        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model": "m", "messages": []}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("messages"));
    }

    #[tokio::test]
    async fn test_chat_forwards_and_annotates_rag_sources() {
        let docs_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            docs_dir.path().join("secret.txt"),
            "The password is 'bananas'.",
        )
        .unwrap();
        let memory_dir = tempfile::tempdir().unwrap();

        let upstream = spawn_stub_upstream().await;
        let state = test_state(&upstream, docs_dir.path(), memory_dir.path());
        state.indexer.initial_index().await.unwrap();
        let app = router(Arc::clone(&state));

        let request_body = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "What is the secret password?"}]
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(request_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;

        // Upstream reply passes through, sources are attached, and the
        // forwarded request carried a system block with the chunk.
        assert_eq!(body["choices"][0]["message"]["content"], "stub reply");
        assert_eq!(body["rag_sources"][0]["path"], "secret.txt");
        let forwarded = body["echo"].as_array().unwrap();
        assert_eq!(forwarded[0]["role"], "system");
        assert!(forwarded[0]["content"]
            .as_str()
            .unwrap()
            .contains("[Source: secret.txt]"));
        assert!(forwarded[0]["content"].as_str().unwrap().contains("bananas"));

        state.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn test_rag_top_k_zero_passes_through_untouched() {
        let docs_dir = tempfile::tempdir().unwrap();
        std::fs::write(docs_dir.path().join("doc.txt"), "indexed content").unwrap();
        let memory_dir = tempfile::tempdir().unwrap();

        let upstream = spawn_stub_upstream().await;
        let state = test_state(&upstream, docs_dir.path(), memory_dir.path());
        state.indexer.initial_index().await.unwrap();
        let app = router(Arc::clone(&state));

        let request_body = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "indexed content question"}],
            "rag_top_k": 0,
            "memory_top_k": 0
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(request_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body.get("rag_sources").is_none());
        let forwarded = body["echo"].as_array().unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0]["content"], "indexed content question");

        state.graceful_shutdown().await;
    }

    #[tokio::test]
    async fn test_upstream_error_passes_status_through() {
        let docs_dir = tempfile::tempdir().unwrap();
        let memory_dir = tempfile::tempdir().unwrap();

        // Stub upstream that always fails with 418 and a JSON body.
        let app_stub = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    StatusCode::IM_A_TEAPOT,
                    Json(serde_json::json!({"error": {"message": "teapot refuses"}})),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app_stub).await.ok();
        });

        let state = test_state(&format!("http://{addr}/v1"), docs_dir.path(), memory_dir.path());
        let app = router(state);

        let request_body = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "memory_top_k": 0
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(request_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "teapot refuses");
    }

    #[tokio::test]
    async fn test_streaming_passthrough_preserves_frames() {
        let docs_dir = tempfile::tempdir().unwrap();
        let memory_dir = tempfile::tempdir().unwrap();

        // Stub upstream emitting three SSE frames then DONE.
        let frames = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"one \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"two \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"three\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        let app_stub = Router::new().route(
            "/v1/chat/completions",
            post(move || async move {
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    Body::from(frames),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app_stub).await.ok();
        });

        let state = test_state(&format!("http://{addr}/v1"), docs_dir.path(), memory_dir.path());
        let app = router(Arc::clone(&state));

        let request_body = serde_json::json!({
            "model": "m",
            "messages": [{"role": "user", "content": "stream please"}],
            "stream": true,
            "memory_top_k": 0
        });
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(request_body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        // Byte-for-byte passthrough: frames intact, in order, no
        // rag_sources injected mid-stream.
        assert_eq!(text, frames);
        assert!(!text.contains("rag_sources"));

        // The post-write ran after the stream closed: segments exist.
        state.graceful_shutdown().await;
        let conversation = state.long_store.load("default").unwrap();
        assert!(conversation.len() >= 1);
        assert!(conversation
            .segments()
            .iter()
            .any(|s| s.content.contains("stream please")));
    }
}
