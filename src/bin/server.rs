//! Recall proxy server
//!
//! Run with: recall-server --openai-base-url http://localhost:8080/v1

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recall::embedding::create_embedder;
use recall::files::MemoryFileStore;
use recall::index::{spawn_watcher, IndexConfig, Indexer};
use recall::llm::LlmClient;
use recall::memory::long_conversation::{LongConversationConfig, LongConversationStore};
use recall::memory::{MemoryConfig, MemoryEngine, MemoryStore};
use recall::retrieval::{LexicalReranker, Reranker};
use recall::server::{router, AppState};
use recall::store::VectorStore;
use recall::types::{EmbeddingConfig, RetrievalConfig, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "recall-server")]
#[command(about = "OpenAI-compatible chat proxy with document RAG and long-term memory")]
struct Args {
    /// Upstream OpenAI-compatible base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "http://localhost:8080/v1")]
    openai_base_url: String,

    /// API key forwarded to the upstream chat endpoint
    #[arg(long, env = "OPENAI_API_KEY")]
    chat_api_key: Option<String>,

    /// API key for the embedding backend
    #[arg(long, env = "RECALL_EMBEDDING_API_KEY")]
    embedding_api_key: Option<String>,

    /// Embedding backend (openai, hash)
    #[arg(long, env = "RECALL_EMBEDDING_BACKEND", default_value = "hash")]
    embedding_backend: String,

    /// Embedding model name for the HTTP backend
    #[arg(long, env = "RECALL_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    /// Embedding endpoint base URL
    #[arg(long, env = "RECALL_EMBEDDING_BASE_URL", default_value = "https://api.openai.com/v1")]
    embedding_base_url: String,

    /// Folder watched for documents
    #[arg(long, env = "RECALL_DOCS_FOLDER", default_value = "./rag_docs")]
    docs_folder: PathBuf,

    /// Root directory for memory files
    #[arg(long, env = "RECALL_MEMORY_ROOT", default_value = "./memory")]
    memory_root: PathBuf,

    /// Vector store persistence directory
    #[arg(long, env = "RECALL_STORE_PATH", default_value = "./recall_db")]
    store_path: PathBuf,

    /// Document chunks / memory entries retrieved per query
    #[arg(long, default_value = "5")]
    default_top_k: i64,

    /// Maintain rolling conversation summaries
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    enable_summarization: bool,

    /// Evict oldest entries past this many per conversation
    #[arg(long, default_value = "500")]
    max_entries: usize,

    /// Blended scores below this are dropped
    #[arg(long, default_value = "0.0")]
    score_threshold: f32,

    /// MMR relevance/diversity trade-off
    #[arg(long, default_value = "0.7")]
    mmr_lambda: f32,

    /// Weight for tag-overlap boosts
    #[arg(long, default_value = "0.1")]
    tag_boost: f32,

    /// Enable long-conversation context mode
    #[arg(long)]
    long_conversation: bool,

    /// Compress once usage crosses this fraction of the target
    #[arg(long, default_value = "0.8")]
    compress_threshold: f32,

    /// Newest tokens never compressed
    #[arg(long, default_value = "40000")]
    raw_recent_tokens: usize,

    /// Target context window size in tokens
    #[arg(long, default_value = "150000")]
    target_context_tokens: usize,

    /// Host to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind
    #[arg(long, default_value = "8000")]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "recall=info,recall_server=info,tower_http=warn".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let retrieval = RetrievalConfig {
        mmr_lambda: args.mmr_lambda,
        tag_boost: args.tag_boost,
        score_threshold: args.score_threshold,
        include_global: true,
    };
    let config = ServerConfig {
        openai_base_url: args.openai_base_url.trim_end_matches('/').to_string(),
        chat_api_key: args.chat_api_key.clone(),
        embedding: EmbeddingConfig {
            backend: args.embedding_backend.clone(),
            model: args.embedding_model.clone(),
            base_url: args.embedding_base_url.clone(),
            api_key: args.embedding_api_key.clone(),
            dimensions: 384,
        },
        default_top_k: args.default_top_k,
        enable_summarization: args.enable_summarization,
        max_entries: args.max_entries,
        retrieval: retrieval.clone(),
        long_conversation: args.long_conversation,
        compress_threshold: args.compress_threshold,
        raw_recent_tokens: args.raw_recent_tokens,
        target_context_tokens: args.target_context_tokens,
        docs_folder: args.docs_folder.clone(),
        memory_root: args.memory_root.clone(),
        store_path: args.store_path.clone(),
        host: args.host.clone(),
        port: args.port,
    };

    std::fs::create_dir_all(&config.docs_folder).context("creating docs folder")?;

    let embedder = create_embedder(&config.embedding).context("creating embedder")?;
    let store =
        VectorStore::open(&config.store_path, embedder).context("opening vector store")?;
    let docs = store.collection("docs");

    let files =
        Arc::new(MemoryFileStore::new(&config.memory_root).context("opening memory root")?);
    let memory_store = MemoryStore::new(store.collection("memory"), files);
    let reranker: Arc<dyn Reranker> = Arc::new(LexicalReranker::new());
    let llm = LlmClient::new(&config.openai_base_url, config.chat_api_key.clone());
    let memory = Arc::new(MemoryEngine::new(
        memory_store,
        llm,
        reranker.clone(),
        MemoryConfig {
            default_memory_id: "default".to_string(),
            default_top_k: config.default_top_k,
            enable_summarization: config.enable_summarization,
            max_entries: config.max_entries,
            retrieval,
        },
    ));

    let indexer = Arc::new(Indexer::new(
        docs.clone(),
        config.docs_folder.clone(),
        IndexConfig::default(),
    ));
    let known = indexer.load_catalog().context("loading catalog")?;
    tracing::info!("Loaded catalog with {known} files");

    let long_config = LongConversationConfig {
        target_context_tokens: config.target_context_tokens,
        compress_threshold: config.compress_threshold,
        raw_recent_tokens: config.raw_recent_tokens,
        ..Default::default()
    };
    let long_store = Arc::new(LongConversationStore::new(&config.memory_root));

    let state = Arc::new(AppState::new(
        config.clone(),
        docs,
        Arc::clone(&indexer),
        memory,
        long_store,
        long_config,
        reranker,
    ));

    // Initial scan runs in the background so the server comes up fast.
    {
        let indexer = Arc::clone(&indexer);
        state.tracker.spawn(async move {
            if let Err(e) = indexer.initial_index().await {
                tracing::error!("Initial index failed: {e}");
            }
        });
    }
    let watcher = spawn_watcher(Arc::clone(&indexer)).context("starting watcher")?;

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!("Recall proxy v{} listening on {addr}", recall::VERSION);
    tracing::info!("  docs: {}", config.docs_folder.display());
    tracing::info!("  memory: {}", config.memory_root.display());
    tracing::info!("  upstream: {}", config.openai_base_url);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let app = router(Arc::clone(&state));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    watcher.shutdown();
    state.graceful_shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
