//! Watched-folder document indexing
//!
//! Startup reconciliation plus incremental reindexing: files are hashed,
//! chunked, and upserted into the docs collection; catalog paths that no
//! longer exist on disk are removed. On-disk content is the source of
//! truth; the vector store is repaired to match it.

mod watcher;

pub use watcher::spawn_watcher;
pub use watcher::DocWatcher;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use crate::error::{RecallError, Result};
use crate::store::{Collection, WhereClause};
use crate::text;
use crate::types::DocMetadata;

/// Plain-text suffixes the indexer reads directly. Binary formats
/// (PDF/DOCX) are handled by external collaborators, not the core.
const TEXT_SUFFIXES: &[&str] = &[
    "txt", "md", "json", "py", "js", "ts", "yaml", "yml", "rs", "go", "c", "cpp", "h", "sh",
    "toml", "rst", "ini", "cfg",
];

/// Chunking configuration for document ingestion
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Target token count per chunk
    pub chunk_size: usize,
    /// Token overlap between consecutive chunks
    pub overlap: usize,
    /// Model used for token counting
    pub token_model: String,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            overlap: 64,
            token_model: "gpt-4".to_string(),
        }
    }
}

/// Outcome of a full scan
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub indexed: Vec<String>,
    pub removed: Vec<String>,
    pub files_seen: usize,
}

/// Aggregated catalog entry for one indexed file
#[derive(Debug, Clone, serde::Serialize)]
pub struct CatalogFile {
    pub name: String,
    pub path: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub chunks: usize,
    pub indexed_at: String,
}

/// Watched-folder indexer over the docs collection
pub struct Indexer {
    collection: Collection,
    docs_folder: PathBuf,
    config: IndexConfig,
    /// relative path -> file hash, mirrored from store metadata
    hashes: RwLock<HashMap<String, String>>,
    /// Paths currently being processed; coalesces duplicate watcher events
    in_flight: Mutex<HashSet<PathBuf>>,
}

/// Hidden or editor-temp files are never indexed.
pub fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| name.starts_with('.') || name.ends_with('~'))
        .unwrap_or(true)
}

fn file_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn load_document_text(path: &Path) -> Option<String> {
    let suffix = path.extension()?.to_str()?.to_lowercase();
    if !TEXT_SUFFIXES.contains(&suffix.as_str()) {
        return None;
    }
    let bytes = std::fs::read(path).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

impl Indexer {
    pub fn new(collection: Collection, docs_folder: PathBuf, config: IndexConfig) -> Self {
        Self {
            collection,
            docs_folder,
            config,
            hashes: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn docs_folder(&self) -> &Path {
        &self.docs_folder
    }

    pub fn count(&self) -> Result<i64> {
        self.collection.count()
    }

    /// Mark a path in-flight. Returns false when it is already being
    /// processed (the duplicate event is dropped).
    pub fn begin(&self, path: &Path) -> bool {
        self.in_flight.lock().insert(path.to_path_buf())
    }

    pub fn finish(&self, path: &Path) {
        self.in_flight.lock().remove(path);
    }

    fn relative_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.docs_folder)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| {
                path.file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
    }

    /// Rebuild the hash catalog from existing store metadata.
    pub fn load_catalog(&self) -> Result<usize> {
        let mut hashes = HashMap::new();
        for doc in self.collection.get(None)? {
            let path = doc.metadata.get("file_path").and_then(|v| v.as_str());
            let hash = doc.metadata.get("file_hash").and_then(|v| v.as_str());
            if let (Some(path), Some(hash)) = (path, hash) {
                hashes.insert(path.to_string(), hash.to_string());
            }
        }
        let count = hashes.len();
        *self.hashes.write() = hashes;
        Ok(count)
    }

    /// Index or reindex a single file. Returns true when the file was
    /// (re)indexed, false when unchanged, unsupported, or missing.
    pub async fn index_file(&self, path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        let bytes = std::fs::read(path)
            .map_err(|e| RecallError::Ingestion(format!("read {}: {e}", path.display())))?;
        let current_hash = file_hash(&bytes);
        let relative = self.relative_path(path);

        if self.hashes.read().get(&relative) == Some(&current_hash) {
            return Ok(false);
        }

        // Full replacement: drop any existing chunks before inserting.
        self.remove_path(&relative)?;

        let Some(text_content) = load_document_text(path) else {
            return Ok(false);
        };
        if text_content.trim().is_empty() {
            return Ok(false);
        }

        let chunks = text::chunk(
            &text_content,
            self.config.chunk_size,
            self.config.overlap,
            &self.config.token_model,
        );
        if chunks.is_empty() {
            return Ok(false);
        }

        let indexed_at = Utc::now().to_rfc3339();
        let total = chunks.len() as i64;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_type = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();

        let mut ids = Vec::with_capacity(chunks.len());
        let mut metadatas = Vec::with_capacity(chunks.len());
        for (i, _) in chunks.iter().enumerate() {
            ids.push(format!("{relative}:chunk:{i}"));
            metadatas.push(
                serde_json::to_value(DocMetadata {
                    source: source.clone(),
                    file_path: relative.clone(),
                    file_type: file_type.clone(),
                    chunk_id: i as i64,
                    total_chunks: total,
                    indexed_at: indexed_at.clone(),
                    file_hash: current_hash.clone(),
                })
                .unwrap_or(serde_json::Value::Null),
            );
        }

        self.collection.upsert(&ids, &chunks, &metadatas).await?;
        self.hashes.write().insert(relative, current_hash);
        tracing::info!("Indexed {}: {} chunks", source, total);
        Ok(true)
    }

    /// Remove all chunks for a file. Returns true when chunks were deleted.
    pub fn remove_file(&self, path: &Path) -> Result<bool> {
        let relative = self.relative_path(path);
        let removed = self.remove_path(&relative)?;
        if removed > 0 {
            tracing::info!("Removed {} chunks for {}", removed, relative);
        }
        Ok(removed > 0)
    }

    fn remove_path(&self, relative: &str) -> Result<usize> {
        let removed = self
            .collection
            .delete_where(&WhereClause::eq("file_path", relative))?;
        self.hashes.write().remove(relative);
        Ok(removed)
    }

    /// Index all existing files and remove catalog entries whose files have
    /// disappeared. Per-file failures are logged and skipped; the scan
    /// always completes.
    pub async fn initial_index(&self) -> Result<IndexReport> {
        tracing::info!("Scanning {}", self.docs_folder.display());
        let paths_in_catalog: HashSet<String> = self.hashes.read().keys().cloned().collect();
        let mut found_on_disk: HashSet<String> = HashSet::new();
        let mut report = IndexReport::default();

        for path in walk_files(&self.docs_folder)? {
            if is_hidden(&path) {
                continue;
            }
            report.files_seen += 1;
            found_on_disk.insert(self.relative_path(&path));
            match self.index_file(&path).await {
                Ok(true) => report.indexed.push(self.relative_path(&path)),
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Failed to index {}: {e}", path.display());
                }
            }
        }

        // Anything in the catalog but not on disk was deleted offline.
        for stale in paths_in_catalog.difference(&found_on_disk) {
            match self.remove_path(stale) {
                Ok(n) if n > 0 => report.removed.push(stale.clone()),
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Failed to remove stale entry {stale}: {e}");
                }
            }
        }

        tracing::info!(
            "Scan complete: {} files seen, {} indexed, {} removed",
            report.files_seen,
            report.indexed.len(),
            report.removed.len()
        );
        Ok(report)
    }

    /// Aggregate the catalog for the `/files` endpoint.
    pub fn catalog(&self) -> Result<Vec<CatalogFile>> {
        let mut files: HashMap<String, CatalogFile> = HashMap::new();
        for doc in self.collection.get(None)? {
            let Some(path) = doc
                .metadata
                .get("file_path")
                .and_then(|v| v.as_str())
                .map(String::from)
            else {
                continue;
            };
            let entry = files.entry(path.clone()).or_insert_with(|| CatalogFile {
                name: doc
                    .metadata
                    .get("source")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                path,
                file_type: doc
                    .metadata
                    .get("file_type")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                chunks: 0,
                indexed_at: doc
                    .metadata
                    .get("indexed_at")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
            entry.chunks += 1;
        }
        let mut out: Vec<CatalogFile> = files.into_values().collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }
}

fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}
