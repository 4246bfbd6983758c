//! File persistence layer for memory entries
//!
//! Each entry is a Markdown file with YAML frontmatter holding all metadata,
//! laid out as `entries/<conv-slug>/<role-subdir>/<timestamp>_<id>.md`.
//! Soft deletion moves files into a parallel `entries/deleted/` tree and
//! records an optional `replaced_by` id. A `snapshot.json` mirrors
//! `{id -> path, metadata, content}` for O(1) lookup and is rewritten on
//! every mutation; it can be rebuilt from the tree after a crash.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};
use crate::memory::entities::MemoryMetadata;

const ENTRIES_DIRNAME: &str = "entries";
const DELETED_DIRNAME: &str = "deleted";
const SNAPSHOT_FILENAME: &str = "snapshot.json";

/// Frontmatter block of a memory file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FrontMatter {
    id: String,
    #[serde(flatten)]
    metadata: MemoryMetadata,
}

/// A memory entry as persisted on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    /// Path relative to the store root
    pub path: PathBuf,
    pub metadata: MemoryMetadata,
    pub content: String,
}

/// File-backed memory store rooted at `memory_root`
pub struct MemoryFileStore {
    root: PathBuf,
    /// Per-conversation locks serializing entry mutations
    conversation_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Guards snapshot.json rewrites
    snapshot_lock: Mutex<()>,
}

/// File/id safe token preserving readability.
pub fn slugify(value: &str) -> String {
    let safe: String = value
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '-' | '.' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if safe.is_empty() {
        "entry".to_string()
    } else {
        safe
    }
}

/// Write content to `path` atomically (temp file + rename).
pub fn atomic_write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl MemoryFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join(ENTRIES_DIRNAME))?;
        Ok(Self {
            root,
            conversation_locks: DashMap::new(),
            snapshot_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.conversation_locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn entries_dir(&self) -> PathBuf {
        self.root.join(ENTRIES_DIRNAME)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.root.join(SNAPSHOT_FILENAME)
    }

    /// Write a new entry file and update the snapshot.
    pub fn write_entry(
        &self,
        doc_id: &str,
        content: &str,
        metadata: &MemoryMetadata,
    ) -> Result<FileRecord> {
        let lock = self.conversation_lock(&metadata.conversation_id);
        let _guard = lock.lock();

        let timestamp = metadata
            .created_at
            .replace([':', '.'], "-")
            .replace('+', "_");
        let filename = format!("{}_{}.md", timestamp, slugify(doc_id));
        let relative = PathBuf::from(ENTRIES_DIRNAME)
            .join(slugify(&metadata.conversation_id))
            .join(metadata.subdir())
            .join(filename);

        let rendered = render_entry(doc_id, metadata, content);
        atomic_write(&self.root.join(&relative), &rendered)?;

        let record = FileRecord {
            id: doc_id.to_string(),
            path: relative,
            metadata: metadata.clone(),
            content: content.to_string(),
        };
        self.update_snapshot(|snapshot| {
            snapshot.insert(record.id.clone(), record.clone());
        })?;
        Ok(record)
    }

    /// Soft-delete entries by id: move the files under the deleted tree,
    /// annotate `replaced_by` from the replacement map, drop them from the
    /// snapshot. Missing ids are skipped. Returns the ids actually removed.
    pub fn soft_delete(
        &self,
        conversation_id: &str,
        ids: &[String],
        replacement_map: &HashMap<String, String>,
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(vec![]);
        }
        let lock = self.conversation_lock(conversation_id);
        let _guard = lock.lock();

        let snapshot = self.load_snapshot()?;
        let mut removed = Vec::new();

        for id in ids {
            let record = match snapshot.get(id) {
                Some(record) => record.clone(),
                None => match self.find_on_disk(conversation_id, id)? {
                    Some(record) => record,
                    None => continue,
                },
            };
            self.move_to_deleted(&record, replacement_map.get(id).map(String::as_str))?;
            removed.push(id.clone());
        }

        if !removed.is_empty() {
            self.update_snapshot(|snapshot| {
                for id in &removed {
                    snapshot.remove(id);
                }
            })?;
        }
        Ok(removed)
    }

    fn move_to_deleted(&self, record: &FileRecord, replaced_by: Option<&str>) -> Result<()> {
        // entries/<rest> -> entries/deleted/<rest>, structure preserved.
        let rest = record
            .path
            .strip_prefix(ENTRIES_DIRNAME)
            .map_err(|_| RecallError::Internal(format!("bad entry path: {:?}", record.path)))?;
        let deleted_relative = PathBuf::from(ENTRIES_DIRNAME).join(DELETED_DIRNAME).join(rest);

        let mut metadata = record.metadata.clone();
        metadata.replaced_by = replaced_by.map(String::from);
        let rendered = render_entry(&record.id, &metadata, &record.content);
        atomic_write(&self.root.join(&deleted_relative), &rendered)?;

        let original = self.root.join(&record.path);
        if original.exists() {
            std::fs::remove_file(original)?;
        }
        Ok(())
    }

    /// O(1) lookup by id via the snapshot.
    pub fn get(&self, id: &str) -> Result<Option<FileRecord>> {
        Ok(self.load_snapshot()?.get(id).cloned())
    }

    /// Load the snapshot, rebuilding from the tree when missing or corrupt.
    pub fn load_snapshot(&self) -> Result<HashMap<String, FileRecord>> {
        let path = self.snapshot_path();
        if path.exists() {
            let text = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&text) {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) => {
                    tracing::warn!("Corrupt snapshot, rebuilding from tree: {e}");
                }
            }
        }
        self.rebuild_snapshot()
    }

    /// Rebuild the snapshot by walking the entries tree (deleted excluded)
    /// and rewrite it.
    pub fn rebuild_snapshot(&self) -> Result<HashMap<String, FileRecord>> {
        let mut snapshot = HashMap::new();
        let entries_dir = self.entries_dir();
        if entries_dir.exists() {
            let mut stack = vec![entries_dir.clone()];
            while let Some(dir) = stack.pop() {
                for entry in std::fs::read_dir(&dir)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        if path.file_name().and_then(|n| n.to_str()) == Some(DELETED_DIRNAME) {
                            continue;
                        }
                        stack.push(path);
                    } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                        if let Some(record) = self.read_entry_file(&path)? {
                            snapshot.insert(record.id.clone(), record);
                        }
                    }
                }
            }
        }
        self.write_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    /// Parse an entry file back into a record. Returns None on files that
    /// are not valid frontmatter entries.
    pub fn read_entry_file(&self, path: &Path) -> Result<Option<FileRecord>> {
        let text = std::fs::read_to_string(path)?;
        let Some((front, content)) = split_frontmatter(&text) else {
            return Ok(None);
        };
        let front: FrontMatter = match serde_yaml::from_str(front) {
            Ok(front) => front,
            Err(e) => {
                tracing::warn!("Unparseable frontmatter in {}: {e}", path.display());
                return Ok(None);
            }
        };
        let relative = path
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf());
        Ok(Some(FileRecord {
            id: front.id,
            path: relative,
            metadata: front.metadata,
            content: content.to_string(),
        }))
    }

    fn find_on_disk(&self, conversation_id: &str, id: &str) -> Result<Option<FileRecord>> {
        let conv_dir = self.entries_dir().join(slugify(conversation_id));
        if !conv_dir.exists() {
            return Ok(None);
        }
        let mut stack = vec![conv_dir];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
                    if let Some(record) = self.read_entry_file(&path)? {
                        if record.id == id {
                            return Ok(Some(record));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn update_snapshot(
        &self,
        mutate: impl FnOnce(&mut HashMap<String, FileRecord>),
    ) -> Result<()> {
        let _guard = self.snapshot_lock.lock();
        let mut snapshot = self.load_snapshot()?;
        mutate(&mut snapshot);
        self.write_snapshot(&snapshot)
    }

    fn write_snapshot(&self, snapshot: &HashMap<String, FileRecord>) -> Result<()> {
        let text = serde_json::to_string_pretty(snapshot)?;
        atomic_write(&self.snapshot_path(), &text)
    }
}

/// Render an entry as Markdown with YAML frontmatter.
fn render_entry(id: &str, metadata: &MemoryMetadata, content: &str) -> String {
    let front = FrontMatter {
        id: id.to_string(),
        metadata: metadata.clone(),
    };
    let yaml = serde_yaml::to_string(&front).unwrap_or_default();
    format!("---\n{yaml}---\n\n{content}\n")
}

/// Split "---\nyaml\n---\ncontent" into (yaml, content).
fn split_frontmatter(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix("---")?;
    let end = rest.find("---")?;
    let front = &rest[..end];
    let content = rest[end + 3..].trim();
    Some((front, content))
}
