//! Filesystem watcher feeding the indexer
//!
//! Events from `notify` are bridged onto the runtime through an unbounded
//! channel and dispatched to worker tasks. The indexer's in-flight set
//! coalesces duplicate events for the same path, and a short settle delay
//! lets in-progress writes finish before hashing. Errors are logged; the
//! watcher itself never stops on a per-file failure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{RecallError, Result};
use crate::index::{is_hidden, Indexer};

/// Delay after a modification event before reading the file.
const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Running watcher; dropping it stops event delivery.
pub struct DocWatcher {
    _watcher: RecommendedWatcher,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl DocWatcher {
    pub fn shutdown(self) {
        self.dispatcher.abort();
    }
}

/// Start watching the indexer's docs folder.
pub fn spawn_watcher(indexer: Arc<Indexer>) -> Result<DocWatcher> {
    let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        let _ = tx.send(res);
    })
    .map_err(|e| RecallError::Ingestion(format!("watcher init: {e}")))?;

    watcher
        .watch(indexer.docs_folder(), RecursiveMode::Recursive)
        .map_err(|e| RecallError::Ingestion(format!("watch {}: {e}", indexer.docs_folder().display())))?;
    tracing::info!("Watching folder: {}", indexer.docs_folder().display());

    let dispatcher = tokio::spawn(async move {
        let mut events = UnboundedReceiverStream::new(rx);
        while let Some(result) = events.next().await {
            let event = match result {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Watcher error: {e}");
                    continue;
                }
            };
            if !matches!(
                event.kind,
                EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
            ) {
                continue;
            }
            for path in event.paths {
                dispatch(Arc::clone(&indexer), path);
            }
        }
    });

    Ok(DocWatcher {
        _watcher: watcher,
        dispatcher,
    })
}

/// Process one path on a worker task, deduplicated by the in-flight set.
fn dispatch(indexer: Arc<Indexer>, path: PathBuf) {
    if is_hidden(&path) {
        return;
    }
    if !indexer.begin(&path) {
        return;
    }
    tokio::spawn(async move {
        // Let the writer finish before hashing the file.
        tokio::time::sleep(SETTLE_DELAY).await;
        let outcome = if path.exists() {
            indexer.index_file(&path).await
        } else {
            indexer.remove_file(&path)
        };
        if let Err(e) = outcome {
            tracing::error!("Watcher failed to process {}: {e}", path.display());
        }
        indexer.finish(&path);
    });
}
