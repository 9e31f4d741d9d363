use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const WRITE_ATTEMPTS: u32 = 5;
const BACKOFF_BASE_MS: u64 = 100;

/// Asynchronous, coalescing snapshot store for one catalog file.
///
/// Mutations hand the store a full serialized snapshot; a single writer
/// task drains the queue and writes only the most recent one, so a burst
/// of mutations costs one disk write. Writes go through a temp file and
/// rename so concurrent readers never observe a torn catalog.
pub struct CatalogStore {
    path: PathBuf,
    pending: Arc<Mutex<Option<String>>>,
    notify: mpsc::UnboundedSender<()>,
}

impl CatalogStore {
    pub fn open(path: PathBuf) -> Self {
        let pending: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let (notify, mut wake) = mpsc::unbounded_channel::<()>();

        let writer_pending = Arc::clone(&pending);
        let writer_path = path.clone();
        tokio::spawn(async move {
            while wake.recv().await.is_some() {
                // Coalesce any notifications that piled up behind this one.
                while wake.try_recv().is_ok() {}
                let snapshot = writer_pending.lock().expect("pending lock").take();
                if let Some(json) = snapshot {
                    write_with_retry(&writer_path, &json).await;
                }
            }
        });

        Self {
            path,
            pending,
            notify,
        }
    }

    /// Queue a snapshot for writing. Returns immediately; the writer task
    /// picks up the latest queued state.
    pub fn persist<T: Serialize>(&self, items: &T) {
        match serde_json::to_string_pretty(items) {
            Ok(json) => {
                *self.pending.lock().expect("pending lock") = Some(json);
                let _ = self.notify.send(());
            }
            Err(e) => warn!(path = %self.path.display(), "snapshot serialization failed: {e}"),
        }
    }

    /// Write any still-pending snapshot before shutdown.
    pub async fn flush(&self) {
        let snapshot = self.pending.lock().expect("pending lock").take();
        if let Some(json) = snapshot {
            write_with_retry(&self.path, &json).await;
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Load a catalog, recovering from a missing or corrupt file by starting
/// empty. Corruption truncates the file so the next write starts clean.
pub async fn load_catalog<T: DeserializeOwned + Default + Serialize>(path: &Path) -> T {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(items) => {
                debug!(path = %path.display(), "catalog loaded");
                items
            }
            Err(e) => {
                warn!(path = %path.display(), "corrupt catalog, truncating: {e}");
                let empty = T::default();
                if let Ok(json) = serde_json::to_string_pretty(&empty) {
                    write_with_retry(path, &json).await;
                }
                empty
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
        Err(e) => {
            warn!(path = %path.display(), "catalog read failed: {e}");
            T::default()
        }
    }
}

/// Temp-file-and-rename write with bounded backoff. A write that keeps
/// failing (held lock, full disk) is logged and dropped; the next mutation
/// queues a fresh snapshot anyway.
async fn write_with_retry(path: &Path, json: &str) {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    let tmp = path.with_extension("json.tmp");
    for attempt in 1..=WRITE_ATTEMPTS {
        let result = async {
            tokio::fs::write(&tmp, json).await?;
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        match result {
            Ok(()) => {
                debug!(path = %path.display(), bytes = json.len(), "catalog written");
                return;
            }
            Err(e) if attempt < WRITE_ATTEMPTS => {
                let backoff = BACKOFF_BASE_MS * u64::from(attempt);
                warn!(path = %path.display(), attempt, "catalog write failed, retrying in {backoff}ms: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
            Err(e) => {
                warn!(path = %path.display(), "catalog write abandoned: {e}");
            }
        }
    }
}
