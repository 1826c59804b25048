//! Persistent, append-only record of every `(source, identity)` pair the
//! monitor has classified.
//!
//! All access goes through one mutex. Every mutation is persisted with a
//! temp-file rename while the lock is still held, so the file on disk always
//! matches the in-memory set. Callers must not hold the lock across network
//! I/O; no method here performs any.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use jdih_core::{Document, DocumentId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing ledger: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// On-disk ledger snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerState {
    #[serde(default)]
    pub seen_ids: BTreeMap<String, BTreeSet<DocumentId>>,
    /// Every classified document, in discovery order. Not deduplicated.
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub last_check: BTreeMap<String, DateTime<Utc>>,
}

impl LedgerState {
    pub fn seen(&self, source: &str, identity: &DocumentId) -> bool {
        self.seen_ids
            .get(source)
            .is_some_and(|ids| ids.contains(identity))
    }

    pub fn seen_count(&self, source: &str) -> usize {
        self.seen_ids.get(source).map_or(0, BTreeSet::len)
    }
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    state: Mutex<LedgerState>,
}

impl Ledger {
    /// Loads the latest snapshot, or starts empty when none exists yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let state = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| LedgerError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no ledger yet; starting empty");
                LedgerState::default()
            }
            Err(source) => return Err(LedgerError::Io { path, source }),
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn seen(&self, source: &str, identity: &DocumentId) -> bool {
        self.lock().seen(source, identity)
    }

    /// Check-then-insert as one step. Returns `true` when the document was
    /// not yet known and has now been persisted.
    pub fn record(&self, document: &Document) -> Result<bool, LedgerError> {
        let mut state = self.lock();
        let inserted = state
            .seen_ids
            .entry(document.source.clone())
            .or_default()
            .insert(document.identity.clone());
        if !inserted {
            return Ok(false);
        }
        state.documents.push(document.clone());

        if let Err(err) = persist(&self.path, &state) {
            state.documents.pop();
            if let Some(ids) = state.seen_ids.get_mut(&document.source) {
                ids.remove(&document.identity);
            }
            return Err(err);
        }
        debug!(source = %document.source, identity = %document.identity, "recorded");
        Ok(true)
    }

    /// Sets the retrieved pair on the logged document. Returns `false` when
    /// no unretrieved entry exists for the key.
    pub fn mark_retrieved(
        &self,
        source: &str,
        identity: &DocumentId,
        local_path: &str,
    ) -> Result<bool, LedgerError> {
        let mut state = self.lock();
        let Some(index) = state
            .documents
            .iter()
            .rposition(|d| d.source == source && &d.identity == identity && !d.retrieved)
        else {
            return Ok(false);
        };
        state.documents[index].mark_retrieved(local_path);

        if let Err(err) = persist(&self.path, &state) {
            let doc = &mut state.documents[index];
            doc.retrieved = false;
            doc.local_path = None;
            return Err(err);
        }
        Ok(true)
    }

    pub fn touch_last_check(&self, source: &str, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut state = self.lock();
        let previous = state.last_check.insert(source.to_string(), at);
        if let Err(err) = persist(&self.path, &state) {
            match previous {
                Some(prev) => state.last_check.insert(source.to_string(), prev),
                None => state.last_check.remove(source),
            };
            return Err(err);
        }
        Ok(())
    }

    /// Logged documents with a file URL that have never been retrieved,
    /// one per `(source, identity)`.
    pub fn pending_downloads(&self) -> Vec<Document> {
        let state = self.lock();
        let retrieved: HashSet<(&str, &DocumentId)> = state
            .documents
            .iter()
            .filter(|d| d.retrieved)
            .map(Document::key)
            .collect();
        let mut queued = HashSet::new();
        state
            .documents
            .iter()
            .filter(|d| d.file_url.is_some() && !d.retrieved)
            .filter(|d| !retrieved.contains(&d.key()))
            .filter(|d| queued.insert(d.key()))
            .cloned()
            .collect()
    }

    pub fn snapshot(&self) -> LedgerState {
        self.lock().clone()
    }
}

fn persist(path: &Path, state: &LedgerState) -> Result<(), LedgerError> {
    let bytes = serde_json::to_vec_pretty(state).map_err(LedgerError::Serialize)?;
    blocking(|| write_atomic(path, &bytes)).map_err(|source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Runs blocking file I/O off the async worker when called from a
/// multi-thread runtime. The lock stays held; the write is bounded.
fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let file_name = path
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger.json".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let result = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}
