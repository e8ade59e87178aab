//! Persisted generation state.
//!
//! The store is the single writer of the state document. Every mutation
//! reloads the file, applies the change, writes it back atomically, and
//! publishes the new [`GenerationState`] to subscribers. Other processes can
//! observe the same file through [`StateStore::read_snapshot`].
//!
//! A generation is identified by the id returned from [`StateStore::begin`].
//! Only that id may write the terminal result, and only while the document
//! still says the generation is running, so results arriving after a
//! cancel or clear are discarded.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::error::GenerationError;
use crate::history::{History, HistoryEntry};
use crate::provider_registry::ClaudeAuthMethod;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle flags and payload of the current (or last) generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationState {
    pub generation_in_progress: bool,
    pub generation_complete: bool,
    pub generated_json: Option<String>,
    pub generation_error: Option<String>,
    pub generation_status: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl GenerationState {
    pub fn phase(&self) -> Phase {
        if self.generation_in_progress {
            Phase::Running
        } else if !self.generation_complete {
            Phase::Idle
        } else if self.generation_error.is_some() {
            Phase::Failed
        } else {
            Phase::Succeeded
        }
    }

    fn running() -> Self {
        Self {
            generation_in_progress: true,
            ..Self::default()
        }
    }

    fn terminal(outcome: Result<String, String>) -> Self {
        let (generated_json, generation_error) = match outcome {
            Ok(json) => (Some(json), None),
            Err(message) => (None, Some(message)),
        };
        Self {
            generation_in_progress: false,
            generation_complete: true,
            generated_json,
            generation_error,
            generation_status: None,
        }
    }
}

/// Everything persisted in the state file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreDocument {
    #[serde(flatten)]
    pub generation: GenerationState,
    #[serde(default)]
    pub current_prompt: String,
    #[serde(default)]
    pub generation_history: History,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_auth_method: Option<ClaudeAuthMethod>,
}

struct Inner {
    doc: StoreDocument,
    active: Option<u64>,
    next_id: u64,
}

pub struct StateStore {
    path: Option<PathBuf>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<GenerationState>,
}

impl StateStore {
    /// Opens the state file at `path`, creating its directory if needed.
    ///
    /// A missing file starts from the default document. A document left
    /// running by a process that exited is kept as is; `clear` or `cancel`
    /// resets it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let doc = if path.exists() {
            Self::read_snapshot(&path)?
        } else {
            StoreDocument::default()
        };
        info!("State store opened at {:?}", path);
        if doc.generation.generation_in_progress {
            warn!("State file reports a generation in progress from an earlier run");
        }
        Ok(Self::with_document(Some(path), doc))
    }

    /// A store that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::with_document(None, StoreDocument::default())
    }

    fn with_document(path: Option<PathBuf>, doc: StoreDocument) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            path,
            inner: Mutex::new(Inner {
                doc,
                active: None,
                next_id: 1,
            }),
            events,
        }
    }

    /// Reads a state file without taking ownership of it.
    pub fn read_snapshot(path: &Path) -> Result<StoreDocument> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Receives every generation-state transition made by this store.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationState> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> StoreDocument {
        self.lock().doc.clone()
    }

    pub fn state(&self) -> GenerationState {
        self.lock().doc.generation.clone()
    }

    /// Like [`state`](Self::state), after re-reading the file.
    pub fn refresh(&self) -> GenerationState {
        self.lock_fresh().doc.generation.clone()
    }

    // ============================================================================
    // Generation lifecycle
    // ============================================================================

    /// Enters the running state for `prompt` and returns the generation id.
    ///
    /// Rejected while another generation is running.
    pub fn begin(&self, prompt: &str) -> Result<u64, GenerationError> {
        let mut inner = self.lock_fresh();
        if inner.doc.generation.generation_in_progress {
            return Err(GenerationError::Configuration(
                "A generation is already in progress".to_string(),
            ));
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.active = Some(id);
        inner.doc.generation = GenerationState::running();
        inner.doc.current_prompt = prompt.to_string();
        debug!(generation = id, "Generation started");
        self.commit(&inner, true);
        Ok(id)
    }

    /// Updates the progress message of a running generation.
    pub fn set_status(&self, id: u64, status: impl Into<String>) {
        let mut inner = self.lock_fresh();
        if !Self::owns(&inner, id) {
            return;
        }
        inner.doc.generation.generation_status = Some(status.into());
        self.commit(&inner, true);
    }

    /// Writes the terminal result of generation `id`.
    ///
    /// Returns false, leaving the document untouched, when the generation
    /// was already cancelled, cleared, or superseded.
    pub fn finish(&self, id: u64, outcome: Result<String, String>) -> bool {
        let mut inner = self.lock_fresh();
        if !Self::owns(&inner, id) {
            debug!(generation = id, "Discarding result of inactive generation");
            return false;
        }
        inner.active = None;
        inner.doc.generation = GenerationState::terminal(outcome);
        self.commit(&inner, true);
        true
    }

    /// Moves a running generation to the cancelled error state.
    ///
    /// Returns false when nothing was running.
    pub fn cancel(&self) -> bool {
        let mut inner = self.lock_fresh();
        if !inner.doc.generation.generation_in_progress {
            return false;
        }
        inner.active = None;
        inner.doc.generation = GenerationState::terminal(Err(GenerationError::Cancelled.to_string()));
        self.commit(&inner, true);
        true
    }

    /// Resets the generation fields and the current prompt to idle.
    pub fn clear(&self) {
        let mut inner = self.lock_fresh();
        inner.active = None;
        inner.doc.generation = GenerationState::default();
        inner.doc.current_prompt.clear();
        self.commit(&inner, true);
    }

    // ============================================================================
    // History and settings
    // ============================================================================

    pub fn history(&self) -> History {
        self.lock().doc.generation_history.clone()
    }

    pub fn append_history(&self, entry: HistoryEntry) {
        let mut inner = self.lock_fresh();
        inner.doc.generation_history.append(entry);
        self.commit(&inner, false);
    }

    pub fn remove_history(&self, id: i64) -> bool {
        let mut inner = self.lock_fresh();
        let removed = inner.doc.generation_history.remove(id);
        if removed {
            self.commit(&inner, false);
        }
        removed
    }

    pub fn claude_auth_method(&self) -> ClaudeAuthMethod {
        self.lock().doc.claude_auth_method.unwrap_or_default()
    }

    pub fn set_claude_auth_method(&self, method: ClaudeAuthMethod) {
        let mut inner = self.lock_fresh();
        inner.doc.claude_auth_method = Some(method);
        self.commit(&inner, false);
    }

    // ============================================================================
    // Internals
    // ============================================================================

    fn owns(inner: &Inner, id: u64) -> bool {
        inner.active == Some(id) && inner.doc.generation.generation_in_progress
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Locks and picks up writes other processes made to the file.
    ///
    /// A running generation that another process cancelled or cleared is
    /// released here, and the new state is published to subscribers.
    fn lock_fresh(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.lock();
        if let Some(path) = self.path.as_deref().filter(|p| p.exists()) {
            match Self::read_snapshot(path) {
                Ok(doc) => inner.doc = doc,
                Err(e) => warn!("Ignoring unreadable state file {:?}: {}", path, e),
            }
        }
        if let Some(id) = inner.active.filter(|_| !inner.doc.generation.generation_in_progress) {
            info!(generation = id, "Generation ended by another process");
            inner.active = None;
            let _ = self.events.send(inner.doc.generation.clone());
        }
        inner
    }

    fn commit(&self, inner: &Inner, publish: bool) {
        if let Some(path) = self.path.as_deref() {
            if let Err(e) = Self::write_atomic(path, &inner.doc) {
                error!("Failed to save state to {:?}: {}", path, e);
            }
        }
        if publish {
            // No subscribers is fine.
            let _ = self.events.send(inner.doc.generation.clone());
        }
    }

    fn write_atomic(path: &Path, doc: &StoreDocument) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
