//! Bounded log of past successful generations, most recent first.

use serde::{Deserialize, Serialize};

use crate::clock::TimeProvider;
use crate::provider_registry::ProviderId;

/// Number of entries kept; older ones are dropped from the tail.
pub const MAX_HISTORY_ENTRIES: usize = 20;

/// One successful generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Creation time in Unix milliseconds, doubling as the entry id.
    pub id: i64,
    pub prompt: String,
    pub json: String,
    pub provider: String,
    /// RFC 3339 creation time.
    pub timestamp: String,
}

impl HistoryEntry {
    pub fn new(prompt: &str, json: &str, provider: ProviderId, time: &dyn TimeProvider) -> Self {
        Self {
            id: time.now_millis(),
            prompt: prompt.to_string(),
            json: json.to_string(),
            provider: provider.to_string(),
            timestamp: time.now_rfc3339(),
        }
    }
}

/// Ordered history, newest entry at index 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History(Vec<HistoryEntry>);

impl History {
    /// Prepends `entry` and truncates to [`MAX_HISTORY_ENTRIES`].
    ///
    /// Ids stay unique: an entry created in the same millisecond as the
    /// current head gets the next free id.
    pub fn append(&mut self, mut entry: HistoryEntry) {
        if let Some(head) = self.0.first() {
            if entry.id <= head.id {
                entry.id = head.id + 1;
            }
        }
        self.0.insert(0, entry);
        self.0.truncate(MAX_HISTORY_ENTRIES);
    }

    /// Deletes the entry with `id`. Returns false if there was none.
    pub fn remove(&mut self, id: i64) -> bool {
        let before = self.0.len();
        self.0.retain(|entry| entry.id != id);
        self.0.len() != before
    }

    pub fn list(&self) -> &[HistoryEntry] {
        &self.0
    }

    pub fn get(&self, id: i64) -> Option<&HistoryEntry> {
        self.0.iter().find(|entry| entry.id == id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
