// ABOUTME: Clone history and saved operations, persisted as one JSON document
// ABOUTME: The engine records a history entry for every run that reached a terminal state

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clone::CloneOutcome;
use crate::models::{CloneHistoryEntry, SavedOperation};

/// Where finished runs go.
pub trait HistorySink: Send + Sync {
    fn append(&self, entry: CloneHistoryEntry) -> Result<()>;
}

pub fn history_entry(outcome: CloneOutcome) -> CloneHistoryEntry {
    CloneHistoryEntry {
        id: outcome.run_id,
        source_id: outcome.source.id,
        source_name: outcome.source.name,
        destination_id: outcome.destination.id,
        destination_name: outcome.destination.name,
        clone_type: outcome.clone_type,
        status: outcome.status,
        started_at: outcome.started_at,
        completed_at: outcome.completed_at,
        duration: (outcome.completed_at - outcome.started_at).num_seconds().max(0),
        error_message: outcome.error_message,
        backup_path: outcome
            .backup_path
            .map(|p| p.to_string_lossy().into_owned()),
        logs: outcome.logs,
    }
}

/// Turns outcomes into entries and hands them to a sink. Persistence
/// failures are logged; the caller still gets the entry.
#[derive(Clone)]
pub struct HistoryRecorder {
    sink: Arc<dyn HistorySink>,
}

impl HistoryRecorder {
    pub fn new(sink: Arc<dyn HistorySink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, outcome: CloneOutcome) -> CloneHistoryEntry {
        let entry = history_entry(outcome);
        if let Err(e) = self.sink.append(entry.clone()) {
            warn!(run_id = %entry.id, error = %e, "Failed to persist clone history");
        }
        entry
    }
}

/// Keeps entries in memory, newest first.
#[derive(Default)]
pub struct MemoryHistory {
    entries: Mutex<Vec<CloneHistoryEntry>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<CloneHistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl HistorySink for MemoryHistory {
    fn append(&self, entry: CloneHistoryEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(0, entry);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppData {
    #[serde(default)]
    history: Vec<CloneHistoryEntry>,
    #[serde(default)]
    saved_operations: Vec<SavedOperation>,
}

/// JSON file store. Every write rewrites the file through a temporary
/// sibling so a crash never leaves it half written.
pub struct JsonStore {
    path: PathBuf,
    history_limit: usize,
    lock: Mutex<()>,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>, history_limit: usize) -> Self {
        Self {
            path: path.into(),
            history_limit,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<AppData> {
        if !self.path.exists() {
            return Ok(AppData::default());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        if content.trim().is_empty() {
            return Ok(AppData::default());
        }
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))
    }

    fn save(&self, data: &AppData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(data).context("Failed to serialize app data")?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, content).with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Saved app data");
        Ok(())
    }

    fn update<T>(&self, change: impl FnOnce(&mut AppData) -> T) -> Result<T> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut data = self.load()?;
        let result = change(&mut data);
        self.save(&data)?;
        Ok(result)
    }

    /// Newest first.
    pub fn history(&self) -> Result<Vec<CloneHistoryEntry>> {
        Ok(self.load()?.history)
    }

    /// Exact id, or a unique id prefix.
    pub fn history_entry(&self, id: &str) -> Result<Option<CloneHistoryEntry>> {
        let history = self.load()?.history;
        if let Some(entry) = history.iter().find(|e| e.id == id) {
            return Ok(Some(entry.clone()));
        }
        let mut matches = history.into_iter().filter(|e| e.id.starts_with(id));
        match (matches.next(), matches.next()) {
            (Some(entry), None) => Ok(Some(entry)),
            (Some(_), Some(_)) => anyhow::bail!("History id prefix '{}' is ambiguous", id),
            _ => Ok(None),
        }
    }

    /// Returns how many entries were removed.
    pub fn clear_history(&self) -> Result<usize> {
        self.update(|data| {
            let removed = data.history.len();
            data.history.clear();
            removed
        })
    }

    /// Insert or replace by id; a new operation with an existing name
    /// replaces the old one.
    pub fn save_operation(&self, operation: SavedOperation) -> Result<()> {
        self.update(|data| {
            data.saved_operations
                .retain(|op| op.id != operation.id && op.name != operation.name);
            data.saved_operations.push(operation);
            data.saved_operations.sort_by(|a, b| a.name.cmp(&b.name));
        })
    }

    pub fn operations(&self) -> Result<Vec<SavedOperation>> {
        Ok(self.load()?.saved_operations)
    }

    /// Lookup by id or by name.
    pub fn operation(&self, key: &str) -> Result<Option<SavedOperation>> {
        Ok(self
            .load()?
            .saved_operations
            .into_iter()
            .find(|op| op.id == key || op.name == key))
    }

    pub fn delete_operation(&self, key: &str) -> Result<bool> {
        self.update(|data| {
            let before = data.saved_operations.len();
            data.saved_operations
                .retain(|op| op.id != key && op.name != key);
            data.saved_operations.len() != before
        })
    }
}

impl HistorySink for JsonStore {
    fn append(&self, entry: CloneHistoryEntry) -> Result<()> {
        let limit = self.history_limit;
        self.update(|data| {
            data.history.insert(0, entry);
            data.history.truncate(limit);
        })
    }
}
