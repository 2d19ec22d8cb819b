use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Identifies one cursor: a file as seen by one rule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CursorKey {
    pub rule_id: String,
    pub path: String,
}

impl CursorKey {
    pub fn new(rule_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self { rule_id: rule_id.into(), path: path.into() }
    }

    fn encoded(&self) -> String {
        format!("{}|{}", self.rule_id, self.path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorEntry {
    rule_id: String,
    path: String,
    offset: u64,
    updated: DateTime<Utc>,
}

/// On-disk form of the cursor table.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CursorState {
    version: u32,
    last_updated: DateTime<Utc>,
    cursors: BTreeMap<String, CursorEntry>,
}

impl CursorState {
    fn new() -> Self {
        Self { version: 1, last_updated: Utc::now(), cursors: BTreeMap::new() }
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)
            .context(format!("Failed to read cursor state: {}", path.display()))?;
        serde_json::from_str(&content).context("Failed to parse cursor state")
    }

    fn save_to_file(&mut self, path: &Path) -> Result<()> {
        self.last_updated = Utc::now();
        let content = serde_json::to_string_pretty(self).context("Failed to serialize cursor state")?;

        // Write then rename so a crash never leaves a half-written table
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).context(format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path).context(format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

/// Byte offsets per (rule, file), optionally persisted as JSON.
///
/// Without a state path cursors live in memory only, and a restart rescans
/// each file from the start.
pub struct CursorStore {
    state: Mutex<CursorState>,
    state_path: Option<PathBuf>,
}

impl Default for CursorStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl CursorStore {
    pub fn in_memory() -> Self {
        Self { state: Mutex::new(CursorState::new()), state_path: None }
    }

    /// Load cursors from `path`. An unreadable file starts an empty table.
    pub fn persistent(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match CursorState::load_from_file(&path) {
            Ok(state) => {
                debug!("Loaded {} log cursors from {}", state.cursors.len(), path.display());
                state
            }
            Err(e) => {
                warn!("Ignoring cursor state at {}: {:#}", path.display(), e);
                CursorState::new()
            }
        };
        Self { state: Mutex::new(state), state_path: Some(path) }
    }

    pub fn get(&self, key: &CursorKey) -> u64 {
        self.state.lock().cursors.get(&key.encoded()).map_or(0, |e| e.offset)
    }

    /// Store `offset` and persist when a state file is configured.
    pub fn set(&self, key: &CursorKey, offset: u64) {
        let mut state = self.state.lock();
        let encoded = key.encoded();

        if state.cursors.get(&encoded).map(|e| e.offset) == Some(offset) {
            return;
        }
        state.cursors.insert(
            encoded,
            CursorEntry {
                rule_id: key.rule_id.clone(),
                path: key.path.clone(),
                offset,
                updated: Utc::now(),
            },
        );

        if let Some(path) = &self.state_path {
            if let Err(e) = state.save_to_file(path) {
                warn!("Failed to persist log cursors: {:#}", e);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
