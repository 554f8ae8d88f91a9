//! Monitor state persistence — byte offsets per tracked session.
//!
//! Persisted so incremental reading resumes after a restart without
//! re-sending old messages.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use termgram_core::fsutil::atomic_write_json;

/// Tracking record for one monitored session.
///
/// `last_byte_offset` always points at the byte following the last fully
/// parsed transcript line — it never splits a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedSession {
    pub session_id: String,
    pub file_path: String,
    #[serde(default)]
    pub last_byte_offset: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    tracked_sessions: BTreeMap<String, TrackedSession>,
}

/// Persistent state for the session monitor.
#[derive(Debug)]
pub struct MonitorState {
    state_file: PathBuf,
    tracked_sessions: BTreeMap<String, TrackedSession>,
    dirty: bool,
}

impl MonitorState {
    pub fn new(state_file: PathBuf) -> Self {
        Self {
            state_file,
            tracked_sessions: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn load(&mut self) {
        let Ok(content) = std::fs::read_to_string(&self.state_file) else {
            debug!(path = %self.state_file.display(), "no monitor state file");
            return;
        };
        match serde_json::from_str::<StateFile>(&content) {
            Ok(parsed) => {
                self.tracked_sessions = parsed.tracked_sessions;
                info!(count = self.tracked_sessions.len(), "loaded tracked sessions");
            }
            Err(e) => {
                warn!(error = %e, "failed to load monitor state");
                self.tracked_sessions.clear();
            }
        }
    }

    pub fn save(&mut self) {
        let data = StateFile {
            tracked_sessions: self.tracked_sessions.clone(),
        };
        match atomic_write_json(&self.state_file, &data) {
            Ok(()) => {
                self.dirty = false;
                debug!(count = self.tracked_sessions.len(), "monitor state saved");
            }
            Err(e) => warn!(error = %e, "failed to save monitor state"),
        }
    }

    pub fn save_if_dirty(&mut self) {
        if self.dirty {
            self.save();
        }
    }

    pub fn get(&self, session_id: &str) -> Option<&TrackedSession> {
        self.tracked_sessions.get(session_id)
    }

    pub fn update(&mut self, session: TrackedSession) {
        self.tracked_sessions
            .insert(session.session_id.clone(), session);
        self.dirty = true;
    }

    pub fn remove(&mut self, session_id: &str) {
        if self.tracked_sessions.remove(session_id).is_some() {
            self.dirty = true;
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.tracked_sessions.keys().cloned().collect()
    }
}
