//! Session history storage (`.runloop/state/sessions.json`).
//!
//! The document is a JSON array of [`SessionState`] records. Writers always
//! pass the full accumulated history; the file is replaced as a whole. Reads
//! run every record through [`StoredSession::migrate`] so documents written by
//! older releases (no `agent`, `printMode` or `project`) still load.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{AgentType, Mode};
use crate::io::write_json_atomic;

/// One loop iteration or interactive step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// 1-based, monotonically increasing within one invocation.
    pub iteration: u32,
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub mode: Mode,
    pub prompt: String,
    pub agent: AgentType,
    /// Claude Code only: whether the agent ran in print (headless) mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_mode: Option<bool>,
    /// Set when the invocation was scoped to a named project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
}

/// Which schema generation a stored record was written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    /// Written before records carried an `agent`.
    Legacy,
    Current,
}

/// On-disk record as read, before migration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    iteration: u32,
    #[serde(default)]
    session_id: Option<String>,
    started_at: DateTime<Utc>,
    mode: Mode,
    prompt: String,
    #[serde(default)]
    agent: Option<AgentType>,
    #[serde(default)]
    print_mode: Option<bool>,
    #[serde(default)]
    project: Option<String>,
}

impl StoredSession {
    pub fn shape(&self) -> RecordShape {
        if self.agent.is_some() {
            RecordShape::Current
        } else {
            RecordShape::Legacy
        }
    }

    /// Lift the record to the current shape. Legacy records get the legacy default agent.
    pub fn migrate(self) -> SessionState {
        let agent = match self.shape() {
            RecordShape::Current => self.agent.unwrap_or(AgentType::LEGACY_DEFAULT),
            RecordShape::Legacy => AgentType::LEGACY_DEFAULT,
        };
        SessionState {
            iteration: self.iteration,
            session_id: self.session_id,
            started_at: self.started_at,
            mode: self.mode,
            prompt: self.prompt,
            agent,
            print_mode: self.print_mode,
            project: self.project,
        }
    }
}

/// Reads and replaces the session document.
#[derive(Debug, Clone)]
pub struct SessionStore {
    state_dir: PathBuf,
    sessions_path: PathBuf,
}

impl SessionStore {
    pub fn new(state_dir: impl Into<PathBuf>, sessions_path: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            sessions_path: sessions_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.sessions_path
    }

    /// Create the state directory. Safe to call when it already exists.
    pub fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("create state directory {}", self.state_dir.display()))
    }

    /// Replace the document with `sessions`.
    pub fn write(&self, sessions: &[SessionState]) -> Result<()> {
        debug!(path = %self.sessions_path.display(), count = sessions.len(), "writing sessions");
        self.ensure_dir()?;
        write_json_atomic(&self.sessions_path, sessions)
            .with_context(|| format!("write sessions {}", self.sessions_path.display()))
    }

    /// Load and migrate every record. A missing document is an empty history.
    pub fn read(&self) -> Result<Vec<SessionState>> {
        let contents = match fs::read_to_string(&self.sessions_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.sessions_path.display(), "no sessions recorded yet");
                return Ok(Vec::new());
            }
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("read sessions {}", self.sessions_path.display())
                });
            }
        };
        let stored: Vec<StoredSession> = serde_json::from_str(&contents)
            .with_context(|| format!("parse sessions {}", self.sessions_path.display()))?;
        let legacy = stored
            .iter()
            .filter(|record| record.shape() == RecordShape::Legacy)
            .count();
        debug!(count = stored.len(), legacy, "sessions loaded");
        Ok(stored.into_iter().map(StoredSession::migrate).collect())
    }
}
