//! Export recorded sessions through their agents for `runloop inspect`.
//!
//! Sessions are grouped by agent type so each adapter is built once. Failures
//! are isolated: an unavailable agent only affects its own group, and a failed
//! export only affects its own entry. Anything else aborts the command.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::agents::{AgentFactory, AgentOptions, AgentUnavailableError};
use crate::core::types::AgentType;
use crate::io::session_store::{SessionState, SessionStore};
use crate::io::write_json_atomic;

/// One session joined with its export result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectEntry {
    pub session_id: Option<String>,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub agent: AgentType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub print_mode: Option<bool>,
    /// `null` whenever the export did not succeed.
    pub export: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InspectEntry {
    fn pending(session: &SessionState) -> Self {
        Self {
            session_id: session.session_id.clone(),
            iteration: session.iteration,
            started_at: session.started_at,
            agent: session.agent,
            print_mode: session.print_mode,
            export: None,
            error: None,
        }
    }

    fn fail(&mut self, error: impl Into<String>) {
        self.export = None;
        self.error = Some(error.into());
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Entries written by one export run.
#[derive(Debug, Clone)]
pub struct InspectReport {
    pub output_path: PathBuf,
    pub entries: Vec<InspectEntry>,
}

impl InspectReport {
    pub fn exported(&self) -> usize {
        self.entries.iter().filter(|entry| entry.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.exported()
    }

    /// No sessions were recorded at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> String {
        let path = self.output_path.display();
        if self.is_empty() {
            return format!("No sessions recorded; wrote an empty list to {path}");
        }
        let total = self.entries.len();
        match self.failed() {
            0 => format!("Exported {total} session(s) to {path}"),
            failed => format!(
                "Exported {} of {total} session(s) to {path} ({failed} failed)",
                self.exported()
            ),
        }
    }
}

/// Export every recorded session and write the entries to `output_path` once.
///
/// Entries keep the order of the session history.
#[instrument(skip_all, fields(output = %output_path.display()))]
pub fn export_all<F: AgentFactory + ?Sized>(
    factory: &F,
    store: &SessionStore,
    options: &AgentOptions,
    output_path: &Path,
) -> Result<InspectReport> {
    let sessions = store.read()?;
    let mut entries: Vec<InspectEntry> = sessions.iter().map(InspectEntry::pending).collect();

    let mut groups: BTreeMap<AgentType, Vec<usize>> = BTreeMap::new();
    for (idx, session) in sessions.iter().enumerate() {
        groups.entry(session.agent).or_default().push(idx);
    }

    for (agent_type, indices) in &groups {
        let adapter = match factory.create_agent(*agent_type, options) {
            Ok(adapter) => adapter,
            Err(err) => {
                let Some(unavailable) = err.downcast_ref::<AgentUnavailableError>() else {
                    return Err(err);
                };
                warn!(agent = %agent_type, sessions = indices.len(), "agent unavailable, skipping group");
                let message = unavailable.to_string();
                for &idx in indices {
                    entries[idx].fail(message.clone());
                }
                continue;
            }
        };

        for &idx in indices {
            let entry = &mut entries[idx];
            let Some(session_id) = sessions[idx].session_id.as_deref() else {
                entry.fail("no session id was recorded for this iteration");
                continue;
            };
            match adapter.export(session_id) {
                Ok(outcome) if outcome.success => {
                    debug!(session_id, "exported");
                    entry.export = outcome.export_data;
                }
                Ok(outcome) => {
                    let error = outcome
                        .error
                        .unwrap_or_else(|| format!("export of {session_id} failed"));
                    warn!(session_id, error = %error, "export failed");
                    entry.fail(error);
                }
                Err(err) => {
                    warn!(session_id, err = %format!("{err:#}"), "export raised an error");
                    entry.fail(format!("{err:#}"));
                }
            }
        }
    }

    write_json_atomic(output_path, &entries)?;
    let report = InspectReport {
        output_path: output_path.to_path_buf(),
        entries,
    };
    info!(
        total = report.entries.len(),
        exported = report.exported(),
        failed = report.failed(),
        "inspect output written"
    );
    Ok(report)
}
