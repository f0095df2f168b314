//! Shared deterministic types for the run loop.
//!
//! These types are the stable contract between the loop controllers, the
//! agent adapters and the persisted session document. They carry no I/O.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// What the agent is asked to do for this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Plan,
    Build,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Plan => "plan",
            Mode::Build => "build",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "plan" => Ok(Mode::Plan),
            "build" => Ok(Mode::Build),
            other => Err(anyhow!("unknown mode '{other}' (expected plan or build)")),
        }
    }
}

/// Built-in agent CLI dialects.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum AgentType {
    #[default]
    #[serde(rename = "opencode")]
    OpenCode,
    #[serde(rename = "claude-code")]
    ClaudeCode,
}

impl AgentType {
    /// Agent assumed for session records written before the `agent` field existed.
    pub const LEGACY_DEFAULT: AgentType = AgentType::OpenCode;

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::OpenCode => "opencode",
            AgentType::ClaudeCode => "claude-code",
        }
    }

    /// Whether the adapter exposes a headless/print toggle worth recording.
    pub fn has_print_mode(self) -> bool {
        matches!(self, AgentType::ClaudeCode)
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "opencode" => Ok(AgentType::OpenCode),
            "claude-code" | "claude" => Ok(AgentType::ClaudeCode),
            other => Err(anyhow!(
                "unknown agent '{other}' (expected opencode or claude-code)"
            )),
        }
    }
}

/// How much the agent may do without asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionPosture {
    /// Leave the agent's own permission prompts in place.
    #[default]
    Default,
    /// Allow file edits without confirmation.
    AcceptEdits,
    /// Allow everything (edits, shell, network).
    Bypass,
}

impl PermissionPosture {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionPosture::Default => "default",
            PermissionPosture::AcceptEdits => "accept-edits",
            PermissionPosture::Bypass => "bypass",
        }
    }
}

impl FromStr for PermissionPosture {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(PermissionPosture::Default),
            "accept-edits" => Ok(PermissionPosture::AcceptEdits),
            "bypass" => Ok(PermissionPosture::Bypass),
            other => Err(anyhow!(
                "unknown permission posture '{other}' (expected default, accept-edits or bypass)"
            )),
        }
    }
}

/// Static description of an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMetadata {
    pub name: &'static str,
    pub display_name: &'static str,
    pub cli_command: &'static str,
    /// Populated by the availability probe.
    pub version: Option<String>,
}

/// Default model names for an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultModels {
    pub smart: &'static str,
    pub fast: &'static str,
}

/// Result of one headless agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub session_id: Option<String>,
    pub completion_detected: bool,
    /// `-1` when the process exposed no exit code.
    pub exit_code: i32,
}

/// Outcome of exporting one session through its adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOutcome {
    pub success: bool,
    pub export_data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl ExportOutcome {
    pub fn exported(data: serde_json::Value) -> Self {
        Self {
            success: true,
            export_data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            export_data: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_type_serializes_with_cli_names() {
        let json = serde_json::to_string(&AgentType::ClaudeCode).expect("serialize");
        assert_eq!(json, "\"claude-code\"");
        let parsed: AgentType = serde_json::from_str("\"opencode\"").expect("parse");
        assert_eq!(parsed, AgentType::OpenCode);
    }

    #[test]
    fn parse_rejects_unknown_values() {
        assert!("ship".parse::<Mode>().is_err());
        assert!("cursor".parse::<AgentType>().is_err());
        assert_eq!(
            "accept-edits".parse::<PermissionPosture>().expect("parse"),
            PermissionPosture::AcceptEdits
        );
    }

    #[test]
    fn only_claude_code_records_print_mode() {
        assert!(AgentType::ClaudeCode.has_print_mode());
        assert!(!AgentType::OpenCode.has_print_mode());
    }
}
