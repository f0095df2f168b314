//! Runloop configuration stored under `.runloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{AgentType, PermissionPosture};
use crate::io::write_atomic;

/// Runloop configuration (TOML).
///
/// Edited by humans; every field is optional and falls back to the default.
/// Command-line flags take precedence over values loaded here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunloopConfig {
    /// Agent used when `--agent` is not given.
    pub agent: AgentType,

    /// Iteration budget for `runloop run`.
    pub max_iterations: u32,

    pub permissions: PermissionPosture,

    /// Claude Code print mode. Ignored by other agents.
    pub print_mode: bool,

    /// Wall-clock budget for a single agent invocation, in seconds.
    pub iteration_timeout_secs: u64,

    /// Captured stdout/stderr beyond this many bytes is discarded.
    pub output_limit_bytes: usize,

    pub models: ModelOverrides,
}

/// Model names replacing the adapter defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smart: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast: Option<String>,
}

impl Default for RunloopConfig {
    fn default() -> Self {
        Self {
            agent: AgentType::default(),
            max_iterations: 10,
            permissions: PermissionPosture::default(),
            print_mode: true,
            iteration_timeout_secs: 60 * 60,
            output_limit_bytes: 1_000_000,
            models: ModelOverrides::default(),
        }
    }
}

impl RunloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (label, model) in [
            ("models.smart", &self.models.smart),
            ("models.fast", &self.models.fast),
        ] {
            if model.as_deref().is_some_and(|m| m.trim().is_empty()) {
                return Err(anyhow!("{label} must not be empty"));
            }
        }
        Ok(())
    }

    pub fn iteration_timeout(&self) -> Duration {
        Duration::from_secs(self.iteration_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunloopConfig> {
    if !path.exists() {
        let cfg = RunloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunloopConfig::default());
        assert_eq!(cfg.max_iterations, 10);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = RunloopConfig {
            agent: AgentType::ClaudeCode,
            permissions: PermissionPosture::Bypass,
            models: ModelOverrides {
                smart: Some("opus".to_string()),
                fast: None,
            },
            ..RunloopConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "agent = \"claude-code\"\n[models]\nfast = \"haiku\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.agent, AgentType::ClaudeCode);
        assert_eq!(cfg.models.fast.as_deref(), Some("haiku"));
        assert_eq!(cfg.max_iterations, 10);
        assert!(cfg.print_mode);
    }

    #[test]
    fn zero_iterations_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_iterations = 0\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("max_iterations must be > 0"));
    }

    #[test]
    fn blank_model_rejected() {
        let cfg = RunloopConfig {
            models: ModelOverrides {
                smart: Some("  ".to_string()),
                fast: None,
            },
            ..RunloopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
