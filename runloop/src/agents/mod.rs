//! Agent adapters for the supported coding-agent CLIs.
//!
//! Every CLI dialect sits behind [`AgentAdapter`]. The loop controllers only
//! ever hold a `Box<dyn AgentAdapter>` handed out by an [`AgentFactory`],
//! which refuses to return an adapter whose CLI failed its availability probe.
//!
//! | Agent | Binary | Print mode recorded |
//! |-------|--------|---------------------|
//! | `opencode` | `opencode` | No |
//! | `claude-code` | `claude` | Yes |

pub mod claude_code;
pub mod opencode;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::completion::{
    COMPLETION_MARKER, combined_output, contains_completion_marker, extract_session_id,
    parse_version,
};
use crate::core::types::{
    AgentMetadata, AgentType, DefaultModels, ExportOutcome, Mode, PermissionPosture, RunResult,
};
use crate::io::process::{
    DEFAULT_OUTPUT_LIMIT_BYTES, DEFAULT_TIMEOUT, ProcessOutput, ProcessRequest, ProcessRunner,
    SystemProcessRunner,
};

pub use claude_code::ClaudeCodeAdapter;
pub use opencode::OpenCodeAdapter;

/// Budget for `--version` probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Uniform operations over one agent CLI.
pub trait AgentAdapter {
    fn agent_type(&self) -> AgentType;

    /// Probe the CLI with its version command and cache the version on success.
    ///
    /// Never fails: any spawn error, non-zero exit or empty banner means `false`.
    fn check_availability(&mut self) -> bool;

    /// Run the agent headlessly and scan its combined output.
    ///
    /// A non-zero exit is still `Ok`; only failing to start the process is `Err`.
    fn run(&self, prompt: &str, model: &str, headless: bool) -> Result<RunResult>;

    /// Hand the terminal to the agent until the user ends the session.
    fn run_interactive(&self, prompt: &str, model: &str, headless: bool) -> Result<()>;

    /// Export a past session through the agent's own mechanism.
    fn export(&self, session_id: &str) -> Result<ExportOutcome>;

    fn metadata(&self) -> AgentMetadata;

    fn default_models(&self) -> DefaultModels;

    fn installation_url(&self) -> &'static str;

    fn unavailable_error_message(&self) -> String {
        let meta = self.metadata();
        unavailable_message(meta.display_name, meta.cli_command, self.installation_url())
    }
}

/// Static facts about a built-in agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub agent: AgentType,
    pub name: &'static str,
    pub display_name: &'static str,
    pub cli_command: &'static str,
    pub installation_url: &'static str,
    pub default_models: DefaultModels,
}

/// Returns the descriptor for a built-in agent.
#[must_use]
pub fn descriptor(agent: AgentType) -> AgentDescriptor {
    match agent {
        AgentType::OpenCode => AgentDescriptor {
            agent,
            name: "opencode",
            display_name: "OpenCode",
            cli_command: "opencode",
            installation_url: "https://opencode.ai/docs/",
            default_models: DefaultModels {
                smart: "anthropic/claude-opus-4-1",
                fast: "anthropic/claude-sonnet-4-0",
            },
        },
        AgentType::ClaudeCode => AgentDescriptor {
            agent,
            name: "claude-code",
            display_name: "Claude Code",
            cli_command: "claude",
            installation_url: "https://docs.anthropic.com/en/docs/claude-code/setup",
            default_models: DefaultModels {
                smart: "opus",
                fast: "sonnet",
            },
        },
    }
}

/// Raised when the requested agent CLI is missing or does not answer its probe.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", unavailable_message(.display_name, .cli_command, .installation_url))]
pub struct AgentUnavailableError {
    pub agent: AgentType,
    pub display_name: String,
    pub cli_command: String,
    pub installation_url: String,
}

impl AgentUnavailableError {
    pub fn for_agent(agent: AgentType) -> Self {
        let desc = descriptor(agent);
        Self {
            agent,
            display_name: desc.display_name.to_string(),
            cli_command: desc.cli_command.to_string(),
            installation_url: desc.installation_url.to_string(),
        }
    }
}

fn unavailable_message(display_name: &str, cli_command: &str, installation_url: &str) -> String {
    format!(
        "{display_name} is not available: `{cli_command} --version` did not succeed. \
         Install {display_name} ({installation_url}) and make sure `{cli_command}` is on PATH."
    )
}

/// Settings shared by every adapter built for one command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOptions {
    /// Directory the agent works in.
    pub cwd: PathBuf,
    pub permissions: PermissionPosture,
    /// Wall-clock budget for one `run` call.
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl AgentOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            permissions: PermissionPosture::default(),
            timeout: DEFAULT_TIMEOUT,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }

    pub(crate) fn request(&self, argv: Vec<String>) -> ProcessRequest {
        ProcessRequest::new(argv)
            .with_cwd(&self.cwd)
            .with_timeout(self.timeout)
            .with_output_limit(self.output_limit_bytes)
    }
}

/// Builds ready-to-use adapters.
pub trait AgentFactory {
    /// Build the adapter for `agent_type` and verify it is available.
    ///
    /// Fails with [`AgentUnavailableError`] when the probe fails.
    fn create_agent(
        &self,
        agent_type: AgentType,
        options: &AgentOptions,
    ) -> Result<Box<dyn AgentAdapter>>;
}

/// Factory for the real CLIs. Probes availability on every call.
#[derive(Debug, Clone, Default)]
pub struct CliAgentFactory<R = SystemProcessRunner> {
    runner: R,
}

impl<R> CliAgentFactory<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: ProcessRunner + Clone + 'static> AgentFactory for CliAgentFactory<R> {
    #[instrument(skip_all, fields(agent = %agent_type))]
    fn create_agent(
        &self,
        agent_type: AgentType,
        options: &AgentOptions,
    ) -> Result<Box<dyn AgentAdapter>> {
        let adapter: Box<dyn AgentAdapter> = match agent_type {
            AgentType::OpenCode => {
                Box::new(OpenCodeAdapter::new(self.runner.clone(), options.clone()))
            }
            AgentType::ClaudeCode => {
                Box::new(ClaudeCodeAdapter::new(self.runner.clone(), options.clone()))
            }
        };
        ensure_available(adapter)
    }
}

/// Gate an adapter on its availability probe.
pub fn ensure_available(mut adapter: Box<dyn AgentAdapter>) -> Result<Box<dyn AgentAdapter>> {
    if !adapter.check_availability() {
        let err = AgentUnavailableError::for_agent(adapter.agent_type());
        warn!(agent = %err.agent, cli = %err.cli_command, "agent unavailable");
        return Err(err.into());
    }
    let meta = adapter.metadata();
    info!(agent = meta.name, version = ?meta.version, "agent available");
    Ok(adapter)
}

/// Pick the model for `mode`: planning gets the smart model, building the fast one.
pub fn select_model(
    adapter: &dyn AgentAdapter,
    mode: Mode,
    smart_override: Option<&str>,
    fast_override: Option<&str>,
) -> String {
    let defaults = adapter.default_models();
    match mode {
        Mode::Plan => smart_override.unwrap_or(defaults.smart).to_string(),
        Mode::Build => fast_override.unwrap_or(defaults.fast).to_string(),
    }
}

/// Run a version probe and return the parsed version when it succeeded.
pub(crate) fn probe_version<R: ProcessRunner>(
    runner: &R,
    request: &ProcessRequest,
) -> Option<String> {
    match runner.run(request) {
        Ok(output) if output.success => parse_version(&output.stdout),
        Ok(output) => {
            warn!(program = %request.program(), exit_code = output.exit_code, "version probe failed");
            None
        }
        Err(err) => {
            warn!(program = %request.program(), err = %format!("{err:#}"), "version probe could not run");
            None
        }
    }
}

/// Turn captured process output into a [`RunResult`].
///
/// The marker counts when the runner saw it anywhere in a stream or when it
/// shows up in the kept output. Session ids are taken from the kept head
/// first and from the kept tail otherwise.
pub(crate) fn run_result(output: ProcessOutput) -> RunResult {
    let combined = combined_output(&output.stdout, &output.stderr);
    let tails = combined_output(&output.stdout_tail, &output.stderr_tail);
    let completion_detected = output.saw(COMPLETION_MARKER)
        || contains_completion_marker(&combined)
        || contains_completion_marker(&tails);
    let session_id = extract_session_id(&combined).or_else(|| extract_session_id(&tails));
    RunResult {
        stdout: output.stdout,
        stderr: output.stderr,
        session_id,
        completion_detected,
        exit_code: output.exit_code,
    }
}
