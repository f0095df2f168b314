//! OpenCode adapter: drives the `opencode` CLI.

use anyhow::Result;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{AgentAdapter, AgentOptions, PROBE_TIMEOUT, descriptor, probe_version, run_result};
use crate::core::completion::COMPLETION_MARKER;
use crate::core::types::{
    AgentMetadata, AgentType, DefaultModels, ExportOutcome, PermissionPosture, RunResult,
};
use crate::io::process::{ProcessRequest, ProcessRunner, SystemProcessRunner};

/// Environment variable OpenCode reads its permission overrides from.
pub const PERMISSION_ENV: &str = "OPENCODE_PERMISSION";

/// Adapter for the OpenCode CLI.
pub struct OpenCodeAdapter<R = SystemProcessRunner> {
    runner: R,
    options: AgentOptions,
    version: Option<String>,
}

impl<R: ProcessRunner> OpenCodeAdapter<R> {
    pub fn new(runner: R, options: AgentOptions) -> Self {
        Self {
            runner,
            options,
            version: None,
        }
    }

    fn cli(&self) -> &'static str {
        descriptor(AgentType::OpenCode).cli_command
    }

    fn request(&self, argv: Vec<String>) -> ProcessRequest {
        let request = self.options.request(argv);
        match permission_json(self.options.permissions) {
            Some(json) => request.with_env(PERMISSION_ENV, json),
            None => request,
        }
    }

    /// `opencode run --print-logs --model <model> <prompt>`
    ///
    /// `--print-logs` puts the session id on stderr where the scanner finds it.
    pub fn run_argv(&self, prompt: &str, model: &str) -> Vec<String> {
        vec![
            self.cli().to_string(),
            "run".to_string(),
            "--print-logs".to_string(),
            "--model".to_string(),
            model.to_string(),
            prompt.to_string(),
        ]
    }

    pub fn interactive_argv(&self, prompt: &str, model: &str, headless: bool) -> Vec<String> {
        let mut argv = vec![self.cli().to_string()];
        if headless {
            argv.extend([
                "run".to_string(),
                "--model".to_string(),
                model.to_string(),
                prompt.to_string(),
            ]);
        } else {
            argv.extend([
                "--model".to_string(),
                model.to_string(),
                "--prompt".to_string(),
                prompt.to_string(),
            ]);
        }
        argv
    }
}

impl<R: ProcessRunner> AgentAdapter for OpenCodeAdapter<R> {
    fn agent_type(&self) -> AgentType {
        AgentType::OpenCode
    }

    fn check_availability(&mut self) -> bool {
        let request = ProcessRequest::new([self.cli(), "--version"])
            .with_cwd(&self.options.cwd)
            .with_timeout(PROBE_TIMEOUT);
        self.version = probe_version(&self.runner, &request);
        self.version.is_some()
    }

    #[instrument(skip_all, fields(model = %model, headless))]
    fn run(&self, prompt: &str, model: &str, headless: bool) -> Result<RunResult> {
        info!("starting opencode run");
        let request = self
            .request(self.run_argv(prompt, model))
            .with_echo(!headless)
            .with_watch(COMPLETION_MARKER);
        let output = self.runner.run(&request)?;
        if output.timed_out {
            warn!(timeout_secs = self.options.timeout.as_secs(), "opencode run timed out");
        }
        let result = run_result(output);
        debug!(
            exit_code = result.exit_code,
            completion = result.completion_detected,
            session_id = ?result.session_id,
            "opencode run finished"
        );
        Ok(result)
    }

    #[instrument(skip_all, fields(model = %model, headless))]
    fn run_interactive(&self, prompt: &str, model: &str, headless: bool) -> Result<()> {
        let request = self.request(self.interactive_argv(prompt, model, headless));
        let exit_code = self.runner.run_interactive(&request)?;
        debug!(exit_code, "opencode session ended");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    fn export(&self, session_id: &str) -> Result<ExportOutcome> {
        let request = self.options.request(vec![
            self.cli().to_string(),
            "export".to_string(),
            session_id.to_string(),
        ]);
        let output = self.runner.run(&request)?;
        if !output.success {
            return Ok(ExportOutcome::failed(format!(
                "opencode export exited with status {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(match parse_export(&output.stdout) {
            Some(data) => ExportOutcome::exported(data),
            None => ExportOutcome::failed(format!(
                "opencode export for {session_id} did not print JSON"
            )),
        })
    }

    fn metadata(&self) -> AgentMetadata {
        let desc = descriptor(AgentType::OpenCode);
        AgentMetadata {
            name: desc.name,
            display_name: desc.display_name,
            cli_command: desc.cli_command,
            version: self.version.clone(),
        }
    }

    fn default_models(&self) -> DefaultModels {
        descriptor(AgentType::OpenCode).default_models
    }

    fn installation_url(&self) -> &'static str {
        descriptor(AgentType::OpenCode).installation_url
    }
}

/// Permission overrides in OpenCode's config shape, `None` for the CLI defaults.
fn permission_json(permissions: PermissionPosture) -> Option<String> {
    let value = match permissions {
        PermissionPosture::Default => return None,
        PermissionPosture::AcceptEdits => serde_json::json!({ "edit": "allow" }),
        PermissionPosture::Bypass => serde_json::json!({
            "edit": "allow",
            "bash": "allow",
            "webfetch": "allow",
        }),
    };
    Some(value.to_string())
}

/// Parse export output, skipping any banner printed before the JSON document.
fn parse_export(stdout: &str) -> Option<Value> {
    let trimmed = stdout.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let start = trimmed.find(['{', '['])?;
    serde_json::from_str(&trimmed[start..]).ok()
}
