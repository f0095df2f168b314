//! Claude Code adapter: drives the `claude` CLI.
//!
//! Print mode (`-p`) is the headless dialect. With `--output-format
//! stream-json` every event line carries `"session_id"`, which is what the
//! session scanner keys on. Exports read the transcript Claude Code keeps
//! under `~/.claude/projects/<encoded cwd>/<session id>.jsonl`.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::{AgentAdapter, AgentOptions, PROBE_TIMEOUT, descriptor, probe_version, run_result};
use crate::core::completion::COMPLETION_MARKER;
use crate::core::types::{
    AgentMetadata, AgentType, DefaultModels, ExportOutcome, PermissionPosture, RunResult,
};
use crate::io::process::{ProcessRequest, ProcessRunner, SystemProcessRunner};

/// Adapter for the Claude Code CLI.
pub struct ClaudeCodeAdapter<R = SystemProcessRunner> {
    runner: R,
    options: AgentOptions,
    version: Option<String>,
    projects_dir: Option<PathBuf>,
}

impl<R: ProcessRunner> ClaudeCodeAdapter<R> {
    pub fn new(runner: R, options: AgentOptions) -> Self {
        Self {
            runner,
            options,
            version: None,
            projects_dir: None,
        }
    }

    /// Read transcripts from `dir` instead of `~/.claude/projects`.
    #[must_use]
    pub fn with_projects_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.projects_dir = Some(dir.into());
        self
    }

    fn cli(&self) -> &'static str {
        descriptor(AgentType::ClaudeCode).cli_command
    }

    fn push_model_and_permissions(&self, argv: &mut Vec<String>, model: &str) {
        argv.push("--model".to_string());
        argv.push(model.to_string());
        if let Some(mode) = permission_mode(self.options.permissions) {
            argv.push("--permission-mode".to_string());
            argv.push(mode.to_string());
        }
    }

    /// Print-mode argv. Headless runs stream JSON events so the session id is captured.
    pub fn run_argv(&self, prompt: &str, model: &str, headless: bool) -> Vec<String> {
        let mut argv = vec![self.cli().to_string(), "-p".to_string(), prompt.to_string()];
        self.push_model_and_permissions(&mut argv, model);
        if headless {
            argv.extend([
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ]);
        }
        argv
    }

    pub fn interactive_argv(&self, prompt: &str, model: &str, headless: bool) -> Vec<String> {
        if headless {
            let mut argv = vec![self.cli().to_string(), "-p".to_string(), prompt.to_string()];
            self.push_model_and_permissions(&mut argv, model);
            return argv;
        }
        let mut argv = vec![self.cli().to_string()];
        self.push_model_and_permissions(&mut argv, model);
        argv.push(prompt.to_string());
        argv
    }

    fn projects_dir(&self) -> Option<PathBuf> {
        self.projects_dir
            .clone()
            .or_else(|| dirs::home_dir().map(|home| home.join(".claude").join("projects")))
    }

    /// Where Claude Code keeps the transcript for `session_id`.
    ///
    /// `None` when there is no home directory or the id is not a plain file name.
    pub fn transcript_path(&self, session_id: &str) -> Option<PathBuf> {
        if !is_plain_session_id(session_id) {
            return None;
        }
        let cwd = std::path::absolute(&self.options.cwd)
            .unwrap_or_else(|_| self.options.cwd.clone());
        Some(
            self.projects_dir()?
                .join(encode_project_dir(&cwd))
                .join(format!("{session_id}.jsonl")),
        )
    }
}

impl<R: ProcessRunner> AgentAdapter for ClaudeCodeAdapter<R> {
    fn agent_type(&self) -> AgentType {
        AgentType::ClaudeCode
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
        info!("starting claude run");
        let request = self
            .options
            .request(self.run_argv(prompt, model, headless))
            .with_echo(!headless)
            .with_watch(COMPLETION_MARKER);
        let output = self.runner.run(&request)?;
        if output.timed_out {
            warn!(timeout_secs = self.options.timeout.as_secs(), "claude run timed out");
        }
        let result = run_result(output);
        debug!(
            exit_code = result.exit_code,
            completion = result.completion_detected,
            session_id = ?result.session_id,
            "claude run finished"
        );
        Ok(result)
    }

    #[instrument(skip_all, fields(model = %model, headless))]
    fn run_interactive(&self, prompt: &str, model: &str, headless: bool) -> Result<()> {
        let request = self
            .options
            .request(self.interactive_argv(prompt, model, headless));
        let exit_code = self.runner.run_interactive(&request)?;
        debug!(exit_code, "claude session ended");
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    fn export(&self, session_id: &str) -> Result<ExportOutcome> {
        if !is_plain_session_id(session_id) {
            warn!("refusing to read transcript for unsafe session id");
            return Ok(ExportOutcome::failed(format!(
                "invalid session id {session_id:?}: must not contain path separators or `..`"
            )));
        }
        let Some(path) = self.transcript_path(session_id) else {
            return Ok(ExportOutcome::failed(
                "cannot locate Claude Code transcripts: no home directory",
            ));
        };
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok(ExportOutcome::failed(format!(
                    "no transcript for session {session_id} at {}",
                    path.display()
                )));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read transcript {}", path.display()));
            }
        };
        Ok(match parse_transcript(&contents) {
            Ok(events) => {
                debug!(events = events.len(), path = %path.display(), "transcript loaded");
                ExportOutcome::exported(Value::Array(events))
            }
            Err(message) => ExportOutcome::failed(format!("{}: {message}", path.display())),
        })
    }

    fn metadata(&self) -> AgentMetadata {
        let desc = descriptor(AgentType::ClaudeCode);
        AgentMetadata {
            name: desc.name,
            display_name: desc.display_name,
            cli_command: desc.cli_command,
            version: self.version.clone(),
        }
    }

    fn default_models(&self) -> DefaultModels {
        descriptor(AgentType::ClaudeCode).default_models
    }

    fn installation_url(&self) -> &'static str {
        descriptor(AgentType::ClaudeCode).installation_url
    }
}

fn permission_mode(permissions: PermissionPosture) -> Option<&'static str> {
    match permissions {
        PermissionPosture::Default => None,
        PermissionPosture::AcceptEdits => Some("acceptEdits"),
        PermissionPosture::Bypass => Some("bypassPermissions"),
    }
}

/// Claude Code names project directories after the absolute cwd with every
/// non-alphanumeric character replaced by `-`.
/// Session ids become a file name under the projects directory.
fn is_plain_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id != "."
        && !session_id.contains("..")
        && !session_id.contains(['/', '\\'])
}

fn encode_project_dir(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// One JSON value per non-empty line.
fn parse_transcript(contents: &str) -> std::result::Result<Vec<Value>, String> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|err| format!("line {}: {err}", idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingProcessRunner, ScriptedResponse};

    fn adapter_with(
        responses: Vec<ScriptedResponse>,
        permissions: PermissionPosture,
    ) -> (ClaudeCodeAdapter<RecordingProcessRunner>, RecordingProcessRunner) {
        let runner = RecordingProcessRunner::new(responses);
        let mut options = AgentOptions::new("/work/my.repo");
        options.permissions = permissions;
        (ClaudeCodeAdapter::new(runner.clone(), options), runner)
    }

    #[test]
    fn headless_run_streams_json_and_finds_session() {
        let (adapter, runner) = adapter_with(
            vec![ScriptedResponse::exit(
                0,
                "{\"type\":\"system\",\"session_id\":\"0b7c-11\"}\n\
                 {\"type\":\"result\",\"result\":\"<promise>COMPLETE</promise>\"}\n",
            )],
            PermissionPosture::Default,
        );

        let result = adapter.run("ship it", "sonnet", true).expect("run");
        assert!(result.completion_detected);
        assert_eq!(result.session_id.as_deref(), Some("0b7c-11"));

        let requests = runner.requests();
        assert_eq!(
            requests[0].argv,
            vec![
                "claude",
                "-p",
                "ship it",
                "--model",
                "sonnet",
                "--output-format",
                "stream-json",
                "--verbose"
            ]
        );
        assert!(!requests[0].echo);
        assert_eq!(requests[0].watch, vec![COMPLETION_MARKER]);
    }

    #[test]
    fn visible_run_echoes_plain_output() {
        let (adapter, runner) = adapter_with(
            vec![ScriptedResponse::exit(0, "working\n")],
            PermissionPosture::AcceptEdits,
        );
        let result = adapter.run("p", "opus", false).expect("run");
        assert!(!result.completion_detected);

        let requests = runner.requests();
        assert_eq!(
            requests[0].argv,
            vec!["claude", "-p", "p", "--model", "opus", "--permission-mode", "acceptEdits"]
        );
        assert!(requests[0].echo);
    }

    #[test]
    fn interactive_argv_depends_on_headless() {
        let (adapter, runner) = adapter_with(
            vec![ScriptedResponse::exit(0, ""), ScriptedResponse::exit(0, "")],
            PermissionPosture::Bypass,
        );
        adapter.run_interactive("p", "opus", false).expect("tui");
        adapter.run_interactive("p", "opus", true).expect("print");
        let requests = runner.requests();
        assert_eq!(
            requests[0].argv,
            vec!["claude", "--model", "opus", "--permission-mode", "bypassPermissions", "p"]
        );
        assert_eq!(
            requests[1].argv,
            vec!["claude", "-p", "p", "--model", "opus", "--permission-mode", "bypassPermissions"]
        );
    }

    #[test]
    fn project_dir_encoding_replaces_punctuation() {
        assert_eq!(
            encode_project_dir(Path::new("/home/me/my.repo")),
            "-home-me-my-repo"
        );
    }

    #[test]
    fn export_reads_jsonl_transcript() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (adapter, runner) = adapter_with(Vec::new(), PermissionPosture::Default);
        let adapter = adapter.with_projects_dir(temp.path());

        let project = temp.path().join("-work-my-repo");
        fs::create_dir_all(&project).expect("mkdir");
        fs::write(
            project.join("abc.jsonl"),
            "{\"type\":\"user\"}\n\n{\"type\":\"assistant\"}\n",
        )
        .expect("write");

        let outcome = adapter.export("abc").expect("export");
        assert!(outcome.success);
        let events = outcome.export_data.expect("data");
        assert_eq!(events.as_array().map(Vec::len), Some(2));
        assert_eq!(events[1]["type"], "assistant");
        assert!(runner.requests().is_empty());
    }

    #[test]
    fn export_of_unknown_session_fails_softly() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (adapter, _) = adapter_with(Vec::new(), PermissionPosture::Default);
        let adapter = adapter.with_projects_dir(temp.path());

        let outcome = adapter.export("missing").expect("export");
        assert!(!outcome.success);
        assert!(outcome.export_data.is_none());
        assert!(outcome.error.expect("error").contains("missing"));
    }

    #[test]
    fn export_rejects_ids_that_leave_the_projects_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let projects = temp.path().join("projects");
        fs::create_dir_all(projects.join("-work-my-repo")).expect("mkdir");
        fs::write(temp.path().join("secret.jsonl"), "{\"leaked\":true}\n").expect("write");
        let (adapter, _) = adapter_with(Vec::new(), PermissionPosture::Default);
        let adapter = adapter.with_projects_dir(&projects);

        for id in ["../../secret", "a/b", "a\\b", "..", "", "."] {
            let outcome = adapter.export(id).expect("export");
            assert!(!outcome.success, "{id:?}");
            assert!(outcome.export_data.is_none());
            assert!(outcome.error.expect("error").contains("invalid session id"));
            assert_eq!(adapter.transcript_path(id), None);
        }
        assert!(adapter.transcript_path("0b7c-11").is_some());
    }

    #[test]
    fn malformed_transcript_line_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (adapter, _) = adapter_with(Vec::new(), PermissionPosture::Default);
        let adapter = adapter.with_projects_dir(temp.path());
        let project = temp.path().join("-work-my-repo");
        fs::create_dir_all(&project).expect("mkdir");
        fs::write(project.join("bad.jsonl"), "{\"ok\":1}\n{oops\n").expect("write");

        let outcome = adapter.export("bad").expect("export");
        assert!(!outcome.success);
        assert!(outcome.error.expect("error").contains("line 2"));
    }

    #[test]
    fn metadata_reports_probe_version() {
        let (mut adapter, _) = adapter_with(
            vec![ScriptedResponse::exit(0, "1.0.83 (Claude Code)\n")],
            PermissionPosture::Default,
        );
        assert!(adapter.check_availability());
        let meta = adapter.metadata();
        assert_eq!(meta.display_name, "Claude Code");
        assert_eq!(meta.version.as_deref(), Some("1.0.83"));
        assert_eq!(adapter.default_models().smart, "opus");
    }
}
