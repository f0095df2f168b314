//! Test-only doubles for the process and agent seams.
//!
//! Every double is `Clone` and shares its state, so a test can hand one copy
//! to the code under test and inspect the other afterwards.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::agents::{AgentAdapter, AgentFactory, AgentOptions, AgentUnavailableError, descriptor};
use crate::core::completion::COMPLETION_MARKER;
use crate::core::types::{AgentMetadata, AgentType, DefaultModels, ExportOutcome, RunResult};
use crate::io::process::{ProcessOutput, ProcessRequest, ProcessRunner};

/// What a [`RecordingProcessRunner`] does for one request.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    Output(ProcessOutput),
    /// The process cannot be started.
    SpawnError(String),
}

impl ScriptedResponse {
    pub fn exit(exit_code: i32, stdout: &str) -> Self {
        Self::Output(ProcessOutput::exited(exit_code, stdout, ""))
    }

    pub fn exit_with_stderr(exit_code: i32, stdout: &str, stderr: &str) -> Self {
        Self::Output(ProcessOutput::exited(exit_code, stdout, stderr))
    }

    pub fn spawn_error(message: &str) -> Self {
        Self::SpawnError(message.to_string())
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    responses: VecDeque<ScriptedResponse>,
    requests: Vec<ProcessRequest>,
}

/// [`ProcessRunner`] that replays scripted responses in order and records requests.
#[derive(Debug, Clone, Default)]
pub struct RecordingProcessRunner {
    state: Rc<RefCell<RecordingState>>,
}

impl RecordingProcessRunner {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            state: Rc::new(RefCell::new(RecordingState {
                responses: responses.into(),
                requests: Vec::new(),
            })),
        }
    }

    pub fn requests(&self) -> Vec<ProcessRequest> {
        self.state.borrow().requests.clone()
    }

    fn next(&self, request: &ProcessRequest) -> Result<ProcessOutput> {
        let mut state = self.state.borrow_mut();
        state.requests.push(request.clone());
        match state.responses.pop_front() {
            Some(ScriptedResponse::Output(output)) => Ok(output),
            Some(ScriptedResponse::SpawnError(message)) => {
                Err(anyhow!("spawn {}: {message}", request.program()))
            }
            None => Err(anyhow!(
                "no scripted response left for {:?}",
                request.argv
            )),
        }
    }
}

impl ProcessRunner for RecordingProcessRunner {
    fn run(&self, request: &ProcessRequest) -> Result<ProcessOutput> {
        self.next(request)
    }

    fn run_interactive(&self, request: &ProcessRequest) -> Result<i32> {
        self.next(request).map(|output| output.exit_code)
    }
}

/// Build a [`RunResult`] as an adapter would report it.
pub fn run_result(session_id: Option<&str>, complete: bool) -> RunResult {
    let stdout = if complete {
        format!("all done\n{COMPLETION_MARKER}\n")
    } else {
        "still working\n".to_string()
    };
    RunResult {
        stdout,
        stderr: String::new(),
        session_id: session_id.map(str::to_string),
        completion_detected: complete,
        exit_code: 0,
    }
}

/// How a [`ScriptedAgent`] answers `export` for one session id.
#[derive(Debug, Clone)]
pub enum ScriptedExport {
    Data(Value),
    /// `Ok` outcome with `success == false`.
    Failed(String),
    /// The export call itself returns `Err`.
    Error(String),
}

/// One call observed by a [`ScriptedAgent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentCall {
    Run {
        prompt: String,
        model: String,
        headless: bool,
    },
    Interactive {
        prompt: String,
        model: String,
        headless: bool,
    },
    Export {
        session_id: String,
    },
}

#[derive(Debug)]
struct AgentScript {
    agent_type: AgentType,
    results: VecDeque<RunResult>,
    exports: BTreeMap<String, ScriptedExport>,
    calls: Vec<AgentCall>,
    fail_runs: Option<String>,
    observed_file: Option<PathBuf>,
    observations: Vec<Option<String>>,
}

/// [`AgentAdapter`] with scripted run results and exports.
///
/// Once the scripted results run out every further `run` reports an
/// incomplete iteration without a session id.
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    script: Rc<RefCell<AgentScript>>,
}

impl ScriptedAgent {
    pub fn new(agent_type: AgentType, results: Vec<RunResult>) -> Self {
        Self {
            script: Rc::new(RefCell::new(AgentScript {
                agent_type,
                results: results.into(),
                exports: BTreeMap::new(),
                calls: Vec::new(),
                fail_runs: None,
                observed_file: None,
                observations: Vec::new(),
            })),
        }
    }

    /// Agent whose run never reports completion.
    pub fn never_completes(agent_type: AgentType) -> Self {
        Self::new(agent_type, Vec::new())
    }

    /// Agent that completes on the `n`th run (1-based).
    pub fn completes_on(agent_type: AgentType, n: u32) -> Self {
        let results = (1..=n)
            .map(|i| run_result(Some(&format!("ses_{i}")), i == n))
            .collect();
        Self::new(agent_type, results)
    }

    #[must_use]
    pub fn with_export(self, session_id: &str, export: ScriptedExport) -> Self {
        self.script
            .borrow_mut()
            .exports
            .insert(session_id.to_string(), export);
        self
    }

    /// Make every `run` return `Err(message)`.
    #[must_use]
    pub fn with_failing_runs(self, message: &str) -> Self {
        self.script.borrow_mut().fail_runs = Some(message.to_string());
        self
    }

    /// Read `path` at every `export` call; see [`Self::observations`].
    #[must_use]
    pub fn with_observed_file(self, path: impl Into<PathBuf>) -> Self {
        self.script.borrow_mut().observed_file = Some(path.into());
        self
    }

    /// Contents of the observed file at each export, `None` where it could not be read.
    pub fn observations(&self) -> Vec<Option<String>> {
        self.script.borrow().observations.clone()
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.script.borrow().calls.clone()
    }

    pub fn run_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, AgentCall::Run { .. }))
            .count()
    }
}

impl AgentAdapter for ScriptedAgent {
    fn agent_type(&self) -> AgentType {
        self.script.borrow().agent_type
    }

    fn check_availability(&mut self) -> bool {
        true
    }

    fn run(&self, prompt: &str, model: &str, headless: bool) -> Result<RunResult> {
        let mut script = self.script.borrow_mut();
        script.calls.push(AgentCall::Run {
            prompt: prompt.to_string(),
            model: model.to_string(),
            headless,
        });
        if let Some(message) = &script.fail_runs {
            return Err(anyhow!("{message}"));
        }
        Ok(script
            .results
            .pop_front()
            .unwrap_or_else(|| run_result(None, false)))
    }

    fn run_interactive(&self, prompt: &str, model: &str, headless: bool) -> Result<()> {
        self.script.borrow_mut().calls.push(AgentCall::Interactive {
            prompt: prompt.to_string(),
            model: model.to_string(),
            headless,
        });
        Ok(())
    }

    fn export(&self, session_id: &str) -> Result<ExportOutcome> {
        let mut script = self.script.borrow_mut();
        script.calls.push(AgentCall::Export {
            session_id: session_id.to_string(),
        });
        if let Some(path) = script.observed_file.clone() {
            script.observations.push(fs::read_to_string(path).ok());
        }
        match script.exports.get(session_id) {
            Some(ScriptedExport::Data(value)) => Ok(ExportOutcome::exported(value.clone())),
            Some(ScriptedExport::Failed(message)) => Ok(ExportOutcome::failed(message.clone())),
            Some(ScriptedExport::Error(message)) => Err(anyhow!("{message}")),
            None => Ok(ExportOutcome::failed(format!("unknown session {session_id}"))),
        }
    }

    fn metadata(&self) -> AgentMetadata {
        let desc = descriptor(self.agent_type());
        AgentMetadata {
            name: desc.name,
            display_name: desc.display_name,
            cli_command: desc.cli_command,
            version: Some("0.0.0-test".to_string()),
        }
    }

    fn default_models(&self) -> DefaultModels {
        descriptor(self.agent_type()).default_models
    }

    fn installation_url(&self) -> &'static str {
        descriptor(self.agent_type()).installation_url
    }
}

/// What a [`ScriptedFactory`] hands out for one agent type.
#[derive(Debug, Clone)]
pub enum FactoryEntry {
    Available(ScriptedAgent),
    /// Fails with [`AgentUnavailableError`].
    Unavailable,
    /// Fails with a plain error.
    Broken(String),
}

/// [`AgentFactory`] with a fixed entry per agent type. Unlisted types are unavailable.
#[derive(Debug, Clone, Default)]
pub struct ScriptedFactory {
    entries: BTreeMap<AgentType, FactoryEntry>,
    calls: Rc<RefCell<Vec<AgentType>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that serves `agent` for its own type.
    pub fn serving(agent: &ScriptedAgent) -> Self {
        Self::new().with(agent.agent_type(), FactoryEntry::Available(agent.clone()))
    }

    #[must_use]
    pub fn with(mut self, agent_type: AgentType, entry: FactoryEntry) -> Self {
        self.entries.insert(agent_type, entry);
        self
    }

    /// Agent types requested so far, in order.
    pub fn calls(&self) -> Vec<AgentType> {
        self.calls.borrow().clone()
    }
}

impl AgentFactory for ScriptedFactory {
    fn create_agent(
        &self,
        agent_type: AgentType,
        _options: &AgentOptions,
    ) -> Result<Box<dyn AgentAdapter>> {
        self.calls.borrow_mut().push(agent_type);
        match self.entries.get(&agent_type) {
            Some(FactoryEntry::Available(agent)) => Ok(Box::new(agent.clone())),
            Some(FactoryEntry::Broken(message)) => Err(anyhow!("{message}")),
            Some(FactoryEntry::Unavailable) | None => {
                Err(AgentUnavailableError::for_agent(agent_type).into())
            }
        }
    }
}
