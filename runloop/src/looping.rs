//! Multi-iteration run loop for `runloop run`.

use anyhow::{Context, Result, bail};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agents::{AgentFactory, AgentOptions, select_model};
use crate::core::types::{AgentMetadata, AgentType, Mode, RunResult};
use crate::io::session_store::{SessionState, SessionStore};

/// Inputs for one `runloop run` invocation, already resolved by the CLI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopRequest {
    pub mode: Mode,
    pub agent: AgentType,
    pub max_iterations: u32,
    pub smart_model: Option<String>,
    pub fast_model: Option<String>,
    /// Fully rendered prompt, sent unchanged on every iteration.
    pub prompt: String,
    pub project: Option<String>,
    /// Run headless. Recorded on each session for agents that have a print mode.
    pub print_mode: bool,
}

/// Progress reported to the caller while the loop runs.
#[derive(Debug, Clone)]
pub enum LoopEvent {
    /// The agent passed its availability probe.
    Started { agent: AgentMetadata, model: String },
    Iteration(IterationReport),
}

/// One finished iteration.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: u32,
    pub max_iterations: u32,
    pub result: RunResult,
    /// Output was mirrored to the terminal while the agent ran.
    pub echoed: bool,
    /// Set when the session document could not be written.
    pub persist_error: Option<String>,
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStop {
    /// An iteration printed the completion marker.
    Completed { iterations: u32 },
    /// Every iteration ran without the marker. Not an error.
    MaxIterations { max_iterations: u32 },
}

impl LoopStop {
    pub fn is_completed(self) -> bool {
        matches!(self, LoopStop::Completed { .. })
    }

    pub fn message(self) -> String {
        match self {
            LoopStop::Completed { iterations } => {
                format!("Completed in {iterations} iteration(s)")
            }
            LoopStop::MaxIterations { max_iterations } => {
                format!("Stopped at maximum iterations ({max_iterations}) without completion")
            }
        }
    }
}

/// Summary of a loop invocation.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub agent: AgentMetadata,
    pub model: String,
    pub iterations_run: u32,
    pub stop: LoopStop,
    /// Iterations whose session record could not be persisted.
    pub persist_failures: u32,
}

/// Run the agent until it prints the completion marker or the budget runs out.
///
/// An unavailable agent fails before any iteration. A non-zero agent exit is
/// not a failure; only the marker decides whether the loop continues. Every
/// iteration appends one [`SessionState`] and rewrites the whole history.
#[instrument(skip_all, fields(agent = %request.agent, mode = %request.mode, max_iterations = request.max_iterations))]
pub fn run_loop<F: AgentFactory + ?Sized, CB: FnMut(&LoopEvent)>(
    factory: &F,
    store: &SessionStore,
    options: &AgentOptions,
    request: &LoopRequest,
    mut on_event: CB,
) -> Result<LoopOutcome> {
    if request.max_iterations == 0 {
        bail!("max_iterations must be > 0");
    }

    let adapter = factory.create_agent(request.agent, options)?;
    let model = select_model(
        adapter.as_ref(),
        request.mode,
        request.smart_model.as_deref(),
        request.fast_model.as_deref(),
    );
    let agent = adapter.metadata();
    info!(model = %model, version = ?agent.version, "loop starting");
    on_event(&LoopEvent::Started {
        agent: agent.clone(),
        model: model.clone(),
    });

    let mut history = store
        .read()
        .with_context(|| format!("load session history {}", store.path().display()))?;
    let headless = request.print_mode;
    let print_mode = request.agent.has_print_mode().then_some(request.print_mode);
    let mut persist_failures = 0u32;

    for iteration in 1..=request.max_iterations {
        info!(iteration, "iteration starting");
        let started_at = Utc::now();
        let run = adapter.run(&request.prompt, &model, headless);

        history.push(SessionState {
            iteration,
            session_id: run.as_ref().ok().and_then(|r| r.session_id.clone()),
            started_at,
            mode: request.mode,
            prompt: request.prompt.clone(),
            agent: request.agent,
            print_mode,
            project: request.project.clone(),
        });
        let persist_error = match store.write(&history) {
            Ok(()) => None,
            Err(err) => {
                warn!(iteration, err = %format!("{err:#}"), "failed to persist session");
                persist_failures += 1;
                Some(format!("{err:#}"))
            }
        };

        let result = run.with_context(|| format!("iteration {iteration}"))?;
        let completed = result.completion_detected;
        info!(
            iteration,
            exit_code = result.exit_code,
            completed,
            "iteration finished"
        );
        on_event(&LoopEvent::Iteration(IterationReport {
            iteration,
            max_iterations: request.max_iterations,
            result,
            echoed: !headless,
            persist_error,
        }));

        if completed {
            return Ok(LoopOutcome {
                agent,
                model,
                iterations_run: iteration,
                stop: LoopStop::Completed {
                    iterations: iteration,
                },
                persist_failures,
            });
        }
    }

    warn!(max_iterations = request.max_iterations, "iteration budget exhausted");
    Ok(LoopOutcome {
        agent,
        model,
        iterations_run: request.max_iterations,
        stop: LoopStop::MaxIterations {
            max_iterations: request.max_iterations,
        },
        persist_failures,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::agents::AgentUnavailableError;
    use crate::io::paths::RunloopPaths;
    use crate::test_support::{AgentCall, FactoryEntry, ScriptedAgent, ScriptedFactory, run_result};

    fn store_in(root: &Path) -> SessionStore {
        let paths = RunloopPaths::new(root);
        SessionStore::new(paths.state_dir, paths.sessions_path)
    }

    fn request(agent: AgentType, max_iterations: u32) -> LoopRequest {
        LoopRequest {
            mode: Mode::Build,
            agent,
            max_iterations,
            smart_model: None,
            fast_model: None,
            prompt: "build the next task".to_string(),
            project: None,
            print_mode: true,
        }
    }

    fn iterations(events: &[LoopEvent]) -> Vec<u32> {
        events
            .iter()
            .filter_map(|event| match event {
                LoopEvent::Iteration(report) => Some(report.iteration),
                LoopEvent::Started { .. } => None,
            })
            .collect()
    }

    #[test]
    fn never_completing_agent_runs_exactly_max_iterations() {
        for max in 1..=4 {
            let temp = tempfile::tempdir().expect("tempdir");
            let agent = ScriptedAgent::never_completes(AgentType::OpenCode);
            let factory = ScriptedFactory::serving(&agent);
            let store = store_in(temp.path());

            let outcome = run_loop(
                &factory,
                &store,
                &AgentOptions::new(temp.path()),
                &request(AgentType::OpenCode, max),
                |_| {},
            )
            .expect("loop");

            assert_eq!(agent.run_count(), max as usize);
            assert_eq!(outcome.iterations_run, max);
            assert_eq!(outcome.stop, LoopStop::MaxIterations { max_iterations: max });
            assert_eq!(store.read().expect("read").len(), max as usize);
        }
    }

    #[test]
    fn first_completion_stops_the_loop() {
        for k in 1..=5 {
            let temp = tempfile::tempdir().expect("tempdir");
            let agent = ScriptedAgent::completes_on(AgentType::OpenCode, k);
            let factory = ScriptedFactory::serving(&agent);
            let mut events = Vec::new();

            let outcome = run_loop(
                &factory,
                &store_in(temp.path()),
                &AgentOptions::new(temp.path()),
                &request(AgentType::OpenCode, 5),
                |event| events.push(event.clone()),
            )
            .expect("loop");

            assert_eq!(agent.run_count(), k as usize);
            assert_eq!(outcome.stop, LoopStop::Completed { iterations: k });
            assert_eq!(iterations(&events), (1..=k).collect::<Vec<_>>());
        }
    }

    #[test]
    fn max_iteration_message_names_the_budget() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::never_completes(AgentType::OpenCode);
        let outcome = run_loop(
            &ScriptedFactory::serving(&agent),
            &store_in(temp.path()),
            &AgentOptions::new(temp.path()),
            &request(AgentType::OpenCode, 3),
            |_| {},
        )
        .expect("loop");

        assert_eq!(agent.run_count(), 3);
        assert_eq!(
            outcome.stop.message(),
            "Stopped at maximum iterations (3) without completion"
        );
        assert!(!outcome.stop.is_completed());
    }

    #[test]
    fn completion_on_second_call_reports_two_iterations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::new(
            AgentType::ClaudeCode,
            vec![run_result(Some("a"), false), run_result(Some("b"), true)],
        );
        let outcome = run_loop(
            &ScriptedFactory::serving(&agent),
            &store_in(temp.path()),
            &AgentOptions::new(temp.path()),
            &request(AgentType::ClaudeCode, 10),
            |_| {},
        )
        .expect("loop");

        assert_eq!(agent.run_count(), 2);
        assert_eq!(outcome.stop.message(), "Completed in 2 iteration(s)");
    }

    #[test]
    fn non_zero_exit_does_not_end_the_loop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut failing = run_result(None, false);
        failing.exit_code = 2;
        let mut done = run_result(None, true);
        done.exit_code = 1;
        let agent = ScriptedAgent::new(AgentType::OpenCode, vec![failing, done]);

        let outcome = run_loop(
            &ScriptedFactory::serving(&agent),
            &store_in(temp.path()),
            &AgentOptions::new(temp.path()),
            &request(AgentType::OpenCode, 5),
            |_| {},
        )
        .expect("loop");
        assert_eq!(outcome.stop, LoopStop::Completed { iterations: 2 });
    }

    #[test]
    fn unavailable_agent_is_fatal_before_any_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let factory = ScriptedFactory::new().with(AgentType::ClaudeCode, FactoryEntry::Unavailable);
        let store = store_in(temp.path());

        let err = run_loop(
            &factory,
            &store,
            &AgentOptions::new(temp.path()),
            &request(AgentType::ClaudeCode, 3),
            |_| panic!("no events expected"),
        )
        .unwrap_err();

        assert!(err.downcast_ref::<AgentUnavailableError>().is_some());
        assert!(!store.path().exists());
    }

    #[test]
    fn sessions_are_appended_to_existing_history() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        let first = ScriptedAgent::completes_on(AgentType::OpenCode, 1);
        run_loop(
            &ScriptedFactory::serving(&first),
            &store,
            &AgentOptions::new(temp.path()),
            &request(AgentType::OpenCode, 3),
            |_| {},
        )
        .expect("first loop");

        let second = ScriptedAgent::completes_on(AgentType::ClaudeCode, 2);
        let mut req = request(AgentType::ClaudeCode, 3);
        req.mode = Mode::Plan;
        req.project = Some("billing".to_string());
        req.print_mode = false;
        run_loop(
            &ScriptedFactory::serving(&second),
            &store,
            &AgentOptions::new(temp.path()),
            &req,
            |_| {},
        )
        .expect("second loop");

        let sessions = store.read().expect("read");
        assert_eq!(sessions.len(), 3);
        assert_eq!(sessions[0].agent, AgentType::OpenCode);
        assert_eq!(sessions[0].print_mode, None);
        assert_eq!(sessions[0].session_id.as_deref(), Some("ses_1"));
        assert_eq!(sessions[1].iteration, 1);
        assert_eq!(sessions[2].iteration, 2);
        assert_eq!(sessions[2].agent, AgentType::ClaudeCode);
        assert_eq!(sessions[2].mode, Mode::Plan);
        assert_eq!(sessions[2].print_mode, Some(false));
        assert_eq!(sessions[2].project.as_deref(), Some("billing"));
        assert!(sessions[1].started_at <= sessions[2].started_at);
    }

    #[test]
    fn mode_picks_model_and_print_mode_sets_headless() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::completes_on(AgentType::ClaudeCode, 1);
        let mut req = request(AgentType::ClaudeCode, 1);
        req.mode = Mode::Plan;
        req.smart_model = Some("opus-custom".to_string());

        let outcome = run_loop(
            &ScriptedFactory::serving(&agent),
            &store_in(temp.path()),
            &AgentOptions::new(temp.path()),
            &req,
            |_| {},
        )
        .expect("loop");

        assert_eq!(outcome.model, "opus-custom");
        assert_eq!(
            agent.calls(),
            vec![AgentCall::Run {
                prompt: "build the next task".to_string(),
                model: "opus-custom".to_string(),
                headless: true,
            }]
        );
    }

    #[test]
    fn persist_failure_is_reported_and_loop_continues() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A file where the state directory should be makes every write fail.
        let blocked = temp.path().join("state");
        fs::write(&blocked, "not a directory").expect("write");
        let store = SessionStore::new(&blocked, temp.path().join("sessions.json"));
        let agent = ScriptedAgent::completes_on(AgentType::OpenCode, 2);
        let mut persist_errors = 0;

        let outcome = run_loop(
            &ScriptedFactory::serving(&agent),
            &store,
            &AgentOptions::new(temp.path()),
            &request(AgentType::OpenCode, 3),
            |event| {
                if matches!(event, LoopEvent::Iteration(report) if report.persist_error.is_some()) {
                    persist_errors += 1;
                }
            },
        )
        .expect("loop");

        assert_eq!(outcome.stop, LoopStop::Completed { iterations: 2 });
        assert_eq!(outcome.persist_failures, 2);
        assert_eq!(persist_errors, 2);
    }

    #[test]
    fn run_error_is_recorded_then_propagated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store_in(temp.path());
        let agent = ScriptedAgent::never_completes(AgentType::OpenCode).with_failing_runs("boom");

        let err = run_loop(
            &ScriptedFactory::serving(&agent),
            &store,
            &AgentOptions::new(temp.path()),
            &request(AgentType::OpenCode, 3),
            |_| {},
        )
        .unwrap_err();

        assert!(format!("{err:#}").contains("iteration 1: boom"));
        let sessions = store.read().expect("read");
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, None);
    }

    #[test]
    fn zero_budget_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let agent = ScriptedAgent::never_completes(AgentType::OpenCode);
        let factory = ScriptedFactory::serving(&agent);
        let result = run_loop(
            &factory,
            &store_in(temp.path()),
            &AgentOptions::new(temp.path()),
            &request(AgentType::OpenCode, 0),
            |_| {},
        );
        assert!(result.is_err());
        assert!(factory.calls().is_empty());
    }
}
