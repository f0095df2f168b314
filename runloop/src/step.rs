//! Single interactive iteration for `runloop step`.

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agents::{AgentFactory, AgentOptions, select_model};
use crate::core::types::{AgentMetadata, AgentType, Mode};
use crate::io::session_store::{SessionState, SessionStore};

/// Inputs for one `runloop step` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub mode: Mode,
    pub agent: AgentType,
    pub smart_model: Option<String>,
    pub fast_model: Option<String>,
    pub prompt: String,
    pub project: Option<String>,
    pub print_mode: bool,
}

/// Result of a step invocation.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub agent: AgentMetadata,
    pub model: String,
    /// The record appended to the session history.
    pub session: SessionState,
    pub persist_error: Option<String>,
}

/// Hand the terminal to the agent for one session, then record it.
///
/// `on_start` runs after the availability probe and before the agent takes
/// over the terminal. The interactive session has no completion detection and
/// no session id; it is always recorded as iteration 1.
#[instrument(skip_all, fields(agent = %request.agent, mode = %request.mode))]
pub fn run_step<F: AgentFactory + ?Sized>(
    factory: &F,
    store: &SessionStore,
    options: &AgentOptions,
    request: &StepRequest,
    on_start: impl FnOnce(&AgentMetadata, &str),
) -> Result<StepOutcome> {
    let adapter = factory.create_agent(request.agent, options)?;
    let model = select_model(
        adapter.as_ref(),
        request.mode,
        request.smart_model.as_deref(),
        request.fast_model.as_deref(),
    );
    let agent = adapter.metadata();
    let mut history = store
        .read()
        .with_context(|| format!("load session history {}", store.path().display()))?;
    on_start(&agent, &model);

    let started_at = Utc::now();
    info!(model = %model, "interactive session starting");
    let session_result = adapter.run_interactive(&request.prompt, &model, request.print_mode);

    let session = SessionState {
        iteration: 1,
        session_id: None,
        started_at,
        mode: request.mode,
        prompt: request.prompt.clone(),
        agent: request.agent,
        print_mode: request.agent.has_print_mode().then_some(request.print_mode),
        project: request.project.clone(),
    };
    history.push(session.clone());
    let persist_error = match store.write(&history) {
        Ok(()) => None,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "failed to persist session");
            Some(format!("{err:#}"))
        }
    };

    session_result.context("interactive session")?;
    info!("interactive session ended");
    Ok(StepOutcome {
        agent,
        model,
        session,
        persist_error,
    })
}
