//! Prompt resolution for `runloop run` and `runloop step`.
//!
//! The loop controllers only ever see a fully rendered prompt string. It comes
//! from `--prompt`, from `--prompt-file`, or from the built-in template for the
//! mode rendered with minijinja.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::completion::COMPLETION_MARKER;
use crate::core::types::Mode;

const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const BUILD_TEMPLATE: &str = include_str!("prompts/build.md");

/// Where the prompt text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptSource<'a> {
    Inline(&'a str),
    File(&'a Path),
    Builtin,
}

/// Produce the final prompt for `mode`.
pub fn resolve_prompt(
    source: &PromptSource<'_>,
    mode: Mode,
    project: Option<&str>,
) -> Result<String> {
    let prompt = match source {
        PromptSource::Inline(text) => (*text).to_string(),
        PromptSource::File(path) => fs::read_to_string(path)
            .with_context(|| format!("read prompt file {}", path.display()))?,
        PromptSource::Builtin => render_builtin(mode, project)?,
    };
    if prompt.trim().is_empty() {
        bail!("prompt is empty");
    }
    debug!(mode = %mode, bytes = prompt.len(), "prompt resolved");
    Ok(prompt)
}

/// Render the built-in template for `mode`.
pub fn render_builtin(mode: Mode, project: Option<&str>) -> Result<String> {
    let mut env = Environment::new();
    let (name, source) = match mode {
        Mode::Plan => ("plan", PLAN_TEMPLATE),
        Mode::Build => ("build", BUILD_TEMPLATE),
    };
    env.add_template(name, source)
        .with_context(|| format!("load {name} template"))?;
    let rendered = env
        .get_template(name)?
        .render(context! {
            mode => mode.as_str(),
            project => project.map(str::trim).filter(|p| !p.is_empty()),
            completion_marker => COMPLETION_MARKER,
        })
        .with_context(|| format!("render {name} template"))?;
    Ok(rendered)
}
