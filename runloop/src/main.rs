//! `runloop`: drive a coding agent until it signals completion.
//!
//! State lives under `.runloop/` in the current directory: an optional
//! `config.toml`, the session history in `state/sessions.json` and the default
//! `inspect.json` export.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use runloop::agents::{AgentOptions, AgentUnavailableError, CliAgentFactory};
use runloop::core::types::{AgentType, Mode, PermissionPosture};
use runloop::exit_codes;
use runloop::inspect::export_all;
use runloop::io::config::{RunloopConfig, load_config, write_config};
use runloop::io::paths::RunloopPaths;
use runloop::io::process::SystemProcessRunner;
use runloop::io::prompt::{PromptSource, resolve_prompt};
use runloop::io::session_store::SessionStore;
use runloop::logging;
use runloop::looping::{LoopEvent, LoopRequest, run_loop};
use runloop::step::{StepRequest, run_step};

#[derive(Parser)]
#[command(
    name = "runloop",
    version,
    about = "Run a coding agent in a loop until it signals completion"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.runloop/` and a default `config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Run the agent repeatedly until it prints the completion marker.
    Run {
        /// plan or build.
        mode: Mode,
        #[command(flatten)]
        agent: AgentArgs,
        /// Iteration budget (default from config, else 10).
        #[arg(long)]
        max_iterations: Option<u32>,
        /// Exit with a distinct code when the budget runs out without completion.
        #[arg(long)]
        strict: bool,
    },
    /// Start one interactive agent session.
    Step {
        /// plan or build.
        mode: Mode,
        #[command(flatten)]
        agent: AgentArgs,
    },
    /// Export every recorded session through its agent.
    Inspect {
        /// Output file (default `.runloop/inspect.json`).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the recorded session history.
    Sessions,
}

/// Agent, model and prompt selection shared by `run` and `step`.
#[derive(Args, Debug, Clone, Default)]
struct AgentArgs {
    /// opencode or claude-code.
    #[arg(long)]
    agent: Option<AgentType>,
    /// default, accept-edits or bypass.
    #[arg(long)]
    permissions: Option<PermissionPosture>,
    /// Model used in plan mode.
    #[arg(long)]
    smart_model: Option<String>,
    /// Model used in build mode.
    #[arg(long)]
    fast_model: Option<String>,
    /// Prompt text (default: the built-in prompt for the mode).
    #[arg(long, conflicts_with = "prompt_file")]
    prompt: Option<String>,
    /// Read the prompt from a file.
    #[arg(long)]
    prompt_file: Option<PathBuf>,
    /// Scope the invocation to a named project.
    #[arg(long)]
    project: Option<String>,
    /// Run Claude Code without print mode (live output, no JSON stream).
    #[arg(long)]
    no_print_mode: bool,
}

/// Values resolved from flags, config and defaults.
struct Resolved {
    agent: AgentType,
    smart_model: Option<String>,
    fast_model: Option<String>,
    prompt: String,
    project: Option<String>,
    print_mode: bool,
    options: AgentOptions,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if let Some(unavailable) = err.downcast_ref::<AgentUnavailableError>() {
                eprintln!("{unavailable}");
                eprintln!("  agent:   {}", unavailable.display_name);
                eprintln!("  command: {}", unavailable.cli_command);
                eprintln!("  install: {}", unavailable.installation_url);
                std::process::exit(exit_codes::AGENT_UNAVAILABLE);
            }
            eprintln!("{err:#}");
            std::process::exit(exit_codes::FAILED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    let paths = RunloopPaths::new(root);
    match cli.command {
        Command::Init { force } => cmd_init(&paths, force),
        Command::Run {
            mode,
            agent,
            max_iterations,
            strict,
        } => cmd_run(&paths, mode, &agent, max_iterations, strict),
        Command::Step { mode, agent } => cmd_step(&paths, mode, &agent),
        Command::Inspect { output } => cmd_inspect(&paths, output.as_deref()),
        Command::Sessions => cmd_sessions(&paths),
    }
}

fn cmd_init(paths: &RunloopPaths, force: bool) -> Result<i32> {
    session_store(paths).ensure_dir()?;
    if force || !paths.config_path.exists() {
        write_config(&paths.config_path, &RunloopConfig::default())
            .with_context(|| format!("write {}", paths.config_path.display()))?;
        println!("Wrote {}", paths.config_path.display());
    } else {
        println!("Keeping existing {}", paths.config_path.display());
    }
    Ok(exit_codes::OK)
}

fn cmd_run(
    paths: &RunloopPaths,
    mode: Mode,
    args: &AgentArgs,
    max_iterations: Option<u32>,
    strict: bool,
) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let resolved = resolve(paths, &cfg, mode, args)?;
    let request = LoopRequest {
        mode,
        agent: resolved.agent,
        max_iterations: max_iterations.unwrap_or(cfg.max_iterations),
        smart_model: resolved.smart_model,
        fast_model: resolved.fast_model,
        prompt: resolved.prompt,
        project: resolved.project,
        print_mode: resolved.print_mode,
    };
    let factory = CliAgentFactory::new(SystemProcessRunner);

    let outcome = run_loop(
        &factory,
        &session_store(paths),
        &resolved.options,
        &request,
        |event| match event {
            LoopEvent::Started { agent, model } => {
                println!(
                    "Running {} {} with model {model} ({mode} mode, up to {} iterations)",
                    agent.display_name,
                    agent.version.as_deref().unwrap_or("(unknown version)"),
                    request.max_iterations
                );
            }
            LoopEvent::Iteration(report) => {
                if !report.echoed {
                    print!("{}", report.result.stdout);
                    eprint!("{}", report.result.stderr);
                }
                let status = if report.result.completion_detected {
                    ", completion detected"
                } else {
                    ""
                };
                println!(
                    "Iteration {}/{} finished (exit code {}{status})",
                    report.iteration, report.max_iterations, report.result.exit_code
                );
                if let Some(err) = &report.persist_error {
                    eprintln!("warning: session history not saved: {err}");
                }
            }
        },
    )?;

    println!("{}", outcome.stop.message());
    if outcome.persist_failures > 0 {
        eprintln!(
            "warning: {} iteration(s) could not be saved to {}",
            outcome.persist_failures,
            paths.sessions_path.display()
        );
    }
    if !outcome.stop.is_completed() && strict {
        return Ok(exit_codes::MAX_ITERATIONS);
    }
    Ok(exit_codes::OK)
}

fn cmd_step(paths: &RunloopPaths, mode: Mode, args: &AgentArgs) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let resolved = resolve(paths, &cfg, mode, args)?;
    let request = StepRequest {
        mode,
        agent: resolved.agent,
        smart_model: resolved.smart_model,
        fast_model: resolved.fast_model,
        prompt: resolved.prompt,
        project: resolved.project,
        print_mode: resolved.print_mode,
    };
    let factory = CliAgentFactory::new(SystemProcessRunner);

    let outcome = run_step(
        &factory,
        &session_store(paths),
        &resolved.options,
        &request,
        |agent, model| {
            println!(
                "Starting {} session with model {model} ({mode} mode)",
                agent.display_name
            );
        },
    )?;

    match outcome.persist_error {
        Some(err) => eprintln!("warning: session history not saved: {err}"),
        None => println!("Session recorded in {}", paths.sessions_path.display()),
    }
    Ok(exit_codes::OK)
}

fn cmd_inspect(paths: &RunloopPaths, output: Option<&Path>) -> Result<i32> {
    let cfg = load_config(&paths.config_path)?;
    let output_path = output.map_or_else(|| paths.inspect_path.clone(), |p| paths.root.join(p));
    let factory = CliAgentFactory::new(SystemProcessRunner);
    let report = export_all(
        &factory,
        &session_store(paths),
        &agent_options(paths, &cfg, cfg.permissions),
        &output_path,
    )?;
    for entry in report.entries.iter().filter(|entry| !entry.succeeded()) {
        eprintln!(
            "  {} iteration {}: {}",
            entry.session_id.as_deref().unwrap_or("(no session id)"),
            entry.iteration,
            entry.error.as_deref().unwrap_or_default()
        );
    }
    println!("{}", report.summary());
    Ok(exit_codes::OK)
}

fn cmd_sessions(paths: &RunloopPaths) -> Result<i32> {
    let sessions = session_store(paths).read()?;
    if sessions.is_empty() {
        println!("No sessions recorded");
        return Ok(exit_codes::OK);
    }
    for session in &sessions {
        let mut line = format!(
            "{:>3}  {}  {:<11}  {:<5}  {}",
            session.iteration,
            session.started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            session.agent,
            session.mode,
            session.session_id.as_deref().unwrap_or("-")
        );
        if let Some(project) = &session.project {
            line.push_str(&format!("  [{project}]"));
        }
        println!("{line}");
    }
    Ok(exit_codes::OK)
}

fn session_store(paths: &RunloopPaths) -> SessionStore {
    SessionStore::new(&paths.state_dir, &paths.sessions_path)
}

fn agent_options(
    paths: &RunloopPaths,
    cfg: &RunloopConfig,
    permissions: PermissionPosture,
) -> AgentOptions {
    AgentOptions {
        permissions,
        timeout: cfg.iteration_timeout(),
        output_limit_bytes: cfg.output_limit_bytes,
        ..AgentOptions::new(&paths.root)
    }
}

/// Apply flag > config > built-in precedence and render the prompt.
fn resolve(
    paths: &RunloopPaths,
    cfg: &RunloopConfig,
    mode: Mode,
    args: &AgentArgs,
) -> Result<Resolved> {
    let project = args
        .project
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);
    let source = match (&args.prompt, &args.prompt_file) {
        (Some(text), _) => PromptSource::Inline(text),
        (None, Some(path)) => PromptSource::File(path),
        (None, None) => PromptSource::Builtin,
    };
    let prompt = resolve_prompt(&source, mode, project.as_deref())?;

    Ok(Resolved {
        agent: args.agent.unwrap_or(cfg.agent),
        smart_model: args.smart_model.clone().or_else(|| cfg.models.smart.clone()),
        fast_model: args.fast_model.clone().or_else(|| cfg.models.fast.clone()),
        prompt,
        project,
        print_mode: cfg.print_mode && !args.no_print_mode,
        options: agent_options(paths, cfg, args.permissions.unwrap_or(cfg.permissions)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["runloop", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["runloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "runloop",
            "run",
            "plan",
            "--agent",
            "claude-code",
            "--max-iterations",
            "4",
            "--permissions",
            "accept-edits",
            "--smart-model",
            "opus",
            "--no-print-mode",
            "--strict",
        ]);
        let Command::Run {
            mode,
            agent,
            max_iterations,
            strict,
        } = cli.command
        else {
            panic!("expected run");
        };
        assert_eq!(mode, Mode::Plan);
        assert_eq!(agent.agent, Some(AgentType::ClaudeCode));
        assert_eq!(agent.permissions, Some(PermissionPosture::AcceptEdits));
        assert_eq!(agent.smart_model.as_deref(), Some("opus"));
        assert!(agent.no_print_mode);
        assert_eq!(max_iterations, Some(4));
        assert!(strict);
    }

    #[test]
    fn parse_rejects_unknown_mode_and_agent() {
        assert!(Cli::try_parse_from(["runloop", "run", "deploy"]).is_err());
        assert!(Cli::try_parse_from(["runloop", "step", "build", "--agent", "cursor"]).is_err());
    }

    #[test]
    fn prompt_and_prompt_file_conflict() {
        let result = Cli::try_parse_from([
            "runloop",
            "run",
            "build",
            "--prompt",
            "x",
            "--prompt-file",
            "p.md",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn parse_inspect_output() {
        let cli = Cli::parse_from(["runloop", "inspect", "--output", "out.json"]);
        let Command::Inspect { output } = cli.command else {
            panic!("expected inspect");
        };
        assert_eq!(output, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn flags_override_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RunloopPaths::new(temp.path());
        let cfg = RunloopConfig {
            agent: AgentType::ClaudeCode,
            permissions: PermissionPosture::Bypass,
            models: runloop::io::config::ModelOverrides {
                smart: Some("cfg-smart".to_string()),
                fast: Some("cfg-fast".to_string()),
            },
            ..RunloopConfig::default()
        };
        let args = AgentArgs {
            agent: Some(AgentType::OpenCode),
            fast_model: Some("flag-fast".to_string()),
            prompt: Some("do it".to_string()),
            project: Some("  ".to_string()),
            no_print_mode: true,
            ..AgentArgs::default()
        };

        let resolved = resolve(&paths, &cfg, Mode::Build, &args).expect("resolve");
        assert_eq!(resolved.agent, AgentType::OpenCode);
        assert_eq!(resolved.smart_model.as_deref(), Some("cfg-smart"));
        assert_eq!(resolved.fast_model.as_deref(), Some("flag-fast"));
        assert_eq!(resolved.prompt, "do it");
        assert_eq!(resolved.project, None);
        assert!(!resolved.print_mode);
        assert_eq!(resolved.options.permissions, PermissionPosture::Bypass);
        assert_eq!(resolved.options.cwd, temp.path());
    }
}
