//! Run-until-done loops over external coding-agent CLIs.
//!
//! `runloop` invokes an agent CLI (OpenCode or Claude Code) with a task
//! prompt, scans each run's output for the completion marker and stops on
//! success or when the iteration budget is spent. The crate is split the same
//! way throughout:
//!
//! - **[`core`]**: Pure, deterministic logic (shared types, marker detection,
//!   session-id extraction). No I/O.
//! - **[`io`]**: Side effects (process execution, session history, config,
//!   prompts). Isolated behind small seams so tests can replace them.
//! - **[`agents`]**: One adapter per CLI dialect behind the
//!   [`agents::AgentAdapter`] trait, plus the availability-gated factory.
//!
//! Orchestration modules ([`looping`], [`step`], [`inspect`]) combine agents
//! with I/O to implement the CLI commands.

pub mod agents;
pub mod core;
pub mod exit_codes;
pub mod inspect;
pub mod io;
pub mod logging;
pub mod looping;
pub mod step;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
