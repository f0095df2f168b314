//! Stable exit codes for runloop CLI commands.

/// Command succeeded. `runloop run` also exits with this when the iteration
/// budget runs out, unless `--strict` is given.
pub const OK: i32 = 0;
/// Command failed: invalid config, unreadable state, process errors.
pub const FAILED: i32 = 1;
/// The requested agent CLI is not installed or did not answer its version probe.
pub const AGENT_UNAVAILABLE: i32 = 2;
/// `runloop run --strict` stopped at the iteration budget without completion.
pub const MAX_ITERATIONS: i32 = 3;
