//! Canonical locations inside `.runloop/`.

use std::path::PathBuf;

pub const STATE_DIR_NAME: &str = ".runloop";

/// All runloop-owned paths for a project root.
#[derive(Debug, Clone)]
pub struct RunloopPaths {
    pub root: PathBuf,
    pub runloop_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_path: PathBuf,
    pub sessions_path: PathBuf,
    pub inspect_path: PathBuf,
}

impl RunloopPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runloop_dir = root.join(STATE_DIR_NAME);
        let state_dir = runloop_dir.join("state");
        Self {
            root: root.clone(),
            runloop_dir: runloop_dir.clone(),
            state_dir: state_dir.clone(),
            config_path: runloop_dir.join("config.toml"),
            sessions_path: state_dir.join("sessions.json"),
            inspect_path: runloop_dir.join("inspect.json"),
        }
    }
}
