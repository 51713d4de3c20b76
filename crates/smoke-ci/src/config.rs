//! Smoke run configuration.
//!
//! Everything a run needs is carried here and passed into
//! [`run_smoke`](crate::pipeline::run_smoke); nothing is read from
//! process-wide state, so several runs can coexist in one test binary.

use std::path::PathBuf;

use crate::supervisor::{BackendCommand, HealthPolicy};

pub const DEFAULT_PORT: u16 = 18080;
pub const DEFAULT_SAMPLE_CONFIG: &str = "configs/examples/ks_flange.toml";
pub const DEFAULT_OUTPUT: &str = "artifacts/smoke-core-summary.json";

#[derive(Debug, Clone)]
pub struct SmokeConfig {
    /// Port the backend listens on.
    pub port: u16,

    /// Root of the CAD automation checkout. When unset, the root reported by
    /// the backend's health endpoint is used.
    pub backend_root: Option<PathBuf>,

    /// Sample configuration analysed by the pipeline, relative to the root.
    pub sample_config: String,

    /// Where the run artifact is written.
    pub output_path: PathBuf,

    /// Replace every HTTP call with in-memory fixtures.
    pub mock: bool,

    /// How to start the backend when it is not already running.
    pub backend_command: BackendCommand,

    pub health: HealthPolicy,

    /// Directory for temporary copies made during the run.
    pub temp_dir: PathBuf,
}

impl Default for SmokeConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            backend_root: None,
            sample_config: DEFAULT_SAMPLE_CONFIG.to_string(),
            output_path: PathBuf::from(DEFAULT_OUTPUT),
            mock: false,
            backend_command: BackendCommand::default(),
            health: HealthPolicy::default(),
            temp_dir: std::env::temp_dir(),
        }
    }
}

impl SmokeConfig {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backend_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.backend_root = Some(root.into());
        self
    }

    pub fn with_sample_config(mut self, path: impl Into<String>) -> Self {
        self.sample_config = path.into();
        self
    }

    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = path.into();
        self
    }

    pub fn with_mock(mut self, mock: bool) -> Self {
        self.mock = mock;
        self
    }

    pub fn with_backend_command(mut self, command: BackendCommand) -> Self {
        self.backend_command = command;
        self
    }

    pub fn with_health_policy(mut self, policy: HealthPolicy) -> Self {
        self.health = policy;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }
}
