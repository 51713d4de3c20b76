//! The persisted result of one smoke run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

/// Whether the run talked to a live backend or to fixtures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Mock,
    Real,
}

impl RunMode {
    pub fn from_mock_flag(mock: bool) -> Self {
        if mock {
            RunMode::Mock
        } else {
            RunMode::Real
        }
    }
}

/// Outcome of one smoke invocation, written once as the run artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SmokeRun {
    /// `true` only when every stage succeeded.
    pub ok: bool,

    pub mode: RunMode,

    pub started_at: DateTime<Utc>,

    pub duration_ms: u64,

    /// Stage name to stage record, in execution order.
    pub summary: IndexMap<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Output of the backend process, only when this run started it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_logs: Option<String>,
}

impl SmokeRun {
    pub fn new(mode: RunMode) -> Self {
        Self {
            ok: false,
            mode,
            started_at: Utc::now(),
            duration_ms: 0,
            summary: IndexMap::new(),
            error: None,
            backend_logs: None,
        }
    }

    /// Record a stage result under `stage`.
    pub fn record<T: Serialize>(&mut self, stage: &str, result: &T) -> Result<()> {
        self.summary
            .insert(stage.to_string(), serde_json::to_value(result)?);
        Ok(())
    }

    pub fn stage(&self, stage: &str) -> Option<&Value> {
        self.summary.get(stage)
    }

    /// Stage names in the order they were recorded.
    pub fn stages(&self) -> Vec<&str> {
        self.summary.keys().map(String::as_str).collect()
    }

    pub fn succeed(&mut self) {
        self.ok = true;
        self.error = None;
    }

    pub fn fail(&mut self, message: String, backend_logs: Option<String>) {
        self.ok = false;
        self.error = Some(message);
        self.backend_logs = backend_logs;
    }

    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        if self.ok {
            0
        } else {
            1
        }
    }
}

/// Write `run` to `path`, creating parent directories.
///
/// The JSON is written to a sibling temporary file and renamed into place so
/// readers never observe a partial artifact.
pub fn write_run_artifact(run: &SmokeRun, path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut json = serde_json::to_vec_pretty(run)?;
    json.push(b'\n');

    let mut staging = path.as_os_str().to_owned();
    staging.push(".partial");
    let staging = PathBuf::from(staging);

    std::fs::write(&staging, &json)?;
    std::fs::rename(&staging, path)?;

    Ok(path.to_path_buf())
}

/// Read a previously written run artifact.
pub fn read_run_artifact(path: &Path) -> Result<SmokeRun> {
    let json = std::fs::read(path)?;
    Ok(serde_json::from_slice(&json)?)
}
