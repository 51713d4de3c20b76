//! smoke-core - end-to-end smoke test for the CAD analysis backend
//!
//! Starts the backend if needed, walks one representative workflow through
//! it, prints the run summary as JSON and exits non-zero on failure.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;

use smoke_ci::config::{DEFAULT_OUTPUT, DEFAULT_PORT, DEFAULT_SAMPLE_CONFIG};
use smoke_ci::{init_tracing, run_smoke, SmokeConfig};

#[derive(Parser)]
#[command(name = "smoke-core")]
#[command(author = "FreeCAD Desktop Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "End-to-end smoke test for the analysis backend", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Port the backend listens on
    #[arg(long, env = "BACKEND_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Root of the CAD automation checkout (default: reported by /health)
    #[arg(long, env = "FREECAD_ROOT")]
    backend_root: Option<PathBuf>,

    /// Sample configuration to analyse
    #[arg(long, env = "SMOKE_CONFIG", default_value = DEFAULT_SAMPLE_CONFIG)]
    sample_config: String,

    /// Where to write the run artifact
    #[arg(short, long, env = "SMOKE_OUTPUT", default_value = DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Answer every request from built-in fixtures
    #[arg(
        long,
        env = "SMOKE_MOCK",
        action = clap::ArgAction::SetTrue,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    mock: bool,
}

impl Cli {
    fn into_config(self) -> SmokeConfig {
        let config = SmokeConfig::default()
            .with_port(self.port)
            .with_sample_config(self.sample_config)
            .with_output(self.output)
            .with_mock(self.mock);
        match self.backend_root {
            Some(root) => config.with_backend_root(root),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let run = run_smoke(cli.into_config())
        .await
        .context("Failed to write smoke artifact")?;

    let rendered = serde_json::to_string_pretty(&run)?;
    if run.ok {
        println!("{}", rendered);
    } else {
        eprintln!("{}", rendered);
    }

    Ok(ExitCode::from(run.exit_code() as u8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["smoke-core"]).unwrap();
        let config = cli.into_config();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.output_path, PathBuf::from(DEFAULT_OUTPUT));
        assert!(config.backend_root.is_none());
    }

    #[test]
    fn test_flags_override() {
        let cli = Cli::try_parse_from([
            "smoke-core",
            "--port",
            "19000",
            "--backend-root",
            "/srv/freecad",
            "--mock",
            "-o",
            "/tmp/out.json",
        ])
        .unwrap();
        let config = cli.into_config();
        assert_eq!(config.port, 19000);
        assert_eq!(config.backend_root, Some(PathBuf::from("/srv/freecad")));
        assert!(config.mock);
        assert_eq!(config.output_path, PathBuf::from("/tmp/out.json"));
    }

    #[tokio::test]
    async fn test_mock_run_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("summary.json");
        let cli = Cli::try_parse_from([
            "smoke-core",
            "--mock",
            "--output",
            output.to_str().unwrap(),
        ])
        .unwrap();

        let run = run_smoke(cli.into_config()).await.unwrap();
        assert!(run.ok);
        assert!(output.exists());
    }
}
