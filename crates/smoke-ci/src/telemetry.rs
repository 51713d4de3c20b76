//! Tracing initialisation for the smoke binaries.
//!
//! Call [`init_tracing`] once before the run starts. Log lines always go to
//! stderr: stdout is reserved for the JSON run summary that CI captures.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// * `json` - emit newline-delimited JSON log lines instead of the
///   human-readable format; stage, port and attempt fields become keys.
/// * `level` - verbosity used when `RUST_LOG` is unset; `RUST_LOG` wins
///   whenever it is present.
///
/// Later calls are ignored, so test binaries may call it per test.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .try_init()
            .ok();
    }
}
