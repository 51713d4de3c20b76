//! Smoke CI - end-to-end checks for the CAD analysis backend
//!
//! Provides a smoke pipeline that:
//! - Starts the backend when it is not already running and waits for health
//! - Drives profiles, streaming analysis, reruns, reports and export packs
//! - Inspects export packs as ZIP containers without extracting them
//! - Writes a single JSON run artifact describing the outcome

pub mod api;
pub mod config;
pub mod container;
pub mod error;
pub mod mock;
pub mod pipeline;
pub mod run;
pub mod sse;
pub mod stage;
pub mod summary;
pub mod supervisor;
pub mod telemetry;

// Re-export key types
pub use api::{BackendApi, HttpBackend};
pub use config::SmokeConfig;
pub use container::{detect_dxf, has_dxf_entry, list_zip_entries, DxfDetection};
pub use error::{Result, SmokeError};
pub use mock::MockBackend;
pub use pipeline::{run_smoke, SmokePipeline};
pub use run::{read_run_artifact, write_run_artifact, RunMode, SmokeRun};
pub use sse::{SseDecoder, SseEvent};
pub use stage::PipelineStage;
pub use supervisor::{BackendCommand, BackendSupervisor, HealthPolicy, HealthProbe};
pub use telemetry::init_tracing;
