//! Smoke pipeline orchestration and run recording.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::{BackendApi, HttpBackend};
use crate::config::SmokeConfig;
use crate::error::{Result, SmokeError};
use crate::mock::MockBackend;
use crate::run::{write_run_artifact, RunMode, SmokeRun};
use crate::stage::PipelineStage;
use crate::summary::{
    AnalyzeSummary, ExportPackSummary, HealthSummary, ProfileSummary, RerunSummary,
    ReportSummary, StepSummary, TemplateCrudSummary,
};
use crate::supervisor::{BackendSupervisor, HealthProbe};

const SAMPLE_STEP: &str = "output/ks_flange.step";
const MOCK_STEP_PATH: &str = "/tmp/mock.step";
const SMOKE_TEMPLATE: &str = "smoke_template";

/// Files created during a run, removed once it ends.
#[derive(Debug, Default)]
struct TempFiles {
    paths: Vec<PathBuf>,
}

impl TempFiles {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Remove every tracked file. Failures are logged and swallowed.
    async fn cleanup(&mut self) {
        for path in self.paths.drain(..) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed temporary file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
            }
        }
    }
}

/// Values carried from earlier stages into later ones.
#[derive(Debug, Default)]
struct StageContext {
    backend_root: Option<PathBuf>,
    analysis: Option<Value>,
    report_pdf: Option<String>,
}

/// Drives one representative workflow through the backend.
pub struct SmokePipeline {
    config: SmokeConfig,
    api: Arc<dyn BackendApi>,
    supervisor: BackendSupervisor,
}

impl SmokePipeline {
    /// Pipeline over an explicit API client and health probe.
    pub fn new(config: SmokeConfig, api: Arc<dyn BackendApi>, probe: Arc<dyn HealthProbe>) -> Self {
        let supervisor = BackendSupervisor::new(
            probe,
            config.backend_command.clone(),
            config.port,
            config.health,
        );
        Self {
            config,
            api,
            supervisor,
        }
    }

    /// Pipeline over the live HTTP backend, or the fixtures in mock mode.
    pub fn for_config(config: SmokeConfig) -> Result<Self> {
        if config.mock {
            let mock = Arc::new(MockBackend::new());
            Ok(Self::new(config, mock.clone(), mock))
        } else {
            let http = Arc::new(HttpBackend::new(config.port)?);
            Ok(Self::new(config, http.clone(), http))
        }
    }

    /// Execute every planned stage and reduce the outcome to a [`SmokeRun`].
    ///
    /// Never fails: stage errors end up in the run, and so does a panic
    /// inside a stage. Temporary files are removed and an owned backend is
    /// stopped exactly once, on every path.
    pub async fn run(mut self) -> SmokeRun {
        let start = Instant::now();
        let mode = RunMode::from_mock_flag(self.config.mock);
        let mut run = SmokeRun::new(mode);
        let mut temp = TempFiles::default();

        info!(?mode, port = self.config.port, "Starting smoke run");

        match self.execute(&mut run, &mut temp).await {
            Ok(()) => {
                run.succeed();
                info!(stages = run.summary.len(), "Smoke run passed");
            }
            Err(e) => {
                error!(error = %e, "Smoke run failed");
                let logs = self.supervisor.captured_logs();
                run.fail(e.to_string(), logs);
            }
        }

        temp.cleanup().await;
        self.supervisor.shutdown().await;

        run.duration_ms = start.elapsed().as_millis() as u64;
        run
    }

    /// Run the pipeline and persist the artifact to the configured path.
    pub async fn run_and_persist(self) -> Result<SmokeRun> {
        let output = self.config.output_path.clone();
        let run = self.run().await;
        write_run_artifact(&run, &output)?;
        info!(path = %output.display(), ok = run.ok, "Wrote smoke artifact");
        Ok(run)
    }

    async fn execute(&mut self, run: &mut SmokeRun, temp: &mut TempFiles) -> Result<()> {
        let mut ctx = StageContext {
            backend_root: self.config.backend_root.clone(),
            ..StageContext::default()
        };

        for stage in PipelineStage::plan(self.config.mock) {
            let stage_start = Instant::now();
            info!(stage = %stage, "Executing stage");

            // A panicking stage is reported like a failing one so cleanup
            // still runs.
            AssertUnwindSafe(self.run_stage(stage, &mut ctx, run, temp))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(SmokeError::StagePanic {
                        stage: stage.name().to_string(),
                        message: panic_message(panic),
                    })
                })
                .map_err(|e| e.in_stage(stage.name()))?;

            debug!(
                stage = %stage,
                duration_ms = stage_start.elapsed().as_millis() as u64,
                "Stage finished"
            );
        }
        Ok(())
    }

    async fn run_stage(
        &mut self,
        stage: PipelineStage,
        ctx: &mut StageContext,
        run: &mut SmokeRun,
        temp: &mut TempFiles,
    ) -> Result<()> {
        let name = stage.name();
        match stage {
            PipelineStage::Health => {
                let summary = self.health(ctx).await?;
                run.record(name, &summary)
            }
            PipelineStage::Profiles => {
                let profiles = self.api.get("/profiles").await?;
                run.record(name, &ProfileSummary::from_response(&profiles))
            }
            PipelineStage::Analyze => {
                let analysis = self.api.analyze(self.analyze_request()).await?;
                run.record(name, &AnalyzeSummary::from_result(&analysis))?;
                ctx.analysis = Some(analysis);
                Ok(())
            }
            PipelineStage::Rerun => {
                let body = json!({
                    "configPath": self.config.sample_config,
                    "process": "machining",
                    "standard": "KS",
                });
                let rerun = self.api.post("/dfm", body).await?;
                run.record(name, &RerunSummary::from_response("dfm", &rerun))
            }
            PipelineStage::Report => {
                let report = self.api.post("/report", self.report_request(ctx)).await?;
                run.record(name, &ReportSummary::from_response(&report))?;
                ctx.report_pdf = report
                    .get("pdfBase64")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(())
            }
            PipelineStage::ExportPack => {
                let exported = self
                    .api
                    .post("/export-pack", self.export_request(ctx))
                    .await?;
                let summary = ExportPackSummary::from_response(&exported)?;
                info!(
                    zip_bytes = summary.zip_bytes,
                    entries = summary.entries.len(),
                    detection = ?summary.dxf_detection,
                    "Inspected export pack"
                );
                run.record(name, &summary)
            }
            PipelineStage::Step => {
                let summary = self.step_roundtrip(ctx, temp).await?;
                run.record(name, &summary)
            }
            PipelineStage::TemplateCrud => {
                let summary = self.template_crud().await?;
                run.record(name, &summary)
            }
        }
    }

    async fn health(&mut self, ctx: &mut StageContext) -> Result<HealthSummary> {
        self.supervisor.ensure_healthy().await?;

        let health = self.api.get("/health").await?;
        let reported_root = health
            .get("freecadRoot")
            .and_then(Value::as_str)
            .map(str::to_string);

        if ctx.backend_root.is_none() {
            if let Some(root) = &reported_root {
                info!(root = %root, "Using backend root reported by health endpoint");
                ctx.backend_root = Some(PathBuf::from(root));
            }
        }

        Ok(HealthSummary {
            status: health
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            backend_root: ctx
                .backend_root
                .as_ref()
                .map(|p| p.display().to_string()),
            owned_process: self.supervisor.owns_process(),
        })
    }

    fn analyze_request(&self) -> Value {
        json!({
            "configPath": self.config.sample_config,
            "options": {
                "dfm": true,
                "drawing": true,
                "dxfExport": true,
                "tolerance": true,
                "cost": true,
                "process": "machining",
                "material": "SS304",
                "batch": 100,
                "standard": "KS",
            },
        })
    }

    fn report_request(&self, ctx: &StageContext) -> Value {
        json!({
            "configPath": self.config.sample_config,
            "analysisResults": ctx.analysis,
            "metadata": {
                "part_name": "Smoke Part",
                "drawing_number": "SMOKE-001",
                "revision": "A",
            },
            "sections": {
                "model": true,
                "drawing": true,
                "dfm": true,
                "tolerance": false,
                "cost": true,
                "bom": true,
            },
            "options": {
                "language": "ko",
                "disclaimer": true,
                "signature": true,
            },
        })
    }

    fn export_request(&self, ctx: &StageContext) -> Value {
        json!({
            "configPath": self.config.sample_config,
            "partName": "smoke_pack_part",
            "revision": "A",
            "organization": "smoke-test",
            "include": {
                "step": true,
                "svg": true,
                "dxf": true,
                "drawing_pdf": true,
                "dfm": true,
                "tolerance": false,
                "cost": true,
                "report": true,
                "bom": true,
            },
            "analysisResults": ctx.analysis,
            "reportPdfBase64": ctx.report_pdf,
        })
    }

    /// Import the sample STEP file and write the derived config back.
    async fn step_roundtrip(
        &self,
        ctx: &StageContext,
        temp: &mut TempFiles,
    ) -> Result<StepSummary> {
        let root = if self.config.mock {
            None
        } else {
            Some(ctx.backend_root.clone().ok_or_else(|| {
                SmokeError::Config(
                    "backend root unknown: set FREECAD_ROOT or report freecadRoot from /health"
                        .to_string(),
                )
            })?)
        };

        let import_path = match &root {
            None => PathBuf::from(MOCK_STEP_PATH),
            Some(root) => {
                let source = root.join(SAMPLE_STEP);
                if tokio::fs::metadata(&source).await.is_err() {
                    return Err(SmokeError::Config(format!(
                        "sample STEP file not found at {}",
                        source.display()
                    )));
                }
                let copy = self
                    .config
                    .temp_dir
                    .join(format!("freecad-desktop-smoke-{}.step", Uuid::new_v4()));
                tokio::fs::copy(&source, &copy).await?;
                temp.track(copy.clone());
                copy
            }
        };

        let imported = self
            .api
            .post(
                "/step/import",
                json!({ "filePath": import_path.display().to_string() }),
            )
            .await?;

        self.api
            .post(
                "/step/save-config",
                json!({
                    "configPath": imported.get("configPath"),
                    "tomlString": imported.get("tomlString"),
                }),
            )
            .await?;

        if let (Some(root), Some(config_path)) = (
            &root,
            imported.get("configPath").and_then(Value::as_str),
        ) {
            temp.track(root.join(config_path));
        }

        Ok(StepSummary::from_response(&imported))
    }

    /// Create, read, update, list and delete a throwaway report template.
    async fn template_crud(&self) -> Result<TemplateCrudSummary> {
        let item = format!("/report-templates/{}", SMOKE_TEMPLATE);
        let mut operations = Vec::new();
        let mismatch = |message: &str| SmokeError::StageHttp {
            stage: PipelineStage::TemplateCrud.name().to_string(),
            message: message.to_string(),
        };

        self.api
            .post(
                "/report-templates",
                json!({
                    "name": SMOKE_TEMPLATE,
                    "label": "Smoke Template",
                    "description": "created by smoke-core",
                    "sections": { "model": true, "dfm": true, "cost": true },
                }),
            )
            .await?;
        operations.push("create".to_string());

        let fetched = self.api.get(&item).await?;
        if fetched.get("label").and_then(Value::as_str) != Some("Smoke Template") {
            return Err(mismatch("created template not readable"));
        }
        operations.push("read".to_string());

        self.api
            .request(
                Method::PUT,
                &item,
                Some(json!({ "label": "Smoke Template v2" })),
            )
            .await?;
        let fetched = self.api.get(&item).await?;
        if fetched.get("label").and_then(Value::as_str) != Some("Smoke Template v2") {
            return Err(mismatch("template update not visible"));
        }
        operations.push("update".to_string());

        let listed = self.api.get("/report-templates").await?;
        let in_list = listed.as_array().is_some_and(|list| {
            list.iter()
                .any(|t| t.get("name").and_then(Value::as_str) == Some(SMOKE_TEMPLATE))
        });
        if !in_list {
            return Err(mismatch("template missing from list"));
        }
        operations.push("list".to_string());

        self.api.request(Method::DELETE, &item, None).await?;
        if self.api.get(&item).await.is_ok() {
            return Err(mismatch("deleted template still readable"));
        }
        operations.push("delete".to_string());

        Ok(TemplateCrudSummary {
            success: true,
            name: SMOKE_TEMPLATE.to_string(),
            operations,
        })
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Run the smoke workflow described by `config` and persist its artifact.
///
/// Only a failure to write the artifact (or to build the HTTP client) is
/// returned as an error; stage failures are reported through the run.
pub async fn run_smoke(config: SmokeConfig) -> Result<SmokeRun> {
    SmokePipeline::for_config(config)?.run_and_persist().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_temp_files_cleanup_swallows_missing() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.step");
        std::fs::write(&present, b"ISO-10303-21;").unwrap();

        let mut temp = TempFiles::default();
        temp.track(present.clone());
        temp.track(dir.path().join("missing.step"));
        temp.cleanup().await;

        assert!(!present.exists());
        assert!(temp.paths.is_empty());
    }

    #[tokio::test]
    async fn test_mock_pipeline_records_every_stage() {
        let dir = tempfile::tempdir().unwrap();
        let config = SmokeConfig::default()
            .with_mock(true)
            .with_output(dir.path().join("smoke.json"));

        let run = SmokePipeline::for_config(config).unwrap().run().await;

        assert!(run.ok, "error: {:?}", run.error);
        assert_eq!(
            run.stages(),
            PipelineStage::ALL.iter().map(|s| s.name()).collect::<Vec<_>>()
        );
        assert_eq!(run.summary["health"]["ownedProcess"], false);
        assert_eq!(
            run.summary["health"]["backendRoot"],
            crate::mock::MOCK_BACKEND_ROOT
        );
    }

    #[tokio::test]
    async fn test_configured_root_wins_over_health_report() {
        let config = SmokeConfig::default()
            .with_mock(true)
            .with_backend_root("/srv/freecad");

        let run = SmokePipeline::for_config(config).unwrap().run().await;
        assert_eq!(run.summary["health"]["backendRoot"], "/srv/freecad");
    }
}
