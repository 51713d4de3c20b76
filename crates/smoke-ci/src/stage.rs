//! Smoke pipeline stage definitions.

use serde::{Deserialize, Serialize};

/// Ordered stages of the smoke workflow.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Supervisor readiness plus `GET /health`
    Health,

    /// `GET /profiles`
    Profiles,

    /// Streaming `POST /analyze`
    Analyze,

    /// `POST /dfm` against the same configuration
    Rerun,

    /// `POST /report`
    Report,

    /// `POST /export-pack`, inspected as a ZIP container
    ExportPack,

    /// `POST /step/import` followed by `POST /step/save-config`
    Step,

    /// Report template create/read/update/list/delete
    TemplateCrud,
}

impl PipelineStage {
    /// Declared execution order.
    pub const ALL: [PipelineStage; 8] = [
        PipelineStage::Health,
        PipelineStage::Profiles,
        PipelineStage::Analyze,
        PipelineStage::Rerun,
        PipelineStage::Report,
        PipelineStage::ExportPack,
        PipelineStage::Step,
        PipelineStage::TemplateCrud,
    ];

    /// Key under which the stage is recorded in the run summary.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Health => "health",
            PipelineStage::Profiles => "profile",
            PipelineStage::Analyze => "analyze",
            PipelineStage::Rerun => "rerun",
            PipelineStage::Report => "report",
            PipelineStage::ExportPack => "exportPack",
            PipelineStage::Step => "step",
            PipelineStage::TemplateCrud => "templateCrud",
        }
    }

    /// Stages that only run against the mock backend.
    pub fn mock_only(&self) -> bool {
        matches!(self, PipelineStage::TemplateCrud)
    }

    /// Stages to execute, in order, for the given mode.
    pub fn plan(mock: bool) -> Vec<PipelineStage> {
        Self::ALL
            .into_iter()
            .filter(|stage| mock || !stage.mock_only())
            .collect()
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
