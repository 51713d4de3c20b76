//! Per-stage summary records.
//!
//! Each record captures the presence and shape of a stage's response, never
//! its engineering content.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::container::{self, DxfDetection};
use crate::error::Result;

fn present(value: Option<&Value>) -> bool {
    !matches!(value, None | Some(Value::Null))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
    pub status: Option<String>,
    pub backend_root: Option<String>,
    pub owned_process: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSummary {
    pub count: usize,
    pub has_default: bool,
}

impl ProfileSummary {
    pub fn from_response(profiles: &Value) -> Self {
        let list = profiles.as_array().map(Vec::as_slice).unwrap_or_default();
        Self {
            count: list.len(),
            has_default: list
                .iter()
                .any(|p| p.get("name").and_then(Value::as_str) == Some("_default")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeSummary {
    pub stages: Vec<String>,
    pub has_model: bool,
    pub has_drawing: bool,
    pub has_dxf: bool,
    pub has_dfm: bool,
    pub has_cost: bool,
    pub errors: usize,
}

impl AnalyzeSummary {
    pub fn from_result(analysis: &Value) -> Self {
        let stages = analysis
            .get("stages")
            .and_then(Value::as_array)
            .map(|s| {
                s.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let has_dxf = analysis
            .pointer("/drawing/drawing_paths")
            .and_then(Value::as_array)
            .is_some_and(|paths| {
                paths
                    .iter()
                    .any(|p| p.get("format").and_then(Value::as_str) == Some("dxf"))
            });

        Self {
            stages,
            has_model: present(analysis.get("model")),
            has_drawing: present(analysis.get("drawing")),
            has_dxf,
            has_dfm: present(analysis.get("dfm")),
            has_cost: present(analysis.get("cost")),
            errors: analysis
                .get("errors")
                .and_then(Value::as_array)
                .map_or(0, Vec::len),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RerunSummary {
    pub stage: String,
    pub success: bool,
    /// Echoed as the backend sent it, integer or float.
    pub score: Option<Number>,
}

impl RerunSummary {
    pub fn from_response(stage: &str, response: &Value) -> Self {
        Self {
            stage: stage.to_string(),
            success: !response.is_null(),
            score: match response.get("score") {
                Some(Value::Number(n)) => Some(n.clone()),
                _ => None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub success: bool,
    pub has_pdf_base64: bool,
}

impl ReportSummary {
    pub fn from_response(response: &Value) -> Self {
        Self {
            success: !response.is_null(),
            has_pdf_base64: response
                .get("pdfBase64")
                .and_then(Value::as_str)
                .is_some_and(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExportPackSummary {
    pub success: bool,
    pub filename: Option<String>,
    pub zip_bytes: usize,
    pub entries: Vec<String>,
    pub has_dxf_entry: bool,
    pub dxf_detection: DxfDetection,
}

impl ExportPackSummary {
    /// Decode `zipBase64` and inspect the pack structurally.
    pub fn from_response(response: &Value) -> Result<Self> {
        let bytes = match response.get("zipBase64").and_then(Value::as_str) {
            Some(encoded) if !encoded.is_empty() => container::decode_base64(encoded)?,
            _ => Vec::new(),
        };

        let entries = container::list_zip_entries(&bytes)
            .iter()
            .map(|e| e.name().into_owned())
            .collect();
        let detection = container::detect_dxf(&bytes);

        Ok(Self {
            success: !response.is_null(),
            filename: response
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string),
            zip_bytes: bytes.len(),
            entries,
            has_dxf_entry: detection.found(),
            dxf_detection: detection,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StepSummary {
    pub success: bool,
    pub config_path: Option<String>,
    pub has_analysis: bool,
}

impl StepSummary {
    pub fn from_response(imported: &Value) -> Self {
        Self {
            success: imported.get("success").and_then(Value::as_bool) == Some(true),
            config_path: imported
                .get("configPath")
                .and_then(Value::as_str)
                .map(str::to_string),
            has_analysis: present(imported.get("analysis")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateCrudSummary {
    pub success: bool,
    pub name: String,
    pub operations: Vec<String>,
}
