//! In-memory backend used in mock mode.
//!
//! Serves the same routes as the live backend from fixtures so the pipeline
//! logic can be exercised without a network or a CAD installation. The
//! analyze route renders a real event stream and feeds it through the decoder
//! in uneven fragments.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};

use crate::api::{failure_message, BackendApi};
use crate::container::build_directory_only_archive;
use crate::error::{Result, SmokeError};
use crate::sse;
use crate::supervisor::HealthProbe;

pub const MOCK_BACKEND_ROOT: &str = "/tmp/freecad-automation-mock";
pub const MOCK_PACK_ENTRIES: [&str; 2] = ["00_meta/readme.txt", "02_drawing/mock-front.dxf"];

const TEMPLATES_PATH: &str = "/report-templates";
const ANALYZE_STAGES: [&str; 4] = ["create", "drawing", "dfm", "cost"];

/// Fixture-backed stand-in for the analysis backend.
#[derive(Debug, Default)]
pub struct MockBackend {
    templates: Mutex<BTreeMap<String, Value>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every template created so far.
    pub fn reset_templates(&self) {
        if let Ok(mut templates) = self.templates.lock() {
            templates.clear();
        }
    }

    pub fn template_names(&self) -> Vec<String> {
        self.templates
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The `complete` payload of the mock analysis.
    pub fn analysis_result() -> Value {
        json!({
            "stages": ANALYZE_STAGES,
            "errors": [],
            "model": { "exports": [{ "format": "step", "path": "output/mock.step" }] },
            "drawing": {
                "drawing_paths": [
                    { "format": "svg", "path": "output/mock.svg" },
                    { "format": "dxf", "path": "output/mock-front.dxf" }
                ]
            },
            "drawingSvg": "<svg></svg>",
            "dfm": { "score": 92 },
            "cost": { "unit_cost": 12345 }
        })
    }

    /// The full event-stream body the mock analysis emits.
    pub fn analysis_stream() -> String {
        let mut body = String::new();
        for stage in ANALYZE_STAGES {
            body.push_str(&format!(
                "event: stage\ndata: {}\n\n",
                json!({ "stage": stage, "status": "done" })
            ));
        }
        body.push_str(&format!(
            "event: complete\ndata: {}\n\n",
            Self::analysis_result()
        ));
        body
    }

    fn not_found(path: &str, message: &str) -> SmokeError {
        SmokeError::Http {
            path: path.to_string(),
            message: failure_message(StatusCode::NOT_FOUND, &json!({ "error": message })),
        }
    }

    fn bad_request(path: &str, message: &str) -> SmokeError {
        SmokeError::Http {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    fn templates(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Value>> {
        self.templates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn template_route(&self, method: &Method, path: &str, body: Option<Value>) -> Result<Value> {
        let name = path
            .strip_prefix(TEMPLATES_PATH)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or_default();

        match (method, name.is_empty()) {
            (&Method::GET, true) => {
                let list: Vec<Value> = self
                    .templates()
                    .iter()
                    .map(|(name, t)| {
                        json!({
                            "name": name,
                            "label": t.get("label").cloned().unwrap_or_else(|| json!(name)),
                            "description": t.get("description").cloned().unwrap_or_else(|| json!("")),
                        })
                    })
                    .collect();
                Ok(Value::Array(list))
            }
            (&Method::POST, true) => {
                let mut data = match body {
                    Some(Value::Object(map)) => map,
                    _ => Map::new(),
                };
                let Some(name) = data.remove("name").and_then(|n| n.as_str().map(str::to_string))
                else {
                    return Err(Self::bad_request(path, "name required"));
                };
                if name == "_default" {
                    return Err(Self::bad_request(path, "name _default is reserved"));
                }
                let mut templates = self.templates();
                if templates.contains_key(&name) {
                    return Err(Self::bad_request(path, "Template already exists"));
                }
                data.insert("name".to_string(), json!(name));
                templates.insert(name.clone(), Value::Object(data));
                Ok(json!({ "success": true, "name": name }))
            }
            (&Method::GET, false) => self
                .templates()
                .get(name)
                .cloned()
                .ok_or_else(|| Self::not_found(path, "Template not found")),
            (&Method::PUT, false) => {
                let mut templates = self.templates();
                let Some(Value::Object(current)) = templates.get_mut(name) else {
                    return Err(Self::not_found(path, "Template not found"));
                };
                if let Some(Value::Object(patch)) = body {
                    current.extend(patch);
                }
                current.insert("name".to_string(), json!(name));
                Ok(json!({ "success": true }))
            }
            (&Method::DELETE, false) => match self.templates().remove(name) {
                Some(_) => Ok(json!({ "success": true })),
                None => Err(Self::not_found(path, "Template not found")),
            },
            _ => Err(Self::not_found(path, "mock endpoint not found")),
        }
    }
}

#[async_trait]
impl BackendApi for MockBackend {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        if path.starts_with(TEMPLATES_PATH) {
            return self.template_route(&method, path, body);
        }

        match (method, path) {
            (Method::GET, "/health") => Ok(json!({ "status": "ok", "freecadRoot": MOCK_BACKEND_ROOT })),
            (Method::GET, "/profiles") => Ok(json!([{ "name": "_default" }, { "name": "sample_precision" }])),
            (Method::POST, "/dfm") => Ok(json!({ "score": 95, "summary": "mock" })),
            (Method::POST, "/report") => Ok(json!({ "pdfBase64": STANDARD.encode("mock-report") })),
            (Method::POST, "/export-pack") => Ok(json!({
                "filename": "mock-pack.zip",
                "zipBase64": STANDARD.encode(build_directory_only_archive(&MOCK_PACK_ENTRIES)),
            })),
            (Method::POST, "/step/import") => Ok(json!({
                "success": true,
                "analysis": { "part_type": "mock" },
                "tomlString": "name = \"mock_part\"",
                "configPath": "configs/imports/mock-part.toml",
            })),
            (Method::POST, "/step/save-config") => Ok(json!({ "success": true })),
            _ => Err(Self::not_found(path, "mock endpoint not found")),
        }
    }

    async fn analyze(&self, _body: Value) -> Result<Value> {
        let body = Self::analysis_stream().into_bytes();
        // Uneven fragments so frame boundaries never line up with chunks.
        let chunks: Vec<std::result::Result<Vec<u8>, std::convert::Infallible>> = body
            .chunks(37)
            .map(|c| Ok(c.to_vec()))
            .collect();
        sse::decode_stream(futures::stream::iter(chunks)).await
    }
}

#[async_trait]
impl HealthProbe for MockBackend {
    async fn is_healthy(&self) -> bool {
        true
    }
}
