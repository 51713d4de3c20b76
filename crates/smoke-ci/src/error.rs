//! Error taxonomy for smoke runs.

/// Errors produced while supervising the backend or walking the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum SmokeError {
    #[error("backend health check failed on port {port} after {attempts} attempts")]
    HealthCheckTimeout { port: u16, attempts: u32 },

    #[error("{stage} stage failed: {message}")]
    StageHttp { stage: String, message: String },

    #[error("{stage} stage panicked: {message}")]
    StagePanic { stage: String, message: String },

    #[error("{path} failed: {message}")]
    Http { path: String, message: String },

    #[error("event stream error: {0}")]
    StreamProtocol(String),

    #[error("failed to spawn backend `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SmokeError {
    /// Tag an error with the pipeline stage it surfaced in.
    ///
    /// HTTP and stream failures become `StageHttp` so the run artifact names
    /// the stage; errors that already carry a stage pass through unchanged.
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            SmokeError::StageHttp { .. }
            | SmokeError::StagePanic { .. }
            | SmokeError::HealthCheckTimeout { .. } => self,
            SmokeError::Http { path, message } => SmokeError::StageHttp {
                stage: stage.to_string(),
                message: format!("{} failed: {}", path, message),
            },
            other => SmokeError::StageHttp {
                stage: stage.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for SmokeError {
    fn from(err: reqwest::Error) -> Self {
        let path = err
            .url()
            .map(|u| u.path().to_string())
            .unwrap_or_else(|| "request".to_string());
        SmokeError::Http {
            path,
            message: err.to_string(),
        }
    }
}

/// Result type for smoke operations.
pub type Result<T> = std::result::Result<T, SmokeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_timeout_mentions_port() {
        let err = SmokeError::HealthCheckTimeout {
            port: 18080,
            attempts: 60,
        };
        assert!(err.to_string().contains("18080"));
    }

    #[test]
    fn test_http_error_is_tagged_with_stage() {
        let err = SmokeError::Http {
            path: "/dfm".to_string(),
            message: "HTTP 500".to_string(),
        }
        .in_stage("rerun");

        match err {
            SmokeError::StageHttp { stage, message } => {
                assert_eq!(stage, "rerun");
                assert_eq!(message, "/dfm failed: HTTP 500");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_stream_error_is_tagged_with_stage() {
        let err = SmokeError::StreamProtocol("boom".to_string()).in_stage("analyze");
        assert_eq!(
            err.to_string(),
            "analyze stage failed: event stream error: boom"
        );
    }

    #[test]
    fn test_health_timeout_is_not_rewrapped() {
        let err = SmokeError::HealthCheckTimeout {
            port: 1,
            attempts: 2,
        }
        .in_stage("health");
        assert!(matches!(err, SmokeError::HealthCheckTimeout { .. }));
    }

    #[test]
    fn test_stage_panic_keeps_its_stage() {
        let err = SmokeError::StagePanic {
            stage: "step".to_string(),
            message: "index out of bounds".to_string(),
        }
        .in_stage("templateCrud");
        assert_eq!(err.to_string(), "step stage panicked: index out of bounds");
    }
}
