use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum WafError {
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    #[error("Malformed request record: {0}")]
    MalformedRecord(String),

    #[error("Invalid reward {reward} for action {action}")]
    InvalidReward { action: String, reward: f64 },

    #[error("Checkpoint error at {location}: {message}")]
    Checkpoint { location: String, message: String },

    #[error("Unsupported checkpoint version {found} (expected {expected})")]
    UnsupportedCheckpointVersion { found: u32, expected: u32 },

    #[error("Audit sink error: {0}")]
    Audit(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WafError {
    pub fn checkpoint(location: impl Into<String>, message: impl Into<String>) -> Self {
        WafError::Checkpoint {
            location: location.into(),
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            WafError::MalformedRecord(_) => StatusCode::BAD_REQUEST,
            WafError::BadRequest(_) => StatusCode::BAD_REQUEST,
            WafError::InvalidReward { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            WafError::Json(_) => StatusCode::BAD_REQUEST,
            WafError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WafError::Checkpoint { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            WafError::UnsupportedCheckpointVersion { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            WafError::Audit(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WafError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WafError::Yaml(_) => StatusCode::INTERNAL_SERVER_ERROR,
            WafError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            WafError::Config(_) => "CONFIG_ERROR",
            WafError::MalformedRecord(_) => "MALFORMED_RECORD",
            WafError::InvalidReward { .. } => "INVALID_REWARD",
            WafError::Checkpoint { .. } => "CHECKPOINT_ERROR",
            WafError::UnsupportedCheckpointVersion { .. } => "CHECKPOINT_VERSION",
            WafError::Audit(_) => "AUDIT_ERROR",
            WafError::BadRequest(_) => "BAD_REQUEST",
            WafError::Internal(_) => "INTERNAL_ERROR",
            WafError::Json(_) => "JSON_ERROR",
            WafError::Yaml(_) => "YAML_ERROR",
            WafError::Io(_) => "IO_ERROR",
        }
    }
}

impl IntoResponse for WafError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();
        let message = self.to_string();

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
                "status": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, WafError>;
