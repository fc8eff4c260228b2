//! JSON error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::rag::RagError;
use crate::services::AnalystError;

/// An error rendered as `{"error": message, ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    extra: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Add a field next to `error` in the body.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, "{}", self.message);
        } else {
            warn!(status = %self.status, "{}", self.message);
        }

        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.message));
        body.extend(self.extra);
        (self.status, Json(Value::Object(body))).into_response()
    }
}

impl From<AnalystError> for ApiError {
    fn from(err: AnalystError) -> Self {
        match err {
            AnalystError::EmptyTask => Self::bad_request("Task is empty"),
            AnalystError::Attachment { .. } => Self::bad_request(err.to_string()),
            AnalystError::Llm(e) => {
                Self::new(StatusCode::BAD_GATEWAY, format!("LLM request failed: {}", e))
            }
            AnalystError::Failed {
                interaction_id,
                plan,
                details,
                timed_out,
            } => {
                let status = if timed_out {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                Self::new(status, "Plan execution failed")
                    .with("details", details)
                    .with("plan", plan)
                    .with("interaction_id", interaction_id)
            }
            AnalystError::Rag(e) => e.into(),
        }
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "Interaction not found"),
            RagError::InvalidScore { .. } | RagError::EmptyContent => {
                Self::bad_request(err.to_string())
            }
            other => Self::internal(other.to_string()),
        }
    }
}
