//! Feedback, knowledge-base, stats and health endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::super::error::ApiError;
use super::super::AppState;

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub interaction_id: String,
    pub feedback: String,
    pub success_score: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct ContextRequest {
    pub content: String,
    pub metadata: Option<Map<String, Value>>,
}

/// Attach feedback to a past interaction.
pub async fn submit_feedback(
    State(state): State<AppState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<Value>, ApiError> {
    let score = state.analyst.rag().submit_feedback(
        &request.interaction_id,
        &request.feedback,
        request.success_score,
    )?;
    Ok(Json(json!({
        "message": "Feedback submitted successfully",
        "success_score": score,
    })))
}

/// Add a snippet to the knowledge base.
pub async fn add_context(
    State(state): State<AppState>,
    Json(request): Json<ContextRequest>,
) -> Result<Json<Value>, ApiError> {
    state
        .analyst
        .rag()
        .add_context(&request.content, request.metadata.unwrap_or_default())?;
    Ok(Json(json!({"message": "Context added successfully"})))
}

/// Learning metrics.
pub async fn stats(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let stats = state.analyst.rag().stats()?;
    let mut body = serde_json::to_value(stats).map_err(|e| ApiError::internal(e.to_string()))?;
    if let Value::Object(map) = &mut body {
        map.insert("system_learning".to_string(), Value::Bool(true));
    }
    Ok(Json(body))
}

/// Health check endpoint for container orchestration.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "rag_system": "active",
        "llm_provider": state.analyst.provider().as_str(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
