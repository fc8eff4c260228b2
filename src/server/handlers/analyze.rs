//! The analysis endpoint.

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::Json;
use tracing::debug;

use super::super::error::ApiError;
use super::super::AppState;
use crate::services::{AnalysisOutcome, AnalysisRequest, Attachment};

/// Multipart field names that carry the task text.
const TASK_FIELDS: &[&str] = &["file", "questions.txt"];

/// Run an analysis task.
///
/// Accepts either a raw text body or `multipart/form-data` where the task is
/// in the `file` (or `questions.txt`) field and `.csv` files are attached
/// as tables.
pub async fn analyze(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<AnalysisOutcome>, ApiError> {
    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("multipart/form-data"));

    let analysis = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        read_multipart(multipart).await?
    } else {
        let body = Bytes::from_request(request, &state)
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;
        AnalysisRequest::new(decode_task(&body)?)
    };

    let outcome = state.analyst.analyze(analysis).await?;
    Ok(Json(outcome))
}

async fn read_multipart(mut multipart: Multipart) -> Result<AnalysisRequest, ApiError> {
    let mut task = None;
    let mut attachments = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::new(e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::new(e.status(), e.body_text()))?;

        let is_task = TASK_FIELDS.contains(&name.as_str())
            || filename.as_deref() == Some("questions.txt");
        if task.is_none() && is_task {
            task = Some(decode_task(&data)?);
            continue;
        }

        let filename = filename.unwrap_or(name);
        if filename.to_lowercase().ends_with(".csv") {
            attachments.push(Attachment {
                filename,
                data: data.to_vec(),
            });
        } else {
            debug!(field = %filename, "Ignoring multipart field");
        }
    }

    let task = task.ok_or_else(|| {
        ApiError::bad_request("multipart request needs a 'file' or 'questions.txt' field")
    })?;
    Ok(AnalysisRequest { task, attachments })
}

fn decode_task(bytes: &[u8]) -> Result<String, ApiError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ApiError::bad_request("Task must be UTF-8 text"))
}
