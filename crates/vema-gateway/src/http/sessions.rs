//! Session endpoints: list, create, delete, retitle, history.

use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::AppState;

use super::get_user_id;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, detail: &str) -> ApiError {
    (status, Json(serde_json::json!({ "detail": detail })))
}

#[derive(Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    pub message_count: u32,
}

#[derive(Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Json<SessionListResponse> {
    let manager = state.registry.get(&get_user_id(&headers));
    let sessions = manager
        .list_sessions()
        .into_iter()
        .map(|meta| SessionInfo {
            session_id: meta.session_id,
            title: meta.title,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            message_count: meta.message_count,
        })
        .collect();
    Json(SessionListResponse { sessions })
}

/// POST /api/sessions/new
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let manager = state.registry.get(&get_user_id(&headers));
    let session_id = manager
        .create_session()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;
    Ok(Json(serde_json::json!({ "session_id": session_id })))
}

/// DELETE /api/sessions/{session_id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    UrlPath(session_id): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let manager = state.registry.get(&get_user_id(&headers));
    manager
        .delete_session(&session_id)
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "Session not found"))?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
pub struct UpdateTitleRequest {
    pub title: String,
}

/// PATCH /api/sessions/{session_id}/title
pub async fn update_title(
    State(state): State<Arc<AppState>>,
    UrlPath(session_id): UrlPath<String>,
    headers: HeaderMap,
    Json(payload): Json<UpdateTitleRequest>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.registry.get(&get_user_id(&headers));
    let title = manager
        .set_title(&session_id, &payload.title)
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, "标题不能为空或会话不存在"))?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "session_id": session_id,
        "title": title,
    })))
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<Value>,
    pub success: bool,
}

/// GET /api/sessions/{session_id}/history: the persisted history with
/// legacy back-fill: assistant entries missing a `message_id` get the
/// deterministic `legacy-{index}` id, and entries whose table payload carries
/// a download button get a reconstructed `download_file` so they remain
/// downloadable.
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    UrlPath(session_id): UrlPath<String>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, ApiError> {
    let manager = state.registry.get(&get_user_id(&headers));
    let session = manager
        .get_session(&session_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Session not found"))?;

    let guard = session.lock().await;
    let mut messages = Vec::with_capacity(guard.history.len());
    for (idx, entry) in guard.history.iter().enumerate() {
        let mut value = serde_json::to_value(entry)
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;

        if entry.role == "assistant" {
            let obj = value.as_object_mut().expect("history entry is an object");

            let message_id = entry
                .message_id
                .clone()
                .unwrap_or_else(|| format!("legacy-{idx}"));
            obj.insert("message_id".to_string(), Value::from(message_id.clone()));

            if entry.download_file.is_none() {
                if let Some(filename) = entry
                    .table_data
                    .as_ref()
                    .and_then(|td| td.pointer("/download/filename"))
                    .and_then(Value::as_str)
                {
                    obj.insert(
                        "download_file".to_string(),
                        serde_json::json!({
                            "filename": filename,
                            "path": state.outputs_dir.join(filename).display().to_string(),
                            "url": format!("/api/file/download/message/{session_id}/{message_id}"),
                            "file_id": session_id,
                        }),
                    );
                }
            }
            let has_download = obj
                .get("download_file")
                .map_or(false, |d| !d.is_null());
            if has_download && entry.file_id.is_none() {
                obj.insert("file_id".to_string(), Value::from(session_id.clone()));
            }
        }
        messages.push(value);
    }

    Ok(Json(HistoryResponse {
        session_id,
        messages,
        success: true,
    }))
}
