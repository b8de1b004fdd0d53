//! File endpoints: upload preview, result downloads (by session, by message,
//! by filename), and input templates. Every download path must resolve inside
//! the outputs directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::app::AppState;

use super::get_user_id;

const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const MAX_PREVIEW_ROWS: usize = 5;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, detail: &str) -> ApiError {
    (status, Json(serde_json::json!({ "detail": detail })))
}

#[derive(Deserialize)]
pub struct DownloadQuery {
    pub user_id: Option<String>,
}

#[derive(Serialize)]
pub struct FilePreviewResponse {
    pub filename: String,
    pub size_kb: f64,
    pub rows_total: usize,
    pub columns: Vec<String>,
    pub preview_rows: Vec<Value>,
    pub detected_type: String,
    pub warnings: Vec<String>,
}

/// POST /api/file/preview: parse an upload and show the first rows so the
/// user can confirm before sending.
pub async fn preview(mut multipart: Multipart) -> Result<Json<FilePreviewResponse>, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, &e.to_string()))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("upload.csv").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, &e.to_string()))?;
            upload = Some((filename, bytes.to_vec()));
        }
    }

    let (filename, bytes) =
        upload.ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "missing form field: file"))?;

    let table = vema_tables::read_table_from_bytes(&bytes, &filename)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, &format!("文件解析失败: {e}")))?;

    let (detected_type, warnings) = detect_upload_type(&table.columns);
    let preview_rows: Vec<Value> = table
        .records()
        .into_iter()
        .take(MAX_PREVIEW_ROWS)
        .map(Value::Object)
        .collect();

    Ok(Json(FilePreviewResponse {
        filename,
        size_kb: bytes.len() as f64 / 1024.0,
        rows_total: table.row_count(),
        columns: table.columns,
        preview_rows,
        detected_type,
        warnings,
    }))
}

fn detect_upload_type(columns: &[String]) -> (String, Vec<String>) {
    let lower: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();
    let has = |needles: &[&str]| {
        lower
            .iter()
            .any(|col| needles.iter().any(|n| col.contains(n)))
    };

    if has(&["speed", "速度", "车速"]) {
        let mut warnings = Vec::new();
        if !has(&["acc", "加速度"]) {
            warnings.push("未找到加速度列，将自动计算".to_string());
        }
        if !has(&["grade", "坡度"]) {
            warnings.push("未找到坡度列，默认使用0%".to_string());
        }
        ("trajectory".to_string(), warnings)
    } else if has(&["length", "长度"]) {
        ("links".to_string(), Vec::new())
    } else {
        ("unknown".to_string(), vec!["无法识别文件类型".to_string()])
    }
}

/// GET /api/file/download/{file_id}: the session's last result file.
pub async fn download_by_file_id(
    State(state): State<Arc<AppState>>,
    UrlPath(file_id): UrlPath<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = query.user_id.unwrap_or_else(|| get_user_id(&headers));
    let manager = state.registry.get(&user_id);

    let meta = manager
        .get_meta(&file_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "文件不存在"))?;
    let last = meta
        .last_result_file
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "文件不存在"))?;

    let (path, filename) = resolve_download_value(&last, &state.outputs_dir)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "文件不存在"))?;
    serve_output_file(&state.outputs_dir, &path, &filename).await
}

/// GET /api/file/download/message/{session_id}/{message_id}: the result
/// attached to a specific assistant message. Pre-message-id history entries
/// are addressable as `legacy-{index}`.
pub async fn download_by_message(
    State(state): State<Arc<AppState>>,
    UrlPath((session_id, message_id)): UrlPath<(String, String)>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = query.user_id.unwrap_or_else(|| get_user_id(&headers));
    let manager = state.registry.get(&user_id);
    let session = manager
        .get_session(&session_id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "会话不存在"))?;

    let guard = session.lock().await;
    let mut target: Option<&vema_sessions::HistoryEntry> = None;
    for (idx, entry) in guard.history.iter().enumerate() {
        if entry.role != "assistant" {
            continue;
        }
        match &entry.message_id {
            Some(mid) if *mid == message_id => {
                target = Some(entry);
                break;
            }
            None if message_id == format!("legacy-{idx}") => {
                target = Some(entry);
                break;
            }
            _ => {}
        }
    }
    let target = target.ok_or_else(|| api_error(StatusCode::NOT_FOUND, "消息不存在"))?;

    let resolved = target
        .download_file
        .as_ref()
        .and_then(|df| resolve_download_value(df, &state.outputs_dir))
        .or_else(|| {
            // Fall back to the filename embedded in the table payload.
            target
                .table_data
                .as_ref()
                .and_then(|td| td.pointer("/download/filename"))
                .and_then(Value::as_str)
                .map(|name| (state.outputs_dir.join(name), name.to_string()))
        });
    let (path, filename) =
        resolved.ok_or_else(|| api_error(StatusCode::NOT_FOUND, "文件不存在"))?;
    drop(guard);

    serve_output_file(&state.outputs_dir, &path, &filename).await
}

/// GET /api/download/{filename}: generic outputs-directory download with
/// path-traversal rejection.
pub async fn download_output(
    State(state): State<Arc<AppState>>,
    UrlPath(filename): UrlPath<String>,
) -> Result<Response, ApiError> {
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return Err(api_error(StatusCode::FORBIDDEN, "Access denied"));
    }
    let path = state.outputs_dir.join(&filename);
    serve_output_file(&state.outputs_dir, &path, &filename).await
}

/// GET /api/file/template/{template_type}: generated input templates.
pub async fn download_template(
    State(state): State<Arc<AppState>>,
    UrlPath(template_type): UrlPath<String>,
) -> Result<Response, ApiError> {
    let (columns, rows): (Vec<String>, Vec<Vec<Value>>) = match template_type.as_str() {
        "trajectory" => (
            ["t", "speed_kph", "acceleration_mps2", "grade_pct"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vec![
                vec![0.into(), 0.into(), 0.into(), 0.into()],
                vec![1.into(), 5.into(), Value::from(1.39), 0.into()],
                vec![2.into(), 12.into(), Value::from(1.94), 0.into()],
                vec![3.into(), 20.into(), Value::from(2.22), 0.into()],
                vec![4.into(), 28.into(), Value::from(2.22), 0.into()],
            ],
        ),
        "links" => (
            ["link_id", "link_length_km", "traffic_flow_vph", "avg_speed_kph", "乘用车%", "公交车%", "货车%"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            vec![
                vec!["Link_1".into(), Value::from(2.5), 5000.into(), 60.into(), 70.into(), 20.into(), 10.into()],
                vec!["Link_2".into(), Value::from(1.8), 3500.into(), 45.into(), 60.into(), 30.into(), 10.into()],
                vec!["Link_3".into(), Value::from(3.2), 6000.into(), 80.into(), 80.into(), 10.into(), 10.into()],
            ],
        ),
        _ => return Err(api_error(StatusCode::NOT_FOUND, "模板不存在")),
    };

    let path = state.tmp_dir.join(format!("template_{template_type}.xlsx"));
    vema_tables::write_xlsx(&path, &columns, &rows)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;

    let filename = format!("{template_type}_template.xlsx");
    serve_file(&path, &filename).await
}

/// Pull `{path, filename}` out of a stored download handle.
fn resolve_download_value(value: &Value, outputs_dir: &Path) -> Option<(PathBuf, String)> {
    match value {
        Value::String(path) if !path.is_empty() => {
            let path = PathBuf::from(path);
            let filename = path.file_name()?.to_str()?.to_string();
            Some((path, filename))
        }
        Value::Object(_) => {
            let filename = value.get("filename").and_then(Value::as_str)?;
            let path = match value.get("path").and_then(Value::as_str) {
                Some(p) if !p.is_empty() => PathBuf::from(p),
                _ => outputs_dir.join(filename),
            };
            Some((path, filename.to_string()))
        }
        _ => None,
    }
}

/// Serve a file after verifying it resolves inside the outputs directory.
async fn serve_output_file(
    outputs_dir: &Path,
    path: &Path,
    filename: &str,
) -> Result<Response, ApiError> {
    let canonical_outputs = outputs_dir
        .canonicalize()
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "File not found"))?;
    let canonical = path
        .canonicalize()
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "File not found"))?;
    if !canonical.starts_with(&canonical_outputs) {
        warn!(path = %path.display(), "rejected download outside outputs directory");
        return Err(api_error(StatusCode::FORBIDDEN, "Access denied"));
    }
    serve_file(&canonical, filename).await
}

async fn serve_file(path: &Path, filename: &str) -> Result<Response, ApiError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|_| api_error(StatusCode::NOT_FOUND, "File not found"))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", XLSX_CONTENT_TYPE)
        .header(
            "content-disposition",
            format!(
                "attachment; filename*=UTF-8''{}",
                super::urlencode(filename)
            ),
        )
        .body(Body::from(bytes))
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))
}
