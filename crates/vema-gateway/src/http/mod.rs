//! HTTP surface: chat (buffered + streaming), file preview and downloads,
//! session CRUD and history.

pub mod chat;
pub mod files;
pub mod sessions;

use std::sync::Arc;

use axum::http::HeaderMap;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    let cors = if state.config.gateway.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .gateway
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/api/chat", post(chat::chat))
        .route("/api/chat/stream", post(chat::chat_stream))
        .route("/api/file/preview", post(files::preview))
        .route("/api/file/download/{file_id}", get(files::download_by_file_id))
        .route(
            "/api/file/download/message/{session_id}/{message_id}",
            get(files::download_by_message),
        )
        .route("/api/download/{filename}", get(files::download_output))
        .route("/api/file/template/{template_type}", get(files::download_template))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/new", post(sessions::create_session))
        .route("/api/sessions/{session_id}", delete(sessions::delete_session))
        .route(
            "/api/sessions/{session_id}/title",
            patch(sessions::update_title),
        )
        .route(
            "/api/sessions/{session_id}/history",
            get(sessions::get_history),
        )
        .route("/api/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health() -> axum::Json<Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// User identity from the `X-User-ID` header; missing or empty falls back
/// to "default".
pub fn get_user_id(headers: &HeaderMap) -> String {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("default")
        .to_string()
}

/// Map low-level failures to a user-friendly, actionable message.
pub fn friendly_error_message(error: &str) -> String {
    let lower = error.to_lowercase();
    const CONNECTION_SIGNALS: [&str; 7] = [
        "connection error",
        "connecterror",
        "unexpected eof",
        "ssl",
        "tls",
        "timed out",
        "api_connection_error",
    ];
    if CONNECTION_SIGNALS.iter().any(|sig| lower.contains(sig)) {
        return "上游大模型连接失败（网络/代理异常）。请稍后重试。\n\
                若问题持续：请检查 HTTP(S)_PROXY 配置、代理服务连通性，或暂时关闭代理后重试。"
            .to_string();
    }
    format!("处理出错: {error}")
}

/// Strip fenced code blocks and JSON payload lines from the reply text and
/// collapse the blank lines left behind.
pub fn clean_reply_text(reply: &str) -> String {
    let mut cleaned = String::with_capacity(reply.len());
    let mut in_fence = false;
    for line in reply.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.starts_with('{') && (trimmed.contains("\"curve\"") || trimmed.contains("\"pollutants\"")) {
            continue;
        }
        cleaned.push_str(line);
        cleaned.push('\n');
    }

    // Collapse runs of blank lines to a single one.
    let mut out = String::with_capacity(cleaned.len());
    let mut blank_run = 0;
    for line in cleaned.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Normalize a download handle into the stable frontend shape with a url
/// addressable either by filename or by `(session_id, message_id)`.
pub fn normalize_download_file(
    download: Option<&vema_agent::tools::DownloadFile>,
    session_id: &str,
    message_id: Option<&str>,
    user_id: Option<&str>,
) -> Option<Value> {
    let download = download?;
    let uid_qs = user_id
        .map(|u| format!("?user_id={}", urlencode(u)))
        .unwrap_or_default();

    let url = match message_id {
        Some(mid) => format!("/api/file/download/message/{session_id}/{mid}{uid_qs}"),
        None => format!("/api/download/{}{uid_qs}", urlencode(&download.filename)),
    };

    let mut normalized = serde_json::json!({
        "path": download.path,
        "filename": download.filename,
        "file_id": session_id,
        "url": url,
    });
    if let Some(mid) = message_id {
        normalized["message_id"] = Value::from(mid);
    }
    Some(normalized)
}

/// Attach download metadata to the table payload so history rendering keeps
/// its download button.
pub fn attach_download_to_table_data(
    table_data: Option<Value>,
    download_file: Option<&Value>,
) -> Option<Value> {
    let mut table = table_data?;
    let download = match download_file {
        Some(d) => d,
        None => return Some(table),
    };

    if let Some(obj) = table.as_object_mut() {
        if !obj.contains_key("download") {
            if let (Some(url), Some(filename)) = (
                download.get("url").and_then(Value::as_str),
                download.get("filename").and_then(Value::as_str),
            ) {
                obj.insert(
                    "download".to_string(),
                    serde_json::json!({ "url": url, "filename": filename }),
                );
            }
        }
        if !obj.contains_key("file_id") {
            if let Some(file_id) = download.get("file_id") {
                obj.insert("file_id".to_string(), file_id.clone());
            }
        }
    }
    Some(table)
}

/// Minimal percent-encoding for path/query segments.
pub fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use vema_agent::tools::DownloadFile;

    #[test]
    fn user_id_defaults_when_header_missing_or_blank() {
        let headers = HeaderMap::new();
        assert_eq!(get_user_id(&headers), "default");

        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "  ".parse().unwrap());
        assert_eq!(get_user_id(&headers), "default");

        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "alice".parse().unwrap());
        assert_eq!(get_user_id(&headers), "alice");
    }

    #[test]
    fn connection_errors_get_actionable_message() {
        let msg = friendly_error_message("HTTP error: connection error to host");
        assert!(msg.contains("代理"));
        let msg = friendly_error_message("TLS handshake failed");
        assert!(msg.contains("稍后重试"));
        let msg = friendly_error_message("model not found");
        assert!(msg.starts_with("处理出错"));
    }

    #[test]
    fn fenced_blocks_are_stripped() {
        let reply = "结果如下\n```json\n{\"curve\": []}\n```\n\n\n完成";
        let cleaned = clean_reply_text(reply);
        assert!(!cleaned.contains("curve"));
        assert!(!cleaned.contains("```"));
        assert!(cleaned.contains("结果如下"));
        assert!(cleaned.contains("完成"));
        assert!(!cleaned.contains("\n\n\n"));
    }

    #[test]
    fn normalized_download_prefers_message_url() {
        let df = DownloadFile {
            path: "/outputs/a.xlsx".to_string(),
            filename: "a.xlsx".to_string(),
        };
        let normalized =
            normalize_download_file(Some(&df), "sess1", Some("msg1"), Some("alice")).unwrap();
        assert_eq!(
            normalized["url"],
            "/api/file/download/message/sess1/msg1?user_id=alice"
        );
        assert_eq!(normalized["file_id"], "sess1");
        assert_eq!(normalized["message_id"], "msg1");

        let by_name = normalize_download_file(Some(&df), "sess1", None, None).unwrap();
        assert_eq!(by_name["url"], "/api/download/a.xlsx");
    }

    #[test]
    fn table_gains_download_button() {
        let table = serde_json::json!({"type": "calculate_micro_emission", "columns": []});
        let download = serde_json::json!({
            "url": "/api/download/a.xlsx",
            "filename": "a.xlsx",
            "file_id": "sess1",
        });
        let enriched = attach_download_to_table_data(Some(table), Some(&download)).unwrap();
        assert_eq!(enriched["download"]["filename"], "a.xlsx");
        assert_eq!(enriched["file_id"], "sess1");
    }
}
