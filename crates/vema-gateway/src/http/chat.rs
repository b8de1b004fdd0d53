//! Chat endpoints: buffered (`POST /api/chat`) and NDJSON streaming
//! (`POST /api/chat/stream`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::app::AppState;

use super::{
    attach_download_to_table_data, clean_reply_text, friendly_error_message, get_user_id,
    normalize_download_file,
};

#[derive(Serialize)]
pub struct ChatResponse {
    pub reply: String,
    pub session_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_file: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct TurnInput {
    message: String,
    session_id: Option<String>,
    file: Option<(String, Vec<u8>)>,
}

struct TurnOutput {
    reply: String,
    session_id: String,
    data_type: Option<String>,
    chart_data: Option<Value>,
    table_data: Option<Value>,
    file_id: Option<String>,
    download_file: Option<Value>,
    message_id: String,
}

/// POST /api/chat: one buffered turn.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Json<ChatResponse> {
    let user_id = get_user_id(&headers);
    let input = match parse_turn_input(multipart).await {
        Ok(input) => input,
        Err(e) => return Json(error_response(String::new(), e)),
    };
    let session_hint = input.session_id.clone().unwrap_or_default();

    info!(user_id, message = %input.message.chars().take(50).collect::<String>(), "chat request");

    match run_turn(&state, &user_id, input).await {
        Ok(out) => Json(ChatResponse {
            reply: out.reply,
            session_id: out.session_id,
            success: true,
            data_type: out.data_type,
            chart_data: out.chart_data,
            table_data: out.table_data,
            file_id: out.file_id,
            download_file: out.download_file,
            message_id: Some(out.message_id),
            error: None,
        }),
        Err(e) => {
            error!(error = %e, "chat turn failed");
            Json(error_response(session_hint, e))
        }
    }
}

fn error_response(session_id: String, error: String) -> ChatResponse {
    ChatResponse {
        reply: format!("抱歉，{}", friendly_error_message(&error)),
        session_id,
        success: false,
        data_type: None,
        chart_data: None,
        table_data: None,
        file_id: None,
        download_file: None,
        message_id: None,
        error: Some(error),
    }
}

/// POST /api/chat/stream: newline-delimited JSON events. Status while
/// progressing, heartbeats while the turn is in flight, the final text in
/// small chunks, chart/table payloads, then a terminal `done`.
pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Response {
    let user_id = get_user_id(&headers);
    let input = match parse_turn_input(multipart).await {
        Ok(input) => input,
        Err(e) => {
            let line = event_line(&serde_json::json!({
                "type": "error",
                "content": friendly_error_message(&e),
            }));
            return ndjson_response(Body::from(line));
        }
    };

    let heartbeat = Duration::from_secs(state.config.limits.heartbeat_secs);
    let chunk_chars = state.config.limits.text_chunk_chars.max(1);
    let chunk_delay = Duration::from_millis(state.config.limits.text_chunk_delay_ms);
    let has_file = input.file.is_some();

    let stream = async_stream::stream! {
        yield Ok::<Bytes, std::convert::Infallible>(event_line(&serde_json::json!({
            "type": "status", "content": "正在理解您的问题...",
        })));
        tokio::time::sleep(Duration::from_millis(100)).await;

        if has_file {
            yield Ok(event_line(&serde_json::json!({
                "type": "status", "content": "正在处理上传的文件...",
            })));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        yield Ok(event_line(&serde_json::json!({
            "type": "status", "content": "正在分析任务...",
        })));

        let turn_state = state.clone();
        let turn_user = user_id.clone();
        let mut task = tokio::spawn(async move {
            run_turn(&turn_state, &turn_user, input).await
        });

        // Heartbeats keep proxies from dropping the connection while the
        // LLM call is in flight.
        let joined = loop {
            match tokio::time::timeout(heartbeat, &mut task).await {
                Ok(joined) => break joined,
                Err(_) => {
                    yield Ok(event_line(&serde_json::json!({"type": "heartbeat"})));
                }
            }
        };

        let out = match joined {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                error!(error = %e, "streaming turn failed");
                yield Ok(event_line(&serde_json::json!({
                    "type": "error", "content": friendly_error_message(&e),
                })));
                return;
            }
            Err(join_err) => {
                error!(error = %join_err, "streaming turn panicked");
                yield Ok(event_line(&serde_json::json!({
                    "type": "error", "content": friendly_error_message(&join_err.to_string()),
                })));
                return;
            }
        };

        // Final text in small chunks for a typing effect.
        let chars: Vec<char> = out.reply.chars().collect();
        for chunk in chars.chunks(chunk_chars) {
            let text: String = chunk.iter().collect();
            yield Ok(event_line(&serde_json::json!({"type": "text", "content": text})));
            tokio::time::sleep(chunk_delay).await;
        }

        if let Some(chart) = &out.chart_data {
            yield Ok(event_line(&serde_json::json!({"type": "chart", "content": chart})));
        }
        if let Some(table) = &out.table_data {
            yield Ok(event_line(&serde_json::json!({"type": "table", "content": table})));
        }

        yield Ok(event_line(&serde_json::json!({
            "type": "done",
            "session_id": out.session_id,
            "file_id": out.file_id,
            "download_file": out.download_file,
            "message_id": out.message_id,
        })));
    };

    ndjson_response(Body::from_stream(stream))
}

fn ndjson_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(body)
        .expect("static headers are valid")
}

fn event_line(event: &Value) -> Bytes {
    Bytes::from(format!("{event}\n"))
}

async fn parse_turn_input(mut multipart: Multipart) -> Result<TurnInput, String> {
    let mut message = None;
    let mut session_id = None;
    let mut file = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| format!("multipart error: {e}"))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "message" => {
                message = Some(field.text().await.map_err(|e| e.to_string())?);
            }
            "session_id" => {
                let value = field.text().await.map_err(|e| e.to_string())?;
                if !value.trim().is_empty() {
                    session_id = Some(value.trim().to_string());
                }
            }
            "file" => {
                let filename = field
                    .file_name()
                    .unwrap_or("upload.csv")
                    .to_string();
                let bytes = field.bytes().await.map_err(|e| e.to_string())?;
                file = Some((filename, bytes.to_vec()));
            }
            _ => {}
        }
    }

    Ok(TurnInput {
        message: message.ok_or_else(|| "missing form field: message".to_string())?,
        session_id,
        file,
    })
}

/// The full turn: session lookup, upload spill, router chat, history commit.
/// Holding the session lock across the turn serializes turns per session.
async fn run_turn(
    state: &AppState,
    user_id: &str,
    input: TurnInput,
) -> Result<TurnOutput, String> {
    let manager = state.registry.get(user_id);
    let (session_id, session) = manager
        .get_or_create(input.session_id.as_deref())
        .map_err(|e| e.to_string())?;

    let mut uploaded_path: Option<PathBuf> = None;
    let mut message_for_router = input.message.clone();
    if let Some((filename, bytes)) = &input.file {
        let suffix = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("csv");
        let path = state.tmp_dir.join(format!("{session_id}_input.{suffix}"));
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| format!("failed to save upload: {e}"))?;
        message_for_router = format!(
            "{}\n\n文件已上传，路径: {}\n请使用 file_path 参数处理此文件。",
            input.message,
            path.display()
        );
        uploaded_path = Some(path);
    }

    let mut guard = session.lock().await;
    let result = guard
        .chat(&message_for_router, uploaded_path.as_deref())
        .await
        .map_err(|e| e.to_string())?;

    let message_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
    let download_file = normalize_download_file(
        result.download_file.as_ref(),
        &session_id,
        Some(&message_id),
        Some(user_id),
    );

    let data_type = if result.chart_data.is_some() {
        Some("chart".to_string())
    } else if result.table_data.is_some() {
        Some("table".to_string())
    } else {
        None
    };

    let table_data = attach_download_to_table_data(result.table_data, download_file.as_ref());
    let file_id = download_file.as_ref().map(|_| session_id.clone());

    guard.save_turn(
        &input.message,
        &result.text,
        result.chart_data.clone(),
        table_data.clone(),
        data_type.clone(),
        file_id.clone(),
        download_file.clone(),
        Some(message_id.clone()),
    );
    let history = guard.history.clone();
    drop(guard);

    manager
        .after_turn(&session_id, &input.message, download_file.clone())
        .map_err(|e| e.to_string())?;
    manager
        .persist_history(&session_id, &history)
        .map_err(|e| e.to_string())?;

    Ok(TurnOutput {
        reply: clean_reply_text(&result.text),
        session_id,
        data_type,
        chart_data: result.chart_data,
        table_data,
        file_id,
        download_file,
        message_id,
    })
}
