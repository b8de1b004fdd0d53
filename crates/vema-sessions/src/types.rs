use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session metadata persisted in `sessions_meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub message_count: u32,
    /// Normalized download handle of the most recent result file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result_file: Option<Value>,
}

impl SessionMeta {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            session_id: session_id.into(),
            title: "新对话".to_string(),
            created_at: now.clone(),
            updated_at: now,
            message_count: 0,
            last_result_file: None,
        }
    }
}

/// One persisted history message. Assistant entries carry the render payloads
/// so old conversations replay with their charts, tables, and download
/// buttons intact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_file: Option<Value>,
    pub timestamp: String,
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            data_type: None,
            chart_data: None,
            table_data: None,
            message_id: None,
            file_id: None,
            download_file: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
