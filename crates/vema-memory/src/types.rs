use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tool invocation made during a turn, recorded for fact extraction and
/// compression. Only calls whose result succeeded feed fact memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
}

/// One complete conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallRecord>>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// A turn as replayed into LLM context: assistant text already truncated.
#[derive(Debug, Clone, Serialize)]
pub struct WorkingTurn {
    pub user: String,
    pub assistant: String,
}

/// Structured key facts carried across turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactMemory {
    #[serde(default)]
    pub recent_vehicle: Option<String>,
    /// Most-recent-first, deduplicated, at most five entries.
    #[serde(default)]
    pub recent_pollutants: Vec<String>,
    #[serde(default)]
    pub recent_year: Option<i64>,
    #[serde(default)]
    pub active_file: Option<String>,
    #[serde(default)]
    pub file_analysis: Option<serde_json::Value>,
    #[serde(default)]
    pub user_preferences: serde_json::Map<String, serde_json::Value>,
}

impl FactMemory {
    pub fn is_empty(&self) -> bool {
        self.recent_vehicle.is_none()
            && self.recent_pollutants.is_empty()
            && self.recent_year.is_none()
            && self.active_file.is_none()
            && self.file_analysis.is_none()
            && self.user_preferences.is_empty()
    }

    /// Push a pollutant to the front, dropping duplicates and capping at five.
    pub fn remember_pollutant(&mut self, pollutant: &str) {
        self.recent_pollutants.retain(|p| p != pollutant);
        self.recent_pollutants.insert(0, pollutant.to_string());
        self.recent_pollutants.truncate(5);
    }
}
