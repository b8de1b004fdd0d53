//! Tool: analyze_file. Structure analysis of an uploaded table.
//! Never mutates the file.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use vema_standardizer::Standardizer;

use super::{Tool, ToolResult};

const MICRO_INDICATORS: [&str; 6] = ["speed", "velocity", "速度", "time", "acceleration", "加速"];
const MACRO_INDICATORS: [&str; 7] = ["length", "flow", "volume", "traffic", "长度", "流量", "link"];
const MAX_SAMPLE_ROWS: usize = 2;

pub struct FileAnalyzerTool {
    standardizer: Arc<Standardizer>,
}

impl FileAnalyzerTool {
    pub fn new(standardizer: Arc<Standardizer>) -> Self {
        Self { standardizer }
    }
}

#[async_trait]
impl Tool for FileAnalyzerTool {
    fn name(&self) -> &str {
        "analyze_file"
    }

    fn description(&self) -> &str {
        "Analyze uploaded file structure. Returns columns, data type, and preview."
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": {
                    "type": "string",
                    "description": "Path to the file to analyze"
                }
            },
            "required": ["file_path"]
        })
    }

    async fn execute(&self, params: Value) -> ToolResult {
        let file_path = match params.get("file_path").and_then(Value::as_str) {
            Some(p) => p,
            None => return ToolResult::missing_params(&["file_path"]),
        };

        let table = match vema_tables::read_table(Path::new(file_path)) {
            Ok(t) => t,
            Err(e) => return ToolResult::error(e.to_string()),
        };

        let filename = Path::new(file_path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(file_path)
            .to_string();

        let (task_type, confidence) = identify_task_type(&table.columns);

        let micro_mapping = self
            .standardizer
            .map_columns(&table.columns, "micro_emission");
        let macro_mapping = self
            .standardizer
            .map_columns(&table.columns, "macro_emission");

        let micro_has_required = self
            .standardizer
            .get_required_columns("micro_emission")
            .iter()
            .all(|req| micro_mapping.values().any(|v| v == req));
        let macro_has_required = self
            .standardizer
            .get_required_columns("macro_emission")
            .iter()
            .all(|req| macro_mapping.values().any(|v| v == req));

        let sample_rows: Vec<Value> = table
            .records()
            .into_iter()
            .take(MAX_SAMPLE_ROWS)
            .map(Value::Object)
            .collect();

        let summary = format!(
            "File: {filename}\nRows: {}\nColumns: {}\nDetected type: {task_type} (confidence: {:.0}%)\nSample: {}",
            table.row_count(),
            table.columns.join(", "),
            confidence * 100.0,
            serde_json::to_string(&sample_rows).unwrap_or_default(),
        );

        ToolResult::success(
            serde_json::json!({
                "filename": filename,
                "row_count": table.row_count(),
                "columns": table.columns,
                "task_type": task_type,
                "confidence": confidence,
                "micro_mapping": micro_mapping,
                "macro_mapping": macro_mapping,
                "micro_has_required": micro_has_required,
                "macro_has_required": macro_has_required,
                "sample_rows": sample_rows,
            }),
            summary,
        )
    }
}

/// Score column names against per-task indicator keywords.
fn identify_task_type(columns: &[String]) -> (&'static str, f64) {
    let lower: Vec<String> = columns.iter().map(|c| c.to_lowercase()).collect();

    let micro_score = MICRO_INDICATORS
        .iter()
        .filter(|ind| lower.iter().any(|col| col.contains(*ind)))
        .count();
    let macro_score = MACRO_INDICATORS
        .iter()
        .filter(|ind| lower.iter().any(|col| col.contains(*ind)))
        .count();

    if micro_score > macro_score {
        ("micro_emission", (0.5 + micro_score as f64 * 0.15).min(0.95))
    } else if macro_score > micro_score {
        ("macro_emission", (0.5 + macro_score as f64 * 0.15).min(0.95))
    } else {
        ("unknown", 0.3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vema_core::config::StandardizerConfig;
    use vema_core::mappings::Mappings;

    fn tool() -> FileAnalyzerTool {
        FileAnalyzerTool::new(Arc::new(Standardizer::new(
            Arc::new(Mappings::builtin()),
            &StandardizerConfig::default(),
        )))
    }

    #[tokio::test]
    async fn trajectory_file_detected_as_micro() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traj.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "time,speed_kmh").unwrap();
        writeln!(f, "0,30").unwrap();
        writeln!(f, "1,32").unwrap();
        drop(f);

        let result = tool()
            .execute(serde_json::json!({"file_path": path.display().to_string()}))
            .await;

        assert!(result.success);
        assert_eq!(result.data["task_type"], "micro_emission");
        assert_eq!(result.data["row_count"], 2);
        assert_eq!(result.data["micro_has_required"], true);
        assert_eq!(result.data["sample_rows"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn links_file_detected_as_macro() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "link_id,length_km,flow_vph,speed_kph").unwrap();
        writeln!(f, "L1,2.0,4000,55").unwrap();
        drop(f);

        let result = tool()
            .execute(serde_json::json!({"file_path": path.display().to_string()}))
            .await;

        assert!(result.success);
        assert_eq!(result.data["task_type"], "macro_emission");
        assert_eq!(result.data["macro_has_required"], true);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let result = tool()
            .execute(serde_json::json!({"file_path": "/no/such/file.csv"}))
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn missing_param_is_reported() {
        let result = tool().execute(serde_json::json!({})).await;
        assert!(!result.success);
        assert_eq!(result.data["missing_params"][0], "file_path");
    }
}
