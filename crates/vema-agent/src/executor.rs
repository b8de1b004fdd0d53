//! Tool executor: transparent argument standardization, file-path injection,
//! dispatch, and conversion of tool results into a uniform record.
//!
//! The executor never decides workflow: the LLM passed the user's original
//! vocabulary, the executor canonicalizes it, and the tool sees only
//! canonical values.

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use vema_standardizer::Standardizer;

use crate::tools::{DownloadFile, ToolRegistry};

/// Uniform execution record handed back to the router.
#[derive(Debug, Clone, Default)]
pub struct ExecutedTool {
    pub success: bool,
    /// The canonicalized arguments the tool actually ran with. Memory records
    /// these, so fact extraction sees canonical values.
    pub arguments: Value,
    pub data: Value,
    pub error: Option<String>,
    /// `standardization`, `missing_parameter`, or `execution`.
    pub error_type: Option<String>,
    pub message: Option<String>,
    pub summary: Option<String>,
    pub chart_data: Option<Value>,
    pub table_data: Option<Value>,
    pub download_file: Option<DownloadFile>,
    pub suggestions: Option<Vec<String>>,
}

impl ExecutedTool {
    fn failure(error_type: &str, message: String, suggestions: Option<Vec<String>>) -> Self {
        Self {
            success: false,
            error: Some(message.clone()),
            error_type: Some(error_type.to_string()),
            message: Some(message),
            suggestions,
            ..Self::default()
        }
    }

    /// Minimal JSON view used by the fallback formatter and synthesis filter.
    pub fn as_value(&self) -> Value {
        serde_json::json!({
            "success": self.success,
            "error": self.error,
            "message": self.message,
            "summary": self.summary,
            "suggestions": self.suggestions,
        })
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    standardizer: Arc<Standardizer>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, standardizer: Arc<Standardizer>) -> Self {
        Self {
            registry,
            standardizer,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Execute one tool call. Unknown tools and standardization misses come
    /// back as structured error records, never as panics or Err.
    pub async fn execute(
        &self,
        tool_name: &str,
        arguments: &Value,
        file_path: Option<&Path>,
    ) -> ExecutedTool {
        let tool = match self.registry.get(tool_name) {
            Some(tool) => tool,
            None => {
                let mut failure = ExecutedTool::failure(
                    "execution",
                    format!("Unknown tool: {tool_name}"),
                    None,
                );
                failure.arguments = arguments.clone();
                return failure;
            }
        };

        debug!(tool = tool_name, args = %arguments, "original arguments from LLM");
        let mut std_args = match self.standardize_arguments(arguments).await {
            Ok(args) => args,
            Err(mut failure) => {
                warn!(tool = tool_name, error = ?failure.message, "standardization failed");
                failure.arguments = arguments.clone();
                return failure;
            }
        };
        debug!(tool = tool_name, args = %std_args, "standardized arguments");

        // The turn's uploaded file is injected unless the model already chose one.
        if let Some(path) = file_path {
            let obj = std_args.as_object_mut().expect("std_args is an object");
            if !obj.contains_key("file_path") {
                obj.insert(
                    "file_path".to_string(),
                    Value::from(path.display().to_string()),
                );
                info!(tool = tool_name, path = %path.display(), "auto-injected file_path");
            }
        }

        let recorded_args = std_args.clone();
        let result = tool.execute(std_args).await;
        info!(tool = tool_name, success = result.success, "tool execution completed");

        let error_type = if result.success {
            None
        } else if result
            .data
            .get("missing_params")
            .map_or(false, |v| v.is_array())
        {
            Some("missing_parameter".to_string())
        } else {
            Some("execution".to_string())
        };

        ExecutedTool {
            success: result.success,
            arguments: recorded_args,
            message: result
                .error
                .clone()
                .or_else(|| result.summary.clone()),
            error: result.error,
            error_type,
            summary: result.summary,
            chart_data: result.chart_data,
            table_data: result.table_data,
            download_file: result.download_file,
            suggestions: result.suggestions,
            data: result.data,
        }
    }

    /// Replace user-vocabulary identifiers with canonical values. Unknown
    /// entries in a `pollutants` list are kept (partial results with a
    /// warning); an unknown required identifier is a standardization error.
    async fn standardize_arguments(&self, arguments: &Value) -> Result<Value, ExecutedTool> {
        let source = arguments.as_object().cloned().unwrap_or_default();

        let mut standardized = serde_json::Map::new();
        for (key, value) in source {
            let replacement: Option<Value> = match key.as_str() {
                "vehicle_type" => {
                    let raw = value.as_str().unwrap_or("").to_string();
                    if raw.is_empty() {
                        None
                    } else {
                        match self.standardizer.standardize_vehicle(&raw).await {
                            Some(canonical) => {
                                debug!(%raw, %canonical, "standardized vehicle");
                                Some(Value::from(canonical))
                            }
                            None => {
                                return Err(ExecutedTool::failure(
                                    "standardization",
                                    format!("Cannot recognize vehicle type: '{raw}'"),
                                    Some(self.standardizer.get_vehicle_suggestions()),
                                ))
                            }
                        }
                    }
                }
                "pollutant" => {
                    let raw = value.as_str().unwrap_or("").to_string();
                    if raw.is_empty() {
                        None
                    } else {
                        match self.standardizer.standardize_pollutant(&raw).await {
                            Some(canonical) => Some(Value::from(canonical)),
                            None => {
                                return Err(ExecutedTool::failure(
                                    "standardization",
                                    format!("Cannot recognize pollutant: '{raw}'"),
                                    Some(self.standardizer.get_pollutant_suggestions()),
                                ))
                            }
                        }
                    }
                }
                "pollutants" => {
                    let raw_list = value.as_array().cloned().unwrap_or_default();
                    if raw_list.is_empty() {
                        None
                    } else {
                        let mut canonical_list = Vec::with_capacity(raw_list.len());
                        for raw in raw_list {
                            match raw.as_str() {
                                Some(text) => {
                                    match self.standardizer.standardize_pollutant(text).await {
                                        Some(canonical) => {
                                            canonical_list.push(Value::from(canonical))
                                        }
                                        None => {
                                            warn!(pollutant = %text, "could not standardize pollutant, keeping original");
                                            canonical_list.push(raw.clone());
                                        }
                                    }
                                }
                                None => canonical_list.push(raw.clone()),
                            }
                        }
                        Some(Value::Array(canonical_list))
                    }
                }
                _ => None,
            };
            standardized.insert(key, replacement.unwrap_or(value));
        }

        Ok(Value::Object(standardized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vema_core::config::StandardizerConfig;
    use vema_core::mappings::Mappings;

    use crate::tools::{Tool, ToolResult};

    /// Records the parameters it was called with and succeeds.
    struct CaptureTool {
        captured: std::sync::Mutex<Option<Value>>,
    }

    #[async_trait]
    impl Tool for CaptureTool {
        fn name(&self) -> &str {
            "capture"
        }
        fn description(&self) -> &str {
            "capture params"
        }
        fn input_schema(&self) -> Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, params: Value) -> ToolResult {
            *self.captured.lock().unwrap() = Some(params.clone());
            ToolResult::success(params, "captured")
        }
    }

    fn executor_with_capture() -> (ToolExecutor, Arc<CaptureTool>) {
        let capture = Arc::new(CaptureTool {
            captured: std::sync::Mutex::new(None),
        });
        let mut registry = ToolRegistry::new();
        registry.register(capture.clone());
        let standardizer = Arc::new(Standardizer::new(
            Arc::new(Mappings::builtin()),
            &StandardizerConfig::default(),
        ));
        (
            ToolExecutor::new(Arc::new(registry), standardizer),
            capture,
        )
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_record() {
        let (executor, _) = executor_with_capture();
        let result = executor
            .execute("nope", &serde_json::json!({}), None)
            .await;
        assert!(!result.success);
        assert!(result.message.unwrap().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn vehicle_and_pollutant_are_canonicalized() {
        let (executor, capture) = executor_with_capture();
        let result = executor
            .execute(
                "capture",
                &serde_json::json!({"vehicle_type": "网约车", "pollutant": "氮氧"}),
                None,
            )
            .await;
        assert!(result.success);

        let seen = capture.captured.lock().unwrap().clone().unwrap();
        assert_eq!(seen["vehicle_type"], "Passenger Car");
        assert_eq!(seen["pollutant"], "NOx");
    }

    #[tokio::test]
    async fn unknown_pollutant_list_entries_are_kept() {
        let (executor, capture) = executor_with_capture();
        let result = executor
            .execute(
                "capture",
                &serde_json::json!({"pollutants": ["碳排放", "XYZ"]}),
                None,
            )
            .await;
        assert!(result.success);

        let seen = capture.captured.lock().unwrap().clone().unwrap();
        assert_eq!(seen["pollutants"][0], "CO2");
        assert_eq!(seen["pollutants"][1], "XYZ");
    }

    #[tokio::test]
    async fn unknown_vehicle_is_a_standardization_error_with_suggestions() {
        let (executor, _) = executor_with_capture();
        let result = executor
            .execute(
                "capture",
                &serde_json::json!({"vehicle_type": "spaceship"}),
                None,
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error_type.as_deref(), Some("standardization"));
        let suggestions = result.suggestions.unwrap();
        assert!(suggestions.iter().any(|s| s.contains("Passenger Car")));
    }

    #[tokio::test]
    async fn file_path_is_injected_when_absent() {
        let (executor, capture) = executor_with_capture();
        executor
            .execute(
                "capture",
                &serde_json::json!({}),
                Some(Path::new("/tmp/in.csv")),
            )
            .await;
        let seen = capture.captured.lock().unwrap().clone().unwrap();
        assert_eq!(seen["file_path"], "/tmp/in.csv");
    }

    #[tokio::test]
    async fn existing_file_path_is_not_overwritten() {
        let (executor, capture) = executor_with_capture();
        executor
            .execute(
                "capture",
                &serde_json::json!({"file_path": "/tmp/chosen.csv"}),
                Some(Path::new("/tmp/in.csv")),
            )
            .await;
        let seen = capture.captured.lock().unwrap().clone().unwrap();
        assert_eq!(seen["file_path"], "/tmp/chosen.csv");
    }
}
