//! Tool system for the agent's tool-use loop.
//!
//! Defines the `Tool` trait that all tools implement, the shared `ToolResult`
//! structure, and a registry that converts tools into the function-calling
//! definitions sent to the LLM.

pub mod factors;
pub mod file_analyzer;
pub mod knowledge;
pub mod macro_emission;
pub mod micro_emission;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Handle to a generated result file inside the outputs directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadFile {
    pub path: String,
    pub filename: String,
}

impl DownloadFile {
    pub fn from_path(path: impl Into<String>) -> Self {
        let path = path.into();
        let filename = path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(path.as_str())
            .to_string();
        Self { path, filename }
    }
}

/// Result of executing a tool. All tools return this structure; the executor
/// converts it into the uniform mapping the router consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Short human-readable text the router may hand to synthesis. For the
    /// knowledge tool this is the full answer and is returned verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_file: Option<DownloadFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
}

impl ToolResult {
    pub fn success(data: serde_json::Value, summary: impl Into<String>) -> Self {
        Self {
            success: true,
            data,
            summary: Some(summary.into()),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn error_with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            data,
            ..Self::default()
        }
    }

    pub fn missing_params(params: &[&str]) -> Self {
        Self {
            success: false,
            error: Some(format!("Missing required parameters: {}", params.join(", "))),
            data: serde_json::json!({ "missing_params": params }),
            ..Self::default()
        }
    }
}

/// Trait all tools implement. Parameters arrive already standardized by the
/// executor; tools validate their own required parameters.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name, e.g. "query_emission_factors".
    fn name(&self) -> &str;
    /// Human-readable description exposed to the LLM verbatim.
    fn description(&self) -> &str;
    /// JSON Schema of the tool's parameters.
    fn input_schema(&self) -> serde_json::Value;
    /// Execute the tool with the given parameter object.
    async fn execute(&self, params: serde_json::Value) -> ToolResult;
}

/// Name -> tool mapping, built once at startup and read-only afterwards.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    /// Tool definitions in OpenAI function-calling format, sent to the LLM.
    pub fn definitions(&self) -> Vec<serde_json::Value> {
        self.tools
            .iter()
            .map(|t| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.input_schema(),
                    }
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, params: serde_json::Value) -> ToolResult {
            ToolResult::success(params, "ok")
        }
    }

    #[test]
    fn registry_lookup_and_definitions() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());

        let defs = registry.definitions();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0]["type"], "function");
        assert_eq!(defs[0]["function"]["name"], "echo");
    }

    #[test]
    fn download_file_from_path_takes_basename() {
        let df = DownloadFile::from_path("/outputs/a/b_result_20250101.xlsx");
        assert_eq!(df.filename, "b_result_20250101.xlsx");
        let windows = DownloadFile::from_path("C:\\out\\x.xlsx");
        assert_eq!(windows.filename, "x.xlsx");
    }
}
