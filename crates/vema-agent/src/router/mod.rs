//! The turn orchestrator: one user message in, one answer out.
//!
//! Drives a bounded tool-use loop against the agent LLM, executes tool calls
//! through the standardizing executor, synthesizes the reply (deterministic
//! renderers where possible, one LLM call otherwise), extracts chart/table/
//! download payloads, and updates session memory.

mod extract;

use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{info, warn};

use vema_core::config::Limits;
use vema_core::prompts::Prompts;
use vema_llm::{ChatProvider, LlmError, ToolCall};
use vema_memory::{MemoryError, SessionMemory, ToolCallRecord};

use crate::assembler::{AssembledContext, ContextAssembler};
use crate::executor::ToolExecutor;
use crate::format;
use crate::tools::DownloadFile;

use extract::{extract_chart_data, extract_download_file, extract_table_data, ExecutedRecord};

/// Vehicle keywords that count as an explicit mention in the user message.
const VEHICLE_KEYWORDS: [&str; 19] = [
    "小汽车", "轿车", "乘用车", "私家车", "sedan", "passenger car",
    "公交", "客车", "bus", "transit",
    "货车", "卡车", "truck", "cargo",
    "suv", "越野", "摩托", "diesel", "gasoline",
];

/// Back-reference phrases that allow reusing the remembered vehicle.
const BACKREF_PHRASES: [&str; 5] = ["同上", "沿用", "和之前", "还是", "一样"];

const VEHICLE_CLARIFICATION: &str = "请先告诉我车辆类型，例如：\n\
    - 小汽车（乘用车）\n\
    - 公交车\n\
    - 货车\n\
    - SUV\n\
    或者其他具体车型。";

const RETRY_EXHAUSTED_TEXT: &str = "I tried several approaches but encountered some issues. \
    Could you please provide more details about what you need?";

/// Phrases that indicate the synthesis model invented figures or causes.
const HALLUCINATION_MARKERS: [&str; 5] = ["相当于", "棵树", "峰值出现在", "空调导致", "不完全燃烧"];

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

#[derive(Debug, Clone, Default)]
pub struct RouterResponse {
    pub text: String,
    pub chart_data: Option<Value>,
    pub table_data: Option<Value>,
    pub download_file: Option<DownloadFile>,
}

impl RouterResponse {
    fn text_only(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

pub struct Router {
    assembler: ContextAssembler,
    executor: Arc<ToolExecutor>,
    agent_llm: Arc<dyn ChatProvider>,
    synthesis_llm: Arc<dyn ChatProvider>,
    prompts: Arc<Prompts>,
    memory: SessionMemory,
    max_tool_calls: u32,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        assembler: ContextAssembler,
        executor: Arc<ToolExecutor>,
        agent_llm: Arc<dyn ChatProvider>,
        synthesis_llm: Arc<dyn ChatProvider>,
        prompts: Arc<Prompts>,
        memory: SessionMemory,
        limits: &Limits,
    ) -> Self {
        Self {
            assembler,
            executor,
            agent_llm,
            synthesis_llm,
            prompts,
            memory,
            max_tool_calls: limits.max_tool_calls_per_turn,
        }
    }

    pub fn memory(&self) -> &SessionMemory {
        &self.memory
    }

    pub fn clear_topic_memory(&mut self) {
        self.memory.clear_topic_memory();
    }

    /// Process one user turn.
    pub async fn chat(
        &mut self,
        user_message: &str,
        file_path: Option<&Path>,
    ) -> Result<RouterResponse, RouterError> {
        info!(message = %truncate_for_log(user_message), "processing message");

        let file_context = match file_path {
            Some(path) => Some(self.analyze_file_cached(path).await),
            None => None,
        };

        let context = self.assembler.assemble(
            user_message,
            &self.memory.working_memory(),
            self.memory.fact_memory(),
            file_context.as_ref(),
        );

        let response = self
            .agent_llm
            .chat_with_tools(&context.messages, &context.tools, Some(&context.system_prompt))
            .await?;

        let mut call_records: Vec<ToolCallRecord> = Vec::new();
        let outcome = self
            .drive_tool_loop(response, &context, user_message, file_path, &mut call_records)
            .await?;

        self.memory.update(
            user_message,
            &outcome.text,
            (!call_records.is_empty()).then_some(call_records),
            file_path,
            file_context,
        )?;

        Ok(outcome)
    }

    /// Analyze an uploaded file, reusing the cached analysis when both path
    /// and mtime match.
    async fn analyze_file_cached(&self, path: &Path) -> Value {
        let path_str = path.display().to_string();
        let mtime = file_mtime(path);

        if let Some(cached) = &self.memory.fact_memory().file_analysis {
            let path_matches =
                cached.get("file_path").and_then(Value::as_str) == Some(path_str.as_str());
            let mtime_matches = cached.get("file_mtime").and_then(Value::as_i64) == mtime;
            if path_matches && mtime_matches {
                info!(path = %path_str, "using cached file analysis");
                return cached.clone();
            }
        }

        let record = self
            .executor
            .execute(
                "analyze_file",
                &serde_json::json!({ "file_path": path_str }),
                Some(path),
            )
            .await;

        let mut analysis = match record.data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        analysis.insert("file_path".to_string(), Value::from(path_str.clone()));
        analysis.insert(
            "file_mtime".to_string(),
            mtime.map(Value::from).unwrap_or(Value::Null),
        );
        info!(path = %path_str, ?mtime, "analyzed new file");
        Value::Object(analysis)
    }

    /// The bounded tool loop: execute calls, feed errors back for at most
    /// `max_tool_calls` iterations, then synthesize and extract.
    async fn drive_tool_loop(
        &self,
        mut response: vema_llm::LlmResponse,
        context: &AssembledContext,
        user_message: &str,
        file_path: Option<&Path>,
        call_records: &mut Vec<ToolCallRecord>,
    ) -> Result<RouterResponse, RouterError> {
        let mut messages = context.messages.clone();
        let mut iterations: u32 = 0;

        loop {
            if response.tool_calls.is_empty() {
                return Ok(RouterResponse::text_only(response.content));
            }
            if iterations >= self.max_tool_calls {
                warn!(iterations, "tool retry budget exhausted");
                return Ok(RouterResponse::text_only(RETRY_EXHAUSTED_TEXT));
            }

            if let Some(clarification) = self.vehicle_guard(&response.tool_calls, user_message) {
                info!("vehicle-mention guard fired, asking for confirmation");
                return Ok(RouterResponse::text_only(clarification));
            }

            let mut executed: Vec<ExecutedRecord> = Vec::new();
            for call in &response.tool_calls {
                info!(tool = %call.name, "executing tool");
                let result = self
                    .executor
                    .execute(&call.name, &call.arguments, file_path)
                    .await;
                let recorded_arguments = if result.arguments.is_null() {
                    call.arguments.clone()
                } else {
                    result.arguments.clone()
                };
                call_records.push(ToolCallRecord {
                    name: call.name.clone(),
                    arguments: recorded_arguments,
                    success: result.success,
                });
                executed.push(ExecutedRecord {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    result,
                });
            }

            let has_error = executed.iter().any(|r| !r.result.success);
            if has_error && iterations + 1 < self.max_tool_calls {
                // Feed the errors back; the model gets one chance per
                // iteration to correct itself or ask the user.
                let assistant_content = if response.content.is_empty() {
                    "Calling tools..."
                } else {
                    response.content.as_str()
                };
                messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": assistant_content,
                    "tool_calls": response.tool_calls.iter().map(|tc| serde_json::json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        },
                    })).collect::<Vec<_>>(),
                }));
                messages.push(serde_json::json!({
                    "role": "tool",
                    "content": format_tool_errors(&executed),
                    "tool_call_id": executed[0].id,
                }));

                response = self
                    .agent_llm
                    .chat_with_tools(&messages, &context.tools, Some(&context.system_prompt))
                    .await?;
                iterations += 1;
                continue;
            }

            let text = self.synthesize(&messages, &executed).await?;
            return Ok(RouterResponse {
                text,
                chart_data: extract_chart_data(&executed),
                table_data: extract_table_data(&executed),
                download_file: extract_download_file(&executed),
            });
        }
    }

    /// Rule-based guard: micro-emission calculation requires the user to have
    /// named a vehicle (or to back-reference a remembered one). This is the
    /// only rule-based intervention; everything else is the LLM's call.
    fn vehicle_guard(&self, tool_calls: &[ToolCall], user_message: &str) -> Option<&'static str> {
        let wants_micro = tool_calls.iter().any(|tc| {
            tc.name == "calculate_micro_emission"
                && tc
                    .arguments
                    .get("vehicle_type")
                    .and_then(Value::as_str)
                    .is_some_and(|v| !v.is_empty())
        });
        if !wants_micro {
            return None;
        }

        let message_lower = user_message.to_lowercase();
        let has_vehicle_mention = VEHICLE_KEYWORDS
            .iter()
            .any(|kw| message_lower.contains(kw));

        let recent_vehicle = self.memory.fact_memory().recent_vehicle.is_some();
        let refers_to_previous = BACKREF_PHRASES.iter().any(|p| user_message.contains(p));

        if !has_vehicle_mention && !(recent_vehicle && refers_to_previous) {
            Some(VEHICLE_CLARIFICATION)
        } else {
            None
        }
    }

    /// Turn tool results into the reply text.
    async fn synthesize(
        &self,
        messages: &[Value],
        executed: &[ExecutedRecord],
    ) -> Result<String, RouterError> {
        // Knowledge answers are complete already, references included.
        if executed.len() == 1 && executed[0].name == "query_knowledge" && executed[0].result.success
        {
            if let Some(summary) = &executed[0].result.summary {
                info!("returning knowledge answer verbatim");
                return Ok(summary.clone());
            }
        }

        // Failures never go through the LLM: deterministic formatting only.
        if executed.iter().any(|r| !r.result.success) {
            info!("tool failure detected, using deterministic formatting");
            let records: Vec<(String, Value)> = executed
                .iter()
                .map(|r| (r.name.clone(), r.result.as_value()))
                .collect();
            return Ok(format::render_fallback(&records));
        }

        // Single-tool successes render deterministically.
        if executed.len() == 1 {
            let record = &executed[0];
            let rendered = match record.name.as_str() {
                "calculate_micro_emission" => Some(format::render_micro_success(&record.result.data)),
                "calculate_macro_emission" => Some(format::render_macro_success(&record.result.data)),
                "query_emission_factors" => Some(format::render_factors_success(&record.result.data)),
                "analyze_file" => Some(
                    record
                        .result
                        .summary
                        .clone()
                        .unwrap_or_else(|| "执行完成。".to_string()),
                ),
                _ => None,
            };
            if let Some(text) = rendered {
                info!(tool = %record.name, "rendering single-tool result deterministically");
                return Ok(text);
            }
        }

        // Multi-tool turns: one synthesis call over filtered aggregates,
        // tools not exposed.
        let filtered = filter_results_for_synthesis(executed);
        let results_json = serde_json::to_string_pretty(&filtered).unwrap_or_default();
        let system = self.prompts.render_synthesis(&results_json);

        let user_content = messages
            .iter()
            .rev()
            .find(|m| m["role"] == "user")
            .and_then(|m| m["content"].as_str())
            .unwrap_or("请总结计算结果")
            .to_string();

        let synthesis = self
            .synthesis_llm
            .chat(
                &[serde_json::json!({"role": "user", "content": user_content})],
                Some(&system),
            )
            .await?;

        for marker in HALLUCINATION_MARKERS {
            if synthesis.content.contains(marker) {
                warn!(marker, "possible hallucination in synthesis output");
            }
        }

        Ok(synthesis.content)
    }
}

/// Keep only aggregates for the synthesis call; detail row arrays are
/// dropped so the model cannot transcribe (or invent) per-row numbers.
fn filter_results_for_synthesis(executed: &[ExecutedRecord]) -> Value {
    let mut filtered = Map::new();

    for record in executed {
        let result = &record.result;
        if !result.success {
            filtered.insert(
                record.name.clone(),
                serde_json::json!({
                    "success": false,
                    "error": result.message.clone()
                        .or_else(|| result.error.clone())
                        .unwrap_or_else(|| "未知错误".to_string()),
                }),
            );
            continue;
        }

        let data = &result.data;
        let entry = match record.name.as_str() {
            "calculate_micro_emission" | "calculate_macro_emission" => {
                let summary = data.get("summary").cloned().unwrap_or(Value::Null);
                let num_points = data
                    .get("results")
                    .and_then(Value::as_array)
                    .map(|a| a.len())
                    .unwrap_or(0);
                serde_json::json!({
                    "success": true,
                    "summary": result.summary.clone().unwrap_or_else(|| "计算完成".to_string()),
                    "num_points": num_points,
                    "total_emissions": summary.get("total_emissions_g")
                        .or_else(|| summary.get("total_emissions_kg_per_hr"))
                        .cloned()
                        .unwrap_or(Value::Null),
                    "total_distance_km": summary.get("total_distance_km").cloned().unwrap_or(Value::Null),
                    "total_time_s": summary.get("total_time_s").cloned().unwrap_or(Value::Null),
                    "query_params": data.get("query_info").cloned().unwrap_or(Value::Null),
                    "has_download_file": result.download_file.is_some()
                        || data.get("download_file").is_some(),
                })
            }
            "query_emission_factors" => serde_json::json!({
                "success": true,
                "summary": result.summary.clone().unwrap_or_else(|| "查询完成".to_string()),
                "data": data,
            }),
            "analyze_file" => serde_json::json!({
                "success": true,
                "file_type": data.get("task_type").cloned().unwrap_or(Value::Null),
                "columns": data.get("columns").cloned().unwrap_or(Value::Null),
                "row_count": data.get("row_count").cloned().unwrap_or(Value::Null),
            }),
            _ => serde_json::json!({ "success": true, "data": data }),
        };
        filtered.insert(record.name.clone(), entry);
    }

    Value::Object(filtered)
}

fn format_tool_errors(executed: &[ExecutedRecord]) -> String {
    let mut errors = Vec::new();
    for record in executed {
        if record.result.success {
            continue;
        }
        let message = record
            .result
            .message
            .clone()
            .or_else(|| record.result.error.clone())
            .unwrap_or_else(|| "Unknown error".to_string());
        let mut text = format!("[{}] Error: {message}", record.name);
        if let Some(suggestions) = &record.result.suggestions {
            text.push_str(&format!("\nSuggestions: {}", suggestions.join(", ")));
        }
        errors.push(text);
    }
    errors.join("\n")
}

fn file_mtime(path: &Path) -> Option<i64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
}

fn truncate_for_log(text: &str) -> String {
    text.chars().take(50).collect()
}

#[cfg(test)]
mod tests;
