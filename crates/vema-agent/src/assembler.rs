//! Context assembler: fits prompt + tools + memory + file summary into the
//! token budget. No decisions here, just assembly in priority order.

use serde_json::Value;
use tracing::debug;

use vema_core::prompts::Prompts;
use vema_memory::{FactMemory, WorkingTurn};

/// Budgeted token estimate reserved for tool definitions.
const TOOL_DEFINITIONS_TOKENS: usize = 400;
/// Headroom reserved for the current user message when budgeting memory.
const USER_MESSAGE_RESERVE_TOKENS: usize = 500;
/// Working-memory turns replayed per request.
const MAX_REPLAYED_TURNS: usize = 3;
/// File sample rows are included only when this much budget remains.
const SAMPLE_MIN_BUDGET_TOKENS: usize = 300;

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub system_prompt: String,
    pub tools: Vec<Value>,
    pub messages: Vec<Value>,
    pub estimated_tokens: usize,
}

pub struct ContextAssembler {
    system_prompt: String,
    tools: Vec<Value>,
    max_context_tokens: usize,
}

impl ContextAssembler {
    pub fn new(prompts: &Prompts, tools: Vec<Value>, max_context_tokens: usize) -> Self {
        Self {
            system_prompt: prompts.system_prompt.clone(),
            tools,
            max_context_tokens,
        }
    }

    /// Assemble the full request context.
    ///
    /// Priority: system prompt and tools always go; fact memory rides as one
    /// synthetic system turn; working memory replays the last turns, dropping
    /// the oldest when over budget; file context is prepended to the user
    /// message with `task_type` as its first line.
    pub fn assemble(
        &self,
        user_message: &str,
        working_memory: &[WorkingTurn],
        fact_memory: &FactMemory,
        file_context: Option<&Value>,
    ) -> AssembledContext {
        let mut used_tokens = estimate_tokens(&self.system_prompt) + TOOL_DEFINITIONS_TOKENS;
        let mut messages = Vec::new();

        if !fact_memory.is_empty() {
            let fact_summary = format_fact_memory(fact_memory);
            if !fact_summary.is_empty() {
                used_tokens += estimate_tokens(&fact_summary);
                messages.push(serde_json::json!({
                    "role": "system",
                    "content": format!("[Context from previous conversations]\n{fact_summary}"),
                }));
            }
        }

        let remaining = self
            .max_context_tokens
            .saturating_sub(used_tokens + USER_MESSAGE_RESERVE_TOKENS);
        let memory_messages = format_working_memory(working_memory, remaining);
        for msg in &memory_messages {
            used_tokens += estimate_tokens(msg["content"].as_str().unwrap_or(""));
        }
        messages.extend(memory_messages);

        let user_message = match file_context {
            Some(ctx) => {
                let remaining_for_file = self.max_context_tokens.saturating_sub(used_tokens);
                format!(
                    "{}\n\n{user_message}",
                    format_file_context(ctx, remaining_for_file)
                )
            }
            None => user_message.to_string(),
        };
        used_tokens += estimate_tokens(&user_message);
        messages.push(serde_json::json!({ "role": "user", "content": user_message }));

        debug!(
            estimated_tokens = used_tokens,
            messages = messages.len(),
            has_file = file_context.is_some(),
            "assembled context"
        );

        AssembledContext {
            system_prompt: self.system_prompt.clone(),
            tools: self.tools.clone(),
            messages,
            estimated_tokens: used_tokens,
        }
    }
}

/// Rough token estimate: about half the character count.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 2
}

fn format_fact_memory(fact: &FactMemory) -> String {
    let mut lines = Vec::new();
    if let Some(vehicle) = &fact.recent_vehicle {
        lines.push(format!("Recent vehicle type: {vehicle}"));
    }
    if !fact.recent_pollutants.is_empty() {
        lines.push(format!(
            "Recent pollutants: {}",
            fact.recent_pollutants.join(", ")
        ));
    }
    if let Some(year) = fact.recent_year {
        lines.push(format!("Recent model year: {year}"));
    }
    if let Some(file) = &fact.active_file {
        lines.push(format!("Active file: {file}"));
    }
    lines.join("\n")
}

/// Replay the last turns as alternating user/assistant messages. When the
/// estimate exceeds the budget, keep only the most recent turn.
fn format_working_memory(working_memory: &[WorkingTurn], max_tokens: usize) -> Vec<Value> {
    if working_memory.is_empty() {
        return Vec::new();
    }

    let render = |turns: &[WorkingTurn]| -> Vec<Value> {
        let mut out = Vec::with_capacity(turns.len() * 2);
        for turn in turns {
            out.push(serde_json::json!({"role": "user", "content": turn.user}));
            out.push(serde_json::json!({"role": "assistant", "content": turn.assistant}));
        }
        out
    };

    let start = working_memory.len().saturating_sub(MAX_REPLAYED_TURNS);
    let recent = &working_memory[start..];
    let rendered = render(recent);

    let estimated: usize = rendered
        .iter()
        .map(|m| estimate_tokens(m["content"].as_str().unwrap_or("")))
        .sum();
    if estimated > max_tokens && recent.len() > 1 {
        return render(&recent[recent.len() - 1..]);
    }
    rendered
}

/// Plain text file summary. The first line is exactly `task_type: <value>`
/// so the model can reliably condition on it.
fn format_file_context(ctx: &Value, max_tokens: usize) -> String {
    let task_type = ctx
        .get("task_type")
        .or_else(|| ctx.get("detected_type"))
        .and_then(Value::as_str)
        .unwrap_or("unknown");

    let columns = ctx
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();

    let mut lines = vec![
        format!("task_type: {task_type}"),
        format!(
            "Filename: {}",
            ctx.get("filename").and_then(Value::as_str).unwrap_or("unknown")
        ),
        format!(
            "File path: {}",
            ctx.get("file_path").and_then(Value::as_str).unwrap_or("unknown")
        ),
        format!(
            "Rows: {}",
            ctx.get("row_count")
                .and_then(Value::as_u64)
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ),
        format!("Columns: {columns}"),
    ];

    if max_tokens > SAMPLE_MIN_BUDGET_TOKENS {
        if let Some(samples) = ctx.get("sample_rows").and_then(Value::as_array) {
            let preview: Vec<&Value> = samples.iter().take(2).collect();
            lines.push(format!(
                "Sample (first 2 rows): {}",
                serde_json::to_string(&preview).unwrap_or_default()
            ));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vema_core::prompts::Prompts;

    fn assembler() -> ContextAssembler {
        ContextAssembler::new(
            &Prompts::builtin(),
            vec![serde_json::json!({"type": "function", "function": {"name": "t"}})],
            6000,
        )
    }

    fn turn(user: &str, assistant: &str) -> WorkingTurn {
        WorkingTurn {
            user: user.to_string(),
            assistant: assistant.to_string(),
        }
    }

    #[test]
    fn user_message_is_last_and_tools_are_carried() {
        let ctx = assembler().assemble("你好", &[], &FactMemory::default(), None);
        assert_eq!(ctx.tools.len(), 1);
        let last = ctx.messages.last().unwrap();
        assert_eq!(last["role"], "user");
        assert_eq!(last["content"], "你好");
    }

    #[test]
    fn fact_memory_becomes_a_system_turn() {
        let mut fact = FactMemory::default();
        fact.recent_vehicle = Some("Passenger Car".to_string());
        fact.recent_year = Some(2020);

        let ctx = assembler().assemble("查一下", &[], &fact, None);
        let first = &ctx.messages[0];
        assert_eq!(first["role"], "system");
        let content = first["content"].as_str().unwrap();
        assert!(content.contains("Recent vehicle type: Passenger Car"));
        assert!(content.contains("Recent model year: 2020"));
    }

    #[test]
    fn empty_fact_memory_adds_no_system_turn() {
        let ctx = assembler().assemble("hi", &[], &FactMemory::default(), None);
        assert_eq!(ctx.messages.len(), 1);
    }

    #[test]
    fn working_memory_replays_last_three_turns() {
        let turns: Vec<WorkingTurn> = (0..5).map(|i| turn(&format!("u{i}"), "a")).collect();
        let ctx = assembler().assemble("now", &turns, &FactMemory::default(), None);
        // 3 turns * 2 messages + current user message.
        assert_eq!(ctx.messages.len(), 7);
        assert_eq!(ctx.messages[0]["content"], "u2");
    }

    #[test]
    fn over_budget_memory_keeps_only_most_recent_turn() {
        let big = "字".repeat(20_000);
        let turns = vec![turn("u0", &big), turn("u1", &big), turn("u2", "small")];
        let ctx = assembler().assemble("now", &turns, &FactMemory::default(), None);
        assert_eq!(ctx.messages.len(), 3);
        assert_eq!(ctx.messages[0]["content"], "u2");
        assert!(ctx.estimated_tokens <= 6000);
    }

    #[test]
    fn file_context_first_line_is_task_type() {
        let file_ctx = serde_json::json!({
            "filename": "traj.csv",
            "file_path": "/tmp/traj.csv",
            "task_type": "micro_emission",
            "row_count": 100,
            "columns": ["t", "speed_kph"],
            "sample_rows": [{"t": 0, "speed_kph": 30}],
        });
        let ctx = assembler().assemble("算一下", &[], &FactMemory::default(), Some(&file_ctx));
        let content = ctx.messages.last().unwrap()["content"].as_str().unwrap();
        assert!(content.starts_with("task_type: micro_emission\n"));
        assert!(content.contains("Filename: traj.csv"));
        assert!(content.ends_with("算一下"));
    }

    #[test]
    fn estimate_is_recorded() {
        let ctx = assembler().assemble("hello world", &[], &FactMemory::default(), None);
        assert!(ctx.estimated_tokens > 0);
        assert!(ctx.estimated_tokens <= 6000);
    }
}
