//! LLM client speaking the OpenAI-compatible chat completions wire format,
//! with tool use and proxy→direct transport failover.

mod client;

pub use client::{LlmClient, LlmRole};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Seam between the orchestrator and a concrete LLM transport. `LlmClient`
/// is the production implementation; tests substitute scripted providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Plain chat, no tools exposed.
    async fn chat(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
    ) -> Result<LlmResponse, LlmError>;

    /// Chat with tool definitions; the model may answer with tool calls.
    async fn chat_with_tools(
        &self,
        messages: &[serde_json::Value],
        tools: &[serde_json::Value],
        system: Option<&str>,
    ) -> Result<LlmResponse, LlmError>;
}

/// A tool call extracted from the model response. `arguments` is already
/// parsed; calls with malformed argument JSON are dropped at parse time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Transport setup failed: {0}")]
    Transport(String),
}
