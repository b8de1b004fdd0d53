use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use vema_core::config::{LlmConfig, LlmRoleConfig};

use crate::{LlmError, LlmResponse, ToolCall};

/// Which prompt profile a client instance serves. Each role carries its own
/// model, temperature, and token cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmRole {
    Agent,
    Synthesis,
    Refiner,
    Standardizer,
}

struct Transport {
    label: &'static str,
    http: reqwest::Client,
}

/// Chat client over an OpenAI-compatible endpoint.
///
/// Keeps at most two transports: through the configured proxy and direct.
/// Connection-class failures on one transport retry on the other within the
/// same call; the transport that succeeds becomes preferred for subsequent
/// calls. Non-connection errors fail immediately.
pub struct LlmClient {
    transports: Vec<Transport>,
    preferred: AtomicUsize,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    pub fn for_role(config: &LlmConfig, role: LlmRole) -> Result<Self, LlmError> {
        let role_cfg: &LlmRoleConfig = match role {
            LlmRole::Agent => &config.agent,
            LlmRole::Synthesis => &config.synthesis,
            LlmRole::Refiner => &config.refiner,
            LlmRole::Standardizer => &config.standardizer,
        };

        let timeout = Duration::from_secs(config.timeout_secs);
        let mut transports = Vec::new();

        if let Some(proxy_url) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| LlmError::Transport(format!("invalid proxy {proxy_url}: {e}")))?;
            let http = reqwest::Client::builder()
                .proxy(proxy)
                .timeout(timeout)
                .build()
                .map_err(|e| LlmError::Transport(e.to_string()))?;
            transports.push(Transport {
                label: "proxy",
                http,
            });
        }

        let direct = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Transport(e.to_string()))?;
        transports.push(Transport {
            label: "direct",
            http: direct,
        });

        Ok(Self {
            transports,
            preferred: AtomicUsize::new(0),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: role_cfg.model.clone(),
            temperature: role_cfg.temperature,
            max_tokens: role_cfg.max_tokens,
        })
    }

    /// Plain chat, no tools exposed.
    pub async fn chat(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        let body = build_body(
            &self.model,
            messages,
            system,
            None,
            self.temperature,
            self.max_tokens,
        );
        self.request(body).await
    }

    /// Chat with tool definitions; the model may answer with tool calls.
    pub async fn chat_with_tools(
        &self,
        messages: &[serde_json::Value],
        tools: &[serde_json::Value],
        system: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        let body = build_body(
            &self.model,
            messages,
            system,
            Some(tools),
            self.temperature,
            self.max_tokens,
        );
        self.request(body).await
    }

    async fn request(&self, body: serde_json::Value) -> Result<LlmResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let start = self.preferred.load(Ordering::Relaxed).min(self.transports.len() - 1);

        let mut last_connection_error: Option<LlmError> = None;

        for offset in 0..self.transports.len() {
            let idx = (start + offset) % self.transports.len();
            let transport = &self.transports[idx];

            debug!(model = %self.model, transport = transport.label, "sending chat request");

            let sent = transport
                .http
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            let resp = match sent {
                Ok(r) => r,
                Err(e) => {
                    if is_connection_error(&e) {
                        warn!(transport = transport.label, error = %e, "connection failed, trying alternate transport");
                        last_connection_error = Some(LlmError::Http(e));
                        continue;
                    }
                    return Err(LlmError::Http(e));
                }
            };

            let status = resp.status().as_u16();
            if !resp.status().is_success() {
                let message = resp.text().await.unwrap_or_default();
                warn!(status, body = %message, "LLM API error");
                return Err(LlmError::Api { status, message });
            }

            let api_resp = match resp.json::<ApiResponse>().await {
                Ok(r) => r,
                Err(e) => {
                    // A body that died mid-transfer is still connection-class.
                    if is_connection_error(&e) {
                        warn!(transport = transport.label, error = %e, "response body truncated, trying alternate transport");
                        last_connection_error = Some(LlmError::Http(e));
                        continue;
                    }
                    return Err(LlmError::Parse(e.to_string()));
                }
            };

            if idx != start {
                warn!(
                    transport = transport.label,
                    "switched transports after connection failure"
                );
            }
            self.preferred.store(idx, Ordering::Relaxed);

            return Ok(parse_response(api_resp)?);
        }

        Err(last_connection_error
            .unwrap_or_else(|| LlmError::Transport("no transports configured".to_string())))
    }
}

#[async_trait::async_trait]
impl crate::ChatProvider for LlmClient {
    async fn chat(
        &self,
        messages: &[serde_json::Value],
        system: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        LlmClient::chat(self, messages, system).await
    }

    async fn chat_with_tools(
        &self,
        messages: &[serde_json::Value],
        tools: &[serde_json::Value],
        system: Option<&str>,
    ) -> Result<LlmResponse, LlmError> {
        LlmClient::chat_with_tools(self, messages, tools, system).await
    }
}

fn build_body(
    model: &str,
    messages: &[serde_json::Value],
    system: Option<&str>,
    tools: Option<&[serde_json::Value]>,
    temperature: f32,
    max_tokens: u32,
) -> serde_json::Value {
    let mut full_messages: Vec<serde_json::Value> = Vec::with_capacity(messages.len() + 1);
    if let Some(system) = system {
        full_messages.push(serde_json::json!({ "role": "system", "content": system }));
    }
    full_messages.extend_from_slice(messages);

    let mut body = serde_json::json!({
        "model": model,
        "messages": full_messages,
        "temperature": temperature,
        "max_tokens": max_tokens,
    });
    if let Some(tools) = tools {
        body["tools"] = serde_json::Value::Array(tools.to_vec());
        body["tool_choice"] = serde_json::json!("auto");
    }
    body
}

fn is_connection_error(e: &reqwest::Error) -> bool {
    if e.is_connect() || e.is_timeout() {
        return true;
    }
    is_connection_message(&format!("{e:?}"))
}

/// Signals from the transport layer that justify trying the other transport.
fn is_connection_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["connection error", "connecterror", "timed out", "unexpected eof", "ssl", "tls"]
        .iter()
        .any(|sig| lower.contains(sig))
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ApiToolCall>>,
}

#[derive(Deserialize)]
struct ApiToolCall {
    id: String,
    function: ApiFunction,
}

#[derive(Deserialize)]
struct ApiFunction {
    name: String,
    /// Serialized JSON object, exactly as the model produced it.
    arguments: String,
}

fn parse_response(api: ApiResponse) -> Result<LlmResponse, LlmError> {
    let choice = api
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Parse("response has no choices".to_string()))?;

    let mut tool_calls = Vec::new();
    if let Some(calls) = choice.message.tool_calls {
        for call in calls {
            match serde_json::from_str::<serde_json::Value>(&call.function.arguments) {
                Ok(arguments) => tool_calls.push(ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }),
                Err(e) => {
                    // Only the malformed call is dropped; the rest survive.
                    warn!(tool = %call.function.name, error = %e, "dropping tool call with malformed arguments");
                }
            }
        }
    }

    Ok(LlmResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        finish_reason: choice.finish_reason.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_signals_classify_as_connection_errors() {
        assert!(is_connection_message("Connection error: refused"));
        assert!(is_connection_message("request timed out"));
        assert!(is_connection_message("unexpected EOF during handshake"));
        assert!(is_connection_message("SSL routines: wrong version"));
        assert!(is_connection_message("TLS handshake failed"));
    }

    #[test]
    fn non_connection_signals_do_not_classify() {
        assert!(!is_connection_message("invalid api key"));
        assert!(!is_connection_message("model not found"));
        assert!(!is_connection_message("rate limit exceeded"));
    }

    #[test]
    fn body_includes_system_and_tools() {
        let messages = vec![serde_json::json!({"role": "user", "content": "hi"})];
        let tools = vec![serde_json::json!({"type": "function", "function": {"name": "f"}})];
        let body = build_body("qwen-plus", &messages, Some("sys"), Some(&tools), 0.0, 100);

        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(body["tool_choice"], "auto");
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn body_without_tools_omits_tool_choice() {
        let messages = vec![serde_json::json!({"role": "user", "content": "hi"})];
        let body = build_body("qwen-plus", &messages, None, None, 0.7, 100);
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn malformed_tool_call_arguments_drop_only_that_call() {
        let api: ApiResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [
                        {"id": "a", "function": {"name": "good", "arguments": "{\"x\": 1}"}},
                        {"id": "b", "function": {"name": "bad", "arguments": "{not json"}}
                    ]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();

        let parsed = parse_response(api).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "good");
        assert_eq!(parsed.tool_calls[0].arguments["x"], 1);
    }
}
