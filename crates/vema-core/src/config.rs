use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VemaError};

pub const DEFAULT_PORT: u16 = 18080;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Per-request LLM timeout in seconds.
pub const LLM_TIMEOUT_SECS: u64 = 120;
/// Streaming heartbeat cadence while an LLM call is in flight.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Top-level config (vema.toml + VEMA_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VemaConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub standardizer: StandardizerConfig,
    /// Optional TOML file overriding the built-in standardization mappings.
    #[serde(default)]
    pub mappings_path: Option<PathBuf>,
    /// Optional TOML file overriding the built-in prompt bundle.
    #[serde(default)]
    pub prompts_path: Option<PathBuf>,
}

impl VemaConfig {
    /// Load from `vema.toml` in the working directory plus `VEMA_*` env vars.
    /// Missing file is fine (defaults apply); a malformed file is fatal.
    pub fn load() -> Result<Self> {
        Self::load_from("vema.toml")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("VEMA_").split("__"))
            .extract()
            .map_err(|e| VemaError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Allowed CORS origins. Empty means allow any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            cors_origins: Vec::new(),
        }
    }
}

/// Per-role LLM assignment. The agent role drives the tool loop; synthesis,
/// refiner, and standardizer are text-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRoleConfig {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible base URL, e.g. "https://dashscope.aliyuncs.com/compatible-mode/v1".
    pub base_url: String,
    pub api_key: String,
    /// Optional proxy URL. When set, requests go through the proxy first and
    /// fail over to a direct connection on connection-class errors.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_agent_role")]
    pub agent: LlmRoleConfig,
    #[serde(default = "default_synthesis_role")]
    pub synthesis: LlmRoleConfig,
    #[serde(default = "default_refiner_role")]
    pub refiner: LlmRoleConfig,
    #[serde(default = "default_standardizer_role")]
    pub standardizer: LlmRoleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Root for per-user session state: `{data_dir}/sessions/{user_id}/...`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Generated result workbooks land here; downloads must resolve inside it.
    #[serde(default = "default_outputs_dir")]
    pub outputs_dir: PathBuf,
    /// Uploaded files, keyed `{session_id}_input.{ext}`.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            outputs_dir: default_outputs_dir(),
            tmp_dir: default_tmp_dir(),
        }
    }
}

/// Tunable orchestrator limits. Defaults mirror production behavior and the
/// values asserted by the test suite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls_per_turn: u32,
    #[serde(default = "default_working_memory_turns")]
    pub working_memory_turns: usize,
    #[serde(default = "default_assistant_excerpt_chars")]
    pub assistant_excerpt_chars: usize,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Final text is streamed in chunks of this many characters.
    #[serde(default = "default_text_chunk_chars")]
    pub text_chunk_chars: usize,
    #[serde(default = "default_text_chunk_delay_ms")]
    pub text_chunk_delay_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tool_calls_per_turn: default_max_tool_calls(),
            working_memory_turns: default_working_memory_turns(),
            assistant_excerpt_chars: default_assistant_excerpt_chars(),
            max_context_tokens: default_max_context_tokens(),
            heartbeat_secs: default_heartbeat_secs(),
            text_chunk_chars: default_text_chunk_chars(),
            text_chunk_delay_ms: default_text_chunk_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardizerConfig {
    /// Similarity score (0-100) required for a fuzzy vehicle match.
    #[serde(default = "default_vehicle_threshold")]
    pub vehicle_fuzzy_threshold: u32,
    /// Pollutants match stricter than vehicles.
    #[serde(default = "default_pollutant_threshold")]
    pub pollutant_fuzzy_threshold: u32,
    /// Enable the out-of-process local model fallback.
    #[serde(default)]
    pub local_model_enabled: bool,
    #[serde(default)]
    pub local_model_url: Option<String>,
}

impl Default for StandardizerConfig {
    fn default() -> Self {
        Self {
            vehicle_fuzzy_threshold: default_vehicle_threshold(),
            pollutant_fuzzy_threshold: default_pollutant_threshold(),
            local_model_enabled: false,
            local_model_url: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    8000
}
fn default_timeout_secs() -> u64 {
    LLM_TIMEOUT_SECS
}
fn default_agent_role() -> LlmRoleConfig {
    LlmRoleConfig {
        model: "qwen-plus".to_string(),
        temperature: 0.0,
        max_tokens: 8000,
    }
}
fn default_synthesis_role() -> LlmRoleConfig {
    LlmRoleConfig {
        model: "qwen-plus".to_string(),
        temperature: 0.7,
        max_tokens: 8000,
    }
}
fn default_refiner_role() -> LlmRoleConfig {
    LlmRoleConfig {
        model: "qwen-plus".to_string(),
        temperature: 0.7,
        max_tokens: 8000,
    }
}
fn default_standardizer_role() -> LlmRoleConfig {
    LlmRoleConfig {
        model: "qwen-turbo-latest".to_string(),
        temperature: 0.1,
        max_tokens: 200,
    }
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_outputs_dir() -> PathBuf {
    PathBuf::from("outputs")
}
fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir().join("emission_agent")
}
fn default_max_tool_calls() -> u32 {
    3
}
fn default_working_memory_turns() -> usize {
    5
}
fn default_assistant_excerpt_chars() -> usize {
    300
}
fn default_max_context_tokens() -> usize {
    6000
}
fn default_heartbeat_secs() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}
fn default_text_chunk_chars() -> usize {
    20
}
fn default_text_chunk_delay_ms() -> u64 {
    50
}
fn default_vehicle_threshold() -> u32 {
    70
}
fn default_pollutant_threshold() -> u32 {
    80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_defaults_match_documented_constants() {
        let limits = Limits::default();
        assert_eq!(limits.max_tool_calls_per_turn, 3);
        assert_eq!(limits.working_memory_turns, 5);
        assert_eq!(limits.assistant_excerpt_chars, 300);
        assert_eq!(limits.max_context_tokens, 6000);
        assert_eq!(limits.heartbeat_secs, 15);
    }

    #[test]
    fn config_parses_minimal_toml() {
        let toml = r#"
            [llm]
            base_url = "https://example.com/v1"
            api_key = "sk-test"
        "#;
        let cfg: VemaConfig = toml::from_str(toml).expect("parse failed");
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.llm.timeout_secs, 120);
        assert_eq!(cfg.llm.agent.temperature, 0.0);
        assert_eq!(cfg.standardizer.vehicle_fuzzy_threshold, 70);
        assert_eq!(cfg.standardizer.pollutant_fuzzy_threshold, 80);
    }
}
