//! Optional out-of-process standardizer model.
//!
//! When the alias table and fuzzy matching both miss, a small fine-tuned
//! model can be consulted over HTTP. The model is advisory only: guesses are
//! accepted solely when it reports high confidence and names a known
//! canonical value.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Vehicle,
    Pollutant,
}

impl EntityKind {
    fn as_str(self) -> &'static str {
        match self {
            EntityKind::Vehicle => "vehicle",
            EntityKind::Pollutant => "pollutant",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FallbackGuess {
    pub standard_name: String,
    pub confidence: f64,
}

#[async_trait]
pub trait FallbackStandardizer: Send + Sync {
    /// Best guess for `raw`, or `None` when the model has nothing useful.
    /// Transport failures are swallowed; the fallback is best-effort.
    async fn standardize(&self, kind: EntityKind, raw: &str) -> Option<FallbackGuess>;
}

/// HTTP client for a locally hosted standardizer model.
pub struct LocalModelClient {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
struct StandardizeRequest<'a> {
    kind: &'static str,
    text: &'a str,
}

impl LocalModelClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl FallbackStandardizer for LocalModelClient {
    async fn standardize(&self, kind: EntityKind, raw: &str) -> Option<FallbackGuess> {
        let url = format!("{}/standardize", self.base_url.trim_end_matches('/'));
        let body = StandardizeRequest {
            kind: kind.as_str(),
            text: raw,
        };

        let resp = match self.client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "local standardizer model unreachable");
                return None;
            }
        };
        if !resp.status().is_success() {
            warn!(status = resp.status().as_u16(), "local standardizer model error");
            return None;
        }
        match resp.json::<FallbackGuess>().await {
            Ok(guess) => Some(guess),
            Err(e) => {
                warn!(error = %e, "local standardizer model returned malformed JSON");
                None
            }
        }
    }
}
