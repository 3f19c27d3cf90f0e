//! Context window detection
//!
//! Resolves a model's maximum context size through a fallback chain:
//!   1. Live query to the provider's introspection endpoint (time-bounded)
//!   2. Exact or glob match against the known-windows table
//!   3. Caller-configured value
//!   4. Hard-coded default
//!
//! Every failure is logged and swallowed; `detect` always returns a usable
//! token count.

use crate::{Result, WardenError};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Window used when every other step fails
pub const DEFAULT_WINDOW_TOKENS: usize = 8_192;

/// Default bound on the live query
pub const DEFAULT_DETECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Built-in known windows. Exact ids first, then families.
const BUILT_IN_WINDOWS: &[(&str, usize)] = &[
    ("gpt-4", 8_192),
    ("gpt-4-32k", 32_768),
    ("gpt-3.5-turbo", 16_385),
    ("gpt-4-turbo*", 128_000),
    ("gpt-4o*", 128_000),
    ("gpt-4.1*", 1_047_576),
    ("gpt-5*", 400_000),
    ("o1*", 200_000),
    ("o3*", 200_000),
    ("o4-mini*", 200_000),
    ("claude-2*", 100_000),
    ("claude-3-*", 200_000),
    ("claude-3.5-*", 200_000),
    ("claude-3.7-*", 200_000),
    ("claude-sonnet-4*", 200_000),
    ("claude-opus-4*", 200_000),
    ("claude-haiku-4*", 200_000),
    ("gemini-1.5-pro*", 2_097_152),
    ("gemini-1.5-flash*", 1_048_576),
    ("gemini-2*", 1_048_576),
    ("llama3.1*", 131_072),
    ("llama3.2*", 131_072),
    ("llama3*", 8_192),
    ("mistral-large*", 131_072),
    ("deepseek-*", 65_536),
    ("qwen2.5-coder*", 32_768),
];

/// Which step of the chain produced the answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Live,
    KnownTable,
    Configured,
    Default,
}

impl std::fmt::Display for DetectionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::KnownTable => write!(f, "known table"),
            Self::Configured => write!(f, "configured"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// A detected window size and where it came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Detection {
    pub tokens: usize,
    pub source: DetectionSource,
}

/// One entry in the known-windows table. `model` may be a glob pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownWindow {
    pub model: String,
    pub tokens: usize,
}

/// Detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Bound on the live query, in milliseconds
    pub timeout_ms: u64,
    /// Step 3 of the chain
    pub configured_window: Option<usize>,
    /// Step 4 of the chain
    pub default_window: usize,
    /// Provider name -> introspection base URL. Providers without an entry
    /// skip the live query.
    pub endpoints: HashMap<String, String>,
    /// Extra table entries, consulted before the built-ins
    pub known_windows: Vec<KnownWindow>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_DETECTION_TIMEOUT.as_millis() as u64,
            configured_window: None,
            default_window: DEFAULT_WINDOW_TOKENS,
            endpoints: HashMap::new(),
            known_windows: Vec::new(),
        }
    }
}

impl DetectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Live introspection of a provider's model metadata
pub trait ModelIntrospector: Send + Sync {
    /// Return the model's maximum context size in tokens
    fn query<'a>(&'a self, provider: &'a str, model_id: &'a str) -> BoxFuture<'a, Result<usize>>;
}

/// Introspector that talks to provider HTTP endpoints
pub struct HttpIntrospector {
    client: Client,
    endpoints: HashMap<String, String>,
}

impl HttpIntrospector {
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("context-warden/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, endpoints }
    }

    async fn query_endpoint(&self, provider: &str, model_id: &str) -> Result<usize> {
        let base = self
            .endpoints
            .get(provider)
            .ok_or_else(|| {
                WardenError::Detection(format!("no introspection endpoint for {provider}"))
            })?
            .trim_end_matches('/');

        let body: serde_json::Value = match provider {
            "ollama" => {
                self.client
                    .post(format!("{base}/api/show"))
                    .json(&serde_json::json!({ "model": model_id }))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?
            }
            "openrouter" => {
                self.client
                    .get(format!("{base}/api/v1/models"))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?
            }
            _ => {
                self.client
                    .get(format!("{base}/models/{model_id}"))
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?
            }
        };

        parse_window_response(provider, model_id, &body).ok_or_else(|| {
            WardenError::Detection(format!(
                "{provider} response carried no context size for {model_id}"
            ))
        })
    }
}

impl ModelIntrospector for HttpIntrospector {
    fn query<'a>(&'a self, provider: &'a str, model_id: &'a str) -> BoxFuture<'a, Result<usize>> {
        Box::pin(self.query_endpoint(provider, model_id))
    }
}

/// Extract a context size from a provider response body
fn parse_window_response(provider: &str, model_id: &str, body: &serde_json::Value) -> Option<usize> {
    let as_tokens = |v: &serde_json::Value| v.as_u64().map(|n| n as usize).filter(|n| *n > 0);

    match provider {
        "ollama" => body
            .get("model_info")?
            .as_object()?
            .iter()
            .find(|(key, _)| key.ends_with(".context_length"))
            .and_then(|(_, v)| as_tokens(v)),
        "openrouter" => body
            .get("data")?
            .as_array()?
            .iter()
            .find(|m| m.get("id").and_then(|id| id.as_str()) == Some(model_id))
            .and_then(|m| m.get("context_length"))
            .and_then(as_tokens),
        _ => ["max_tokens", "context_length", "context_window", "max_input_tokens"]
            .iter()
            .find_map(|key| body.get(key).and_then(as_tokens)),
    }
}

/// Resolves context window sizes
pub struct WindowDetector {
    config: DetectionConfig,
    introspector: Arc<dyn ModelIntrospector>,
}

impl WindowDetector {
    pub fn new(config: DetectionConfig) -> Self {
        let introspector = Arc::new(HttpIntrospector::new(config.endpoints.clone()));
        Self {
            config,
            introspector,
        }
    }

    /// Replace the live-query backend
    pub fn with_introspector(mut self, introspector: Arc<dyn ModelIntrospector>) -> Self {
        self.introspector = introspector;
        self
    }

    /// Detect the window for a model, always returning a usable size
    pub async fn detect(&self, provider: &str, model_id: &str, timeout: Duration) -> usize {
        self.detect_with_source(provider, model_id, timeout).await.tokens
    }

    /// Like [`detect`](Self::detect), also reporting which step answered
    pub async fn detect_with_source(
        &self,
        provider: &str,
        model_id: &str,
        timeout: Duration,
    ) -> Detection {
        let detection = self.resolve(provider, model_id, timeout).await;
        info!(
            "Context window for {}/{}: {} tokens ({})",
            provider, model_id, detection.tokens, detection.source
        );
        detection
    }

    async fn resolve(&self, provider: &str, model_id: &str, timeout: Duration) -> Detection {
        if self.config.endpoints.contains_key(provider) {
            match tokio::time::timeout(timeout, self.introspector.query(provider, model_id)).await
            {
                Ok(Ok(tokens)) if tokens > 0 => {
                    return Detection {
                        tokens,
                        source: DetectionSource::Live,
                    };
                }
                Ok(Ok(_)) => warn!("Live query for {} returned an empty window", model_id),
                Ok(Err(e)) => warn!("Live window query for {} failed: {}", model_id, e),
                Err(_) => warn!(
                    "Live window query for {} timed out after {:?}",
                    model_id, timeout
                ),
            }
        } else {
            debug!("No introspection endpoint for provider {}", provider);
        }

        if let Some(tokens) = self.lookup_known(model_id) {
            return Detection {
                tokens,
                source: DetectionSource::KnownTable,
            };
        }
        debug!("{} not in known-windows table", model_id);

        if let Some(tokens) = self.config.configured_window.filter(|t| *t > 0) {
            return Detection {
                tokens,
                source: DetectionSource::Configured,
            };
        }

        Detection {
            tokens: self.config.default_window.max(1),
            source: DetectionSource::Default,
        }
    }

    /// Look a model up in the known-windows table: configured entries before
    /// built-ins, exact matches before patterns.
    pub fn lookup_known(&self, model_id: &str) -> Option<usize> {
        let entries: Vec<(&str, usize)> = self
            .config
            .known_windows
            .iter()
            .map(|k| (k.model.as_str(), k.tokens))
            .chain(BUILT_IN_WINDOWS.iter().copied())
            .collect();

        let model = model_id.to_lowercase();
        // Provider-qualified ids such as "anthropic/claude-3-opus"
        let bare = model.rsplit('/').next().unwrap_or(&model).to_string();

        if let Some((_, tokens)) = entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&model) || name.eq_ignore_ascii_case(&bare))
        {
            return Some(*tokens);
        }

        entries.iter().find_map(|(name, tokens)| {
            let pattern = glob::Pattern::new(&name.to_lowercase()).ok()?;
            (pattern.matches(&model) || pattern.matches(&bare)).then_some(*tokens)
        })
    }
}
