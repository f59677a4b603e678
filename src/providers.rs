//! Provider abstraction: the contract every LLM backend implements, plus a
//! process-wide registry with per-configuration instance caching.
//!
//! A provider owns both directions of its dialect: formatting SDK messages
//! and tools into the wire shape, and parsing responses and stream events
//! back into the canonical model. Streaming providers translate their vendor
//! event grammar into [`StreamEvent`](crate::StreamEvent)s on emission, so the
//! agent loop is dialect-blind.

pub mod anthropic;
pub mod openai;

use crate::types::{AgentEvent, AgentOptions, AssistantMessage, Message};
use crate::tools::ToolDefinition;
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::Stream;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, LazyLock, Mutex, Once};

/// Lazy finite sequence of canonical events ending in exactly one
/// ResultMessage.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<AgentEvent>> + Send>>;

/// Capability flags advertised by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderFeatures {
    pub streaming: bool,
    pub tool_calling: bool,
    pub vision: bool,
    pub thinking: bool,
    pub json_mode: bool,
    pub max_context_length: u32,
    pub supports_system_message: bool,
}

/// Ordered string map of provider credentials and endpoint overrides.
///
/// Backed by a `BTreeMap` so the cache fingerprint is stable regardless of
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderConfig {
    values: BTreeMap<String, String>,
}

impl ProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Stable hash used as the instance-cache key component.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::hash::DefaultHasher::new();
        for (key, value) in &self.values {
            key.hash(&mut hasher);
            value.hash(&mut hasher);
        }
        hasher.finish()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ProviderConfig {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Abstract LLM backend.
///
/// Implementations must be reentrant: one instance may serve many concurrent
/// sessions through the shared cache.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name of this provider.
    fn name(&self) -> &str;

    /// Capability flags.
    fn features(&self) -> ProviderFeatures;

    /// Model used when options carry none.
    fn default_model(&self) -> String;

    /// Convert SDK messages into the provider's request shape.
    ///
    /// The returned value is dialect-specific: the Anthropic dialect hoists
    /// system content into `{"system": ..., "messages": [...]}`, the OpenAI
    /// dialect returns `{"messages": [...]}` with system as a first-class
    /// role.
    fn format_messages(&self, messages: &[Message]) -> Value;

    /// Convert tool definitions into the provider's tool declaration shape.
    fn format_tools(&self, tools: &[Arc<ToolDefinition>]) -> Value;

    /// Parse a complete (non-streaming) response body.
    fn parse_response(&self, raw: &Value) -> Result<AssistantMessage>;

    /// One-shot completion.
    async fn complete(
        &self,
        messages: &[Message],
        options: &AgentOptions,
    ) -> Result<AssistantMessage>;

    /// Streaming completion. Yields canonical StreamEvents, the assembled
    /// AssistantMessage, then exactly one ResultMessage.
    async fn stream(&self, messages: &[Message], options: &AgentOptions) -> Result<EventStream>;
}

/// Factory producing a provider instance from a configuration.
pub type ProviderFactory = Arc<dyn Fn(ProviderConfig) -> Result<Arc<dyn Provider>> + Send + Sync>;

static FACTORIES: LazyLock<Mutex<HashMap<String, ProviderFactory>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static INSTANCES: LazyLock<Mutex<HashMap<(String, u64), Arc<dyn Provider>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

static BUILTIN: Once = Once::new();

/// Process-wide provider registry.
///
/// Instances are cached by `(name, config fingerprint)` and shared across
/// sessions.
pub struct ProviderRegistry;

impl ProviderRegistry {
    fn ensure_builtin() {
        BUILTIN.call_once(|| {
            let anthropic: ProviderFactory = Arc::new(|config| {
                Ok(Arc::new(anthropic::AnthropicProvider::new(config)?) as Arc<dyn Provider>)
            });
            let openai: ProviderFactory = Arc::new(|config| {
                Ok(Arc::new(openai::OpenAiProvider::new(config)?) as Arc<dyn Provider>)
            });
            let azure: ProviderFactory = Arc::new(|config| {
                Ok(Arc::new(openai::OpenAiProvider::new_azure(config)?) as Arc<dyn Provider>)
            });

            let mut factories = FACTORIES.lock().unwrap();
            factories.insert("anthropic".to_string(), Arc::clone(&anthropic));
            // "claude" is a historical alias for the Anthropic dialect
            factories.insert("claude".to_string(), anthropic);
            factories.insert("openai".to_string(), openai);
            factories.insert("azure_openai".to_string(), azure);
        });
    }

    /// Register (or replace) a provider factory under a name.
    pub fn register(name: impl Into<String>, factory: ProviderFactory) {
        Self::ensure_builtin();
        FACTORIES.lock().unwrap().insert(name.into(), factory);
    }

    /// Get or create a provider instance for `(name, config)`.
    pub fn get(name: &str, config: ProviderConfig) -> Result<Arc<dyn Provider>> {
        Self::ensure_builtin();

        let cache_key = (name.to_string(), config.fingerprint());
        if let Some(instance) = INSTANCES.lock().unwrap().get(&cache_key) {
            return Ok(Arc::clone(instance));
        }

        let factory = {
            let factories = FACTORIES.lock().unwrap();
            factories.get(name).cloned().ok_or_else(|| {
                Error::config(format!("provider '{}' is not registered", name))
            })?
        };

        let instance = factory(config)?;
        INSTANCES
            .lock()
            .unwrap()
            .insert(cache_key, Arc::clone(&instance));
        Ok(instance)
    }

    /// Names of all registered providers.
    pub fn list() -> Vec<String> {
        Self::ensure_builtin();
        let mut names: Vec<String> = FACTORIES.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_registered(name: &str) -> bool {
        Self::ensure_builtin();
        FACTORIES.lock().unwrap().contains_key(name)
    }
}

/// Map a non-success HTTP response onto the provider error taxonomy.
///
/// Shared by both dialect implementations.
pub(crate) fn error_from_response(
    provider: &str,
    status: reqwest::StatusCode,
    retry_after: Option<f64>,
    body: &str,
) -> Error {
    let status_code = status.as_u16();
    match status_code {
        401 | 403 => Error::authentication(provider, body.trim()),
        429 => Error::rate_limit(provider, retry_after),
        _ => {
            let lower = body.to_lowercase();
            if lower.contains("context length") || lower.contains("context_length") {
                Error::ContextLength {
                    provider: provider.to_string(),
                    max_tokens: None,
                    used_tokens: None,
                }
            } else if status_code == 404 && lower.contains("model") {
                Error::ModelNotFound {
                    provider: provider.to_string(),
                    model: extract_model_name(body).unwrap_or_else(|| "unknown".to_string()),
                }
            } else {
                Error::provider(provider, body.trim(), Some(status_code))
            }
        }
    }
}

fn extract_model_name(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(|s| s.to_string())
}

/// Map a reqwest transport failure onto the taxonomy.
pub(crate) fn error_from_transport(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else if e.is_connect() {
        Error::Connection(e.to_string())
    } else {
        Error::Http(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_fingerprint_order_independent() {
        let a = ProviderConfig::new()
            .set("api_key", "k")
            .set("base_url", "http://x");
        let b = ProviderConfig::new()
            .set("base_url", "http://x")
            .set("api_key", "k");
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = ProviderConfig::new().set("api_key", "other");
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_builtin_providers_registered() {
        assert!(ProviderRegistry::is_registered("anthropic"));
        assert!(ProviderRegistry::is_registered("claude"));
        assert!(ProviderRegistry::is_registered("openai"));
        assert!(ProviderRegistry::is_registered("azure_openai"));
        assert!(!ProviderRegistry::is_registered("nope"));
    }

    #[test]
    fn test_unknown_provider_errors() {
        let result = ProviderRegistry::get("nope", ProviderConfig::new());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_instance_cache_reuses_by_fingerprint() {
        let config = ProviderConfig::new().set("api_key", "cache-test-key");
        let a = ProviderRegistry::get("anthropic", config.clone()).unwrap();
        let b = ProviderRegistry::get("anthropic", config).unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = ProviderRegistry::get(
            "anthropic",
            ProviderConfig::new().set("api_key", "different-key"),
        )
        .unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_error_from_response_mapping() {
        let auth = error_from_response(
            "openai",
            reqwest::StatusCode::UNAUTHORIZED,
            None,
            "bad key",
        );
        assert!(matches!(auth, Error::Authentication { .. }));

        let limited = error_from_response(
            "openai",
            reqwest::StatusCode::TOO_MANY_REQUESTS,
            Some(2.0),
            "slow down",
        );
        assert!(matches!(
            limited,
            Error::RateLimit {
                retry_after: Some(_),
                ..
            }
        ));

        let context = error_from_response(
            "anthropic",
            reqwest::StatusCode::BAD_REQUEST,
            None,
            "prompt exceeds context length",
        );
        assert!(matches!(context, Error::ContextLength { .. }));

        let other = error_from_response(
            "anthropic",
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            None,
            "boom",
        );
        assert!(matches!(
            other,
            Error::Provider {
                status_code: Some(500),
                ..
            }
        ));
    }
}
