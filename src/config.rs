//! Configuration and secrets resolution.
//!
//! Each `(provider, key)` pair resolves through a fixed priority chain:
//! in-process overrides, then a pluggable secret fetcher, then the mapped
//! environment variable, then built-in defaults. The environment variable
//! names are part of the external contract:
//!
//! | Provider | Key | Variable |
//! |---|---|---|
//! | anthropic / claude | api_key | `ANTHROPIC_API_KEY` |
//! | anthropic / claude | base_url | `ANTHROPIC_BASE_URL` |
//! | openai | api_key | `OPENAI_API_KEY` |
//! | openai | base_url | `OPENAI_BASE_URL` |
//! | openai | organization | `OPENAI_ORG_ID` |
//! | azure_openai | api_key | `AZURE_OPENAI_API_KEY` |
//! | azure_openai | azure_endpoint | `AZURE_OPENAI_ENDPOINT` |
//! | azure_openai | api_version | `AZURE_OPENAI_API_VERSION` (default `2024-02-01`) |
//! | azure_openai | deployment_name | `AZURE_OPENAI_DEPLOYMENT` |
//!
//! # Example
//!
//! ```rust,no_run
//! use universal_agent::config::Config;
//!
//! let config = Config::new().set_api_key("anthropic", "sk-ant-...");
//! assert!(config.is_configured("anthropic"));
//! let provider_config = config.provider_config("anthropic");
//! ```

use crate::providers::ProviderConfig;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::sync::Arc;

/// Pluggable secret source (AWS/GCP/Vault adapters, test doubles). Receives
/// the environment-variable name for the requested key.
pub type SecretFetcher = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Providers the env-var table knows about.
const KNOWN_PROVIDERS: &[&str] = &["anthropic", "claude", "openai", "azure_openai"];

/// Environment variable for a `(provider, key)` pair.
fn env_var(provider: &str, key: &str) -> Option<&'static str> {
    match (provider, key) {
        ("anthropic" | "claude", "api_key") => Some("ANTHROPIC_API_KEY"),
        ("anthropic" | "claude", "base_url") => Some("ANTHROPIC_BASE_URL"),
        ("openai", "api_key") => Some("OPENAI_API_KEY"),
        ("openai", "base_url") => Some("OPENAI_BASE_URL"),
        ("openai", "organization") => Some("OPENAI_ORG_ID"),
        ("azure_openai", "api_key") => Some("AZURE_OPENAI_API_KEY"),
        ("azure_openai", "azure_endpoint") => Some("AZURE_OPENAI_ENDPOINT"),
        ("azure_openai", "api_version") => Some("AZURE_OPENAI_API_VERSION"),
        ("azure_openai", "deployment_name") => Some("AZURE_OPENAI_DEPLOYMENT"),
        _ => None,
    }
}

/// All keys a provider can carry, for `provider_config` assembly.
fn provider_keys(provider: &str) -> &'static [&'static str] {
    match provider {
        "anthropic" | "claude" => &["api_key", "base_url"],
        "openai" => &["api_key", "base_url", "organization"],
        "azure_openai" => &["api_key", "azure_endpoint", "api_version", "deployment_name"],
        _ => &[],
    }
}

/// Built-in defaults, lowest priority.
fn default_value(provider: &str, key: &str) -> Option<&'static str> {
    match (provider, key) {
        ("azure_openai", "api_version") => Some("2024-02-01"),
        _ => None,
    }
}

/// Configuration manager resolving provider credentials and endpoints.
#[derive(Clone, Default)]
pub struct Config {
    overrides: HashMap<String, BTreeMap<String, String>>,
    secret_fetcher: Option<SecretFetcher>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Override values may be credentials; show only which keys are set
        let keys: Vec<String> = self
            .overrides
            .iter()
            .map(|(provider, map)| {
                format!("{}: [{}]", provider, map.keys().cloned().collect::<Vec<_>>().join(", "))
            })
            .collect();
        f.debug_struct("Config")
            .field("overrides", &keys)
            .field("secret_fetcher", &self.secret_fetcher.is_some())
            .finish()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a secret fetcher consulted before environment variables.
    pub fn with_secret_fetcher<F>(mut self, fetcher: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.secret_fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Set an in-process override (highest priority).
    pub fn set(
        mut self,
        provider: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.overrides
            .entry(provider.into().to_lowercase())
            .or_default()
            .insert(key.into(), value.into());
        self
    }

    pub fn set_api_key(self, provider: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.set(provider, "api_key", api_key)
    }

    /// Resolve one value: overrides > secret fetcher > environment > defaults.
    pub fn get(&self, provider: &str, key: &str) -> Option<String> {
        let provider = provider.to_lowercase();

        if let Some(value) = self
            .overrides
            .get(&provider)
            .and_then(|map| map.get(key))
        {
            return Some(value.clone());
        }

        let var = env_var(&provider, key);

        if let (Some(fetcher), Some(var)) = (&self.secret_fetcher, var) {
            if let Some(secret) = fetcher(var) {
                return Some(secret);
            }
        }

        if let Some(var) = var {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }

        default_value(&provider, key).map(|s| s.to_string())
    }

    pub fn api_key(&self, provider: &str) -> Option<String> {
        self.get(provider, "api_key")
    }

    /// All resolvable keys for a provider, packed for the registry.
    pub fn provider_config(&self, provider: &str) -> ProviderConfig {
        let normalized = provider.to_lowercase();
        let mut config = ProviderConfig::new();

        for key in provider_keys(&normalized) {
            if let Some(value) = self.get(&normalized, key) {
                config = config.set(*key, value);
            }
        }

        // Overrides may carry keys outside the known table
        if let Some(extra) = self.overrides.get(&normalized) {
            for (key, value) in extra {
                config = config.set(key.clone(), value.clone());
            }
        }

        config
    }

    /// Required keys that fail to resolve for a provider.
    pub fn validate(&self, provider: &str) -> Vec<&'static str> {
        let provider = provider.to_lowercase();
        let mut missing = Vec::new();

        match provider.as_str() {
            "anthropic" | "claude" | "openai" => {
                if self.api_key(&provider).is_none() {
                    missing.push("api_key");
                }
            }
            "azure_openai" => {
                if self.api_key(&provider).is_none() {
                    missing.push("api_key");
                }
                if self.get(&provider, "azure_endpoint").is_none() {
                    missing.push("azure_endpoint");
                }
            }
            _ => {}
        }

        missing
    }

    /// True when every required key resolves.
    pub fn is_configured(&self, provider: &str) -> bool {
        self.validate(provider).is_empty()
    }

    /// Providers from the known table that are fully configured.
    pub fn configured_providers(&self) -> Vec<&'static str> {
        KNOWN_PROVIDERS
            .iter()
            .filter(|provider| self.is_configured(provider))
            .copied()
            .collect()
    }
}
