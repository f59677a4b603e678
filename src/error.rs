//! Error types for the Universal Agent SDK

use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the SDK
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Bad or missing provider credentials
    #[error("[{provider}] authentication failed: {message}")]
    Authentication { provider: String, message: String },

    /// Rate limited by a provider
    #[error("[{provider}] rate limit exceeded")]
    RateLimit {
        provider: String,
        /// Seconds the provider asked us to wait, when advertised
        retry_after: Option<f64>,
    },

    /// Requested model is not available on the provider
    #[error("[{provider}] model '{model}' not found")]
    ModelNotFound { provider: String, model: String },

    /// Conversation exceeds the provider's context window
    #[error("[{provider}] context length exceeded")]
    ContextLength {
        provider: String,
        max_tokens: Option<u32>,
        used_tokens: Option<u32>,
    },

    /// Catch-all for provider-side failures (transport, 5xx, unexpected body)
    #[error("[{provider}] {message}")]
    Provider {
        provider: String,
        message: String,
        status_code: Option<u16>,
    },

    /// Request timeout
    #[error("request timed out")]
    Timeout,

    /// Unable to reach a provider
    #[error("connection failed: {0}")]
    Connection(String),

    /// Tool lookup failed
    #[error("tool '{0}' not found")]
    ToolNotFound(String),

    /// Tool input failed validation
    #[error("tool '{tool}': validation error: {message}")]
    ToolValidation { tool: String, message: String },

    /// Tool execution error
    #[error("tool execution error: {0}")]
    Tool(String),

    /// Session lookup failed
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Container or worker process failed to start
    #[error("container failed to start: {0}")]
    ContainerStart(String),

    /// Worker never answered its health endpoint in time
    #[error("health check timed out after {0:?}")]
    HealthCheckTimeout(Duration),

    /// Memory backend failure
    #[error("memory error: {0}")]
    Memory(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Streaming error
    #[error("streaming error: {0}")]
    Stream(String),

    /// Invalid input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a new authentication error
    pub fn authentication(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Authentication {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a new rate-limit error
    pub fn rate_limit(provider: impl Into<String>, retry_after: Option<f64>) -> Self {
        Error::RateLimit {
            provider: provider.into(),
            retry_after,
        }
    }

    /// Create a new provider error
    pub fn provider(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
    ) -> Self {
        Error::Provider {
            provider: provider.into(),
            message: message.into(),
            status_code,
        }
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Whether a retry could plausibly succeed.
    ///
    /// Authentication and validation failures are permanent; rate limits,
    /// timeouts, connection drops, and 5xx responses are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::RateLimit { .. } | Error::Timeout | Error::Connection(_) => true,
            Error::Provider { status_code, .. } => {
                matches!(status_code, Some(code) if *code >= 500)
            }
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}
