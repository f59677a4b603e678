//! # Universal Agent SDK
//!
//! A provider-agnostic, streaming-first Rust runtime for LLM agents.
//!
//! ## Overview
//!
//! The SDK drives chat/completion calls against multiple backends through one
//! canonical message and event model:
//!
//! - **Anthropic dialect**: typed content blocks, block-oriented streaming,
//!   thinking support
//! - **OpenAI dialect**: flat content with parallel tool-call arrays,
//!   delta-chunk streaming (Azure variant included)
//!
//! On top of the providers sits a bounded agentic loop that executes tool
//! calls autonomously, gated by lifecycle hooks and a per-call permission
//! callback, and a session layer that packages agent workers into containers
//! or local processes with idle eviction.
//!
//! ## Two Interaction Modes
//!
//! ### 1. One-shot query
//!
//! ```rust,no_run
//! use universal_agent::{query, AgentOptions, AgentEvent};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AgentOptions::builder()
//!         .provider("anthropic")
//!         .system_prompt("You are a helpful assistant")
//!         .build()?;
//!
//!     let mut stream = query("What's the capital of France?", &options).await?;
//!     while let Some(event) = stream.next().await {
//!         if let AgentEvent::Assistant(msg) = event? {
//!             println!("{}", msg.text());
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ### 2. Stateful client
//!
//! ```rust,no_run
//! use universal_agent::{AgentClient, AgentOptions, AgentEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AgentOptions::builder().provider("openai").build()?;
//!     let mut client = AgentClient::new(options);
//!     client.connect().await?;
//!
//!     client.send("Hello, I'm working on a Rust project.").await?;
//!     while let Some(event) = client.receive().await {
//!         if let AgentEvent::Assistant(msg) = event? {
//!             println!("{}", msg.text());
//!         }
//!     }
//!
//!     // Follow-up: context is maintained
//!     client.send("Can you help me write a test?").await?;
//!     while let Some(event) = client.receive().await {
//!         if let AgentEvent::Result(result) = event? {
//!             println!("finished in {} turns", result.num_turns);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **types**: message/content model, canonical stream events, options
//! - **providers**: provider contract, registry, and the two dialects
//! - **client**: the agentic tool loop
//! - **tools**: tool definitions, registry, schema builder
//! - **hooks**: lifecycle hook pipeline
//! - **session**: session manager with background idle eviction
//! - **container**: per-session worker lifecycle (container runtime or local
//!   process)
//! - **config**: credential/endpoint resolution with pluggable secret sources
//! - **memory**: persistent memory contract and JSON-file backend
//! - **context**: token estimation and history truncation helpers
//! - **retry**: exponential backoff for transient provider failures

mod client;
mod error;
mod types;

/// Configuration and secrets resolution.
pub mod config;

/// Per-session worker lifecycle providers.
pub mod container;

/// Context window estimation and truncation helpers.
pub mod context;

/// Lifecycle hook pipeline.
pub mod hooks;

/// Persistent memory backends.
pub mod memory;

/// Provider contract, registry, and dialect implementations.
pub mod providers;

/// Retry utilities with exponential backoff and jitter.
pub mod retry;

/// Session manager and records.
pub mod session;

/// Tool definition system.
pub mod tools;

// --- Core Client API ---

pub use client::{AgentClient, query};

// --- Errors ---

pub use error::{Error, Result};

// --- Core Types ---

pub use types::{
    AgentEvent, AgentOptions, AgentOptionsBuilder, AssistantMessage, ContentBlock, FinishReason,
    ImageBlock, Message, PermissionResult, ResultMessage, StreamEvent, StreamEventType,
    SystemMessage, TextBlock, ThinkingBlock, ToolChoice, ToolMessage, ToolPermissionContext,
    ToolResultBlock, ToolUseBlock, Usage, UserContent, UserMessage,
};

// --- Commonly used items from submodules ---

pub use hooks::{HookEvent, HookMatcher, HookOutput, Hooks, PermissionDecision};
pub use providers::{EventStream, Provider, ProviderConfig, ProviderFeatures, ProviderRegistry};
pub use tools::{ParamType, ToolDefinition, ToolRegistry, tool};

/// Convenience module with the most commonly used types and functions.
///
/// Import with `use universal_agent::prelude::*;`.
pub mod prelude {
    pub use crate::{
        AgentClient, AgentEvent, AgentOptions, AssistantMessage, ContentBlock, Error, HookEvent,
        HookMatcher, HookOutput, Hooks, Message, ParamType, PermissionResult, ProviderConfig,
        Result, ResultMessage, StreamEvent, StreamEventType, ToolChoice, ToolDefinition, query,
        tool,
    };
}
