//! Core type definitions for the Universal Agent SDK.
//!
//! This module contains the data structures shared by every provider and by
//! the agent loop:
//!
//! # Message System
//!
//! - [`Message`]: role-tagged conversation message (system, user, assistant, tool)
//! - [`ContentBlock`]: tagged content fragments (text, image, thinking, tool use,
//!   tool result)
//! - [`UserContent`]: user messages carry either plain text or structured blocks
//!
//! # Streaming
//!
//! - [`StreamEvent`]: the canonical streaming event grammar. Every provider
//!   translates its vendor events into this shape on emission, so consumers
//!   never see dialect-specific event names.
//! - [`AgentEvent`]: the item type of every event stream — stream events,
//!   the assembled assistant message, and the terminal [`ResultMessage`].
//!
//! # Configuration
//!
//! - [`AgentOptions`] / [`AgentOptionsBuilder`]: everything the agent loop and
//!   providers need for one conversation, built with validation.
//!
//! # Example
//!
//! ```no_run
//! use universal_agent::{AgentOptions, Message};
//!
//! let options = AgentOptions::builder()
//!     .provider("anthropic")
//!     .model("claude-sonnet-4-20250514")
//!     .system_prompt("You are a helpful assistant")
//!     .max_turns(5)
//!     .build()
//!     .expect("valid configuration");
//!
//! let msg = Message::user("Hello!");
//! ```

use crate::Error;
use crate::hooks::Hooks;
use crate::providers::ProviderConfig;
use crate::tools::ToolDefinition;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

// ============================================================================
// CONTENT BLOCKS
// ============================================================================

/// Simple text content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    /// The text content.
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Image content for vision-capable models.
///
/// `source` is either an HTTP(S) URL or a `data:<mime>;base64,<payload>` URI.
/// Providers split the data URI themselves when their wire format wants the
/// raw base64 payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    /// Image URL or data URI.
    pub source: String,
    /// MIME type, e.g. "image/png".
    pub media_type: String,
}

impl ImageBlock {
    pub fn new(source: impl Into<String>, media_type: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            media_type: media_type.into(),
        }
    }
}

/// Extended reasoning emitted by thinking-capable models.
///
/// The `signature` is opaque provider state. It must be sent back verbatim on
/// the next turn or the provider rejects the thinking block, so it is carried
/// here rather than discarded at parse time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    /// The reasoning text.
    pub thinking: String,
    /// Provider signature required for multi-turn continuation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ThinkingBlock {
    pub fn new(thinking: impl Into<String>, signature: Option<String>) -> Self {
        Self {
            thinking: thinking.into(),
            signature,
        }
    }
}

/// A request from the model to execute a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    /// Provider-assigned identifier, used to correlate the result.
    pub id: String,
    /// Name of the tool to execute.
    pub name: String,
    /// JSON arguments matching the tool's input schema.
    pub input: serde_json::Value,
}

impl ToolUseBlock {
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The result of a tool execution, addressed back to its request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    /// Matches the `id` of the originating [`ToolUseBlock`].
    pub tool_use_id: String,
    /// Stringified tool output.
    pub content: String,
    /// True when the content describes a failure.
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResultBlock {
    pub fn new(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tagged content fragments that make up a message.
///
/// Serializes with a `"type"` discriminator:
/// ```json
/// {"type": "text", "text": "Hello"}
/// {"type": "tool_use", "id": "t1", "name": "search", "input": {}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    Image(ImageBlock),
    Thinking(ThinkingBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

impl ContentBlock {
    /// Convenience constructor for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextBlock::new(text))
    }

    /// Returns the inner tool-use block, if this is one.
    pub fn as_tool_use(&self) -> Option<&ToolUseBlock> {
        match self {
            ContentBlock::ToolUse(block) => Some(block),
            _ => None,
        }
    }

    /// Returns the inner text, if this is a text block.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text(block) => Some(&block.text),
            _ => None,
        }
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// User message content: plain text for the common case, blocks for
/// multi-modal input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// A user turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub content: UserContent,
}

/// An assistant turn: an ordered sequence of typed content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

impl AssistantMessage {
    pub fn new(content: Vec<ContentBlock>) -> Self {
        Self {
            content,
            model: None,
            finish_reason: None,
        }
    }

    /// All tool-use blocks, in declaration order.
    pub fn tool_uses(&self) -> Vec<&ToolUseBlock> {
        self.content.iter().filter_map(|b| b.as_tool_use()).collect()
    }

    /// Concatenated text across all text blocks.
    pub fn text(&self) -> String {
        self.content.iter().filter_map(|b| b.as_text()).collect()
    }
}

/// A system instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub content: String,
}

/// A tool result addressed to a prior tool call.
///
/// This is the engine's internal representation; the Anthropic dialect
/// re-encodes it as a user message carrying a `tool_result` block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMessage {
    pub content: String,
    pub tool_call_id: String,
}

/// A conversation message, tagged by role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    System(SystemMessage),
    Tool(ToolMessage),
}

impl Message {
    /// User message with plain text content.
    pub fn user(text: impl Into<String>) -> Self {
        Message::User(UserMessage {
            content: UserContent::Text(text.into()),
        })
    }

    /// User message with structured content blocks.
    pub fn user_with_blocks(blocks: Vec<ContentBlock>) -> Self {
        Message::User(UserMessage {
            content: UserContent::Blocks(blocks),
        })
    }

    /// Assistant message from content blocks.
    pub fn assistant(blocks: Vec<ContentBlock>) -> Self {
        Message::Assistant(AssistantMessage::new(blocks))
    }

    /// System message.
    pub fn system(text: impl Into<String>) -> Self {
        Message::System(SystemMessage {
            content: text.into(),
        })
    }

    /// Tool result message.
    pub fn tool(content: impl Into<String>, tool_call_id: impl Into<String>) -> Self {
        Message::Tool(ToolMessage {
            content: content.into(),
            tool_call_id: tool_call_id.into(),
        })
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Message::System(_))
    }
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Message::user(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Message::user(text)
    }
}

// ============================================================================
// STREAMING
// ============================================================================

/// Canonical stream event names.
///
/// `content_block_*` events are translated from provider streams;
/// `tool_execution_*` events are synthesized by the agent loop around tool
/// handler invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    ContentBlockStart,
    ContentBlockDelta,
    ContentBlockStop,
    ToolExecutionStart,
    ToolExecutionComplete,
}

/// One canonical streaming event.
///
/// The `delta` payload shape depends on `event_type`; see the event grammar in
/// the crate documentation. `index` identifies the content block the event
/// belongs to within the current assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event_type: StreamEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_block: Option<ContentBlock>,
}

impl StreamEvent {
    pub fn new(event_type: StreamEventType) -> Self {
        Self {
            event_type,
            index: None,
            delta: None,
            content_block: None,
        }
    }

    pub fn with_index(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_delta(mut self, delta: serde_json::Value) -> Self {
        self.delta = Some(delta);
        self
    }
}

/// Why the model stopped generating, normalized across dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolUse,
    ContentFilter,
}

/// Token accounting for one provider call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_creation_tokens: Option<u32>,
}

/// Terminal element of every event stream.
///
/// Exactly one ResultMessage closes each `receive()` sequence, and it carries
/// no further content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub is_error: bool,
    pub num_turns: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// Everything a provider or agent stream can yield.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    Stream(StreamEvent),
    Assistant(AssistantMessage),
    Result(ResultMessage),
}

impl AgentEvent {
    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            AgentEvent::Assistant(msg) => Some(msg),
            _ => None,
        }
    }

    pub fn as_stream(&self) -> Option<&StreamEvent> {
        match self {
            AgentEvent::Stream(event) => Some(event),
            _ => None,
        }
    }

    pub fn is_result(&self) -> bool {
        matches!(self, AgentEvent::Result(_))
    }
}

// ============================================================================
// PERMISSIONS
// ============================================================================

/// Context handed to the permission callback.
#[derive(Debug, Clone)]
pub struct ToolPermissionContext {
    pub session_id: String,
    pub tool_use_id: Option<String>,
}

/// Verdict from the per-call permission callback.
#[derive(Debug, Clone)]
pub enum PermissionResult {
    /// Allow execution, optionally replacing the tool input.
    Allow { updated_input: Option<serde_json::Value> },
    /// Deny execution with an explanation the model will see.
    Deny { message: String },
}

impl PermissionResult {
    pub fn allow() -> Self {
        PermissionResult::Allow {
            updated_input: None,
        }
    }

    pub fn allow_with_input(input: serde_json::Value) -> Self {
        PermissionResult::Allow {
            updated_input: Some(input),
        }
    }

    pub fn deny(message: impl Into<String>) -> Self {
        PermissionResult::Deny {
            message: message.into(),
        }
    }
}

/// Async permission callback: `(tool_name, tool_input, context)` -> verdict.
pub type PermissionCallback = Arc<
    dyn Fn(
            String,
            serde_json::Value,
            ToolPermissionContext,
        ) -> Pin<Box<dyn Future<Output = PermissionResult> + Send>>
        + Send
        + Sync,
>;

// ============================================================================
// TOOL CHOICE
// ============================================================================

/// How strongly the model is steered toward tool use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    /// Model decides freely.
    Auto,
    /// Model must call some tool.
    Required,
    /// Model must not call tools.
    None,
    /// Model must call this specific tool.
    Tool(String),
}

// ============================================================================
// AGENT OPTIONS
// ============================================================================

/// Configuration for one agent conversation.
///
/// Construct with [`AgentOptions::builder()`]. Credentials are *not* carried
/// here — they live in [`ProviderConfig`] / the config layer — so options are
/// safe to log.
#[derive(Clone)]
pub struct AgentOptions {
    provider: String,
    provider_config: Option<ProviderConfig>,
    model: Option<String>,
    system_prompt: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    tools: Vec<Arc<ToolDefinition>>,
    tool_choice: Option<ToolChoice>,
    can_use_tool: Option<PermissionCallback>,
    hooks: Hooks,
    max_turns: u32,
    stream: bool,
    enable_thinking: bool,
    max_thinking_tokens: Option<u32>,
    session_id: Option<String>,
}

impl std::fmt::Debug for AgentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentOptions")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            // Arc'd handlers don't debug usefully, show a count instead
            .field("tools", &format!("{} tools", self.tools.len()))
            .field("tool_choice", &self.tool_choice)
            .field("can_use_tool", &self.can_use_tool.is_some())
            .field("hooks", &self.hooks)
            .field("max_turns", &self.max_turns)
            .field("stream", &self.stream)
            .field("enable_thinking", &self.enable_thinking)
            .field("max_thinking_tokens", &self.max_thinking_tokens)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            provider_config: None,
            model: None,
            system_prompt: String::new(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            tools: Vec::new(),
            tool_choice: None,
            can_use_tool: None,
            hooks: Hooks::new(),
            max_turns: 10,
            stream: true,
            enable_thinking: false,
            max_thinking_tokens: None,
            session_id: None,
        }
    }
}

impl AgentOptions {
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::default()
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn provider_config(&self) -> Option<&ProviderConfig> {
        self.provider_config.as_ref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn max_tokens(&self) -> Option<u32> {
        self.max_tokens
    }

    pub fn temperature(&self) -> Option<f32> {
        self.temperature
    }

    pub fn top_p(&self) -> Option<f32> {
        self.top_p
    }

    pub fn tools(&self) -> &[Arc<ToolDefinition>] {
        &self.tools
    }

    pub fn tool_choice(&self) -> Option<&ToolChoice> {
        self.tool_choice.as_ref()
    }

    pub fn can_use_tool(&self) -> Option<&PermissionCallback> {
        self.can_use_tool.as_ref()
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn stream(&self) -> bool {
        self.stream
    }

    pub fn enable_thinking(&self) -> bool {
        self.enable_thinking
    }

    pub fn max_thinking_tokens(&self) -> Option<u32> {
        self.max_thinking_tokens
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) fn set_provider(&mut self, provider: impl Into<String>) {
        self.provider = provider.into();
    }

    pub(crate) fn set_provider_config(&mut self, config: Option<ProviderConfig>) {
        self.provider_config = config;
    }

    pub(crate) fn set_model(&mut self, model: impl Into<String>) {
        self.model = Some(model.into());
    }
}

/// Builder for [`AgentOptions`] with validation.
#[derive(Default)]
pub struct AgentOptionsBuilder {
    provider: Option<String>,
    provider_config: Option<ProviderConfig>,
    model: Option<String>,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    tools: Vec<Arc<ToolDefinition>>,
    tool_choice: Option<ToolChoice>,
    can_use_tool: Option<PermissionCallback>,
    hooks: Hooks,
    max_turns: Option<u32>,
    stream: Option<bool>,
    enable_thinking: Option<bool>,
    max_thinking_tokens: Option<u32>,
    session_id: Option<String>,
}

impl AgentOptionsBuilder {
    /// Select a registered provider by name ("anthropic", "openai",
    /// "azure_openai", or a custom registration).
    pub fn provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Credentials/endpoint overrides; omitted keys resolve through the
    /// config layer.
    pub fn provider_config(mut self, config: ProviderConfig) -> Self {
        self.provider_config = Some(config);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.temperature = Some(temp);
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Add a single tool.
    pub fn tool(mut self, tool: ToolDefinition) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    /// Add multiple tools at once.
    pub fn tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools.extend(tools.into_iter().map(Arc::new));
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }

    /// Per-call permission callback, consulted for every tool invocation that
    /// no hook has already decided.
    pub fn can_use_tool<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(String, serde_json::Value, ToolPermissionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PermissionResult> + Send + 'static,
    {
        self.can_use_tool = Some(Arc::new(move |name, input, ctx| {
            Box::pin(callback(name, input, ctx))
        }));
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Upper bound on agentic iterations (default 10).
    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    /// Emit StreamEvents (default true). When false, only the final
    /// AssistantMessage and ResultMessage are delivered per turn.
    pub fn stream(mut self, stream: bool) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Enable reasoning blocks (Anthropic dialect only).
    pub fn enable_thinking(mut self, enable: bool) -> Self {
        self.enable_thinking = Some(enable);
        self
    }

    pub fn max_thinking_tokens(mut self, tokens: u32) -> Self {
        self.max_thinking_tokens = Some(tokens);
        self
    }

    /// Correlation id for hook context; generated when absent.
    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn build(self) -> crate::Result<AgentOptions> {
        if let Some(temp) = self.temperature {
            if !(0.0..=2.0).contains(&temp) {
                return Err(Error::invalid_input(
                    "temperature must be between 0.0 and 2.0",
                ));
            }
        }

        if let Some(tokens) = self.max_tokens {
            if tokens == 0 {
                return Err(Error::invalid_input("max_tokens must be greater than 0"));
            }
        }

        let max_turns = self.max_turns.unwrap_or(10);
        if max_turns == 0 {
            return Err(Error::invalid_input("max_turns must be greater than 0"));
        }

        // Tool names must be unique within one option set
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if !seen.insert(tool.name().to_string()) {
                return Err(Error::invalid_input(format!(
                    "duplicate tool name: {}",
                    tool.name()
                )));
            }
        }

        Ok(AgentOptions {
            provider: self.provider.unwrap_or_else(|| "anthropic".to_string()),
            provider_config: self.provider_config,
            model: self.model,
            system_prompt: self.system_prompt.unwrap_or_default(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
            tools: self.tools,
            tool_choice: self.tool_choice,
            can_use_tool: self.can_use_tool,
            hooks: self.hooks,
            max_turns,
            stream: self.stream.unwrap_or(true),
            enable_thinking: self.enable_thinking.unwrap_or(false),
            max_thinking_tokens: self.max_thinking_tokens,
            session_id: self.session_id,
        })
    }
}
