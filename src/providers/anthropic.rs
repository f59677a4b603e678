//! Anthropic-dialect provider.
//!
//! This dialect models assistant output as a sequence of typed content blocks
//! (text, tool_use, thinking) and streams them one block at a time as
//! `content_block_start` / `*_delta` / `content_block_stop` events. Tool
//! results travel *inside user messages* as `tool_result` blocks, and system
//! content is a top-level request parameter rather than a message.
//!
//! The [`StreamState`] struct is the reassembly state machine: it translates
//! wire events into the canonical [`StreamEvent`](crate::StreamEvent) grammar
//! while accumulating the final [`AssistantMessage`].

use crate::providers::{
    EventStream, Provider, ProviderConfig, ProviderFeatures, error_from_response,
    error_from_transport,
};
use crate::tools::ToolDefinition;
use crate::types::{
    AgentEvent, AgentOptions, AssistantMessage, ContentBlock, FinishReason, Message, ResultMessage,
    StreamEvent, StreamEventType, TextBlock, ThinkingBlock, ToolChoice, ToolUseBlock, Usage,
    UserContent,
};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Provider for Anthropic-style APIs.
pub struct AnthropicProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        let timeout = config
            .get("timeout")
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(600);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(Error::Http)?;
        Ok(Self { config, http })
    }

    fn api_key(&self) -> Result<String> {
        self.config
            .get("api_key")
            .map(|s| s.to_string())
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
            .ok_or_else(|| {
                Error::authentication(
                    "anthropic",
                    "ANTHROPIC_API_KEY environment variable or api_key config required",
                )
            })
    }

    fn base_url(&self) -> String {
        self.config
            .get("base_url")
            .map(|s| s.to_string())
            .or_else(|| std::env::var("ANTHROPIC_BASE_URL").ok())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }

    /// Assemble the request body shared by `complete` and `stream`.
    fn build_request(&self, messages: &[Message], options: &AgentOptions, stream: bool) -> Value {
        let formatted = self.format_messages(messages);
        let mut body = json!({
            "model": options.model().unwrap_or(DEFAULT_MODEL),
            "messages": formatted["messages"],
            "max_tokens": options.max_tokens().unwrap_or(DEFAULT_MAX_TOKENS),
        });

        // Options-level system prompt wins over one hoisted from the history
        if !options.system_prompt().is_empty() {
            body["system"] = json!(options.system_prompt());
        } else if let Some(system) = formatted.get("system").filter(|s| !s.is_null()) {
            body["system"] = system.clone();
        }

        if let Some(temp) = options.temperature() {
            body["temperature"] = json!(temp);
        }
        if let Some(top_p) = options.top_p() {
            body["top_p"] = json!(top_p);
        }

        if !options.tools().is_empty() {
            body["tools"] = self.format_tools(options.tools());
            if let Some(choice) = options.tool_choice() {
                body["tool_choice"] = match choice {
                    ToolChoice::Auto => json!({"type": "auto"}),
                    ToolChoice::Required => json!({"type": "any"}),
                    ToolChoice::None => json!({"type": "none"}),
                    ToolChoice::Tool(name) => json!({"type": "tool", "name": name}),
                };
            }
        }

        if options.enable_thinking() {
            if let Some(budget) = options.max_thinking_tokens() {
                body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
            }
        }

        if stream {
            body["stream"] = json!(true);
        }

        body
    }

    fn format_content_blocks(blocks: &[ContentBlock]) -> Value {
        let formatted: Vec<Value> = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text(text) => json!({"type": "text", "text": text.text}),
                ContentBlock::Image(image) => {
                    if let Some(rest) = image.source.strip_prefix("data:") {
                        // Base64 data URI: send the payload after the comma
                        let data = rest.split_once(',').map(|(_, d)| d).unwrap_or(rest);
                        json!({
                            "type": "image",
                            "source": {
                                "type": "base64",
                                "media_type": image.media_type,
                                "data": data,
                            },
                        })
                    } else {
                        json!({
                            "type": "image",
                            "source": {"type": "url", "url": image.source},
                        })
                    }
                }
                ContentBlock::ToolUse(tool) => json!({
                    "type": "tool_use",
                    "id": tool.id,
                    "name": tool.name,
                    "input": tool.input,
                }),
                ContentBlock::ToolResult(result) => json!({
                    "type": "tool_result",
                    "tool_use_id": result.tool_use_id,
                    "content": result.content,
                    "is_error": result.is_error,
                }),
                ContentBlock::Thinking(thinking) => {
                    let mut block = json!({
                        "type": "thinking",
                        "thinking": thinking.thinking,
                    });
                    // Signature is required for multi-turn continuation
                    if let Some(signature) = &thinking.signature {
                        block["signature"] = json!(signature);
                    }
                    block
                }
            })
            .collect();
        json!(formatted)
    }

    fn map_stop_reason(stop_reason: Option<&str>) -> Option<FinishReason> {
        stop_reason.map(|reason| match reason {
            "end_turn" | "stop_sequence" => FinishReason::Stop,
            "max_tokens" => FinishReason::Length,
            "tool_use" => FinishReason::ToolUse,
            _ => FinishReason::Stop,
        })
    }

    fn parse_usage(usage: &Value) -> Usage {
        let prompt = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: prompt + completion,
            cache_read_tokens: usage["cache_read_input_tokens"].as_u64().map(|n| n as u32),
            cache_creation_tokens: usage["cache_creation_input_tokens"]
                .as_u64()
                .map(|n| n as u32),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn features(&self) -> ProviderFeatures {
        ProviderFeatures {
            streaming: true,
            tool_calling: true,
            vision: true,
            thinking: true,
            json_mode: true,
            max_context_length: 200_000,
            supports_system_message: true,
        }
    }

    fn default_model(&self) -> String {
        DEFAULT_MODEL.to_string()
    }

    /// Returns `{"system": <string|null>, "messages": [...]}` — system
    /// content is hoisted out of the message list, and tool messages are
    /// re-encoded as user messages carrying a `tool_result` block.
    fn format_messages(&self, messages: &[Message]) -> Value {
        let mut system: Option<String> = None;
        let mut formatted: Vec<Value> = Vec::new();

        for message in messages {
            match message {
                Message::System(msg) => {
                    system = Some(msg.content.clone());
                }
                Message::User(msg) => match &msg.content {
                    UserContent::Text(text) => {
                        formatted.push(json!({"role": "user", "content": text}));
                    }
                    UserContent::Blocks(blocks) => {
                        formatted.push(json!({
                            "role": "user",
                            "content": Self::format_content_blocks(blocks),
                        }));
                    }
                },
                Message::Assistant(msg) => {
                    formatted.push(json!({
                        "role": "assistant",
                        "content": Self::format_content_blocks(&msg.content),
                    }));
                }
                Message::Tool(msg) => {
                    formatted.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": msg.tool_call_id,
                            "content": msg.content,
                        }],
                    }));
                }
            }
        }

        json!({"system": system, "messages": formatted})
    }

    fn format_tools(&self, tools: &[Arc<ToolDefinition>]) -> Value {
        let formatted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "input_schema": tool.input_schema(),
                })
            })
            .collect();
        json!(formatted)
    }

    fn parse_response(&self, raw: &Value) -> Result<AssistantMessage> {
        let mut content = Vec::new();
        for block in raw["content"].as_array().into_iter().flatten() {
            match block["type"].as_str() {
                Some("text") => {
                    content.push(ContentBlock::Text(TextBlock::new(
                        block["text"].as_str().unwrap_or_default(),
                    )));
                }
                Some("tool_use") => {
                    content.push(ContentBlock::ToolUse(ToolUseBlock::new(
                        block["id"].as_str().unwrap_or_default(),
                        block["name"].as_str().unwrap_or_default(),
                        block["input"].clone(),
                    )));
                }
                Some("thinking") => {
                    content.push(ContentBlock::Thinking(ThinkingBlock::new(
                        block["thinking"].as_str().unwrap_or_default(),
                        block["signature"].as_str().map(|s| s.to_string()),
                    )));
                }
                _ => {}
            }
        }

        Ok(AssistantMessage {
            content,
            model: raw["model"].as_str().map(|s| s.to_string()),
            finish_reason: Self::map_stop_reason(raw["stop_reason"].as_str()),
        })
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &AgentOptions,
    ) -> Result<AssistantMessage> {
        let body = self.build_request(messages, options, false);
        let url = format!("{}/v1/messages", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key()?)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(error_from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_seconds(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_response("anthropic", status, retry_after, &text));
        }

        let raw: Value = response.json().await.map_err(error_from_transport)?;
        self.parse_response(&raw)
    }

    async fn stream(&self, messages: &[Message], options: &AgentOptions) -> Result<EventStream> {
        let body = self.build_request(messages, options, true);
        let url = format!("{}/v1/messages", self.base_url());

        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.api_key()?)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(error_from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_seconds(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_response("anthropic", status, retry_after, &text));
        }

        let source: SseSource = Box::pin(response.bytes_stream().eventsource());
        let ctx = StreamCtx {
            source,
            state: StreamState::new(),
            queue: VecDeque::new(),
            finished: false,
        };

        let stream = futures::stream::try_unfold(ctx, |mut ctx| async move {
            loop {
                if let Some(event) = ctx.queue.pop_front() {
                    return Ok(Some((event, ctx)));
                }
                if ctx.finished {
                    return Ok(None);
                }

                match ctx.source.next().await {
                    Some(Ok(sse)) => {
                        let data: Value = match serde_json::from_str(&sse.data) {
                            Ok(value) => value,
                            Err(e) => {
                                return Err(Error::stream(format!(
                                    "failed to parse stream event: {}",
                                    e
                                )));
                            }
                        };
                        let events = ctx.state.handle_event(&data);
                        ctx.queue.extend(events);
                    }
                    Some(Err(e)) => {
                        return Err(Error::stream(format!("stream transport error: {}", e)));
                    }
                    None => {
                        ctx.finished = true;
                        let (assistant, result) = ctx.state.take_final();
                        ctx.queue.push_back(AgentEvent::Assistant(assistant));
                        ctx.queue.push_back(AgentEvent::Result(result));
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

type SseSource = Pin<
    Box<
        dyn futures::Stream<
                Item = std::result::Result<
                    eventsource_stream::Event,
                    eventsource_stream::EventStreamError<reqwest::Error>,
                >,
            > + Send,
    >,
>;

struct StreamCtx {
    source: SseSource,
    state: StreamState,
    queue: VecDeque<AgentEvent>,
    finished: bool,
}

fn retry_after_seconds(response: &reqwest::Response) -> Option<f64> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<f64>().ok())
}

/// The block currently being reassembled.
#[derive(Debug)]
enum CurrentBlock {
    None,
    Text(String),
    Tool {
        id: String,
        name: String,
        input_json: String,
    },
    Thinking {
        text: String,
        signature: Option<String>,
    },
}

/// Reassembles block-oriented wire events into canonical events and a final
/// assistant message.
///
/// Blocks arrive strictly one at a time: a `content_block_start` opens a
/// block, deltas accumulate into it, and `content_block_stop` finalizes it.
/// `message_delta` carries the stop reason and refreshed usage.
pub struct StreamState {
    blocks: Vec<ContentBlock>,
    current: CurrentBlock,
    model: Option<String>,
    usage: Option<Usage>,
    stop_reason: Option<String>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            current: CurrentBlock::None,
            model: None,
            usage: None,
            stop_reason: None,
        }
    }

    /// Translate one wire event into zero or more canonical events.
    pub fn handle_event(&mut self, data: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        let index = data["index"].as_u64().map(|i| i as usize);

        match data["type"].as_str() {
            Some("message_start") => {
                let message = &data["message"];
                self.model = message["model"].as_str().map(|s| s.to_string());
                if message["usage"].is_object() {
                    self.usage = Some(AnthropicProvider::parse_usage(&message["usage"]));
                }
            }

            Some("content_block_start") => {
                let block = &data["content_block"];
                let mut delta = json!({"type": block["type"]});
                match block["type"].as_str() {
                    Some("text") => {
                        self.current = CurrentBlock::Text(String::new());
                    }
                    Some("tool_use") => {
                        let id = block["id"].as_str().unwrap_or_default().to_string();
                        let name = block["name"].as_str().unwrap_or_default().to_string();
                        delta["id"] = json!(id);
                        delta["name"] = json!(name);
                        self.current = CurrentBlock::Tool {
                            id,
                            name,
                            input_json: String::new(),
                        };
                    }
                    Some("thinking") => {
                        self.current = CurrentBlock::Thinking {
                            text: String::new(),
                            signature: None,
                        };
                    }
                    _ => {}
                }

                let mut event = StreamEvent::new(StreamEventType::ContentBlockStart)
                    .with_delta(delta);
                if let Some(i) = index {
                    event = event.with_index(i);
                }
                events.push(AgentEvent::Stream(event));
            }

            Some("content_block_delta") => {
                let delta = &data["delta"];
                let canonical = match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if let CurrentBlock::Text(buffer) = &mut self.current {
                            buffer.push_str(text);
                        }
                        Some(json!({"type": "text_delta", "text": text}))
                    }
                    Some("input_json_delta") => {
                        let partial = delta["partial_json"].as_str().unwrap_or_default();
                        if let CurrentBlock::Tool { input_json, .. } = &mut self.current {
                            input_json.push_str(partial);
                        }
                        Some(json!({"type": "input_json_delta", "partial_json": partial}))
                    }
                    Some("thinking_delta") => {
                        let text = delta["thinking"].as_str().unwrap_or_default();
                        if let CurrentBlock::Thinking { text: buffer, .. } = &mut self.current {
                            buffer.push_str(text);
                        }
                        Some(json!({"type": "thinking_delta", "thinking": text}))
                    }
                    Some("signature_delta") => {
                        let signature = delta["signature"].as_str().unwrap_or_default();
                        if let CurrentBlock::Thinking { signature: sig, .. } = &mut self.current {
                            *sig = Some(signature.to_string());
                        }
                        Some(json!({"type": "signature_delta", "signature": signature}))
                    }
                    _ => None,
                };

                if let Some(canonical) = canonical {
                    let mut event = StreamEvent::new(StreamEventType::ContentBlockDelta)
                        .with_delta(canonical);
                    if let Some(i) = index {
                        event = event.with_index(i);
                    }
                    events.push(AgentEvent::Stream(event));
                }
            }

            Some("content_block_stop") => {
                match std::mem::replace(&mut self.current, CurrentBlock::None) {
                    CurrentBlock::Text(text) => {
                        self.blocks.push(ContentBlock::Text(TextBlock::new(text)));
                    }
                    CurrentBlock::Tool {
                        id,
                        name,
                        input_json,
                    } => {
                        // Malformed accumulated JSON degrades to an empty object
                        let input = if input_json.is_empty() {
                            json!({})
                        } else {
                            serde_json::from_str(&input_json).unwrap_or_else(|e| {
                                log::debug!("tool input JSON parse failed: {}", e);
                                json!({})
                            })
                        };
                        self.blocks
                            .push(ContentBlock::ToolUse(ToolUseBlock::new(id, name, input)));
                    }
                    CurrentBlock::Thinking { text, signature } => {
                        self.blocks
                            .push(ContentBlock::Thinking(ThinkingBlock::new(text, signature)));
                    }
                    CurrentBlock::None => {}
                }

                let mut event = StreamEvent::new(StreamEventType::ContentBlockStop);
                if let Some(i) = index {
                    event = event.with_index(i);
                }
                events.push(AgentEvent::Stream(event));
            }

            Some("message_delta") => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_string());
                }
                if data["usage"].is_object() {
                    self.usage = Some(AnthropicProvider::parse_usage(&data["usage"]));
                }
            }

            // message_stop and ping carry nothing we need
            _ => {}
        }

        events
    }

    /// Produce the assembled assistant message and the provider-level result.
    pub fn take_final(&mut self) -> (AssistantMessage, ResultMessage) {
        let finish_reason = AnthropicProvider::map_stop_reason(self.stop_reason.as_deref());
        let assistant = AssistantMessage {
            content: std::mem::take(&mut self.blocks),
            model: self.model.take(),
            finish_reason,
        };
        let result = ResultMessage {
            is_error: false,
            num_turns: 0,
            session_id: None,
            usage: self.usage.take(),
            finish_reason,
            stop_reason: None,
        };
        (assistant, result)
    }
}

impl Default for StreamState {
    fn default() -> Self {
        Self::new()
    }
}
