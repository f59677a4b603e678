//! OpenAI-dialect provider, including the Azure variant.
//!
//! This dialect carries assistant text as one flat `content` string with a
//! parallel `tool_calls` array, streams incremental delta chunks, and ships
//! tool arguments as a JSON *string* rather than an object. Tool results are
//! first-class `role: "tool"` messages.
//!
//! The [`StreamAccumulator`] translates delta chunks into the canonical event
//! grammar. Tool-call ids can arrive late and fragmented, so a tool block is
//! announced only once both its id and name are complete; argument fragments
//! that arrived earlier are flushed at that point. A synthetic id is never
//! emitted.
//!
//! The Azure variant shares the full wire behavior and differs only in
//! endpoint construction (`{endpoint}/openai/deployments/{deployment}/...`),
//! authentication header, and the use of a deployment name in place of a
//! model name.

use crate::providers::{
    EventStream, Provider, ProviderConfig, ProviderFeatures, error_from_response,
    error_from_transport,
};
use crate::tools::ToolDefinition;
use crate::types::{
    AgentEvent, AgentOptions, AssistantMessage, ContentBlock, FinishReason, Message, ResultMessage,
    StreamEvent, StreamEventType, TextBlock, ToolChoice, ToolUseBlock, Usage, UserContent,
};
use crate::{Error, Result};
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o";
const DEFAULT_AZURE_API_VERSION: &str = "2024-02-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    OpenAi,
    Azure,
}

/// Provider for OpenAI-style APIs (and Azure OpenAI deployments).
pub struct OpenAiProvider {
    config: ProviderConfig,
    http: reqwest::Client,
    variant: Variant,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Self::build(config, Variant::OpenAi)
    }

    pub fn new_azure(config: ProviderConfig) -> Result<Self> {
        Self::build(config, Variant::Azure)
    }

    fn build(config: ProviderConfig, variant: Variant) -> Result<Self> {
        let timeout = config
            .get("timeout")
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(600);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(Error::Http)?;
        Ok(Self {
            config,
            http,
            variant,
        })
    }

    fn api_key(&self) -> Result<String> {
        let (config_key, env_var) = match self.variant {
            Variant::OpenAi => ("api_key", "OPENAI_API_KEY"),
            Variant::Azure => ("api_key", "AZURE_OPENAI_API_KEY"),
        };
        self.config
            .get(config_key)
            .map(|s| s.to_string())
            .or_else(|| std::env::var(env_var).ok())
            .ok_or_else(|| {
                Error::authentication(
                    self.name(),
                    format!("{} environment variable or api_key config required", env_var),
                )
            })
    }

    /// Resolve the chat-completions URL for this variant.
    fn endpoint_url(&self, model: &str) -> Result<String> {
        match self.variant {
            Variant::OpenAi => {
                let base = self
                    .config
                    .get("base_url")
                    .map(|s| s.to_string())
                    .or_else(|| std::env::var("OPENAI_BASE_URL").ok())
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
                Ok(format!("{}/chat/completions", base.trim_end_matches('/')))
            }
            Variant::Azure => {
                let endpoint = self
                    .config
                    .get("azure_endpoint")
                    .map(|s| s.to_string())
                    .or_else(|| std::env::var("AZURE_OPENAI_ENDPOINT").ok())
                    .ok_or_else(|| {
                        Error::authentication(
                            "azure_openai",
                            "AZURE_OPENAI_ENDPOINT environment variable or azure_endpoint config required",
                        )
                    })?;
                let api_version = self
                    .config
                    .get("api_version")
                    .map(|s| s.to_string())
                    .or_else(|| std::env::var("AZURE_OPENAI_API_VERSION").ok())
                    .unwrap_or_else(|| DEFAULT_AZURE_API_VERSION.to_string());
                Ok(format!(
                    "{}/openai/deployments/{}/chat/completions?api-version={}",
                    endpoint.trim_end_matches('/'),
                    model,
                    api_version
                ))
            }
        }
    }

    /// Azure addresses a deployment, not a model.
    fn resolve_model(&self, options: &AgentOptions) -> String {
        if let Some(model) = options.model() {
            return model.to_string();
        }
        match self.variant {
            Variant::OpenAi => DEFAULT_MODEL.to_string(),
            Variant::Azure => self
                .config
                .get("deployment_name")
                .map(|s| s.to_string())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    fn apply_auth(&self, request: reqwest::RequestBuilder, key: &str) -> reqwest::RequestBuilder {
        match self.variant {
            Variant::OpenAi => {
                let mut request = request.header("Authorization", format!("Bearer {}", key));
                if let Some(org) = self.config.get("organization") {
                    request = request.header("OpenAI-Organization", org);
                }
                request
            }
            Variant::Azure => request.header("api-key", key),
        }
    }

    fn build_request(&self, messages: &[Message], options: &AgentOptions, stream: bool) -> Value {
        let formatted = self.format_messages(messages);
        let mut body = json!({
            "model": self.resolve_model(options),
            "messages": formatted["messages"],
        });

        if let Some(max_tokens) = options.max_tokens() {
            body["max_tokens"] = json!(max_tokens);
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
                    ToolChoice::Auto => json!("auto"),
                    ToolChoice::Required => json!("required"),
                    ToolChoice::None => json!("none"),
                    ToolChoice::Tool(name) => {
                        json!({"type": "function", "function": {"name": name}})
                    }
                };
            }
        }

        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }

        body
    }

    fn format_user_blocks(blocks: &[ContentBlock]) -> Value {
        let parts: Vec<Value> = blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text(text) => {
                    Some(json!({"type": "text", "text": text.text}))
                }
                ContentBlock::Image(image) => Some(json!({
                    "type": "image_url",
                    "image_url": {"url": image.source},
                })),
                _ => None,
            })
            .collect();
        json!(parts)
    }

    fn format_assistant(message: &AssistantMessage) -> Value {
        let mut text = String::new();
        let mut tool_calls: Vec<Value> = Vec::new();

        for block in &message.content {
            match block {
                ContentBlock::Text(t) => text.push_str(&t.text),
                ContentBlock::ToolUse(tool) => {
                    tool_calls.push(json!({
                        "id": tool.id,
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            // Arguments ride as a JSON string on this dialect
                            "arguments": tool.input.to_string(),
                        },
                    }));
                }
                // Thinking has no wire representation on this dialect
                _ => {}
            }
        }

        let mut result = json!({"role": "assistant"});
        if !text.is_empty() {
            result["content"] = json!(text);
        }
        if !tool_calls.is_empty() {
            result["tool_calls"] = json!(tool_calls);
        }
        result
    }

    fn map_finish_reason(finish_reason: Option<&str>) -> Option<FinishReason> {
        finish_reason.map(|reason| match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" => FinishReason::ToolUse,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        })
    }

    fn parse_usage(usage: &Value) -> Usage {
        Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
            cache_read_tokens: None,
            cache_creation_tokens: None,
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        match self.variant {
            Variant::OpenAi => "openai",
            Variant::Azure => "azure_openai",
        }
    }

    fn features(&self) -> ProviderFeatures {
        ProviderFeatures {
            streaming: true,
            tool_calling: true,
            vision: true,
            // No explicit thinking blocks on this dialect
            thinking: false,
            json_mode: true,
            max_context_length: 128_000,
            supports_system_message: true,
        }
    }

    fn default_model(&self) -> String {
        self.resolve_model(&AgentOptions::default())
    }

    /// Returns `{"messages": [...]}` with system, user, assistant, and tool
    /// as first-class roles.
    fn format_messages(&self, messages: &[Message]) -> Value {
        let mut formatted: Vec<Value> = Vec::new();

        for message in messages {
            match message {
                Message::System(msg) => {
                    formatted.push(json!({"role": "system", "content": msg.content}));
                }
                Message::User(msg) => match &msg.content {
                    UserContent::Text(text) => {
                        formatted.push(json!({"role": "user", "content": text}));
                    }
                    UserContent::Blocks(blocks) => {
                        formatted.push(json!({
                            "role": "user",
                            "content": Self::format_user_blocks(blocks),
                        }));
                    }
                },
                Message::Assistant(msg) => {
                    formatted.push(Self::format_assistant(msg));
                }
                Message::Tool(msg) => {
                    formatted.push(json!({
                        "role": "tool",
                        "content": msg.content,
                        "tool_call_id": msg.tool_call_id,
                    }));
                }
            }
        }

        json!({"messages": formatted})
    }

    fn format_tools(&self, tools: &[Arc<ToolDefinition>]) -> Value {
        let formatted: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name(),
                        "description": tool.description(),
                        "parameters": tool.input_schema(),
                    },
                })
            })
            .collect();
        json!(formatted)
    }

    fn parse_response(&self, raw: &Value) -> Result<AssistantMessage> {
        let choice = &raw["choices"][0];
        let message = &choice["message"];
        let mut content = Vec::new();

        if let Some(text) = message["content"].as_str() {
            if !text.is_empty() {
                content.push(ContentBlock::Text(TextBlock::new(text)));
            }
        }

        for call in message["tool_calls"].as_array().into_iter().flatten() {
            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
            let input = serde_json::from_str(arguments).unwrap_or_else(|e| {
                log::debug!("tool arguments parse failed: {}", e);
                json!({})
            });
            content.push(ContentBlock::ToolUse(ToolUseBlock::new(
                call["id"].as_str().unwrap_or_default(),
                call["function"]["name"].as_str().unwrap_or_default(),
                input,
            )));
        }

        Ok(AssistantMessage {
            content,
            model: raw["model"].as_str().map(|s| s.to_string()),
            finish_reason: Self::map_finish_reason(choice["finish_reason"].as_str()),
        })
    }

    async fn complete(
        &self,
        messages: &[Message],
        options: &AgentOptions,
    ) -> Result<AssistantMessage> {
        let model = self.resolve_model(options);
        let body = self.build_request(messages, options, false);
        let url = self.endpoint_url(&model)?;

        let request = self.http.post(&url).json(&body);
        let response = self
            .apply_auth(request, &self.api_key()?)
            .send()
            .await
            .map_err(error_from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_seconds(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_response(self.name(), status, retry_after, &text));
        }

        let raw: Value = response.json().await.map_err(error_from_transport)?;
        self.parse_response(&raw)
    }

    async fn stream(&self, messages: &[Message], options: &AgentOptions) -> Result<EventStream> {
        let model = self.resolve_model(options);
        let body = self.build_request(messages, options, true);
        let url = self.endpoint_url(&model)?;

        let request = self.http.post(&url).json(&body);
        let response = self
            .apply_auth(request, &self.api_key()?)
            .send()
            .await
            .map_err(error_from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let retry_after = retry_after_seconds(&response);
            let text = response.text().await.unwrap_or_default();
            return Err(error_from_response(self.name(), status, retry_after, &text));
        }

        let source: SseSource = Box::pin(response.bytes_stream().eventsource());
        let ctx = StreamCtx {
            source,
            state: StreamAccumulator::new(),
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
                        // The dialect closes its stream with a non-JSON sentinel
                        if sse.data.trim() == "[DONE]" {
                            continue;
                        }
                        let chunk: Value = match serde_json::from_str(&sse.data) {
                            Ok(value) => value,
                            Err(e) => {
                                return Err(Error::stream(format!(
                                    "failed to parse chunk: {}",
                                    e
                                )));
                            }
                        };
                        let events = ctx.state.handle_chunk(&chunk);
                        ctx.queue.extend(events);
                    }
                    Some(Err(e)) => {
                        return Err(Error::stream(format!("stream transport error: {}", e)));
                    }
                    None => {
                        ctx.finished = true;
                        let (closing, assistant, result) = ctx.state.finish();
                        ctx.queue.extend(closing);
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
    state: StreamAccumulator,
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

/// A tool call being assembled from interleaved deltas.
#[derive(Debug, Default)]
struct PartialToolCall {
    id: String,
    name: String,
    /// Complete accumulated argument string.
    arguments: String,
    /// How much of `arguments` has already been emitted as deltas.
    flushed: usize,
    /// Canonical block index, assigned when the block is announced.
    block_index: Option<usize>,
}

impl PartialToolCall {
    fn is_announceable(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty()
    }
}

/// Translates delta chunks into the canonical event grammar while
/// accumulating the final assistant message.
///
/// Chunks carry `choices[0].delta` with either text `content` or
/// `tool_calls[i]` entries keyed by `index`; the trailing chunk has no
/// choices and carries usage.
pub struct StreamAccumulator {
    text: String,
    text_index: Option<usize>,
    text_closed: bool,
    tool_calls: BTreeMap<u64, PartialToolCall>,
    next_block_index: usize,
    model: Option<String>,
    usage: Option<Usage>,
    finish_reason: Option<String>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self {
            text: String::new(),
            text_index: None,
            text_closed: false,
            tool_calls: BTreeMap::new(),
            next_block_index: 0,
            model: None,
            usage: None,
            finish_reason: None,
        }
    }

    /// Translate one chunk into zero or more canonical events.
    pub fn handle_chunk(&mut self, chunk: &Value) -> Vec<AgentEvent> {
        let mut events = Vec::new();

        let choices = chunk["choices"].as_array();
        if choices.is_none_or(|c| c.is_empty()) {
            // Closing chunk: no choices, usage only
            if chunk["usage"].is_object() {
                self.usage = Some(OpenAiProvider::parse_usage(&chunk["usage"]));
            }
            return events;
        }

        if let Some(model) = chunk["model"].as_str() {
            if !model.is_empty() {
                self.model = Some(model.to_string());
            }
        }

        let choice = &chunk["choices"][0];
        let delta = &choice["delta"];

        if let Some(text) = delta["content"].as_str().filter(|t| !t.is_empty()) {
            if self.text_index.is_none() {
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.text_index = Some(index);
                events.push(AgentEvent::Stream(
                    StreamEvent::new(StreamEventType::ContentBlockStart)
                        .with_index(index)
                        .with_delta(json!({"type": "text"})),
                ));
            }
            self.text.push_str(text);
            events.push(AgentEvent::Stream(
                StreamEvent::new(StreamEventType::ContentBlockDelta)
                    .with_index(self.text_index.unwrap())
                    .with_delta(json!({"type": "text_delta", "text": text})),
            ));
        }

        for call in delta["tool_calls"].as_array().into_iter().flatten() {
            let Some(index) = call["index"].as_u64() else {
                continue;
            };
            let entry = self.tool_calls.entry(index).or_default();

            if let Some(id) = call["id"].as_str() {
                if !id.is_empty() {
                    entry.id = id.to_string();
                }
            }
            if let Some(name) = call["function"]["name"].as_str() {
                if !name.is_empty() {
                    entry.name = name.to_string();
                }
            }
            if let Some(fragment) = call["function"]["arguments"].as_str() {
                entry.arguments.push_str(fragment);
            }

            // Announce the block only once id and name are both complete.
            // Anything accumulated before that moment flushes now.
            if entry.block_index.is_none() && entry.is_announceable() {
                // The first tool block ends any open text block
                if let Some(text_index) = self.text_index {
                    if !self.text_closed {
                        self.text_closed = true;
                        events.push(AgentEvent::Stream(
                            StreamEvent::new(StreamEventType::ContentBlockStop)
                                .with_index(text_index),
                        ));
                    }
                }

                let block_index = self.next_block_index;
                self.next_block_index += 1;
                entry.block_index = Some(block_index);
                events.push(AgentEvent::Stream(
                    StreamEvent::new(StreamEventType::ContentBlockStart)
                        .with_index(block_index)
                        .with_delta(json!({
                            "type": "tool_use",
                            "id": entry.id,
                            "name": entry.name,
                        })),
                ));
            }

            if let Some(block_index) = entry.block_index {
                if entry.flushed < entry.arguments.len() {
                    let fragment = entry.arguments[entry.flushed..].to_string();
                    entry.flushed = entry.arguments.len();
                    events.push(AgentEvent::Stream(
                        StreamEvent::new(StreamEventType::ContentBlockDelta)
                            .with_index(block_index)
                            .with_delta(json!({
                                "type": "input_json_delta",
                                "partial_json": fragment,
                            })),
                    ));
                }
            }
        }

        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_string());
        }

        events
    }

    /// Close any open blocks and build the final messages.
    pub fn finish(&mut self) -> (Vec<AgentEvent>, AssistantMessage, ResultMessage) {
        let mut closing = Vec::new();

        if let Some(text_index) = self.text_index {
            if !self.text_closed {
                self.text_closed = true;
                closing.push(AgentEvent::Stream(
                    StreamEvent::new(StreamEventType::ContentBlockStop).with_index(text_index),
                ));
            }
        }

        let mut content = Vec::new();
        if !self.text.is_empty() {
            content.push(ContentBlock::Text(TextBlock::new(std::mem::take(
                &mut self.text,
            ))));
        }

        for (_, entry) in std::mem::take(&mut self.tool_calls) {
            // Incomplete tool calls (missing id or name) are dropped
            let Some(block_index) = entry.block_index else {
                continue;
            };
            closing.push(AgentEvent::Stream(
                StreamEvent::new(StreamEventType::ContentBlockStop).with_index(block_index),
            ));

            let input = if entry.arguments.is_empty() {
                json!({})
            } else {
                serde_json::from_str(&entry.arguments).unwrap_or_else(|e| {
                    log::debug!("tool arguments parse failed: {}", e);
                    json!({})
                })
            };
            content.push(ContentBlock::ToolUse(ToolUseBlock::new(
                entry.id, entry.name, input,
            )));
        }

        let finish_reason = OpenAiProvider::map_finish_reason(self.finish_reason.as_deref());
        let assistant = AssistantMessage {
            content,
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
        (closing, assistant, result)
    }
}

impl Default for StreamAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new(ProviderConfig::new().set("api_key", "test")).unwrap()
    }

    fn azure_provider() -> OpenAiProvider {
        OpenAiProvider::new_azure(
            ProviderConfig::new()
                .set("api_key", "test")
                .set("azure_endpoint", "https://example.openai.azure.com")
                .set("deployment_name", "gpt-4o-prod"),
        )
        .unwrap()
    }

    #[test]
    fn test_format_messages_first_class_roles() {
        let p = provider();
        let messages = vec![
            Message::system("Be terse."),
            Message::user("hi"),
            Message::tool("42", "call_1"),
        ];
        let formatted = p.format_messages(&messages);
        let list = formatted["messages"].as_array().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0]["role"], "system");
        assert_eq!(list[1]["role"], "user");
        assert_eq!(list[2]["role"], "tool");
        assert_eq!(list[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_format_assistant_with_tool_calls() {
        let p = provider();
        let message = Message::assistant(vec![
            ContentBlock::text("Checking."),
            ContentBlock::ToolUse(ToolUseBlock::new("call_1", "add", json!({"a": 2, "b": 3}))),
        ]);
        let formatted = p.format_messages(&[message]);
        let assistant = &formatted["messages"][0];
        assert_eq!(assistant["content"], "Checking.");
        let call = &assistant["tool_calls"][0];
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "add");
        // Arguments are a JSON string on the wire
        let arguments: Value =
            serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(arguments, json!({"a": 2, "b": 3}));
    }

    #[test]
    fn test_format_tools_function_shape() {
        let p = provider();
        let tool = Arc::new(
            crate::tools::tool("search", "Search the web")
                .param("query", crate::tools::ParamType::String)
                .build(),
        );
        let formatted = p.format_tools(&[tool]);
        assert_eq!(formatted[0]["type"], "function");
        assert_eq!(formatted[0]["function"]["name"], "search");
        assert_eq!(
            formatted[0]["function"]["parameters"]["properties"]["query"]["type"],
            "string"
        );
    }

    #[test]
    fn test_parse_response() {
        let p = provider();
        let raw = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": "Sure.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "add", "arguments": "{\"a\": 1}"},
                    }],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let parsed = p.parse_response(&raw).unwrap();
        assert_eq!(parsed.text(), "Sure.");
        assert_eq!(parsed.tool_uses()[0].input, json!({"a": 1}));
        assert_eq!(parsed.finish_reason, Some(FinishReason::ToolUse));
    }

    #[test]
    fn test_azure_endpoint_and_deployment() {
        let p = azure_provider();
        let url = p.endpoint_url("gpt-4o-prod").unwrap();
        assert_eq!(
            url,
            "https://example.openai.azure.com/openai/deployments/gpt-4o-prod/chat/completions?api-version=2024-02-01"
        );
        assert_eq!(p.resolve_model(&AgentOptions::default()), "gpt-4o-prod");
        assert_eq!(p.name(), "azure_openai");
    }

    #[test]
    fn test_accumulator_text_only() {
        let mut state = StreamAccumulator::new();
        let mut events = Vec::new();

        events.extend(state.handle_chunk(&json!({
            "model": "gpt-4o",
            "choices": [{"delta": {"content": "Hello "}, "finish_reason": null}],
        })));
        events.extend(state.handle_chunk(&json!({
            "choices": [{"delta": {"content": "world"}, "finish_reason": "stop"}],
        })));
        state.handle_chunk(&json!({
            "choices": [],
            "usage": {"prompt_tokens": 7, "completion_tokens": 2, "total_tokens": 9},
        }));

        // start + two deltas
        assert_eq!(events.len(), 3);
        let (closing, assistant, result) = state.finish();
        assert_eq!(closing.len(), 1);
        assert_eq!(assistant.text(), "Hello world");
        assert_eq!(assistant.finish_reason, Some(FinishReason::Stop));
        assert_eq!(result.usage.as_ref().unwrap().total_tokens, 9);
    }

    #[test]
    fn test_accumulator_late_tool_id() {
        // id arrives in the second chunk; no block may be announced before it
        let mut state = StreamAccumulator::new();

        let first = state.handle_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "function": {"name": "search", "arguments": "{\"q\":"},
            }]}, "finish_reason": null}],
        }));
        assert!(first.is_empty());

        let second = state.handle_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0,
                "id": "call_9",
                "function": {"arguments": "\"rust\"}"},
            }]}, "finish_reason": null}],
        }));

        // start carries the real id; the buffered fragment flushes with the rest
        let start = second[0].as_stream().unwrap();
        assert_eq!(start.event_type, StreamEventType::ContentBlockStart);
        assert_eq!(start.delta.as_ref().unwrap()["id"], "call_9");
        let delta = second[1].as_stream().unwrap();
        assert_eq!(
            delta.delta.as_ref().unwrap()["partial_json"],
            "{\"q\":\"rust\"}"
        );

        let (_, assistant, _) = state.finish();
        assert_eq!(assistant.tool_uses()[0].input, json!({"q": "rust"}));
    }

    #[test]
    fn test_accumulator_interleaved_tool_calls() {
        let mut state = StreamAccumulator::new();
        state.handle_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "function": {"name": "search", "arguments": "{\"q\""}},
                {"index": 1, "id": "call_b", "function": {"name": "calc", "arguments": "{\"e\""}},
            ]}, "finish_reason": null}],
        }));
        state.handle_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": ":\"rust\"}"}},
                {"index": 1, "function": {"arguments": ":\"2+2\"}"}},
            ]}, "finish_reason": "tool_calls"}],
        }));

        let (_, assistant, _) = state.finish();
        let tools = assistant.tool_uses();
        assert_eq!(tools.len(), 2);
        // Ascending index order
        assert_eq!(tools[0].id, "call_a");
        assert_eq!(tools[0].input, json!({"q": "rust"}));
        assert_eq!(tools[1].id, "call_b");
        assert_eq!(tools[1].input, json!({"e": "2+2"}));
        assert_eq!(assistant.finish_reason, Some(FinishReason::ToolUse));
    }

    #[test]
    fn test_accumulator_text_then_tool_closes_text() {
        let mut state = StreamAccumulator::new();
        state.handle_chunk(&json!({
            "choices": [{"delta": {"content": "Let me check."}, "finish_reason": null}],
        }));
        let events = state.handle_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "function": {"name": "check", "arguments": "{}"},
            }]}, "finish_reason": null}],
        }));

        // text stop precedes tool start
        assert_eq!(
            events[0].as_stream().unwrap().event_type,
            StreamEventType::ContentBlockStop
        );
        assert_eq!(
            events[1].as_stream().unwrap().event_type,
            StreamEventType::ContentBlockStart
        );

        let (closing, assistant, _) = state.finish();
        // only the tool block still needs closing
        assert_eq!(closing.len(), 1);
        assert_eq!(assistant.content.len(), 2);
    }

    #[test]
    fn test_accumulator_malformed_arguments() {
        let mut state = StreamAccumulator::new();
        state.handle_chunk(&json!({
            "choices": [{"delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "function": {"name": "broken", "arguments": "{nope"},
            }]}, "finish_reason": "tool_calls"}],
        }));
        let (_, assistant, _) = state.finish();
        assert_eq!(assistant.tool_uses()[0].input, json!({}));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(
            OpenAiProvider::map_finish_reason(Some("stop")),
            Some(FinishReason::Stop)
        );
        assert_eq!(
            OpenAiProvider::map_finish_reason(Some("length")),
            Some(FinishReason::Length)
        );
        assert_eq!(
            OpenAiProvider::map_finish_reason(Some("tool_calls")),
            Some(FinishReason::ToolUse)
        );
        assert_eq!(
            OpenAiProvider::map_finish_reason(Some("content_filter")),
            Some(FinishReason::ContentFilter)
        );
    }

    #[test]
    fn test_tool_choice_mapping() {
        let p = provider();
        let tool = crate::tools::tool("t", "d").build();
        let mk = |choice: ToolChoice| {
            let options = AgentOptions::builder()
                .tool_choice(choice)
                .tool(tool.clone())
                .build()
                .unwrap();
            p.build_request(&[Message::user("x")], &options, false)["tool_choice"].clone()
        };
        assert_eq!(mk(ToolChoice::Auto), json!("auto"));
        assert_eq!(mk(ToolChoice::Required), json!("required"));
        assert_eq!(mk(ToolChoice::None), json!("none"));
        assert_eq!(
            mk(ToolChoice::Tool("add".into())),
            json!({"type": "function", "function": {"name": "add"}})
        );
    }
}
