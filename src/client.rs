//! Agent client: the bounded multi-turn tool loop.
//!
//! [`AgentClient`] drives a provider through the agentic loop: call the model,
//! forward its stream to the caller, execute any requested tools (gated by
//! hooks and the permission callback), feed results back, and repeat until the
//! model stops asking for tools or `max_turns` is reached. The engine is the
//! sole authority on [`ResultMessage`] emission — provider-level result
//! messages are suppressed.
//!
//! The loop is pull-driven: [`AgentClient::receive`] returns one event per
//! call and advances an internal phase machine between calls. Dropping a
//! pending `receive()` future (or calling [`AgentClient::disconnect`])
//! abandons the in-flight provider stream and any pending tool work without
//! emitting a terminal result.

use crate::config::Config;
use crate::hooks::HookEvent;
use crate::providers::{EventStream, Provider, ProviderConfig, ProviderRegistry};
use crate::session::random_hex;
use crate::tools::{ToolRegistry, stringify_result};
use crate::types::{
    AgentEvent, AgentOptions, AssistantMessage, Message, PermissionResult, ResultMessage,
    StreamEvent, StreamEventType, ToolPermissionContext, ToolUseBlock,
};
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

/// Output shown in tool_execution_complete events is capped; the full content
/// still lands in the message history.
const EVENT_OUTPUT_LIMIT: usize = 500;

/// One-shot query: connect a client, send the prompt, and return the event
/// stream.
///
/// # Examples
///
/// ```rust,no_run
/// use universal_agent::{query, AgentOptions, AgentEvent};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let options = AgentOptions::builder()
///     .provider("anthropic")
///     .system_prompt("You are a helpful assistant")
///     .build()?;
///
/// let mut stream = query("What's the capital of France?", &options).await?;
/// while let Some(event) = stream.next().await {
///     if let AgentEvent::Assistant(msg) = event? {
///         println!("{}", msg.text());
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub async fn query(prompt: &str, options: &AgentOptions) -> Result<EventStream> {
    let mut client = AgentClient::new(options.clone());
    client.connect().await?;
    client.send(prompt).await?;

    let stream = futures::stream::unfold(client, |mut client| async move {
        client.receive().await.map(|item| (item, client))
    });
    Ok(Box::pin(stream))
}

/// Where the loop currently stands between `receive()` calls.
enum Phase {
    /// No response pending.
    Idle,
    /// About to call the provider for this turn.
    Request { turn: u32 },
    /// Forwarding provider events until the stream is drained.
    Drain {
        turn: u32,
        stream: EventStream,
        response: Option<AssistantMessage>,
    },
    /// Executing the turn's tool calls, one sub-step at a time.
    Tools {
        turn: u32,
        pending: VecDeque<ToolUseBlock>,
        running: Option<RunningTool>,
    },
    /// Emit the terminal ResultMessage.
    Finish {
        turn: u32,
        stop_reason: Option<String>,
    },
}

struct RunningTool {
    block: ToolUseBlock,
    started: Instant,
}

enum ToolOutcome {
    Continue,
    Stop(Option<String>),
}

/// Client for multi-turn conversations with tool execution.
///
/// # Examples
///
/// ```rust,no_run
/// use universal_agent::{AgentClient, AgentOptions, AgentEvent};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let options = AgentOptions::builder().provider("anthropic").build()?;
/// let mut client = AgentClient::new(options);
/// client.connect().await?;
///
/// client.send("What's 2+2?").await?;
/// while let Some(event) = client.receive().await {
///     match event? {
///         AgentEvent::Assistant(msg) => println!("{}", msg.text()),
///         AgentEvent::Result(result) => println!("turns: {}", result.num_turns),
///         _ => {}
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct AgentClient {
    options: AgentOptions,
    provider: Option<Arc<dyn Provider>>,
    messages: Vec<Message>,
    registry: ToolRegistry,
    session_id: String,
    connected: bool,
    phase: Phase,
    queue: VecDeque<AgentEvent>,
}

impl AgentClient {
    pub fn new(options: AgentOptions) -> Self {
        let session_id = options
            .session_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| random_hex(32));
        let registry = ToolRegistry::from_tools(options.tools());

        Self {
            options,
            provider: None,
            messages: Vec::new(),
            registry,
            session_id,
            connected: false,
            phase: Phase::Idle,
            queue: VecDeque::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Conversation history so far.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn options(&self) -> &AgentOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Bind the configured provider and seed the conversation.
    ///
    /// Resolves the provider through the registry (credentials come from
    /// `options.provider_config` or the config layer), seeds the system
    /// prompt, and fires SessionStart hooks. A hook returning
    /// `additional_context` appends a further system message.
    pub async fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let config = match self.options.provider_config() {
            Some(config) => config.clone(),
            None => Config::new().provider_config(self.options.provider()),
        };
        let provider = ProviderRegistry::get(self.options.provider(), config)?;
        self.finish_connect(provider).await
    }

    /// Bind a specific provider instance instead of resolving by name.
    pub async fn connect_with(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        self.finish_connect(provider).await
    }

    async fn finish_connect(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        self.provider = Some(provider);
        if !self.options.system_prompt().is_empty() {
            self.messages
                .push(Message::system(self.options.system_prompt()));
        }
        self.connected = true;

        let input = json!({
            "session_id": self.session_id,
            "hook_event_name": "SessionStart",
        });
        let output = self
            .options
            .hooks()
            .execute(HookEvent::SessionStart, &input, None, None, &self.session_id)
            .await;
        if let Some(context) = output.additional_context {
            self.messages.push(Message::system(context));
        }
        Ok(())
    }

    /// Drop provider binding and any pending response. Idempotent.
    pub async fn disconnect(&mut self) {
        self.connected = false;
        self.provider = None;
        self.phase = Phase::Idle;
        self.queue.clear();
    }

    /// Append a user message and start a response.
    ///
    /// Any previous pending response is abandoned.
    pub async fn send(&mut self, message: impl Into<Message>) -> Result<()> {
        if !self.connected || self.provider.is_none() {
            return Err(Error::other("not connected; call connect() first"));
        }

        self.messages.push(message.into());
        self.queue.clear();
        self.phase = Phase::Request { turn: 1 };
        Ok(())
    }

    /// Pull the next event of the pending response.
    ///
    /// Returns `None` once the terminal ResultMessage has been delivered (or
    /// when no response is pending). Provider errors surface as `Some(Err)`
    /// and end the sequence without a ResultMessage.
    pub async fn receive(&mut self) -> Option<Result<AgentEvent>> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(Ok(event));
            }

            match std::mem::replace(&mut self.phase, Phase::Idle) {
                Phase::Idle => return None,

                Phase::Request { turn } => {
                    let input = json!({
                        "session_id": self.session_id,
                        "hook_event_name": "PreCompletion",
                        "turn": turn,
                    });
                    let output = self
                        .options
                        .hooks()
                        .execute(HookEvent::PreCompletion, &input, None, None, &self.session_id)
                        .await;
                    if output.should_stop() {
                        self.phase = Phase::Finish {
                            turn,
                            stop_reason: output.stop_reason,
                        };
                        continue;
                    }

                    let provider = Arc::clone(self.provider.as_ref().unwrap());
                    if self.options.stream() {
                        match provider.stream(&self.messages, &self.options).await {
                            Ok(stream) => {
                                self.phase = Phase::Drain {
                                    turn,
                                    stream,
                                    response: None,
                                };
                            }
                            Err(e) => return Some(Err(e)),
                        }
                    } else {
                        match provider.complete(&self.messages, &self.options).await {
                            Ok(response) => {
                                self.queue.push_back(AgentEvent::Assistant(response.clone()));
                                self.post_completion(&response).await;
                                self.after_response(turn, Some(response));
                            }
                            Err(e) => return Some(Err(e)),
                        }
                    }
                }

                Phase::Drain {
                    turn,
                    mut stream,
                    mut response,
                } => match stream.next().await {
                    Some(Ok(event)) => {
                        // The provider's terminal result is suppressed; the
                        // engine emits its own after tool resolution
                        let forward = match &event {
                            AgentEvent::Result(_) => false,
                            AgentEvent::Assistant(msg) => {
                                response = Some(msg.clone());
                                true
                            }
                            _ => true,
                        };
                        if forward {
                            self.queue.push_back(event);
                        }
                        self.phase = Phase::Drain {
                            turn,
                            stream,
                            response,
                        };
                    }
                    Some(Err(e)) => return Some(Err(e)),
                    None => {
                        if let Some(msg) = &response {
                            self.post_completion(msg).await;
                        }
                        self.after_response(turn, response);
                    }
                },

                Phase::Tools {
                    turn,
                    mut pending,
                    running: None,
                } => match pending.pop_front() {
                    Some(block) => {
                        if self.options.stream() {
                            self.queue.push_back(AgentEvent::Stream(
                                StreamEvent::new(StreamEventType::ToolExecutionStart).with_delta(
                                    json!({
                                        "type": "tool_execution_start",
                                        "tool_use_id": block.id,
                                        "tool_name": block.name,
                                        "tool_input": block.input,
                                    }),
                                ),
                            ));
                        }
                        self.phase = Phase::Tools {
                            turn,
                            pending,
                            running: Some(RunningTool {
                                block,
                                started: Instant::now(),
                            }),
                        };
                    }
                    None => {
                        // Turn's tools all resolved; loop or finish
                        if turn >= self.options.max_turns() {
                            self.phase = Phase::Finish {
                                turn,
                                stop_reason: None,
                            };
                        } else {
                            self.phase = Phase::Request { turn: turn + 1 };
                        }
                    }
                },

                Phase::Tools {
                    turn,
                    pending,
                    running: Some(running),
                } => {
                    let outcome = self.run_tool(&running.block, running.started).await;
                    match outcome {
                        ToolOutcome::Continue => {
                            self.phase = Phase::Tools {
                                turn,
                                pending,
                                running: None,
                            };
                        }
                        ToolOutcome::Stop(stop_reason) => {
                            self.phase = Phase::Finish { turn, stop_reason };
                        }
                    }
                }

                Phase::Finish { turn, stop_reason } => {
                    self.queue.push_back(AgentEvent::Result(ResultMessage {
                        is_error: false,
                        num_turns: turn,
                        session_id: Some(self.session_id.clone()),
                        usage: None,
                        finish_reason: None,
                        stop_reason,
                    }));
                    // queue drains on the next iteration; phase stays Idle so
                    // the sequence ends after the terminal result
                }
            }
        }
    }

    /// Collect the full pending response, terminal ResultMessage included.
    pub async fn receive_all(&mut self) -> Result<Vec<AgentEvent>> {
        let mut events = Vec::new();
        while let Some(event) = self.receive().await {
            events.push(event?);
        }
        Ok(events)
    }

    /// send + receive_all sugar.
    pub async fn query(&mut self, message: impl Into<Message>) -> Result<Vec<AgentEvent>> {
        self.send(message).await?;
        self.receive_all().await
    }

    /// Switch provider mid-conversation.
    pub fn set_provider(&mut self, provider: &str, config: Option<ProviderConfig>) -> Result<()> {
        self.options.set_provider(provider);
        if let Some(config) = config.clone() {
            self.options.set_provider_config(Some(config));
        }
        let resolved = match config {
            Some(config) => config,
            None => Config::new().provider_config(provider),
        };
        self.provider = Some(ProviderRegistry::get(provider, resolved)?);
        Ok(())
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.options.set_model(model);
    }

    /// Clear conversation history, preserving system messages.
    pub fn clear_history(&mut self) {
        self.messages.retain(|m| m.is_system());
    }

    /// Decide what follows the provider's response for this turn.
    fn after_response(&mut self, turn: u32, response: Option<AssistantMessage>) {
        let Some(response) = response else {
            self.phase = Phase::Finish {
                turn,
                stop_reason: None,
            };
            return;
        };

        let tool_uses: VecDeque<ToolUseBlock> =
            response.tool_uses().into_iter().cloned().collect();

        if tool_uses.is_empty() {
            self.phase = Phase::Finish {
                turn,
                stop_reason: None,
            };
            return;
        }

        self.messages.push(Message::Assistant(response));
        self.phase = Phase::Tools {
            turn,
            pending: tool_uses,
            running: None,
        };
    }

    async fn post_completion(&mut self, response: &AssistantMessage) {
        let input = json!({
            "session_id": self.session_id,
            "hook_event_name": "PostCompletion",
            "response_text": response.text(),
        });
        self.options
            .hooks()
            .execute(HookEvent::PostCompletion, &input, None, None, &self.session_id)
            .await;
    }

    fn emit_tool_error(&mut self, block: &ToolUseBlock, error: &str, started: Instant) {
        if !self.options.stream() {
            return;
        }
        self.queue.push_back(AgentEvent::Stream(
            StreamEvent::new(StreamEventType::ToolExecutionComplete).with_delta(json!({
                "type": "tool_execution_error",
                "tool_use_id": block.id,
                "tool_name": block.name,
                "error": error,
                "duration_ms": started.elapsed().as_millis() as u64,
            })),
        ));
    }

    fn emit_tool_output(&mut self, block: &ToolUseBlock, output: &str, started: Instant) {
        if !self.options.stream() {
            return;
        }
        let truncated: String = output.chars().take(EVENT_OUTPUT_LIMIT).collect();
        self.queue.push_back(AgentEvent::Stream(
            StreamEvent::new(StreamEventType::ToolExecutionComplete).with_delta(json!({
                "type": "tool_execution_complete",
                "tool_use_id": block.id,
                "tool_name": block.name,
                "output": truncated,
                "duration_ms": started.elapsed().as_millis() as u64,
            })),
        ));
    }

    /// Execute one tool call: hooks, permission, handler, result recording.
    async fn run_tool(&mut self, block: &ToolUseBlock, started: Instant) -> ToolOutcome {
        let pre_input = json!({
            "session_id": self.session_id,
            "hook_event_name": "PreToolUse",
            "tool_name": block.name,
            "tool_input": block.input,
        });
        let pre = self
            .options
            .hooks()
            .execute(
                HookEvent::PreToolUse,
                &pre_input,
                Some(block.id.as_str()),
                Some(block.name.as_str()),
                &self.session_id,
            )
            .await;

        if pre.should_stop() {
            let reason = pre
                .stop_reason
                .unwrap_or_else(|| "Stopped by PreToolUse hook".to_string());
            log::info!("execution stopped: {}", reason);
            self.emit_tool_error(block, &reason, started);
            return ToolOutcome::Stop(Some(reason));
        }

        if pre.is_denied() {
            let reason = pre
                .permission_decision_reason
                .unwrap_or_else(|| "Denied by PreToolUse hook".to_string());
            self.messages
                .push(Message::tool(format!("Permission denied: {}", reason), &block.id));
            self.emit_tool_error(block, &format!("Permission denied: {}", reason), started);
            return ToolOutcome::Continue;
        }

        let mut tool_input = pre.modified_input.unwrap_or_else(|| block.input.clone());

        // Permission callback is the fallback when no hook decided
        if pre.permission_decision.is_none() {
            if let Some(callback) = self.options.can_use_tool() {
                let context = ToolPermissionContext {
                    session_id: self.session_id.clone(),
                    tool_use_id: Some(block.id.clone()),
                };
                match callback(block.name.clone(), tool_input.clone(), context).await {
                    PermissionResult::Deny { message } => {
                        self.messages.push(Message::tool(
                            format!("Permission denied: {}", message),
                            &block.id,
                        ));
                        self.emit_tool_error(
                            block,
                            &format!("Permission denied: {}", message),
                            started,
                        );
                        return ToolOutcome::Continue;
                    }
                    PermissionResult::Allow { updated_input } => {
                        if let Some(updated) = updated_input {
                            tool_input = updated;
                        }
                    }
                }
            }
        }

        let tool = match self.registry.get(&block.name) {
            Ok(tool) if tool.has_handler() => Arc::clone(tool),
            _ => {
                self.messages.push(Message::tool(
                    format!("Tool '{}' not found or has no handler", block.name),
                    &block.id,
                ));
                self.emit_tool_error(block, &format!("Tool '{}' not found", block.name), started);
                return ToolOutcome::Continue;
            }
        };

        let mut content = match tool.execute(tool_input.clone()).await {
            Ok(result) => stringify_result(&result),
            Err(e) => {
                let error_input = json!({
                    "session_id": self.session_id,
                    "hook_event_name": "OnError",
                    "error": e.to_string(),
                    "error_type": "tool_execution",
                });
                self.options
                    .hooks()
                    .execute(
                        HookEvent::OnError,
                        &error_input,
                        Some(block.id.as_str()),
                        Some(block.name.as_str()),
                        &self.session_id,
                    )
                    .await;

                self.messages.push(Message::tool(
                    format!("Error executing tool: {}", e),
                    &block.id,
                ));
                self.emit_tool_error(block, &e.to_string(), started);
                return ToolOutcome::Continue;
            }
        };

        let post_input = json!({
            "session_id": self.session_id,
            "hook_event_name": "PostToolUse",
            "tool_name": block.name,
            "tool_input": tool_input,
            "tool_response": content,
        });
        let post = self
            .options
            .hooks()
            .execute(
                HookEvent::PostToolUse,
                &post_input,
                Some(block.id.as_str()),
                Some(block.name.as_str()),
                &self.session_id,
            )
            .await;

        if post.should_stop() {
            let reason = post
                .stop_reason
                .unwrap_or_else(|| "Stopped by PostToolUse hook".to_string());
            log::info!("execution stopped: {}", reason);
            self.messages.push(Message::tool(&content, &block.id));
            self.emit_tool_output(block, &content, started);
            return ToolOutcome::Stop(Some(reason));
        }

        if let Some(context) = post.additional_context {
            content.push_str(&format!("\n\n[Hook note: {}]", context));
        }

        self.messages.push(Message::tool(&content, &block.id));
        self.emit_tool_output(block, &content, started);
        ToolOutcome::Continue
    }
}
