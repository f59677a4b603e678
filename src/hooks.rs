//! Lifecycle hook pipeline.
//!
//! Hooks are caller-supplied async callbacks attached to a closed set of
//! lifecycle events. Within one event, matchers run in declaration order and
//! each matcher's hooks run in list order; outputs merge left-to-right with
//! later hooks overriding earlier keys. A `deny` permission decision is
//! sticky for the event once set.
//!
//! Hook failures never reach the caller: a timed-out hook is skipped with a
//! warning, an erroring hook is logged and skipped.
//!
//! # Example
//!
//! ```rust,no_run
//! use universal_agent::hooks::{HookEvent, HookMatcher, HookOutput, Hooks};
//!
//! let hooks = Hooks::new().add(
//!     HookEvent::PreToolUse,
//!     HookMatcher::for_tool("bash", |_input, _tool_use_id, _ctx| async move {
//!         Ok(HookOutput::deny("shell access is disabled here"))
//!     }),
//! );
//! ```

use crate::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// The closed set of lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    SessionStart,
    PreToolUse,
    PostToolUse,
    PreCompletion,
    PostCompletion,
    OnError,
}

impl HookEvent {
    pub fn name(&self) -> &'static str {
        match self {
            HookEvent::SessionStart => "SessionStart",
            HookEvent::PreToolUse => "PreToolUse",
            HookEvent::PostToolUse => "PostToolUse",
            HookEvent::PreCompletion => "PreCompletion",
            HookEvent::PostCompletion => "PostCompletion",
            HookEvent::OnError => "OnError",
        }
    }
}

/// Context handed to every hook invocation.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub session_id: String,
    pub tool_use_id: Option<String>,
}

/// Permission verdict a hook may attach to a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// Recognized hook output fields.
///
/// Every field is optional; `None` means "no opinion" and leaves the merged
/// value from earlier hooks untouched.
#[derive(Debug, Clone, Default)]
pub struct HookOutput {
    /// `Some(false)` aborts the surrounding agent loop.
    pub continue_: Option<bool>,
    /// Human-readable explanation surfaced in the final ResultMessage.
    pub stop_reason: Option<String>,
    /// On PreToolUse, replaces the tool input before execution.
    pub modified_input: Option<Value>,
    /// Allow or deny the tool call; deny short-circuits execution.
    pub permission_decision: Option<PermissionDecision>,
    pub permission_decision_reason: Option<String>,
    /// On SessionStart, appended as a system message; on PostToolUse,
    /// concatenated to the tool result.
    pub additional_context: Option<String>,
}

impl HookOutput {
    /// An output with no opinion on anything.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Abort the agent loop with an explanation.
    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            continue_: Some(false),
            stop_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Deny the tool call with an explanation.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            permission_decision: Some(PermissionDecision::Deny),
            permission_decision_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Explicitly allow the tool call.
    pub fn allow() -> Self {
        Self {
            permission_decision: Some(PermissionDecision::Allow),
            ..Self::default()
        }
    }

    /// Replace the tool input before execution.
    pub fn modify_input(input: Value) -> Self {
        Self {
            modified_input: Some(input),
            ..Self::default()
        }
    }

    /// Attach extra context (system message or tool-result note).
    pub fn context(text: impl Into<String>) -> Self {
        Self {
            additional_context: Some(text.into()),
            ..Self::default()
        }
    }

    /// Merge `other` into `self`: later values override, except that a deny
    /// decision, once set, survives any later allow.
    pub fn merge(&mut self, other: HookOutput) {
        if other.continue_.is_some() {
            self.continue_ = other.continue_;
        }
        if other.stop_reason.is_some() {
            self.stop_reason = other.stop_reason;
        }
        if other.modified_input.is_some() {
            self.modified_input = other.modified_input;
        }
        if self.permission_decision != Some(PermissionDecision::Deny) {
            if other.permission_decision.is_some() {
                self.permission_decision = other.permission_decision;
            }
            if other.permission_decision_reason.is_some() {
                self.permission_decision_reason = other.permission_decision_reason;
            }
        }
        if other.additional_context.is_some() {
            self.additional_context = other.additional_context;
        }
    }

    pub fn is_denied(&self) -> bool {
        self.permission_decision == Some(PermissionDecision::Deny)
    }

    pub fn should_stop(&self) -> bool {
        self.continue_ == Some(false)
    }
}

/// Async hook callback: `(input_data, tool_use_id, context)` -> output.
///
/// An `Err` return is treated like a raised exception in the pipeline: logged
/// and suppressed.
pub type HookCallback = Arc<
    dyn Fn(Value, Option<String>, HookContext) -> Pin<Box<dyn Future<Output = Result<HookOutput>> + Send>>
        + Send
        + Sync,
>;

/// A group of hooks gated by an optional tool-name matcher.
#[derive(Clone)]
pub struct HookMatcher {
    /// When set, fires only for events carrying this exact tool name.
    pub matcher: Option<String>,
    pub hooks: Vec<HookCallback>,
    /// Per-hook execution bound; a timed-out hook is skipped.
    pub timeout: Option<Duration>,
}

impl HookMatcher {
    /// Matcher that fires for every instance of the event.
    pub fn all<F, Fut>(hook: F) -> Self
    where
        F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutput>> + Send + 'static,
    {
        Self {
            matcher: None,
            hooks: vec![wrap(hook)],
            timeout: None,
        }
    }

    /// Matcher that fires only for a specific tool.
    pub fn for_tool<F, Fut>(tool_name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutput>> + Send + 'static,
    {
        Self {
            matcher: Some(tool_name.into()),
            hooks: vec![wrap(hook)],
            timeout: None,
        }
    }

    /// Append another hook to this matcher.
    pub fn hook<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutput>> + Send + 'static,
    {
        self.hooks.push(wrap(hook));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn matches(&self, tool_name: Option<&str>) -> bool {
        match (&self.matcher, tool_name) {
            (Some(matcher), Some(name)) => matcher == name,
            // A named matcher fires for every instance of events that carry
            // no tool name at all
            _ => true,
        }
    }
}

fn wrap<F, Fut>(hook: F) -> HookCallback
where
    F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HookOutput>> + Send + 'static,
{
    Arc::new(move |input, tool_use_id, ctx| Box::pin(hook(input, tool_use_id, ctx)))
}

/// Ordered hook configuration, mapping events to matcher lists.
#[derive(Clone, Default)]
pub struct Hooks {
    matchers: HashMap<HookEvent, Vec<HookMatcher>>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a matcher for an event. Matchers are evaluated in the order
    /// they were added.
    pub fn add(mut self, event: HookEvent, matcher: HookMatcher) -> Self {
        self.matchers.entry(event).or_default().push(matcher);
        self
    }

    /// Convenience: attach a single catch-all hook for an event.
    pub fn on<F, Fut>(self, event: HookEvent, hook: F) -> Self
    where
        F: Fn(Value, Option<String>, HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HookOutput>> + Send + 'static,
    {
        self.add(event, HookMatcher::all(hook))
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.values().all(|m| m.is_empty())
    }

    /// Run all matching hooks for an event and fold their outputs.
    ///
    /// Stops early when the merged output says `continue_ == false`.
    pub async fn execute(
        &self,
        event: HookEvent,
        input: &Value,
        tool_use_id: Option<&str>,
        tool_name: Option<&str>,
        session_id: &str,
    ) -> HookOutput {
        let mut combined = HookOutput::empty();
        let Some(matchers) = self.matchers.get(&event) else {
            return combined;
        };

        let context = HookContext {
            session_id: session_id.to_string(),
            tool_use_id: tool_use_id.map(|s| s.to_string()),
        };

        for matcher in matchers {
            if !matcher.matches(tool_name) {
                continue;
            }

            for hook in &matcher.hooks {
                let call = hook(
                    input.clone(),
                    tool_use_id.map(|s| s.to_string()),
                    context.clone(),
                );

                let outcome = match matcher.timeout {
                    Some(timeout) => match tokio::time::timeout(timeout, call).await {
                        Ok(result) => result,
                        Err(_) => {
                            log::warn!("hook timed out for event {}", event.name());
                            continue;
                        }
                    },
                    None => call.await,
                };

                match outcome {
                    Ok(output) => {
                        combined.merge(output);
                        if combined.should_stop() {
                            return combined;
                        }
                    }
                    Err(e) => {
                        log::error!("hook error for event {}: {}", event.name(), e);
                    }
                }
            }
        }

        combined
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: Vec<String> = self
            .matchers
            .iter()
            .map(|(event, matchers)| format!("{}: {} matchers", event.name(), matchers.len()))
            .collect();
        counts.sort();
        f.debug_struct("Hooks").field("events", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_empty_hooks_no_opinion() {
        let hooks = Hooks::new();
        let output = hooks
            .execute(HookEvent::PreToolUse, &json!({}), None, Some("x"), "s1")
            .await;
        assert!(output.continue_.is_none());
        assert!(output.permission_decision.is_none());
    }

    #[tokio::test]
    async fn test_matcher_filters_by_tool_name() {
        let hooks = Hooks::new().add(
            HookEvent::PreToolUse,
            HookMatcher::for_tool("dangerous", |_i, _id, _c| async move {
                Ok(HookOutput::deny("blocked"))
            }),
        );

        let denied = hooks
            .execute(
                HookEvent::PreToolUse,
                &json!({}),
                Some("t1"),
                Some("dangerous"),
                "s1",
            )
            .await;
        assert!(denied.is_denied());

        let allowed = hooks
            .execute(
                HookEvent::PreToolUse,
                &json!({}),
                Some("t2"),
                Some("safe"),
                "s1",
            )
            .await;
        assert!(!allowed.is_denied());
    }

    #[tokio::test]
    async fn test_merge_later_overrides_earlier() {
        let hooks = Hooks::new()
            .on(HookEvent::PreToolUse, |_i, _id, _c| async move {
                Ok(HookOutput::modify_input(json!({"v": 1})))
            })
            .on(HookEvent::PreToolUse, |_i, _id, _c| async move {
                Ok(HookOutput::modify_input(json!({"v": 2})))
            });

        let output = hooks
            .execute(HookEvent::PreToolUse, &json!({}), None, Some("x"), "s1")
            .await;
        assert_eq!(output.modified_input, Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_deny_is_sticky() {
        let hooks = Hooks::new()
            .on(HookEvent::PreToolUse, |_i, _id, _c| async move {
                Ok(HookOutput::deny("first says no"))
            })
            .on(HookEvent::PreToolUse, |_i, _id, _c| async move {
                Ok(HookOutput::allow())
            });

        let output = hooks
            .execute(HookEvent::PreToolUse, &json!({}), None, Some("x"), "s1")
            .await;
        assert!(output.is_denied());
        assert_eq!(
            output.permission_decision_reason.as_deref(),
            Some("first says no")
        );
    }

    #[tokio::test]
    async fn test_continue_false_short_circuits() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let reached = Arc::new(AtomicBool::new(false));
        let reached_clone = Arc::clone(&reached);

        let hooks = Hooks::new()
            .on(HookEvent::PostToolUse, |_i, _id, _c| async move {
                Ok(HookOutput::stop("enough"))
            })
            .on(HookEvent::PostToolUse, move |_i, _id, _c| {
                let reached = Arc::clone(&reached_clone);
                async move {
                    reached.store(true, Ordering::SeqCst);
                    Ok(HookOutput::empty())
                }
            });

        let output = hooks
            .execute(HookEvent::PostToolUse, &json!({}), None, Some("x"), "s1")
            .await;
        assert!(output.should_stop());
        assert_eq!(output.stop_reason.as_deref(), Some("enough"));
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_timed_out_hook_is_skipped() {
        let hooks = Hooks::new().add(
            HookEvent::PreToolUse,
            HookMatcher::all(|_i, _id, _c| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(HookOutput::deny("too late"))
            })
            .with_timeout(Duration::from_millis(10)),
        );

        let output = hooks
            .execute(HookEvent::PreToolUse, &json!({}), None, Some("x"), "s1")
            .await;
        assert!(!output.is_denied());
    }

    #[tokio::test]
    async fn test_erroring_hook_is_suppressed() {
        let hooks = Hooks::new()
            .on(HookEvent::OnError, |_i, _id, _c| async move {
                Err(crate::Error::other("hook blew up"))
            })
            .on(HookEvent::OnError, |_i, _id, _c| async move {
                Ok(HookOutput::context("still here"))
            });

        let output = hooks
            .execute(HookEvent::OnError, &json!({}), None, None, "s1")
            .await;
        assert_eq!(output.additional_context.as_deref(), Some("still here"));
    }

    #[tokio::test]
    async fn test_deterministic_merge() {
        let build = || {
            Hooks::new()
                .on(HookEvent::PreToolUse, |_i, _id, _c| async move {
                    Ok(HookOutput {
                        stop_reason: Some("a".into()),
                        ..HookOutput::empty()
                    })
                })
                .on(HookEvent::PreToolUse, |_i, _id, _c| async move {
                    Ok(HookOutput {
                        stop_reason: Some("b".into()),
                        additional_context: Some("ctx".into()),
                        ..HookOutput::empty()
                    })
                })
        };

        for _ in 0..3 {
            let output = build()
                .execute(HookEvent::PreToolUse, &json!({}), None, Some("x"), "s1")
                .await;
            assert_eq!(output.stop_reason.as_deref(), Some("b"));
            assert_eq!(output.additional_context.as_deref(), Some("ctx"));
        }
    }
}
