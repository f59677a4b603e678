//! Context window helpers: token estimation and history truncation.
//!
//! These are opt-in utilities; nothing trims automatically. The estimate is a
//! character-based approximation (1 token ~ 4 characters) that holds within
//! 70-85% across model families — leave a safety margin when checking limits.

use crate::types::{ContentBlock, Message, UserContent};

fn block_chars(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text(text) => text.text.len(),
        ContentBlock::Image(image) => image.source.len(),
        ContentBlock::Thinking(thinking) => thinking.thinking.len(),
        ContentBlock::ToolUse(tool) => {
            tool.name.len() + tool.id.len() + tool.input.to_string().len()
        }
        ContentBlock::ToolResult(result) => result.tool_use_id.len() + result.content.len(),
    }
}

/// Estimate the token count of a message list.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    if messages.is_empty() {
        return 0;
    }

    let mut total_chars = 0;
    for message in messages {
        // Role formatting overhead, roughly two tokens
        total_chars += 8;
        total_chars += match message {
            Message::System(msg) => msg.content.len(),
            Message::Tool(msg) => msg.content.len() + msg.tool_call_id.len(),
            Message::User(msg) => match &msg.content {
                UserContent::Text(text) => text.len(),
                UserContent::Blocks(blocks) => blocks.iter().map(block_chars).sum(),
            },
            Message::Assistant(msg) => msg.content.iter().map(block_chars).sum(),
        };
    }

    // Conversation-level overhead
    total_chars += 16;

    // 4 chars per token, rounded up
    total_chars.div_ceil(4)
}

/// Keep the most recent `keep_recent` messages, optionally preserving system
/// messages at the front.
///
/// This is a plain tail cut; it does not try to keep tool call/result pairs
/// together.
pub fn truncate_messages(
    messages: &[Message],
    keep_recent: usize,
    preserve_system: bool,
) -> Vec<Message> {
    if messages.len() <= keep_recent {
        return messages.to_vec();
    }

    let mut result: Vec<Message> = Vec::new();
    let tail_source: Vec<&Message> = if preserve_system {
        result.extend(messages.iter().filter(|m| m.is_system()).cloned());
        messages.iter().filter(|m| !m.is_system()).collect()
    } else {
        messages.iter().collect()
    };

    let start = tail_source.len().saturating_sub(keep_recent);
    result.extend(tail_source[start..].iter().map(|m| (*m).clone()));
    result
}

/// Whether the estimated size is within `threshold` of a model's limit.
pub fn is_approaching_limit(messages: &[Message], limit: usize, threshold: f64) -> bool {
    estimate_tokens(messages) as f64 >= limit as f64 * threshold
}
