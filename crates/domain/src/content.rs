//! Provider-agnostic chat content. Assistant turns that carried tool_use
//! blocks are kept as opaque `Blocks` and must round-trip to the provider
//! verbatim — continuation requests are rebuilt from them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Either plain text or an opaque array of provider content blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

// ── Convenience constructors ───────────────────────────────────────

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Text(text.into()),
        }
    }

    /// An assistant message carrying raw provider blocks verbatim.
    pub fn assistant_blocks(blocks: Value) -> Self {
        Self {
            role: Role::Assistant,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// A user message carrying raw provider blocks (tool_result turns).
    pub fn user_blocks(blocks: Value) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Whether this message already uses the provider-native shape.
    pub fn is_raw(&self) -> bool {
        self.role == Role::Assistant || matches!(self.content, MessageContent::Blocks(_))
    }
}

/// Build one provider tool_result block.
pub fn tool_result_block(tool_use_id: &str, content: String, is_error: bool) -> Value {
    if is_error {
        json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": true,
        })
    } else {
        json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
        })
    }
}
