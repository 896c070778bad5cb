use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use cq_domain::content::ChatMessage;
use cq_domain::error::Result;
use cq_domain::tool::ToolSpec;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A chat request as the engine sees it: an ordered message list.
///
/// Context assembly delivers these; continuation requests are rebuilt
/// from the move store. Messages whose content is raw provider blocks
/// must pass through the adapter untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
}

impl LlmRequest {
    /// Whether any message already uses the provider-native shape
    /// (assistant role present, or array content). Such requests must go
    /// through [`LlmClient::call_raw`].
    pub fn is_raw(&self) -> bool {
        self.messages.iter().any(ChatMessage::is_raw)
    }
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_use: Vec<ToolUse>,
    pub stop_reason: StopReason,
    /// The provider's assistant content blocks, verbatim. Retained on
    /// moves so continuation requests reproduce this turn exactly.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<Value>,
}

/// Receives text deltas during a streaming call.
pub type TokenSink = Arc<dyn Fn(&str) + Send + Sync>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One call per request shape. Adapters hold their own credentials and
/// model configuration; errors surface as provider-agnostic
/// `Error::Llm` failures.
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Plain request (fresh turn, text-only history).
    async fn call(&self, request: &LlmRequest, tools: &[ToolSpec]) -> Result<LlmResponse>;

    /// Provider-native continuation: prior assistant turns carry raw
    /// content blocks that must round-trip verbatim.
    async fn call_raw(&self, request: &LlmRequest, tools: &[ToolSpec]) -> Result<LlmResponse>;

    /// Plain request with token streaming.
    async fn call_streaming(
        &self,
        request: &LlmRequest,
        tools: &[ToolSpec],
        on_token: TokenSink,
    ) -> Result<LlmResponse>;
}
