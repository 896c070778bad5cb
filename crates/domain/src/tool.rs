//! Tool model — definitions exposed to the LLM, calls the LLM makes, and
//! the result/error shapes that flow back.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::async_op::{OpTargetType, RetryPolicy};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How an agent tool joins the target agent to the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentCallMode {
    /// The invoked agent joins the caller's conversation as a participant.
    LoopIn,
    /// The invoked agent runs in a fresh child conversation and reports
    /// back via callback.
    Delegate,
}

/// A tool as stored in the definition store and enabled per persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub tool_id: String,
    /// The name the LLM invokes the tool by.
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's input. A schema without an explicit
    /// `type` is treated as permissive (no validation).
    pub input_schema: Value,
    pub target_type: OpTargetType,
    /// Task id, workflow id, or agent id depending on `target_type`.
    pub target_id: String,
    /// Async tools do not gate the LLM loop; the turn keeps running and
    /// only the completion check observes their results.
    #[serde(default, rename = "async")]
    pub is_async: bool,
    /// Optional projection `target_key -> source_key` applied to the LLM
    /// input before dispatch. Keys absent from the source are omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_mapping: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Only meaningful for agent tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AgentCallMode>,
}

/// Provider-neutral tool spec handed to the LLM adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One tool invocation as recorded on a move. The call id is the key that
/// later results are matched against (it is also the AsyncOp id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_id: String,
    pub input: Value,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Closed error taxonomy for tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolErrorCode {
    /// Upstream task/workflow raised.
    ExecutionFailed,
    /// Deadline elapsed. Always retriable.
    Timeout,
    /// Unknown tool referenced by the LLM.
    NotFound,
    /// Reserved for policy enforcement above the core.
    PermissionDenied,
    /// Tool input failed JSON-Schema validation.
    InvalidInput,
    /// Peer agent reported failure.
    AgentDeclined,
    /// The engine itself raised.
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub code: ToolErrorCode,
    pub message: String,
    pub retriable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ToolError {
    pub fn new(code: ToolErrorCode, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retriable,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal result of one tool invocation, success or failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(error: ToolError) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}
