//! Moves — one iteration inside a turn. A move records a reasoning step,
//! a tool call, or both, plus eventually the tool's result. The optional
//! `raw_content` blob keeps the provider's assistant content verbatim so a
//! continuation request can reproduce prior tool_use messages exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tool::{ToolCall, ToolOutcome};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Move {
    pub id: Uuid,
    pub turn_id: Uuid,
    /// Monotonic per turn, starting at 0. Assigned by the move store.
    pub sequence: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolOutcome>,
    /// Opaque provider content blocks. Never normalized; round-trips
    /// through the store back to the provider verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<Value>,
    pub created_at: DateTime<Utc>,
}

/// Input to `MoveStore::record` — everything but the store-assigned
/// id and sequence.
#[derive(Debug, Clone, Default)]
pub struct MoveParams {
    pub turn_id: Uuid,
    pub reasoning: Option<String>,
    pub tool_call: Option<ToolCall>,
    pub raw_content: Option<Value>,
}
