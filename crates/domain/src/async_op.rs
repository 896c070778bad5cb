//! AsyncOp records — bookkeeping for in-flight tool invocations.
//!
//! The op id equals the owning tool-call id, so there is at most one op
//! per tool call. `waiting` means the turn is blocked on this op (the
//! tool is synchronous); `pending` means the turn continues regardless.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::tool::ToolError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status / target
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpStatus {
    Pending,
    Waiting,
    Completed,
    Failed,
}

impl OpStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpTargetType {
    Task,
    Workflow,
    Agent,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AsyncOp record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncOp {
    /// Equal to the owning tool-call id.
    pub op_id: String,
    pub turn_id: Uuid,
    /// Absent on synthetic rows (results recorded for calls that never
    /// dispatched, e.g. unknown tools).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_type: Option<OpTargetType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    pub status: OpStatus,
    /// Set when this op gates its turn's LLM loop (synchronous tool).
    /// Sticky across retries and terminal transitions, so a late or
    /// timed-out sync result still drives a continuation.
    #[serde(default)]
    pub sync: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Absolute deadline; `None` means the op never times out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub attempt_number: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Input to `AsyncOpStore::track`.
#[derive(Debug, Clone)]
pub struct TrackParams {
    pub op_id: String,
    pub turn_id: Uuid,
    pub target_type: OpTargetType,
    pub target_id: String,
    pub timeout_at: Option<DateTime<Utc>>,
    pub retry: Option<RetryPolicy>,
}
