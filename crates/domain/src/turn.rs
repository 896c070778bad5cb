//! Turn records — one unit of agent work, from caller input to terminal
//! state. A turn is `active` until every obligation it spawned (sync waits,
//! pending async ops) is discharged, then transitions to `completed` or
//! `failed` exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Caller
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Who initiated a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Caller {
    User,
    Workflow { workflow_run_id: String },
    Agent { agent_id: String },
}

impl Caller {
    /// The agent id when the caller is an agent (loop-in / delegate turns).
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Caller::Agent { agent_id } => Some(agent_id.as_str()),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn status
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Active,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Issue counters
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Non-fatal problems observed while a turn ran, recorded at completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnIssues {
    #[serde(default)]
    pub tool_failures: u32,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    /// Sortable id (UUIDv7): creation time defines turn order.
    pub id: Uuid,
    pub conversation_id: String,
    pub caller: Caller,
    /// Opaque caller payload. May carry callback envelopes under
    /// `_agentCallback` / `_workflowCallback`.
    pub input: Value,
    pub status: TurnStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Workflow run assembling the LLM request for this turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_assembly_run_id: Option<String>,
    /// Workflow run mining the finished transcript for long-term memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_extraction_run_id: Option<String>,
    #[serde(default)]
    pub tool_failures: u32,
    #[serde(default)]
    pub memory_extraction_failed: bool,
}

impl Turn {
    pub fn new(conversation_id: String, caller: Caller, input: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            conversation_id,
            caller,
            input,
            status: TurnStatus::Active,
            created_at: Utc::now(),
            completed_at: None,
            error_code: None,
            error_message: None,
            context_assembly_run_id: None,
            memory_extraction_run_id: None,
            tool_failures: 0,
            memory_extraction_failed: false,
        }
    }
}
