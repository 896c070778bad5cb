//! Dispatch decisions — the closed set of intents the planner produces and
//! the dispatcher applies. Decisions are pure data; applying one is the
//! only place side effects happen. Match exhaustiveness makes an unknown
//! variant a compile error rather than a runtime condition.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::async_op::RetryPolicy;
use crate::message::MessageRole;
use crate::persona::MemoryExtractionWorkflow;
use crate::tool::{AgentCallMode, ToolCall, ToolOutcome};
use crate::turn::{Caller, TurnIssues};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    StartTurn {
        conversation_id: String,
        caller: Caller,
        input: Value,
    },
    CompleteTurn {
        turn_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        issues: Option<TurnIssues>,
    },
    FailTurn {
        turn_id: Uuid,
        code: String,
        message: String,
    },
    AppendMessage {
        turn_id: Uuid,
        role: MessageRole,
        content: String,
    },
    RecordMove {
        turn_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_content: Option<Value>,
    },
    /// Terminal outcome for an op that never dispatched (unknown tool,
    /// invalid input) or whose result arrived through a side channel.
    AsyncOpCompleted {
        turn_id: Uuid,
        op_id: String,
        outcome: ToolOutcome,
    },
    MarkWaiting {
        turn_id: Uuid,
        op_id: String,
    },
    ResumeFromTool {
        turn_id: Uuid,
        op_id: String,
        result: Value,
    },
    DispatchTask {
        turn_id: Uuid,
        tool_call: ToolCall,
        task_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_content: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
        is_async: bool,
    },
    DispatchWorkflow {
        turn_id: Uuid,
        tool_call: ToolCall,
        workflow_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_content: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry: Option<RetryPolicy>,
        is_async: bool,
    },
    DispatchAgent {
        turn_id: Uuid,
        tool_call: ToolCall,
        agent_id: String,
        mode: AgentCallMode,
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        raw_content: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        is_async: bool,
    },
    /// Handled directly by the loop driver; the dispatcher only traces it.
    DispatchContextAssembly {
        turn_id: Uuid,
    },
    DispatchMemoryExtraction {
        turn_id: Uuid,
        agent_id: String,
        workflow: MemoryExtractionWorkflow,
        transcript: Value,
    },
}

impl Decision {
    /// A sync dispatch blocks the LLM loop until its result lands.
    pub fn is_sync_dispatch(&self) -> bool {
        match self {
            Decision::DispatchTask { is_async, .. }
            | Decision::DispatchWorkflow { is_async, .. }
            | Decision::DispatchAgent { is_async, .. } => !is_async,
            _ => false,
        }
    }

    /// The tool-call id for dispatch decisions.
    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Decision::DispatchTask { tool_call, .. }
            | Decision::DispatchWorkflow { tool_call, .. }
            | Decision::DispatchAgent { tool_call, .. } => Some(tool_call.call_id.as_str()),
            _ => None,
        }
    }
}
