//! Structured trace events. Every store mutation and every dispatcher
//! branch emits exactly one; none is load-bearing for correctness.
//!
//! Events go through a pluggable [`TraceSink`]. The default [`LogSink`]
//! serializes to JSON and logs via `tracing`.

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::tool::ToolErrorCode;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    // ── Store mutations ────────────────────────────────────────────
    TurnCreated {
        turn_id: Uuid,
        conversation_id: String,
    },
    TurnCompleted {
        turn_id: Uuid,
        tool_failures: u32,
    },
    TurnFailed {
        turn_id: Uuid,
        code: String,
    },
    TurnLinked {
        turn_id: Uuid,
        run_id: String,
        link: &'static str,
    },
    MessageAppended {
        message_id: Uuid,
        turn_id: Uuid,
        role: String,
    },
    MoveRecorded {
        turn_id: Uuid,
        sequence: u32,
        has_tool_call: bool,
    },
    MoveResultRecorded {
        turn_id: Uuid,
        tool_call_id: String,
        success: bool,
    },
    AsyncOpTracked {
        op_id: String,
        turn_id: Uuid,
        target_type: String,
    },
    AsyncOpWaiting {
        op_id: String,
        turn_id: Uuid,
    },
    AsyncOpCompleted {
        op_id: String,
    },
    AsyncOpFailed {
        op_id: String,
        code: ToolErrorCode,
    },
    AsyncOpRetried {
        op_id: String,
        attempt: u32,
    },
    ParticipantAdded {
        conversation_id: String,
        participant_id: String,
    },
    ParticipantRemoved {
        conversation_id: String,
        participant_id: String,
    },
    JournalReplayed {
        conversation_id: String,
        records: usize,
    },

    // ── Planner ────────────────────────────────────────────────────
    MessagePlanned {
        turn_id: Uuid,
        chars: usize,
    },
    ToolCallPlanned {
        turn_id: Uuid,
        tool_call_id: String,
        tool_name: String,
    },
    ToolRejected {
        turn_id: Uuid,
        tool_call_id: String,
        tool_name: String,
        code: ToolErrorCode,
    },
    MemoryExtractionPlanned {
        turn_id: Uuid,
    },
    MemoryExtractionSkipped {
        turn_id: Uuid,
        reason: &'static str,
    },

    // ── Dispatcher ─────────────────────────────────────────────────
    TaskDispatched {
        turn_id: Uuid,
        tool_call_id: String,
        task_id: String,
    },
    WorkflowDispatched {
        turn_id: Uuid,
        tool_call_id: String,
        workflow_run_id: String,
    },
    AgentLoopedIn {
        turn_id: Uuid,
        agent_id: String,
    },
    AgentDelegated {
        turn_id: Uuid,
        agent_id: String,
        child_conversation_id: String,
    },
    ContextAssemblyRequested {
        turn_id: Uuid,
        run_id: String,
    },
    /// The decision is a no-op in the dispatcher; the loop driver owns
    /// context assembly.
    ContextAssemblyDeferred {
        turn_id: Uuid,
    },
    MemoryExtractionRequested {
        turn_id: Uuid,
        run_id: String,
    },
    OutboundCallFailed {
        turn_id: Uuid,
        target: String,
        error: String,
    },
    DecisionError {
        turn_id: Option<Uuid>,
        error: String,
    },

    // ── Turn engine ────────────────────────────────────────────────
    CallbackIgnored {
        turn_id: Uuid,
        reason: &'static str,
    },
    ContinuationStarted {
        turn_id: Uuid,
        tool_call_id: String,
    },
    /// A gating call settled but sibling calls from the same assistant
    /// batch are still in flight.
    ContinuationDeferred {
        turn_id: Uuid,
        tool_call_id: String,
    },
    ParentNotified {
        turn_id: Uuid,
        parent_conversation_id: String,
    },
    ParentNotifyFailed {
        turn_id: Uuid,
        error: String,
    },
    AlarmArmed {
        conversation_id: String,
        at: chrono::DateTime<chrono::Utc>,
    },
    AlarmCleared {
        conversation_id: String,
    },
    TimeoutSwept {
        conversation_id: String,
        ops: usize,
    },
    LlmCallCompleted {
        turn_id: Uuid,
        stop_reason: String,
        tool_calls: usize,
    },
    LlmCallFailed {
        turn_id: Uuid,
        error: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sinks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pluggable destination for trace events.
pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Default sink: one structured log line per event.
pub struct LogSink;

impl TraceSink for LogSink {
    fn emit(&self, event: TraceEvent) {
        let json = serde_json::to_string(&event).unwrap_or_default();
        tracing::info!(trace_event = %json, "cq_event");
    }
}

/// Captures events in memory; used by tests to assert ordering.
#[derive(Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<TraceEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    /// The serde tag of every captured event, in emission order.
    pub fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| {
                serde_json::to_value(e)
                    .ok()
                    .and_then(|v| v.get("event").and_then(Value::as_str).map(String::from))
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl TraceSink for RecordingSink {
    fn emit(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}
