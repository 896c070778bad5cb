//! Callback envelopes — the only load-bearing wire format at the core
//! boundary. The camelCase keys are fixed; peers and coordinators match
//! on them exactly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Key under which a delegate child finds its parent in the turn input.
pub const AGENT_CALLBACK_KEY: &str = "_agentCallback";
/// Key under which an agent-call turn finds its owning workflow node.
pub const WORKFLOW_CALLBACK_KEY: &str = "_workflowCallback";
/// Key under which a workflow run input carries its reply address.
pub const RUN_CALLBACK_KEY: &str = "_callback";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parent callbacks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parent conversation to reply to when a delegate child completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentCallback {
    pub conversation_id: String,
    pub turn_id: Uuid,
    pub tool_call_id: String,
}

/// Parent workflow coordinator to reply to when an agent-call turn
/// completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowCallback {
    #[serde(rename = "type", default = "workflow_kind")]
    pub kind: String,
    pub run_id: String,
    pub node_id: String,
}

impl WorkflowCallback {
    pub fn new(run_id: String, node_id: String) -> Self {
        Self {
            kind: workflow_kind(),
            run_id,
            node_id,
        }
    }
}

fn workflow_kind() -> String {
    "workflow".to_owned()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow run callbacks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunCallbackKind {
    Workflow,
    ContextAssembly,
    MemoryExtraction,
}

/// Reply address embedded in a workflow run's input so the coordinator
/// can find the owning actor and turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCallback {
    pub conversation_id: String,
    pub turn_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: RunCallbackKind,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Embed / extract helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Insert `value` under `key` in `input`, promoting non-object inputs to
/// an object with the original payload under `"input"`.
pub fn embed(input: Value, key: &str, value: Value) -> Value {
    let mut obj = match input {
        Value::Object(map) => map,
        other => {
            let mut map = serde_json::Map::new();
            map.insert("input".to_owned(), other);
            map
        }
    };
    obj.insert(key.to_owned(), value);
    Value::Object(obj)
}

/// Read a typed envelope out of a turn input, if present and well-formed.
pub fn extract<T: serde::de::DeserializeOwned>(input: &Value, key: &str) -> Option<T> {
    input
        .get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}
