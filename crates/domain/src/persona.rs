//! Persona and conversation metadata as served by the external definition
//! store. The engine reads these on an actor's first touch; it never
//! writes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a conversation actor. Created externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMeta {
    pub conversation_id: String,
    /// The conversation's primary agent.
    pub agent_id: String,
    /// Opaque branch context forwarded to shell tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_context: Option<Value>,
}

/// Workflow identity for memory extraction. The project scope is needed
/// by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryExtractionWorkflow {
    pub workflow_def_id: String,
    pub version: u32,
    pub project_id: String,
}

/// Per-agent behavior: model profile, enabled tools, context window and
/// memory policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub agent_id: String,
    pub model_profile_id: String,
    /// Workflow that assembles the LLM request for each turn.
    pub context_assembly_workflow_id: String,
    /// Tool ids this persona may call.
    #[serde(default)]
    pub tool_ids: Vec<String>,
    /// How many recent turns context assembly receives.
    #[serde(default = "d_recent_turns")]
    pub recent_turns_limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_extraction: Option<MemoryExtractionWorkflow>,
}

fn d_recent_turns() -> usize {
    20
}
