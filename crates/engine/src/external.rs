//! Contracts for the collaborators the engine consumes but does not
//! implement: the workflow coordinator, the task executor, and the
//! persistent definition store. Peer conversations are reached through
//! [`AgentRouter`], implemented by the actor registry.
//!
//! Every call carries an explicit idempotency key (tool-call id or
//! workflow-run id) so a retried call does not duplicate effects.

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use cq_domain::config::Config;
use cq_domain::error::Result;
use cq_domain::persona::{ConversationMeta, MemoryExtractionWorkflow, Persona};
use cq_domain::tool::ToolDefinition;
use cq_domain::trace::TraceSink;
use cq_domain::turn::Caller;
use cq_llm::LlmClient;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workflow coordinator
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How a workflow is identified when creating a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowRef {
    /// Plain workflow id (tool dispatches, context assembly).
    Id(String),
    /// Fully scoped definition id + version + project (memory
    /// extraction).
    Scoped(MemoryExtractionWorkflow),
}

/// The workflow-runs resource plus its coordinator actors. The
/// coordinator eventually calls back the owning conversation actor using
/// the `_callback` envelope embedded in the run input.
#[async_trait::async_trait]
pub trait WorkflowService: Send + Sync {
    /// Register a new run. Returns the workflow-run id.
    async fn create_run(&self, workflow: &WorkflowRef, input: Value) -> Result<String>;

    /// Begin executing a registered run.
    async fn start_run(&self, run_id: &str) -> Result<()>;

    /// Report an agent-node result back to a parent coordinator
    /// (`_workflowCallback` completions).
    async fn handle_agent_result(&self, run_id: &str, node_id: &str, response: Value)
        -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task executor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub tool_call_id: String,
    pub conversation_id: String,
    pub turn_id: Uuid,
    pub task_id: String,
    pub input: Value,
    pub branch_context: Option<Value>,
}

/// Executes tasks out of process. Replies arrive later through the
/// conversation actor's task callbacks.
#[async_trait::async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: TaskRequest) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistent tool / persona / conversation metadata. Read-mostly; the
/// engine writes nothing here except fresh conversations for delegate
/// dispatches.
#[async_trait::async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn conversation(&self, conversation_id: &str) -> Result<ConversationMeta>;

    /// Create a fresh conversation owned by `agent_id` (delegate
    /// dispatch).
    async fn create_conversation(&self, agent_id: &str) -> Result<ConversationMeta>;

    async fn persona(&self, agent_id: &str) -> Result<Persona>;

    /// Resolve tool definitions by id. Unknown ids are skipped, not an
    /// error — a persona may reference tools that were since deleted.
    async fn tools(&self, tool_ids: &[String]) -> Result<Vec<ToolDefinition>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Peer agent routing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to `start_agent_call`: a turn started on behalf of a workflow
/// node, which must hear back when the turn completes.
#[derive(Debug, Clone)]
pub struct AgentCallParams {
    pub input: Value,
    pub caller: Caller,
    pub workflow_run_id: String,
    pub node_id: String,
}

/// Reaches conversation actors by id. Implemented by
/// [`crate::actor::ActorRegistry`]; a trait here so the dispatcher and
/// turn engine stay testable without a live registry.
#[async_trait::async_trait]
pub trait AgentRouter: Send + Sync {
    async fn start_turn(&self, conversation_id: &str, input: Value, caller: Caller)
        -> Result<Uuid>;

    /// Deliver a delegate child's final reasoning to its parent.
    async fn handle_agent_response(
        &self,
        conversation_id: &str,
        turn_id: Uuid,
        tool_call_id: &str,
        response: String,
    ) -> Result<()>;

    async fn handle_agent_error(
        &self,
        conversation_id: &str,
        turn_id: Uuid,
        tool_call_id: &str,
        error: String,
    ) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Service bundle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything an actor needs from the outside world, cloned into each
/// spawned conversation.
#[derive(Clone)]
pub struct Services {
    pub llm: Arc<dyn LlmClient>,
    pub workflows: Arc<dyn WorkflowService>,
    pub executor: Arc<dyn TaskExecutor>,
    pub defs: Arc<dyn DefinitionStore>,
    pub sink: Arc<dyn TraceSink>,
    pub config: Arc<Config>,
}
