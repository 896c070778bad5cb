//! Context-assembly dispatch. The assembly workflow runs outside the
//! core: it receives the conversation's recent history plus the tool
//! catalog and replies with the provider-native LLM request through
//! `handle_context_assembly_result`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use cq_domain::async_op::AsyncOp;
use cq_domain::envelope::{self, RunCallback, RunCallbackKind};
use cq_domain::error::{Error, Result};
use cq_domain::persona::Persona;
use cq_domain::tool::ToolDefinition;
use cq_domain::trace::TraceEvent;
use cq_domain::turn::Turn;

use crate::dispatch::DispatchCtx;
use crate::external::WorkflowRef;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assembly input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An active sibling turn, annotated with its open ops so the assembler
/// can describe in-flight work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTurnSummary {
    pub turn: Turn,
    pub pending_ops: Vec<AsyncOp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextAssemblyInput {
    pub user_message: String,
    /// Most recent first, bounded by the persona's limit.
    pub recent_turns: Vec<Turn>,
    pub model_profile_id: String,
    pub tool_ids: Vec<String>,
    pub tool_definitions: Vec<ToolDefinition>,
    /// Every other active turn in this conversation.
    pub active_turns: Vec<ActiveTurnSummary>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Package the assembly input, create and start the workflow run, and
/// link it to the turn. Returns the run id.
pub async fn dispatch_context_assembly(
    ctx: &DispatchCtx<'_>,
    turn_id: Uuid,
    user_message: &str,
    persona: &Persona,
) -> Result<String> {
    let recent_turns = ctx.stores.turns.get_recent(persona.recent_turns_limit);
    let active_turns: Vec<ActiveTurnSummary> = ctx
        .stores
        .turns
        .get_active()
        .into_iter()
        .filter(|t| t.id != turn_id)
        .map(|turn| {
            let pending_ops = ctx.stores.async_ops.get_open_for_turn(turn.id);
            ActiveTurnSummary { turn, pending_ops }
        })
        .collect();
    let tool_definitions = ctx.services.defs.tools(&persona.tool_ids).await?;

    let input = ContextAssemblyInput {
        user_message: user_message.to_owned(),
        recent_turns,
        model_profile_id: persona.model_profile_id.clone(),
        tool_ids: persona.tool_ids.clone(),
        tool_definitions,
        active_turns,
    };
    let callback = RunCallback {
        conversation_id: ctx.conversation_id.to_owned(),
        turn_id,
        tool_call_id: None,
        kind: RunCallbackKind::ContextAssembly,
    };
    let run_input = envelope::embed(
        serde_json::to_value(&input)?,
        envelope::RUN_CALLBACK_KEY,
        serde_json::to_value(&callback)?,
    );

    let workflow = WorkflowRef::Id(persona.context_assembly_workflow_id.clone());
    let run_id = ctx
        .services
        .workflows
        .create_run(&workflow, run_input)
        .await
        .map_err(|e| Error::Workflow(format!("create context assembly run: {e}")))?;

    ctx.stores.turns.link_context_assembly(turn_id, &run_id);
    ctx.services.sink.emit(TraceEvent::ContextAssemblyRequested {
        turn_id,
        run_id: run_id.clone(),
    });

    let workflows = ctx.services.workflows.clone();
    let sink = ctx.services.sink.clone();
    let started = run_id.clone();
    tokio::spawn(async move {
        if let Err(e) = workflows.start_run(&started).await {
            tracing::warn!(error = %e, run_id = %started, "context assembly start failed");
            sink.emit(TraceEvent::OutboundCallFailed {
                turn_id,
                target: "coordinator".to_owned(),
                error: e.to_string(),
            });
        }
    });

    Ok(run_id)
}

/// The assembly result payload: `{ llmRequest }`.
pub fn parse_assembly_output(output: &Value) -> Result<cq_llm::LlmRequest> {
    let request = output
        .get("llmRequest")
        .ok_or_else(|| Error::Workflow("context assembly output missing llmRequest".into()))?;
    serde_json::from_value(request.clone())
        .map_err(|e| Error::Workflow(format!("malformed llmRequest: {e}")))
}
