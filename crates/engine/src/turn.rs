//! The turn state machine. Entry points are the callbacks the outside
//! world fires at a conversation actor; the actor serializes them, so
//! every method here runs to completion before the next begins.
//!
//! The engine reads the stores but mutates them only through dispatcher
//! decisions. Completion is driven by one rule: a turn finishes exactly
//! when nothing blocks it (no waiting op) and nothing is still in flight
//! (no pending op).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use cq_domain::async_op::{AsyncOp, OpTargetType};
use cq_domain::decision::Decision;
use cq_domain::envelope::{
    self, AgentCallback, WorkflowCallback, AGENT_CALLBACK_KEY, WORKFLOW_CALLBACK_KEY,
};
use cq_domain::error::Result;
use cq_domain::message::MessageRole;
use cq_domain::participant::ParticipantType;
use cq_domain::persona::{ConversationMeta, Persona};
use cq_domain::tool::{ToolError, ToolErrorCode, ToolOutcome};
use cq_domain::trace::TraceEvent;
use cq_domain::turn::{Caller, Turn, TurnIssues};
use cq_llm::TokenSink;
use cq_stores::ConversationStores;

use crate::alarm::AlarmSlot;
use crate::context;
use crate::dispatch::{self, DispatchCtx};
use crate::external::{AgentCallParams, AgentRouter, Services, TaskRequest};
use crate::llm_loop::{self, LoopResult};
use crate::planner;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnEngine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnEngine {
    meta: ConversationMeta,
    stores: ConversationStores,
    services: Services,
    agents: Arc<dyn AgentRouter>,
    alarm: AlarmSlot,
    /// Personas seen by this conversation (the owner plus any looped-in
    /// agents), cached after the first definition-store read.
    personas: Mutex<HashMap<String, Persona>>,
    /// Per-turn streaming sinks, dropped when the turn terminates.
    token_sinks: Mutex<HashMap<Uuid, TokenSink>>,
}

impl TurnEngine {
    pub fn new(
        meta: ConversationMeta,
        persona: Persona,
        stores: ConversationStores,
        services: Services,
        agents: Arc<dyn AgentRouter>,
        alarm: AlarmSlot,
    ) -> Self {
        let personas = Mutex::new(HashMap::from([(persona.agent_id.clone(), persona)]));
        Self {
            meta,
            stores,
            services,
            agents,
            alarm,
            personas,
            token_sinks: Mutex::new(HashMap::new()),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.meta.conversation_id
    }

    /// Read access to the conversation's tables (queries only — writes
    /// go through decisions).
    pub fn stores(&self) -> &ConversationStores {
        &self.stores
    }

    pub fn alarm(&self) -> &AlarmSlot {
        &self.alarm
    }

    fn ctx(&self) -> DispatchCtx<'_> {
        DispatchCtx {
            conversation_id: &self.meta.conversation_id,
            agent_id: &self.meta.agent_id,
            branch_context: self.meta.branch_context.as_ref(),
            stores: &self.stores,
            services: &self.services,
            agents: &self.agents,
            alarm: &self.alarm,
        }
    }

    /// Re-arm the alarm from the op table. Called once after a journal
    /// replay so deadlines survive restarts.
    pub fn rearm_alarm_from_store(&self) {
        if let Some(at) = self.stores.async_ops.get_earliest_timeout() {
            self.alarm.schedule(at);
        }
    }

    // ── Persona resolution ─────────────────────────────────────────

    async fn persona_for(&self, agent_id: &str) -> Result<Persona> {
        if let Some(persona) = self.personas.lock().get(agent_id) {
            return Ok(persona.clone());
        }
        let persona = self.services.defs.persona(agent_id).await?;
        self.personas
            .lock()
            .insert(agent_id.to_owned(), persona.clone());
        Ok(persona)
    }

    /// The agent a turn executes as. A looped-in agent (a participant
    /// of this conversation) answers with its own persona; any other
    /// caller — user, workflow, or the parent that delegated this
    /// conversation into existence — gets the conversation's owner.
    fn executing_agent_id(&self, caller: &Caller) -> String {
        match caller.agent_id() {
            Some(agent_id)
                if self
                    .stores
                    .participants
                    .exists(ParticipantType::Agent, agent_id) =>
            {
                agent_id.to_owned()
            }
            _ => self.meta.agent_id.clone(),
        }
    }

    async fn persona_for_turn(&self, turn: &Turn) -> Result<Persona> {
        let agent_id = self.executing_agent_id(&turn.caller);
        self.persona_for(&agent_id).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Entry points
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Start a turn: create the row, append the user message, dispatch
    /// context assembly. The LLM call happens later, when the assembled
    /// request comes back.
    ///
    /// Persona-load and turn-creation failures throw; a context-assembly
    /// dispatch failure fails the turn but still returns the id — the
    /// caller can observe the failed status.
    pub async fn start_turn(
        &self,
        input: Value,
        caller: Caller,
        token_sink: Option<TokenSink>,
    ) -> Result<Uuid> {
        let persona = self.persona_for_caller(&caller).await?;
        let turn_id = self.stores.turns.create(caller, input.clone());
        let user_message = user_message_of(&input);
        self.stores
            .messages
            .append(turn_id, MessageRole::User, user_message.clone());
        if let Some(sink) = token_sink {
            self.token_sinks.lock().insert(turn_id, sink);
        }

        let ctx = self.ctx();
        if let Err(e) =
            context::dispatch_context_assembly(&ctx, turn_id, &user_message, &persona).await
        {
            tracing::warn!(error = %e, %turn_id, "context assembly dispatch failed");
            self.fail_turn(turn_id, "INTERNAL_ERROR", &e.to_string()).await;
        }
        Ok(turn_id)
    }

    /// Start a turn on behalf of a workflow node; the node's reply
    /// address rides in the turn input.
    pub async fn start_agent_call(&self, params: AgentCallParams) -> Result<Uuid> {
        let callback = WorkflowCallback::new(params.workflow_run_id, params.node_id);
        let input = envelope::embed(
            params.input,
            WORKFLOW_CALLBACK_KEY,
            serde_json::to_value(&callback)?,
        );
        self.start_turn(input, params.caller, None).await
    }

    async fn persona_for_caller(&self, caller: &Caller) -> Result<Persona> {
        let agent_id = self.executing_agent_id(caller);
        self.persona_for(&agent_id).await
    }

    // ── Context assembly callbacks ─────────────────────────────────

    /// The assembled LLM request arrived; run the first iteration.
    pub async fn handle_context_assembly_result(
        &self,
        turn_id: Uuid,
        run_id: &str,
        output: Value,
    ) -> Result<()> {
        let Some(turn) = self.stores.turns.get(turn_id) else {
            self.ignore_callback(turn_id, "turn not found");
            return Ok(());
        };
        self.stores.turns.link_context_assembly(turn_id, run_id);

        let request = match context::parse_assembly_output(&output) {
            Ok(request) => request,
            Err(e) => {
                self.fail_turn(turn_id, "INTERNAL_ERROR", &e.to_string()).await;
                return Ok(());
            }
        };

        let loop_result = self.run_loop_guarded(&turn, request).await;
        self.maybe_complete_turn(turn_id, loop_result).await
    }

    /// Context assembly is load-bearing: without a request there is
    /// nothing to run, so the turn fails.
    pub async fn handle_context_assembly_error(
        &self,
        turn_id: Uuid,
        run_id: &str,
        error: &str,
    ) -> Result<()> {
        if self.stores.turns.get(turn_id).is_none() {
            self.ignore_callback(turn_id, "turn not found");
            return Ok(());
        }
        self.stores.turns.link_context_assembly(turn_id, run_id);
        self.fail_turn(turn_id, "INTERNAL_ERROR", error).await;
        Ok(())
    }

    // ── Tool result callbacks ──────────────────────────────────────

    pub async fn handle_task_result(
        &self,
        turn_id: Uuid,
        tool_call_id: &str,
        result: Value,
    ) -> Result<()> {
        self.settle_op(turn_id, tool_call_id, ToolOutcome::ok(result))
            .await
    }

    pub async fn handle_task_error(
        &self,
        turn_id: Uuid,
        tool_call_id: &str,
        error: &str,
    ) -> Result<()> {
        self.settle_op(
            turn_id,
            tool_call_id,
            ToolOutcome::err(ToolError::new(ToolErrorCode::ExecutionFailed, error, false)),
        )
        .await
    }

    pub async fn handle_workflow_result(
        &self,
        turn_id: Uuid,
        tool_call_id: &str,
        result: Value,
    ) -> Result<()> {
        self.settle_op(turn_id, tool_call_id, ToolOutcome::ok(result))
            .await
    }

    pub async fn handle_workflow_error(
        &self,
        turn_id: Uuid,
        tool_call_id: &str,
        error: &str,
    ) -> Result<()> {
        self.settle_op(
            turn_id,
            tool_call_id,
            ToolOutcome::err(ToolError::new(ToolErrorCode::ExecutionFailed, error, false)),
        )
        .await
    }

    /// A delegate child completed; its final reasoning is the result.
    pub async fn handle_agent_response(
        &self,
        turn_id: Uuid,
        tool_call_id: &str,
        response: String,
    ) -> Result<()> {
        self.settle_op(turn_id, tool_call_id, ToolOutcome::ok(json!(response)))
            .await
    }

    pub async fn handle_agent_error(
        &self,
        turn_id: Uuid,
        tool_call_id: &str,
        error: &str,
    ) -> Result<()> {
        self.settle_op(
            turn_id,
            tool_call_id,
            ToolOutcome::err(ToolError::new(ToolErrorCode::AgentDeclined, error, false)),
        )
        .await
    }

    // ── Memory extraction callbacks ────────────────────────────────

    /// Fire-and-forget by design — success needs no turn mutation.
    pub async fn handle_memory_extraction_result(
        &self,
        turn_id: Uuid,
        _run_id: &str,
    ) -> Result<()> {
        if self.stores.turns.get(turn_id).is_none() {
            self.ignore_callback(turn_id, "turn not found");
        }
        Ok(())
    }

    pub async fn handle_memory_extraction_error(
        &self,
        turn_id: Uuid,
        run_id: &str,
        error: &str,
    ) -> Result<()> {
        tracing::warn!(%turn_id, run_id, error, "memory extraction failed");
        self.stores.turns.mark_memory_extraction_failed(turn_id);
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Alarm sweep
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Sweep every op whose deadline has passed. Ops with retry budget
    /// are re-queued (and their outbound call re-fired under the same
    /// idempotency key); the rest synthesize a retriable TIMEOUT driven
    /// through the same path as real callbacks. The alarm is always
    /// re-armed from the table before returning.
    pub async fn handle_alarm(&self) -> Result<()> {
        let result = self.sweep_timed_out().await;
        self.alarm
            .rearm(self.stores.async_ops.get_earliest_timeout());
        result
    }

    async fn sweep_timed_out(&self) -> Result<()> {
        let timed_out = self.stores.async_ops.get_timed_out(Utc::now());
        self.services.sink.emit(TraceEvent::TimeoutSwept {
            conversation_id: self.meta.conversation_id.clone(),
            ops: timed_out.len(),
        });

        for op in timed_out {
            if self.stores.async_ops.can_retry(&op.op_id) {
                if self
                    .stores
                    .async_ops
                    .prepare_retry(&op.op_id, "deadline elapsed")
                    .is_some()
                {
                    self.refire(&op);
                    continue;
                }
            }
            let outcome = ToolOutcome::err(ToolError::new(
                ToolErrorCode::Timeout,
                format!(
                    "tool call timed out after {} attempt(s)",
                    op.attempt_number
                ),
                true,
            ));
            self.settle_op(op.turn_id, &op.op_id, outcome).await?;
        }
        Ok(())
    }

    /// Re-fire the outbound call for a retried op. Only tasks re-fire:
    /// the executor receives the same tool-call id, so a still-running
    /// first attempt cannot double its effects. Workflow and agent
    /// targets keep their extended deadline only.
    fn refire(&self, op: &AsyncOp) {
        if op.target_type != Some(OpTargetType::Task) {
            return;
        }
        let Some(task_id) = op.target_id.clone() else {
            return;
        };
        let Some(tool_call) = self
            .stores
            .moves
            .get_for_turn(op.turn_id)
            .into_iter()
            .filter_map(|m| m.tool_call)
            .find(|tc| tc.call_id == op.op_id)
        else {
            return;
        };

        let request = TaskRequest {
            tool_call_id: op.op_id.clone(),
            conversation_id: self.meta.conversation_id.clone(),
            turn_id: op.turn_id,
            task_id,
            input: tool_call.input,
            branch_context: self.meta.branch_context.clone(),
        };
        let executor = self.services.executor.clone();
        let sink = self.services.sink.clone();
        let turn_id = op.turn_id;
        tokio::spawn(async move {
            if let Err(e) = executor.execute(request).await {
                tracing::warn!(error = %e, "task retry dispatch failed");
                sink.emit(TraceEvent::OutboundCallFailed {
                    turn_id,
                    target: "executor".to_owned(),
                    error: e.to_string(),
                });
            }
        });
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Shared callback machinery
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// The common tail of every tool callback: record the move result,
    /// close the op, continue the LLM loop once the op's whole assistant
    /// batch is answered, then check completion.
    async fn settle_op(
        &self,
        turn_id: Uuid,
        tool_call_id: &str,
        outcome: ToolOutcome,
    ) -> Result<()> {
        let Some(turn) = self.stores.turns.get(turn_id) else {
            self.ignore_callback(turn_id, "turn not found");
            return Ok(());
        };

        // A redelivered result is inert: the op is already terminal.
        if self
            .stores
            .async_ops
            .get(tool_call_id)
            .is_some_and(|op| op.status.is_terminal())
        {
            return self.maybe_complete_turn(turn_id, None).await;
        }

        self.stores
            .moves
            .record_result(turn_id, tool_call_id, outcome.clone());
        if outcome.success {
            self.stores
                .async_ops
                .complete(tool_call_id, outcome.result.unwrap_or(Value::Null));
        } else if let Some(error) = outcome.error {
            self.stores.async_ops.fail(tool_call_id, error);
        }

        // A sync call gated the loop; re-enter only once every call the
        // assistant emitted alongside it has an answer, whichever order
        // the results arrive in.
        let loop_result = if turn.status.is_terminal() {
            None
        } else {
            match llm_loop::continuation_gate(&self.stores, turn_id, tool_call_id) {
                llm_loop::ContinuationGate::Due => {
                    self.services.sink.emit(TraceEvent::ContinuationStarted {
                        turn_id,
                        tool_call_id: tool_call_id.to_owned(),
                    });
                    let request = llm_loop::build_continuation_request(&self.stores, turn_id);
                    self.run_loop_guarded(&turn, request).await
                }
                llm_loop::ContinuationGate::AwaitingSiblings => {
                    self.services.sink.emit(TraceEvent::ContinuationDeferred {
                        turn_id,
                        tool_call_id: tool_call_id.to_owned(),
                    });
                    None
                }
                llm_loop::ContinuationGate::NotGated => None,
            }
        };

        self.maybe_complete_turn(turn_id, loop_result).await
    }

    /// Run one loop iteration; on error fail the turn (notifying any
    /// parent) instead of propagating.
    async fn run_loop_guarded(&self, turn: &Turn, request: cq_llm::LlmRequest) -> Option<LoopResult> {
        let persona = match self.persona_for_turn(turn).await {
            Ok(persona) => persona,
            Err(e) => {
                self.fail_turn(turn.id, "INTERNAL_ERROR", &e.to_string()).await;
                return None;
            }
        };
        let token_sink = self.token_sinks.lock().get(&turn.id).cloned();
        match llm_loop::run_llm_loop(&self.ctx(), turn.id, request, &persona, token_sink).await {
            Ok(loop_result) => Some(loop_result),
            Err(e) => {
                self.fail_turn(turn.id, "INTERNAL_ERROR", &e.to_string()).await;
                None
            }
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Completion
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Finalize the turn when every obligation is discharged: nothing
    /// waiting, nothing pending. Completion happens at most once — the
    /// actor's serialization makes the check-then-complete race-free.
    async fn maybe_complete_turn(
        &self,
        turn_id: Uuid,
        loop_result: Option<LoopResult>,
    ) -> Result<()> {
        if let Some(loop_result) = &loop_result {
            if loop_result.waiting_for_sync {
                return Ok(());
            }
        }
        if self.stores.async_ops.has_waiting(turn_id) {
            return Ok(());
        }
        if self.stores.async_ops.get_pending_count(turn_id) > 0 {
            return Ok(());
        }
        let Some(turn) = self.stores.turns.get(turn_id) else {
            return Ok(());
        };
        if turn.status.is_terminal() {
            return Ok(());
        }

        let persona = self.persona_for_turn(&turn).await?;
        let ctx = self.ctx();

        // 1. Mine the transcript for long-term memory, when configured.
        if let Some(workflow) = &persona.memory_extraction {
            let transcript = self.stores.moves.get_for_turn(turn_id);
            let plan = planner::decide_memory_extraction(
                turn_id,
                &persona.agent_id,
                &transcript,
                workflow,
            );
            for event in plan.events {
                self.services.sink.emit(event);
            }
            dispatch::apply_decisions(plan.decisions, &ctx).await;
        }

        // 2. Tool failures become a completion issue, not a turn failure.
        let tool_failures = self
            .stores
            .moves
            .get_for_turn(turn_id)
            .iter()
            .filter(|m| m.tool_result.as_ref().is_some_and(|r| !r.success))
            .count() as u32;
        let issues = (tool_failures > 0).then_some(TurnIssues { tool_failures });

        // 3. Complete.
        dispatch::apply_decisions(vec![Decision::CompleteTurn { turn_id, issues }], &ctx).await;
        self.token_sinks.lock().remove(&turn_id);

        // 4. Tell whoever was waiting on this turn.
        let final_reasoning = self
            .stores
            .moves
            .get_latest(turn_id)
            .and_then(|m| m.reasoning)
            .unwrap_or_default();
        self.notify_parent(&turn, Ok(final_reasoning));
        Ok(())
    }

    /// Fail the turn and notify any parent. Used for the fatal-per-turn
    /// conditions: context assembly failure, adapter failure, loop cap.
    async fn fail_turn(&self, turn_id: Uuid, code: &str, message: &str) {
        dispatch::apply_decisions(
            vec![Decision::FailTurn {
                turn_id,
                code: code.to_owned(),
                message: message.to_owned(),
            }],
            &self.ctx(),
        )
        .await;
        self.token_sinks.lock().remove(&turn_id);
        if let Some(turn) = self.stores.turns.get(turn_id) {
            self.notify_parent(&turn, Err(message.to_owned()));
        }
    }

    /// Fire the parent callbacks embedded in the turn input, if any.
    /// Fire-and-forget: a failed notification is traced, never thrown.
    fn notify_parent(&self, turn: &Turn, outcome: std::result::Result<String, String>) {
        let turn_id = turn.id;

        if let Some(cb) = envelope::extract::<AgentCallback>(&turn.input, AGENT_CALLBACK_KEY) {
            let agents = self.agents.clone();
            let sink = self.services.sink.clone();
            let outcome = outcome.clone();
            tokio::spawn(async move {
                let sent = match &outcome {
                    Ok(response) => {
                        agents
                            .handle_agent_response(
                                &cb.conversation_id,
                                cb.turn_id,
                                &cb.tool_call_id,
                                response.clone(),
                            )
                            .await
                    }
                    Err(error) => {
                        agents
                            .handle_agent_error(
                                &cb.conversation_id,
                                cb.turn_id,
                                &cb.tool_call_id,
                                error.clone(),
                            )
                            .await
                    }
                };
                match sent {
                    Ok(()) => sink.emit(TraceEvent::ParentNotified {
                        turn_id,
                        parent_conversation_id: cb.conversation_id,
                    }),
                    Err(e) => sink.emit(TraceEvent::ParentNotifyFailed {
                        turn_id,
                        error: e.to_string(),
                    }),
                }
            });
        }

        if let Some(cb) = envelope::extract::<WorkflowCallback>(&turn.input, WORKFLOW_CALLBACK_KEY)
        {
            let workflows = self.services.workflows.clone();
            let sink = self.services.sink.clone();
            let payload = match &outcome {
                Ok(response) => json!({ "response": response }),
                Err(error) => json!({ "error": error }),
            };
            tokio::spawn(async move {
                if let Err(e) = workflows
                    .handle_agent_result(&cb.run_id, &cb.node_id, payload)
                    .await
                {
                    sink.emit(TraceEvent::ParentNotifyFailed {
                        turn_id,
                        error: e.to_string(),
                    });
                }
            });
        }
    }

    fn ignore_callback(&self, turn_id: Uuid, reason: &'static str) {
        tracing::warn!(%turn_id, reason, "dropping callback");
        self.services
            .sink
            .emit(TraceEvent::CallbackIgnored { turn_id, reason });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The user-visible text of an opaque turn input: its `message` field
/// when present, otherwise the whole payload.
fn user_message_of(input: &Value) -> String {
    match input.get("message").and_then(Value::as_str) {
        Some(message) => message.to_owned(),
        None => match input {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_extraction() {
        assert_eq!(
            user_message_of(&json!({"message": "hi there"})),
            "hi there"
        );
        assert_eq!(user_message_of(&json!("plain text")), "plain text");
        let fallback = user_message_of(&json!({"payload": 1}));
        assert!(fallback.contains("payload"));
    }
}
