//! The dispatcher — applies decisions one at a time, translating each
//! into a store mutation or an outbound call.
//!
//! Fail-soft: an error in one decision is captured and iteration
//! continues. Outbound calls are fired and forgotten; their failures
//! become trace events, never exceptions. Results come back through the
//! actor's callback entry points, not here.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::Instrument;
use uuid::Uuid;

use cq_domain::async_op::{OpTargetType, RetryPolicy, TrackParams};
use cq_domain::decision::Decision;
use cq_domain::envelope::{self, AgentCallback, RunCallback, RunCallbackKind};
use cq_domain::error::{Error, Result};
use cq_domain::moves::MoveParams;
use cq_domain::participant::ParticipantType;
use cq_domain::tool::{AgentCallMode, ToolCall, ToolError, ToolErrorCode, ToolOutcome};
use cq_domain::trace::TraceEvent;
use cq_domain::turn::Caller;
use cq_stores::ConversationStores;

use crate::alarm::AlarmSlot;
use crate::external::{AgentRouter, Services, TaskRequest, WorkflowRef};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context and outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a decision needs to take effect, borrowed from the actor
/// for the duration of one `apply_decisions` call.
pub struct DispatchCtx<'a> {
    pub conversation_id: &'a str,
    /// The conversation's owning agent; delegate children see it as
    /// their caller.
    pub agent_id: &'a str,
    pub branch_context: Option<&'a Value>,
    pub stores: &'a ConversationStores,
    pub services: &'a Services,
    pub agents: &'a Arc<dyn AgentRouter>,
    pub alarm: &'a AlarmSlot,
}

#[derive(Debug, Default)]
pub struct ApplyOutcome {
    pub applied: usize,
    pub turns_created: Vec<Uuid>,
    pub errors: Vec<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// apply_decisions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn apply_decisions(decisions: Vec<Decision>, ctx: &DispatchCtx<'_>) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();
    for decision in decisions {
        let turn_id = decision_turn_id(&decision);
        match apply_one(decision, ctx, &mut outcome).await {
            Ok(()) => outcome.applied += 1,
            Err(e) => {
                let error = e.to_string();
                ctx.services.sink.emit(TraceEvent::DecisionError {
                    turn_id,
                    error: error.clone(),
                });
                outcome.errors.push(error);
            }
        }
    }
    outcome
}

fn decision_turn_id(decision: &Decision) -> Option<Uuid> {
    match decision {
        Decision::StartTurn { .. } => None,
        Decision::CompleteTurn { turn_id, .. }
        | Decision::FailTurn { turn_id, .. }
        | Decision::AppendMessage { turn_id, .. }
        | Decision::RecordMove { turn_id, .. }
        | Decision::AsyncOpCompleted { turn_id, .. }
        | Decision::MarkWaiting { turn_id, .. }
        | Decision::ResumeFromTool { turn_id, .. }
        | Decision::DispatchTask { turn_id, .. }
        | Decision::DispatchWorkflow { turn_id, .. }
        | Decision::DispatchAgent { turn_id, .. }
        | Decision::DispatchContextAssembly { turn_id }
        | Decision::DispatchMemoryExtraction { turn_id, .. } => Some(*turn_id),
    }
}

async fn apply_one(
    decision: Decision,
    ctx: &DispatchCtx<'_>,
    outcome: &mut ApplyOutcome,
) -> Result<()> {
    match decision {
        Decision::StartTurn { caller, input, .. } => {
            let turn_id = ctx.stores.turns.create(caller, input);
            outcome.turns_created.push(turn_id);
            Ok(())
        }

        Decision::CompleteTurn { turn_id, issues } => {
            ctx.stores.turns.complete(turn_id, issues);
            Ok(())
        }

        Decision::FailTurn {
            turn_id,
            code,
            message,
        } => {
            ctx.stores.turns.fail(turn_id, &code, &message);
            Ok(())
        }

        Decision::AppendMessage {
            turn_id,
            role,
            content,
        } => {
            ctx.stores.messages.append(turn_id, role, content);
            Ok(())
        }

        Decision::RecordMove {
            turn_id,
            reasoning,
            raw_content,
        } => {
            ctx.stores.moves.record(MoveParams {
                turn_id,
                reasoning,
                tool_call: None,
                raw_content,
            });
            Ok(())
        }

        Decision::AsyncOpCompleted {
            turn_id,
            op_id,
            outcome: op_outcome,
        } => {
            if ctx.stores.async_ops.get(&op_id).is_some() {
                if op_outcome.success {
                    ctx.stores
                        .async_ops
                        .complete(&op_id, op_outcome.result.unwrap_or(Value::Null));
                } else if let Some(error) = op_outcome.error {
                    ctx.stores.async_ops.fail(&op_id, error);
                }
            } else {
                // Synthetic result for a call that never dispatched.
                ctx.stores
                    .async_ops
                    .record_synthetic(turn_id, &op_id, &op_outcome);
            }
            Ok(())
        }

        Decision::MarkWaiting { turn_id, op_id } => {
            ctx.stores.async_ops.mark_waiting(turn_id, &op_id);
            Ok(())
        }

        Decision::ResumeFromTool { op_id, result, .. } => {
            ctx.stores.async_ops.resume(&op_id, result);
            Ok(())
        }

        Decision::DispatchTask {
            turn_id,
            tool_call,
            task_id,
            reasoning,
            raw_content,
            timeout_ms,
            retry,
            is_async: _,
        } => {
            ctx.stores.moves.record(MoveParams {
                turn_id,
                reasoning,
                tool_call: Some(tool_call.clone()),
                raw_content,
            });
            ctx.services.sink.emit(TraceEvent::TaskDispatched {
                turn_id,
                tool_call_id: tool_call.call_id.clone(),
                task_id: task_id.clone(),
            });
            track_and_alarm(
                ctx,
                turn_id,
                &tool_call.call_id,
                OpTargetType::Task,
                &task_id,
                timeout_ms,
                retry,
            );

            let request = TaskRequest {
                tool_call_id: tool_call.call_id.clone(),
                conversation_id: ctx.conversation_id.to_owned(),
                turn_id,
                task_id,
                input: tool_call.input,
                branch_context: ctx.branch_context.cloned(),
            };
            fire_and_forget(ctx, turn_id, "executor", {
                let executor = ctx.services.executor.clone();
                async move { executor.execute(request).await }
            });
            Ok(())
        }

        Decision::DispatchWorkflow {
            turn_id,
            tool_call,
            workflow_id,
            reasoning,
            raw_content,
            timeout_ms,
            retry,
            is_async: _,
        } => {
            let callback = RunCallback {
                conversation_id: ctx.conversation_id.to_owned(),
                turn_id,
                tool_call_id: Some(tool_call.call_id.clone()),
                kind: RunCallbackKind::Workflow,
            };
            let input = envelope::embed(
                tool_call.input.clone(),
                envelope::RUN_CALLBACK_KEY,
                serde_json::to_value(&callback)?,
            );

            ctx.stores.moves.record(MoveParams {
                turn_id,
                reasoning,
                tool_call: Some(tool_call.clone()),
                raw_content,
            });

            let run_id = match ctx
                .services
                .workflows
                .create_run(&WorkflowRef::Id(workflow_id.clone()), input)
                .await
            {
                Ok(run_id) => run_id,
                Err(e) => {
                    let message = format!("create run for {workflow_id}: {e}");
                    fail_dispatch(ctx, turn_id, &tool_call.call_id, &message);
                    return Err(Error::Workflow(message));
                }
            };

            ctx.services.sink.emit(TraceEvent::WorkflowDispatched {
                turn_id,
                tool_call_id: tool_call.call_id.clone(),
                workflow_run_id: run_id.clone(),
            });
            track_and_alarm(
                ctx,
                turn_id,
                &tool_call.call_id,
                OpTargetType::Workflow,
                &workflow_id,
                timeout_ms,
                retry,
            );
            fire_and_forget(ctx, turn_id, "coordinator", {
                let workflows = ctx.services.workflows.clone();
                async move { workflows.start_run(&run_id).await }
            });
            Ok(())
        }

        Decision::DispatchAgent {
            turn_id,
            tool_call,
            agent_id,
            mode,
            reasoning,
            raw_content,
            timeout_ms,
            is_async: _,
        } => match mode {
            AgentCallMode::LoopIn => {
                dispatch_loop_in(ctx, turn_id, tool_call, agent_id, reasoning, raw_content).await
            }
            AgentCallMode::Delegate => {
                dispatch_delegate(
                    ctx,
                    turn_id,
                    tool_call,
                    agent_id,
                    reasoning,
                    raw_content,
                    timeout_ms,
                )
                .await
            }
        },

        Decision::DispatchContextAssembly { turn_id } => {
            // Handled directly by the loop driver; trace and move on.
            ctx.services
                .sink
                .emit(TraceEvent::ContextAssemblyDeferred { turn_id });
            Ok(())
        }

        Decision::DispatchMemoryExtraction {
            turn_id,
            agent_id,
            workflow,
            transcript,
        } => {
            let callback = RunCallback {
                conversation_id: ctx.conversation_id.to_owned(),
                turn_id,
                tool_call_id: None,
                kind: RunCallbackKind::MemoryExtraction,
            };
            let input = envelope::embed(
                json!({
                    "agentId": agent_id,
                    "conversationId": ctx.conversation_id,
                    "transcript": transcript,
                }),
                envelope::RUN_CALLBACK_KEY,
                serde_json::to_value(&callback)?,
            );
            let run_id = ctx
                .services
                .workflows
                .create_run(&WorkflowRef::Scoped(workflow), input)
                .await
                .map_err(|e| Error::Workflow(format!("create memory extraction run: {e}")))?;

            ctx.stores.turns.link_memory_extraction(turn_id, &run_id);
            ctx.services.sink.emit(TraceEvent::MemoryExtractionRequested {
                turn_id,
                run_id: run_id.clone(),
            });
            fire_and_forget(ctx, turn_id, "coordinator", {
                let workflows = ctx.services.workflows.clone();
                async move { workflows.start_run(&run_id).await }
            });
            Ok(())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent dispatch variants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Loop-in: the target agent joins this conversation and works inside
/// it. No callback metadata and no op to wait on — the peer's turn runs
/// on its own schedule; its messages surface when its own callbacks
/// land.
async fn dispatch_loop_in(
    ctx: &DispatchCtx<'_>,
    turn_id: Uuid,
    tool_call: ToolCall,
    agent_id: String,
    reasoning: Option<String>,
    raw_content: Option<Value>,
) -> Result<()> {
    ctx.stores.moves.record(MoveParams {
        turn_id,
        reasoning,
        tool_call: Some(tool_call.clone()),
        raw_content,
    });
    ctx.stores
        .participants
        .add(ParticipantType::Agent, &agent_id, Some(turn_id));
    ctx.services.sink.emit(TraceEvent::AgentLoopedIn {
        turn_id,
        agent_id: agent_id.clone(),
    });
    // The call itself resolves immediately; the joined agent's work is
    // not this tool call's result.
    ctx.stores.moves.record_result(
        turn_id,
        &tool_call.call_id,
        ToolOutcome::ok(json!({"joined": agent_id})),
    );

    let conversation_id = ctx.conversation_id.to_owned();
    fire_and_forget(ctx, turn_id, "peer agent", {
        let agents = ctx.agents.clone();
        let input = tool_call.input;
        async move {
            agents
                .start_turn(&conversation_id, input, Caller::Agent { agent_id })
                .await
                .map(|_| ())
        }
    });
    Ok(())
}

/// Delegate: a fresh conversation is created for the target agent, with
/// the parent's reply address embedded in the input. The child's
/// completion fires `handle_agent_response` on this actor.
async fn dispatch_delegate(
    ctx: &DispatchCtx<'_>,
    turn_id: Uuid,
    tool_call: ToolCall,
    agent_id: String,
    reasoning: Option<String>,
    raw_content: Option<Value>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let callback = AgentCallback {
        conversation_id: ctx.conversation_id.to_owned(),
        turn_id,
        tool_call_id: tool_call.call_id.clone(),
    };
    let input = envelope::embed(
        tool_call.input.clone(),
        envelope::AGENT_CALLBACK_KEY,
        serde_json::to_value(&callback)?,
    );

    ctx.stores.moves.record(MoveParams {
        turn_id,
        reasoning,
        tool_call: Some(tool_call.clone()),
        raw_content,
    });

    let child = match ctx.services.defs.create_conversation(&agent_id).await {
        Ok(child) => child,
        Err(e) => {
            let message = format!("create conversation for {agent_id}: {e}");
            fail_dispatch(ctx, turn_id, &tool_call.call_id, &message);
            return Err(Error::Definitions(message));
        }
    };

    ctx.services.sink.emit(TraceEvent::AgentDelegated {
        turn_id,
        agent_id: agent_id.clone(),
        child_conversation_id: child.conversation_id.clone(),
    });
    track_and_alarm(
        ctx,
        turn_id,
        &tool_call.call_id,
        OpTargetType::Agent,
        &agent_id,
        timeout_ms,
        None,
    );

    let caller_agent = ctx.agent_id.to_owned();
    fire_and_forget(ctx, turn_id, "peer agent", {
        let agents = ctx.agents.clone();
        async move {
            agents
                .start_turn(
                    &child.conversation_id,
                    input,
                    Caller::Agent {
                        agent_id: caller_agent,
                    },
                )
                .await
                .map(|_| ())
        }
    });
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Answer a tool call whose dispatch never reached its target: the
/// recorded move gets a failure result and a synthetic terminal op is
/// written, so continuation and the completion check see the call as
/// resolved instead of silently unanswered.
fn fail_dispatch(ctx: &DispatchCtx<'_>, turn_id: Uuid, tool_call_id: &str, message: &str) {
    let outcome = ToolOutcome::err(ToolError::new(
        ToolErrorCode::ExecutionFailed,
        message,
        false,
    ));
    ctx.stores
        .moves
        .record_result(turn_id, tool_call_id, outcome.clone());
    ctx.stores
        .async_ops
        .record_synthetic(turn_id, tool_call_id, &outcome);
}

/// Track the op for a dispatch and arm the alarm for its deadline. The
/// sync-tool timeout default is the one policy number the dispatcher
/// owns.
fn track_and_alarm(
    ctx: &DispatchCtx<'_>,
    turn_id: Uuid,
    tool_call_id: &str,
    target_type: OpTargetType,
    target_id: &str,
    timeout_ms: Option<u64>,
    retry: Option<RetryPolicy>,
) {
    let timeout_ms = timeout_ms.unwrap_or(ctx.services.config.engine.sync_tool_timeout_ms);
    let timeout_at = Utc::now() + chrono::Duration::milliseconds(timeout_ms as i64);
    let retry = retry.or_else(|| {
        let defaults = &ctx.services.config.retry;
        (defaults.max_attempts > 1).then_some(RetryPolicy {
            max_attempts: defaults.max_attempts,
            backoff_ms: defaults.backoff_ms,
        })
    });
    ctx.stores.async_ops.track(TrackParams {
        op_id: tool_call_id.to_owned(),
        turn_id,
        target_type,
        target_id: target_id.to_owned(),
        timeout_at: Some(timeout_at),
        retry,
    });
    ctx.alarm.schedule(timeout_at);
}

/// Spawn an outbound call without tying its result to this callback.
/// Failures become trace events.
fn fire_and_forget<F>(ctx: &DispatchCtx<'_>, turn_id: Uuid, target: &'static str, fut: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let sink = ctx.services.sink.clone();
    let span = tracing::info_span!("outbound", %turn_id, target);
    tokio::spawn(
        async move {
            if let Err(e) = fut.await {
                tracing::warn!(error = %e, target, "outbound call failed");
                sink.emit(TraceEvent::OutboundCallFailed {
                    turn_id,
                    target: target.to_owned(),
                    error: e.to_string(),
                });
            }
        }
        .instrument(span),
    );
}
