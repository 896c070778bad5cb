//! The loop driver — one LLM iteration per invocation.
//!
//! There is no inner while-loop here: a sync tool result re-enters
//! through the actor's callback, which rebuilds the continuation request
//! from the store and calls [`run_llm_loop`] again. That makes every
//! iteration resumable after a restart.

use serde_json::Value;
use uuid::Uuid;

use cq_domain::content::{tool_result_block, ChatMessage};
use cq_domain::error::{Error, Result};
use cq_domain::message::MessageRole;
use cq_domain::moves::Move;
use cq_domain::persona::Persona;
use cq_domain::tool::ToolOutcome;
use cq_domain::trace::TraceEvent;
use cq_llm::{LlmRequest, LlmResponse, StopReason, TokenSink};
use cq_stores::ConversationStores;

use crate::dispatch::{self, DispatchCtx};
use crate::planner;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What one iteration left behind: whether a synchronous dispatch now
/// blocks the turn, and how many fire-and-forget ops are in flight.
#[derive(Debug, Clone, Copy)]
pub struct LoopResult {
    pub waiting_for_sync: bool,
    pub pending_async_ops: usize,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_llm_loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one LLM iteration for a turn: resolve the tool catalog, call the
/// adapter, plan, apply, and flag synchronous dispatches as waiting.
///
/// Errors propagate; the turn engine owns failing the turn (and
/// notifying any parent) when an iteration cannot run.
pub async fn run_llm_loop(
    ctx: &DispatchCtx<'_>,
    turn_id: Uuid,
    request: LlmRequest,
    persona: &Persona,
    token_sink: Option<TokenSink>,
) -> Result<LoopResult> {
    let stores = ctx.stores;

    // Runaway-loop bound: a turn that keeps calling tools is cut off.
    let max_moves = ctx.services.config.engine.max_moves_per_turn as usize;
    if stores.moves.get_for_turn(turn_id).len() >= max_moves {
        return Err(Error::Other(format!(
            "tool loop limit reached ({max_moves} iterations)"
        )));
    }

    let defs = ctx.services.defs.tools(&persona.tool_ids).await?;
    let catalog = planner::resolve_tools(&defs);

    let response = call_llm(ctx, turn_id, &request, &catalog, token_sink).await?;

    let plan = planner::interpret_response(turn_id, &response, &catalog);
    for event in plan.events {
        ctx.services.sink.emit(event);
    }

    let sync_ops: Vec<String> = plan
        .decisions
        .iter()
        .filter(|d| d.is_sync_dispatch())
        .filter_map(|d| d.tool_call_id().map(String::from))
        .collect();

    let outcome = dispatch::apply_decisions(plan.decisions, ctx).await;
    if !outcome.errors.is_empty() {
        tracing::warn!(
            %turn_id,
            errors = outcome.errors.len(),
            "some decisions failed to apply"
        );
    }

    // Flag each sync dispatch as blocking the turn. A dispatch that
    // failed to apply never tracked its op; flagging it anyway would
    // leave a wait nothing can ever discharge.
    let mut waiting = 0usize;
    for op_id in &sync_ops {
        if stores.async_ops.get(op_id).is_some() && stores.async_ops.mark_waiting(turn_id, op_id)
        {
            waiting += 1;
        }
    }

    Ok(LoopResult {
        waiting_for_sync: waiting > 0,
        pending_async_ops: stores.async_ops.get_pending_count(turn_id),
    })
}

/// Route to the right adapter variant. A continuation (raw messages) has
/// exactly one shape; fresh requests stream when a token sink is
/// attached.
async fn call_llm(
    ctx: &DispatchCtx<'_>,
    turn_id: Uuid,
    request: &LlmRequest,
    catalog: &planner::ToolCatalog,
    token_sink: Option<TokenSink>,
) -> Result<LlmResponse> {
    let llm = &ctx.services.llm;
    let result = if request.is_raw() {
        llm.call_raw(request, &catalog.specs).await
    } else if let Some(on_token) = token_sink {
        llm.call_streaming(request, &catalog.specs, on_token).await
    } else {
        llm.call(request, &catalog.specs).await
    };

    match result {
        Ok(response) => {
            ctx.services.sink.emit(TraceEvent::LlmCallCompleted {
                turn_id,
                stop_reason: match response.stop_reason {
                    StopReason::EndTurn => "end_turn".to_owned(),
                    StopReason::ToolUse => "tool_use".to_owned(),
                    StopReason::MaxTokens => "max_tokens".to_owned(),
                },
                tool_calls: response.tool_use.len(),
            });
            Ok(response)
        }
        Err(e) => {
            ctx.services.sink.emit(TraceEvent::LlmCallFailed {
                turn_id,
                error: e.to_string(),
            });
            Err(e)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Continuation gating
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Whether a freshly settled tool call should re-enter the LLM loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationGate {
    /// A synchronous call gates the loop and every call in its
    /// assistant batch has a result.
    Due,
    /// The batch gates the loop, but sibling calls are still in flight.
    AwaitingSiblings,
    /// Nothing in the batch gates the loop.
    NotGated,
}

/// Classify a settled call against its assistant batch — the group of
/// tool_use ids one LLM iteration emitted, read from the raw content on
/// the batch's first move.
///
/// The loop re-enters only when the batch contains a synchronous call
/// and every id in it is resolved: the continuation must answer all of
/// an assistant turn's tool_use blocks, so firing while a sibling is
/// still in flight would build a malformed request.
pub fn continuation_gate(
    stores: &ConversationStores,
    turn_id: Uuid,
    tool_call_id: &str,
) -> ContinuationGate {
    let moves = stores.moves.get_for_turn(turn_id);
    let batch = match batch_tool_use_ids(&moves, tool_call_id) {
        Some(ids) if !ids.is_empty() => ids,
        // No raw content to rebuild from; judge the settled call alone.
        _ => vec![tool_call_id.to_owned()],
    };

    let gates = batch
        .iter()
        .any(|id| stores.async_ops.get(id).is_some_and(|op| op.sync));
    if !gates {
        return ContinuationGate::NotGated;
    }
    let resolved = batch.iter().all(|id| id_resolved(stores, &moves, id));
    if resolved {
        ContinuationGate::Due
    } else {
        ContinuationGate::AwaitingSiblings
    }
}

/// A call is resolved when its move carries a result, or — for calls
/// that never dispatched — when its synthetic op row is terminal.
fn id_resolved(stores: &ConversationStores, moves: &[Move], tool_call_id: &str) -> bool {
    moves.iter().any(|m| {
        m.tool_call
            .as_ref()
            .is_some_and(|tc| tc.call_id == tool_call_id)
            && m.tool_result.is_some()
    }) || stores
        .async_ops
        .get(tool_call_id)
        .is_some_and(|op| op.status.is_terminal())
}

/// The tool_use ids of the assistant batch containing `tool_call_id`:
/// the raw content of the nearest raw-bearing move at or before the
/// move that carries the call.
fn batch_tool_use_ids(moves: &[Move], tool_call_id: &str) -> Option<Vec<String>> {
    let position = moves.iter().position(|m| {
        m.tool_call
            .as_ref()
            .is_some_and(|tc| tc.call_id == tool_call_id)
    })?;
    let raw = moves[..=position]
        .iter()
        .rev()
        .find_map(|m| m.raw_content.as_ref())?;
    Some(tool_use_ids(raw))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Continuation rebuild
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Rebuild the provider request for a turn from the store alone:
/// the turn's user message, then one assistant message per move that
/// retained raw content, each followed by a user message holding the
/// tool_result blocks for that assistant turn's tool_use ids.
///
/// Results come from move rows; calls that never dispatched (unknown
/// tool, rejected input) contribute their synthetic op outcome instead,
/// so the model sees an answer for every tool_use id it emitted.
pub fn build_continuation_request(stores: &ConversationStores, turn_id: Uuid) -> LlmRequest {
    let mut messages = Vec::new();

    if let Some(user) = stores
        .messages
        .get_for_turn(turn_id)
        .into_iter()
        .find(|m| m.role == MessageRole::User)
    {
        messages.push(ChatMessage::user(user.content));
    }

    let moves = stores.moves.get_for_turn(turn_id);
    for mv in moves.iter().filter(|m| m.raw_content.is_some()) {
        let raw = mv.raw_content.clone().unwrap_or(Value::Null);
        let ids = tool_use_ids(&raw);
        messages.push(ChatMessage::assistant_blocks(raw));

        let mut blocks = Vec::new();
        for id in &ids {
            if let Some(block) = result_block_for(stores, &moves, id) {
                blocks.push(block);
            }
        }
        if !blocks.is_empty() {
            messages.push(ChatMessage::user_blocks(Value::Array(blocks)));
        }
    }

    LlmRequest { messages }
}

/// The tool_result block for one tool_use id, from the move that carried
/// the call or from the op table for calls without a move.
fn result_block_for(
    stores: &ConversationStores,
    moves: &[Move],
    tool_call_id: &str,
) -> Option<Value> {
    let from_move = moves
        .iter()
        .find(|m| {
            m.tool_call
                .as_ref()
                .is_some_and(|tc| tc.call_id == tool_call_id)
        })
        .and_then(|m| m.tool_result.clone());

    let outcome = match from_move {
        Some(outcome) => outcome,
        None => {
            let op = stores.async_ops.get(tool_call_id)?;
            if !op.status.is_terminal() {
                return None;
            }
            match op.error {
                Some(error) => ToolOutcome::err(error),
                None => ToolOutcome::ok(op.result.unwrap_or(Value::Null)),
            }
        }
    };

    Some(if outcome.success {
        let content =
            serde_json::to_string(&outcome.result.unwrap_or(Value::Null)).unwrap_or_default();
        tool_result_block(tool_call_id, content, false)
    } else {
        let message = outcome
            .error
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown error".to_owned());
        tool_result_block(tool_call_id, format!("Error: {message}"), true)
    })
}

/// Ids of the tool_use blocks inside a raw assistant content array.
fn tool_use_ids(raw: &Value) -> Vec<String> {
    raw.as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
                .filter_map(|b| b.get("id").and_then(Value::as_str).map(String::from))
                .collect()
        })
        .unwrap_or_default()
}
