//! End-to-end turn scenarios against a directly-driven engine: text
//! turns, sync and async tools, timeouts, unknown tools, and delegate
//! callbacks.

mod common;

use common::*;

use serde_json::json;

use cq_domain::async_op::OpStatus;
use cq_domain::content::MessageContent;
use cq_domain::message::MessageRole;
use cq_domain::tool::{AgentCallMode, ToolErrorCode};
use cq_domain::participant::ParticipantType;
use cq_domain::turn::{Caller, TurnStatus};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Text-only turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn text_only_turn_completes_without_issues() {
    let h = Harness::new(vec![], vec![text_response("hello")]);
    let turn_id = h.start_and_assemble("hi").await;

    let turn = h.engine.stores().turns.get(turn_id).unwrap();
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.tool_failures, 0);

    // One user message in, one agent message out.
    let messages = h.engine.stores().messages.get_for_turn(turn_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, MessageRole::User);
    assert_eq!(messages[0].content, "hi");
    assert_eq!(messages[1].role, MessageRole::Agent);
    assert_eq!(messages[1].content, "hello");

    // The final move carries the reasoning.
    let moves = h.engine.stores().moves.get_for_turn(turn_id);
    assert_eq!(moves.len(), 1);
    assert_eq!(moves[0].reasoning.as_deref(), Some("hello"));

    assert_eq!(h.llm.call_count(), 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Single synchronous tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn sync_tool_blocks_then_continues() {
    let h = Harness::new(
        vec![task_tool("t-search", "search", false)],
        vec![
            tool_response(None, &[("c1", "search", json!({"q": "x"}))]),
            text_response("done"),
        ],
    );
    let turn_id = h.start_and_assemble("find x").await;

    // After the first iteration the turn is blocked on c1.
    let op = h.engine.stores().async_ops.get("c1").unwrap();
    assert_eq!(op.status, OpStatus::Waiting);
    let turn = h.engine.stores().turns.get(turn_id).unwrap();
    assert_eq!(turn.status, TurnStatus::Active);

    // The executor was handed the call with its idempotency key.
    eventually(|| h.executor.requests.lock().len() == 1).await;
    {
        let requests = h.executor.requests.lock();
        assert_eq!(requests[0].tool_call_id, "c1");
        assert_eq!(requests[0].task_id, "task-search");
        assert_eq!(requests[0].input, json!({"q": "x"}));
    }

    // Dispatch traces precede op tracking, which precedes the wait flag.
    let names = h.sink.names();
    let dispatched = names.iter().position(|n| n == "TaskDispatched").unwrap();
    let tracked = names.iter().position(|n| n == "AsyncOpTracked").unwrap();
    let waiting = names.iter().position(|n| n == "AsyncOpWaiting").unwrap();
    assert!(dispatched < tracked && tracked < waiting);

    // Result lands: continuation runs and the turn completes.
    h.engine
        .handle_task_result(turn_id, "c1", json!("ok"))
        .await
        .unwrap();

    assert_eq!(h.llm.call_count(), 2);
    assert_eq!(h.llm.kind_at(1), CallKind::Raw);
    let continuation = h.llm.request_at(1);
    assert_eq!(continuation.messages.len(), 3);
    // user, assistant raw blocks, tool_result pair.
    match &continuation.messages[1].content {
        MessageContent::Blocks(blocks) => {
            assert_eq!(blocks[0]["id"], json!("c1"));
        }
        other => panic!("expected raw assistant blocks, got {other:?}"),
    }
    match &continuation.messages[2].content {
        MessageContent::Blocks(blocks) => {
            assert_eq!(blocks[0]["type"], json!("tool_result"));
            assert_eq!(blocks[0]["tool_use_id"], json!("c1"));
            assert_eq!(blocks[0]["content"], json!("\"ok\""));
        }
        other => panic!("expected tool_result blocks, got {other:?}"),
    }

    let turn = h.engine.stores().turns.get(turn_id).unwrap();
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.tool_failures, 0);
    assert_eq!(h.engine.stores().async_ops.get("c1").unwrap().status, OpStatus::Completed);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Asynchronous workflow tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn async_workflow_keeps_turn_active_without_blocking() {
    let h = Harness::new(
        vec![workflow_tool("t-research", "research", true)],
        vec![tool_response(None, &[("c1", "research", json!({}))])],
    );
    let turn_id = h.start_and_assemble("research this").await;

    // Dispatched but not waiting: the op is pending and the turn stays
    // active with no further LLM call yet.
    let op = h.engine.stores().async_ops.get("c1").unwrap();
    assert_eq!(op.status, OpStatus::Pending);
    assert_eq!(h.engine.stores().async_ops.get_pending_count(turn_id), 1);
    assert_eq!(
        h.engine.stores().turns.get(turn_id).unwrap().status,
        TurnStatus::Active
    );

    // Two runs exist: context assembly, then the tool's workflow with
    // its reply envelope.
    {
        let created = h.workflows.created.lock();
        assert_eq!(created.len(), 2);
        let callback = &created[1].input["_callback"];
        assert_eq!(callback["type"], json!("workflow"));
        assert_eq!(callback["toolCallId"], json!("c1"));
        assert_eq!(callback["conversationId"], json!(CONV_ID));
    }

    // Late result: no continuation, just completion.
    h.engine
        .handle_workflow_result(turn_id, "c1", json!({"findings": 3}))
        .await
        .unwrap();

    assert_eq!(h.llm.call_count(), 1, "async results do not re-enter the loop");
    assert_eq!(
        h.engine.stores().turns.get(turn_id).unwrap().status,
        TurnStatus::Completed
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeout then resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn timed_out_sync_tool_resumes_with_error_result() {
    let mut tool = task_tool("t-slow", "slow_search", false);
    tool.timeout_ms = Some(30);
    let h = Harness::new(
        vec![tool],
        vec![
            tool_response(None, &[("c1", "slow_search", json!({"q": "x"}))]),
            text_response("worked around it"),
        ],
    );
    let turn_id = h.start_and_assemble("find slowly").await;
    assert_eq!(
        h.engine.stores().async_ops.get("c1").unwrap().status,
        OpStatus::Waiting
    );

    // Let the deadline pass, then run the sweep the alarm would run.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    h.engine.handle_alarm().await.unwrap();

    // The op failed with a retriable TIMEOUT and the loop continued
    // with the error surfaced as a tool_result.
    let op = h.engine.stores().async_ops.get("c1").unwrap();
    assert_eq!(op.status, OpStatus::Failed);
    let error = op.error.unwrap();
    assert_eq!(error.code, ToolErrorCode::Timeout);
    assert!(error.retriable);

    assert_eq!(h.llm.call_count(), 2);
    let continuation = h.llm.request_at(1);
    match &continuation.messages[2].content {
        MessageContent::Blocks(blocks) => {
            assert_eq!(blocks[0]["is_error"], json!(true));
            let content = blocks[0]["content"].as_str().unwrap();
            assert!(content.starts_with("Error: "));
        }
        other => panic!("expected tool_result blocks, got {other:?}"),
    }

    // The turn completed normally, with the failure counted as an issue.
    let turn = h.engine.stores().turns.get(turn_id).unwrap();
    assert_eq!(turn.status, TurnStatus::Completed);
    assert_eq!(turn.tool_failures, 1);

    // Nothing left to time out.
    assert!(h.engine.stores().async_ops.get_earliest_timeout().is_none());
    assert!(h.engine.alarm().current().is_none());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Unknown tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn unknown_tool_is_rejected_without_dispatch() {
    let h = Harness::new(
        vec![task_tool("t-search", "search", false)],
        vec![tool_response(None, &[("c1", "nope", json!({}))])],
    );
    let turn_id = h.start_and_assemble("use a tool I don't have").await;

    // No dispatch of any kind ran.
    assert!(h.executor.requests.lock().is_empty());
    assert!(h.engine.stores().moves.get_for_turn(turn_id).is_empty());

    // Exactly one synthetic NOT_FOUND result exists for the call.
    let op = h.engine.stores().async_ops.get("c1").unwrap();
    assert_eq!(op.status, OpStatus::Failed);
    assert!(op.target_type.is_none());
    assert_eq!(op.error.unwrap().code, ToolErrorCode::NotFound);

    // Nothing blocked the turn, so it completed.
    assert_eq!(
        h.engine.stores().turns.get(turn_id).unwrap().status,
        TurnStatus::Completed
    );
    assert_eq!(h.llm.call_count(), 1);
}

#[tokio::test]
async fn unknown_tool_failure_is_visible_to_continuation() {
    // A valid sync tool plus an unknown one in the same response: the
    // continuation answers both tool_use ids.
    let h = Harness::new(
        vec![task_tool("t-search", "search", false)],
        vec![
            tool_response(
                None,
                &[
                    ("c1", "search", json!({"q": "x"})),
                    ("c2", "nope", json!({})),
                ],
            ),
            text_response("done"),
        ],
    );
    let turn_id = h.start_and_assemble("mixed").await;

    h.engine
        .handle_task_result(turn_id, "c1", json!("found"))
        .await
        .unwrap();

    let continuation = h.llm.request_at(1);
    match &continuation.messages[2].content {
        MessageContent::Blocks(blocks) => {
            assert_eq!(blocks.as_array().unwrap().len(), 2);
            let by_id: Vec<(&str, bool)> = blocks
                .as_array()
                .unwrap()
                .iter()
                .map(|b| {
                    (
                        b["tool_use_id"].as_str().unwrap(),
                        b.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false),
                    )
                })
                .collect();
            assert!(by_id.contains(&("c1", false)));
            assert!(by_id.contains(&("c2", true)));
        }
        other => panic!("expected tool_result blocks, got {other:?}"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invalid input
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn invalid_input_is_rejected_without_dispatch() {
    let h = Harness::new(
        vec![task_tool("t-search", "search", false)],
        // Missing the required "q" key.
        vec![tool_response(None, &[("c1", "search", json!({"wrong": 1}))])],
    );
    let turn_id = h.start_and_assemble("bad input").await;

    assert!(h.executor.requests.lock().is_empty());
    let op = h.engine.stores().async_ops.get("c1").unwrap();
    assert_eq!(op.error.unwrap().code, ToolErrorCode::InvalidInput);
    assert_eq!(
        h.engine.stores().turns.get(turn_id).unwrap().status,
        TurnStatus::Completed
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delegate callback to parent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn completed_turn_reports_final_reasoning_to_parent() {
    let h = Harness::new(vec![], vec![text_response("final")]);
    let parent_turn = Uuid::now_v7();
    let input = json!({
        "message": "do the thing",
        "_agentCallback": {
            "conversationId": "conv-parent",
            "turnId": parent_turn,
            "toolCallId": "pc1"
        }
    });
    let turn_id = h
        .engine
        .start_turn(input, Caller::User, None)
        .await
        .unwrap();
    h.deliver_assembly(turn_id, "do the thing").await;

    assert_eq!(
        h.engine.stores().turns.get(turn_id).unwrap().status,
        TurnStatus::Completed
    );

    // The parent hears exactly once, with the last move's reasoning.
    eventually(|| h.router.responses.lock().len() == 1).await;
    {
        let responses = h.router.responses.lock();
        let (conv, turn, call, reasoning) = &responses[0];
        assert_eq!(conv, "conv-parent");
        assert_eq!(*turn, parent_turn);
        assert_eq!(call, "pc1");
        assert_eq!(reasoning, "final");
    }
    // And only once.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.router.responses.lock().len(), 1);
}

#[tokio::test]
async fn delegate_dispatch_creates_child_and_embeds_callback() {
    let h = Harness::new(
        vec![agent_tool("t-expert", "ask_expert", "expert", AgentCallMode::Delegate)],
        vec![
            tool_response(None, &[("c1", "ask_expert", json!({"message": "help"}))]),
            text_response("summarized"),
        ],
    );
    let turn_id = h.start_and_assemble("consult the expert").await;

    // A fresh child conversation exists and the child turn was routed.
    eventually(|| h.router.started.lock().len() == 1).await;
    {
        let started = h.router.started.lock();
        let (child_conv, input, caller) = &started[0];
        assert_eq!(child_conv, "conv-child-1");
        assert_eq!(input["_agentCallback"]["toolCallId"], json!("c1"));
        assert_eq!(
            input["_agentCallback"]["conversationId"],
            json!(CONV_ID)
        );
        assert_eq!(caller, &Caller::Agent { agent_id: AGENT_ID.to_owned() });
    }

    // Delegate tools are synchronous by default: the turn is blocked.
    assert_eq!(
        h.engine.stores().async_ops.get("c1").unwrap().status,
        OpStatus::Waiting
    );

    // The child's reply resumes the loop and the turn completes.
    h.engine
        .handle_agent_response(turn_id, "c1", "expert says yes".to_owned())
        .await
        .unwrap();
    assert_eq!(
        h.engine.stores().turns.get(turn_id).unwrap().status,
        TurnStatus::Completed
    );
    assert_eq!(h.llm.call_count(), 2);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop-in
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn loop_in_joins_conversation_without_blocking() {
    let h = Harness::new(
        vec![agent_tool("t-helper", "ask_helper", "helper", AgentCallMode::LoopIn)],
        vec![tool_response(None, &[("c1", "ask_helper", json!({"message": "join in"}))])],
    );
    let turn_id = h.start_and_assemble("bring in the helper").await;

    // The helper became a participant of *this* conversation.
    assert!(h
        .engine
        .stores()
        .participants
        .exists(ParticipantType::Agent, "helper"));

    // The peer turn was routed into the same conversation, no callback
    // metadata attached.
    eventually(|| h.router.started.lock().len() == 1).await;
    {
        let started = h.router.started.lock();
        let (conv, input, caller) = &started[0];
        assert_eq!(conv, CONV_ID);
        assert!(input.get("_agentCallback").is_none());
        assert_eq!(caller, &Caller::Agent { agent_id: "helper".to_owned() });
    }

    // Nothing gates the turn on the looped-in agent.
    assert_eq!(
        h.engine.stores().turns.get(turn_id).unwrap().status,
        TurnStatus::Completed
    );
}
