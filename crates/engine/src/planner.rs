//! Decision planning — pure functions from LLM output to dispatch
//! intents. Nothing here touches a store or the network; side effects
//! are the dispatcher's job.

use std::collections::HashMap;

use serde_json::{Map, Value};
use uuid::Uuid;

use cq_domain::decision::Decision;
use cq_domain::message::MessageRole;
use cq_domain::moves::Move;
use cq_domain::persona::MemoryExtractionWorkflow;
use cq_domain::tool::{
    AgentCallMode, ToolCall, ToolDefinition, ToolError, ToolErrorCode, ToolOutcome, ToolSpec,
};
use cq_domain::async_op::OpTargetType;
use cq_domain::trace::TraceEvent;
use cq_llm::LlmResponse;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a planning entry point returns: intents plus the trace events
/// describing how it got there.
#[derive(Debug, Default)]
pub struct PlanOutcome {
    pub decisions: Vec<Decision>,
    pub events: Vec<TraceEvent>,
}

/// The per-persona tool list resolved into provider specs and a lookup
/// keyed by the name the LLM invokes.
#[derive(Debug, Default)]
pub struct ToolCatalog {
    pub specs: Vec<ToolSpec>,
    pub lookup: HashMap<String, ToolDefinition>,
}

pub fn resolve_tools(tools: &[ToolDefinition]) -> ToolCatalog {
    let mut catalog = ToolCatalog::default();
    for def in tools {
        catalog.specs.push(ToolSpec {
            name: def.name.clone(),
            description: def.description.clone(),
            input_schema: def.input_schema.clone(),
        });
        catalog.lookup.insert(def.name.clone(), def.clone());
    }
    catalog
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response interpretation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Convert one LLM response into decisions.
///
/// Text becomes an agent message. Each tool_use block becomes either a
/// dispatch decision or, when the tool is unknown or its input fails
/// schema validation, a synthetic terminal result the LLM can react to
/// on its next iteration. The response's raw content rides on the first
/// dispatch decision so the recorded move can reproduce this assistant
/// turn during continuation.
pub fn interpret_response(
    turn_id: Uuid,
    response: &LlmResponse,
    catalog: &ToolCatalog,
) -> PlanOutcome {
    let mut out = PlanOutcome::default();
    let text = response.text.clone().unwrap_or_default();

    if !text.is_empty() {
        out.events.push(TraceEvent::MessagePlanned {
            turn_id,
            chars: text.len(),
        });
        out.decisions.push(Decision::AppendMessage {
            turn_id,
            role: MessageRole::Agent,
            content: text.clone(),
        });
    }

    if response.tool_use.is_empty() {
        // Final iteration: record the reasoning so the turn's last move
        // carries it (delegate callbacks reply with it).
        out.decisions.push(Decision::RecordMove {
            turn_id,
            reasoning: (!text.is_empty()).then(|| text.clone()),
            raw_content: None,
        });
        return out;
    }

    let mut first_dispatch = true;
    for tu in &response.tool_use {
        let Some(def) = catalog.lookup.get(&tu.name) else {
            out.events.push(TraceEvent::ToolRejected {
                turn_id,
                tool_call_id: tu.id.clone(),
                tool_name: tu.name.clone(),
                code: ToolErrorCode::NotFound,
            });
            out.decisions.push(Decision::AsyncOpCompleted {
                turn_id,
                op_id: tu.id.clone(),
                outcome: ToolOutcome::err(ToolError::new(
                    ToolErrorCode::NotFound,
                    format!("no such tool: {}", tu.name),
                    false,
                )),
            });
            continue;
        };

        if let Err(problems) = validate_input(&def.input_schema, &tu.input) {
            out.events.push(TraceEvent::ToolRejected {
                turn_id,
                tool_call_id: tu.id.clone(),
                tool_name: tu.name.clone(),
                code: ToolErrorCode::InvalidInput,
            });
            let details = Value::Array(
                problems
                    .into_iter()
                    .map(|(path, message)| {
                        serde_json::json!({"path": path, "message": message})
                    })
                    .collect(),
            );
            out.decisions.push(Decision::AsyncOpCompleted {
                turn_id,
                op_id: tu.id.clone(),
                outcome: ToolOutcome::err(
                    ToolError::new(
                        ToolErrorCode::InvalidInput,
                        format!("input for {} failed schema validation", tu.name),
                        false,
                    )
                    .with_details(details),
                ),
            });
            continue;
        }

        let tool_call = ToolCall {
            call_id: tu.id.clone(),
            tool_id: def.tool_id.clone(),
            input: map_input(def.input_mapping.as_ref(), &tu.input),
        };
        out.events.push(TraceEvent::ToolCallPlanned {
            turn_id,
            tool_call_id: tu.id.clone(),
            tool_name: tu.name.clone(),
        });

        // The assistant turn is recorded once, on the first dispatch.
        let (reasoning, raw_content) = if first_dispatch {
            first_dispatch = false;
            (
                (!text.is_empty()).then(|| text.clone()),
                response.raw_content.clone(),
            )
        } else {
            (None, None)
        };

        out.decisions.push(match def.target_type {
            OpTargetType::Task => Decision::DispatchTask {
                turn_id,
                tool_call,
                task_id: def.target_id.clone(),
                reasoning,
                raw_content,
                timeout_ms: def.timeout_ms,
                retry: def.retry,
                is_async: def.is_async,
            },
            OpTargetType::Workflow => Decision::DispatchWorkflow {
                turn_id,
                tool_call,
                workflow_id: def.target_id.clone(),
                reasoning,
                raw_content,
                timeout_ms: def.timeout_ms,
                retry: def.retry,
                is_async: def.is_async,
            },
            OpTargetType::Agent => {
                let mode = def.mode.unwrap_or(AgentCallMode::Delegate);
                Decision::DispatchAgent {
                    turn_id,
                    tool_call,
                    agent_id: def.target_id.clone(),
                    mode,
                    reasoning,
                    raw_content,
                    timeout_ms: def.timeout_ms,
                    // A looped-in agent works inside this conversation on
                    // its own schedule; nothing gates the loop on it.
                    is_async: def.is_async || mode == AgentCallMode::LoopIn,
                }
            }
        });
    }

    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Memory extraction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Plan the post-turn memory-extraction dispatch. Empty transcripts are
/// skipped — there is nothing to mine.
pub fn decide_memory_extraction(
    turn_id: Uuid,
    agent_id: &str,
    transcript: &[Move],
    workflow: &MemoryExtractionWorkflow,
) -> PlanOutcome {
    let mut out = PlanOutcome::default();
    if transcript.is_empty() {
        out.events.push(TraceEvent::MemoryExtractionSkipped {
            turn_id,
            reason: "empty transcript",
        });
        return out;
    }
    out.events.push(TraceEvent::MemoryExtractionPlanned { turn_id });
    out.decisions.push(Decision::DispatchMemoryExtraction {
        turn_id,
        agent_id: agent_id.to_owned(),
        workflow: workflow.clone(),
        transcript: serde_json::to_value(transcript).unwrap_or(Value::Null),
    });
    out
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Input handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate tool input against its JSON Schema. A schema without an
/// explicit `type` is permissive. Returns per-path problems on failure.
fn validate_input(schema: &Value, input: &Value) -> Result<(), Vec<(String, String)>> {
    if schema.get("type").is_none() {
        return Ok(());
    }
    let validator = match jsonschema::validator_for(schema) {
        Ok(v) => v,
        Err(e) => {
            // A malformed schema is a definition-store problem, not the
            // LLM's; treat it as permissive rather than rejecting the
            // call.
            tracing::warn!(error = %e, "tool input schema failed to compile; skipping validation");
            return Ok(());
        }
    };
    let problems: Vec<(String, String)> = validator
        .iter_errors(input)
        .map(|e| (e.instance_path.to_string(), e.to_string()))
        .collect();
    if problems.is_empty() {
        Ok(())
    } else {
        Err(problems)
    }
}

/// Apply the tool's `input_mapping` projection. Keys absent from the
/// source are omitted; without a mapping the input passes through.
fn map_input(mapping: Option<&HashMap<String, String>>, input: &Value) -> Value {
    let Some(mapping) = mapping else {
        return input.clone();
    };
    let mut mapped = Map::new();
    for (target_key, source_key) in mapping {
        if let Some(value) = input.get(source_key) {
            mapped.insert(target_key.clone(), value.clone());
        }
    }
    Value::Object(mapped)
}
