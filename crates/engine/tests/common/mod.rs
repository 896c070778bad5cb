//! Shared test doubles: a scripted LLM, recording executors and
//! workflow services, and an in-memory definition store. Scenario tests
//! drive a [`TurnEngine`] directly for deterministic control; the
//! actor-level tests go through a live [`ActorRegistry`].

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use cq_domain::async_op::OpTargetType;
use cq_domain::config::Config;
use cq_domain::error::{Error, Result};
use cq_domain::persona::{ConversationMeta, MemoryExtractionWorkflow, Persona};
use cq_domain::tool::{AgentCallMode, ToolDefinition};
use cq_domain::trace::RecordingSink;
use cq_domain::turn::Caller;
use cq_engine::alarm::AlarmSlot;
use cq_engine::{
    AgentRouter, Command, DefinitionStore, Services, TaskExecutor, TaskRequest, TurnEngine,
    WorkflowRef, WorkflowService,
};
use cq_llm::{LlmClient, LlmRequest, LlmResponse, StopReason, TokenSink, ToolUse};
use cq_stores::ConversationStores;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Plain,
    Raw,
    Streaming,
}

/// Pops one canned response per call and records every request.
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<LlmResponse>>,
    pub calls: Mutex<Vec<(CallKind, LlmRequest)>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn request_at(&self, index: usize) -> LlmRequest {
        self.calls.lock()[index].1.clone()
    }

    pub fn kind_at(&self, index: usize) -> CallKind {
        self.calls.lock()[index].0
    }

    fn next(&self, kind: CallKind, request: &LlmRequest) -> Result<LlmResponse> {
        self.calls.lock().push((kind, request.clone()));
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Llm("script exhausted".into()))
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn call(&self, request: &LlmRequest, _tools: &[cq_domain::tool::ToolSpec]) -> Result<LlmResponse> {
        self.next(CallKind::Plain, request)
    }

    async fn call_raw(
        &self,
        request: &LlmRequest,
        _tools: &[cq_domain::tool::ToolSpec],
    ) -> Result<LlmResponse> {
        self.next(CallKind::Raw, request)
    }

    async fn call_streaming(
        &self,
        request: &LlmRequest,
        _tools: &[cq_domain::tool::ToolSpec],
        on_token: TokenSink,
    ) -> Result<LlmResponse> {
        let response = self.next(CallKind::Streaming, request)?;
        if let Some(text) = &response.text {
            for token in text.split_inclusive(' ') {
                on_token(token);
            }
        }
        Ok(response)
    }
}

// ── Response builders ──────────────────────────────────────────────

pub fn text_response(text: &str) -> LlmResponse {
    LlmResponse {
        text: Some(text.to_owned()),
        tool_use: vec![],
        stop_reason: StopReason::EndTurn,
        raw_content: Some(json!([{"type": "text", "text": text}])),
    }
}

pub fn tool_response(text: Option<&str>, calls: &[(&str, &str, Value)]) -> LlmResponse {
    let mut raw = Vec::new();
    if let Some(text) = text {
        raw.push(json!({"type": "text", "text": text}));
    }
    let tool_use: Vec<ToolUse> = calls
        .iter()
        .map(|(id, name, input)| {
            raw.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
            ToolUse {
                id: (*id).to_owned(),
                name: (*name).to_owned(),
                input: input.clone(),
            }
        })
        .collect();
    LlmResponse {
        text: text.map(String::from),
        tool_use,
        stop_reason: StopReason::ToolUse,
        raw_content: Some(Value::Array(raw)),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recording executor / workflow service
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct RecordingExecutor {
    pub requests: Mutex<Vec<TaskRequest>>,
}

#[async_trait::async_trait]
impl TaskExecutor for RecordingExecutor {
    async fn execute(&self, request: TaskRequest) -> Result<()> {
        self.requests.lock().push(request);
        Ok(())
    }
}

pub struct CreatedRun {
    pub run_id: String,
    pub workflow: WorkflowRef,
    pub input: Value,
}

#[derive(Default)]
pub struct RecordingWorkflows {
    counter: Mutex<u64>,
    pub created: Mutex<Vec<CreatedRun>>,
    pub started: Mutex<Vec<String>>,
    pub agent_results: Mutex<Vec<(String, String, Value)>>,
    /// When set, `create_run` refuses — for exercising dispatch
    /// failures.
    pub fail_creates: Mutex<bool>,
}

#[async_trait::async_trait]
impl WorkflowService for RecordingWorkflows {
    async fn create_run(&self, workflow: &WorkflowRef, input: Value) -> Result<String> {
        if *self.fail_creates.lock() {
            return Err(Error::Workflow("workflow-runs resource unavailable".into()));
        }
        let mut counter = self.counter.lock();
        *counter += 1;
        let run_id = format!("run-{}", *counter);
        self.created.lock().push(CreatedRun {
            run_id: run_id.clone(),
            workflow: workflow.clone(),
            input,
        });
        Ok(run_id)
    }

    async fn start_run(&self, run_id: &str) -> Result<()> {
        self.started.lock().push(run_id.to_owned());
        Ok(())
    }

    async fn handle_agent_result(
        &self,
        run_id: &str,
        node_id: &str,
        response: Value,
    ) -> Result<()> {
        self.agent_results
            .lock()
            .push((run_id.to_owned(), node_id.to_owned(), response));
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definition store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryDefs {
    pub conversations: Mutex<HashMap<String, ConversationMeta>>,
    pub personas: Mutex<HashMap<String, Persona>>,
    pub tool_defs: Mutex<HashMap<String, ToolDefinition>>,
    child_counter: Mutex<u64>,
    /// When set, `create_conversation` refuses — for exercising
    /// delegate dispatch failures.
    pub fail_conversation_creates: Mutex<bool>,
}

impl MemoryDefs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            conversations: Mutex::new(HashMap::new()),
            personas: Mutex::new(HashMap::new()),
            tool_defs: Mutex::new(HashMap::new()),
            child_counter: Mutex::new(0),
            fail_conversation_creates: Mutex::new(false),
        })
    }

    pub fn add_conversation(&self, conversation_id: &str, agent_id: &str) {
        self.conversations.lock().insert(
            conversation_id.to_owned(),
            ConversationMeta {
                conversation_id: conversation_id.to_owned(),
                agent_id: agent_id.to_owned(),
                branch_context: None,
            },
        );
    }

    pub fn add_persona(&self, persona: Persona) {
        self.personas.lock().insert(persona.agent_id.clone(), persona);
    }

    pub fn add_tool(&self, def: ToolDefinition) {
        self.tool_defs.lock().insert(def.tool_id.clone(), def);
    }
}

#[async_trait::async_trait]
impl DefinitionStore for MemoryDefs {
    async fn conversation(&self, conversation_id: &str) -> Result<ConversationMeta> {
        self.conversations
            .lock()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| Error::Definitions(format!("unknown conversation: {conversation_id}")))
    }

    async fn create_conversation(&self, agent_id: &str) -> Result<ConversationMeta> {
        if *self.fail_conversation_creates.lock() {
            return Err(Error::Definitions("definition store unavailable".into()));
        }
        let mut counter = self.child_counter.lock();
        *counter += 1;
        let conversation_id = format!("conv-child-{}", *counter);
        let meta = ConversationMeta {
            conversation_id: conversation_id.clone(),
            agent_id: agent_id.to_owned(),
            branch_context: None,
        };
        self.conversations
            .lock()
            .insert(conversation_id, meta.clone());
        Ok(meta)
    }

    async fn persona(&self, agent_id: &str) -> Result<Persona> {
        self.personas
            .lock()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::Definitions(format!("unknown persona: {agent_id}")))
    }

    async fn tools(&self, tool_ids: &[String]) -> Result<Vec<ToolDefinition>> {
        let defs = self.tool_defs.lock();
        Ok(tool_ids.iter().filter_map(|id| defs.get(id).cloned()).collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Router double
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records peer calls without spawning real actors.
#[derive(Default)]
pub struct RecordingRouter {
    pub started: Mutex<Vec<(String, Value, Caller)>>,
    pub responses: Mutex<Vec<(String, Uuid, String, String)>>,
    pub errors: Mutex<Vec<(String, Uuid, String, String)>>,
}

#[async_trait::async_trait]
impl AgentRouter for RecordingRouter {
    async fn start_turn(
        &self,
        conversation_id: &str,
        input: Value,
        caller: Caller,
    ) -> Result<Uuid> {
        self.started
            .lock()
            .push((conversation_id.to_owned(), input, caller));
        Ok(Uuid::now_v7())
    }

    async fn handle_agent_response(
        &self,
        conversation_id: &str,
        turn_id: Uuid,
        tool_call_id: &str,
        response: String,
    ) -> Result<()> {
        self.responses.lock().push((
            conversation_id.to_owned(),
            turn_id,
            tool_call_id.to_owned(),
            response,
        ));
        Ok(())
    }

    async fn handle_agent_error(
        &self,
        conversation_id: &str,
        turn_id: Uuid,
        tool_call_id: &str,
        error: String,
    ) -> Result<()> {
        self.errors.lock().push((
            conversation_id.to_owned(),
            turn_id,
            tool_call_id.to_owned(),
            error,
        ));
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool definition builders
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn task_tool(tool_id: &str, name: &str, is_async: bool) -> ToolDefinition {
    ToolDefinition {
        tool_id: tool_id.to_owned(),
        name: name.to_owned(),
        description: format!("test task tool {name}"),
        input_schema: json!({
            "type": "object",
            "properties": {"q": {"type": "string"}},
            "required": ["q"]
        }),
        target_type: OpTargetType::Task,
        target_id: format!("task-{name}"),
        is_async,
        input_mapping: None,
        timeout_ms: None,
        retry: None,
        mode: None,
    }
}

pub fn workflow_tool(tool_id: &str, name: &str, is_async: bool) -> ToolDefinition {
    ToolDefinition {
        tool_id: tool_id.to_owned(),
        name: name.to_owned(),
        description: format!("test workflow tool {name}"),
        input_schema: json!({"type": "object"}),
        target_type: OpTargetType::Workflow,
        target_id: format!("wf-{name}"),
        is_async,
        input_mapping: None,
        timeout_ms: None,
        retry: None,
        mode: None,
    }
}

pub fn agent_tool(tool_id: &str, name: &str, agent_id: &str, mode: AgentCallMode) -> ToolDefinition {
    ToolDefinition {
        tool_id: tool_id.to_owned(),
        name: name.to_owned(),
        description: format!("test agent tool {name}"),
        input_schema: json!({"type": "object"}),
        target_type: OpTargetType::Agent,
        target_id: agent_id.to_owned(),
        is_async: false,
        input_mapping: None,
        timeout_ms: None,
        retry: None,
        mode: Some(mode),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const CONV_ID: &str = "conv-main";
pub const AGENT_ID: &str = "assistant";

pub fn persona_for(agent_id: &str, tool_ids: Vec<String>) -> Persona {
    Persona {
        agent_id: agent_id.to_owned(),
        model_profile_id: "profile-1".to_owned(),
        context_assembly_workflow_id: "wf-context".to_owned(),
        tool_ids,
        recent_turns_limit: 20,
        memory_extraction: None,
    }
}

pub fn memory_workflow() -> MemoryExtractionWorkflow {
    MemoryExtractionWorkflow {
        workflow_def_id: "wf-memory".to_owned(),
        version: 1,
        project_id: "proj-1".to_owned(),
    }
}

/// A [`TurnEngine`] wired to doubles, driven directly (no actor task).
/// The mailbox receiver is held so alarm sends have somewhere to go.
pub struct Harness {
    pub engine: TurnEngine,
    pub llm: Arc<ScriptedLlm>,
    pub executor: Arc<RecordingExecutor>,
    pub workflows: Arc<RecordingWorkflows>,
    pub defs: Arc<MemoryDefs>,
    pub router: Arc<RecordingRouter>,
    pub sink: Arc<RecordingSink>,
    pub mailbox: mpsc::Receiver<Command>,
}

impl Harness {
    pub fn new(tools: Vec<ToolDefinition>, responses: Vec<LlmResponse>) -> Self {
        Self::with_persona(tools, responses, |p| p)
    }

    pub fn with_persona(
        tools: Vec<ToolDefinition>,
        responses: Vec<LlmResponse>,
        customize: impl FnOnce(Persona) -> Persona,
    ) -> Self {
        Self::with_options(tools, responses, customize, None)
    }

    /// Full-control constructor; `state_dir` switches on the journal so
    /// restart tests can rebuild the engine from disk.
    pub fn with_options(
        tools: Vec<ToolDefinition>,
        responses: Vec<LlmResponse>,
        customize: impl FnOnce(Persona) -> Persona,
        state_dir: Option<&std::path::Path>,
    ) -> Self {
        let llm = ScriptedLlm::new(responses);
        let executor = Arc::new(RecordingExecutor::default());
        let workflows = Arc::new(RecordingWorkflows::default());
        let defs = MemoryDefs::new();
        let router = Arc::new(RecordingRouter::default());
        let sink = Arc::new(RecordingSink::new());

        defs.add_conversation(CONV_ID, AGENT_ID);
        let tool_ids: Vec<String> = tools.iter().map(|t| t.tool_id.clone()).collect();
        for tool in tools {
            defs.add_tool(tool);
        }
        let persona = customize(persona_for(AGENT_ID, tool_ids));
        defs.add_persona(persona.clone());

        let services = Services {
            llm: llm.clone(),
            workflows: workflows.clone(),
            executor: executor.clone(),
            defs: defs.clone(),
            sink: sink.clone(),
            config: Arc::new(Config::default()),
        };

        let (tx, mailbox) = mpsc::channel(16);
        let stores = ConversationStores::open(CONV_ID, state_dir, sink.clone())
            .expect("open stores");
        let alarm = AlarmSlot::new(CONV_ID, tx, sink.clone());
        let meta = ConversationMeta {
            conversation_id: CONV_ID.to_owned(),
            agent_id: AGENT_ID.to_owned(),
            branch_context: None,
        };
        let engine = TurnEngine::new(
            meta,
            persona,
            stores,
            services,
            router.clone(),
            alarm,
        );

        Self {
            engine,
            llm,
            executor,
            workflows,
            defs,
            router,
            sink,
            mailbox,
        }
    }

    /// Run `start_turn` and feed the context-assembly result straight
    /// back, the way the coordinator would. Returns the turn id.
    pub async fn start_and_assemble(&self, message: &str) -> Uuid {
        let turn_id = self
            .engine
            .start_turn(json!({"message": message}), Caller::User, None)
            .await
            .expect("start turn");
        self.deliver_assembly(turn_id, message).await;
        turn_id
    }

    /// Deliver a canned context-assembly result for a turn.
    pub async fn deliver_assembly(&self, turn_id: Uuid, message: &str) {
        let run_id = self
            .workflows
            .created
            .lock()
            .last()
            .map(|r| r.run_id.clone())
            .expect("context assembly run created");
        let output = json!({
            "llmRequest": {"messages": [{"role": "user", "content": message}]}
        });
        self.engine
            .handle_context_assembly_result(turn_id, &run_id, output)
            .await
            .expect("assembly result");
    }
}

/// Turn on engine logs for a test while debugging a failure.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cq_engine=debug,cq_stores=debug")
        .try_init();
}

/// Poll until `check` passes or the deadline hits. Callbacks hop
/// through mailboxes and spawned tasks, so assertions need patience.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}
