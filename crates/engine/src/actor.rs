//! Conversation actors — one mailbox task per conversation, spawned
//! lazily by the [`ActorRegistry`].
//!
//! The single-writer discipline is enforced here: the actor task pulls
//! one [`Command`] at a time and runs it to completion (including every
//! await inside it) before admitting the next. All conversation state
//! lives behind the mailbox; nothing else holds a reference to it.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::Instrument;
use uuid::Uuid;

use cq_domain::error::{Error, Result};
use cq_domain::participant::ParticipantType;
use cq_domain::turn::Caller;
use cq_llm::TokenSink;
use cq_stores::ConversationStores;

use crate::alarm::AlarmSlot;
use crate::external::{AgentCallParams, AgentRouter, Services};
use crate::turn::TurnEngine;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commands
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the outside world can ask of a conversation actor. The
/// start commands reply; callbacks are one-way (failures are traced by
/// the engine, not returned to the sender).
pub enum Command {
    StartTurn {
        input: Value,
        caller: Caller,
        token_sink: Option<TokenSink>,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    StartAgentCall {
        params: AgentCallParams,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    ContextAssemblyResult {
        turn_id: Uuid,
        run_id: String,
        output: Value,
    },
    ContextAssemblyError {
        turn_id: Uuid,
        run_id: String,
        error: String,
    },
    TaskResult {
        turn_id: Uuid,
        tool_call_id: String,
        result: Value,
    },
    TaskError {
        turn_id: Uuid,
        tool_call_id: String,
        error: String,
    },
    WorkflowResult {
        turn_id: Uuid,
        tool_call_id: String,
        result: Value,
    },
    WorkflowError {
        turn_id: Uuid,
        tool_call_id: String,
        error: String,
    },
    AgentResponse {
        turn_id: Uuid,
        tool_call_id: String,
        response: String,
    },
    AgentError {
        turn_id: Uuid,
        tool_call_id: String,
        error: String,
    },
    MemoryExtractionResult {
        turn_id: Uuid,
        run_id: String,
    },
    MemoryExtractionError {
        turn_id: Uuid,
        run_id: String,
        error: String,
    },
    Alarm,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cheap cloneable address of one conversation actor.
#[derive(Clone)]
pub struct ActorHandle {
    conversation_id: String,
    tx: mpsc::Sender<Command>,
}

impl ActorHandle {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Enqueue a one-way command.
    pub async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::Actor(format!("mailbox closed: {}", self.conversation_id)))
    }

    pub async fn start_turn(
        &self,
        input: Value,
        caller: Caller,
        token_sink: Option<TokenSink>,
    ) -> Result<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartTurn {
            input,
            caller,
            token_sink,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| Error::Actor(format!("actor dropped reply: {}", self.conversation_id)))?
    }

    pub async fn start_agent_call(&self, params: AgentCallParams) -> Result<Uuid> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::StartAgentCall { params, reply }).await?;
        rx.await
            .map_err(|_| Error::Actor(format!("actor dropped reply: {}", self.conversation_id)))?
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn spawn_actor(
    conversation_id: &str,
    services: Services,
    agents: Arc<dyn AgentRouter>,
) -> ActorHandle {
    let capacity = services.config.engine.mailbox_capacity;
    let (tx, mut rx) = mpsc::channel::<Command>(capacity);
    let handle = ActorHandle {
        conversation_id: conversation_id.to_owned(),
        tx: tx.clone(),
    };

    let conversation_id = conversation_id.to_owned();
    let span = tracing::info_span!("conversation", conversation_id = %conversation_id);
    tokio::spawn(
        async move {
            // First touch: conversation meta, persona, journal replay.
            let engine = match init_engine(&conversation_id, &services, agents, tx).await {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!(error = %e, "conversation actor failed to initialize");
                    // Refuse queued work, then shut the mailbox.
                    rx.close();
                    while let Some(command) = rx.recv().await {
                        refuse(command, &e);
                    }
                    return;
                }
            };
            // Deadlines survive restarts: re-arm from the replayed table.
            engine.rearm_alarm_from_store();

            tracing::debug!("conversation actor ready");
            while let Some(command) = rx.recv().await {
                run_command(&engine, command).await;
            }
            tracing::debug!("conversation actor stopped");
        }
        .instrument(span),
    );

    handle
}

async fn init_engine(
    conversation_id: &str,
    services: &Services,
    agents: Arc<dyn AgentRouter>,
    tx: mpsc::Sender<Command>,
) -> Result<TurnEngine> {
    let meta = services.defs.conversation(conversation_id).await?;
    let persona = services.defs.persona(&meta.agent_id).await?;
    let stores = ConversationStores::open(
        conversation_id,
        services.config.state.path.as_deref(),
        services.sink.clone(),
    )?;
    // The owning agent is always a participant.
    stores
        .participants
        .add(ParticipantType::Agent, &meta.agent_id, None);

    let alarm = AlarmSlot::new(conversation_id, tx, services.sink.clone());
    Ok(TurnEngine::new(
        meta,
        persona,
        stores,
        services.clone(),
        agents,
        alarm,
    ))
}

fn refuse(command: Command, error: &Error) {
    match command {
        Command::StartTurn { reply, .. } | Command::StartAgentCall { reply, .. } => {
            let _ = reply.send(Err(Error::Actor(error.to_string())));
        }
        _ => {}
    }
}

/// One command, run to completion. Callback errors are logged here —
/// the sender has already moved on.
async fn run_command(engine: &TurnEngine, command: Command) {
    let result = match command {
        Command::StartTurn {
            input,
            caller,
            token_sink,
            reply,
        } => {
            let _ = reply.send(engine.start_turn(input, caller, token_sink).await);
            Ok(())
        }
        Command::StartAgentCall { params, reply } => {
            let _ = reply.send(engine.start_agent_call(params).await);
            Ok(())
        }
        Command::ContextAssemblyResult {
            turn_id,
            run_id,
            output,
        } => {
            engine
                .handle_context_assembly_result(turn_id, &run_id, output)
                .await
        }
        Command::ContextAssemblyError {
            turn_id,
            run_id,
            error,
        } => {
            engine
                .handle_context_assembly_error(turn_id, &run_id, &error)
                .await
        }
        Command::TaskResult {
            turn_id,
            tool_call_id,
            result,
        } => engine.handle_task_result(turn_id, &tool_call_id, result).await,
        Command::TaskError {
            turn_id,
            tool_call_id,
            error,
        } => engine.handle_task_error(turn_id, &tool_call_id, &error).await,
        Command::WorkflowResult {
            turn_id,
            tool_call_id,
            result,
        } => {
            engine
                .handle_workflow_result(turn_id, &tool_call_id, result)
                .await
        }
        Command::WorkflowError {
            turn_id,
            tool_call_id,
            error,
        } => {
            engine
                .handle_workflow_error(turn_id, &tool_call_id, &error)
                .await
        }
        Command::AgentResponse {
            turn_id,
            tool_call_id,
            response,
        } => {
            engine
                .handle_agent_response(turn_id, &tool_call_id, response)
                .await
        }
        Command::AgentError {
            turn_id,
            tool_call_id,
            error,
        } => engine.handle_agent_error(turn_id, &tool_call_id, &error).await,
        Command::MemoryExtractionResult { turn_id, run_id } => {
            engine.handle_memory_extraction_result(turn_id, &run_id).await
        }
        Command::MemoryExtractionError {
            turn_id,
            run_id,
            error,
        } => {
            engine
                .handle_memory_extraction_error(turn_id, &run_id, &error)
                .await
        }
        Command::Alarm => engine.handle_alarm().await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lifecycle registry keyed by conversation id. Spawns actors on first
/// touch and hands peers to each other — it is the [`AgentRouter`] the
/// dispatcher and turn engine call through.
pub struct ActorRegistry {
    services: Services,
    actors: Mutex<HashMap<String, ActorHandle>>,
    self_ref: Weak<ActorRegistry>,
}

impl ActorRegistry {
    pub fn new(services: Services) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            services,
            actors: Mutex::new(HashMap::new()),
            self_ref: self_ref.clone(),
        })
    }

    /// The live handle for a conversation, spawning its actor if needed.
    pub fn handle(&self, conversation_id: &str) -> Result<ActorHandle> {
        let router: Arc<dyn AgentRouter> = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::Actor("registry dropped".into()))?;

        let mut actors = self.actors.lock();
        if let Some(handle) = actors.get(conversation_id) {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
        }
        let handle = spawn_actor(conversation_id, self.services.clone(), router);
        actors.insert(conversation_id.to_owned(), handle.clone());
        Ok(handle)
    }

    /// Enqueue a one-way command for a conversation (the callback
    /// surface coordinators and executors deliver into).
    pub async fn deliver(&self, conversation_id: &str, command: Command) -> Result<()> {
        self.handle(conversation_id)?.send(command).await
    }

    /// Drop handles whose actor has stopped. Called periodically by the
    /// host; actors respawn (and replay their journal) on next touch.
    pub fn prune_idle(&self) {
        self.actors.lock().retain(|_, handle| handle.is_alive());
    }

    pub fn actor_count(&self) -> usize {
        self.actors.lock().len()
    }
}

#[async_trait::async_trait]
impl AgentRouter for ActorRegistry {
    async fn start_turn(
        &self,
        conversation_id: &str,
        input: Value,
        caller: Caller,
    ) -> Result<Uuid> {
        self.handle(conversation_id)?
            .start_turn(input, caller, None)
            .await
    }

    async fn handle_agent_response(
        &self,
        conversation_id: &str,
        turn_id: Uuid,
        tool_call_id: &str,
        response: String,
    ) -> Result<()> {
        self.deliver(
            conversation_id,
            Command::AgentResponse {
                turn_id,
                tool_call_id: tool_call_id.to_owned(),
                response,
            },
        )
        .await
    }

    async fn handle_agent_error(
        &self,
        conversation_id: &str,
        turn_id: Uuid,
        tool_call_id: &str,
        error: String,
    ) -> Result<()> {
        self.deliver(
            conversation_id,
            Command::AgentError {
                turn_id,
                tool_call_id: tool_call_id.to_owned(),
                error,
            },
        )
        .await
    }
}
