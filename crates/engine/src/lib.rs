//! The Colloquy engine — turn scheduling and tool dispatch for one
//! conversation at a time.
//!
//! Layering, outermost first:
//!
//! - [`actor`] — one mailbox task per conversation plus the registry that
//!   spawns them lazily. The single-writer discipline lives here: one
//!   command runs to completion before the next is admitted.
//! - [`turn`] — the turn state machine: entry points, callback handlers,
//!   timeout sweep, completion check.
//! - [`llm_loop`] — bridges the turn engine to the LLM adapter and the
//!   planner; rebuilds continuation requests from the store.
//! - [`planner`] — pure: LLM response in, decision list out. No I/O.
//! - [`dispatch`] — applies decisions: store mutations and outbound
//!   calls. Fail-soft across a decision list.
//! - [`alarm`] — single-slot earliest-deadline timer per conversation.
//! - [`external`] — contracts for the collaborators this crate consumes
//!   but does not implement (workflow coordinator, task executor,
//!   definition store).

pub mod actor;
pub mod alarm;
pub mod context;
pub mod dispatch;
pub mod external;
pub mod llm_loop;
pub mod planner;
pub mod turn;

pub use actor::{ActorHandle, ActorRegistry, Command};
pub use dispatch::{apply_decisions, ApplyOutcome, DispatchCtx};
pub use external::{
    AgentCallParams, AgentRouter, DefinitionStore, Services, TaskExecutor, TaskRequest,
    WorkflowRef, WorkflowService,
};
pub use llm_loop::LoopResult;
pub use planner::{PlanOutcome, ToolCatalog};
pub use turn::TurnEngine;
