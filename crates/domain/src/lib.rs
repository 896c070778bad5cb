//! Shared domain types for Colloquy — conversation records, tool model,
//! dispatch decisions, callback envelopes, trace events, errors, config.
//!
//! Everything here is plain data: no I/O, no async. The stores crate owns
//! persistence; the engine crate owns behavior.

pub mod async_op;
pub mod config;
pub mod content;
pub mod decision;
pub mod envelope;
pub mod error;
pub mod message;
pub mod moves;
pub mod participant;
pub mod persona;
pub mod tool;
pub mod trace;
pub mod turn;

pub use async_op::{AsyncOp, OpStatus, OpTargetType, RetryPolicy};
pub use content::{ChatMessage, MessageContent, Role};
pub use decision::Decision;
pub use error::{Error, Result};
pub use tool::{ToolCall, ToolDefinition, ToolError, ToolErrorCode, ToolOutcome, ToolSpec};
pub use trace::{TraceEvent, TraceSink};
pub use turn::{Caller, Turn, TurnIssues, TurnStatus};
