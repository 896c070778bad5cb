//! Provider-agnostic LLM adapter contract.
//!
//! Implementations are provider-specific HTTP adapters that translate
//! between these types and the wire format of one provider's API. The
//! engine is provider-agnostic: it consumes [`LlmClient`] and nothing
//! else.

pub mod traits;

pub use traits::{LlmClient, LlmRequest, LlmResponse, StopReason, TokenSink, ToolUse};
