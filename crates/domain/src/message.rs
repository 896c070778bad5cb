//! Conversation messages — user and agent utterances. Append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Sortable id (UUIDv7).
    pub id: Uuid,
    pub conversation_id: String,
    pub turn_id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        conversation_id: String,
        turn_id: Uuid,
        role: MessageRole,
        content: String,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            conversation_id,
            turn_id,
            role,
            content,
            created_at: Utc::now(),
        }
    }
}
