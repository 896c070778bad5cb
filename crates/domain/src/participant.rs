//! Conversation participants. Set semantics: at most one row per
//! (conversation, type, id).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantType {
    User,
    Agent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub conversation_id: String,
    pub participant_type: ParticipantType,
    pub participant_id: String,
    pub added_at: DateTime<Utc>,
    /// The turn whose dispatch added this participant, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub added_by_turn_id: Option<Uuid>,
}
