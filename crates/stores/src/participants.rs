//! Participant table. Set semantics: adding the same (type, id) twice is
//! a no-op that returns `None`.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use cq_domain::participant::{Participant, ParticipantType};
use cq_domain::trace::{TraceEvent, TraceSink};

use crate::journal::{Journal, JournalRecord};

pub struct ParticipantStore {
    conversation_id: String,
    participants: RwLock<Vec<Participant>>,
    journal: Arc<Journal>,
    sink: Arc<dyn TraceSink>,
}

impl ParticipantStore {
    pub fn new(
        conversation_id: &str,
        journal: Arc<Journal>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            participants: RwLock::new(Vec::new()),
            journal,
            sink,
        }
    }

    /// Add a participant. Returns the row id, or `None` when the
    /// (type, id) pair is already present.
    pub fn add(
        &self,
        participant_type: ParticipantType,
        participant_id: &str,
        added_by_turn_id: Option<Uuid>,
    ) -> Option<Uuid> {
        let mut participants = self.participants.write();
        if participants
            .iter()
            .any(|p| p.participant_type == participant_type && p.participant_id == participant_id)
        {
            return None;
        }
        let participant = Participant {
            id: Uuid::now_v7(),
            conversation_id: self.conversation_id.clone(),
            participant_type,
            participant_id: participant_id.to_owned(),
            added_at: Utc::now(),
            added_by_turn_id,
        };
        let id = participant.id;
        self.journal
            .append(&JournalRecord::Participant(participant.clone()));
        participants.push(participant);
        drop(participants);

        self.sink.emit(TraceEvent::ParticipantAdded {
            conversation_id: self.conversation_id.clone(),
            participant_id: participant_id.to_owned(),
        });
        Some(id)
    }

    pub fn exists(&self, participant_type: ParticipantType, participant_id: &str) -> bool {
        self.participants
            .read()
            .iter()
            .any(|p| p.participant_type == participant_type && p.participant_id == participant_id)
    }

    pub fn get_participants(&self) -> Vec<Participant> {
        self.participants.read().clone()
    }

    pub fn remove(&self, participant_type: ParticipantType, participant_id: &str) -> bool {
        let mut participants = self.participants.write();
        let before = participants.len();
        participants.retain(|p| {
            !(p.participant_type == participant_type && p.participant_id == participant_id)
        });
        let removed = participants.len() < before;
        drop(participants);

        if removed {
            self.journal.append(&JournalRecord::ParticipantRemoved {
                participant_type,
                participant_id: participant_id.to_owned(),
            });
            self.sink.emit(TraceEvent::ParticipantRemoved {
                conversation_id: self.conversation_id.clone(),
                participant_id: participant_id.to_owned(),
            });
        }
        removed
    }

    pub(crate) fn restore(&self, participant: Participant) {
        let mut participants = self.participants.write();
        if !participants.iter().any(|p| {
            p.participant_type == participant.participant_type
                && p.participant_id == participant.participant_id
        }) {
            participants.push(participant);
        }
    }

    pub(crate) fn restore_removal(
        &self,
        participant_type: ParticipantType,
        participant_id: &str,
    ) {
        self.participants.write().retain(|p| {
            !(p.participant_type == participant_type && p.participant_id == participant_id)
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<Participant> {
        self.participants.read().clone()
    }
}
