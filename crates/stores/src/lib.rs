//! Conversation-local state stores — turns, messages, moves, async ops,
//! participants. Strict single-writer: one actor owns one
//! [`ConversationStores`] and nothing else touches it.
//!
//! Every mutation emits a trace event and appends one record to the
//! conversation's JSONL journal; opening the stores replays the journal,
//! so an actor resumes exactly where its process died.

pub mod async_ops;
pub mod journal;
pub mod messages;
pub mod moves;
pub mod participants;
pub mod turns;

pub use async_ops::AsyncOpStore;
pub use journal::{Journal, JournalRecord};
pub use messages::MessageStore;
pub use moves::MoveStore;
pub use participants::ParticipantStore;
pub use turns::TurnStore;

use std::path::Path;
use std::sync::Arc;

use cq_domain::error::Result;
use cq_domain::trace::{TraceEvent, TraceSink};

/// All five tables for one conversation, sharing a journal and a sink.
pub struct ConversationStores {
    pub turns: TurnStore,
    pub messages: MessageStore,
    pub moves: MoveStore,
    pub async_ops: AsyncOpStore,
    pub participants: ParticipantStore,
}

impl ConversationStores {
    /// Open the stores for a conversation, replaying any journal found
    /// under `state_dir`. `None` keeps everything in memory.
    pub fn open(
        conversation_id: &str,
        state_dir: Option<&Path>,
        sink: Arc<dyn TraceSink>,
    ) -> Result<Self> {
        let (journal, records) = Journal::open(state_dir, conversation_id)?;
        let journal = Arc::new(journal);

        let stores = Self {
            turns: TurnStore::new(conversation_id, journal.clone(), sink.clone()),
            messages: MessageStore::new(conversation_id, journal.clone(), sink.clone()),
            moves: MoveStore::new(journal.clone(), sink.clone()),
            async_ops: AsyncOpStore::new(journal.clone(), sink.clone()),
            participants: ParticipantStore::new(conversation_id, journal.clone(), sink.clone()),
        };

        if !records.is_empty() {
            let count = records.len();
            for record in records {
                stores.restore(record);
            }
            sink.emit(TraceEvent::JournalReplayed {
                conversation_id: conversation_id.to_owned(),
                records: count,
            });
            // Compact: one record per live row instead of one per mutation.
            journal.rewrite(&stores.snapshot());
        }

        Ok(stores)
    }

    /// In-memory stores (tests, embedded use). No journal is written.
    pub fn in_memory(conversation_id: &str, sink: Arc<dyn TraceSink>) -> Self {
        let journal = Arc::new(Journal::memory());
        Self {
            turns: TurnStore::new(conversation_id, journal.clone(), sink.clone()),
            messages: MessageStore::new(conversation_id, journal.clone(), sink.clone()),
            moves: MoveStore::new(journal.clone(), sink.clone()),
            async_ops: AsyncOpStore::new(journal.clone(), sink.clone()),
            participants: ParticipantStore::new(conversation_id, journal, sink),
        }
    }

    fn restore(&self, record: JournalRecord) {
        match record {
            JournalRecord::Turn(turn) => self.turns.restore(turn),
            JournalRecord::Message(message) => self.messages.restore(message),
            JournalRecord::Move(mv) => self.moves.restore(mv),
            JournalRecord::AsyncOp(op) => self.async_ops.restore(op),
            JournalRecord::Participant(p) => self.participants.restore(p),
            JournalRecord::ParticipantRemoved {
                participant_type,
                participant_id,
            } => {
                self.participants
                    .restore_removal(participant_type, &participant_id);
            }
        }
    }

    fn snapshot(&self) -> Vec<JournalRecord> {
        let mut records = Vec::new();
        records.extend(self.turns.snapshot().into_iter().map(JournalRecord::Turn));
        records.extend(
            self.messages
                .snapshot()
                .into_iter()
                .map(JournalRecord::Message),
        );
        records.extend(self.moves.snapshot().into_iter().map(JournalRecord::Move));
        records.extend(
            self.async_ops
                .snapshot()
                .into_iter()
                .map(JournalRecord::AsyncOp),
        );
        records.extend(
            self.participants
                .snapshot()
                .into_iter()
                .map(JournalRecord::Participant),
        );
        records
    }
}
