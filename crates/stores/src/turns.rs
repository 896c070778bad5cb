//! Turn table. Terminal transitions are idempotent: completing or
//! failing an already-terminal turn returns `false` and changes nothing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use cq_domain::trace::{TraceEvent, TraceSink};
use cq_domain::turn::{Caller, Turn, TurnIssues, TurnStatus};

use crate::journal::{Journal, JournalRecord};

pub struct TurnStore {
    conversation_id: String,
    turns: RwLock<HashMap<Uuid, Turn>>,
    journal: Arc<Journal>,
    sink: Arc<dyn TraceSink>,
}

impl TurnStore {
    pub fn new(
        conversation_id: &str,
        journal: Arc<Journal>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            turns: RwLock::new(HashMap::new()),
            journal,
            sink,
        }
    }

    /// Create a new active turn. The UUIDv7 id makes start time the sort
    /// order.
    pub fn create(&self, caller: Caller, input: Value) -> Uuid {
        let turn = Turn::new(self.conversation_id.clone(), caller, input);
        let turn_id = turn.id;
        self.journal.append(&JournalRecord::Turn(turn.clone()));
        self.turns.write().insert(turn_id, turn);
        self.sink.emit(TraceEvent::TurnCreated {
            turn_id,
            conversation_id: self.conversation_id.clone(),
        });
        turn_id
    }

    /// Complete an active turn. Returns false (and leaves the row
    /// unchanged) if the turn is already terminal or unknown.
    pub fn complete(&self, turn_id: Uuid, issues: Option<TurnIssues>) -> bool {
        let mut turns = self.turns.write();
        let Some(turn) = turns.get_mut(&turn_id) else {
            return false;
        };
        if turn.status.is_terminal() {
            return false;
        }
        turn.status = TurnStatus::Completed;
        turn.completed_at = Some(Utc::now());
        if let Some(issues) = issues {
            turn.tool_failures = issues.tool_failures;
        }
        let tool_failures = turn.tool_failures;
        self.journal.append(&JournalRecord::Turn(turn.clone()));
        drop(turns);
        self.sink.emit(TraceEvent::TurnCompleted {
            turn_id,
            tool_failures,
        });
        true
    }

    /// Fail an active turn. Idempotent in the same sense as [`complete`].
    ///
    /// [`complete`]: TurnStore::complete
    pub fn fail(&self, turn_id: Uuid, code: &str, message: &str) -> bool {
        let mut turns = self.turns.write();
        let Some(turn) = turns.get_mut(&turn_id) else {
            return false;
        };
        if turn.status.is_terminal() {
            return false;
        }
        turn.status = TurnStatus::Failed;
        turn.completed_at = Some(Utc::now());
        turn.error_code = Some(code.to_owned());
        turn.error_message = Some(message.to_owned());
        self.journal.append(&JournalRecord::Turn(turn.clone()));
        drop(turns);
        self.sink.emit(TraceEvent::TurnFailed {
            turn_id,
            code: code.to_owned(),
        });
        true
    }

    pub fn link_context_assembly(&self, turn_id: Uuid, run_id: &str) -> bool {
        self.link(turn_id, run_id, "context_assembly", |turn, run_id| {
            turn.context_assembly_run_id = Some(run_id);
        })
    }

    pub fn link_memory_extraction(&self, turn_id: Uuid, run_id: &str) -> bool {
        self.link(turn_id, run_id, "memory_extraction", |turn, run_id| {
            turn.memory_extraction_run_id = Some(run_id);
        })
    }

    fn link(
        &self,
        turn_id: Uuid,
        run_id: &str,
        link: &'static str,
        apply: impl FnOnce(&mut Turn, String),
    ) -> bool {
        let mut turns = self.turns.write();
        let Some(turn) = turns.get_mut(&turn_id) else {
            return false;
        };
        apply(turn, run_id.to_owned());
        self.journal.append(&JournalRecord::Turn(turn.clone()));
        drop(turns);
        self.sink.emit(TraceEvent::TurnLinked {
            turn_id,
            run_id: run_id.to_owned(),
            link,
        });
        true
    }

    pub fn mark_memory_extraction_failed(&self, turn_id: Uuid) -> bool {
        let mut turns = self.turns.write();
        let Some(turn) = turns.get_mut(&turn_id) else {
            return false;
        };
        turn.memory_extraction_failed = true;
        self.journal.append(&JournalRecord::Turn(turn.clone()));
        true
    }

    pub fn get(&self, turn_id: Uuid) -> Option<Turn> {
        self.turns.read().get(&turn_id).cloned()
    }

    /// All non-terminal turns in this conversation.
    pub fn get_active(&self) -> Vec<Turn> {
        let mut active: Vec<Turn> = self
            .turns
            .read()
            .values()
            .filter(|t| t.status == TurnStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|t| t.id);
        active
    }

    /// Most recent turns first. Ties on the timestamp fall back to the
    /// sortable id so the order is deterministic.
    pub fn get_recent(&self, limit: usize) -> Vec<Turn> {
        let mut all: Vec<Turn> = self.turns.read().values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        all.truncate(limit);
        all
    }

    pub(crate) fn restore(&self, turn: Turn) {
        self.turns.write().insert(turn.id, turn);
    }

    pub(crate) fn snapshot(&self) -> Vec<Turn> {
        let mut all: Vec<Turn> = self.turns.read().values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }
}
