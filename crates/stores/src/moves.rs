//! Move table. Sequences are assigned here — monotonic per turn, starting
//! at 0, no gaps. Results are matched back to moves by tool-call id.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use cq_domain::moves::{Move, MoveParams};
use cq_domain::tool::ToolOutcome;
use cq_domain::trace::{TraceEvent, TraceSink};

use crate::journal::{Journal, JournalRecord};

pub struct MoveStore {
    /// turn id -> moves in ascending sequence order.
    moves: RwLock<HashMap<Uuid, Vec<Move>>>,
    journal: Arc<Journal>,
    sink: Arc<dyn TraceSink>,
}

impl MoveStore {
    pub fn new(journal: Arc<Journal>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            moves: RwLock::new(HashMap::new()),
            journal,
            sink,
        }
    }

    /// Record a move, assigning the next sequence under its turn.
    pub fn record(&self, params: MoveParams) -> u32 {
        let mut moves = self.moves.write();
        let turn_moves = moves.entry(params.turn_id).or_default();
        let sequence = turn_moves.len() as u32;
        let has_tool_call = params.tool_call.is_some();

        let mv = Move {
            id: Uuid::now_v7(),
            turn_id: params.turn_id,
            sequence,
            reasoning: params.reasoning,
            tool_call: params.tool_call,
            tool_result: None,
            raw_content: params.raw_content,
            created_at: Utc::now(),
        };
        self.journal.append(&JournalRecord::Move(mv.clone()));
        let turn_id = mv.turn_id;
        turn_moves.push(mv);
        drop(moves);

        self.sink.emit(TraceEvent::MoveRecorded {
            turn_id,
            sequence,
            has_tool_call,
        });
        sequence
    }

    /// Attach a result to the unique move carrying this tool-call id.
    /// Returns false when no such move exists.
    pub fn record_result(&self, turn_id: Uuid, tool_call_id: &str, result: ToolOutcome) -> bool {
        let mut moves = self.moves.write();
        let Some(turn_moves) = moves.get_mut(&turn_id) else {
            return false;
        };
        let Some(mv) = turn_moves
            .iter_mut()
            .find(|m| m.tool_call.as_ref().is_some_and(|tc| tc.call_id == tool_call_id))
        else {
            return false;
        };
        let success = result.success;
        mv.tool_result = Some(result);
        self.journal.append(&JournalRecord::Move(mv.clone()));
        drop(moves);

        self.sink.emit(TraceEvent::MoveResultRecorded {
            turn_id,
            tool_call_id: tool_call_id.to_owned(),
            success,
        });
        true
    }

    /// All moves of a turn in ascending sequence order.
    pub fn get_for_turn(&self, turn_id: Uuid) -> Vec<Move> {
        self.moves
            .read()
            .get(&turn_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_latest(&self, turn_id: Uuid) -> Option<Move> {
        self.moves
            .read()
            .get(&turn_id)
            .and_then(|ms| ms.last().cloned())
    }

    pub(crate) fn restore(&self, mv: Move) {
        let mut moves = self.moves.write();
        let turn_moves = moves.entry(mv.turn_id).or_default();
        // Replays carry full rows: a result update replaces the original.
        if let Some(existing) = turn_moves.iter_mut().find(|m| m.id == mv.id) {
            *existing = mv;
        } else {
            turn_moves.push(mv);
            turn_moves.sort_by_key(|m| m.sequence);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Move> {
        let mut all: Vec<Move> = self
            .moves
            .read()
            .values()
            .flat_map(|ms| ms.iter().cloned())
            .collect();
        all.sort_by_key(|m| m.id);
        all
    }
}
