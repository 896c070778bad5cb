//! AsyncOp table — one row per in-flight tool invocation, keyed by the
//! tool-call id. The row's status carries the sync/async distinction:
//! `waiting` blocks the turn, `pending` does not. The timeout columns
//! are the ground truth the earliest-deadline alarm is armed from, both
//! live and after a journal replay.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use cq_domain::async_op::{AsyncOp, OpStatus, TrackParams};
use cq_domain::tool::{ToolError, ToolOutcome};
use cq_domain::trace::{TraceEvent, TraceSink};

use crate::journal::{Journal, JournalRecord};

pub struct AsyncOpStore {
    ops: RwLock<HashMap<String, AsyncOp>>,
    journal: Arc<Journal>,
    sink: Arc<dyn TraceSink>,
}

impl AsyncOpStore {
    pub fn new(journal: Arc<Journal>, sink: Arc<dyn TraceSink>) -> Self {
        Self {
            ops: RwLock::new(HashMap::new()),
            journal,
            sink,
        }
    }

    /// Track a freshly dispatched op as `pending`. Re-tracking an
    /// existing id is a no-op (at most one op per tool call).
    pub fn track(&self, params: TrackParams) -> bool {
        let mut ops = self.ops.write();
        if ops.contains_key(&params.op_id) {
            return false;
        }
        let retry = params.retry;
        let op = AsyncOp {
            op_id: params.op_id.clone(),
            turn_id: params.turn_id,
            target_type: Some(params.target_type),
            target_id: Some(params.target_id),
            status: OpStatus::Pending,
            sync: false,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
            timeout_at: params.timeout_at,
            attempt_number: 1,
            max_attempts: retry.map_or(1, |r| r.max_attempts),
            backoff_ms: retry.map_or(0, |r| r.backoff_ms),
            last_error: None,
        };
        self.journal.append(&JournalRecord::AsyncOp(op.clone()));
        let (op_id, turn_id, target_type) = (
            op.op_id.clone(),
            op.turn_id,
            params.target_type,
        );
        ops.insert(op.op_id.clone(), op);
        drop(ops);

        self.sink.emit(TraceEvent::AsyncOpTracked {
            op_id,
            turn_id,
            target_type: format!("{target_type:?}").to_lowercase(),
        });
        true
    }

    /// Flag an op as blocking its turn. Transitions `pending -> waiting`;
    /// if the op does not exist yet, inserts a fresh `waiting` row.
    pub fn mark_waiting(&self, turn_id: Uuid, op_id: &str) -> bool {
        let mut ops = self.ops.write();
        let op = match ops.get_mut(op_id) {
            Some(op) => {
                if op.status != OpStatus::Pending {
                    return false;
                }
                op.status = OpStatus::Waiting;
                op.sync = true;
                op.clone()
            }
            None => {
                let op = AsyncOp {
                    op_id: op_id.to_owned(),
                    turn_id,
                    target_type: None,
                    target_id: None,
                    status: OpStatus::Waiting,
                    sync: true,
                    result: None,
                    error: None,
                    created_at: Utc::now(),
                    completed_at: None,
                    timeout_at: None,
                    attempt_number: 1,
                    max_attempts: 1,
                    backoff_ms: 0,
                    last_error: None,
                };
                ops.insert(op_id.to_owned(), op.clone());
                op
            }
        };
        self.journal.append(&JournalRecord::AsyncOp(op.clone()));
        drop(ops);

        self.sink.emit(TraceEvent::AsyncOpWaiting {
            op_id: op_id.to_owned(),
            turn_id,
        });
        true
    }

    /// Terminal success. Only from `pending` or `waiting`.
    pub fn complete(&self, op_id: &str, result: Value) -> bool {
        self.finish(op_id, Ok(result))
    }

    /// Terminal failure. Only from `pending` or `waiting`.
    pub fn fail(&self, op_id: &str, error: ToolError) -> bool {
        self.finish(op_id, Err(error))
    }

    /// Equivalent to [`complete`], allowed from either `waiting` or
    /// `pending` — the entry point for RESUME_FROM_TOOL.
    ///
    /// [`complete`]: AsyncOpStore::complete
    pub fn resume(&self, op_id: &str, result: Value) -> bool {
        self.finish(op_id, Ok(result))
    }

    fn finish(&self, op_id: &str, outcome: std::result::Result<Value, ToolError>) -> bool {
        let mut ops = self.ops.write();
        let Some(op) = ops.get_mut(op_id) else {
            return false;
        };
        if op.status.is_terminal() {
            return false;
        }
        let event = match outcome {
            Ok(result) => {
                op.status = OpStatus::Completed;
                op.result = Some(result);
                TraceEvent::AsyncOpCompleted {
                    op_id: op_id.to_owned(),
                }
            }
            Err(error) => {
                op.status = OpStatus::Failed;
                let code = error.code;
                op.last_error = Some(error.message.clone());
                op.error = Some(error);
                TraceEvent::AsyncOpFailed {
                    op_id: op_id.to_owned(),
                    code,
                }
            }
        };
        op.completed_at = Some(Utc::now());
        self.journal.append(&JournalRecord::AsyncOp(op.clone()));
        drop(ops);

        self.sink.emit(event);
        true
    }

    /// Record a terminal outcome for a call that never dispatched
    /// (unknown tool, rejected input). Inserts the row if absent; refuses
    /// to touch an existing terminal row.
    pub fn record_synthetic(&self, turn_id: Uuid, op_id: &str, outcome: &ToolOutcome) -> bool {
        {
            let mut ops = self.ops.write();
            if let Some(existing) = ops.get(op_id) {
                if existing.status.is_terminal() {
                    return false;
                }
            } else {
                let op = AsyncOp {
                    op_id: op_id.to_owned(),
                    turn_id,
                    target_type: None,
                    target_id: None,
                    status: OpStatus::Pending,
                    sync: false,
                    result: None,
                    error: None,
                    created_at: Utc::now(),
                    completed_at: None,
                    timeout_at: None,
                    attempt_number: 1,
                    max_attempts: 1,
                    backoff_ms: 0,
                    last_error: None,
                };
                ops.insert(op_id.to_owned(), op);
            }
        }
        if outcome.success {
            self.complete(op_id, outcome.result.clone().unwrap_or(Value::Null))
        } else {
            let error = outcome.error.clone().unwrap_or_else(|| {
                ToolError::new(
                    cq_domain::tool::ToolErrorCode::InternalError,
                    "missing error detail",
                    false,
                )
            });
            self.fail(op_id, error)
        }
    }

    pub fn get(&self, op_id: &str) -> Option<AsyncOp> {
        self.ops.read().get(op_id).cloned()
    }

    pub fn has_pending(&self, turn_id: Uuid) -> bool {
        self.get_pending_count(turn_id) > 0
    }

    pub fn get_pending_count(&self, turn_id: Uuid) -> usize {
        self.ops
            .read()
            .values()
            .filter(|op| op.turn_id == turn_id && op.status == OpStatus::Pending)
            .count()
    }

    /// Non-terminal ops of one turn, oldest first.
    pub fn get_open_for_turn(&self, turn_id: Uuid) -> Vec<AsyncOp> {
        let mut open: Vec<AsyncOp> = self
            .ops
            .read()
            .values()
            .filter(|op| op.turn_id == turn_id && !op.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        open
    }

    pub fn has_waiting(&self, turn_id: Uuid) -> bool {
        self.ops
            .read()
            .values()
            .any(|op| op.turn_id == turn_id && op.status == OpStatus::Waiting)
    }

    /// Every non-terminal op whose deadline has passed — waiting rows
    /// time out by the same rule as pending ones.
    pub fn get_timed_out(&self, now: DateTime<Utc>) -> Vec<AsyncOp> {
        let mut timed_out: Vec<AsyncOp> = self
            .ops
            .read()
            .values()
            .filter(|op| {
                !op.status.is_terminal() && op.timeout_at.is_some_and(|t| t < now)
            })
            .cloned()
            .collect();
        timed_out.sort_by_key(|op| op.timeout_at);
        timed_out
    }

    /// The next deadline across all non-terminal ops, if any.
    pub fn get_earliest_timeout(&self) -> Option<DateTime<Utc>> {
        self.ops
            .read()
            .values()
            .filter(|op| !op.status.is_terminal())
            .filter_map(|op| op.timeout_at)
            .min()
    }

    pub fn can_retry(&self, op_id: &str) -> bool {
        self.ops
            .read()
            .get(op_id)
            .is_some_and(|op| !op.status.is_terminal() && op.attempt_number < op.max_attempts)
    }

    /// Re-queue a timed-out op for another attempt: increment the attempt
    /// counter, reset to `pending`, recompute the deadline from the
    /// backoff. Returns the new deadline, or `None` when the retry budget
    /// is exhausted.
    pub fn prepare_retry(&self, op_id: &str, last_error: &str) -> Option<DateTime<Utc>> {
        let mut ops = self.ops.write();
        let op = ops.get_mut(op_id)?;
        if op.status.is_terminal() || op.attempt_number >= op.max_attempts {
            return None;
        }
        op.attempt_number += 1;
        op.status = OpStatus::Pending;
        op.last_error = Some(last_error.to_owned());
        let new_timeout = Utc::now() + chrono::Duration::milliseconds(op.backoff_ms as i64);
        op.timeout_at = Some(new_timeout);
        let attempt = op.attempt_number;
        self.journal.append(&JournalRecord::AsyncOp(op.clone()));
        drop(ops);

        self.sink.emit(TraceEvent::AsyncOpRetried {
            op_id: op_id.to_owned(),
            attempt,
        });
        Some(new_timeout)
    }

    pub(crate) fn restore(&self, op: AsyncOp) {
        self.ops.write().insert(op.op_id.clone(), op);
    }

    pub(crate) fn snapshot(&self) -> Vec<AsyncOp> {
        let mut all: Vec<AsyncOp> = self.ops.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_domain::async_op::{OpTargetType, RetryPolicy};
    use cq_domain::tool::ToolErrorCode;
    use cq_domain::trace::RecordingSink;

    fn store() -> AsyncOpStore {
        AsyncOpStore::new(Arc::new(Journal::memory()), Arc::new(RecordingSink::new()))
    }

    fn track(store: &AsyncOpStore, op_id: &str, turn_id: Uuid, timeout_at: Option<DateTime<Utc>>) {
        store.track(TrackParams {
            op_id: op_id.into(),
            turn_id,
            target_type: OpTargetType::Task,
            target_id: "task1".into(),
            timeout_at,
            retry: None,
        });
    }

    #[test]
    fn track_is_unique_per_call_id() {
        let store = store();
        let turn_id = Uuid::now_v7();
        track(&store, "c1", turn_id, None);
        // Second track with the same id changes nothing.
        assert!(!store.track(TrackParams {
            op_id: "c1".into(),
            turn_id,
            target_type: OpTargetType::Workflow,
            target_id: "other".into(),
            timeout_at: None,
            retry: None,
        }));
        let op = store.get("c1").unwrap();
        assert_eq!(op.target_type, Some(OpTargetType::Task));
    }

    #[test]
    fn mark_waiting_transitions_pending() {
        let store = store();
        let turn_id = Uuid::now_v7();
        track(&store, "c1", turn_id, None);
        assert!(!store.get("c1").unwrap().sync);
        assert!(store.mark_waiting(turn_id, "c1"));
        let op = store.get("c1").unwrap();
        assert_eq!(op.status, OpStatus::Waiting);
        assert!(op.sync);
        assert!(store.has_waiting(turn_id));
        assert_eq!(store.get_pending_count(turn_id), 0);
    }

    #[test]
    fn mark_waiting_inserts_when_absent() {
        let store = store();
        let turn_id = Uuid::now_v7();
        assert!(store.mark_waiting(turn_id, "ghost"));
        let op = store.get("ghost").unwrap();
        assert_eq!(op.status, OpStatus::Waiting);
        assert!(op.target_type.is_none());
    }

    #[test]
    fn complete_only_from_live_states() {
        let store = store();
        let turn_id = Uuid::now_v7();
        track(&store, "c1", turn_id, None);
        assert!(store.complete("c1", serde_json::json!("ok")));
        // Terminal: a second completion or failure is refused.
        assert!(!store.complete("c1", serde_json::json!("again")));
        assert!(!store.fail(
            "c1",
            ToolError::new(ToolErrorCode::Timeout, "late", true)
        ));
        // Unknown op id.
        assert!(!store.complete("nope", serde_json::Value::Null));

        let op = store.get("c1").unwrap();
        assert_eq!(op.status, OpStatus::Completed);
        assert_eq!(op.result, Some(serde_json::json!("ok")));
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn fail_records_error_and_last_error() {
        let store = store();
        let turn_id = Uuid::now_v7();
        track(&store, "c1", turn_id, None);
        assert!(store.fail(
            "c1",
            ToolError::new(ToolErrorCode::ExecutionFailed, "boom", false)
        ));
        let op = store.get("c1").unwrap();
        assert_eq!(op.status, OpStatus::Failed);
        assert_eq!(op.last_error.as_deref(), Some("boom"));
        assert_eq!(op.error.unwrap().code, ToolErrorCode::ExecutionFailed);
    }

    #[test]
    fn resume_from_waiting() {
        let store = store();
        let turn_id = Uuid::now_v7();
        track(&store, "c1", turn_id, None);
        store.mark_waiting(turn_id, "c1");
        assert!(store.resume("c1", serde_json::json!("late result")));
        assert_eq!(store.get("c1").unwrap().status, OpStatus::Completed);
    }

    #[test]
    fn synthetic_failure_inserts_terminal_row_once() {
        let store = store();
        let turn_id = Uuid::now_v7();
        let outcome = ToolOutcome::err(ToolError::new(
            ToolErrorCode::NotFound,
            "no such tool: nope",
            false,
        ));
        assert!(store.record_synthetic(turn_id, "c1", &outcome));
        // Applying the same synthetic result again is refused.
        assert!(!store.record_synthetic(turn_id, "c1", &outcome));

        let op = store.get("c1").unwrap();
        assert_eq!(op.status, OpStatus::Failed);
        assert!(op.target_type.is_none());
        assert_eq!(op.error.unwrap().code, ToolErrorCode::NotFound);
    }

    #[test]
    fn pending_count_excludes_waiting_and_terminal() {
        let store = store();
        let turn_id = Uuid::now_v7();
        track(&store, "c1", turn_id, None);
        track(&store, "c2", turn_id, None);
        track(&store, "c3", turn_id, None);
        store.mark_waiting(turn_id, "c2");
        store.complete("c3", serde_json::Value::Null);

        assert_eq!(store.get_pending_count(turn_id), 1);
        assert!(store.has_pending(turn_id));
        assert!(store.has_waiting(turn_id));
    }

    #[test]
    fn timed_out_includes_waiting_rows() {
        let store = store();
        let turn_id = Uuid::now_v7();
        let past = Utc::now() - chrono::Duration::seconds(5);
        let future = Utc::now() + chrono::Duration::seconds(300);

        track(&store, "expired-pending", turn_id, Some(past));
        track(&store, "expired-waiting", turn_id, Some(past));
        store.mark_waiting(turn_id, "expired-waiting");
        track(&store, "alive", turn_id, Some(future));
        track(&store, "no-deadline", turn_id, None);

        let timed_out = store.get_timed_out(Utc::now());
        let ids: Vec<&str> = timed_out.iter().map(|op| op.op_id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"expired-pending"));
        assert!(ids.contains(&"expired-waiting"));
    }

    #[test]
    fn earliest_timeout_ignores_terminal_rows() {
        let store = store();
        let turn_id = Uuid::now_v7();
        let soon = Utc::now() + chrono::Duration::seconds(10);
        let later = Utc::now() + chrono::Duration::seconds(600);

        track(&store, "c1", turn_id, Some(soon));
        track(&store, "c2", turn_id, Some(later));
        assert_eq!(store.get_earliest_timeout(), Some(soon));

        store.complete("c1", serde_json::Value::Null);
        assert_eq!(store.get_earliest_timeout(), Some(later));

        store.fail(
            "c2",
            ToolError::new(ToolErrorCode::Timeout, "deadline", true),
        );
        assert!(store.get_earliest_timeout().is_none());
    }

    #[test]
    fn retry_flow() {
        let store = store();
        let turn_id = Uuid::now_v7();
        store.track(TrackParams {
            op_id: "c1".into(),
            turn_id,
            target_type: OpTargetType::Task,
            target_id: "task1".into(),
            timeout_at: Some(Utc::now() - chrono::Duration::seconds(1)),
            retry: Some(RetryPolicy {
                max_attempts: 2,
                backoff_ms: 30_000,
            }),
        });
        store.mark_waiting(turn_id, "c1");

        assert!(store.can_retry("c1"));
        let new_deadline = store.prepare_retry("c1", "timed out").unwrap();
        assert!(new_deadline > Utc::now());

        let op = store.get("c1").unwrap();
        assert_eq!(op.status, OpStatus::Pending);
        assert_eq!(op.attempt_number, 2);
        assert_eq!(op.last_error.as_deref(), Some("timed out"));
        // The sync marker survives the requeue.
        assert!(op.sync);

        // Budget exhausted.
        assert!(!store.can_retry("c1"));
        assert!(store.prepare_retry("c1", "again").is_none());
    }

    #[test]
    fn retry_refused_without_budget() {
        let store = store();
        let turn_id = Uuid::now_v7();
        track(&store, "c1", turn_id, None);
        assert!(!store.can_retry("c1"));
        assert!(store.prepare_retry("c1", "e").is_none());
        assert!(!store.can_retry("unknown"));
    }
}
