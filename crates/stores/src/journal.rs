//! Per-conversation JSONL journal.
//!
//! One record is appended per store mutation (the full row after the
//! mutation, so replay is a plain upsert). Opening a journal replays it;
//! the caller then rewrites a compacted snapshot through an atomic
//! tmp-rename so the file holds one record per live row.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cq_domain::async_op::AsyncOp;
use cq_domain::error::Result;
use cq_domain::message::Message;
use cq_domain::moves::Move;
use cq_domain::participant::{Participant, ParticipantType};
use cq_domain::turn::Turn;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Journal record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum JournalRecord {
    Turn(Turn),
    Message(Message),
    Move(Move),
    AsyncOp(AsyncOp),
    Participant(Participant),
    ParticipantRemoved {
        participant_type: ParticipantType,
        participant_id: String,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Journal
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Journal {
    /// `None` = in-memory only; appends are no-ops.
    path: Option<PathBuf>,
}

impl Journal {
    /// A journal that never touches disk.
    pub fn memory() -> Self {
        Self { path: None }
    }

    /// Open (or create) the journal for a conversation and read all
    /// existing records. Unparseable lines are skipped with a warning.
    pub fn open(
        state_dir: Option<&Path>,
        conversation_id: &str,
    ) -> Result<(Self, Vec<JournalRecord>)> {
        let Some(dir) = state_dir else {
            return Ok((Self { path: None }, Vec::new()));
        };

        let dir = dir.join("conversations");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{conversation_id}.jsonl"));

        let mut records = Vec::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            for (lineno, line) in content.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalRecord>(line) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            line = lineno + 1,
                            path = %path.display(),
                            "skipping unparseable journal line"
                        );
                    }
                }
            }
        }

        Ok((Self { path: Some(path) }, records))
    }

    /// Append one record. Write failures are logged, never propagated —
    /// the in-memory tables remain the source of truth for the running
    /// actor.
    pub fn append(&self, record: &JournalRecord) {
        let Some(path) = &self.path else {
            return;
        };
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize journal record");
                return;
            }
        };
        match std::fs::OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut file) => {
                if let Err(e) = writeln!(file, "{json}") {
                    tracing::warn!(error = %e, path = %path.display(), "journal append failed");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "journal open failed");
            }
        }
    }

    /// Replace the journal with a compacted snapshot (atomic tmp-rename).
    pub fn rewrite(&self, records: &[JournalRecord]) {
        let Some(path) = &self.path else {
            return;
        };
        let tmp = path.with_extension("jsonl.tmp");
        let mut ok = false;
        if let Ok(mut f) = std::fs::File::create(&tmp) {
            ok = true;
            for record in records {
                if let Ok(json) = serde_json::to_string(record) {
                    if writeln!(f, "{json}").is_err() {
                        ok = false;
                        break;
                    }
                }
            }
        }
        if ok {
            let _ = std::fs::rename(&tmp, path);
        } else {
            let _ = std::fs::remove_file(&tmp);
        }
    }
}
