//! Single-slot earliest-deadline alarm, one per conversation actor.
//!
//! `schedule` only arms when the new deadline is earlier than the one
//! currently set; the sweep rearms from the AsyncOp table afterwards.
//! The slot is just a tokio sleeper feeding `Command::Alarm` into the
//! actor's own mailbox, so timeout handling is serialized with every
//! other callback.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use cq_domain::trace::{TraceEvent, TraceSink};
use std::sync::Arc;

use crate::actor::Command;

struct Armed {
    at: DateTime<Utc>,
    abort: AbortHandle,
}

pub struct AlarmSlot {
    conversation_id: String,
    slot: Mutex<Option<Armed>>,
    tx: mpsc::Sender<Command>,
    sink: Arc<dyn TraceSink>,
}

impl AlarmSlot {
    pub fn new(
        conversation_id: &str,
        tx: mpsc::Sender<Command>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            slot: Mutex::new(None),
            tx,
            sink,
        }
    }

    /// The currently armed deadline, if any.
    pub fn current(&self) -> Option<DateTime<Utc>> {
        self.slot.lock().as_ref().map(|armed| armed.at)
    }

    /// Arm the alarm for `at` unless an earlier (or equal) deadline is
    /// already set.
    pub fn schedule(&self, at: DateTime<Utc>) {
        let mut slot = self.slot.lock();
        if let Some(armed) = slot.as_ref() {
            if armed.at <= at {
                return;
            }
        }
        let previous = slot.replace(self.arm(at));
        drop(slot);

        if let Some(previous) = previous {
            previous.abort.abort();
        }
        self.sink.emit(TraceEvent::AlarmArmed {
            conversation_id: self.conversation_id.clone(),
            at,
        });
    }

    /// Replace the alarm outright: clear it, then arm for `next` if any.
    /// Called after a timeout sweep with the store's earliest remaining
    /// deadline.
    pub fn rearm(&self, next: Option<DateTime<Utc>>) {
        let mut slot = self.slot.lock();
        let previous = slot.take();
        if let Some(at) = next {
            *slot = Some(self.arm(at));
        }
        drop(slot);

        if let Some(previous) = previous {
            previous.abort.abort();
        }
        match next {
            Some(at) => self.sink.emit(TraceEvent::AlarmArmed {
                conversation_id: self.conversation_id.clone(),
                at,
            }),
            None => self.sink.emit(TraceEvent::AlarmCleared {
                conversation_id: self.conversation_id.clone(),
            }),
        }
    }

    fn arm(&self, at: DateTime<Utc>) -> Armed {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // The actor may be gone; a failed send is fine.
            let _ = tx.send(Command::Alarm).await;
        });
        Armed {
            at,
            abort: handle.abort_handle(),
        }
    }
}

impl Drop for AlarmSlot {
    fn drop(&mut self) {
        if let Some(armed) = self.slot.lock().take() {
            armed.abort.abort();
        }
    }
}
