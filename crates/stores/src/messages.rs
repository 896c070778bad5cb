//! Message table. Append-only.

use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use cq_domain::message::{Message, MessageRole};
use cq_domain::trace::{TraceEvent, TraceSink};

use crate::journal::{Journal, JournalRecord};

pub struct MessageStore {
    conversation_id: String,
    /// Kept in creation order; the UUIDv7 id doubles as the sort key.
    messages: RwLock<Vec<Message>>,
    journal: Arc<Journal>,
    sink: Arc<dyn TraceSink>,
}

impl MessageStore {
    pub fn new(
        conversation_id: &str,
        journal: Arc<Journal>,
        sink: Arc<dyn TraceSink>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_owned(),
            messages: RwLock::new(Vec::new()),
            journal,
            sink,
        }
    }

    pub fn append(&self, turn_id: Uuid, role: MessageRole, content: String) -> Uuid {
        let message = Message::new(self.conversation_id.clone(), turn_id, role, content);
        let message_id = message.id;
        self.journal.append(&JournalRecord::Message(message.clone()));
        self.messages.write().push(message);
        self.sink.emit(TraceEvent::MessageAppended {
            message_id,
            turn_id,
            role: match role {
                MessageRole::User => "user".to_owned(),
                MessageRole::Agent => "agent".to_owned(),
            },
        });
        message_id
    }

    /// Messages of one turn in creation order.
    pub fn get_for_turn(&self, turn_id: Uuid) -> Vec<Message> {
        self.messages
            .read()
            .iter()
            .filter(|m| m.turn_id == turn_id)
            .cloned()
            .collect()
    }

    /// Most recent messages first.
    pub fn get_recent(&self, limit: usize) -> Vec<Message> {
        let messages = self.messages.read();
        messages.iter().rev().take(limit).cloned().collect()
    }

    /// Whole conversation in creation order.
    pub fn get_for_conversation(&self) -> Vec<Message> {
        self.messages.read().clone()
    }

    pub(crate) fn restore(&self, message: Message) {
        let mut messages = self.messages.write();
        messages.push(message);
        messages.sort_by_key(|m| m.id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Message> {
        self.messages.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cq_domain::trace::RecordingSink;

    fn store() -> MessageStore {
        MessageStore::new(
            "conv1",
            Arc::new(Journal::memory()),
            Arc::new(RecordingSink::new()),
        )
    }

    #[test]
    fn append_and_query_by_turn() {
        let store = store();
        let t1 = Uuid::now_v7();
        let t2 = Uuid::now_v7();
        store.append(t1, MessageRole::User, "hi".into());
        store.append(t1, MessageRole::Agent, "hello".into());
        store.append(t2, MessageRole::User, "other turn".into());

        let for_t1 = store.get_for_turn(t1);
        assert_eq!(for_t1.len(), 2);
        assert_eq!(for_t1[0].content, "hi");
        assert_eq!(for_t1[1].content, "hello");
    }

    #[test]
    fn recent_is_newest_first() {
        let store = store();
        let turn_id = Uuid::now_v7();
        for i in 0..5 {
            store.append(turn_id, MessageRole::User, format!("m{i}"));
        }
        let recent = store.get_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m4");
        assert_eq!(recent[1].content, "m3");
    }

    #[test]
    fn conversation_order_is_creation_order() {
        let store = store();
        let turn_id = Uuid::now_v7();
        store.append(turn_id, MessageRole::User, "first".into());
        store.append(turn_id, MessageRole::Agent, "second".into());
        let all = store.get_for_conversation();
        assert_eq!(all[0].content, "first");
        assert_eq!(all[1].content, "second");
    }
}
