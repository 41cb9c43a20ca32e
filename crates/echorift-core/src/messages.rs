use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::errors::RiftError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadKind {
    Text,
    Voice,
}

/// A conversation channel. Voice threads double as the room identity
/// passed to the session controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub kind: ThreadKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub author: String,
    pub body: String,
    pub timestamp_ms: u64,
}

struct StoreState {
    threads: Vec<Thread>,
    /// Keyed by thread id, messages in arrival order.
    messages: HashMap<String, Vec<Message>>,
}

/// In-memory store for chat threads and their messages.
///
/// Session-scoped: nothing here survives a restart.
pub struct MessageStore {
    inner: Mutex<StoreState>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StoreState {
                threads: Vec::new(),
                messages: HashMap::new(),
            }),
        }
    }

    pub fn add_thread(&self, name: &str, kind: ThreadKind) -> Thread {
        let thread = Thread {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            kind,
        };
        let mut state = self.inner.lock().unwrap();
        state.messages.insert(thread.id.clone(), Vec::new());
        state.threads.push(thread.clone());
        thread
    }

    pub fn threads(&self) -> Vec<Thread> {
        self.inner.lock().unwrap().threads.clone()
    }

    /// Append a message to a thread. Timestamp and id are assigned here.
    pub fn post(&self, thread_id: &str, author: &str, body: &str) -> Result<Message, RiftError> {
        if body.trim().is_empty() {
            return Err(RiftError::Command("message body is empty".to_string()));
        }
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            author: author.to_string(),
            body: body.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
        };

        let mut state = self.inner.lock().unwrap();
        let Some(list) = state.messages.get_mut(thread_id) else {
            return Err(RiftError::Room(format!("unknown thread: {thread_id}")));
        };
        list.push(message.clone());
        Ok(message)
    }

    /// Messages of one thread, oldest first. Empty for unknown threads.
    pub fn messages(&self, thread_id: &str) -> Vec<Message> {
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_thread(&self, thread_id: &str) {
        if let Some(list) = self.inner.lock().unwrap().messages.get_mut(thread_id) {
            list.clear();
        }
    }

    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap();
        state.threads.clear();
        state.messages.clear();
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_and_list_in_order() {
        let store = MessageStore::new();
        let thread = store.add_thread("general", ThreadKind::Text);

        store.post(&thread.id, "alice", "hello").unwrap();
        store.post(&thread.id, "bob", "hi there").unwrap();

        let messages = store.messages(&thread.id);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].author, "alice");
        assert_eq!(messages[1].body, "hi there");
        assert_ne!(messages[0].id, messages[1].id);
    }

    #[test]
    fn post_to_unknown_thread_fails() {
        let store = MessageStore::new();
        let err = store.post("nope", "alice", "hello").unwrap_err();
        assert!(matches!(err, RiftError::Room(_)));
    }

    #[test]
    fn empty_body_is_rejected() {
        let store = MessageStore::new();
        let thread = store.add_thread("general", ThreadKind::Text);
        assert!(store.post(&thread.id, "alice", "   ").is_err());
        assert!(store.messages(&thread.id).is_empty());
    }

    #[test]
    fn threads_are_isolated() {
        let store = MessageStore::new();
        let a = store.add_thread("general", ThreadKind::Text);
        let b = store.add_thread("random", ThreadKind::Text);

        store.post(&a.id, "alice", "in general").unwrap();
        assert_eq!(store.messages(&a.id).len(), 1);
        assert!(store.messages(&b.id).is_empty());
    }

    #[test]
    fn clear_thread_keeps_the_thread() {
        let store = MessageStore::new();
        let thread = store.add_thread("general", ThreadKind::Text);
        store.post(&thread.id, "alice", "hello").unwrap();

        store.clear_thread(&thread.id);
        assert!(store.messages(&thread.id).is_empty());
        assert_eq!(store.threads().len(), 1);
        // Posting after a clear still works.
        store.post(&thread.id, "alice", "again").unwrap();
        assert_eq!(store.messages(&thread.id).len(), 1);
    }

    #[test]
    fn clear_drops_everything() {
        let store = MessageStore::new();
        let thread = store.add_thread("general", ThreadKind::Voice);
        store.post(&thread.id, "alice", "hello").unwrap();

        store.clear();
        assert!(store.threads().is_empty());
        assert!(store.post(&thread.id, "alice", "gone").is_err());
    }
}
