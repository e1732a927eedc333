//! Persistence collaborator for messages and user last-seen times.
//!
//! The realtime core only depends on the two traits; `MemoryStore` backs both
//! for a single-process deployment and for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::messages::{ChatMessage, MessageId};

/// A message before the store has assigned its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub media_type: Option<String>,
    pub originalname: Option<String>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// All messages exchanged between `a` and `b`, oldest first.
    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>, StoreError>;

    /// Everyone `user_id` has exchanged messages with, paired with the time
    /// of the latest message, most recent first.
    async fn recent_partners(&self, user_id: &str) -> Result<Vec<(String, DateTime<Utc>)>, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// `None` marks the user as currently online.
    async fn set_last_seen(&self, user_id: &str, at: Option<DateTime<Utc>>) -> Result<(), StoreError>;

    async fn last_seen(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
}

#[derive(Default)]
pub struct MemoryStore {
    next_id: AtomicU64,
    messages: RwLock<Vec<ChatMessage>>,
    last_seen: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_id(&self) -> MessageId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn save(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let mut messages = self.messages.write().await;
        let saved = ChatMessage {
            id: self.allocate_id(),
            sender: message.sender,
            receiver: message.receiver,
            content: message.content,
            media_type: message.media_type,
            originalname: message.originalname,
            timestamp: Utc::now(),
            read: false,
            client_id: None,
        };
        messages.push(saved.clone());
        Ok(saved)
    }

    async fn conversation(&self, a: &str, b: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.read().await;
        let mut history: Vec<ChatMessage> = messages
            .iter()
            .filter(|m| m.is_between(a, b))
            .cloned()
            .collect();
        history.sort_by(|x, y| x.timestamp.cmp(&y.timestamp).then(x.id.cmp(&y.id)));
        Ok(history)
    }

    async fn recent_partners(&self, user_id: &str) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let messages = self.messages.read().await;
        let mut latest: HashMap<&str, (DateTime<Utc>, MessageId)> = HashMap::new();
        for m in messages.iter() {
            let other = if m.sender == user_id {
                m.receiver.as_str()
            } else if m.receiver == user_id {
                m.sender.as_str()
            } else {
                continue;
            };
            let entry = latest.entry(other).or_insert((m.timestamp, m.id));
            if (m.timestamp, m.id) > *entry {
                *entry = (m.timestamp, m.id);
            }
        }

        let mut partners: Vec<(String, DateTime<Utc>, MessageId)> = latest
            .into_iter()
            .map(|(other, (at, id))| (other.to_string(), at, id))
            .collect();
        partners.sort_by(|x, y| (y.1, y.2).cmp(&(x.1, x.2)));
        Ok(partners.into_iter().map(|(other, at, _)| (other, at)).collect())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn set_last_seen(&self, user_id: &str, at: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let mut last_seen = self.last_seen.write().await;
        match at {
            Some(at) => {
                last_seen.insert(user_id.to_string(), at);
            }
            None => {
                last_seen.remove(user_id);
            }
        }
        Ok(())
    }

    async fn last_seen(&self, user_id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.last_seen.read().await.get(user_id).copied())
    }
}
