use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio::sync::RwLock;

const KEY_SEPARATOR: char = ':';

/// Order-independent identifier for a two-party conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    key: String,
    first: String,
    second: String,
}

impl ConversationKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The two participants in lexicographic order.
    pub fn participants(&self) -> (&str, &str) {
        (&self.first, &self.second)
    }

    /// The participant that is not `user_id`.
    pub fn other(&self, user_id: &str) -> &str {
        if self.first == user_id {
            &self.second
        } else {
            &self.first
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl From<ConversationKey> for String {
    fn from(key: ConversationKey) -> Self {
        key.key
    }
}

pub fn conversation_key(a: &str, b: &str) -> ConversationKey {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    ConversationKey {
        key: format!("{first}{KEY_SEPARATOR}{second}"),
        first: first.to_string(),
        second: second.to_string(),
    }
}

/// Who is currently typing in each conversation. An entry exists only while
/// at least one user is typing in it.
#[derive(Default)]
pub struct TypingTracker {
    typing: RwLock<HashMap<ConversationKey, HashSet<String>>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_typing(&self, key: &ConversationKey, user_id: &str) {
        let mut typing = self.typing.write().await;
        typing
            .entry(key.clone())
            .or_default()
            .insert(user_id.to_string());
    }

    /// Returns whether `user_id` was typing.
    pub async fn stop_typing(&self, key: &ConversationKey, user_id: &str) -> bool {
        let mut typing = self.typing.write().await;
        let Some(users) = typing.get_mut(key) else {
            return false;
        };
        let removed = users.remove(user_id);
        if users.is_empty() {
            typing.remove(key);
        }
        removed
    }

    /// Drops `user_id` from every conversation and returns the keys it was
    /// removed from.
    pub async fn stop_all(&self, user_id: &str) -> Vec<ConversationKey> {
        let mut typing = self.typing.write().await;
        let mut stopped = Vec::new();
        typing.retain(|key, users| {
            if users.remove(user_id) {
                stopped.push(key.clone());
            }
            !users.is_empty()
        });
        stopped
    }

    pub async fn is_typing(&self, key: &ConversationKey, user_id: &str) -> bool {
        self.typing
            .read()
            .await
            .get(key)
            .is_some_and(|users| users.contains(user_id))
    }

    pub async fn typing_users(&self, key: &ConversationKey) -> HashSet<String> {
        self.typing.read().await.get(key).cloned().unwrap_or_default()
    }

    /// Whether the tracker holds an entry for `key` at all.
    pub async fn has_entry(&self, key: &ConversationKey) -> bool {
        self.typing.read().await.contains_key(key)
    }
}
