use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;

use crate::messages::MessageId;

/// Readers per message. Entries only grow for the life of the process.
#[derive(Default)]
pub struct ReadReceipts {
    readers: RwLock<HashMap<MessageId, HashSet<String>>>,
}

impl ReadReceipts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `reader_id` has read `message_id`. Returns false when it
    /// was already recorded.
    pub async fn mark_read(&self, message_id: MessageId, reader_id: &str) -> bool {
        let mut readers = self.readers.write().await;
        readers
            .entry(message_id)
            .or_default()
            .insert(reader_id.to_string())
    }

    pub async fn readers(&self, message_id: MessageId) -> HashSet<String> {
        self.readers
            .read()
            .await
            .get(&message_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn has_read(&self, message_id: MessageId, reader_id: &str) -> bool {
        self.readers
            .read()
            .await
            .get(&message_id)
            .is_some_and(|readers| readers.contains(reader_id))
    }
}
