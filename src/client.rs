//! Client-side view of one open conversation.
//!
//! [`ChatView`] merges three sources into one chronologically ordered list:
//! the history fetch, optimistic entries added on send, and realtime events.
//! Optimistic entries are matched to confirmations by correlation id when the
//! server echoes one, and otherwise by the first unconfirmed entry with the
//! same content, sender and receiver.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::messages::{
    ChatMessage, ClientEvent, ErrorNotice, MessageId, ReadAck, ReadNotice, SendMessage, ServerEvent,
    TypingNotice, TypingTarget,
};

/// How long an optimistic entry may stay in `Sending` before the view gives up
/// waiting and shows it as sent.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewMessage {
    /// Server id; `None` until the send is confirmed.
    pub id: Option<MessageId>,
    /// Client-generated id of an optimistic entry.
    pub temp_id: Option<String>,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    pub media_type: Option<String>,
    pub originalname: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    pub read_by: Option<String>,
    pub status: MessageStatus,
    pub is_optimistic: bool,
}

impl ViewMessage {
    fn from_server(message: ChatMessage, status: MessageStatus) -> Self {
        ViewMessage {
            id: Some(message.id),
            temp_id: None,
            sender: message.sender,
            receiver: message.receiver,
            content: message.content,
            media_type: message.media_type,
            originalname: message.originalname,
            timestamp: message.timestamp,
            read: message.read,
            read_by: None,
            status,
            is_optimistic: false,
        }
    }

    fn confirms(&self, message: &ChatMessage) -> bool {
        self.is_optimistic
            && self.content == message.content
            && self.sender == message.sender
            && self.receiver == message.receiver
    }
}

/// Side effects the caller must carry out after applying a server event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Index of the entry that was added or changed.
    pub changed: Option<usize>,
    /// Optimistic entry that no longer waits for a confirmation; its pending
    /// timer should be cancelled.
    pub resolved: Option<String>,
    /// Frame to send back to the server.
    pub reply: Option<ClientEvent>,
}

pub struct ChatView {
    me: String,
    peer: String,
    messages: Vec<ViewMessage>,
    peer_typing: bool,
    online: HashSet<String>,
}

impl ChatView {
    pub fn new(me: impl Into<String>, peer: impl Into<String>) -> Self {
        ChatView {
            me: me.into(),
            peer: peer.into(),
            messages: Vec::new(),
            peer_typing: false,
            online: HashSet::new(),
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn messages(&self) -> &[ViewMessage] {
        &self.messages
    }

    pub fn is_peer_typing(&self) -> bool {
        self.peer_typing
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.contains(user_id)
    }

    /// Seeds presence from a snapshot such as `GET /api/chats/active-users`,
    /// taken before realtime events start arriving.
    pub fn set_online<I, S>(&mut self, user_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.online = user_ids.into_iter().map(Into::into).collect();
    }

    /// Seeds the list from a history fetch. Entries that only exist locally,
    /// such as unconfirmed sends or messages that arrived while the fetch was
    /// in flight, are kept after the history.
    pub fn load_history(&mut self, mut history: Vec<ChatMessage>) {
        history.retain(|m| m.is_between(&self.me, &self.peer));
        history.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        let known: HashSet<MessageId> = history.iter().map(|m| m.id).collect();
        let local: Vec<ViewMessage> = self
            .messages
            .drain(..)
            .filter(|m| m.id.map_or(true, |id| !known.contains(&id)))
            .collect();

        self.messages = history
            .into_iter()
            .map(|m| {
                let status = if m.read {
                    MessageStatus::Read
                } else if m.sender == self.me {
                    MessageStatus::Sent
                } else {
                    MessageStatus::Delivered
                };
                ViewMessage::from_server(m, status)
            })
            .collect();
        self.messages.extend(local);
    }

    /// Appends an optimistic entry and returns its temporary id together with
    /// the frame that sends it.
    pub fn send(
        &mut self,
        content: impl Into<String>,
        media_type: Option<String>,
        originalname: Option<String>,
    ) -> (String, ClientEvent) {
        let temp_id = format!("temp-{}", Uuid::new_v4());
        let content = content.into();
        self.messages.push(ViewMessage {
            id: None,
            temp_id: Some(temp_id.clone()),
            sender: self.me.clone(),
            receiver: self.peer.clone(),
            content: content.clone(),
            media_type: media_type.clone(),
            originalname: originalname.clone(),
            timestamp: Utc::now(),
            read: false,
            read_by: None,
            status: MessageStatus::Sending,
            is_optimistic: true,
        });

        let frame = ClientEvent::SendMessage(SendMessage {
            to: self.peer.clone(),
            content,
            media_type,
            originalname,
            client_id: Some(temp_id.clone()),
        });
        (temp_id, frame)
    }

    pub fn typing_frame(&self, started: bool) -> ClientEvent {
        let target = TypingTarget { to: self.peer.clone() };
        if started {
            ClientEvent::TypingStart(target)
        } else {
            ClientEvent::TypingStop(target)
        }
    }

    pub fn apply(&mut self, event: ServerEvent) -> Applied {
        match event {
            ServerEvent::MessageSent(message) => self.on_message_sent(message),
            ServerEvent::ReceiveMessage(message) => self.on_receive_message(message),
            ServerEvent::MessageRead(notice) => Applied {
                changed: self.on_message_read(&notice),
                ..Applied::default()
            },
            ServerEvent::TypingStart(notice) => {
                self.on_typing(&notice, true);
                Applied::default()
            }
            ServerEvent::TypingStop(notice) => {
                self.on_typing(&notice, false);
                Applied::default()
            }
            ServerEvent::UserOnline(user_id) => {
                self.online.insert(user_id);
                Applied::default()
            }
            ServerEvent::UserOffline(user_id) => {
                self.online.remove(&user_id);
                Applied::default()
            }
            ServerEvent::Error(notice) => self.on_error(&notice),
        }
    }

    /// Replaces the matching optimistic entry with the confirmed message. A
    /// confirmation with no match is dropped.
    pub fn on_message_sent(&mut self, message: ChatMessage) -> Applied {
        if message.sender != self.me || message.receiver != self.peer {
            return Applied::default();
        }
        if self.position_of(message.id).is_some() {
            return Applied::default();
        }
        let Some(index) = self.find_optimistic(&message) else {
            return Applied::default();
        };
        let resolved = self.messages[index].temp_id.clone();
        self.messages[index] = ViewMessage::from_server(message, MessageStatus::Sent);
        Applied {
            changed: Some(index),
            resolved,
            reply: None,
        }
    }

    /// Adds an incoming message, or settles the matching optimistic entry when
    /// it is an echo of our own send. Messages addressed to us are acknowledged
    /// with a read receipt.
    pub fn on_receive_message(&mut self, message: ChatMessage) -> Applied {
        if !message.is_between(&self.me, &self.peer) {
            return Applied::default();
        }
        // the server only tells the sender that typing stopped
        if message.sender == self.peer {
            self.peer_typing = false;
        }
        let reply = (message.receiver == self.me).then(|| {
            ClientEvent::MessageRead(ReadAck {
                message_id: message.id,
                sender_id: Some(message.sender.clone()),
            })
        });

        if self.position_of(message.id).is_some() {
            return Applied {
                reply,
                ..Applied::default()
            };
        }

        if let Some(index) = self.find_optimistic(&message) {
            let resolved = self.messages[index].temp_id.clone();
            self.messages[index] = ViewMessage::from_server(message, MessageStatus::Sent);
            return Applied {
                changed: Some(index),
                resolved,
                reply,
            };
        }

        self.messages
            .push(ViewMessage::from_server(message, MessageStatus::Delivered));
        Applied {
            changed: Some(self.messages.len() - 1),
            resolved: None,
            reply,
        }
    }

    pub fn on_message_read(&mut self, notice: &ReadNotice) -> Option<usize> {
        let index = self.position_of(notice.message_id)?;
        let entry = &mut self.messages[index];
        entry.read = true;
        entry.read_by = Some(notice.read_by.clone());
        entry.status = MessageStatus::Read;
        Some(index)
    }

    /// Only the counterpart's typing state is shown; our own never is.
    pub fn on_typing(&mut self, notice: &TypingNotice, started: bool) {
        if notice.user_id == self.peer && notice.user_id != self.me {
            self.peer_typing = started;
        }
    }

    /// Marks the send named by the error's correlation id as failed, or the
    /// oldest one still sending when the error carries none.
    pub fn on_error(&mut self, notice: &ErrorNotice) -> Applied {
        let index = match &notice.client_id {
            Some(client_id) => self
                .messages
                .iter()
                .position(|m| m.is_optimistic && m.temp_id.as_deref() == Some(client_id)),
            None => self
                .messages
                .iter()
                .position(|m| m.is_optimistic && m.status == MessageStatus::Sending),
        };
        let Some(index) = index else {
            return Applied::default();
        };
        let entry = &mut self.messages[index];
        entry.status = MessageStatus::Failed;
        entry.is_optimistic = false;
        Applied {
            changed: Some(index),
            resolved: entry.temp_id.clone(),
            reply: None,
        }
    }

    /// Timeout fallback: shows a still-sending entry as sent. The entry keeps
    /// waiting for its server id so a late confirmation still replaces it.
    pub fn expire_pending(&mut self, temp_id: &str) -> Option<usize> {
        let index = self.messages.iter().position(|m| {
            m.is_optimistic && m.status == MessageStatus::Sending && m.temp_id.as_deref() == Some(temp_id)
        })?;
        self.messages[index].status = MessageStatus::Sent;
        Some(index)
    }

    fn position_of(&self, id: MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id == Some(id))
    }

    fn find_optimistic(&self, message: &ChatMessage) -> Option<usize> {
        if let Some(client_id) = &message.client_id {
            if let Some(index) = self
                .messages
                .iter()
                .position(|m| m.is_optimistic && m.temp_id.as_deref() == Some(client_id))
            {
                return Some(index);
            }
        }
        self.messages.iter().position(|m| m.confirms(message))
    }
}

/// One single-shot timer per optimistic send. When a timer fires its temp id
/// is delivered on the receiver returned by [`PendingTimers::new`].
pub struct PendingTimers {
    timeout: Duration,
    fired: mpsc::UnboundedSender<String>,
    timers: HashMap<String, JoinHandle<()>>,
}

impl PendingTimers {
    pub fn new(timeout: Duration) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (fired, rx) = mpsc::unbounded_channel();
        (
            PendingTimers {
                timeout,
                fired,
                timers: HashMap::new(),
            },
            rx,
        )
    }

    pub fn start(&mut self, temp_id: String) {
        let fired = self.fired.clone();
        let timeout = self.timeout;
        let id = temp_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = fired.send(id);
        });
        if let Some(previous) = self.timers.insert(temp_id, handle) {
            previous.abort();
        }
    }

    /// Stops the timer for `temp_id`. Returns false if none was pending.
    pub fn cancel(&mut self, temp_id: &str) -> bool {
        match self.timers.remove(temp_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forgets a timer that has already fired.
    pub fn complete(&mut self, temp_id: &str) {
        self.timers.remove(temp_id);
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for PendingTimers {
    fn drop(&mut self) {
        for handle in self.timers.values() {
            handle.abort();
        }
    }
}
