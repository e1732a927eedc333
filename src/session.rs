//! Per-connection realtime protocol.
//!
//! A [`ChatService`] owns the shared presence, typing and read-receipt state
//! and is handed to every connection. Each connection drives one [`Session`],
//! which moves `Unauthenticated -> Authenticated -> Closed` and handles its
//! events one at a time in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::messages::{
    ClientEvent, ErrorNotice, ReadAck, ReadNotice, SendMessage, ServerEvent, TypingNotice,
};
use crate::presence::{ConnectionHandle, ConnectionId, EventSender, PresenceRegistry};
use crate::receipts::ReadReceipts;
use crate::store::{MemoryStore, MessageStore, NewMessage, UserStore};
use crate::typing::{conversation_key, TypingTracker};

const SEND_FAILED: &str = "Failed to send message";

/// Shared state for all realtime connections in this process.
pub struct ChatService {
    presence: PresenceRegistry,
    typing: TypingTracker,
    receipts: ReadReceipts,
    connections: RwLock<HashMap<ConnectionId, EventSender>>,
    messages: Arc<dyn MessageStore>,
    users: Arc<dyn UserStore>,
}

impl ChatService {
    pub fn new(messages: Arc<dyn MessageStore>, users: Arc<dyn UserStore>) -> Self {
        ChatService {
            presence: PresenceRegistry::new(),
            typing: TypingTracker::new(),
            receipts: ReadReceipts::new(),
            connections: RwLock::new(HashMap::new()),
            messages,
            users,
        }
    }

    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(store.clone(), store)
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn receipts(&self) -> &ReadReceipts {
        &self.receipts
    }

    pub fn messages(&self) -> &dyn MessageStore {
        self.messages.as_ref()
    }

    pub fn users(&self) -> &dyn UserStore {
        self.users.as_ref()
    }

    /// Registers a freshly opened connection. Events for it are pushed into `tx`.
    pub async fn open_session(self: &Arc<Self>, tx: EventSender) -> Session {
        let conn_id = Uuid::new_v4();
        {
            let mut connections = self.connections.write().await;
            connections.insert(conn_id, tx.clone());
        }
        Session {
            service: Arc::clone(self),
            handle: ConnectionHandle::new(conn_id, tx),
            verified_user: None,
            state: SessionState::Unauthenticated,
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    async fn unregister_connection(&self, conn_id: ConnectionId) -> bool {
        let mut connections = self.connections.write().await;
        connections.remove(&conn_id).is_some()
    }

    async fn broadcast_except(&self, except: ConnectionId, event: &ServerEvent) {
        let connections = self.connections.read().await;
        for (conn_id, tx) in connections.iter() {
            if *conn_id != except {
                let _ = tx.send(event.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated { user_id: String },
    Closed,
}

pub struct Session {
    service: Arc<ChatService>,
    handle: ConnectionHandle,
    verified_user: Option<String>,
    state: SessionState,
}

impl Session {
    /// Pins the identity proven by the transport. A later `login` for any
    /// other user is ignored.
    #[must_use]
    pub fn with_verified_user(mut self, user_id: Option<String>) -> Self {
        self.verified_user = user_id;
        self
    }

    pub fn conn_id(&self) -> ConnectionId {
        self.handle.conn_id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn user_id(&self) -> Option<&str> {
        match &self.state {
            SessionState::Authenticated { user_id } => Some(user_id),
            _ => None,
        }
    }

    /// Parses and handles one text frame. Frames that are not a known event
    /// are dropped.
    pub async fn handle_frame(&mut self, text: &str) {
        match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => self.handle(event).await,
            Err(e) => debug!("Ignoring malformed frame on {}: {}", self.conn_id(), e),
        }
    }

    pub async fn handle(&mut self, event: ClientEvent) {
        let current = match &self.state {
            SessionState::Closed => return,
            SessionState::Unauthenticated => None,
            SessionState::Authenticated { user_id } => Some(user_id.clone()),
        };

        let Some(user_id) = current else {
            match event {
                ClientEvent::Login(user_id) => self.login(user_id).await,
                other => debug!("Ignoring {:?} from unauthenticated connection {}", other, self.conn_id()),
            }
            return;
        };

        match event {
            ClientEvent::Login(_) => debug!("Ignoring repeated login on {}", self.conn_id()),
            ClientEvent::SendMessage(request) => self.send_message(&user_id, request).await,
            ClientEvent::TypingStart(target) => self.typing(&user_id, &target.to, true).await,
            ClientEvent::TypingStop(target) => self.typing(&user_id, &target.to, false).await,
            ClientEvent::MessageRead(ack) => self.message_read(&user_id, ack).await,
        }
    }

    async fn login(&mut self, user_id: String) {
        if user_id.is_empty() {
            return;
        }
        if let Some(verified) = &self.verified_user {
            if *verified != user_id {
                warn!(
                    "Connection {} authenticated as {} tried to log in as {}",
                    self.conn_id(),
                    verified,
                    user_id
                );
                return;
            }
        }

        let service = &self.service;
        if let Some(previous) = service.presence.set_online(&user_id, self.handle.clone()).await {
            debug!(
                "User {} moved from connection {} to {}",
                user_id,
                previous.conn_id(),
                self.conn_id()
            );
        }
        if let Err(e) = service.users.set_last_seen(&user_id, None).await {
            warn!("Failed to clear last seen for {}: {}", user_id, e);
        }
        info!("User {} logged in on connection {}", user_id, self.conn_id());

        service
            .broadcast_except(self.conn_id(), &ServerEvent::UserOnline(user_id.clone()))
            .await;
        self.state = SessionState::Authenticated { user_id };
    }

    async fn send_message(&self, from: &str, request: SendMessage) {
        let SendMessage {
            to,
            content,
            media_type,
            originalname,
            client_id,
        } = request;
        if to.is_empty() || content.is_empty() {
            return;
        }

        let service = &self.service;
        let new_message = NewMessage {
            sender: from.to_string(),
            receiver: to.clone(),
            content,
            media_type,
            originalname,
        };
        let saved = match service.messages.save(new_message).await {
            Ok(saved) => saved,
            Err(e) => {
                error!("Failed to persist message from {} to {}: {}", from, to, e);
                self.handle.send(ServerEvent::Error(ErrorNotice {
                    error: SEND_FAILED.to_string(),
                    client_id,
                }));
                return;
            }
        };

        let key = conversation_key(from, &to);
        service.typing.stop_typing(&key, from).await;

        if service
            .presence
            .send(&to, ServerEvent::ReceiveMessage(saved.clone()))
            .await
        {
            self.handle.send(ServerEvent::TypingStop(TypingNotice {
                conversation_key: key.into(),
                user_id: from.to_string(),
            }));
        }

        let mut confirmed = saved;
        confirmed.client_id = client_id;
        self.handle.send(ServerEvent::MessageSent(confirmed));
    }

    async fn typing(&self, from: &str, to: &str, started: bool) {
        if to.is_empty() {
            return;
        }
        let service = &self.service;
        let key = conversation_key(from, to);
        if started {
            service.typing.start_typing(&key, from).await;
        } else {
            service.typing.stop_typing(&key, from).await;
        }

        let notice = TypingNotice {
            conversation_key: key.into(),
            user_id: from.to_string(),
        };
        let event = if started {
            ServerEvent::TypingStart(notice)
        } else {
            ServerEvent::TypingStop(notice)
        };
        service.presence.send(to, event).await;
    }

    async fn message_read(&self, reader: &str, ack: ReadAck) {
        let service = &self.service;
        service.receipts.mark_read(ack.message_id, reader).await;

        let Some(sender) = ack.sender_id.filter(|s| !s.is_empty()) else {
            return;
        };
        service
            .presence
            .send(
                &sender,
                ServerEvent::MessageRead(ReadNotice {
                    message_id: ack.message_id,
                    read_by: reader.to_string(),
                }),
            )
            .await;
    }

    /// Tears the connection down. Safe to call more than once and before login.
    pub async fn close(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        let conn_id = self.conn_id();
        let service = &self.service;
        if !service.unregister_connection(conn_id).await {
            return;
        }

        let SessionState::Authenticated { user_id } = previous else {
            info!("Connection {} closed before login", conn_id);
            return;
        };

        if !service.presence.remove_if_current(&user_id, conn_id).await {
            info!(
                "Stale connection {} for {} closed; newer login kept",
                conn_id, user_id
            );
            return;
        }

        for key in service.typing.stop_all(&user_id).await {
            let other = key.other(&user_id).to_string();
            let notice = TypingNotice {
                conversation_key: key.into(),
                user_id: user_id.clone(),
            };
            service.presence.send(&other, ServerEvent::TypingStop(notice)).await;
        }
        if let Err(e) = service.users.set_last_seen(&user_id, Some(Utc::now())).await {
            warn!("Failed to record last seen for {}: {}", user_id, e);
        }
        info!("User {} disconnected from {}", user_id, conn_id);

        service
            .broadcast_except(conn_id, &ServerEvent::UserOffline(user_id))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::messages::{ChatMessage, TypingTarget};
    use async_trait::async_trait;
    use chrono::DateTime;
    use tokio::sync::mpsc;

    type Events = mpsc::UnboundedReceiver<ServerEvent>;

    async fn connect(service: &Arc<ChatService>) -> (Session, Events) {
        let (tx, rx) = mpsc::unbounded_channel();
        (service.open_session(tx).await, rx)
    }

    async fn login(service: &Arc<ChatService>, user_id: &str) -> (Session, Events) {
        let (mut session, rx) = connect(service).await;
        session.handle(ClientEvent::Login(user_id.to_string())).await;
        (session, rx)
    }

    fn drain(rx: &mut Events) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn send(to: &str, content: &str) -> ClientEvent {
        ClientEvent::SendMessage(SendMessage {
            to: to.to_string(),
            content: content.to_string(),
            media_type: None,
            originalname: None,
            client_id: None,
        })
    }

    fn typing_start(to: &str) -> ClientEvent {
        ClientEvent::TypingStart(TypingTarget { to: to.to_string() })
    }

    struct FailingStore;

    #[async_trait]
    impl MessageStore for FailingStore {
        async fn save(&self, _message: NewMessage) -> Result<ChatMessage, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }

        async fn conversation(&self, _a: &str, _b: &str) -> Result<Vec<ChatMessage>, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }

        async fn recent_partners(&self, _user_id: &str) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
            Err(StoreError::Unavailable("disk full".into()))
        }
    }

    #[tokio::test]
    async fn login_registers_presence_and_notifies_others() {
        let service = Arc::new(ChatService::in_memory());
        let (_bob, mut bob_rx) = login(&service, "bob").await;
        let (alice, mut alice_rx) = login(&service, "alice").await;

        assert_eq!(alice.user_id(), Some("alice"));
        assert!(service.presence().is_online("alice").await);
        assert_eq!(drain(&mut bob_rx), vec![ServerEvent::UserOnline("alice".into())]);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_events_are_ignored() {
        let service = Arc::new(ChatService::in_memory());
        let (_bob, mut bob_rx) = login(&service, "bob").await;
        let (mut anon, mut anon_rx) = connect(&service).await;

        anon.handle(send("bob", "hi")).await;
        anon.handle(typing_start("bob")).await;

        assert_eq!(*anon.state(), SessionState::Unauthenticated);
        assert!(drain(&mut anon_rx).is_empty());
        assert!(drain(&mut bob_rx).is_empty());
        assert!(service.messages().recent_partners("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_frames_are_ignored() {
        let service = Arc::new(ChatService::in_memory());
        let (mut alice, mut alice_rx) = login(&service, "alice").await;

        alice.handle_frame("not json").await;
        alice.handle_frame(r#"{"event":"send_message","data":{"content":"hi"}}"#).await;
        alice.handle_frame(r#"{"event":"send_message","data":{"to":"bob","content":""}}"#).await;
        alice.handle_frame(r#"{"event":"typing_start","data":{}}"#).await;

        assert!(drain(&mut alice_rx).is_empty());
        assert!(service.messages().recent_partners("alice").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_to_offline_user_persists_and_confirms() {
        let service = Arc::new(ChatService::in_memory());
        let (mut alice, mut alice_rx) = login(&service, "alice").await;

        alice.handle(send("bob", "hi")).await;

        let events = drain(&mut alice_rx);
        assert_eq!(events.len(), 1);
        let ServerEvent::MessageSent(sent) = &events[0] else {
            panic!("expected message_sent, got {events:?}");
        };
        assert_eq!(sent.content, "hi");
        assert!(!sent.read);

        let history = service.messages().conversation("bob", "alice").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, sent.id);
    }

    #[tokio::test]
    async fn send_to_online_user_delivers_and_stops_typing() {
        let service = Arc::new(ChatService::in_memory());
        let (mut alice, mut alice_rx) = login(&service, "alice").await;
        let (_bob, mut bob_rx) = login(&service, "bob").await;
        drain(&mut alice_rx);

        alice.handle(typing_start("bob")).await;
        let key = conversation_key("alice", "bob");
        assert!(service.typing().is_typing(&key, "alice").await);
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerEvent::TypingStart(TypingNotice {
                conversation_key: "alice:bob".into(),
                user_id: "alice".into(),
            })]
        );

        alice.handle(send("bob", "hello")).await;
        assert!(!service.typing().has_entry(&key).await);

        let bob_events = drain(&mut bob_rx);
        assert_eq!(bob_events.len(), 1);
        let ServerEvent::ReceiveMessage(received) = &bob_events[0] else {
            panic!("expected receive_message, got {bob_events:?}");
        };
        assert_eq!(received.content, "hello");
        assert!(!received.read);

        let alice_events = drain(&mut alice_rx);
        assert_eq!(alice_events.len(), 2);
        assert!(matches!(&alice_events[0], ServerEvent::TypingStop(n) if n.user_id == "alice"));
        assert!(matches!(&alice_events[1], ServerEvent::MessageSent(m) if m.id == received.id));
    }

    #[tokio::test]
    async fn confirmation_echoes_client_id_to_sender_only() {
        let service = Arc::new(ChatService::in_memory());
        let (mut alice, mut alice_rx) = login(&service, "alice").await;
        let (_bob, mut bob_rx) = login(&service, "bob").await;
        drain(&mut alice_rx);

        alice
            .handle(ClientEvent::SendMessage(SendMessage {
                to: "bob".into(),
                content: "hi".into(),
                media_type: None,
                originalname: None,
                client_id: Some("temp-1".into()),
            }))
            .await;

        let bob_events = drain(&mut bob_rx);
        assert!(matches!(&bob_events[0], ServerEvent::ReceiveMessage(m) if m.client_id.is_none()));
        let alice_events = drain(&mut alice_rx);
        assert!(matches!(
            alice_events.last(),
            Some(ServerEvent::MessageSent(m)) if m.client_id.as_deref() == Some("temp-1")
        ));
    }

    #[tokio::test]
    async fn persistence_failure_reports_error_to_sender_only() {
        let users = Arc::new(MemoryStore::new());
        let service = Arc::new(ChatService::new(Arc::new(FailingStore), users));
        let (mut alice, mut alice_rx) = login(&service, "alice").await;
        let (_bob, mut bob_rx) = login(&service, "bob").await;
        drain(&mut alice_rx);

        alice.handle(typing_start("bob")).await;
        drain(&mut bob_rx);
        alice.handle(send("bob", "hi")).await;

        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerEvent::Error(ErrorNotice {
                error: "Failed to send message".into(),
                client_id: None,
            })]
        );
        assert!(drain(&mut bob_rx).is_empty());
        // typing state is untouched when nothing was sent
        assert!(service.typing().is_typing(&conversation_key("alice", "bob"), "alice").await);
    }

    #[tokio::test]
    async fn read_receipt_is_recorded_and_forwarded() {
        let service = Arc::new(ChatService::in_memory());
        let (mut alice, mut alice_rx) = login(&service, "alice").await;
        let (mut bob, mut bob_rx) = login(&service, "bob").await;
        drain(&mut alice_rx);

        alice.handle(send("bob", "hi")).await;
        let ServerEvent::ReceiveMessage(received) = drain(&mut bob_rx).remove(0) else {
            panic!("expected receive_message");
        };
        drain(&mut alice_rx);

        let ack = ClientEvent::MessageRead(ReadAck {
            message_id: received.id,
            sender_id: Some("alice".into()),
        });
        bob.handle(ack.clone()).await;
        bob.handle(ack).await;

        assert_eq!(service.receipts().readers(received.id).await.len(), 1);
        assert_eq!(
            drain(&mut alice_rx)[0],
            ServerEvent::MessageRead(ReadNotice {
                message_id: received.id,
                read_by: "bob".into(),
            })
        );
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_newer_login() {
        let service = Arc::new(ChatService::in_memory());
        let (_bob, mut bob_rx) = login(&service, "bob").await;
        let (mut first, _first_rx) = login(&service, "alice").await;
        let (second, _second_rx) = login(&service, "alice").await;
        drain(&mut bob_rx);

        first.close().await;

        let registered = service.presence().get("alice").await.unwrap();
        assert_eq!(registered.conn_id(), second.conn_id());
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_newer_typing_state() {
        let service = Arc::new(ChatService::in_memory());
        let (_bob, mut bob_rx) = login(&service, "bob").await;
        let (mut first, _first_rx) = login(&service, "alice").await;
        let (mut second, _second_rx) = login(&service, "alice").await;

        second.handle(typing_start("bob")).await;
        drain(&mut bob_rx);
        first.close().await;

        assert!(service.typing().is_typing(&conversation_key("alice", "bob"), "alice").await);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn disconnect_broadcasts_offline_and_records_last_seen() {
        let service = Arc::new(ChatService::in_memory());
        let (_bob, mut bob_rx) = login(&service, "bob").await;
        let (mut alice, _alice_rx) = login(&service, "alice").await;
        drain(&mut bob_rx);

        alice.close().await;

        assert_eq!(*alice.state(), SessionState::Closed);
        assert!(!service.presence().is_online("alice").await);
        assert_eq!(drain(&mut bob_rx), vec![ServerEvent::UserOffline("alice".into())]);
        assert!(service.users().last_seen("alice").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn disconnect_while_typing_notifies_counterpart() {
        let service = Arc::new(ChatService::in_memory());
        let (mut alice, _alice_rx) = login(&service, "alice").await;
        let (_bob, mut bob_rx) = login(&service, "bob").await;

        alice.handle(typing_start("bob")).await;
        drain(&mut bob_rx);
        alice.close().await;

        let events = drain(&mut bob_rx);
        assert!(matches!(&events[0], ServerEvent::TypingStop(n) if n.user_id == "alice"));
        assert_eq!(events[1], ServerEvent::UserOffline("alice".into()));
        assert!(!service.typing().has_entry(&conversation_key("alice", "bob")).await);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_safe_before_login() {
        let service = Arc::new(ChatService::in_memory());
        let (mut anon, _rx) = connect(&service).await;
        assert_eq!(service.connection_count().await, 1);

        anon.close().await;
        anon.close().await;
        assert_eq!(service.connection_count().await, 0);

        anon.handle(ClientEvent::Login("alice".into())).await;
        assert!(!service.presence().is_online("alice").await);
    }

    #[tokio::test]
    async fn verified_identity_rejects_foreign_login() {
        let service = Arc::new(ChatService::in_memory());
        let (session, _rx) = connect(&service).await;
        let mut session = session.with_verified_user(Some("alice".into()));

        session.handle(ClientEvent::Login("mallory".into())).await;
        assert_eq!(*session.state(), SessionState::Unauthenticated);

        session.handle(ClientEvent::Login("alice".into())).await;
        assert_eq!(session.user_id(), Some("alice"));
    }

    #[tokio::test]
    async fn read_receipt_round_trip_between_views() {
        use crate::client::{ChatView, MessageStatus};

        let service = Arc::new(ChatService::in_memory());
        let (mut alice, mut alice_rx) = login(&service, "alice").await;
        let (mut bob, mut bob_rx) = login(&service, "bob").await;
        drain(&mut alice_rx);
        let mut alice_view = ChatView::new("alice", "bob");
        let mut bob_view = ChatView::new("bob", "alice");

        let (_, frame) = alice_view.send("hi", None, None);
        alice.handle(frame).await;
        for event in drain(&mut alice_rx) {
            alice_view.apply(event);
        }
        assert_eq!(alice_view.messages()[0].status, MessageStatus::Sent);

        let mut replies = Vec::new();
        for event in drain(&mut bob_rx) {
            let applied = bob_view.apply(event);
            replies.extend(applied.reply);
        }
        assert_eq!(bob_view.messages()[0].status, MessageStatus::Delivered);
        assert_eq!(replies.len(), 1);
        for reply in replies {
            bob.handle(reply).await;
        }

        for event in drain(&mut alice_rx) {
            alice_view.apply(event);
        }
        let entry = &alice_view.messages()[0];
        assert_eq!(entry.status, MessageStatus::Read);
        assert_eq!(entry.read_by.as_deref(), Some("bob"));
        assert_eq!(entry.temp_id, None);
        let id = entry.id.unwrap();
        assert!(service.receipts().has_read(id, "bob").await);
    }
}
