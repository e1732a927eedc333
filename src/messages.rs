//! Realtime wire schema.
//!
//! Every frame is a JSON text frame of the form `{"event": "...", "data": ...}`.
//! Frames that do not parse into one of these enums are dropped by the
//! session without a reply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Server-assigned message identifier. Increases monotonically per store.
pub type MessageId = u64;

/// A persisted direct message as it travels over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: String,
    pub receiver: String,
    pub content: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originalname: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    /// Correlation id chosen by the sending client, echoed only to that client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ChatMessage {
    /// True when the message belongs to the two-party conversation `a`/`b`.
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        (self.sender == a && self.receiver == b) || (self.sender == b && self.receiver == a)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub to: String,
    pub content: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originalname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingTarget {
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadAck {
    pub message_id: MessageId,
    #[serde(default)]
    pub sender_id: Option<String>,
}

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    Login(String),
    SendMessage(SendMessage),
    TypingStart(TypingTarget),
    TypingStop(TypingTarget),
    MessageRead(ReadAck),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_key: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadNotice {
    pub message_id: MessageId,
    pub read_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    UserOnline(String),
    UserOffline(String),
    MessageSent(ChatMessage),
    ReceiveMessage(ChatMessage),
    TypingStart(TypingNotice),
    TypingStop(TypingNotice),
    MessageRead(ReadNotice),
    Error(ErrorNotice),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn login_frame_carries_bare_user_id() {
        let event: ClientEvent =
            serde_json::from_value(json!({"event": "login", "data": "alice"})).unwrap();
        assert_eq!(event, ClientEvent::Login("alice".to_string()));
    }

    #[test]
    fn send_message_accepts_optional_media_fields() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "send_message",
            "data": {"to": "bob", "content": "/uploads/cat.png", "type": "image/png", "originalname": "cat.png", "clientId": "temp-1"}
        }))
        .unwrap();

        let ClientEvent::SendMessage(send) = event else {
            panic!("expected send_message");
        };
        assert_eq!(send.media_type.as_deref(), Some("image/png"));
        assert_eq!(send.originalname.as_deref(), Some("cat.png"));
        assert_eq!(send.client_id.as_deref(), Some("temp-1"));
    }

    #[test]
    fn send_message_without_recipient_is_rejected() {
        let parsed = serde_json::from_value::<ClientEvent>(json!({
            "event": "send_message",
            "data": {"content": "hi"}
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn unknown_event_is_rejected() {
        let parsed = serde_json::from_value::<ClientEvent>(json!({"event": "logout", "data": "alice"}));
        assert!(parsed.is_err());
    }

    #[test]
    fn server_events_use_camel_case_payloads() {
        let value = serde_json::to_value(ServerEvent::MessageRead(ReadNotice {
            message_id: 7,
            read_by: "bob".to_string(),
        }))
        .unwrap();
        assert_eq!(value, json!({"event": "message_read", "data": {"messageId": 7, "readBy": "bob"}}));

        let value = serde_json::to_value(ServerEvent::TypingStop(TypingNotice {
            conversation_key: "alice:bob".to_string(),
            user_id: "alice".to_string(),
        }))
        .unwrap();
        assert_eq!(
            value,
            json!({"event": "typing_stop", "data": {"conversationKey": "alice:bob", "userId": "alice"}})
        );
    }

    #[test]
    fn error_omits_missing_client_id() {
        let value = serde_json::to_value(ServerEvent::Error(ErrorNotice {
            error: "Failed to send message".to_string(),
            client_id: None,
        }))
        .unwrap();
        assert_eq!(value, json!({"event": "error", "data": {"error": "Failed to send message"}}));
    }
}
