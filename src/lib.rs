//! Presence, typing indicators, read receipts and realtime delivery for a
//! direct-messaging chat service, plus the client-side view that reconciles
//! optimistic sends with server confirmations.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod presence;
pub mod receipts;
pub mod server;
pub mod session;
pub mod store;
pub mod typing;
pub mod uploads;

pub use crate::config::Settings;
pub use crate::session::ChatService;
