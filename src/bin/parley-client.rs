//! Terminal client for one direct conversation.
//!
//! Each line typed on stdin is sent to the peer. `/typing` toggles the typing
//! indicator, `/upload <path>` sends a file and `/quit` leaves.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

use parley::client::{ChatView, MessageStatus, PendingTimers, DEFAULT_ACK_TIMEOUT};
use parley::api::ActiveUser;
use parley::messages::{ChatMessage, ClientEvent, ServerEvent};
use parley::uploads::StoredUpload;

#[derive(Parser, Debug)]
#[command(name = "parley-client", about = "Chat with one user of a parley server")]
struct Cli {
    /// Realtime endpoint.
    #[arg(long, env = "PARLEY_URL", default_value = "ws://127.0.0.1:3001/ws")]
    url: String,

    /// HTTP base URL used to load history.
    #[arg(long, env = "PARLEY_API", default_value = "http://127.0.0.1:3001")]
    api: String,

    /// Your user id.
    #[arg(long)]
    user: String,

    /// The user to chat with.
    #[arg(long)]
    peer: String,

    /// Bearer token; enables history, presence snapshot, uploads and
    /// authenticated sockets.
    #[arg(long, env = "PARLEY_TOKEN")]
    token: Option<String>,

    /// Milliseconds to wait for a send confirmation before showing it as sent.
    #[arg(long, default_value_t = DEFAULT_ACK_TIMEOUT.as_millis() as u64)]
    ack_timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let api = cli.token.clone().map(|token| Api::new(&cli.api, token));
    let mut view = ChatView::new(cli.user.as_str(), cli.peer.as_str());
    if let Some(api) = &api {
        match api.history(&cli.peer).await {
            Ok(history) => {
                view.load_history(history);
                for index in 0..view.messages().len() {
                    print_entry(&view, index);
                }
            }
            Err(e) => warn!("Could not load history: {:#}", e),
        }
        match api.active_users().await {
            Ok(users) => view.set_online(users.into_iter().filter(|u| u.online).map(|u| u.id)),
            Err(e) => warn!("Could not load online users: {:#}", e),
        }
        if view.is_online(view.peer()) {
            println!("  {} is online", view.peer());
        }
    }

    let url = match &cli.token {
        Some(token) => format!("{}?token={}", cli.url, token),
        None => cli.url.clone(),
    };
    let (ws, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", cli.url))?;
    let (mut ws_tx, mut ws_rx) = ws.split();
    send_frame(&mut ws_tx, &ClientEvent::Login(cli.user.clone())).await?;

    let (mut timers, mut fired) = PendingTimers::new(Duration::from_millis(cli.ack_timeout_ms));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut typing = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let text = line.trim();
                match text {
                    "" => continue,
                    "/quit" => break,
                    "/typing" => {
                        typing = !typing;
                        send_frame(&mut ws_tx, &view.typing_frame(typing)).await?;
                        continue;
                    }
                    _ => {}
                }
                typing = false;
                let (temp_id, frame) = if let Some(path) = text.strip_prefix("/upload ") {
                    let Some(api) = &api else {
                        println!("  uploads need --token");
                        continue;
                    };
                    match api.upload(Path::new(path.trim())).await {
                        Ok(stored) => view.send(stored.url, Some(stored.content_type), Some(stored.originalname)),
                        Err(e) => {
                            println!("  upload failed: {e:#}");
                            continue;
                        }
                    }
                } else {
                    view.send(text, None, None)
                };
                print_entry(&view, view.messages().len() - 1);
                timers.start(temp_id);
                send_frame(&mut ws_tx, &frame).await?;
            }
            frame = ws_rx.next() => {
                let Some(frame) = frame else { break };
                let msg = frame.context("connection lost")?;
                if msg.is_close() {
                    break;
                }
                let Ok(text) = msg.to_text() else { continue };
                let event: ServerEvent = match serde_json::from_str(text) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!("Ignoring frame {:?}: {}", text, e);
                        continue;
                    }
                };

                let was_typing = view.is_peer_typing();
                let was_online = view.is_online(view.peer());
                let applied = view.apply(event);
                if let Some(temp_id) = &applied.resolved {
                    timers.cancel(temp_id);
                }
                if let Some(index) = applied.changed {
                    print_entry(&view, index);
                }
                if let Some(reply) = &applied.reply {
                    send_frame(&mut ws_tx, reply).await?;
                }
                if view.is_peer_typing() != was_typing {
                    let state = if view.is_peer_typing() { "is typing..." } else { "stopped typing" };
                    println!("  {} {}", view.peer(), state);
                }
                if view.is_online(view.peer()) != was_online {
                    let state = if was_online { "went offline" } else { "is online" };
                    println!("  {} {}", view.peer(), state);
                }
            }
            Some(temp_id) = fired.recv() => {
                timers.complete(&temp_id);
                if let Some(index) = view.expire_pending(&temp_id) {
                    print_entry(&view, index);
                }
            }
        }
    }

    let _ = ws_tx.close().await;
    Ok(())
}

/// HTTP side of the server, used with a bearer token.
struct Api {
    http: reqwest::Client,
    base: String,
    token: String,
}

impl Api {
    fn new(base: &str, token: String) -> Self {
        Api {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token,
        }
    }

    async fn history(&self, peer: &str) -> Result<Vec<ChatMessage>> {
        self.get(&format!("/api/messages/{peer}")).await
    }

    async fn active_users(&self) -> Result<Vec<ActiveUser>> {
        self.get("/api/chats/active-users").await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self
            .http
            .get(format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(body)
    }

    async fn upload(&self, path: &Path) -> Result<StoredUpload> {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map_or_else(|| "upload".to_string(), |n| n.to_string_lossy().into_owned());
        let mime = mime_guess::from_path(path).first_or_octet_stream();
        let part = reqwest::multipart::Part::bytes(content)
            .file_name(file_name)
            .mime_str(mime.as_ref())?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let stored = self
            .http
            .post(format!("{}/api/upload", self.base))
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(stored)
    }
}

async fn send_frame<S>(sink: &mut S, event: &ClientEvent) -> Result<()>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let frame = serde_json::to_string(event)?;
    sink.send(Message::text(frame)).await?;
    Ok(())
}

fn print_entry(view: &ChatView, index: usize) {
    let Some(m) = view.messages().get(index) else {
        return;
    };
    let who = if m.sender == view.me() { "you" } else { m.sender.as_str() };
    let status = match m.status {
        MessageStatus::Sending => "sending",
        MessageStatus::Sent => "sent",
        MessageStatus::Delivered => "delivered",
        MessageStatus::Read => "read",
        MessageStatus::Failed => "failed",
    };
    let body = match (&m.media_type, &m.originalname) {
        (Some(kind), Some(name)) => format!("[{kind}: {name}] {}", m.content),
        _ => m.content.clone(),
    };
    println!("[{}] {}: {} ({})", m.timestamp.format("%H:%M:%S"), who, body, status);
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley::api::{self, TokenVerifier};
    use parley::uploads::UploadStore;
    use parley::ChatService;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn serve(dir: &TempDir) -> (Api, Arc<ChatService>) {
        let service = Arc::new(ChatService::in_memory());
        let verifier = Arc::new(TokenVerifier::new("test-secret"));
        let uploads = Arc::new(UploadStore::new(dir.path().join("uploads"), 1024).await.unwrap());
        let token = verifier.issue("alice", chrono::Duration::hours(1)).unwrap();

        let routes = api::routes(service.clone(), verifier, uploads);
        let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        (Api::new(&format!("http://{addr}/"), token), service)
    }

    #[tokio::test]
    async fn upload_returns_media_fields_for_send() {
        let dir = TempDir::new().unwrap();
        let (api, _service) = serve(&dir).await;
        let photo = dir.path().join("photo.png");
        tokio::fs::write(&photo, b"not really a png").await.unwrap();

        let stored = api.upload(&photo).await.unwrap();
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(stored.originalname, "photo.png");
        assert!(stored.url.starts_with("/uploads/"));

        let mut view = ChatView::new("alice", "bob");
        let (_, frame) = view.send(stored.url.clone(), Some(stored.content_type), Some(stored.originalname));
        let ClientEvent::SendMessage(request) = frame else {
            panic!("expected send_message");
        };
        assert_eq!(request.content, stored.url);
        assert_eq!(request.media_type.as_deref(), Some("image/png"));
    }

    #[tokio::test]
    async fn active_users_snapshot_seeds_view() {
        let dir = TempDir::new().unwrap();
        let (api, service) = serve(&dir).await;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut bob = service.open_session(tx).await;
        bob.handle(ClientEvent::Login("bob".into())).await;

        let mut view = ChatView::new("alice", "bob");
        let users = api.active_users().await.unwrap();
        view.set_online(users.into_iter().filter(|u| u.online).map(|u| u.id));
        assert!(view.is_online("bob"));

        view.apply(ServerEvent::UserOffline("bob".into()));
        assert!(!view.is_online("bob"));
    }
}
