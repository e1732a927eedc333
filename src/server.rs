use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

use crate::api::{with_service, TokenVerifier};
use crate::error::ApiError;
use crate::messages::ServerEvent;
use crate::session::ChatService;

#[derive(Debug, Default, Deserialize)]
struct SocketQuery {
    token: Option<String>,
}

/// `GET /ws`: upgrades to the realtime protocol. A `token` query parameter
/// pins the connection to the user it names.
pub fn ws_route(
    service: Arc<ChatService>,
    verifier: Arc<TokenVerifier>,
    require_token: bool,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<SocketQuery>())
        .and(with_service(service))
        .and(warp::any().map(move || verifier.clone()))
        .and_then(move |ws: Ws, query: SocketQuery, service: Arc<ChatService>, verifier: Arc<TokenVerifier>| async move {
            let verified = match query.token {
                Some(token) => Some(verifier.verify(&token).map_err(warp::reject::custom)?),
                None if require_token => return Err(warp::reject::custom(ApiError::MissingToken)),
                None => None,
            };
            Ok::<_, Rejection>(ws.on_upgrade(move |socket| handle_connection(service, socket, verified)))
        })
}

/// Runs one realtime connection until the socket closes. Frames are handled
/// one at a time in arrival order; outbound events go through a writer task.
pub async fn handle_connection(service: Arc<ChatService>, ws: WebSocket, verified_user: Option<String>) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let mut session = service.open_session(tx).await.with_verified_user(verified_user);
    let conn_id = session.conn_id();
    info!("New realtime connection {}", conn_id);

    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Failed to encode event for {}: {}", conn_id, e);
                    continue;
                }
            };
            if let Err(e) = ws_tx.send(Message::text(frame)).await {
                warn!("Failed to send WebSocket message to {}: {}", conn_id, e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(msg) if msg.is_close() => break,
            Ok(msg) => {
                if let Ok(text) = msg.to_str() {
                    session.handle_frame(text).await;
                }
            }
            Err(e) => {
                warn!("WebSocket error on {}: {}", conn_id, e);
                break;
            }
        }
    }

    session.close().await;
    info!("Realtime connection {} closed", conn_id);
}
