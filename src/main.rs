use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use warp::Filter;

use parley::api::{self, TokenVerifier};
use parley::server;
use parley::uploads::UploadStore;
use parley::{ChatService, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::var_os("PARLEY_CONFIG").map(PathBuf::from);
    let settings = Settings::load(config_path.as_deref()).context("failed to load configuration")?;
    let addr: SocketAddr = settings
        .server
        .addr
        .parse()
        .with_context(|| format!("invalid server.addr {:?}", settings.server.addr))?;

    let service = Arc::new(ChatService::in_memory());
    let verifier = Arc::new(TokenVerifier::new(&settings.auth.jwt_secret));
    let uploads = Arc::new(
        UploadStore::new(&settings.uploads.dir, settings.uploads.max_bytes)
            .await
            .with_context(|| format!("failed to prepare upload directory {}", settings.uploads.dir))?,
    );

    let cors = match settings.server.cors_origin.as_deref() {
        Some(origin) => warp::cors().allow_origin(origin),
        None => warp::cors().allow_any_origin(),
    }
    .allow_credentials(true)
    .allow_headers(["authorization", "content-type"])
    .allow_methods(["GET", "POST"]);

    let routes = server::ws_route(service.clone(), verifier.clone(), settings.auth.require_socket_token)
        .or(api::routes(service, verifier, uploads))
        .recover(api::handle_rejection)
        .with(cors);

    match settings.tls_paths() {
        Some((cert, key)) => {
            info!("Starting secure server (HTTPS/WSS) on {}", addr);
            warp::serve(routes).tls().cert_path(cert).key_path(key).run(addr).await;
        }
        None => {
            info!("Starting server (HTTP/WS) on {}", addr);
            warp::serve(routes).run(addr).await;
        }
    }
    Ok(())
}
