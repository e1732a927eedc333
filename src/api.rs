//! HTTP routes consumed by chat clients: conversation history, who is online,
//! recent chats and file uploads. Every route requires a bearer token.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Buf;
use chrono::{DateTime, Duration, Utc};
use futures_util::TryStreamExt;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::{debug, error};
use serde::{Deserialize, Serialize};
use serde_json::json;
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::{Filter, Rejection, Reply};

use crate::error::{ApiError, UploadError};
use crate::session::ChatService;
use crate::uploads::UploadStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub id: String,
    pub exp: i64,
}

/// Verifies HS256 bearer tokens and yields the user id they carry.
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        TokenVerifier {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> Result<String, ApiError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims.id)
            .map_err(|e| {
                debug!("Rejected token: {}", e);
                ApiError::InvalidToken
            })
    }

    pub fn issue(&self, user_id: &str, ttl: Duration) -> Result<String, ApiError> {
        let claims = Claims {
            id: user_id.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(ApiError::TokenIssue)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveUser {
    pub id: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentChat {
    pub id: String,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub last_message_time: DateTime<Utc>,
}

pub fn with_service(
    service: Arc<ChatService>,
) -> impl Filter<Extract = (Arc<ChatService>,), Error = Infallible> + Clone {
    warp::any().map(move || service.clone())
}

/// Extracts the caller's user id from `Authorization: Bearer <token>`.
pub fn with_user(
    verifier: Arc<TokenVerifier>,
) -> impl Filter<Extract = (String,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
        let verifier = verifier.clone();
        async move {
            let token = header
                .as_deref()
                .and_then(|h| h.strip_prefix("Bearer "))
                .filter(|t| !t.is_empty())
                .ok_or_else(|| warp::reject::custom(ApiError::MissingToken))?;
            verifier.verify(token).map_err(warp::reject::custom)
        }
    })
}

pub fn routes(
    service: Arc<ChatService>,
    verifier: Arc<TokenVerifier>,
    uploads: Arc<UploadStore>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let history = warp::path!("api" / "messages" / String)
        .and(warp::get())
        .and(with_user(verifier.clone()))
        .and(with_service(service.clone()))
        .and_then(get_history);

    let active_users = warp::path!("api" / "chats" / "active-users")
        .and(warp::get())
        .and(with_user(verifier.clone()))
        .and(with_service(service.clone()))
        .and_then(get_active_users);

    let recent_chats = warp::path!("api" / "chats")
        .and(warp::get())
        .and(with_user(verifier.clone()))
        .and(with_service(service))
        .and_then(get_recent_chats);

    let max_bytes = uploads.max_bytes() as u64;
    let public_dir: PathBuf = uploads.dir().to_path_buf();
    let upload = warp::path!("api" / "upload")
        .and(warp::post())
        .and(with_user(verifier))
        .and(warp::multipart::form().max_length(max_bytes + 64 * 1024))
        .and(warp::any().map(move || uploads.clone()))
        .and_then(post_upload);

    let files = warp::path("uploads").and(warp::fs::dir(public_dir));

    history.or(active_users).or(recent_chats).or(upload).or(files)
}

async fn get_history(other: String, user: String, service: Arc<ChatService>) -> Result<impl Reply, Rejection> {
    let mut messages = service
        .messages()
        .conversation(&user, &other)
        .await
        .map_err(|e| warp::reject::custom(ApiError::from(e)))?;
    for message in &mut messages {
        message.read = service.receipts().has_read(message.id, &message.receiver).await;
    }
    Ok(warp::reply::json(&messages))
}

async fn get_active_users(user: String, service: Arc<ChatService>) -> Result<impl Reply, Rejection> {
    let mut online: Vec<String> = service
        .presence()
        .list_online()
        .await
        .into_iter()
        .filter(|id| *id != user)
        .collect();
    online.sort();

    let mut result = Vec::with_capacity(online.len());
    for id in online {
        let last_seen = service.users().last_seen(&id).await.unwrap_or_else(|e| {
            error!("Failed to load last seen for {}: {}", id, e);
            None
        });
        result.push(ActiveUser {
            id,
            online: true,
            last_seen,
        });
    }
    Ok(warp::reply::json(&result))
}

async fn get_recent_chats(user: String, service: Arc<ChatService>) -> Result<impl Reply, Rejection> {
    let partners = service
        .messages()
        .recent_partners(&user)
        .await
        .map_err(|e| warp::reject::custom(ApiError::from(e)))?;

    let mut result = Vec::with_capacity(partners.len());
    for (id, last_message_time) in partners {
        let online = service.presence().is_online(&id).await;
        let last_seen = service.users().last_seen(&id).await.unwrap_or_else(|e| {
            error!("Failed to load last seen for {}: {}", id, e);
            None
        });
        result.push(RecentChat {
            id,
            online,
            last_seen,
            last_message_time,
        });
    }
    Ok(warp::reply::json(&result))
}

async fn post_upload(user: String, form: FormData, uploads: Arc<UploadStore>) -> Result<impl Reply, Rejection> {
    let stored = store_file_part(form, &uploads)
        .await
        .map_err(|e| warp::reject::custom(ApiError::from(e)))?;
    debug!("User {} uploaded {}", user, stored.url);
    Ok(warp::reply::json(&stored))
}

async fn store_file_part(
    mut form: FormData,
    uploads: &UploadStore,
) -> Result<crate::uploads::StoredUpload, UploadError> {
    while let Some(part) = form
        .try_next()
        .await
        .map_err(|e| UploadError::Multipart(e.to_string()))?
    {
        if part.name() != "file" {
            continue;
        }
        let original_name = part.filename().unwrap_or("upload").to_string();
        let content_type = part
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let content = read_part(part).await?;
        return uploads.save(original_name, content_type, content).await;
    }
    Err(UploadError::MissingFile)
}

async fn read_part(part: Part) -> Result<Vec<u8>, UploadError> {
    part.stream()
        .try_fold(Vec::new(), |mut acc, mut chunk| async move {
            while chunk.has_remaining() {
                let bytes = chunk.chunk();
                let len = bytes.len();
                acc.extend_from_slice(bytes);
                chunk.advance(len);
            }
            Ok(acc)
        })
        .await
        .map_err(|e| UploadError::Multipart(e.to_string()))
}

/// Turns rejections into JSON error bodies.
pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, body) = if let Some(api) = err.find::<ApiError>() {
        if api.status() == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", api.body());
        }
        (api.status(), api.body())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, json!({"error": "Not found"}))
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, json!({"error": "Upload too large"}))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, json!({"error": "Method not allowed"}))
    } else {
        debug!("Unhandled rejection: {:?}", err);
        (StatusCode::BAD_REQUEST, json!({"error": "Bad request"}))
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status))
}
