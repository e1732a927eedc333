use serde_json::json;
use thiserror::Error;
use warp::http::StatusCode;

/// Failures of the message/user persistence collaborator.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("file exceeds the {limit} byte upload limit")]
    TooLarge { limit: usize },
    #[error("multipart form has no `file` part")]
    MissingFile,
    #[error("failed to read upload: {0}")]
    Multipart(String),
    #[error("failed to store upload: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the HTTP routes.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("No token provided")]
    MissingToken,
    #[error("Invalid token")]
    InvalidToken,
    #[error("Failed to issue token")]
    TokenIssue(#[source] jsonwebtoken::errors::Error),
    #[error("Store request failed")]
    Store(#[from] StoreError),
    #[error("Upload failed")]
    Upload(#[from] UploadError),
}

impl warp::reject::Reject for ApiError {}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingToken | ApiError::InvalidToken => StatusCode::UNAUTHORIZED,
            ApiError::Upload(UploadError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Upload(UploadError::MissingFile | UploadError::Multipart(_)) => StatusCode::BAD_REQUEST,
            ApiError::TokenIssue(_) | ApiError::Store(_) | ApiError::Upload(UploadError::Io(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn body(&self) -> serde_json::Value {
        match self {
            ApiError::Store(inner) => json!({"error": self.to_string(), "details": inner.to_string()}),
            ApiError::Upload(inner) => json!({"error": self.to_string(), "details": inner.to_string()}),
            ApiError::TokenIssue(inner) => json!({"error": self.to_string(), "details": inner.to_string()}),
            ApiError::MissingToken | ApiError::InvalidToken => json!({"error": self.to_string()}),
        }
    }
}
