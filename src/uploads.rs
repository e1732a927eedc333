use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::UploadError;

/// URL prefix under which stored files are served.
pub const PUBLIC_PREFIX: &str = "/uploads";

/// What a client needs to reference an uploaded file in a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUpload {
    pub url: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub originalname: String,
}

/// Content-addressed file storage. Identical uploads share one file on disk.
pub struct UploadStore {
    dir: PathBuf,
    max_bytes: usize,
    by_digest: RwLock<HashMap<String, String>>,
}

impl UploadStore {
    pub async fn new(dir: impl AsRef<Path>, max_bytes: usize) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;

        Ok(UploadStore {
            dir,
            max_bytes,
            by_digest: RwLock::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub async fn save(
        &self,
        original_name: String,
        content_type: String,
        content: Vec<u8>,
    ) -> Result<StoredUpload, UploadError> {
        if content.len() > self.max_bytes {
            return Err(UploadError::TooLarge { limit: self.max_bytes });
        }

        let digest = format!("{:x}", Sha256::digest(&content));
        let existing = self.by_digest.read().await.get(&digest).cloned();
        let file_name = match existing {
            Some(file_name) => file_name,
            None => {
                let file_name = format!("{digest}{}", extension_of(&original_name));
                fs::write(self.dir.join(&file_name), &content).await?;
                self.by_digest
                    .write()
                    .await
                    .insert(digest, file_name.clone());
                file_name
            }
        };

        Ok(StoredUpload {
            url: format!("{PUBLIC_PREFIX}/{file_name}"),
            content_type,
            originalname: original_name,
        })
    }
}

/// `.ext` of `name` when it is short and alphanumeric, otherwise empty.
fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
        .unwrap_or_default()
}
