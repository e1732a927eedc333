//! Layered settings: built-in defaults, then an optional TOML file, then
//! `PARLEY__SECTION__KEY` environment variables.

use std::path::Path;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "parley.toml";
const ENV_PREFIX: &str = "PARLEY";

const DEFAULT_ADDR: &str = "0.0.0.0:3001";
const DEFAULT_JWT_SECRET: &str = "defaultsecret";
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const DEFAULT_UPLOAD_LIMIT: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub uploads: UploadSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub addr: String,
    #[serde(default)]
    pub tls_cert: Option<String>,
    #[serde(default)]
    pub tls_key: Option<String>,
    /// Allowed CORS origin; any origin when unset.
    #[serde(default)]
    pub cors_origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    pub jwt_secret: String,
    /// Reject socket upgrades that carry no valid `token` query parameter.
    pub require_socket_token: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadSettings {
    pub dir: String,
    pub max_bytes: usize,
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Config::builder()
            .set_default("server.addr", DEFAULT_ADDR)?
            .set_default("auth.jwt_secret", DEFAULT_JWT_SECRET)?
            .set_default("auth.require_socket_token", false)?
            .set_default("uploads.dir", DEFAULT_UPLOAD_DIR)?
            .set_default("uploads.max_bytes", DEFAULT_UPLOAD_LIMIT as u64)?
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    /// TLS certificate and key paths when both are configured.
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server: ServerSettings {
                addr: DEFAULT_ADDR.to_string(),
                tls_cert: None,
                tls_key: None,
                cors_origin: None,
            },
            auth: AuthSettings {
                jwt_secret: DEFAULT_JWT_SECRET.to_string(),
                require_socket_token: false,
            },
            uploads: UploadSettings {
                dir: DEFAULT_UPLOAD_DIR.to_string(),
                max_bytes: DEFAULT_UPLOAD_LIMIT,
            },
        }
    }
}
