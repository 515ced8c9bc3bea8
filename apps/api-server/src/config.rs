//! Centralized configuration for api-server.
//!
//! All environment variables are loaded and validated at startup to fail fast
//! on misconfiguration rather than at request time. A `.env` file, if present,
//! is loaded into the environment before this runs.

use axum::http::HeaderValue;
use std::env;
use std::fmt;
use std::path::PathBuf;

/// Storage backend provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageProvider {
    /// In-memory storage (data lost on restart)
    Memory,
    /// SQLite file-based storage
    Sqlite,
}

impl StorageProvider {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("memory") {
            Self::Memory
        } else {
            Self::Sqlite
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Configuration error for {}: {}", self.field, self.message)
    }
}

impl std::error::Error for ConfigError {}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server port (default: 3001)
    pub port: u16,
    /// CORS allow origin
    pub cors_allow_origin: HeaderValue,
    /// Storage provider (default: sqlite)
    pub storage_provider: StorageProvider,
    /// SQLite database path
    pub db_path: PathBuf,
    /// Secret for the root key; only needed while no root key exists.
    pub root_user_key: Option<String>,
    /// Host of this deployment. Redirects to it are refused.
    pub public_site_host: Option<String>,
    /// Log format
    pub log_format: LogFormat,
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| env::var(k).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Result<Self, ConfigError> {
        // Port
        let port = match get("PORT") {
            Some(s) => s.trim().parse().map_err(|_| ConfigError {
                field: "PORT",
                message: format!("'{s}' is not a valid port"),
            })?,
            None => 3001,
        };

        // CORS allow origin
        let cors_origin_str = get("CORS_ALLOW_ORIGIN").unwrap_or_else(|| "*".into());
        let cors_allow_origin = if cors_origin_str == "*" {
            HeaderValue::from_static("*")
        } else {
            HeaderValue::from_str(&cors_origin_str).map_err(|e| ConfigError {
                field: "CORS_ALLOW_ORIGIN",
                message: format!("Invalid header value '{}': {}", cors_origin_str, e),
            })?
        };

        let storage_provider =
            StorageProvider::from_str(&get("STORAGE_PROVIDER").unwrap_or_else(|| "sqlite".into()));

        let db_path = get("DB_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/shortener.db"));

        let root_user_key = get("ROOT_USER_KEY").filter(|s| !s.trim().is_empty());

        let public_site_host = match get("PUBLIC_SITE_URL").filter(|s| !s.trim().is_empty()) {
            Some(raw) => Some(domain::validate::site_host_from_config(&raw).ok_or_else(|| {
                ConfigError {
                    field: "PUBLIC_SITE_URL",
                    message: format!("cannot extract a host from '{raw}'"),
                }
            })?),
            None => None,
        };

        let log_format = LogFormat::from_str(&get("LOG_FORMAT").unwrap_or_else(|| "pretty".into()));

        Ok(Self {
            port,
            cors_allow_origin,
            storage_provider,
            db_path,
            root_user_key,
            public_site_host,
            log_format,
        })
    }

    /// Log warnings about risky configuration.
    pub fn warn_if_insecure(&self) {
        if self.public_site_host.is_none() {
            tracing::warn!(
                "PUBLIC_SITE_URL not set: links pointing back at this shortener will be accepted."
            );
        }
        if self.storage_provider == StorageProvider::Memory {
            tracing::warn!("STORAGE_PROVIDER=memory: keys and links are lost on restart.");
        }
    }
}
