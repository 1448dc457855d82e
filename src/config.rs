// src/config.rs
use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_TITLE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    MissingVar(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

/// Service configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub gemini_api_key: String,
    pub gemini_model: Option<String>,
    /// Bearer-token verification secret. Absent means auth is disabled,
    /// which is only sensible for local development.
    pub jwt_secret: Option<String>,
    /// Upper bound on how long a title long-poll may wait.
    pub title_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingVar("DATABASE_URL"))?;
        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("GEMINI_API_KEY"))?;

        let title_timeout_secs = match std::env::var("TITLE_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
                var: "TITLE_TIMEOUT_SECS",
                value: raw,
            })?,
            Err(_) => DEFAULT_TITLE_TIMEOUT_SECS,
        };

        Ok(Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string()),
            database_url,
            gemini_api_key,
            gemini_model: std::env::var("GEMINI_MODEL").ok(),
            jwt_secret: std::env::var("JWT_SECRET").ok(),
            title_timeout: Duration::from_secs(title_timeout_secs),
        })
    }
}
