//! Relay configuration parsed from environment variables.
//!
//! `main` loads `.env` through `dotenvy` before calling
//! [`RelayConfig::from_env`], so local development and deployment share the
//! same variable names.

use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_TYPING_TIMEOUT_MS: u64 = 3000;
pub const DEFAULT_TYPING_SWEEP_INTERVAL_MS: u64 = 500;
pub const DEFAULT_CLIENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {value}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub database_url: String,
    pub port: u16,
    pub db_max_connections: u32,
    /// Idle time after which a typing entry is dropped by the sweeper.
    pub typing_timeout: Duration,
    pub typing_sweep_interval: Duration,
    /// Outbound queue depth per websocket connection.
    pub client_channel_capacity: usize,
}

impl RelayConfig {
    /// Build typed relay config from environment variables.
    ///
    /// Required:
    /// - `DATABASE_URL`
    ///
    /// Optional:
    /// - `PORT`: default 3000
    /// - `DB_MAX_CONNECTIONS`: default 5
    /// - `TYPING_TIMEOUT_MS`: default 3000
    /// - `TYPING_SWEEP_INTERVAL_MS`: default 500
    /// - `CLIENT_CHANNEL_CAPACITY`: default 256
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] without `DATABASE_URL` and
    /// [`ConfigError::Invalid`] for an unparsable `PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| ConfigError::Missing("DATABASE_URL"))?;
        let port = match std::env::var("PORT") {
            Ok(raw) => raw
                .parse::<u16>()
                .map_err(|_| ConfigError::Invalid { var: "PORT", value: raw })?,
            Err(_) => DEFAULT_PORT,
        };

        Ok(Self {
            database_url,
            port,
            db_max_connections: env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            typing_timeout: Duration::from_millis(env_parse("TYPING_TIMEOUT_MS", DEFAULT_TYPING_TIMEOUT_MS)),
            typing_sweep_interval: Duration::from_millis(env_parse(
                "TYPING_SWEEP_INTERVAL_MS",
                DEFAULT_TYPING_SWEEP_INTERVAL_MS,
            )),
            client_channel_capacity: env_parse("CLIENT_CHANNEL_CAPACITY", DEFAULT_CLIENT_CHANNEL_CAPACITY),
        })
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            port: DEFAULT_PORT,
            db_max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            typing_timeout: Duration::from_millis(DEFAULT_TYPING_TIMEOUT_MS),
            typing_sweep_interval: Duration::from_millis(DEFAULT_TYPING_SWEEP_INTERVAL_MS),
            client_channel_capacity: DEFAULT_CLIENT_CHANNEL_CAPACITY,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
