//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated)
    pub client_origin: String,

    /// Base URL of the accounts/stats/skills REST service. When unset,
    /// default loadouts are used and match records are only logged.
    pub accounts_api_url: Option<String>,
    /// Shared secret for HS256 tokens issued by the accounts service.
    /// When unset, WebSocket connections are anonymous.
    pub jwt_secret: Option<String>,

    /// Rules and cadence for every room
    pub game: GameSettings,
}

/// Per-room rules and timing
#[derive(Clone, Debug, PartialEq)]
pub struct GameSettings {
    /// Goals needed to win a match
    pub win_score: u32,
    /// A slot silent for this long is treated as disconnected
    pub idle_timeout: Duration,
    /// Snapshots per second (capped at the simulation rate)
    pub snapshot_tps: u32,
    /// Delay between both players readying and the puck being served
    pub start_delay: Duration,
    /// How long a finished match is shown before the room is recycled
    pub result_hold: Duration,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            win_score: 7,
            idle_timeout: Duration::from_secs(30),
            snapshot_tps: 60,
            start_delay: Duration::from_secs(1),
            result_hold: Duration::from_secs(3),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        };

        let defaults = GameSettings::default();
        let game = GameSettings {
            win_score: parse_or("WIN_SCORE", defaults.win_score)?,
            idle_timeout: Duration::from_secs(parse_or(
                "IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )?),
            snapshot_tps: parse_or("SNAPSHOT_TPS", defaults.snapshot_tps)?,
            ..defaults
        };

        if game.win_score == 0 {
            return Err(ConfigError::Invalid("WIN_SCORE"));
        }
        if game.snapshot_tps == 0 {
            return Err(ConfigError::Invalid("SNAPSHOT_TPS"));
        }

        Ok(Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            client_origin: env::var("CLIENT_ORIGIN")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),

            accounts_api_url: optional("ACCOUNTS_API_URL")
                .map(|url| url.trim_end_matches('/').to_string()),
            jwt_secret: optional("JWT_SECRET"),

            game,
        })
    }

    /// Local, anonymous configuration with default game rules
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_level: "debug".to_string(),
            client_origin: "http://localhost:5173".to_string(),
            accounts_api_url: None,
            jwt_secret: None,
            game: GameSettings::default(),
        }
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        None => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; keep every mutation in one test.
    #[test]
    fn reads_overrides_and_rejects_bad_numbers() {
        env::remove_var("PORT");
        env::set_var("SERVER_ADDR", "127.0.0.1:9100");
        env::set_var("WIN_SCORE", "3");
        env::set_var("ACCOUNTS_API_URL", "http://accounts.local/");
        env::remove_var("JWT_SECRET");

        let config = Config::from_env().unwrap();
        assert_eq!(config.server_addr.port(), 9100);
        assert_eq!(config.game.win_score, 3);
        assert_eq!(config.game.snapshot_tps, 60);
        assert_eq!(config.accounts_api_url.as_deref(), Some("http://accounts.local"));
        assert!(config.jwt_secret.is_none());

        env::set_var("WIN_SCORE", "seven");
        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid("WIN_SCORE"))
        ));

        env::set_var("WIN_SCORE", "0");
        assert!(Config::from_env().is_err());

        env::remove_var("WIN_SCORE");
        env::remove_var("SERVER_ADDR");
        env::remove_var("ACCOUNTS_API_URL");
    }
}
