use std::env;
use std::str::FromStr;

use log::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Memory,
    Sqlite,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(BackendKind::Memory),
            "sqlite" => Ok(BackendKind::Sqlite),
            other => Err(format!("unknown backend '{}', expected memory or sqlite", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub backend: BackendKind,
    pub database_url: String,
    pub log_level: String,
    pub max_message_length: usize,
    pub argon2_salt_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            database_url: "sqlite:data/chatdesk.db".to_string(),
            log_level: "info".to_string(),
            max_message_length: 2048,
            argon2_salt_length: 16,
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let config = Self {
            backend: env::var("CHATDESK_BACKEND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.backend),
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            max_message_length: env::var("MAX_MESSAGE_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_message_length),
            argon2_salt_length: env::var("ARGON2_SALT_LENGTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.argon2_salt_length),
        };

        info!("Client configuration loaded:");
        info!("  Backend: {:?}", config.backend);
        info!("  Database URL: {}", config.database_url);
        info!("  Max message length: {}", config.max_message_length);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("SQLite".parse::<BackendKind>(), Ok(BackendKind::Sqlite));
        assert_eq!(" memory ".parse::<BackendKind>(), Ok(BackendKind::Memory));
        assert!("redis".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.max_message_length, 2048);
        assert_eq!(config.argon2_salt_length, 16);
    }
}
