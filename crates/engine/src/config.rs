use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::{
    store::DatabaseConfig,
    trigger::TimeoutPolicy,
    workflow::DEFAULT_MAX_STEPS,
    Error,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,

    /// Base URL providers call back on; webhook URLs are `{public_url}/webhooks/{provider}`
    pub public_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory of workflow definitions loaded at startup
    pub workflows_dir: Option<PathBuf>,

    pub max_steps: usize,

    #[serde(skip)]
    pub timeout_policy: TimeoutPolicy,
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let defaults = Config::default();
        let config = Config {
            server: ServerConfig {
                addr: std::env::var("SERVER_ADDR").unwrap_or(defaults.server.addr),
                public_url: std::env::var("PUBLIC_URL")
                    .map(|url| url.trim_end_matches('/').to_string())
                    .unwrap_or(defaults.server.public_url),
            },
            database: DatabaseConfig {
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.database.sqlite_path),
                max_connections: parse_var("DATABASE_MAX_CONNECTIONS")?
                    .unwrap_or(defaults.database.max_connections),
            },
            engine: EngineConfig {
                workflows_dir: std::env::var("WORKFLOWS_DIR").ok().map(PathBuf::from),
                max_steps: parse_var("ENGINE_MAX_STEPS")?.unwrap_or(defaults.engine.max_steps),
                timeout_policy: parse_var("TIMEOUT_POLICY")?
                    .unwrap_or(defaults.engine.timeout_policy),
            },
        };

        config.database.validate().map_err(Error::Config)?;
        if config.engine.max_steps == 0 {
            return Err(Error::Config("ENGINE_MAX_STEPS must be at least 1".to_string()));
        }
        url::Url::parse(&config.server.public_url)?;

        Ok(config)
    }

    /// Callback URL handed to a provider's watch procedure.
    pub fn webhook_url(&self, provider: &str) -> String {
        format!("{}/webhooks/{}", self.server.public_url, provider)
    }
}

fn parse_var<T>(name: &str) -> crate::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {}='{}': {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
                public_url: "http://localhost:8080".to_string(),
            },
            database: DatabaseConfig::default(),
            engine: EngineConfig {
                workflows_dir: None,
                max_steps: DEFAULT_MAX_STEPS,
                timeout_policy: TimeoutPolicy::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_url_joins_provider() {
        let mut config = Config::default();
        assert_eq!(config.webhook_url("github"), "http://localhost:8080/webhooks/github");

        config.server.public_url = "https://hooks.example.com".to_string();
        assert_eq!(config.webhook_url("slack"), "https://hooks.example.com/webhooks/slack");
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.engine.max_steps, 10_000);
        assert_eq!(config.engine.timeout_policy, TimeoutPolicy::Drop);
        assert_eq!(config.database.max_connections, 5);
    }
}
