use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file, or `:memory:`
    pub sqlite_path: PathBuf,

    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: PathBuf::from("data/tripwire.db"),
            max_connections: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: PathBuf::from(":memory:"),
            max_connections: 1,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path.as_os_str() == ":memory:"
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sqlite_path.as_os_str().is_empty() {
            return Err("SQLite path must not be empty".to_string());
        }
        if self.max_connections == 0 {
            return Err("max_connections must be at least 1".to_string());
        }
        Ok(())
    }
}
