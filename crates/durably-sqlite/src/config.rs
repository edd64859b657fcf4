//! Environment-driven configuration for the SQLite backend.

use once_cell::sync::Lazy;
use std::env;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl DbConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://durably.db".to_string());
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        Self {
            database_url,
            max_connections,
        }
    }
}

/// Lazily loaded once per process, the way the teacher's `AppConfig` is.
pub static CONFIG: Lazy<DbConfig> = Lazy::new(DbConfig::from_env);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_env_unset() {
        // SAFETY: test-only, single-threaded mutation of the process
        // environment; no other test in this module reads these keys.
        unsafe {
            env::remove_var("DATABASE_URL");
            env::remove_var("DATABASE_MAX_CONNECTIONS");
        }
        let config = DbConfig::from_env();
        assert_eq!(config.database_url, "sqlite://durably.db");
        assert_eq!(config.max_connections, 5);
    }
}
