//! Declarative configuration loader.
//!
//! Out of the core's scope per spec.md §1 (the bus treats this as an
//! external collaborator) — this is the thin loader `bin/pb-server` uses to
//! get there, mirroring the teacher's `fc-config` file+env layering.

mod loader;

pub use loader::ConfigLoader;

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8181,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueDefaultsConfig {
    pub concurrency_limit: u32,
    pub max_attempts: u32,
    pub retry_delay_seconds: u64,
    pub ttl_seconds: u64,
    pub auto_acknowledge: bool,
}

impl Default for QueueDefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            max_attempts: 10,
            retry_delay_seconds: 1,
            ttl_seconds: 0,
            auto_acknowledge: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub name: String,
    pub base_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database_path: String,
    pub queue_defaults: QueueDefaultsConfig,
    pub endpoints: Vec<EndpointConfig>,
    pub log_format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database_path: "platibus.db".to_string(),
            queue_defaults: QueueDefaultsConfig::default(),
            endpoints: Vec::new(),
            log_format: "text".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.http.port, 8181);
        assert_eq!(config.queue_defaults.max_attempts, 10);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            database_path = "/tmp/x.db"

            [http]
            port = 9000
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_path, "/tmp/x.db");
        assert_eq!(config.http.port, 9000);
        assert_eq!(config.http.host, "0.0.0.0");
    }
}
