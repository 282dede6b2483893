use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::info;

const CONFIG_PATHS: &[&str] = &[
    "config.toml",
    "platibus.toml",
    "./config/platibus.toml",
    "/etc/platibus/config.toml",
];

pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
        }

        if let Ok(path) = env::var("PLATIBUS_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        for path in CONFIG_PATHS {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut AppConfig) {
        if let Ok(val) = env::var("PLATIBUS_HTTP_PORT") {
            if let Ok(port) = val.parse() {
                config.http.port = port;
            }
        }
        if let Ok(val) = env::var("PLATIBUS_HTTP_HOST") {
            config.http.host = val;
        }
        if let Ok(val) = env::var("PLATIBUS_DATABASE_PATH") {
            config.database_path = val;
        }
        if let Ok(val) = env::var("LOG_FORMAT") {
            config.log_format = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_from_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "database_path = \"/tmp/foo.db\"").unwrap();
        let loader = ConfigLoader::with_path(file.path());
        let config = loader.load().unwrap();
        assert_eq!(config.database_path, "/tmp/foo.db");
    }

    #[test]
    fn falls_back_to_defaults_when_no_file_found() {
        let loader = ConfigLoader::with_path("/nonexistent/path/x.toml");
        let config = loader.load().unwrap();
        assert_eq!(config.database_path, "platibus.db");
    }
}
