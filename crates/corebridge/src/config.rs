use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credentials_file: default_credentials_file(),
            session_ttl_secs: default_session_ttl(),
        }
    }
}

impl AuthConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

#[derive(Debug, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_gateway_timeout")]
    pub timeout_secs: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_gateway_timeout(),
        }
    }
}

impl GatewaySettings {
    pub fn to_gateway_config(&self) -> core_gateway::GatewayConfig {
        core_gateway::GatewayConfig {
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Serde defaults.

fn default_listen() -> String {
    "0.0.0.0:22345".to_string()
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("data").join("auth.yaml")
}

fn default_session_ttl() -> u64 {
    24 * 60 * 60
}

fn default_gateway_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Read the YAML configuration at `path`. A missing file is not an error:
/// the defaults are used and a warning is logged.
pub fn load(path: &Path) -> anyhow::Result<Config> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            warn!(path = %path.display(), "no configuration file; running with defaults");
            return Ok(Config::default());
        }
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read config file {}", path.display()))
        }
    };

    serde_yml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

impl Config {
    /// Apply `SERVER_ADDR`, else `PORT`, on top of the configured listen
    /// address. `lookup` is normally `std::env::var`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(addr) = non_empty("SERVER_ADDR") {
            self.server.listen = addr.trim().to_string();
        } else if let Some(port) = non_empty("PORT") {
            self.server.listen = format!("0.0.0.0:{}", port.trim());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:22345");
        assert_eq!(config.auth.credentials_file, Path::new("data/auth.yaml"));
        assert_eq!(config.auth.session_ttl(), Duration::from_secs(86_400));
        assert_eq!(config.gateway.timeout_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "server:\n  listen: 127.0.0.1:8080\ngateway:\n  timeout_secs: 5\n",
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.gateway.to_gateway_config().timeout, Duration::from_secs(5));
        assert_eq!(config.auth.session_ttl_secs, 86_400);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:22345");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "server: [").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn server_addr_beats_port() {
        let mut config = Config::default();
        config.apply_env(env(&[("SERVER_ADDR", "127.0.0.1:9000"), ("PORT", "1")]));
        assert_eq!(config.server.listen, "127.0.0.1:9000");
    }

    #[test]
    fn port_binds_all_interfaces() {
        let mut config = Config::default();
        config.apply_env(env(&[("PORT", "8081")]));
        assert_eq!(config.server.listen, "0.0.0.0:8081");
    }

    #[test]
    fn empty_env_is_ignored() {
        let mut config = Config::default();
        config.apply_env(env(&[("SERVER_ADDR", " "), ("PORT", "")]));
        assert_eq!(config.server.listen, "0.0.0.0:22345");
    }
}
