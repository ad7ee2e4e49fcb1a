use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SessionError};

pub const DEFAULT_ENDPOINT: &str = "http://localhost:5273/v1";
pub const DEFAULT_SOURCE: &str = "foundry_local";
pub const ENDPOINT_ENV: &str = "FOUNDRY_LOCAL_ENDPOINT";
pub const API_KEY_ENV: &str = "FOUNDRY_LOCAL_API_KEY";

/// How the manager acquires the local service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum LaunchMode {
    /// Only locate an already running service.
    #[default]
    Attach,
    /// Start the service with `program args...` when it is not reachable.
    Spawn {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Http,
    Https,
}

/// Connection and lifecycle settings for the local service.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Base URL of the OpenAI-compatible API, including the `/v1` suffix.
    pub endpoint: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: SecretString,
    pub launch: LaunchMode,
    pub startup_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Alias -> concrete model id, consulted before the catalog.
    pub aliases: HashMap<String, String>,
    /// Label reported as the `source` of every run.
    pub source: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: SecretString::from(String::new()),
            launch: LaunchMode::Attach,
            startup_timeout_secs: 120,
            request_timeout_secs: 300,
            connect_timeout_secs: 5,
            aliases: HashMap::new(),
            source: DEFAULT_SOURCE.to_string(),
        }
    }
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(SecretString::from(raw))
}

impl ServiceConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Defaults, then the user config file (if any), then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("foundry-session").join("config.json"))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            SessionError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded service config file");
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| SessionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            self.endpoint = endpoint;
        }
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            self.api_key = SecretString::from(key);
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = SecretString::from(key.into());
        self
    }

    pub fn with_launch(mut self, launch: LaunchMode) -> Self {
        self.launch = launch;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.aliases.insert(alias.into(), model_id.into());
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Rejects endpoints whose transport is not stated explicitly.
    pub fn validate(&self) -> Result<()> {
        self.transport()?;
        if self.source.trim().is_empty() {
            return Err(SessionError::Config("source label must not be empty".into()));
        }
        if let LaunchMode::Spawn { program, .. } = &self.launch {
            if program.trim().is_empty() {
                return Err(SessionError::Config("spawn program must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn transport(&self) -> Result<Transport> {
        let endpoint = self.endpoint.trim();
        if endpoint.starts_with("http://") {
            Ok(Transport::Http)
        } else if endpoint.starts_with("https://") {
            Ok(Transport::Https)
        } else {
            Err(SessionError::Config(format!(
                "endpoint '{}' must start with http:// or https://",
                self.endpoint
            )))
        }
    }

    /// Endpoint without trailing slashes, e.g. `http://localhost:5273/v1`.
    pub fn base_url(&self) -> String {
        self.endpoint.trim().trim_end_matches('/').to_string()
    }

    /// Root of the service, i.e. the endpoint with a trailing `/v1` removed.
    pub fn service_uri(&self) -> String {
        let base = self.base_url();
        base.strip_suffix("/v1").map(str::to_string).unwrap_or(base)
    }

    /// The key as a header value, or `None` when the service needs no auth.
    pub(crate) fn bearer(&self) -> Option<String> {
        let key = self.api_key.expose_secret();
        if key.is_empty() {
            None
        } else {
            Some(format!("Bearer {}", key))
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.base_url(), "http://localhost:5273/v1");
        assert_eq!(config.service_uri(), "http://localhost:5273");
        assert_eq!(config.launch, LaunchMode::Attach);
        assert_eq!(config.source, "foundry_local");
        assert!(config.bearer().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_spawn_config() {
        let config = ServiceConfig::from_json(
            r#"{
                "endpoint": "https://127.0.0.1:5273/v1/",
                "api_key": "local-key",
                "launch": { "mode": "spawn", "program": "foundry", "args": ["service", "start"] },
                "aliases": { "qwen": "qwen2.5-0.5b-instruct-generic-cpu:3" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.transport().unwrap(), Transport::Https);
        assert_eq!(config.base_url(), "https://127.0.0.1:5273/v1");
        assert_eq!(config.bearer().as_deref(), Some("Bearer local-key"));
        assert_eq!(
            config.launch,
            LaunchMode::Spawn {
                program: "foundry".to_string(),
                args: vec!["service".to_string(), "start".to_string()],
            }
        );
        assert_eq!(config.aliases["qwen"], "qwen2.5-0.5b-instruct-generic-cpu:3");
        assert_eq!(config.startup_timeout_secs, 120);
    }

    #[test]
    fn test_rejects_implicit_transport() {
        let err = ServiceConfig::from_json(r#"{ "endpoint": "localhost:5273/v1" }"#).unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));

        let err = ServiceConfig::new("ftp://localhost/v1").validate().unwrap_err();
        assert!(err.to_string().contains("http:// or https://"));
    }

    #[test]
    fn test_rejects_empty_spawn_program() {
        let config = ServiceConfig::default().with_launch(LaunchMode::Spawn {
            program: " ".to_string(),
            args: vec![],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_service_uri_without_version_suffix() {
        let config = ServiceConfig::new("http://10.0.0.2:8080");
        assert_eq!(config.service_uri(), "http://10.0.0.2:8080");
    }
}
