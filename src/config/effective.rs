//! Effective configuration
//!
//! Merges the configuration layers and deserializes the result into typed
//! sections, keeping track of which sources contributed.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::defaults::BuiltinDefaults;
use super::dynamic::{DynamicSettings, MAX_HEARTBEAT_SECONDS};
use super::merge::merge_layers;
use crate::filestream::{FileStreamConfig, HttpTransportConfig, RetryPolicy};
use crate::sock::{AcceptMode, ServerConfig};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "TELEMETRY_";

/// Keys whose values must never be logged
const SECRET_KEYS: &[&str] = &["api_key", "password", "token"];

/// Origin of a configuration layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
    Cli,
}

/// A contributing layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path for file layers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    pub accept_mode: AcceptMode,
    pub relay_poll_ms: u64,
}

/// `[api]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub entity: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub http_timeout_seconds: u64,
}

/// `[filestream.retry]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

/// `[filestream]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStreamSection {
    pub heartbeat_seconds: f64,
    pub max_items_per_push: usize,
    pub max_line_bytes: usize,
    pub retry: RetrySection,
}

/// Fully merged service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub server: ServerSection,
    pub api: ApiConfig,
    pub filestream: FileStreamSection,

    /// Contributing layers in precedence order
    #[serde(skip)]
    pub sources: Vec<ConfigSource>,
}

impl ServiceConfig {
    /// Build from defaults plus an optional file, the process environment and
    /// CLI overrides
    pub fn load(config_path: Option<&Path>, cli_overrides: Option<Value>) -> Result<Self, ConfigError> {
        Self::build(config_path, |key| std::env::var(key).ok(), cli_overrides)
    }

    /// Build with an explicit environment lookup
    pub fn build<F>(
        config_path: Option<&Path>,
        env: F,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
        }];

        if let Some(path) = config_path {
            layers.push(load_toml_file(path)?);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
            });
        }

        let env_layer = env_overrides(&env)?;
        if env_layer.as_object().is_some_and(|m| !m.is_empty()) {
            layers.push(env_layer);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                path: None,
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
            });
        }

        let merged = merge_layers(layers);
        let mut config: ServiceConfig = serde_json::from_value(merged)
            .map_err(|e| ConfigError::ParseError(format!("invalid configuration: {}", e)))?;
        config.sources = sources;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.relay_poll_ms == 0 {
            return Err(ConfigError::ValidationError(
                "server.relay_poll_ms must be greater than 0".to_string(),
            ));
        }
        if self.api.http_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "api.http_timeout_seconds must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.filestream.retry.jitter) {
            return Err(ConfigError::ValidationError(
                "filestream.retry.jitter must be in [0, 1)".to_string(),
            ));
        }
        let heartbeat = self.filestream.heartbeat_seconds;
        if !(0.0..=MAX_HEARTBEAT_SECONDS).contains(&heartbeat) {
            return Err(ConfigError::ValidationError(format!(
                "filestream.heartbeat_seconds must be between 0 and {}",
                MAX_HEARTBEAT_SECONDS
            )));
        }
        if self.filestream.max_items_per_push == 0 {
            return Err(ConfigError::ValidationError(
                "filestream.max_items_per_push must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket server settings
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            accept_mode: self.server.accept_mode,
            relay_poll_interval: Duration::from_millis(self.server.relay_poll_ms),
        }
    }

    /// Uploader settings
    pub fn file_stream_config(&self) -> FileStreamConfig {
        let retry = &self.filestream.retry;
        FileStreamConfig {
            max_items_per_push: self.filestream.max_items_per_push,
            max_line_bytes: self.filestream.max_line_bytes,
            retry: RetryPolicy {
                max_retries: retry.max_retries,
                initial_delay: Duration::from_millis(retry.initial_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
                jitter: retry.jitter,
            },
        }
    }

    /// HTTP client settings
    pub fn http_transport_config(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            api_key: self.api.api_key.clone(),
            username: self.api.username.clone(),
            email: self.api.email.clone(),
            timeout: Duration::from_secs(self.api.http_timeout_seconds),
            ..HttpTransportConfig::default()
        }
    }

    /// Seed the runtime settings store
    pub fn dynamic_settings(&self) -> DynamicSettings {
        let mut values = Map::new();
        values.insert("base_url".to_string(), json!(self.api.base_url));
        values.insert("heartbeat_seconds".to_string(), json!(self.filestream.heartbeat_seconds));
        if let Some(entity) = &self.api.entity {
            values.insert("entity".to_string(), json!(entity));
        }
        if let Some(project) = &self.api.project {
            values.insert("project".to_string(), json!(project));
        }
        DynamicSettings::from_map(values)
    }

    /// JSON rendering with secrets replaced, for logging
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        redact(&mut value);
        value
    }
}

fn load_toml_file(path: &Path) -> Result<Value, ConfigError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
    let table: toml::Table = toml::from_str(&contents)
        .map_err(|e| ConfigError::ParseError(format!("TOML parse error in {}: {}", path.display(), e)))?;
    serde_json::to_value(table).map_err(|e| ConfigError::ParseError(e.to_string()))
}

fn env_overrides<F>(env: &F) -> Result<Value, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| env(&format!("{}{}", ENV_PREFIX, name));

    let mut api = Map::new();
    for (name, key) in [
        ("BASE_URL", "base_url"),
        ("API_KEY", "api_key"),
        ("ENTITY", "entity"),
        ("PROJECT", "project"),
        ("USERNAME", "username"),
        ("USER_EMAIL", "email"),
    ] {
        if let Some(value) = var(name) {
            api.insert(key.to_string(), Value::String(value));
        }
    }
    if let Some(raw) = var("HTTP_TIMEOUT") {
        let seconds: u64 = raw.trim().parse().map_err(|_| {
            ConfigError::ParseError(format!("{}HTTP_TIMEOUT must be an integer, got '{}'", ENV_PREFIX, raw))
        })?;
        api.insert("http_timeout_seconds".to_string(), json!(seconds));
    }

    let mut layer = Map::new();
    if !api.is_empty() {
        layer.insert("api".to_string(), Value::Object(api));
    }
    Ok(Value::Object(layer))
}

fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if SECRET_KEYS.contains(&key.as_str()) && val.is_string() {
                    *val = Value::String("[REDACTED]".to_string());
                } else {
                    redact(val);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_defaults_only() {
        let config = ServiceConfig::build(None, no_env, None).unwrap();

        assert_eq!(config.server.port, 0);
        assert_eq!(config.server_config().accept_mode, AcceptMode::Single);
        assert_eq!(config.file_stream_config().retry.max_retries, 30);
        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].origin, ConfigOrigin::Builtin);
    }

    #[test]
    fn test_file_then_env_then_cli() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]").unwrap();
        writeln!(file, "port = 7100").unwrap();
        writeln!(file, "[api]").unwrap();
        writeln!(file, "entity = \"from-file\"").unwrap();
        writeln!(file, "http_timeout_seconds = 20").unwrap();

        let env: HashMap<&str, &str> = [
            ("TELEMETRY_ENTITY", "from-env"),
            ("TELEMETRY_HTTP_TIMEOUT", "5"),
        ]
        .into_iter()
        .collect();
        let lookup = |key: &str| env.get(key).map(|v| v.to_string());

        let cli = json!({"server": {"port": 7200}});
        let config = ServiceConfig::build(Some(file.path()), lookup, Some(cli)).unwrap();

        assert_eq!(config.server.port, 7200);
        assert_eq!(config.api.entity.as_deref(), Some("from-env"));
        assert_eq!(config.api.http_timeout_seconds, 5);
        let origins: Vec<_> = config.sources.iter().map(|s| s.origin).collect();
        assert_eq!(
            origins,
            vec![ConfigOrigin::Builtin, ConfigOrigin::File, ConfigOrigin::Env, ConfigOrigin::Cli]
        );
    }

    #[test]
    fn test_bad_env_timeout() {
        let lookup = |key: &str| (key == "TELEMETRY_HTTP_TIMEOUT").then(|| "ten".to_string());
        let err = ServiceConfig::build(None, lookup, None).unwrap_err();
        assert!(err.to_string().contains("HTTP_TIMEOUT"));
    }

    #[test]
    fn test_invalid_accept_mode() {
        let cli = json!({"server": {"accept_mode": "pool"}});
        let err = ServiceConfig::build(None, no_env, Some(cli)).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));

        let cli = json!({"server": {"accept_mode": "multiple"}});
        let config = ServiceConfig::build(None, no_env, Some(cli)).unwrap();
        assert_eq!(config.server_config().accept_mode, AcceptMode::Multiple);
    }

    #[test]
    fn test_zero_relay_poll_rejected() {
        let cli = json!({"server": {"relay_poll_ms": 0}});
        let err = ServiceConfig::build(None, no_env, Some(cli)).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_out_of_range_heartbeat_rejected() {
        for seconds in [-1.0, 1e20] {
            let cli = json!({"filestream": {"heartbeat_seconds": seconds}});
            let err = ServiceConfig::build(None, no_env, Some(cli)).unwrap_err();
            assert!(err.to_string().contains("heartbeat_seconds"));
        }
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = ServiceConfig::build(Some(Path::new("/nonexistent/telemetry.toml")), no_env, None);
        assert!(matches!(result, Err(ConfigError::IoError(_))));
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let cli = json!({"api": {"api_key": "hunter2"}});
        let config = ServiceConfig::build(None, no_env, Some(cli)).unwrap();

        assert_eq!(config.api.api_key.as_deref(), Some("hunter2"));
        assert_eq!(config.redacted()["api"]["api_key"], "[REDACTED]");
    }

    #[test]
    fn test_http_transport_config() {
        let lookup = |key: &str| match key {
            "TELEMETRY_API_KEY" => Some("secret".to_string()),
            "TELEMETRY_USERNAME" => Some("ada".to_string()),
            _ => None,
        };
        let config = ServiceConfig::build(None, lookup, None).unwrap();
        let http = config.http_transport_config();

        assert_eq!(http.api_key.as_deref(), Some("secret"));
        assert_eq!(http.username.as_deref(), Some("ada"));
        assert_eq!(http.email, None);
        assert_eq!(http.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_dynamic_settings_seeded() {
        let cli = json!({"api": {"entity": "team", "project": "proj"}, "filestream": {"heartbeat_seconds": 12.0}});
        let config = ServiceConfig::build(None, no_env, Some(cli)).unwrap();
        let settings = config.dynamic_settings();

        assert_eq!(settings.entity().as_deref(), Some("team"));
        assert_eq!(settings.project().as_deref(), Some("proj"));
        assert_eq!(settings.heartbeat(), Duration::from_secs(12));
    }
}
