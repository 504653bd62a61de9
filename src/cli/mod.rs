//! Application configuration.
//!
//! Loaded once at startup from a TOML file, then overridden from `LLMR__*`
//! environment variables (`LLMR__BREAKER__FAILURE_THRESHOLD=3`). Nothing is
//! hot-reloaded.

use crate::providers::HttpClientConfig;
use crate::resilience::breaker::{BreakerConfig, BreakerSettings};
use crate::resilience::classifier::{Classifier, ErrorSeverity};
use crate::resilience::logger::DEFAULT_CHANNEL_CAPACITY;
use crate::resilience::retry::RetryPolicy;
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "LLMR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid environment override: {0}")]
    Env(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub retry: RetrySection,
    pub breaker: BreakerSection,
    pub store: StoreConfig,
    pub logger: LoggerSection,
    pub classifier: ClassifierSection,
    pub client: ClientSection,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            exponential_base: policy.exponential_base,
            jitter: policy.jitter,
        }
    }
}

impl RetrySection {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_base: self.exponential_base,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub timeout_secs: u64,
    pub store_timeout_ms: u64,
    pub cache_ttl_ms: u64,
    /// Per-endpoint overrides, keyed by model name
    pub endpoints: HashMap<String, EndpointBreakerConfig>,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let defaults = BreakerConfig::default();
        Self {
            failure_threshold: defaults.defaults.failure_threshold,
            timeout_secs: defaults.defaults.timeout.as_secs(),
            store_timeout_ms: defaults.store_timeout.as_millis() as u64,
            cache_ttl_ms: defaults.cache_ttl.as_millis() as u64,
            endpoints: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointBreakerConfig {
    pub failure_threshold: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl BreakerSection {
    pub fn breaker_config(&self) -> BreakerConfig {
        let defaults = BreakerSettings {
            failure_threshold: self.failure_threshold,
            timeout: Duration::from_secs(self.timeout_secs),
        };
        let endpoints = self
            .endpoints
            .iter()
            .map(|(name, over)| {
                let settings = BreakerSettings {
                    failure_threshold: over.failure_threshold.unwrap_or(defaults.failure_threshold),
                    timeout: over.timeout_secs.map(Duration::from_secs).unwrap_or(defaults.timeout),
                };
                (name.clone(), settings)
            })
            .collect();

        BreakerConfig {
            defaults,
            endpoints,
            store_timeout: Duration::from_millis(self.store_timeout_ms),
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// SQLite database file; `~/` is expanded
    pub path: Option<String>,
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        match self.path {
            Some(ref path) => expand_tilde(path),
            None => expand_tilde("~/.llm-resilience/state.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerSection {
    pub channel_capacity: usize,
}

impl Default for LoggerSection {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClassifierSection {
    /// Error kind code -> severity
    pub overrides: HashMap<String, ErrorSeverity>,
}

impl ClassifierSection {
    pub fn classifier(&self) -> Classifier {
        Classifier::with_overrides(self.overrides.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub request_timeout_ms: u64,
    pub headers: HashMap<String, String>,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            request_timeout_ms: 60_000,
            headers: HashMap::new(),
        }
    }
}

impl ClientSection {
    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            headers: self.headers.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 13457,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// `~/.llm-resilience/config.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".llm-resilience").join("config.toml"))
            .ok_or_else(|| ConfigError::Invalid("could not determine home directory".to_string()))
    }

    /// Load from `path` (defaults if the file does not exist), apply
    /// environment overrides, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;

        let env = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.apply_overrides(&env)?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without environment overrides or validation
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply scalar overrides from a layered source (dotted, lowercase keys).
    ///
    /// Map-valued settings (per-endpoint breakers, classifier overrides,
    /// headers) only come from the file: the `config` crate lowercases keys,
    /// which would mangle model names.
    pub fn apply_overrides(&mut self, source: &config::Config) -> Result<(), ConfigError> {
        override_value(source, "retry.max_attempts", &mut self.retry.max_attempts)?;
        override_value(source, "retry.base_delay_ms", &mut self.retry.base_delay_ms)?;
        override_value(source, "retry.max_delay_ms", &mut self.retry.max_delay_ms)?;
        override_value(source, "retry.exponential_base", &mut self.retry.exponential_base)?;
        override_value(source, "retry.jitter", &mut self.retry.jitter)?;

        override_value(source, "breaker.failure_threshold", &mut self.breaker.failure_threshold)?;
        override_value(source, "breaker.timeout_secs", &mut self.breaker.timeout_secs)?;
        override_value(source, "breaker.store_timeout_ms", &mut self.breaker.store_timeout_ms)?;
        override_value(source, "breaker.cache_ttl_ms", &mut self.breaker.cache_ttl_ms)?;

        override_value(source, "store.kind", &mut self.store.kind)?;
        let mut store_path = String::new();
        override_value(source, "store.path", &mut store_path)?;
        if !store_path.is_empty() {
            self.store.path = Some(store_path);
        }

        override_value(source, "logger.channel_capacity", &mut self.logger.channel_capacity)?;

        override_value(source, "client.base_url", &mut self.client.base_url)?;
        override_value(source, "client.request_timeout_ms", &mut self.client.request_timeout_ms)?;
        let mut api_key = String::new();
        override_value(source, "client.api_key", &mut api_key)?;
        if !api_key.is_empty() {
            self.client.api_key = Some(SecretString::new(api_key));
        }

        override_value(source, "server.host", &mut self.server.host)?;
        override_value(source, "server.port", &mut self.server.port)?;
        override_value(source, "logging.level", &mut self.logging.level)?;
        override_value(source, "logging.json", &mut self.logging.json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry
            .policy()
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("[retry] {}", e)))?;

        if self.breaker.failure_threshold < 1 {
            return Err(ConfigError::Invalid(
                "[breaker] failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.breaker.timeout_secs < 1 {
            return Err(ConfigError::Invalid(
                "[breaker] timeout_secs must be at least 1".to_string(),
            ));
        }
        for (name, over) in &self.breaker.endpoints {
            if over.failure_threshold == Some(0) || over.timeout_secs == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "[breaker.endpoints.\"{}\"] thresholds must be at least 1",
                    name
                )));
            }
        }

        url::Url::parse(&self.client.base_url).map_err(|e| {
            ConfigError::Invalid(format!("[client] base_url '{}': {}", self.client.base_url, e))
        })?;

        Ok(())
    }
}

fn override_value<T: DeserializeOwned>(
    source: &config::Config,
    key: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    match source.get::<T>(key) {
        Ok(value) => {
            *slot = value;
            Ok(())
        }
        Err(config::ConfigError::NotFound(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    const SAMPLE: &str = r#"
[retry]
max_attempts = 4
base_delay_ms = 500
jitter = false

[breaker]
failure_threshold = 2
timeout_secs = 30

[breaker.endpoints."GPT-4o"]
failure_threshold = 7

[store]
kind = "memory"

[classifier.overrides]
upstream = "recoverable"

[client]
base_url = "http://localhost:8080/v1/chat/completions"
api_key = "sk-test"
headers = { "X-Title" = "llmr" }

[server]
port = 9999
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        config.validate().unwrap();
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.timeout_secs, 300);
        assert_eq!(config.store.kind, StoreKind::Sqlite);
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::from_file(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.server.port, 13457);
    }

    #[test]
    fn test_parse_sample() {
        let file = write_config(SAMPLE);
        let config = AppConfig::from_file(file.path()).unwrap();
        config.validate().unwrap();

        let policy = config.retry.policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
        assert!(!policy.jitter);
        // Unset keys keep their defaults
        assert_eq!(policy.max_delay, Duration::from_secs(60));

        let breaker = config.breaker.breaker_config();
        assert_eq!(breaker.defaults.failure_threshold, 2);
        let gpt = breaker.endpoints.get("GPT-4o").unwrap();
        assert_eq!(gpt.failure_threshold, 7);
        assert_eq!(gpt.timeout, Duration::from_secs(30));

        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.classifier.classifier().severity_for_kind("upstream"), ErrorSeverity::Recoverable);

        let client = config.client.http_config();
        assert_eq!(client.api_key.unwrap().expose_secret(), "sk-test");
        assert_eq!(client.headers.get("X-Title").map(String::as_str), Some("llmr"));
        assert_eq!(config.server.port, 9999);
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = AppConfig::default();
        let source = config::Config::builder()
            .set_override("breaker.failure_threshold", 9)
            .unwrap()
            .set_override("client.api_key", "sk-env")
            .unwrap()
            .set_override("store.kind", "memory")
            .unwrap()
            .build()
            .unwrap();

        config.apply_overrides(&source).unwrap();

        assert_eq!(config.breaker.failure_threshold, 9);
        assert_eq!(config.client.api_key.unwrap().expose_secret(), "sk-env");
        assert_eq!(config.store.kind, StoreKind::Memory);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.retry.exponential_base = 1.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.client.base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let file = write_config("[retry\nmax_attempts = ");
        assert!(matches!(AppConfig::from_file(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_store_path_expansion() {
        let config = StoreConfig {
            kind: StoreKind::Sqlite,
            path: Some("/tmp/state.sqlite".to_string()),
        };
        assert_eq!(config.resolved_path(), PathBuf::from("/tmp/state.sqlite"));
        assert!(StoreConfig::default().resolved_path().ends_with(".llm-resilience/state.sqlite"));
    }
}
