//! Application configuration.
//!
//! Values are layered: built-in defaults, then the TOML config file, then
//! environment variables prefixed with `HEARTH__` (nested keys separated by `__`,
//! e.g. `HEARTH__QUOTA__DAILY_LIMIT=50`).

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::auth::AuthConfig;

pub const APP_NAME: &str = "hearth";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Model identifier used when a chat references a model that no longer exists.
    pub default_model: String,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub quota: QuotaConfig,
    pub generation: GenerationConfig,
    /// Upstream endpoints keyed by the name models refer to.
    pub providers: BTreeMap<String, ProviderConfig>,
    pub models: Vec<ModelConfig>,
}

impl AppConfig {
    /// Reject quota and generation settings that would break admission.
    ///
    /// A reservation must outlive the longest generation it covers, otherwise
    /// a running generation stops counting against the limit.
    pub fn validate(&self) -> Result<()> {
        let quota = &self.quota;
        if quota.daily_limit < 1 {
            bail!("quota.daily_limit must be at least 1 (got {})", quota.daily_limit);
        }
        if quota.window_hours < 1 {
            bail!("quota.window_hours must be at least 1 (got {})", quota.window_hours);
        }
        if quota.reservation_ttl_minutes < 1 {
            bail!(
                "quota.reservation_ttl_minutes must be at least 1 (got {})",
                quota.reservation_ttl_minutes
            );
        }

        let max_duration = self.generation.max_duration_secs;
        if max_duration == 0 {
            bail!("generation.max_duration_secs must be at least 1");
        }
        if self.generation.keep_alive_secs == 0 {
            bail!("generation.keep_alive_secs must be at least 1");
        }
        let ttl_secs = quota.reservation_ttl_minutes.saturating_mul(60);
        if !i64::try_from(max_duration).is_ok_and(|secs| ttl_secs > secs) {
            bail!(
                "quota.reservation_ttl_minutes ({} min) must be longer than generation.max_duration_secs ({max_duration} s)",
                quota.reservation_ttl_minutes
            );
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert("google".to_string(), ProviderConfig::default());

        Self {
            default_model: "google/gemini-2.5-flash".to_string(),
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            quota: QuotaConfig::default(),
            generation: GenerationConfig::default(),
            providers,
            models: default_models(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when neither RUST_LOG nor CLI flags say otherwise.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Maximum request body size in megabytes.
    pub max_body_mb: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_body_mb: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    /// How long a writer waits for the database lock before failing.
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_data_dir()
                .map(|dir| dir.join("hearth.db"))
                .unwrap_or_else(|_| PathBuf::from("hearth.db")),
            max_connections: 5,
            busy_timeout_secs: 30,
        }
    }
}

/// Rolling-window limit on assistant generations per user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_limit: i64,
    pub window_hours: i64,
    pub reservation_ttl_minutes: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 200,
            window_hours: 24,
            reservation_ttl_minutes: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on the wall-clock duration of one generation.
    pub max_duration_secs: u64,
    /// Idle interval between SSE keep-alive comments.
    pub keep_alive_secs: u64,
    /// System prompt sent with every conversation. `{model_name}` is substituted.
    pub system_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_duration_secs: 300,
            keep_alive_secs: 15,
            system_prompt:
                "You are {model_name}, an assistant ready to help with everyday questions and tasks."
                    .to_string(),
        }
    }
}

/// An OpenAI-compatible streaming endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    /// API key, or `env:VAR_NAME` to read it from the environment.
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            api_key: Some("env:GOOGLE_GENERATIVE_AI_API_KEY".to_string()),
            connect_timeout_secs: 30,
        }
    }
}

/// A selectable chat model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConfig {
    /// Identifier clients send as `selectedChatModel`.
    pub id: String,
    /// Display name, also used in the system prompt and error messages.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Key into `providers`.
    pub provider: String,
    /// Model name sent upstream.
    pub upstream_model: String,
    /// Model tried once when this one fails to start streaming.
    #[serde(default)]
    pub fallback: Option<String>,
}

fn default_models() -> Vec<ModelConfig> {
    vec![
        ModelConfig {
            id: "google/gemini-3-pro-preview".to_string(),
            name: "Gemini 3.0 Pro".to_string(),
            description: Some("Most capable for complex questions and planning".to_string()),
            provider: "google".to_string(),
            upstream_model: "gemini-3-pro-preview".to_string(),
            fallback: Some("google/gemini-3-flash-preview".to_string()),
        },
        ModelConfig {
            id: "google/gemini-3-flash-preview".to_string(),
            name: "Gemini 3.0 Flash".to_string(),
            description: Some("Fast, smart, and cost-effective".to_string()),
            provider: "google".to_string(),
            upstream_model: "gemini-3-flash-preview".to_string(),
            fallback: Some("google/gemini-2.5-flash".to_string()),
        },
        ModelConfig {
            id: "google/gemini-2.5-flash".to_string(),
            name: "Gemini 2.5 Flash".to_string(),
            description: Some("Proven and efficient for everyday chats".to_string()),
            provider: "google".to_string(),
            upstream_model: "gemini-2.5-flash".to_string(),
            fallback: None,
        },
    ]
}

/// Load configuration from `path` (if it exists) and the environment.
pub fn load(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(
            Environment::with_prefix(&env_prefix())
                .prefix_separator("__")
                .separator("__"),
        )
        .build()
        .with_context(|| format!("reading configuration from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    if let Some(text) = config.database.path.to_str() {
        config.database.path = expand_str_path(text)?;
    }

    config.validate()?;
    Ok(config)
}

/// Write the default configuration to `path`.
pub fn write_default(path: &Path, config: &AppConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }

    let toml = toml::to_string_pretty(config).context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);

    std::fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

/// Resolve a configured secret, expanding `env:VAR_NAME` references.
///
/// Returns `Ok(None)` when no value is configured.
pub fn resolve_secret(value: Option<&str>) -> Result<Option<String>> {
    match value {
        None => Ok(None),
        Some(value) => match value.strip_prefix("env:") {
            Some(var_name) => match env::var(var_name) {
                Ok(secret) if !secret.is_empty() => Ok(Some(secret)),
                Ok(_) => Err(anyhow!("environment variable {var_name} is empty")),
                Err(_) => Err(anyhow!("environment variable {var_name} is not set")),
            },
            None => Ok(Some(value.to_string())),
        },
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(dir) = dirs::data_dir() {
        return Ok(dir.join(APP_NAME));
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_quota_policy() {
        let config = AppConfig::default();
        assert_eq!(config.quota.daily_limit, 200);
        assert_eq!(config.quota.window_hours, 24);
        assert_eq!(config.quota.reservation_ttl_minutes, 10);
        assert_eq!(config.generation.max_duration_secs, 300);
        assert!(config.models.iter().any(|m| m.id == config.default_model));
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unsafe_quota() {
        let mut config = AppConfig::default();
        config.quota.reservation_ttl_minutes = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.quota.reservation_ttl_minutes = 5;
        config.generation.max_duration_secs = 300;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("reservation_ttl_minutes"), "{err}");

        let mut config = AppConfig::default();
        config.quota.daily_limit = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.quota.window_hours = -1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.generation.max_duration_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.generation.keep_alive_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_rejects_zero_reservation_ttl() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[quota]\nreservation_ttl_minutes = 0\n").unwrap();

        let err = load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("reservation_ttl_minutes"));
    }

    #[test]
    fn test_load_overrides_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
default_model = "local/small"

[quota]
daily_limit = 3

[database]
path = "/tmp/hearth-test.db"

[providers.local]
base_url = "http://localhost:11434/v1"

[[models]]
id = "local/small"
name = "Small"
provider = "local"
upstream_model = "small"
"#,
        )
        .unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.quota.daily_limit, 3);
        assert_eq!(config.quota.window_hours, 24);
        assert_eq!(config.default_model, "local/small");
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].fallback, None);
        assert_eq!(config.database.path, PathBuf::from("/tmp/hearth-test.db"));
        assert_eq!(
            config.providers["local"].base_url,
            "http://localhost:11434/v1"
        );
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load(&temp.path().join("absent.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.models.len(), 3);
    }

    #[test]
    fn test_write_default_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cfg").join("config.toml");
        write_default(&path, &AppConfig::default()).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("# Configuration for hearth"));

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.models, AppConfig::default().models);
    }

    #[test]
    fn test_resolve_secret_literal_and_missing() {
        assert_eq!(resolve_secret(None).unwrap(), None);
        assert_eq!(
            resolve_secret(Some("plain-value")).unwrap(),
            Some("plain-value".to_string())
        );
        assert!(resolve_secret(Some("env:HEARTH_TEST_SURELY_UNSET_VAR")).is_err());
    }
}
