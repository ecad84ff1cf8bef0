//! Configuration management.
//!
//! Settings come from a TOML file (see [`find_config_file`]) layered with
//! environment variables prefixed `MATERIALS_MASTER`, using `__` between
//! nested keys:
//!
//! ```text
//! MATERIALS_MASTER__CACHE__TTL_SECONDS=3600
//! MATERIALS_MASTER__SEARCH__DEFAULT_TIMEOUT_SECONDS=10
//! ```

mod file_config;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::QueryFields;
use crate::translate::{FILTER_FIELDS, NATIVE_FIELDS};
use crate::utils::{HealthPolicy, DEFAULT_COOLDOWN, DEFAULT_FAILURE_THRESHOLD, DEFAULT_TTL};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MATERIALS_MASTER";

/// Configuration file name looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "materials-master.toml";

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            search: SearchConfig::default(),
            providers: default_providers(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Result cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Defaults to `<cache dir>/materials-master/searches`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,

    /// Write each entry to `directory`
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            ttl_seconds: default_ttl_seconds(),
            persist: true,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn resolved_directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| default_data_dir().join("searches"))
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Defaults to `<cache dir>/materials-master/health.json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
            path: None,
            persist: true,
        }
    }
}

impl HealthConfig {
    pub fn policy(&self) -> HealthPolicy {
        HealthPolicy {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_seconds),
        }
    }

    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("health.json"))
    }
}

/// Orchestrator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Per-provider timeout when neither the provider nor
    /// `provider_timeouts` sets one
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,

    /// Attach cache statistics to every result
    #[serde(default)]
    pub include_cache_stats: bool,

    /// Provider id → timeout in seconds
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_timeouts: BTreeMap<String, u64>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: default_timeout_seconds(),
            include_cache_stats: false,
            provider_timeouts: BTreeMap::new(),
        }
    }
}

/// Backend family of a configured provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Any OPTIMADE-compliant structures endpoint
    #[default]
    Optimade,
    /// The Materials Project summary API
    MaterialsProject,
}

impl ProviderKind {
    /// Fields this kind's wire dialect can express
    pub fn translatable_fields(&self) -> QueryFields {
        match self {
            ProviderKind::Optimade => FILTER_FIELDS,
            ProviderKind::MaterialsProject => NATIVE_FIELDS,
        }
    }
}

/// One `[[providers]]` entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub kind: ProviderKind,

    #[serde(default)]
    pub base_url: String,

    /// Name of the environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Override of the filterable query fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filterable: Option<Vec<String>>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: None,
            kind: ProviderKind::default(),
            base_url: String::new(),
            api_key_env: None,
            timeout_seconds: None,
            max_results: None,
            enabled: true,
            filterable: None,
        }
    }
}

impl ProviderConfig {
    fn new(id: &str, name: &str, kind: ProviderKind, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: Some(name.to_string()),
            kind,
            base_url: base_url.to_string(),
            ..Self::default()
        }
    }

    /// Parsed `filterable` override.
    ///
    /// Fails on unknown names and on fields the provider kind cannot
    /// translate, which would otherwise be dropped from the wire query.
    pub fn filterable_fields(&self) -> Result<Option<QueryFields>, ConfigError> {
        let Some(names) = &self.filterable else {
            return Ok(None);
        };
        let fields = QueryFields::from_field_names(names)
            .map_err(|e| ConfigError::Invalid(format!("provider '{}': {}", self.id, e)))?;

        let untranslatable = fields.difference(self.kind.translatable_fields());
        if !untranslatable.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "provider '{}': {:?} provider cannot filter on {}",
                self.id,
                self.kind,
                untranslatable.field_names().join(", ")
            )));
        }
        Ok(Some(fields))
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_ttl_seconds() -> u64 {
    DEFAULT_TTL.as_secs()
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_cooldown_seconds() -> u64 {
    DEFAULT_COOLDOWN.as_secs()
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Providers used when the configuration names none
pub fn default_providers() -> Vec<ProviderConfig> {
    vec![
        ProviderConfig {
            api_key_env: Some("MP_API_KEY".to_string()),
            ..ProviderConfig::new(
                "mp",
                "Materials Project",
                ProviderKind::MaterialsProject,
                "https://api.materialsproject.org",
            )
        },
        ProviderConfig::new(
            "oqmd",
            "OQMD",
            ProviderKind::Optimade,
            "https://oqmd.org/optimade",
        ),
        ProviderConfig::new(
            "alexandria",
            "Alexandria",
            ProviderKind::Optimade,
            "https://alexandria.icams.rub.de/pbe",
        ),
        ProviderConfig::new(
            "cod",
            "Crystallography Open Database",
            ProviderKind::Optimade,
            "https://www.crystallography.net/cod/optimade",
        ),
    ]
}

/// `<platform cache dir>/materials-master`
pub fn default_data_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("materials-master")
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

impl Config {
    /// Check cross-field constraints the types cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "health.failure_threshold must be at least 1".into(),
            ));
        }
        if self.search.default_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "search.default_timeout_seconds must be at least 1".into(),
            ));
        }

        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(ConfigError::Invalid("provider with an empty id".into()));
            }
            if !seen.insert(provider.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            if provider.enabled {
                url::Url::parse(&provider.base_url).map_err(|e| {
                    ConfigError::Invalid(format!(
                        "provider '{}': base_url '{}': {}",
                        provider.id, provider.base_url, e
                    ))
                })?;
            }
            provider.filterable_fields()?;
        }
        Ok(())
    }
}

/// Load configuration from an optional file, layered with environment
/// variables
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
    }

    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let config: Config = settings.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// First existing configuration file: `./materials-master.toml`, then
/// `<config dir>/materials-master/config.toml`
pub fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.is_file() {
        return Some(local);
    }

    dirs::config_dir()
        .map(|dir| dir.join("materials-master").join("config.toml"))
        .filter(|path| path.is_file())
}

/// Path `config init` writes to by default
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("materials-master")
        .join("config.toml")
}
