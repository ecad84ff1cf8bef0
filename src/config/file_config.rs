//! Configuration file support for materials-master.
//!
//! # Configuration File Format
//!
//! ```toml
//! [cache]
//! enabled = true
//! directory = "~/.cache/materials-master/searches"
//! ttl_seconds = 86400
//! persist = true
//!
//! [health]
//! failure_threshold = 3
//! cooldown_seconds = 60
//!
//! [search]
//! default_timeout_seconds = 30
//! include_cache_stats = false
//!
//! [search.provider_timeouts]
//! mp = 45
//!
//! [[providers]]
//! id = "mp"
//! name = "Materials Project"
//! kind = "materials_project"
//! base_url = "https://api.materialsproject.org"
//! api_key_env = "MP_API_KEY"
//!
//! [[providers]]
//! id = "oqmd"
//! kind = "optimade"
//! base_url = "https://oqmd.org/optimade"
//! filterable = ["elements", "elements_any", "exclude_elements", "formula", "nelements"]
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use std::path::Path;

use super::{Config, ConfigError};

impl Config {
    /// Load configuration from a TOML file, without environment overrides
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Save configuration to a TOML file, creating parent directories
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }
}
