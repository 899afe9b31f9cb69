use std::{collections::HashMap, env, fs, path::PathBuf};

use crate::errors::ConfigError;

use super::app_config::{AppConfig, PartialAppConfig, CONFIG_FILE_NAME, USER_CONFIG_PATH};

const ENV_PREFIX: &str = "TENANTRY_";

/// Configuration loader responsible for loading config from files and environment
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    use_env: bool,
}

impl ConfigLoader {
    /// Create a new config loader with default paths
    pub fn new() -> Self {
        Self {
            config_path: None,
            use_env: true,
        }
    }

    /// Create a config loader reading an explicit file
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            config_path: Some(path),
            use_env: true,
        }
    }

    /// Ignore process environment overrides (for testing)
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// Resolved path of the configuration file
    pub fn config_path(&self) -> PathBuf {
        match &self.config_path {
            Some(path) => path.clone(),
            None => {
                let expanded = shellexpand::tilde(USER_CONFIG_PATH);
                PathBuf::from(expanded.as_ref()).join(CONFIG_FILE_NAME)
            }
        }
    }

    /// Load complete application configuration. A missing file yields defaults.
    pub fn load_config(&self) -> Result<AppConfig, ConfigError> {
        let config_path = self.config_path();
        let partial = self.load_partial_config(&config_path)?;
        let env_map = if self.use_env {
            self.collect_env_vars()
        } else {
            HashMap::new()
        };
        AppConfig::from_partial_and_env(partial, env_map)
    }

    fn load_partial_config(&self, path: &PathBuf) -> Result<Option<PartialAppConfig>, ConfigError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.display().to_string(), e))?;
        let partial = toml::from_str::<PartialAppConfig>(&content)
            .map_err(|e| ConfigError::TomlParse(path.display().to_string(), e))?;
        tracing::debug!(path = %path.display(), "config file loaded");
        Ok(Some(partial))
    }

    fn collect_env_vars(&self) -> HashMap<String, String> {
        env::vars()
            .filter(|(key, _)| key.starts_with(ENV_PREFIX))
            .collect()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
