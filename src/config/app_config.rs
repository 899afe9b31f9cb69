use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::errors::ConfigError;

// Configuration location constants
pub const USER_CONFIG_PATH: &str = "~/.config/tenantry";
pub const CONFIG_FILE_NAME: &str = "config.toml";

// Environment overrides
pub const ENV_TICK_INTERVAL_MS: &str = "TENANTRY_TICK_INTERVAL_MS";
pub const ENV_LOG_LEVEL: &str = "TENANTRY_LOG_LEVEL";
pub const ENV_DEFAULT_TENANT: &str = "TENANTRY_DEFAULT_TENANT";

/// Main Application Configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub tenancy: TenancyConfig,
    pub logging: LogSettings,
}

/// Background task scheduler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Period of the drain timer
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Tenant routing configuration
#[derive(Debug, Clone, PartialEq)]
pub struct TenancyConfig {
    /// Name used for requests that do not belong to a configured tenant
    pub default_tenant: String,
    /// Tenants whose pipelines are built at startup
    pub preload: Vec<String>,
    /// Bound of the out-of-band rebuild queue
    pub rebuild_queue_capacity: usize,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            default_tenant: default_tenant_name(),
            preload: Vec::new(),
            rebuild_queue_capacity: default_rebuild_queue_capacity(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
    pub format: String,
    pub show_target: bool,
    pub show_thread_ids: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            show_target: true,
            show_thread_ids: false,
        }
    }
}

/// Partial Application Configuration for loading from files
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialAppConfig {
    scheduler: Option<PartialSchedulerConfig>,
    tenancy: Option<PartialTenancyConfig>,
    logging: Option<PartialLogSettings>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialSchedulerConfig {
    tick_interval_ms: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialTenancyConfig {
    default_tenant: Option<String>,
    preload: Option<Vec<String>>,
    rebuild_queue_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialLogSettings {
    level: Option<String>,
    format: Option<String>,
    show_target: Option<bool>,
    show_thread_ids: Option<bool>,
}

impl AppConfig {
    /// Load configuration from the default location and environment
    pub fn load() -> Result<Self, ConfigError> {
        super::loader::ConfigLoader::new().load_config()
    }

    /// Create AppConfig from partial config and environment
    pub fn from_partial_and_env(
        partial: Option<PartialAppConfig>,
        env_map: HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let partial = partial.unwrap_or_default();

        let scheduler = partial.scheduler.unwrap_or_default();
        let tenancy = partial.tenancy.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        let tick_interval_ms = match env_map.get(ENV_TICK_INTERVAL_MS) {
            Some(raw) => raw.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                field: ENV_TICK_INTERVAL_MS.to_string(),
                reason: e.to_string(),
            })?,
            None => scheduler
                .tick_interval_ms
                .unwrap_or_else(default_tick_interval_ms),
        };

        let config = Self {
            scheduler: SchedulerConfig { tick_interval_ms },
            tenancy: TenancyConfig {
                default_tenant: env_map
                    .get(ENV_DEFAULT_TENANT)
                    .cloned()
                    .or(tenancy.default_tenant)
                    .unwrap_or_else(default_tenant_name),
                preload: tenancy.preload.unwrap_or_default(),
                rebuild_queue_capacity: tenancy
                    .rebuild_queue_capacity
                    .unwrap_or_else(default_rebuild_queue_capacity),
            },
            logging: LogSettings {
                level: env_map
                    .get(ENV_LOG_LEVEL)
                    .cloned()
                    .or(logging.level)
                    .unwrap_or_else(default_log_level),
                format: logging.format.unwrap_or_else(default_log_format),
                show_target: logging.show_target.unwrap_or(true),
                show_thread_ids: logging.show_thread_ids.unwrap_or(false),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "scheduler.tick_interval_ms".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.tenancy.rebuild_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "tenancy.rebuild_queue_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.tenancy.default_tenant.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "tenancy.default_tenant".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if let Some(empty) = self.tenancy.preload.iter().find(|t| t.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "tenancy.preload".to_string(),
                reason: format!("invalid tenant name {empty:?}"),
            });
        }
        Ok(())
    }
}

// Default functions
fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_tenant_name() -> String {
    "Default".to_string()
}

fn default_rebuild_queue_capacity() -> usize {
    64
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> PartialAppConfig {
        toml::from_str(raw).expect("valid toml")
    }

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::from_partial_and_env(None, HashMap::new()).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.scheduler.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.tenancy.default_tenant, "Default");
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let partial = parse(
            r#"
            [scheduler]
            tick_interval_ms = 250

            [tenancy]
            preload = ["alpha", "beta"]
            "#,
        );
        let config = AppConfig::from_partial_and_env(Some(partial), HashMap::new()).unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 250);
        assert_eq!(config.tenancy.preload, vec!["alpha", "beta"]);
        assert_eq!(config.tenancy.rebuild_queue_capacity, 64);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides_file() {
        let partial = parse("[scheduler]\ntick_interval_ms = 250\n");
        let env = HashMap::from([
            (ENV_TICK_INTERVAL_MS.to_string(), "40".to_string()),
            (ENV_LOG_LEVEL.to_string(), "debug".to_string()),
        ]);
        let config = AppConfig::from_partial_and_env(Some(partial), env).unwrap();
        assert_eq!(config.scheduler.tick_interval_ms, 40);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_invalid_env_value() {
        let env = HashMap::from([(ENV_TICK_INTERVAL_MS.to_string(), "soon".to_string())]);
        assert!(matches!(
            AppConfig::from_partial_and_env(None, env),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_tick_rejected() {
        let partial = parse("[scheduler]\ntick_interval_ms = 0\n");
        let err = AppConfig::from_partial_and_env(Some(partial), HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("scheduler.tick_interval_ms"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<PartialAppConfig, _> = toml::from_str("[scheduler]\nticks = 3\n");
        assert!(result.is_err());
    }
}
