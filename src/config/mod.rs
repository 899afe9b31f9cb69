pub mod app_config;
pub mod loader;

// Re-export commonly used types
pub use app_config::{AppConfig, LogSettings, SchedulerConfig, TenancyConfig};
pub use loader::ConfigLoader;

// Re-export constants
pub use app_config::{
    CONFIG_FILE_NAME, ENV_DEFAULT_TENANT, ENV_LOG_LEVEL, ENV_TICK_INTERVAL_MS, USER_CONFIG_PATH,
};
