use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use tracing::Level;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use crate::config::LogSettings;
use crate::errors::{AppError, ConfigError};

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Compact,
    /// 每行一个 JSON 对象，适合日志采集
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            "compact" => Ok(LogFormat::Compact),
            other => Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                reason: format!("unknown format '{other}', expected pretty|json|compact"),
            }),
        }
    }
}

/// 订阅者设置，由配置文件的 `[logging]` 段解析而来
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    pub show_target: bool,
    pub show_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            show_target: true,
            show_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    pub fn from_settings(settings: &LogSettings) -> Result<Self, ConfigError> {
        let level = Level::from_str(&settings.level).map_err(|_| ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            reason: format!("unknown level '{}'", settings.level),
        })?;
        Ok(Self {
            level,
            format: settings.format.parse()?,
            show_target: settings.show_target,
            show_thread_ids: settings.show_thread_ids,
        })
    }

    /// JSON 输出不带颜色转义
    pub fn ansi(&self) -> bool {
        self.format != LogFormat::Json
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_ascii_lowercase()))
    }

    fn fmt_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let layer = fmt::layer()
            .with_target(self.show_target)
            .with_thread_ids(self.show_thread_ids)
            .with_ansi(self.ansi());
        match self.format {
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

/// 安装全局订阅者。`RUST_LOG` 存在时覆盖配置的级别
pub fn init_logging(config: &LoggingConfig) -> Result<(), AppError> {
    tracing_subscriber::registry()
        .with(config.fmt_layer())
        .with(config.filter())
        .try_init()
        .map_err(|e| AppError::Logging(e.to_string()))?;

    tracing::debug!(
        level = %config.level,
        format = ?config.format,
        "Logging initialized"
    );
    Ok(())
}

/// 记录一次操作的耗时。
///
/// 调用 [`OperationTimer::finish`] 时输出完成日志；未完成即被丢弃
/// （例如中途 `?` 返回）时输出放弃日志。
pub struct OperationTimer {
    operation: &'static str,
    started: Instant,
    fields: Vec<(&'static str, String)>,
    done: bool,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            started: Instant::now(),
            fields: Vec::new(),
            done: false,
        }
    }

    pub fn with_metadata(mut self, key: &'static str, value: impl ToString) -> Self {
        self.fields.push((key, value.to_string()));
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(mut self) -> Duration {
        self.done = true;
        let elapsed = self.elapsed();
        self.emit("Operation completed", elapsed);
        elapsed
    }

    fn emit(&self, message: &'static str, elapsed: Duration) {
        let fields: BTreeMap<_, _> = self.fields.iter().cloned().collect();
        tracing::debug!(
            operation = self.operation,
            duration_ms = elapsed.as_millis() as u64,
            fields = ?fields,
            "{message}"
        );
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        if !self.done {
            self.emit("Operation abandoned", self.elapsed());
        }
    }
}
