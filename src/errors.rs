use thiserror::Error;

/// 依赖注入容器错误
#[derive(Debug, Error)]
pub enum ContainerError {
    /// 服务未注册
    #[error("Service '{type_name}' is not registered")]
    ServiceNotRegistered { type_name: String },

    /// 循环依赖检测
    #[error("Circular dependency detected in chain: {}", .chain.join(" -> "))]
    CircularDependency { chain: Vec<String> },

    /// 服务创建失败
    #[error("Failed to create service '{service}': {source}")]
    CreationFailed {
        service: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// 类型转换失败
    #[error("Type cast failed: expected '{expected}' during {context}")]
    TypeMismatch {
        expected: &'static str,
        context: &'static str,
    },

    /// 开放泛型注册必须通过 resolve_generic 解析
    #[error("Open generic family '{family}' cannot be resolved without a closed type")]
    OpenGenericUnresolved { family: &'static str },

    /// 作用域已释放
    #[error("Scope '{scope_name}' ({scope_id}) has been disposed")]
    ScopeDisposed {
        scope_id: uuid::Uuid,
        scope_name: String,
    },
}

/// 租户容器派生与租户管道管理中的错误
#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("Invalid tenant identifier: {0:?}")]
    InvalidTenantId(String),

    /// 克隆时单例服务无法从根容器解析
    #[error("Failed to clone container for tenant '{tenant}': service '{service}' could not be resolved: {source}")]
    CloneFailure {
        tenant: String,
        service: String,
        #[source]
        source: ContainerError,
    },

    /// 租户已有管道，保留现有条目
    #[error("Pipeline for tenant '{tenant}' already exists")]
    DuplicateEntry { tenant: String },

    #[error("Failed to build pipeline for tenant '{tenant}': {source}")]
    PipelineBuild {
        tenant: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Container construction for tenant '{tenant}' was interrupted: {reason}")]
    Interrupted { tenant: String, reason: String },
}

/// 后台任务错误，只在排空循环内部记录，不会向外传播
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task method '{0}' is already registered")]
    MethodAlreadyRegistered(&'static str),

    #[error("Receiver '{receiver}' for task '{method}' could not be resolved in tenant '{tenant}': {source}")]
    ReceiverUnresolvable {
        method: &'static str,
        receiver: &'static str,
        tenant: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Task '{method}' failed in tenant '{tenant}': {source}")]
    TaskInvocationFailure {
        method: &'static str,
        tenant: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file '{0}': {1}")]
    FileRead(String, #[source] std::io::Error),
    #[error("Failed to parse TOML from file '{0}': {1}")]
    TomlParse(String, #[source] toml::de::Error),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),
    #[error("Tenancy error: {0}")]
    Tenancy(#[from] TenancyError),
    #[error("Task error: {0}")]
    Task(#[from] TaskError),
    #[error("Logging initialization failed: {0}")]
    Logging(String),
}

pub type AppResult<T> = Result<T, AppError>;

/// 表示根容器（非租户）任务的名称
pub(crate) const ROOT_TENANT_LABEL: &str = "<root>";

pub(crate) fn tenant_label(tenant: Option<&crate::tenancy::TenantId>) -> String {
    tenant
        .map(|t| t.to_string())
        .unwrap_or_else(|| ROOT_TENANT_LABEL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_dependency_display() {
        let err = ContainerError::CircularDependency {
            chain: vec!["A".to_string(), "B".to_string(), "A".to_string()],
        };
        assert_eq!(err.to_string(), "Circular dependency detected in chain: A -> B -> A");
    }

    #[test]
    fn test_clone_failure_keeps_source() {
        let err = TenancyError::CloneFailure {
            tenant: "alpha".to_string(),
            service: "Clock".to_string(),
            source: ContainerError::ServiceNotRegistered {
                type_name: "Clock".to_string(),
            },
        };
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("not registered"));
        assert!(err.to_string().contains("alpha"));
    }

    #[test]
    fn test_tenant_label() {
        assert_eq!(tenant_label(None), "<root>");
    }
}
