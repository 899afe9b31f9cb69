//! 多租户运行时隔离
//!
//! 根容器派生租户容器，租户容器之上构建请求管道，
//! 管道缓存未命中时走默认管道并在请求之外重建。

pub mod cloner;
pub mod host;
pub mod pipeline;
pub mod registry;
pub mod router;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::TenancyError;

pub use cloner::ContainerCloner;
pub use host::TenantHost;
pub use pipeline::{PipelineBuilder, PipelineCache, RequestPipeline, TenantPipeline};
pub use registry::{Configurator, TenantContainerFactory, TenantContainers};
pub use router::{RequestContext, Route, TenantRebuilder, TenantRouter};

/// 不透明的租户标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// 校验并创建租户标识。首尾空白会被去除，空串和控制字符被拒绝
    pub fn new(value: impl Into<String>) -> Result<Self, TenancyError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_control) {
            return Err(TenancyError::InvalidTenantId(value));
        }
        Ok(TenantId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = TenancyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenantId::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = TenancyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TenantId::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
