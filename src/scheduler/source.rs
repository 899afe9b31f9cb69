use async_trait::async_trait;

use crate::errors::TenancyError;
use crate::infrastructure::container::ServiceProvider;
use crate::tenancy::{TenantContainers, TenantId};

/// 为任务选择执行容器
#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// `None` 表示使用根容器
    async fn container_for(&self, tenant: Option<&TenantId>) -> Result<ServiceProvider, TenancyError>;
}

/// 租户任务使用克隆出的租户容器，其余任务使用根容器
#[async_trait]
impl ContainerSource for TenantContainers {
    async fn container_for(&self, tenant: Option<&TenantId>) -> Result<ServiceProvider, TenancyError> {
        match tenant {
            Some(tenant) => self.get_or_create(tenant).await,
            None => Ok(self.root().clone()),
        }
    }
}

/// 只有根容器的部署，所有任务都在根容器中执行
#[async_trait]
impl ContainerSource for ServiceProvider {
    async fn container_for(&self, _tenant: Option<&TenantId>) -> Result<ServiceProvider, TenancyError> {
        Ok(self.clone())
    }
}
