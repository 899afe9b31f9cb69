//! 租户容器注册表
//!
//! 租户容器在首次使用时从根容器克隆，克隆成功后才对外可见；
//! 重建时先驱逐旧容器再克隆新容器。

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::errors::TenancyError;
use crate::infrastructure::container::{ServiceCollection, ServiceProvider};
use crate::logging::OperationTimer;

use super::cloner::ContainerCloner;
use super::TenantId;

/// 克隆完成后、构建之前对租户注册集合的补充配置
pub type Configurator = Arc<dyn Fn(&TenantId, &mut ServiceCollection) + Send + Sync>;

/// 租户容器工厂：克隆根注册集合，应用租户配置，构建租户容器
#[derive(Clone)]
pub struct TenantContainerFactory {
    root: ServiceProvider,
    cloner: ContainerCloner,
    configurators: Vec<Configurator>,
}

impl TenantContainerFactory {
    pub fn new(root: ServiceProvider) -> Self {
        Self {
            root,
            cloner: ContainerCloner::new(),
            configurators: Vec::new(),
        }
    }

    /// 添加租户配置器，按添加顺序执行
    pub fn with_configurator<F>(mut self, configurator: F) -> Self
    where
        F: Fn(&TenantId, &mut ServiceCollection) + Send + Sync + 'static,
    {
        self.configurators.push(Arc::new(configurator));
        self
    }

    pub fn root(&self) -> &ServiceProvider {
        &self.root
    }

    /// 同步构建租户容器。可能执行根单例的首次构造
    pub fn create(&self, tenant: &TenantId) -> Result<ServiceProvider, TenancyError> {
        let timer = OperationTimer::new("tenant_container_clone").with_metadata("tenant", tenant);
        let mut services = self.cloner.clone_provider(tenant, &self.root)?;
        for configure in &self.configurators {
            configure(tenant, &mut services);
        }
        let provider = services.build(format!("tenant:{tenant}"));
        let elapsed = timer.finish();
        info!(
            tenant = %tenant,
            services = provider.registrations().len(),
            duration_ms = elapsed.as_millis() as u64,
            "Tenant container created"
        );
        Ok(provider)
    }
}

impl std::fmt::Debug for TenantContainerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantContainerFactory")
            .field("root", &self.root)
            .field("configurators", &self.configurators.len())
            .finish()
    }
}

/// 已发布的租户容器
pub struct TenantContainers {
    factory: TenantContainerFactory,
    containers: DashMap<TenantId, ServiceProvider>,
}

impl TenantContainers {
    pub fn new(factory: TenantContainerFactory) -> Self {
        Self {
            factory,
            containers: DashMap::new(),
        }
    }

    pub fn factory(&self) -> &TenantContainerFactory {
        &self.factory
    }

    pub fn root(&self) -> &ServiceProvider {
        self.factory.root()
    }

    pub fn get(&self, tenant: &TenantId) -> Option<ServiceProvider> {
        self.containers.get(tenant).map(|entry| entry.value().clone())
    }

    /// 获取租户容器，不存在时在阻塞线程池中克隆。
    /// 并发未命中时可能重复克隆，先发布者胜出，其余结果被丢弃
    pub async fn get_or_create(&self, tenant: &TenantId) -> Result<ServiceProvider, TenancyError> {
        if let Some(provider) = self.get(tenant) {
            return Ok(provider);
        }

        let factory = self.factory.clone();
        let owned = tenant.clone();
        let created = tokio::task::spawn_blocking(move || factory.create(&owned))
            .await
            .map_err(|e| TenancyError::Interrupted {
                tenant: tenant.to_string(),
                reason: e.to_string(),
            })??;

        let published = self
            .containers
            .entry(tenant.clone())
            .or_insert(created)
            .value()
            .clone();
        Ok(published)
    }

    /// 驱逐租户容器，下次使用时重新克隆
    pub fn evict(&self, tenant: &TenantId) -> Option<ServiceProvider> {
        let removed = self.containers.remove(tenant).map(|(_, provider)| provider);
        if removed.is_some() {
            debug!(tenant = %tenant, "Tenant container evicted");
        }
        removed
    }

    /// 已发布容器的租户，按名称排序
    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.containers.iter().map(|e| e.key().clone()).collect();
        tenants.sort();
        tenants
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock;

    struct TenantName(String);

    fn containers() -> TenantContainers {
        let mut services = ServiceCollection::new();
        services.add_singleton(|_| Ok(Clock));
        let factory = TenantContainerFactory::new(services.build("root")).with_configurator(
            |tenant, services| {
                let name = tenant.to_string();
                services.add_singleton(move |_| Ok(TenantName(name.clone())));
            },
        );
        TenantContainers::new(factory)
    }

    #[tokio::test]
    async fn test_get_or_create_publishes_once() {
        let containers = containers();
        let alpha = TenantId::new("alpha").unwrap();

        assert!(containers.get(&alpha).is_none());
        let first = containers.get_or_create(&alpha).await.unwrap();
        let second = containers.get_or_create(&alpha).await.unwrap();

        assert!(first.is_same(&second));
        assert_eq!(first.name(), "tenant:alpha");
        assert_eq!(containers.len(), 1);
    }

    #[tokio::test]
    async fn test_configurator_applies_per_tenant() {
        let containers = containers();
        let alpha = TenantId::new("alpha").unwrap();
        let beta = TenantId::new("beta").unwrap();

        let a = containers.get_or_create(&alpha).await.unwrap();
        let b = containers.get_or_create(&beta).await.unwrap();

        assert_eq!(a.resolve::<TenantName>().unwrap().0, "alpha");
        assert_eq!(b.resolve::<TenantName>().unwrap().0, "beta");
        assert!(!containers.root().is_registered::<TenantName>());
        assert_eq!(containers.tenants(), vec![alpha, beta]);
    }

    #[tokio::test]
    async fn test_evict_replaces_container() {
        let containers = containers();
        let alpha = TenantId::new("alpha").unwrap();

        let before = containers.get_or_create(&alpha).await.unwrap();
        assert!(containers.evict(&alpha).is_some());
        assert!(containers.evict(&alpha).is_none());
        let after = containers.get_or_create(&alpha).await.unwrap();

        assert!(!before.is_same(&after));
        assert!(Arc::ptr_eq(
            &before.resolve::<Clock>().unwrap(),
            &after.resolve::<Clock>().unwrap()
        ));
    }

    #[tokio::test]
    async fn test_clone_failure_publishes_nothing() {
        let mut services = ServiceCollection::new();
        services.add_singleton::<Clock, _>(|_| anyhow::bail!("no clock"));
        let containers = TenantContainers::new(TenantContainerFactory::new(services.build("root")));
        let alpha = TenantId::new("alpha").unwrap();

        assert!(matches!(
            containers.get_or_create(&alpha).await,
            Err(TenancyError::CloneFailure { .. })
        ));
        assert!(containers.is_empty());
    }
}
