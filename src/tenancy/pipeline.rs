//! 租户管道缓存
//!
//! 租户标识到已构建管道的并发映射。添加时的重复检查与插入在同一个
//! 分片锁内完成，同一租户的并发添加只有一个成功。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::errors::TenancyError;
use crate::infrastructure::container::ServiceProvider;

use super::router::RequestContext;
use super::TenantId;

/// 可调用的请求管道。具体的处理阶段由外部提供
#[async_trait]
pub trait RequestPipeline: Send + Sync {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<()>;
}

/// 基于租户容器构建请求管道
pub trait PipelineBuilder: Send + Sync {
    fn build(
        &self,
        tenant: &TenantId,
        container: &ServiceProvider,
    ) -> anyhow::Result<Arc<dyn RequestPipeline>>;
}

impl<F> PipelineBuilder for F
where
    F: Fn(&TenantId, &ServiceProvider) -> anyhow::Result<Arc<dyn RequestPipeline>> + Send + Sync,
{
    fn build(
        &self,
        tenant: &TenantId,
        container: &ServiceProvider,
    ) -> anyhow::Result<Arc<dyn RequestPipeline>> {
        self(tenant, container)
    }
}

/// 缓存条目：管道及其依赖的租户容器
#[derive(Clone)]
pub struct TenantPipeline {
    tenant: TenantId,
    container: ServiceProvider,
    pipeline: Arc<dyn RequestPipeline>,
    built_at: DateTime<Utc>,
}

impl TenantPipeline {
    pub fn new(
        tenant: TenantId,
        container: ServiceProvider,
        pipeline: Arc<dyn RequestPipeline>,
    ) -> Self {
        Self {
            tenant,
            container,
            pipeline,
            built_at: Utc::now(),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn container(&self) -> &ServiceProvider {
        &self.container
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    pub async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        self.pipeline.handle(ctx).await
    }
}

impl std::fmt::Debug for TenantPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantPipeline")
            .field("tenant", &self.tenant)
            .field("container", &self.container.name())
            .field("built_at", &self.built_at)
            .finish()
    }
}

/// 租户管道缓存
#[derive(Default)]
pub struct PipelineCache {
    entries: DashMap<TenantId, Arc<TenantPipeline>>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_pipeline(&self, tenant: &TenantId) -> Option<Arc<TenantPipeline>> {
        self.entries.get(tenant).map(|entry| entry.value().clone())
    }

    /// 添加管道。已存在条目时返回 `DuplicateEntry`，原条目保留
    pub fn add_pipeline(&self, pipeline: TenantPipeline) -> Result<Arc<TenantPipeline>, TenancyError> {
        match self.entries.entry(pipeline.tenant().clone()) {
            Entry::Occupied(existing) => {
                warn!(
                    tenant = %existing.key(),
                    existing_built_at = %existing.get().built_at(),
                    "Duplicate pipeline rejected, keeping existing entry"
                );
                Err(TenancyError::DuplicateEntry {
                    tenant: existing.key().to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let pipeline = Arc::new(pipeline);
                debug!(tenant = %pipeline.tenant(), "Pipeline cached");
                slot.insert(pipeline.clone());
                Ok(pipeline)
            }
        }
    }

    pub fn contains_pipeline(&self, tenant: &TenantId) -> bool {
        self.entries.contains_key(tenant)
    }

    /// 移除管道，条目不存在时什么也不做
    pub fn remove_pipeline(&self, tenant: &TenantId) -> Option<Arc<TenantPipeline>> {
        self.entries.remove(tenant).map(|(_, pipeline)| pipeline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.entries.iter().map(|e| e.key().clone()).collect();
        tenants.sort();
        tenants
    }
}
