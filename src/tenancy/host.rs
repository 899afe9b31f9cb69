//! 租户宿主：组合容器注册表、管道缓存、路由器与重建器

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::TenancyConfig;
use crate::errors::TenancyError;

use super::pipeline::{PipelineBuilder, PipelineCache, RequestPipeline};
use super::registry::TenantContainers;
use super::router::{install_pipeline, RequestContext, Route, TenantRebuilder, TenantRouter};
use super::TenantId;

pub struct TenantHost {
    containers: Arc<TenantContainers>,
    cache: Arc<PipelineCache>,
    builder: Arc<dyn PipelineBuilder>,
    router: TenantRouter,
    rebuilder: TenantRebuilder,
    worker: JoinHandle<()>,
}

impl TenantHost {
    /// 创建宿主并启动后台重建器。必须在 tokio 运行时内调用
    pub fn new(
        containers: Arc<TenantContainers>,
        builder: Arc<dyn PipelineBuilder>,
        default_pipeline: Arc<dyn RequestPipeline>,
        config: &TenancyConfig,
    ) -> Result<Self, TenancyError> {
        let default_tenant = TenantId::new(config.default_tenant.as_str())?;
        let cache = Arc::new(PipelineCache::new());
        let (rebuilder, worker) = TenantRebuilder::spawn(
            containers.clone(),
            cache.clone(),
            builder.clone(),
            config.rebuild_queue_capacity,
        );
        let router = TenantRouter::new(
            cache.clone(),
            default_pipeline,
            default_tenant,
            rebuilder.clone(),
        );
        Ok(Self {
            containers,
            cache,
            builder,
            router,
            rebuilder,
            worker,
        })
    }

    pub fn containers(&self) -> &Arc<TenantContainers> {
        &self.containers
    }

    pub fn cache(&self) -> &Arc<PipelineCache> {
        &self.cache
    }

    pub fn router(&self) -> &TenantRouter {
        &self.router
    }

    pub async fn dispatch(&self, ctx: &mut RequestContext) -> anyhow::Result<Route> {
        self.router.dispatch(ctx).await
    }

    /// 显式重启租户：移除缓存条目并安排重建。
    /// 正在进行的重建结束后会再重建一轮，不会保留重启前的容器
    pub fn invalidate(&self, tenant: &TenantId) -> bool {
        let removed = self.cache.remove_pipeline(tenant).is_some();
        info!(tenant = %tenant, removed, "Tenant pipeline invalidated");
        self.rebuilder.schedule_restart(tenant)
    }

    /// 启动时预先构建管道。单个租户失败不影响其他租户，返回成功数量
    pub async fn warm_up(&self, tenants: &[TenantId]) -> usize {
        let mut ready = 0;
        for tenant in tenants {
            if self.cache.contains_pipeline(tenant) {
                ready += 1;
                continue;
            }
            match install_pipeline(&self.containers, &self.cache, self.builder.as_ref(), tenant)
                .await
            {
                Ok(()) => ready += 1,
                Err(e) => warn!(tenant = %tenant, error = %e, "Tenant warm-up failed"),
            }
        }
        info!(requested = tenants.len(), ready, "Tenant warm-up finished");
        ready
    }

    pub fn is_rebuild_pending(&self, tenant: &TenantId) -> bool {
        self.rebuilder.is_pending(tenant)
    }
}

impl Drop for TenantHost {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
