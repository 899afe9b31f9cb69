//! 请求路由与租户重建
//!
//! 命中缓存时整个请求交给租户管道；未命中时本次请求走默认管道，
//! 同时在请求上下文中打上重启标记，由后台重建器在请求之外克隆并注册管道。

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::TenancyError;

use super::pipeline::{PipelineBuilder, PipelineCache, RequestPipeline, TenantPipeline};
use super::registry::TenantContainers;
use super::TenantId;

/// 单个请求的上下文
#[derive(Debug, Clone)]
pub struct RequestContext {
    tenant: TenantId,
    request_id: Uuid,
    path: String,
    items: HashMap<String, String>,
    response: Option<String>,
    restart: bool,
}

impl RequestContext {
    pub fn new(tenant: TenantId, path: impl Into<String>) -> Self {
        Self {
            tenant,
            request_id: Uuid::new_v4(),
            path: path.into(),
            items: HashMap::new(),
            response: None,
            restart: false,
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn insert_item(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.items.insert(key.into(), value.into());
    }

    pub fn item(&self, key: &str) -> Option<&str> {
        self.items.get(key).map(String::as_str)
    }

    pub fn set_response(&mut self, body: impl Into<String>) {
        self.response = Some(body.into());
    }

    pub fn response(&self) -> Option<&str> {
        self.response.as_deref()
    }

    /// 标记当前租户的管道需要在下一次请求前重建
    pub fn request_restart(&mut self) {
        self.restart = true;
    }

    pub fn restart_requested(&self) -> bool {
        self.restart
    }
}

/// 请求实际经过的管道
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Tenant(TenantId),
    Default,
}

/// 正在重建的租户。值为 true 表示重建期间收到了显式重启，需要再重建一轮
type InFlight = DashMap<TenantId, bool>;

/// 后台租户重建器的句柄
#[derive(Clone)]
pub struct TenantRebuilder {
    sender: mpsc::Sender<TenantId>,
    in_flight: Arc<InFlight>,
}

impl TenantRebuilder {
    /// 启动重建工作协程。必须在 tokio 运行时内调用
    pub fn spawn(
        containers: Arc<TenantContainers>,
        cache: Arc<PipelineCache>,
        builder: Arc<dyn PipelineBuilder>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<TenantId>(capacity.max(1));
        let in_flight: Arc<InFlight> = Arc::new(DashMap::new());
        let pending = in_flight.clone();

        let worker = tokio::spawn(async move {
            while let Some(tenant) = receiver.recv().await {
                let containers = containers.clone();
                let cache = cache.clone();
                let builder = builder.clone();
                let pending = pending.clone();
                // 每个租户独立重建，慢克隆不阻塞其他租户
                tokio::spawn(async move {
                    loop {
                        if let Err(e) =
                            rebuild_tenant(&containers, &cache, builder.as_ref(), &tenant).await
                        {
                            warn!(
                                tenant = %tenant,
                                error = %e,
                                "Tenant rebuild failed, next request will retry"
                            );
                        }
                        if !take_rerun(&pending, &tenant) {
                            break;
                        }
                        // 刚注册的管道可能来自重启前的容器
                        cache.remove_pipeline(&tenant);
                        debug!(tenant = %tenant, "Restart requested during rebuild, rebuilding again");
                    }
                });
            }
            debug!("Tenant rebuild worker stopped");
        });

        (Self { sender, in_flight }, worker)
    }

    /// 缓存未命中时安排一次重建。租户已在重建中或队列已满时返回 false
    pub fn schedule(&self, tenant: &TenantId) -> bool {
        match self.in_flight.entry(tenant.clone()) {
            Entry::Occupied(_) => {
                debug!(tenant = %tenant, "Rebuild already pending");
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
                self.send(tenant)
            }
        }
    }

    /// 显式重启：租户正在重建时，当前这轮结束后再重建一次，
    /// 保证最终的管道基于重启之后克隆的容器
    pub fn schedule_restart(&self, tenant: &TenantId) -> bool {
        match self.in_flight.entry(tenant.clone()) {
            Entry::Occupied(mut pending) => {
                *pending.get_mut() = true;
                debug!(tenant = %tenant, "Rebuild in flight, follow-up rebuild queued");
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(false);
                self.send(tenant)
            }
        }
    }

    fn send(&self, tenant: &TenantId) -> bool {
        match self.sender.try_send(tenant.clone()) {
            Ok(()) => {
                debug!(tenant = %tenant, "Rebuild scheduled");
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.in_flight.remove(tenant);
                warn!(tenant = %tenant, "Rebuild queue full, retrying on a later request");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.in_flight.remove(tenant);
                warn!(tenant = %tenant, "Rebuild worker stopped");
                false
            }
        }
    }

    pub fn is_pending(&self, tenant: &TenantId) -> bool {
        self.in_flight.contains_key(tenant)
    }
}

/// 一轮重建结束：有待处理的重启时清除标记并返回 true，否则移出重建集合
fn take_rerun(in_flight: &InFlight, tenant: &TenantId) -> bool {
    match in_flight.entry(tenant.clone()) {
        Entry::Occupied(mut pending) if *pending.get() => {
            *pending.get_mut() = false;
            true
        }
        Entry::Occupied(pending) => {
            pending.remove();
            false
        }
        Entry::Vacant(_) => false,
    }
}

/// 重新克隆租户容器并注册新管道。
/// 管道构建失败或克隆失败时缓存保持未命中状态
pub(crate) async fn rebuild_tenant(
    containers: &TenantContainers,
    cache: &PipelineCache,
    builder: &dyn PipelineBuilder,
    tenant: &TenantId,
) -> Result<(), TenancyError> {
    containers.evict(tenant);
    install_pipeline(containers, cache, builder, tenant).await
}

pub(crate) async fn install_pipeline(
    containers: &TenantContainers,
    cache: &PipelineCache,
    builder: &dyn PipelineBuilder,
    tenant: &TenantId,
) -> Result<(), TenancyError> {
    let container = containers.get_or_create(tenant).await?;
    let pipeline = builder
        .build(tenant, &container)
        .map_err(|e| TenancyError::PipelineBuild {
            tenant: tenant.to_string(),
            source: e.into(),
        })?;

    match cache.add_pipeline(TenantPipeline::new(tenant.clone(), container, pipeline)) {
        Ok(_) => {
            info!(tenant = %tenant, "Tenant pipeline ready");
            Ok(())
        }
        // 已有条目胜出，新管道直接丢弃
        Err(TenancyError::DuplicateEntry { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// 按租户分发请求
pub struct TenantRouter {
    cache: Arc<PipelineCache>,
    default_pipeline: Arc<dyn RequestPipeline>,
    default_tenant: TenantId,
    rebuilder: TenantRebuilder,
}

impl TenantRouter {
    pub fn new(
        cache: Arc<PipelineCache>,
        default_pipeline: Arc<dyn RequestPipeline>,
        default_tenant: TenantId,
        rebuilder: TenantRebuilder,
    ) -> Self {
        Self {
            cache,
            default_pipeline,
            default_tenant,
            rebuilder,
        }
    }

    pub fn default_tenant(&self) -> &TenantId {
        &self.default_tenant
    }

    /// 分发请求。管道的错误原样返回，重建安排不受其影响
    pub async fn dispatch(&self, ctx: &mut RequestContext) -> anyhow::Result<Route> {
        let tenant = ctx.tenant().clone();

        if tenant == self.default_tenant {
            self.default_pipeline.handle(ctx).await?;
            return Ok(Route::Default);
        }

        if let Some(pipeline) = self.cache.get_pipeline(&tenant) {
            let result = pipeline.handle(ctx).await;
            if ctx.restart_requested() {
                debug!(tenant = %tenant, request_id = %ctx.request_id(), "Pipeline requested restart");
                self.cache.remove_pipeline(&tenant);
                self.rebuilder.schedule_restart(&tenant);
            }
            result?;
            return Ok(Route::Tenant(tenant));
        }

        debug!(
            tenant = %tenant,
            request_id = %ctx.request_id(),
            path = ctx.path(),
            "Pipeline cache miss, serving with default pipeline"
        );
        ctx.request_restart();
        let result = self.default_pipeline.handle(ctx).await;
        self.rebuilder.schedule(&tenant);
        result?;
        Ok(Route::Default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_marker() {
        let mut ctx = RequestContext::new(TenantId::new("alpha").unwrap(), "/orders");
        assert!(!ctx.restart_requested());
        ctx.request_restart();
        assert!(ctx.restart_requested());
        assert_eq!(ctx.path(), "/orders");
    }

    #[test]
    fn test_items_and_response() {
        let mut ctx = RequestContext::new(TenantId::new("alpha").unwrap(), "/");
        ctx.insert_item("user", "42");
        ctx.set_response("ok");
        assert_eq!(ctx.item("user"), Some("42"));
        assert_eq!(ctx.item("missing"), None);
        assert_eq!(ctx.response(), Some("ok"));
    }

    #[tokio::test]
    async fn test_schedule_deduplicates_pending_tenant() {
        // 无接收端消费，请求停留在通道中
        let (sender, _receiver) = mpsc::channel(4);
        let rebuilder = TenantRebuilder {
            sender,
            in_flight: Arc::new(DashMap::new()),
        };
        let alpha = TenantId::new("alpha").unwrap();

        assert!(rebuilder.schedule(&alpha));
        assert!(!rebuilder.schedule(&alpha));
        assert!(rebuilder.is_pending(&alpha));
    }

    #[tokio::test]
    async fn test_schedule_reports_full_queue() {
        let (sender, _receiver) = mpsc::channel(1);
        let rebuilder = TenantRebuilder {
            sender,
            in_flight: Arc::new(DashMap::new()),
        };
        let alpha = TenantId::new("alpha").unwrap();
        let beta = TenantId::new("beta").unwrap();

        assert!(rebuilder.schedule(&alpha));
        assert!(!rebuilder.schedule(&beta));
        assert!(!rebuilder.is_pending(&beta));
    }

    #[tokio::test]
    async fn test_restart_during_rebuild_requests_another_round() {
        let (sender, _receiver) = mpsc::channel(4);
        let rebuilder = TenantRebuilder {
            sender,
            in_flight: Arc::new(DashMap::new()),
        };
        let alpha = TenantId::new("alpha").unwrap();

        assert!(rebuilder.schedule(&alpha));
        assert!(rebuilder.schedule_restart(&alpha));
        assert!(!rebuilder.schedule(&alpha));

        assert!(take_rerun(&rebuilder.in_flight, &alpha));
        assert!(rebuilder.is_pending(&alpha));
        assert!(!take_rerun(&rebuilder.in_flight, &alpha));
        assert!(!rebuilder.is_pending(&alpha));
    }
}
