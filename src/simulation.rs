//! 进程内多租户模拟
//!
//! 根容器注册共享时钟与审计日志（单例）和请求标识（瞬态）；
//! 租户配置器为每个租户追加租户信息与私有的访问计数。
//! 每个租户的管道从租户容器构建，后台任务在对应租户的容器中执行。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::infrastructure::container::{ServiceCollection, ServiceProvider};
use crate::scheduler::{BackgroundScheduler, DrainOutcome, MethodRegistry};
use crate::tenancy::{
    PipelineBuilder, RequestContext, RequestPipeline, Route, TenantContainerFactory,
    TenantContainers, TenantHost, TenantId,
};

/// 进程级时钟（单例）
#[derive(Debug)]
pub struct Clock {
    started_at: DateTime<Utc>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// 每次解析生成新的请求标识（瞬态）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn generate() -> Self {
        RequestId(Uuid::new_v4())
    }
}

/// 跨租户共享的审计日志（单例）
#[derive(Debug, Default)]
pub struct AuditLog {
    entries: Mutex<Vec<String>>,
}

impl AuditLog {
    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }
}

/// 租户私有的访问计数
#[derive(Debug, Default)]
pub struct Visits {
    count: AtomicU64,
    flushed: AtomicU64,
}

impl Visits {
    pub fn hit(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn flushed(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    fn flush(&self) -> u64 {
        let count = self.count();
        self.flushed.store(count, Ordering::Relaxed);
        count
    }
}

/// 由租户配置器注入的租户信息
#[derive(Debug, Clone)]
pub struct TenantInfo {
    pub tenant: TenantId,
}

/// 根容器的注册集合
pub fn root_services() -> ServiceCollection {
    let mut services = ServiceCollection::new();
    services
        .add_singleton(|_| Ok(Clock::new()))
        .add_singleton(|_| Ok(AuditLog::default()))
        .add_transient(|_| Ok(RequestId::generate()));
    services
}

/// 根容器与租户容器注册表
pub fn tenant_containers(root: ServiceProvider) -> TenantContainers {
    let factory = TenantContainerFactory::new(root).with_configurator(|tenant, services| {
        let info = TenantInfo {
            tenant: tenant.clone(),
        };
        services
            .add_instance(Arc::new(info))
            .add_singleton(|_| Ok(Visits::default()));
    });
    TenantContainers::new(factory)
}

struct TenantGreeting {
    container: ServiceProvider,
}

#[async_trait]
impl RequestPipeline for TenantGreeting {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        let info = self.container.resolve::<TenantInfo>()?;
        let request_id = self.container.resolve::<RequestId>()?;
        let visits = self.container.resolve::<Visits>()?.hit();
        let clock = self.container.resolve::<Clock>()?;
        self.container
            .resolve::<AuditLog>()?
            .record(format!("{} {} {}", info.tenant, ctx.path(), request_id.0));
        ctx.insert_item("request_id", request_id.0.to_string());
        ctx.set_response(format!(
            "hello {} (visit {visits}, up since {})",
            info.tenant,
            clock.started_at().to_rfc3339()
        ));
        Ok(())
    }
}

struct DefaultGreeting {
    root: ServiceProvider,
}

#[async_trait]
impl RequestPipeline for DefaultGreeting {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        let request_id = self.root.resolve::<RequestId>()?;
        self.root
            .resolve::<AuditLog>()?
            .record(format!("default {} {} {}", ctx.tenant(), ctx.path(), request_id.0));
        ctx.set_response(format!("hello from the default pipeline ({})", ctx.tenant()));
        Ok(())
    }
}

/// 租户管道构建器
pub fn greeting_builder() -> Arc<dyn PipelineBuilder> {
    Arc::new(
        |_: &TenantId, container: &ServiceProvider| -> anyhow::Result<Arc<dyn RequestPipeline>> {
            Ok(Arc::new(TenantGreeting {
                container: container.clone(),
            }))
        },
    )
}

/// 模拟参数
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub tenants: Vec<TenantId>,
    pub rounds: usize,
    pub tasks_per_round: usize,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TenantSummary {
    pub tenant_pipeline: usize,
    pub default_pipeline: usize,
    pub visits: u64,
    pub flushed_visits: u64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SimulationSummary {
    pub tenants: BTreeMap<String, TenantSummary>,
    pub tasks_enqueued: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub drains: u64,
    pub dropped_ticks: u64,
    pub audit_entries: usize,
    pub shared_clock: bool,
}

/// 运行模拟：多轮请求 + 后台任务，最后排空队列
pub async fn run(config: &AppConfig, options: &SimulationOptions) -> anyhow::Result<SimulationSummary> {
    let root = root_services().build("root");
    let containers = Arc::new(tenant_containers(root.clone()));
    let host = TenantHost::new(
        containers.clone(),
        greeting_builder(),
        Arc::new(DefaultGreeting { root: root.clone() }),
        &config.tenancy,
    )?;

    let preload = config
        .tenancy
        .preload
        .iter()
        .map(|name| TenantId::new(name.as_str()))
        .collect::<Result<Vec<_>, _>>()?;
    host.warm_up(&preload).await;

    let registry = MethodRegistry::new();
    let audit = registry.register_sync("audit.record", |log: &AuditLog, entry: String| {
        log.record(entry);
        Ok(())
    })?;
    let flush = registry.register_async("visits.flush", |visits: Arc<Visits>, _: ()| async move {
        tokio::task::yield_now().await;
        debug!(flushed = visits.flush(), "Visits flushed");
        Ok(())
    })?;

    let scheduler = BackgroundScheduler::new(containers.clone(), &config.scheduler);
    scheduler.activate();

    let mut summary = SimulationSummary::default();
    for round in 0..options.rounds {
        for tenant in &options.tenants {
            let mut ctx = RequestContext::new(tenant.clone(), format!("/round/{round}"));
            let route = host.dispatch(&mut ctx).await?;
            let entry = summary.tenants.entry(tenant.to_string()).or_default();
            match route {
                Route::Tenant(_) => entry.tenant_pipeline += 1,
                Route::Default => entry.default_pipeline += 1,
            }
            debug!(tenant = %tenant, response = ctx.response().unwrap_or_default(), "Request served");

            for task in 0..options.tasks_per_round {
                scheduler.enqueue(
                    audit
                        .bind(format!("{tenant} task {round}.{task}"))
                        .for_tenant(tenant.clone()),
                );
            }
            scheduler.enqueue(flush.bind(()).for_tenant(tenant.clone()));
        }
        // 给后台重建与定时排空留出时间
        tokio::time::sleep(scheduler.tick_interval()).await;
    }

    scheduler.deactivate();
    loop {
        match scheduler.drain().await {
            DrainOutcome::Idle if scheduler.pending() == 0 => break,
            DrainOutcome::Busy => tokio::time::sleep(Duration::from_millis(5)).await,
            _ => {}
        }
    }

    for tenant in &options.tenants {
        if let Some(container) = containers.get(tenant) {
            let visits = container.resolve::<Visits>()?;
            let entry = summary.tenants.entry(tenant.to_string()).or_default();
            entry.visits = visits.count();
            entry.flushed_visits = visits.flushed();
        }
    }

    let stats = scheduler.stats();
    summary.tasks_enqueued = stats.enqueued;
    summary.tasks_succeeded = stats.succeeded;
    summary.tasks_failed = stats.failed;
    summary.drains = stats.drains;
    summary.dropped_ticks = stats.dropped_ticks;
    summary.audit_entries = root.resolve::<AuditLog>()?.len();

    let root_clock = root.resolve::<Clock>()?;
    summary.shared_clock = containers
        .tenants()
        .iter()
        .filter_map(|tenant| containers.get(tenant))
        .all(|container| {
            container
                .resolve::<Clock>()
                .map(|clock| Arc::ptr_eq(&clock, &root_clock))
                .unwrap_or(false)
        });

    info!(
        tenants = options.tenants.len(),
        rounds = options.rounds,
        tasks = summary.tasks_enqueued,
        "Simulation finished"
    );
    Ok(summary)
}
