//! 租户管道缓存与路由的集成测试

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{wait_until, LogCapture};
use tenantry::config::TenancyConfig;
use tenantry::errors::TenancyError;
use tenantry::infrastructure::container::{ServiceCollection, ServiceProvider};
use tenantry::tenancy::{
    PipelineBuilder, PipelineCache, RequestContext, RequestPipeline, Route, TenantContainerFactory,
    TenantContainers, TenantHost, TenantId, TenantPipeline,
};

const WAIT: Duration = Duration::from_secs(2);

struct Clock;

struct Labelled {
    label: String,
}

#[async_trait]
impl RequestPipeline for Labelled {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        if ctx.path() == "/reload" {
            ctx.request_restart();
        }
        ctx.set_response(self.label.clone());
        Ok(())
    }
}

struct Fallback;

#[async_trait]
impl RequestPipeline for Fallback {
    async fn handle(&self, ctx: &mut RequestContext) -> anyhow::Result<()> {
        ctx.set_response("default");
        Ok(())
    }
}

fn tenant(name: &str) -> TenantId {
    TenantId::new(name).unwrap()
}

/// 记录构建次数的管道构建器
fn counting_builder(builds: Arc<AtomicUsize>) -> Arc<dyn PipelineBuilder> {
    Arc::new(
        move |tenant: &TenantId, container: &ServiceProvider| -> anyhow::Result<Arc<dyn RequestPipeline>> {
            container.resolve::<Clock>()?;
            let n = builds.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Arc::new(Labelled {
                label: format!("{tenant}#{n}"),
            }))
        },
    )
}

fn host_with(root: ServiceProvider, builds: Arc<AtomicUsize>) -> TenantHost {
    let containers = Arc::new(TenantContainers::new(TenantContainerFactory::new(root)));
    TenantHost::new(
        containers,
        counting_builder(builds),
        Arc::new(Fallback),
        &TenancyConfig::default(),
    )
    .unwrap()
}

fn healthy_root() -> ServiceProvider {
    let mut services = ServiceCollection::new();
    services.add_singleton(|_| Ok(Clock));
    services.build("root")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_add_has_single_winner() {
    for _ in 0..50 {
        let cache = Arc::new(PipelineCache::new());
        let barrier = Arc::new(tokio::sync::Barrier::new(2));
        let alpha = tenant("alpha");

        let attempts = (0..2).map(|i| {
            let cache = cache.clone();
            let barrier = barrier.clone();
            let alpha = alpha.clone();
            tokio::spawn(async move {
                let entry = TenantPipeline::new(
                    alpha,
                    ServiceCollection::new().build(format!("tenant:{i}")),
                    Arc::new(Labelled {
                        label: format!("p{i}"),
                    }),
                );
                barrier.wait().await;
                cache.add_pipeline(entry)
            })
        });
        let results: Vec<_> = futures_util::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(TenancyError::DuplicateEntry { .. })))
            .count();
        assert_eq!(winners.len(), 1);
        assert_eq!(duplicates, 1);

        let cached = cache.get_pipeline(&alpha).unwrap();
        assert!(Arc::ptr_eq(winners[0], &cached));
        assert!(Arc::ptr_eq(winners[0], &cache.get_pipeline(&alpha).unwrap()));
    }
}

#[tokio::test]
async fn test_duplicate_add_logged_once() {
    let logs = LogCapture::default();
    let _guard = logs.install();

    let cache = PipelineCache::new();
    let alpha = tenant("alpha");
    let entry = || {
        TenantPipeline::new(
            alpha.clone(),
            ServiceCollection::new().build("tenant:alpha"),
            Arc::new(Fallback),
        )
    };
    cache.add_pipeline(entry()).unwrap();
    assert!(cache.add_pipeline(entry()).is_err());

    assert_eq!(logs.count("Duplicate pipeline rejected"), 1);
}

#[tokio::test]
async fn test_miss_serves_default_then_rebuilds() {
    let builds = Arc::new(AtomicUsize::new(0));
    let host = host_with(healthy_root(), builds.clone());
    let alpha = tenant("alpha");

    let mut first = RequestContext::new(alpha.clone(), "/");
    assert_eq!(host.dispatch(&mut first).await.unwrap(), Route::Default);
    assert!(first.restart_requested());
    assert_eq!(first.response(), Some("default"));

    assert!(wait_until(WAIT, || host.cache().contains_pipeline(&alpha)).await);

    let mut second = RequestContext::new(alpha.clone(), "/");
    assert_eq!(
        host.dispatch(&mut second).await.unwrap(),
        Route::Tenant(alpha.clone())
    );
    assert!(!second.restart_requested());
    assert_eq!(second.response(), Some("alpha#1"));
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_concurrent_misses_schedule_one_rebuild() {
    let builds = Arc::new(AtomicUsize::new(0));
    let host = host_with(healthy_root(), builds.clone());
    let alpha = tenant("alpha");

    for _ in 0..5 {
        let mut ctx = RequestContext::new(alpha.clone(), "/");
        host.dispatch(&mut ctx).await.unwrap();
    }
    assert!(wait_until(WAIT, || host.cache().contains_pipeline(&alpha)).await);
    assert!(wait_until(WAIT, || !host.is_rebuild_pending(&alpha)).await);
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pipeline_restart_signal_rebuilds() {
    let builds = Arc::new(AtomicUsize::new(0));
    let host = host_with(healthy_root(), builds.clone());
    let alpha = tenant("alpha");
    assert_eq!(host.warm_up(&[alpha.clone()]).await, 1);

    let before = host.cache().get_pipeline(&alpha).unwrap();
    let mut reload = RequestContext::new(alpha.clone(), "/reload");
    assert_eq!(
        host.dispatch(&mut reload).await.unwrap(),
        Route::Tenant(alpha.clone())
    );
    assert_eq!(reload.response(), Some("alpha#1"));

    assert!(
        wait_until(WAIT, || {
            host.cache()
                .get_pipeline(&alpha)
                .is_some_and(|p| !Arc::ptr_eq(&p, &before))
        })
        .await
    );
    let after = host.cache().get_pipeline(&alpha).unwrap();
    assert!(!after.container().is_same(before.container()));

    let mut next = RequestContext::new(alpha.clone(), "/");
    host.dispatch(&mut next).await.unwrap();
    assert_eq!(next.response(), Some("alpha#2"));
}

#[tokio::test]
async fn test_invalidate_rebuilds_tenant() {
    let builds = Arc::new(AtomicUsize::new(0));
    let host = host_with(healthy_root(), builds.clone());
    let alpha = tenant("alpha");
    host.warm_up(&[alpha.clone()]).await;

    assert!(host.invalidate(&alpha));
    assert!(wait_until(WAIT, || builds.load(Ordering::SeqCst) == 2).await);
    assert!(wait_until(WAIT, || host.cache().contains_pipeline(&alpha)).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalidate_during_rebuild_rebuilds_again() {
    let entered = Arc::new(AtomicBool::new(false));
    let released = Arc::new(AtomicBool::new(false));
    let built_from = Arc::new(parking_lot::Mutex::new(Vec::<ServiceProvider>::new()));
    let builder: Arc<dyn PipelineBuilder> = {
        let (entered, released, built_from) = (entered.clone(), released.clone(), built_from.clone());
        Arc::new(
            move |tenant: &TenantId, container: &ServiceProvider| -> anyhow::Result<Arc<dyn RequestPipeline>> {
                let mut built = built_from.lock();
                built.push(container.clone());
                let n = built.len();
                drop(built);
                // 第一轮重建停在这里，直到测试发出显式重启
                if n == 1 {
                    entered.store(true, Ordering::SeqCst);
                    while !released.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                Ok(Arc::new(Labelled {
                    label: format!("{tenant}#{n}"),
                }))
            },
        )
    };
    let containers = Arc::new(TenantContainers::new(TenantContainerFactory::new(healthy_root())));
    let host = TenantHost::new(containers, builder, Arc::new(Fallback), &TenancyConfig::default()).unwrap();
    let alpha = tenant("alpha");

    let mut miss = RequestContext::new(alpha.clone(), "/");
    assert_eq!(host.dispatch(&mut miss).await.unwrap(), Route::Default);
    assert!(wait_until(WAIT, || entered.load(Ordering::SeqCst)).await);

    assert!(host.invalidate(&alpha));
    assert!(host.is_rebuild_pending(&alpha));
    released.store(true, Ordering::SeqCst);

    assert!(wait_until(WAIT, || built_from.lock().len() == 2).await);
    assert!(wait_until(WAIT, || !host.is_rebuild_pending(&alpha)).await);
    let cached = host.cache().get_pipeline(&alpha).unwrap();
    {
        let built = built_from.lock();
        assert!(cached.container().is_same(&built[1]));
        assert!(!cached.container().is_same(&built[0]));
    }

    let mut next = RequestContext::new(alpha.clone(), "/");
    host.dispatch(&mut next).await.unwrap();
    assert_eq!(next.response(), Some("alpha#2"));
}

#[tokio::test]
async fn test_clone_failure_falls_back_and_retries() {
    let healthy = Arc::new(AtomicBool::new(false));
    let switch = healthy.clone();
    let mut services = ServiceCollection::new();
    services.add_singleton(move |_| {
        if switch.load(Ordering::SeqCst) {
            Ok(Clock)
        } else {
            anyhow::bail!("clock not ready")
        }
    });
    let builds = Arc::new(AtomicUsize::new(0));
    let host = host_with(services.build("root"), builds.clone());
    let alpha = tenant("alpha");

    let mut first = RequestContext::new(alpha.clone(), "/");
    assert_eq!(host.dispatch(&mut first).await.unwrap(), Route::Default);
    assert!(wait_until(WAIT, || !host.is_rebuild_pending(&alpha)).await);
    assert!(!host.cache().contains_pipeline(&alpha));
    assert!(host.containers().get(&alpha).is_none());

    // 依赖恢复后，下一次请求仍走默认管道并重新触发重建
    healthy.store(true, Ordering::SeqCst);
    let mut second = RequestContext::new(alpha.clone(), "/");
    assert_eq!(host.dispatch(&mut second).await.unwrap(), Route::Default);
    assert!(second.restart_requested());
    assert!(wait_until(WAIT, || host.cache().contains_pipeline(&alpha)).await);

    let mut third = RequestContext::new(alpha.clone(), "/");
    assert_eq!(
        host.dispatch(&mut third).await.unwrap(),
        Route::Tenant(alpha.clone())
    );
    assert_eq!(builds.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_default_tenant_never_rebuilt() {
    let builds = Arc::new(AtomicUsize::new(0));
    let host = host_with(healthy_root(), builds.clone());
    let default_tenant = tenant(&TenancyConfig::default().default_tenant);

    let mut ctx = RequestContext::new(default_tenant.clone(), "/");
    assert_eq!(host.dispatch(&mut ctx).await.unwrap(), Route::Default);
    assert!(!ctx.restart_requested());
    assert!(!host.is_rebuild_pending(&default_tenant));
    assert!(host.cache().is_empty());
}
