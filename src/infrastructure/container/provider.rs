//! 已构建的容器、作用域与解析器
//!
//! - 单例按注册记录缓存在拥有该记录的容器中，每条记录最多构造一次。
//!   构造期间不持锁；其他线程等待构造完成，等待链回到自身时报告循环依赖
//! - 作用域服务缓存在作用域中；直接从容器解析时使用容器自身的根作用域
//! - 瞬态服务每次解析都创建新实例

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::trace;

use super::registration::{
    downcast, Activator, GenericRequest, Instance, RegistrationId, ServiceCollection,
    ServiceKey, ServiceLifetime, ServiceRegistration,
};
use crate::errors::ContainerError;

/// 实例缓存槽：注册记录 + 开放泛型的具体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct InstanceSlot {
    registration: RegistrationId,
    closed: Option<TypeId>,
}

/// 等待其他线程构造单例时，重新检查等待链的间隔
const SINGLETON_WAIT_SLICE: Duration = Duration::from_millis(10);

enum SingletonState {
    Empty,
    Building(ThreadId),
    Ready(Instance),
}

struct SingletonCell {
    state: Mutex<SingletonState>,
    published: Condvar,
}

impl Default for SingletonCell {
    fn default() -> Self {
        Self {
            state: Mutex::new(SingletonState::Empty),
            published: Condvar::new(),
        }
    }
}

/// 内部容器统计信息（原子计数器）
#[derive(Default)]
struct InnerStats {
    total_resolutions: AtomicU64,
    singleton_cache_hits: AtomicU64,
    singleton_cache_misses: AtomicU64,
    scoped_creations: AtomicU64,
    transient_creations: AtomicU64,
}

/// 容器统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerStats {
    pub total_resolutions: u64,
    pub singleton_cache_hits: u64,
    pub singleton_cache_misses: u64,
    pub scoped_creations: u64,
    pub transient_creations: u64,
    pub registered_services: usize,
    pub active_singletons: usize,
}

impl ContainerStats {
    /// 获取缓存命中率（小数形式）
    pub fn hit_rate(&self) -> f64 {
        let total = self.singleton_cache_hits + self.singleton_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.singleton_cache_hits as f64 / total as f64
        }
    }
}

struct ProviderInner {
    name: String,
    registrations: ServiceCollection,
    index: HashMap<ServiceKey, Vec<usize>>,
    records: Vec<ServiceRegistration>,
    singletons: DashMap<InstanceSlot, Arc<SingletonCell>>,
    /// 正在等待单例构造的线程及其等待的槽位
    waiting: Mutex<HashMap<ThreadId, (InstanceSlot, ServiceKey)>>,
    root_scope: Arc<ScopeCache>,
    stats: InnerStats,
}

/// 依赖注入容器。根容器与租户容器都是 `ServiceProvider`
#[derive(Clone)]
pub struct ServiceProvider {
    inner: Arc<ProviderInner>,
}

impl ServiceProvider {
    pub(crate) fn new(name: String, registrations: ServiceCollection) -> Self {
        let records = registrations.clone().into_records();
        let mut index: HashMap<ServiceKey, Vec<usize>> = HashMap::new();
        for (position, record) in records.iter().enumerate() {
            index.entry(record.key()).or_default().push(position);
        }
        let root_scope = Arc::new(ScopeCache::new(format!("{name}:root")));
        Self {
            inner: Arc::new(ProviderInner {
                name,
                registrations,
                index,
                records,
                singletons: DashMap::new(),
                waiting: Mutex::new(HashMap::new()),
                root_scope,
                stats: InnerStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 容器的完整注册集合
    pub fn registrations(&self) -> &ServiceCollection {
        &self.inner.registrations
    }

    /// 创建新的作用域
    pub fn create_scope(&self) -> ServiceScope {
        self.create_named_scope(format!("{}:scope", self.inner.name))
    }

    pub fn create_named_scope(&self, name: impl Into<String>) -> ServiceScope {
        ServiceScope {
            provider: self.clone(),
            cache: Arc::new(ScopeCache::new(name.into())),
        }
    }

    /// 容器自身的根作用域，生命周期与容器相同
    pub fn root_scope(&self) -> ServiceScope {
        ServiceScope {
            provider: self.clone(),
            cache: self.inner.root_scope.clone(),
        }
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        self.root_scope().resolve::<T>()
    }

    pub fn try_resolve<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, ContainerError> {
        self.root_scope().try_resolve::<T>()
    }

    pub fn resolve_all<T: Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>, ContainerError> {
        self.root_scope().resolve_all::<T>()
    }

    pub fn resolve_generic<T: Send + Sync + 'static>(
        &self,
        family: &'static str,
    ) -> Result<Arc<T>, ContainerError> {
        self.root_scope().resolve_generic::<T>(family)
    }

    /// 检查服务是否已注册
    pub fn is_registered<T: 'static>(&self) -> bool {
        self.inner.index.contains_key(&ServiceKey::of::<T>())
    }

    pub fn is_same(&self, other: &ServiceProvider) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 获取容器统计信息
    pub fn stats(&self) -> ContainerStats {
        let stats = &self.inner.stats;
        ContainerStats {
            total_resolutions: stats.total_resolutions.load(Ordering::Relaxed),
            singleton_cache_hits: stats.singleton_cache_hits.load(Ordering::Relaxed),
            singleton_cache_misses: stats.singleton_cache_misses.load(Ordering::Relaxed),
            scoped_creations: stats.scoped_creations.load(Ordering::Relaxed),
            transient_creations: stats.transient_creations.load(Ordering::Relaxed),
            registered_services: self.inner.records.len(),
            active_singletons: self
                .inner
                .singletons
                .iter()
                .filter(|cell| matches!(*cell.value().state.lock(), SingletonState::Ready(_)))
                .count(),
        }
    }

    fn records_for(&self, key: &ServiceKey) -> impl Iterator<Item = &ServiceRegistration> {
        self.inner
            .index
            .get(key)
            .into_iter()
            .flatten()
            .map(|&position| &self.inner.records[position])
    }

    fn last_record(&self, key: &ServiceKey) -> Option<&ServiceRegistration> {
        self.records_for(key).last()
    }

    /// 沿等待链查找：`owner` 正在构造 `wanted`，若链条最终回到 `me` 则构成环
    fn wait_cycle(&self, me: ThreadId, mut owner: ThreadId, wanted: ServiceKey) -> Option<Vec<String>> {
        let mut chain = vec![wanted.to_string()];
        let limit = self.inner.waiting.lock().len() + 1;
        for _ in 0..=limit {
            if owner == me {
                chain.push(wanted.to_string());
                return Some(chain);
            }
            let (slot, key) = *self.inner.waiting.lock().get(&owner)?;
            chain.push(key.to_string());
            let cell = self.inner.singletons.get(&slot)?.value().clone();
            let next = match *cell.state.lock() {
                SingletonState::Building(thread) => thread,
                _ => return None,
            };
            owner = next;
        }
        None
    }
}

impl std::fmt::Debug for ServiceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceProvider")
            .field("name", &self.inner.name)
            .field("registrations", &self.inner.records.len())
            .finish()
    }
}

struct ScopeCache {
    id: uuid::Uuid,
    name: String,
    created_at: Instant,
    disposed: AtomicBool,
    instances: Mutex<HashMap<InstanceSlot, Instance>>,
}

impl ScopeCache {
    fn new(name: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            name,
            created_at: Instant::now(),
            disposed: AtomicBool::new(false),
            instances: Mutex::new(HashMap::new()),
        }
    }
}

/// 作用域：缓存作用域生命周期的实例
pub struct ServiceScope {
    provider: ServiceProvider,
    cache: Arc<ScopeCache>,
}

impl ServiceScope {
    pub fn id(&self) -> uuid::Uuid {
        self.cache.id
    }

    pub fn name(&self) -> &str {
        &self.cache.name
    }

    pub fn provider(&self) -> &ServiceProvider {
        &self.provider
    }

    pub fn age(&self) -> std::time::Duration {
        self.cache.created_at.elapsed()
    }

    pub fn is_disposed(&self) -> bool {
        self.cache.disposed.load(Ordering::Acquire)
    }

    /// 结束作用域并释放作用域内的实例。之后的解析都会失败
    pub fn dispose(&self) {
        if !self.cache.disposed.swap(true, Ordering::AcqRel) {
            let released = std::mem::take(&mut *self.cache.instances.lock());
            trace!(scope = %self.cache.name, released = released.len(), "scope disposed");
        }
    }

    pub fn resolver(&self) -> Resolver<'_> {
        Resolver {
            scope: self,
            path: RefCell::new(Vec::new()),
        }
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        self.resolver().resolve::<T>()
    }

    pub fn try_resolve<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, ContainerError> {
        self.resolver().try_resolve::<T>()
    }

    pub fn resolve_all<T: Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>, ContainerError> {
        self.resolver().resolve_all::<T>()
    }

    pub fn resolve_generic<T: Send + Sync + 'static>(
        &self,
        family: &'static str,
    ) -> Result<Arc<T>, ContainerError> {
        self.resolver().resolve_generic::<T>(family)
    }

    /// 按能力键解析最后一条注册，未注册时返回 `None`
    pub fn resolve_key(&self, key: &ServiceKey) -> Result<Option<Instance>, ContainerError> {
        self.resolver().resolve_key(key)
    }

    /// 解析指定的注册记录（必须属于该作用域的容器）
    pub fn resolve_registration(
        &self,
        registration: &ServiceRegistration,
    ) -> Result<Instance, ContainerError> {
        self.resolver().activate(registration, None)
    }
}

impl Drop for ServiceScope {
    fn drop(&mut self) {
        // 根作用域由容器持有，只有临时作用域在最后一个句柄释放时清理
        if Arc::strong_count(&self.cache) == 1 {
            self.dispose();
        }
    }
}

/// 单次解析调用的解析器，负责循环依赖检测。工厂通过它解析自身的依赖
pub struct Resolver<'a> {
    scope: &'a ServiceScope,
    path: RefCell<Vec<ServiceKey>>,
}

impl Resolver<'_> {
    pub fn scope(&self) -> &ServiceScope {
        self.scope
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        self.try_resolve::<T>()?
            .ok_or_else(|| ContainerError::ServiceNotRegistered {
                type_name: std::any::type_name::<T>().to_string(),
            })
    }

    pub fn try_resolve<T: Send + Sync + 'static>(&self) -> Result<Option<Arc<T>>, ContainerError> {
        match self.resolve_key(&ServiceKey::of::<T>())? {
            Some(instance) => downcast::<T>(instance, "service resolution").map(Some),
            None => Ok(None),
        }
    }

    /// 解析能力键的全部绑定，保持注册顺序
    pub fn resolve_all<T: Send + Sync + 'static>(&self) -> Result<Vec<Arc<T>>, ContainerError> {
        let provider = &self.scope.provider;
        provider
            .records_for(&ServiceKey::of::<T>())
            .map(|record| {
                self.activate(record, None)
                    .and_then(|instance| downcast::<T>(instance, "multi-binding resolution"))
            })
            .collect()
    }

    /// 以具体类型 `T` 解析开放泛型族
    pub fn resolve_generic<T: Send + Sync + 'static>(
        &self,
        family: &'static str,
    ) -> Result<Arc<T>, ContainerError> {
        let provider = &self.scope.provider;
        let record = provider
            .last_record(&ServiceKey::generic(family))
            .ok_or_else(|| ContainerError::ServiceNotRegistered {
                type_name: format!("{family}<{}>", std::any::type_name::<T>()),
            })?;
        let request = GenericRequest {
            family,
            closed: TypeId::of::<T>(),
            closed_name: std::any::type_name::<T>(),
        };
        let instance = self.activate(record, Some(request))?;
        downcast::<T>(instance, "open generic resolution")
    }

    pub fn resolve_key(&self, key: &ServiceKey) -> Result<Option<Instance>, ContainerError> {
        let provider = &self.scope.provider;
        match provider.last_record(key) {
            Some(record) => self.activate(record, None).map(Some),
            None => Ok(None),
        }
    }

    pub(crate) fn activate(
        &self,
        record: &ServiceRegistration,
        generic: Option<GenericRequest>,
    ) -> Result<Instance, ContainerError> {
        if self.scope.is_disposed() {
            return Err(ContainerError::ScopeDisposed {
                scope_id: self.scope.cache.id,
                scope_name: self.scope.cache.name.clone(),
            });
        }

        let key = record.key();
        {
            let mut path = self.path.borrow_mut();
            if path.contains(&key) {
                let mut chain: Vec<String> = path.iter().map(|k| k.to_string()).collect();
                chain.push(key.to_string());
                return Err(ContainerError::CircularDependency { chain });
            }
            path.push(key);
        }

        let result = self.activate_with_lifetime(record, generic);
        self.path.borrow_mut().pop();
        result
    }

    fn activate_with_lifetime(
        &self,
        record: &ServiceRegistration,
        generic: Option<GenericRequest>,
    ) -> Result<Instance, ContainerError> {
        let provider = &self.scope.provider;
        let stats = &provider.inner.stats;
        stats.total_resolutions.fetch_add(1, Ordering::Relaxed);

        let slot = InstanceSlot {
            registration: record.id(),
            closed: generic.map(|g| g.closed),
        };

        match record.lifetime() {
            ServiceLifetime::Singleton => {
                if let Activator::Shared(instance) = &record.activator {
                    stats.singleton_cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(instance.clone());
                }
                self.resolve_singleton(record, slot, generic)
            }
            ServiceLifetime::Scoped => {
                if let Some(instance) = self.scope.cache.instances.lock().get(&slot) {
                    return Ok(instance.clone());
                }
                let instance = self.construct(record, generic)?;
                stats.scoped_creations.fetch_add(1, Ordering::Relaxed);
                let mut instances = self.scope.cache.instances.lock();
                Ok(instances.entry(slot).or_insert(instance).clone())
            }
            ServiceLifetime::Transient => {
                stats.transient_creations.fetch_add(1, Ordering::Relaxed);
                self.construct(record, generic)
            }
        }
    }

    fn resolve_singleton(
        &self,
        record: &ServiceRegistration,
        slot: InstanceSlot,
        generic: Option<GenericRequest>,
    ) -> Result<Instance, ContainerError> {
        let provider = &self.scope.provider;
        let stats = &provider.inner.stats;
        // 先取出单元格再加锁，避免持有 DashMap 分片锁时执行工厂
        let cell = provider
            .inner
            .singletons
            .entry(slot)
            .or_insert_with(|| Arc::new(SingletonCell::default()))
            .clone();
        let me = thread::current().id();

        let mut state = cell.state.lock();
        loop {
            let owner = match &*state {
                SingletonState::Ready(instance) => {
                    stats.singleton_cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(instance.clone());
                }
                SingletonState::Empty => break,
                SingletonState::Building(owner) => *owner,
            };

            provider.inner.waiting.lock().insert(me, (slot, record.key()));
            let cycle = MutexGuard::unlocked(&mut state, || {
                provider.wait_cycle(me, owner, record.key())
            });
            if let Some(chain) = cycle {
                provider.inner.waiting.lock().remove(&me);
                return Err(ContainerError::CircularDependency { chain });
            }
            if matches!(*state, SingletonState::Building(_)) {
                cell.published.wait_for(&mut state, SINGLETON_WAIT_SLICE);
            }
            provider.inner.waiting.lock().remove(&me);
        }

        *state = SingletonState::Building(me);
        drop(state);
        stats.singleton_cache_misses.fetch_add(1, Ordering::Relaxed);

        let built = self.construct(record, generic);
        *cell.state.lock() = match &built {
            Ok(instance) => SingletonState::Ready(instance.clone()),
            // 失败不缓存，下次解析重新构造
            Err(_) => SingletonState::Empty,
        };
        cell.published.notify_all();
        built
    }

    fn construct(
        &self,
        record: &ServiceRegistration,
        generic: Option<GenericRequest>,
    ) -> Result<Instance, ContainerError> {
        let created = match (&record.activator, generic) {
            (Activator::Shared(instance), _) => return Ok(instance.clone()),
            (Activator::Factory(factory), _) => factory(self),
            (Activator::Generic(factory), Some(request)) => factory(&request, self),
            (Activator::Generic(_), None) => {
                return Err(ContainerError::OpenGenericUnresolved {
                    family: record.key().name(),
                })
            }
        };
        created.map_err(|error| match error.downcast::<ContainerError>() {
            Ok(container_error) => container_error,
            Err(other) => ContainerError::CreationFailed {
                service: record.implementation().to_string(),
                source: other.into(),
            },
        })
    }
}
