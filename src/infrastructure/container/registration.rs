//! 服务注册记录与注册集合
//!
//! 每条注册记录都是 (能力键, 实现, 生命周期) 三元组，
//! 同一能力键可以有多条记录（多重绑定），顺序即注册顺序。

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::provider::{Resolver, ServiceProvider};
use crate::errors::ContainerError;

/// 类型擦除的服务实例
pub type Instance = Arc<dyn Any + Send + Sync>;

pub(crate) type FactoryFn =
    Arc<dyn Fn(&Resolver<'_>) -> anyhow::Result<Instance> + Send + Sync>;

pub(crate) type GenericFactoryFn =
    Arc<dyn Fn(&GenericRequest, &Resolver<'_>) -> anyhow::Result<Instance> + Send + Sync>;

/// 服务生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceLifetime {
    /// 单例 - 整个进程只有一个实例
    Singleton,
    /// 作用域 - 在特定作用域内共享实例
    Scoped,
    /// 瞬态 - 每次请求都创建新实例
    Transient,
}

/// 能力键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKey {
    /// 具体类型
    Type { id: TypeId, name: &'static str },
    /// 开放泛型族，解析时才给出具体类型
    Generic { family: &'static str },
}

impl ServiceKey {
    pub fn of<T: 'static>() -> Self {
        ServiceKey::Type {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn generic(family: &'static str) -> Self {
        ServiceKey::Generic { family }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServiceKey::Type { name, .. } => name,
            ServiceKey::Generic { family } => family,
        }
    }

    pub fn shape(&self) -> ServiceShape {
        match self {
            ServiceKey::Type { .. } => ServiceShape::Closed,
            ServiceKey::Generic { .. } => ServiceShape::Open,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceKey::Type { name, .. } => write!(f, "{name}"),
            ServiceKey::Generic { family } => write!(f, "{family}<>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceShape {
    Closed,
    Open,
}

/// 开放泛型解析请求：族名 + 调用方要求的具体类型
#[derive(Debug, Clone, Copy)]
pub struct GenericRequest {
    pub family: &'static str,
    pub closed: TypeId,
    pub closed_name: &'static str,
}

impl GenericRequest {
    pub fn is<T: 'static>(&self) -> bool {
        self.closed == TypeId::of::<T>()
    }
}

/// 注册ID，用于在容器和作用域中缓存实例
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(u64);

impl RegistrationId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RegistrationId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
pub(crate) enum Activator {
    Factory(FactoryFn),
    /// 预先构建的共享实例
    Shared(Instance),
    Generic(GenericFactoryFn),
}

/// 服务注册信息
#[derive(Clone)]
pub struct ServiceRegistration {
    id: RegistrationId,
    key: ServiceKey,
    implementation: &'static str,
    lifetime: ServiceLifetime,
    pub(crate) activator: Activator,
}

impl ServiceRegistration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn key(&self) -> ServiceKey {
        self.key
    }

    pub fn implementation(&self) -> &'static str {
        self.implementation
    }

    pub fn lifetime(&self) -> ServiceLifetime {
        self.lifetime
    }

    /// 是否为预构建的共享实例
    pub fn is_shared_instance(&self) -> bool {
        matches!(self.activator, Activator::Shared(_))
    }

    /// 以同一个实例替换激活方式，保留键、实现与注册顺序
    pub(crate) fn shared_from(source: &ServiceRegistration, instance: Instance) -> Self {
        Self {
            id: source.id,
            key: source.key,
            implementation: source.implementation,
            lifetime: ServiceLifetime::Singleton,
            activator: Activator::Shared(instance),
        }
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("implementation", &self.implementation)
            .field("lifetime", &self.lifetime)
            .field("shared", &self.is_shared_instance())
            .finish()
    }
}

/// 有序的注册集合，允许同一能力键的多重绑定
#[derive(Clone, Default, Debug)]
pub struct ServiceCollection {
    records: Vec<ServiceRegistration>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册服务工厂
    pub fn add<T, F>(&mut self, lifetime: ServiceLifetime, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let factory: FactoryFn = Arc::new(move |resolver: &Resolver<'_>| {
            factory(resolver).map(|service| Arc::new(service) as Instance)
        });
        self.push(ServiceRegistration {
            id: RegistrationId::next(),
            key: ServiceKey::of::<T>(),
            implementation: std::any::type_name::<T>(),
            lifetime,
            activator: Activator::Factory(factory),
        })
    }

    pub fn add_singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.add(ServiceLifetime::Singleton, factory)
    }

    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.add(ServiceLifetime::Scoped, factory)
    }

    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Resolver<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        self.add(ServiceLifetime::Transient, factory)
    }

    /// 注册已经构建好的单例实例
    pub fn add_instance<T>(&mut self, instance: Arc<T>) -> &mut Self
    where
        T: Send + Sync + 'static,
    {
        self.push(ServiceRegistration {
            id: RegistrationId::next(),
            key: ServiceKey::of::<T>(),
            implementation: std::any::type_name::<T>(),
            lifetime: ServiceLifetime::Singleton,
            activator: Activator::Shared(instance),
        })
    }

    /// 注册开放泛型族。工厂根据 `GenericRequest::closed` 构造具体类型的实例
    pub fn add_open_generic<F>(
        &mut self,
        family: &'static str,
        lifetime: ServiceLifetime,
        factory: F,
    ) -> &mut Self
    where
        F: Fn(&GenericRequest, &Resolver<'_>) -> anyhow::Result<Instance> + Send + Sync + 'static,
    {
        self.push(ServiceRegistration {
            id: RegistrationId::next(),
            key: ServiceKey::generic(family),
            implementation: family,
            lifetime,
            activator: Activator::Generic(Arc::new(factory)),
        })
    }

    pub fn push(&mut self, registration: ServiceRegistration) -> &mut Self {
        self.records.push(registration);
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ServiceRegistration> {
        self.records.iter()
    }

    pub fn contains_key(&self, key: &ServiceKey) -> bool {
        self.records.iter().any(|r| &r.key == key)
    }

    /// 按能力键分组，组的顺序为首次出现顺序，组内保持注册顺序
    pub fn groups(&self) -> Vec<(ServiceKey, Vec<&ServiceRegistration>)> {
        let mut positions: HashMap<ServiceKey, usize> = HashMap::new();
        let mut groups: Vec<(ServiceKey, Vec<&ServiceRegistration>)> = Vec::new();
        for record in &self.records {
            match positions.get(&record.key) {
                Some(&index) => groups[index].1.push(record),
                None => {
                    positions.insert(record.key, groups.len());
                    groups.push((record.key, vec![record]));
                }
            }
        }
        groups
    }

    /// 构建容器
    pub fn build(self, name: impl Into<String>) -> ServiceProvider {
        ServiceProvider::new(name.into(), self)
    }

    pub(crate) fn into_records(self) -> Vec<ServiceRegistration> {
        self.records
    }
}

pub(crate) fn downcast<T: Send + Sync + 'static>(
    instance: Instance,
    context: &'static str,
) -> Result<Arc<T>, ContainerError> {
    instance
        .downcast::<T>()
        .map_err(|_| ContainerError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            context,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Alpha;
    struct Beta;

    #[test]
    fn test_groups_preserve_first_appearance_order() {
        let mut services = ServiceCollection::new();
        services
            .add_transient(|_| Ok(Alpha))
            .add_singleton(|_| Ok(Beta))
            .add_scoped(|_| Ok(Alpha));

        let groups = services.groups();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, ServiceKey::of::<Alpha>());
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[0].1[0].lifetime(), ServiceLifetime::Transient);
        assert_eq!(groups[0].1[1].lifetime(), ServiceLifetime::Scoped);
        assert_eq!(groups[1].0, ServiceKey::of::<Beta>());
    }

    #[test]
    fn test_instance_registration_is_singleton() {
        let mut services = ServiceCollection::new();
        services.add_instance(Arc::new(Alpha));
        let record = services.iter().next().unwrap();
        assert_eq!(record.lifetime(), ServiceLifetime::Singleton);
        assert!(record.is_shared_instance());
    }

    #[test]
    fn test_generic_key_shape() {
        let key = ServiceKey::generic("Repository");
        assert_eq!(key.shape(), ServiceShape::Open);
        assert_eq!(key.to_string(), "Repository<>");
        assert_eq!(ServiceKey::of::<Alpha>().shape(), ServiceShape::Closed);
    }

    #[test]
    fn test_registration_ids_are_unique() {
        let mut services = ServiceCollection::new();
        services.add_transient(|_| Ok(Alpha)).add_transient(|_| Ok(Alpha));
        let ids: Vec<_> = services.iter().map(|r| r.id()).collect();
        assert_ne!(ids[0], ids[1]);
    }
}
