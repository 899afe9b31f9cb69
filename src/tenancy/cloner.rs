//! 生命周期感知的容器克隆
//!
//! 按能力键分组处理根注册集合：
//! - 单例组：从根容器解析一次，以共享实例注册到子集合（保持同一引用）
//! - 非单例组：原样复制记录，租户内首次解析时才构造
//! - 混合组：在短生命周期作用域中逐条解析，单例取实例，其余保留原始记录
//! - 开放泛型组：原样复制，不做预解析

use tracing::{debug, error};

use crate::errors::TenancyError;
use crate::infrastructure::container::{
    ServiceCollection, ServiceKey, ServiceLifetime, ServiceProvider, ServiceRegistration,
    ServiceShape,
};

use super::TenantId;

/// 组的分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    OpenGeneric,
    AllSingleton,
    NoSingleton,
    Mixed,
}

fn classify(key: &ServiceKey, records: &[&ServiceRegistration]) -> GroupKind {
    if key.shape() == ServiceShape::Open {
        return GroupKind::OpenGeneric;
    }
    let singletons = records
        .iter()
        .filter(|r| r.lifetime() == ServiceLifetime::Singleton)
        .count();
    match singletons {
        0 => GroupKind::NoSingleton,
        n if n == records.len() => GroupKind::AllSingleton,
        _ => GroupKind::Mixed,
    }
}

/// 从根容器派生租户注册集合
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerCloner;

impl ContainerCloner {
    pub fn new() -> Self {
        Self
    }

    /// 克隆根容器自身的注册集合
    pub fn clone_provider(
        &self,
        tenant: &TenantId,
        root: &ServiceProvider,
    ) -> Result<ServiceCollection, TenancyError> {
        self.clone_registrations(tenant, root.registrations(), root)
    }

    /// 派生子注册集合。任一单例解析失败时整体失败，不返回部分结果
    pub fn clone_registrations(
        &self,
        tenant: &TenantId,
        registrations: &ServiceCollection,
        root: &ServiceProvider,
    ) -> Result<ServiceCollection, TenancyError> {
        let mut child = ServiceCollection::new();
        for (key, records) in registrations.groups() {
            match classify(&key, &records) {
                GroupKind::OpenGeneric | GroupKind::NoSingleton => {
                    for record in records {
                        child.push(record.clone());
                    }
                }
                GroupKind::AllSingleton => {
                    let scope = root.root_scope();
                    for record in records {
                        let instance = scope
                            .resolve_registration(record)
                            .map_err(|e| clone_failure(tenant, record, e))?;
                        child.push(ServiceRegistration::shared_from(record, instance));
                    }
                }
                GroupKind::Mixed => {
                    self.clone_mixed_group(tenant, &key, &records, root, &mut child)?;
                }
            }
        }
        debug!(
            tenant = %tenant,
            root = root.name(),
            services = child.len(),
            "Cloned root registrations"
        );
        Ok(child)
    }

    fn clone_mixed_group(
        &self,
        tenant: &TenantId,
        key: &ServiceKey,
        records: &[&ServiceRegistration],
        root: &ServiceProvider,
        child: &mut ServiceCollection,
    ) -> Result<(), TenancyError> {
        // 作用域只用于提取单例，提取后立即释放，作用域实例不得跨租户共享
        let scope = root.create_named_scope(format!("clone:{tenant}:{key}"));
        let result = records.iter().try_for_each(|&record| {
            let resolved = scope.resolve_registration(record);
            match (record.lifetime(), resolved) {
                (ServiceLifetime::Singleton, Ok(instance)) => {
                    child.push(ServiceRegistration::shared_from(record, instance));
                    Ok(())
                }
                (ServiceLifetime::Singleton, Err(e)) => Err(clone_failure(tenant, record, e)),
                (_, resolved) => {
                    if let Err(e) = resolved {
                        debug!(
                            tenant = %tenant,
                            service = record.implementation(),
                            error = %e,
                            "Non-singleton member left unresolved while cloning"
                        );
                    }
                    child.push(record.clone());
                    Ok(())
                }
            }
        });
        scope.dispose();
        result
    }
}

fn clone_failure(
    tenant: &TenantId,
    record: &ServiceRegistration,
    source: crate::errors::ContainerError,
) -> TenancyError {
    error!(
        tenant = %tenant,
        service = record.implementation(),
        error = %source,
        "Tenant container clone failed"
    );
    TenancyError::CloneFailure {
        tenant: tenant.to_string(),
        service: record.implementation().to_string(),
        source,
    }
}
