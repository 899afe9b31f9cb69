//! 后台任务描述
//!
//! 方法在启动时注册为类型化的跳板函数，`Method::bind` 把参数封装进
//! `QueuedTask`。执行时按接收者的能力键在作用域中解析实例，再交给跳板调用。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::errors::TaskError;
use crate::infrastructure::container::registration::downcast;
use crate::infrastructure::container::{Instance, ServiceKey};
use crate::scheduler::panic_reason;
use crate::tenancy::TenantId;

/// 方法的完成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Synchronous,
    Asynchronous,
}

/// 已注册方法的元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: &'static str,
    pub receiver: ServiceKey,
    pub completion: Completion,
}

type SyncCall = Box<dyn FnOnce(Instance) -> anyhow::Result<()> + Send>;
type AsyncCall = Box<dyn FnOnce(Instance) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

pub(crate) enum Invocation {
    Sync(SyncCall),
    Async(AsyncCall),
}

enum Trampoline<S, A> {
    Sync(Arc<dyn Fn(&S, A) -> anyhow::Result<()> + Send + Sync>),
    Async(Arc<dyn Fn(Arc<S>, A) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>),
}

impl<S, A> Clone for Trampoline<S, A> {
    fn clone(&self) -> Self {
        match self {
            Trampoline::Sync(f) => Trampoline::Sync(f.clone()),
            Trampoline::Async(f) => Trampoline::Async(f.clone()),
        }
    }
}

/// 类型化的方法句柄：接收者 `S`，参数 `A`
pub struct Method<S, A> {
    info: MethodInfo,
    trampoline: Trampoline<S, A>,
    _marker: PhantomData<fn(A)>,
}

impl<S, A> Clone for Method<S, A> {
    fn clone(&self) -> Self {
        Self {
            info: self.info,
            trampoline: self.trampoline.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S, A> Method<S, A>
where
    S: Send + Sync + 'static,
    A: Send + 'static,
{
    pub fn info(&self) -> MethodInfo {
        self.info
    }

    pub fn name(&self) -> &'static str {
        self.info.name
    }

    /// 绑定参数，生成在根容器中执行的任务
    pub fn bind(&self, args: A) -> QueuedTask {
        let invocation = match &self.trampoline {
            Trampoline::Sync(call) => {
                let call = call.clone();
                Invocation::Sync(Box::new(move |instance: Instance| {
                    let receiver = downcast::<S>(instance, "task receiver")?;
                    call(&*receiver, args)
                }))
            }
            Trampoline::Async(call) => {
                let call = call.clone();
                Invocation::Async(Box::new(move |instance: Instance| {
                    match downcast::<S>(instance, "task receiver") {
                        Ok(receiver) => call(receiver, args),
                        Err(e) => {
                            futures_util::future::ready(Err::<(), _>(anyhow::Error::from(e))).boxed()
                        }
                    }
                }))
            }
        };
        QueuedTask {
            id: Uuid::new_v4(),
            method: self.info,
            tenant: None,
            enqueued_at: Utc::now(),
            invocation,
        }
    }
}

/// 方法注册表。方法名全局唯一
#[derive(Default)]
pub struct MethodRegistry {
    methods: RwLock<HashMap<&'static str, MethodInfo>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册同步方法
    pub fn register_sync<S, A, F>(&self, name: &'static str, method: F) -> Result<Method<S, A>, TaskError>
    where
        S: Send + Sync + 'static,
        A: Send + 'static,
        F: Fn(&S, A) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let info = self.record::<S>(name, Completion::Synchronous)?;
        Ok(Method {
            info,
            trampoline: Trampoline::Sync(Arc::new(method)),
            _marker: PhantomData,
        })
    }

    /// 注册异步方法，执行时等待返回的 future 完成
    pub fn register_async<S, A, F, Fut>(
        &self,
        name: &'static str,
        method: F,
    ) -> Result<Method<S, A>, TaskError>
    where
        S: Send + Sync + 'static,
        A: Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let info = self.record::<S>(name, Completion::Asynchronous)?;
        Ok(Method {
            info,
            trampoline: Trampoline::Async(Arc::new(move |receiver: Arc<S>, args: A| {
                method(receiver, args).boxed()
            })),
            _marker: PhantomData,
        })
    }

    fn record<S: 'static>(
        &self,
        name: &'static str,
        completion: Completion,
    ) -> Result<MethodInfo, TaskError> {
        let mut methods = self.methods.write();
        if methods.contains_key(name) {
            return Err(TaskError::MethodAlreadyRegistered(name));
        }
        let info = MethodInfo {
            name,
            receiver: ServiceKey::of::<S>(),
            completion,
        };
        methods.insert(name, info);
        Ok(info)
    }

    pub fn get(&self, name: &str) -> Option<MethodInfo> {
        self.methods.read().get(name).copied()
    }

    /// 按名称排序的已注册方法
    pub fn methods(&self) -> Vec<MethodInfo> {
        let mut methods: Vec<MethodInfo> = self.methods.read().values().copied().collect();
        methods.sort_by_key(|m| m.name);
        methods
    }

    pub fn len(&self) -> usize {
        self.methods.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.read().is_empty()
    }
}

/// 排队中的延迟调用
pub struct QueuedTask {
    id: Uuid,
    method: MethodInfo,
    tenant: Option<TenantId>,
    enqueued_at: DateTime<Utc>,
    invocation: Invocation,
}

impl QueuedTask {
    /// 在指定租户的容器中执行
    pub fn for_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> MethodInfo {
        self.method
    }

    pub fn tenant(&self) -> Option<&TenantId> {
        self.tenant.as_ref()
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub(crate) fn into_parts(self) -> (TaskHeader, Invocation) {
        (
            TaskHeader {
                id: self.id,
                method: self.method,
                tenant: self.tenant,
            },
            self.invocation,
        )
    }
}

impl fmt::Debug for QueuedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedTask")
            .field("id", &self.id)
            .field("method", &self.method.name)
            .field("completion", &self.method.completion)
            .field("tenant", &self.tenant)
            .field("enqueued_at", &self.enqueued_at)
            .finish()
    }
}

/// 执行阶段使用的任务头
#[derive(Debug, Clone)]
pub(crate) struct TaskHeader {
    pub id: Uuid,
    pub method: MethodInfo,
    pub tenant: Option<TenantId>,
}

impl Invocation {
    /// 同步方法在阻塞线程池中执行，不占用异步工作线程
    pub(crate) async fn invoke(self, receiver: Instance) -> anyhow::Result<()> {
        match self {
            Invocation::Sync(call) => tokio::task::spawn_blocking(move || call(receiver))
                .await
                .unwrap_or_else(|join_error| Err(anyhow::anyhow!(panic_reason(join_error)))),
            Invocation::Async(call) => call(receiver).await,
        }
    }
}
