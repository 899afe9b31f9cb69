//! 后台任务调度器
//!
//! 定时器每次触发时尝试排空队列：
//! - 非阻塞获取排空锁，上一轮仍在运行时本次触发直接丢弃
//! - 一次取走当前全部任务，排空期间新入队的任务留给下一轮
//! - 批内任务并发执行，每个任务在独立作用域中解析接收者
//! - 全部任务结束后本轮才结束；单个任务的失败只记录日志，不影响其他任务

pub mod source;
pub mod task;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::errors::{tenant_label, ContainerError, TaskError};
use crate::logging::OperationTimer;
use crate::tenancy::TenantId;

pub use source::ContainerSource;
pub use task::{Completion, Method, MethodInfo, MethodRegistry, QueuedTask};

use task::{Invocation, TaskHeader};

/// 一次排空调用的结果
#[derive(Debug)]
pub enum DrainOutcome {
    /// 上一轮排空仍在运行，本次触发被丢弃
    Busy,
    /// 队列为空
    Idle,
    Completed(DrainReport),
}

#[derive(Debug)]
pub struct DrainReport {
    pub batch_size: usize,
    pub succeeded: usize,
    pub failures: Vec<TaskFailure>,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct TaskFailure {
    pub task_id: Uuid,
    pub method: &'static str,
    pub tenant: Option<TenantId>,
    pub error: TaskError,
}

/// 调度器统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub enqueued: u64,
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub drains: u64,
    pub dropped_ticks: u64,
}

#[derive(Default)]
struct InnerStats {
    enqueued: AtomicU64,
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    drains: AtomicU64,
    dropped_ticks: AtomicU64,
}

struct SchedulerInner {
    source: Arc<dyn ContainerSource>,
    queue: Mutex<VecDeque<QueuedTask>>,
    drain_lock: tokio::sync::Mutex<()>,
    timer: Mutex<Option<JoinHandle<()>>>,
    tick_interval: Duration,
    stats: InnerStats,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.timer.get_mut().take() {
            handle.abort();
        }
    }
}

/// 后台任务调度器句柄，克隆后共享同一个队列
#[derive(Clone)]
pub struct BackgroundScheduler {
    inner: Arc<SchedulerInner>,
}

impl BackgroundScheduler {
    pub fn new(source: Arc<dyn ContainerSource>, config: &SchedulerConfig) -> Self {
        Self::with_tick_interval(source, config.tick_interval())
    }

    pub fn with_tick_interval(source: Arc<dyn ContainerSource>, tick_interval: Duration) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                source,
                queue: Mutex::new(VecDeque::new()),
                drain_lock: tokio::sync::Mutex::new(()),
                timer: Mutex::new(None),
                tick_interval,
                stats: InnerStats::default(),
            }),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        self.inner.tick_interval
    }

    /// 任务入队，不阻塞，不失败
    pub fn enqueue(&self, task: QueuedTask) {
        trace!(
            task = %task.id(),
            method = task.method().name,
            tenant = %tenant_label(task.tenant()),
            "Task enqueued"
        );
        self.inner.queue.lock().push_back(task);
        self.inner.stats.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// 启动定时器。已启动时返回 false。
    /// 定时器是 tokio 任务，必须在 tokio 运行时内调用
    pub fn activate(&self) -> bool {
        let mut timer = self.inner.timer.lock();
        if timer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Background scheduler already active");
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.tick_interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // 第一次 tick 立即完成
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let scheduler = BackgroundScheduler { inner };
                tokio::spawn(async move {
                    scheduler.drain().await;
                });
            }
            debug!("Background scheduler timer stopped");
        }));

        info!(
            tick_ms = period.as_millis() as u64,
            "Background scheduler activated"
        );
        true
    }

    /// 停止定时器。正在运行的排空不受影响
    pub fn deactivate(&self) -> bool {
        match self.inner.timer.lock().take() {
            Some(handle) => {
                handle.abort();
                info!("Background scheduler deactivated");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .timer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// 执行一轮排空
    pub async fn drain(&self) -> DrainOutcome {
        let Ok(_guard) = self.inner.drain_lock.try_lock() else {
            self.inner.stats.dropped_ticks.fetch_add(1, Ordering::Relaxed);
            debug!("Drain already in progress, tick dropped");
            return DrainOutcome::Busy;
        };

        let batch: Vec<QueuedTask> = {
            let mut queue = self.inner.queue.lock();
            if queue.is_empty() {
                return DrainOutcome::Idle;
            }
            queue.drain(..).collect()
        };

        let batch_size = batch.len();
        let timer = OperationTimer::new("background_drain").with_metadata("tasks", batch_size);
        info!(tasks = batch_size, "Background drain started");

        let executions = batch.into_iter().map(|task| {
            let (header, invocation) = task.into_parts();
            let handle = tokio::spawn(execute(
                self.inner.source.clone(),
                header.clone(),
                invocation,
            ));
            async move { (header, handle.await) }
        });
        let results = join_all(executions).await;

        let mut succeeded = 0;
        let mut failures = Vec::new();
        for (header, joined) in results {
            let outcome = joined.unwrap_or_else(|join_error| {
                Err(TaskError::TaskInvocationFailure {
                    method: header.method.name,
                    tenant: tenant_label(header.tenant.as_ref()),
                    source: panic_reason(join_error).into(),
                })
            });
            match outcome {
                Ok(()) => succeeded += 1,
                Err(error) => {
                    log_failure(&header, &error);
                    failures.push(TaskFailure {
                        task_id: header.id,
                        method: header.method.name,
                        tenant: header.tenant,
                        error,
                    });
                }
            }
        }

        let stats = &self.inner.stats;
        stats.drains.fetch_add(1, Ordering::Relaxed);
        stats.executed.fetch_add(batch_size as u64, Ordering::Relaxed);
        stats.succeeded.fetch_add(succeeded as u64, Ordering::Relaxed);
        stats.failed.fetch_add(failures.len() as u64, Ordering::Relaxed);

        let duration = timer.finish();
        info!(
            tasks = batch_size,
            succeeded,
            failed = failures.len(),
            duration_ms = duration.as_millis() as u64,
            "Background drain finished"
        );

        DrainOutcome::Completed(DrainReport {
            batch_size,
            succeeded,
            failures,
            duration,
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        let stats = &self.inner.stats;
        SchedulerStats {
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            executed: stats.executed.load(Ordering::Relaxed),
            succeeded: stats.succeeded.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            drains: stats.drains.load(Ordering::Relaxed),
            dropped_ticks: stats.dropped_ticks.load(Ordering::Relaxed),
        }
    }
}

/// 在任务自己的作用域中解析接收者并调用方法
async fn execute(
    source: Arc<dyn ContainerSource>,
    header: TaskHeader,
    invocation: Invocation,
) -> Result<(), TaskError> {
    let method = header.method;
    let tenant = tenant_label(header.tenant.as_ref());

    let container = match source.container_for(header.tenant.as_ref()).await {
        Ok(container) => container,
        Err(e) => {
            return Err(TaskError::ReceiverUnresolvable {
                method: method.name,
                receiver: method.receiver.name(),
                tenant,
                source: Box::new(e),
            })
        }
    };

    let scope = container.create_named_scope(format!("task:{}:{}", method.name, header.id));
    let receiver = match scope.resolve_key(&method.receiver) {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            return Err(TaskError::ReceiverUnresolvable {
                method: method.name,
                receiver: method.receiver.name(),
                tenant,
                source: Box::new(ContainerError::ServiceNotRegistered {
                    type_name: method.receiver.name().to_string(),
                }),
            })
        }
        Err(e) => {
            return Err(TaskError::ReceiverUnresolvable {
                method: method.name,
                receiver: method.receiver.name(),
                tenant,
                source: Box::new(e),
            })
        }
    };

    let result = invocation.invoke(receiver).await;
    scope.dispose();
    result.map_err(|e| TaskError::TaskInvocationFailure {
        method: method.name,
        tenant,
        source: e.into(),
    })
}

fn log_failure(header: &TaskHeader, failure: &TaskError) {
    let tenant = tenant_label(header.tenant.as_ref());
    match failure {
        TaskError::ReceiverUnresolvable { .. } => warn!(
            task = %header.id,
            method = header.method.name,
            tenant = %tenant,
            error = %failure,
            "Background task skipped"
        ),
        _ => error!(
            task = %header.id,
            method = header.method.name,
            tenant = %tenant,
            error = %failure,
            "Background task failed"
        ),
    }
}

pub(crate) fn panic_reason(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return "task was cancelled".to_string();
    }
    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {message}")
    } else {
        "task panicked".to_string()
    }
}
