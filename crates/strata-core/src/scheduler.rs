//! 派发调度抽象。
//!
//! 输入队列与有序投递策略需要把“交付后回调”“额外的派发”移出当前线程，以免生产者
//! 在持锁路径上运行消费者代码。调度器只负责“在别处执行一个闭包”，不承诺顺序。

use std::{sync::Arc, thread};

use parking_lot::Mutex;

/// 待执行的调度任务。
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// 调度器契约。
///
/// # 契约说明（What）
/// - `schedule` 不得阻塞调用方，也不得在返回前同步执行任务（[`InlineScheduler`] 除外，它专用于测试与确定性场景）；
/// - 每个任务恰好执行一次。
pub trait DispatchScheduler: Send + Sync {
    fn schedule(&self, task: ScheduledTask);
}

/// 默认调度器：存在 tokio 运行时则投递到运行时，否则启动独立线程执行。
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultScheduler;

impl DispatchScheduler for DefaultScheduler {
    fn schedule(&self, task: ScheduledTask) {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { task() });
            return;
        }

        let slot = Arc::new(Mutex::new(Some(task)));
        let remote = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name("strata-dispatch".into())
            .spawn(move || {
                if let Some(task) = remote.lock().take() {
                    task();
                }
            });
        if let Err(error) = spawned {
            tracing::warn!(%error, "dispatch thread unavailable, running task inline");
            if let Some(task) = slot.lock().take() {
                task();
            }
        }
    }
}

/// 同步调度器：在调用线程上立即执行任务。
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineScheduler;

impl DispatchScheduler for InlineScheduler {
    fn schedule(&self, task: ScheduledTask) {
        task();
    }
}
