use std::{fmt, time::Duration};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{CoreError, Result, TimeoutBudget};

struct GuardState {
    count: usize,
    closed: bool,
    aborted: bool,
}

/// 进入/退出计数闸门。
///
/// # 设计背景（Why）
/// - 通道关闭时需要等待“已在途”的发送或接收全部结束，同时拒绝新的进入；
/// - 中止时不再等待，所有在途操作自行结束后不会再阻塞任何人。
///
/// # 契约说明（What）
/// - [`enter`](Self::enter) 在关闭后或达到上限时返回 `false`；成功进入必须配对一次 [`exit`](Self::exit)；
/// - [`close`](Self::close) 等待计数归零，超出预算返回超时错误；
/// - [`abort`](Self::abort) 立即唤醒所有等待关闭的调用方。
pub struct Guard {
    max_count: usize,
    state: Mutex<GuardState>,
    drained: Notify,
}

impl Guard {
    /// 创建无上限闸门。
    pub fn new() -> Self {
        Self::with_max_count(usize::MAX)
    }

    /// 创建最多允许 `max_count` 个并发进入者的闸门。
    pub fn with_max_count(max_count: usize) -> Self {
        Self {
            max_count,
            state: Mutex::new(GuardState {
                count: 0,
                closed: false,
                aborted: false,
            }),
            drained: Notify::new(),
        }
    }

    pub fn enter(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed || state.count >= self.max_count {
            return false;
        }
        state.count += 1;
        true
    }

    /// 进入并返回在 `Drop` 时自动退出的凭证。
    pub fn try_enter(&self) -> Option<GuardTicket<'_>> {
        self.enter().then_some(GuardTicket { guard: self })
    }

    pub fn exit(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.count = state.count.saturating_sub(1);
            state.count == 0 && state.closed
        };
        if drained {
            self.drained.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 拒绝新的进入者，并等待在途者全部退出。
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let budget = TimeoutBudget::new(timeout);
        self.state.lock().closed = true;

        loop {
            let mut notified = std::pin::pin!(self.drained.notified());
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.count == 0 || state.aborted {
                    return Ok(());
                }
            }

            match budget.deadline() {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(CoreError::timeout("guard drain", budget.total()));
                    }
                }
            }
        }
    }

    /// 立即关闭闸门并释放所有等待者。
    pub fn abort(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.aborted = true;
        }
        self.drained.notify_waiters();
    }
}

impl Default for Guard {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Guard")
            .field("count", &state.count)
            .field("closed", &state.closed)
            .finish()
    }
}

/// [`Guard::try_enter`] 返回的凭证，离开作用域时退出闸门。
#[must_use]
pub struct GuardTicket<'a> {
    guard: &'a Guard,
}

impl Drop for GuardTicket<'_> {
    fn drop(&mut self) {
        self.guard.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn enter_respects_max_count_and_close() {
        let guard = Guard::with_max_count(1);
        assert!(guard.enter());
        assert!(!guard.enter(), "超过上限应拒绝");
        guard.exit();
        let ticket = guard.try_enter().expect("应允许进入");
        assert_eq!(guard.count(), 1);
        drop(ticket);
        assert_eq!(guard.count(), 0);
    }

    #[tokio::test]
    async fn close_waits_for_drain() {
        let guard = Arc::new(Guard::new());
        assert!(guard.enter());
        let closer = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move { guard.close(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(!guard.enter(), "关闭后拒绝进入");
        guard.exit();
        closer.await.expect("任务崩溃").expect("排空后关闭应成功");
    }

    #[tokio::test(start_paused = true)]
    async fn close_times_out_when_not_drained() {
        let guard = Guard::new();
        assert!(guard.enter());
        let err = guard
            .close(Duration::from_millis(100))
            .await
            .expect_err("未排空应超时");
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn abort_releases_close_waiters() {
        let guard = Arc::new(Guard::new());
        assert!(guard.enter());
        let closer = {
            let guard = Arc::clone(&guard);
            tokio::spawn(async move { guard.close(Duration::MAX).await })
        };
        tokio::task::yield_now().await;
        guard.abort();
        closer.await.expect("任务崩溃").expect("中止后等待者应返回");
    }
}
