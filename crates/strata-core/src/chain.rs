//! 共享预算的异步操作链，以及批量打开/关闭/中止。
//!
//! # 模块定位（Why）
//! - 分层通道的打开与关闭是“先做本层，再做内层”（或反之）的多步操作，各步必须共享同一个
//!   超时预算：第二步只能拿到第一步用剩的时间。
//! - 工厂关闭时要同时关闭其创建的所有通道，单个通道失败不能阻止其余通道得到关闭机会。
//!
//! # 实现要点（How）
//! - [`ChainedOperation`] 是手写的 `Future`：依次构造并轮询每一步，任何一步失败立即结束；
//!   所有步骤在首次轮询中同步完成时，[`ChainedOperation::completed_synchronously`] 为真；
//! - 某一步挂起时才创建截止计时器，同步完成的链不触碰 tokio 计时器；预算耗尽时丢弃当前步骤并返回超时。
//! - 批量操作基于 `futures::stream::FuturesUnordered` 并发推进，按完成顺序记录第一个失败。

use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use futures::stream::{FuturesUnordered, StreamExt};

use tokio::time::Sleep;

use crate::{BoxFuture, CommunicationObject, CoreError, Result, TimeoutBudget};

/// 操作链中的一步：接收剩余预算，返回该步的 Future。
pub type Step<'a> = Box<dyn FnOnce(Duration) -> BoxFuture<'a, Result<()>> + Send + 'a>;

/// 把闭包包装成 [`Step`]。
pub fn step<'a, F, Fut>(f: F) -> Step<'a>
where
    F: FnOnce(Duration) -> Fut + Send + 'a,
    Fut: Future<Output = Result<()>> + Send + 'a,
{
    Box::new(move |remaining| Box::pin(f(remaining)) as BoxFuture<'a, Result<()>>)
}

/// 依次执行若干步骤的复合操作。
///
/// # 契约说明（What）
/// - 预算在构造时开始计时，每一步拿到的是构造以来的剩余时间；
/// - 某一步失败后，后续步骤不会被构造，错误原样返回；
/// - 链强制整体截止：预算耗尽时若仍有步骤挂起，该步骤被丢弃，链返回
///   [`codes::TIMEOUT_OPERATION`](crate::codes::TIMEOUT_OPERATION)，剩余步骤不会被构造；
/// - 预算耗尽前已完成的步骤不受影响，后续步骤即使只剩零预算也照常构造，由其同步完成与否决定结果。
pub struct ChainedOperation<'a> {
    budget: TimeoutBudget,
    steps: VecDeque<Step<'a>>,
    current: Option<BoxFuture<'a, Result<()>>>,
    deadline: Option<Pin<Box<Sleep>>>,
    completed_synchronously: bool,
}

impl<'a> ChainedOperation<'a> {
    /// 两段式操作：先 `first` 后 `second`。
    pub fn new<F1, Fut1, F2, Fut2>(timeout: Duration, first: F1, second: F2) -> Self
    where
        F1: FnOnce(Duration) -> Fut1 + Send + 'a,
        Fut1: Future<Output = Result<()>> + Send + 'a,
        F2: FnOnce(Duration) -> Fut2 + Send + 'a,
        Fut2: Future<Output = Result<()>> + Send + 'a,
    {
        Self::from_steps(timeout, [step(first), step(second)])
    }

    /// 以任意数量的步骤构造。
    pub fn from_steps(timeout: Duration, steps: impl IntoIterator<Item = Step<'a>>) -> Self {
        Self {
            budget: TimeoutBudget::new(timeout),
            steps: steps.into_iter().collect(),
            current: None,
            deadline: None,
            completed_synchronously: true,
        }
    }

    /// 剩余预算。
    pub fn remaining(&self) -> Duration {
        self.budget.remaining()
    }

    /// 整条链是否在第一次轮询中完成。完成前查询无意义。
    pub fn completed_synchronously(&self) -> bool {
        self.completed_synchronously
    }
}

/// N 段式组合：跳过为 `None` 的步骤，其余依次执行并共享预算。
pub fn compose<'a>(
    timeout: Duration,
    steps: impl IntoIterator<Item = Option<Step<'a>>>,
) -> ChainedOperation<'a> {
    ChainedOperation::from_steps(timeout, steps.into_iter().flatten())
}

impl Future for ChainedOperation<'_> {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        loop {
            if this.current.is_none() {
                match this.steps.pop_front() {
                    Some(next) => this.current = Some(next(this.budget.remaining())),
                    None => return Poll::Ready(Ok(())),
                }
            }

            let Some(current) = this.current.as_mut() else {
                return Poll::Ready(Ok(()));
            };

            match current.as_mut().poll(cx) {
                Poll::Pending => {
                    this.completed_synchronously = false;
                    if let Some(at) = this.budget.deadline() {
                        let timer = this
                            .deadline
                            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(at)));
                        if timer.as_mut().poll(cx).is_ready() {
                            this.current = None;
                            this.steps.clear();
                            return Poll::Ready(Err(CoreError::timeout(
                                "chained operation",
                                this.budget.total(),
                            )));
                        }
                    }
                    return Poll::Pending;
                }
                Poll::Ready(Ok(())) => this.current = None,
                Poll::Ready(Err(err)) => {
                    this.current = None;
                    this.steps.clear();
                    return Poll::Ready(Err(err));
                }
            }
        }
    }
}

impl fmt::Debug for ChainedOperation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedOperation")
            .field("pending_steps", &self.steps.len())
            .field("in_flight", &self.current.is_some())
            .field("remaining", &self.budget.remaining())
            .finish()
    }
}

/// 在共享预算下并发执行 `operation`，所有对象都会被尝试一次。
///
/// 失败的对象交给 `on_failure` 处理（关闭场景下用于中止）；返回按完成顺序的第一个错误。
pub async fn for_each_concurrently<T, Op, Fut, OnFailure>(
    items: impl IntoIterator<Item = T>,
    timeout: Duration,
    operation: Op,
    on_failure: OnFailure,
) -> Result<()>
where
    Op: Fn(T, Duration) -> Fut,
    Fut: Future<Output = (T, Result<()>)>,
    OnFailure: Fn(&T),
{
    let budget = TimeoutBudget::new(timeout);
    let mut in_flight: FuturesUnordered<Fut> = items
        .into_iter()
        .map(|item| operation(item, budget.remaining()))
        .collect();

    let mut first_error = None;
    while let Some((item, result)) = in_flight.next().await {
        if let Err(err) = result {
            on_failure(&item);
            if first_error.is_none() {
                first_error = Some(err);
            }
        }
    }
    first_error.map_or(Ok(()), Err)
}

/// 并发打开全部对象，返回第一个失败。
pub async fn open_all<T>(objects: impl IntoIterator<Item = Arc<T>>, timeout: Duration) -> Result<()>
where
    T: CommunicationObject + ?Sized,
{
    for_each_concurrently(
        objects,
        timeout,
        |object, remaining| async move {
            let result = object.open(remaining).await;
            (object, result)
        },
        |_| {},
    )
    .await
}

/// 并发关闭全部对象；关闭失败的对象会被中止，返回第一个失败。
pub async fn close_all<T>(
    objects: impl IntoIterator<Item = Arc<T>>,
    timeout: Duration,
) -> Result<()>
where
    T: CommunicationObject + ?Sized,
{
    for_each_concurrently(
        objects,
        timeout,
        |object, remaining| async move {
            let result = object.close(remaining).await;
            (object, result)
        },
        |object| object.abort(),
    )
    .await
}

/// 中止全部对象，返回中止时 panic 的对象数。
///
/// 中止不向调用方抛出：单个对象的 panic 被捕获并记录，其余对象照常中止。
pub fn abort_all<T>(objects: impl IntoIterator<Item = Arc<T>>) -> usize
where
    T: CommunicationObject + ?Sized,
{
    let mut panicked = 0;
    for object in objects {
        if catch_unwind(AssertUnwindSafe(|| object.abort())).is_err() {
            panicked += 1;
            tracing::warn!(state = ?object.state(), "object panicked while aborting");
        }
    }
    panicked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CoreError, codes};
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn synchronous_steps_complete_on_first_poll() {
        let counter = Arc::new(AtomicUsize::new(0));
        let first = Arc::clone(&counter);
        let second = Arc::clone(&counter);
        let mut chain = ChainedOperation::new(
            Duration::from_secs(1),
            move |_| {
                first.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            move |_| {
                second.fetch_add(10, Ordering::SeqCst);
                async { Ok(()) }
            },
        );
        let result = (&mut chain).now_or_never().expect("应同步完成");
        assert!(result.is_ok());
        assert!(chain.completed_synchronously());
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn failure_skips_remaining_steps() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let chain = compose(
            Duration::from_secs(1),
            [
                None,
                Some(step(|_| async {
                    Err(CoreError::new(codes::TRANSPORT_CLOSE, "first failed"))
                })),
                Some(step(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                })),
            ],
        );
        let err = chain.now_or_never().expect("应同步完成").expect_err("应失败");
        assert_eq!(err.code(), codes::TRANSPORT_CLOSE);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_step_sees_only_remaining_budget() {
        let seen = Arc::new(parking_lot::Mutex::new(Duration::ZERO));
        let record = Arc::clone(&seen);
        let mut chain = ChainedOperation::new(
            Duration::from_secs(10),
            |_| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                Ok(())
            },
            move |remaining| {
                *record.lock() = remaining;
                async { Ok(()) }
            },
        );
        (&mut chain).await.expect("链执行失败");
        assert!(!chain.completed_synchronously());
        assert_eq!(*seen.lock(), Duration::from_secs(7));
    }
}
