//! 交付策略：在输入队列之前决定“能否接收”与“以何种顺序入队”。
//!
//! # 教案式说明
//! - **意图（Why）**：可靠会话按序号接收消息，乱序到达的消息可能需要先暂存，等缺口补齐后
//!   再按序交给上层；无序会话则只需限制排队数量。
//! - **逻辑（How）**：
//!   - 无序策略直接以 `enqueue_without_dispatch` 入队，配额只看队列中的条目数；
//!   - 有序策略维护 `window_start`（下一个期望的序号），序号超前的消息暂存在 `HashMap` 中；
//!     触发消息入队后，连续的后继依次释放，每释放一条就安排一次派发；
//! - **契约（What）**：
//!   - 有序策略交给队列的序号严格递增；
//!   - `enqueue` 返回 `true` 时调用方必须调用一次 [`DeliveryStrategy::dispatch`]；
//!   - `dispose` 释放所有暂存消息，即使某条消息的释放逻辑 panic 也会继续，最后重新抛出第一个 panic。

use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    thread,
};

use crate::InputQueue;

/// 交付策略契约。
///
/// 序号从 1 开始；无序策略忽略序号。
pub trait DeliveryStrategy<T>: Send {
    /// 配额：允许同时排队（含暂存）的消息数。
    fn quota(&self) -> usize;

    /// 已入队或暂存的消息总数。
    fn enqueued_count(&self) -> usize;

    /// 判断序号为 `sequence` 的消息此刻能否被接收。
    fn can_enqueue(&self, sequence: u64) -> bool;

    /// 接收消息；返回 `true` 表示需要随后调用 [`dispatch`](Self::dispatch)。
    fn enqueue(&mut self, item: T, sequence: u64) -> bool;

    /// 放行一个挂起条目。
    fn dispatch(&self);

    /// 下游输入队列。
    fn queue(&self) -> &InputQueue<T>;

    /// 释放所有暂存消息。
    fn dispose(&mut self);
}

/// 无序交付：只做数量限制。
pub struct UnorderedDeliveryStrategy<T> {
    queue: InputQueue<T>,
    quota: usize,
}

impl<T: Send + 'static> UnorderedDeliveryStrategy<T> {
    pub fn new(queue: InputQueue<T>, quota: usize) -> Self {
        Self { queue, quota }
    }
}

impl<T: Send + 'static> DeliveryStrategy<T> for UnorderedDeliveryStrategy<T> {
    fn quota(&self) -> usize {
        self.quota
    }

    fn enqueued_count(&self) -> usize {
        self.queue.pending_count()
    }

    fn can_enqueue(&self, _sequence: u64) -> bool {
        self.queue.pending_count() < self.quota
    }

    fn enqueue(&mut self, item: T, _sequence: u64) -> bool {
        self.queue.enqueue_without_dispatch(item, None)
    }

    fn dispatch(&self) {
        self.queue.dispatch();
    }

    fn queue(&self) -> &InputQueue<T> {
        &self.queue
    }

    fn dispose(&mut self) {}
}

/// 有序交付。
///
/// # 风险提示（Trade-offs）
/// - `can_enqueue` 的窗口判断只以 `window_start` 为基准：当排队数较少时，远超窗口的序号也可能被接收
///   并长期暂存，调用方应以更外层的流控窗口约束序号范围。
pub struct OrderedDeliveryStrategy<T> {
    queue: InputQueue<T>,
    quota: usize,
    enqueue_in_order: bool,
    window_start: u64,
    buffered: HashMap<u64, T>,
}

impl<T: Send + 'static> OrderedDeliveryStrategy<T> {
    /// `enqueue_in_order` 为 `true` 时拒绝任何超前序号，不做暂存。
    pub fn new(queue: InputQueue<T>, quota: usize, enqueue_in_order: bool) -> Self {
        Self {
            queue,
            quota,
            enqueue_in_order,
            window_start: 1,
            buffered: HashMap::new(),
        }
    }

    /// 下一个期望的序号。
    pub fn window_start(&self) -> u64 {
        self.window_start
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }
}

impl<T: Send + 'static> DeliveryStrategy<T> for OrderedDeliveryStrategy<T> {
    fn quota(&self) -> usize {
        self.quota
    }

    fn enqueued_count(&self) -> usize {
        self.queue.pending_count() + self.buffered.len()
    }

    fn can_enqueue(&self, sequence: u64) -> bool {
        if self.enqueued_count() >= self.quota {
            return false;
        }
        if self.enqueue_in_order && sequence > self.window_start {
            return false;
        }
        let pending = self.queue.pending_count() as u64;
        pending
            .saturating_add(sequence)
            .saturating_sub(self.window_start)
            < self.quota as u64
    }

    fn enqueue(&mut self, item: T, sequence: u64) -> bool {
        if sequence > self.window_start {
            self.buffered.insert(sequence, item);
            return false;
        }

        self.window_start += 1;
        let mut current = item;
        while let Some(next) = self.buffered.remove(&self.window_start) {
            if self.queue.enqueue_without_dispatch(current, None) {
                self.queue.schedule_dispatch();
            }
            current = next;
            self.window_start += 1;
        }
        self.queue.enqueue_without_dispatch(current, None)
    }

    fn dispatch(&self) {
        self.queue.dispatch();
    }

    fn queue(&self) -> &InputQueue<T> {
        &self.queue
    }

    fn dispose(&mut self) {
        let mut first_panic = None;
        for (sequence, item) in self.buffered.drain() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| drop(item))) {
                tracing::warn!(sequence, "buffered message disposal panicked");
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            resume_unwind(payload);
        }
    }
}

impl<T> Drop for OrderedDeliveryStrategy<T> {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        let mut first_panic = None;
        for (_, item) in self.buffered.drain() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| drop(item))) {
                first_panic.get_or_insert(payload);
            }
        }
        if let Some(payload) = first_panic {
            resume_unwind(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};
    use strata_core::InlineScheduler;

    fn ordered(quota: usize, in_order: bool) -> OrderedDeliveryStrategy<u64> {
        OrderedDeliveryStrategy::new(
            InputQueue::with_scheduler(Arc::new(InlineScheduler)),
            quota,
            in_order,
        )
    }

    fn drain(queue: &InputQueue<u64>) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(item) = queue
            .try_dequeue(Duration::ZERO)
            .expect("出队失败")
            .into_item()
        {
            out.push(item);
        }
        out
    }

    #[test]
    fn gap_is_buffered_until_filled() {
        let mut strategy = ordered(8, false);
        assert!(!strategy.enqueue(3, 3));
        assert!(!strategy.enqueue(2, 2));
        assert_eq!(strategy.buffered_count(), 2);
        assert!(drain(strategy.queue()).is_empty(), "缺口未补齐前不应交付");

        strategy.enqueue(1, 1);
        assert_eq!(strategy.window_start(), 4);
        assert_eq!(drain(strategy.queue()), vec![1, 2, 3]);
    }

    #[test]
    fn in_order_mode_rejects_future_sequence() {
        let strategy = ordered(8, true);
        assert!(strategy.can_enqueue(1));
        assert!(!strategy.can_enqueue(2));
    }

    #[test]
    fn quota_counts_buffered_items() {
        let mut strategy = ordered(2, false);
        strategy.enqueue(5, 5);
        strategy.enqueue(6, 6);
        assert_eq!(strategy.enqueued_count(), 2);
        assert!(!strategy.can_enqueue(1), "配额已满");
    }

    #[test]
    fn window_arithmetic_uses_pending_count() {
        let mut strategy = ordered(3, false);
        strategy.enqueue(1, 1);
        // pending = 1, window_start = 2：1 + 3 - 2 = 2 < 3
        assert!(strategy.can_enqueue(3));
        // 1 + 4 - 2 = 3，不小于配额
        assert!(!strategy.can_enqueue(4));
    }

    #[test]
    fn unordered_limits_by_queue_length() {
        let queue = InputQueue::with_scheduler(Arc::new(InlineScheduler));
        let mut strategy = UnorderedDeliveryStrategy::new(queue, 1);
        assert!(strategy.can_enqueue(42));
        assert!(!strategy.enqueue(7u64, 42), "无读者时不需要派发");
        assert!(!strategy.can_enqueue(43));
        strategy.dispose();
        assert_eq!(drain(strategy.queue()), vec![7]);
    }

    struct Exploding;

    impl Drop for Exploding {
        fn drop(&mut self) {
            panic!("boom");
        }
    }

    #[test]
    fn dispose_continues_past_panics() {
        let mut strategy: OrderedDeliveryStrategy<Exploding> = OrderedDeliveryStrategy::new(
            InputQueue::with_scheduler(Arc::new(InlineScheduler)),
            8,
            false,
        );
        strategy.enqueue(Exploding, 5);
        strategy.enqueue(Exploding, 6);
        let result = catch_unwind(AssertUnwindSafe(|| strategy.dispose()));
        assert!(result.is_err(), "第一个 panic 应被重新抛出");
        assert_eq!(strategy.buffered_count(), 0, "所有暂存消息都应被释放");
    }
}
