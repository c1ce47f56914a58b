//! 有序交付契约测试。
//!
//! # 测试目标（Why）
//! - 无论消息以何种顺序到达，有序策略交给输入队列的序号都必须严格递增且不缺失；
//! - 到达过程中任意时刻，队列中已有的条目都构成从 1 开始的连续前缀。

use std::{sync::Arc, time::Duration};

use proptest::prelude::*;
use strata_core::InlineScheduler;
use strata_delivery::{DeliveryStrategy, InputQueue, OrderedDeliveryStrategy};

fn drain(queue: &InputQueue<u64>) -> Vec<u64> {
    let mut delivered = Vec::new();
    while let Some(item) = queue
        .try_dequeue(Duration::ZERO)
        .expect("出队失败")
        .into_item()
    {
        delivered.push(item);
    }
    delivered
}

fn arrival_orders() -> impl Strategy<Value = Vec<u64>> {
    (1u64..48).prop_flat_map(|len| Just((1..=len).collect::<Vec<u64>>()).prop_shuffle())
}

proptest! {
    #[test]
    fn any_arrival_order_is_delivered_ascending(order in arrival_orders()) {
        let queue = InputQueue::with_scheduler(Arc::new(InlineScheduler));
        let mut strategy = OrderedDeliveryStrategy::new(queue.clone(), order.len(), false);

        for &sequence in &order {
            prop_assert!(strategy.can_enqueue(sequence));
            strategy.enqueue(sequence, sequence);
            let queued = queue.pending_count() as u64;
            prop_assert_eq!(strategy.window_start(), queued + 1);
        }

        let expected: Vec<u64> = (1..=order.len() as u64).collect();
        prop_assert_eq!(drain(&queue), expected);
        prop_assert_eq!(strategy.buffered_count(), 0);
    }

    #[test]
    fn delivered_prefix_is_always_contiguous(order in arrival_orders()) {
        let queue = InputQueue::with_scheduler(Arc::new(InlineScheduler));
        let mut strategy = OrderedDeliveryStrategy::new(queue.clone(), order.len(), false);
        let mut delivered = Vec::new();

        for &sequence in &order {
            strategy.enqueue(sequence, sequence);
            delivered.extend(drain(&queue));
            let expected: Vec<u64> = (1..=delivered.len() as u64).collect();
            prop_assert_eq!(&delivered, &expected);
        }
    }
}

#[test]
fn late_gap_releases_buffered_successor() {
    let queue = InputQueue::with_scheduler(Arc::new(InlineScheduler));
    let mut strategy = OrderedDeliveryStrategy::new(queue.clone(), 5, false);

    assert!(!strategy.enqueue(3, 3));
    strategy.enqueue(1, 1);
    assert_eq!(strategy.window_start(), 2);
    assert_eq!(strategy.buffered_count(), 1, "序号 3 仍在等待序号 2");
    assert_eq!(drain(&queue), vec![1]);

    strategy.enqueue(2, 2);
    assert_eq!(strategy.buffered_count(), 0);
    assert_eq!(drain(&queue), vec![2, 3]);
}
