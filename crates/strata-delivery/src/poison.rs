//! 毒消息处理。
//!
//! # 模块定位（Why）
//! - 事务性接收中，处理失败的消息会回滚到队列并被再次投递。若某条消息每次都失败，
//!   它会无限循环，挡住后续所有消息。
//! - 处理器记录每条消息被看到的次数，超过重试上限后执行最终处置（丢弃或令通道进入故障态）。
//!
//! # 实现要点（How）
//! - 计数表容量固定为 [`TRACKED_MESSAGE_CAPACITY`]，满时淘汰最早插入的条目；
//!   被淘汰的消息若再次出现，会从头计数，这是对内存上限的有意取舍；
//! - 每次重投递前通过 [`PoisonMessageProperty::set_abort_count`] 把“此前失败次数”写回消息，
//!   供上层诊断。

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use parking_lot::Mutex;
use strata_core::{Lifecycle, PoisonDisposition, ReceiveRetrySettings, RetryCount};

/// 计数表最多跟踪的消息数。
pub const TRACKED_MESSAGE_CAPACITY: usize = 256;

/// 毒消息检测所需的消息侧信息。
pub trait PoisonMessageProperty {
    /// 传输层为消息分配的稳定标识。
    fn lookup_id(&self) -> u64;

    /// 记录此前失败的次数。
    fn set_abort_count(&mut self, count: u32);
}

/// 最终处置的执行者，通常由传输层实现（从队列移除消息、移入毒消息子队列等）。
pub trait FinalDisposition: Send + Sync {
    fn final_disposition(&self, lookup_id: u64, disposition: PoisonDisposition);
}

/// 检查结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoisonVerdict {
    /// 消息可以再次交付；`abort_count` 为此前失败次数。
    Redeliver { abort_count: u32 },
    /// 已执行最终处置，消息不应再交付。
    Handled,
}

#[derive(Default)]
struct SeenTable {
    counts: HashMap<u64, u32>,
    order: VecDeque<u64>,
}

impl SeenTable {
    fn increment(&mut self, lookup_id: u64) -> u32 {
        if let Some(count) = self.counts.get_mut(&lookup_id) {
            *count = count.saturating_add(1);
            return *count;
        }
        if self.counts.len() >= TRACKED_MESSAGE_CAPACITY {
            self.evict_oldest();
        }
        self.counts.insert(lookup_id, 1);
        self.order.push_back(lookup_id);
        1
    }

    fn evict_oldest(&mut self) {
        while let Some(oldest) = self.order.pop_front() {
            if self.counts.remove(&oldest).is_some() {
                tracing::trace!(message.lookup_id = oldest, "poison tracker evicted oldest entry");
                return;
            }
        }
    }

    fn forget(&mut self, lookup_id: u64) {
        if self.counts.remove(&lookup_id).is_some() {
            self.order.retain(|id| *id != lookup_id);
        }
    }

    fn len(&self) -> usize {
        self.counts.len()
    }
}

/// 毒消息处理器。
///
/// # 契约说明（What）
/// - `RetryCount::Unlimited` 时永不判定为毒消息；
/// - `RetryCount::Limited(n)` 时，第 `n + 2` 次看到同一消息即执行最终处置，
///   即首次交付加上 `n + 1` 次重投递之后才放弃；
/// - 最终处置对同一条消息只执行一次，此后该标识不再被跟踪。
pub struct PoisonMessageHandler {
    settings: ReceiveRetrySettings,
    disposition: Arc<dyn FinalDisposition>,
    seen: Mutex<SeenTable>,
}

impl PoisonMessageHandler {
    pub fn new(settings: ReceiveRetrySettings, disposition: Arc<dyn FinalDisposition>) -> Self {
        Self {
            settings,
            disposition,
            seen: Mutex::new(SeenTable::default()),
        }
    }

    pub fn settings(&self) -> &ReceiveRetrySettings {
        &self.settings
    }

    /// 当前跟踪的消息数。
    pub fn tracked_count(&self) -> usize {
        self.seen.lock().len()
    }

    /// 消息被看到一次：要么写回失败次数后允许重投递，要么执行最终处置。
    pub fn check_and_handle_poison_message<P>(&self, property: &mut P) -> PoisonVerdict
    where
        P: PoisonMessageProperty + ?Sized,
    {
        let lookup_id = property.lookup_id();
        let seen = {
            let mut table = self.seen.lock();
            let seen = table.increment(lookup_id);
            if let RetryCount::Limited(retries) = self.settings.receive_retry_count() {
                if u64::from(seen) > u64::from(retries) + 1 {
                    table.forget(lookup_id);
                    drop(table);
                    return self.handle_poison(lookup_id, seen);
                }
            }
            seen
        };

        let abort_count = seen - 1;
        property.set_abort_count(abort_count);
        PoisonVerdict::Redeliver { abort_count }
    }

    fn handle_poison(&self, lookup_id: u64, seen: u32) -> PoisonVerdict {
        let disposition = self.settings.poison_disposition();
        tracing::warn!(
            message.lookup_id = lookup_id,
            seen,
            ?disposition,
            "poison message detected, applying final disposition"
        );
        self.disposition.final_disposition(lookup_id, disposition);
        PoisonVerdict::Handled
    }
}

/// 以生命周期为目标的最终处置：`Fault` 令对象进入故障态，`Drop` 仅记录日志。
pub struct LifecycleDisposition {
    lifecycle: Arc<Lifecycle>,
}

impl LifecycleDisposition {
    pub fn new(lifecycle: Arc<Lifecycle>) -> Self {
        Self { lifecycle }
    }
}

impl FinalDisposition for LifecycleDisposition {
    fn final_disposition(&self, lookup_id: u64, disposition: PoisonDisposition) {
        match disposition {
            PoisonDisposition::Fault => {
                if self.lifecycle.fault() {
                    tracing::info!(
                        object = self.lifecycle.label(),
                        message.lookup_id = lookup_id,
                        "faulted by poison message"
                    );
                }
            }
            PoisonDisposition::Drop => {
                tracing::debug!(message.lookup_id = lookup_id, "poison message dropped");
            }
        }
    }
}
