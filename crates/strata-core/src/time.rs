//! 超时预算。
//!
//! # 模块定位（Why）
//! - 通道层的 open/close/send/receive 都接受一个“总体超时”，而一次逻辑操作往往由若干步骤组成
//!   （例如先关闭内层通道、再归还连接）。每一步必须从同一个预算里扣减，而不是各自重新计时。
//! - [`TimeoutBudget`] 在构造时记录起点，此后任意时刻都能给出剩余时间；`Duration::MAX` 表示无限。
//!
//! # 实现要点（How）
//! - 基于 `tokio::time::Instant`，测试可用暂停时钟精确推进；
//! - 截止时间溢出（预算过大）时视作无限预算，避免 `Instant` 加法 panic。

use std::{future::Future, time::Duration};

use tokio::time::Instant;

use crate::{CoreError, Result};

/// 单次逻辑操作的超时预算。
///
/// # 契约说明（What）
/// - [`remaining`](Self::remaining) 单调不增，耗尽后恒为 `Duration::ZERO`；
/// - 无限预算的 `remaining()` 恒为 `Duration::MAX`，`deadline()` 为 `None`；
/// - 类型为 `Copy`，可在操作链的各步骤间自由传递。
#[derive(Clone, Copy, Debug)]
pub struct TimeoutBudget {
    total: Duration,
    started_at: Instant,
    deadline: Option<Instant>,
}

impl TimeoutBudget {
    /// 以当前时刻为起点创建预算。
    pub fn new(total: Duration) -> Self {
        let started_at = Instant::now();
        let deadline = if total == Duration::MAX {
            None
        } else {
            started_at.checked_add(total)
        };
        Self {
            total,
            started_at,
            deadline,
        }
    }

    /// 创建无限预算。
    pub fn infinite() -> Self {
        Self::new(Duration::MAX)
    }

    /// 原始预算。
    pub fn total(&self) -> Duration {
        self.total
    }

    /// 自创建以来经过的时间。
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 截止时刻；无限预算返回 `None`。
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// 剩余时间。
    pub fn remaining(&self) -> Duration {
        match self.deadline {
            None => Duration::MAX,
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
        }
    }

    /// 预算是否已经耗尽。
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// 在预算截止前执行 `operation`，超时返回 [`CoreError::timeout`]。
///
/// # 契约说明（What）
/// - `operation` 仅用于错误消息，描述被截止的动作；
/// - 预算为无限时直接等待 Future 完成，不创建计时器；
/// - 超时后 Future 会被丢弃，调用方需保证其可安全取消。
pub async fn with_deadline<F, T>(budget: &TimeoutBudget, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match budget.deadline() {
        None => fut.await,
        Some(deadline) => match tokio::time::timeout_at(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::timeout(operation, budget.total())),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remaining_shrinks_with_clock() {
        let budget = TimeoutBudget::new(Duration::from_secs(10));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(budget.remaining(), Duration::from_secs(6));
        tokio::time::advance(Duration::from_secs(7)).await;
        assert!(budget.is_expired());
        assert_eq!(budget.remaining(), Duration::ZERO);
    }

    #[test]
    fn infinite_budget_never_expires() {
        let budget = TimeoutBudget::infinite();
        assert_eq!(budget.remaining(), Duration::MAX);
        assert!(budget.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn with_deadline_reports_timeout() {
        let budget = TimeoutBudget::new(Duration::from_millis(50));
        let result: Result<()> = with_deadline(&budget, "close", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        let err = result.expect_err("应当超时");
        assert!(err.is_timeout());
        assert!(err.message().contains("close"));
    }
}
