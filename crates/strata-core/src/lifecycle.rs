//! 通信对象生命周期。
//!
//! # 模块定位（Why）
//! - 通道、通道工厂、监听器与连接池共享同一套状态机：
//!   `Created → Opening → Opened → Closing → Closed`，任意非终态都可能因故障跃迁到 `Faulted`。
//! - 每个实现都手写状态转换会导致“关闭失败后是否中止”“故障后关闭返回什么”这类边界语义不一致，
//!   因此状态机集中在 [`Lifecycle`]，具体对象只提供 [`LifecycleHooks`]。
//!
//! # 契约摘要（What）
//! - `open`：仅允许从 `Created` 发起；钩子失败时对象进入 `Faulted` 并返回原错误；
//! - `close`：`Created`/`Opening` 直接中止；`Faulted` 中止后返回故障错误；钩子失败时中止并返回原错误；
//! - `abort`：幂等，且永不把钩子里的 panic 传播给调用方；
//! - `fault`：只在 `Opening`/`Opened`/`Closing` 生效，故障监听器恰好触发一次。

use std::{
    borrow::Cow,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{CoreError, Result, TimeoutBudget};

/// 通信对象状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommunicationState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

impl CommunicationState {
    /// 是否已不可再用于收发。
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Faulted)
    }
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        };
        f.write_str(text)
    }
}

/// 通信对象契约。
///
/// 所有可打开/关闭的对象（通道、工厂、监听器）都实现该 trait，批量操作见 [`crate::chain`]。
#[async_trait]
pub trait CommunicationObject: Send + Sync {
    fn state(&self) -> CommunicationState;

    async fn open(&self, timeout: Duration) -> Result<()>;

    async fn close(&self, timeout: Duration) -> Result<()>;

    /// 立即释放资源，不等待、不报错。
    fn abort(&self);
}

/// 生命周期钩子。
///
/// # 契约说明（What）
/// - `on_open`/`on_close` 收到的预算与外层调用共享起点，钩子内部的多个步骤应从同一预算扣减；
/// - `on_abort` 必须快速返回，不得等待 I/O；即便 panic 也只会被记录。
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_open(&self, budget: TimeoutBudget) -> Result<()> {
        let _ = budget;
        Ok(())
    }

    async fn on_close(&self, budget: TimeoutBudget) -> Result<()> {
        let _ = budget;
        Ok(())
    }

    fn on_abort(&self) {}
}

type FaultListener = Box<dyn FnOnce() + Send>;

struct LifecycleState {
    state: CommunicationState,
    aborted: bool,
    fault_listeners: Vec<FaultListener>,
}

/// 生命周期状态机的共享实现。
///
/// # 设计背景（Why）
/// - 让具体通信对象只关注“打开/关闭时做什么”，状态转换、故障传播与幂等中止由此处统一保证。
///
/// # 逻辑解析（How）
/// - 状态保存在 `parking_lot::Mutex` 中，锁只覆盖状态读写，钩子始终在锁外执行；
/// - 故障监听器在状态跃迁为 `Faulted` 时一次性取出并在锁外调用，用于内层对象把故障
///   向上通知外层对象。
pub struct Lifecycle {
    label: Cow<'static, str>,
    inner: Mutex<LifecycleState>,
}

impl Lifecycle {
    /// 以诊断标签创建处于 `Created` 的生命周期。
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new(LifecycleState {
                state: CommunicationState::Created,
                aborted: false,
                fault_listeners: Vec::new(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> CommunicationState {
        self.inner.lock().state
    }

    /// 注册故障监听器；若对象已处于 `Faulted`，监听器立即执行。
    pub fn on_faulted(&self, listener: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock();
        if inner.state == CommunicationState::Faulted {
            drop(inner);
            listener();
            return;
        }
        inner.fault_listeners.push(Box::new(listener));
    }

    /// 执行打开流程。
    pub async fn open<H>(&self, hooks: &H, timeout: Duration) -> Result<()>
    where
        H: LifecycleHooks + ?Sized,
    {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CommunicationState::Created => inner.state = CommunicationState::Opening,
                CommunicationState::Faulted => return Err(CoreError::faulted(&self.label)),
                CommunicationState::Closing | CommunicationState::Closed => {
                    return Err(CoreError::disposed(&self.label));
                }
                state => {
                    return Err(CoreError::invalid_state(format!(
                        "{} cannot be opened while {state}",
                        self.label
                    )));
                }
            }
        }

        let budget = TimeoutBudget::new(timeout);
        if let Err(err) = hooks.on_open(budget).await {
            tracing::debug!(object = %self.label, error = %err, "open failed, faulting");
            self.fault();
            return Err(err);
        }

        let mut inner = self.inner.lock();
        match inner.state {
            CommunicationState::Opening => {
                inner.state = CommunicationState::Opened;
                Ok(())
            }
            CommunicationState::Faulted => Err(CoreError::faulted(&self.label)),
            _ => Err(CoreError::disposed(&self.label)),
        }
    }

    /// 执行关闭流程。
    pub async fn close<H>(&self, hooks: &H, timeout: Duration) -> Result<()>
    where
        H: LifecycleHooks + ?Sized,
    {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            if previous == CommunicationState::Opened {
                inner.state = CommunicationState::Closing;
            }
            previous
        };

        match previous {
            CommunicationState::Opened => {}
            CommunicationState::Created | CommunicationState::Opening => {
                self.abort(hooks);
                return Ok(());
            }
            CommunicationState::Closing | CommunicationState::Closed => return Ok(()),
            CommunicationState::Faulted => {
                self.abort(hooks);
                return Err(CoreError::faulted(&self.label));
            }
        }

        let budget = TimeoutBudget::new(timeout);
        match hooks.on_close(budget).await {
            Ok(()) => {
                let mut inner = self.inner.lock();
                if inner.state == CommunicationState::Closing {
                    inner.state = CommunicationState::Closed;
                }
                Ok(())
            }
            Err(err) => {
                tracing::debug!(object = %self.label, error = %err, "close failed, aborting");
                self.abort(hooks);
                Err(err)
            }
        }
    }

    /// 中止对象。重复调用只有第一次执行钩子。
    pub fn abort<H>(&self, hooks: &H)
    where
        H: LifecycleHooks + ?Sized,
    {
        {
            let mut inner = self.inner.lock();
            if inner.aborted || inner.state == CommunicationState::Closed {
                return;
            }
            inner.aborted = true;
        }

        if catch_unwind(AssertUnwindSafe(|| hooks.on_abort())).is_err() {
            tracing::warn!(object = %self.label, "abort hook panicked");
        }

        self.inner.lock().state = CommunicationState::Closed;
    }

    /// 将对象置为故障态并通知监听器。
    ///
    /// 返回 `true` 表示本次调用完成了跃迁；对象尚未打开或已经结束时返回 `false`。
    pub fn fault(&self) -> bool {
        let listeners = {
            let mut inner = self.inner.lock();
            match inner.state {
                CommunicationState::Opening
                | CommunicationState::Opened
                | CommunicationState::Closing => {
                    inner.state = CommunicationState::Faulted;
                    std::mem::take(&mut inner.fault_listeners)
                }
                _ => return false,
            }
        };

        tracing::debug!(object = %self.label, listeners = listeners.len(), "faulted");
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(listener)).is_err() {
                tracing::warn!(object = %self.label, "fault listener panicked");
            }
        }
        true
    }

    /// 要求对象处于 `Opened`。
    pub fn ensure_opened(&self) -> Result<()> {
        match self.state() {
            CommunicationState::Opened => Ok(()),
            CommunicationState::Faulted => Err(CoreError::faulted(&self.label)),
            CommunicationState::Closing | CommunicationState::Closed => {
                Err(CoreError::disposed(&self.label))
            }
            state => Err(CoreError::invalid_state(format!(
                "{} must be opened first (currently {state})",
                self.label
            ))),
        }
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}
