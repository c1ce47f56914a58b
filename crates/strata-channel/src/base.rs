//! 工厂与监听器的公共部分。
//!
//! # 模块定位（Why）
//! - 工厂、监听器与它们产出的通道共享同一套默认超时；通道未显式覆盖时继承所属管理者的值。
//! - 工厂需要跟踪自己创建的全部通道，使工厂级别的关闭/中止能级联到每个存活通道。
//!
//! # 契约说明（What）
//! - [`ChannelManagerBase::query_property`] 先回答本层认识的类型（[`ChannelTimeouts`]），
//!   其余交给调用方继续向内层委托；
//! - 通道通过 [`ManagerLink`] 把本地不认识的属性转发给所属工厂/监听器；链接只持有 `Weak`，
//!   管理者释放后查询返回 `None`；
//! - 通道创建、打开与关闭都以 `debug` 级别记录，字段包含形态与地址。

use std::{
    any::TypeId,
    borrow::Cow,
    fmt,
    sync::{Arc, Weak},
};

use strata_core::{
    ChannelTimeouts, Lifecycle, PropertySource, PropertyValue, Result, TimeoutBudget,
};

use crate::{Channel, ChannelShape, CommunicationObjectManager, EndpointAddress, ManagedHandle};

/// 工厂与监听器共有的状态：生命周期与默认超时。
pub struct ChannelManagerBase {
    lifecycle: Lifecycle,
    timeouts: ChannelTimeouts,
}

impl ChannelManagerBase {
    pub fn new(label: impl Into<Cow<'static, str>>, timeouts: ChannelTimeouts) -> Self {
        Self {
            lifecycle: Lifecycle::new(label),
            timeouts,
        }
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn label(&self) -> &str {
        self.lifecycle.label()
    }

    pub fn timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }

    pub fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        if type_id == TypeId::of::<ChannelTimeouts>() {
            return Some(Arc::new(self.timeouts));
        }
        None
    }
}

/// 通道工厂的公共部分：在 [`ChannelManagerBase`] 之上跟踪已创建的通道。
pub struct ChannelFactoryBase {
    manager: ChannelManagerBase,
    channels: CommunicationObjectManager<dyn Channel>,
}

impl ChannelFactoryBase {
    pub fn new(label: impl Into<Cow<'static, str>>, timeouts: ChannelTimeouts) -> Self {
        let label = label.into();
        Self {
            channels: CommunicationObjectManager::new(label.clone()),
            manager: ChannelManagerBase::new(label, timeouts),
        }
    }

    pub fn manager(&self) -> &ChannelManagerBase {
        &self.manager
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        self.manager.lifecycle()
    }

    pub fn timeouts(&self) -> ChannelTimeouts {
        self.manager.timeouts()
    }

    pub fn channels(&self) -> &CommunicationObjectManager<dyn Channel> {
        &self.channels
    }

    /// 为即将创建的通道预留登记位置；工厂必须处于打开状态。
    pub fn reserve_channel(&self) -> Result<ManagedHandle<dyn Channel>> {
        self.lifecycle().ensure_opened()?;
        self.channels.reserve()
    }

    /// 登记新创建的通道。
    pub fn track_channel(
        &self,
        handle: &ManagedHandle<dyn Channel>,
        channel: Arc<dyn Channel>,
        address: &EndpointAddress,
    ) -> Result<()> {
        let shape: ChannelShape = channel.shape();
        handle.attach(channel)?;
        tracing::debug!(
            factory = self.manager.label(),
            channel.shape = %shape,
            channel.address = %address,
            "channel created"
        );
        Ok(())
    }

    /// 在工厂关闭钩子中调用：以剩余预算关闭全部存活通道。
    pub async fn close_channels(&self, budget: TimeoutBudget) -> Result<()> {
        self.channels.close(budget.remaining()).await
    }

    /// 在工厂中止钩子中调用。
    pub fn abort_channels(&self) {
        self.channels.abort();
    }

    pub fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        self.manager.query_property(type_id)
    }
}

/// 通道到所属管理者（工厂或监听器）的非拥有链接。
///
/// 管理者经由登记表持有通道，通道若反向持有强引用会形成环，因此这里只保存 `Weak`。
#[derive(Clone, Default)]
pub struct ManagerLink {
    owner: Option<Weak<dyn PropertySource + Send + Sync>>,
}

impl ManagerLink {
    pub fn new(owner: Weak<dyn PropertySource + Send + Sync>) -> Self {
        Self { owner: Some(owner) }
    }

    /// 不指向任何管理者的链接，所有查询返回 `None`。
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        self.owner.as_ref()?.upgrade()?.query_property(type_id)
    }
}

impl fmt::Debug for ManagerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alive = self
            .owner
            .as_ref()
            .is_some_and(|owner| owner.strong_count() > 0);
        f.debug_struct("ManagerLink").field("alive", &alive).finish()
    }
}
