//! 通道能力契约。
//!
//! # 模块定位（Why）
//! - 通道的收发能力以小 trait 组合表达：所有通道都是可打开/关闭的 [`CommunicationObject`]，
//!   并按形态额外暴露 [`MessageSink`] 或 [`MessageSource`]；
//! - 分层通道以所有权组合：外层通道持有 `Arc<dyn Channel>` 形式的内层通道并委托调用。
//!
//! # 契约说明（What）
//! - `as_sink`/`as_source` 与 [`ChannelShape::can_send`]/[`ChannelShape::can_receive`] 一致；
//! - 接收超时不是错误：`try_receive` 返回 [`DequeueOutcome::TimedOut`]，
//!   `receive` 才把超时转换为错误。

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use strata_core::{CommunicationObject, CoreError, PropertySource, Result, codes};
use strata_delivery::DequeueOutcome;

use crate::{ChannelShape, EndpointAddress, Message};

/// 发送能力。
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send(&self, message: Message, timeout: Duration) -> Result<()>;
}

/// 接收能力。
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// 尝试接收；输入结束时返回 [`DequeueOutcome::Drained`]。
    async fn try_receive(&self, timeout: Duration) -> Result<DequeueOutcome<Message>>;

    /// 接收；超时返回 [`codes::TIMEOUT_DEQUEUE`] 错误，输入结束返回 `None`。
    async fn receive(&self, timeout: Duration) -> Result<Option<Message>> {
        match self.try_receive(timeout).await? {
            DequeueOutcome::Item(message) => Ok(Some(message)),
            DequeueOutcome::Drained => Ok(None),
            DequeueOutcome::TimedOut => Err(CoreError::new(
                codes::TIMEOUT_DEQUEUE,
                format!("no message was received within {timeout:?}"),
            )),
        }
    }

    /// 等待直到接收可以立即完成；不消费消息。
    async fn wait_for_message(&self, timeout: Duration) -> bool;
}

/// 通道。
pub trait Channel: CommunicationObject + PropertySource {
    fn shape(&self) -> ChannelShape;

    fn as_sink(&self) -> Option<&dyn MessageSink> {
        None
    }

    fn as_source(&self) -> Option<&dyn MessageSource> {
        None
    }
}

/// 通道工厂：发起方按地址创建通道。
pub trait ChannelFactory: CommunicationObject + PropertySource {
    fn shape(&self) -> ChannelShape;

    /// 创建尚未打开的通道；`via` 为实际建连的地址，缺省与 `address` 相同。
    fn create_channel(
        &self,
        address: &EndpointAddress,
        via: Option<&EndpointAddress>,
    ) -> Result<Arc<dyn Channel>>;
}

/// 通道监听器：接收方接受对端建立的通道。
#[async_trait]
pub trait ChannelListener: CommunicationObject + PropertySource {
    fn shape(&self) -> ChannelShape;

    fn uri(&self) -> &EndpointAddress;

    /// 尝试接受通道；监听器关闭后返回 [`DequeueOutcome::Drained`]。
    async fn try_accept_channel(&self, timeout: Duration)
    -> Result<DequeueOutcome<Arc<dyn Channel>>>;

    /// 接受通道；超时返回错误，监听器关闭后返回 `None`。
    async fn accept_channel(&self, timeout: Duration) -> Result<Option<Arc<dyn Channel>>> {
        match self.try_accept_channel(timeout).await? {
            DequeueOutcome::Item(channel) => Ok(Some(channel)),
            DequeueOutcome::Drained => Ok(None),
            DequeueOutcome::TimedOut => Err(CoreError::timeout("accept channel", timeout)),
        }
    }

    async fn wait_for_channel(&self, timeout: Duration) -> bool;
}
