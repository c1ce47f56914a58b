//! 以输入队列为接收端的通道。
//!
//! # 教案式说明
//! - **意图（Why）**：传输层的读循环与使用者的 `receive` 调用运行在不同任务上，两者之间需要一个
//!   带超时、可关闭、能传播故障的队列；[`InputQueueChannel`] 把 [`InputQueue<Message>`] 包装成
//!   [`MessageSource`]，传输层只需持有 [`MessageFeeder`] 投递消息。
//! - **逻辑（How）**：
//!   - 读循环调用 [`MessageFeeder::deliver`] 投递消息，读到流结束调用
//!     [`MessageFeeder::end_of_stream`]，读失败调用 [`MessageFeeder::fault`]；
//!   - [`MessageFeeder::fault`] 先把具体错误作为终止条目入队，再令通道进入 `Faulted`；
//!   - 通道关闭/中止时关闭队列，等待中的接收者得到“输入结束”；
//!   - 通道进入故障态后，此前投递的消息照常交付，随后接收者得到故障错误；
//!   - 本地不认识的属性经 [`ManagerLink`] 转发给所属工厂/监听器；
//!   - 可选的 [`LifecycleHooks`] 扩展让传输层在打开/关闭时管理自己的资源（连接、读任务）。
//! - **契约（What）**：
//!   - 接收前通道必须已打开；
//!   - 关闭后 `receive` 返回 `Ok(None)`；
//!   - 关闭时通道从所属工厂/监听器的登记表中移除。

use std::{
    any::TypeId,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_core::{
    ChannelTimeouts, CommunicationObject, CommunicationState, CoreError, DispatchScheduler,
    Lifecycle, LifecycleHooks, PropertySource, PropertyValue, Result, TimeoutBudget,
};
use strata_delivery::{DequeueOutcome, InputQueue};

use crate::{
    Channel, ChannelShape, EndpointAddress, ManagedHandle, ManagerLink, Message, MessageSource,
};

/// 传输层向通道投递消息的句柄。
#[derive(Clone, Debug)]
pub struct MessageFeeder {
    queue: InputQueue<Message>,
    lifecycle: Arc<Lifecycle>,
}

impl MessageFeeder {
    /// 投递消息；`can_dispatch_on_this_thread` 语义同 [`InputQueue::enqueue_and_dispatch`]。
    pub fn deliver(&self, message: Message, can_dispatch_on_this_thread: bool) {
        self.queue
            .enqueue_and_dispatch(message, None, can_dispatch_on_this_thread);
    }

    /// 读取失败：通道进入 `Faulted`；已投递的消息照常交付，随后接收者得到该错误。
    pub fn fault(&self, error: CoreError) {
        self.queue.enqueue_fault_and_dispatch(error, None, false);
        self.lifecycle.fault();
    }

    /// 对端结束发送：已投递的消息照常交付，随后接收者得到“输入结束”。
    pub fn end_of_stream(&self) {
        self.queue.enqueue_end_of_stream(false);
    }

    pub fn pending_count(&self) -> usize {
        self.queue.pending_count()
    }
}

/// 基于输入队列的接收通道。
pub struct InputQueueChannel {
    lifecycle: Arc<Lifecycle>,
    shape: ChannelShape,
    local_address: EndpointAddress,
    timeouts: ChannelTimeouts,
    queue: InputQueue<Message>,
    extension: Option<Arc<dyn LifecycleHooks>>,
    handle: Mutex<Option<ManagedHandle<dyn Channel>>>,
    manager: ManagerLink,
}

impl InputQueueChannel {
    pub fn new(
        local_address: EndpointAddress,
        timeouts: ChannelTimeouts,
        scheduler: Arc<dyn DispatchScheduler>,
    ) -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle::new(format!("input channel {local_address}"))),
            shape: ChannelShape::Input,
            local_address,
            timeouts,
            queue: InputQueue::with_scheduler(scheduler),
            extension: None,
            handle: Mutex::new(None),
            manager: ManagerLink::detached(),
        }
    }

    /// 指向所属工厂/监听器，用于属性查询的向外转发。
    pub fn with_manager(mut self, manager: ManagerLink) -> Self {
        self.manager = manager;
        self
    }

    /// 附加传输层的生命周期扩展。
    pub fn with_extension(mut self, extension: Arc<dyn LifecycleHooks>) -> Self {
        self.extension = Some(extension);
        self
    }

    pub fn with_shape(mut self, shape: ChannelShape) -> Self {
        self.shape = shape;
        self
    }

    /// 设置登记句柄，关闭时据此从登记表移除。
    pub fn set_handle(&self, handle: ManagedHandle<dyn Channel>) {
        *self.handle.lock() = Some(handle);
    }

    pub fn feeder(&self) -> MessageFeeder {
        MessageFeeder {
            queue: self.queue.clone(),
            lifecycle: Arc::clone(&self.lifecycle),
        }
    }

    pub fn local_address(&self) -> &EndpointAddress {
        &self.local_address
    }

    pub fn timeouts(&self) -> ChannelTimeouts {
        self.timeouts
    }

    /// 令通道进入故障态：等待中的接收者得到故障错误，之后的接收同样失败。
    pub fn fault(&self) {
        if self.lifecycle.fault() {
            self.enqueue_fault();
        }
    }

    /// 队列中已有终止条目（具体的读错误或输入结束）时不再追加。
    fn enqueue_fault(&self) {
        self.queue
            .enqueue_fault_and_dispatch(CoreError::faulted(self.lifecycle.label()), None, false);
    }

    fn release_handle(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.release();
        }
    }
}

#[async_trait]
impl LifecycleHooks for InputQueueChannel {
    async fn on_open(&self, budget: TimeoutBudget) -> Result<()> {
        match &self.extension {
            Some(extension) => extension.on_open(budget).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, budget: TimeoutBudget) -> Result<()> {
        self.queue.close();
        self.release_handle();
        match &self.extension {
            Some(extension) => extension.on_close(budget).await,
            None => Ok(()),
        }
    }

    fn on_abort(&self) {
        self.queue.close();
        self.release_handle();
        if let Some(extension) = &self.extension {
            extension.on_abort();
        }
    }
}

#[async_trait]
impl CommunicationObject for InputQueueChannel {
    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.lifecycle.open(self, timeout).await?;
        tracing::debug!(channel.shape = %self.shape, channel.address = %self.local_address, "channel opened");
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.lifecycle.close(self, timeout).await?;
        tracing::debug!(channel.shape = %self.shape, channel.address = %self.local_address, "channel closed");
        Ok(())
    }

    fn abort(&self) {
        self.lifecycle.abort(self);
    }
}

impl PropertySource for InputQueueChannel {
    fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        if type_id == TypeId::of::<ChannelTimeouts>() {
            return Some(Arc::new(self.timeouts));
        }
        if type_id == TypeId::of::<EndpointAddress>() {
            return Some(Arc::new(self.local_address.clone()));
        }
        self.manager.query_property(type_id)
    }
}

#[async_trait]
impl MessageSource for InputQueueChannel {
    async fn try_receive(&self, timeout: Duration) -> Result<DequeueOutcome<Message>> {
        match self.lifecycle.state() {
            CommunicationState::Opened => {}
            CommunicationState::Faulted => self.enqueue_fault(),
            CommunicationState::Closing | CommunicationState::Closed => {
                return Ok(DequeueOutcome::Drained);
            }
            _ => self.lifecycle.ensure_opened()?,
        }
        self.queue.try_dequeue_async(timeout).await
    }

    async fn wait_for_message(&self, timeout: Duration) -> bool {
        self.queue.wait_for_item_async(timeout).await
    }
}

impl Channel for InputQueueChannel {
    fn shape(&self) -> ChannelShape {
        self.shape
    }

    fn as_source(&self) -> Option<&dyn MessageSource> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use strata_core::{InlineScheduler, codes};

    fn channel() -> InputQueueChannel {
        InputQueueChannel::new(
            EndpointAddress::parse("mem://local/inbox").expect("地址应合法"),
            ChannelTimeouts::default(),
            Arc::new(InlineScheduler),
        )
    }

    #[tokio::test]
    async fn receive_requires_open() {
        let channel = channel();
        let err = channel
            .receive(Duration::ZERO)
            .await
            .expect_err("未打开时接收应失败");
        assert_eq!(err.code(), codes::LIFECYCLE_INVALID_STATE);
    }

    #[tokio::test]
    async fn delivered_messages_drain_before_end_of_stream() {
        let channel = channel();
        channel.open(Duration::from_secs(1)).await.expect("打开失败");
        let feeder = channel.feeder();
        feeder.deliver(Message::new("a", Bytes::from_static(b"1")), true);
        feeder.end_of_stream();

        let first = channel
            .receive(Duration::from_secs(1))
            .await
            .expect("接收失败")
            .expect("应收到消息");
        assert_eq!(first.action(), "a");
        assert!(channel.receive(Duration::from_secs(1)).await.expect("接收失败").is_none());
    }

    #[tokio::test]
    async fn fault_surfaces_to_receivers() {
        let channel = channel();
        channel.open(Duration::from_secs(1)).await.expect("打开失败");
        channel.fault();
        assert_eq!(channel.state(), CommunicationState::Faulted);
        let err = channel
            .receive(Duration::from_secs(1))
            .await
            .expect_err("故障后接收应失败");
        assert_eq!(err.code(), codes::LIFECYCLE_FAULTED);
    }

    #[tokio::test]
    async fn feeder_fault_moves_channel_to_faulted_after_delivered_messages() {
        let channel = channel();
        channel.open(Duration::from_secs(1)).await.expect("打开失败");
        let feeder = channel.feeder();
        feeder.deliver(Message::new("a", Bytes::from_static(b"1")), true);
        feeder.fault(CoreError::new(codes::TRANSPORT_READ, "connection reset"));
        assert_eq!(channel.state(), CommunicationState::Faulted);

        let first = channel
            .receive(Duration::from_secs(1))
            .await
            .expect("故障前投递的消息应照常交付")
            .expect("应收到消息");
        assert_eq!(first.action(), "a");
        for _ in 0..2 {
            let err = channel
                .receive(Duration::from_secs(1))
                .await
                .expect_err("随后的接收应得到读错误");
            assert_eq!(err.code(), codes::TRANSPORT_READ);
        }

        channel.close(Duration::from_secs(1)).await.expect_err("故障态关闭应报告故障");
        assert_eq!(channel.state(), CommunicationState::Closed);
    }
}
