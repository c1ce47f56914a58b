//! 输入通道监听器。
//!
//! # 教案式说明
//! - **意图（Why）**：监听器在后台持续接受连接，每条连接成为一个输入通道；使用者以
//!   `accept_channel` 取走通道、打开后从中接收消息。接受与读取都在独立任务中进行，使用者的
//!   调用只与队列交互。
//! - **逻辑（How）**：
//!   - 打开监听器时调用 [`ConnectionTransport::listen`] 并启动接受循环；
//!   - 每条入站连接包装为 [`InputQueueChannel`]，其生命周期扩展 [`ConnectionReader`] 在通道打开时
//!     启动读循环：读帧 → 解码 → 投递；对端结束发送时投递“输入结束”；读或解码失败时通道进入
//!     `Faulted`，接收者随后得到该错误，连接被中止；
//!   - 新通道先登记到监听器的通道表，再放入待接受队列；
//!   - 关闭监听器时停止接受循环、关闭待接受队列（尚未被取走的通道被中止），并级联关闭全部通道。
//! - **契约（What）**：
//!   - 接受前监听器必须已打开，关闭后 `try_accept_channel` 返回 [`DequeueOutcome::Drained`]；
//!   - 单帧超过 `max_message_size` 时读循环以配额错误结束，缓冲不会被分配。
//!
//! # 风险提示（Trade-offs）
//! - 接受失败只记录并稍后重试，不会令监听器故障；持续失败（例如文件描述符耗尽）表现为日志告警。

use std::{
    any::TypeId,
    fmt,
    sync::{Arc, OnceLock, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_channel::{
    Channel, ChannelListener, ChannelManagerBase, ChannelShape, CommunicationObjectManager,
    EndpointAddress, InputQueueChannel, ManagerLink, MessageEncoder, MessageFeeder,
};
use strata_core::{
    ChannelTimeouts, CommunicationObject, CommunicationState, LifecycleHooks, PropertySource,
    PropertyValue, Result, TimeoutBudget,
};
use strata_delivery::{DequeueOutcome, InputQueue};
use tokio::task::JoinHandle;

use crate::{Connection, ConnectionAcceptor, ConnectionTransport, FrameReader, TransportContext};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// 接受连接并产出输入通道的监听器。
pub struct ConnectionInputChannelListener {
    manager: ChannelManagerBase,
    uri: EndpointAddress,
    bound: OnceLock<EndpointAddress>,
    transport: Arc<dyn ConnectionTransport>,
    shared: Arc<ListenerShared>,
    acceptor: Mutex<Option<Arc<dyn ConnectionAcceptor>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// 接受循环与监听器共享的部分。
struct ListenerShared {
    encoder: Arc<dyn MessageEncoder>,
    context: Arc<TransportContext>,
    max_message_size: usize,
    timeouts: ChannelTimeouts,
    channels: CommunicationObjectManager<dyn Channel>,
    pending: InputQueue<Arc<dyn Channel>>,
    link: ManagerLink,
}

impl ConnectionInputChannelListener {
    /// 创建监听器；返回 `Arc` 以便接受的通道持有指回监听器的弱链接。
    pub fn new(
        uri: EndpointAddress,
        transport: Arc<dyn ConnectionTransport>,
        encoder: Arc<dyn MessageEncoder>,
        max_message_size: usize,
        context: Arc<TransportContext>,
        timeouts: ChannelTimeouts,
    ) -> Arc<Self> {
        let label = format!("{} channel listener {uri}", transport.scheme());
        let pending = InputQueue::with_disposer(
            context.scheduler(),
            Arc::new(|channel: Arc<dyn Channel>| channel.abort()),
        );
        Arc::new_cyclic(|this: &Weak<Self>| {
            let owner: Weak<dyn PropertySource + Send + Sync> = this.clone();
            Self {
                shared: Arc::new(ListenerShared {
                    encoder,
                    context,
                    max_message_size,
                    timeouts,
                    channels: CommunicationObjectManager::new(label.clone()),
                    pending,
                    link: ManagerLink::new(owner),
                }),
                manager: ChannelManagerBase::new(label, timeouts),
                uri,
                bound: OnceLock::new(),
                transport,
                acceptor: Mutex::new(None),
                accept_task: Mutex::new(None),
            }
        })
    }

    /// 当前存活（含尚未被接受）的通道数。
    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    fn stop_accepting(&self) {
        if let Some(acceptor) = self.acceptor.lock().take() {
            acceptor.close();
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.shared.pending.close();
    }
}

impl ListenerShared {
    fn admit(&self, connection: Box<dyn Connection>, local: &EndpointAddress) -> Result<()> {
        let remote = connection.remote_identity().to_owned();
        let handle = self.channels.reserve()?;
        let channel = InputQueueChannel::new(local.clone(), self.timeouts, self.context.scheduler());
        let reader = Arc::new(ConnectionReader {
            connection: Arc::from(connection),
            feeder: channel.feeder(),
            frames: FrameReader::new(self.context.buffers().clone(), self.max_message_size),
            encoder: Arc::clone(&self.encoder),
            max_message_size: self.max_message_size,
            task: Mutex::new(None),
        });
        let channel = Arc::new(channel.with_extension(reader).with_manager(self.link.clone()));
        handle.attach(channel.clone())?;
        channel.set_handle(handle);
        tracing::debug!(channel.address = %local, connection.remote = %remote, "inbound connection accepted");
        self.pending.enqueue_and_dispatch(channel, None, true);
        Ok(())
    }
}

async fn accept_loop(acceptor: Arc<dyn ConnectionAcceptor>, shared: Arc<ListenerShared>) {
    let local = acceptor.local_address().clone();
    loop {
        match acceptor.accept(Duration::MAX).await {
            Ok(connection) => {
                if let Err(error) = shared.admit(connection, &local) {
                    tracing::debug!(%error, "listener no longer admits channels");
                    return;
                }
            }
            Err(error) => {
                tracing::warn!(transport.address = %local, %error, "accept failed, retrying");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl LifecycleHooks for ConnectionInputChannelListener {
    async fn on_open(&self, _budget: TimeoutBudget) -> Result<()> {
        let acceptor: Arc<dyn ConnectionAcceptor> = Arc::from(self.transport.listen(&self.uri).await?);
        let _ = self.bound.set(acceptor.local_address().clone());
        let task = tokio::spawn(accept_loop(Arc::clone(&acceptor), Arc::clone(&self.shared)));
        *self.acceptor.lock() = Some(acceptor);
        *self.accept_task.lock() = Some(task);
        Ok(())
    }

    async fn on_close(&self, budget: TimeoutBudget) -> Result<()> {
        self.stop_accepting();
        self.shared.channels.close(budget.remaining()).await
    }

    fn on_abort(&self) {
        self.stop_accepting();
        self.shared.channels.abort();
    }
}

#[async_trait]
impl CommunicationObject for ConnectionInputChannelListener {
    fn state(&self) -> CommunicationState {
        self.manager.lifecycle().state()
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.manager.lifecycle().open(self, timeout).await?;
        tracing::debug!(listener = self.manager.label(), listener.uri = %self.uri(), "listener opened");
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.manager.lifecycle().close(self, timeout).await
    }

    fn abort(&self) {
        self.manager.lifecycle().abort(self);
    }
}

impl PropertySource for ConnectionInputChannelListener {
    fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        if type_id == TypeId::of::<EndpointAddress>() {
            return Some(Arc::new(self.uri().clone()));
        }
        self.manager.query_property(type_id)
    }
}

#[async_trait]
impl ChannelListener for ConnectionInputChannelListener {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Input
    }

    /// 监听地址；打开后为传输实际绑定的地址（例如系统分配的端口）。
    fn uri(&self) -> &EndpointAddress {
        self.bound.get().unwrap_or(&self.uri)
    }

    async fn try_accept_channel(
        &self,
        timeout: Duration,
    ) -> Result<DequeueOutcome<Arc<dyn Channel>>> {
        let lifecycle = self.manager.lifecycle();
        match lifecycle.state() {
            CommunicationState::Opened => {}
            CommunicationState::Closing | CommunicationState::Closed => {
                return Ok(DequeueOutcome::Drained);
            }
            _ => lifecycle.ensure_opened()?,
        }
        self.shared.pending.try_dequeue_async(timeout).await
    }

    async fn wait_for_channel(&self, timeout: Duration) -> bool {
        self.shared.pending.wait_for_item_async(timeout).await
    }
}

impl fmt::Debug for ConnectionInputChannelListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInputChannelListener")
            .field("uri", self.uri())
            .field("state", &self.state())
            .field("channels", &self.channel_count())
            .finish()
    }
}

/// 输入通道的生命周期扩展：拥有连接并运行读循环。
struct ConnectionReader {
    connection: Arc<dyn Connection>,
    feeder: MessageFeeder,
    frames: FrameReader,
    encoder: Arc<dyn MessageEncoder>,
    max_message_size: usize,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionReader {
    fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl LifecycleHooks for ConnectionReader {
    async fn on_open(&self, _budget: TimeoutBudget) -> Result<()> {
        let connection = Arc::clone(&self.connection);
        let feeder = self.feeder.clone();
        let frames = self.frames.clone();
        let encoder = Arc::clone(&self.encoder);
        let max_message_size = self.max_message_size;
        let task = tokio::spawn(async move {
            loop {
                let frame = match frames.read_frame(&*connection, Duration::MAX).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        tracing::debug!(connection.remote = connection.remote_identity(), "peer ended the stream");
                        feeder.end_of_stream();
                        return;
                    }
                    Err(error) => {
                        tracing::debug!(connection.remote = connection.remote_identity(), %error, "read loop failed");
                        feeder.fault(error);
                        connection.abort();
                        return;
                    }
                };
                match encoder.read_message(frame, max_message_size) {
                    Ok(message) => feeder.deliver(message, true),
                    Err(error) => {
                        feeder.fault(error);
                        connection.abort();
                        return;
                    }
                }
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    async fn on_close(&self, budget: TimeoutBudget) -> Result<()> {
        self.stop();
        self.connection.close(budget.remaining()).await
    }

    fn on_abort(&self) {
        self.stop();
        self.connection.abort();
    }
}
