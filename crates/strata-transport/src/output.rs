//! 输出通道工厂与输出通道。
//!
//! # 教案式说明
//! - **意图（Why）**：输出通道把消息编码、分帧后写入一条连接。连接的建立代价高，因此通道打开时
//!   先向连接池借用，关闭时归还，只有池中没有可用连接时才新建。
//! - **逻辑（How）**：
//!   - 工厂打开时从 [`TransportContext`] 的注册表取得与池设置对应的 [`ConnectionPool`]，
//!     关闭时释放引用（最后一个使用者释放时池随之关闭）；
//!   - 通道打开时依次尝试 `take_connection` 与 `connect`，两者共享同一个打开预算；
//!   - `send` 串行化：帧头与负载必须连续写出，发送锁保证并发发送不会交错；
//!   - 写失败说明连接已不可用：通道进入故障态并中止连接，连接不再回到池中；
//!   - 关闭时等待在途发送结束，再把连接以“健康”状态归还；中止时直接中止连接。
//! - **契约（What）**：
//!   - 发送前通道必须已打开；
//!   - 发送的消息同样受 `max_message_size` 约束，超出时返回配额错误且连接保持可用；
//!   - 工厂关闭或中止会级联到它创建的全部通道。

use std::{
    any::TypeId,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_buffer::BufferManager;
use strata_channel::{
    Channel, ChannelFactory, ChannelFactoryBase, ChannelShape, EndpointAddress, ManagedHandle,
    ManagerLink, Message, MessageEncoder, MessageSink,
};
use strata_core::{
    ChannelTimeouts, CommunicationObject, CommunicationState, CoreError, ErrorCategory, Lifecycle,
    LifecycleHooks, PoolSettings, PropertySource, PropertyValue, Result, TimeoutBudget,
    with_deadline,
};
use tokio::sync::Mutex as AsyncMutex;

use crate::{ConnectionPool, ConnectionTransport, PoolKey, PooledConnection, TransportContext, write_frame};

/// 以连接池为后盾的输出通道工厂。
pub struct ConnectionOutputChannelFactory {
    base: ChannelFactoryBase,
    transport: Arc<dyn ConnectionTransport>,
    encoder: Arc<dyn MessageEncoder>,
    pool_settings: PoolSettings,
    max_message_size: usize,
    context: Arc<TransportContext>,
    pool: Mutex<Option<Arc<ConnectionPool>>>,
    link: ManagerLink,
}

impl ConnectionOutputChannelFactory {
    /// 创建工厂；返回 `Arc` 以便产出的通道持有指回工厂的弱链接。
    pub fn new(
        transport: Arc<dyn ConnectionTransport>,
        encoder: Arc<dyn MessageEncoder>,
        pool_settings: PoolSettings,
        max_message_size: usize,
        context: Arc<TransportContext>,
        timeouts: ChannelTimeouts,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<Self>| {
            let owner: Weak<dyn PropertySource + Send + Sync> = this.clone();
            Self {
                base: ChannelFactoryBase::new(format!("{} channel factory", transport.scheme()), timeouts),
                transport,
                encoder,
                pool_settings,
                max_message_size,
                context,
                pool: Mutex::new(None),
                link: ManagerLink::new(owner),
            }
        })
    }

    /// 工厂打开期间持有的连接池。
    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.pool.lock().clone()
    }

    /// 当前存活的通道数。
    pub fn channel_count(&self) -> usize {
        self.base.channels().len()
    }
}

#[async_trait]
impl LifecycleHooks for ConnectionOutputChannelFactory {
    async fn on_open(&self, _budget: TimeoutBudget) -> Result<()> {
        let pool = self.context.registry().lookup(&self.pool_settings);
        *self.pool.lock() = Some(pool);
        Ok(())
    }

    async fn on_close(&self, budget: TimeoutBudget) -> Result<()> {
        self.base.close_channels(TimeoutBudget::new(budget.remaining())).await?;
        let pool = self.pool.lock().take();
        match pool {
            Some(pool) => self.context.registry().release(&pool, budget.remaining()).await,
            None => Ok(()),
        }
    }

    fn on_abort(&self) {
        self.base.abort_channels();
        if let Some(pool) = self.pool.lock().take() {
            self.context.registry().abort_release(&pool);
        }
    }
}

#[async_trait]
impl CommunicationObject for ConnectionOutputChannelFactory {
    fn state(&self) -> CommunicationState {
        self.base.lifecycle().state()
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.base.lifecycle().open(self, timeout).await
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.base.lifecycle().close(self, timeout).await
    }

    fn abort(&self) {
        self.base.lifecycle().abort(self);
    }
}

impl PropertySource for ConnectionOutputChannelFactory {
    fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        if type_id == TypeId::of::<PoolSettings>() {
            return Some(Arc::new(self.pool_settings.clone()));
        }
        self.base.query_property(type_id)
    }
}

impl ChannelFactory for ConnectionOutputChannelFactory {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Output
    }

    fn create_channel(
        &self,
        address: &EndpointAddress,
        via: Option<&EndpointAddress>,
    ) -> Result<Arc<dyn Channel>> {
        let handle = self.base.reserve_channel()?;
        let pool = self
            .pool()
            .ok_or_else(|| CoreError::disposed(self.base.lifecycle().label()))?;
        let channel = Arc::new(ConnectionOutputChannel {
            lifecycle: Lifecycle::new(format!("output channel {address}")),
            key: self.transport.pool_key(address, via)?,
            remote: via.unwrap_or(address).clone(),
            address: address.clone(),
            transport: Arc::clone(&self.transport),
            encoder: Arc::clone(&self.encoder),
            buffers: self.context.buffers().clone(),
            max_message_size: self.max_message_size,
            timeouts: self.base.timeouts(),
            pool,
            connection: Mutex::new(None),
            send_lock: AsyncMutex::new(()),
            handle: Mutex::new(None),
            manager: self.link.clone(),
        });
        self.base.track_channel(&handle, channel.clone(), address)?;
        *channel.handle.lock() = Some(handle);
        Ok(channel)
    }
}

impl fmt::Debug for ConnectionOutputChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOutputChannelFactory")
            .field("scheme", &self.transport.scheme())
            .field("state", &self.state())
            .field("channels", &self.channel_count())
            .finish()
    }
}

/// 写入一条（可能来自池的）连接的输出通道。
pub struct ConnectionOutputChannel {
    lifecycle: Lifecycle,
    address: EndpointAddress,
    remote: EndpointAddress,
    key: PoolKey,
    transport: Arc<dyn ConnectionTransport>,
    encoder: Arc<dyn MessageEncoder>,
    buffers: BufferManager,
    max_message_size: usize,
    timeouts: ChannelTimeouts,
    pool: Arc<ConnectionPool>,
    connection: Mutex<Option<Arc<PooledConnection>>>,
    send_lock: AsyncMutex<()>,
    handle: Mutex<Option<ManagedHandle<dyn Channel>>>,
    manager: ManagerLink,
}

impl ConnectionOutputChannel {
    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    fn current_connection(&self) -> Result<Arc<PooledConnection>> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| CoreError::disposed(self.lifecycle.label()))
    }

    fn release_handle(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.release();
        }
    }

    fn abort_connection(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.abort();
        }
    }

    /// 连接已不可用：进入故障态并丢弃连接。
    fn fault(&self, error: &CoreError) {
        if self.lifecycle.fault() {
            tracing::debug!(channel.address = %self.address, %error, "output channel faulted");
        }
        self.abort_connection();
    }
}

#[async_trait]
impl LifecycleHooks for ConnectionOutputChannel {
    async fn on_open(&self, budget: TimeoutBudget) -> Result<()> {
        let connection = match self.pool.take_connection(&self.key, budget.remaining()).await {
            Some(connection) => connection,
            None => {
                let fresh = self.transport.connect(&self.remote, budget.remaining()).await?;
                tracing::debug!(pool.key = %self.key, "no pooled connection, connected fresh");
                PooledConnection::new(fresh)
            }
        };
        *self.connection.lock() = Some(Arc::new(connection));
        Ok(())
    }

    async fn on_close(&self, budget: TimeoutBudget) -> Result<()> {
        self.release_handle();
        let _sending = with_deadline(&budget, "wait for in-flight send", async {
            Ok(self.send_lock.lock().await)
        })
        .await?;
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };
        match Arc::try_unwrap(connection) {
            Ok(connection) => {
                self.pool
                    .return_connection(&self.key, connection, true, budget.remaining())
                    .await;
            }
            Err(shared) => shared.abort(),
        }
        Ok(())
    }

    fn on_abort(&self) {
        self.release_handle();
        self.abort_connection();
    }
}

#[async_trait]
impl CommunicationObject for ConnectionOutputChannel {
    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    async fn open(&self, timeout: Duration) -> Result<()> {
        self.lifecycle.open(self, timeout).await?;
        tracing::debug!(channel.shape = %ChannelShape::Output, channel.address = %self.address, "channel opened");
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        self.lifecycle.close(self, timeout).await?;
        tracing::debug!(channel.shape = %ChannelShape::Output, channel.address = %self.address, "channel closed");
        Ok(())
    }

    fn abort(&self) {
        self.lifecycle.abort(self);
    }
}

impl PropertySource for ConnectionOutputChannel {
    fn query_property(&self, type_id: TypeId) -> Option<PropertyValue> {
        if type_id == TypeId::of::<ChannelTimeouts>() {
            return Some(Arc::new(self.timeouts));
        }
        if type_id == TypeId::of::<EndpointAddress>() {
            return Some(Arc::new(self.address.clone()));
        }
        if type_id == TypeId::of::<PoolKey>() {
            return Some(Arc::new(self.key.clone()));
        }
        self.manager.query_property(type_id)
    }
}

#[async_trait]
impl MessageSink for ConnectionOutputChannel {
    async fn send(&self, message: Message, timeout: Duration) -> Result<()> {
        self.lifecycle.ensure_opened()?;
        let budget = TimeoutBudget::new(timeout);
        let encoded = self
            .encoder
            .write_message(&message, &self.buffers, self.max_message_size)?;
        drop(message);

        let _sending = with_deadline(&budget, "send", async { Ok(self.send_lock.lock().await) }).await?;
        let connection = self.current_connection()?;
        let written = write_frame(&**connection, &encoded[..], self.max_message_size, budget.remaining()).await;
        if let Err(error) = &written
            && !matches!(error.category(), ErrorCategory::QuotaExceeded(_))
        {
            self.fault(error);
        }
        written
    }
}

impl Channel for ConnectionOutputChannel {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Output
    }

    fn as_sink(&self) -> Option<&dyn MessageSink> {
        Some(self)
    }
}

impl fmt::Debug for ConnectionOutputChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOutputChannel")
            .field("address", &self.address)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
