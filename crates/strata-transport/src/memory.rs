//! 进程内传输。
//!
//! 以 `tokio::io::duplex` 模拟面向连接的介质：监听者在进程内注册地址，发起方按地址找到监听者并
//! 递交双工流的一端。它与 TCP 走同一条连接池与通道路径，测试因此无需真实网络。

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_channel::EndpointAddress;
use strata_core::{CoreError, Result, codes};
use tokio::{
    io::DuplexStream,
    sync::{Mutex as AsyncMutex, mpsc},
};

use crate::{
    Connection, ConnectionAcceptor, ConnectionInitiator, ConnectionTransport, PoolKey,
    StreamConnection,
    error::{self, timeout_error},
};

pub const MEMORY_SCHEME: &str = "mem";

const DEFAULT_STREAM_CAPACITY: usize = 64 * 1024;
const BACKLOG: usize = 16;

type Registrations = Arc<Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>>;

/// 进程内传输；克隆共享同一张地址表。
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    listeners: Registrations,
    connects: Arc<AtomicUsize>,
    capacity: usize,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            listeners: Arc::default(),
            connects: Arc::default(),
            capacity: DEFAULT_STREAM_CAPACITY,
        }
    }

    /// 设置每条双工流单方向的缓冲容量。
    pub fn with_stream_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// 成功建立的出站连接数。
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ConnectionInitiator for MemoryTransport {
    async fn connect(&self, address: &EndpointAddress, timeout: Duration) -> Result<Box<dyn Connection>> {
        let sender = self.listeners.lock().get(address.uri()).cloned().ok_or_else(|| {
            CoreError::new(
                codes::TRANSPORT_CONNECT,
                format!("no in-memory listener at {address}"),
            )
        })?;

        let (local, remote) = tokio::io::duplex(self.capacity);
        match tokio::time::timeout(timeout, sender.send(remote)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(CoreError::new(
                    codes::TRANSPORT_CONNECT,
                    format!("in-memory listener at {address} has stopped"),
                ));
            }
            Err(_) => return Err(timeout_error(error::CONNECT, timeout)),
        }
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StreamConnection::new(local, address.uri())))
    }
}

#[async_trait]
impl ConnectionTransport for MemoryTransport {
    fn scheme(&self) -> &str {
        MEMORY_SCHEME
    }

    fn pool_key(&self, address: &EndpointAddress, via: Option<&EndpointAddress>) -> Result<PoolKey> {
        Ok(PoolKey::memory(address, via))
    }

    async fn listen(&self, address: &EndpointAddress) -> Result<Box<dyn ConnectionAcceptor>> {
        let (sender, receiver) = mpsc::channel(BACKLOG);
        {
            let mut listeners = self.listeners.lock();
            if listeners.get(address.uri()).is_some_and(|existing| !existing.is_closed()) {
                return Err(CoreError::new(
                    codes::TRANSPORT_BIND,
                    format!("an in-memory listener is already registered at {address}"),
                ));
            }
            listeners.insert(address.uri().to_owned(), sender.clone());
        }
        tracing::debug!(transport.address = %address, "in-memory listener registered");
        Ok(Box::new(MemoryAcceptor {
            address: address.clone(),
            incoming: AsyncMutex::new(receiver),
            listeners: Arc::clone(&self.listeners),
            registration: sender,
            accepted: AtomicUsize::new(0),
        }))
    }
}

#[derive(Debug)]
struct MemoryAcceptor {
    address: EndpointAddress,
    incoming: AsyncMutex<mpsc::Receiver<DuplexStream>>,
    listeners: Registrations,
    registration: mpsc::Sender<DuplexStream>,
    accepted: AtomicUsize,
}

#[async_trait]
impl ConnectionAcceptor for MemoryAcceptor {
    fn local_address(&self) -> &EndpointAddress {
        &self.address
    }

    async fn accept(&self, timeout: Duration) -> Result<Box<dyn Connection>> {
        let mut incoming = self.incoming.lock().await;
        let stream = match tokio::time::timeout(timeout, incoming.recv()).await {
            Ok(Some(stream)) => stream,
            Ok(None) => {
                return Err(CoreError::new(
                    codes::TRANSPORT_ACCEPT,
                    format!("in-memory listener at {} has stopped", self.address),
                ));
            }
            Err(_) => return Err(timeout_error(error::ACCEPT, timeout)),
        };
        let sequence = self.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(StreamConnection::new(
            stream,
            format!("{}#{sequence}", self.address),
        )))
    }

    fn close(&self) {
        self.unregister();
        if let Ok(mut incoming) = self.incoming.try_lock() {
            incoming.close();
        }
    }
}

impl MemoryAcceptor {
    /// 只移除自己的登记，同一地址上更新的登记保持不变。
    fn unregister(&self) {
        let mut listeners = self.listeners.lock();
        if listeners
            .get(self.address.uri())
            .is_some_and(|sender| sender.same_channel(&self.registration))
        {
            listeners.remove(self.address.uri());
        }
    }
}

impl Drop for MemoryAcceptor {
    fn drop(&mut self) {
        self.unregister();
    }
}
