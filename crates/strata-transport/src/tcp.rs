//! TCP 传输。
//!
//! # 教案式说明
//! - **意图（Why）**：在 Tokio 套接字之上提供“建连 → 读写 → 关闭”的最小能力，其余语义（分帧、
//!   连接池、通道生命周期）全部复用与介质无关的实现。
//! - **逻辑（How）**：
//!   - 建连与接受都经过统一的超时包装，超时与 IO 错误映射为带稳定错误码的 [`CoreError`]；
//!   - 建连后关闭 Nagle 算法，帧头与负载分两次写出时不会被延迟；
//!   - 监听端口为 `0` 时由系统分配，[`ConnectionAcceptor::local_address`] 返回带实际端口的地址。
//! - **契约（What）**：
//!   - 地址缺省端口为 [`DEFAULT_PORT`]；
//!   - 池键为规范化后的 `host:port`，`via` 优先。

use std::time::Duration;

use async_trait::async_trait;
use strata_channel::EndpointAddress;
use strata_core::Result;
use tokio::net::{TcpListener, TcpStream};

use crate::{
    Connection, ConnectionAcceptor, ConnectionInitiator, ConnectionTransport, PoolKey,
    StreamConnection,
    error::{self, map_io_error, run_with_timeout},
};

pub const TCP_SCHEME: &str = "tcp";
pub const DEFAULT_PORT: u16 = 808;

/// TCP 传输。
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionInitiator for TcpTransport {
    async fn connect(&self, address: &EndpointAddress, timeout: Duration) -> Result<Box<dyn Connection>> {
        let authority = address.authority(DEFAULT_PORT);
        let stream = run_with_timeout(error::CONNECT, timeout, TcpStream::connect(authority.as_str())).await?;
        stream
            .set_nodelay(true)
            .map_err(|err| map_io_error(error::CONNECT, err))?;
        let peer = stream
            .peer_addr()
            .map_or(authority, |peer| peer.to_string());
        tracing::debug!(transport.peer = %peer, "tcp connection established");
        Ok(Box::new(StreamConnection::new(stream, peer)))
    }
}

#[async_trait]
impl ConnectionTransport for TcpTransport {
    fn scheme(&self) -> &str {
        TCP_SCHEME
    }

    fn pool_key(&self, address: &EndpointAddress, via: Option<&EndpointAddress>) -> Result<PoolKey> {
        Ok(PoolKey::tcp(address, via, DEFAULT_PORT))
    }

    async fn listen(&self, address: &EndpointAddress) -> Result<Box<dyn ConnectionAcceptor>> {
        let listener = TcpListener::bind(address.authority(DEFAULT_PORT).as_str())
            .await
            .map_err(|err| map_io_error(error::BIND, err))?;
        let local = listener
            .local_addr()
            .map_err(|err| map_io_error(error::BIND, err))?;
        let local_address =
            EndpointAddress::parse(&format!("{}://{local}{}", address.scheme(), address.path()))?;
        tracing::debug!(transport.address = %local_address, "tcp listener bound");
        Ok(Box::new(TcpAcceptor {
            inner: listener,
            local_address,
        }))
    }
}

#[derive(Debug)]
struct TcpAcceptor {
    inner: TcpListener,
    local_address: EndpointAddress,
}

#[async_trait]
impl ConnectionAcceptor for TcpAcceptor {
    fn local_address(&self) -> &EndpointAddress {
        &self.local_address
    }

    async fn accept(&self, timeout: Duration) -> Result<Box<dyn Connection>> {
        let (stream, remote) = run_with_timeout(error::ACCEPT, timeout, self.inner.accept()).await?;
        stream
            .set_nodelay(true)
            .map_err(|err| map_io_error(error::ACCEPT, err))?;
        Ok(Box::new(StreamConnection::new(stream, remote.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_uses_default_port_and_prefers_via() {
        let transport = TcpTransport::new();
        let address = EndpointAddress::parse("tcp://Orders.Example/svc").expect("地址应合法");
        let via = EndpointAddress::parse("tcp://router:9000/").expect("地址应合法");
        assert_eq!(
            transport.pool_key(&address, None).expect("池键"),
            PoolKey::Tcp("orders.example:808".into())
        );
        assert_eq!(
            transport.pool_key(&address, Some(&via)).expect("池键"),
            PoolKey::Tcp("router:9000".into())
        );
    }

    #[tokio::test]
    async fn listener_reports_the_assigned_port() {
        let transport = TcpTransport::new();
        let requested = EndpointAddress::parse("tcp://127.0.0.1:0/inbox").expect("地址应合法");
        let acceptor = transport.listen(&requested).await.expect("绑定失败");
        let local = acceptor.local_address();
        assert_ne!(local.port(), Some(0));
        assert_eq!(local.path(), "/inbox");
    }
}
