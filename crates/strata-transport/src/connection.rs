//! 连接接缝。
//!
//! # 教案式说明
//! - **意图（Why）**：连接池、输出通道与监听器只需要“按超时读写、关闭、中止”这组最小能力，
//!   与具体介质（TCP、进程内双工流）无关。以 trait 对象表达连接，池即可在同一张表里缓存
//!   不同介质的连接。
//! - **逻辑（How）**：
//!   - [`Connection`] 的方法都以 `&self` 调用，读写两半各自持锁，读循环与发送方可以并发；
//!   - [`StreamConnection`] 基于 `tokio::io::split` 把任意 `AsyncRead + AsyncWrite` 流拆成两半；
//!   - 中止通过 `watch` 信号广播：正在进行的读写立即返回“已中止”，空闲的两半被立刻丢弃。
//! - **契约（What）**：
//!   - `read` 返回 `Ok(0)` 表示对端已结束发送；
//!   - `abort` 幂等、同步、永不阻塞；
//!   - 关闭或中止之后的读写返回 [`codes::TRANSPORT_ABORTED`](strata_core::codes::TRANSPORT_ABORTED)。

use std::{fmt, time::Duration};

use async_trait::async_trait;
use strata_channel::EndpointAddress;
use strata_core::Result;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex as AsyncMutex, watch},
};

use crate::{
    PoolKey,
    error::{self, aborted_error, run_with_timeout, unsupported_error},
};

/// 面向连接的字节通道。
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// 对端身份（地址或管道名），用于日志与错误消息。
    fn remote_identity(&self) -> &str;

    /// 读取到 `buf`，返回读取的字节数；`0` 表示对端已结束发送。
    async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// 写出全部字节；`immediate` 为 `true` 时同时刷新。
    async fn write(&self, buf: &[u8], immediate: bool, timeout: Duration) -> Result<()>;

    /// 优雅关闭：刷新并关闭写方向，然后释放连接。
    async fn close(&self, timeout: Duration) -> Result<()>;

    /// 立即释放连接。
    fn abort(&self);

    /// 把连接移交给另一个进程并关闭本端句柄。
    async fn duplicate_and_close(&self, target_pid: u32, timeout: Duration) -> Result<()> {
        let _ = (target_pid, timeout);
        Err(unsupported_error("connection duplication"))
    }
}

/// 发起连接的一方。
#[async_trait]
pub trait ConnectionInitiator: Send + Sync + fmt::Debug {
    async fn connect(&self, address: &EndpointAddress, timeout: Duration) -> Result<Box<dyn Connection>>;
}

/// 接受连接的一方。
#[async_trait]
pub trait ConnectionAcceptor: Send + Sync + fmt::Debug {
    /// 实际监听的地址（端口为 0 时已替换为系统分配的端口）。
    fn local_address(&self) -> &EndpointAddress;

    async fn accept(&self, timeout: Duration) -> Result<Box<dyn Connection>>;

    /// 停止接受并立即释放监听地址；之后的 `accept` 失败。缺省什么也不做，地址随对象释放。
    fn close(&self) {}
}

/// 一种介质的完整传输能力：发起、监听与池键推导。
#[async_trait]
pub trait ConnectionTransport: ConnectionInitiator {
    /// 该介质处理的地址方案，例如 `tcp`、`mem`。
    fn scheme(&self) -> &str;

    /// 由目标地址与实际建连地址推导池键；`via` 缺省时使用 `address`。
    fn pool_key(&self, address: &EndpointAddress, via: Option<&EndpointAddress>) -> Result<PoolKey>;

    async fn listen(&self, address: &EndpointAddress) -> Result<Box<dyn ConnectionAcceptor>>;
}

/// 基于 tokio 异步流的连接。
pub struct StreamConnection<S> {
    identity: String,
    reader: AsyncMutex<Option<ReadHalf<S>>>,
    writer: AsyncMutex<Option<WriteHalf<S>>>,
    terminated: watch::Sender<bool>,
}

enum Raced<T> {
    Finished(Result<T>),
    Terminated,
}

async fn wait_terminated(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|terminated| *terminated).await;
}

impl<S> StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, identity: impl Into<String>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (terminated, _) = watch::channel(false);
        Self {
            identity: identity.into(),
            reader: AsyncMutex::new(Some(reader)),
            writer: AsyncMutex::new(Some(writer)),
            terminated,
        }
    }

    fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    fn terminate(&self) {
        self.terminated.send_replace(true);
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }
}

impl<S> fmt::Debug for StreamConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConnection")
            .field("remote", &self.identity)
            .field("terminated", &*self.terminated.borrow())
            .finish()
    }
}

#[async_trait]
impl<S> Connection for StreamConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn remote_identity(&self) -> &str {
        &self.identity
    }

    async fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut signal = self.terminated.subscribe();
        let mut guard = self.reader.lock().await;
        if self.is_terminated() {
            guard.take();
        }
        let Some(reader) = guard.as_mut() else {
            return Err(aborted_error(&self.identity));
        };

        let outcome = tokio::select! {
            biased;
            _ = wait_terminated(&mut signal) => Raced::Terminated,
            result = run_with_timeout(error::READ, timeout, reader.read(buf)) => Raced::Finished(result),
        };
        match outcome {
            Raced::Finished(result) => result,
            Raced::Terminated => {
                guard.take();
                Err(aborted_error(&self.identity))
            }
        }
    }

    async fn write(&self, buf: &[u8], immediate: bool, timeout: Duration) -> Result<()> {
        let mut signal = self.terminated.subscribe();
        let mut guard = self.writer.lock().await;
        if self.is_terminated() {
            guard.take();
        }
        let Some(writer) = guard.as_mut() else {
            return Err(aborted_error(&self.identity));
        };

        let operation = async {
            writer.write_all(buf).await?;
            if immediate {
                writer.flush().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let outcome = tokio::select! {
            biased;
            _ = wait_terminated(&mut signal) => Raced::Terminated,
            result = run_with_timeout(error::WRITE, timeout, operation) => Raced::Finished(result),
        };
        match outcome {
            Raced::Finished(result) => result,
            Raced::Terminated => {
                guard.take();
                Err(aborted_error(&self.identity))
            }
        }
    }

    async fn close(&self, timeout: Duration) -> Result<()> {
        let result = {
            let mut guard = self.writer.lock().await;
            match guard.as_mut() {
                Some(writer) if !self.is_terminated() => {
                    run_with_timeout(error::CLOSE, timeout, writer.shutdown()).await
                }
                _ => Ok(()),
            }
        };
        self.terminate();
        result
    }

    fn abort(&self) {
        if !self.is_terminated() {
            tracing::debug!(connection.remote = %self.identity, "connection aborted");
        }
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::codes;

    fn pair() -> (StreamConnection<tokio::io::DuplexStream>, StreamConnection<tokio::io::DuplexStream>) {
        let (left, right) = tokio::io::duplex(64);
        (
            StreamConnection::new(left, "left"),
            StreamConnection::new(right, "right"),
        )
    }

    #[tokio::test]
    async fn bytes_flow_and_close_signals_end_of_stream() {
        let (client, server) = pair();
        client
            .write(b"hello", true, Duration::from_secs(1))
            .await
            .expect("写入失败");
        let mut buf = [0_u8; 16];
        let read = server.read(&mut buf, Duration::from_secs(1)).await.expect("读取失败");
        assert_eq!(&buf[..read], b"hello");

        client.close(Duration::from_secs(1)).await.expect("关闭失败");
        let read = server.read(&mut buf, Duration::from_secs(1)).await.expect("读取失败");
        assert_eq!(read, 0, "对端关闭后应读到流结束");
    }

    #[tokio::test]
    async fn abort_interrupts_pending_read() {
        let (client, _server) = pair();
        let client = std::sync::Arc::new(client);
        let reader = {
            let client = client.clone();
            tokio::spawn(async move {
                let mut buf = [0_u8; 8];
                client.read(&mut buf, Duration::from_secs(30)).await
            })
        };
        tokio::task::yield_now().await;
        client.abort();

        let err = reader
            .await
            .expect("读任务 panic")
            .expect_err("中止后读取应失败");
        assert_eq!(err.code(), codes::TRANSPORT_ABORTED);
        let err = client
            .write(b"x", true, Duration::from_secs(1))
            .await
            .expect_err("中止后写入应失败");
        assert_eq!(err.code(), codes::TRANSPORT_ABORTED);
    }

    #[tokio::test]
    async fn duplication_is_unsupported_by_default() {
        let (client, _server) = pair();
        let err = client
            .duplicate_and_close(42, Duration::from_secs(1))
            .await
            .expect_err("流连接不支持移交");
        assert_eq!(err.code(), codes::TRANSPORT_UNSUPPORTED);
    }
}
