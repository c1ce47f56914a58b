//! 消息尺寸守卫。
//!
//! # 教案式说明
//! - **意图（Why）**：接收配额必须在读取过程中强制执行。若先读完整条消息再比较长度，
//!   恶意对端可以让进程先分配任意大的内存。
//! - **逻辑（How）**：
//!   - 读取时把单次读取长度截断到剩余配额；
//!   - 配额恰好用尽后，再向底层探测 1 字节：流已结束则正常返回 0，仍有数据则报告超限；
//!   - 写入时在转发前检查“已写 + 本次”是否超过上限。
//! - **契约（What）**：
//!   - 错误以 `io::Error` 形式返回，内部携带 [`CoreError`]；
//!   - 调用方可用 [`CoreError::from_io`] 取回原始错误码
//!     （[`codes::QUOTA_RECEIVED_TOO_LARGE`] / [`codes::QUOTA_SENT_TOO_LARGE`]）。

use std::{
    io::{self, Read, Write},
    pin::Pin,
    task::{Context, Poll, ready},
};

use strata_core::{CoreError, codes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 接收方向超限错误。
pub fn received_too_large(max: u64) -> CoreError {
    CoreError::new(
        codes::QUOTA_RECEIVED_TOO_LARGE,
        format!("the maximum received message size quota ({max} bytes) has been exceeded"),
    )
}

/// 发送方向超限错误。
pub fn sent_too_large(max: u64) -> CoreError {
    CoreError::new(
        codes::QUOTA_SENT_TOO_LARGE,
        format!("the maximum sent message size quota ({max} bytes) has been exceeded"),
    )
}

fn clamp(requested: usize, remaining: u64) -> usize {
    usize::try_from(remaining).map_or(requested, |remaining| requested.min(remaining))
}

/// 带接收配额的读取器。
#[derive(Debug)]
pub struct SizeBoundedReader<R> {
    inner: R,
    max: u64,
    consumed: u64,
}

impl<R> SizeBoundedReader<R> {
    pub fn new(inner: R, max: u64) -> Self {
        Self {
            inner,
            max,
            consumed: 0,
        }
    }

    /// 已读取的字节数，永不超过上限。
    pub fn bytes_read(&self) -> u64 {
        self.consumed
    }

    pub fn remaining(&self) -> u64 {
        self.max - self.consumed
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn exceeded(&self) -> io::Error {
        received_too_large(self.max).into_io()
    }
}

impl<R: Read> Read for SizeBoundedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let remaining = self.remaining();
        if remaining == 0 {
            let mut extra = [0u8; 1];
            return match self.inner.read(&mut extra)? {
                0 => Ok(0),
                _ => Err(self.exceeded()),
            };
        }

        let len = clamp(buf.len(), remaining);
        let read = self.inner.read(&mut buf[..len])?;
        self.consumed += read as u64;
        Ok(read)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for SizeBoundedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let remaining = this.remaining();
        if remaining == 0 {
            let mut extra = [0u8; 1];
            let mut extra_buf = ReadBuf::new(&mut extra);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut extra_buf))?;
            return if extra_buf.filled().is_empty() {
                Poll::Ready(Ok(()))
            } else {
                Poll::Ready(Err(this.exceeded()))
            };
        }

        let len = clamp(buf.remaining(), remaining);
        let read = {
            let window = buf.initialize_unfilled_to(len);
            let mut limited = ReadBuf::new(window);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut limited))?;
            limited.filled().len()
        };
        buf.advance(read);
        this.consumed += read as u64;
        Poll::Ready(Ok(()))
    }
}

/// 带发送配额的写入器。
#[derive(Debug)]
pub struct SizeBoundedWriter<W> {
    inner: W,
    max: u64,
    written: u64,
}

impl<W> SizeBoundedWriter<W> {
    pub fn new(inner: W, max: u64) -> Self {
        Self {
            inner,
            max,
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn check(&self, len: usize) -> io::Result<()> {
        if self.written.saturating_add(len as u64) > self.max {
            return Err(sent_too_large(self.max).into_io());
        }
        Ok(())
    }
}

impl<W: Write> Write for SizeBoundedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check(buf.len())?;
        let written = self.inner.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for SizeBoundedWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        this.check(buf.len())?;
        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.written += written as u64;
        Poll::Ready(Ok(written))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
