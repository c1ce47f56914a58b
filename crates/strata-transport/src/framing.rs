//! 长度前缀分帧。
//!
//! 每帧为 4 字节大端长度 + 负载。读取端先校验长度再租借缓冲，超过接收配额的帧不会分配内存。
//! 负载读满后复制为独立的 [`Bytes`]，租借的缓冲随即归还缓冲管理器，供下一帧复用。

use std::time::Duration;

use bytes::{BufMut, Bytes};
use strata_buffer::{BufferManager, received_too_large, sent_too_large};
use strata_core::{CoreError, Result, TimeoutBudget, codes};

use crate::Connection;

pub const FRAME_HEADER_LEN: usize = 4;

/// 写出一帧：头部不刷新，负载写完后刷新。
pub async fn write_frame(
    connection: &dyn Connection,
    payload: &[u8],
    max_size: usize,
    timeout: Duration,
) -> Result<()> {
    if payload.len() > max_size {
        return Err(sent_too_large(max_size as u64));
    }
    let len = u32::try_from(payload.len()).map_err(|_| sent_too_large(u64::from(u32::MAX)))?;
    let budget = TimeoutBudget::new(timeout);
    connection
        .write(&len.to_be_bytes(), false, budget.remaining())
        .await?;
    connection.write(payload, true, budget.remaining()).await
}

/// 从连接读取帧。
#[derive(Clone, Debug)]
pub struct FrameReader {
    buffers: BufferManager,
    max_size: usize,
}

impl FrameReader {
    pub fn new(buffers: BufferManager, max_size: usize) -> Self {
        Self { buffers, max_size }
    }

    /// 读取下一帧；对端在帧边界结束发送时返回 `None`。
    pub async fn read_frame(&self, connection: &dyn Connection, timeout: Duration) -> Result<Option<Bytes>> {
        let budget = TimeoutBudget::new(timeout);
        let mut header = [0_u8; FRAME_HEADER_LEN];
        let filled = read_exact(connection, &mut header, &budget).await?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < FRAME_HEADER_LEN {
            return Err(truncated(connection, "frame header"));
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_size {
            return Err(received_too_large(self.max_size as u64));
        }

        let mut buffer = self.buffers.take_buffer(len)?;
        buffer.clear();
        buffer.put_bytes(0, len);
        let filled = read_exact(connection, &mut buffer[..], &budget).await?;
        if filled < len {
            return Err(truncated(connection, "frame payload"));
        }
        let frame = Bytes::copy_from_slice(&buffer[..len]);
        self.buffers.return_buffer(buffer);
        Ok(Some(frame))
    }
}

/// 读满 `buf` 或遇到流结束，返回实际读取的字节数。
async fn read_exact(connection: &dyn Connection, buf: &mut [u8], budget: &TimeoutBudget) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let read = connection.read(&mut buf[filled..], budget.remaining()).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

fn truncated(connection: &dyn Connection, part: &str) -> CoreError {
    CoreError::new(
        codes::TRANSPORT_READ,
        format!("{} ended the stream inside a {part}", connection.remote_identity()),
    )
}
