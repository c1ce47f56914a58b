//! 消息编码器接缝。
//!
//! # 教案式说明
//! - **意图（Why）**：通道层不定义线格式，只要求编码器把 [`Message`] 写入租借的缓冲并能从
//!   一帧字节恢复消息；编码器经绑定参数向下传递给传输元素。
//! - **逻辑（How）**：[`BinaryMessageEncoder`] 使用最小的长度前缀格式：
//!   - `u16` 大端 action 长度 + action；
//!   - `u16` 大端 message id 长度 + id，`0xFFFF` 表示无 id；
//!   - 其余字节为消息体。
//!   写入经过 [`SizeBoundedWriter`]，越界的那一次写入即失败；初始缓冲尺寸取自
//!   [`AdaptiveSizeHistory`]。
//! - **契约（What）**：
//!   - 写入超过 `max_size` 返回 [`codes::QUOTA_SENT_TOO_LARGE`]；
//!   - 读取超过 `max_size` 的帧返回 [`codes::QUOTA_RECEIVED_TOO_LARGE`]；
//!   - 帧结构不完整返回 [`codes::ENCODING_MALFORMED`]。

use std::{
    fmt,
    io::Write,
    sync::Arc,
};

use bytes::{Buf, BufMut, Bytes};
use strata_buffer::{
    AdaptiveSizeHistory, BufferManager, PooledBuffer, SizeBoundedWriter, received_too_large,
};
use strata_core::{CoreError, Result, codes};

use crate::Message;

const NO_MESSAGE_ID: u16 = u16::MAX;

/// 消息编码器契约。
pub trait MessageEncoder: Send + Sync + fmt::Debug {
    fn content_type(&self) -> &str;

    /// 把消息写入从 `buffers` 租借的缓冲。
    fn write_message(
        &self,
        message: &Message,
        buffers: &BufferManager,
        max_size: usize,
    ) -> Result<PooledBuffer>;

    /// 从一帧字节恢复消息。
    fn read_message(&self, frame: Bytes, max_size: usize) -> Result<Message>;
}

/// 绑定参数中携带的编码器。
#[derive(Clone, Debug)]
pub struct EncoderParameter {
    encoder: Arc<dyn MessageEncoder>,
}

impl EncoderParameter {
    pub fn new(encoder: Arc<dyn MessageEncoder>) -> Self {
        Self { encoder }
    }

    pub fn encoder(&self) -> Arc<dyn MessageEncoder> {
        Arc::clone(&self.encoder)
    }
}

/// 长度前缀二进制编码器。
#[derive(Debug, Default)]
pub struct BinaryMessageEncoder {
    history: AdaptiveSizeHistory,
}

impl BinaryMessageEncoder {
    pub const CONTENT_TYPE: &'static str = "application/x-strata-binary";

    pub fn new() -> Self {
        Self::default()
    }
}

fn malformed(reason: &str) -> CoreError {
    CoreError::new(
        codes::ENCODING_MALFORMED,
        format!("malformed binary message frame: {reason}"),
    )
}

fn length_prefix(field: &str, len: usize) -> Result<[u8; 2]> {
    match u16::try_from(len) {
        Ok(len) if len != NO_MESSAGE_ID => Ok(len.to_be_bytes()),
        _ => Err(malformed(&format!("{field} is {len} bytes long"))),
    }
}

fn take_str(frame: &mut Bytes, len: usize, field: &str) -> Result<String> {
    if frame.remaining() < len {
        return Err(malformed(&format!("{field} truncated")));
    }
    let raw = frame.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| malformed(&format!("{field} is not UTF-8")))
}

fn take_u16(frame: &mut Bytes, field: &str) -> Result<u16> {
    if frame.remaining() < 2 {
        return Err(malformed(&format!("{field} length truncated")));
    }
    Ok(frame.get_u16())
}

impl MessageEncoder for BinaryMessageEncoder {
    fn content_type(&self) -> &str {
        Self::CONTENT_TYPE
    }

    fn write_message(
        &self,
        message: &Message,
        buffers: &BufferManager,
        max_size: usize,
    ) -> Result<PooledBuffer> {
        let action = message.action().as_bytes();
        let action_len = length_prefix("action", action.len())?;
        let id_len = match message.message_id() {
            Some(id) => length_prefix("message id", id.len())?,
            None => NO_MESSAGE_ID.to_be_bytes(),
        };

        let mut buffer = buffers.take_buffer(self.history.initial_size(max_size))?;
        buffer.clear();
        {
            let mut writer = SizeBoundedWriter::new((&mut *buffer).writer(), max_size as u64);
            let mut write = |bytes: &[u8]| {
                writer
                    .write_all(bytes)
                    .map_err(|err| CoreError::from_io(err, codes::ENCODING_MALFORMED))
            };
            write(&action_len)?;
            write(action)?;
            write(&id_len)?;
            if let Some(id) = message.message_id() {
                write(id.as_bytes())?;
            }
            write(message.body())?;
        }
        self.history.record(buffer.len());
        Ok(buffer)
    }

    fn read_message(&self, mut frame: Bytes, max_size: usize) -> Result<Message> {
        if frame.len() > max_size {
            return Err(received_too_large(max_size as u64));
        }

        let action_len = take_u16(&mut frame, "action")?;
        let action = take_str(&mut frame, usize::from(action_len), "action")?;
        let id_len = take_u16(&mut frame, "message id")?;
        let message_id = match id_len {
            NO_MESSAGE_ID => None,
            len => Some(take_str(&mut frame, usize::from(len), "message id")?),
        };

        let message = Message::new(action, frame);
        Ok(match message_id {
            Some(id) => message.with_message_id(id),
            None => message,
        })
    }
}
