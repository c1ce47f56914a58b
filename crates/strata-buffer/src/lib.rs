#![deny(unsafe_code)]

//! `strata-buffer` 提供通道层的缓冲来源与字节流尺寸守卫。
//!
//! # 模块定位（Why）
//! - 编码器与传输层在每条消息上都需要临时缓冲；若每次都向分配器申请，高吞吐时会产生大量
//!   大小相近的短命分配。[`BufferManager`] 按 2 的幂分级缓存这些缓冲。
//! - 消息尺寸配额必须在字节流层面强制执行，而不是读完整条消息后再检查，
//!   [`SizeBoundedReader`]/[`SizeBoundedWriter`] 在越界的那一次读写上立即失败。
//!
//! # 设计概要（How）
//! - `pooled_buffer` 实现 [`PooledBuffer`]：租借期间可当作 `BytesMut` 使用，`Drop` 时归还管理器；
//! - `manager` 实现分级缓存与统计；
//! - `bounded` 实现同步 `Read`/`Write` 与 tokio `AsyncRead`/`AsyncWrite` 两套守卫；
//! - `sizing` 记录最近几次消息尺寸，为下一次写缓冲给出初始容量建议。

mod bounded;
mod manager;
mod pooled_buffer;
mod sizing;

pub use bounded::{SizeBoundedReader, SizeBoundedWriter, received_too_large, sent_too_large};
pub use manager::{BufferManager, BufferPoolStats};
pub use pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};
pub use sizing::AdaptiveSizeHistory;
