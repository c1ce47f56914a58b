#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! `strata-transport` 提供面向连接的传输：连接抽象、TCP 与进程内介质、出站连接池与
//! 池注册表、管道名池键缓存、长度前缀分帧，以及把这些拼成通道工厂/监听器的传输绑定元素。
//!
//! # 模块定位（Why）
//! - 通道层只关心“发送一条消息/接收一条消息”，连接的建立、复用与回收由本 crate 负责；
//! - 介质差异被收敛到 [`ConnectionTransport`]：换一种介质只需实现建连、监听与池键三件事。
//!
//! # 设计概要（How）
//! - [`connection`]：[`Connection`] 契约与基于 `AsyncRead + AsyncWrite` 的 [`StreamConnection`]；
//! - [`tcp`]/[`memory`]：两种介质实现；
//! - [`pool`]/[`registry`]/[`pipe_key`]：连接池、按设置共享池的注册表与管道名缓存；
//! - [`framing`]：4 字节大端长度前缀帧；
//! - [`element`]/[`output`]/[`input`]：传输绑定元素及其产出的工厂、监听器与通道；
//! - [`context`]：由应用创建、在绑定间共享的进程级资源。
//!
//! # 错误约定（What）
//! - 所有 IO 错误映射为带 `strata.transport.*` 错误码的 [`CoreError`](strata_core::CoreError)；
//! - 超时统一映射为超时类错误，可通过 `is_timeout` 判断。

pub mod connection;
pub mod context;
pub mod element;
pub(crate) mod error;
pub mod framing;
pub mod input;
pub mod memory;
pub mod output;
pub mod pipe_key;
pub mod pool;
pub mod registry;
pub mod tcp;

pub use connection::{
    Connection, ConnectionAcceptor, ConnectionInitiator, ConnectionTransport, StreamConnection,
};
pub use context::TransportContext;
pub use element::ConnectionTransportElement;
pub use framing::{FRAME_HEADER_LEN, FrameReader, write_frame};
pub use input::ConnectionInputChannelListener;
pub use memory::{MEMORY_SCHEME, MemoryTransport};
pub use output::{ConnectionOutputChannel, ConnectionOutputChannelFactory};
pub use pipe_key::{PipeKeyCache, PipeNameResolver, PublishedPipes, pipe_name_candidates};
pub use pool::{ConnectionPool, PoolKey, PoolStatistics, PooledConnection};
pub use registry::ConnectionPoolRegistry;
pub use tcp::{DEFAULT_PORT, TCP_SCHEME, TcpTransport};
