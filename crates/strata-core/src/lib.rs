#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! `strata-core` 汇集通道层各 crate 共享的基础契约。
//!
//! # 模块定位（Why）
//! - 缓冲、投递、通道组合与传输四层都需要统一的错误域、超时预算与生命周期状态机；
//!   若各层自行定义，将导致错误分类、超时语义在跨层时失真。
//! - 该 crate 只承载“契约 + 轻量实现”，不依赖任何具体传输或编码。
//!
//! # 设计概要（How）
//! - [`error`]：`CoreError` + 稳定错误码 + [`ErrorCategory`] 分类，`thiserror` 类型化错误通过 `From` 汇入；
//! - [`time`]：[`TimeoutBudget`] 描述单次逻辑操作的总体预算，并提供 [`with_deadline`] 截止执行；
//! - [`lifecycle`]：`Created → Opening → Opened → Closing → Closed` 状态机与 [`Lifecycle`] 辅助实现；
//! - [`chain`]：两段/多段共享预算的异步操作链，以及批量 open/close/abort；
//! - [`guard`]：进入/退出计数闸门，关闭时等待排空；
//! - [`config`]：`serde + toml` 原始配置记录与校验后的设置类型；
//! - [`observability`]：`tracing-subscriber` 一次性安装入口；
//! - [`properties`]：按类型查询的属性契约；
//! - [`scheduler`]：派发任务的调度抽象。

pub use async_trait::async_trait;

pub mod chain;
pub mod config;
pub mod error;
pub mod future;
pub mod guard;
pub mod lifecycle;
pub mod observability;
pub mod properties;
pub mod scheduler;
pub mod time;

pub use chain::{
    ChainedOperation, Step, abort_all, close_all, compose, for_each_concurrently, open_all, step,
};
pub use config::{
    BufferSettings, ChannelTimeouts, ConfigError, ConfigField, PoisonDisposition, PoolSettings,
    RawBufferSettings, RawChannelTimeouts, RawPoolSettings, RawRetrySettings, RawStrataConfig,
    ReceiveRetrySettings, RetryCount, StrataConfig,
};
pub use error::{CoreError, ErrorCategory, QuotaDirection, codes};
pub use future::BoxFuture;
pub use guard::{Guard, GuardTicket};
pub use observability::{ObservabilityError, install_tracing};
pub use lifecycle::{CommunicationObject, CommunicationState, Lifecycle, LifecycleHooks};
pub use properties::{PropertyBag, PropertySource, PropertySourceExt, PropertyValue};
pub use scheduler::{DefaultScheduler, DispatchScheduler, InlineScheduler, ScheduledTask};
pub use time::{TimeoutBudget, with_deadline};

/// 框架统一结果别名，默认错误类型为 [`CoreError`]。
pub type Result<T, E = CoreError> = core::result::Result<T, E>;
