#![deny(unsafe_code)]

//! `strata-delivery` 负责把“到达的条目”交给“等待的读者”。
//!
//! # 模块定位（Why）
//! - 传输层在自己的读循环里产生消息，通道的使用者在别处调用 receive；两者之间需要一个
//!   既能缓存、又能直接把条目交给已在等待的读者的队列。
//! - 可靠会话需要按序号交付，队列之上再叠加投递策略；反复失败的消息交给毒消息处理器裁决。
//!
//! # 设计概要（How）
//! - [`InputQueue`]：读者/等待者/条目三方会合，支持同步与异步两种读者、超时竞争与故障终态；
//! - [`DeliveryStrategy`]：[`UnorderedDeliveryStrategy`] 直接入队，[`OrderedDeliveryStrategy`]
//!   以窗口起点为准缓存乱序条目；
//! - [`PoisonMessageHandler`]：按消息查找 ID 计数，超过重试上限后执行最终处置。

mod input_queue;
mod poison;
mod strategy;

pub use input_queue::{DequeueOutcome, DequeuedCallback, FaultFactory, InputQueue, ItemDisposer};
pub use poison::{
    FinalDisposition, LifecycleDisposition, PoisonMessageHandler, PoisonMessageProperty,
    PoisonVerdict, TRACKED_MESSAGE_CAPACITY,
};
pub use strategy::{DeliveryStrategy, OrderedDeliveryStrategy, UnorderedDeliveryStrategy};
