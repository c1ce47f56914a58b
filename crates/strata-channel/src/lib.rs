#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! `strata-channel` 定义通道能力契约，并把绑定元素组合成通道工厂/监听器。
//!
//! # 模块定位（Why）
//! - 通道栈由若干绑定元素自上而下叠成，最底层是传输元素；每个元素只认识自己的下一层，
//!   构建时沿 [`BindingContext`] 逐层下探，属性查询同样逐层委托。
//! - 工厂与监听器需要跟踪自己产出的通道，使关闭/中止能级联到所有存活通道。
//!
//! # 设计概要（How）
//! - [`shape`]/[`address`]/[`message`]：通道形态、端点地址与消息模型；
//! - [`channel`]：[`Channel`]、[`ChannelFactory`]、[`ChannelListener`] 与收发能力 trait；
//! - [`binding`]：绑定元素、构建上下文、绑定参数与组合校验；
//! - [`encoder`]：消息编码器契约与内置二进制编码；
//! - [`manager`]/[`base`]：存活对象登记表与工厂公共部分；
//! - [`input_channel`]：以输入队列为接收端的通道，供传输层直接投递。

pub mod address;
pub mod base;
pub mod binding;
pub mod channel;
pub mod encoder;
pub mod input_channel;
pub mod manager;
pub mod message;
pub mod shape;

pub use address::EndpointAddress;
pub use base::{ChannelFactoryBase, ChannelManagerBase, ManagerLink};
pub use binding::{
    Binding, BindingContext, BindingElement, BindingError, BindingParameters,
    EncodingBindingElement, ListenUriSettings,
};
pub use channel::{Channel, ChannelFactory, ChannelListener, MessageSink, MessageSource};
pub use encoder::{BinaryMessageEncoder, EncoderParameter, MessageEncoder};
pub use input_channel::{InputQueueChannel, MessageFeeder};
pub use manager::{CommunicationObjectManager, ManagedHandle};
pub use message::{Message, MessageProperties};
pub use shape::ChannelShape;
