//! 绑定元素组合协议。
//!
//! # 教案式说明
//! - **意图（Why）**：通道栈由若干绑定元素自上而下组成（例如编码元素 + 传输元素）。
//!   每个元素只了解自己的职责，构建时把“剩余元素”交给下一层，直到传输元素构建出最底层的工厂或监听器。
//! - **逻辑（How）**：
//!   - [`BindingContext`] 持有尚未消费的元素列表、绑定参数与监听地址；
//!   - `build_inner_*` 弹出下一个元素并让它构建，元素可以在调用 `build_inner_*` 前向参数中添加内容；
//!   - `can_build_inner_*` 在上下文的克隆上试探，不消费真实上下文；
//!   - 顶层构建完成后 [`BindingContext::validate_binding_elements_consumed`] 要求列表为空。
//! - **契约（What）**：
//!   - 元素列表耗尽时返回 [`codes::BINDING_NO_CHANNEL_BUILDER`](strata_core::codes::BINDING_NO_CHANNEL_BUILDER)；
//!   - 存在未消费元素时返回 [`codes::BINDING_UNCONSUMED_ELEMENTS`](strata_core::codes::BINDING_UNCONSUMED_ELEMENTS)，
//!     消息中以逗号列出元素名。

mod composite;
mod context;
mod element;
mod encoding;
mod error;

pub use composite::Binding;
pub use context::{BindingContext, ListenUriSettings};
pub use element::{BindingElement, BindingParameters};
pub use encoding::EncodingBindingElement;
pub use error::BindingError;
