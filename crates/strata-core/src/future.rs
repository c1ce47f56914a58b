use std::{future::Future, pin::Pin};

/// `BoxFuture` 是各层对象安全异步接口统一使用的 Future 包装。
///
/// # 契约说明（What）
/// - 约束 Future 为 `Send + 'a`，可在 tokio 多线程运行时上跨线程调度；
/// - 操作链的每一步、传输回调都以该别名表达，避免在 trait 对象里暴露具体 Future 类型。
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
