//! 日志订阅器的一次性安装入口。
//!
//! # 教案式说明
//! - **意图（Why）**：各 crate 只通过 `tracing` 宏输出结构化事件，是否输出、输出到哪里由宿主决定；
//!   宿主只需在进程启动时调用一次 [`install_tracing`]。
//! - **逻辑（How）**：以 `OnceLock` 记录安装状态，并在安装前检查全局 dispatcher 是否已被其他组件设置；
//!   订阅器由 `EnvFilter` 与 `fmt` 层组合而成。
//! - **契约（What）**：重复调用返回 [`ObservabilityError::AlreadyInstalled`]；过滤指令非法时不安装任何订阅器。

use std::sync::OnceLock;

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

static INSTALL_STATE: OnceLock<String> = OnceLock::new();

/// 安装失败的原因。
#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    #[error("strata tracing subscriber has already been installed")]
    AlreadyInstalled,
    #[error("another global tracing subscriber is already set")]
    SubscriberAlreadySet,
    #[error("invalid filter directive `{directive}`: {reason}")]
    InvalidDirective { directive: String, reason: String },
}

/// 安装全局 `tracing` 订阅器。
///
/// `directive` 遵循 `EnvFilter` 语法，例如 `"strata_transport=debug,info"`；
/// 环境变量 `RUST_LOG` 存在时优先生效。
pub fn install_tracing(directive: &str) -> Result<(), ObservabilityError> {
    if INSTALL_STATE.get().is_some() {
        return Err(ObservabilityError::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(ObservabilityError::SubscriberAlreadySet);
    }

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directive).map_err(|err| {
            ObservabilityError::InvalidDirective {
                directive: directive.to_owned(),
                reason: err.to_string(),
            }
        })?,
    };

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|_| ObservabilityError::SubscriberAlreadySet)?;

    INSTALL_STATE
        .set(directive.to_owned())
        .map_err(|_| ObservabilityError::AlreadyInstalled)
}

/// 已安装时返回安装所用的过滤指令。
pub fn installed_directive() -> Option<&'static str> {
    INSTALL_STATE.get().map(String::as_str)
}
