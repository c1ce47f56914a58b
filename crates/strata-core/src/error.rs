use std::{borrow::Cow, error::Error, fmt, io, sync::Arc, time::Duration};

/// `CoreError` 是通道层各 crate 共享的稳定错误域。
///
/// # 设计背景（Why）
/// - 缓冲、投递、组合与传输层产生的故障需要合流为统一错误码，调用方才能区分
///   “配额超限”“超时”“对象已释放”等处置方式截然不同的情形。
/// - 输入队列要把同一个故障反复交付给所有后续读者，因此错误必须可克隆；底层原因
///   以 `Arc` 共享，克隆代价与引用计数相当。
///
/// # 契约说明（What）
/// - `code`：稳定字符串，遵循 [`codes`] 中 `strata.<领域>.<语义>` 约定；
/// - `message`：面向排障人员的描述；
/// - `cause`：可选底层原因，经 [`Error::source`] 暴露；
/// - `category`：显式分类优先，否则按错误码前缀推导，见 [`category`](Self::category)。
///
/// # 设计取舍（Trade-offs）
/// - 不区分“领域错误/实现错误”两层封装，通道层的调用方只需要错误码 + 分类即可决策。
#[derive(Clone, Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

/// `ErrorCause` 封装底层原因，保持 `Send + Sync` 以便跨线程传递与共享克隆。
pub type ErrorCause = Arc<dyn Error + Send + Sync + 'static>;

impl CoreError {
    /// 构造核心错误。
    ///
    /// # 契约定义（What）
    /// - `code` 应取自 [`codes`]，或遵循相同命名约定的自定义码值；
    /// - 返回的错误不含底层原因，调用方可通过 [`with_cause`](Self::with_cause) 追加。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附带底层原因并返回新的核心错误。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// 为现有错误设置底层原因。
    pub fn set_cause(&mut self, cause: impl Error + Send + Sync + 'static) {
        self.cause = Some(Arc::new(cause));
    }

    /// 显式标记分类，覆盖按错误码推导的默认值。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// 获取结构化错误分类。
    ///
    /// # 执行逻辑（How）
    /// 1. 优先返回显式设置的分类；
    /// 2. 否则按错误码前缀查表（`strata.timeout.*` → `Timeout` 等）；
    /// 3. 查表失败时回退为 [`ErrorCategory::NonRetryable`]。
    pub fn category(&self) -> ErrorCategory {
        self.category
            .or_else(|| codes::default_category(self.code))
            .unwrap_or(ErrorCategory::NonRetryable)
    }

    /// 获取稳定错误码。
    pub fn code(&self) -> &'static str {
        self.code
    }

    /// 获取描述。
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 获取底层原因。
    pub fn cause(&self) -> Option<&ErrorCause> {
        self.cause.as_ref()
    }

    /// 是否为超时类错误。
    pub fn is_timeout(&self) -> bool {
        self.category() == ErrorCategory::Timeout
    }

    /// 构造“操作在预算内未完成”的超时错误。
    ///
    /// 消息中同时记录操作名与原始预算，便于定位是哪一步耗尽了时间。
    pub fn timeout(operation: &str, budget: Duration) -> Self {
        Self::new(
            codes::TIMEOUT_OPERATION,
            format!("{operation} did not complete within {budget:?}"),
        )
    }

    /// 构造“对象处于错误状态”的错误。
    pub fn invalid_state(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(codes::LIFECYCLE_INVALID_STATE, message)
    }

    /// 构造“对象已关闭或已释放”的错误。
    pub fn disposed(label: &str) -> Self {
        Self::new(
            codes::LIFECYCLE_DISPOSED,
            format!("{label} has been closed or aborted"),
        )
    }

    /// 构造“对象已进入故障态”的错误。
    pub fn faulted(label: &str) -> Self {
        Self::new(
            codes::LIFECYCLE_FAULTED,
            format!("{label} is in the faulted state"),
        )
    }

    /// 将核心错误包装为 `io::Error`，用于 `Read`/`Write` 等只能返回 I/O 错误的接口。
    ///
    /// # 契约说明（What）
    /// - `ErrorKind` 按分类映射：超时 → `TimedOut`，配额超限 → `InvalidData`，其余 → `Other`；
    /// - 原错误作为 `io::Error` 的内部错误保存，可经 [`from_io`](Self::from_io) 无损取回。
    pub fn into_io(self) -> io::Error {
        let kind = match self.category() {
            ErrorCategory::Timeout => io::ErrorKind::TimedOut,
            ErrorCategory::QuotaExceeded(_) => io::ErrorKind::InvalidData,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// 从 `io::Error` 中恢复核心错误。
    ///
    /// # 执行逻辑（How）
    /// - 若内部错误本身就是 `CoreError`（例如来自尺寸守卫），直接克隆返回，保留原错误码；
    /// - 否则按 `ErrorKind` 归入 `fallback_code`，并把原 I/O 错误挂为底层原因；超时类 I/O 错误
    ///   一律归入 [`codes::TIMEOUT_OPERATION`]。
    pub fn from_io(err: io::Error, fallback_code: &'static str) -> Self {
        if let Some(core) = err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<CoreError>())
        {
            return core.clone();
        }
        let code = match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => codes::TIMEOUT_OPERATION,
            _ => fallback_code,
        };
        CoreError::new(code, err.to_string()).with_cause(err)
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|shared| shared.as_ref() as &(dyn Error + 'static))
    }
}

/// 配额超限的方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuotaDirection {
    /// 接收方向：读取的字节数超过上限。
    Received,
    /// 发送方向：写出的字节数超过上限。
    Sent,
}

/// 错误分类枚举，决定调用方的处置方式。
///
/// # 契约说明（What）
/// - `Configuration`：组合/配置错误，重试无意义，需修正绑定或配置；
/// - `QuotaExceeded`：消息尺寸超过配额，方向由 [`QuotaDirection`] 指明；
/// - `Timeout`：操作在预算内未完成；
/// - `Transport`：底层连接 I/O 失败；
/// - `Faulted` / `ObjectDisposed` / `InvalidState`：生命周期状态不允许该操作；
/// - `Retryable` / `NonRetryable`：其余错误的通用兜底。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCategory {
    Configuration,
    QuotaExceeded(QuotaDirection),
    Timeout,
    Transport,
    Faulted,
    ObjectDisposed,
    InvalidState,
    Retryable,
    NonRetryable,
}

/// 稳定错误码集合。
///
/// 错误码遵循 `strata.<领域>.<语义>` 命名，领域前缀同时决定默认分类。
pub mod codes {
    use super::{ErrorCategory, QuotaDirection};

    /// 操作超时。
    pub const TIMEOUT_OPERATION: &str = "strata.timeout.operation";
    /// 出队等待超时。
    pub const TIMEOUT_DEQUEUE: &str = "strata.timeout.dequeue";

    /// 对象状态不允许该操作（例如未打开即发送）。
    pub const LIFECYCLE_INVALID_STATE: &str = "strata.lifecycle.invalid_state";
    /// 对象已关闭或中止。
    pub const LIFECYCLE_DISPOSED: &str = "strata.lifecycle.disposed";
    /// 对象处于故障态。
    pub const LIFECYCLE_FAULTED: &str = "strata.lifecycle.faulted";

    /// 缓冲尺寸非法。
    pub const BUFFER_INVALID_SIZE: &str = "strata.buffer.invalid_size";

    /// 接收的消息超过配额。
    pub const QUOTA_RECEIVED_TOO_LARGE: &str = "strata.quota.received_too_large";
    /// 发送的消息超过配额。
    pub const QUOTA_SENT_TOO_LARGE: &str = "strata.quota.sent_too_large";

    /// 绑定中不存在能够构建所需通道形状的元素。
    pub const BINDING_NO_CHANNEL_BUILDER: &str = "strata.binding.no_channel_builder";
    /// 构建结束后仍有未消费的绑定元素。
    pub const BINDING_UNCONSUMED_ELEMENTS: &str = "strata.binding.unconsumed_elements";
    /// 绑定元素不支持请求的通道形状。
    pub const BINDING_UNSUPPORTED_SHAPE: &str = "strata.binding.unsupported_shape";
    /// 绑定参数缺失。
    pub const BINDING_MISSING_PARAMETER: &str = "strata.binding.missing_parameter";

    /// 配置值非法。
    pub const CONFIG_INVALID: &str = "strata.config.invalid";

    /// 建立连接失败。
    pub const TRANSPORT_CONNECT: &str = "strata.transport.connect";
    /// 接受连接失败。
    pub const TRANSPORT_ACCEPT: &str = "strata.transport.accept";
    /// 监听地址绑定失败。
    pub const TRANSPORT_BIND: &str = "strata.transport.bind";
    /// 读取失败。
    pub const TRANSPORT_READ: &str = "strata.transport.read";
    /// 写入失败。
    pub const TRANSPORT_WRITE: &str = "strata.transport.write";
    /// 关闭失败。
    pub const TRANSPORT_CLOSE: &str = "strata.transport.close";
    /// 连接已被中止。
    pub const TRANSPORT_ABORTED: &str = "strata.transport.aborted";
    /// 传输不支持该操作。
    pub const TRANSPORT_UNSUPPORTED: &str = "strata.transport.unsupported";
    /// 地址无法解析。
    pub const TRANSPORT_ADDRESS: &str = "strata.transport.address";

    /// 编码内容格式错误。
    pub const ENCODING_MALFORMED: &str = "strata.encoding.malformed";

    /// 毒消息被故障处置。
    pub const POISON_MESSAGE: &str = "strata.poison.message";

    /// 按错误码前缀推导默认分类。
    pub(crate) fn default_category(code: &str) -> Option<ErrorCategory> {
        let category = match code {
            QUOTA_RECEIVED_TOO_LARGE => ErrorCategory::QuotaExceeded(QuotaDirection::Received),
            QUOTA_SENT_TOO_LARGE => ErrorCategory::QuotaExceeded(QuotaDirection::Sent),
            LIFECYCLE_INVALID_STATE => ErrorCategory::InvalidState,
            LIFECYCLE_DISPOSED => ErrorCategory::ObjectDisposed,
            LIFECYCLE_FAULTED | POISON_MESSAGE => ErrorCategory::Faulted,
            TRANSPORT_ABORTED => ErrorCategory::ObjectDisposed,
            TRANSPORT_UNSUPPORTED | TRANSPORT_ADDRESS => ErrorCategory::Configuration,
            _ if code.starts_with("strata.timeout.") => ErrorCategory::Timeout,
            _ if code.starts_with("strata.binding.") || code.starts_with("strata.config.") => {
                ErrorCategory::Configuration
            }
            BUFFER_INVALID_SIZE => ErrorCategory::Configuration,
            _ if code.starts_with("strata.transport.") => ErrorCategory::Transport,
            _ => return None,
        };
        Some(category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_falls_back_to_code_prefix() {
        let err = CoreError::new(codes::QUOTA_RECEIVED_TOO_LARGE, "too big");
        assert_eq!(
            err.category(),
            ErrorCategory::QuotaExceeded(QuotaDirection::Received)
        );
        assert_eq!(
            CoreError::new(codes::TIMEOUT_DEQUEUE, "slow").category(),
            ErrorCategory::Timeout
        );
        assert_eq!(
            CoreError::new(codes::BINDING_NO_CHANNEL_BUILDER, "x").category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            CoreError::new(codes::TRANSPORT_READ, "x").category(),
            ErrorCategory::Transport
        );
        assert_eq!(
            CoreError::new("app.custom", "x").category(),
            ErrorCategory::NonRetryable
        );
    }

    #[test]
    fn explicit_category_wins() {
        let err = CoreError::new(codes::TRANSPORT_READ, "reset").with_category(ErrorCategory::Retryable);
        assert_eq!(err.category(), ErrorCategory::Retryable);
    }

    #[test]
    fn io_round_trip_preserves_core_error() {
        let original = CoreError::new(codes::QUOTA_SENT_TOO_LARGE, "limit 16");
        let io_err = original.into_io();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        let recovered = CoreError::from_io(io_err, codes::TRANSPORT_WRITE);
        assert_eq!(recovered.code(), codes::QUOTA_SENT_TOO_LARGE);
        assert_eq!(recovered.message(), "limit 16");
    }

    #[test]
    fn plain_io_error_maps_to_fallback_with_cause() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "peer reset");
        let err = CoreError::from_io(io_err, codes::TRANSPORT_READ);
        assert_eq!(err.code(), codes::TRANSPORT_READ);
        assert!(err.source().is_some(), "底层 I/O 错误应挂为 cause");

        let timed_out = CoreError::from_io(
            io::Error::new(io::ErrorKind::TimedOut, "slow"),
            codes::TRANSPORT_READ,
        );
        assert!(timed_out.is_timeout());
    }

    #[test]
    fn display_contains_code_and_message() {
        let err = CoreError::timeout("open", Duration::from_secs(1));
        assert_eq!(err.to_string(), "[strata.timeout.operation] open did not complete within 1s");
    }
}
