use std::{borrow::Cow, future::Future, io, time::Duration};

use strata_core::{CoreError, ErrorCategory, Result, TimeoutBudget, codes};

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: codes::TRANSPORT_CONNECT,
    message: "connect",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: codes::TRANSPORT_ACCEPT,
    message: "accept",
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: codes::TRANSPORT_BIND,
    message: "bind",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: codes::TRANSPORT_READ,
    message: "read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: codes::TRANSPORT_WRITE,
    message: "write",
};
pub(crate) const CLOSE: OperationKind = OperationKind {
    code: codes::TRANSPORT_CLOSE,
    message: "close",
};

/// 将 IO 错误映射为框架级 CoreError，并附带错误分类。
///
/// 内部错误本身就是 [`CoreError`]（例如尺寸守卫产生的配额错误）时原样取回。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> CoreError {
    if error
        .get_ref()
        .is_some_and(|inner| inner.downcast_ref::<CoreError>().is_some())
    {
        return CoreError::from_io(error, kind.code);
    }
    let category = categorize_io_error(&error);
    CoreError::new(
        kind.code,
        Cow::Owned(format!("{}: {}", kind.message, error)),
    )
    .with_category(category)
    .with_cause(error)
}

/// 构造超时错误。
pub(crate) fn timeout_error(kind: OperationKind, budget: Duration) -> CoreError {
    CoreError::timeout(kind.message, budget)
}

/// 构造“连接已中止”错误。
pub(crate) fn aborted_error(identity: &str) -> CoreError {
    CoreError::new(
        codes::TRANSPORT_ABORTED,
        format!("the connection to {identity} has been closed or aborted"),
    )
}

/// 构造“传输不支持该操作”错误。
pub(crate) fn unsupported_error(operation: &str) -> CoreError {
    CoreError::new(
        codes::TRANSPORT_UNSUPPORTED,
        format!("{operation} is not supported by this transport"),
    )
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => ErrorCategory::Retryable,
        ErrorKind::PermissionDenied | ErrorKind::Unsupported | ErrorKind::InvalidInput => {
            ErrorCategory::NonRetryable
        }
        _ => ErrorCategory::Transport,
    }
}

/// 在超时预算内执行 IO Future。
///
/// 无限预算（`Duration::MAX`）不设置计时器。
pub(crate) async fn run_with_timeout<F, T>(
    kind: OperationKind,
    timeout: Duration,
    future: F,
) -> Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    let budget = TimeoutBudget::new(timeout);
    match budget.deadline() {
        Some(deadline) => match tokio::time::timeout_at(deadline, future).await {
            Ok(result) => result.map_err(|err| map_io_error(kind, err)),
            Err(_) => Err(timeout_error(kind, timeout)),
        },
        None => future.await.map_err(|err| map_io_error(kind, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_operation_code() {
        let err = map_io_error(
            WRITE,
            io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"),
        );
        assert_eq!(err.code(), codes::TRANSPORT_WRITE);
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert!(err.message().starts_with("write:"));
    }

    #[test]
    fn embedded_core_error_is_recovered() {
        let quota = CoreError::new(codes::QUOTA_RECEIVED_TOO_LARGE, "too big");
        let err = map_io_error(READ, quota.into_io());
        assert_eq!(err.code(), codes::QUOTA_RECEIVED_TOO_LARGE);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_io_times_out() {
        let err = run_with_timeout(READ, Duration::from_millis(50), std::future::pending::<io::Result<()>>())
            .await
            .expect_err("挂起的 IO 应超时");
        assert!(err.is_timeout());
    }
}
