//! 日志订阅器安装契约。
//!
//! 全局 dispatcher 是进程级单例，因此本文件独立成一个测试二进制，且只包含一个用例。

use strata_core::{ObservabilityError, install_tracing, observability::installed_directive};

#[test]
fn install_is_one_shot() {
    install_tracing("strata_core=debug,info").expect("首次安装应成功");
    assert_eq!(installed_directive(), Some("strata_core=debug,info"));
    tracing::info!(target: "strata_core", "subscriber installed");

    match install_tracing("info") {
        Err(ObservabilityError::AlreadyInstalled) => {}
        other => panic!("重复安装应返回 AlreadyInstalled，实际为 {other:?}"),
    }
}
