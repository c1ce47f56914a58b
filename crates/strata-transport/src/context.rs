use std::{fmt, sync::Arc, time::Duration};

use strata_buffer::BufferManager;
use strata_core::{BufferSettings, DefaultScheduler, DispatchScheduler, Result};

use crate::ConnectionPoolRegistry;

/// 传输层共享的进程级资源。
///
/// # 教案式说明
/// - **意图（Why）**：连接池注册表、缓冲管理器与派发调度器需要在同一进程的多个绑定之间共享。
///   以显式对象承载它们，由应用创建并传给传输元素，测试因此可以各自持有互不干扰的实例。
/// - **契约（What）**：
///   - 克隆 `Arc<TransportContext>` 即共享同一组资源；
///   - [`shutdown`](Self::shutdown) 关闭注册表中的全部池，之后仍可继续使用（会创建新池）。
pub struct TransportContext {
    registry: ConnectionPoolRegistry,
    buffers: BufferManager,
    scheduler: Arc<dyn DispatchScheduler>,
}

impl TransportContext {
    pub fn new(buffer_settings: BufferSettings, scheduler: Arc<dyn DispatchScheduler>) -> Self {
        Self {
            registry: ConnectionPoolRegistry::new(),
            buffers: BufferManager::new(buffer_settings),
            scheduler,
        }
    }

    pub fn registry(&self) -> &ConnectionPoolRegistry {
        &self.registry
    }

    pub fn buffers(&self) -> &BufferManager {
        &self.buffers
    }

    pub fn scheduler(&self) -> Arc<dyn DispatchScheduler> {
        Arc::clone(&self.scheduler)
    }

    /// 在 `timeout` 内关闭全部连接池。
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        tracing::debug!(pools = self.registry.len(), "shutting down transport context");
        self.registry.close_all(timeout).await
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        Self::new(BufferSettings::default(), Arc::new(DefaultScheduler))
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("registry", &self.registry)
            .field("buffers", &self.buffers.statistics())
            .finish()
    }
}
