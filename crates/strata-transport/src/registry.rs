use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use parking_lot::Mutex;
use strata_core::{PoolSettings, Result, for_each_concurrently};

use crate::ConnectionPool;

struct RegistryEntry {
    pool: Arc<ConnectionPool>,
    references: usize,
}

/// 连接池注册表：设置完全相同的使用者共享同一个池。
///
/// # 契约说明（What）
/// - [`lookup`](Self::lookup) 与 [`release`](Self::release) 成对调用，引用计数归零时池被关闭并移出注册表；
/// - 释放一个不在注册表中的池（例如已被 [`close_all`](Self::close_all) 清空）不做任何事；
/// - 池的关闭与中止都在注册表锁外执行。
#[derive(Default)]
pub struct ConnectionPoolRegistry {
    pools: Mutex<HashMap<PoolSettings, RegistryEntry>>,
}

impl ConnectionPoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得（必要时创建）与 `settings` 对应的池，并增加一次引用。
    pub fn lookup(&self, settings: &PoolSettings) -> Arc<ConnectionPool> {
        let mut pools = self.pools.lock();
        let entry = pools.entry(settings.clone()).or_insert_with(|| {
            tracing::debug!(pool.group = settings.group_name(), "connection pool created");
            RegistryEntry {
                pool: Arc::new(ConnectionPool::new(settings.clone())),
                references: 0,
            }
        });
        entry.references += 1;
        Arc::clone(&entry.pool)
    }

    /// 释放一次引用；最后一个使用者释放时在 `timeout` 内关闭池。
    pub async fn release(&self, pool: &Arc<ConnectionPool>, timeout: Duration) -> Result<()> {
        match self.release_reference(pool) {
            Some(last) => last.close(timeout).await,
            None => Ok(()),
        }
    }

    /// 释放一次引用；最后一个使用者释放时中止池。
    pub fn abort_release(&self, pool: &Arc<ConnectionPool>) {
        if let Some(last) = self.release_reference(pool) {
            last.abort();
        }
    }

    /// 关闭并移除全部池，返回第一个错误。
    pub async fn close_all(&self, timeout: Duration) -> Result<()> {
        let pools = self.drain();
        for_each_concurrently(
            pools,
            timeout,
            |pool, remaining| async move {
                let result = pool.close(remaining).await;
                (pool, result)
            },
            |pool| pool.abort(),
        )
        .await
    }

    pub fn abort_all(&self) {
        for pool in self.drain() {
            pool.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 指定设置对应池的当前引用数。
    pub fn references(&self, settings: &PoolSettings) -> usize {
        self.pools
            .lock()
            .get(settings)
            .map_or(0, |entry| entry.references)
    }

    fn release_reference(&self, pool: &Arc<ConnectionPool>) -> Option<Arc<ConnectionPool>> {
        let mut pools = self.pools.lock();
        let settings = pool.settings();
        let entry = pools.get_mut(settings)?;
        if !Arc::ptr_eq(&entry.pool, pool) {
            return None;
        }
        entry.references = entry.references.saturating_sub(1);
        if entry.references > 0 {
            return None;
        }
        tracing::debug!(pool.group = settings.group_name(), "last reference released, closing pool");
        pools.remove(settings).map(|entry| entry.pool)
    }

    fn drain(&self) -> Vec<Arc<ConnectionPool>> {
        self.pools
            .lock()
            .drain()
            .map(|(_, entry)| entry.pool)
            .collect()
    }
}

impl fmt::Debug for ConnectionPoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPoolRegistry")
            .field("pools", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_settings_share_one_pool() {
        let registry = ConnectionPoolRegistry::new();
        let settings = PoolSettings::default().with_group_name("orders");
        let first = registry.lookup(&settings);
        let second = registry.lookup(&settings);
        let other = registry.lookup(&settings.clone().with_max_outbound_connections_per_endpoint(1));

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(registry.references(&settings), 2);

        registry.release(&first, Duration::from_secs(1)).await.expect("释放失败");
        assert!(!second.is_closed(), "仍有引用时池不应关闭");
        registry.release(&second, Duration::from_secs(1)).await.expect("释放失败");
        assert!(second.is_closed());
        assert_eq!(registry.len(), 1);

        registry.abort_all();
        assert!(other.is_closed());
        assert!(registry.is_empty());
    }
}
