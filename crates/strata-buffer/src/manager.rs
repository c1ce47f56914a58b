use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use bytes::BytesMut;
use parking_lot::Mutex;
use strata_core::{BufferSettings, CoreError, Result, codes};

use crate::pooled_buffer::{BufferRecycler, PooledBuffer, ReclaimedBuffer};

/// 最小尺寸级别。
const MIN_CLASS_SIZE: usize = 128;

/// `BufferManager` 按尺寸级别缓存可复用的缓冲。
///
/// # 模块角色（Why）
/// - 编码器与帧读取每条消息都要租借缓冲，长度集中在少数几个量级；按 2 的幂分级后，
///   同一级别的缓冲可互相替代，复用率高且查找是常数时间。
/// - 池中缓存的总字节数受 `max_buffer_pool_size` 约束，避免峰值流量过后内存长期不释放。
///
/// # 核心机制（How）
/// - 级别为 128、256、512 …… 直到 `max_buffer_size`，最后一级恰好等于 `max_buffer_size`；
/// - 每个级别一条自由链表，所有链表与已缓存字节数共用一把 `parking_lot::Mutex`；
/// - 命中、未命中、拒收与活跃租借以原子计数记录，[`statistics`](Self::statistics) 输出快照。
///
/// # 契约说明（What）
/// - `take_buffer(size)` 返回容量 ≥ `size` 的缓冲；超过 `max_buffer_size` 的请求直接分配，不进入池；
/// - 归还的缓冲若容量与租借时不同，或加入后会超过池容量上限，则被丢弃；
/// - 池中缓存字节数在任何时刻都不超过 `max_buffer_pool_size`；
/// - `max_buffer_pool_size == 0` 时禁用池化，每次租借都重新分配。
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<ManagerInner>,
}

impl BufferManager {
    pub fn new(settings: BufferSettings) -> Self {
        let classes = if settings.max_buffer_pool_size() == 0 {
            Vec::new()
        } else {
            size_classes(settings.max_buffer_size())
        };
        let free = FreeLists {
            per_class: classes.iter().map(|_| Vec::new()).collect(),
            retained_bytes: 0,
        };
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                classes,
                free: Mutex::new(free),
                metrics: ManagerMetrics::default(),
            }),
        }
    }

    pub fn settings(&self) -> &BufferSettings {
        &self.inner.settings
    }

    /// 单个可池化缓冲的最大尺寸。
    pub fn max_buffer_size(&self) -> usize {
        self.inner.settings.max_buffer_size()
    }

    /// 是否启用了池化。
    pub fn is_pooling(&self) -> bool {
        !self.inner.classes.is_empty()
    }

    /// 全部尺寸级别，自小到大。
    pub fn size_classes(&self) -> &[usize] {
        &self.inner.classes
    }

    /// 租借容量至少为 `size` 的缓冲。
    ///
    /// # 错误
    /// - `size` 超过 `isize::MAX` 时返回 [`codes::BUFFER_INVALID_SIZE`]。
    pub fn take_buffer(&self, size: usize) -> Result<PooledBuffer> {
        if size > isize::MAX as usize {
            return Err(CoreError::new(
                codes::BUFFER_INVALID_SIZE,
                format!("requested buffer size {size} exceeds isize::MAX"),
            ));
        }

        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        let class = self.inner.class_for(size);
        let buffer = match class {
            Some(index) => self.inner.take_from_class(index),
            None => {
                self.inner.metrics.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(size)
            }
        };
        self.inner.metrics.active_leases.fetch_add(1, Ordering::Relaxed);
        Ok(PooledBuffer::new(buffer, class, recycler))
    }

    /// 显式归还缓冲。
    ///
    /// 等价于丢弃该缓冲；由其他管理器借出的缓冲会回到其所属管理器。
    pub fn return_buffer(&self, buffer: PooledBuffer) {
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        if !buffer.is_owned_by(&recycler) {
            tracing::debug!("returned buffer belongs to another manager");
        }
        drop(buffer);
    }

    /// 丢弃池中缓存的全部缓冲，返回释放的字节数。
    pub fn clear(&self) -> usize {
        let mut free = self.inner.free.lock();
        for list in &mut free.per_class {
            list.clear();
        }
        std::mem::take(&mut free.retained_bytes)
    }

    /// 当前统计快照。
    pub fn statistics(&self) -> BufferPoolStats {
        let (retained_buffers, retained_bytes) = {
            let free = self.inner.free.lock();
            (
                free.per_class.iter().map(Vec::len).sum(),
                free.retained_bytes,
            )
        };
        let metrics = &self.inner.metrics;
        BufferPoolStats {
            size_classes: self.inner.classes.len(),
            retained_buffers,
            retained_bytes,
            max_buffer_pool_size: self.inner.settings.max_buffer_pool_size(),
            active_leases: metrics.active_leases.load(Ordering::Relaxed),
            hits: metrics.hits.load(Ordering::Relaxed),
            misses: metrics.misses.load(Ordering::Relaxed),
            rejected_returns: metrics.rejected_returns.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferManager")
            .field("settings", &self.inner.settings)
            .field("classes", &self.inner.classes.len())
            .finish()
    }
}

/// 缓冲管理器统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub size_classes: usize,
    pub retained_buffers: usize,
    pub retained_bytes: usize,
    pub max_buffer_pool_size: usize,
    pub active_leases: usize,
    pub hits: u64,
    pub misses: u64,
    pub rejected_returns: u64,
}

fn size_classes(max_buffer_size: usize) -> Vec<usize> {
    let mut classes = Vec::new();
    let mut size = MIN_CLASS_SIZE;
    while size < max_buffer_size {
        classes.push(size);
        match size.checked_mul(2) {
            Some(next) => size = next,
            None => break,
        }
    }
    if max_buffer_size > 0 {
        classes.push(max_buffer_size);
    }
    classes
}

struct FreeLists {
    per_class: Vec<Vec<BytesMut>>,
    retained_bytes: usize,
}

struct ManagerInner {
    settings: BufferSettings,
    classes: Vec<usize>,
    free: Mutex<FreeLists>,
    metrics: ManagerMetrics,
}

impl ManagerInner {
    /// 能容纳 `size` 的最小级别。
    fn class_for(&self, size: usize) -> Option<usize> {
        let index = self.classes.partition_point(|class| *class < size);
        (index < self.classes.len()).then_some(index)
    }

    fn take_from_class(&self, index: usize) -> BytesMut {
        let reused = {
            let mut free = self.free.lock();
            let reused = free.per_class[index].pop();
            if let Some(buffer) = &reused {
                free.retained_bytes = free.retained_bytes.saturating_sub(buffer.capacity());
            }
            reused
        };
        match reused {
            Some(buffer) => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                buffer
            }
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(self.classes[index])
            }
        }
    }
}

impl BufferRecycler for ManagerInner {
    fn reclaim(&self, reclaimed: ReclaimedBuffer) {
        saturating_sub(&self.metrics.active_leases, 1);

        let Some(index) = reclaimed.class() else {
            return;
        };
        let leased_capacity = reclaimed.leased_capacity();
        let Some(mut buffer) = reclaimed.into_buffer() else {
            return;
        };

        if buffer.capacity() != leased_capacity || index >= self.classes.len() {
            self.metrics.rejected_returns.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                class_size = self.classes.get(index).copied().unwrap_or_default(),
                leased_capacity,
                capacity = buffer.capacity(),
                "returned buffer does not match its size class, dropping"
            );
            return;
        }

        buffer.clear();
        let capacity = buffer.capacity();
        let mut free = self.free.lock();
        if free.retained_bytes + capacity > self.settings.max_buffer_pool_size() {
            drop(free);
            self.metrics.rejected_returns.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(capacity, "buffer pool is full, dropping returned buffer");
            return;
        }
        free.retained_bytes += capacity;
        free.per_class[index].push(buffer);
    }
}

#[derive(Default)]
struct ManagerMetrics {
    active_leases: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    rejected_returns: AtomicU64,
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn manager(pool: usize, max_buffer: usize) -> BufferManager {
        BufferManager::new(BufferSettings::new(pool, max_buffer, max_buffer).expect("设置非法"))
    }

    #[test]
    fn classes_are_powers_of_two_capped_by_max() {
        assert_eq!(size_classes(1000), vec![128, 256, 512, 1000]);
        assert_eq!(size_classes(1024), vec![128, 256, 512, 1024]);
        assert_eq!(size_classes(64), vec![64]);
        assert!(size_classes(0).is_empty());
    }

    #[test]
    fn returned_buffer_is_reused() {
        let manager = manager(64 * 1024, 4096);
        let first = manager.take_buffer(300).expect("租借缓冲失败");
        assert!(first.capacity() >= 300);
        manager.return_buffer(first);

        let stats = manager.statistics();
        assert_eq!(stats.retained_buffers, 1);
        assert_eq!(stats.active_leases, 0);

        let second = manager.take_buffer(400).expect("复用缓冲失败");
        assert!(second.is_pooled());
        assert_eq!(manager.statistics().hits, 1);
        assert_eq!(manager.statistics().retained_bytes, 0);
    }

    #[test]
    fn oversize_requests_bypass_the_pool() {
        let manager = manager(64 * 1024, 1024);
        let big = manager.take_buffer(5000).expect("租借缓冲失败");
        assert!(big.capacity() >= 5000);
        assert!(!big.is_pooled());
        drop(big);
        assert_eq!(manager.statistics().retained_buffers, 0);
        assert_eq!(manager.statistics().active_leases, 0);
    }

    #[test]
    fn grown_buffer_is_rejected_on_return() {
        let manager = manager(64 * 1024, 1024);
        let mut buffer = manager.take_buffer(128).expect("租借缓冲失败");
        buffer.put_slice(&[7u8; 600]);
        drop(buffer);
        let stats = manager.statistics();
        assert_eq!(stats.rejected_returns, 1);
        assert_eq!(stats.retained_buffers, 0);
    }

    #[test]
    fn pooling_disabled_always_allocates() {
        let manager = manager(0, 1024);
        assert!(!manager.is_pooling());
        drop(manager.take_buffer(200).expect("租借缓冲失败"));
        drop(manager.take_buffer(200).expect("租借缓冲失败"));
        let stats = manager.statistics();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.retained_bytes, 0);
    }

    #[test]
    fn clear_releases_retained_bytes() {
        let manager = manager(64 * 1024, 1024);
        drop(manager.take_buffer(1000).expect("租借缓冲失败"));
        assert!(manager.clear() >= 1000);
        assert_eq!(manager.statistics().retained_bytes, 0);
    }

    #[test]
    fn rejects_sizes_beyond_isize_max() {
        let manager = manager(1024, 1024);
        let err = manager
            .take_buffer(usize::MAX)
            .expect_err("超大请求应被拒绝");
        assert_eq!(err.code(), codes::BUFFER_INVALID_SIZE);
    }
}
