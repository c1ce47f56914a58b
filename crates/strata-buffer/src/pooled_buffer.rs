use std::{
    fmt, mem,
    ops::{Deref, DerefMut},
    sync::Arc,
};

use bytes::{Bytes, BytesMut};

/// `BufferRecycler` 描述缓冲管理器在租借结束时的回收入口。
///
/// # 设计初衷（Why）
/// - 调用方拿到 [`PooledBuffer`] 后可能显式归还、也可能只是让它离开作用域；
///   两条路径都必须通知管理器，否则活跃租借计数会漂移。
/// - 回收逻辑放在 `Drop` 中统一触发，调用方无需记住“用完要还”。
///
/// # 契约定义（What）
/// - 每个租借恰好触发一次 `reclaim`；
/// - 实现必须线程安全且不得 panic，`Drop` 路径上的 panic 会在展开期间导致进程终止。
pub trait BufferRecycler: Send + Sync + 'static {
    fn reclaim(&self, reclaimed: ReclaimedBuffer);
}

/// 一次回收所携带的上下文。
///
/// - `class`：租借时分配的尺寸级别；`None` 表示该缓冲从未属于任何级别（超大或未启用池化）；
/// - `leased_capacity`：租借时的容量，回收方据此判断缓冲是否仍是当初借出的那一块；
/// - `buffer`：若调用方通过 [`PooledBuffer::freeze`] 等方式取走了内存，则为 `None`。
#[derive(Debug)]
pub struct ReclaimedBuffer {
    class: Option<usize>,
    leased_capacity: usize,
    buffer: Option<BytesMut>,
}

impl ReclaimedBuffer {
    pub fn new(class: Option<usize>, leased_capacity: usize, buffer: Option<BytesMut>) -> Self {
        Self {
            class,
            leased_capacity,
            buffer,
        }
    }

    pub fn class(&self) -> Option<usize> {
        self.class
    }

    pub fn leased_capacity(&self) -> usize {
        self.leased_capacity
    }

    /// 消耗结构并返回可复用的 `BytesMut`。
    pub fn into_buffer(self) -> Option<BytesMut> {
        self.buffer
    }
}

struct Lease {
    recycler: Arc<dyn BufferRecycler>,
    class: Option<usize>,
    capacity: usize,
}

/// 从 [`BufferManager`](crate::BufferManager) 租借的可写缓冲。
///
/// # 使用方式（How）
/// - 通过 `Deref<Target = BytesMut>` 直接使用 `bytes` 的全部写入接口；
/// - 写满后可 [`freeze`](Self::freeze) 为只读 `Bytes`，此时内存随 `Bytes` 离开管理器；
/// - 否则在 `Drop` 时自动归还。
///
/// # 风险提示（Trade-offs）
/// - 写入超出租借容量会触发 `BytesMut` 重新分配，归还时容量与租借时不符，管理器将拒收该缓冲；
///   编码器应先按预估尺寸租借，不足时再租借更大的缓冲。
pub struct PooledBuffer {
    buffer: BytesMut,
    lease: Option<Lease>,
}

impl PooledBuffer {
    /// 以回收句柄包装一块缓冲。
    pub fn new(buffer: BytesMut, class: Option<usize>, recycler: Arc<dyn BufferRecycler>) -> Self {
        let capacity = buffer.capacity();
        Self {
            buffer,
            lease: Some(Lease {
                recycler,
                class,
                capacity,
            }),
        }
    }

    /// 租借时的容量。
    pub fn leased_capacity(&self) -> usize {
        self.lease
            .as_ref()
            .map_or(self.buffer.capacity(), |lease| lease.capacity)
    }

    /// 是否属于某个尺寸级别（归还后可被复用）。
    pub fn is_pooled(&self) -> bool {
        self.lease.as_ref().is_some_and(|lease| lease.class.is_some())
    }

    /// 判断缓冲是否由指定回收者借出。
    pub fn is_owned_by(&self, recycler: &Arc<dyn BufferRecycler>) -> bool {
        self.lease
            .as_ref()
            .is_some_and(|lease| Arc::ptr_eq(&lease.recycler, recycler))
    }

    /// 冻结为只读视图；内存不再回到管理器，但租借计数会被结清。
    pub fn freeze(mut self) -> Bytes {
        let buffer = mem::take(&mut self.buffer);
        self.finish(None);
        buffer.freeze()
    }

    /// 取出底层 `BytesMut` 并结束租借。
    pub fn into_inner(mut self) -> BytesMut {
        let buffer = mem::take(&mut self.buffer);
        self.finish(None);
        buffer
    }

    fn finish(&mut self, buffer: Option<BytesMut>) {
        if let Some(lease) = self.lease.take() {
            lease
                .recycler
                .reclaim(ReclaimedBuffer::new(lease.class, lease.capacity, buffer));
        }
    }
}

impl Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.lease.is_some() {
            let buffer = mem::take(&mut self.buffer);
            self.finish(Some(buffer));
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.buffer.len())
            .field("capacity", &self.buffer.capacity())
            .field("pooled", &self.is_pooled())
            .finish()
    }
}
