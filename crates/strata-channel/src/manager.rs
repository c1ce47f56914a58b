//! 通信对象登记表。
//!
//! # 教案式说明
//! - **意图（Why）**：工厂关闭或中止时必须级联到它创建的全部存活通道；通道自行关闭后又应从
//!   登记表中移除，避免工厂关闭时重复处理。
//! - **逻辑（How）**：
//!   - [`CommunicationObjectManager::reserve`] 先分配句柄，对象构造完成后再通过
//!     [`ManagedHandle::attach`] 登记，使对象能在自身内部持有句柄；
//!   - 句柄只持有登记表的 `Weak` 引用，不延长登记表寿命；
//!   - 关闭经由 [`close_all`] 并发尝试每个对象，失败者被中止，返回第一个错误；
//!   - 中止经由 [`abort_all`]，单个对象的 panic 被记录后吞掉。
//! - **契约（What）**：
//!   - 登记表关闭后再登记的对象会被立即中止并返回“已释放”错误；
//!   - `abort` 永不 panic。

use std::{
    borrow::Cow,
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use strata_core::{CommunicationObject, CoreError, Result, abort_all, close_all};

struct Registry<T: ?Sized> {
    objects: HashMap<u64, Arc<T>>,
    next_id: u64,
    closed: bool,
}

struct Shared<T: ?Sized> {
    label: Cow<'static, str>,
    registry: Mutex<Registry<T>>,
}

impl<T: CommunicationObject + ?Sized> Shared<T> {
    fn take_all(&self) -> Vec<Arc<T>> {
        let mut registry = self.registry.lock();
        registry.closed = true;
        registry.objects.drain().map(|(_, object)| object).collect()
    }
}

/// 存活对象登记表。
pub struct CommunicationObjectManager<T: ?Sized> {
    shared: Arc<Shared<T>>,
}

impl<T: ?Sized> Clone for CommunicationObjectManager<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: CommunicationObject + ?Sized> CommunicationObjectManager<T> {
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                label: label.into(),
                registry: Mutex::new(Registry {
                    objects: HashMap::new(),
                    next_id: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// 预留句柄；登记表已关闭时失败。
    pub fn reserve(&self) -> Result<ManagedHandle<T>> {
        let mut registry = self.shared.registry.lock();
        if registry.closed {
            return Err(CoreError::disposed(&self.shared.label));
        }
        registry.next_id += 1;
        Ok(ManagedHandle {
            shared: Arc::downgrade(&self.shared),
            id: registry.next_id,
        })
    }

    /// 预留并立即登记。
    pub fn add(&self, object: Arc<T>) -> Result<ManagedHandle<T>> {
        let handle = match self.reserve() {
            Ok(handle) => handle,
            Err(err) => {
                object.abort();
                return Err(err);
            }
        };
        handle.attach(object)?;
        Ok(handle)
    }

    pub fn len(&self) -> usize {
        self.shared.registry.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.registry.lock().closed
    }

    /// 当前存活对象的快照。
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.shared.registry.lock().objects.values().cloned().collect()
    }

    /// 关闭登记表并关闭全部对象。
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let objects = self.shared.take_all();
        if objects.is_empty() {
            return Ok(());
        }
        tracing::debug!(owner = %self.shared.label, count = objects.len(), "closing managed objects");
        close_all(objects, timeout).await
    }

    /// 关闭登记表并中止全部对象。
    pub fn abort(&self) {
        let objects = self.shared.take_all();
        if objects.is_empty() {
            return;
        }
        let panicked = abort_all(objects);
        if panicked > 0 {
            tracing::warn!(owner = %self.shared.label, panicked, "managed objects panicked while aborting");
        }
    }
}

impl<T: ?Sized> fmt::Debug for CommunicationObjectManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.shared.registry.lock();
        f.debug_struct("CommunicationObjectManager")
            .field("owner", &self.shared.label)
            .field("live", &registry.objects.len())
            .field("closed", &registry.closed)
            .finish()
    }
}

/// 登记表中的一个位置。
pub struct ManagedHandle<T: ?Sized> {
    shared: Weak<Shared<T>>,
    id: u64,
}

impl<T: CommunicationObject + ?Sized> ManagedHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// 登记对象；登记表已关闭或已不存在时中止对象并返回错误。
    pub fn attach(&self, object: Arc<T>) -> Result<()> {
        let Some(shared) = self.shared.upgrade() else {
            object.abort();
            return Err(CoreError::disposed("communication object manager"));
        };
        let mut registry = shared.registry.lock();
        if registry.closed {
            drop(registry);
            object.abort();
            return Err(CoreError::disposed(&shared.label));
        }
        registry.objects.insert(self.id, object);
        Ok(())
    }

    /// 从登记表移除；返回对象是否仍在登记表中。
    pub fn release(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.registry.lock().objects.remove(&self.id).is_some())
    }
}

impl<T: ?Sized> fmt::Debug for ManagedHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedHandle").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use strata_core::{CommunicationState, async_trait, codes};

    #[derive(Default)]
    struct Tracked {
        aborted: AtomicBool,
    }

    #[async_trait]
    impl CommunicationObject for Tracked {
        fn state(&self) -> CommunicationState {
            if self.aborted.load(Ordering::SeqCst) {
                CommunicationState::Closed
            } else {
                CommunicationState::Opened
            }
        }

        async fn open(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn close(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn abort(&self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn released_objects_are_not_aborted() {
        let manager: CommunicationObjectManager<Tracked> = CommunicationObjectManager::new("factory");
        let kept = Arc::new(Tracked::default());
        let released = Arc::new(Tracked::default());
        manager.add(kept.clone()).expect("登记失败");
        let handle = manager.add(released.clone()).expect("登记失败");

        assert!(handle.release());
        assert!(!handle.release(), "重复移除应返回 false");
        manager.abort();

        assert!(kept.aborted.load(Ordering::SeqCst));
        assert!(!released.aborted.load(Ordering::SeqCst));
    }

    #[test]
    fn attach_after_close_aborts_object() {
        let manager: CommunicationObjectManager<Tracked> = CommunicationObjectManager::new("factory");
        let handle = manager.reserve().expect("预留失败");
        manager.abort();

        let late = Arc::new(Tracked::default());
        let err = handle.attach(late.clone()).expect_err("关闭后登记应失败");
        assert_eq!(err.code(), codes::LIFECYCLE_DISPOSED);
        assert!(late.aborted.load(Ordering::SeqCst));
        assert!(manager.reserve().is_err());
    }
}
