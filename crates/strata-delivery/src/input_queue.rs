//! 输入队列。
//!
//! # 模块定位（Why）
//! - 传输读循环（生产者）与通道使用者（读者）运行在不同的任务或线程上。条目到达时若已有读者
//!   在等待，应直接交给读者；否则缓存，直到有人来取。
//! - 队列必须处理三类竞争：读者超时与条目到达同时发生、读者被取消、队列在读者等待时关闭。
//!   任何一种竞争都不能让条目丢失或被交付两次。
//!
//! # 实现要点（How）
//! - 所有状态（条目、读者、等待者）由一把 `parking_lot::Mutex` 保护；交付给读者的动作在锁内完成，
//!   它只是写入一个槽位或一次 oneshot 发送，不会运行读者代码；
//! - 出队回调与条目释放一律在锁外执行；
//! - 读者超时后，在锁内尝试把自己从读者队列移除：移除成功说明没有条目交给它，返回超时；
//!   移除失败说明条目已经在途，继续等待并取走；
//! - 异步读者的 Future 被丢弃时执行同样的移除，若条目已经交到它的通道里，则放回队首；
//! - “挂起”条目按计数管理：`pending` 表示末尾有多少条目尚不可被新读者取走，由 [`InputQueue::dispatch`]
//!   逐个放行。

use std::{
    collections::VecDeque,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::{Duration, Instant},
};

use futures::channel::oneshot;
use parking_lot::{Condvar, Mutex, MutexGuard};
use strata_core::{
    CoreError, DefaultScheduler, DispatchScheduler, Result, TimeoutBudget, codes,
};

/// 条目被读者取走后执行的回调。
pub type DequeuedCallback = Box<dyn FnOnce() + Send + 'static>;

/// 队列关闭后向读者报告的故障。
pub type FaultFactory = Arc<dyn Fn() -> CoreError + Send + Sync>;

/// 未能交付的条目的释放逻辑。未设置时条目直接丢弃。
pub type ItemDisposer<T> = Arc<dyn Fn(T) + Send + Sync>;

/// 一次出队尝试的结果。
#[derive(Debug, PartialEq, Eq)]
pub enum DequeueOutcome<T> {
    /// 取得条目。
    Item(T),
    /// 队列已关闭且没有更多条目。
    Drained,
    /// 超时前没有条目到达。
    TimedOut,
}

impl<T> DequeueOutcome<T> {
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            _ => None,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

enum Payload<T> {
    Value(T),
    Fault(CoreError),
    EndOfStream,
}

struct Entry<T> {
    payload: Payload<T>,
    callback: Option<DequeuedCallback>,
}

impl<T> Entry<T> {
    fn value(value: T, callback: Option<DequeuedCallback>) -> Self {
        Self {
            payload: Payload::Value(value),
            callback,
        }
    }

    /// 只剩回调需要执行的条目。
    fn callback_only(callback: DequeuedCallback) -> Self {
        Self {
            payload: Payload::EndOfStream,
            callback: Some(callback),
        }
    }
}

enum Delivery<T> {
    Item(T),
    Fault(CoreError),
    Drained,
}

/// 同步读者/等待者阻塞所用的槽位。
struct BlockingSlot<V> {
    value: Mutex<Option<V>>,
    ready: Condvar,
}

impl<V> BlockingSlot<V> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    fn set(&self, value: V) {
        *self.value.lock() = Some(value);
        self.ready.notify_one();
    }

    /// 等待槽位被写入；`deadline` 为 `None` 时无限等待。超时返回 `None`。
    fn wait_until(&self, deadline: Option<Instant>) -> Option<V> {
        let mut guard = self.value.lock();
        loop {
            if let Some(value) = guard.take() {
                return Some(value);
            }
            match deadline {
                None => self.ready.wait(&mut guard),
                Some(deadline) => {
                    if self.ready.wait_until(&mut guard, deadline).timed_out() {
                        return guard.take();
                    }
                }
            }
        }
    }
}

enum ReaderHandle<T> {
    Blocking(Arc<BlockingSlot<Delivery<T>>>),
    Async(oneshot::Sender<Delivery<T>>),
}

struct Reader<T> {
    id: u64,
    handle: ReaderHandle<T>,
}

impl<T> Reader<T> {
    /// 交付失败（异步读者已离开）时原样退回。
    fn deliver(self, delivery: Delivery<T>) -> std::result::Result<(), Delivery<T>> {
        match self.handle {
            ReaderHandle::Blocking(slot) => {
                slot.set(delivery);
                Ok(())
            }
            ReaderHandle::Async(sender) => sender.send(delivery),
        }
    }
}

enum WaiterHandle {
    Blocking(Arc<BlockingSlot<bool>>),
    Async(oneshot::Sender<bool>),
}

struct Waiter {
    id: u64,
    handle: WaiterHandle,
}

impl Waiter {
    fn signal(self, available: bool) {
        match self.handle {
            WaiterHandle::Blocking(slot) => slot.set(available),
            WaiterHandle::Async(sender) => {
                let _ = sender.send(available);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueueState {
    Open,
    Shutdown,
    Closed,
}

struct QueueInner<T> {
    state: QueueState,
    items: VecDeque<Entry<T>>,
    pending: usize,
    readers: VecDeque<Reader<T>>,
    waiters: Vec<Waiter>,
    terminal_enqueued: bool,
    terminal_fault: Option<CoreError>,
    shutdown_fault: Option<FaultFactory>,
    next_id: u64,
}

impl<T> QueueInner<T> {
    fn new() -> Self {
        Self {
            state: QueueState::Open,
            items: VecDeque::new(),
            pending: 0,
            readers: VecDeque::new(),
            waiters: Vec::new(),
            terminal_enqueued: false,
            terminal_fault: None,
            shutdown_fault: None,
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }

    fn available(&self) -> usize {
        self.items.len() - self.pending
    }

    /// 是否存在无需等待即可完成的出队。
    fn can_complete_immediately(&self) -> bool {
        self.available() > 0 || self.state != QueueState::Open
    }

    /// 取出队首可交付内容。故障条目保留在队首，之后的每次出队都会再次得到它。
    fn take_head(&mut self) -> Option<(Delivery<T>, Option<DequeuedCallback>)> {
        let Entry { payload, callback } = self.items.pop_front()?;
        match payload {
            Payload::Value(value) => Some((Delivery::Item(value), callback)),
            Payload::Fault(err) => {
                let delivery = Delivery::Fault(err.clone());
                self.items.push_front(Entry {
                    payload: Payload::Fault(err),
                    callback: None,
                });
                Some((delivery, callback))
            }
            Payload::EndOfStream => {
                self.items.push_front(Entry {
                    payload: Payload::EndOfStream,
                    callback: None,
                });
                Some((Delivery::Drained, callback))
            }
        }
    }

    fn closed_delivery(&self) -> Delivery<T> {
        match self.state {
            QueueState::Shutdown => match (&self.shutdown_fault, &self.terminal_fault) {
                (Some(factory), _) => Delivery::Fault(factory()),
                (None, Some(fault)) => Delivery::Fault(fault.clone()),
                (None, None) => Delivery::Drained,
            },
            _ => Delivery::Drained,
        }
    }

    fn take_immediate(&mut self) -> Option<(Delivery<T>, Option<DequeuedCallback>)> {
        if self.available() > 0 {
            return self.take_head();
        }
        match self.state {
            QueueState::Open => None,
            _ => Some((self.closed_delivery(), None)),
        }
    }

    fn restore(&mut self, delivery: Delivery<T>, callback: Option<DequeuedCallback>) {
        match delivery {
            Delivery::Item(value) => self.items.push_front(Entry::value(value, callback)),
            Delivery::Fault(_) | Delivery::Drained => {
                if let Some(front) = self.items.front_mut() {
                    if front.callback.is_none() {
                        front.callback = callback;
                    }
                }
            }
        }
    }

    /// 把可交付条目依次交给等待中的读者，收集需要在锁外执行的回调。
    fn pump(&mut self, callbacks: &mut Vec<DequeuedCallback>) {
        while self.available() > 0 {
            let Some(reader) = self.readers.pop_front() else {
                break;
            };
            let Some((delivery, callback)) = self.take_head() else {
                self.readers.push_front(reader);
                break;
            };
            match reader.deliver(delivery) {
                Ok(()) => callbacks.extend(callback),
                Err(returned) => self.restore(returned, callback),
            }
        }
        if self.available() > 0 {
            self.signal_waiters(true);
        }
    }

    fn signal_waiters(&mut self, available: bool) {
        for waiter in self.waiters.drain(..) {
            waiter.signal(available);
        }
    }

    fn remove_reader(&mut self, id: u64) -> bool {
        match self.readers.iter().position(|reader| reader.id == id) {
            Some(index) => {
                self.readers.remove(index);
                true
            }
            None => false,
        }
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|waiter| waiter.id == id) {
            Some(index) => {
                self.waiters.swap_remove(index);
                true
            }
            None => false,
        }
    }

    /// 进入非开放状态：释放所有条目、以关闭结果完成所有读者与等待者。
    fn terminate(&mut self, state: QueueState) -> Vec<Entry<T>> {
        self.state = state;
        self.pending = 0;
        let mut drained = Vec::with_capacity(self.items.len());
        for Entry { payload, callback } in self.items.drain(..) {
            match payload {
                Payload::Value(value) => drained.push(Entry::value(value, callback)),
                Payload::Fault(err) => {
                    if self.terminal_fault.is_none() {
                        self.terminal_fault = Some(err);
                    }
                    drained.extend(callback.map(Entry::callback_only));
                }
                Payload::EndOfStream => drained.extend(callback.map(Entry::callback_only)),
            }
        }
        while let Some(reader) = self.readers.pop_front() {
            let delivery = self.closed_delivery();
            let _ = reader.deliver(delivery);
        }
        self.signal_waiters(true);
        drained
    }
}

struct Shared<T> {
    inner: Mutex<QueueInner<T>>,
    scheduler: Arc<dyn DispatchScheduler>,
    disposer: Option<ItemDisposer<T>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock()
    }

    fn dispose(&self, entries: Vec<Entry<T>>) {
        for entry in entries {
            if let Some(callback) = entry.callback {
                run_guarded("dequeued callback", callback);
            }
            if let Payload::Value(value) = entry.payload {
                match &self.disposer {
                    Some(disposer) => run_guarded("item disposer", || disposer(value)),
                    None => drop(value),
                }
            }
        }
    }
}

fn run_guarded(what: &str, task: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::warn!(task = what, "input queue task panicked");
    }
}

fn std_deadline(timeout: Duration) -> Option<Instant> {
    if timeout == Duration::MAX {
        None
    } else {
        Instant::now().checked_add(timeout)
    }
}

fn complete<T>(
    delivery: Delivery<T>,
    callback: Option<DequeuedCallback>,
) -> Result<DequeueOutcome<T>> {
    if let Some(callback) = callback {
        run_guarded("dequeued callback", callback);
    }
    match delivery {
        Delivery::Item(item) => Ok(DequeueOutcome::Item(item)),
        Delivery::Fault(err) => Err(err),
        Delivery::Drained => Ok(DequeueOutcome::Drained),
    }
}

fn timed_out_error(timeout: Duration) -> CoreError {
    CoreError::new(
        codes::TIMEOUT_DEQUEUE,
        format!("no item arrived within {timeout:?}"),
    )
}

/// 生产者/读者会合队列。
///
/// # 契约说明（What）
/// - 条目按入队顺序交付，每个条目至多交付一次；
/// - 故障条目之前的条目先交付，此后所有出队都得到该故障，故障之后入队的条目被直接释放；
/// - 结束标记与故障相同，只是此后的出队得到 [`DequeueOutcome::Drained`]；
/// - [`shutdown`](Self::shutdown) 与 [`close`](Self::close) 释放尚未交付的条目（执行其回调与释放逻辑），
///   等待中的读者得到故障或 [`DequeueOutcome::Drained`]；
/// - 克隆得到的是同一个队列的另一个句柄。
pub struct InputQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for InputQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for InputQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> InputQueue<T> {
    /// 使用 [`DefaultScheduler`] 创建队列。
    pub fn new() -> Self {
        Self::with_scheduler(Arc::new(DefaultScheduler))
    }

    pub fn with_scheduler(scheduler: Arc<dyn DispatchScheduler>) -> Self {
        Self::build(scheduler, None)
    }

    /// 指定未交付条目的释放逻辑，例如中止尚未被接受的通道。
    pub fn with_disposer(scheduler: Arc<dyn DispatchScheduler>, disposer: ItemDisposer<T>) -> Self {
        Self::build(scheduler, Some(disposer))
    }

    fn build(scheduler: Arc<dyn DispatchScheduler>, disposer: Option<ItemDisposer<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(QueueInner::new()),
                scheduler,
                disposer,
            }),
        }
    }

    /// 队列中的条目总数（含尚未放行的挂起条目）。
    pub fn pending_count(&self) -> usize {
        self.shared.lock().items.len()
    }

    /// 正在等待的读者数。
    pub fn reader_count(&self) -> usize {
        self.shared.lock().readers.len()
    }

    /// 入队并尝试立即交付。
    ///
    /// `can_dispatch_on_this_thread` 为 `false` 时，出队回调交给调度器执行，
    /// 生产者线程上不会运行任何回调代码。
    pub fn enqueue_and_dispatch(
        &self,
        item: T,
        on_dequeued: Option<DequeuedCallback>,
        can_dispatch_on_this_thread: bool,
    ) {
        let mut callbacks = Vec::new();
        let rejected = {
            let mut inner = self.shared.lock();
            if inner.state != QueueState::Open || inner.terminal_enqueued {
                Some(Entry::value(item, on_dequeued))
            } else {
                inner.items.push_back(Entry::value(item, on_dequeued));
                inner.pump(&mut callbacks);
                None
            }
        };

        if let Some(entry) = rejected {
            tracing::trace!("input queue no longer accepts items, disposing");
            self.shared.dispose(vec![entry]);
        }
        self.run_callbacks(callbacks, can_dispatch_on_this_thread);
    }

    /// 入队故障：此前的条目照常交付，随后所有读者都得到该故障。
    pub fn enqueue_fault_and_dispatch(
        &self,
        fault: CoreError,
        on_dequeued: Option<DequeuedCallback>,
        can_dispatch_on_this_thread: bool,
    ) {
        self.enqueue_terminal(Payload::Fault(fault), on_dequeued, can_dispatch_on_this_thread);
    }

    /// 标记输入结束：此前的条目照常交付，随后所有出队得到 [`DequeueOutcome::Drained`]。
    ///
    /// 与 [`shutdown`](Self::shutdown) 不同，已排队的条目不会被释放。
    pub fn enqueue_end_of_stream(&self, can_dispatch_on_this_thread: bool) {
        self.enqueue_terminal(Payload::EndOfStream, None, can_dispatch_on_this_thread);
    }

    fn enqueue_terminal(
        &self,
        payload: Payload<T>,
        on_dequeued: Option<DequeuedCallback>,
        can_dispatch_on_this_thread: bool,
    ) {
        let mut callbacks = Vec::new();
        let rejected = {
            let mut inner = self.shared.lock();
            if inner.state != QueueState::Open || inner.terminal_enqueued {
                on_dequeued
            } else {
                inner.terminal_enqueued = true;
                inner.pending = 0;
                inner.items.push_back(Entry {
                    payload,
                    callback: on_dequeued,
                });
                inner.pump(&mut callbacks);
                None
            }
        };

        if let Some(callback) = rejected {
            run_guarded("dequeued callback", callback);
        }
        self.run_callbacks(callbacks, can_dispatch_on_this_thread);
    }

    /// 入队但不交付。
    ///
    /// 返回 `true` 表示已有读者或等待者，调用方随后必须调用一次 [`dispatch`](Self::dispatch)。
    pub fn enqueue_without_dispatch(&self, item: T, on_dequeued: Option<DequeuedCallback>) -> bool {
        let rejected = {
            let mut inner = self.shared.lock();
            if inner.state != QueueState::Open || inner.terminal_enqueued {
                Some(Entry::value(item, on_dequeued))
            } else {
                let needs_dispatch = !inner.readers.is_empty() || !inner.waiters.is_empty();
                inner.items.push_back(Entry::value(item, on_dequeued));
                if needs_dispatch {
                    inner.pending += 1;
                    return true;
                }
                None
            }
        };
        if let Some(entry) = rejected {
            self.shared.dispose(vec![entry]);
        }
        false
    }

    /// 放行一个挂起条目并交付给等待中的读者。
    pub fn dispatch(&self) {
        let mut callbacks = Vec::new();
        {
            let mut inner = self.shared.lock();
            if inner.pending > 0 {
                inner.pending -= 1;
            }
            inner.pump(&mut callbacks);
        }
        self.run_callbacks(callbacks, true);
    }

    /// 通过调度器在别处执行一次 [`dispatch`](Self::dispatch)。
    pub fn schedule_dispatch(&self) {
        let queue = self.clone();
        self.shared
            .scheduler
            .schedule(Box::new(move || queue.dispatch()));
    }

    /// 同步出队，最多阻塞 `timeout`。`Duration::MAX` 表示无限等待。
    pub fn try_dequeue(&self, timeout: Duration) -> Result<DequeueOutcome<T>> {
        let (id, slot) = {
            let mut inner = self.shared.lock();
            if let Some((delivery, callback)) = inner.take_immediate() {
                drop(inner);
                return complete(delivery, callback);
            }
            if timeout.is_zero() {
                return Ok(DequeueOutcome::TimedOut);
            }
            let id = inner.allocate_id();
            let slot = BlockingSlot::new();
            inner.readers.push_back(Reader {
                id,
                handle: ReaderHandle::Blocking(Arc::clone(&slot)),
            });
            (id, slot)
        };

        if let Some(delivery) = slot.wait_until(std_deadline(timeout)) {
            return complete(delivery, None);
        }
        if self.shared.lock().remove_reader(id) {
            return Ok(DequeueOutcome::TimedOut);
        }
        match slot.wait_until(None) {
            Some(delivery) => complete(delivery, None),
            None => Ok(DequeueOutcome::TimedOut),
        }
    }

    /// 同步出队；超时返回 [`codes::TIMEOUT_DEQUEUE`] 错误，队列关闭返回 `None`。
    pub fn dequeue(&self, timeout: Duration) -> Result<Option<T>> {
        match self.try_dequeue(timeout)? {
            DequeueOutcome::Item(item) => Ok(Some(item)),
            DequeueOutcome::Drained => Ok(None),
            DequeueOutcome::TimedOut => Err(timed_out_error(timeout)),
        }
    }

    /// 异步出队。Future 被丢弃时，已交到该读者手中的条目会被放回队首。
    pub async fn try_dequeue_async(&self, timeout: Duration) -> Result<DequeueOutcome<T>> {
        let (id, receiver) = {
            let mut inner = self.shared.lock();
            if let Some((delivery, callback)) = inner.take_immediate() {
                drop(inner);
                return complete(delivery, callback);
            }
            if timeout.is_zero() {
                return Ok(DequeueOutcome::TimedOut);
            }
            let id = inner.allocate_id();
            let (sender, receiver) = oneshot::channel();
            inner.readers.push_back(Reader {
                id,
                handle: ReaderHandle::Async(sender),
            });
            (id, receiver)
        };

        let mut pending = PendingRead {
            shared: Arc::clone(&self.shared),
            id,
            receiver: Some(receiver),
        };
        let budget = TimeoutBudget::new(timeout);
        let delivery = match budget.deadline() {
            None => pending.recv().await,
            Some(deadline) => match tokio::time::timeout_at(deadline, pending.recv()).await {
                Ok(delivery) => delivery,
                Err(_) => {
                    if pending.cancel() {
                        return Ok(DequeueOutcome::TimedOut);
                    }
                    pending.recv().await
                }
            },
        };
        complete(delivery, None)
    }

    /// 异步出队；语义同 [`dequeue`](Self::dequeue)。
    pub async fn dequeue_async(&self, timeout: Duration) -> Result<Option<T>> {
        match self.try_dequeue_async(timeout).await? {
            DequeueOutcome::Item(item) => Ok(Some(item)),
            DequeueOutcome::Drained => Ok(None),
            DequeueOutcome::TimedOut => Err(timed_out_error(timeout)),
        }
    }

    /// 等待直到出队可以立即完成（有条目或队列已关闭）。超时返回 `false`。
    pub fn wait_for_item(&self, timeout: Duration) -> bool {
        let (id, slot) = {
            let mut inner = self.shared.lock();
            if inner.can_complete_immediately() {
                return true;
            }
            if timeout.is_zero() {
                return false;
            }
            let id = inner.allocate_id();
            let slot = BlockingSlot::new();
            inner.waiters.push(Waiter {
                id,
                handle: WaiterHandle::Blocking(Arc::clone(&slot)),
            });
            (id, slot)
        };

        if let Some(available) = slot.wait_until(std_deadline(timeout)) {
            return available;
        }
        if self.shared.lock().remove_waiter(id) {
            return false;
        }
        slot.wait_until(None).unwrap_or(false)
    }

    /// 异步等待条目；语义同 [`wait_for_item`](Self::wait_for_item)。
    pub async fn wait_for_item_async(&self, timeout: Duration) -> bool {
        let (id, receiver) = {
            let mut inner = self.shared.lock();
            if inner.can_complete_immediately() {
                return true;
            }
            if timeout.is_zero() {
                return false;
            }
            let id = inner.allocate_id();
            let (sender, receiver) = oneshot::channel();
            inner.waiters.push(Waiter {
                id,
                handle: WaiterHandle::Async(sender),
            });
            (id, receiver)
        };

        let mut pending = PendingWait {
            shared: Arc::clone(&self.shared),
            id,
            armed: true,
        };
        let budget = TimeoutBudget::new(timeout);
        let outcome = match budget.deadline() {
            None => receiver.await.unwrap_or(true),
            Some(deadline) => {
                let mut receiver = receiver;
                match tokio::time::timeout_at(deadline, &mut receiver).await {
                    Ok(signal) => signal.unwrap_or(true),
                    Err(_) => {
                        if self.shared.lock().remove_waiter(id) {
                            pending.armed = false;
                            return false;
                        }
                        receiver.await.unwrap_or(true)
                    }
                }
            }
        };
        pending.armed = false;
        outcome
    }

    /// 关闭入口：释放未交付条目，等待中的读者得到 `fault_factory` 生成的故障或 `Drained`。
    pub fn shutdown(&self, fault_factory: Option<FaultFactory>) {
        let disposed = {
            let mut inner = self.shared.lock();
            if inner.state != QueueState::Open {
                return;
            }
            inner.shutdown_fault = fault_factory;
            inner.terminate(QueueState::Shutdown)
        };
        tracing::trace!(disposed = disposed.len(), "input queue shut down");
        self.shared.dispose(disposed);
    }

    /// 彻底关闭：释放未交付条目，所有读者得到 `Drained`。
    pub fn close(&self) {
        let disposed = {
            let mut inner = self.shared.lock();
            if inner.state == QueueState::Closed {
                return;
            }
            inner.terminate(QueueState::Closed)
        };
        tracing::trace!(disposed = disposed.len(), "input queue closed");
        self.shared.dispose(disposed);
    }

    fn run_callbacks(&self, callbacks: Vec<DequeuedCallback>, inline: bool) {
        for callback in callbacks {
            if inline {
                run_guarded("dequeued callback", callback);
            } else {
                self.shared.scheduler.schedule(callback);
            }
        }
    }
}

impl<T> fmt::Debug for InputQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("InputQueue")
            .field("state", &inner.state)
            .field("items", &inner.items.len())
            .field("pending", &inner.pending)
            .field("readers", &inner.readers.len())
            .finish()
    }
}

/// 异步读者的登记凭证；被丢弃时撤销登记或归还已交付的条目。
struct PendingRead<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    receiver: Option<oneshot::Receiver<Delivery<T>>>,
}

impl<T> PendingRead<T> {
    async fn recv(&mut self) -> Delivery<T> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Delivery::Drained;
        };
        let delivery = receiver.await.unwrap_or(Delivery::Drained);
        self.receiver = None;
        delivery
    }

    /// 撤销登记；返回 `false` 表示条目已经在途。
    fn cancel(&mut self) -> bool {
        let removed = self.shared.lock().remove_reader(self.id);
        if removed {
            self.receiver = None;
        }
        removed
    }
}

impl<T> Drop for PendingRead<T> {
    fn drop(&mut self) {
        let Some(mut receiver) = self.receiver.take() else {
            return;
        };

        let mut callbacks = Vec::new();
        let mut orphaned = Vec::new();
        {
            let mut inner = self.shared.lock();
            if inner.remove_reader(self.id) {
                return;
            }
            if let Ok(Some(Delivery::Item(item))) = receiver.try_recv() {
                if inner.state == QueueState::Open {
                    inner.items.push_front(Entry::value(item, None));
                    inner.pump(&mut callbacks);
                } else {
                    orphaned.push(Entry::value(item, None));
                }
            }
        }
        for callback in callbacks {
            run_guarded("dequeued callback", callback);
        }
        self.shared.dispose(orphaned);
    }
}

/// 异步等待者的登记凭证。
struct PendingWait<T> {
    shared: Arc<Shared<T>>,
    id: u64,
    armed: bool,
}

impl<T> Drop for PendingWait<T> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.lock().remove_waiter(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use strata_core::InlineScheduler;

    fn queue() -> InputQueue<u32> {
        InputQueue::with_scheduler(Arc::new(InlineScheduler))
    }

    #[test]
    fn items_are_delivered_in_order() {
        let queue = queue();
        for value in 1..=3 {
            queue.enqueue_and_dispatch(value, None, true);
        }
        for expected in 1..=3 {
            assert_eq!(
                queue.try_dequeue(Duration::ZERO).expect("出队失败"),
                DequeueOutcome::Item(expected)
            );
        }
        assert!(queue.try_dequeue(Duration::ZERO).expect("出队失败").is_timed_out());
    }

    #[test]
    fn dequeued_callback_runs_once() {
        let queue = queue();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        queue.enqueue_and_dispatch(
            7,
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            true,
        );
        assert_eq!(hits.load(Ordering::SeqCst), 0, "无读者时回调不应执行");
        assert_eq!(queue.dequeue(Duration::ZERO).expect("出队失败"), Some(7));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pending_items_wait_for_dispatch() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.dequeue(Duration::from_secs(5)))
        };
        while queue.reader_count() == 0 {
            std::thread::yield_now();
        }
        assert!(queue.enqueue_without_dispatch(11, None), "存在读者时需要派发");
        assert_eq!(queue.pending_count(), 1);
        queue.dispatch();
        let received = waiter.join().expect("读者线程崩溃").expect("出队失败");
        assert_eq!(received, Some(11));
    }

    #[test]
    fn fault_follows_earlier_items_and_sticks() {
        let queue = queue();
        queue.enqueue_and_dispatch(1, None, true);
        queue.enqueue_fault_and_dispatch(CoreError::new(codes::TRANSPORT_READ, "reset"), None, true);
        queue.enqueue_and_dispatch(2, None, true);

        assert_eq!(queue.dequeue(Duration::ZERO).expect("出队失败"), Some(1));
        for _ in 0..2 {
            let err = queue.dequeue(Duration::ZERO).expect_err("应得到故障");
            assert_eq!(err.code(), codes::TRANSPORT_READ);
        }
    }

    #[test]
    fn end_of_stream_drains_after_queued_items() {
        let queue = queue();
        queue.enqueue_and_dispatch(1, None, true);
        queue.enqueue_end_of_stream(true);
        queue.enqueue_and_dispatch(2, None, true);

        assert_eq!(queue.dequeue(Duration::ZERO).expect("出队失败"), Some(1));
        assert_eq!(queue.dequeue(Duration::ZERO).expect("出队失败"), None);
        assert_eq!(
            queue.try_dequeue(Duration::ZERO).expect("出队失败"),
            DequeueOutcome::Drained,
            "结束标记应持续生效"
        );
    }

    #[test]
    fn shutdown_disposes_items_and_reports_fault() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&disposed);
        let queue: InputQueue<u32> = InputQueue::with_disposer(
            Arc::new(InlineScheduler),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        queue.enqueue_and_dispatch(1, None, true);
        queue.enqueue_and_dispatch(2, None, true);
        queue.shutdown(Some(Arc::new(|| CoreError::faulted("channel"))));
        assert_eq!(disposed.load(Ordering::SeqCst), 2);

        let err = queue.dequeue(Duration::ZERO).expect_err("关闭后应报告故障");
        assert_eq!(err.code(), codes::LIFECYCLE_FAULTED);

        queue.enqueue_and_dispatch(3, None, true);
        assert_eq!(disposed.load(Ordering::SeqCst), 3, "关闭后入队的条目应被释放");
    }

    #[test]
    fn close_drains_blocked_reader() {
        let queue = queue();
        let reader = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.try_dequeue(Duration::MAX))
        };
        while queue.reader_count() == 0 {
            std::thread::yield_now();
        }
        queue.close();
        let outcome = reader.join().expect("读者线程崩溃").expect("出队失败");
        assert_eq!(outcome, DequeueOutcome::Drained);
        assert!(queue.wait_for_item(Duration::ZERO), "关闭后出队不会阻塞");
    }

    #[test]
    fn blocking_reader_times_out() {
        let queue = queue();
        let outcome = queue
            .try_dequeue(Duration::from_millis(20))
            .expect("出队失败");
        assert!(outcome.is_timed_out());
        assert_eq!(queue.reader_count(), 0, "超时读者应被移除");
        let err = queue.dequeue(Duration::from_millis(1)).expect_err("应超时");
        assert_eq!(err.code(), codes::TIMEOUT_DEQUEUE);
    }
}
