//! 出站连接池。
//!
//! # 教案式说明
//! - **意图（Why）**：建立连接（握手、前导帧）比复用一条已建立的连接昂贵得多。输出通道关闭时
//!   把仍然健康的连接归还到池中，下一个指向同一端点的通道直接取用。
//! - **逻辑（How）**：
//!   - 池按 [`PoolKey`] 分端点，每个端点维护一个空闲列表，最新归还的连接在末尾，取用时优先取最新的；
//!   - 每条空闲连接带“空闲截止时间”（归还时刻 + 空闲超时），每条连接带“租期截止时间”
//!     （建立时刻 + 租期），任一到期的连接都不再交出；
//!   - 归还时依次检查：连接是否健康、池是否已关闭、空闲超时是否为零、租期是否已到、
//!     端点空闲数是否已达上限；任一不满足即关闭（不健康时中止）而不入池；
//!   - 所有关闭与中止都在锁外执行。
//! - **契约（What）**：
//!   - [`ConnectionPool::take_connection`] 返回 `None` 表示调用方应新建连接；
//!   - [`ConnectionPool::close`] 尝试关闭每一条空闲连接，关闭失败的被中止，返回第一个错误；
//!   - [`ConnectionPool::abort`] 永不 panic。
//!
//! # 风险提示（Trade-offs）
//! - 空闲列表只在取用、归还与 [`ConnectionPool::purge_expired`] 时清理过期连接，
//!   长期无人访问的端点会保留过期连接直到下一次清理。

use std::{
    collections::HashMap,
    fmt,
    ops::Deref,
    panic::{AssertUnwindSafe, catch_unwind},
    time::Duration,
};

use parking_lot::Mutex;
use strata_channel::EndpointAddress;
use strata_core::{PoolSettings, Result, TimeoutBudget, for_each_concurrently};
use tokio::time::Instant;

use crate::Connection;

/// 连接池键。
///
/// 不同介质的键互不相等，即便字符串相同。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PoolKey {
    /// 规范化后的 `host:port`。
    Tcp(String),
    /// 解析得到的管道名。
    Pipe(String),
    /// 进程内端点的地址。
    Memory(String),
}

impl PoolKey {
    /// 由目标地址与实际建连地址构造 TCP 池键；`via` 优先。
    pub fn tcp(address: &EndpointAddress, via: Option<&EndpointAddress>, default_port: u16) -> Self {
        let target = via.unwrap_or(address);
        Self::Tcp(target.authority(default_port))
    }

    pub fn pipe(name: impl Into<String>) -> Self {
        Self::Pipe(name.into())
    }

    pub fn memory(address: &EndpointAddress, via: Option<&EndpointAddress>) -> Self {
        Self::Memory(via.unwrap_or(address).uri().to_owned())
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(authority) => write!(f, "tcp:{authority}"),
            Self::Pipe(name) => write!(f, "pipe:{name}"),
            Self::Memory(uri) => write!(f, "mem:{uri}"),
        }
    }
}

/// 带建立时刻的连接，租期从建立时刻起算。
pub struct PooledConnection {
    connection: Box<dyn Connection>,
    established_at: Instant,
}

impl PooledConnection {
    /// 包装一条刚建立的连接。
    pub fn new(connection: Box<dyn Connection>) -> Self {
        Self {
            connection,
            established_at: Instant::now(),
        }
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    pub fn into_inner(self) -> Box<dyn Connection> {
        self.connection
    }

    fn lease_expired(&self, lease_timeout: Duration, now: Instant) -> bool {
        self.established_at
            .checked_add(lease_timeout)
            .is_some_and(|deadline| deadline <= now)
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .field("established_at", &self.established_at)
            .finish()
    }
}

struct IdleConnection {
    connection: PooledConnection,
    idle_deadline: Option<Instant>,
}

impl IdleConnection {
    fn is_expired(&self, lease_timeout: Duration, now: Instant) -> bool {
        self.idle_deadline.is_some_and(|deadline| deadline <= now)
            || self.connection.lease_expired(lease_timeout, now)
    }
}

#[derive(Default)]
struct EndpointConnectionPool {
    idle: Vec<IdleConnection>,
}

struct PoolState {
    endpoints: HashMap<PoolKey, EndpointConnectionPool>,
    closed: bool,
}

/// 归还时不入池的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rejection {
    Unhealthy,
    PoolClosed,
    IdleTimeoutZero,
    LeaseExpired,
    EndpointFull,
}

impl Rejection {
    fn as_str(self) -> &'static str {
        match self {
            Self::Unhealthy => "connection is not reusable",
            Self::PoolClosed => "pool is closed",
            Self::IdleTimeoutZero => "idle timeout is zero",
            Self::LeaseExpired => "lease expired",
            Self::EndpointFull => "endpoint idle limit reached",
        }
    }
}

/// 连接池统计快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    /// 各端点当前的空闲连接数。
    pub idle_per_endpoint: HashMap<PoolKey, usize>,
}

impl PoolStatistics {
    pub fn total_idle(&self) -> usize {
        self.idle_per_endpoint.values().sum()
    }
}

/// 出站连接池。
pub struct ConnectionPool {
    settings: PoolSettings,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(PoolState {
                endpoints: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// 取出指定端点最新的有效空闲连接；途经的过期连接在锁外关闭。
    pub async fn take_connection(&self, key: &PoolKey, timeout: Duration) -> Option<PooledConnection> {
        let now = Instant::now();
        let lease_timeout = self.settings.lease_timeout();
        let (found, expired) = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            let endpoint = state.endpoints.get_mut(key)?;
            let mut expired = Vec::new();
            let mut found = None;
            while let Some(idle) = endpoint.idle.pop() {
                if idle.is_expired(lease_timeout, now) {
                    expired.push(idle.connection);
                } else {
                    found = Some(idle.connection);
                    break;
                }
            }
            if endpoint.idle.is_empty() {
                state.endpoints.remove(key);
            }
            (found, expired)
        };

        if !expired.is_empty() {
            tracing::debug!(pool.key = %key, count = expired.len(), "closing expired idle connections");
            close_connections(expired, timeout).await;
        }
        if found.is_some() {
            tracing::trace!(pool.key = %key, "reusing pooled connection");
        }
        found
    }

    /// 归还连接。
    ///
    /// 连接不入池时：`connection_is_still_good == false` 则中止，其余情况在 `timeout` 内优雅关闭，
    /// 关闭失败再中止。
    pub async fn return_connection(
        &self,
        key: &PoolKey,
        connection: PooledConnection,
        connection_is_still_good: bool,
        timeout: Duration,
    ) {
        let now = Instant::now();
        let reason = {
            let mut state = self.state.lock();
            if !connection_is_still_good {
                Rejection::Unhealthy
            } else if state.closed {
                Rejection::PoolClosed
            } else if self.settings.idle_timeout().is_zero() {
                Rejection::IdleTimeoutZero
            } else if connection.lease_expired(self.settings.lease_timeout(), now) {
                Rejection::LeaseExpired
            } else {
                let max = self.settings.max_outbound_connections_per_endpoint();
                let endpoint = state.endpoints.entry(key.clone()).or_default();
                if endpoint.idle.len() >= max {
                    Rejection::EndpointFull
                } else {
                    endpoint.idle.push(IdleConnection {
                        idle_deadline: now.checked_add(self.settings.idle_timeout()),
                        connection,
                    });
                    return;
                }
            }
        };

        tracing::debug!(pool.key = %key, reason = reason.as_str(), "connection not pooled");
        if reason == Rejection::Unhealthy {
            connection.abort();
        } else {
            close_connections(vec![connection], timeout).await;
        }
    }

    /// 清理所有过期的空闲连接，返回清理数量。过期连接直接中止。
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let lease_timeout = self.settings.lease_timeout();
        let evicted = {
            let mut state = self.state.lock();
            let mut evicted = Vec::new();
            state.endpoints.retain(|_, endpoint| {
                let (expired, kept): (Vec<_>, Vec<_>) = endpoint
                    .idle
                    .drain(..)
                    .partition(|idle| idle.is_expired(lease_timeout, now));
                endpoint.idle = kept;
                evicted.extend(expired.into_iter().map(|idle| idle.connection));
                !endpoint.idle.is_empty()
            });
            evicted
        };

        let count = evicted.len();
        if count > 0 {
            tracing::info!(pool.group = self.settings.group_name(), pool.evicted = count, "evicting expired idle connections");
            abort_connections(evicted);
        }
        count
    }

    /// 关闭池：之后归还的连接一律关闭，取用一律返回 `None`。
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let drained = self.drain();
        if drained.is_empty() {
            return Ok(());
        }
        tracing::debug!(pool.group = self.settings.group_name(), pool.idle = drained.len(), "closing connection pool");
        for_each_concurrently(
            drained,
            timeout,
            |connection, remaining| async move {
                let result = connection.close(remaining).await;
                (connection, result)
            },
            |connection| connection.abort(),
        )
        .await
    }

    pub fn abort(&self) {
        let drained = self.drain();
        if !drained.is_empty() {
            tracing::debug!(pool.group = self.settings.group_name(), pool.idle = drained.len(), "aborting connection pool");
        }
        abort_connections(drained);
    }

    pub fn idle_count(&self, key: &PoolKey) -> usize {
        self.state
            .lock()
            .endpoints
            .get(key)
            .map_or(0, |endpoint| endpoint.idle.len())
    }

    pub fn statistics(&self) -> PoolStatistics {
        let state = self.state.lock();
        PoolStatistics {
            idle_per_endpoint: state
                .endpoints
                .iter()
                .map(|(key, endpoint)| (key.clone(), endpoint.idle.len()))
                .collect(),
        }
    }

    fn drain(&self) -> Vec<PooledConnection> {
        let mut state = self.state.lock();
        state.closed = true;
        state
            .endpoints
            .drain()
            .flat_map(|(_, endpoint)| endpoint.idle)
            .map(|idle| idle.connection)
            .collect()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("settings", &self.settings)
            .field("endpoints", &state.endpoints.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// 在共享预算内关闭连接，失败的连接被中止；错误只记录不返回。
async fn close_connections(connections: Vec<PooledConnection>, timeout: Duration) {
    let budget = TimeoutBudget::new(timeout);
    let result = for_each_concurrently(
        connections,
        budget.remaining(),
        |connection, remaining| async move {
            let result = connection.close(remaining).await;
            (connection, result)
        },
        |connection| connection.abort(),
    )
    .await;
    if let Err(error) = result {
        tracing::debug!(%error, "closing unpooled connection failed, aborted instead");
    }
}

fn abort_connections(connections: Vec<PooledConnection>) {
    for connection in connections {
        if catch_unwind(AssertUnwindSafe(|| connection.abort())).is_err() {
            tracing::warn!(connection.remote = connection.remote_identity(), "connection panicked while aborting");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamConnection;

    fn connection() -> PooledConnection {
        let (stream, _peer) = tokio::io::duplex(16);
        PooledConnection::new(Box::new(StreamConnection::new(stream, "peer")))
    }

    fn key() -> PoolKey {
        PoolKey::Memory("mem://peer/".into())
    }

    #[tokio::test(start_paused = true)]
    async fn newest_connection_is_reused_first() {
        let pool = ConnectionPool::new(PoolSettings::default());
        let first = connection();
        let first_established = first.established_at();
        tokio::time::advance(Duration::from_millis(1)).await;
        let second = connection();
        let second_established = second.established_at();
        assert_ne!(first_established, second_established);

        pool.return_connection(&key(), first, true, Duration::from_secs(1)).await;
        pool.return_connection(&key(), second, true, Duration::from_secs(1)).await;
        assert_eq!(pool.idle_count(&key()), 2);

        let taken = pool
            .take_connection(&key(), Duration::from_secs(1))
            .await
            .expect("应取到空闲连接");
        assert_eq!(taken.established_at(), second_established);
        assert_eq!(pool.idle_count(&key()), 1);
    }

    #[tracing_test::traced_test]
    #[tokio::test(start_paused = true)]
    async fn purge_evicts_idle_expired_connections_and_logs() {
        let settings = PoolSettings::default().with_idle_timeout(Duration::from_secs(10));
        let pool = ConnectionPool::new(settings);
        pool.return_connection(&key(), connection(), true, Duration::from_secs(1)).await;
        assert_eq!(pool.purge_expired(), 0);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pool.purge_expired(), 1);
        assert_eq!(pool.idle_count(&key()), 0);
        assert!(pool.statistics().idle_per_endpoint.is_empty());
        assert!(logs_contain("evicting expired idle connections"));
    }

    #[test]
    fn pool_keys_of_different_media_never_collide() {
        assert_ne!(PoolKey::Tcp("a:1".into()), PoolKey::Pipe("a:1".into()));
        assert_eq!(PoolKey::Tcp("host:808".into()).to_string(), "tcp:host:808");
    }
}
