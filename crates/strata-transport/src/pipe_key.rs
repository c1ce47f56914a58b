//! 管道名池键缓存。
//!
//! # 教案式说明
//! - **意图（Why）**：命名管道的池键不是地址本身，而是按地址解析出的已发布管道名；解析需要
//!   逐个尝试候选名，代价较高，因此缓存“地址 → 管道名”。服务端重新发布（改名）后，旧映射必须失效。
//! - **逻辑（How）**：
//!   - 正向表记录 `uri → 管道名`，反向表记录 `管道名 → {uri}`；
//!   - 连接中止时以管道名通知 [`PipeKeyCache::on_connection_aborted`]，沿反向表删除全部相关正向项；
//!   - 解析在锁外进行，结果写回时若已有其他线程写入则以已有值为准。
//! - **契约（What）**：
//!   - 同一 uri 在失效前总解析为同一池键；
//!   - 失效后下一次解析重新调用解析器。
//!
//! 候选名的生成沿用“强通配 → 精确主机 → 弱通配”的主机顺序，并自最长路径向上逐级截短。

use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use parking_lot::Mutex;
use strata_channel::EndpointAddress;
use strata_core::{CoreError, Result, codes};

use crate::PoolKey;

/// 把地址解析为已发布的管道名。
pub trait PipeNameResolver: Send + Sync {
    fn resolve(&self, address: &EndpointAddress) -> Result<String>;
}

impl<F> PipeNameResolver for F
where
    F: Fn(&EndpointAddress) -> Result<String> + Send + Sync,
{
    fn resolve(&self, address: &EndpointAddress) -> Result<String> {
        self(address)
    }
}

/// 按优先级列出地址可能对应的管道名。
pub fn pipe_name_candidates(address: &EndpointAddress) -> Vec<String> {
    let host = address.host();
    let segments: Vec<&str> = address
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    let mut candidates = Vec::new();
    for host_choice in ["+", host, "*"] {
        for depth in (0..=segments.len()).rev() {
            let path = segments[..depth].join("/");
            candidates.push(format!("{host_choice}/{path}"));
        }
    }
    candidates
}

/// 以一组已发布管道名作答的解析器：返回第一个已发布的候选名。
#[derive(Debug, Default)]
pub struct PublishedPipes {
    names: Mutex<HashSet<String>>,
}

impl PublishedPipes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, name: impl Into<String>) {
        self.names.lock().insert(name.into());
    }

    pub fn unpublish(&self, name: &str) -> bool {
        self.names.lock().remove(name)
    }
}

impl PipeNameResolver for PublishedPipes {
    fn resolve(&self, address: &EndpointAddress) -> Result<String> {
        let names = self.names.lock();
        pipe_name_candidates(address)
            .into_iter()
            .find(|candidate| names.contains(candidate))
            .ok_or_else(|| {
                CoreError::new(
                    codes::TRANSPORT_CONNECT,
                    format!("no pipe is published for {address}"),
                )
            })
    }
}

#[derive(Default)]
struct KeyTables {
    forward: HashMap<String, String>,
    reverse: HashMap<String, HashSet<String>>,
}

/// 地址到管道池键的缓存。
#[derive(Default)]
pub struct PipeKeyCache {
    tables: Mutex<KeyTables>,
}

impl PipeKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析地址对应的池键，命中缓存时不调用解析器。
    pub fn resolve(&self, address: &EndpointAddress, resolver: &dyn PipeNameResolver) -> Result<PoolKey> {
        if let Some(name) = self.tables.lock().forward.get(address.uri()) {
            return Ok(PoolKey::pipe(name.clone()));
        }

        let resolved = resolver.resolve(address)?;
        let mut tables = self.tables.lock();
        let name = tables
            .forward
            .entry(address.uri().to_owned())
            .or_insert(resolved)
            .clone();
        tables
            .reverse
            .entry(name.clone())
            .or_default()
            .insert(address.uri().to_owned());
        Ok(PoolKey::pipe(name))
    }

    /// 连接中止通知：清除指向 `pipe_name` 的全部映射，返回清除的 uri 数量。
    pub fn on_connection_aborted(&self, pipe_name: &str) -> usize {
        let mut tables = self.tables.lock();
        let Some(uris) = tables.reverse.remove(pipe_name) else {
            return 0;
        };
        for uri in &uris {
            tables.forward.remove(uri);
        }
        tracing::debug!(pipe.name = pipe_name, purged = uris.len(), "pipe key mappings purged");
        uris.len()
    }

    pub fn len(&self) -> usize {
        self.tables.lock().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PipeKeyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("PipeKeyCache")
            .field("forward", &tables.forward.len())
            .field("reverse", &tables.reverse.len())
            .finish()
    }
}
