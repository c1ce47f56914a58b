//! 配置记录与校验。
//!
//! # 模块定位（Why）
//! - 外部配置（TOML 文件、宿主传入的整数）天然是有符号整数，负数、超出定时器上限的值只能在
//!   入口处拒绝；一旦进入 [`PoolSettings`] 等类型化设置，下游组件即可假定取值合法。
//! - 原始记录（`Raw*`）负责反序列化，设置类型负责携带校验后的值，二者分离后，
//!   校验规则集中在 `validate` 中，可单独测试。
//!
//! # 契约摘要（What）
//! - 所有时长字段以毫秒表示，上限为 `i32::MAX` 毫秒（约 24.8 天），超出返回 [`ConfigError::TooLarge`]；
//! - 所有尺寸字段以字节表示，不得为负；
//! - 启用缓冲池时，单个缓冲上限不得超过池总容量。

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{CoreError, ErrorCategory, codes};

/// 时长字段允许的最大毫秒数。
pub const MAX_TIMEOUT_MS: i64 = i32::MAX as i64;

/// 配置字段标识，用于错误报告。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConfigField {
    PoolIdleTimeout,
    PoolLeaseTimeout,
    PoolMaxOutboundConnections,
    BufferMaxPoolSize,
    BufferMaxBufferSize,
    BufferMaxReceivedMessageSize,
    RetryCount,
    RetryCycleDelay,
    OpenTimeout,
    CloseTimeout,
    SendTimeout,
    ReceiveTimeout,
}

impl ConfigField {
    /// 对应的 TOML 键路径。
    pub const fn key(self) -> &'static str {
        match self {
            Self::PoolIdleTimeout => "pool.idle_timeout_ms",
            Self::PoolLeaseTimeout => "pool.lease_timeout_ms",
            Self::PoolMaxOutboundConnections => "pool.max_outbound_connections_per_endpoint",
            Self::BufferMaxPoolSize => "buffer.max_buffer_pool_size",
            Self::BufferMaxBufferSize => "buffer.max_buffer_size",
            Self::BufferMaxReceivedMessageSize => "buffer.max_received_message_size",
            Self::RetryCount => "retry.receive_retry_count",
            Self::RetryCycleDelay => "retry.retry_cycle_delay_ms",
            Self::OpenTimeout => "timeouts.open_ms",
            Self::CloseTimeout => "timeouts.close_ms",
            Self::SendTimeout => "timeouts.send_ms",
            Self::ReceiveTimeout => "timeouts.receive_ms",
        }
    }
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// 配置校验错误。
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("`{field}` must not be negative (got {value})")]
    Negative { field: ConfigField, value: i64 },
    #[error("`{field}` exceeds the supported ceiling {ceiling} (got {value})")]
    TooLarge {
        field: ConfigField,
        value: i64,
        ceiling: i64,
    },
    #[error("`{field}` is inconsistent: {detail}")]
    Inconsistent { field: ConfigField, detail: String },
    #[error("configuration document is malformed: {0}")]
    Parse(String),
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::new(codes::CONFIG_INVALID, err.to_string())
            .with_category(ErrorCategory::Configuration)
            .with_cause(err)
    }
}

fn duration_ms(field: ConfigField, value: i64) -> Result<Duration, ConfigError> {
    if value < 0 {
        return Err(ConfigError::Negative { field, value });
    }
    if value > MAX_TIMEOUT_MS {
        return Err(ConfigError::TooLarge {
            field,
            value,
            ceiling: MAX_TIMEOUT_MS,
        });
    }
    Ok(Duration::from_millis(value as u64))
}

fn byte_count(field: ConfigField, value: i64) -> Result<usize, ConfigError> {
    if value < 0 {
        return Err(ConfigError::Negative { field, value });
    }
    usize::try_from(value).map_err(|_| ConfigError::TooLarge {
        field,
        value,
        ceiling: isize::MAX as i64,
    })
}

fn duration_to_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// 连接池
// ---------------------------------------------------------------------------

/// 连接池设置。
///
/// 作为注册表中连接池的身份：设置完全相同的工厂共享同一个池，因此实现了 `Hash + Eq`。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PoolSettings {
    group_name: String,
    idle_timeout: Duration,
    lease_timeout: Duration,
    max_outbound_connections_per_endpoint: usize,
}

impl PoolSettings {
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// 连接在池中空闲的最长时间；为零时归还的连接一律关闭。
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// 连接自建立起允许被复用的最长时间。
    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    /// 每个端点最多缓存的空闲连接数。
    pub fn max_outbound_connections_per_endpoint(&self) -> usize {
        self.max_outbound_connections_per_endpoint
    }

    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = group_name.into();
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_max_outbound_connections_per_endpoint(mut self, max: usize) -> Self {
        self.max_outbound_connections_per_endpoint = max;
        self
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            group_name: "default".into(),
            idle_timeout: Duration::from_secs(2 * 60),
            lease_timeout: Duration::from_secs(5 * 60),
            max_outbound_connections_per_endpoint: 10,
        }
    }
}

/// 连接池原始配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawPoolSettings {
    pub group_name: String,
    pub idle_timeout_ms: i64,
    pub lease_timeout_ms: i64,
    pub max_outbound_connections_per_endpoint: i64,
}

impl Default for RawPoolSettings {
    fn default() -> Self {
        let defaults = PoolSettings::default();
        Self {
            group_name: defaults.group_name,
            idle_timeout_ms: duration_to_ms(defaults.idle_timeout),
            lease_timeout_ms: duration_to_ms(defaults.lease_timeout),
            max_outbound_connections_per_endpoint: defaults.max_outbound_connections_per_endpoint
                as i64,
        }
    }
}

impl RawPoolSettings {
    pub fn validate(&self) -> Result<PoolSettings, ConfigError> {
        Ok(PoolSettings {
            group_name: self.group_name.clone(),
            idle_timeout: duration_ms(ConfigField::PoolIdleTimeout, self.idle_timeout_ms)?,
            lease_timeout: duration_ms(ConfigField::PoolLeaseTimeout, self.lease_timeout_ms)?,
            max_outbound_connections_per_endpoint: byte_count(
                ConfigField::PoolMaxOutboundConnections,
                self.max_outbound_connections_per_endpoint,
            )?,
        })
    }
}

// ---------------------------------------------------------------------------
// 缓冲
// ---------------------------------------------------------------------------

/// 缓冲与消息尺寸设置。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BufferSettings {
    max_buffer_pool_size: usize,
    max_buffer_size: usize,
    max_received_message_size: usize,
}

impl BufferSettings {
    /// 直接构造并校验。
    pub fn new(
        max_buffer_pool_size: usize,
        max_buffer_size: usize,
        max_received_message_size: usize,
    ) -> Result<Self, ConfigError> {
        let settings = Self {
            max_buffer_pool_size,
            max_buffer_size,
            max_received_message_size,
        };
        settings.check_consistency()?;
        Ok(settings)
    }

    /// 池中缓存的缓冲总字节数上限；为零表示禁用池化。
    pub fn max_buffer_pool_size(&self) -> usize {
        self.max_buffer_pool_size
    }

    /// 单个可池化缓冲的最大尺寸。
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// 单条接收消息的最大尺寸。
    pub fn max_received_message_size(&self) -> usize {
        self.max_received_message_size
    }

    fn check_consistency(&self) -> Result<(), ConfigError> {
        if self.max_buffer_pool_size > 0 && self.max_buffer_size > self.max_buffer_pool_size {
            return Err(ConfigError::Inconsistent {
                field: ConfigField::BufferMaxBufferSize,
                detail: format!(
                    "max_buffer_size {} exceeds max_buffer_pool_size {}",
                    self.max_buffer_size, self.max_buffer_pool_size
                ),
            });
        }
        Ok(())
    }
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            max_buffer_pool_size: 512 * 1024,
            max_buffer_size: 64 * 1024,
            max_received_message_size: 64 * 1024,
        }
    }
}

/// 缓冲原始配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawBufferSettings {
    pub max_buffer_pool_size: i64,
    pub max_buffer_size: i64,
    pub max_received_message_size: i64,
}

impl Default for RawBufferSettings {
    fn default() -> Self {
        let defaults = BufferSettings::default();
        Self {
            max_buffer_pool_size: defaults.max_buffer_pool_size as i64,
            max_buffer_size: defaults.max_buffer_size as i64,
            max_received_message_size: defaults.max_received_message_size as i64,
        }
    }
}

impl RawBufferSettings {
    pub fn validate(&self) -> Result<BufferSettings, ConfigError> {
        let max_buffer_size = byte_count(ConfigField::BufferMaxBufferSize, self.max_buffer_size)?;
        if self.max_buffer_size > i32::MAX as i64 {
            return Err(ConfigError::TooLarge {
                field: ConfigField::BufferMaxBufferSize,
                value: self.max_buffer_size,
                ceiling: i32::MAX as i64,
            });
        }
        BufferSettings::new(
            byte_count(ConfigField::BufferMaxPoolSize, self.max_buffer_pool_size)?,
            max_buffer_size,
            byte_count(
                ConfigField::BufferMaxReceivedMessageSize,
                self.max_received_message_size,
            )?,
        )
    }
}

// ---------------------------------------------------------------------------
// 重试与毒消息
// ---------------------------------------------------------------------------

/// 接收重试次数。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RetryCount {
    Limited(u32),
    Unlimited,
}

/// 毒消息的最终处置方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoisonDisposition {
    /// 丢弃消息，通道继续工作。
    Drop,
    /// 令接收通道进入故障态。
    #[default]
    Fault,
}

/// 毒消息处理设置。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReceiveRetrySettings {
    receive_retry_count: RetryCount,
    retry_cycle_delay: Duration,
    poison_disposition: PoisonDisposition,
}

impl ReceiveRetrySettings {
    pub fn new(
        receive_retry_count: RetryCount,
        retry_cycle_delay: Duration,
        poison_disposition: PoisonDisposition,
    ) -> Self {
        Self {
            receive_retry_count,
            retry_cycle_delay,
            poison_disposition,
        }
    }

    pub fn receive_retry_count(&self) -> RetryCount {
        self.receive_retry_count
    }

    /// 排队传输在两轮重试之间等待的时长。
    pub fn retry_cycle_delay(&self) -> Duration {
        self.retry_cycle_delay
    }

    pub fn poison_disposition(&self) -> PoisonDisposition {
        self.poison_disposition
    }
}

impl Default for ReceiveRetrySettings {
    fn default() -> Self {
        Self::new(
            RetryCount::Limited(5),
            Duration::from_secs(30 * 60),
            PoisonDisposition::Fault,
        )
    }
}

/// 重试原始配置；`receive_retry_count = -1` 表示不限次数。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawRetrySettings {
    pub receive_retry_count: i64,
    pub retry_cycle_delay_ms: i64,
    pub poison_disposition: PoisonDisposition,
}

impl Default for RawRetrySettings {
    fn default() -> Self {
        let defaults = ReceiveRetrySettings::default();
        Self {
            receive_retry_count: 5,
            retry_cycle_delay_ms: duration_to_ms(defaults.retry_cycle_delay),
            poison_disposition: defaults.poison_disposition,
        }
    }
}

impl RawRetrySettings {
    pub fn validate(&self) -> Result<ReceiveRetrySettings, ConfigError> {
        let receive_retry_count = match self.receive_retry_count {
            -1 => RetryCount::Unlimited,
            value if value < 0 => {
                return Err(ConfigError::Negative {
                    field: ConfigField::RetryCount,
                    value,
                });
            }
            value => RetryCount::Limited(u32::try_from(value).map_err(|_| {
                ConfigError::TooLarge {
                    field: ConfigField::RetryCount,
                    value,
                    ceiling: u32::MAX as i64,
                }
            })?),
        };
        Ok(ReceiveRetrySettings::new(
            receive_retry_count,
            duration_ms(ConfigField::RetryCycleDelay, self.retry_cycle_delay_ms)?,
            self.poison_disposition,
        ))
    }
}

// ---------------------------------------------------------------------------
// 通道超时
// ---------------------------------------------------------------------------

/// 通道默认超时。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChannelTimeouts {
    pub open: Duration,
    pub close: Duration,
    pub send: Duration,
    pub receive: Duration,
}

impl Default for ChannelTimeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(60),
            close: Duration::from_secs(60),
            send: Duration::from_secs(60),
            receive: Duration::from_secs(10 * 60),
        }
    }
}

/// 通道超时原始配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawChannelTimeouts {
    pub open_ms: i64,
    pub close_ms: i64,
    pub send_ms: i64,
    pub receive_ms: i64,
}

impl Default for RawChannelTimeouts {
    fn default() -> Self {
        let defaults = ChannelTimeouts::default();
        Self {
            open_ms: duration_to_ms(defaults.open),
            close_ms: duration_to_ms(defaults.close),
            send_ms: duration_to_ms(defaults.send),
            receive_ms: duration_to_ms(defaults.receive),
        }
    }
}

impl RawChannelTimeouts {
    pub fn validate(&self) -> Result<ChannelTimeouts, ConfigError> {
        Ok(ChannelTimeouts {
            open: duration_ms(ConfigField::OpenTimeout, self.open_ms)?,
            close: duration_ms(ConfigField::CloseTimeout, self.close_ms)?,
            send: duration_ms(ConfigField::SendTimeout, self.send_ms)?,
            receive: duration_ms(ConfigField::ReceiveTimeout, self.receive_ms)?,
        })
    }
}

// ---------------------------------------------------------------------------
// 汇总
// ---------------------------------------------------------------------------

/// TOML 文档的原始形态，缺失的表回退为默认值。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawStrataConfig {
    pub pool: RawPoolSettings,
    pub buffer: RawBufferSettings,
    pub retry: RawRetrySettings,
    pub timeouts: RawChannelTimeouts,
}

impl RawStrataConfig {
    pub fn validate(&self) -> Result<StrataConfig, ConfigError> {
        Ok(StrataConfig {
            pool: self.pool.validate()?,
            buffer: self.buffer.validate()?,
            retry: self.retry.validate()?,
            timeouts: self.timeouts.validate()?,
        })
    }
}

/// 校验后的完整配置。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StrataConfig {
    pub pool: PoolSettings,
    pub buffer: BufferSettings,
    pub retry: ReceiveRetrySettings,
    pub timeouts: ChannelTimeouts,
}

impl StrataConfig {
    /// 解析并校验 TOML 文档。
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let raw: RawStrataConfig =
            toml::from_str(document).map_err(|err| ConfigError::Parse(err.to_string()))?;
        raw.validate()
    }
}
