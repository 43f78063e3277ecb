//! 通道与事件循环配置。
//!
//! # 设计动机（Why）
//! - 通道核心“消费而不拥有”配置：自动读、自动关闭、写自旋次数、高低水位、连接超时等由外部提供，
//!   核心只做范围校验（`low ≤ high`、自旋次数 ≥ 1）；
//! - 运行期可调：[`ChannelConfig`] 以原子量与读写锁保存，处理器可在事件循环内随时修改；
//! - 静态描述：[`ChannelConfigSnapshot`] 可由 TOML 反序列化，再通过 [`ChannelConfig::apply`] 落地。

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::error::{ChannelError, Result};
use crate::message::{DefaultMessageSizeEstimator, MessageSizeEstimator};

/// 默认低水位：32 KiB。
pub const DEFAULT_LOW_WATER_MARK: u64 = 32 * 1024;
/// 默认高水位：64 KiB。
pub const DEFAULT_HIGH_WATER_MARK: u64 = 64 * 1024;
/// 默认连接超时：30 秒。
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// 默认写自旋次数。
pub const DEFAULT_WRITE_SPIN_COUNT: u32 = 16;
/// 默认单次读循环最多处理的消息数。
pub const DEFAULT_MAX_MESSAGES_PER_READ: u32 = 16;

/// 出站缓冲的高/低水位。
///
/// 挂起字节数达到或超过 `high` 时通道变为不可写，回落到 `low` 及以下时恢复可写。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBufferWaterMark {
    pub low: u64,
    pub high: u64,
}

impl WriteBufferWaterMark {
    pub fn new(low: u64, high: u64) -> Result<Self> {
        let mark = Self { low, high };
        mark.validate()?;
        Ok(mark)
    }

    fn validate(&self) -> Result<()> {
        if self.low > self.high {
            return Err(ChannelError::invalid_config(format!(
                "write buffer low water mark {} must not exceed high water mark {}",
                self.low, self.high
            )));
        }
        Ok(())
    }
}

impl Default for WriteBufferWaterMark {
    fn default() -> Self {
        Self {
            low: DEFAULT_LOW_WATER_MARK,
            high: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

/// `ChannelConfig` 是单个通道的运行期配置。
///
/// # 教案式说明
/// - **意图 (Why)**：让处理器在运行中调整背压阈值、自动读等行为，而无需重建通道；
/// - **契约 (What)**：
///   - 所有 setter 只做范围校验，违反时返回 [`ChannelError::InvalidConfig`] 且不修改任何字段；
///   - 打开 `auto_read` 会立即对所属通道发起一次 `read()`，关闭时通知传输层撤销读兴趣；
///   - 水位调整只影响之后的可写性判定，不会立即触发可写性事件；
/// - **设计权衡 (Trade-offs)**：水位与估算器使用读写锁，读取远多于写入；其余标量为原子量。
pub struct ChannelConfig {
    channel: Weak<Channel>,
    auto_read: AtomicBool,
    auto_close: AtomicBool,
    write_spin_count: AtomicU32,
    water_mark: RwLock<WriteBufferWaterMark>,
    connect_timeout_ms: AtomicU64,
    max_messages_per_read: AtomicU32,
    estimator: RwLock<Arc<dyn MessageSizeEstimator>>,
}

impl ChannelConfig {
    /// `max_messages_per_read` 以传输层元数据给出的建议值为初值，0 按 1 处理。
    pub(crate) fn new(channel: Weak<Channel>, max_messages_per_read: u32) -> Self {
        Self {
            channel,
            auto_read: AtomicBool::new(true),
            auto_close: AtomicBool::new(true),
            write_spin_count: AtomicU32::new(DEFAULT_WRITE_SPIN_COUNT),
            water_mark: RwLock::new(WriteBufferWaterMark::default()),
            connect_timeout_ms: AtomicU64::new(DEFAULT_CONNECT_TIMEOUT.as_millis() as u64),
            max_messages_per_read: AtomicU32::new(max_messages_per_read.max(1)),
            estimator: RwLock::new(Arc::new(DefaultMessageSizeEstimator::default())),
        }
    }

    /// 不归属任何通道的配置，供独立使用出站缓冲等组件时构造。
    pub fn detached() -> Self {
        Self::new(Weak::new(), DEFAULT_MAX_MESSAGES_PER_READ)
    }

    pub fn is_auto_read(&self) -> bool {
        self.auto_read.load(Ordering::Acquire)
    }

    pub fn set_auto_read(&self, auto_read: bool) {
        let previous = self.auto_read.swap(auto_read, Ordering::AcqRel);
        if previous == auto_read {
            return;
        }
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        if auto_read {
            channel.read();
        } else {
            channel.auto_read_cleared();
        }
    }

    pub fn is_auto_close(&self) -> bool {
        self.auto_close.load(Ordering::Acquire)
    }

    pub fn set_auto_close(&self, auto_close: bool) {
        self.auto_close.store(auto_close, Ordering::Release);
    }

    pub fn write_spin_count(&self) -> u32 {
        self.write_spin_count.load(Ordering::Acquire)
    }

    pub fn set_write_spin_count(&self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(ChannelError::invalid_config(
                "write spin count must be at least 1",
            ));
        }
        self.write_spin_count.store(count, Ordering::Release);
        Ok(())
    }

    pub fn write_buffer_water_mark(&self) -> WriteBufferWaterMark {
        *self.water_mark.read()
    }

    pub fn set_write_buffer_water_mark(&self, mark: WriteBufferWaterMark) -> Result<()> {
        mark.validate()?;
        *self.water_mark.write() = mark;
        Ok(())
    }

    /// 单独调整高水位，必须不低于当前低水位。
    pub fn set_write_buffer_high_water_mark(&self, high: u64) -> Result<()> {
        let mut mark = self.water_mark.write();
        WriteBufferWaterMark::new(mark.low, high)?;
        mark.high = high;
        Ok(())
    }

    /// 单独调整低水位，必须不高于当前高水位。
    pub fn set_write_buffer_low_water_mark(&self, low: u64) -> Result<()> {
        let mut mark = self.water_mark.write();
        WriteBufferWaterMark::new(low, mark.high)?;
        mark.low = low;
        Ok(())
    }

    /// 连接超时；`Duration::ZERO` 表示不设超时。
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn max_messages_per_read(&self) -> u32 {
        self.max_messages_per_read.load(Ordering::Acquire)
    }

    pub fn set_max_messages_per_read(&self, max: u32) -> Result<()> {
        if max == 0 {
            return Err(ChannelError::invalid_config(
                "max messages per read must be at least 1",
            ));
        }
        self.max_messages_per_read.store(max, Ordering::Release);
        Ok(())
    }

    pub fn message_size_estimator(&self) -> Arc<dyn MessageSizeEstimator> {
        Arc::clone(&self.estimator.read())
    }

    pub fn set_message_size_estimator(&self, estimator: Arc<dyn MessageSizeEstimator>) {
        *self.estimator.write() = estimator;
    }

    /// 应用静态配置；先整体校验，任一字段非法则不修改任何字段。
    pub fn apply(&self, snapshot: &ChannelConfigSnapshot) -> Result<()> {
        snapshot.validate()?;
        if let Some(count) = snapshot.write_spin_count {
            self.set_write_spin_count(count)?;
        }
        if let Some(mark) = snapshot.write_buffer_water_mark {
            self.set_write_buffer_water_mark(mark)?;
        }
        if let Some(max) = snapshot.max_messages_per_read {
            self.set_max_messages_per_read(max)?;
        }
        if let Some(ms) = snapshot.connect_timeout_ms {
            self.set_connect_timeout(Duration::from_millis(ms));
        }
        if let Some(auto_close) = snapshot.auto_close {
            self.set_auto_close(auto_close);
        }
        if let Some(auto_read) = snapshot.auto_read {
            self.set_auto_read(auto_read);
        }
        Ok(())
    }

    /// 当前配置的静态快照（不含估算器）。
    pub fn snapshot(&self) -> ChannelConfigSnapshot {
        ChannelConfigSnapshot {
            auto_read: Some(self.is_auto_read()),
            auto_close: Some(self.is_auto_close()),
            write_spin_count: Some(self.write_spin_count()),
            write_buffer_water_mark: Some(self.write_buffer_water_mark()),
            connect_timeout_ms: Some(self.connect_timeout().as_millis() as u64),
            max_messages_per_read: Some(self.max_messages_per_read()),
        }
    }
}

/// 可序列化的通道配置描述，未出现的字段保持原值。
///
/// ```toml
/// auto_read = false
/// write_spin_count = 8
/// connect_timeout_ms = 5000
///
/// [write_buffer_water_mark]
/// low = 8192
/// high = 16384
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelConfigSnapshot {
    pub auto_read: Option<bool>,
    pub auto_close: Option<bool>,
    pub write_spin_count: Option<u32>,
    pub write_buffer_water_mark: Option<WriteBufferWaterMark>,
    pub connect_timeout_ms: Option<u64>,
    pub max_messages_per_read: Option<u32>,
}

impl ChannelConfigSnapshot {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let snapshot: Self = toml::from_str(source)
            .map_err(|err| ChannelError::invalid_config(err.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    pub fn validate(&self) -> Result<()> {
        if self.write_spin_count == Some(0) {
            return Err(ChannelError::invalid_config(
                "write spin count must be at least 1",
            ));
        }
        if self.max_messages_per_read == Some(0) {
            return Err(ChannelError::invalid_config(
                "max messages per read must be at least 1",
            ));
        }
        if let Some(mark) = &self.write_buffer_water_mark {
            mark.validate()?;
        }
        Ok(())
    }
}

/// 事件循环配置。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventLoopConfig {
    /// 工作线程名（事件循环组会追加 `-<序号>`）。
    pub thread_name: String,
    /// 优雅关闭默认静默期。
    pub quiet_period: Duration,
    /// 优雅关闭默认总超时。
    pub shutdown_timeout: Duration,
}

impl Default for EventLoopConfig {
    fn default() -> Self {
        Self {
            thread_name: "spark-event-loop".to_owned(),
            quiet_period: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawEventLoopConfig {
    thread_name: Option<String>,
    quiet_period_ms: Option<u64>,
    shutdown_timeout_ms: Option<u64>,
}

impl EventLoopConfig {
    /// 从 TOML 读取；缺省字段取默认值。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let raw: RawEventLoopConfig =
            toml::from_str(source).map_err(|err| ChannelError::invalid_config(err.to_string()))?;
        let defaults = Self::default();
        let config = Self {
            thread_name: raw.thread_name.unwrap_or(defaults.thread_name),
            quiet_period: raw
                .quiet_period_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.quiet_period),
            shutdown_timeout: raw
                .shutdown_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),
        };
        if config.thread_name.is_empty() {
            return Err(ChannelError::invalid_config(
                "event loop thread name must not be empty",
            ));
        }
        Ok(config)
    }
}
