use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hasher};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn random_state() -> &'static RandomState {
    static STATE: OnceLock<RandomState> = OnceLock::new();
    STATE.get_or_init(RandomState::new)
}

/// 通道全局唯一标识。
///
/// # 契约说明（What）
/// - 由进程号、进程内单调序号、创建时刻与随机扰动组成，跨进程碰撞概率可忽略；
/// - 全序：同一进程内按创建顺序递增，可直接作为有序集合的键；
/// - [`ChannelId::as_short_text`] 仅取随机段，适合日志；[`ChannelId::as_long_text`] 含全部字段。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    sequence: u64,
    process_id: u32,
    timestamp_nanos: u64,
    random: u32,
}

impl ChannelId {
    /// 生成新的标识。
    pub fn new_instance() -> Self {
        let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos() as u64)
            .unwrap_or_default();
        let mut hasher = random_state().build_hasher();
        hasher.write_u64(sequence);
        hasher.write_u64(timestamp_nanos);
        Self {
            sequence,
            process_id: std::process::id(),
            timestamp_nanos,
            random: hasher.finish() as u32,
        }
    }

    pub fn as_short_text(&self) -> String {
        format!("{:08x}", self.random)
    }

    pub fn as_long_text(&self) -> String {
        format!(
            "{:08x}-{:016x}-{:016x}-{:08x}",
            self.process_id, self.sequence, self.timestamp_nanos, self.random
        )
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.random)
    }
}
