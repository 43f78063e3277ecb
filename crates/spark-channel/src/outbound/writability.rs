use std::sync::Arc;
#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

// 模型检查构建下换用 loom 的原子类型，使其能枚举 `add`/`sub` 的交错；配置仍走标准 `Arc`。
#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};

/// 水位线占用的不可写位。
const WATER_MARK_BIT: u32 = 1;

/// 可写状态的一次布尔翻转。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    Unchanged,
    BecameUnwritable,
    BecameWritable,
}

impl Transition {
    pub(crate) fn changed(self) -> bool {
        !matches!(self, Transition::Unchanged)
    }
}

/// `WritabilityState` 聚合待写字节数与不可写位图。
///
/// # 教案式说明
/// - **意图 (Why)**：出站缓冲与各类挂起写队列共享同一份背压计数，通道据此对外报告可写性；
/// - **逻辑 (How)**：
///   - `pending` 为待写字节总数，`add` 溢出时拒绝而非回绕，`sub` 饱和到 0；
///   - `unwritable` 位图中第 0 位由水位线控制，1..=31 位留给处理器自定义；
///   - 水位线带滞回：`pending ≥ high` 才置位，`pending ≤ low` 才清位；
/// - **契约 (What)**：只有位图在“全零 ↔ 非零”之间翻转时才返回 [`Transition`] 变化，
///   单次字节增减不会重复报告；
/// - **风险 (Trade-offs)**：全部使用原子操作，`Channel::is_writable` 可在任意线程无锁读取；
///   翻转的判定仍以事件循环串行化为前提。
pub struct WritabilityState {
    pending: AtomicU64,
    unwritable: AtomicU32,
    config: Arc<ChannelConfig>,
}

impl WritabilityState {
    pub fn new(config: Arc<ChannelConfig>) -> Self {
        Self {
            pending: AtomicU64::new(0),
            unwritable: AtomicU32::new(0),
            config,
        }
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_writable(&self) -> bool {
        self.unwritable.load(Ordering::Acquire) == 0
    }

    /// 距离变为不可写还能写入的字节数；已不可写时为 0。
    pub fn bytes_before_unwritable(&self) -> u64 {
        if !self.is_writable() {
            return 0;
        }
        let high = self.config.write_buffer_water_mark().high;
        high.saturating_sub(self.pending_bytes())
    }

    /// 距离恢复可写还需排空的字节数；可写时为 0。
    pub fn bytes_before_writable(&self) -> u64 {
        if self.is_writable() {
            return 0;
        }
        let low = self.config.write_buffer_water_mark().low;
        self.pending_bytes().saturating_sub(low)
    }

    /// 自定义可写位 `index`（1..=31）当前是否为可写。
    pub fn user_defined_writability(&self, index: u32) -> Result<bool> {
        let mask = user_defined_mask(index)?;
        Ok(self.unwritable.load(Ordering::Acquire) & mask == 0)
    }

    pub(crate) fn set_user_defined_writability(&self, index: u32, writable: bool) -> Result<Transition> {
        let mask = user_defined_mask(index)?;
        Ok(if writable {
            self.clear_bits(mask)
        } else {
            self.set_bits(mask)
        })
    }

    /// 增加待写字节；越过高水位时置位。
    pub(crate) fn add(&self, size: u64) -> Result<Transition> {
        if size == 0 {
            return Ok(Transition::Unchanged);
        }
        let mut current = self.pending.load(Ordering::Acquire);
        let updated = loop {
            let Some(next) = current.checked_add(size) else {
                return Err(ChannelError::PendingBytesOverflow {
                    pending: current,
                    size,
                });
            };
            match self.pending.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break next,
                Err(actual) => current = actual,
            }
        };
        if updated >= self.config.write_buffer_water_mark().high {
            return Ok(self.set_bits(WATER_MARK_BIT));
        }
        Ok(Transition::Unchanged)
    }

    /// 减少待写字节（饱和到 0）；降到低水位及以下时清位。
    pub(crate) fn sub(&self, size: u64) -> Transition {
        if size == 0 {
            return Transition::Unchanged;
        }
        let previous = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            })
            .unwrap_or_else(|current| current);
        let updated = previous.saturating_sub(size);
        if updated <= self.config.write_buffer_water_mark().low {
            return self.clear_bits(WATER_MARK_BIT);
        }
        Transition::Unchanged
    }

    fn set_bits(&self, mask: u32) -> Transition {
        let previous = self.unwritable.fetch_or(mask, Ordering::AcqRel);
        if previous == 0 {
            Transition::BecameUnwritable
        } else {
            Transition::Unchanged
        }
    }

    fn clear_bits(&self, mask: u32) -> Transition {
        let previous = self.unwritable.fetch_and(!mask, Ordering::AcqRel);
        if previous != 0 && previous & !mask == 0 {
            Transition::BecameWritable
        } else {
            Transition::Unchanged
        }
    }
}

fn user_defined_mask(index: u32) -> Result<u32> {
    if !(1..=31).contains(&index) {
        return Err(ChannelError::invalid_config(format!(
            "user defined writability index must be in 1..=31, got {index}"
        )));
    }
    Ok(1 << index)
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::config::WriteBufferWaterMark;

    fn state(low: u64, high: u64) -> WritabilityState {
        let config = Arc::new(ChannelConfig::detached());
        config
            .set_write_buffer_water_mark(WriteBufferWaterMark::new(low, high).expect("合法水位"))
            .expect("设置水位");
        WritabilityState::new(config)
    }

    #[test]
    fn hysteresis_between_marks() {
        let state = state(8, 16);
        assert_eq!(state.add(10).expect("未溢出"), Transition::Unchanged);
        assert_eq!(state.add(6).expect("未溢出"), Transition::BecameUnwritable);
        assert_eq!(state.add(4).expect("未溢出"), Transition::Unchanged);
        assert_eq!(state.sub(10), Transition::Unchanged, "10 字节仍高于低水位");
        assert!(!state.is_writable());
        assert_eq!(state.bytes_before_writable(), 2);
        assert_eq!(state.sub(2), Transition::BecameWritable);
        assert_eq!(state.sub(100), Transition::Unchanged);
        assert_eq!(state.pending_bytes(), 0, "减法饱和到 0");
    }

    #[test]
    fn overflow_is_rejected_without_wrapping() {
        let state = state(8, 16);
        state.add(u64::MAX - 1).expect("首次增加");
        let err = state.add(2).expect_err("溢出必须拒绝");
        assert!(matches!(err, ChannelError::PendingBytesOverflow { size: 2, .. }));
        assert_eq!(state.pending_bytes(), u64::MAX - 1);
    }

    #[test]
    fn user_bits_combine_with_water_mark() {
        let state = state(8, 16);
        assert_eq!(
            state.set_user_defined_writability(3, false).expect("合法索引"),
            Transition::BecameUnwritable
        );
        assert_eq!(state.add(20).expect("未溢出"), Transition::Unchanged);
        assert_eq!(state.sub(20), Transition::Unchanged, "自定义位仍然置位");
        assert_eq!(
            state.set_user_defined_writability(3, true).expect("合法索引"),
            Transition::BecameWritable
        );
        assert!(state.set_user_defined_writability(0, false).is_err());
        assert!(state.user_defined_writability(32).is_err());
    }
}

#[cfg(all(test, loom))]
mod loom_model {
    use super::*;
    use crate::config::WriteBufferWaterMark;
    use loom::{model, thread};

    fn shared_state() -> loom::sync::Arc<WritabilityState> {
        let config = Arc::new(ChannelConfig::detached());
        config
            .set_write_buffer_water_mark(WriteBufferWaterMark::new(8, 16).expect("合法水位"))
            .expect("设置水位");
        loom::sync::Arc::new(WritabilityState::new(config))
    }

    fn flips(transitions: &[Transition]) -> (usize, usize) {
        let unwritable = transitions
            .iter()
            .filter(|t| **t == Transition::BecameUnwritable)
            .count();
        let writable = transitions
            .iter()
            .filter(|t| **t == Transition::BecameWritable)
            .count();
        (unwritable, writable)
    }

    #[test]
    fn racing_add_and_sub_settle_writable_with_balanced_flips() {
        // 两个线程各自先加后减：无论如何交错，最终计数归零、通道可写，且翻转成对出现。
        model(|| {
            let state = shared_state();
            let workers: Vec<_> = [10u64, 12]
                .into_iter()
                .map(|size| {
                    let state = loom::sync::Arc::clone(&state);
                    thread::spawn(move || {
                        let added = state.add(size).expect("未溢出");
                        let removed = state.sub(size);
                        vec![added, removed]
                    })
                })
                .collect();
            let mut transitions = Vec::new();
            for worker in workers {
                transitions.extend(worker.join().expect("线程不应 panic"));
            }

            assert_eq!(state.pending_bytes(), 0);
            assert!(state.is_writable());
            let (unwritable, writable) = flips(&transitions);
            assert_eq!(unwritable, writable, "每次变为不可写都应对应一次恢复");
            assert!(unwritable <= 1, "两次增量之和才越过高水位，至多翻转一次");
        });
    }

    #[test]
    fn user_bit_and_water_mark_race_reports_each_flip_once() {
        model(|| {
            let state = shared_state();
            let bytes = {
                let state = loom::sync::Arc::clone(&state);
                thread::spawn(move || {
                    let added = state.add(20).expect("未溢出");
                    let removed = state.sub(20);
                    vec![added, removed]
                })
            };
            let user = {
                let state = loom::sync::Arc::clone(&state);
                thread::spawn(move || {
                    let cleared = state.set_user_defined_writability(1, false).expect("合法索引");
                    let restored = state.set_user_defined_writability(1, true).expect("合法索引");
                    vec![cleared, restored]
                })
            };
            let mut transitions = bytes.join().expect("线程不应 panic");
            transitions.extend(user.join().expect("线程不应 panic"));

            assert!(state.is_writable());
            assert!(state.user_defined_writability(1).expect("合法索引"));
            let (unwritable, writable) = flips(&transitions);
            assert_eq!(unwritable, writable);
            assert!((1..=2).contains(&unwritable), "两个来源重叠时只翻转一次");
        });
    }
}
