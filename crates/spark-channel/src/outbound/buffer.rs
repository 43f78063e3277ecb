use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use super::writability::{Transition, WritabilityState};
use crate::error::ChannelError;
use crate::future::ChannelPromise;
use crate::message::PipelineMessage;

struct Entry {
    msg: PipelineMessage,
    /// 写入时刻捕获的估算字节数。
    size: u64,
    promise: ChannelPromise,
}

/// 出站缓冲在结构锁之外需要执行的副作用。
///
/// 缓冲只记录，不回调；持锁方释放锁后按顺序执行这些通知，保证应用代码
/// （Promise 监听器、可写性事件处理器）永远不会在结构锁内运行。
#[derive(Debug)]
pub enum OutboundNotification {
    PromiseSucceeded(ChannelPromise),
    PromiseFailed(ChannelPromise, ChannelError),
    WritabilityChanged { writable: bool },
}

impl OutboundNotification {
    /// 完成 Promise 类通知；可写性通知原样返回，由通道转交流水线。
    pub fn complete_promise(self) -> Option<bool> {
        match self {
            OutboundNotification::PromiseSucceeded(promise) => {
                promise.try_success();
                None
            }
            OutboundNotification::PromiseFailed(promise, cause) => {
                if !promise.try_failure(cause) && !promise.is_void() {
                    tracing::debug!(
                        promise = ?promise,
                        "failed to mark a write promise as failed; it was already completed"
                    );
                }
                None
            }
            OutboundNotification::WritabilityChanged { writable } => Some(writable),
        }
    }
}

/// `ChannelOutboundBuffer` 是通道的待写消息队列。
///
/// # 教案式说明
/// - **意图 (Why)**：把高层的 `write`/`flush` 调用转化为传输层可批量消费的有序条目，
///   同时维护背压计数；
/// - **逻辑 (How)**：
///   - 条目按写入顺序保存在 `VecDeque` 中，`flushed` 记录队首已被 `add_flush` 标记的条目数；
///   - `add_flush` 把全部未刷新条目标记为可写出，并在此刻把 Promise 置为不可取消，
///     已被取消的条目直接丢弃；
///   - 每个条目的字节数在入队时确定并随条目保存，出队时按同一数值扣减；
/// - **契约 (What)**：
///   - 所有结果以 [`OutboundNotification`] 形式累积，调用方通过
///     [`take_notifications`](Self::take_notifications) 在锁外执行；
///   - 消息出队即释放引用（`remove_and_take` 除外，所有权转交调用方）；
/// - **风险 (Trade-offs)**：`fail_flushed` 带重入保护，避免在失败回调链中重复遍历。
pub struct ChannelOutboundBuffer {
    entries: VecDeque<Entry>,
    flushed: usize,
    state: Arc<WritabilityState>,
    notifications: Vec<OutboundNotification>,
    in_fail: bool,
}

impl ChannelOutboundBuffer {
    pub fn new(state: Arc<WritabilityState>) -> Self {
        Self {
            entries: VecDeque::new(),
            flushed: 0,
            state,
            notifications: Vec::new(),
            in_fail: false,
        }
    }

    /// 追加一条未刷新的消息。
    ///
    /// 待写字节溢出时拒绝入队：释放消息并以 [`ChannelError::PendingBytesOverflow`] 失败 Promise。
    pub fn add_message(&mut self, msg: PipelineMessage, size: u64, promise: ChannelPromise) {
        match self.state.add(size) {
            Ok(transition) => {
                self.entries.push_back(Entry { msg, size, promise });
                self.record_transition(transition, true);
            }
            Err(cause) => {
                msg.release();
                self.notifications
                    .push(OutboundNotification::PromiseFailed(promise, cause));
            }
        }
    }

    /// 把所有未刷新条目标记为已刷新。
    pub fn add_flush(&mut self) {
        let mut idx = self.flushed;
        while idx < self.entries.len() {
            if self.entries[idx].promise.set_uncancellable() {
                idx += 1;
                continue;
            }
            // Promise 已取消：条目不再写出。
            if let Some(entry) = self.entries.remove(idx) {
                entry.msg.release();
                let transition = self.state.sub(entry.size);
                self.record_transition(transition, true);
            }
        }
        self.flushed = self.entries.len();
    }

    /// 当前待写出的消息（已刷新前缀的队首）。
    pub fn current(&self) -> Option<&PipelineMessage> {
        self.flushed_front().map(|entry| &entry.msg)
    }

    pub fn current_mut(&mut self) -> Option<&mut PipelineMessage> {
        if self.flushed == 0 {
            return None;
        }
        self.entries.front_mut().map(|entry| &mut entry.msg)
    }

    /// 当前消息入队时记录的字节数。
    pub fn current_size(&self) -> Option<u64> {
        self.flushed_front().map(|entry| entry.size)
    }

    /// 移除当前消息并成功其 Promise；队列无已刷新条目时返回 `false`。
    pub fn remove(&mut self) -> bool {
        let Some(entry) = self.pop_flushed() else {
            return false;
        };
        entry.msg.release();
        self.notifications
            .push(OutboundNotification::PromiseSucceeded(entry.promise));
        let transition = self.state.sub(entry.size);
        self.record_transition(transition, true);
        true
    }

    /// 移除当前消息并以 `cause` 失败其 Promise。
    pub fn remove_with_error(&mut self, cause: ChannelError) -> bool {
        self.remove_failed(cause, true)
    }

    /// 移除当前消息并把所有权交给调用方；Promise 视为成功。
    pub fn remove_and_take(&mut self) -> Option<PipelineMessage> {
        let entry = self.pop_flushed()?;
        self.notifications
            .push(OutboundNotification::PromiseSucceeded(entry.promise));
        let transition = self.state.sub(entry.size);
        self.record_transition(transition, true);
        Some(entry.msg)
    }

    /// 按实际写出的字节数推进：完整写出的缓冲被移除，部分写出的缓冲跳过已写部分。
    ///
    /// 遇到非缓冲消息时停止。
    pub fn remove_bytes(&mut self, mut written: u64) {
        while written > 0 {
            let readable = match self.current() {
                Some(PipelineMessage::Buffer(buf)) => buf.readable_bytes() as u64,
                _ => break,
            };
            if readable <= written {
                written -= readable;
                self.remove();
                continue;
            }
            if let Some(PipelineMessage::Buffer(buf)) = self.current_mut() {
                // `written < readable ≤ usize::MAX`，转换不会截断。
                if let Err(err) = buf.skip_bytes(written as usize) {
                    tracing::warn!(error = %err, "failed to skip written bytes of a partially flushed buffer");
                }
            }
            break;
        }
        self.clear_empty_buffers();
    }

    /// 收集已刷新前缀中连续缓冲消息的分片，供聚集写使用。
    ///
    /// 最多返回 `max_count` 个分片、累计不超过 `max_bytes` 字节（至少返回一个分片）。
    pub fn flushed_byte_chunks(&self, max_count: usize, max_bytes: u64) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        let mut total = 0u64;
        for entry in self.entries.iter().take(self.flushed) {
            let PipelineMessage::Buffer(buf) = &entry.msg else {
                break;
            };
            let Ok(iter) = buf.chunks() else {
                break;
            };
            for chunk in iter {
                if chunks.len() >= max_count {
                    return chunks;
                }
                let next = total.saturating_add(chunk.len() as u64);
                if next > max_bytes && !chunks.is_empty() {
                    return chunks;
                }
                total = next;
                chunks.push(chunk.clone());
            }
        }
        chunks
    }

    /// 依次访问已刷新的消息与其字节数，回调返回 `false` 时停止。
    pub fn for_each_flushed(&self, mut visit: impl FnMut(&PipelineMessage, u64) -> bool) {
        for entry in self.entries.iter().take(self.flushed) {
            if !visit(&entry.msg, entry.size) {
                break;
            }
        }
    }

    /// 以 `cause` 失败全部已刷新条目；`notify` 决定扣减字节时是否报告可写性变化。
    pub fn fail_flushed(&mut self, cause: &ChannelError, notify: bool) {
        if self.in_fail {
            return;
        }
        self.in_fail = true;
        while self.flushed > 0 {
            self.remove_failed(cause.clone(), notify);
        }
        self.in_fail = false;
    }

    /// 以 `cause` 失败剩余的全部条目（通常只剩未刷新条目），不报告可写性变化。
    pub fn close(&mut self, cause: &ChannelError) {
        if self.in_fail {
            return;
        }
        self.in_fail = true;
        self.flushed = 0;
        for entry in std::mem::take(&mut self.entries) {
            entry.msg.release();
            self.state.sub(entry.size);
            self.notifications
                .push(OutboundNotification::PromiseFailed(entry.promise, cause.clone()));
        }
        self.in_fail = false;
    }

    /// 取走累积的通知，调用方须在释放结构锁之后执行。
    pub fn take_notifications(&mut self) -> Vec<OutboundNotification> {
        std::mem::take(&mut self.notifications)
    }

    /// 全部条目数（含未刷新）。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否没有待写出的已刷新条目。
    pub fn is_empty(&self) -> bool {
        self.flushed == 0
    }

    pub fn flushed_len(&self) -> usize {
        self.flushed
    }

    pub fn total_pending_write_bytes(&self) -> u64 {
        self.state.pending_bytes()
    }

    pub fn is_writable(&self) -> bool {
        self.state.is_writable()
    }

    fn flushed_front(&self) -> Option<&Entry> {
        if self.flushed == 0 {
            return None;
        }
        self.entries.front()
    }

    fn pop_flushed(&mut self) -> Option<Entry> {
        if self.flushed == 0 {
            return None;
        }
        let entry = self.entries.pop_front()?;
        self.flushed -= 1;
        Some(entry)
    }

    fn remove_failed(&mut self, cause: ChannelError, notify: bool) -> bool {
        let Some(entry) = self.pop_flushed() else {
            return false;
        };
        entry.msg.release();
        self.notifications
            .push(OutboundNotification::PromiseFailed(entry.promise, cause));
        let transition = self.state.sub(entry.size);
        self.record_transition(transition, notify);
        true
    }

    fn clear_empty_buffers(&mut self) {
        while matches!(self.current(), Some(PipelineMessage::Buffer(buf)) if buf.is_empty()) {
            self.remove();
        }
    }

    fn record_transition(&mut self, transition: Transition, notify: bool) {
        if !notify {
            return;
        }
        match transition {
            Transition::Unchanged => {}
            Transition::BecameUnwritable => self
                .notifications
                .push(OutboundNotification::WritabilityChanged { writable: false }),
            Transition::BecameWritable => self
                .notifications
                .push(OutboundNotification::WritabilityChanged { writable: true }),
        }
    }
}

impl Drop for ChannelOutboundBuffer {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            tracing::debug!(
                remaining = self.entries.len(),
                "outbound buffer dropped with pending entries; releasing them"
            );
            self.close(&ChannelError::Closed);
        }
        for notification in self.take_notifications() {
            notification.complete_promise();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChannelConfig, WriteBufferWaterMark};
    use spark_buffer::{ByteBuf, ReferenceCounted};

    fn buffer(low: u64, high: u64) -> ChannelOutboundBuffer {
        let config = Arc::new(ChannelConfig::detached());
        config
            .set_write_buffer_water_mark(WriteBufferWaterMark::new(low, high).expect("合法水位"))
            .expect("设置水位");
        ChannelOutboundBuffer::new(Arc::new(WritabilityState::new(config)))
    }

    fn writability_events(notifications: &[OutboundNotification]) -> Vec<bool> {
        notifications
            .iter()
            .filter_map(|n| match n {
                OutboundNotification::WritabilityChanged { writable } => Some(*writable),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn flush_boundary_only_covers_earlier_writes() {
        let mut out = buffer(8, 16);
        out.add_message(ByteBuf::from_static(b"a").into(), 1, ChannelPromise::new());
        assert!(out.current().is_none(), "未刷新的条目不可见");
        out.add_flush();
        out.add_message(ByteBuf::from_static(b"b").into(), 1, ChannelPromise::new());
        assert_eq!(out.flushed_len(), 1);
        assert!(out.remove());
        assert!(!out.remove(), "第二条尚未刷新");
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn cancelled_promises_are_dropped_on_flush() {
        let mut out = buffer(8, 16);
        let buf = ByteBuf::from_static(b"cancel me");
        let probe = buf.clone();
        let promise = ChannelPromise::new();
        out.add_message(buf.into(), 9, promise.clone());
        assert!(promise.cancel());
        out.add_flush();
        assert!(out.is_empty());
        assert_eq!(out.total_pending_write_bytes(), 0);
        assert_eq!(probe.ref_cnt(), 0, "被取消的消息应释放");
    }

    #[test]
    fn writability_toggles_once_per_crossing() {
        let mut out = buffer(8, 16);
        for _ in 0..5 {
            out.add_message(ByteBuf::from_static(b"0123").into(), 4, ChannelPromise::new());
        }
        out.add_flush();
        for _ in 0..5 {
            out.remove();
        }
        let events = writability_events(&out.take_notifications());
        assert_eq!(events, vec![false, true]);
    }

    #[test]
    fn fail_flushed_leaves_unflushed_entries() {
        let mut out = buffer(8, 16);
        let flushed = ChannelPromise::new();
        let pending = ChannelPromise::new();
        out.add_message(ByteBuf::from_static(b"x").into(), 1, flushed.clone());
        out.add_flush();
        out.add_message(ByteBuf::from_static(b"y").into(), 1, pending.clone());
        out.fail_flushed(&ChannelError::NotYetConnected, true);
        for n in out.take_notifications() {
            n.complete_promise();
        }
        assert!(matches!(flushed.cause(), Some(ChannelError::NotYetConnected)));
        assert!(!pending.is_done());
        out.close(&ChannelError::Closed);
        for n in out.take_notifications() {
            n.complete_promise();
        }
        assert!(matches!(pending.cause(), Some(ChannelError::Closed)));
    }

    #[test]
    fn remove_bytes_handles_partial_writes() {
        let mut out = buffer(64, 128);
        out.add_message(ByteBuf::from_static(b"hello").into(), 5, ChannelPromise::new());
        out.add_message(ByteBuf::from_static(b"world").into(), 5, ChannelPromise::new());
        out.add_flush();
        out.remove_bytes(7);
        assert_eq!(out.flushed_len(), 1);
        let rest = out.current().and_then(PipelineMessage::as_buffer).expect("剩余缓冲");
        assert_eq!(rest.to_vec().expect("可读"), b"rld");
        assert_eq!(out.total_pending_write_bytes(), 5, "部分写出不扣减字节");
    }

    #[test]
    fn byte_chunks_respect_limits() {
        let mut out = buffer(64, 128);
        for payload in [&b"ab"[..], b"cd", b"ef"] {
            out.add_message(ByteBuf::copy_from_slice(payload).into(), 2, ChannelPromise::new());
        }
        out.add_message(PipelineMessage::user(7u32), 0, ChannelPromise::new());
        out.add_flush();
        assert_eq!(out.flushed_byte_chunks(16, 1024).len(), 3, "遇到业务对象即停止");
        assert_eq!(out.flushed_byte_chunks(2, 1024).len(), 2);
        assert_eq!(out.flushed_byte_chunks(16, 3).len(), 1);
    }
}
