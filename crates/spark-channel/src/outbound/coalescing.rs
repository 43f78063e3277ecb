use std::collections::VecDeque;
use std::sync::Arc;

use spark_buffer::ByteBuf;

use crate::channel::Channel;
use crate::error::{ChannelError, Result};
use crate::future::ChannelPromise;
use crate::pipeline::ChannelHandlerContext;

/// 多个缓冲出队时的组合方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompositionStrategy {
    /// 零拷贝复合缓冲，组成部分的计数由复合缓冲接管。
    #[default]
    Composite,
    /// 拷贝拼接为一个连续缓冲，组成部分随即释放。
    Copy,
}

enum QueueItem {
    Buffer(ByteBuf),
    /// 紧随其前一个缓冲的 Promise：该缓冲全部出队时级联聚合结果。
    Promise(ChannelPromise),
}

/// `CoalescingBufferQueue` 按字节数而非写入次数出队缓冲。
///
/// # 教案式说明
/// - **意图 (Why)**：分帧协议需要输出固定大小的块，而上游写入的批次与块边界无关；
/// - **逻辑 (How)**：
///   - 队列交替保存缓冲与其 Promise；
///   - `remove(bytes, aggregate)` 从队首取出恰好 `bytes` 字节，跨越的完整缓冲直接移出，
///     末尾的部分缓冲通过 `read_retained_slice` 切分，剩余部分留在队首；
///   - 被完整跨越的缓冲所附带的 Promise 级联到 `aggregate`；
/// - **契约 (What)**：
///   - `aggregate` 不能是 void Promise，否则返回 [`ChannelError::VoidPromise`]；
///   - 组合失败时释放已取出的缓冲、失败 `aggregate` 并返回错误；
///   - 绑定通道时入队字节计入通道待写字节。
pub struct CoalescingBufferQueue {
    channel: Option<Arc<Channel>>,
    strategy: CompositionStrategy,
    items: VecDeque<QueueItem>,
    readable_bytes: u64,
}

impl CoalescingBufferQueue {
    pub fn new(channel: Option<Arc<Channel>>, strategy: CompositionStrategy) -> Self {
        Self {
            channel,
            strategy,
            items: VecDeque::new(),
            readable_bytes: 0,
        }
    }

    pub fn readable_bytes(&self) -> u64 {
        self.readable_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn add(&mut self, buf: ByteBuf) {
        self.add_with_promise(buf, None);
    }

    /// 追加缓冲；`promise` 在该缓冲被完整出队并写出后完成。void Promise 被忽略。
    pub fn add_with_promise(&mut self, buf: ByteBuf, promise: Option<ChannelPromise>) {
        self.increment(buf.readable_bytes() as u64);
        self.items.push_back(QueueItem::Buffer(buf));
        if let Some(promise) = promise.filter(|p| !p.is_void()) {
            self.items.push_back(QueueItem::Promise(promise));
        }
    }

    /// 插回队首，常用于把已取出但未写完的数据放回。
    pub fn add_first(&mut self, buf: ByteBuf, promise: Option<ChannelPromise>) {
        self.increment(buf.readable_bytes() as u64);
        if let Some(promise) = promise.filter(|p| !p.is_void()) {
            self.items.push_front(QueueItem::Promise(promise));
        }
        self.items.push_front(QueueItem::Buffer(buf));
    }

    /// 出队至多 `bytes` 字节并组合为一个缓冲。
    pub fn remove(&mut self, bytes: u64, aggregate: &ChannelPromise) -> Result<ByteBuf> {
        if aggregate.is_void() {
            return Err(ChannelError::VoidPromise);
        }
        if self.items.is_empty() {
            return Ok(ByteBuf::new());
        }
        let requested = bytes.min(self.readable_bytes);
        let mut remaining = requested;
        let mut taken = Vec::new();
        while let Some(item) = self.items.pop_front() {
            let mut buf = match item {
                QueueItem::Promise(promise) => {
                    // `aggregate` 非 void，注册监听器不会失败。
                    let _ = aggregate.link_outcome(&promise);
                    continue;
                }
                QueueItem::Buffer(buf) => buf,
            };
            let readable = buf.readable_bytes() as u64;
            if readable > remaining {
                if remaining > 0 {
                    match buf.read_retained_slice(remaining as usize) {
                        Ok(slice) => taken.push(slice),
                        Err(err) => {
                            self.items.push_front(QueueItem::Buffer(buf));
                            return Err(self.abort_remove(taken, err.into(), aggregate));
                        }
                    }
                    remaining = 0;
                }
                self.items.push_front(QueueItem::Buffer(buf));
                break;
            }
            remaining -= readable;
            taken.push(buf);
        }
        self.decrement(requested - remaining);
        self.compose(taken, aggregate)
    }

    /// 出队第一个完整缓冲及其 Promise。
    pub fn remove_first(&mut self, aggregate: &ChannelPromise) -> Result<Option<ByteBuf>> {
        if aggregate.is_void() {
            return Err(ChannelError::VoidPromise);
        }
        let buf = loop {
            match self.items.pop_front() {
                None => return Ok(None),
                Some(QueueItem::Promise(promise)) => {
                    let _ = aggregate.link_outcome(&promise);
                }
                Some(QueueItem::Buffer(buf)) => break buf,
            }
        };
        while let Some(QueueItem::Promise(_)) = self.items.front() {
            if let Some(QueueItem::Promise(promise)) = self.items.pop_front() {
                let _ = aggregate.link_outcome(&promise);
            }
        }
        self.decrement(buf.readable_bytes() as u64);
        Ok(Some(buf))
    }

    /// 释放全部缓冲并以 `cause` 失败全部 Promise。
    pub fn release_and_fail_all(&mut self, cause: &ChannelError) {
        let released = self.readable_bytes;
        for item in std::mem::take(&mut self.items) {
            match item {
                QueueItem::Buffer(buf) => {
                    if let Err(err) = spark_buffer::ReferenceCounted::release(&buf) {
                        tracing::warn!(error = %err, "failed to release a coalesced buffer");
                    }
                }
                QueueItem::Promise(promise) => {
                    promise.try_failure(cause.clone());
                }
            }
        }
        self.decrement(released);
    }

    /// 把队列中的缓冲逐个写入 `ctx`，附带各自的 Promise；不触发 flush。
    pub fn write_and_remove_all(&mut self, ctx: &ChannelHandlerContext) {
        let mut pending: Option<ByteBuf> = None;
        while let Some(item) = self.items.pop_front() {
            match item {
                QueueItem::Buffer(buf) => {
                    self.decrement(buf.readable_bytes() as u64);
                    if let Some(previous) = pending.replace(buf) {
                        forward(ctx, previous, ctx.void_promise());
                    }
                }
                QueueItem::Promise(promise) => match pending.take() {
                    Some(buf) => forward(ctx, buf, promise),
                    None => {
                        promise.try_success();
                    }
                },
            }
        }
        if let Some(buf) = pending {
            forward(ctx, buf, ctx.void_promise());
        }
    }

    fn compose(&self, mut taken: Vec<ByteBuf>, aggregate: &ChannelPromise) -> Result<ByteBuf> {
        if taken.len() <= 1 {
            return Ok(taken.pop().unwrap_or_default());
        }
        let composed = match self.strategy {
            CompositionStrategy::Composite => ByteBuf::compose(taken),
            CompositionStrategy::Copy => ByteBuf::concat_copy(taken),
        };
        composed.map_err(|err| {
            let cause = ChannelError::from(err);
            aggregate.try_failure(cause.clone());
            cause
        })
    }

    fn abort_remove(&self, taken: Vec<ByteBuf>, cause: ChannelError, aggregate: &ChannelPromise) -> ChannelError {
        for buf in taken {
            let _ = spark_buffer::ReferenceCounted::release(&buf);
        }
        aggregate.try_failure(cause.clone());
        cause
    }

    fn increment(&mut self, size: u64) {
        self.readable_bytes = self.readable_bytes.saturating_add(size);
        if let Some(channel) = &self.channel {
            channel.increment_pending_outbound_bytes(size);
        }
    }

    fn decrement(&mut self, size: u64) {
        self.readable_bytes = self.readable_bytes.saturating_sub(size);
        if let Some(channel) = &self.channel {
            channel.decrement_pending_outbound_bytes(size);
        }
    }
}

fn forward(ctx: &ChannelHandlerContext, buf: ByteBuf, promise: ChannelPromise) {
    if let Err(err) = ctx.write_with_promise(buf.into(), promise) {
        tracing::debug!(
            handler.name = %ctx.name(),
            error.code = err.code(),
            "coalesced buffer could not be forwarded"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spark_buffer::ReferenceCounted;

    fn queue(strategy: CompositionStrategy) -> CoalescingBufferQueue {
        let mut queue = CoalescingBufferQueue::new(None, strategy);
        queue.add_with_promise(ByteBuf::from_static(b"hello"), Some(ChannelPromise::new()));
        queue.add(ByteBuf::from_static(b"world"));
        queue
    }

    #[test]
    fn removal_spans_buffers_and_splits_the_last() {
        let mut queue = queue(CompositionStrategy::Composite);
        let aggregate = ChannelPromise::new();
        let chunk = queue.remove(7, &aggregate).expect("出队成功");
        assert_eq!(chunk.to_vec().expect("可读"), b"hellowo");
        assert_eq!(queue.readable_bytes(), 3);
        let tail = queue.remove(100, &ChannelPromise::new()).expect("出队剩余");
        assert_eq!(tail.to_vec().expect("可读"), b"rld");
        assert!(queue.is_empty());
    }

    #[test]
    fn constituent_promises_follow_the_aggregate() {
        let mut queue = CoalescingBufferQueue::new(None, CompositionStrategy::Copy);
        let first = ChannelPromise::new();
        queue.add_with_promise(ByteBuf::from_static(b"ab"), Some(first.clone()));
        let aggregate = ChannelPromise::new();
        let chunk = queue.remove(2, &aggregate).expect("出队成功");
        assert_eq!(chunk.to_vec().expect("可读"), b"ab");
        assert!(!first.is_done());
        aggregate.try_failure(ChannelError::Closed);
        assert!(matches!(first.cause(), Some(ChannelError::Closed)));
    }

    #[test]
    fn void_aggregate_is_rejected() {
        let mut queue = queue(CompositionStrategy::Composite);
        let void = ChannelPromise::void(std::sync::Weak::new(), false);
        assert!(matches!(queue.remove(1, &void), Err(ChannelError::VoidPromise)));
        assert_eq!(queue.readable_bytes(), 10, "失败时不消耗任何字节");
    }

    #[test]
    fn release_and_fail_all_releases_buffers() {
        let mut queue = CoalescingBufferQueue::new(None, CompositionStrategy::Composite);
        let buf = ByteBuf::from_static(b"leak?");
        let probe = buf.clone();
        let promise = ChannelPromise::new();
        queue.add_with_promise(buf, Some(promise.clone()));
        queue.release_and_fail_all(&ChannelError::Closed);
        assert_eq!(probe.ref_cnt(), 0);
        assert!(matches!(promise.cause(), Some(ChannelError::Closed)));
        assert_eq!(queue.readable_bytes(), 0);
    }

    #[test]
    fn remove_first_takes_one_buffer_with_its_promise() {
        let mut queue = queue(CompositionStrategy::Composite);
        let aggregate = ChannelPromise::new();
        let first = queue.remove_first(&aggregate).expect("合法调用").expect("非空");
        assert_eq!(first.to_vec().expect("可读"), b"hello");
        assert_eq!(queue.readable_bytes(), 5);
    }
}
