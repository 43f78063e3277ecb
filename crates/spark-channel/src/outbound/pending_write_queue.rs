use std::collections::VecDeque;
use std::sync::Arc;

use crate::channel::Channel;
use crate::error::ChannelError;
use crate::future::{ChannelFuture, ChannelPromise, PromiseCombiner};
use crate::message::PipelineMessage;
use crate::pipeline::ChannelHandlerContext;

struct PendingWrite {
    msg: PipelineMessage,
    size: u64,
    promise: ChannelPromise,
}

/// `PendingWriteQueue` 暂存处理器尚不能向下游转发的写操作。
///
/// # 教案式说明
/// - **意图 (Why)**：握手未完成、对端窗口耗尽等场景下，处理器需要先截留写入，
///   之后再一次性放行或失败；
/// - **逻辑 (How)**：条目按写入顺序保存；入队时估算字节数并计入通道的待写字节，
///   出队时原样扣减，使截留的数据同样参与背压；
/// - **契约 (What)**：
///   - 只能在所属上下文的执行器上使用；
///   - 放行通过 `ctx.write_with_promise` 继续沿出站方向传递，不会自动 flush；
///   - 失败路径释放消息引用并以给定原因失败 Promise。
pub struct PendingWriteQueue {
    ctx: Arc<ChannelHandlerContext>,
    channel: Option<Arc<Channel>>,
    entries: VecDeque<PendingWrite>,
    bytes: u64,
}

impl PendingWriteQueue {
    pub fn new(ctx: &Arc<ChannelHandlerContext>) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            channel: ctx.try_channel(),
            entries: VecDeque::new(),
            bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 截留写入的估算字节总数。
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn add(&mut self, msg: PipelineMessage, promise: ChannelPromise) {
        let size = self
            .channel
            .as_ref()
            .map_or(0, |channel| channel.estimate_size(&msg));
        self.bytes = self.bytes.saturating_add(size);
        if let Some(channel) = &self.channel {
            channel.increment_pending_outbound_bytes(size);
        }
        self.entries.push_back(PendingWrite { msg, size, promise });
    }

    /// 队首消息。
    pub fn current(&self) -> Option<&PipelineMessage> {
        self.entries.front().map(|write| &write.msg)
    }

    /// 放行全部截留写入；返回聚合了各写 Promise 的 Future，队列为空时返回 `None`。
    ///
    /// 放行过程中新加入的写入同样会被放行。
    pub fn remove_and_write_all(&mut self) -> Option<ChannelFuture> {
        if self.entries.is_empty() {
            return None;
        }
        let aggregate = self.ctx.new_promise();
        let combiner = PromiseCombiner::new();
        while !self.entries.is_empty() {
            let batch: Vec<_> = self.entries.drain(..).collect();
            for write in batch {
                self.release_accounting(write.size);
                if !write.promise.is_void() {
                    // 非 void Promise 可以注册监听器。
                    let _ = combiner.add(&write.promise.future());
                }
                self.forward(write.msg, write.promise);
            }
        }
        if let Err(err) = combiner.finish(aggregate.clone()) {
            aggregate.try_failure(err);
        }
        Some(aggregate.future())
    }

    /// 放行队首写入；返回其 Future。
    pub fn remove_and_write(&mut self) -> Option<ChannelFuture> {
        let write = self.entries.pop_front()?;
        self.release_accounting(write.size);
        let future = write.promise.future();
        self.forward(write.msg, write.promise);
        Some(future)
    }

    /// 失败全部截留写入并释放消息。
    pub fn remove_and_fail_all(&mut self, cause: &ChannelError) {
        // 失败回调可能重新写入本队列，按批次处理直到清空。
        while !self.entries.is_empty() {
            let batch: Vec<_> = self.entries.drain(..).collect();
            for write in batch {
                self.release_accounting(write.size);
                write.msg.release();
                write.promise.try_failure(cause.clone());
            }
        }
    }

    /// 失败队首写入。
    pub fn remove_and_fail(&mut self, cause: ChannelError) {
        if let Some(write) = self.entries.pop_front() {
            self.release_accounting(write.size);
            write.msg.release();
            write.promise.try_failure(cause);
        }
    }

    /// 移除队首写入并释放消息，返回其 Promise 交由调用方处理。
    pub fn remove(&mut self) -> Option<ChannelPromise> {
        let write = self.entries.pop_front()?;
        self.release_accounting(write.size);
        write.msg.release();
        Some(write.promise)
    }

    fn forward(&self, msg: PipelineMessage, promise: ChannelPromise) {
        // 转发失败时消息与 Promise 已由上下文处理，这里只补一条诊断。
        if let Err(err) = self.ctx.write_with_promise(msg, promise) {
            tracing::debug!(
                handler.name = %self.ctx.name(),
                error.code = err.code(),
                "pending write could not be forwarded"
            );
        }
    }

    fn release_accounting(&mut self, size: u64) {
        self.bytes = self.bytes.saturating_sub(size);
        if let Some(channel) = &self.channel {
            channel.decrement_pending_outbound_bytes(size);
        }
    }
}

impl Drop for PendingWriteQueue {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            self.remove_and_fail_all(&ChannelError::Closed);
        }
    }
}
