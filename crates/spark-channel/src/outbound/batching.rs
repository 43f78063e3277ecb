use std::collections::VecDeque;
use std::sync::Arc;

use spark_buffer::ByteBuf;

use crate::channel::Channel;
use crate::error::{ChannelError, Result};
use crate::future::{ChannelFuture, ChannelPromise, PromiseCombiner};
use crate::message::PipelineMessage;
use crate::pipeline::ChannelHandlerContext;

struct BatchedWrite {
    msg: PipelineMessage,
    size: u64,
    promises: Vec<ChannelPromise>,
}

impl BatchedWrite {
    /// 把 `buf` 拼接到本条写入；仅当本条也是缓冲消息时成立。
    fn try_merge(&mut self, buf: ByteBuf, size: u64, promise: ChannelPromise) -> Result<(), (ByteBuf, ChannelPromise)> {
        let PipelineMessage::Buffer(tail) = &mut self.msg else {
            return Err((buf, promise));
        };
        if let Err(err) = tail.append(buf.clone()) {
            tracing::debug!(error = %err, "buffer could not be batched; queueing it separately");
            return Err((buf, promise));
        }
        self.size += size;
        self.promises.push(promise);
        Ok(())
    }

    /// 合并后的写入只携带一个 Promise：单个时原样使用，多个时由新 Promise 级联回各原始 Promise。
    fn into_parts(self, ctx: &ChannelHandlerContext) -> (PipelineMessage, ChannelPromise) {
        let mut promises = self.promises;
        if promises.len() == 1 {
            if let Some(promise) = promises.pop() {
                return (self.msg, promise);
            }
        }
        let combined = ctx.new_promise();
        for promise in promises {
            if promise.is_void() {
                continue;
            }
            // `combined` 非 void，注册监听器不会失败。
            let _ = combined.link_outcome(&promise);
        }
        (self.msg, combined)
    }
}

/// `BatchingPendingWriteQueue` 在截留写入的同时把相邻的小缓冲合并为一次写入。
///
/// # 契约说明（What）
/// - 新缓冲与队尾缓冲的估算字节之和不超过 `max_size` 时合并，否则另起一条；
/// - 合并后的写入完成时，其结果级联到每个原始 Promise；
/// - 业务对象消息从不合并；
/// - 截留的字节同样计入通道待写字节，参与背压。
pub struct BatchingPendingWriteQueue {
    ctx: Arc<ChannelHandlerContext>,
    channel: Option<Arc<Channel>>,
    max_size: u64,
    entries: VecDeque<BatchedWrite>,
    bytes: u64,
}

impl BatchingPendingWriteQueue {
    pub fn new(ctx: &Arc<ChannelHandlerContext>, max_size: u64) -> Self {
        Self {
            ctx: Arc::clone(ctx),
            channel: ctx.try_channel(),
            max_size,
            entries: VecDeque::new(),
            bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 合并后的写入条数。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

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

        let (msg, promise) = match msg {
            PipelineMessage::Buffer(buf) => match self.entries.back_mut() {
                Some(tail) if tail.size.saturating_add(size) <= self.max_size => {
                    match tail.try_merge(buf, size, promise) {
                        Ok(()) => return,
                        Err((buf, promise)) => (PipelineMessage::Buffer(buf), promise),
                    }
                }
                _ => (PipelineMessage::Buffer(buf), promise),
            },
            other => (other, promise),
        };
        self.entries.push_back(BatchedWrite {
            msg,
            size,
            promises: vec![promise],
        });
    }

    pub fn current(&self) -> Option<&PipelineMessage> {
        self.entries.front().map(|write| &write.msg)
    }

    /// 放行全部写入；返回聚合 Future，队列为空时返回 `None`。
    pub fn remove_and_write_all(&mut self) -> Option<ChannelFuture> {
        if self.entries.is_empty() {
            return None;
        }
        let aggregate = self.ctx.new_promise();
        let combiner = PromiseCombiner::new();
        while let Some(write) = self.entries.pop_front() {
            self.release_accounting(write.size);
            let (msg, promise) = write.into_parts(&self.ctx);
            if !promise.is_void() {
                let _ = combiner.add(&promise.future());
            }
            self.forward(msg, promise);
        }
        if let Err(err) = combiner.finish(aggregate.clone()) {
            aggregate.try_failure(err);
        }
        Some(aggregate.future())
    }

    pub fn remove_and_write(&mut self) -> Option<ChannelFuture> {
        let write = self.entries.pop_front()?;
        self.release_accounting(write.size);
        let (msg, promise) = write.into_parts(&self.ctx);
        let future = promise.future();
        self.forward(msg, promise);
        Some(future)
    }

    pub fn remove_and_fail_all(&mut self, cause: &ChannelError) {
        while let Some(write) = self.entries.pop_front() {
            self.release_accounting(write.size);
            write.msg.release();
            for promise in write.promises {
                promise.try_failure(cause.clone());
            }
        }
    }

    /// 移除队首合并写入并释放消息，返回其全部原始 Promise。
    pub fn remove(&mut self) -> Option<Vec<ChannelPromise>> {
        let write = self.entries.pop_front()?;
        self.release_accounting(write.size);
        write.msg.release();
        Some(write.promises)
    }

    fn forward(&self, msg: PipelineMessage, promise: ChannelPromise) {
        if let Err(err) = self.ctx.write_with_promise(msg, promise) {
            tracing::debug!(
                handler.name = %self.ctx.name(),
                error.code = err.code(),
                "batched write could not be forwarded"
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

impl Drop for BatchingPendingWriteQueue {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            self.remove_and_fail_all(&ChannelError::Closed);
        }
    }
}
