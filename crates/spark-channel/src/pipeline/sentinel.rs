//! 流水线两端的哨兵处理器。
//!
//! # 设计背景（Why）
//! - 头哨兵面向传输：出站操作抵达头部后转交通道的底层操作；
//! - 尾哨兵面向用户：入站事件抵达尾部说明没有处理器消费它，需要释放资源并留下日志。
//!
//! # 契约说明（What）
//! - 头哨兵在首次注册时回放挂起的 `handler_added`，在通道关闭且注销后销毁流水线；
//! - 尾哨兵从不继续传播，对未处理消息、异常与用户事件的处置委托给 [`UnhandledInboundSink`]。

use std::sync::{Arc, Weak};

use super::{ChannelHandler, ChannelHandlerContext, EventMask};
use crate::channel::{Channel, SocketAddress};
use crate::error::{ChannelError, Result};
use crate::future::ChannelPromise;
use crate::message::{PipelineMessage, UserEvent};

/// 抵达流水线尾部、无人处理的入站事件的处置方式。
///
/// # 契约说明（What）
/// - 默认实现：消息被释放并以 `debug` 记录，异常以 `warn` 记录，用户事件直接丢弃；
/// - 回调运行在通道的事件循环上，不得阻塞。
pub trait UnhandledInboundSink: Send + Sync + 'static {
    fn unhandled_message(&self, ctx: &ChannelHandlerContext, msg: PipelineMessage) {
        tracing::debug!(
            channel.id = %ctx.channel_label(),
            message = ?msg,
            "discarded inbound message that reached the tail of the pipeline"
        );
        msg.release();
    }

    fn unhandled_exception(&self, ctx: &ChannelHandlerContext, cause: ChannelError) {
        tracing::warn!(
            channel.id = %ctx.channel_label(),
            event.kind = "exception_caught",
            error.code = cause.code(),
            error = %cause,
            "an exception_caught event reached the tail of the pipeline; the last handler did not handle it"
        );
    }

    fn unhandled_user_event(&self, ctx: &ChannelHandlerContext, event: UserEvent) {
        tracing::trace!(channel.id = %ctx.channel_label(), "discarded user event that reached the tail of the pipeline");
        drop(event);
    }
}

/// 只记录日志的默认处置。
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingInboundSink;

impl UnhandledInboundSink for LoggingInboundSink {}

pub(crate) struct HeadHandler {
    channel: Weak<Channel>,
}

impl HeadHandler {
    pub(crate) fn new(channel: Weak<Channel>) -> Self {
        Self { channel }
    }

    /// 通道已释放时以 `Closed` 失败 Promise。
    fn channel_or_fail(&self, promise: &ChannelPromise) -> Option<Arc<Channel>> {
        let channel = self.channel.upgrade();
        if channel.is_none() {
            promise.try_failure(ChannelError::Closed);
        }
        channel
    }

    fn read_if_auto_read(&self) {
        if let Some(channel) = self.channel.upgrade() {
            if channel.config().is_auto_read() {
                channel.read();
            }
        }
    }
}

impl ChannelHandler for HeadHandler {
    fn interest(&self) -> EventMask {
        EventMask::ALL
    }

    fn type_name(&self) -> &'static str {
        "HeadContext"
    }

    fn channel_registered(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        if let Some(channel) = self.channel.upgrade() {
            channel.pipeline().invoke_handler_added_if_needed();
        }
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_unregistered();
        if let Some(channel) = self.channel.upgrade() {
            if !channel.is_open() {
                channel.pipeline().destroy();
            }
        }
        Ok(())
    }

    fn channel_active(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_active();
        self.read_if_auto_read();
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_read_complete();
        self.read_if_auto_read();
        Ok(())
    }

    fn bind(&self, _ctx: &Arc<ChannelHandlerContext>, local: SocketAddress, promise: ChannelPromise) -> Result<()> {
        if let Some(channel) = self.channel_or_fail(&promise) {
            channel.unsafe_ops().bind(local, promise);
        }
        Ok(())
    }

    fn connect(
        &self,
        _ctx: &Arc<ChannelHandlerContext>,
        remote: SocketAddress,
        local: Option<SocketAddress>,
        promise: ChannelPromise,
    ) -> Result<()> {
        if let Some(channel) = self.channel_or_fail(&promise) {
            channel.unsafe_ops().connect(remote, local, promise);
        }
        Ok(())
    }

    fn disconnect(&self, _ctx: &Arc<ChannelHandlerContext>, promise: ChannelPromise) -> Result<()> {
        if let Some(channel) = self.channel_or_fail(&promise) {
            channel.unsafe_ops().disconnect(promise);
        }
        Ok(())
    }

    fn close(&self, _ctx: &Arc<ChannelHandlerContext>, promise: ChannelPromise) -> Result<()> {
        if let Some(channel) = self.channel_or_fail(&promise) {
            channel.unsafe_ops().close(promise);
        }
        Ok(())
    }

    fn deregister(&self, _ctx: &Arc<ChannelHandlerContext>, promise: ChannelPromise) -> Result<()> {
        if let Some(channel) = self.channel_or_fail(&promise) {
            channel.unsafe_ops().deregister(promise);
        }
        Ok(())
    }

    fn read(&self, _ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        if let Some(channel) = self.channel.upgrade() {
            channel.unsafe_ops().begin_read();
        }
        Ok(())
    }

    fn write(&self, _ctx: &Arc<ChannelHandlerContext>, msg: PipelineMessage, promise: ChannelPromise) -> Result<()> {
        match self.channel_or_fail(&promise) {
            Some(channel) => channel.unsafe_ops().write(msg, promise),
            None => msg.release(),
        }
        Ok(())
    }

    fn flush(&self, _ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        if let Some(channel) = self.channel.upgrade() {
            channel.unsafe_ops().flush();
        }
        Ok(())
    }
}

pub(crate) struct TailHandler {
    sink: Arc<dyn UnhandledInboundSink>,
}

impl TailHandler {
    pub(crate) fn new(sink: Arc<dyn UnhandledInboundSink>) -> Self {
        Self { sink }
    }
}

impl ChannelHandler for TailHandler {
    fn interest(&self) -> EventMask {
        EventMask::INBOUND
    }

    fn type_name(&self) -> &'static str {
        "TailContext"
    }

    fn channel_registered(&self, _ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        Ok(())
    }

    fn channel_unregistered(&self, _ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        Ok(())
    }

    fn channel_active(&self, _ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        Ok(())
    }

    fn channel_inactive(&self, _ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        Ok(())
    }

    fn channel_read(&self, ctx: &Arc<ChannelHandlerContext>, msg: PipelineMessage) -> Result<()> {
        self.sink.unhandled_message(ctx, msg);
        Ok(())
    }

    fn channel_read_complete(&self, _ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        Ok(())
    }

    fn user_event_triggered(&self, ctx: &Arc<ChannelHandlerContext>, event: UserEvent) -> Result<()> {
        self.sink.unhandled_user_event(ctx, event);
        Ok(())
    }

    fn channel_writability_changed(&self, _ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        Ok(())
    }

    fn exception_caught(&self, ctx: &Arc<ChannelHandlerContext>, cause: ChannelError) -> Result<()> {
        self.sink.unhandled_exception(ctx, cause);
        Ok(())
    }
}
