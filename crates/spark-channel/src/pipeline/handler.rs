use std::any::Any;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;

use super::ChannelHandlerContext;
use crate::channel::SocketAddress;
use crate::error::{ChannelError, Result};
use crate::future::ChannelPromise;
use crate::message::{PipelineMessage, UserEvent};

/// 处理器声明关心的事件集合（跳过掩码的补集）。
///
/// 流水线派发时跳过未声明对应位的处理器，直接转发给下一个节点，省去一次虚调用。
/// `handler_added`/`handler_removed` 不受掩码约束，总会被调用。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventMask(u32);

impl EventMask {
    pub const NONE: Self = Self(0);
    pub const EXCEPTION_CAUGHT: Self = Self(1 << 0);
    pub const CHANNEL_REGISTERED: Self = Self(1 << 1);
    pub const CHANNEL_UNREGISTERED: Self = Self(1 << 2);
    pub const CHANNEL_ACTIVE: Self = Self(1 << 3);
    pub const CHANNEL_INACTIVE: Self = Self(1 << 4);
    pub const CHANNEL_READ: Self = Self(1 << 5);
    pub const CHANNEL_READ_COMPLETE: Self = Self(1 << 6);
    pub const USER_EVENT_TRIGGERED: Self = Self(1 << 7);
    pub const CHANNEL_WRITABILITY_CHANGED: Self = Self(1 << 8);
    pub const BIND: Self = Self(1 << 9);
    pub const CONNECT: Self = Self(1 << 10);
    pub const DISCONNECT: Self = Self(1 << 11);
    pub const CLOSE: Self = Self(1 << 12);
    pub const DEREGISTER: Self = Self(1 << 13);
    pub const READ: Self = Self(1 << 14);
    pub const WRITE: Self = Self(1 << 15);
    pub const FLUSH: Self = Self(1 << 16);

    /// 全部入站事件（含异常）。
    pub const INBOUND: Self = Self(0x1FF);
    /// 全部出站操作（含异常，出站处理器同样可以观察异常）。
    pub const OUTBOUND: Self = Self(0x1_FE01);
    pub const ALL: Self = Self(0x1_FFFF);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventMask({:#07x})", self.0)
    }
}

/// `ChannelHandler` 是流水线中的处理单元。
///
/// # 教案式说明
/// - **意图 (Why)**：协议逻辑以处理器为单位拼装：入站事件自头向尾、出站操作自尾向头流经各处理器；
/// - **逻辑 (How)**：
///   - 每个回调都有转发到下一个节点的默认实现，处理器只覆盖关心的事件；
///   - [`interest`](Self::interest) 显式声明覆盖了哪些事件，流水线据此在添加时计算跳过掩码；
///     未声明的事件即便被覆盖也不会被调用；
///   - 回调返回 `Err` 时，入站事件的错误交给本节点的 `exception_caught`，
///     出站操作的错误用于失败该操作的 Promise（`read`/`flush` 没有 Promise，同样交给 `exception_caught`）；
/// - **契约 (What)**：
///   - 同一通道上的全部回调串行执行在所属执行器上，处理器内部无需加锁；
///   - 默认不可共享：同一实例只能加入一条流水线一次，除非 [`is_sharable`](Self::is_sharable) 返回 `true`；
///   - `handler_added` 先于任何事件到达本处理器，`handler_removed` 至多调用一次；
/// - **风险 (Trade-offs)**：接收 `&Arc<ChannelHandlerContext>`，处理器可以克隆上下文供稍后使用
///   （例如挂起写队列），但需留意与通道之间的引用环。
#[allow(unused_variables)]
pub trait ChannelHandler: Any + Send + Sync + 'static {
    /// 本处理器实现的事件集合。
    fn interest(&self) -> EventMask {
        EventMask::ALL
    }

    fn is_sharable(&self) -> bool {
        false
    }

    /// 自动命名使用的类型名。
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    fn handler_added(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        Ok(())
    }

    fn handler_removed(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        Ok(())
    }

    fn channel_registered(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_inactive();
        Ok(())
    }

    fn channel_read(&self, ctx: &Arc<ChannelHandlerContext>, msg: PipelineMessage) -> Result<()> {
        ctx.fire_channel_read(msg);
        Ok(())
    }

    fn channel_read_complete(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_read_complete();
        Ok(())
    }

    fn user_event_triggered(&self, ctx: &Arc<ChannelHandlerContext>, event: UserEvent) -> Result<()> {
        ctx.fire_user_event_triggered(event);
        Ok(())
    }

    fn channel_writability_changed(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.fire_channel_writability_changed();
        Ok(())
    }

    fn exception_caught(&self, ctx: &Arc<ChannelHandlerContext>, cause: ChannelError) -> Result<()> {
        ctx.fire_exception_caught(cause);
        Ok(())
    }

    fn bind(&self, ctx: &Arc<ChannelHandlerContext>, local: SocketAddress, promise: ChannelPromise) -> Result<()> {
        ctx.bind_with_promise(local, promise).map(drop)
    }

    fn connect(
        &self,
        ctx: &Arc<ChannelHandlerContext>,
        remote: SocketAddress,
        local: Option<SocketAddress>,
        promise: ChannelPromise,
    ) -> Result<()> {
        ctx.connect_with_promise(remote, local, promise).map(drop)
    }

    fn disconnect(&self, ctx: &Arc<ChannelHandlerContext>, promise: ChannelPromise) -> Result<()> {
        ctx.disconnect_with_promise(promise).map(drop)
    }

    fn close(&self, ctx: &Arc<ChannelHandlerContext>, promise: ChannelPromise) -> Result<()> {
        ctx.close_with_promise(promise).map(drop)
    }

    fn deregister(&self, ctx: &Arc<ChannelHandlerContext>, promise: ChannelPromise) -> Result<()> {
        ctx.deregister_with_promise(promise).map(drop)
    }

    fn read(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.read();
        Ok(())
    }

    fn write(&self, ctx: &Arc<ChannelHandlerContext>, msg: PipelineMessage, promise: ChannelPromise) -> Result<()> {
        ctx.write_with_promise(msg, promise).map(drop)
    }

    fn flush(&self, ctx: &Arc<ChannelHandlerContext>) -> Result<()> {
        ctx.flush();
        Ok(())
    }
}
