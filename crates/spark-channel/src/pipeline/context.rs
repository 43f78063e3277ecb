use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{ChannelHandler, EventMask, sharable};
use crate::channel::{Channel, SocketAddress};
use crate::error::{ChannelError, Result};
use crate::event_loop::EventExecutor;
use crate::future::{ChannelFuture, ChannelPromise};
use crate::message::{PipelineMessage, UserEvent};

const INIT: u8 = 0;
const ADD_PENDING: u8 = 1;
const ADD_COMPLETE: u8 = 2;
const REMOVE_COMPLETE: u8 = 3;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 本节点正处于 `exception_caught` 回调中的标记，随作用域结束自动清除。
struct ExceptionScope<'a> {
    flag: &'a AtomicBool,
    outermost: bool,
}

impl<'a> ExceptionScope<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        let outermost = !flag.swap(true, Ordering::AcqRel);
        ExceptionScope { flag, outermost }
    }
}

impl Drop for ExceptionScope<'_> {
    fn drop(&mut self) {
        if self.outermost {
            self.flag.store(false, Ordering::Release);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ContextKind {
    Head,
    Tail,
    Handler,
}

/// `ChannelHandlerContext` 是处理器在流水线中的节点。
///
/// # 教案式说明
/// - **意图 (Why)**：处理器本身不知道自己的邻居，所有“继续传播”的动作都经由上下文完成；
///   上下文还承担跨线程派发：目标节点的执行器不是当前线程时，事件被封装为任务投递过去；
/// - **逻辑 (How)**：
///   - 前后指针是弱引用，节点的强引用由流水线的名称表与两个哨兵持有；
///     指针失效（节点已被摘除且邻居已释放）时入站方向回落到尾哨兵、出站方向回落到头哨兵；
///   - `fire_*` 从本节点出发寻找下一个声明了对应事件的入站节点；出站操作则寻找前一个出站节点；
///   - 节点状态 `Init → AddPending → AddComplete → RemoveComplete`，只有 `AddComplete` 时才调用处理器，
///     其余状态下事件被原样转发，保证 `handler_added` 先于任何事件到达；
///   - 投递被拒绝时：入站消息被释放，出站 Promise 以拒绝原因失败；
/// - **契约 (What)**：
///   - `*_with_promise` 遇到已取消的 Promise 直接释放消息并返回其 Future；
///     遇到已完成的 Promise 释放消息并返回 [`ChannelError::PromiseAlreadyCompleted`]；
///   - 处理器在入站回调中返回的错误转交本节点的 `exception_caught`；
///     在 `exception_caught` 中返回的错误只记录告警，不再传播；
/// - **风险 (Trade-offs)**：嵌套保护记录在节点自身，只拦截同一节点在其 `exception_caught` 内的再次失败；
///   其他节点（包括其他通道的节点）的失败照常路由到各自的 `exception_caught`。
pub struct ChannelHandlerContext {
    id: u64,
    name: String,
    kind: ContextKind,
    handler: Arc<dyn ChannelHandler>,
    mask: EventMask,
    channel: Weak<Channel>,
    executor: Option<Arc<dyn EventExecutor>>,
    prev: Mutex<Weak<ChannelHandlerContext>>,
    next: Mutex<Weak<ChannelHandlerContext>>,
    state: AtomicU8,
    linked: AtomicBool,
    in_exception_caught: AtomicBool,
}

impl ChannelHandlerContext {
    pub(crate) fn new(
        name: String,
        handler: Arc<dyn ChannelHandler>,
        executor: Option<Arc<dyn EventExecutor>>,
        channel: Weak<Channel>,
    ) -> Arc<Self> {
        Self::build(name, ContextKind::Handler, handler, executor, channel, INIT)
    }

    pub(crate) fn sentinel(
        name: &str,
        kind: ContextKind,
        handler: Arc<dyn ChannelHandler>,
        channel: Weak<Channel>,
    ) -> Arc<Self> {
        Self::build(name.to_owned(), kind, handler, None, channel, ADD_COMPLETE)
    }

    fn build(
        name: String,
        kind: ContextKind,
        handler: Arc<dyn ChannelHandler>,
        executor: Option<Arc<dyn EventExecutor>>,
        channel: Weak<Channel>,
        state: u8,
    ) -> Arc<Self> {
        let mask = handler.interest();
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            kind,
            handler,
            mask,
            channel,
            executor,
            prev: Mutex::new(Weak::new()),
            next: Mutex::new(Weak::new()),
            state: AtomicU8::new(state),
            linked: AtomicBool::new(kind != ContextKind::Handler),
            in_exception_caught: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> &Arc<dyn ChannelHandler> {
        &self.handler
    }

    /// 把处理器向下转型为具体类型。
    pub fn handler_as<T: ChannelHandler>(&self) -> Option<&T> {
        let handler: &dyn ChannelHandler = &*self.handler;
        let handler: &dyn Any = handler;
        handler.downcast_ref::<T>()
    }

    /// 所属通道；通道已释放时为 `None`。
    pub fn try_channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    /// 本节点的执行器：显式指定者优先，否则为通道的事件循环；尚未注册时为 `None`。
    pub fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.executor
            .clone()
            .or_else(|| self.channel.upgrade().and_then(|channel| channel.executor()))
    }

    /// 添加时显式指定的执行器；未指定时为 `None`。
    pub(crate) fn explicit_executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.executor.clone()
    }

    /// 处理器是否已从流水线移除。
    pub fn is_removed(&self) -> bool {
        self.state.load(Ordering::Acquire) == REMOVE_COMPLETE
    }

    pub fn new_promise(&self) -> ChannelPromise {
        match self.channel.upgrade() {
            Some(channel) => channel.new_promise(),
            None => ChannelPromise::new(),
        }
    }

    pub fn void_promise(&self) -> ChannelPromise {
        match self.channel.upgrade() {
            Some(channel) => channel.void_promise(),
            None => ChannelPromise::void(Weak::new(), false),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> ContextKind {
        self.kind
    }

    /// 日志中使用的通道短标识。
    pub(crate) fn channel_label(&self) -> String {
        self.channel
            .upgrade()
            .map(|channel| channel.id().as_short_text())
            .unwrap_or_else(|| "-".to_owned())
    }

    // ---- 链表结构（仅在流水线结构锁内修改） ----

    pub(crate) fn next_context(&self) -> Option<Arc<Self>> {
        self.next.lock().upgrade()
    }

    pub(crate) fn prev_context(&self) -> Option<Arc<Self>> {
        self.prev.lock().upgrade()
    }

    pub(crate) fn set_next(&self, next: &Arc<Self>) {
        *self.next.lock() = Arc::downgrade(next);
    }

    pub(crate) fn set_prev(&self, prev: &Arc<Self>) {
        *self.prev.lock() = Arc::downgrade(prev);
    }

    /// 插入到 `prev` 与 `next` 之间。
    pub(crate) fn link_between(self: &Arc<Self>, prev: &Arc<Self>, next: &Arc<Self>) {
        self.set_prev(prev);
        self.set_next(next);
        next.set_prev(self);
        prev.set_next(self);
        self.linked.store(true, Ordering::Release);
    }

    /// 从链表摘除；重复调用无副作用。
    ///
    /// 本节点自身的前后指针保持不变，正在途经本节点的事件仍能继续传播。
    pub(crate) fn unlink(&self, head: &Arc<Self>, tail: &Arc<Self>) {
        if !self.linked.swap(false, Ordering::AcqRel) {
            return;
        }
        let prev = self.prev_context().unwrap_or_else(|| Arc::clone(head));
        let next = self.next_context().unwrap_or_else(|| Arc::clone(tail));
        prev.set_next(&next);
        next.set_prev(&prev);
    }

    /// 被替换的节点：已不在链表中，但保留指向替代者的前后指针。
    pub(crate) fn mark_unlinked(&self) {
        self.linked.store(false, Ordering::Release);
    }

    // ---- 生命周期状态 ----

    pub(crate) fn set_add_pending(&self) {
        let _ = self
            .state
            .compare_exchange(INIT, ADD_PENDING, Ordering::AcqRel, Ordering::Acquire);
    }

    /// 进入 `AddComplete`；节点已被移除时返回 `false`。
    fn set_add_complete(&self) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != REMOVE_COMPLETE).then_some(ADD_COMPLETE)
            })
            .is_ok()
    }

    pub(crate) fn call_handler_added(self: &Arc<Self>) -> Result<()> {
        if self.set_add_complete() {
            self.handler.handler_added(self)
        } else {
            Ok(())
        }
    }

    /// 调用 `handler_removed`（至多一次）并释放不可共享处理器的登记。
    pub(crate) fn call_handler_removed(self: &Arc<Self>) -> Result<()> {
        let previous = self.state.swap(REMOVE_COMPLETE, Ordering::AcqRel);
        let result = if previous == ADD_COMPLETE {
            self.handler.handler_removed(self)
        } else {
            Ok(())
        };
        sharable::release(&self.handler, self.id);
        result
    }

    fn invoke_handler(&self) -> bool {
        self.state.load(Ordering::Acquire) == ADD_COMPLETE
    }

    // ---- 节点查找 ----

    fn fallback(&self, kind: ContextKind) -> Option<Arc<Self>> {
        let channel = self.channel.upgrade()?;
        let pipeline = channel.pipeline();
        Some(match kind {
            ContextKind::Tail => Arc::clone(pipeline.tail_context()),
            _ => Arc::clone(pipeline.head_context()),
        })
    }

    fn find_inbound(&self, event: EventMask) -> Option<Arc<Self>> {
        if self.kind == ContextKind::Tail {
            return None;
        }
        let mut cursor = self.next_context().or_else(|| self.fallback(ContextKind::Tail))?;
        while cursor.kind != ContextKind::Tail && !cursor.mask.contains(event) {
            cursor = cursor
                .next_context()
                .or_else(|| self.fallback(ContextKind::Tail))?;
        }
        Some(cursor)
    }

    fn find_outbound(&self, event: EventMask) -> Option<Arc<Self>> {
        if self.kind == ContextKind::Head {
            return None;
        }
        let mut cursor = self.prev_context().or_else(|| self.fallback(ContextKind::Head))?;
        while cursor.kind != ContextKind::Head && !cursor.mask.contains(event) {
            cursor = cursor
                .prev_context()
                .or_else(|| self.fallback(ContextKind::Head))?;
        }
        Some(cursor)
    }

    // ---- 派发 ----

    /// 在本节点的执行器上运行 `task`；已在执行器线程或尚无执行器时内联执行。
    fn run_or_submit(self: &Arc<Self>, task: impl FnOnce(&Arc<Self>) + Send + 'static) -> Result<()> {
        match self.executor() {
            Some(executor) if !executor.in_event_loop() => {
                let ctx = Arc::clone(self);
                executor.execute(Box::new(move || task(&ctx)))
            }
            _ => {
                task(self);
                Ok(())
            }
        }
    }

    fn dispatch(self: &Arc<Self>, event: &'static str, task: impl FnOnce(&Arc<Self>) + Send + 'static) {
        if let Err(err) = self.run_or_submit(task) {
            tracing::warn!(
                channel.id = %self.channel_label(),
                handler.name = %self.name,
                event.kind = event,
                error.code = err.code(),
                "inbound event dropped: executor rejected the task"
            );
        }
    }

    /// 投递携带消息的任务；执行器拒绝时交还消息，由调用方释放。
    fn submit_with_message(
        self: &Arc<Self>,
        executor: &Arc<dyn EventExecutor>,
        msg: PipelineMessage,
        task: impl FnOnce(&Arc<Self>, PipelineMessage) + Send + 'static,
    ) -> core::result::Result<(), (PipelineMessage, ChannelError)> {
        let slot = Arc::new(Mutex::new(Some(msg)));
        let task_slot = Arc::clone(&slot);
        let ctx = Arc::clone(self);
        let submitted = executor.execute(Box::new(move || {
            let msg = task_slot.lock().take();
            if let Some(msg) = msg {
                task(&ctx, msg);
            }
        }));
        match submitted {
            Ok(()) => Ok(()),
            Err(err) => {
                let msg = slot.lock().take();
                match msg {
                    Some(msg) => Err((msg, err)),
                    None => Ok(()),
                }
            }
        }
    }

    fn remote_executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.executor().filter(|executor| !executor.in_event_loop())
    }

    // ---- 入站：向后传播 ----

    pub fn fire_channel_registered(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_REGISTERED) {
            next.dispatch_channel_registered();
        }
    }

    pub fn fire_channel_unregistered(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_UNREGISTERED) {
            next.dispatch_channel_unregistered();
        }
    }

    pub fn fire_channel_active(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_ACTIVE) {
            next.dispatch_channel_active();
        }
    }

    pub fn fire_channel_inactive(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_INACTIVE) {
            next.dispatch_channel_inactive();
        }
    }

    pub fn fire_channel_read(&self, msg: PipelineMessage) {
        match self.find_inbound(EventMask::CHANNEL_READ) {
            Some(next) => next.dispatch_channel_read(msg),
            None => msg.release(),
        }
    }

    pub fn fire_channel_read_complete(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_READ_COMPLETE) {
            next.dispatch_channel_read_complete();
        }
    }

    pub fn fire_user_event_triggered(&self, event: UserEvent) {
        if let Some(next) = self.find_inbound(EventMask::USER_EVENT_TRIGGERED) {
            next.dispatch_user_event_triggered(event);
        }
    }

    pub fn fire_channel_writability_changed(&self) {
        if let Some(next) = self.find_inbound(EventMask::CHANNEL_WRITABILITY_CHANGED) {
            next.dispatch_channel_writability_changed();
        }
    }

    pub fn fire_exception_caught(&self, cause: ChannelError) {
        if let Some(next) = self.find_inbound(EventMask::EXCEPTION_CAUGHT) {
            next.dispatch_exception_caught(cause);
        }
    }

    // ---- 入站：在本节点执行 ----

    pub(crate) fn dispatch_channel_registered(self: &Arc<Self>) {
        self.dispatch("channel_registered", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_registered(ctx), |ctx| ctx.fire_channel_registered())
        });
    }

    pub(crate) fn dispatch_channel_unregistered(self: &Arc<Self>) {
        self.dispatch("channel_unregistered", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_unregistered(ctx), |ctx| ctx.fire_channel_unregistered())
        });
    }

    pub(crate) fn dispatch_channel_active(self: &Arc<Self>) {
        self.dispatch("channel_active", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_active(ctx), |ctx| ctx.fire_channel_active())
        });
    }

    pub(crate) fn dispatch_channel_inactive(self: &Arc<Self>) {
        self.dispatch("channel_inactive", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_inactive(ctx), |ctx| ctx.fire_channel_inactive())
        });
    }

    pub(crate) fn dispatch_channel_read_complete(self: &Arc<Self>) {
        self.dispatch("channel_read_complete", |ctx| {
            ctx.invoke_inbound(|h, ctx| h.channel_read_complete(ctx), |ctx| ctx.fire_channel_read_complete())
        });
    }

    pub(crate) fn dispatch_channel_writability_changed(self: &Arc<Self>) {
        self.dispatch("channel_writability_changed", |ctx| {
            ctx.invoke_inbound(
                |h, ctx| h.channel_writability_changed(ctx),
                |ctx| ctx.fire_channel_writability_changed(),
            )
        });
    }

    pub(crate) fn dispatch_channel_read(self: &Arc<Self>, msg: PipelineMessage) {
        msg.touch("channel_read");
        let Some(executor) = self.remote_executor() else {
            self.invoke_channel_read(msg);
            return;
        };
        if let Err((msg, err)) = self.submit_with_message(&executor, msg, |ctx, msg| ctx.invoke_channel_read(msg)) {
            msg.release();
            tracing::warn!(
                channel.id = %self.channel_label(),
                handler.name = %self.name,
                event.kind = "channel_read",
                error.code = err.code(),
                "inbound message released: executor rejected the task"
            );
        }
    }

    pub(crate) fn dispatch_user_event_triggered(self: &Arc<Self>, event: UserEvent) {
        self.dispatch("user_event_triggered", move |ctx| ctx.invoke_user_event_triggered(event));
    }

    pub(crate) fn dispatch_exception_caught(self: &Arc<Self>, cause: ChannelError) {
        self.dispatch("exception_caught", move |ctx| ctx.invoke_exception_caught(cause));
    }

    fn invoke_inbound(
        self: &Arc<Self>,
        call: impl FnOnce(&dyn ChannelHandler, &Arc<Self>) -> Result<()>,
        forward: impl FnOnce(&Self),
    ) {
        if self.invoke_handler() {
            if let Err(err) = call(self.handler.as_ref(), self) {
                self.notify_handler_exception(err);
            }
        } else {
            forward(self);
        }
    }

    fn invoke_channel_read(self: &Arc<Self>, msg: PipelineMessage) {
        if self.invoke_handler() {
            if let Err(err) = self.handler.channel_read(self, msg) {
                self.notify_handler_exception(err);
            }
        } else {
            self.fire_channel_read(msg);
        }
    }

    fn invoke_user_event_triggered(self: &Arc<Self>, event: UserEvent) {
        if self.invoke_handler() {
            if let Err(err) = self.handler.user_event_triggered(self, event) {
                self.notify_handler_exception(err);
            }
        } else {
            self.fire_user_event_triggered(event);
        }
    }

    fn invoke_exception_caught(self: &Arc<Self>, cause: ChannelError) {
        if !self.invoke_handler() {
            self.fire_exception_caught(cause);
            return;
        }
        let _scope = ExceptionScope::enter(&self.in_exception_caught);
        if let Err(err) = self.handler.exception_caught(self, cause) {
            tracing::warn!(
                channel.id = %self.channel_label(),
                handler.name = %self.name,
                event.kind = "exception_caught",
                error.code = err.code(),
                error = %err,
                "exception_caught() returned an error; suppressed"
            );
        }
    }

    /// 处理器回调失败：交给本节点的 `exception_caught`；本节点正处于异常处理中时只记录告警。
    fn notify_handler_exception(self: &Arc<Self>, cause: ChannelError) {
        if self.in_exception_caught.load(Ordering::Acquire) {
            tracing::warn!(
                channel.id = %self.channel_label(),
                handler.name = %self.name,
                error.code = cause.code(),
                error = %cause,
                "handler failed while an exception_caught event was in progress; suppressed"
            );
            return;
        }
        self.invoke_exception_caught(cause);
    }

    fn notify_outbound_failure(&self, promise: &ChannelPromise, cause: ChannelError) {
        let code = cause.code();
        if !promise.try_failure(cause) && !promise.is_void() {
            tracing::warn!(
                channel.id = %self.channel_label(),
                handler.name = %self.name,
                error.code = code,
                "outbound operation failed but its promise was already completed"
            );
        }
    }

    // ---- 出站：向前传播 ----

    /// 校验调用方提供的 Promise；返回 `Ok(false)` 表示已取消、操作应被跳过。
    fn validate_promise(promise: &ChannelPromise) -> Result<bool> {
        if promise.is_void() {
            return Ok(true);
        }
        if promise.is_cancelled() {
            return Ok(false);
        }
        if promise.is_done() {
            return Err(ChannelError::PromiseAlreadyCompleted);
        }
        Ok(true)
    }

    fn submit_outbound(
        next: &Arc<Self>,
        promise: &ChannelPromise,
        task: impl FnOnce(&Arc<Self>) + Send + 'static,
    ) {
        if let Err(err) = next.run_or_submit(task) {
            tracing::debug!(
                handler.name = %next.name,
                error.code = err.code(),
                "outbound operation rejected by executor"
            );
            promise.try_failure(err);
        }
    }

    pub fn bind(&self, local: SocketAddress) -> ChannelFuture {
        into_future(self.bind_with_promise(local, self.new_promise()))
    }

    pub fn bind_with_promise(&self, local: SocketAddress, promise: ChannelPromise) -> Result<ChannelFuture> {
        let future = promise.future();
        if !Self::validate_promise(&promise)? {
            return Ok(future);
        }
        match self.find_outbound(EventMask::BIND) {
            Some(next) => {
                let guard = promise.clone();
                Self::submit_outbound(&next, &guard, move |ctx| ctx.invoke_bind(local, promise));
            }
            None => {
                promise.try_failure(ChannelError::Closed);
            }
        }
        Ok(future)
    }

    pub fn connect(&self, remote: SocketAddress, local: Option<SocketAddress>) -> ChannelFuture {
        into_future(self.connect_with_promise(remote, local, self.new_promise()))
    }

    pub fn connect_with_promise(
        &self,
        remote: SocketAddress,
        local: Option<SocketAddress>,
        promise: ChannelPromise,
    ) -> Result<ChannelFuture> {
        let future = promise.future();
        if !Self::validate_promise(&promise)? {
            return Ok(future);
        }
        match self.find_outbound(EventMask::CONNECT) {
            Some(next) => {
                let guard = promise.clone();
                Self::submit_outbound(&next, &guard, move |ctx| ctx.invoke_connect(remote, local, promise));
            }
            None => {
                promise.try_failure(ChannelError::Closed);
            }
        }
        Ok(future)
    }

    pub fn disconnect(&self) -> ChannelFuture {
        into_future(self.disconnect_with_promise(self.new_promise()))
    }

    /// 传输不区分断开与关闭时，`disconnect` 等价于 `close`。
    pub fn disconnect_with_promise(&self, promise: ChannelPromise) -> Result<ChannelFuture> {
        if let Some(channel) = self.channel.upgrade() {
            if !channel.metadata().has_disconnect {
                return self.close_with_promise(promise);
            }
        }
        let future = promise.future();
        if !Self::validate_promise(&promise)? {
            return Ok(future);
        }
        match self.find_outbound(EventMask::DISCONNECT) {
            Some(next) => {
                let guard = promise.clone();
                Self::submit_outbound(&next, &guard, move |ctx| ctx.invoke_disconnect(promise));
            }
            None => {
                promise.try_failure(ChannelError::Closed);
            }
        }
        Ok(future)
    }

    pub fn close(&self) -> ChannelFuture {
        into_future(self.close_with_promise(self.new_promise()))
    }

    pub fn close_with_promise(&self, promise: ChannelPromise) -> Result<ChannelFuture> {
        let future = promise.future();
        if !Self::validate_promise(&promise)? {
            return Ok(future);
        }
        match self.find_outbound(EventMask::CLOSE) {
            Some(next) => {
                let guard = promise.clone();
                Self::submit_outbound(&next, &guard, move |ctx| ctx.invoke_close(promise));
            }
            None => {
                promise.try_failure(ChannelError::Closed);
            }
        }
        Ok(future)
    }

    pub fn deregister(&self) -> ChannelFuture {
        into_future(self.deregister_with_promise(self.new_promise()))
    }

    pub fn deregister_with_promise(&self, promise: ChannelPromise) -> Result<ChannelFuture> {
        let future = promise.future();
        if !Self::validate_promise(&promise)? {
            return Ok(future);
        }
        match self.find_outbound(EventMask::DEREGISTER) {
            Some(next) => {
                let guard = promise.clone();
                Self::submit_outbound(&next, &guard, move |ctx| ctx.invoke_deregister(promise));
            }
            None => {
                promise.try_failure(ChannelError::Closed);
            }
        }
        Ok(future)
    }

    /// 请求读取；没有 Promise，失败经 `exception_caught` 报告。
    pub fn read(&self) {
        if let Some(next) = self.find_outbound(EventMask::READ) {
            next.dispatch("read", |ctx| ctx.invoke_read());
        }
    }

    pub fn flush(&self) {
        if let Some(next) = self.find_outbound(EventMask::FLUSH) {
            next.dispatch("flush", |ctx| ctx.invoke_flush());
        }
    }

    pub fn write(&self, msg: PipelineMessage) -> ChannelFuture {
        into_future(self.write_with_promise(msg, self.new_promise()))
    }

    /// 写入消息；消息随后沿出站方向传递，直到头哨兵把它放入出站缓冲。
    ///
    /// 跨线程投递期间，消息的估算字节数计入通道的挂起字节，参与可写性判断。
    pub fn write_with_promise(&self, msg: PipelineMessage, promise: ChannelPromise) -> Result<ChannelFuture> {
        let future = promise.future();
        match Self::validate_promise(&promise) {
            Ok(true) => {}
            Ok(false) => {
                msg.release();
                return Ok(future);
            }
            Err(err) => {
                msg.release();
                return Err(err);
            }
        }
        msg.touch("write");
        let Some(next) = self.find_outbound(EventMask::WRITE) else {
            msg.release();
            promise.try_failure(ChannelError::Closed);
            return Ok(future);
        };
        let Some(executor) = next.remote_executor() else {
            next.invoke_write(msg, promise);
            return Ok(future);
        };
        let channel = self.channel.upgrade();
        let size = channel.as_ref().map_or(0, |channel| channel.estimate_size(&msg));
        if let Some(channel) = &channel {
            channel.increment_pending_outbound_bytes(size);
        }
        let task_promise = promise.clone();
        let task_channel = channel.clone();
        let submitted = next.submit_with_message(&executor, msg, move |ctx, msg| {
            if let Some(channel) = &task_channel {
                channel.decrement_pending_outbound_bytes(size);
            }
            ctx.invoke_write(msg, task_promise);
        });
        if let Err((msg, err)) = submitted {
            if let Some(channel) = &channel {
                channel.decrement_pending_outbound_bytes(size);
            }
            msg.release();
            promise.try_failure(err);
        }
        Ok(future)
    }

    pub fn write_and_flush(&self, msg: PipelineMessage) -> ChannelFuture {
        into_future(self.write_and_flush_with_promise(msg, self.new_promise()))
    }

    pub fn write_and_flush_with_promise(
        &self,
        msg: PipelineMessage,
        promise: ChannelPromise,
    ) -> Result<ChannelFuture> {
        let future = self.write_with_promise(msg, promise)?;
        self.flush();
        Ok(future)
    }

    // ---- 出站：在本节点执行 ----

    fn invoke_bind(self: &Arc<Self>, local: SocketAddress, promise: ChannelPromise) {
        if !self.invoke_handler() {
            self.forward_outbound(self.bind_with_promise(local, promise));
            return;
        }
        if let Err(err) = self.handler.bind(self, local, promise.clone()) {
            self.notify_outbound_failure(&promise, err);
        }
    }

    fn invoke_connect(self: &Arc<Self>, remote: SocketAddress, local: Option<SocketAddress>, promise: ChannelPromise) {
        if !self.invoke_handler() {
            self.forward_outbound(self.connect_with_promise(remote, local, promise));
            return;
        }
        if let Err(err) = self.handler.connect(self, remote, local, promise.clone()) {
            self.notify_outbound_failure(&promise, err);
        }
    }

    fn invoke_disconnect(self: &Arc<Self>, promise: ChannelPromise) {
        if !self.invoke_handler() {
            self.forward_outbound(self.disconnect_with_promise(promise));
            return;
        }
        if let Err(err) = self.handler.disconnect(self, promise.clone()) {
            self.notify_outbound_failure(&promise, err);
        }
    }

    fn invoke_close(self: &Arc<Self>, promise: ChannelPromise) {
        if !self.invoke_handler() {
            self.forward_outbound(self.close_with_promise(promise));
            return;
        }
        if let Err(err) = self.handler.close(self, promise.clone()) {
            self.notify_outbound_failure(&promise, err);
        }
    }

    fn invoke_deregister(self: &Arc<Self>, promise: ChannelPromise) {
        if !self.invoke_handler() {
            self.forward_outbound(self.deregister_with_promise(promise));
            return;
        }
        if let Err(err) = self.handler.deregister(self, promise.clone()) {
            self.notify_outbound_failure(&promise, err);
        }
    }

    fn invoke_read(self: &Arc<Self>) {
        if !self.invoke_handler() {
            self.read();
            return;
        }
        if let Err(err) = self.handler.read(self) {
            self.notify_handler_exception(err);
        }
    }

    fn invoke_flush(self: &Arc<Self>) {
        if !self.invoke_handler() {
            self.flush();
            return;
        }
        if let Err(err) = self.handler.flush(self) {
            self.notify_handler_exception(err);
        }
    }

    fn invoke_write(self: &Arc<Self>, msg: PipelineMessage, promise: ChannelPromise) {
        if !self.invoke_handler() {
            self.forward_outbound(self.write_with_promise(msg, promise));
            return;
        }
        if let Err(err) = self.handler.write(self, msg, promise.clone()) {
            self.notify_outbound_failure(&promise, err);
        }
    }

    /// 跳过未就绪节点时转发的结果；Promise 已在入口处校验过，这里的失败只可能来自竞态完成。
    fn forward_outbound(&self, result: Result<ChannelFuture>) {
        if let Err(err) = result {
            tracing::debug!(
                handler.name = %self.name,
                error.code = err.code(),
                "outbound operation skipped"
            );
        }
    }
}

/// 无 Promise 的便捷接口：校验失败时以失败的 Future 报告。
fn into_future(result: Result<ChannelFuture>) -> ChannelFuture {
    match result {
        Ok(future) => future,
        Err(err) => ChannelPromise::failed(err).future(),
    }
}

impl Drop for ChannelHandlerContext {
    fn drop(&mut self) {
        sharable::release(&self.handler, self.id);
    }
}

impl fmt::Debug for ChannelHandlerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandlerContext")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("mask", &self.mask)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}
