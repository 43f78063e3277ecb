use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::context::ContextKind;
use super::sentinel::{HeadHandler, TailHandler};
use super::{ChannelHandler, ChannelHandlerContext, UnhandledInboundSink, sharable};
use crate::channel::{Channel, SocketAddress};
use crate::error::{ChannelError, Result};
use crate::event_loop::EventExecutor;
use crate::future::{ChannelFuture, ChannelPromise};
use crate::message::{PipelineMessage, UserEvent};

const HEAD_NAME: &str = "HeadContext#0";
const TAIL_NAME: &str = "TailContext#0";

/// 注册之前登记、首次注册时按顺序回放的生命周期回调。
enum PendingCallback {
    Added(Arc<ChannelHandlerContext>),
    Removed(Arc<ChannelHandlerContext>),
}

/// 结构锁保护的簿记：名称表、注册标记与挂起回调队列。
///
/// 只在拼接链表期间持有，调用任何处理器回调之前释放。
struct Structure {
    contexts: HashMap<String, Arc<ChannelHandlerContext>>,
    registered: bool,
    pending: VecDeque<PendingCallback>,
}

enum Position<'a> {
    First,
    Last,
    Before(&'a str),
    After(&'a str),
}

/// `ChannelPipeline` 是单个通道的处理器链。
///
/// # 教案式说明
/// - **意图 (Why)**：入站事件自头向尾、出站操作自尾向头流经处理器，协议栈以处理器为单位组合；
/// - **逻辑 (How)**：
///   - 头尾两个哨兵节点固定存在，处理器节点插在二者之间，前后指针为弱引用，强引用由名称表持有；
///   - 结构变更在短暂的结构锁内完成拼接，`handler_added`/`handler_removed` 在锁外、
///     在节点所属执行器上调用；
///   - 通道尚未注册时，回调进入 FIFO 队列，首次注册时由头哨兵按插入顺序回放一次；
///   - `replace` 在同一任务中先调用新处理器的 `handler_added`，再调用旧处理器的 `handler_removed`；
/// - **契约 (What)**：
///   - 名称在流水线内唯一，省略时按 `类型短名#序号` 自动生成；
///   - 不可共享的处理器实例只能加入一次，重复加入返回 [`ChannelError::HandlerAlreadyAdded`]；
///   - `handler_added` 失败时节点被移除并尝试调用 `handler_removed`，失败经 `exception_caught` 报告，
///     不返回给 `add_*` 的调用方；
/// - **风险 (Trade-offs)**：名称表为 `HashMap`，遍历顺序依赖链表而非名称表；
///   `names()` 等快照接口在结构锁内沿链表遍历。
pub struct ChannelPipeline {
    channel: Weak<Channel>,
    head: Arc<ChannelHandlerContext>,
    tail: Arc<ChannelHandlerContext>,
    structure: Mutex<Structure>,
}

impl ChannelPipeline {
    pub(crate) fn new(channel: Weak<Channel>, unhandled: Arc<dyn UnhandledInboundSink>) -> Self {
        let head = ChannelHandlerContext::sentinel(
            HEAD_NAME,
            ContextKind::Head,
            Arc::new(HeadHandler::new(channel.clone())),
            channel.clone(),
        );
        let tail = ChannelHandlerContext::sentinel(
            TAIL_NAME,
            ContextKind::Tail,
            Arc::new(TailHandler::new(unhandled)),
            channel.clone(),
        );
        head.set_next(&tail);
        tail.set_prev(&head);
        Self {
            channel,
            head,
            tail,
            structure: Mutex::new(Structure {
                contexts: HashMap::new(),
                registered: false,
                pending: VecDeque::new(),
            }),
        }
    }

    pub fn channel(&self) -> Option<Arc<Channel>> {
        self.channel.upgrade()
    }

    pub(crate) fn head_context(&self) -> &Arc<ChannelHandlerContext> {
        &self.head
    }

    pub(crate) fn tail_context(&self) -> &Arc<ChannelHandlerContext> {
        &self.tail
    }

    // ---- 结构变更 ----

    pub fn add_first(&self, name: Option<&str>, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        self.add(Position::First, None, name, handler)
    }

    pub fn add_last(&self, name: Option<&str>, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        self.add(Position::Last, None, name, handler)
    }

    pub fn add_before(&self, base: &str, name: Option<&str>, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        self.add(Position::Before(base), None, name, handler)
    }

    pub fn add_after(&self, base: &str, name: Option<&str>, handler: Arc<dyn ChannelHandler>) -> Result<()> {
        self.add(Position::After(base), None, name, handler)
    }

    /// 处理器的全部回调改在 `executor` 上执行。
    pub fn add_first_with_executor(
        &self,
        executor: Arc<dyn EventExecutor>,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        self.add(Position::First, Some(executor), name, handler)
    }

    pub fn add_last_with_executor(
        &self,
        executor: Arc<dyn EventExecutor>,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        self.add(Position::Last, Some(executor), name, handler)
    }

    pub fn add_before_with_executor(
        &self,
        executor: Arc<dyn EventExecutor>,
        base: &str,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        self.add(Position::Before(base), Some(executor), name, handler)
    }

    pub fn add_after_with_executor(
        &self,
        executor: Arc<dyn EventExecutor>,
        base: &str,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        self.add(Position::After(base), Some(executor), name, handler)
    }

    fn add(
        &self,
        position: Position<'_>,
        executor: Option<Arc<dyn EventExecutor>>,
        name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<()> {
        let ctx = {
            let mut structure = self.structure.lock();
            let name = self.resolve_name(&structure, name, handler.as_ref())?;
            let (prev, next) = self.anchor(&structure, position)?;
            let ctx = ChannelHandlerContext::new(name, handler, executor, self.channel.clone());
            sharable::claim(ctx.handler(), ctx.id())?;
            ctx.link_between(&prev, &next);
            structure.contexts.insert(ctx.name().to_owned(), Arc::clone(&ctx));
            if !structure.registered {
                ctx.set_add_pending();
                structure.pending.push_back(PendingCallback::Added(ctx));
                return Ok(());
            }
            ctx
        };
        self.schedule_added(ctx);
        Ok(())
    }

    /// 按名称移除处理器。
    pub fn remove(&self, name: &str) -> Result<Arc<dyn ChannelHandler>> {
        let (ctx, registered) = {
            let mut structure = self.structure.lock();
            let ctx = structure
                .contexts
                .remove(name)
                .ok_or_else(|| ChannelError::HandlerNotFound { name: name.to_owned() })?;
            ctx.unlink(&self.head, &self.tail);
            if !structure.registered {
                structure.pending.push_back(PendingCallback::Removed(Arc::clone(&ctx)));
            }
            (ctx, structure.registered)
        };
        let handler = Arc::clone(ctx.handler());
        if registered {
            self.schedule_removed(ctx);
        }
        Ok(handler)
    }

    /// 按实例身份移除处理器。
    pub fn remove_handler(&self, handler: &Arc<dyn ChannelHandler>) -> Result<()> {
        let name = self
            .context_of(handler)
            .map(|ctx| ctx.name().to_owned())
            .ok_or_else(|| ChannelError::HandlerNotFound {
                name: handler.type_name().to_owned(),
            })?;
        self.remove(&name).map(drop)
    }

    pub fn remove_first(&self) -> Result<Arc<dyn ChannelHandler>> {
        let ctx = self.first_context().ok_or_else(|| ChannelError::HandlerNotFound {
            name: "<first>".to_owned(),
        })?;
        self.remove(ctx.name())
    }

    pub fn remove_last(&self) -> Result<Arc<dyn ChannelHandler>> {
        let ctx = self.last_context().ok_or_else(|| ChannelError::HandlerNotFound {
            name: "<last>".to_owned(),
        })?;
        self.remove(ctx.name())
    }

    /// 以 `handler` 替换名为 `old_name` 的处理器，返回被替换的处理器。
    ///
    /// `new_name` 为 `None` 时沿用自动命名；与旧名称相同是允许的。
    pub fn replace(
        &self,
        old_name: &str,
        new_name: Option<&str>,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Arc<dyn ChannelHandler>> {
        let (old, new, registered) = {
            let mut structure = self.structure.lock();
            let old = structure
                .contexts
                .get(old_name)
                .cloned()
                .ok_or_else(|| ChannelError::HandlerNotFound { name: old_name.to_owned() })?;
            let name = match new_name {
                Some(name) if name == old_name => name.to_owned(),
                other => self.resolve_name(&structure, other, handler.as_ref())?,
            };
            let new = ChannelHandlerContext::new(name, handler, old.explicit_executor(), self.channel.clone());
            sharable::claim(new.handler(), new.id())?;
            let prev = old.prev_context().unwrap_or_else(|| Arc::clone(&self.head));
            let next = old.next_context().unwrap_or_else(|| Arc::clone(&self.tail));
            structure.contexts.remove(old_name);
            new.link_between(&prev, &next);
            old.mark_unlinked();
            old.set_prev(&new);
            old.set_next(&new);
            structure.contexts.insert(new.name().to_owned(), Arc::clone(&new));
            let registered = structure.registered;
            if !registered {
                new.set_add_pending();
                structure.pending.push_back(PendingCallback::Added(Arc::clone(&new)));
                structure.pending.push_back(PendingCallback::Removed(Arc::clone(&old)));
            }
            (old, new, registered)
        };
        if registered {
            self.schedule_replaced(Arc::clone(&old), new);
        }
        Ok(Arc::clone(old.handler()))
    }

    fn resolve_name(
        &self,
        structure: &Structure,
        name: Option<&str>,
        handler: &dyn ChannelHandler,
    ) -> Result<String> {
        match name {
            Some(name) => {
                if structure.contexts.contains_key(name) || name == HEAD_NAME || name == TAIL_NAME {
                    return Err(ChannelError::DuplicateHandlerName { name: name.to_owned() });
                }
                Ok(name.to_owned())
            }
            None => Ok(generate_name(structure, handler)),
        }
    }

    fn anchor(
        &self,
        structure: &Structure,
        position: Position<'_>,
    ) -> Result<(Arc<ChannelHandlerContext>, Arc<ChannelHandlerContext>)> {
        let lookup = |base: &str| {
            structure
                .contexts
                .get(base)
                .cloned()
                .ok_or_else(|| ChannelError::HandlerNotFound { name: base.to_owned() })
        };
        Ok(match position {
            Position::First => {
                let next = self.head.next_context().unwrap_or_else(|| Arc::clone(&self.tail));
                (Arc::clone(&self.head), next)
            }
            Position::Last => {
                let prev = self.tail.prev_context().unwrap_or_else(|| Arc::clone(&self.head));
                (prev, Arc::clone(&self.tail))
            }
            Position::Before(base) => {
                let base = lookup(base)?;
                let prev = base.prev_context().unwrap_or_else(|| Arc::clone(&self.head));
                (prev, base)
            }
            Position::After(base) => {
                let base = lookup(base)?;
                let next = base.next_context().unwrap_or_else(|| Arc::clone(&self.tail));
                (base, next)
            }
        })
    }

    // ---- 生命周期回调调度 ----

    /// 首次注册时回放挂起的回调；之后调用无副作用。
    pub(crate) fn invoke_handler_added_if_needed(&self) {
        let pending = {
            let mut structure = self.structure.lock();
            if structure.registered {
                return;
            }
            structure.registered = true;
            std::mem::take(&mut structure.pending)
        };
        for callback in pending {
            match callback {
                PendingCallback::Added(ctx) => self.schedule_added(ctx),
                PendingCallback::Removed(ctx) => self.schedule_removed(ctx),
            }
        }
    }

    fn remote_executor(ctx: &ChannelHandlerContext) -> Option<Arc<dyn EventExecutor>> {
        ctx.executor().filter(|executor| !executor.in_event_loop())
    }

    fn schedule_added(&self, ctx: Arc<ChannelHandlerContext>) {
        let Some(executor) = Self::remote_executor(&ctx) else {
            self.call_handler_added(&ctx);
            return;
        };
        ctx.set_add_pending();
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let task_ctx = Arc::clone(&ctx);
        if let Err(err) = executor.execute(Box::new(move || channel.pipeline().call_handler_added(&task_ctx))) {
            tracing::warn!(
                handler.name = %ctx.name(),
                error.code = err.code(),
                "cannot invoke handler_added() because the executor rejected it; removing handler"
            );
            self.forget(&ctx);
            Self::remove_after_rejection(&ctx);
        }
    }

    fn schedule_removed(&self, ctx: Arc<ChannelHandlerContext>) {
        let Some(executor) = Self::remote_executor(&ctx) else {
            self.call_handler_removed(&ctx);
            return;
        };
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let task_ctx = Arc::clone(&ctx);
        if let Err(err) = executor.execute(Box::new(move || channel.pipeline().call_handler_removed(&task_ctx))) {
            tracing::warn!(
                handler.name = %ctx.name(),
                error.code = err.code(),
                "cannot invoke handler_removed() because the executor rejected it"
            );
            Self::remove_after_rejection(&ctx);
        }
    }

    fn schedule_replaced(&self, old: Arc<ChannelHandlerContext>, new: Arc<ChannelHandlerContext>) {
        let run = |pipeline: &ChannelPipeline, old: &Arc<ChannelHandlerContext>, new: &Arc<ChannelHandlerContext>| {
            pipeline.call_handler_added(new);
            pipeline.call_handler_removed(old);
        };
        let Some(executor) = Self::remote_executor(&old) else {
            run(self, &old, &new);
            return;
        };
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let (task_old, task_new) = (Arc::clone(&old), Arc::clone(&new));
        if let Err(err) = executor.execute(Box::new(move || run(channel.pipeline(), &task_old, &task_new))) {
            tracing::warn!(
                handler.name = %old.name(),
                error.code = err.code(),
                "cannot replace handler because the executor rejected the task"
            );
        }
    }

    fn call_handler_added(&self, ctx: &Arc<ChannelHandlerContext>) {
        let Err(cause) = ctx.call_handler_added() else {
            return;
        };
        self.forget(ctx);
        let removed = match ctx.call_handler_removed() {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    channel.id = %ctx.channel_label(),
                    handler.name = %ctx.name(),
                    error.code = err.code(),
                    error = %err,
                    "failed to remove a handler whose handler_added() failed"
                );
                false
            }
        };
        self.fire_exception_caught(ChannelError::HandlerAddedFailed {
            name: ctx.name().to_owned(),
            removed,
            cause: Box::new(cause),
        });
    }

    fn call_handler_removed(&self, ctx: &Arc<ChannelHandlerContext>) {
        if let Err(cause) = ctx.call_handler_removed() {
            self.fire_exception_caught(ChannelError::HandlerRemovedFailed {
                name: ctx.name().to_owned(),
                cause: Box::new(cause),
            });
        }
    }

    /// 执行器拒绝任务后在当前线程补调 `handler_removed`；失败只能记录。
    fn remove_after_rejection(ctx: &Arc<ChannelHandlerContext>) {
        if let Err(err) = ctx.call_handler_removed() {
            tracing::warn!(
                channel.id = %ctx.channel_label(),
                handler.name = %ctx.name(),
                error.code = err.code(),
                error = %err,
                "handler_removed() failed after the executor rejected the task"
            );
        }
    }

    /// 从名称表与链表中抹去节点（仅当名称表中的节点正是它）。
    fn forget(&self, ctx: &Arc<ChannelHandlerContext>) {
        let mut structure = self.structure.lock();
        if structure
            .contexts
            .get(ctx.name())
            .is_some_and(|current| Arc::ptr_eq(current, ctx))
        {
            structure.contexts.remove(ctx.name());
        }
        ctx.unlink(&self.head, &self.tail);
    }

    /// 关闭后的流水线拆除：先沿入站方向走到尾部，再自尾向头逐个移除处理器。
    ///
    /// 每个节点的 `handler_removed` 在其自身执行器上调用；失败以 `PipelineDestroyed` 记录告警。
    pub(crate) fn destroy(&self) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let first = self.head.next_context();
        Self::destroy_up(channel, first);
    }

    fn destroy_up(channel: Arc<Channel>, mut cursor: Option<Arc<ChannelHandlerContext>>) {
        let tail = Arc::clone(channel.pipeline().tail_context());
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &tail) {
                break;
            }
            if let Some(executor) = Self::remote_executor(&ctx) {
                let task_channel = Arc::clone(&channel);
                let resume = Some(Arc::clone(&ctx));
                if executor
                    .execute(Box::new(move || Self::destroy_up(task_channel, resume)))
                    .is_ok()
                {
                    return;
                }
            }
            cursor = ctx.next_context();
        }
        let last = tail.prev_context();
        Self::destroy_down(channel, last);
    }

    fn destroy_down(channel: Arc<Channel>, mut cursor: Option<Arc<ChannelHandlerContext>>) {
        let pipeline = channel.pipeline();
        while let Some(ctx) = cursor {
            if Arc::ptr_eq(&ctx, &pipeline.head) {
                break;
            }
            if let Some(executor) = Self::remote_executor(&ctx) {
                let task_channel = Arc::clone(&channel);
                let resume = Some(Arc::clone(&ctx));
                if executor
                    .execute(Box::new(move || Self::destroy_down(task_channel, resume)))
                    .is_ok()
                {
                    return;
                }
            }
            let prev = ctx.prev_context();
            pipeline.forget(&ctx);
            if let Err(cause) = ctx.call_handler_removed() {
                let err = ChannelError::PipelineDestroyed {
                    name: ctx.name().to_owned(),
                    cause: Box::new(cause),
                };
                tracing::warn!(
                    channel.id = %ctx.channel_label(),
                    handler.name = %ctx.name(),
                    error.code = err.code(),
                    error = %err,
                    "handler_removed() failed while destroying the pipeline"
                );
            }
            cursor = prev;
        }
    }

    // ---- 查询 ----

    /// 自头向尾的处理器名称快照。
    pub fn names(&self) -> Vec<String> {
        self.contexts().iter().map(|ctx| ctx.name().to_owned()).collect()
    }

    /// 自头向尾的节点快照，不含哨兵。
    pub fn contexts(&self) -> Vec<Arc<ChannelHandlerContext>> {
        let _structure = self.structure.lock();
        let mut contexts = Vec::new();
        let mut cursor = self.head.next_context();
        while let Some(ctx) = cursor {
            if ctx.kind() == ContextKind::Tail {
                break;
            }
            cursor = ctx.next_context();
            contexts.push(ctx);
        }
        contexts
    }

    pub fn len(&self) -> usize {
        self.structure.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.context(name).map(|ctx| Arc::clone(ctx.handler()))
    }

    pub fn context(&self, name: &str) -> Option<Arc<ChannelHandlerContext>> {
        self.structure.lock().contexts.get(name).cloned()
    }

    /// 持有该处理器实例的节点。
    pub fn context_of(&self, handler: &Arc<dyn ChannelHandler>) -> Option<Arc<ChannelHandlerContext>> {
        self.contexts()
            .into_iter()
            .find(|ctx| std::ptr::addr_eq(Arc::as_ptr(ctx.handler()), Arc::as_ptr(handler)))
    }

    /// 第一个类型为 `T` 的处理器所在节点。
    pub fn get_by_type<T: ChannelHandler>(&self) -> Option<Arc<ChannelHandlerContext>> {
        self.contexts().into_iter().find(|ctx| {
            let handler: &dyn ChannelHandler = &**ctx.handler();
            let handler: &dyn Any = handler;
            handler.is::<T>()
        })
    }

    pub fn first(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.first_context().map(|ctx| Arc::clone(ctx.handler()))
    }

    pub fn last(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.last_context().map(|ctx| Arc::clone(ctx.handler()))
    }

    pub fn first_context(&self) -> Option<Arc<ChannelHandlerContext>> {
        self.contexts().into_iter().next()
    }

    pub fn last_context(&self) -> Option<Arc<ChannelHandlerContext>> {
        self.contexts().pop()
    }

    // ---- 入站：自头部发起 ----

    pub fn fire_channel_registered(&self) {
        self.head.dispatch_channel_registered();
    }

    pub fn fire_channel_unregistered(&self) {
        self.head.dispatch_channel_unregistered();
    }

    pub fn fire_channel_active(&self) {
        self.head.dispatch_channel_active();
    }

    pub fn fire_channel_inactive(&self) {
        self.head.dispatch_channel_inactive();
    }

    pub fn fire_channel_read(&self, msg: PipelineMessage) {
        self.head.dispatch_channel_read(msg);
    }

    pub fn fire_channel_read_complete(&self) {
        self.head.dispatch_channel_read_complete();
    }

    pub fn fire_user_event_triggered(&self, event: UserEvent) {
        self.head.dispatch_user_event_triggered(event);
    }

    pub fn fire_channel_writability_changed(&self) {
        self.head.dispatch_channel_writability_changed();
    }

    pub fn fire_exception_caught(&self, cause: ChannelError) {
        self.head.dispatch_exception_caught(cause);
    }

    // ---- 出站：自尾部发起 ----

    pub fn bind(&self, local: SocketAddress) -> ChannelFuture {
        self.tail.bind(local)
    }

    pub fn connect(&self, remote: SocketAddress, local: Option<SocketAddress>) -> ChannelFuture {
        self.tail.connect(remote, local)
    }

    pub fn disconnect(&self) -> ChannelFuture {
        self.tail.disconnect()
    }

    pub fn close(&self) -> ChannelFuture {
        self.tail.close()
    }

    pub fn close_with_promise(&self, promise: ChannelPromise) -> Result<ChannelFuture> {
        self.tail.close_with_promise(promise)
    }

    pub fn deregister(&self) -> ChannelFuture {
        self.tail.deregister()
    }

    pub fn read(&self) {
        self.tail.read();
    }

    pub fn write(&self, msg: PipelineMessage) -> ChannelFuture {
        self.tail.write(msg)
    }

    pub fn write_with_promise(&self, msg: PipelineMessage, promise: ChannelPromise) -> Result<ChannelFuture> {
        self.tail.write_with_promise(msg, promise)
    }

    pub fn write_and_flush(&self, msg: PipelineMessage) -> ChannelFuture {
        self.tail.write_and_flush(msg)
    }

    pub fn flush(&self) {
        self.tail.flush();
    }
}

/// `类型短名#序号`，序号取名称表中尚未占用的最小值。
fn generate_name(structure: &Structure, handler: &dyn ChannelHandler) -> String {
    let full = handler.type_name();
    let base = full.split('<').next().unwrap_or(full);
    let base = base.rsplit("::").next().unwrap_or(base);
    (0u32..)
        .map(|index| format!("{base}#{index}"))
        .find(|candidate| !structure.contexts.contains_key(candidate))
        .unwrap_or_else(|| base.to_owned())
}

impl fmt::Debug for ChannelPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPipeline").field("handlers", &self.names()).finish()
    }
}
