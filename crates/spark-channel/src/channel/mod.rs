//! 通道：身份、生命周期状态与底层操作。
//!
//! ## 契约声明
//! * **状态机：** `Unregistered → Registered → Active ⇄ Inactive → Closed`，`Deregistered` 为旁支；
//!   通道至多绑定一个事件循环，绑定后不可更换；
//! * **线程亲和：** 注册之后的生命周期变更、出站缓冲变更全部在所属事件循环上执行；
//!   跨线程调用经由流水线上下文投递为任务；
//! * **所有权：** 通道拥有流水线与出站缓冲；事件循环的已注册通道表持有通道强引用，
//!   流水线节点、配置与 void Promise 只持有弱引用。

mod address;
mod id;
mod transport;
mod unsafe_ops;

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

pub use address::SocketAddress;
pub use id::ChannelId;
pub use transport::{ChannelMetadata, ConnectOutcome, RejectedMessage, Transport};
pub use unsafe_ops::ChannelUnsafe;

use crate::config::ChannelConfig;
use crate::error::{ChannelError, Result};
use crate::event_loop::{EventExecutor, EventLoop, ScheduledHandle};
use crate::future::{ChannelFuture, ChannelPromise};
use crate::message::{PipelineMessage, clamp_size};
use crate::outbound::{ChannelOutboundBuffer, OutboundNotification, Transition, WritabilityState};
use crate::pipeline::{ChannelPipeline, LoggingInboundSink, UnhandledInboundSink};

/// 进行中的连接尝试。
#[derive(Default)]
struct ConnectState {
    promise: Option<ChannelPromise>,
    timeout: Option<ScheduledHandle>,
}

/// `Channel` 是带生命周期与流水线的可寻址端点。
///
/// # 教案式说明
/// - **意图 (Why)**：把“何时可以做什么”的状态机与“具体怎么做 I/O”分离：
///   状态机、出站缓冲与事件派发在这里统一实现，I/O 由注入的 [`Transport`] 完成；
/// - **逻辑 (How)**：
///   - 通过 `Arc::new_cyclic` 构造，内部保存自身弱引用，投递到事件循环的任务据此持有强引用；
///   - 出站操作（`write`/`flush`/`close` …）从流水线尾部进入，最终由头部哨兵调用
///     [`ChannelUnsafe`] 的对应方法；
///   - 出站缓冲位于 `parking_lot::Mutex<Option<_>>` 中，`None` 表示输出已关闭、不再接受写入；
/// - **契约 (What)**：`close_future` 恰好完成一次；事件循环一经绑定不可更换；
///   通道之间按 [`ChannelId`] 比较与排序。
pub struct Channel {
    id: ChannelId,
    parent: Option<Arc<Channel>>,
    me: Weak<Channel>,
    transport: Arc<dyn Transport>,
    config: Arc<ChannelConfig>,
    writability: Arc<WritabilityState>,
    pipeline: ChannelPipeline,
    event_loop: OnceLock<Arc<dyn EventLoop>>,
    registered: AtomicBool,
    never_registered: AtomicBool,
    close_initiated: AtomicBool,
    in_flush0: AtomicBool,
    /// 与 `outbound.is_some()` 同步，供无锁路径读取。
    output_open: AtomicBool,
    outbound: Mutex<Option<ChannelOutboundBuffer>>,
    connect: Mutex<ConnectState>,
    close_promise: ChannelPromise,
    void_promise: ChannelPromise,
    unsafe_void_promise: ChannelPromise,
    local_address: Mutex<Option<SocketAddress>>,
    remote_address: Mutex<Option<SocketAddress>>,
}

/// 通道构造器。
pub struct ChannelBuilder {
    transport: Arc<dyn Transport>,
    parent: Option<Arc<Channel>>,
    id: Option<ChannelId>,
    unhandled: Arc<dyn UnhandledInboundSink>,
}

impl ChannelBuilder {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            parent: None,
            id: None,
            unhandled: Arc::new(LoggingInboundSink),
        }
    }

    /// 由服务端通道派生的子通道需要指定父通道。
    pub fn parent(mut self, parent: Arc<Channel>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn id(mut self, id: ChannelId) -> Self {
        self.id = Some(id);
        self
    }

    /// 替换流水线尾部对未处理入站消息、异常与用户事件的处置方式。
    pub fn unhandled_inbound(mut self, sink: Arc<dyn UnhandledInboundSink>) -> Self {
        self.unhandled = sink;
        self
    }

    pub fn build(self) -> Arc<Channel> {
        let Self {
            transport,
            parent,
            id,
            unhandled,
        } = self;
        let max_messages_per_read = transport.metadata().default_max_messages_per_read;
        Arc::new_cyclic(|me: &Weak<Channel>| {
            let config = Arc::new(ChannelConfig::new(me.clone(), max_messages_per_read));
            let writability = Arc::new(WritabilityState::new(Arc::clone(&config)));
            Channel {
                id: id.unwrap_or_else(ChannelId::new_instance),
                parent,
                me: me.clone(),
                transport,
                outbound: Mutex::new(Some(ChannelOutboundBuffer::new(Arc::clone(&writability)))),
                config,
                writability,
                pipeline: ChannelPipeline::new(me.clone(), unhandled),
                event_loop: OnceLock::new(),
                registered: AtomicBool::new(false),
                never_registered: AtomicBool::new(true),
                close_initiated: AtomicBool::new(false),
                in_flush0: AtomicBool::new(false),
                output_open: AtomicBool::new(true),
                connect: Mutex::new(ConnectState::default()),
                close_promise: ChannelPromise::new(),
                void_promise: ChannelPromise::void(me.clone(), true),
                unsafe_void_promise: ChannelPromise::void(me.clone(), false),
                local_address: Mutex::new(None),
                remote_address: Mutex::new(None),
            }
        })
    }
}

impl Channel {
    /// 以默认设置构造通道。
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Channel> {
        ChannelBuilder::new(transport).build()
    }

    pub fn builder(transport: Arc<dyn Transport>) -> ChannelBuilder {
        ChannelBuilder::new(transport)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn parent(&self) -> Option<&Arc<Channel>> {
        self.parent.as_ref()
    }

    pub fn config(&self) -> &Arc<ChannelConfig> {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn metadata(&self) -> ChannelMetadata {
        self.transport.metadata()
    }

    pub fn pipeline(&self) -> &ChannelPipeline {
        &self.pipeline
    }

    /// 底层操作入口；应用代码通常不直接调用。
    pub fn unsafe_ops(&self) -> ChannelUnsafe<'_> {
        ChannelUnsafe::new(self)
    }

    /// 已绑定的事件循环；从未注册时为 `None`。
    pub fn event_loop(&self) -> Option<Arc<dyn EventLoop>> {
        self.event_loop.get().cloned()
    }

    pub(crate) fn executor(&self) -> Option<Arc<dyn EventExecutor>> {
        self.event_loop
            .get()
            .map(|event_loop| Arc::clone(event_loop) as Arc<dyn EventExecutor>)
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn is_active(&self) -> bool {
        self.transport.is_active()
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// 输出未关闭且不可写位图全为零。
    pub fn is_writable(&self) -> bool {
        self.output_open.load(Ordering::Acquire) && self.writability.is_writable()
    }

    pub fn bytes_before_unwritable(&self) -> u64 {
        if self.output_open.load(Ordering::Acquire) {
            self.writability.bytes_before_unwritable()
        } else {
            0
        }
    }

    pub fn bytes_before_writable(&self) -> u64 {
        if self.output_open.load(Ordering::Acquire) {
            self.writability.bytes_before_writable()
        } else {
            0
        }
    }

    /// 出站缓冲与写队列中尚未写出的字节总数。
    pub fn total_pending_write_bytes(&self) -> u64 {
        self.writability.pending_bytes()
    }

    pub fn local_address(&self) -> Option<SocketAddress> {
        let mut cached = self.local_address.lock();
        if cached.is_none() {
            *cached = self.transport.local_address();
        }
        cached.clone()
    }

    pub fn remote_address(&self) -> Option<SocketAddress> {
        let mut cached = self.remote_address.lock();
        if cached.is_none() {
            *cached = self.transport.remote_address();
        }
        cached.clone()
    }

    pub(crate) fn invalidate_addresses(&self) {
        *self.local_address.lock() = None;
        *self.remote_address.lock() = None;
    }

    /// 关闭完成时完成的 Future；只读，恰好完成一次。
    pub fn close_future(&self) -> ChannelFuture {
        self.close_promise.future()
    }

    /// 绑定到通道事件循环的新 Promise。
    pub fn new_promise(&self) -> ChannelPromise {
        ChannelPromise::with_executor_opt(self.executor())
    }

    /// 失败时转交 `exception_caught` 的 void Promise。
    pub fn void_promise(&self) -> ChannelPromise {
        self.void_promise.clone()
    }

    pub(crate) fn unsafe_void_promise(&self) -> ChannelPromise {
        self.unsafe_void_promise.clone()
    }

    pub(crate) fn arc(&self) -> Option<Arc<Channel>> {
        self.me.upgrade()
    }

    /// 按配置的估算器估算消息字节数，未知大小视为 0。
    pub fn estimate_size(&self, msg: &PipelineMessage) -> u64 {
        clamp_size(self.config.message_size_estimator().size(msg))
    }

    /// 注册到 `event_loop`；注册结果通过返回的 Future 报告。
    pub fn register(&self, event_loop: Arc<dyn EventLoop>) -> ChannelFuture {
        let promise = ChannelPromise::with_executor(Arc::clone(&event_loop) as Arc<dyn EventExecutor>);
        self.unsafe_ops().register(event_loop, promise.clone());
        promise.future()
    }

    pub fn bind(&self, local: SocketAddress) -> ChannelFuture {
        self.pipeline.bind(local)
    }

    pub fn connect(&self, remote: SocketAddress) -> ChannelFuture {
        self.pipeline.connect(remote, None)
    }

    pub fn connect_from(&self, remote: SocketAddress, local: SocketAddress) -> ChannelFuture {
        self.pipeline.connect(remote, Some(local))
    }

    pub fn disconnect(&self) -> ChannelFuture {
        self.pipeline.disconnect()
    }

    pub fn close(&self) -> ChannelFuture {
        self.pipeline.close()
    }

    pub fn deregister(&self) -> ChannelFuture {
        self.pipeline.deregister()
    }

    /// 半关闭输出方向；不经过流水线，直接在事件循环上执行底层操作。
    pub fn shutdown_output(&self) -> ChannelFuture {
        let promise = self.new_promise();
        let future = promise.future();
        match self.executor() {
            Some(executor) if !executor.in_event_loop() => {
                let Some(channel) = self.arc() else {
                    promise.try_failure(ChannelError::Closed);
                    return future;
                };
                let task_promise = promise.clone();
                let submitted = executor.execute(Box::new(move || {
                    channel.unsafe_ops().shutdown_output(task_promise);
                }));
                if let Err(err) = submitted {
                    promise.try_failure(err);
                }
            }
            _ => self.unsafe_ops().shutdown_output(promise),
        }
        future
    }

    /// 请求读取下一批入站数据。
    pub fn read(&self) {
        self.pipeline.read();
    }

    pub fn write(&self, msg: PipelineMessage) -> ChannelFuture {
        self.pipeline.write(msg)
    }

    /// 使用调用方提供的 Promise 写入；Promise 已完成时返回错误。
    pub fn write_with_promise(&self, msg: PipelineMessage, promise: ChannelPromise) -> Result<ChannelFuture> {
        self.pipeline.write_with_promise(msg, promise)
    }

    pub fn write_and_flush(&self, msg: PipelineMessage) -> ChannelFuture {
        self.pipeline.write_and_flush(msg)
    }

    pub fn flush(&self) {
        self.pipeline.flush();
    }

    /// `auto_read` 被关闭时由配置回调。
    pub(crate) fn auto_read_cleared(&self) {
        self.transport.auto_read_cleared();
    }

    /// 供输出缓冲之外截留写入的组件参与背压；可写性变化经事件循环异步触发。
    pub fn increment_pending_outbound_bytes(&self, size: u64) {
        if size == 0 || !self.output_open.load(Ordering::Acquire) {
            return;
        }
        match self.writability.add(size) {
            Ok(transition) => self.fire_writability_changed_later(transition),
            Err(err) => tracing::warn!(
                channel.id = %self.id.as_short_text(),
                error.code = err.code(),
                "pending outbound bytes not tracked"
            ),
        }
    }

    pub fn decrement_pending_outbound_bytes(&self, size: u64) {
        if size == 0 || !self.output_open.load(Ordering::Acquire) {
            return;
        }
        let transition = self.writability.sub(size);
        self.fire_writability_changed_later(transition);
    }

    /// 自定义可写位 `index`（1..=31）的状态。
    pub fn user_defined_writability(&self, index: u32) -> Result<bool> {
        self.writability.user_defined_writability(index)
    }

    /// 设置自定义可写位；通道整体可写性翻转时立即触发可写性事件。
    pub fn set_user_defined_writability(&self, index: u32, writable: bool) -> Result<()> {
        let transition = self.writability.set_user_defined_writability(index, writable)?;
        if transition.changed() {
            self.pipeline.fire_channel_writability_changed();
        }
        Ok(())
    }

    /// 在持锁状态下访问出站缓冲；输出已关闭时返回 `None`。
    ///
    /// 闭包内不得调用通道的写路径。
    pub fn with_outbound_buffer<R>(&self, inspect: impl FnOnce(&ChannelOutboundBuffer) -> R) -> Option<R> {
        self.outbound.lock().as_ref().map(inspect)
    }

    fn fire_writability_changed_later(&self, transition: Transition) {
        if !transition.changed() {
            return;
        }
        let Some(channel) = self.arc() else {
            return;
        };
        self.unsafe_ops().invoke_later(Box::new(move || {
            channel.pipeline().fire_channel_writability_changed();
        }));
    }

    /// 在结构锁之外执行出站缓冲累积的通知。
    pub(crate) fn dispatch_outbound_notifications(&self, notifications: Vec<OutboundNotification>) {
        for notification in notifications {
            if notification.complete_promise().is_some() {
                self.pipeline.fire_channel_writability_changed();
            }
        }
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Channel {}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.id.cmp(&other.id)
    }
}

impl Hash for Channel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[id: 0x{}", self.id.as_short_text())?;
        match (self.local_address(), self.remote_address()) {
            (Some(local), Some(remote)) => {
                let arrow = if self.is_active() { "-" } else { "!" };
                write!(f, ", L:{local} {arrow} R:{remote}]")
            }
            (Some(local), None) => write!(f, ", L:{local}]"),
            _ => write!(f, "]"),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id.as_short_text())
            .field("registered", &self.is_registered())
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .finish()
    }
}
