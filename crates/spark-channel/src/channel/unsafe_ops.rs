use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::{Channel, ConnectOutcome, RejectedMessage, SocketAddress};
use crate::error::{ChannelError, Result};
use crate::event_loop::{EventLoop, Task, same_event_loop};
use crate::future::ChannelPromise;
use crate::message::{ChannelOutputShutdownEvent, PipelineMessage};
use crate::outbound::ChannelOutboundBuffer;

/// `ChannelUnsafe` 是通道生命周期的底层操作集。
///
/// # 教案式说明
/// - **意图 (Why)**：流水线头部哨兵把出站事件落到这里；这里负责状态迁移、出站缓冲维护
///   与 [`Transport`](super::Transport) 钩子调用，并保证每个操作的 Promise 恰好完成一次；
/// - **逻辑 (How)**：
///   - 除 `register` 外，全部操作都要求在通道所属事件循环上调用；
///   - 会引发进一步流水线事件的步骤（`bind` 后的激活、`close` 后的失活与注销）通过
///     `invoke_later` 延迟到事件循环的下一轮，避免在调用栈内重入处理器；
///   - 出站缓冲在结构锁内变更，累积的通知在锁外派发；
/// - **契约 (What)**：生命周期失败只完成 Promise，不向调用方返回错误。
pub struct ChannelUnsafe<'a> {
    channel: &'a Channel,
}

impl<'a> ChannelUnsafe<'a> {
    pub(super) fn new(channel: &'a Channel) -> Self {
        Self { channel }
    }

    /// 失败被静默丢弃的 void Promise，供内部路径使用。
    pub fn void_promise(&self) -> ChannelPromise {
        self.channel.unsafe_void_promise()
    }

    /// 注册到事件循环。
    ///
    /// 已注册时立即以 [`ChannelError::AlreadyRegistered`] 失败，不调用任何传输钩子；
    /// 事件循环类型不兼容或与先前绑定的不同，以 [`ChannelError::IncompatibleEventLoop`] 失败。
    pub fn register(&self, event_loop: Arc<dyn EventLoop>, promise: ChannelPromise) {
        let channel = self.channel;
        if channel.is_registered() {
            promise.try_failure(ChannelError::AlreadyRegistered);
            return;
        }
        if !channel.transport.is_compatible(event_loop.as_ref()) {
            promise.try_failure(ChannelError::IncompatibleEventLoop);
            return;
        }
        let bound = channel.event_loop.get_or_init(|| Arc::clone(&event_loop));
        if !same_event_loop(bound.as_ref(), event_loop.as_ref()) {
            promise.try_failure(ChannelError::IncompatibleEventLoop);
            return;
        }

        if event_loop.in_event_loop() {
            self.register0(promise);
            return;
        }
        let Some(handle) = channel.arc() else {
            promise.try_failure(ChannelError::Closed);
            return;
        };
        let task_promise = promise.clone();
        let submitted = event_loop.execute(Box::new(move || {
            handle.unsafe_ops().register0(task_promise);
        }));
        if let Err(err) = submitted {
            tracing::warn!(
                channel.id = %channel.id.as_short_text(),
                event_loop.name = %event_loop.name(),
                error.code = err.code(),
                "force-closing a channel whose registration task was not accepted by the event loop"
            );
            self.close_forcibly();
            channel.close_promise.try_success();
            promise.try_failure(err);
        }
    }

    fn register0(&self, promise: ChannelPromise) {
        let channel = self.channel;
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        if channel.is_registered() {
            promise.try_failure(ChannelError::AlreadyRegistered);
            return;
        }
        let first_registration = channel.never_registered.load(Ordering::Acquire);
        if let Err(err) = channel.transport.do_register(channel) {
            // 不关闭就会泄漏传输资源。
            self.close_forcibly();
            channel.close_promise.try_success();
            promise.try_failure(err);
            return;
        }
        channel.never_registered.store(false, Ordering::Release);
        channel.registered.store(true, Ordering::Release);
        if let (Some(event_loop), Some(handle)) = (channel.event_loop.get(), channel.arc()) {
            event_loop.registry().insert(handle);
        }

        channel.pipeline.invoke_handler_added_if_needed();
        promise.try_success();
        channel.pipeline.fire_channel_registered();
        if channel.is_active() {
            if first_registration {
                channel.pipeline.fire_channel_active();
            } else if channel.config.is_auto_read() {
                // 重新注册且已激活：重新登记读兴趣。
                self.begin_read();
            }
        }
    }

    pub fn bind(&self, local: SocketAddress, promise: ChannelPromise) {
        let channel = self.channel;
        if !promise.set_uncancellable() || !self.ensure_open(&promise) {
            return;
        }
        let was_active = channel.is_active();
        if let Err(err) = channel.transport.do_bind(&local) {
            promise.try_failure(err);
            self.close_if_closed();
            return;
        }
        if !was_active && channel.is_active() {
            self.fire_later(|channel| channel.pipeline().fire_channel_active());
        }
        promise.try_success();
    }

    /// 发起连接；立即完成或进入挂起状态等待 [`finish_connect`](Self::finish_connect)。
    ///
    /// 挂起期间受 `connect_timeout` 约束，超时以 [`ChannelError::ConnectTimeout`] 失败并关闭通道；
    /// 取消连接 Promise 同样关闭通道。
    pub fn connect(&self, remote: SocketAddress, local: Option<SocketAddress>, promise: ChannelPromise) {
        let channel = self.channel;
        if promise.is_cancelled() || !self.ensure_open(&promise) {
            return;
        }
        if channel.connect.lock().promise.is_some() {
            promise.try_failure(ChannelError::ConnectionPending);
            return;
        }
        let was_active = channel.is_active();
        match channel.transport.do_connect(&remote, local.as_ref()) {
            Ok(ConnectOutcome::Connected) => self.fulfill_connect(&promise, was_active),
            Ok(ConnectOutcome::Pending) => self.await_connect(remote, promise),
            Err(err) => {
                promise.try_failure(err);
                self.close_if_closed();
            }
        }
    }

    fn await_connect(&self, remote: SocketAddress, promise: ChannelPromise) {
        let channel = self.channel;
        let Some(handle) = channel.arc() else {
            promise.try_failure(ChannelError::Closed);
            return;
        };
        channel.connect.lock().promise = Some(promise.clone());

        let timeout = channel.config.connect_timeout();
        if !timeout.is_zero() {
            if let Some(event_loop) = channel.event_loop.get() {
                let timed_out = Arc::clone(&handle);
                let scheduled = event_loop.schedule(
                    Box::new(move || {
                        let pending = timed_out.connect.lock().promise.take();
                        if let Some(pending) = pending {
                            let cause = ChannelError::ConnectTimeout {
                                remote: remote.to_string(),
                                timeout,
                            };
                            if pending.try_failure(cause) {
                                let unsafe_ops = timed_out.unsafe_ops();
                                unsafe_ops.close(unsafe_ops.void_promise());
                            }
                        }
                    }),
                    timeout,
                );
                match scheduled {
                    Ok(scheduled) => channel.connect.lock().timeout = Some(scheduled),
                    Err(err) => tracing::warn!(
                        channel.id = %channel.id.as_short_text(),
                        error.code = err.code(),
                        "connect timeout could not be scheduled"
                    ),
                }
            }
        }

        // 非 void Promise 可注册监听器。
        let _ = promise.add_listener(move |future| {
            if !future.is_cancelled() {
                return;
            }
            let timeout = {
                let mut state = handle.connect.lock();
                state.promise = None;
                state.timeout.take()
            };
            if let Some(timeout) = timeout {
                timeout.cancel();
            }
            let unsafe_ops = handle.unsafe_ops();
            unsafe_ops.close(unsafe_ops.void_promise());
        });
    }

    /// 完成挂起的连接；没有挂起连接时什么也不做。
    pub fn finish_connect(&self) {
        let channel = self.channel;
        let (promise, timeout) = {
            let mut state = channel.connect.lock();
            (state.promise.take(), state.timeout.take())
        };
        if let Some(timeout) = timeout {
            timeout.cancel();
        }
        let Some(promise) = promise else {
            return;
        };
        let was_active = channel.is_active();
        match channel.transport.do_finish_connect() {
            Ok(()) => self.fulfill_connect(&promise, was_active),
            Err(err) => {
                promise.try_failure(err);
                self.close_if_closed();
            }
        }
    }

    fn fulfill_connect(&self, promise: &ChannelPromise, was_active: bool) {
        let channel = self.channel;
        let active = channel.is_active();
        // 用户可能已经取消了连接。
        let promise_set = promise.try_success();
        if !was_active && active {
            channel.pipeline.fire_channel_active();
        }
        if !promise_set {
            self.close(self.void_promise());
        }
    }

    pub fn disconnect(&self, promise: ChannelPromise) {
        let channel = self.channel;
        if !promise.set_uncancellable() {
            return;
        }
        let was_active = channel.is_active();
        if let Err(err) = channel.transport.do_disconnect() {
            promise.try_failure(err);
            self.close_if_closed();
            return;
        }
        channel.invalidate_addresses();
        if was_active && !channel.is_active() {
            self.fire_later(|channel| channel.pipeline().fire_channel_inactive());
        }
        promise.try_success();
        self.close_if_closed();
    }

    pub fn close(&self, promise: ChannelPromise) {
        self.close_inner(promise, ChannelError::Closed, ChannelError::Closed, false);
    }

    /// 关闭通道。
    ///
    /// `cause` 用于失败已刷新条目，`close_cause` 用于失败其余条目，
    /// `notify` 决定失败已刷新条目时是否报告可写性变化。
    fn close_inner(&self, promise: ChannelPromise, cause: ChannelError, close_cause: ChannelError, notify: bool) {
        let channel = self.channel;
        if !promise.set_uncancellable() {
            return;
        }
        if channel.close_initiated.swap(true, Ordering::AcqRel) {
            // 已有关闭在进行：本次调用跟随第一次关闭的完成。
            if channel.close_promise.is_done() {
                promise.try_success();
            } else if !promise.is_void() {
                let _ = channel.close_promise.add_listener(move |_| {
                    promise.try_success();
                });
            }
            return;
        }

        let was_active = channel.is_active();
        let detached = {
            let mut outbound = channel.outbound.lock();
            channel.output_open.store(false, Ordering::Release);
            outbound.take()
        };

        match channel.transport.do_close() {
            Ok(()) => {
                channel.close_promise.try_success();
                promise.try_success();
            }
            Err(err) => {
                channel.close_promise.try_success();
                promise.try_failure(err);
            }
        }
        channel.invalidate_addresses();

        let (pending_connect, connect_timeout) = {
            let mut state = channel.connect.lock();
            (state.promise.take(), state.timeout.take())
        };
        if let Some(timeout) = connect_timeout {
            timeout.cancel();
        }
        if let Some(pending) = pending_connect {
            pending.try_failure(ChannelError::Closed);
        }

        if let Some(mut buffer) = detached {
            buffer.fail_flushed(&cause, notify);
            buffer.close(&close_cause);
            let notifications = buffer.take_notifications();
            channel.dispatch_outbound_notifications(notifications);
        }

        if channel.in_flush0.load(Ordering::Acquire) {
            self.fire_later(move |channel| {
                channel.unsafe_ops().fire_inactive_and_deregister(was_active);
            });
        } else {
            self.fire_inactive_and_deregister(was_active);
        }
    }

    fn fire_inactive_and_deregister(&self, was_active: bool) {
        let fire_inactive = was_active && !self.channel.is_active();
        self.deregister_inner(self.void_promise(), fire_inactive);
    }

    /// 不经过流水线直接关闭传输，失败只记录日志。
    pub fn close_forcibly(&self) {
        if let Err(err) = self.channel.transport.do_close() {
            tracing::warn!(
                channel.id = %self.channel.id.as_short_text(),
                error = %err,
                "failed to close a channel"
            );
        }
    }

    pub fn deregister(&self, promise: ChannelPromise) {
        self.deregister_inner(promise, false);
    }

    fn deregister_inner(&self, promise: ChannelPromise, fire_inactive: bool) {
        if !promise.set_uncancellable() {
            return;
        }
        if !self.channel.is_registered() {
            promise.try_success();
            return;
        }
        // 注销可能由处理器回调链内的 close 触发，必须延迟到下一轮执行。
        self.fire_later(move |channel| {
            if let Err(err) = channel.transport.do_deregister() {
                tracing::warn!(
                    channel.id = %channel.id.as_short_text(),
                    error = %err,
                    "unexpected failure while deregistering a channel"
                );
            }
            if fire_inactive {
                channel.pipeline().fire_channel_inactive();
            }
            // 只有真正处于已注册状态才触发注销事件，防止重复触发。
            if channel.registered.swap(false, Ordering::AcqRel) {
                let removed = channel
                    .event_loop
                    .get()
                    .and_then(|event_loop| event_loop.registry().remove(&channel.id));
                channel.pipeline().fire_channel_unregistered();
                drop(removed);
            }
            promise.try_success();
        });
    }

    pub fn begin_read(&self) {
        let channel = self.channel;
        if !channel.is_active() {
            return;
        }
        if let Err(err) = channel.transport.do_begin_read() {
            self.fire_later(move |channel| channel.pipeline().fire_exception_caught(err));
            self.close(self.void_promise());
        }
    }

    /// 把消息追加到出站缓冲（未刷新）。
    ///
    /// 输出已关闭时释放消息并以 [`ChannelError::Closed`] 失败 Promise。
    pub fn write(&self, msg: PipelineMessage, promise: ChannelPromise) {
        let channel = self.channel;
        if !channel.output_open.load(Ordering::Acquire) {
            msg.release();
            promise.try_failure(ChannelError::Closed);
            return;
        }
        let msg = match channel.transport.filter_outbound_message(msg) {
            Ok(msg) => msg,
            Err(RejectedMessage { message, cause }) => {
                message.release();
                promise.try_failure(cause);
                return;
            }
        };
        // 字节数在写入时刻确定，之后不再重新估算。
        let size = channel.estimate_size(&msg);
        let notifications = {
            let mut outbound = channel.outbound.lock();
            match outbound.as_mut() {
                Some(buffer) => {
                    buffer.add_message(msg, size, promise);
                    buffer.take_notifications()
                }
                None => {
                    drop(outbound);
                    msg.release();
                    promise.try_failure(ChannelError::Closed);
                    return;
                }
            }
        };
        channel.dispatch_outbound_notifications(notifications);
    }

    pub fn flush(&self) {
        let channel = self.channel;
        let notifications = {
            let mut outbound = channel.outbound.lock();
            let Some(buffer) = outbound.as_mut() else {
                return;
            };
            buffer.add_flush();
            buffer.take_notifications()
        };
        channel.dispatch_outbound_notifications(notifications);
        self.flush0();
    }

    fn flush0(&self) {
        let channel = self.channel;
        let has_flushed = channel
            .outbound
            .lock()
            .as_ref()
            .is_some_and(|buffer| !buffer.is_empty());
        if !has_flushed {
            return;
        }
        if channel.in_flush0.swap(true, Ordering::AcqRel) {
            return;
        }

        if !channel.is_active() {
            let (cause, notify) = if channel.is_open() {
                (ChannelError::NotYetConnected, true)
            } else {
                // 已关闭：失败条目但不切换可写性。
                (ChannelError::Closed, false)
            };
            let notifications = {
                let mut outbound = channel.outbound.lock();
                match outbound.as_mut() {
                    Some(buffer) => {
                        buffer.fail_flushed(&cause, notify);
                        buffer.take_notifications()
                    }
                    None => Vec::new(),
                }
            };
            channel.dispatch_outbound_notifications(notifications);
            channel.in_flush0.store(false, Ordering::Release);
            return;
        }

        let spin_count = channel.config.write_spin_count();
        let (result, incomplete, notifications) = {
            let mut outbound = channel.outbound.lock();
            match outbound.as_mut() {
                Some(buffer) => {
                    let (result, incomplete) = Self::write_spinning(channel, buffer, spin_count);
                    (result, incomplete, buffer.take_notifications())
                }
                None => (Ok(()), false, Vec::new()),
            }
        };
        channel.dispatch_outbound_notifications(notifications);
        if let Err(err) = result {
            self.handle_write_error(err);
        }
        channel.in_flush0.store(false, Ordering::Release);
        if incomplete {
            self.schedule_flush0();
        }
    }

    /// 最多调用 `spin_count` 次 `do_write`，返回写结果以及是否因次数用尽而留有已刷新条目。
    ///
    /// 某一轮没有任何进展时视为传输暂不可写，停止自旋且不再续排，等待传输层自行触发下一次 flush。
    fn write_spinning(
        channel: &Channel,
        buffer: &mut ChannelOutboundBuffer,
        spin_count: u32,
    ) -> (Result<()>, bool) {
        for _ in 0..spin_count {
            let before = (buffer.flushed_len(), buffer.total_pending_write_bytes());
            if let Err(err) = channel.transport.do_write(buffer) {
                return (Err(err), false);
            }
            if buffer.is_empty() {
                return (Ok(()), false);
            }
            if (buffer.flushed_len(), buffer.total_pending_write_bytes()) == before {
                return (Ok(()), false);
            }
        }
        (Ok(()), !buffer.is_empty())
    }

    /// 自旋次数用尽后把剩余写出让给事件循环上的其他任务。
    fn schedule_flush0(&self) {
        let Some(handle) = self.channel.arc() else {
            return;
        };
        self.invoke_later(Box::new(move || handle.unsafe_ops().flush0()));
    }

    fn handle_write_error(&self, err: ChannelError) {
        if self.channel.config.is_auto_close() {
            // 已刷新条目以传输层原始错误失败，其余条目以 Closed 失败。
            self.close_inner(self.void_promise(), err, ChannelError::Closed, false);
            return;
        }
        self.shutdown_output_inner(self.void_promise(), Some(err));
    }

    /// 半关闭输出方向：不再接受写入，已排队写入以 [`ChannelError::OutputShutdown`] 失败。
    pub fn shutdown_output(&self, promise: ChannelPromise) {
        self.shutdown_output_inner(promise, None);
    }

    fn shutdown_output_inner(&self, promise: ChannelPromise, cause: Option<ChannelError>) {
        let channel = self.channel;
        if !promise.set_uncancellable() {
            return;
        }
        let detached = {
            let mut outbound = channel.outbound.lock();
            channel.output_open.store(false, Ordering::Release);
            outbound.take()
        };
        let Some(mut buffer) = detached else {
            promise.try_failure(ChannelError::Closed);
            return;
        };
        let shutdown_cause = ChannelError::OutputShutdown {
            cause: cause.map(Box::new),
        };
        let failure = match channel.transport.do_shutdown_output() {
            Ok(()) => {
                promise.try_success();
                None
            }
            Err(err) => {
                promise.try_failure(err.clone());
                Some(err)
            }
        };
        buffer.fail_flushed(&shutdown_cause, false);
        buffer.close(&shutdown_cause);
        channel.dispatch_outbound_notifications(buffer.take_notifications());
        match failure {
            None => channel
                .pipeline
                .fire_user_event_triggered(Box::new(ChannelOutputShutdownEvent)),
            Some(err) => {
                tracing::debug!(
                    channel.id = %channel.id.as_short_text(),
                    error = %err,
                    "output shutdown failed; closing the channel"
                );
                self.close_inner(self.void_promise(), err, ChannelError::Closed, false);
            }
        }
    }

    /// 传输已自行关闭时补齐通道侧的关闭流程。
    pub fn close_if_closed(&self) {
        if self.channel.is_open() {
            return;
        }
        self.close(self.void_promise());
    }

    fn ensure_open(&self, promise: &ChannelPromise) -> bool {
        if self.channel.is_open() {
            return true;
        }
        promise.try_failure(ChannelError::Closed);
        false
    }

    fn fire_later(&self, task: impl FnOnce(&Arc<Channel>) + Send + 'static) {
        let Some(channel) = self.channel.arc() else {
            return;
        };
        self.invoke_later(Box::new(move || task(&channel)));
    }

    /// 把任务投递到事件循环下一轮执行；尚未绑定事件循环时内联执行。
    pub(crate) fn invoke_later(&self, task: Task) {
        let Some(event_loop) = self.channel.event_loop.get() else {
            task();
            return;
        };
        if let Err(err) = event_loop.execute(task) {
            tracing::warn!(
                channel.id = %self.channel.id.as_short_text(),
                event_loop.name = %event_loop.name(),
                error.code = err.code(),
                "can't invoke task later as the event loop rejected it"
            );
        }
    }
}
