use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::channel::{Channel, ChannelMetadata, ConnectOutcome, SocketAddress, Transport};
use crate::error::{ChannelError, Result};
use crate::event_loop::{EmbeddedEventLoop, EventLoop};
use crate::message::PipelineMessage;
use crate::outbound::ChannelOutboundBuffer;

/// 可计数、可注入失败的传输钩子。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportHook {
    Register,
    Bind,
    Connect,
    FinishConnect,
    Disconnect,
    Close,
    ShutdownOutput,
    Deregister,
    BeginRead,
    Write,
}

/// `EmbeddedTransport` 是完全位于内存中的传输实现。
///
/// # 教案式说明
/// - **意图 (Why)**：生命周期场景（重复注册、关闭幂等、写失败后关闭）需要确定性地观察传输钩子；
/// - **逻辑 (How)**：
///   - 每次钩子调用都被计数，可通过 [`hook_count`](Self::hook_count) 断言；
///   - [`fail_next`](Self::fail_next) 让指定钩子的下一次调用返回给定错误；
///   - `do_write` 把已刷新的消息移入内部队列，并记录写入时刻捕获的字节估算；
///     [`set_write_limit`](Self::set_write_limit) 可限制单次写出条数以模拟部分写；
/// - **契约 (What)**：默认只与 [`EmbeddedEventLoop`] 兼容；`new()` 构造的传输在注册时即变为激活，
///   `inactive()` 构造的传输需要 bind 或 connect 才激活。
pub struct EmbeddedTransport {
    metadata: ChannelMetadata,
    open: AtomicBool,
    active: AtomicBool,
    active_on_register: bool,
    accept_any_event_loop: AtomicBool,
    connect_pending: AtomicBool,
    output_shutdown: AtomicBool,
    calls: Mutex<HashMap<TransportHook, usize>>,
    failures: Mutex<HashMap<TransportHook, ChannelError>>,
    written: Mutex<VecDeque<PipelineMessage>>,
    written_sizes: Mutex<Vec<u64>>,
    write_limit: Mutex<Option<usize>>,
    local: Mutex<Option<SocketAddress>>,
    remote: Mutex<Option<SocketAddress>>,
}

impl EmbeddedTransport {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// 注册后保持未激活，直到 bind 或 connect 成功。
    pub fn inactive() -> Self {
        Self::build(false)
    }

    fn build(active_on_register: bool) -> Self {
        Self {
            metadata: ChannelMetadata::new(false),
            open: AtomicBool::new(true),
            active: AtomicBool::new(false),
            active_on_register,
            accept_any_event_loop: AtomicBool::new(false),
            connect_pending: AtomicBool::new(false),
            output_shutdown: AtomicBool::new(false),
            calls: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            written: Mutex::new(VecDeque::new()),
            written_sizes: Mutex::new(Vec::new()),
            write_limit: Mutex::new(None),
            local: Mutex::new(Some(SocketAddress::local("embedded"))),
            remote: Mutex::new(Some(SocketAddress::local("embedded"))),
        }
    }

    pub fn with_metadata(mut self, metadata: ChannelMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// 允许注册到任意事件循环（例如线程化的默认事件循环）。
    pub fn accept_any_event_loop(&self, accept: bool) {
        self.accept_any_event_loop.store(accept, Ordering::Release);
    }

    /// `do_connect` 报告连接进行中，需调用 `finish_connect` 完成。
    pub fn set_connect_pending(&self, pending: bool) {
        self.connect_pending.store(pending, Ordering::Release);
    }

    /// 每次 `do_write` 最多写出 `limit` 条消息；`Some(0)` 模拟发送缓冲已满，`None` 不限。
    pub fn set_write_limit(&self, limit: Option<usize>) {
        *self.write_limit.lock() = limit;
    }

    /// 让 `hook` 的下一次调用失败。
    pub fn fail_next(&self, hook: TransportHook, cause: ChannelError) {
        self.failures.lock().insert(hook, cause);
    }

    /// 模拟对端或操作系统关闭了底层资源。
    pub fn close_externally(&self) {
        self.open.store(false, Ordering::Release);
        self.active.store(false, Ordering::Release);
    }

    pub fn hook_count(&self, hook: TransportHook) -> usize {
        self.calls.lock().get(&hook).copied().unwrap_or(0)
    }

    pub fn is_output_shutdown(&self) -> bool {
        self.output_shutdown.load(Ordering::Acquire)
    }

    /// 取出最早写出的消息。
    pub fn take_written(&self) -> Option<PipelineMessage> {
        self.written.lock().pop_front()
    }

    pub fn written_len(&self) -> usize {
        self.written.lock().len()
    }

    /// 写出时出站条目携带的字节估算，按写出顺序排列。
    pub fn written_sizes(&self) -> Vec<u64> {
        self.written_sizes.lock().clone()
    }

    fn enter(&self, hook: TransportHook) -> Result<()> {
        *self.calls.lock().entry(hook).or_insert(0) += 1;
        match self.failures.lock().remove(&hook) {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }
}

impl Default for EmbeddedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for EmbeddedTransport {
    fn metadata(&self) -> ChannelMetadata {
        self.metadata
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn is_compatible(&self, event_loop: &dyn EventLoop) -> bool {
        let event_loop: &dyn Any = event_loop;
        self.accept_any_event_loop.load(Ordering::Acquire) || event_loop.is::<EmbeddedEventLoop>()
    }

    fn local_address(&self) -> Option<SocketAddress> {
        self.local.lock().clone()
    }

    fn remote_address(&self) -> Option<SocketAddress> {
        self.remote.lock().clone()
    }

    fn do_register(&self, _channel: &Channel) -> Result<()> {
        self.enter(TransportHook::Register)?;
        if self.active_on_register {
            self.active.store(true, Ordering::Release);
        }
        Ok(())
    }

    fn do_bind(&self, local: &SocketAddress) -> Result<()> {
        self.enter(TransportHook::Bind)?;
        *self.local.lock() = Some(local.clone());
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn do_connect(&self, remote: &SocketAddress, local: Option<&SocketAddress>) -> Result<ConnectOutcome> {
        self.enter(TransportHook::Connect)?;
        *self.remote.lock() = Some(remote.clone());
        if let Some(local) = local {
            *self.local.lock() = Some(local.clone());
        }
        if self.connect_pending.load(Ordering::Acquire) {
            return Ok(ConnectOutcome::Pending);
        }
        self.active.store(true, Ordering::Release);
        Ok(ConnectOutcome::Connected)
    }

    fn do_finish_connect(&self) -> Result<()> {
        self.enter(TransportHook::FinishConnect)?;
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    fn do_disconnect(&self) -> Result<()> {
        self.enter(TransportHook::Disconnect)?;
        self.active.store(false, Ordering::Release);
        *self.remote.lock() = None;
        Ok(())
    }

    fn do_close(&self) -> Result<()> {
        // 失败注入只影响返回值，资源无论如何都视为已关闭。
        let result = self.enter(TransportHook::Close);
        self.close_externally();
        result
    }

    fn do_shutdown_output(&self) -> Result<()> {
        self.enter(TransportHook::ShutdownOutput)?;
        self.output_shutdown.store(true, Ordering::Release);
        Ok(())
    }

    fn do_deregister(&self) -> Result<()> {
        self.enter(TransportHook::Deregister)
    }

    fn do_begin_read(&self) -> Result<()> {
        self.enter(TransportHook::BeginRead)
    }

    fn do_write(&self, buffer: &mut ChannelOutboundBuffer) -> Result<()> {
        self.enter(TransportHook::Write)?;
        let mut budget = self.write_limit.lock().unwrap_or(usize::MAX);
        while budget > 0 {
            let Some(size) = buffer.current_size() else {
                break;
            };
            let Some(msg) = buffer.remove_and_take() else {
                break;
            };
            self.written_sizes.lock().push(size);
            self.written.lock().push_back(msg);
            budget -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_failure_applies_once() {
        let transport = EmbeddedTransport::new();
        transport.fail_next(TransportHook::BeginRead, ChannelError::handler("boom"));
        assert!(transport.do_begin_read().is_err());
        assert!(transport.do_begin_read().is_ok());
        assert_eq!(transport.hook_count(TransportHook::BeginRead), 2);
    }

    #[test]
    fn only_embedded_loop_is_compatible_by_default() {
        let transport = EmbeddedTransport::new();
        let event_loop = EmbeddedEventLoop::new();
        assert!(transport.is_compatible(&event_loop));
    }

    #[test]
    fn failed_close_still_closes() {
        let transport = EmbeddedTransport::new();
        transport.fail_next(TransportHook::Close, ChannelError::handler("close failed"));
        assert!(transport.do_close().is_err());
        assert!(!transport.is_open());
    }
}
