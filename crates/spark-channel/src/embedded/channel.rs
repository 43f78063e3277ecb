use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::EmbeddedTransport;
use crate::channel::{Channel, Transport};
use crate::error::{ChannelError, Result};
use crate::event_loop::{EmbeddedEventLoop, EventLoop};
use crate::future::ChannelFuture;
use crate::message::{PipelineMessage, UserEvent};
use crate::pipeline::{ChannelHandler, ChannelHandlerContext, ChannelPipeline, UnhandledInboundSink};

/// 收集抵达流水线尾部的入站消息、异常与用户事件。
#[derive(Default)]
struct Collector {
    inbound: Mutex<VecDeque<PipelineMessage>>,
    exceptions: Mutex<VecDeque<ChannelError>>,
    user_events: Mutex<VecDeque<UserEvent>>,
}

impl UnhandledInboundSink for Collector {
    fn unhandled_message(&self, _ctx: &ChannelHandlerContext, msg: PipelineMessage) {
        self.inbound.lock().push_back(msg);
    }

    fn unhandled_exception(&self, _ctx: &ChannelHandlerContext, cause: ChannelError) {
        self.exceptions.lock().push_back(cause);
    }

    fn unhandled_user_event(&self, _ctx: &ChannelHandlerContext, event: UserEvent) {
        self.user_events.lock().push_back(event);
    }
}

/// `EmbeddedChannel` 把通道、内存传输与手动驱动的事件循环组合成测试夹具。
///
/// # 教案式说明
/// - **意图 (Why)**：处理器与生命周期逻辑应当可以在单线程内确定性地验证，无需真实套接字；
/// - **逻辑 (How)**：
///   - 入站：`write_inbound` 从头部触发 `channel_read`，抵达尾部的消息进入入站队列，由 `read_inbound` 取出；
///   - 出站：`write_outbound` 写入并刷新，传输写出的消息由 `read_outbound` 取出；
///   - 抵达尾部的异常被保存，`check_exception` 把最早的一个作为 `Err` 返回；
///   - 每个驱动操作之后都会执行事件循环中挂起的任务，“稍后执行”的事件因此立即可见；
/// - **契约 (What)**：所有方法都在调用线程上执行；`finish` 关闭通道并报告是否仍有未读取的消息。
pub struct EmbeddedChannel {
    channel: Arc<Channel>,
    transport: Arc<EmbeddedTransport>,
    event_loop: Arc<EmbeddedEventLoop>,
    collector: Arc<Collector>,
}

impl EmbeddedChannel {
    /// 构造通道、依次添加处理器并注册。
    pub fn new(handlers: Vec<Arc<dyn ChannelHandler>>) -> Result<Self> {
        Self::with_transport(Arc::new(EmbeddedTransport::new()), handlers)
    }

    pub fn with_transport(transport: Arc<EmbeddedTransport>, handlers: Vec<Arc<dyn ChannelHandler>>) -> Result<Self> {
        let embedded = Self::unregistered(transport);
        for handler in handlers {
            embedded.pipeline().add_last(None, handler)?;
        }
        embedded.register()?;
        Ok(embedded)
    }

    /// 构造尚未注册的通道，供测试注册前的流水线行为。
    pub fn unregistered(transport: Arc<EmbeddedTransport>) -> Self {
        let collector = Arc::new(Collector::default());
        let channel = Channel::builder(Arc::clone(&transport) as Arc<dyn Transport>)
            .unhandled_inbound(Arc::clone(&collector) as Arc<dyn UnhandledInboundSink>)
            .build();
        Self {
            channel,
            transport,
            event_loop: Arc::new(EmbeddedEventLoop::new()),
            collector,
        }
    }

    /// 注册到内置事件循环并执行挂起任务。
    pub fn register(&self) -> Result<()> {
        let future = self
            .channel
            .register(Arc::clone(&self.event_loop) as Arc<dyn EventLoop>);
        self.run_pending_tasks();
        future
            .outcome()
            .unwrap_or_else(|| Err(ChannelError::handler("registration did not complete")))?;
        self.check_exception()
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    pub fn transport(&self) -> &Arc<EmbeddedTransport> {
        &self.transport
    }

    pub fn event_loop(&self) -> &Arc<EmbeddedEventLoop> {
        &self.event_loop
    }

    pub fn pipeline(&self) -> &ChannelPipeline {
        self.channel.pipeline()
    }

    /// 从头部注入入站消息；返回入站队列是否非空。
    pub fn write_inbound(&self, msgs: impl IntoIterator<Item = PipelineMessage>) -> Result<bool> {
        if !self.channel.is_open() {
            return Err(ChannelError::Closed);
        }
        let pipeline = self.channel.pipeline();
        for msg in msgs {
            pipeline.fire_channel_read(msg);
        }
        pipeline.fire_channel_read_complete();
        self.run_pending_tasks();
        self.check_exception()?;
        Ok(!self.collector.inbound.lock().is_empty())
    }

    /// 写入并刷新出站消息；返回传输是否写出了消息。
    ///
    /// 任一写入失败时返回该写入的错误。
    pub fn write_outbound(&self, msgs: impl IntoIterator<Item = PipelineMessage>) -> Result<bool> {
        let futures: Vec<ChannelFuture> = msgs.into_iter().map(|msg| self.channel.write(msg)).collect();
        self.flush_outbound();
        self.check_exception()?;
        for future in &futures {
            if let Some(cause) = future.cause() {
                return Err(cause);
            }
        }
        Ok(self.transport.written_len() > 0)
    }

    pub fn flush_outbound(&self) {
        self.channel.flush();
        self.run_pending_tasks();
    }

    pub fn read_inbound(&self) -> Option<PipelineMessage> {
        self.collector.inbound.lock().pop_front()
    }

    /// 取出入站业务对象；类型不符的消息被放回队首。
    pub fn read_inbound_user<T: Any>(&self) -> Option<T> {
        let mut inbound = self.collector.inbound.lock();
        let msg = inbound.pop_front()?;
        match msg.downcast_user::<T>() {
            Ok(value) => Some(value),
            Err(msg) => {
                inbound.push_front(msg);
                None
            }
        }
    }

    pub fn read_outbound(&self) -> Option<PipelineMessage> {
        self.transport.take_written()
    }

    pub fn inbound_len(&self) -> usize {
        self.collector.inbound.lock().len()
    }

    pub fn outbound_len(&self) -> usize {
        self.transport.written_len()
    }

    /// 抵达尾部、尚未取走的用户事件。
    pub fn take_user_events(&self) -> Vec<UserEvent> {
        self.collector.user_events.lock().drain(..).collect()
    }

    /// 执行普通任务与已到期的定时任务。
    pub fn run_pending_tasks(&self) {
        self.event_loop.run_pending_tasks();
        self.event_loop.run_scheduled_pending_tasks();
        self.event_loop.run_pending_tasks();
    }

    pub fn advance_time(&self, delta: Duration) {
        self.event_loop.advance_time(delta);
    }

    /// 把最早记录的未处理异常作为 `Err` 返回。
    pub fn check_exception(&self) -> Result<()> {
        match self.collector.exceptions.lock().pop_front() {
            Some(cause) => Err(cause),
            None => Ok(()),
        }
    }

    pub fn close(&self) -> ChannelFuture {
        let future = self.channel.close();
        self.run_pending_tasks();
        future
    }

    /// 关闭通道；返回是否仍有未读取的入站或出站消息。
    pub fn finish(&self) -> Result<bool> {
        self.close();
        self.check_exception()?;
        Ok(self.inbound_len() > 0 || self.outbound_len() > 0)
    }

    /// 关闭通道并释放所有未读取的消息；返回释放前是否有消息。
    pub fn finish_and_release_all(&self) -> Result<bool> {
        self.close();
        let mut remaining = false;
        while let Some(msg) = self.read_inbound() {
            remaining = true;
            msg.release();
        }
        while let Some(msg) = self.read_outbound() {
            remaining = true;
            msg.release();
        }
        self.check_exception()?;
        Ok(remaining)
    }
}
