use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use spark_buffer::ByteBuf;
use spark_channel::embedded::{EmbeddedChannel, EmbeddedTransport, TransportHook};
use spark_channel::{
    ChannelError, ChannelHandler, ChannelHandlerContext, ChannelMetadata, ChannelOutputShutdownEvent, ChannelPromise,
    DefaultEventLoop, EventLoop, EventLoopConfig, EventMask, PipelineMessage, SocketAddress, WriteBufferWaterMark,
};
use tracing_test::traced_test;

/// `Recorder` 记录自身收到的生命周期事件，并原样向后传播。
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<&'static str>>,
}

impl Recorder {
    fn push(&self, event: &'static str) {
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

impl ChannelHandler for Recorder {
    fn interest(&self) -> EventMask {
        EventMask::INBOUND
    }

    fn handler_added(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        self.push("added");
        Ok(())
    }

    fn handler_removed(&self, _ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        self.push("removed");
        Ok(())
    }

    fn channel_registered(&self, ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        self.push("registered");
        ctx.fire_channel_registered();
        Ok(())
    }

    fn channel_unregistered(&self, ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        self.push("unregistered");
        ctx.fire_channel_unregistered();
        Ok(())
    }

    fn channel_active(&self, ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        self.push("active");
        ctx.fire_channel_active();
        Ok(())
    }

    fn channel_inactive(&self, ctx: &Arc<ChannelHandlerContext>) -> spark_channel::Result<()> {
        self.push("inactive");
        ctx.fire_channel_inactive();
        Ok(())
    }
}

fn recorded(transport: EmbeddedTransport) -> (EmbeddedChannel, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let embedded = EmbeddedChannel::with_transport(
        Arc::new(transport),
        vec![Arc::clone(&recorder) as Arc<dyn ChannelHandler>],
    )
    .expect("注册应成功");
    (embedded, recorder)
}

fn reset_by_peer() -> ChannelError {
    ChannelError::transport(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset by peer"))
}

#[test]
fn first_registration_fires_registered_then_active() {
    let (embedded, recorder) = recorded(EmbeddedTransport::new());
    assert!(embedded.channel().is_registered());
    assert!(embedded.channel().is_active());
    assert_eq!(recorder.events(), ["added", "registered", "active"]);
    // auto_read 默认开启：激活后立即登记一次读兴趣。
    assert_eq!(embedded.transport().hook_count(TransportHook::BeginRead), 1);
    assert_eq!(embedded.channel().event_loop().map(|l| l.registry().len()), Some(1));
}

#[test]
fn second_registration_fails_without_touching_transport() {
    let (embedded, _) = recorded(EmbeddedTransport::new());
    let event_loop = Arc::clone(embedded.event_loop()) as Arc<dyn EventLoop>;
    let future = embedded.channel().register(event_loop);
    assert!(matches!(future.cause(), Some(ChannelError::AlreadyRegistered)));
    assert_eq!(embedded.transport().hook_count(TransportHook::Register), 1);
}

#[test]
fn incompatible_event_loop_is_rejected() {
    let embedded = EmbeddedChannel::unregistered(Arc::new(EmbeddedTransport::new()));
    let threaded = Arc::new(DefaultEventLoop::new(EventLoopConfig::default()));
    let future = embedded.channel().register(threaded as Arc<dyn EventLoop>);
    assert!(matches!(future.cause(), Some(ChannelError::IncompatibleEventLoop)));
    assert!(!embedded.channel().is_registered());
    assert_eq!(embedded.transport().hook_count(TransportHook::Register), 0);
}

#[test]
fn failed_registration_closes_the_channel() {
    let transport = Arc::new(EmbeddedTransport::new());
    transport.fail_next(TransportHook::Register, reset_by_peer());
    let embedded = EmbeddedChannel::unregistered(Arc::clone(&transport));
    let err = embedded.register().expect_err("注册钩子失败应传递给调用方");
    assert!(matches!(err, ChannelError::Transport { .. }));
    assert!(!embedded.channel().is_open());
    assert!(embedded.channel().close_future().is_success());
    assert_eq!(transport.hook_count(TransportHook::Close), 1);
}

#[traced_test]
#[test]
fn forced_close_failure_is_logged() {
    let transport = Arc::new(EmbeddedTransport::new());
    transport.fail_next(TransportHook::Register, reset_by_peer());
    transport.fail_next(TransportHook::Close, ChannelError::handler("close refused"));
    let embedded = EmbeddedChannel::unregistered(transport);
    assert!(embedded.register().is_err());
    assert!(logs_contain("failed to close a channel"));
}

#[test]
fn close_is_idempotent() {
    let (embedded, recorder) = recorded(EmbeddedTransport::new());
    let first = embedded.close();
    let second = embedded.close();
    assert!(first.is_success());
    assert!(second.is_success());
    assert!(embedded.channel().close_future().is_success());
    assert_eq!(embedded.transport().hook_count(TransportHook::Close), 1);
    assert_eq!(
        recorder.events(),
        ["added", "registered", "active", "inactive", "unregistered", "removed"]
    );
    assert!(embedded.pipeline().is_empty());
}

#[test]
fn bind_fires_active_on_a_later_turn() {
    let (embedded, recorder) = recorded(EmbeddedTransport::inactive());
    assert_eq!(recorder.events(), ["added", "registered"]);

    let future = embedded.channel().bind(SocketAddress::local("listener"));
    assert!(future.is_success());
    assert_eq!(recorder.events().last(), Some(&"registered"));

    embedded.run_pending_tasks();
    assert_eq!(recorder.events().last(), Some(&"active"));
    assert_eq!(embedded.transport().hook_count(TransportHook::Bind), 1);
}

#[test]
fn flush_failure_closes_with_the_transport_error() {
    let (embedded, _) = recorded(EmbeddedTransport::new());
    let channel = embedded.channel();
    channel
        .config()
        .set_write_buffer_water_mark(WriteBufferWaterMark::new(8, 16).expect("水位线合法"))
        .expect("配置应生效");

    let future = channel.write(PipelineMessage::from(ByteBuf::from_static(b"0123456789")));
    assert_eq!(channel.total_pending_write_bytes(), 10);
    assert!(channel.is_writable());

    embedded.transport().fail_next(TransportHook::Write, reset_by_peer());
    embedded.flush_outbound();

    assert!(matches!(future.cause(), Some(ChannelError::Transport { .. })));
    assert!(!channel.is_open());
    assert!(channel.close_future().is_success());
    assert_eq!(embedded.outbound_len(), 0);
}

#[test]
fn write_after_close_fails_with_closed() {
    let (embedded, _) = recorded(EmbeddedTransport::new());
    embedded.close();
    let future = embedded
        .channel()
        .write_and_flush(PipelineMessage::from(ByteBuf::from_static(b"late")));
    assert!(matches!(future.cause(), Some(ChannelError::Closed)));
}

#[test]
fn pending_connect_times_out_and_closes() {
    let (embedded, _) = recorded(EmbeddedTransport::inactive());
    embedded.transport().set_connect_pending(true);
    embedded.channel().config().set_connect_timeout(Duration::from_secs(3));

    let future = embedded.channel().connect(SocketAddress::local("peer"));
    assert!(!future.is_done());

    embedded.advance_time(Duration::from_secs(2));
    embedded.run_pending_tasks();
    assert!(!future.is_done());

    embedded.advance_time(Duration::from_secs(1));
    embedded.run_pending_tasks();
    assert!(matches!(future.cause(), Some(ChannelError::ConnectTimeout { .. })));
    assert!(!embedded.channel().is_open());
}

#[test]
fn pending_connect_completes_on_finish() {
    let (embedded, recorder) = recorded(EmbeddedTransport::inactive());
    embedded.transport().set_connect_pending(true);
    embedded.channel().config().set_connect_timeout(Duration::from_secs(3));

    let future = embedded.channel().connect(SocketAddress::local("peer"));
    let overlapping = embedded.channel().connect(SocketAddress::local("other"));
    assert!(matches!(overlapping.cause(), Some(ChannelError::ConnectionPending)));

    embedded.channel().unsafe_ops().finish_connect();
    assert!(future.is_success());
    assert_eq!(recorder.events().last(), Some(&"active"));

    // 超时任务已被取消。
    embedded.advance_time(Duration::from_secs(5));
    embedded.run_pending_tasks();
    assert!(embedded.channel().is_open());
}

/// 截留经过的连接 Promise，供测试取消。
#[derive(Default)]
struct ConnectSpy {
    promise: Mutex<Option<ChannelPromise>>,
}

impl ChannelHandler for ConnectSpy {
    fn interest(&self) -> EventMask {
        EventMask::CONNECT
    }

    fn connect(
        &self,
        ctx: &Arc<ChannelHandlerContext>,
        remote: SocketAddress,
        local: Option<SocketAddress>,
        promise: ChannelPromise,
    ) -> spark_channel::Result<()> {
        *self.promise.lock() = Some(promise.clone());
        ctx.connect_with_promise(remote, local, promise).map(drop)
    }
}

#[test]
fn cancelling_a_pending_connect_closes_the_channel() {
    let transport = Arc::new(EmbeddedTransport::inactive());
    transport.set_connect_pending(true);
    let spy = Arc::new(ConnectSpy::default());
    let embedded =
        EmbeddedChannel::with_transport(transport, vec![Arc::clone(&spy) as Arc<dyn ChannelHandler>]).expect("注册应成功");

    let future = embedded.channel().connect(SocketAddress::local("peer"));
    let promise = spy.promise.lock().take().expect("连接 Promise 应被截留");
    assert!(promise.cancel());
    assert!(future.is_cancelled());

    embedded.run_pending_tasks();
    assert!(!embedded.channel().is_open());
}

#[test]
fn shutdown_output_fails_queued_writes_and_fires_event() {
    let (embedded, _) = recorded(EmbeddedTransport::new());
    let queued = embedded
        .channel()
        .write(PipelineMessage::from(ByteBuf::from_static(b"queued")));

    let shutdown = embedded.channel().shutdown_output();
    embedded.run_pending_tasks();
    assert!(shutdown.is_success());
    assert!(embedded.transport().is_output_shutdown());
    assert!(matches!(queued.cause(), Some(ChannelError::OutputShutdown { .. })));
    assert!(embedded.channel().is_open());

    let events = embedded.take_user_events();
    assert_eq!(events.len(), 1);
    assert!(events[0].downcast_ref::<ChannelOutputShutdownEvent>().is_some());

    let late = embedded
        .channel()
        .write(PipelineMessage::from(ByteBuf::from_static(b"late")));
    assert!(late.cause().is_some());
}

#[test]
fn disconnect_falls_back_to_close_without_disconnect_support() {
    let (embedded, _) = recorded(EmbeddedTransport::new());
    embedded.channel().disconnect();
    embedded.run_pending_tasks();
    assert_eq!(embedded.transport().hook_count(TransportHook::Disconnect), 0);
    assert_eq!(embedded.transport().hook_count(TransportHook::Close), 1);
    assert!(!embedded.channel().is_open());
}

#[test]
fn disconnect_keeps_the_channel_open_when_supported() {
    let (embedded, recorder) = recorded(EmbeddedTransport::new().with_metadata(ChannelMetadata::new(true)));
    let future = embedded.channel().disconnect();
    embedded.run_pending_tasks();
    assert!(future.is_success());
    assert_eq!(embedded.transport().hook_count(TransportHook::Disconnect), 1);
    assert!(embedded.channel().is_open());
    assert_eq!(recorder.events().last(), Some(&"inactive"));
}

#[test]
fn deregister_fires_unregistered_but_keeps_the_channel_open() {
    let (embedded, recorder) = recorded(EmbeddedTransport::new());
    let future = embedded.channel().deregister();
    embedded.run_pending_tasks();
    assert!(future.is_success());
    assert!(!embedded.channel().is_registered());
    assert!(embedded.channel().is_open());
    assert_eq!(recorder.events().last(), Some(&"unregistered"));
    assert_eq!(embedded.event_loop().registry().len(), 0);
}

#[test]
fn flush_spins_write_spin_count_times_then_yields_to_the_loop() {
    let transport = EmbeddedTransport::new();
    transport.set_write_limit(Some(1));
    let (embedded, _) = recorded(transport);
    let channel = embedded.channel();
    channel.config().set_write_spin_count(2).expect("配置应生效");

    let futures: Vec<_> = (0..5)
        .map(|_| channel.write(PipelineMessage::from(ByteBuf::from_static(b"chunk"))))
        .collect();
    channel.flush();
    assert_eq!(embedded.transport().hook_count(TransportHook::Write), 2);
    assert_eq!(embedded.outbound_len(), 2, "一轮最多写出 spin count 次");
    assert_eq!(channel.total_pending_write_bytes(), 15);

    embedded.run_pending_tasks();
    assert_eq!(embedded.outbound_len(), 5, "剩余条目在后续轮次写完");
    assert_eq!(embedded.transport().hook_count(TransportHook::Write), 5);
    assert!(futures.iter().all(|future| future.is_success()));
    assert_eq!(channel.total_pending_write_bytes(), 0);
}

#[test]
fn stalled_transport_stops_spinning_until_flushed_again() {
    let transport = EmbeddedTransport::new();
    transport.set_write_limit(Some(0));
    let (embedded, _) = recorded(transport);
    let channel = embedded.channel();

    let future = channel.write_and_flush(PipelineMessage::from(ByteBuf::from_static(b"blocked")));
    embedded.run_pending_tasks();
    assert_eq!(embedded.transport().hook_count(TransportHook::Write), 1, "无进展时不再自旋");
    assert!(!future.is_done());

    embedded.transport().set_write_limit(None);
    embedded.flush_outbound();
    assert!(future.is_success());
    assert_eq!(embedded.outbound_len(), 1);
}

#[test]
fn transport_metadata_seeds_max_messages_per_read() {
    let (embedded, _) = recorded(
        EmbeddedTransport::new().with_metadata(ChannelMetadata::new(false).with_max_messages_per_read(4)),
    );
    assert_eq!(embedded.channel().config().max_messages_per_read(), 4);

    let (fallback, _) = recorded(
        EmbeddedTransport::new().with_metadata(ChannelMetadata::new(false).with_max_messages_per_read(0)),
    );
    assert_eq!(fallback.channel().config().max_messages_per_read(), 1);
}
